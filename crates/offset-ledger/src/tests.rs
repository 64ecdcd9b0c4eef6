//! Unit tests for the offset-ledger crate.

use cdc_core::{PartitionId, SourcePosition};
use chrono::Utc;

use crate::{check_regression, Advance, LedgerError, LedgerTable, OffsetRecord};

fn partition(n: i32) -> PartitionId {
    PartitionId::new("cdc.public.users", n)
}

// ============================================================================
// LedgerTable Tests
// ============================================================================

#[test]
fn test_first_advance_creates_row() {
    let mut table = LedgerTable::new();
    let advance = table.advance(&partition(0), SourcePosition(5), Utc::now());
    assert_eq!(advance, Advance::Created);
    assert_eq!(table.committed(&partition(0)), Some(SourcePosition(5)));
}

#[test]
fn test_advance_is_monotonic() {
    let mut table = LedgerTable::new();
    table.advance(&partition(0), SourcePosition(10), Utc::now());

    assert_eq!(
        table.advance(&partition(0), SourcePosition(7), Utc::now()),
        Advance::Unchanged
    );
    assert_eq!(
        table.advance(&partition(0), SourcePosition(10), Utc::now()),
        Advance::Unchanged
    );
    assert_eq!(table.committed(&partition(0)), Some(SourcePosition(10)));

    assert_eq!(
        table.advance(&partition(0), SourcePosition(12), Utc::now()),
        Advance::Advanced {
            from: SourcePosition(10)
        }
    );
    assert_eq!(table.committed(&partition(0)), Some(SourcePosition(12)));
}

#[test]
fn test_partitions_are_independent() {
    let mut table = LedgerTable::new();
    table.advance(&partition(0), SourcePosition(3), Utc::now());
    table.advance(&partition(1), SourcePosition(100), Utc::now());

    assert_eq!(table.committed(&partition(0)), Some(SourcePosition(3)));
    assert_eq!(table.committed(&partition(1)), Some(SourcePosition(100)));
    assert_eq!(table.records().len(), 2);
}

// ============================================================================
// Regression Detection Tests
// ============================================================================

#[test]
fn test_check_not_regressed_accepts_equal_or_ahead() {
    let mut table = LedgerTable::new();
    table.advance(&partition(0), SourcePosition(8), Utc::now());

    assert!(table
        .check_not_regressed(&partition(0), Some(SourcePosition(8)))
        .is_ok());
    assert!(table
        .check_not_regressed(&partition(0), Some(SourcePosition(5)))
        .is_ok());
    assert!(table.check_not_regressed(&partition(3), None).is_ok());
}

#[test]
fn test_check_not_regressed_detects_rollback() {
    let mut table = LedgerTable::new();
    table.overwrite(OffsetRecord::new(partition(0), SourcePosition(2)));

    let err = table
        .check_not_regressed(&partition(0), Some(SourcePosition(9)))
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Regression {
            stored: SourcePosition(2),
            attempted: SourcePosition(9),
            ..
        }
    ));
    assert!(err.to_string().contains("cdc.public.users[0]"));
}

#[test]
fn test_check_regression_detects_vanished_row() {
    let err = check_regression(&partition(1), None, Some(SourcePosition(4))).unwrap_err();
    assert!(matches!(err, LedgerError::Missing { .. }));
}

#[test]
fn test_offset_record_display() {
    let record = OffsetRecord::new(partition(2), SourcePosition(77));
    let shown = record.to_string();
    assert!(shown.starts_with("cdc.public.users[2] committed=77"));
}
