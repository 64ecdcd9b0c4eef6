//! In-memory sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{DeadLetterError, DeadLetterRecord, DeadLetterSink, Result, WriteOutcome};

/// Collects records in a vector. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterSink {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Make every subsequent write fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn write(&self, record: &DeadLetterRecord) -> Result<WriteOutcome> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable(
                "in-memory sink switched off".to_string(),
            ));
        }
        let mut records = self.records.lock().await;
        if records
            .iter()
            .any(|r| r.partition == record.partition && r.position == record.position)
        {
            return Ok(WriteOutcome::Duplicate);
        }
        records.push(record.clone());
        Ok(WriteOutcome::Stored)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
