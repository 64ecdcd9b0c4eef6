//! SQLSTATE classification.
//!
//! Maps PostgreSQL errors onto the applier's failure taxonomy.

/// How the pipeline should react to a target error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Contention on particular rows; retry the batch with backoff
    Transient,
    /// The target as a whole is unreachable; pause every worker
    Systemic,
    /// The record itself is unacceptable; retrying will not help
    Permanent,
}

/// Classify a five-character SQLSTATE.
pub fn classify_sqlstate(code: &str) -> ErrorClass {
    match code {
        // serialization_failure, deadlock_detected, lock_not_available, query_canceled
        "40001" | "40P01" | "55P03" | "57014" => ErrorClass::Transient,
        // admin_shutdown, crash_shutdown, cannot_connect_now, too_many_connections
        "57P01" | "57P02" | "57P03" | "53300" => ErrorClass::Systemic,
        _ => match code.get(..2) {
            // connection_exception
            Some("08") => ErrorClass::Systemic,
            // insufficient_resources (disk full, out of memory)
            Some("53") => ErrorClass::Systemic,
            // data_exception, integrity_constraint_violation, syntax/access rule violation
            Some("22") | Some("23") | Some("42") => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        },
    }
}

/// Classify a client error. Errors without a SQLSTATE are connection-level.
pub fn classify_error(err: &tokio_postgres::Error) -> ErrorClass {
    if err.is_closed() {
        return ErrorClass::Systemic;
    }
    match err.code() {
        Some(state) => classify_sqlstate(state.code()),
        None => ErrorClass::Systemic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        for code in ["40001", "40P01", "55P03", "57014"] {
            assert_eq!(classify_sqlstate(code), ErrorClass::Transient, "{code}");
        }
    }

    #[test]
    fn test_systemic_codes() {
        for code in ["08000", "08006", "08001", "57P01", "57P02", "53300", "53100"] {
            assert_eq!(classify_sqlstate(code), ErrorClass::Systemic, "{code}");
        }
    }

    #[test]
    fn test_permanent_codes() {
        // invalid_text_representation, not_null_violation, undefined_column, undefined_table
        for code in ["22P02", "23502", "23505", "42703", "42P01"] {
            assert_eq!(classify_sqlstate(code), ErrorClass::Permanent, "{code}");
        }
    }

    #[test]
    fn test_unknown_defaults_to_transient() {
        assert_eq!(classify_sqlstate("XX000"), ErrorClass::Transient);
        assert_eq!(classify_sqlstate(""), ErrorClass::Transient);
    }
}
