//! Schema-drift detection.
//!
//! A binary newer than its database fails every query against the missing
//! table or column. Each unique error pattern gets exactly one log line
//! pointing at the migrate command; the worker that hit it stops instead
//! of spinning on the same failure.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

static SEEN_PATTERNS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// True when the error looks like a missing relation/column/type, i.e. the
/// schema is behind the binary.
pub fn is_schema_drift(error: &anyhow::Error) -> bool {
    let text = format!("{error:#}");
    text.contains("does not exist")
}

/// Log a schema-drift error once per unique pattern. Returns true the
/// first time the pattern is seen.
pub fn warn_schema_drift_once(error: &anyhow::Error) -> bool {
    let text = error.to_string();
    let seen = SEEN_PATTERNS.get_or_init(|| Mutex::new(HashSet::new()));
    let first = seen.lock().unwrap().insert(text.clone());
    if first {
        tracing::error!(
            error = %text,
            "database schema looks out of date; run `cargo run --bin migrate_cli run`"
        );
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_relation_is_drift() {
        let e = anyhow::anyhow!(r#"relation "run_dispatches" does not exist"#);
        assert!(is_schema_drift(&e));
    }

    #[test]
    fn connection_refused_is_not_drift() {
        let e = anyhow::anyhow!("connection refused");
        assert!(!is_schema_drift(&e));
    }

    #[test]
    fn each_pattern_logs_once() {
        let e = anyhow::anyhow!("column \"unique_test_column\" does not exist");
        assert!(warn_schema_drift_once(&e));
        assert!(!warn_schema_drift_once(&e));
    }
}
