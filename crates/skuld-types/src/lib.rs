use std::time::{SystemTime, UNIX_EPOCH};

pub mod membership;
pub mod query;
pub mod reminder;

pub use membership::{
    CorruptionWarning, MemberRecord, MembershipSnapshot, NodeAddress, NodeEntry, NodeStatus,
    SuspectEntry, TableVersion,
};
pub use query::{Outcome, Params, Procedure, ResultSet, Row, Value};
pub use reminder::{GrainId, ReminderEntry, ReminderSnapshot};

/// Physical partition of the reminder store.
pub type ShardId = u16;

/// Longest grain key or grain type tag accepted, in bytes.
pub const MAX_GRAIN_FIELD_LEN: usize = 1023;
/// Longest cluster id or reminder name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 150;

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SkuldError {
    /// Null or malformed input. A caller bug; never retried.
    #[error("invalid argument: {0}")]
    Validation(String),
    /// A required row is absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic version mismatch. Retryable by the caller after a re-read.
    #[error("version conflict: {0}")]
    Conflict(String),
    /// Connectivity or protocol failure reported by the storage backend.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl SkuldError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SkuldError::Conflict(_))
    }
}

/// Parses a decimal etag into the integer the backend stores.
pub fn parse_etag(etag: &str) -> Result<i64, SkuldError> {
    etag.trim()
        .parse::<i64>()
        .map_err(|_| SkuldError::Validation(format!("etag '{etag}' is not a version number")))
}

/// Rejects `len` above `max` bytes for the field called `what`.
pub fn check_len(what: &str, len: usize, max: usize) -> Result<(), SkuldError> {
    if len > max {
        return Err(SkuldError::Validation(format!("{what} is {len} bytes, limit is {max}")));
    }
    Ok(())
}

/// A cluster id must be non-blank and at most [`MAX_NAME_LEN`] bytes.
pub fn check_cluster_id(cluster_id: &str) -> Result<(), SkuldError> {
    if cluster_id.trim().is_empty() {
        return Err(SkuldError::Validation("cluster id must not be empty".into()));
    }
    check_len("cluster id", cluster_id.len(), MAX_NAME_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_etag_accepts_decimal() {
        assert_eq!(parse_etag("0").unwrap(), 0);
        assert_eq!(parse_etag(" 42 ").unwrap(), 42);
    }

    #[test]
    fn parse_etag_rejects_garbage() {
        assert!(matches!(parse_etag("abc"), Err(SkuldError::Validation(_))));
        assert!(matches!(parse_etag(""), Err(SkuldError::Validation(_))));
    }

    #[test]
    fn cluster_id_limits() {
        assert!(check_cluster_id("c1").is_ok());
        assert!(check_cluster_id(&"c".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(check_cluster_id(&"c".repeat(MAX_NAME_LEN + 1)), Err(SkuldError::Validation(_))));
        assert!(matches!(check_cluster_id("  "), Err(SkuldError::Validation(_))));
    }

    #[test]
    fn now_ns_is_after_2020() {
        assert!(now_ns() > 1_577_836_800_000_000_000);
    }
}
