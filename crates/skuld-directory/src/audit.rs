//! Advisory cross-check of roster rows against the version row.

use skuld_types::{CorruptionWarning, NodeAddress};

/// Compares one row's etag and version with the table version it was read
/// alongside. An empty result means the row is consistent.
pub fn audit_row(
    address: NodeAddress,
    row_etag: i64,
    row_version: i64,
    table_etag: i64,
    table_version: i64,
) -> Vec<CorruptionWarning> {
    let mut warnings = Vec::new();
    if row_etag != table_etag {
        warnings.push(CorruptionWarning::EtagMismatch {
            address,
            row_etag,
            version_etag: table_etag,
        });
    }
    if row_version > table_version {
        warnings.push(CorruptionWarning::VersionAhead { address, row_version, table_version });
    }
    warnings
}

pub fn log_warnings(cluster_id: &str, warnings: &[CorruptionWarning]) {
    for w in warnings {
        tracing::warn!(cluster_id, warning = %w, "membership table corruption detected");
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr() -> NodeAddress {
        NodeAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 11111, 1)
    }

    #[test]
    fn consistent_row_has_no_warnings() {
        assert!(audit_row(addr(), 4, 3, 4, 4).is_empty());
    }

    #[test]
    fn etag_mismatch_is_reported() {
        let w = audit_row(addr(), 3, 3, 4, 4);
        assert_eq!(
            w,
            vec![CorruptionWarning::EtagMismatch { address: addr(), row_etag: 3, version_etag: 4 }]
        );
    }

    #[test]
    fn row_ahead_of_table_is_reported() {
        let w = audit_row(addr(), 4, 5, 4, 4);
        assert_eq!(
            w,
            vec![CorruptionWarning::VersionAhead { address: addr(), row_version: 5, table_version: 4 }]
        );
    }

    #[test]
    fn both_anomalies_at_once() {
        assert_eq!(audit_row(addr(), 1, 9, 2, 2).len(), 2);
    }
}
