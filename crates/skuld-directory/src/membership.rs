use std::collections::HashMap;
use std::sync::Arc;

use skuld_storage::QueryBackend;
use skuld_types::query::{output, param};
use skuld_types::{
    check_cluster_id, parse_etag, MemberRecord, MembershipSnapshot, NodeAddress, NodeEntry,
    NodeStatus, Params, Procedure, Row, SkuldError, SuspectEntry, TableVersion, Value,
};

use crate::audit::{audit_row, log_warnings};
use crate::MembershipTable;

/// [`MembershipTable`] over any [`QueryBackend`], scoped to one cluster id.
pub struct MembershipDirectory<B> {
    backend: Arc<B>,
    cluster_id: String,
}

impl<B: QueryBackend> MembershipDirectory<B> {
    pub fn new(backend: Arc<B>, cluster_id: impl Into<String>) -> Result<Self, SkuldError> {
        let cluster_id = cluster_id.into();
        check_cluster_id(&cluster_id)?;
        Ok(MembershipDirectory { backend, cluster_id })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn address_params(&self, address: &NodeAddress) -> Params {
        Params::new()
            .text(param::CLUSTER_ID, self.cluster_id.clone())
            .bytes(param::ADDRESS, address.address_bytes())
            .int(param::PORT, i32::from(address.port))
            .int(param::GENERATION, address.generation)
    }

    async fn read_all_rows(&self) -> Result<MembershipSnapshot, SkuldError> {
        let params = Params::new().text(param::CLUSTER_ID, self.cluster_id.clone());
        let mut sets = self.backend.query(Procedure::MembershipReadAll, params).await?.into_iter();

        let version_set = sets.next().unwrap_or_default();
        let Some(version_row) = version_set.first() else {
            return Err(SkuldError::NotFound(format!(
                "version row for cluster '{}'",
                self.cluster_id
            )));
        };
        let table_etag = version_row.get_i64(1)?;
        let table_version = version_row.get_i64(2)?;
        let mut snapshot =
            MembershipSnapshot::new(TableVersion::new(table_version, table_etag.to_string()));

        let Some(member_set) = sets.next() else {
            tracing::error!(cluster_id = %self.cluster_id, "member result set missing, returning version only");
            return Ok(snapshot);
        };
        let mut by_id = HashMap::with_capacity(member_set.len());
        for row in member_set.iter() {
            let member_id = row.get_i64(0)?;
            let address =
                NodeAddress::from_columns(row.get_bytes(1)?, row.get_i32(2)?, row.get_i32(3)?)?;
            let (entry, row_etag, row_version) = decode_entry(address, row, 4)?;
            log_warnings(
                &self.cluster_id,
                &audit_row(address, row_etag, row_version, table_etag, table_version),
            );
            snapshot.insert(MemberRecord { entry, etag: row_etag.to_string() });
            by_id.insert(member_id, address);
        }

        let Some(suspect_set) = sets.next() else {
            tracing::error!(cluster_id = %self.cluster_id, "suspect result set missing, returning members without suspects");
            return Ok(snapshot);
        };
        for row in suspect_set.iter() {
            let member_id = row.get_i64(0)?;
            let Some(owner) = by_id.get(&member_id) else {
                tracing::error!(cluster_id = %self.cluster_id, member_id, "suspect row refers to a member row that does not exist");
                continue;
            };
            let accuser =
                NodeAddress::from_columns(row.get_bytes(1)?, row.get_i32(2)?, row.get_i32(3)?)?;
            if let Some(record) = snapshot.get_mut(owner) {
                record.entry.add_suspect(accuser, row.get_timestamp(4)?);
            }
        }
        Ok(snapshot)
    }

    async fn read_one_row(&self, address: &NodeAddress) -> Result<MembershipSnapshot, SkuldError> {
        let mut sets = self
            .backend
            .query(Procedure::MembershipReadRow, self.address_params(address))
            .await?
            .into_iter();

        let member_set = sets.next().unwrap_or_default();
        let Some(row) = member_set.first() else {
            return Err(SkuldError::NotFound(format!(
                "member {address} in cluster '{}'",
                self.cluster_id
            )));
        };
        let (mut entry, row_etag, row_version) = decode_entry(*address, row, 0)?;
        let table_etag = row.get_i64(8)?;
        let table_version = row.get_i64(9)?;
        log_warnings(
            &self.cluster_id,
            &audit_row(*address, row_etag, row_version, table_etag, table_version),
        );

        match sets.next() {
            Some(suspect_set) => {
                for row in suspect_set.iter() {
                    let accuser = NodeAddress::from_columns(
                        row.get_bytes(0)?,
                        row.get_i32(1)?,
                        row.get_i32(2)?,
                    )?;
                    entry.add_suspect(accuser, row.get_timestamp(3)?);
                }
            }
            None => {
                tracing::error!(cluster_id = %self.cluster_id, %address, "suspect result set missing, returning member without suspects");
            }
        }

        let mut snapshot =
            MembershipSnapshot::new(TableVersion::new(table_version, table_etag.to_string()));
        snapshot.insert(MemberRecord { entry, etag: row_etag.to_string() });
        Ok(snapshot)
    }
}

/// Decodes the eight entry columns starting at `at`:
/// name, host, status, proxy port, start, heartbeat, row etag, row version.
fn decode_entry(
    address: NodeAddress,
    row: &Row,
    at: usize,
) -> Result<(NodeEntry, i64, i64), SkuldError> {
    let proxy_port = row.get_i32(at + 3)?;
    let entry = NodeEntry {
        address,
        name: row.get_text(at)?.to_string(),
        host: row.get_text(at + 1)?.to_string(),
        status: NodeStatus::from_code(row.get_i16(at + 2)?)?,
        proxy_port: u16::try_from(proxy_port)
            .map_err(|_| SkuldError::Backend(format!("proxy port column {proxy_port} out of range")))?,
        start_time_ns: row.get_timestamp(at + 4)?,
        heartbeat_ns: row.get_timestamp(at + 5)?,
        suspects: Vec::new(),
    };
    Ok((entry, row.get_i64(at + 6)?, row.get_i64(at + 7)?))
}

fn suspect_rows(suspects: &[SuspectEntry]) -> Vec<Row> {
    suspects
        .iter()
        .map(|s| {
            Row::new(vec![
                Value::Bytes(s.accuser.address_bytes()),
                Value::Int(i32::from(s.accuser.port)),
                Value::Int(s.accuser.generation),
                Value::Timestamp(s.at_ns),
            ])
        })
        .collect()
}

impl<B: QueryBackend> MembershipTable for MembershipDirectory<B> {
    async fn initialize(&self, create_version_row: bool) -> Result<(), SkuldError> {
        if !create_version_row {
            tracing::debug!(cluster_id = %self.cluster_id, "skipping version row creation");
            return Ok(());
        }
        let initial = TableVersion::initial();
        let params = Params::new()
            .text(param::CLUSTER_ID, self.cluster_id.clone())
            .big_int(param::ETAG_NO, initial.etag_no()?)
            .big_int(param::VERSION, initial.version);
        self.backend
            .run(Procedure::MembershipInsertVersion, params)
            .await
            .inspect_err(|e| {
                tracing::error!(cluster_id = %self.cluster_id, error = %e, "failed to initialize membership table")
            })?;
        tracing::info!(cluster_id = %self.cluster_id, backend = %self.backend.describe(), "membership table initialized");
        Ok(())
    }

    async fn insert(&self, entry: &NodeEntry, expected: &TableVersion) -> Result<bool, SkuldError> {
        let etag_no = expected.etag_no()?;
        let params = self
            .address_params(&entry.address)
            .text(param::NAME, entry.name.clone())
            .text(param::HOST, entry.host.clone())
            .small_int(param::STATUS, entry.status.code())
            .int(param::PROXY_PORT, i32::from(entry.proxy_port))
            .timestamp(param::START_TIME, entry.start_time_ns)
            .timestamp(param::HEARTBEAT_TIME, entry.heartbeat_ns)
            .big_int(param::ETAG_NO, etag_no)
            .big_int(param::VERSION, expected.version)
            .table(param::SUSPECT_TIMES, suspect_rows(&entry.suspects));

        match self.backend.run(Procedure::MembershipInsert, params).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => {
                tracing::debug!(cluster_id = %self.cluster_id, address = %entry.address, expected = %expected, error = %e, "membership insert rejected");
                Ok(false)
            }
            Err(e) => {
                tracing::error!(cluster_id = %self.cluster_id, address = %entry.address, expected = %expected, error = %e, "membership insert failed");
                Err(e)
            }
        }
    }

    async fn update(
        &self,
        entry: &NodeEntry,
        row_etag: &str,
        expected: &TableVersion,
    ) -> Result<bool, SkuldError> {
        let etag_no = expected.etag_no()?;
        let row_etag_no = parse_etag(row_etag)?;
        let params = Params::new()
            .text(param::CLUSTER_ID, self.cluster_id.clone())
            .small_int(param::STATUS, entry.status.code())
            .int(param::PROXY_PORT, i32::from(entry.proxy_port))
            .timestamp(param::HEARTBEAT_TIME, entry.heartbeat_ns)
            .bytes(param::ADDRESS, entry.address.address_bytes())
            .int(param::PORT, i32::from(entry.address.port))
            .int(param::GENERATION, entry.address.generation)
            .table(param::SUSPECT_TIMES, suspect_rows(&entry.suspects))
            .big_int(param::ETAG_NO, etag_no)
            .big_int(param::VERSION, expected.version)
            .big_int(param::ROW_ETAG_NO, row_etag_no)
            .text(param::NAME, entry.name.clone())
            .text(param::HOST, entry.host.clone())
            .timestamp(param::START_TIME, entry.start_time_ns);

        let updated = match self
            .backend
            .return_value(Procedure::MembershipUpdate, output::UPDATED, params)
            .await
        {
            Ok(v) => v.as_bool().ok_or_else(|| {
                SkuldError::Backend(format!("{} output is {}, expected bool", output::UPDATED, v.kind()))
            }),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
        .inspect_err(|e| {
            tracing::error!(cluster_id = %self.cluster_id, address = %entry.address, expected = %expected, row_etag, error = %e, "membership update failed")
        })?;

        if !updated {
            tracing::debug!(cluster_id = %self.cluster_id, address = %entry.address, expected = %expected, row_etag, "membership update rejected");
        }
        Ok(updated)
    }

    async fn read_all(&self) -> Result<MembershipSnapshot, SkuldError> {
        self.read_all_rows().await.inspect_err(|e| {
            tracing::error!(cluster_id = %self.cluster_id, error = %e, "failed to read membership table")
        })
    }

    async fn read_one(&self, address: &NodeAddress) -> Result<MembershipSnapshot, SkuldError> {
        self.read_one_row(address).await.inspect_err(|e| {
            tracing::error!(cluster_id = %self.cluster_id, %address, error = %e, "failed to read membership row")
        })
    }

    async fn update_heartbeat(&self, entry: &NodeEntry) -> Result<(), SkuldError> {
        let params = Params::new()
            .timestamp(param::HEARTBEAT_TIME, entry.heartbeat_ns)
            .text(param::CLUSTER_ID, self.cluster_id.clone())
            .bytes(param::ADDRESS, entry.address.address_bytes())
            .int(param::PORT, i32::from(entry.address.port))
            .int(param::GENERATION, entry.address.generation);
        self.backend.run(Procedure::MembershipUpdateHeartbeat, params).await.inspect_err(|e| {
            tracing::error!(cluster_id = %self.cluster_id, address = %entry.address, error = %e, "heartbeat update failed")
        })
    }

    async fn delete_all_for_cluster(&self, cluster_id: &str) -> Result<(), SkuldError> {
        check_cluster_id(cluster_id)?;
        let params = Params::new().text(param::CLUSTER_ID, cluster_id);
        self.backend.run(Procedure::MembershipDeleteCluster, params).await.inspect_err(|e| {
            tracing::error!(cluster_id, error = %e, "failed to delete cluster membership")
        })?;
        tracing::info!(cluster_id, "cluster membership deleted");
        Ok(())
    }

    async fn cleanup_defunct_before(&self, before_ns: i64) -> Result<(), SkuldError> {
        let params = Params::new()
            .text(param::CLUSTER_ID, self.cluster_id.clone())
            .timestamp(param::BEFORE_TIME, before_ns);
        self.backend.run(Procedure::MembershipDeleteDefunct, params).await.inspect_err(|e| {
            tracing::error!(cluster_id = %self.cluster_id, before_ns, error = %e, "defunct member cleanup failed")
        })
    }
}
