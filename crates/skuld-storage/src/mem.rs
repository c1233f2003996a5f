use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use skuld_types::{Outcome, Params, Procedure, SkuldError};

use crate::procedures;
use crate::traits::{QueryBackend, RowStore};
use crate::types::{MemberKey, MemberRow, Mutation, ReminderKey, ReminderRow, VersionRow};

struct MemTables {
    versions: BTreeMap<String, VersionRow>,
    members: BTreeMap<(String, MemberKey), MemberRow>,
    reminders: BTreeMap<ReminderKey, ReminderRow>,
    next_member_id: i64,
}

impl MemTables {
    fn apply(&mut self, mutations: Vec<Mutation>) {
        for m in mutations {
            match m {
                Mutation::PutVersion(row) => {
                    self.versions.insert(row.cluster_id.clone(), row);
                }
                Mutation::DeleteVersion { cluster_id } => {
                    self.versions.remove(&cluster_id);
                }
                Mutation::PutMember(row) => {
                    self.members.insert((row.cluster_id.clone(), row.key.clone()), row);
                }
                Mutation::DeleteMember { cluster_id, key } => {
                    self.members.remove(&(cluster_id, key));
                }
                Mutation::PutReminder(row) => {
                    self.reminders.insert(row.key.clone(), row);
                }
                Mutation::DeleteReminder { key, .. } => {
                    self.reminders.remove(&key);
                }
                Mutation::SetNextMemberId(id) => self.next_member_id = id,
            }
        }
    }
}

impl RowStore for MemTables {
    fn version_row(&self, cluster_id: &str) -> Result<Option<VersionRow>, SkuldError> {
        Ok(self.versions.get(cluster_id).cloned())
    }

    fn member_row(
        &self,
        cluster_id: &str,
        key: &MemberKey,
    ) -> Result<Option<MemberRow>, SkuldError> {
        Ok(self.members.get(&(cluster_id.to_string(), key.clone())).cloned())
    }

    fn member_rows(&self, cluster_id: &str) -> Result<Vec<MemberRow>, SkuldError> {
        Ok(self
            .members
            .iter()
            .filter(|((c, _), _)| c == cluster_id)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn next_member_id(&self) -> Result<i64, SkuldError> {
        Ok(self.next_member_id)
    }

    fn reminder_row(&self, key: &ReminderKey) -> Result<Option<ReminderRow>, SkuldError> {
        Ok(self.reminders.get(key).cloned())
    }

    fn reminder_rows_for_grain(
        &self,
        grain_type: &str,
        grain_key: &[u8],
    ) -> Result<Vec<ReminderRow>, SkuldError> {
        Ok(self
            .reminders
            .values()
            .filter(|r| r.key.grain_type == grain_type && r.key.grain_key == grain_key)
            .cloned()
            .collect())
    }

    fn reminder_rows_in_hash_range(
        &self,
        begin: u32,
        end: u32,
    ) -> Result<Vec<ReminderRow>, SkuldError> {
        Ok(self
            .reminders
            .values()
            .filter(|r| (begin..=end).contains(&r.grain_hash))
            .cloned()
            .collect())
    }
}

/// In-memory [`QueryBackend`] backed by `BTreeMap` tables.
///
/// Clones share the same tables, so several directories (or several
/// "processes" in a test) can race against one store. Not persisted.
#[derive(Clone)]
pub struct MemBackend {
    inner: Arc<RwLock<MemTables>>,
    label: String,
    unavailable: Arc<AtomicBool>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::named("mem")
    }

    pub fn named(label: impl Into<String>) -> Self {
        MemBackend {
            inner: Arc::new(RwLock::new(MemTables {
                versions: BTreeMap::new(),
                members: BTreeMap::new(),
                reminders: BTreeMap::new(),
                next_member_id: 1,
            })),
            label: label.into(),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, every call fails with [`SkuldError::Backend`] and touches
    /// nothing.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBackend for MemBackend {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn execute(&self, procedure: Procedure, params: Params) -> Result<Outcome, SkuldError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SkuldError::Backend(format!("{} is unavailable", self.label)));
        }
        if procedure.is_read() {
            let g = self.inner.read().await;
            let (outcome, _) = procedures::execute(&*g, procedure, &params)?;
            Ok(outcome)
        } else {
            let mut g = self.inner.write().await;
            let (outcome, mutations) = procedures::execute(&*g, procedure, &params)?;
            g.apply(mutations);
            Ok(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use skuld_types::query::output;
    use skuld_types::{NodeStatus, Procedure, Value};

    use super::*;
    use crate::fixtures::{self, CLUSTER};

    async fn bootstrapped() -> MemBackend {
        let b = MemBackend::new();
        b.run(Procedure::MembershipInsertVersion, fixtures::version(CLUSTER)).await.unwrap();
        b
    }

    async fn version_of(b: &MemBackend) -> (i64, i64) {
        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster(CLUSTER)).await.unwrap();
        let row = sets[0].first().unwrap();
        (row.get_i64(1).unwrap(), row.get_i64(2).unwrap())
    }

    #[tokio::test]
    async fn insert_version_is_idempotent() {
        let b = bootstrapped().await;
        b.run(
            Procedure::MembershipInsert,
            fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0),
        )
        .await
        .unwrap();
        b.run(Procedure::MembershipInsertVersion, fixtures::version(CLUSTER)).await.unwrap();
        assert_eq!(version_of(&b).await, (1, 1));
    }

    #[tokio::test]
    async fn read_all_without_version_row_is_one_empty_set() {
        let b = MemBackend::new();
        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster(CLUSTER)).await.unwrap();
        assert_eq!(sets.len(), 1);
        assert!(sets[0].is_empty());
    }

    #[tokio::test]
    async fn insert_advances_version_and_restamps_members() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap();
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 2, NodeStatus::Joining, 1, 1))
            .await
            .unwrap();

        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster(CLUSTER)).await.unwrap();
        assert_eq!(sets.len(), 3);
        let version = sets[0].first().unwrap();
        assert_eq!(version.get_text(0).unwrap(), CLUSTER);
        assert_eq!(version.get_i64(1).unwrap(), 2);
        assert_eq!(version.get_i64(2).unwrap(), 2);

        let members: Vec<_> = sets[1].iter().collect();
        assert_eq!(members.len(), 2);
        // Ordered by member id; every row carries the current etag.
        assert_eq!(members[0].get_i32(2).unwrap(), 1);
        assert_eq!(members[1].get_i32(2).unwrap(), 2);
        assert!(members.iter().all(|m| m.get_i64(10).unwrap() == 2));
        assert_eq!(members[0].get_i64(11).unwrap(), 1);
        assert_eq!(members[1].get_i64(11).unwrap(), 2);

        // One suspect row per member, linked by member id.
        assert_eq!(sets[2].len(), 2);
        assert_eq!(sets[2].first().unwrap().get_i64(0).unwrap(), members[0].get_i64(0).unwrap());
    }

    #[tokio::test]
    async fn insert_with_stale_version_conflicts() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap();
        let err = b
            .run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 2, NodeStatus::Active, 0, 0))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(version_of(&b).await, (1, 1));
    }

    #[tokio::test]
    async fn insert_duplicate_member_conflicts() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap();
        let err = b
            .run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 1, 1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn insert_without_version_row_is_not_found() {
        let b = MemBackend::new();
        let err = b
            .run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SkuldError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_checks_row_etag() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Joining, 0, 0))
            .await
            .unwrap();

        let stale = b
            .return_value(
                Procedure::MembershipUpdate,
                output::UPDATED,
                fixtures::update(CLUSTER, 1, NodeStatus::Active, 1, 1, 0),
            )
            .await
            .unwrap();
        assert_eq!(stale, Value::Bool(false));
        assert_eq!(version_of(&b).await, (1, 1));

        let fresh = b
            .return_value(
                Procedure::MembershipUpdate,
                output::UPDATED,
                fixtures::update(CLUSTER, 1, NodeStatus::Active, 1, 1, 1),
            )
            .await
            .unwrap();
        assert_eq!(fresh, Value::Bool(true));
        assert_eq!(version_of(&b).await, (2, 2));

        let sets = b.query(Procedure::MembershipReadRow, fixtures::member(CLUSTER, 1)).await.unwrap();
        let row = sets[0].first().unwrap();
        assert_eq!(row.get_i16(2).unwrap(), NodeStatus::Active.code());
        assert_eq!(row.get_i64(6).unwrap(), 2);
        assert_eq!(row.get_i64(8).unwrap(), 2);
        assert_eq!(row.get_i64(9).unwrap(), 2);
        // The update replaced the suspect list with an empty one.
        assert!(sets[1].is_empty());
    }

    #[tokio::test]
    async fn update_of_missing_member_is_not_updated() {
        let b = bootstrapped().await;
        let v = b
            .return_value(
                Procedure::MembershipUpdate,
                output::UPDATED,
                fixtures::update(CLUSTER, 7, NodeStatus::Active, 0, 0, 0),
            )
            .await
            .unwrap();
        assert_eq!(v, Value::Bool(false));
    }

    #[tokio::test]
    async fn read_row_of_missing_member_is_empty() {
        let b = bootstrapped().await;
        let sets = b.query(Procedure::MembershipReadRow, fixtures::member(CLUSTER, 1)).await.unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn heartbeat_leaves_version_alone() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap();
        b.run(Procedure::MembershipUpdateHeartbeat, fixtures::heartbeat(CLUSTER, 1, 9_999))
            .await
            .unwrap();
        // Unknown member: silently nothing.
        b.run(Procedure::MembershipUpdateHeartbeat, fixtures::heartbeat(CLUSTER, 2, 9_999))
            .await
            .unwrap();

        assert_eq!(version_of(&b).await, (1, 1));
        let sets = b.query(Procedure::MembershipReadRow, fixtures::member(CLUSTER, 1)).await.unwrap();
        let row = sets[0].first().unwrap();
        assert_eq!(row.get_timestamp(5).unwrap(), 9_999);
        assert_eq!(row.get_i64(6).unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_defunct_spares_active_and_recent() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap();
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 2, NodeStatus::Dead, 1, 1))
            .await
            .unwrap();
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 3, NodeStatus::Dead, 2, 2))
            .await
            .unwrap();
        b.run(Procedure::MembershipUpdateHeartbeat, fixtures::heartbeat(CLUSTER, 3, 50_000))
            .await
            .unwrap();

        let params = fixtures::cluster(CLUSTER)
            .timestamp(skuld_types::query::param::BEFORE_TIME, 10_000);
        b.run(Procedure::MembershipDeleteDefunct, params).await.unwrap();

        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster(CLUSTER)).await.unwrap();
        let ports: Vec<i32> = sets[1].iter().map(|r| r.get_i32(2).unwrap()).collect();
        assert_eq!(ports, vec![1, 3]);
    }

    #[tokio::test]
    async fn delete_cluster_removes_everything() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap();
        b.run(Procedure::MembershipInsertVersion, fixtures::version("other")).await.unwrap();
        b.run(Procedure::MembershipDeleteCluster, fixtures::cluster(CLUSTER)).await.unwrap();

        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster(CLUSTER)).await.unwrap();
        assert!(sets[0].is_empty());
        let other = b.query(Procedure::MembershipReadAll, fixtures::cluster("other")).await.unwrap();
        assert_eq!(other[0].len(), 1);
    }

    #[tokio::test]
    async fn gateways_lists_active_members_with_proxy_port() {
        let b = bootstrapped().await;
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap();
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 2, NodeStatus::Joining, 1, 1))
            .await
            .unwrap();
        let params = fixtures::cluster(CLUSTER)
            .small_int(skuld_types::query::param::STATUS, NodeStatus::Active.code());
        let sets = b.query(Procedure::MembershipGateways, params).await.unwrap();
        assert_eq!(sets[0].len(), 1);
        let row = sets[0].first().unwrap();
        assert_eq!(row.get_bytes(0).unwrap(), &fixtures::ADDR);
        assert_eq!(row.get_i32(1).unwrap(), 30000);
        assert_eq!(row.get_i32(2).unwrap(), 1);
    }

    #[tokio::test]
    async fn reminder_versions_advance_and_gate_writes() {
        let b = MemBackend::new();
        let v1 = b
            .return_value(Procedure::ReminderUpsert, output::NEW_VERSION, fixtures::upsert("g", "r", 7, 0))
            .await
            .unwrap();
        assert_eq!(v1, Value::BigInt(1));
        let v2 = b
            .return_value(Procedure::ReminderUpsert, output::NEW_VERSION, fixtures::upsert("g", "r", 7, 1))
            .await
            .unwrap();
        assert_eq!(v2, Value::BigInt(2));

        let err = b.run(Procedure::ReminderUpsert, fixtures::upsert("g", "r", 7, 1)).await.unwrap_err();
        assert!(err.is_conflict());

        let stale = b
            .return_value(Procedure::ReminderDelete, output::IS_FOUND, fixtures::delete("g", "r", 1))
            .await
            .unwrap();
        assert_eq!(stale, Value::Bool(false));
        let found = b
            .return_value(Procedure::ReminderDelete, output::IS_FOUND, fixtures::delete("g", "r", 2))
            .await
            .unwrap();
        assert_eq!(found, Value::Bool(true));

        let sets = b.query(Procedure::ReminderReadRow, fixtures::reminder("g", "r")).await.unwrap();
        assert!(sets[0].is_empty());
    }

    #[tokio::test]
    async fn reminder_range_scans_linear_and_wrapped() {
        let b = MemBackend::new();
        for (name, hash) in [("low", 10u32), ("mid", 0x8000_0000), ("high", u32::MAX)] {
            b.run(Procedure::ReminderUpsert, fixtures::upsert("g", name, hash, 0)).await.unwrap();
        }

        let names = |sets: Vec<skuld_types::ResultSet>| -> Vec<String> {
            sets[0].iter().map(|r| r.get_text(2).unwrap().to_string()).collect()
        };

        let all = b.query(Procedure::ReminderReadRange, fixtures::range(0, u32::MAX)).await.unwrap();
        assert_eq!(names(all), vec!["low", "mid", "high"]);

        let wrapped = b
            .query(Procedure::ReminderReadRangeWrapped, fixtures::range(0x9000_0000, 10))
            .await
            .unwrap();
        assert_eq!(names(wrapped), vec!["low", "high"]);

        let err = b.query(Procedure::ReminderReadRange, fixtures::range(5, 1)).await.unwrap_err();
        assert!(matches!(err, SkuldError::Backend(_)));
    }

    #[tokio::test]
    async fn reminder_rows_for_grain_are_isolated() {
        let b = MemBackend::new();
        b.run(Procedure::ReminderUpsert, fixtures::upsert("g1", "a", 1, 0)).await.unwrap();
        b.run(Procedure::ReminderUpsert, fixtures::upsert("g1", "b", 1, 0)).await.unwrap();
        b.run(Procedure::ReminderUpsert, fixtures::upsert("g2", "a", 2, 0)).await.unwrap();

        let params = skuld_types::Params::new()
            .bytes(skuld_types::query::param::GRAIN_KEY, b"g1".to_vec())
            .text(skuld_types::query::param::GRAIN_TYPE, "counter");
        let sets = b.query(Procedure::ReminderReadRows, params).await.unwrap();
        assert_eq!(sets[0].len(), 2);
    }

    #[tokio::test]
    async fn unavailable_backend_fails_without_touching_state() {
        let b = bootstrapped().await;
        b.set_unavailable(true);
        let err = b
            .run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SkuldError::Backend(_)));
        b.set_unavailable(false);
        assert_eq!(version_of(&b).await, (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_with_same_version_have_one_winner() {
        let b = Arc::new(bootstrapped().await);
        let mut handles = Vec::new();
        for port in 1..=8 {
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                b.run(
                    Procedure::MembershipInsert,
                    fixtures::insert(CLUSTER, port, NodeStatus::Joining, 0, 0),
                )
                .await
            }));
        }
        let mut wins = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => wins += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(version_of(&b).await, (1, 1));
    }
}
