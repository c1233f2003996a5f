use std::path::Path;
use std::sync::{Arc, RwLock};

use skuld_types::{Outcome, Params, Procedure, SkuldError};

use crate::keys::{
    hash_range_end, hash_range_start, member_key, member_prefix, meta_key, reminder_grain_prefix,
    reminder_hash_key, reminder_key, version_key,
};
use crate::procedures;
use crate::traits::{QueryBackend, RowStore};
use crate::types::{MemberKey, MemberRow, Mutation, ReminderKey, ReminderRow, VersionRow};

const NEXT_MEMBER_ID: &str = "next_member_id";

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, SkuldError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| SkuldError::Backend(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, SkuldError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| SkuldError::Backend(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> SkuldError {
    SkuldError::Backend(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all five keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that the write batch
/// produced by one procedure is atomic across them.
pub struct FjallStore {
    pub db: fjall::Database,
    /// `cluster_utf8` → bincode(VersionRow)
    pub versions: fjall::Keyspace,
    /// `len(2) ++ cluster ++ addr_len(1) ++ addr ++ port(4) ++ generation(4)` → bincode(MemberRow)
    pub members: fjall::Keyspace,
    /// `len(2) ++ type ++ len(4) ++ key ++ name` → bincode(ReminderRow)
    pub reminders: fjall::Keyspace,
    /// `hash(4) ++ reminder_key` → b""
    pub reminder_hashes: fjall::Keyspace,
    /// `label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, SkuldError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let versions =
            db.keyspace("versions", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let members =
            db.keyspace("members", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let reminders =
            db.keyspace("reminders", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let reminder_hashes = db
            .keyspace("reminder_hashes", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, versions, members, reminders, reminder_hashes, meta }))
    }

    fn apply(&self, mutations: Vec<Mutation>) -> Result<(), SkuldError> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mut batch = self.db.batch();
        for m in mutations {
            match m {
                Mutation::PutVersion(row) => {
                    batch.insert(&self.versions, version_key(&row.cluster_id), encode(&row)?);
                }
                Mutation::DeleteVersion { cluster_id } => {
                    batch.remove(&self.versions, version_key(&cluster_id));
                }
                Mutation::PutMember(row) => {
                    batch.insert(&self.members, member_key(&row.cluster_id, &row.key), encode(&row)?);
                }
                Mutation::DeleteMember { cluster_id, key } => {
                    batch.remove(&self.members, member_key(&cluster_id, &key));
                }
                Mutation::PutReminder(row) => {
                    if let Some(prev) = self.reminder_row(&row.key)? {
                        if prev.grain_hash != row.grain_hash {
                            batch.remove(
                                &self.reminder_hashes,
                                reminder_hash_key(prev.grain_hash, &prev.key),
                            );
                        }
                    }
                    batch.insert(&self.reminder_hashes, reminder_hash_key(row.grain_hash, &row.key), b"");
                    batch.insert(&self.reminders, reminder_key(&row.key), encode(&row)?);
                }
                Mutation::DeleteReminder { key, grain_hash } => {
                    batch.remove(&self.reminders, reminder_key(&key));
                    batch.remove(&self.reminder_hashes, reminder_hash_key(grain_hash, &key));
                }
                Mutation::SetNextMemberId(id) => {
                    batch.insert(&self.meta, meta_key(NEXT_MEMBER_ID), encode(&id)?);
                }
            }
        }
        batch.commit().map_err(fjall_err)
    }
}

impl RowStore for FjallStore {
    fn version_row(&self, cluster_id: &str) -> Result<Option<VersionRow>, SkuldError> {
        match self.versions.get(version_key(cluster_id)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<VersionRow>(&b)?)),
            None => Ok(None),
        }
    }

    fn member_row(
        &self,
        cluster_id: &str,
        key: &MemberKey,
    ) -> Result<Option<MemberRow>, SkuldError> {
        match self.members.get(member_key(cluster_id, key)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<MemberRow>(&b)?)),
            None => Ok(None),
        }
    }

    fn member_rows(&self, cluster_id: &str) -> Result<Vec<MemberRow>, SkuldError> {
        self.members
            .prefix(member_prefix(cluster_id))
            .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<MemberRow>(&v)))
            .collect()
    }

    fn next_member_id(&self) -> Result<i64, SkuldError> {
        match self.meta.get(meta_key(NEXT_MEMBER_ID)).map_err(fjall_err)? {
            Some(b) => decode::<i64>(&b),
            None => Ok(1),
        }
    }

    fn reminder_row(&self, key: &ReminderKey) -> Result<Option<ReminderRow>, SkuldError> {
        match self.reminders.get(reminder_key(key)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<ReminderRow>(&b)?)),
            None => Ok(None),
        }
    }

    fn reminder_rows_for_grain(
        &self,
        grain_type: &str,
        grain_key: &[u8],
    ) -> Result<Vec<ReminderRow>, SkuldError> {
        self.reminders
            .prefix(reminder_grain_prefix(grain_type, grain_key))
            .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<ReminderRow>(&v)))
            .collect()
    }

    fn reminder_rows_in_hash_range(
        &self,
        begin: u32,
        end: u32,
    ) -> Result<Vec<ReminderRow>, SkuldError> {
        let start = hash_range_start(begin);
        let index_keys: Vec<Vec<u8>> = match hash_range_end(end) {
            Some(stop) => self
                .reminder_hashes
                .range(start..stop)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?,
            None => self
                .reminder_hashes
                .range(start..)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?,
        };

        let mut rows = Vec::with_capacity(index_keys.len());
        for k in index_keys {
            let primary = k.get(4..).unwrap_or_default();
            match self.reminders.get(primary).map_err(fjall_err)? {
                Some(b) => rows.push(decode::<ReminderRow>(&b)?),
                None => {
                    return Err(SkuldError::Backend(
                        "hash index points at a missing reminder row".into(),
                    ))
                }
            }
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// FjallBackend
// ---------------------------------------------------------------------------

/// [`QueryBackend`] backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`. Reads share
/// the lock; writes hold it exclusively from the first read of a procedure
/// until its batch commits.
#[derive(Clone)]
pub struct FjallBackend {
    store: Arc<FjallStore>,
    lock: Arc<RwLock<()>>,
    label: String,
}

impl FjallBackend {
    pub fn new(store: Arc<FjallStore>, label: impl Into<String>) -> Self {
        FjallBackend { store, lock: Arc::new(RwLock::new(())), label: label.into() }
    }

    /// Open the store at `path`, labelled with the path itself.
    pub fn open(path: &Path) -> Result<Self, SkuldError> {
        Ok(Self::new(FjallStore::open(path)?, format!("fjall:{}", path.display())))
    }
}

impl QueryBackend for FjallBackend {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn execute(&self, procedure: Procedure, params: Params) -> Result<Outcome, SkuldError> {
        let store = self.store.clone();
        let lock = self.lock.clone();
        tokio::task::spawn_blocking(move || -> Result<Outcome, SkuldError> {
            if procedure.is_read() {
                let _g = lock.read().map_err(|_| SkuldError::Backend("store lock poisoned".into()))?;
                let (outcome, _) = procedures::execute(&*store, procedure, &params)?;
                Ok(outcome)
            } else {
                let _g = lock.write().map_err(|_| SkuldError::Backend("store lock poisoned".into()))?;
                let (outcome, mutations) = procedures::execute(&*store, procedure, &params)?;
                store.apply(mutations)?;
                Ok(outcome)
            }
        })
        .await
        .map_err(|e| SkuldError::Backend(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use skuld_types::query::output;
    use skuld_types::{NodeStatus, Value};

    use super::*;
    use crate::fixtures::{self, CLUSTER};

    fn open_backend(dir: &std::path::Path) -> FjallBackend {
        FjallBackend::open(dir).expect("open store")
    }

    #[tokio::test]
    async fn membership_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let b = open_backend(dir.path());
            b.run(Procedure::MembershipInsertVersion, fixtures::version(CLUSTER)).await.unwrap();
            b.run(
                Procedure::MembershipInsert,
                fixtures::insert(CLUSTER, 1, NodeStatus::Active, 0, 0),
            )
            .await
            .unwrap();
            b.run(
                Procedure::MembershipInsert,
                fixtures::insert(CLUSTER, 2, NodeStatus::Joining, 1, 1),
            )
            .await
            .unwrap();
        }

        let b = open_backend(dir.path());
        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster(CLUSTER)).await.unwrap();
        let version = sets[0].first().unwrap();
        assert_eq!(version.get_i64(1).unwrap(), 2);
        assert_eq!(version.get_i64(2).unwrap(), 2);
        assert_eq!(sets[1].len(), 2);
        assert_eq!(sets[2].len(), 2);

        // Member ids keep counting after reopen.
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 3, NodeStatus::Joining, 2, 2))
            .await
            .unwrap();
        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster(CLUSTER)).await.unwrap();
        let ids: Vec<i64> = sets[1].iter().map(|r| r.get_i64(0).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn clusters_do_not_bleed() {
        let dir = tempfile::tempdir().unwrap();
        let b = open_backend(dir.path());
        for cluster in ["c1", "c10"] {
            b.run(Procedure::MembershipInsertVersion, fixtures::version(cluster)).await.unwrap();
            b.run(Procedure::MembershipInsert, fixtures::insert(cluster, 1, NodeStatus::Active, 0, 0))
                .await
                .unwrap();
        }
        let sets = b.query(Procedure::MembershipReadAll, fixtures::cluster("c1")).await.unwrap();
        assert_eq!(sets[1].len(), 1);
    }

    #[tokio::test]
    async fn update_and_heartbeat_persist() {
        let dir = tempfile::tempdir().unwrap();
        let b = open_backend(dir.path());
        b.run(Procedure::MembershipInsertVersion, fixtures::version(CLUSTER)).await.unwrap();
        b.run(Procedure::MembershipInsert, fixtures::insert(CLUSTER, 1, NodeStatus::Joining, 0, 0))
            .await
            .unwrap();
        let updated = b
            .return_value(
                Procedure::MembershipUpdate,
                output::UPDATED,
                fixtures::update(CLUSTER, 1, NodeStatus::Active, 1, 1, 1),
            )
            .await
            .unwrap();
        assert_eq!(updated, Value::Bool(true));
        b.run(Procedure::MembershipUpdateHeartbeat, fixtures::heartbeat(CLUSTER, 1, 77_000))
            .await
            .unwrap();

        let sets = b.query(Procedure::MembershipReadRow, fixtures::member(CLUSTER, 1)).await.unwrap();
        let row = sets[0].first().unwrap();
        assert_eq!(row.get_i16(2).unwrap(), NodeStatus::Active.code());
        assert_eq!(row.get_timestamp(5).unwrap(), 77_000);
        assert_eq!(row.get_i64(9).unwrap(), 2);
    }

    #[tokio::test]
    async fn reminder_hash_index_tracks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let b = open_backend(dir.path());
        b.run(Procedure::ReminderUpsert, fixtures::upsert("g", "a", 100, 0)).await.unwrap();
        b.run(Procedure::ReminderUpsert, fixtures::upsert("g", "b", u32::MAX, 0)).await.unwrap();
        // Rewrite "a" under a different hash; the old index entry must go.
        b.run(Procedure::ReminderUpsert, fixtures::upsert("g", "a", 200, 1)).await.unwrap();

        let low = b.query(Procedure::ReminderReadRange, fixtures::range(0, 150)).await.unwrap();
        assert!(low[0].is_empty());
        let all = b.query(Procedure::ReminderReadRange, fixtures::range(0, u32::MAX)).await.unwrap();
        assert_eq!(all[0].len(), 2);
        let wrapped = b
            .query(Procedure::ReminderReadRangeWrapped, fixtures::range(300, 250))
            .await
            .unwrap();
        let names: Vec<&str> = wrapped[0].iter().map(|r| r.get_text(2).unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let found = b
            .return_value(Procedure::ReminderDelete, output::IS_FOUND, fixtures::delete("g", "a", 2))
            .await
            .unwrap();
        assert_eq!(found, Value::Bool(true));
        let all = b.query(Procedure::ReminderReadRange, fixtures::range(0, u32::MAX)).await.unwrap();
        assert_eq!(all[0].len(), 1);
    }

    #[tokio::test]
    async fn reminder_row_read_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let b = open_backend(dir.path());
        b.run(Procedure::ReminderUpsert, fixtures::upsert("g", "a", 1, 0)).await.unwrap();
        let sets = b.query(Procedure::ReminderReadRow, fixtures::reminder("g", "a")).await.unwrap();
        let row = sets[0].first().unwrap();
        assert_eq!(row.get_bytes(0).unwrap(), b"g");
        assert_eq!(row.get_text(1).unwrap(), "counter");
        assert_eq!(row.get_i64(4).unwrap(), 60_000_000_000);
        assert_eq!(row.get_i64(5).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_from_same_version_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let b = open_backend(dir.path());
        let hash = rand::random::<u32>();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                b.run(Procedure::ReminderUpsert, fixtures::upsert("g", "race", hash, 0)).await
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
    }
}
