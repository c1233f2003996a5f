/// Per-cluster version row: the concurrency anchor for roster mutations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionRow {
    pub cluster_id: String,
    pub version: i64,
    pub etag_no: i64,
}

/// Primary key of a member row within its cluster.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct MemberKey {
    pub address: Vec<u8>,
    pub port: i32,
    pub generation: i32,
}

/// A row of the suspect table, stored inline with its member in list order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SuspectRow {
    pub address: Vec<u8>,
    pub port: i32,
    pub generation: i32,
    pub at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemberRow {
    /// Surrogate id linking suspect rows to their member in multi-set reads.
    pub member_id: i64,
    pub cluster_id: String,
    pub key: MemberKey,
    pub name: String,
    pub host: String,
    pub status: i16,
    pub proxy_port: i32,
    pub start_time_ns: i64,
    pub heartbeat_ns: i64,
    /// Etag number of the version row when this row was last stamped.
    pub etag_no: i64,
    /// Table version at which this row was last written.
    pub version: i64,
    pub suspects: Vec<SuspectRow>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ReminderKey {
    pub grain_type: String,
    pub grain_key: Vec<u8>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReminderRow {
    pub key: ReminderKey,
    pub start_at_ns: i64,
    pub period_ns: i64,
    pub grain_hash: u32,
    pub version: i64,
}

/// A single row write produced by a procedure. A procedure's mutations are
/// applied all together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    PutVersion(VersionRow),
    DeleteVersion { cluster_id: String },
    PutMember(MemberRow),
    DeleteMember { cluster_id: String, key: MemberKey },
    PutReminder(ReminderRow),
    DeleteReminder { key: ReminderKey, grain_hash: u32 },
    SetNextMemberId(i64),
}
