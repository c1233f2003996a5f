use std::future::Future;

use skuld_types::{
    GrainId, MembershipSnapshot, NodeAddress, NodeEntry, ReminderEntry, ReminderSnapshot,
    SkuldError, TableVersion,
};

pub mod audit;
pub mod gateway;
pub mod membership;
pub mod reminder;
pub mod shard;

pub use gateway::GatewayAddressCache;
pub use membership::MembershipDirectory;
pub use reminder::ReminderDirectory;
pub use shard::{ShardRouter, ShardSet};

// ---------------------------------------------------------------------------
// Directory traits
// Uses RPITIT (Return Position Impl Trait In Trait). The explicit `+ Send`
// bound on each future lets generic callers `.await` across threads.
// ---------------------------------------------------------------------------

/// Cluster roster with a single version row as its concurrency anchor.
///
/// Every call is one backend round trip. Nothing is retried here; conflicts
/// are reported to the caller, which re-reads and tries again.
pub trait MembershipTable: Send + Sync + 'static {
    /// Ensures the version row exists when `create_version_row` is set.
    /// Calling it again is a no-op.
    fn initialize(
        &self,
        create_version_row: bool,
    ) -> impl Future<Output = Result<(), SkuldError>> + Send;

    /// `Ok(false)` when the address is already present or `expected` is stale.
    fn insert(
        &self,
        entry: &NodeEntry,
        expected: &TableVersion,
    ) -> impl Future<Output = Result<bool, SkuldError>> + Send;

    /// Replaces the whole row, suspect list included. `Ok(false)` on any
    /// precondition failure.
    fn update(
        &self,
        entry: &NodeEntry,
        row_etag: &str,
        expected: &TableVersion,
    ) -> impl Future<Output = Result<bool, SkuldError>> + Send;

    fn read_all(&self) -> impl Future<Output = Result<MembershipSnapshot, SkuldError>> + Send;

    fn read_one(
        &self,
        address: &NodeAddress,
    ) -> impl Future<Output = Result<MembershipSnapshot, SkuldError>> + Send;

    /// Touches only the heartbeat column. Version and row etag stay as they are.
    fn update_heartbeat(
        &self,
        entry: &NodeEntry,
    ) -> impl Future<Output = Result<(), SkuldError>> + Send;

    fn delete_all_for_cluster(
        &self,
        cluster_id: &str,
    ) -> impl Future<Output = Result<(), SkuldError>> + Send;

    /// Removes non-Active rows whose last heartbeat is older than `before_ns`.
    fn cleanup_defunct_before(
        &self,
        before_ns: i64,
    ) -> impl Future<Output = Result<(), SkuldError>> + Send;
}

/// Shard-routed reminder rows with per-row optimistic versioning.
pub trait ReminderTable: Send + Sync + 'static {
    /// A vacant entry, not an error, when no row exists.
    fn read(
        &self,
        grain_id: &GrainId,
        name: &str,
    ) -> impl Future<Output = Result<ReminderEntry, SkuldError>> + Send;

    fn read_all_for_grain(
        &self,
        grain_id: &GrainId,
    ) -> impl Future<Output = Result<ReminderSnapshot, SkuldError>> + Send;

    /// All reminders, across every shard, whose grain hash lies in
    /// `[begin, end]`. `begin > end` selects the wrapped ring segment.
    fn read_range(
        &self,
        begin: u32,
        end: u32,
    ) -> impl Future<Output = Result<ReminderSnapshot, SkuldError>> + Send;

    /// Returns the new etag. A stale `entry.etag` is `SkuldError::Conflict`.
    fn upsert(
        &self,
        entry: &ReminderEntry,
    ) -> impl Future<Output = Result<String, SkuldError>> + Send;

    /// `Ok(false)` when the row is missing or `etag` is stale.
    fn remove(
        &self,
        grain_id: &GrainId,
        name: &str,
        etag: &str,
    ) -> impl Future<Output = Result<bool, SkuldError>> + Send;

    fn clear_all(&self) -> impl Future<Output = Result<(), SkuldError>> + Send;
}
