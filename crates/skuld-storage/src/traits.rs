use std::future::Future;

use skuld_types::{Outcome, Params, Procedure, ResultSet, SkuldError, Value};

use crate::types::{MemberKey, MemberRow, ReminderKey, ReminderRow, VersionRow};

/// The storage backend collaborator: executes one named procedure per call,
/// atomically, in a single round trip.
///
/// Methods use RPITIT (`-> impl Future + Send`) so no `async-trait`
/// dependency is needed. Only [`QueryBackend::execute`] is required; the
/// result-shape helpers are views over its [`Outcome`].
pub trait QueryBackend: Send + Sync + 'static {
    /// Short description of the connection, used as log context.
    fn describe(&self) -> String;

    /// Execute `procedure`. Precondition failures surface either as outputs
    /// (boolean results) or as `SkuldError::Conflict`, per procedure.
    fn execute(
        &self,
        procedure: Procedure,
        params: Params,
    ) -> impl Future<Output = Result<Outcome, SkuldError>> + Send;

    /// Execute for effect only.
    fn run(
        &self,
        procedure: Procedure,
        params: Params,
    ) -> impl Future<Output = Result<(), SkuldError>> + Send {
        async move { self.execute(procedure, params).await.map(|_| ()) }
    }

    /// Execute and return the ordered result sets.
    fn query(
        &self,
        procedure: Procedure,
        params: Params,
    ) -> impl Future<Output = Result<Vec<ResultSet>, SkuldError>> + Send {
        async move { Ok(self.execute(procedure, params).await?.result_sets) }
    }

    /// Execute and return a single output parameter.
    fn return_value(
        &self,
        procedure: Procedure,
        output: &'static str,
        params: Params,
    ) -> impl Future<Output = Result<Value, SkuldError>> + Send {
        async move {
            let mut outcome = self.execute(procedure, params).await?;
            outcome.take_output(output).ok_or_else(|| {
                SkuldError::Backend(format!("{procedure} returned no {output} output"))
            })
        }
    }
}

/// Synchronous read view over the stored tables, as seen by the procedure
/// engine while the backend holds its lock.
pub trait RowStore {
    fn version_row(&self, cluster_id: &str) -> Result<Option<VersionRow>, SkuldError>;

    fn member_row(
        &self,
        cluster_id: &str,
        key: &MemberKey,
    ) -> Result<Option<MemberRow>, SkuldError>;

    /// All members of a cluster, in any order.
    fn member_rows(&self, cluster_id: &str) -> Result<Vec<MemberRow>, SkuldError>;

    fn next_member_id(&self) -> Result<i64, SkuldError>;

    fn reminder_row(&self, key: &ReminderKey) -> Result<Option<ReminderRow>, SkuldError>;

    fn reminder_rows_for_grain(
        &self,
        grain_type: &str,
        grain_key: &[u8],
    ) -> Result<Vec<ReminderRow>, SkuldError>;

    /// Rows with `begin <= grain_hash <= end`. Callers guarantee `begin <= end`.
    fn reminder_rows_in_hash_range(
        &self,
        begin: u32,
        end: u32,
    ) -> Result<Vec<ReminderRow>, SkuldError>;
}
