use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use skuld_directory::MembershipTable;
use skuld_types::{now_ns, SkuldError};

/// Periodically removes roster rows that are no longer Active and have not
/// heartbeated within the retention window.
pub struct DefunctSweep<T> {
    table: Arc<T>,
    interval: Duration,
    retention: Duration,
}

impl<T: MembershipTable> DefunctSweep<T> {
    pub fn new(table: Arc<T>, interval: Duration, retention: Duration) -> Self {
        DefunctSweep { table, interval, retention }
    }

    pub async fn sweep_once(&self) -> Result<(), SkuldError> {
        let retention_ns = i64::try_from(self.retention.as_nanos()).unwrap_or(i64::MAX);
        self.table.cleanup_defunct_before(now_ns().saturating_sub(retention_ns)).await
    }

    /// Sweep every `interval` until `shutdown` resolves. A failed sweep is
    /// logged and the loop carries on.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("defunct sweep stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(()) => tracing::debug!(retention_secs = self.retention.as_secs(), "defunct sweep done"),
                        Err(e) => tracing::warn!(error = %e, "defunct sweep failed"),
                    }
                }
            }
        }
    }
}
