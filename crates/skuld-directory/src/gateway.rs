use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use skuld_storage::QueryBackend;
use skuld_types::query::param;
use skuld_types::{check_cluster_id, NodeAddress, NodeStatus, Params, Procedure, SkuldError};

/// Client-facing URI of a gateway: `gwy.tcp://<ip>:<proxy_port>/<generation>`.
pub fn gateway_uri(gateway: &NodeAddress) -> String {
    format!("gwy.tcp://{}/{}", gateway.endpoint(), gateway.generation)
}

/// Polls the roster for Active members that expose a proxy port and caches
/// the resulting URIs for up to `max_staleness`.
pub struct GatewayAddressCache<B> {
    backend: Arc<B>,
    cluster_id: String,
    max_staleness: Duration,
    cached: RwLock<Option<(Instant, Vec<String>)>>,
}

impl<B: QueryBackend> GatewayAddressCache<B> {
    pub fn new(
        backend: Arc<B>,
        cluster_id: impl Into<String>,
        max_staleness: Duration,
    ) -> Result<Self, SkuldError> {
        let cluster_id = cluster_id.into();
        check_cluster_id(&cluster_id)?;
        Ok(GatewayAddressCache { backend, cluster_id, max_staleness, cached: RwLock::new(None) })
    }

    /// How long a caller may treat a returned list as current.
    pub fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    /// Cached list while it is younger than `max_staleness`, else a fresh poll.
    pub async fn get_addresses(&self) -> Result<Vec<String>, SkuldError> {
        if let Some((at, uris)) = self.cached.read().await.as_ref() {
            if at.elapsed() < self.max_staleness {
                return Ok(uris.clone());
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<Vec<String>, SkuldError> {
        let uris = self.poll().await.inspect_err(|e| {
            tracing::error!(cluster_id = %self.cluster_id, error = %e, "failed to read gateway list")
        })?;
        tracing::debug!(cluster_id = %self.cluster_id, count = uris.len(), "gateway list refreshed");
        *self.cached.write().await = Some((Instant::now(), uris.clone()));
        Ok(uris)
    }

    async fn poll(&self) -> Result<Vec<String>, SkuldError> {
        let params = Params::new()
            .text(param::CLUSTER_ID, self.cluster_id.clone())
            .small_int(param::STATUS, NodeStatus::Active.code());
        let sets = self.backend.query(Procedure::MembershipGateways, params).await?;
        let Some(set) = sets.first() else {
            return Ok(Vec::new());
        };
        set.iter()
            .map(|row| {
                let gateway =
                    NodeAddress::from_columns(row.get_bytes(0)?, row.get_i32(1)?, row.get_i32(2)?)?;
                Ok(gateway_uri(&gateway))
            })
            .collect()
    }
}
