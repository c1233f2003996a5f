use std::sync::Arc;

use skuld_storage::QueryBackend;
use skuld_types::{GrainId, Params, Procedure, ResultSet, ShardId, SkuldError};

/// Maps a grain to its shard from the grain's uniform hash and the shard
/// count alone. Cluster topology never enters into it, so a grain's row
/// stays on one shard for life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u16,
}

impl ShardRouter {
    pub fn new(shard_count: u16) -> Result<Self, SkuldError> {
        if shard_count == 0 {
            return Err(SkuldError::Validation("shard count must be at least 1".into()));
        }
        Ok(ShardRouter { shard_count })
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    pub fn shard_for(&self, grain_id: &GrainId) -> ShardId {
        (grain_id.uniform_hash() % u32::from(self.shard_count)) as ShardId
    }
}

/// One backend per shard, indexed by [`ShardId`].
pub struct ShardSet<B> {
    router: ShardRouter,
    backends: Vec<Arc<B>>,
}

impl<B: QueryBackend> ShardSet<B> {
    pub fn new(backends: Vec<Arc<B>>) -> Result<Self, SkuldError> {
        let count = u16::try_from(backends.len()).map_err(|_| {
            SkuldError::Validation(format!("{} shards exceeds the maximum", backends.len()))
        })?;
        Ok(ShardSet { router: ShardRouter::new(count)?, backends })
    }

    pub fn single(backend: Arc<B>) -> Self {
        ShardSet { router: ShardRouter { shard_count: 1 }, backends: vec![backend] }
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get(&self, shard_id: ShardId) -> Option<&Arc<B>> {
        self.backends.get(usize::from(shard_id))
    }

    /// The shard owning `grain_id` and its backend.
    pub fn route(&self, grain_id: &GrainId) -> (ShardId, &Arc<B>) {
        let shard_id = self.router.shard_for(grain_id);
        // shard_for is always below the backend count.
        (shard_id, &self.backends[usize::from(shard_id)])
    }

    /// Runs `procedure` on every shard concurrently. Fails as a whole if any
    /// shard fails.
    pub async fn query_all(
        &self,
        procedure: Procedure,
        params: Params,
    ) -> Result<Vec<(ShardId, Vec<ResultSet>)>, SkuldError> {
        let mut calls = Vec::with_capacity(self.backends.len());
        for (i, backend) in self.backends.iter().enumerate() {
            let shard_id = i as ShardId;
            let params = params.clone();
            calls.push(async move {
                backend.query(procedure, params).await.map(|sets| (shard_id, sets)).inspect_err(|e| {
                    tracing::error!(
                        shard_id,
                        backend = %backend.describe(),
                        %procedure,
                        error = %e,
                        "shard query failed"
                    )
                })
            });
        }
        futures::future::try_join_all(calls).await
    }
}
