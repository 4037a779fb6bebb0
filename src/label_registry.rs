//! TTL-cached view of a provider's remote labels with serialized creation
//!
//! Each provider client owns one [`LabelRegistry`]. All create-or-fetch
//! sequences for that client run one at a time behind a FIFO async mutex, so
//! this process never issues two creates for the same name. Creations by
//! other actors surface as conflicts, which force a refetch of the remote
//! label list before giving up.
//!
//! The mutex is in-process only. Replicas sharing a mailbox still rely on
//! conflict recovery.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{Label, RemoteLabelHandle};

/// Default lifetime of a fetched label list
pub const DEFAULT_LABEL_TTL: Duration = Duration::from_secs(300);

/// Remote label operations a provider exposes to its registry
#[async_trait]
pub trait RemoteLabelApi: Send + Sync {
    /// Every label currently defined on the remote account
    async fn list_labels(&self) -> Result<Vec<RemoteLabelHandle>>;

    /// Create a label; an existing name must fail with
    /// [`PipelineError::Conflict`]
    async fn create_label(&self, label: &Label) -> Result<RemoteLabelHandle>;
}

/// Lowercase name -> handle, with the instant the view goes stale
#[derive(Debug, Default)]
struct LabelCache {
    labels: HashMap<String, RemoteLabelHandle>,
    expires_at: Option<Instant>,
}

impl LabelCache {
    fn is_stale(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now >= expires_at)
    }

    fn get(&self, name: &str) -> Option<&RemoteLabelHandle> {
        self.labels.get(&name.to_lowercase())
    }

    fn insert(&mut self, name: &str, handle: RemoteLabelHandle) {
        self.labels.insert(name.to_lowercase(), handle);
    }

    fn replace(&mut self, handles: Vec<RemoteLabelHandle>, expires_at: Instant) {
        self.labels = handles
            .into_iter()
            .map(|handle| (handle.name.to_lowercase(), handle))
            .collect();
        self.expires_at = Some(expires_at);
    }

    fn expire(&mut self) {
        self.expires_at = None;
    }
}

#[derive(Debug)]
pub struct LabelRegistry {
    provider: String,
    ttl: Duration,
    cache: Mutex<LabelCache>,
}

impl LabelRegistry {
    pub fn new(provider: impl Into<String>) -> Self {
        Self::with_ttl(provider, DEFAULT_LABEL_TTL)
    }

    pub fn with_ttl(provider: impl Into<String>, ttl: Duration) -> Self {
        Self {
            provider: provider.into(),
            ttl,
            cache: Mutex::new(LabelCache::default()),
        }
    }

    /// Resolve `label` to its remote handle, creating it remotely if needed.
    ///
    /// Callers queue in arrival order; the lock is released on every exit.
    pub async fn get_or_create(
        &self,
        api: &dyn RemoteLabelApi,
        label: &Label,
    ) -> Result<RemoteLabelHandle> {
        let mut cache = self.cache.lock().await;

        if cache.is_stale(Instant::now()) {
            self.refetch(api, &mut cache).await?;
        }

        if let Some(handle) = cache.get(&label.name) {
            debug!(provider = %self.provider, label = %label.name, "Label cache hit");
            return Ok(handle.clone());
        }

        match api.create_label(label).await {
            Ok(handle) => {
                info!(
                    provider = %self.provider,
                    label = %label.name,
                    id = %handle.id,
                    "Created remote label"
                );
                cache.insert(&label.name, handle.clone());
                Ok(handle)
            }
            Err(PipelineError::Conflict(reason)) => {
                warn!(
                    provider = %self.provider,
                    label = %label.name,
                    "Label already exists remotely ({}), refetching",
                    reason
                );
                cache.expire();
                self.refetch(api, &mut cache).await?;
                cache
                    .get(&label.name)
                    .cloned()
                    .ok_or_else(|| PipelineError::LabelResolution(label.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Every known remote label, refetching first if the view is stale
    pub async fn snapshot(&self, api: &dyn RemoteLabelApi) -> Result<Vec<RemoteLabelHandle>> {
        let mut cache = self.cache.lock().await;
        if cache.is_stale(Instant::now()) {
            self.refetch(api, &mut cache).await?;
        }
        Ok(cache.labels.values().cloned().collect())
    }

    /// Mark the cached view stale; the next lookup refetches
    pub async fn invalidate(&self) {
        self.cache.lock().await.expire();
    }

    /// Handles currently cached, sorted by name
    pub async fn cached(&self) -> Vec<RemoteLabelHandle> {
        let cache = self.cache.lock().await;
        let mut handles: Vec<_> = cache.labels.values().cloned().collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    async fn refetch(&self, api: &dyn RemoteLabelApi, cache: &mut LabelCache) -> Result<()> {
        let handles = api.list_labels().await?;
        debug!(
            provider = %self.provider,
            count = handles.len(),
            "Refetched remote labels"
        );
        cache.replace(handles, Instant::now() + self.ttl);
        Ok(())
    }
}
