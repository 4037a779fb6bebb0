//! Registry of active provider clients and bulk operations over them

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::{join_all, try_join_all};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::audit::{AuditLog, ObjectType};
use crate::categorizer::CategorizationService;
use crate::error::{PipelineError, Result};
use crate::models::Message;
use crate::providers::{EmailProvider, FetchQuery};

/// Selector matching every registered provider
pub const ALL_PROVIDERS: &str = "*";

/// Counts from a bulk categorization run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub fetched: usize,
    pub categorized: usize,
    /// Already carried a vocabulary label
    pub unchanged: usize,
    /// Present in the audit log for the window
    pub skipped: usize,
    pub failed: usize,
}

impl RunReport {
    fn merge(mut self, other: RunReport) -> RunReport {
        self.fetched += other.fetched;
        self.categorized += other.categorized;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self
    }
}

/// Owns the active provider clients; the only place they are added or removed
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn EmailProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`, returning any client it replaces
    pub async fn add(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn EmailProvider>,
    ) -> Option<Arc<dyn EmailProvider>> {
        let name = name.into();
        info!(provider = %name, "Registered email provider");
        self.providers.write().await.insert(name, provider)
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<dyn EmailProvider>> {
        let removed = self.providers.write().await.remove(name);
        if removed.is_some() {
            info!(provider = %name, "Removed email provider");
        }
        removed
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn EmailProvider>> {
        self.providers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("Email provider {} not found", name)))
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// `*` selects every provider; anything else must be a registered name
    pub async fn select(&self, selector: &str) -> Result<Vec<(String, Arc<dyn EmailProvider>)>> {
        if selector == ALL_PROVIDERS {
            let providers = self.providers.read().await;
            let mut selected: Vec<_> = providers
                .iter()
                .map(|(name, provider)| (name.clone(), provider.clone()))
                .collect();
            selected.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(selected)
        } else {
            Ok(vec![(selector.to_string(), self.get(selector).await?)])
        }
    }

    /// Fetch from one or all providers concurrently and flatten the results.
    /// No ordering is guaranteed across providers.
    pub async fn fetch_last_emails(
        &self,
        selector: &str,
        count: usize,
        window_hours: u32,
    ) -> Result<Vec<Message>> {
        let query = FetchQuery::new(count, window_hours);
        let per_provider = self.fetch_per_provider(selector, query).await?;
        Ok(per_provider
            .into_iter()
            .flat_map(|(_, messages)| messages)
            .collect())
    }

    async fn fetch_per_provider(
        &self,
        selector: &str,
        query: FetchQuery,
    ) -> Result<Vec<(Arc<dyn EmailProvider>, Vec<Message>)>> {
        let selected = self.select(selector).await?;
        try_join_all(selected.into_iter().map(|(_, provider)| async move {
            let messages = provider.fetch_last_emails(query).await?;
            Ok::<_, PipelineError>((provider, messages))
        }))
        .await
    }

    /// Fetch, then categorize every message through the provider it came from
    pub async fn fetch_and_categorize(
        &self,
        categorizer: &CategorizationService,
        selector: &str,
        query: FetchQuery,
    ) -> Result<RunReport> {
        let fetched = self.fetch_per_provider(selector, query).await?;
        let seen = HashSet::new();
        let reports = join_all(
            fetched
                .into_iter()
                .map(|(provider, messages)| categorize_all(categorizer, provider, messages, &seen)),
        )
        .await;
        Ok(reports.into_iter().fold(RunReport::default(), RunReport::merge))
    }

    /// Like [`fetch_and_categorize`](Self::fetch_and_categorize), but skips
    /// messages already in the audit log for the same window
    pub async fn process_recent(
        &self,
        categorizer: &CategorizationService,
        audit: &dyn AuditLog,
        selector: &str,
        query: FetchQuery,
    ) -> Result<RunReport> {
        let since = Utc::now() - ChronoDuration::hours(query.window_hours as i64);
        let seen: HashSet<(String, String)> = audit
            .find_since(since, Some(ObjectType::Email))
            .await?
            .into_iter()
            .map(|record| (record.thread_id, record.message_id))
            .collect();

        let fetched = self.fetch_per_provider(selector, query).await?;
        let reports = join_all(
            fetched
                .into_iter()
                .map(|(provider, messages)| categorize_all(categorizer, provider, messages, &seen)),
        )
        .await;
        Ok(reports.into_iter().fold(RunReport::default(), RunReport::merge))
    }

    /// Start push subscriptions on every provider. Every provider is tried;
    /// the first failure is returned after all attempts.
    pub async fn listen_all(&self) -> Result<usize> {
        self.for_each_provider("listen", |provider| async move {
            provider.listen_for_incoming_emails().await
        })
        .await
    }

    /// Stop push subscriptions on every provider
    pub async fn stop_all(&self) -> Result<usize> {
        self.for_each_provider("stop listening", |provider| async move {
            provider.stop_listening().await
        })
        .await
    }

    async fn for_each_provider<F, Fut>(&self, action: &str, f: F) -> Result<usize>
    where
        F: Fn(Arc<dyn EmailProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let selected = self.select(ALL_PROVIDERS).await?;
        let results = join_all(
            selected
                .iter()
                .map(|(_, provider)| f(provider.clone())),
        )
        .await;

        let mut first_error = None;
        let mut succeeded = 0;
        for ((name, _), result) in selected.iter().zip(results) {
            match result {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    error!(provider = %name, "Failed to {}: {}", action, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(succeeded),
        }
    }
}

async fn categorize_all(
    categorizer: &CategorizationService,
    provider: Arc<dyn EmailProvider>,
    messages: Vec<Message>,
    seen: &HashSet<(String, String)>,
) -> RunReport {
    let mut report = RunReport {
        fetched: messages.len(),
        ..RunReport::default()
    };

    for message in messages {
        if seen.contains(&(message.thread_id.clone(), message.id.clone())) {
            report.skipped += 1;
            continue;
        }
        if message.is_categorized() {
            report.unchanged += 1;
            continue;
        }
        let id = message.id.clone();
        match categorizer.categorize(provider.as_ref(), message).await {
            Ok(_) => report.categorized += 1,
            Err(e) => {
                warn!(provider = %provider.name(), message_id = %id, "Categorization failed: {}", e);
                report.failed += 1;
            }
        }
    }
    report
}
