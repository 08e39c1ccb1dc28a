use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::{JobConfig, WebSearchConfig};
use crate::error::StepError;
use crate::key::StepKey;
use crate::services::SearchProvider;
use crate::step::{Step, StepContext, StepResult, object};

const INITIAL_CACHE_CAPACITY: usize = 256;

/// Runs configured queries against the search provider.
///
/// Serialized results are cached per query for the lifetime of this step
/// instance; the config's TTL and capacity apply on each run.
pub struct WebSearchStep {
    provider: Option<Arc<dyn SearchProvider>>,
    cache: Mutex<TtlCache<String, Vec<JsonValue>>>,
}

impl WebSearchStep {
    pub fn new(provider: Option<Arc<dyn SearchProvider>>) -> Self {
        Self {
            provider,
            cache: Mutex::new(TtlCache::new(INITIAL_CACHE_CAPACITY)),
        }
    }

    /// The cache holds plain data, so a poisoned lock is still usable.
    fn cache(&self) -> MutexGuard<'_, TtlCache<String, Vec<JsonValue>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached_queries(&self) -> usize {
        self.cache().len()
    }
}

#[async_trait]
impl Step for WebSearchStep {
    type Config = WebSearchConfig;

    const KEY: StepKey = StepKey::WebSearch;

    async fn run(&self, ctx: &StepContext<'_>, config: &Self::Config) -> Result<StepResult, StepError> {
        let Some(provider) = self.provider.as_deref() else {
            return Ok(StepResult::failure("No active web search provider configured."));
        };
        if config.queries.is_empty() {
            return Ok(StepResult::skipped_with(
                "No web search queries provided.",
                object(json!({"results": [], "errors": [], "query_count": 0})),
            ));
        }

        let ttl = Duration::from_secs(config.cache_ttl_seconds);
        let now = Instant::now().into_std();
        {
            let mut cache = self.cache();
            cache.set_capacity(config.max_cache_entries as usize, now);
            cache.evict(now);
        }

        let mut results: Vec<JsonValue> = Vec::new();
        let mut errors: Vec<JsonValue> = Vec::new();
        for query in &config.queries {
            let cached = self.cache().get(query, now);
            if let Some(hit) = cached {
                debug!(run_id = %ctx.run_id, query = %query, "web search cache hit");
                results.extend(hit);
                continue;
            }

            match provider.search(query).await {
                Ok(hits) => {
                    let serialized: Vec<JsonValue> = hits
                        .into_iter()
                        .take(config.max_results as usize)
                        .map(|h| {
                            json!({
                                "query": query,
                                "title": h.title,
                                "url": h.url,
                                "snippet": h.snippet,
                            })
                        })
                        .collect();
                    results.extend(serialized.iter().cloned());
                    self.cache().insert(query.clone(), serialized, ttl, now);
                }
                Err(e) => {
                    warn!(run_id = %ctx.run_id, query = %query, error = %e, "web search query failed");
                    errors.push(json!({"query": query, "error": e.to_string()}));
                }
            }
        }

        if results.is_empty() && !errors.is_empty() {
            return Ok(StepResult::failure(format!(
                "Web search failed for all queries. errors={}",
                JsonValue::Array(errors)
            )));
        }

        Ok(StepResult::success(object(json!({
            "results": results,
            "errors": errors,
            "query_count": config.queries.len(),
            "provider_type": provider.provider_type(),
        }))))
    }

    fn preflight(&self, step_id: &str, _config: &Self::Config, _job_config: &JobConfig) -> Vec<String> {
        if self.provider.is_none() {
            return vec![format!("{step_id}: no active web search provider configured.")];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::services::SearchHit;
    use crate::steps::testing::Fixture;
    use forgejobs_core::StepStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for FakeProvider {
        fn provider_type(&self) -> &str {
            "fake"
        }

        async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query == "fail" {
                return Err(ServiceError::new("503 service temporarily unavailable"));
            }
            Ok((0..10)
                .map(|i| SearchHit {
                    title: format!("{query} {i}"),
                    url: format!("https://example.com/{i}"),
                    snippet: "snippet".into(),
                })
                .collect())
        }
    }

    fn config(queries: &[&str]) -> WebSearchConfig {
        WebSearchConfig {
            queries: queries.iter().map(|q| q.to_string()).collect(),
            max_results: 5,
            cache_ttl_seconds: 300,
            max_cache_entries: 256,
            max_attempts: 2,
        }
    }

    fn step() -> (WebSearchStep, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::default());
        (WebSearchStep::new(Some(provider.clone())), provider)
    }

    #[tokio::test]
    async fn no_queries_skips_with_empty_output() {
        let (step, _) = step();
        let fx = Fixture::new();
        let result = step.run(&fx.ctx(), &config(&[])).await.unwrap();
        assert_eq!(result.status(), StepStatus::Skipped);
        assert_eq!(
            serde_json::Value::Object(result.output().unwrap().clone()),
            json!({"results": [], "errors": [], "query_count": 0})
        );
    }

    #[tokio::test]
    async fn results_are_capped_and_cached_per_query() {
        let (step, provider) = step();
        let fx = Fixture::new();
        let first = step.run(&fx.ctx(), &config(&["rust"])).await.unwrap();
        assert_eq!(first.output().unwrap()["results"].as_array().unwrap().len(), 5);

        let second = step.run(&fx.ctx(), &config(&["rust"])).await.unwrap();
        assert_eq!(second.output(), first.output());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(step.cached_queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cache_entries_are_refetched() {
        let (step, provider) = step();
        let fx = Fixture::new();
        let mut cfg = config(&["rust"]);
        cfg.cache_ttl_seconds = 10;
        step.run(&fx.ctx(), &cfg).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        step.run(&fx.ctx(), &cfg).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn huge_ttl_still_caches() {
        let (step, provider) = step();
        let fx = Fixture::new();
        let mut cfg = config(&["rust"]);
        cfg.cache_ttl_seconds = u64::MAX;
        let first = step.run(&fx.ctx(), &cfg).await.unwrap();
        assert_eq!(first.status(), StepStatus::Success);
        step.run(&fx.ctx(), &cfg).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_is_bounded_by_config_capacity() {
        let (step, _) = step();
        let fx = Fixture::new();
        let mut cfg = config(&["a", "b", "c"]);
        cfg.max_cache_entries = 2;
        step.run(&fx.ctx(), &cfg).await.unwrap();
        assert_eq!(step.cached_queries(), 2);
    }

    #[tokio::test]
    async fn partial_failure_succeeds_total_failure_fails() {
        let (step, _) = step();
        let fx = Fixture::new();
        let partial = step.run(&fx.ctx(), &config(&["rust", "fail"])).await.unwrap();
        assert_eq!(partial.status(), StepStatus::Success);
        assert_eq!(partial.output().unwrap()["errors"][0]["query"], json!("fail"));

        let total = step.run(&fx.ctx(), &config(&["fail"])).await.unwrap();
        assert_eq!(total.status(), StepStatus::Failure);
        assert!(total.error_message().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn missing_provider_fails() {
        let step = WebSearchStep::new(None);
        let fx = Fixture::new();
        let result = step.run(&fx.ctx(), &config(&["rust"])).await.unwrap();
        assert_eq!(result, StepResult::failure("No active web search provider configured."));
    }
}
