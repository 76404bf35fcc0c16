//! Resolved Grafana data-source ids.
//!
//! A data source referenced by uid or name is looked up through the HTTP API
//! once per Grafana instance and the numeric id is reused by later queries.

use std::future::Future;
use std::time::Duration;

use moka::future::Cache;

use loadscribe_core::config::DatasourceRef;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct DatasourceKey {
    base_url: String,
    uid: Option<String>,
    name: Option<String>,
}

impl DatasourceKey {
    fn new(base_url: &str, reference: &DatasourceRef) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            uid: reference.uid.clone().filter(|u| !u.is_empty()),
            name: reference.name.clone().filter(|n| !n.is_empty()),
        }
    }
}

/// Data-source ids keyed by Grafana base URL and reference. Clones share entries.
#[derive(Clone)]
pub struct DatasourceCache {
    ids: Cache<DatasourceKey, u64>,
}

impl DatasourceCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        Self {
            ids: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn cached(&self, base_url: &str, reference: &DatasourceRef) -> Option<u64> {
        self.ids.get(&DatasourceKey::new(base_url, reference)).await
    }

    /// Return the cached id, or run `resolve` and remember what it returns.
    /// Failed lookups are not cached.
    pub async fn get_or_resolve<F, E>(
        &self,
        base_url: &str,
        reference: &DatasourceRef,
        resolve: F,
    ) -> Result<u64, E>
    where
        F: Future<Output = Result<u64, E>>,
    {
        let key = DatasourceKey::new(base_url, reference);
        if let Some(id) = self.ids.get(&key).await {
            return Ok(id);
        }
        let id = resolve.await?;
        self.ids.insert(key, id).await;
        Ok(id)
    }
}

impl Default for DatasourceCache {
    fn default() -> Self {
        Self::new(64, Duration::from_secs(3600))
    }
}

impl std::fmt::Debug for DatasourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasourceCache")
            .field("entries", &self.ids.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(uid: &str, name: &str) -> DatasourceRef {
        DatasourceRef {
            id: None,
            uid: Some(uid.to_string()),
            name: Some(name.to_string()),
        }
    }

    #[tokio::test]
    async fn test_resolves_once_per_reference() {
        let cache = DatasourceCache::default();
        let prom = reference("prom", "");

        let first: Result<u64, String> = cache
            .get_or_resolve("http://grafana:3000/", &prom, async { Ok(7) })
            .await;
        assert_eq!(first, Ok(7));

        // trailing slash does not matter; the resolver is not run again
        let second: Result<u64, String> = cache
            .get_or_resolve("http://grafana:3000", &prom, async { Err("called".to_string()) })
            .await;
        assert_eq!(second, Ok(7));

        let by_name = reference("", "Prometheus");
        assert_eq!(cache.cached("http://grafana:3000", &by_name).await, None);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = DatasourceCache::default();
        let prom = reference("prom", "");

        let failed: Result<u64, &str> = cache
            .get_or_resolve("http://g", &prom, async { Err("404") })
            .await;
        assert_eq!(failed, Err("404"));
        assert_eq!(cache.cached("http://g", &prom).await, None);

        let retried: Result<u64, &str> = cache.get_or_resolve("http://g", &prom, async { Ok(3) }).await;
        assert_eq!(retried, Ok(3));
    }
}
