use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::Result;
use crate::types::ServerType;

/// Source of available versions and download URLs per server type.
#[async_trait]
pub trait VersionProvider: Send + Sync + 'static {
    /// Versions the upstream index advertises, in upstream order.
    async fn versions(&self, server_type: ServerType) -> Result<Vec<String>>;

    /// Direct download URL of the server jar (or installer) for `version`.
    async fn download_url(&self, server_type: ServerType, version: &str) -> Result<String>;
}

/// Version provider backed by the public PaperMC, Mojang and Forge indexes.
#[derive(Clone)]
pub struct UpstreamVersions {
    client: mc_versions::VersionsClient,
}

impl UpstreamVersions {
    pub fn new(client: mc_versions::VersionsClient) -> Self {
        Self { client }
    }
}

impl Default for UpstreamVersions {
    fn default() -> Self {
        Self::new(mc_versions::VersionsClient::new(mc_versions::Endpoints::default()))
    }
}

#[async_trait]
impl VersionProvider for UpstreamVersions {
    async fn versions(&self, server_type: ServerType) -> Result<Vec<String>> {
        let versions = match server_type {
            ServerType::Paper => self.client.paper_versions().await?,
            ServerType::Vanilla => self.client.vanilla_versions().await?,
            ServerType::Forge => self.client.forge_versions().await?,
        };
        Ok(versions)
    }

    async fn download_url(&self, server_type: ServerType, version: &str) -> Result<String> {
        let url = match server_type {
            ServerType::Paper => self.client.paper_download_url(version).await?,
            ServerType::Vanilla => self.client.vanilla_download_url(version).await?,
            ServerType::Forge => self.client.forge_download_url(version).await?,
        };
        Ok(url)
    }
}

/// Keeps each server type's version list for `ttl` before asking `inner` again.
///
/// Download URLs are not cached. Failed lookups are not cached either.
pub struct CachedVersions {
    inner: Arc<dyn VersionProvider>,
    ttl: Duration,
    entries: Mutex<HashMap<ServerType, (Instant, Vec<String>)>>,
}

impl CachedVersions {
    pub fn new(inner: Arc<dyn VersionProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, server_type: ServerType) -> Option<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&server_type) {
            Some((fetched, versions)) if fetched.elapsed() < self.ttl => Some(versions.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl VersionProvider for CachedVersions {
    async fn versions(&self, server_type: ServerType) -> Result<Vec<String>> {
        if let Some(versions) = self.cached(server_type) {
            debug!(%server_type, "version list cache hit");
            return Ok(versions);
        }

        debug!(%server_type, "version list cache miss");
        let versions = self.inner.versions(server_type).await?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_type, (Instant::now(), versions.clone()));
        Ok(versions)
    }

    async fn download_url(&self, server_type: ServerType, version: &str) -> Result<String> {
        self.inner.download_url(server_type, version).await
    }
}

/// Release versions for `server_type`, newest first.
pub async fn available_versions(
    provider: &dyn VersionProvider,
    server_type: ServerType,
) -> Result<Vec<String>> {
    let versions = provider.versions(server_type).await?;
    Ok(release_versions(versions))
}

/// Drop pre-releases (anything containing `-`) and sort descending.
pub fn release_versions(versions: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut releases: Vec<String> = versions.into_iter().filter(|v| !v.contains('-')).collect();
    releases.sort_by(|a, b| compare_versions(b, a));
    releases.dedup();
    releases
}

/// Compare dotted versions component-wise as integers.
///
/// Missing and non-numeric components count as zero, so `1.20` equals
/// `1.20.0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');

    loop {
        let (l, r) = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => (l.unwrap_or("0"), r.unwrap_or("0")),
        };

        let ord = component(l).cmp(&component(r));
        if ord != Ordering::Equal {
            return ord;
        }
    }
}

fn component(part: &str) -> u64 {
    part.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticVersions;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn numeric_components_beat_lexical_order() {
        assert_eq!(compare_versions("1.21.11", "1.21.2"), Ordering::Greater);
        assert_eq!(compare_versions("1.20.1", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.20", "1.20.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.8.9", "1.8.10"), Ordering::Less);
    }

    #[test]
    fn pre_releases_are_dropped_and_sorted_descending() {
        let sorted = release_versions(strings(&["1.20.1", "1.21-pre1", "1.21.11"]));
        assert_eq!(sorted, strings(&["1.21.11", "1.20.1"]));
    }

    #[test]
    fn release_candidates_and_pre_releases_are_removed() {
        let sorted = release_versions(strings(&[
            "1.21.11",
            "1.21.11-rc2",
            "1.21.11-pre3",
            "1.20.1",
            "1.20-rc1",
        ]));
        assert_eq!(sorted, strings(&["1.21.11", "1.20.1"]));
    }

    #[tokio::test]
    async fn available_versions_filters_provider_output() {
        let provider = StaticVersions::new(strings(&["1.19.4", "1.20.1", "1.20.2-rc1", "1.20.4"]));
        let versions = available_versions(&provider, ServerType::Paper).await.unwrap();
        assert_eq!(versions, strings(&["1.20.4", "1.20.1", "1.19.4"]));
    }

    #[tokio::test(start_paused = true)]
    async fn version_lists_are_cached_per_type_until_expiry() {
        let upstream = Arc::new(StaticVersions::new(strings(&["1.20.1"])));
        let cached = CachedVersions::new(upstream.clone(), Duration::from_secs(60));

        cached.versions(ServerType::Paper).await.unwrap();
        cached.versions(ServerType::Paper).await.unwrap();
        assert_eq!(upstream.version_calls(), 1);

        cached.versions(ServerType::Forge).await.unwrap();
        assert_eq!(upstream.version_calls(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        let versions = cached.versions(ServerType::Paper).await.unwrap();
        assert_eq!(versions, strings(&["1.20.1"]));
        assert_eq!(upstream.version_calls(), 3);

        cached.download_url(ServerType::Paper, "1.20.1").await.unwrap();
        assert_eq!(upstream.version_calls(), 3);
    }

    #[tokio::test]
    async fn upstream_routes_by_server_type() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/forge/promotions_slim.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "promos": { "1.20.1-recommended": "47.2.0", "1.19.2-latest": "43.3.0" }
            })))
            .mount(&server)
            .await;

        let uri = server.uri();
        let provider = UpstreamVersions::new(mc_versions::VersionsClient::new(
            mc_versions::Endpoints {
                paper_api: uri.clone(),
                mojang_manifest: format!("{uri}/manifest.json"),
                forge_promotions: format!("{uri}/forge/promotions_slim.json"),
                forge_maven: format!("{uri}/maven"),
            },
        ));

        let versions = available_versions(&provider, ServerType::Forge).await.unwrap();
        assert_eq!(versions, strings(&["1.20.1", "1.19.2"]));
    }
}
