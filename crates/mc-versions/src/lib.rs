//! Typed Rust client for the upstream server-jar indexes.
//!
//! Covers the three distribution schemes the provisioner understands:
//! PaperMC (build list), Mojang (version manifest → per-version descriptor)
//! and Forge (promotion map → Maven installer).

mod types;

pub use types::*;

use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("version index request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("version index {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Base URLs of the upstream services. Overridable for tests and mirrors.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub paper_api: String,
    pub mojang_manifest: String,
    pub forge_promotions: String,
    pub forge_maven: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            paper_api: "https://api.papermc.io".into(),
            mojang_manifest: "https://launchermeta.mojang.com/mc/game/version_manifest.json".into(),
            forge_promotions:
                "https://files.minecraftforge.net/net/minecraftforge/forge/promotions_slim.json"
                    .into(),
            forge_maven: "https://maven.minecraftforge.net".into(),
        }
    }
}

/// Client for the PaperMC, Mojang and Forge version indexes.
#[derive(Clone)]
pub struct VersionsClient {
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl VersionsClient {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            http: reqwest::Client::new(),
        }
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        endpoint: &'static str,
    ) -> Result<T> {
        let resp = self.http.get(url).send().await?;
        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── PaperMC ──────────────────────────────────────────────────────

    pub async fn paper_versions(&self) -> Result<Vec<String>> {
        let url = format!("{}/v2/projects/paper", self.endpoints.paper_api);
        let project: PaperProject = self.get_json(&url, "paper project").await?;
        Ok(project.versions)
    }

    /// Download URL of the newest build for `version`.
    pub async fn paper_download_url(&self, version: &str) -> Result<String> {
        let base = &self.endpoints.paper_api;
        let url = format!("{base}/v2/projects/paper/versions/{version}");
        let builds: PaperVersion = self.get_json(&url, "paper builds").await?;

        let latest = builds
            .builds
            .last()
            .copied()
            .ok_or_else(|| Error::NotFound(format!("no paper builds available for {version}")))?;

        Ok(format!(
            "{base}/v2/projects/paper/versions/{version}/builds/{latest}/downloads/paper-{version}-{latest}.jar"
        ))
    }

    // ── Vanilla ──────────────────────────────────────────────────────

    pub async fn manifest(&self) -> Result<VersionManifest> {
        self.get_json(&self.endpoints.mojang_manifest, "version manifest")
            .await
    }

    /// Release versions only; snapshots and betas are skipped.
    pub async fn vanilla_versions(&self) -> Result<Vec<String>> {
        let manifest = self.manifest().await?;
        Ok(manifest
            .versions
            .into_iter()
            .filter(|v| v.kind == "release")
            .map(|v| v.id)
            .collect())
    }

    pub async fn vanilla_download_url(&self, version: &str) -> Result<String> {
        let manifest = self.manifest().await?;
        let entry = manifest
            .versions
            .iter()
            .find(|v| v.id == version)
            .ok_or_else(|| Error::NotFound(format!("version {version} not found in manifest")))?;

        let descriptor: VersionDescriptor = self.get_json(&entry.url, "version descriptor").await?;

        descriptor
            .downloads
            .server
            .map(|d| d.url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::NotFound(format!("no server download available for version {version}"))
            })
    }

    // ── Forge ────────────────────────────────────────────────────────

    pub async fn forge_promotions(&self) -> Result<ForgePromotions> {
        self.get_json(&self.endpoints.forge_promotions, "forge promotions")
            .await
    }

    /// Minecraft versions that have a `-latest` or `-recommended` promotion.
    pub async fn forge_versions(&self) -> Result<Vec<String>> {
        let promotions = self.forge_promotions().await?;
        let versions: BTreeSet<String> = promotions
            .promos
            .keys()
            .filter_map(|key| {
                key.strip_suffix("-latest")
                    .or_else(|| key.strip_suffix("-recommended"))
            })
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        Ok(versions.into_iter().collect())
    }

    /// Installer URL for `version`, preferring the recommended promotion.
    pub async fn forge_download_url(&self, version: &str) -> Result<String> {
        let promotions = self.forge_promotions().await?;
        let recommended = format!("{version}-recommended");
        let latest = format!("{version}-latest");

        let forge = promotions
            .promos
            .get(&recommended)
            .or_else(|| promotions.promos.get(&latest))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no forge version found for minecraft {version} (tried {recommended} and {latest})"
                ))
            })?;

        let full = format!("{version}-{forge}");
        Ok(format!(
            "{}/net/minecraftforge/forge/{full}/forge-{full}-installer.jar",
            self.endpoints.forge_maven
        ))
    }
}
