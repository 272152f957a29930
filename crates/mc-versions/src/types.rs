use serde::Deserialize;
use std::collections::HashMap;

// ── PaperMC ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PaperProject {
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperVersion {
    pub version: String,
    pub builds: Vec<u32>,
}

// ── Mojang launcher manifest ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    pub latest: LatestVersions,
    pub versions: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatestVersions {
    pub release: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionDescriptor {
    pub downloads: Downloads,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Downloads {
    #[serde(default)]
    pub server: Option<Download>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Download {
    pub url: String,
}

// ── Forge ────────────────────────────────────────────────────────────

/// `promotions_slim.json`: keys look like `1.20.1-recommended` / `1.20.1-latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct ForgePromotions {
    pub promos: HashMap<String, String>,
}
