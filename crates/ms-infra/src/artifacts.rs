use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::types::{ArtifactInfo, ServerType};
use crate::versions::VersionProvider;
use crate::{Error, Result};

/// Resolves a server jar for a (type, version) pair to a file on local disk.
#[async_trait]
pub trait ArtifactResolver: Send + Sync + 'static {
    async fn resolve(&self, server_type: ServerType, version: &str) -> Result<ArtifactInfo>;
}

/// Jar cache under `<assets_root>/executables`, filled from upstream on miss.
pub struct ArtifactCache {
    assets_root: PathBuf,
    versions: Arc<dyn VersionProvider>,
    http: reqwest::Client,
}

impl ArtifactCache {
    pub fn new(assets_root: impl Into<PathBuf>, versions: Arc<dyn VersionProvider>) -> Self {
        Self {
            assets_root: assets_root.into(),
            versions,
            http: reqwest::Client::new(),
        }
    }

    pub fn assets_root(&self) -> &Path {
        &self.assets_root
    }

    /// Cache location for a jar; the file name is `<type>-<version>.jar`.
    pub fn artifact_path(&self, server_type: ServerType, version: &str) -> PathBuf {
        self.assets_root
            .join("executables")
            .join(format!("{server_type}-{version}.jar"))
    }

    /// Download into a uniquely named sibling file and rename it into place,
    /// so concurrent downloads of one jar never share a partial file and
    /// readers only ever see a complete jar.
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::io(dir, e))?;
        }

        let partial = dest.with_extension(format!("jar.{}.part", uuid::Uuid::new_v4().simple()));
        let result = self.fetch_to(url, &partial).await;

        match result {
            Ok(()) => tokio::fs::rename(&partial, dest)
                .await
                .map_err(|e| Error::io(dest, e)),
            Err(err) => {
                match tokio::fs::remove_file(&partial).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        warn!(path = %partial.display(), error = %e, "failed to remove partial download");
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    async fn fetch_to(&self, url: &str, partial: &Path) -> Result<()> {
        let download_err = |source| Error::Download {
            url: url.to_string(),
            source,
        };

        let mut resp = self.http.get(url).send().await.map_err(download_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::DownloadStatus {
                url: url.to_string(),
                status,
            });
        }

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| Error::io(partial, e))?;
        while let Some(chunk) = resp.chunk().await.map_err(download_err)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(partial, e))?;
        }
        file.flush().await.map_err(|e| Error::io(partial, e))?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactResolver for ArtifactCache {
    async fn resolve(&self, server_type: ServerType, version: &str) -> Result<ArtifactInfo> {
        let path = self.artifact_path(server_type, version);

        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::io(&path, e))?
        {
            info!(%server_type, version, path = %path.display(), "artifact cache hit");
            return Ok(ArtifactInfo {
                path,
                already_cached: true,
            });
        }

        let url = self
            .versions
            .download_url(server_type, version)
            .await
            .map_err(|e| e.context(format!("resolving download url for {server_type} {version}")))?;

        info!(%server_type, version, %url, "downloading artifact");
        self.download(&url, &path).await?;
        info!(%server_type, version, path = %path.display(), "artifact downloaded");

        Ok(ArtifactInfo {
            path,
            already_cached: false,
        })
    }
}
