//! In-memory collaborators for tests in this crate and downstream crates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::artifacts::ArtifactResolver;
use crate::types::{ArtifactInfo, ContainerId, ContainerSpec, ProvisionRequest, ServerType};
use crate::versions::VersionProvider;
use crate::{ContainerEngine, Error, Result};

/// A well-formed request for `server_type`/`version`/`plan` with four players.
pub fn request(server_type: &str, version: &str, plan: &str) -> ProvisionRequest {
    ProvisionRequest {
        name: "test server".into(),
        server_type: server_type.into(),
        server_version: version.into(),
        region: "local".into(),
        players_count: 4,
        plan_type: plan.into(),
        difficulty: "normal".into(),
        online_mode: true,
        request_id: None,
        server_id: None,
    }
}

fn engine_error(endpoint: &'static str) -> Error {
    Error::Docker(docker_api::Error::Api {
        endpoint,
        status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        body: "injected failure".into(),
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Container engine ─────────────────────────────────────────────────

/// Container engine that records calls and replays scripted logs.
///
/// Each `container_logs` call returns the next scripted snapshot; the last
/// one repeats once the script is exhausted.
#[derive(Default)]
pub struct MockEngine {
    images: Mutex<HashSet<String>>,
    created: Mutex<Vec<ContainerSpec>>,
    logs: Mutex<Vec<String>>,
    build_delay: Option<Duration>,
    builds: AtomicUsize,
    starts: AtomicUsize,
    removes: AtomicUsize,
    log_calls: AtomicUsize,
    fail_builds: AtomicBool,
    fail_starts: AtomicBool,
    fail_removes: AtomicBool,
    fail_logs: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn add_image(&self, tag: &str) {
        lock(&self.images).insert(tag.to_string());
    }

    pub fn script_logs<I, S>(&self, snapshots: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *lock(&self.logs) = snapshots.into_iter().map(Into::into).collect();
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    pub fn build_calls(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        lock(&self.created).clone()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(lock(&self.images).contains(tag))
    }

    async fn build_image(&self, tag: &str, _context: Vec<u8>) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(Error::Docker(docker_api::Error::Build {
                tag: tag.to_string(),
                message: "injected failure".into(),
            }));
        }
        lock(&self.images).insert(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let mut created = lock(&self.created);
        created.push(spec.clone());
        Ok(ContainerId(format!("container-{}", created.len())))
    }

    async fn start_container(&self, _id: &ContainerId) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(engine_error("start container"));
        }
        Ok(())
    }

    async fn container_logs(&self, _id: &ContainerId, _tail: usize) -> Result<String> {
        let call = self.log_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(engine_error("container logs"));
        }
        let logs = lock(&self.logs);
        Ok(logs
            .get(call)
            .or_else(|| logs.last())
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_container(&self, _id: &ContainerId) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(engine_error("remove container"));
        }
        Ok(())
    }
}

// ── Artifacts and versions ───────────────────────────────────────────

/// Resolver that writes a placeholder jar into a private temp directory.
pub struct StubArtifacts {
    dir: tempfile::TempDir,
    resolves: AtomicUsize,
}

impl StubArtifacts {
    /// Panics if no temp directory can be created.
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir for stub artifacts"),
            resolves: AtomicUsize::new(0),
        }
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl Default for StubArtifacts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactResolver for StubArtifacts {
    async fn resolve(&self, server_type: ServerType, version: &str) -> Result<ArtifactInfo> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("{server_type}-{version}.jar"));
        let already_cached = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !already_cached {
            tokio::fs::write(&path, b"stub jar")
                .await
                .map_err(|e| Error::io(&path, e))?;
        }
        Ok(ArtifactInfo {
            path,
            already_cached,
        })
    }
}

/// Version provider with a fixed list for every server type.
///
/// Download URLs are `<base>/<type>-<version>.jar`.
pub struct StaticVersions {
    versions: Vec<String>,
    download_base: String,
    version_calls: AtomicUsize,
}

impl StaticVersions {
    pub fn new(versions: Vec<String>) -> Self {
        Self {
            versions,
            download_base: "http://127.0.0.1:9".into(),
            version_calls: AtomicUsize::new(0),
        }
    }

    pub fn version_calls(&self) -> usize {
        self.version_calls.load(Ordering::SeqCst)
    }

    pub fn with_download_base(mut self, base: impl Into<String>) -> Self {
        self.download_base = base.into();
        self
    }
}

#[async_trait]
impl VersionProvider for StaticVersions {
    async fn versions(&self, _server_type: ServerType) -> Result<Vec<String>> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.versions.clone())
    }

    async fn download_url(&self, server_type: ServerType, version: &str) -> Result<String> {
        Ok(format!("{}/{server_type}-{version}.jar", self.download_base))
    }
}
