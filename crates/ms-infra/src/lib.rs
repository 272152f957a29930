pub mod artifacts;
pub mod docker;
pub mod image;
pub mod orchestrator;
pub mod policy;
pub mod readiness;
pub mod types;
pub mod versions;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use types::{ContainerId, ContainerSpec};

pub use orchestrator::{Orchestrator, ProgressReporter, ProvisionFailure};
pub use types::{ProvisionRequest, ProvisionState, Stage};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("docker engine error: {0}")]
    Docker(#[from] docker_api::Error),

    #[error("version index error: {0}")]
    Versions(#[from] mc_versions::Error),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unsupported server type: {0}")]
    UnsupportedServerType(String),

    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("download of {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned {status}")]
    DownloadStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server reported a fatal error during startup: {marker}")]
    HealthFatal { marker: String },

    #[error("server did not become ready within {}s", timeout.as_secs())]
    HealthTimeout { timeout: Duration },

    #[error("{health}; rollback also failed: {rollback}")]
    RollbackFailed {
        health: Box<Error>,
        rollback: Box<Error>,
    },

    #[error("no host ports left to allocate")]
    PortsExhausted,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap with a short description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Capability set of the container engine the provisioner drives.
///
/// The Docker implementation lives in [`docker`]; tests substitute
/// [`testing::MockEngine`].
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Whether an image with this tag is already present.
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Build `tag` from an in-memory tar build context.
    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()>;

    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Last `tail` lines of combined stdout/stderr, without transport framing.
    async fn container_logs(&self, id: &ContainerId, tail: usize) -> Result<String>;

    /// Forcibly remove a container, running or not.
    async fn remove_container(&self, id: &ContainerId) -> Result<()>;
}
