use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::artifacts::ArtifactResolver;
use crate::policy::{LAUNCH_SCRIPT, jar_context_path};
use crate::types::ProvisionRequest;
use crate::{ContainerEngine, Error, Result};

/// Ensures images exist, building each tag at most once at a time.
///
/// Concurrent callers for the same tag serialize on a per-tag async mutex
/// held across the whole check-then-build, so only the first one builds and
/// the rest find the image present.
pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    artifacts: Arc<dyn ArtifactResolver>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn ContainerEngine>, artifacts: Arc<dyn ArtifactResolver>) -> Self {
        Self {
            engine,
            artifacts,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, tag: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(tag.to_string()).or_default().clone()
    }

    /// Build `tag` from `definition` unless the engine already has it.
    ///
    /// Returns `true` when this call performed the build.
    pub async fn ensure_image(
        &self,
        tag: &str,
        definition: &str,
        request: &ProvisionRequest,
    ) -> Result<bool> {
        let lock = self.lock_for(tag);
        let _guard = lock.lock().await;

        if self.engine.image_exists(tag).await? {
            info!(tag, "image already present");
            return Ok(false);
        }

        let server_type = request.server_type.parse()?;
        let artifact = self
            .artifacts
            .resolve(server_type, &request.server_version)
            .await?;

        let jar = tokio::fs::read(&artifact.path)
            .await
            .map_err(|e| Error::io(&artifact.path, e))?;
        let context = build_context(
            definition,
            &jar_context_path(&request.server_type, &request.server_version),
            &jar,
        )
        .map_err(|e| Error::io("<build context>", e))?;

        self.engine
            .build_image(tag, context)
            .await
            .map_err(|e| e.context(format!("building image {tag}")))?;
        Ok(true)
    }
}

/// In-memory tar with `Dockerfile`, `start.sh` and the jar at `jar_path`.
pub fn build_context(definition: &str, jar_path: &str, jar: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, "Dockerfile", definition.as_bytes(), 0o644)?;
    append(&mut builder, "start.sh", LAUNCH_SCRIPT.as_bytes(), 0o755)?;
    append(&mut builder, jar_path, jar, 0o644)?;
    builder.into_inner()
}

fn append(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    data: &[u8],
    mode: u32,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}
