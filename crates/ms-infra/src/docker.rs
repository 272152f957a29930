use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::types::{ContainerId, ContainerSpec};
use crate::{ContainerEngine, Result};

/// Docker Engine backed container engine.
///
/// Delegates to `docker_api::DockerClient` for all HTTP calls.
#[derive(Clone)]
pub struct DockerEngine {
    client: docker_api::DockerClient,
}

impl DockerEngine {
    /// `host` is a `DOCKER_HOST`-style address, e.g. `tcp://127.0.0.1:2375`.
    pub fn new(host: impl AsRef<str>) -> Self {
        Self {
            client: docker_api::DockerClient::new(host),
        }
    }

    fn create_request(spec: &ContainerSpec) -> docker_api::CreateContainerRequest {
        let port_key = format!("{}/tcp", spec.container_port);

        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();

        docker_api::CreateContainerRequest {
            image: spec.image.clone(),
            env,
            exposed_ports: HashMap::from([(port_key.clone(), docker_api::EmptyObject {})]),
            labels: spec.labels.clone(),
            host_config: docker_api::HostConfig {
                port_bindings: HashMap::from([(
                    port_key,
                    vec![docker_api::PortBinding {
                        host_ip: "0.0.0.0".into(),
                        host_port: spec.host_port.to_string(),
                    }],
                )]),
                memory: spec.memory_bytes,
                nano_cpus: spec.nano_cpus,
                restart_policy: docker_api::RestartPolicy::unless_stopped(),
            },
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.client.inspect_image(tag).await?.is_some())
    }

    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()> {
        info!(tag, context_bytes = context.len(), "building image");
        self.client
            .build_image(tag, context, |line| {
                info!(target: "ms_infra::build", tag, "{line}");
            })
            .await?;
        info!(tag, "image built");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let resp = self
            .client
            .create_container(&spec.name, &Self::create_request(spec))
            .await?;
        for warning in resp.warnings.iter().flatten() {
            debug!(container = %spec.name, warning, "engine warning on create");
        }
        info!(container = %spec.name, id = %resp.id, host_port = spec.host_port, "container created");
        Ok(ContainerId(resp.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.client.start_container(&id.0).await?;
        info!(%id, "container started");
        Ok(())
    }

    async fn container_logs(&self, id: &ContainerId, tail: usize) -> Result<String> {
        Ok(self.client.container_logs(&id.0, tail).await?)
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        self.client.remove_container(&id.0).await?;
        info!(%id, "container removed");
        Ok(())
    }
}
