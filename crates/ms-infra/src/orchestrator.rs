use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactResolver;
use crate::image::ImageBuilder;
use crate::policy::ResourcePolicy;
use crate::readiness::ReadinessProbe;
use crate::types::{
    ContainerId, ContainerSpec, GAME_PORT, ProvisionRequest, ProvisionState, Stage, image_tag,
};
use crate::{ContainerEngine, Error, Result};

/// Receives intermediate stage notifications during a provisioning run.
#[async_trait]
pub trait ProgressReporter: Send + Sync + 'static {
    async fn stage_started(&self, server_id: &str, stage: Stage, message: &str);
}

pub struct NoopReporter;

#[async_trait]
impl ProgressReporter for NoopReporter {
    async fn stage_started(&self, _server_id: &str, _stage: Stage, _message: &str) {}
}

/// A failed run, tagged with the stage it failed in.
#[derive(Debug, thiserror::Error)]
#[error("{stage}: {error}")]
pub struct ProvisionFailure {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl ProvisionFailure {
    fn at(stage: Stage) -> impl FnOnce(Error) -> Self {
        move |error| Self { stage, error }
    }
}

/// Hands out host ports from a monotonically increasing counter.
///
/// Ports are never returned to the pool.
#[derive(Debug)]
pub struct PortAllocator {
    last: AtomicU32,
}

impl PortAllocator {
    /// The first allocated port is `seed + 1`.
    pub fn new(seed: u16) -> Self {
        Self {
            last: AtomicU32::new(u32::from(seed)),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let port = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        u16::try_from(port).map_err(|_| Error::PortsExhausted)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(GAME_PORT)
    }
}

/// Drives one request from validation to a ready container.
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    images: ImageBuilder,
    probe: ReadinessProbe,
    policy: ResourcePolicy,
    ports: PortAllocator,
    reporter: Arc<dyn ProgressReporter>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        artifacts: Arc<dyn ArtifactResolver>,
        health_timeout: Duration,
    ) -> Self {
        Self {
            images: ImageBuilder::new(engine.clone(), artifacts),
            probe: ReadinessProbe::new(engine.clone(), health_timeout),
            engine,
            policy: ResourcePolicy,
            ports: PortAllocator::default(),
            reporter: Arc::new(NoopReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Provision a server. Nothing is retried; only a failed readiness probe
    /// triggers removal of the container.
    pub async fn provision(
        &self,
        server_id: &str,
        request: ProvisionRequest,
    ) -> std::result::Result<ProvisionState, ProvisionFailure> {
        self.report(server_id, Stage::ValidatingConfiguration, "validating configuration")
            .await;
        let (server_type, plan) = request
            .validate()
            .map_err(ProvisionFailure::at(Stage::ValidatingConfiguration))?;

        let mut state = ProvisionState {
            server_id: server_id.to_string(),
            image_tag: image_tag(server_type, plan),
            request,
            container_id: None,
            host_port: None,
        };

        // ── Image ────────────────────────────────────────────────────

        self.report(server_id, Stage::BuildingImage, "preparing server image")
            .await;
        let definition = self.policy.generate_definition(&state.request);
        let built = self
            .images
            .ensure_image(&state.image_tag, &definition, &state.request)
            .await
            .map_err(ProvisionFailure::at(Stage::BuildingImage))?;
        info!(server_id, tag = %state.image_tag, built, "image ready");

        // ── Container ────────────────────────────────────────────────

        self.report(server_id, Stage::CreatingContainer, "creating container")
            .await;
        let host_port = self
            .ports
            .allocate()
            .map_err(ProvisionFailure::at(Stage::CreatingContainer))?;
        let spec = self.container_spec(&state, host_port);
        let id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(ProvisionFailure::at(Stage::CreatingContainer))?;
        state.container_id = Some(id.clone());
        state.host_port = Some(host_port);

        self.report(server_id, Stage::StartingContainer, "starting container")
            .await;
        self.engine
            .start_container(&id)
            .await
            .map_err(ProvisionFailure::at(Stage::StartingContainer))?;

        // ── Readiness ────────────────────────────────────────────────

        self.report(server_id, Stage::HealthChecking, "waiting for server to become ready")
            .await;
        if let Err(health) = self.probe.wait_ready(&id).await {
            let error = self.rollback(server_id, &id, health).await;
            return Err(ProvisionFailure {
                stage: Stage::HealthChecking,
                error,
            });
        }

        info!(server_id, container = %id, host_port, "server provisioned");
        Ok(state)
    }

    /// Remove the container after a failed probe and fold both outcomes into one error.
    async fn rollback(&self, server_id: &str, id: &ContainerId, health: Error) -> Error {
        warn!(server_id, container = %id, error = %health, "readiness failed, removing container");
        match self.engine.remove_container(id).await {
            Ok(()) => health,
            Err(rollback) => {
                error!(server_id, container = %id, error = %rollback, "rollback failed");
                Error::RollbackFailed {
                    health: Box::new(health),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    fn container_spec(&self, state: &ProvisionState, host_port: u16) -> ContainerSpec {
        let request = &state.request;
        let settings = self.policy.resolve(&request.server_type, &request.plan_type);

        ContainerSpec {
            name: format!("ms-{}", state.server_id),
            image: state.image_tag.clone(),
            env: HashMap::from([
                ("SERVER_NAME".to_string(), request.name.clone()),
                ("DIFFICULTY".to_string(), request.difficulty.clone()),
                ("ONLINE_MODE".to_string(), request.online_mode.to_string()),
                ("MAX_PLAYERS".to_string(), request.players_count.to_string()),
            ]),
            labels: HashMap::from([
                ("ms.server_id".to_string(), state.server_id.clone()),
                ("ms.server_type".to_string(), request.server_type.clone()),
            ]),
            container_port: GAME_PORT,
            host_port,
            memory_bytes: settings.memory_bytes,
            nano_cpus: settings.nano_cpus(),
        }
    }

    async fn report(&self, server_id: &str, stage: Stage, message: &str) {
        self.reporter.stage_started(server_id, stage, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockEngine, StubArtifacts, request};
    use std::sync::Mutex;

    const READY: &str = "Done (2.1s)! For help, type \"help\"";

    fn orchestrator(engine: &Arc<MockEngine>) -> Orchestrator {
        Orchestrator::new(
            engine.clone(),
            Arc::new(StubArtifacts::new()),
            Duration::from_secs(30),
        )
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Stage>>);

    #[async_trait]
    impl ProgressReporter for Recorder {
        async fn stage_started(&self, _server_id: &str, stage: Stage, _message: &str) {
            self.0.lock().unwrap().push(stage);
        }
    }

    #[test]
    fn ports_start_after_the_game_port() {
        let ports = PortAllocator::default();
        assert_eq!(ports.allocate().unwrap(), 25566);
        assert_eq!(ports.allocate().unwrap(), 25567);

        let ports = PortAllocator::new(u16::MAX - 1);
        assert_eq!(ports.allocate().unwrap(), u16::MAX);
        assert!(matches!(ports.allocate(), Err(Error::PortsExhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_reaches_ready() {
        let engine = Arc::new(MockEngine::new());
        engine.script_logs([READY]);
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(&engine).with_reporter(recorder.clone());

        let state = orch
            .provision("srv-1", request("paper", "1.20.1", "budget"))
            .await
            .unwrap();

        assert_eq!(state.image_tag, "ms-paper-budget");
        assert_eq!(state.host_port, Some(25566));
        assert!(state.container_id.is_some());
        assert_eq!(engine.build_calls(), 1);
        assert_eq!(engine.remove_calls(), 0);

        let created = engine.created_specs();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "ms-srv-1");
        assert_eq!(created[0].env["MAX_PLAYERS"], "4");
        assert_eq!(created[0].labels["ms.server_id"], "srv-1");
        assert_eq!(created[0].memory_bytes, 2 * 1024 * 1024 * 1024);

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                Stage::ValidatingConfiguration,
                Stage::BuildingImage,
                Stage::CreatingContainer,
                Stage::StartingContainer,
                Stage::HealthChecking,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_request_fails_before_touching_the_engine() {
        let engine = Arc::new(MockEngine::new());
        let orch = orchestrator(&engine);

        let failure = orch
            .provision("srv-1", request("bukkit", "1.20.1", "free"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::ValidatingConfiguration);
        assert!(matches!(failure.error, Error::UnsupportedServerType(_)));
        assert_eq!(engine.build_calls(), 0);
        assert!(engine.created_specs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn build_failure_is_tagged() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_builds(true);
        let orch = orchestrator(&engine);

        let failure = orch
            .provision("srv-1", request("vanilla", "1.20.1", "free"))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::BuildingImage);
        assert!(failure.to_string().starts_with("building_image: "));
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_leaves_container_in_place() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_starts(true);
        let orch = orchestrator(&engine);

        let failure = orch
            .provision("srv-1", request("paper", "1.20.1", "free"))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::StartingContainer);
        assert_eq!(engine.start_calls(), 1);
        assert_eq!(engine.remove_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_ports_fail_container_creation() {
        let engine = Arc::new(MockEngine::new());
        let orch = orchestrator(&engine).with_ports(PortAllocator::new(u16::MAX));

        let failure = orch
            .provision("srv-1", request("paper", "1.20.1", "free"))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::CreatingContainer);
        assert!(matches!(failure.error, Error::PortsExhausted));
        assert!(engine.created_specs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_startup_removes_container_once() {
        let engine = Arc::new(MockEngine::new());
        engine.script_logs(["Failed to bind to port 25565"]);
        let orch = orchestrator(&engine);

        let failure = orch
            .provision("srv-1", request("paper", "1.20.1", "free"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::HealthChecking);
        assert!(matches!(failure.error, Error::HealthFatal { .. }));
        assert_eq!(engine.remove_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_reports_both_errors() {
        let engine = Arc::new(MockEngine::new());
        engine.script_logs(["Loading libraries"]);
        engine.fail_removes(true);
        let orch = orchestrator(&engine);

        let failure = orch
            .provision("srv-1", request("paper", "1.20.1", "free"))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::HealthChecking);
        match failure.error {
            Error::RollbackFailed { health, .. } => {
                assert!(matches!(*health, Error::HealthTimeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.remove_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_tag_reuses_image_and_new_port() {
        let engine = Arc::new(MockEngine::new());
        engine.script_logs([READY]);
        let artifacts = Arc::new(StubArtifacts::new());
        let orch = Orchestrator::new(engine.clone(), artifacts.clone(), Duration::from_secs(30));

        let first = orch
            .provision("a", request("paper", "1.20.1", "free"))
            .await
            .unwrap();
        let second = orch
            .provision("b", request("paper", "1.20.1", "free"))
            .await
            .unwrap();

        assert_eq!(engine.build_calls(), 1);
        assert_eq!(artifacts.resolve_calls(), 1);
        assert_eq!(first.host_port, Some(25566));
        assert_eq!(second.host_port, Some(25567));
    }
}
