mod config;
mod error;
mod events;
mod hub;
#[cfg(feature = "kafka")]
mod kafka;
mod publisher;
mod queue;
mod routes;
mod state;
mod worker;

use std::future::IntoFuture;
use std::process::ExitCode;
use std::sync::Arc;

use ms_infra::Orchestrator;
use ms_infra::artifacts::ArtifactCache;
use ms_infra::docker::DockerEngine;
use ms_infra::versions::{CachedVersions, UpstreamVersions, VersionProvider};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::hub::EventHub;
use crate::publisher::{EventPublisher, HubPublisher, StageReporter};
use crate::queue::{MemoryQueue, MessageSource, RequestIntake};
use crate::routes::api_router;
use crate::state::AppState;
use crate::worker::{Worker, WorkerLimits};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Plumbing {
    source: Arc<dyn MessageSource>,
    intake: Arc<dyn RequestIntake>,
    publisher: Arc<dyn EventPublisher>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "provisioner exited");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BoxError> {
    let config = AppConfig::from_env()?;
    let hub = EventHub::spawn();
    let plumbing = plumbing(&config, &hub)?;

    // Provisioning pipeline
    let engine = Arc::new(DockerEngine::new(&config.docker_host));
    let versions: Arc<dyn VersionProvider> = Arc::new(CachedVersions::new(
        Arc::new(UpstreamVersions::default()),
        config.versions_cache_ttl,
    ));
    let artifacts = Arc::new(ArtifactCache::new(&config.assets_path, versions.clone()));
    tracing::info!(
        docker_host = %config.docker_host,
        assets = %artifacts.assets_root().display(),
        "container engine configured"
    );

    let orchestrator = Orchestrator::new(engine, artifacts, config.health_timeout)
        .with_reporter(Arc::new(StageReporter::new(plumbing.publisher.clone())));

    let worker = Arc::new(Worker::new(
        plumbing.source,
        Arc::new(orchestrator),
        plumbing.publisher,
        WorkerLimits {
            max_concurrent_builds: config.max_concurrent_builds,
            max_alive_servers: config.max_alive_servers,
        },
    ));

    let state = AppState {
        hub,
        versions,
        intake: plumbing.intake,
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    tracing::info!(addr = %config.listen_addr, "starting provisioner API");

    tokio::select! {
        result = worker.run() => result?,
        result = axum::serve(listener, app).into_future() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
    }

    Ok(())
}

#[cfg(feature = "kafka")]
fn plumbing(config: &AppConfig, hub: &EventHub) -> Result<Plumbing, BoxError> {
    let Some(kafka) = &config.kafka else {
        return Ok(in_memory(hub));
    };

    let bridge = kafka::bridge_events(kafka.clone(), hub.clone());
    tokio::spawn(async move {
        if let Err(e) = bridge.await {
            tracing::error!(error = %e, "event bridge stopped");
        }
    });

    tracing::info!(brokers = %kafka.brokers, "using kafka queue");
    Ok(Plumbing {
        source: Arc::new(kafka::KafkaSource::connect(kafka)?),
        intake: Arc::new(kafka::KafkaIntake::connect(kafka)?),
        publisher: Arc::new(kafka::KafkaPublisher::connect(kafka)?),
    })
}

#[cfg(not(feature = "kafka"))]
fn plumbing(config: &AppConfig, hub: &EventHub) -> Result<Plumbing, BoxError> {
    if config.kafka.is_some() {
        tracing::warn!("KAFKA_BROKERS is set but kafka support is not compiled in; using in-memory queue");
    }
    Ok(in_memory(hub))
}

fn in_memory(hub: &EventHub) -> Plumbing {
    tracing::info!("using in-memory queue");
    let queue = Arc::new(MemoryQueue::new());
    Plumbing {
        source: queue.clone(),
        intake: queue,
        publisher: Arc::new(HubPublisher::new(hub.clone())),
    }
}
