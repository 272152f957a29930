use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::ContainerId;
use crate::{ContainerEngine, Error, Result};

/// Log lines that mean the server accepts players.
pub const READY_MARKERS: [&str; 4] = [
    "Done (",
    "Server startup",
    "Time elapsed:",
    "For help, type \"help\"",
];

/// Log lines that mean startup failed and will not recover.
pub const FATAL_MARKERS: [&str; 5] = [
    "Failed to bind to port",
    "OutOfMemoryError",
    "java.lang.RuntimeException",
    "Server crashed",
    "Encountered an unexpected exception",
];

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_LOG_TAIL: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    Polling,
    Ready,
    Fatal { marker: &'static str },
    TimedOut,
}

/// Classify a log snapshot. Readiness wins over a fatal marker in the same tail.
pub fn classify(logs: &str) -> ProbeState {
    if READY_MARKERS.iter().any(|m| logs.contains(m)) {
        return ProbeState::Ready;
    }
    match FATAL_MARKERS.iter().copied().find(|m| logs.contains(m)) {
        Some(marker) => ProbeState::Fatal { marker },
        None => ProbeState::Polling,
    }
}

/// Polls container logs until the server reports ready, fails, or time runs out.
///
/// Never touches the container itself; rollback is the caller's job.
pub struct ReadinessProbe {
    engine: Arc<dyn ContainerEngine>,
    timeout: Duration,
    poll_interval: Duration,
    tail: usize,
}

impl ReadinessProbe {
    pub fn new(engine: Arc<dyn ContainerEngine>, timeout: Duration) -> Self {
        Self {
            engine,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tail: DEFAULT_LOG_TAIL,
        }
    }

    /// Resolve once the server is ready. A log fetch error ends the probe.
    pub async fn wait_ready(&self, id: &ContainerId) -> Result<()> {
        let start = Instant::now();
        info!(%id, timeout_secs = self.timeout.as_secs(), "waiting for server readiness");

        let mut state = ProbeState::Polling;
        while start.elapsed() < self.timeout {
            let logs = self
                .engine
                .container_logs(id, self.tail)
                .await
                .map_err(|e| e.context("fetching container logs"))?;

            state = classify(&logs);
            match state {
                ProbeState::Polling => {
                    debug!(%id, elapsed_secs = start.elapsed().as_secs(), "server still starting");
                    tokio::time::sleep(self.poll_interval).await;
                }
                _ => break,
            }
        }
        if state == ProbeState::Polling {
            state = ProbeState::TimedOut;
        }

        match state {
            ProbeState::Ready => {
                info!(%id, elapsed_secs = start.elapsed().as_secs(), "server ready");
                Ok(())
            }
            ProbeState::Fatal { marker } => {
                warn!(%id, marker, "server failed during startup");
                Err(Error::HealthFatal {
                    marker: marker.to_string(),
                })
            }
            ProbeState::Polling | ProbeState::TimedOut => {
                warn!(%id, timeout_secs = self.timeout.as_secs(), "server readiness timed out");
                Err(Error::HealthTimeout {
                    timeout: self.timeout,
                })
            }
        }
    }
}
