use std::fmt;

use serde::{Deserialize, Serialize};

/// Progress of one server, as published outbound and streamed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub server_id: String,
    pub status: EventStatus,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub message: String,
}

impl ProgressEvent {
    pub fn new(
        server_id: impl Into<String>,
        status: EventStatus,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            status,
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Building,
    Running,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound message key for provisioning requests.
pub const CREATE_KEY: &str = "server.create";

/// Outbound message keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CreateStarted,
    CreateSuccess,
    CreateFailed,
    BuildProgress,
}

impl EventKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::CreateStarted => "server.create.started",
            Self::CreateSuccess => "server.create.success",
            Self::CreateFailed => "server.create.failed",
            Self::BuildProgress => "server.build.building",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
