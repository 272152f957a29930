use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Image types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
}

/// One line of the newline-delimited JSON stream returned by `POST /build`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildMessage {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Container types ──────────────────────────────────────────────────

/// Serializes as `{}`; used for the Engine's set-like maps (`ExposedPorts`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerRequest {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub exposed_ports: HashMap<String, EmptyObject>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub port_bindings: HashMap<String, Vec<PortBinding>>,
    /// Hard memory limit in bytes.
    pub memory: i64,
    /// CPU quota in units of 10^-9 CPUs.
    pub nano_cpus: i64,
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    pub name: String,
}

impl RestartPolicy {
    pub fn unless_stopped() -> Self {
        Self {
            name: "unless-stopped".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerResponse {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}
