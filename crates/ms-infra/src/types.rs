use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Port the game listens on inside every container.
pub const GAME_PORT: u16 = 25565;

/// A request to provision one server, as carried on the inbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub name: String,
    pub server_type: String,
    pub server_version: String,
    pub region: String,
    pub players_count: u32,
    #[serde(alias = "ram_plan")]
    pub plan_type: String,
    pub difficulty: String,
    pub online_mode: bool,
    /// Client-supplied idempotency key; redeliveries with a known key are not re-provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Server identifier assigned at intake and returned to the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl ProvisionRequest {
    /// Check required fields and membership in the recognized sets.
    pub fn validate(&self) -> Result<(ServerType, Plan)> {
        for (field, value) in [
            ("name", &self.name),
            ("server_type", &self.server_type),
            ("server_version", &self.server_version),
            ("plan_type", &self.plan_type),
            ("difficulty", &self.difficulty),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Invalid(format!("{field} is required")));
            }
        }

        if self.players_count < 1 {
            return Err(Error::Invalid("players_count must be at least 1".into()));
        }

        if !is_valid_version(&self.server_version) {
            return Err(Error::Invalid(format!(
                "malformed server_version: {}",
                self.server_version
            )));
        }

        if !DIFFICULTIES.contains(&self.difficulty.as_str()) {
            return Err(Error::Invalid(format!(
                "difficulty must be one of {}",
                DIFFICULTIES.join(", ")
            )));
        }

        let server_type = self.server_type.parse::<ServerType>()?;
        let plan = self.plan_type.parse::<Plan>()?;
        Ok((server_type, plan))
    }
}

const DIFFICULTIES: [&str; 4] = ["peaceful", "easy", "normal", "hard"];

/// Versions end up in file names, so only a conservative charset is allowed.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && !version.starts_with('.')
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Server distributions the provisioner knows how to fetch and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Paper,
    Vanilla,
    Forge,
}

impl ServerType {
    pub const ALL: [ServerType; 3] = [Self::Paper, Self::Vanilla, Self::Forge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Vanilla => "vanilla",
            Self::Forge => "forge",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paper" => Ok(Self::Paper),
            "vanilla" => Ok(Self::Vanilla),
            "forge" => Ok(Self::Forge),
            other => Err(Error::UnsupportedServerType(other.to_string())),
        }
    }
}

/// Resource plan tiers, ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Budget,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Budget => "budget",
            Self::Premium => "premium",
        }
    }

    /// Lenient lookup: unrecognized identifiers fall back to the lowest tier.
    pub fn from_id_or_default(id: &str) -> Self {
        id.parse().unwrap_or(Self::Free)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Self::Free),
            "budget" => Ok(Self::Budget),
            "premium" => Ok(Self::Premium),
            other => Err(Error::UnknownPlan(other.to_string())),
        }
    }
}

/// Deterministic image tag shared by every server of the same type and plan.
pub fn image_tag(server_type: ServerType, plan: Plan) -> String {
    format!("ms-{server_type}-{plan}")
}

/// Stages of a provisioning run, as reported on progress and failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decoding,
    ValidatingConfiguration,
    BuildingImage,
    CreatingContainer,
    StartingContainer,
    HealthChecking,
    Ready,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decoding => "decoding",
            Self::ValidatingConfiguration => "validating_configuration",
            Self::BuildingImage => "building_image",
            Self::CreatingContainer => "creating_container",
            Self::StartingContainer => "starting_container",
            Self::HealthChecking => "health_checking",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-side container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of one provisioning run. Owned by that run only.
#[derive(Debug, Clone)]
pub struct ProvisionState {
    pub server_id: String,
    pub request: ProvisionRequest,
    pub image_tag: String,
    pub container_id: Option<ContainerId>,
    pub host_port: Option<u16>,
}

/// A server jar available on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub already_cached: bool,
}

/// Memory and CPU allotment for one (server type, plan) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSettings {
    /// `-Xms` value, e.g. `512M`.
    pub min_heap: String,
    /// `-Xmx` value.
    pub max_heap: String,
    /// Hard memory ceiling enforced by the engine.
    pub memory_bytes: i64,
    /// CPU ceiling in fractional cores.
    pub cpus: f64,
}

impl ResourceSettings {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0).round() as i64
    }
}

/// Engine-agnostic description of a container to create.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub container_port: u16,
    pub host_port: u16,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            name: "friends".into(),
            server_type: "paper".into(),
            server_version: "1.20.1".into(),
            region: "eu-west".into(),
            players_count: 10,
            plan_type: "budget".into(),
            difficulty: "normal".into(),
            online_mode: true,
            request_id: None,
            server_id: None,
        }
    }

    #[test]
    fn valid_request_yields_typed_pair() {
        assert_eq!(request().validate().unwrap(), (ServerType::Paper, Plan::Budget));
    }

    #[test]
    fn empty_fields_are_rejected() {
        let mut req = request();
        req.name = "  ".into();
        assert!(matches!(req.validate(), Err(Error::Invalid(msg)) if msg.contains("name")));
    }

    #[test]
    fn unknown_type_and_plan_are_rejected() {
        let mut req = request();
        req.server_type = "bukkit".into();
        assert!(matches!(req.validate(), Err(Error::UnsupportedServerType(_))));

        let mut req = request();
        req.plan_type = "enterprise".into();
        assert!(matches!(req.validate(), Err(Error::UnknownPlan(_))));
    }

    #[test]
    fn path_like_versions_are_rejected() {
        let mut req = request();
        req.server_version = "../../etc/passwd".into();
        assert!(req.validate().is_err());
        assert!(is_valid_version("1.20.1-rc1"));
        assert!(!is_valid_version("1.20/1"));
    }

    #[test]
    fn zero_players_is_rejected() {
        let mut req = request();
        req.players_count = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn ram_plan_alias_is_accepted() {
        let req: ProvisionRequest = serde_json::from_value(serde_json::json!({
            "name": "s",
            "server_type": "forge",
            "server_version": "1.20.1",
            "region": "us",
            "players_count": 4,
            "ram_plan": "premium",
            "difficulty": "hard",
            "online_mode": false
        }))
        .unwrap();
        assert_eq!(req.plan_type, "premium");
        assert_eq!(req.request_id, None);
    }

    #[test]
    fn image_tag_is_type_and_plan() {
        assert_eq!(image_tag(ServerType::Forge, Plan::Premium), "ms-forge-premium");
        assert_eq!(Plan::from_id_or_default("8GB"), Plan::Free);
    }
}
