use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is invalid: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Broker wiring; present only when `KAFKA_BROKERS` is set.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_topic: String,
    pub producer_topic: String,
    pub group_id: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub docker_host: String,
    pub assets_path: PathBuf,
    pub max_concurrent_builds: usize,
    pub max_alive_servers: usize,
    pub health_timeout: Duration,
    pub versions_cache_ttl: Duration,
    pub kafka: Option<KafkaConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let max_concurrent_builds = parse(&get, "MAX_CONCURRENT_BUILDS", 3usize)?;
        if max_concurrent_builds == 0 {
            return Err(ConfigError::Zero("MAX_CONCURRENT_BUILDS"));
        }

        let kafka = get("KAFKA_BROKERS").map(|brokers| KafkaConfig {
            brokers,
            consumer_topic: or("KAFKA_CONSUMER_TOPIC", "server-requests"),
            producer_topic: or("KAFKA_PRODUCER_TOPIC", "server-events"),
            group_id: or("KAFKA_GROUP_ID", "ms-worker"),
        });

        Ok(Self {
            listen_addr: parse(&get, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            docker_host: or("DOCKER_HOST", "tcp://127.0.0.1:2375"),
            assets_path: PathBuf::from(or("ASSETS_PATH", "./assets")),
            max_concurrent_builds,
            max_alive_servers: parse(&get, "MAX_ALIVE_SERVERS", 10usize)?,
            health_timeout: Duration::from_secs(parse(&get, "HEALTH_TIMEOUT_SECS", 300u64)?),
            versions_cache_ttl: Duration::from_secs(parse(&get, "VERSIONS_CACHE_TTL_SECS", 3600u64)?),
            kafka,
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.max_concurrent_builds, 3);
        assert_eq!(config.health_timeout, Duration::from_secs(300));
        assert_eq!(config.versions_cache_ttl, Duration::from_secs(3600));
        assert!(config.kafka.is_none());
    }

    #[test]
    fn kafka_section_follows_brokers() {
        let config = config(&[("KAFKA_BROKERS", "localhost:9092"), ("KAFKA_GROUP_ID", "g")])
            .unwrap();
        let kafka = config.kafka.unwrap();
        assert_eq!(kafka.brokers, "localhost:9092");
        assert_eq!(kafka.group_id, "g");
        assert_eq!(kafka.consumer_topic, "server-requests");
    }

    #[test]
    fn version_cache_ttl_is_configurable() {
        let config = config(&[("VERSIONS_CACHE_TTL_SECS", "90")]).unwrap();
        assert_eq!(config.versions_cache_ttl, Duration::from_secs(90));
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = config(&[("MAX_ALIVE_SERVERS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_ALIVE_SERVERS", .. }));
        assert!(matches!(
            config(&[("MAX_CONCURRENT_BUILDS", "0")]),
            Err(ConfigError::Zero(_))
        ));
    }
}
