//! JSON configuration.
//!
//! One file configures a dealer: the cache flavor, the logging sink, the
//! persistent storage location and the set of services with their
//! autodiscovery sources. `version` must be 1 and service aliases must be
//! unique; both are rejected at load time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::DealerError;

/// Control port assumed when a fetched host line has none.
pub const DEFAULT_CONTROL_PORT: u16 = 5555;

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub version: u32,

    /// Default deadline, in seconds, applied by `Dealer::default_policy`.
    #[serde(default)]
    pub default_message_deadline: f64,

    #[serde(default)]
    pub message_cache: MessageCacheConfig,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub persistent_storage: StorageConfig,

    #[serde(default, deserialize_with = "services_without_duplicates")]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, DealerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DealerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, DealerError> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| DealerError::Config(e.to_string()))?;
        if config.version != SUPPORTED_VERSION {
            return Err(DealerError::Config(format!(
                "unsupported config version {} (expected {})",
                config.version, SUPPORTED_VERSION
            )));
        }
        Ok(config)
    }

    pub fn default_deadline(&self) -> Duration {
        if self.default_message_deadline > 0.0 {
            Duration::from_secs_f64(self.default_message_deadline)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum CacheKind {
    #[default]
    #[serde(rename = "RAM_ONLY")]
    RamOnly,
    #[serde(rename = "PERSISTENT")]
    Persistent,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageCacheConfig {
    #[serde(rename = "type", default)]
    pub kind: CacheKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum LoggerKind {
    #[default]
    #[serde(rename = "STDOUT")]
    Stdout,
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "SYSLOG")]
    Syslog,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerConfig {
    #[serde(rename = "type", default)]
    pub kind: LoggerKind,

    /// Pipe-separated severity flags, e.g. `"PLOG_ERROR|PLOG_WARNING"`.
    #[serde(default)]
    pub flags: String,

    /// Log file location for the FILE sink.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl LoggerConfig {
    /// The most verbose tracing level enabled by the flags. Empty flags
    /// mean info.
    pub fn level(&self) -> tracing::Level {
        let mut level = if self.flags.is_empty() {
            tracing::Level::INFO
        } else {
            tracing::Level::ERROR
        };
        for flag in self.flags.split('|').map(str::trim) {
            let candidate = match flag {
                "PLOG_ERROR" => tracing::Level::ERROR,
                "PLOG_WARNING" => tracing::Level::WARN,
                "PLOG_INFO" | "PLOG_MSG_TIME" | "PLOG_MSG_TYPES" => tracing::Level::INFO,
                "PLOG_DEBUG" | "PLOG_ALL" => tracing::Level::DEBUG,
                _ => continue,
            };
            if candidate > level {
                level = candidate;
            }
        }
        level
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_blob_path")]
    pub eblob_path: PathBuf,

    /// Capacity hint in KiB.
    #[serde(default = "default_blob_size")]
    pub blob_size: u64,

    /// Commits between fsyncs; 0 leaves syncing to the OS.
    #[serde(default = "default_sync_interval")]
    pub eblob_sync_interval: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            eblob_path: default_blob_path(),
            blob_size: default_blob_size(),
            eblob_sync_interval: default_sync_interval(),
        }
    }
}

fn default_blob_path() -> PathBuf {
    PathBuf::from("/tmp/dray_blobs")
}

fn default_blob_size() -> u64 {
    2 * 1024 * 1024 // KiB, so 2 GiB
}

fn default_sync_interval() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DiscoveryKind {
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "MULTICAST")]
    Multicast,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutodiscoveryConfig {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub description: String,
    pub app: String,
    pub autodiscovery: AutodiscoveryConfig,
}

fn services_without_duplicates<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, ServiceConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ServicesVisitor;

    impl<'de> Visitor<'de> for ServicesVisitor {
        type Value = BTreeMap<String, ServiceConfig>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of service aliases")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut services = BTreeMap::new();
            while let Some((alias, service)) = access.next_entry::<String, ServiceConfig>()? {
                if services.insert(alias.clone(), service).is_some() {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate service alias '{}'",
                        alias
                    )));
                }
            }
            Ok(services)
        }
    }

    deserializer.deserialize_map(ServicesVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": 1,
        "default_message_deadline": 4.5,
        "message_cache": { "type": "PERSISTENT" },
        "logger": { "type": "FILE", "flags": "PLOG_ERROR|PLOG_DEBUG", "file_path": "/var/log/dray.log" },
        "persistent_storage": { "eblob_path": "/var/lib/dray", "blob_size": 1024, "eblob_sync_interval": 2 },
        "services": {
            "karma": {
                "description": "karma counters",
                "app": "karma_app",
                "autodiscovery": { "source": "/etc/dray/hosts", "type": "FILE" }
            },
            "search": {
                "app": "search_app",
                "autodiscovery": { "source": "http://discovery.local/hosts", "type": "HTTP" }
            }
        }
    }"#;

    #[test]
    fn parses_a_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.default_deadline(), Duration::from_secs_f64(4.5));
        assert_eq!(config.message_cache.kind, CacheKind::Persistent);
        assert_eq!(config.logger.kind, LoggerKind::File);
        assert_eq!(config.persistent_storage.blob_size, 1024);
        assert_eq!(config.services.len(), 2);

        let karma = &config.services["karma"];
        assert_eq!(karma.app, "karma_app");
        assert_eq!(karma.autodiscovery.kind, DiscoveryKind::File);
    }

    #[test]
    fn rejects_wrong_version() {
        let err = Config::parse(r#"{ "version": 3 }"#).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn rejects_duplicate_aliases() {
        let text = r#"{
            "version": 1,
            "services": {
                "svc": { "app": "a", "autodiscovery": { "source": "x", "type": "FILE" } },
                "svc": { "app": "b", "autodiscovery": { "source": "y", "type": "FILE" } }
            }
        }"#;
        let err = Config::parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate service alias"));
    }

    #[test]
    fn defaults_are_sensible() {
        let config = Config::parse(r#"{ "version": 1 }"#).unwrap();
        assert_eq!(config.message_cache.kind, CacheKind::RamOnly);
        assert_eq!(config.logger.kind, LoggerKind::Stdout);
        assert_eq!(config.default_deadline(), Duration::ZERO);
        assert!(config.services.is_empty());
    }

    #[test]
    fn logger_flags_pick_the_most_verbose_level() {
        let logger = LoggerConfig {
            kind: LoggerKind::Stdout,
            flags: "PLOG_ERROR|PLOG_WARNING".into(),
            file_path: None,
        };
        assert_eq!(logger.level(), tracing::Level::WARN);

        let logger = LoggerConfig {
            flags: "PLOG_ERROR|PLOG_DEBUG".into(),
            ..logger
        };
        assert_eq!(logger.level(), tracing::Level::DEBUG);
    }
}
