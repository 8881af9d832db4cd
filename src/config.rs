//! Konfiguration
//!
//! Alle Felder haben Standardwerte; eine TOML-Datei muss nur die
//! Abweichungen enthalten. Zeiten sind Millisekunden.

use crate::call::{AudioConstraints, CallSettings};
use crate::relay::{default_relay_catalog, RelayCandidate, SelectionBudget};
use crate::rendezvous::{default_rendezvous_catalog, PoolError, RendezvousEndpoint, RendezvousServerPool};
use crate::room::RoomSettings;
use crate::session::{ReconnectConfig, SessionTimeouts};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Umgebungsvariable mit dem Pfad zur Konfigurationsdatei
pub const CONFIG_ENV_VAR: &str = "ROOMCALL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid rendezvous catalog: {0}")]
    Rendezvous(#[from] PoolError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub rendezvous: Vec<RendezvousEndpoint>,
    pub relays: Vec<RelayCandidate>,
    pub selection: SelectionBudget,
    pub reconnect: ReconnectConfig,
    pub session: SessionTimeouts,
    pub room: RoomSettings,
    pub call: CallSettings,
    pub audio: AudioConstraints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rendezvous: default_rendezvous_catalog(),
            relays: default_relay_catalog(),
            selection: SelectionBudget::default(),
            reconnect: ReconnectConfig::default(),
            session: SessionTimeouts::default(),
            room: RoomSettings::default(),
            call: CallSettings::default(),
            audio: AudioConstraints::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        RendezvousServerPool::new(config.rendezvous.clone())?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Liest die Datei aus `ROOMCALL_CONFIG`, sonst Standardwerte
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => {
                tracing::debug!("{} not set, using default config", CONFIG_ENV_VAR);
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            [reconnect]
            max_attempts = 3

            [call]
            dial_timeout_ms = 10000
            "#,
        )
        .unwrap();

        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.rotate_after, 2);
        assert_eq!(config.call.dial_timeout_ms, 10_000);
        assert_eq!(config.call.ring_timeout_ms, 30_000);
        assert_eq!(config.rendezvous.len(), 4);
        assert_eq!(config.selection, SelectionBudget::default());
    }

    #[test]
    fn test_custom_endpoints_and_relays() {
        let config = ClientConfig::from_toml_str(
            r#"
            [[rendezvous]]
            host = "signal.example.org"
            port = 9000
            path = "/rtc"
            key = "demo"
            secure = false

            [[relays]]
            urls = ["stun:stun.example.org:3478"]
            kind = "stun"
            "#,
        )
        .unwrap();

        assert_eq!(config.rendezvous[0].host, "signal.example.org");
        assert_eq!(config.relays.len(), 1);
        assert!(config.relays[0].is_stun());
    }

    #[test]
    fn test_empty_endpoint_list_is_rejected() {
        let err = ClientConfig::from_toml_str("rendezvous = []").unwrap_err();
        assert!(matches!(err, ConfigError::Rendezvous(PoolError::EmptyCatalog)));
    }

    #[test]
    fn test_unparsable_endpoint_is_rejected() {
        let source = r#"
            [[rendezvous]]
            host = "signal example org"
            port = 9000
            path = "/app"
            key = "dev"
            secure = false
        "#;

        let err = ClientConfig::from_toml_str(source).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Rendezvous(PoolError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[room]\nreplay_count = 5").unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.room.replay_count, 5);
        assert_eq!(config.room.history_capacity, 100);

        assert!(matches!(
            ClientConfig::load(Path::new("/nonexistent/roomcall.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
