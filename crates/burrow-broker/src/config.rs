//! Broker configuration: TOML file + CLI overrides.

use burrow_core::{TunnelError, TunnelResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,
}

/// `[broker]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    /// Address the agent control listener binds to.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// Well-known control port agents dial.
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long an agent gets to drain the handshake frame before its
    /// attach is abandoned.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    34567
}

fn default_handshake_timeout() -> u64 {
    5
}

/// Effective broker configuration after merging file and CLI overrides.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub handshake_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: default_port(),
            handshake_timeout: Duration::from_secs(default_handshake_timeout()),
        }
    }
}

impl BrokerConfig {
    /// Load configuration: optional TOML file, then CLI overrides on top.
    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn load(
        path: Option<&Path>,
        bind_ip: Option<IpAddr>,
        port: Option<u16>,
    ) -> TunnelResult<Self> {
        let section = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let file: ConfigFile = toml::from_str(&raw)
                    .map_err(|e| TunnelError::Config(format!("{}: {e}", path.display())))?;
                info!(path = %path.display(), "loaded config file");
                file.broker
            }
            _ => BrokerSection::default(),
        };

        Self::from_section(section, bind_ip, port)
    }

    fn from_section(
        section: BrokerSection,
        bind_ip: Option<IpAddr>,
        port: Option<u16>,
    ) -> TunnelResult<Self> {
        let file_ip: IpAddr = section
            .bind_ip
            .parse()
            .map_err(|_| TunnelError::Config(format!("invalid bind_ip: {}", section.bind_ip)))?;

        Ok(Self {
            bind_ip: bind_ip.unwrap_or(file_ip),
            port: port.unwrap_or(section.port),
            handshake_timeout: Duration::from_secs(section.handshake_timeout_secs),
        })
    }
}
