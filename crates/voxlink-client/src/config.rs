//! Binary configuration: a TOML file with CLI overrides on top.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::session::{parse_key, AudioParams, Session, SessionError};

/// Everything the reference binary needs to join a session that was
/// negotiated out of band.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Audio server host.
    pub server: String,
    /// Audio server UDP port.
    pub port: u16,
    pub session_id: String,
    /// Hex-encoded 16-byte session key.
    pub key: String,
    /// Identity used on the control channel.
    pub client_id: String,
    pub audio: AudioParams,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server: "127.0.0.1".into(),
            port: 5004,
            session_id: "local-session".into(),
            key: "000102030405060708090a0b0c0d0e0f".into(),
            client_id: "voxlink-client".into(),
            audio: AudioParams::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<ClientConfig> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn host(&self) -> Result<IpAddr, SessionError> {
        self.server
            .parse()
            .map_err(|source| SessionError::BadHost {
                host: self.server.clone(),
                source,
            })
    }

    pub fn session(&self) -> Result<Session, SessionError> {
        let key = parse_key(&self.key)?;
        Ok(Session::new(
            self.session_id.clone(),
            key,
            SocketAddr::new(self.host()?, self.port),
            self.audio,
        ))
    }
}
