use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::media::MediaConstraints;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Validated call configuration: where the relay lives, which ICE servers to
/// offer the peer connection, and the local capture constraints.
#[derive(Debug, Clone)]
pub struct CallConfig {
    signaling_url: Url,
    ice_servers: Vec<IceServerConfig>,
    media: MediaConstraints,
    connect_timeout: Duration,
}

impl CallConfig {
    /// Accepts `ws://` and `wss://` URLs; an `http(s)://` relay address is
    /// normalized to the websocket scheme.
    pub fn new(signaling_url: &str) -> Result<Self, ConfigError> {
        let trimmed = signaling_url.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::Invalid(
                "signaling URL cannot be empty".to_string(),
            ));
        }

        let mut url = Url::parse(trimmed)
            .map_err(|err| ConfigError::Invalid(format!("invalid signaling URL: {err}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => {
                url.set_scheme("ws")
                    .map_err(|_| ConfigError::Invalid("invalid signaling URL".to_string()))?;
            }
            "https" => {
                url.set_scheme("wss")
                    .map_err(|_| ConfigError::Invalid("invalid signaling URL".to_string()))?;
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported signaling scheme: {other}"
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(ConfigError::Invalid(
                "signaling URL has no host".to_string(),
            ));
        }

        Ok(Self {
            signaling_url: url,
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
            ],
            media: MediaConstraints::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_media(mut self, media: MediaConstraints) -> Self {
        self.media = media;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn signaling_url(&self) -> &Url {
        &self.signaling_url
    }

    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    pub fn media(&self) -> &MediaConstraints {
        &self.media
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}
