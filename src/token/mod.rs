//! Room-token client for the managed media backend.
//!
//! The backend mints short-lived join tokens for a room/participant pair;
//! everything about the token (lifetime, grants) is server policy and the
//! token is opaque here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug)]
pub struct TokenConfig {
    base_url: Url,
}

impl TokenConfig {
    pub fn new(token_server_url: impl AsRef<str>) -> Result<Self, TokenError> {
        let mut base = token_server_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(TokenError::InvalidConfig(
                "token server url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("https://{}", base);
        }
        let parsed = Url::parse(&base)
            .map_err(|err| TokenError::InvalidConfig(format!("invalid token server url: {err}")))?;
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[derive(Clone)]
pub struct TokenClient {
    config: Arc<TokenConfig>,
    backend: Arc<dyn TokenBackend>,
}

impl TokenClient {
    pub fn new(config: TokenConfig) -> Result<Self, TokenError> {
        let backend = Arc::new(ReqwestTokenBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    #[cfg(test)]
    fn with_backend(config: TokenConfig, backend: Arc<dyn TokenBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub async fn fetch(&self, room: &str, participant: &str) -> Result<String, TokenError> {
        if room.trim().is_empty() || participant.trim().is_empty() {
            return Err(TokenError::InvalidConfig(
                "room and participant names cannot be empty".into(),
            ));
        }

        let request = TokenRequest {
            room_name: room.to_string(),
            participant_name: participant.to_string(),
        };
        let response = self
            .backend
            .generate_token(self.config.base_url(), &request)
            .await?;

        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "token generation failed".to_string());
            return Err(TokenError::Server(message));
        }
        match response.token {
            Some(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(TokenError::InvalidResponse("missing token".into())),
        }
    }
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("invalid token configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
trait TokenBackend: Send + Sync {
    async fn generate_token(
        &self,
        base_url: &Url,
        request: &TokenRequest,
    ) -> Result<TokenResponse, TokenError>;
}

struct ReqwestTokenBackend {
    client: reqwest::Client,
}

impl ReqwestTokenBackend {
    fn new() -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TokenBackend for ReqwestTokenBackend {
    async fn generate_token(
        &self,
        base_url: &Url,
        request: &TokenRequest,
    ) -> Result<TokenResponse, TokenError> {
        let endpoint = base_url
            .join("token")
            .map_err(|err| TokenError::InvalidConfig(format!("invalid token endpoint: {err}")))?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(TokenError::HttpStatus(response.status()));
        }
        let payload = response.json::<TokenResponse>().await?;
        Ok(payload)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    room_name: String,
    participant_name: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTokenBackend {
        known_room: &'static str,
    }

    #[async_trait]
    impl TokenBackend for MockTokenBackend {
        async fn generate_token(
            &self,
            _base_url: &Url,
            request: &TokenRequest,
        ) -> Result<TokenResponse, TokenError> {
            if request.room_name == self.known_room {
                Ok(TokenResponse {
                    success: true,
                    message: None,
                    token: Some(format!("jwt-{}-{}", request.room_name, request.participant_name)),
                })
            } else {
                Ok(TokenResponse {
                    success: false,
                    message: Some("unknown room".into()),
                    token: None,
                })
            }
        }
    }

    #[test]
    fn config_defaults_to_https() {
        let config = TokenConfig::new("token.example.com").unwrap();
        assert_eq!(config.base_url().scheme(), "https");
    }

    #[test]
    fn request_serializes_camel_case() {
        let request = TokenRequest {
            room_name: "call-1".into(),
            participant_name: "alice".into(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"roomName":"call-1","participantName":"alice"}"#
        );
    }

    #[tokio::test]
    async fn fetch_returns_the_minted_token() {
        let config = TokenConfig::new("https://token.example.com").unwrap();
        let client = TokenClient::with_backend(
            config,
            Arc::new(MockTokenBackend {
                known_room: "call-1",
            }),
        );
        let token = client.fetch("call-1", "alice").await.unwrap();
        assert_eq!(token, "jwt-call-1-alice");
    }

    #[tokio::test]
    async fn server_rejection_surfaces_as_error() {
        let config = TokenConfig::new("https://token.example.com").unwrap();
        let client = TokenClient::with_backend(
            config,
            Arc::new(MockTokenBackend {
                known_room: "call-1",
            }),
        );
        let err = client.fetch("call-2", "alice").await.unwrap_err();
        assert!(matches!(err, TokenError::Server(_)));
    }

    #[tokio::test]
    async fn empty_names_are_rejected_before_the_network() {
        let config = TokenConfig::new("https://token.example.com").unwrap();
        let client = TokenClient::with_backend(
            config,
            Arc::new(MockTokenBackend { known_room: "r" }),
        );
        assert!(client.fetch("", "alice").await.is_err());
        assert!(client.fetch("call-1", "  ").await.is_err());
    }
}
