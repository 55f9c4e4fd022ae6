//! Acquiring, confirming and revoking billable synthesis sessions.

use async_trait::async_trait;
use iflytek_tts::{SessionDescriptor, VoiceParameters};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("Session service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Session service returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Query sent when asking for a new session.
///
/// The text only satisfies the service's validation; it is never spoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnRequest {
    pub text: String,
    pub voice: String,
    pub speed: u32,
    pub volume: u32,
    pub pitch: u32,
}

impl Default for TurnRequest {
    fn default() -> Self {
        Self::from_voice(&VoiceParameters::default())
    }
}

impl TurnRequest {
    pub fn from_voice(voice: &VoiceParameters) -> Self {
        Self {
            text: "start turn".to_string(),
            voice: voice.voice.clone(),
            speed: voice.speed,
            volume: voice.volume,
            pitch: voice.pitch,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest<'a> {
    session_id: &'a str,
    success: bool,
    actual_text_length: usize,
}

/// The session bookkeeping service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    /// Opens a new billable session.
    async fn acquire(&self, request: &TurnRequest) -> Result<SessionDescriptor, NegotiationError>;

    /// Settles a session; `actual_length` is the spoken character count.
    async fn confirm(
        &self,
        session_id: &str,
        success: bool,
        actual_length: usize,
    ) -> Result<(), NegotiationError>;

    /// Revokes a session that was never used.
    async fn cancel(&self, session_id: &str) -> Result<(), NegotiationError>;
}

/// [`SessionNegotiator`] backed by the `/tts-stream` HTTP resource.
pub struct HttpSessionNegotiator {
    http: reqwest::Client,
    endpoint: String,
    token: SecretString,
}

impl HttpSessionNegotiator {
    pub fn new(
        base_url: &str,
        token: SecretString,
        timeout: Duration,
    ) -> Result<Self, NegotiationError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/tts-stream", base_url.trim_end_matches('/')),
            token,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, NegotiationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(NegotiationError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl SessionNegotiator for HttpSessionNegotiator {
    #[instrument(skip_all)]
    async fn acquire(&self, request: &TurnRequest) -> Result<SessionDescriptor, NegotiationError> {
        let response = self
            .http
            .get(&self.endpoint)
            .bearer_auth(self.token.expose_secret())
            .query(request)
            .send()
            .await?;
        let descriptor: SessionDescriptor = Self::check(response).await?.json().await?;
        info!(session_id = %descriptor.session_id, "Acquired synthesis session.");
        Ok(descriptor)
    }

    #[instrument(skip(self))]
    async fn confirm(
        &self,
        session_id: &str,
        success: bool,
        actual_length: usize,
    ) -> Result<(), NegotiationError> {
        let body = ConfirmRequest {
            session_id,
            success,
            actual_text_length: actual_length,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        info!("Session confirmed.");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel(&self, session_id: &str) -> Result<(), NegotiationError> {
        let response = self
            .http
            .delete(&self.endpoint)
            .bearer_auth(self.token.expose_secret())
            .query(&[("sessionId", session_id)])
            .send()
            .await?;
        Self::check(response).await?;
        info!("Session cancelled.");
        Ok(())
    }
}
