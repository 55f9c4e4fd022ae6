use crate::client::ClientState;
use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// Failures of the audio device or the recording target.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Failed to persist audio: {0}")]
    Persist(String),
}

/// Errors that end a streaming turn.
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("Failed to connect to synthesis endpoint: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("Timed out after {0:?} connecting to synthesis endpoint")]
    ConnectTimeout(Duration),
    #[error("Failed to send text frame: {0}")]
    Send(#[source] tungstenite::Error),
    #[error("Timed out after {0:?} sending text frame")]
    SendTimeout(Duration),
    #[error("Failed to encode text frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Connection closed before the audio stream finished")]
    ConnectionLost,
    #[error("Timed out after {0:?} waiting for the audio stream to drain")]
    DrainTimeout(Duration),
    #[error("Turn was cancelled")]
    Cancelled,
    #[error("Audio playback failed: {0}")]
    Playback(#[from] AudioError),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Operation requires state {expected}, but client is {actual}")]
    InvalidState {
        expected: ClientState,
        actual: ClientState,
    },
}
