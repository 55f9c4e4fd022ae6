//! One billable turn from session acquisition to settlement.

use crate::{
    negotiation::{NegotiationError, SessionNegotiator, TurnRequest},
    session::Session,
};
use futures::Stream;
use iflytek_tts::{
    AudioError, AudioOutput, AudioRecorder, ClientConfig, StreamingClient, TtsError,
};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{Span, error, field, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub client: ClientConfig,
    pub request: TurnRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub session_id: String,
    /// What was actually spoken.
    pub assistant_text: String,
    pub recording: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("Could not get a synthesis session: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("Session {session_id}: audio output unavailable: {source}")]
    Audio {
        session_id: String,
        #[source]
        source: AudioError,
        /// Set when the failed session could not be confirmed either.
        confirmation: Option<NegotiationError>,
    },
    #[error("Session {session_id}: streaming failed: {source}")]
    Stream {
        session_id: String,
        #[source]
        source: TtsError,
    },
    #[error("Session {session_id} was interrupted")]
    Interrupted { session_id: String },
    #[error("Session {session_id} played but could not be confirmed: {source}")]
    Confirmation {
        session_id: String,
        #[source]
        source: NegotiationError,
    },
}

/// Runs turns so that every acquired session is settled exactly once and
/// every opened connection and device is released, whatever happens.
pub struct TurnManager {
    negotiator: Arc<dyn SessionNegotiator>,
    output: Arc<dyn AudioOutput>,
    recorder: Option<Arc<dyn AudioRecorder>>,
    config: TurnConfig,
    interrupt: CancellationToken,
}

impl TurnManager {
    pub fn new(
        negotiator: Arc<dyn SessionNegotiator>,
        output: Arc<dyn AudioOutput>,
        config: TurnConfig,
    ) -> Self {
        Self {
            negotiator,
            output,
            recorder: None,
            config,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn AudioRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Cancelling this token stops the running turn and every later one.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Speaks `fragments` in a freshly acquired session.
    #[instrument(skip_all, fields(session_id = field::Empty))]
    pub async fn run_turn<S>(&self, fragments: S) -> Result<TurnOutcome, TurnError>
    where
        S: Stream<Item = String> + Send,
    {
        let descriptor = self.negotiator.acquire(&self.config.request).await?;
        let session_id = descriptor.session_id.clone();
        Span::current().record("session_id", session_id.as_str());
        let mut session = Session::new(descriptor.clone());

        let sink = match self.output.open() {
            Ok(sink) => sink,
            Err(e) => {
                error!(error = %e, "Could not open audio output.");
                let confirmed = self.settle(&mut session, false, 0).await;
                return Err(TurnError::Audio {
                    session_id,
                    source: e,
                    confirmation: confirmed.err(),
                });
            }
        };

        let mut client = StreamingClient::new(self.config.client.clone(), descriptor, sink)
            .with_cancellation(self.interrupt.child_token());
        if let Some(recorder) = &self.recorder {
            client = client.with_recorder(recorder.clone());
        }

        let streamed = stream_turn(&mut client, &mut session, fragments).await;
        let actual_length = client.sent_chars();
        let confirmed = self
            .settle(&mut session, streamed.is_ok(), actual_length)
            .await;
        let report = client.close().await;
        if !report.clean {
            warn!("Turn resources were not released cleanly.");
        }

        match (streamed, confirmed) {
            (Ok(assistant_text), Ok(())) => Ok(TurnOutcome {
                session_id,
                assistant_text,
                recording: report.recording,
            }),
            (Ok(_), Err(source)) => Err(TurnError::Confirmation { session_id, source }),
            (Err(TtsError::Cancelled), _) if self.interrupt.is_cancelled() => {
                Err(TurnError::Interrupted { session_id })
            }
            (Err(source), _) => Err(TurnError::Stream { session_id, source }),
        }
    }

    /// Revokes a session that was acquired but never used.
    pub async fn cancel_session(&self, session_id: &str) -> Result<(), TurnError> {
        self.negotiator.cancel(session_id).await?;
        Ok(())
    }

    async fn settle(
        &self,
        session: &mut Session,
        success: bool,
        actual_length: usize,
    ) -> Result<(), NegotiationError> {
        let confirmed = self
            .negotiator
            .confirm(session.id(), success, actual_length)
            .await;
        let transition = if success && confirmed.is_ok() {
            session.confirm()
        } else {
            session.fail()
        };
        if let Err(e) = transition {
            warn!(error = %e, "Session state out of step.");
        }
        match &confirmed {
            Ok(()) => info!(success, actual_length, state = %session.state(), "Session settled."),
            Err(e) => error!(error = %e, success, "Failed to confirm session."),
        }
        confirmed
    }
}

async fn stream_turn<S>(
    client: &mut StreamingClient,
    session: &mut Session,
    fragments: S,
) -> Result<String, TtsError>
where
    S: Stream<Item = String>,
{
    client.connect().await?;
    if let Err(e) = session.activate() {
        warn!(error = %e, "Session state out of step.");
    }
    let spoken = client.send_text(fragments).await?;
    client.finish().await?;
    Ok(spoken)
}
