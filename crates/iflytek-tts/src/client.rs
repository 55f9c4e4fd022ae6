//! Drives one synthesis turn over a duplex WebSocket connection.
//!
//! The send path frames text fragments onto the socket while a receive task
//! decodes inbound audio into the [`crate::pipeline`] and a blocking playback
//! task drains it into the audio sink.

use crate::{
    codec::{InboundEvent, OutboundFrame, VoiceParameters, decode_inbound},
    error::{AudioError, TtsError},
    framer::TextFramer,
    pipeline::{AudioProducer, DEFAULT_CAPACITY, audio_pipeline},
    playback::{AudioRecorder, AudioSink, Playback},
};
use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use serde::Deserialize;
use std::{fmt, path::PathBuf, pin::pin, sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    task::JoinHandle,
    time::{Instant, sleep, timeout, timeout_at},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Where and how to synthesize one turn, as handed out by the session service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    #[serde(rename = "websocketUrl")]
    pub endpoint: String,
    #[serde(default)]
    pub parameters: VoiceParameters,
}

/// Tunables for a [`StreamingClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application id placed in every frame header.
    pub app_id: String,
    pub connect_timeout: Duration,
    /// Upper bound for writing a single frame.
    pub send_timeout: Duration,
    /// Upper bound for the audio stream to finish once all text is sent.
    pub drain_timeout: Duration,
    /// Upper bound for each teardown step.
    pub close_timeout: Duration,
    /// Pause between consecutive frames.
    pub frame_pacing: Duration,
    pub pipeline_capacity: usize,
}

impl ClientConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(5),
            frame_pacing: Duration::from_millis(50),
            pipeline_capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Idle => write!(f, "idle"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Active => write!(f, "active"),
            ClientState::Draining => write!(f, "draining"),
            ClientState::Closed => write!(f, "closed"),
        }
    }
}

/// How the receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The service marked the audio stream finished.
    Finished,
    /// The connection went away first.
    ConnectionLost,
    /// The loop was told to stop.
    Cancelled,
}

/// Everything the receive loop collected.
#[derive(Debug)]
pub struct ReceiveReport {
    /// All received PCM, in arrival order.
    pub audio: Vec<u8>,
    pub chunks: usize,
    pub server_errors: usize,
    pub unparseable: usize,
    pub end: StreamEnd,
}

/// Result of [`StreamingClient::close`].
#[derive(Debug, Default)]
pub struct CloseReport {
    pub audio_bytes: usize,
    pub recording: Option<PathBuf>,
    /// False if any teardown step failed.
    pub clean: bool,
}

/// Reads inbound messages until the audio stream finishes, the connection
/// drops, or `cancel` fires.
///
/// Audio goes to `producer` and into the returned buffer. Server errors and
/// unparseable messages are logged and skipped. The pipeline always sees its
/// end-of-stream marker, or the producer is dropped, which reads the same.
pub async fn receive_loop<S>(
    mut inbound: S,
    mut producer: AudioProducer,
    cancel: CancellationToken,
) -> ReceiveReport
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut audio = Vec::new();
    let mut chunks = 0;
    let mut server_errors = 0;
    let mut unparseable = 0;
    let mut consumer_gone = false;

    let end = 'receive: loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break 'receive StreamEnd::Cancelled,
            message = inbound.next() => message,
        };
        let events = match message {
            Some(Ok(Message::Text(text))) => decode_inbound(text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => decode_inbound(text),
                Err(_) => {
                    warn!(len = data.len(), "Ignoring non-UTF-8 binary message.");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                warn!(?frame, "WebSocket connection closed by server.");
                break StreamEnd::ConnectionLost;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!(error = %e, "Error receiving audio.");
                break StreamEnd::ConnectionLost;
            }
            None => {
                warn!("WebSocket stream ended.");
                break StreamEnd::ConnectionLost;
            }
        };

        for event in events {
            match event {
                InboundEvent::Audio(pcm) => {
                    audio.extend_from_slice(&pcm);
                    chunks += 1;
                    if consumer_gone {
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break 'receive StreamEnd::Cancelled,
                        pushed = producer.push(pcm) => if pushed.is_err() {
                            warn!("Playback stopped; still collecting audio.");
                            consumer_gone = true;
                        },
                    }
                }
                InboundEvent::ServerError { code, message } => {
                    server_errors += 1;
                    warn!(code, %message, "Server error; skipping message.");
                }
                InboundEvent::Unparseable { raw, reason } => {
                    unparseable += 1;
                    warn!(%reason, %raw, "Ignoring unparseable message.");
                }
                InboundEvent::EndOfStream => {
                    info!("Audio stream finished.");
                    break 'receive StreamEnd::Finished;
                }
            }
        }
    };

    match end {
        StreamEnd::Cancelled => drop(producer),
        StreamEnd::Finished | StreamEnd::ConnectionLost => producer.push_end_of_stream().await,
    }

    ReceiveReport {
        audio,
        chunks,
        server_errors,
        unparseable,
        end,
    }
}

/// Client for a single turn: `connect`, `send_text`, `finish`, then `close`.
///
/// `close` must be called on every path, including after an error; it is
/// what releases the connection and the audio sink.
pub struct StreamingClient {
    config: ClientConfig,
    descriptor: SessionDescriptor,
    state: ClientState,
    cancel: CancellationToken,
    receive_cancel: CancellationToken,
    sink: Option<Box<dyn AudioSink>>,
    recorder: Option<Arc<dyn AudioRecorder>>,
    writer: Option<WsSink>,
    receiver: Option<JoinHandle<ReceiveReport>>,
    playback: Option<Playback>,
    audio: Vec<u8>,
    spoken: String,
    frames_sent: u32,
    sent_chars: usize,
}

impl StreamingClient {
    pub fn new(
        config: ClientConfig,
        descriptor: SessionDescriptor,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let receive_cancel = cancel.child_token();
        Self {
            config,
            descriptor,
            state: ClientState::Idle,
            cancel,
            receive_cancel,
            sink: Some(sink),
            recorder: None,
            writer: None,
            receiver: None,
            playback: None,
            audio: Vec::new(),
            spoken: String::new(),
            frames_sent: 0,
            sent_chars: 0,
        }
    }

    /// Persists collected audio through `recorder` on close.
    pub fn with_recorder(mut self, recorder: Arc<dyn AudioRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Stops the turn promptly once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.receive_cancel = cancel.child_token();
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.descriptor.session_id
    }

    pub fn frames_sent(&self) -> u32 {
        self.frames_sent
    }

    /// Text of every fragment framed so far, even if sending later failed.
    pub fn spoken_text(&self) -> &str {
        self.spoken.trim()
    }

    /// Characters of trimmed text in frames the connection accepted. This is
    /// what the turn is billed for.
    pub fn sent_chars(&self) -> usize {
        self.sent_chars
    }

    /// Whether the playback consumer is still running.
    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(Playback::is_playing)
    }

    fn expect_state(&self, expected: ClientState) -> Result<(), TtsError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TtsError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Opens the connection and starts the receive and playback tasks.
    pub async fn connect(&mut self) -> Result<(), TtsError> {
        self.expect_state(ClientState::Idle)?;
        if self.cancel.is_cancelled() {
            return Err(TtsError::Cancelled);
        }
        self.state = ClientState::Connecting;
        info!(session_id = %self.descriptor.session_id, "Connecting to synthesis WebSocket...");

        let connect_timeout = self.config.connect_timeout;
        let ws_stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TtsError::Cancelled),
            result = timeout(connect_timeout, connect_async(self.descriptor.endpoint.as_str())) => match result {
                Ok(Ok((ws_stream, _))) => ws_stream,
                Ok(Err(e)) => return Err(TtsError::Connect(e)),
                Err(_) => return Err(TtsError::ConnectTimeout(connect_timeout)),
            },
        };
        info!("WebSocket connection successful.");

        let Some(sink) = self.sink.take() else {
            return Err(TtsError::Playback(AudioError::Device(
                "audio sink already released".to_string(),
            )));
        };
        let (writer, reader) = ws_stream.split();
        let (producer, consumer) = audio_pipeline(self.config.pipeline_capacity);

        self.playback = Some(Playback::spawn(consumer, sink, self.cancel.child_token()));
        let span = info_span!("tts_receive", session_id = %self.descriptor.session_id);
        self.receiver = Some(tokio::spawn(
            receive_loop(reader, producer, self.receive_cancel.clone()).instrument(span),
        ));
        self.writer = Some(writer);
        self.state = ClientState::Active;
        Ok(())
    }

    /// Frames and sends every fragment, returning the text that was spoken.
    ///
    /// A source that yields nothing speakable sends no frames and is not an
    /// error.
    pub async fn send_text<S>(&mut self, fragments: S) -> Result<String, TtsError>
    where
        S: Stream<Item = String>,
    {
        self.expect_state(ClientState::Active)?;
        info!("Starting to send text stream.");

        let cancel = self.cancel.clone();
        let mut framer = TextFramer::new(
            self.config.app_id.clone(),
            self.descriptor.parameters.clone(),
        );
        let mut fragments = pin!(fragments);
        loop {
            let fragment = tokio::select! {
                _ = cancel.cancelled() => return Err(TtsError::Cancelled),
                fragment = fragments.next() => fragment,
            };
            let Some(fragment) = fragment else { break };
            let frame = framer.push(&fragment);
            self.spoken = framer.spoken_text().to_string();
            if let Some(frame) = frame {
                self.send_frame(frame).await?;
            }
        }
        match framer.finish() {
            Some(frame) => self.send_frame(frame).await?,
            None => info!("Text stream was empty; nothing sent."),
        }

        self.state = ClientState::Draining;
        info!(frames = self.frames_sent, "Text stream sent.");
        Ok(framer.spoken_text().to_string())
    }

    async fn send_frame(&mut self, frame: OutboundFrame) -> Result<(), TtsError> {
        let cancel = self.cancel.clone();
        if self.frames_sent > 0 && !self.config.frame_pacing.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TtsError::Cancelled),
                _ = sleep(self.config.frame_pacing) => {}
            }
        }

        let payload = frame.to_json()?;
        debug!(seq = frame.seq(), status = frame.status().code(), "Sending text frame.");
        let send_timeout = self.config.send_timeout;
        let Some(writer) = self.writer.as_mut() else {
            return Err(TtsError::InvalidState {
                expected: ClientState::Active,
                actual: self.state,
            });
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(TtsError::Cancelled),
            result = timeout(send_timeout, writer.send(Message::Text(payload.into()))) => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TtsError::Send(e)),
                Err(_) => return Err(TtsError::SendTimeout(send_timeout)),
            },
        }
        self.frames_sent += 1;
        self.sent_chars += frame.text_chars();
        Ok(())
    }

    /// Waits for the audio stream to end and for playback to drain.
    ///
    /// Audio received before a lost connection is kept for `close`, but the
    /// turn is reported as [`TtsError::ConnectionLost`].
    pub async fn finish(&mut self) -> Result<(), TtsError> {
        self.expect_state(ClientState::Draining)?;
        if self.frames_sent == 0 {
            // Nothing was asked for, so nothing will arrive.
            self.receive_cancel.cancel();
        }

        let drain_timeout = self.config.drain_timeout;
        let deadline = Instant::now() + drain_timeout;
        let cancel = self.cancel.clone();

        let Some(receiver) = self.receiver.as_mut() else {
            return Err(TtsError::InvalidState {
                expected: ClientState::Active,
                actual: self.state,
            });
        };
        let joined = tokio::select! {
            _ = cancel.cancelled() => return Err(TtsError::Cancelled),
            joined = timeout_at(deadline, receiver) => joined,
        };
        let Ok(joined) = joined else {
            return Err(TtsError::DrainTimeout(drain_timeout));
        };
        self.receiver = None;
        let report = joined?;
        info!(
            chunks = report.chunks,
            bytes = report.audio.len(),
            server_errors = report.server_errors,
            unparseable = report.unparseable,
            end = ?report.end,
            "Receive loop finished."
        );
        self.audio = report.audio;

        if let Some(playback) = self.playback.as_mut() {
            let joined = tokio::select! {
                _ = cancel.cancelled() => return Err(TtsError::Cancelled),
                joined = timeout_at(deadline, playback.handle_mut()) => joined,
            };
            let Ok(joined) = joined else {
                return Err(TtsError::DrainTimeout(drain_timeout));
            };
            self.playback = None;
            let outcome = joined?;
            self.sink = Some(outcome.sink);
            outcome.result?;
        }

        match report.end {
            StreamEnd::Finished => Ok(()),
            StreamEnd::ConnectionLost => Err(TtsError::ConnectionLost),
            StreamEnd::Cancelled if self.frames_sent == 0 => Ok(()),
            StreamEnd::Cancelled => Err(TtsError::Cancelled),
        }
    }

    /// Connects, sends every fragment and waits for playback to finish.
    pub async fn run<S>(&mut self, fragments: S) -> Result<String, TtsError>
    where
        S: Stream<Item = String>,
    {
        self.connect().await?;
        let spoken = self.send_text(fragments).await?;
        self.finish().await?;
        Ok(spoken)
    }

    /// Tears the turn down from whatever state it is in.
    ///
    /// Every step is attempted even if an earlier one fails. Calling it again
    /// is a no-op.
    pub async fn close(&mut self) -> CloseReport {
        if self.state == ClientState::Closed {
            return CloseReport {
                clean: true,
                ..Default::default()
            };
        }
        let close_timeout = self.config.close_timeout;
        let mut clean = true;

        // Anything still running stops at its next suspension point.
        self.cancel.cancel();

        if let Some(mut writer) = self.writer.take() {
            match timeout(close_timeout, writer.close()).await {
                Ok(Ok(())) => info!("WebSocket connection closed."),
                Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    debug!("WebSocket connection was already closed.")
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Error closing WebSocket connection.");
                    clean = false;
                }
                Err(_) => {
                    warn!("Timed out closing WebSocket connection.");
                    clean = false;
                }
            }
        }

        if let Some(mut receiver) = self.receiver.take() {
            match timeout(close_timeout, &mut receiver).await {
                Ok(Ok(report)) => self.audio = report.audio,
                Ok(Err(e)) => {
                    error!(error = %e, "Receive task failed.");
                    clean = false;
                }
                Err(_) => {
                    warn!("Receive task did not stop in time; aborting it.");
                    receiver.abort();
                    clean = false;
                }
            }
        }

        if let Some(mut playback) = self.playback.take() {
            match timeout(close_timeout, playback.handle_mut()).await {
                Ok(Ok(outcome)) => {
                    if let Err(e) = outcome.result {
                        warn!(error = %e, "Playback ended with an error.");
                    }
                    self.sink = Some(outcome.sink);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Playback task failed.");
                    clean = false;
                }
                Err(_) => {
                    warn!("Playback did not stop in time; its device is released when it does.");
                    clean = false;
                }
            }
        }

        let audio = std::mem::take(&mut self.audio);
        let audio_bytes = audio.len();
        let recording = match (&self.recorder, audio.is_empty()) {
            (_, true) => {
                info!("No audio to save.");
                None
            }
            (None, false) => None,
            (Some(recorder), false) => {
                let recorder = recorder.clone();
                let session_id = self.descriptor.session_id.clone();
                match tokio::task::spawn_blocking(move || recorder.persist(&session_id, &audio)).await {
                    Ok(Ok(path)) => {
                        info!(path = %path.display(), bytes = audio_bytes, "Audio saved.");
                        Some(path)
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Failed to save audio.");
                        clean = false;
                        None
                    }
                    Err(e) => {
                        error!(error = %e, "Audio save task failed.");
                        clean = false;
                        None
                    }
                }
            }
        };

        if let Some(mut sink) = self.sink.take() {
            match tokio::task::spawn_blocking(move || sink.close()).await {
                Ok(Ok(())) => info!("Audio resources released."),
                Ok(Err(e)) => {
                    warn!(error = %e, "Error releasing audio device.");
                    clean = false;
                }
                Err(e) => {
                    error!(error = %e, "Audio release task failed.");
                    clean = false;
                }
            }
        }

        self.state = ClientState::Closed;
        CloseReport {
            audio_bytes,
            recording,
            clean,
        }
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
