//! Audio sink seams and the playback consumer that feeds them.

use crate::{
    error::AudioError,
    pipeline::{AudioConsumer, PipelineItem},
};
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A device that plays mono 16-bit 16 kHz PCM.
///
/// Every method may block. Implementations are driven from a dedicated
/// blocking thread, never from the async runtime.
pub trait AudioSink: Send {
    /// Hands one chunk to the device, waiting for room if necessary.
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Waits until everything written so far has been played.
    fn drain(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Releases the device. Called exactly once per sink.
    fn close(&mut self) -> Result<(), AudioError>;
}

/// Opens a sink for a turn.
pub trait AudioOutput: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioSink>, AudioError>;
}

/// Persists the audio collected during a turn.
pub trait AudioRecorder: Send + Sync {
    /// Writes `pcm` and returns where it ended up.
    fn persist(&self, session_id: &str, pcm: &[u8]) -> Result<PathBuf, AudioError>;
}

/// What the playback consumer hands back once it stops.
pub struct PlaybackOutcome {
    /// The sink, still open; the owner is responsible for closing it.
    pub sink: Box<dyn AudioSink>,
    pub chunks_played: usize,
    pub bytes_played: usize,
    pub result: Result<(), AudioError>,
}

/// Handle to a running playback consumer.
pub struct Playback {
    playing: Arc<AtomicBool>,
    handle: JoinHandle<PlaybackOutcome>,
}

impl Playback {
    /// Starts draining `consumer` into `sink` on a blocking thread.
    ///
    /// Once `cancel` fires the chunk being written is finished but no further
    /// chunk is started.
    pub fn spawn(
        consumer: AudioConsumer,
        sink: Box<dyn AudioSink>,
        cancel: CancellationToken,
    ) -> Self {
        let playing = Arc::new(AtomicBool::new(true));
        let flag = playing.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = play(consumer, sink, &cancel);
            flag.store(false, Ordering::Release);
            outcome
        });
        Self { playing, handle }
    }

    /// Whether the consumer is still taking chunks.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Mutable access to the join handle, for awaiting without giving it up.
    pub fn handle_mut(&mut self) -> &mut JoinHandle<PlaybackOutcome> {
        &mut self.handle
    }

    pub async fn wait(self) -> Result<PlaybackOutcome, JoinError> {
        self.handle.await
    }
}

fn play(
    mut consumer: AudioConsumer,
    mut sink: Box<dyn AudioSink>,
    cancel: &CancellationToken,
) -> PlaybackOutcome {
    info!("Starting audio playback.");
    let mut chunks_played = 0;
    let mut bytes_played = 0;
    let result = loop {
        match consumer.take() {
            PipelineItem::Chunk(pcm) => {
                if cancel.is_cancelled() {
                    debug!("Playback cancelled; dropping remaining audio.");
                    break Ok(());
                }
                if let Err(e) = sink.write(&pcm) {
                    error!(error = %e, "Error playing audio chunk.");
                    break Err(e);
                }
                chunks_played += 1;
                bytes_played += pcm.len();
            }
            PipelineItem::EndOfStream => {
                if cancel.is_cancelled() {
                    break Ok(());
                }
                break sink.drain();
            }
        }
    };
    drop(consumer);
    info!(chunks_played, bytes_played, "Audio playback finished.");
    PlaybackOutcome {
        sink,
        chunks_played,
        bytes_played,
        result,
    }
}
