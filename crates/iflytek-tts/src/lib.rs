//! Streaming text-to-speech client for the iFlytek WebSocket synthesis protocol.
//!
//! Text fragments go out as sequenced frames while synthesized PCM comes back
//! on the same connection and is played as it arrives.

pub mod client;
pub mod codec;
mod error;
pub mod framer;
pub mod pipeline;
pub mod playback;

pub use client::{ClientConfig, ClientState, CloseReport, SessionDescriptor, StreamingClient};
pub use codec::VoiceParameters;
pub use error::{AudioError, TtsError};
pub use playback::{AudioOutput, AudioRecorder, AudioSink};
