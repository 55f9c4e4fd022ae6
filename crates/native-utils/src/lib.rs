//! Native audio plumbing: PCM conversion, the speaker sink and WAV recording.

pub mod audio_utils;
pub mod speaker;
pub mod wav;

pub use speaker::{SpeakerOutput, SpeakerSink};
pub use wav::WavRecorder;
