use chrono::{DateTime, Local};
use hound::{SampleFormat, WavSpec, WavWriter};
use iflytek_tts::{
    AudioError, AudioRecorder,
    codec::{BIT_DEPTH, CHANNELS, SAMPLE_RATE},
};
use std::path::{Path, PathBuf};
use tracing::info;

fn persist_error(e: impl std::fmt::Display) -> AudioError {
    AudioError::Persist(e.to_string())
}

/// Writes each turn's audio to `session_<id>_<timestamp>.wav` in one directory.
#[derive(Debug, Clone)]
pub struct WavRecorder {
    dir: PathBuf,
}

impl WavRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Characters outside `[A-Za-z0-9_-]` in the session id become `_`.
    pub fn file_name(session_id: &str, at: DateTime<Local>) -> String {
        let id: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("session_{id}_{}.wav", at.format("%Y%m%d_%H%M%S"))
    }
}

impl AudioRecorder for WavRecorder {
    fn persist(&self, session_id: &str, pcm: &[u8]) -> Result<PathBuf, AudioError> {
        std::fs::create_dir_all(&self.dir).map_err(persist_error)?;
        let path = self.dir.join(Self::file_name(session_id, Local::now()));

        let spec = WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: BIT_DEPTH,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).map_err(persist_error)?;
        for sample in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
                .map_err(persist_error)?;
        }
        writer.finalize().map_err(persist_error)?;

        info!(path = %path.display(), bytes = pcm.len(), "Audio written to WAV file.");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name_format() {
        let at = Local.with_ymd_and_hms(2025, 3, 7, 9, 5, 2).unwrap();

        assert_eq!(
            WavRecorder::file_name("abc-123", at),
            "session_abc-123_20250307_090502.wav"
        );
        assert_eq!(
            WavRecorder::file_name("../evil/id", at),
            "session____evil_id_20250307_090502.wav"
        );
    }

    #[test]
    fn test_persist_writes_a_readable_wav() {
        let root = tempfile::tempdir().unwrap();
        let recorder = WavRecorder::new(root.path().join("audio_logs"));
        let samples = [0i16, 1000, -1000, i16::MAX, i16::MIN];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let path = recorder.persist("s-1", &pcm).unwrap();

        assert!(path.starts_with(recorder.dir()));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("session_s-1_") && name.ends_with(".wav"));

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        let read: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn test_persist_fails_when_directory_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();

        let err = WavRecorder::new(&blocker).persist("s-1", &[0, 0]).unwrap_err();
        assert!(matches!(err, AudioError::Persist(_)));
    }
}
