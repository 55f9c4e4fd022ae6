use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Interprets little-endian PCM16 bytes as samples normalized to -1.0..=1.0.
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Decodes a PCM16 byte stream that may be split at odd offsets.
///
/// A trailing odd byte is held and joined with the first byte of the next
/// chunk, so sample alignment survives arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct Pcm16Decoder {
    carry: Option<u8>,
}

impl Pcm16Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<f32> {
        let Some(low) = self.carry.take() else {
            if bytes.len() % 2 == 1 {
                self.carry = bytes.last().copied();
            }
            return pcm16_to_f32(bytes);
        };
        let Some((&high, rest)) = bytes.split_first() else {
            self.carry = Some(low);
            return Vec::new();
        };
        let mut samples = pcm16_to_f32(&[low, high]);
        if rest.len() % 2 == 1 {
            self.carry = rest.last().copied();
        }
        samples.extend(pcm16_to_f32(rest));
        samples
    }

    /// Whether half a sample is waiting for its other byte.
    pub fn has_pending(&self) -> bool {
        self.carry.is_some()
    }
}

/// Repeats every mono sample across `channels` interleaved channels.
pub fn fan_out(mono: &[f32], channels: usize) -> Vec<f32> {
    mono.iter()
        .flat_map(|&sample| std::iter::repeat_n(sample, channels.max(1)))
        .collect()
}

/// Mono resampler that accepts input of any length.
///
/// Input is fed to rubato in fixed-size chunks; whatever does not fill a
/// chunk waits for the next call or for [`StreamResampler::flush`].
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        Ok(Self {
            resampler: create_resampler(in_rate as f64, out_rate as f64, chunk_size)?,
            pending: Vec::with_capacity(chunk_size),
        })
    }

    pub fn process(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk = [self.pending.drain(..needed).collect::<Vec<f32>>()];
            let resampled = self.resampler.process(&chunk[..], None)?;
            output.extend_from_slice(&resampled[0]);
        }
        Ok(output)
    }

    /// Resamples whatever is still buffered.
    pub fn flush(&mut self) -> anyhow::Result<Vec<f32>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let rest = [std::mem::take(&mut self.pending)];
        let resampled = self.resampler.process_partial(Some(&rest[..]), None)?;
        Ok(resampled.into_iter().next().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 48000.0, 1024).is_ok());
        assert!(create_resampler(16000.0, 16000.0, 1024).is_ok());
        assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
    }

    #[test]
    fn test_pcm16_to_f32() {
        // 16384 = [0x00, 0x40], -32768 = [0x00, 0x80]
        let result = pcm16_to_f32(&[0x00, 0x40, 0x00, 0x80]);
        assert_eq!(result.len(), 2);
        assert_abs_diff_eq!(result[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);

        assert!(pcm16_to_f32(&[]).is_empty());
        assert!(pcm16_to_f32(&[0x00]).is_empty());
        assert_eq!(pcm16_to_f32(&[0x00, 0x40, 0x01]).len(), 1);
    }

    #[test]
    fn test_decoder_keeps_alignment_across_odd_chunks() {
        // Samples 16384, -32768, 8192 split as 3 + 1 + 2 bytes.
        let bytes = [0x00, 0x40, 0x00, 0x80, 0x00, 0x20];
        let mut decoder = Pcm16Decoder::default();

        let first = decoder.decode(&bytes[..3]);
        assert_eq!(first.len(), 1);
        assert_abs_diff_eq!(first[0], 0.5, epsilon = 0.0001);
        assert!(decoder.has_pending());

        let second = decoder.decode(&bytes[3..4]);
        assert_eq!(second.len(), 1);
        assert_abs_diff_eq!(second[0], -1.0, epsilon = 0.0001);
        assert!(!decoder.has_pending());

        let third = decoder.decode(&bytes[4..]);
        assert_eq!(third.len(), 1);
        assert_abs_diff_eq!(third[0], 0.25, epsilon = 0.0001);
    }

    #[test]
    fn test_decoder_single_bytes_and_empty_chunks() {
        let mut decoder = Pcm16Decoder::default();
        assert!(decoder.decode(&[0x00]).is_empty());
        assert!(decoder.decode(&[]).is_empty());
        assert!(decoder.has_pending());

        let samples = decoder.decode(&[0x40, 0x00]);
        assert_eq!(samples.len(), 1);
        assert_abs_diff_eq!(samples[0], 0.5, epsilon = 0.0001);
        assert!(decoder.has_pending());
    }

    #[test]
    fn test_fan_out() {
        assert_eq!(fan_out(&[0.1, 0.2], 2), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(fan_out(&[0.3], 1), vec![0.3]);
        assert_eq!(fan_out(&[0.3], 0), vec![0.3]);
    }

    #[test]
    fn test_stream_resampler_tracks_the_rate_ratio() {
        let mut resampler = StreamResampler::new(16_000, 48_000, 256).unwrap();
        let input = vec![0.25f32; 1000];

        let mut output = Vec::new();
        for piece in input.chunks(333) {
            output.extend(resampler.process(piece).unwrap());
        }
        output.extend(resampler.flush().unwrap());

        // Three times the input, give or take the resampler's delay and padding.
        assert!(output.len() >= 2700 && output.len() <= 3900, "got {}", output.len());
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_stream_resampler_holds_short_input() {
        let mut resampler = StreamResampler::new(16_000, 44_100, 512).unwrap();
        assert!(resampler.process(&[0.0; 100]).unwrap().is_empty());
        assert!(!resampler.flush().unwrap().is_empty());
    }
}
