//! Plays synthesized speech through the default output device.
//!
//! The cpal stream lives on its own thread for as long as the sink is open;
//! the sink only ever touches the producer half of a sample ring that the
//! device callback drains.

use crate::audio_utils::{Pcm16Decoder, StreamResampler, fan_out};
use cpal::{
    FromSample, Sample, SampleFormat, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use iflytek_tts::{AudioError, AudioOutput, AudioSink, codec::SAMPLE_RATE};
use ringbuf::{HeapCons, HeapProd, HeapRb, traits::*};
use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

const RING_SECONDS: usize = 2;
const RESAMPLER_CHUNK: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(5);
// Time for the device's own buffer to play out once the ring is empty.
const DEVICE_TAIL: Duration = Duration::from_millis(150);

fn device_error(e: impl Display) -> AudioError {
    AudioError::Device(e.to_string())
}

/// Opens a [`SpeakerSink`] per turn.
#[derive(Debug, Clone)]
pub struct SpeakerOutput {
    /// How long `write` may wait for room in the ring.
    pub write_timeout: Duration,
    /// How long `drain` may wait for the ring to empty.
    pub drain_timeout: Duration,
}

impl Default for SpeakerOutput {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl AudioOutput for SpeakerOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>, AudioError> {
        let sink = SpeakerSink::open(self.write_timeout, self.drain_timeout)?;
        Ok(Box::new(sink))
    }
}

struct DeviceReady {
    producer: HeapProd<f32>,
    played: Arc<AtomicUsize>,
    channels: usize,
    sample_rate: u32,
}

pub struct SpeakerSink {
    producer: HeapProd<f32>,
    pushed: usize,
    played: Arc<AtomicUsize>,
    decoder: Pcm16Decoder,
    resampler: Option<StreamResampler>,
    channels: usize,
    failed: Arc<AtomicBool>,
    stop: Option<mpsc::Sender<()>>,
    device_thread: Option<JoinHandle<()>>,
    write_timeout: Duration,
    drain_timeout: Duration,
}

impl SpeakerSink {
    pub fn open(write_timeout: Duration, drain_timeout: Duration) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let device_thread = thread::Builder::new()
            .name("speaker".to_string())
            .spawn(move || run_device(ready_tx, stop_rx, flag))
            .map_err(device_error)?;

        let ready = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = device_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = device_thread.join();
                return Err(AudioError::Device("speaker thread exited early".to_string()));
            }
        };

        let mut sink = Self {
            producer: ready.producer,
            pushed: 0,
            played: ready.played,
            decoder: Pcm16Decoder::default(),
            resampler: None,
            channels: ready.channels,
            failed,
            stop: Some(stop_tx),
            device_thread: Some(device_thread),
            write_timeout,
            drain_timeout,
        };
        if ready.sample_rate != SAMPLE_RATE {
            debug!(from = SAMPLE_RATE, to = ready.sample_rate, "Resampling speech for the device.");
            sink.resampler = Some(
                StreamResampler::new(SAMPLE_RATE, ready.sample_rate, RESAMPLER_CHUNK)
                    .map_err(device_error)?,
            );
        }
        Ok(sink)
    }

    fn check_device(&self) -> Result<(), AudioError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(AudioError::Device("speaker stream failed".to_string()));
        }
        Ok(())
    }

    fn push(&mut self, mut samples: &[f32]) -> Result<(), AudioError> {
        let deadline = Instant::now() + self.write_timeout;
        while !samples.is_empty() {
            self.check_device()?;
            let written = self.producer.push_slice(samples);
            self.pushed += written;
            samples = &samples[written..];
            if samples.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(AudioError::Device(
                    "timed out waiting for the speaker".to_string(),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

impl AudioSink for SpeakerSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        let mono = self.decoder.decode(pcm);
        let mono = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&mono).map_err(device_error)?,
            None => mono,
        };
        let frames = fan_out(&mono, self.channels);
        self.push(&frames)
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        if self.decoder.has_pending() {
            warn!("Dropping half a sample left at the end of the stream.");
        }
        let tail = match self.resampler.as_mut() {
            Some(resampler) => resampler.flush().map_err(device_error)?,
            None => Vec::new(),
        };
        if !tail.is_empty() {
            let frames = fan_out(&tail, self.channels);
            self.push(&frames)?;
        }

        let deadline = Instant::now() + self.drain_timeout;
        while self.played.load(Ordering::Acquire) < self.pushed {
            self.check_device()?;
            if Instant::now() >= deadline {
                return Err(AudioError::Device(
                    "timed out waiting for playback to finish".to_string(),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
        thread::sleep(DEVICE_TAIL);
        debug!("Speaker drained.");
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        // The device thread stops once its sender is gone.
        self.stop.take();
        if let Some(handle) = self.device_thread.take() {
            handle
                .join()
                .map_err(|_| AudioError::Device("speaker thread panicked".to_string()))?;
            info!("Speaker closed.");
        }
        Ok(())
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Error closing speaker.");
        }
    }
}

fn run_device(
    ready: mpsc::SyncSender<Result<DeviceReady, AudioError>>,
    stop: mpsc::Receiver<()>,
    failed: Arc<AtomicBool>,
) {
    let stream = match start_stream(failed) {
        Ok((stream, device)) => {
            if ready.send(Ok(device)).is_err() {
                return;
            }
            stream
        }
        Err(e) => {
            error!(error = %e, "Could not open speaker.");
            let _ = ready.send(Err(e));
            return;
        }
    };
    // Returns once the sink drops its sender.
    let _ = stop.recv();
    drop(stream);
    debug!("Speaker stream stopped.");
}

fn start_stream(failed: Arc<AtomicBool>) -> Result<(cpal::Stream, DeviceReady), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no default output device".to_string()))?;
    let supported = device.default_output_config().map_err(device_error)?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;

    let ring = HeapRb::<f32>::new(sample_rate as usize * channels * RING_SECONDS);
    let (producer, consumer) = ring.split();
    let played = Arc::new(AtomicUsize::new(0));
    let counter = played.clone();
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, counter, failed),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, counter, failed),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer, counter, failed),
        other => {
            return Err(AudioError::Device(format!(
                "unsupported sample format {other}"
            )));
        }
    }
    .map_err(device_error)?;
    stream.play().map_err(device_error)?;

    let name = device.name().unwrap_or_default();
    info!(device = %name, channels, sample_rate, "Speaker opened.");
    Ok((
        stream,
        DeviceReady {
            producer,
            played,
            channels,
            sample_rate,
        },
    ))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapCons<f32>,
    played: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut popped = 0;
            for sample in data.iter_mut() {
                // Underruns play silence.
                let value = match consumer.try_pop() {
                    Some(value) => {
                        popped += 1;
                        value
                    }
                    None => 0.0,
                };
                *sample = T::from_sample(value);
            }
            played.fetch_add(popped, Ordering::Release);
        },
        move |err| {
            error!(error = %err, "Speaker stream error.");
            failed.store(true, Ordering::Release);
        },
        None,
    )
}
