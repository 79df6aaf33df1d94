//! Microphone capture via cpal.
//!
//! The input callback runs on an OS audio thread at elevated priority and
//! must not allocate, block, or perform I/O. It downmixes to mono into a
//! reused scratch buffer and writes through a lock-free SPSC ring; dropped
//! frames are counted atomically and reported from the poll side.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{info, warn};

use super::{CaptureSession, RecordedAudio, ENGINE_SAMPLE_RATE};
use crate::audio::resample::RateAdapter;
use crate::error::{Result, VivavoceError};
use crate::level;

/// Ring capacity in f32 samples: 2^20 ≈ 21.8 s at 48 kHz. The detector polls
/// every ~50 ms, so this only needs to absorb scheduling hiccups.
const RING_CAPACITY: usize = 1 << 20;

/// Samples popped from the ring per drain iteration.
const DRAIN_CHUNK: usize = 4_096;

/// An open microphone session recording 16 kHz mono s16.
///
/// `cpal::Stream` is `!Send`, so a `MicCapture` must be created, polled, and
/// dropped on the same thread — in practice, the detector's blocking loop.
pub struct MicCapture {
    /// Kept alive so capture continues; dropping releases the device.
    _stream: cpal::Stream,
    consumer: HeapCons<f32>,
    adapter: RateAdapter,
    recording: Vec<i16>,
    scratch: Vec<f32>,
    dropped: Arc<AtomicUsize>,
    dropped_reported: usize,
}

impl MicCapture {
    /// Open an input device by preferred name, falling back to the system
    /// default and then to the first available input.
    pub fn open(preferred_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();

        let mut selected = None;
        if let Some(name) = preferred_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected =
                        devices.find(|d| d.name().map(|n| n == name).unwrap_or(false));
                    if selected.is_none() {
                        warn!("preferred input device '{name}' not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list input devices: {e}"),
            }
        }

        let device = if let Some(device) = selected {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| VivavoceError::CaptureDevice(e.to_string()))?;
            let first = devices.next().ok_or(VivavoceError::NoDefaultInputDevice)?;
            warn!("no default input device, using first available input");
            first
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VivavoceError::CaptureDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        info!(sample_rate, channels, "input config selected");

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
        let dropped = Arc::new(AtomicUsize::new(0));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut push = MonoPush::new(producer, channels, Arc::clone(&dropped));
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| push.push(data, |s| s),
                    |err| warn!("audio stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut push = MonoPush::new(producer, channels, Arc::clone(&dropped));
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| push.push(data, |s| s as f32 / 32_768.0),
                    |err| warn!("audio stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(VivavoceError::CaptureStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VivavoceError::CaptureStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| VivavoceError::CaptureStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer,
            adapter: RateAdapter::new(sample_rate, ENGINE_SAMPLE_RATE)?,
            recording: Vec::new(),
            scratch: vec![0f32; DRAIN_CHUNK],
            dropped,
            dropped_reported: 0,
        })
    }
}

impl CaptureSession for MicCapture {
    fn poll_level_db(&mut self) -> Option<f32> {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > self.dropped_reported {
            warn!(
                frames = dropped - self.dropped_reported,
                "ring buffer overran — capture frames dropped"
            );
            self.dropped_reported = dropped;
        }

        let window_start = self.recording.len();
        loop {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                break;
            }
            let converted = self.adapter.push(&self.scratch[..n]);
            self.recording.extend(
                converted
                    .iter()
                    .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
            );
        }

        let window = &self.recording[window_start..];
        if window.is_empty() {
            return None;
        }
        let window_f32: Vec<f32> = window
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect();
        Some(level::rms_db(&window_f32))
    }

    fn recorded(&self) -> Duration {
        Duration::from_secs_f64(self.recording.len() as f64 / ENGINE_SAMPLE_RATE as f64)
    }

    fn take_recording(&mut self) -> RecordedAudio {
        RecordedAudio::new(std::mem::take(&mut self.recording), ENGINE_SAMPLE_RATE)
    }

    fn discard_recording(&mut self) {
        self.recording.clear();
    }
}

/// Downmix-to-mono writer shared by the per-format callbacks.
///
/// Owns the ring producer and a reused mix buffer; the conversion closure
/// maps the native sample type to f32 without allocating.
struct MonoPush {
    producer: HeapProd<f32>,
    channels: usize,
    mix: Vec<f32>,
    dropped: Arc<AtomicUsize>,
}

impl MonoPush {
    fn new(producer: HeapProd<f32>, channels: usize, dropped: Arc<AtomicUsize>) -> Self {
        Self {
            producer,
            channels,
            mix: Vec::new(),
            dropped,
        }
    }

    fn push<T: Copy>(&mut self, data: &[T], to_f32: impl Fn(T) -> f32) {
        let written = if self.channels <= 1 {
            self.mix.clear();
            self.mix.extend(data.iter().map(|&s| to_f32(s)));
            self.producer.push_slice(&self.mix)
        } else {
            let frames = data.len() / self.channels;
            self.mix.clear();
            self.mix.extend((0..frames).map(|f| {
                let base = f * self.channels;
                let sum: f32 = data[base..base + self.channels]
                    .iter()
                    .map(|&s| to_f32(s))
                    .sum();
                sum / self.channels as f32
            }));
            self.producer.push_slice(&self.mix)
        };

        let missed = self.mix.len() - written;
        if missed > 0 {
            self.dropped.fetch_add(missed, Ordering::Relaxed);
        }
    }
}
