//! Capture boundary between the detector and the platform audio stack.
//!
//! The detector never talks to a device API directly. It drives a
//! [`CaptureSession`] — poll the current input level, take the recorded
//! buffer when an utterance completes — so the whole decision path can be
//! exercised with scripted sessions in tests.
//!
//! # Design constraints
//!
//! The real microphone implementation ([`capture::MicCapture`]) keeps the OS
//! audio callback allocation-free and lock-free: the callback writes into an
//! SPSC ring buffer and everything else (resampling, metering, buffer growth)
//! happens on the detector's loop thread. `cpal::Stream` is `!Send` on
//! Windows/macOS, so sessions are created, used, and dropped on that one
//! thread; [`CaptureSession`] deliberately has no `Send` bound.

#[cfg(feature = "audio-cpal")]
pub mod capture;
pub mod resample;

use std::io::Cursor;
use std::time::Duration;

use crate::error::{Result, VivavoceError};

/// Fixed processing rate of the engine. Capture at other device rates is
/// converted before it reaches the recording buffer.
pub const ENGINE_SAMPLE_RATE: u32 = 16_000;

/// Mono PCM recorded since the last take/discard, at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAudio {
    /// Mono s16 samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl RecordedAudio {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as a standalone WAV file (PCM s16, one channel).
    ///
    /// The transcription collaborator receives utterances as self-describing
    /// files, so the container is built here rather than at the IPC edge.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VivavoceError::Container(e.to_string()))?;
        for &sample in &self.samples {
            writer
                .write_sample(sample)
                .map_err(|e| VivavoceError::Container(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| VivavoceError::Container(e.to_string()))?;

        Ok(cursor.into_inner())
    }
}

/// One exclusively-owned audio capture session.
///
/// Opening the underlying device happens when the session is constructed;
/// dropping the session releases it. Every exit path of the detector loop —
/// normal stop, capture error, panic unwind — drops the session, which is how
/// the "capture is stopped on every exit path" guarantee is kept.
pub trait CaptureSession {
    /// Drain whatever audio arrived since the last poll into the recording
    /// buffer and return the metering level of that window in dBFS.
    ///
    /// Returns `None` when no new audio was available; the caller is expected
    /// to back off briefly rather than spin.
    fn poll_level_db(&mut self) -> Option<f32>;

    /// Duration of audio currently held in the recording buffer.
    fn recorded(&self) -> Duration;

    /// Take ownership of the recording buffer and reset the session's
    /// recording epoch. The session keeps capturing — continuous listening
    /// restarts are a buffer reset, not a device reopen.
    fn take_recording(&mut self) -> RecordedAudio;

    /// Drop the recording buffer without taking it (max-duration safety
    /// valve, or an utterance rejected before delivery).
    fn discard_recording(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_audio_duration_from_sample_count() {
        let audio = RecordedAudio::new(vec![0; 8_000], ENGINE_SAMPLE_RATE);
        assert_eq!(audio.duration(), Duration::from_millis(500));
    }

    #[test]
    fn wav_bytes_parse_back_with_same_spec() {
        let samples: Vec<i16> = (0..1_600).map(|i| (i % 256) as i16 * 64).collect();
        let audio = RecordedAudio::new(samples.clone(), ENGINE_SAMPLE_RATE);
        let bytes = audio.to_wav_bytes().expect("encode wav");

        let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes)).expect("parse wav");
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, ENGINE_SAMPLE_RATE);
        assert_eq!(spec.bits_per_sample, 16);

        let decoded: Vec<i16> = reader
            .samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .expect("decode samples");
        assert_eq!(decoded, samples);
    }

    #[test]
    fn empty_recording_is_still_a_valid_wav() {
        let audio = RecordedAudio::new(Vec::new(), ENGINE_SAMPLE_RATE);
        assert!(audio.is_empty());
        let bytes = audio.to_wav_bytes().expect("encode wav");
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes)).expect("parse wav");
        assert_eq!(reader.len(), 0);
    }
}
