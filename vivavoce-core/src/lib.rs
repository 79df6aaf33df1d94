//! # vivavoce-core
//!
//! Reusable voice-activity engine for the Vivavoce interview-practice app.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureSession ─┐
//!                              │ level samples (~20 Hz)
//!                    AdaptiveNoiseAnalyzer ── NoiseCalibrator
//!                              │ adaptive threshold
//!                         VadMachine
//!                              │ utterance intervals
//!                         AudioTrimmer
//!                              │
//!                 broadcast::Sender<VoiceEvent>
//! ```
//!
//! The audio callback is zero-alloc; all decisions happen on one blocking
//! loop thread owned by [`VoiceDetector`]. Consumers subscribe to broadcast
//! channels for speech events, live analysis, calibration progress, and
//! lifecycle status.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod calibrate;
pub mod detector;
pub mod error;
pub mod events;
pub mod level;
pub mod noise;
pub mod trim;

// Convenience re-exports for downstream crates
pub use calibrate::{CalibrationResult, CalibrationStatus, NoiseCalibrator};
pub use detector::{CaptureFactory, DetectorConfig, DiagnosticsSnapshot, VoiceDetector};
pub use error::VivavoceError;
pub use events::{
    DetectorStatus, DetectorStatusEvent, UtteranceAudio, VoiceEvent, VoiceEventKind,
};
pub use noise::{AdaptiveNoiseAnalyzer, NoiseAnalysisResult, NoiseAnalyzerConfig};

#[cfg(feature = "audio-cpal")]
pub use audio::capture::MicCapture;
