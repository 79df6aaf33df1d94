//! Events broadcast by the detector.
//!
//! Two audiences, two shapes:
//!
//! | Event | Consumer |
//! |-------|----------|
//! | [`VoiceEvent`] | orchestration layer (forwards utterance audio to transcription, interrupts playback on speech start) |
//! | [`DetectorStatusEvent`] | settings/UI layer |
//!
//! `VoiceEvent` stays a plain in-process value — it carries the utterance WAV
//! buffer. The UI-facing status types are serde-serializable with the
//! camelCase/lowercase wire convention used across Vivavoce surfaces.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Voice events
// ---------------------------------------------------------------------------

/// One completed utterance, delivered with [`VoiceEventKind::SpeechEnded`].
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceAudio {
    /// Standalone WAV bytes (16 kHz mono s16).
    pub wav: Vec<u8>,
    /// Duration of the delivered audio in seconds.
    pub duration_secs: f32,
    /// `false` when trimming failed and the full capture buffer was
    /// delivered instead — an oversized transcript beats a lost one.
    pub trimmed: bool,
}

/// An ordered event from the voice-activity detector.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub kind: VoiceEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEventKind {
    /// Speech onset confirmed. At most one of these is outstanding until the
    /// matching `SpeechEnded` (or a silent discard) occurs.
    SpeechStarted,
    /// The utterance ended and its audio was extracted.
    SpeechEnded(UtteranceAudio),
    /// The capture device failed; the detector is no longer listening.
    CaptureError(String),
}

// ---------------------------------------------------------------------------
// Detector status
// ---------------------------------------------------------------------------

/// Emitted whenever the detector's lifecycle state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorStatusEvent {
    pub status: DetectorStatus,
    /// Optional human-readable detail (e.g. why calibration was skipped).
    pub detail: Option<String>,
}

/// Current lifecycle state of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorStatus {
    /// Created, or stopped; not capturing.
    Idle,
    /// Capturing, measuring ambient noise; speech decisions are gated off.
    Calibrating,
    /// Actively classifying speech.
    Listening,
    /// Capture preserved, sampling suspended (playback is speaking).
    Paused,
    /// Capture failed; restart required.
    Error,
}
