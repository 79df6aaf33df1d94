//! Adaptive noise-floor tracking and voice classification.
//!
//! After a calibration run establishes the initial floor, the analyzer keeps
//! a smoothed estimate that follows ambient changes *downward* freely but is
//! only pulled upward by samples judged likely to be noise. Speech bursts
//! therefore never inflate the floor — the property the whole adaptive
//! threshold depends on.
//!
//! Before calibration completes the analyzer refuses to classify: every
//! result reports no voice with zero confidence.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calibrate::{CalibrationStatus, NoiseCalibrator};

/// Upper clamp for the adaptive threshold on the normalized scale.
pub const MAX_ADAPTIVE_THRESHOLD: f32 = 0.8;

/// Threshold reported before calibration: nothing crosses it.
const NO_SIGNAL_THRESHOLD: f32 = 1.0;

/// Below this noise estimate the SNR is numerically meaningless; report a
/// fixed "effectively silent room" figure instead.
const NOISE_EPSILON: f32 = 1e-3;
const SILENT_ROOM_SNR_DB: f32 = 60.0;

/// Normalization margin for the SNR share of the confidence blend.
const SNR_CONFIDENCE_MARGIN_DB: f32 = 5.0;

/// Tuning for the analyzer and its embedded calibrator.
///
/// One structure, three named constructors. The presets differ only in
/// numbers, never in shape, so adding a field cannot leave one of them
/// behind.
#[derive(Debug, Clone)]
pub struct NoiseAnalyzerConfig {
    /// Length of the calibration listening window.
    pub calibration_duration: std::time::Duration,
    /// Minimum samples for a calibration run to produce a result.
    pub min_calibration_samples: usize,
    /// SNR a sample must reach to count as voice, in dB.
    pub snr_threshold_db: f32,
    /// Margin added to the noise floor to form the adaptive threshold.
    pub min_signal_above_noise: f32,
    /// EMA weight for noise-floor updates, 0..1.
    pub noise_smoothing: f32,
    /// Rolling window length for mean/deviation statistics, in samples.
    pub statistical_window: usize,
    /// Noise floor above which the environment warning trips.
    pub max_acceptable_noise: f32,
    /// Absolute level floor below which nothing is classified as voice.
    pub min_absolute_level: f32,
}

impl Default for NoiseAnalyzerConfig {
    fn default() -> Self {
        Self {
            calibration_duration: std::time::Duration::from_millis(2_500),
            min_calibration_samples: 20,
            snr_threshold_db: 6.0,
            min_signal_above_noise: 0.08,
            noise_smoothing: 0.05,
            statistical_window: 100,
            max_acceptable_noise: 0.4,
            min_absolute_level: 0.08,
        }
    }
}

impl NoiseAnalyzerConfig {
    /// Picks up quiet speakers at the cost of more false positives.
    pub fn sensitive() -> Self {
        Self {
            snr_threshold_db: 4.0,
            min_signal_above_noise: 0.05,
            noise_smoothing: 0.1,
            max_acceptable_noise: 0.5,
            min_absolute_level: 0.05,
            ..Self::default()
        }
    }

    /// Suppresses marginal signals; for noisy rooms and shared offices.
    pub fn strict() -> Self {
        Self {
            snr_threshold_db: 9.0,
            min_signal_above_noise: 0.12,
            noise_smoothing: 0.03,
            max_acceptable_noise: 0.3,
            min_absolute_level: 0.12,
            ..Self::default()
        }
    }
}

/// One classified sample, suitable for live UI meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoiseAnalysisResult {
    /// The input level, normalized 0..1.
    pub audio_level: f32,
    /// Current smoothed noise-floor estimate.
    pub noise_level: f32,
    /// Signal-to-noise ratio in dB.
    pub snr_db: f32,
    pub is_voice_detected: bool,
    /// 0..1; for negative classifications, how clearly below threshold.
    pub confidence: f32,
    /// The live threshold voice must exceed.
    pub adaptive_threshold: f32,
    pub calibration: CalibrationStatus,
}

pub struct AdaptiveNoiseAnalyzer {
    config: NoiseAnalyzerConfig,
    calibrator: NoiseCalibrator,
    status: CalibrationStatus,
    noise_level: f32,
    window: VecDeque<f32>,
    /// Hot-reloadable copy of `config.min_absolute_level`.
    min_absolute_level: f32,
}

impl AdaptiveNoiseAnalyzer {
    pub fn new(config: NoiseAnalyzerConfig) -> Self {
        let calibrator = NoiseCalibrator::new(
            config.calibration_duration,
            config.min_calibration_samples,
        )
        .with_threshold_bounds(
            config.min_signal_above_noise,
            config.min_absolute_level,
            MAX_ADAPTIVE_THRESHOLD,
        );
        let min_absolute_level = config.min_absolute_level;

        Self {
            config,
            calibrator,
            status: CalibrationStatus::NotStarted,
            noise_level: 0.0,
            window: VecDeque::new(),
            min_absolute_level,
        }
    }

    /// Start the calibration phase; samples fed to [`analyze`] contribute to
    /// the shared pool until the window closes.
    ///
    /// [`analyze`]: Self::analyze
    pub fn begin_calibration(&mut self, now: Instant) {
        self.calibrator.begin(now);
        self.status = CalibrationStatus::InProgress { progress: 0.0 };
    }

    pub fn calibration_status(&self) -> &CalibrationStatus {
        &self.status
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self.status, CalibrationStatus::Completed { .. })
    }

    /// Hot-reload the absolute classification floor.
    pub fn set_min_absolute_level(&mut self, value: f32) {
        self.min_absolute_level = value.clamp(0.0, 1.0);
    }

    /// Live threshold: noise floor plus margin, clamped to
    /// `[min_absolute_level, MAX_ADAPTIVE_THRESHOLD]`, never below the floor
    /// estimate itself.
    pub fn adaptive_threshold(&self) -> f32 {
        if !self.is_calibrated() {
            return NO_SIGNAL_THRESHOLD;
        }
        (self.noise_level + self.config.min_signal_above_noise)
            .clamp(self.min_absolute_level, MAX_ADAPTIVE_THRESHOLD)
            .max(self.noise_level)
    }

    /// Exposed for a UI warning; never a hard error.
    pub fn is_environment_too_noisy(&self) -> bool {
        self.noise_level > self.config.max_acceptable_noise
    }

    /// Classify one normalized level sample.
    pub fn analyze(&mut self, audio_level: f32, now: Instant) -> NoiseAnalysisResult {
        let audio_level = audio_level.clamp(0.0, 1.0);

        self.window.push_back(audio_level);
        while self.window.len() > self.config.statistical_window {
            self.window.pop_front();
        }

        if let CalibrationStatus::InProgress { .. } = self.status {
            self.calibrator.push(audio_level);
            if self.calibrator.is_due(now) {
                match self.calibrator.finish(now) {
                    Ok(result) => {
                        self.noise_level = result.noise_level;
                        self.status = CalibrationStatus::Completed {
                            noise_level: result.noise_level,
                        };
                        if self.is_environment_too_noisy() {
                            warn!(
                                noise_level = self.noise_level,
                                "environment noise above acceptable level"
                            );
                        }
                    }
                    Err(e) => {
                        warn!("calibration failed: {e}");
                        self.status = CalibrationStatus::Failed {
                            reason: e.to_string(),
                        };
                    }
                }
            } else {
                self.status = CalibrationStatus::InProgress {
                    progress: self.calibrator.progress(now),
                };
            }
        }

        if !self.is_calibrated() {
            return NoiseAnalysisResult {
                audio_level,
                noise_level: self.noise_level,
                snr_db: 0.0,
                is_voice_detected: false,
                confidence: 0.0,
                adaptive_threshold: NO_SIGNAL_THRESHOLD,
                calibration: self.status.clone(),
            };
        }

        self.track_noise_floor(audio_level);

        let snr_db = self.snr_db(audio_level);
        let threshold = self.adaptive_threshold();
        let is_voice = audio_level > threshold
            && snr_db >= self.config.snr_threshold_db
            && audio_level >= self.min_absolute_level;
        let confidence = self.confidence(is_voice, audio_level, threshold, snr_db);

        debug!(
            audio_level,
            noise_level = self.noise_level,
            snr_db,
            threshold,
            is_voice,
            "analyzed sample"
        );

        NoiseAnalysisResult {
            audio_level,
            noise_level: self.noise_level,
            snr_db,
            is_voice_detected: is_voice,
            confidence,
            adaptive_threshold: threshold,
            calibration: self.status.clone(),
        }
    }

    /// Asymmetric EMA update: the floor follows ambient changes, but only
    /// samples judged "likely noise" — near the recent rolling minimum or
    /// below the current estimate — may raise it.
    fn track_noise_floor(&mut self, audio_level: f32) {
        let (rolling_min, deviation) = self.window_stats();
        let likely_noise =
            audio_level < self.noise_level || audio_level <= rolling_min + 2.0 * deviation;
        if likely_noise {
            let alpha = self.config.noise_smoothing;
            self.noise_level = (1.0 - alpha) * self.noise_level + alpha * audio_level;
        }
    }

    fn window_stats(&self) -> (f32, f32) {
        if self.window.is_empty() {
            return (0.0, 0.0);
        }
        let min = self.window.iter().copied().fold(f32::INFINITY, f32::min);
        let mean: f32 = self.window.iter().sum::<f32>() / self.window.len() as f32;
        let variance: f32 = self
            .window
            .iter()
            .map(|s| (s - mean) * (s - mean))
            .sum::<f32>()
            / self.window.len() as f32;
        (min, variance.sqrt())
    }

    fn snr_db(&self, audio_level: f32) -> f32 {
        if self.noise_level <= NOISE_EPSILON {
            return SILENT_ROOM_SNR_DB;
        }
        if audio_level <= 0.0 {
            return 0.0;
        }
        20.0 * (audio_level / self.noise_level).log10()
    }

    fn confidence(&self, is_voice: bool, audio_level: f32, threshold: f32, snr_db: f32) -> f32 {
        if is_voice {
            let margin_score =
                ((audio_level - threshold) / (threshold * 0.5).max(1e-3)).clamp(0.0, 1.0);
            let snr_score = ((snr_db - self.config.snr_threshold_db)
                / SNR_CONFIDENCE_MARGIN_DB)
                .clamp(0.0, 1.0);
            (0.6 * margin_score + 0.4 * snr_score).clamp(0.0, 1.0)
        } else {
            ((threshold - audio_level) / threshold.max(1e-3)).clamp(0.0, 1.0)
        }
    }
}
