//! Ambient-noise calibration.
//!
//! A calibration run listens for a fixed window, collects normalized level
//! samples at the sampler cadence, and derives a noise floor and a
//! recommended speech-start threshold from percentile statistics. The
//! percentile (rather than a mean or median) keeps one door slam or keyboard
//! burst from inflating the floor.
//!
//! Runs that collect fewer than the minimum sample count report
//! [`VivavoceError::InsufficientCalibrationSamples`]; there is no fabricated
//! default result, so a failed run is always distinguishable from a real one.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::CaptureSession;
use crate::error::{Result, VivavoceError};
use crate::level;

/// Noise floor = this percentile of the sorted sample set.
const NOISE_PERCENTILE: f32 = 0.90;

/// Collecting this multiple of the minimum sample count ends a run early.
/// Trades a little statistical robustness for responsiveness; the window
/// duration itself is never shortened silently.
const EARLY_EXIT_FACTOR: usize = 3;

/// Progress cadence for UI consumption.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one completed calibration run. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    /// Estimated ambient noise floor, normalized 0..1.
    pub noise_level: f32,
    /// Suggested speech-start threshold: noise floor plus margin, clamped.
    pub recommended_threshold: f32,
    /// Level samples that contributed to the estimate.
    pub samples_collected: usize,
    /// Wall-clock length of the run in seconds.
    pub duration_secs: f32,
}

/// Calibration lifecycle, as shown to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CalibrationStatus {
    NotStarted,
    InProgress { progress: f32 },
    Completed { noise_level: f32 },
    Failed { reason: String },
}

/// Push-based calibration core.
///
/// Deliberately clock-parameterized: callers pass `Instant`s in, so the whole
/// window logic is unit-testable without sleeping. The blocking runner
/// [`calibrate_session`] owns the pacing.
#[derive(Debug, Clone)]
pub struct NoiseCalibrator {
    duration: Duration,
    min_samples: usize,
    margin: f32,
    threshold_floor: f32,
    threshold_ceil: f32,
    started_at: Option<Instant>,
    samples: Vec<f32>,
}

impl NoiseCalibrator {
    /// Default margin added to the noise floor for the recommended threshold.
    pub const DEFAULT_MARGIN: f32 = 0.08;
    /// Default clamp bounds for the recommended threshold.
    pub const DEFAULT_THRESHOLD_FLOOR: f32 = 0.08;
    pub const DEFAULT_THRESHOLD_CEIL: f32 = 0.8;

    pub fn new(duration: Duration, min_samples: usize) -> Self {
        Self {
            duration,
            min_samples,
            margin: Self::DEFAULT_MARGIN,
            threshold_floor: Self::DEFAULT_THRESHOLD_FLOOR,
            threshold_ceil: Self::DEFAULT_THRESHOLD_CEIL,
            started_at: None,
            samples: Vec::new(),
        }
    }

    /// Override the margin and clamp bounds applied to the recommendation.
    pub fn with_threshold_bounds(mut self, margin: f32, floor: f32, ceil: f32) -> Self {
        self.margin = margin;
        self.threshold_floor = floor;
        self.threshold_ceil = ceil;
        self
    }

    /// Start (or restart) a run at `now`, discarding prior samples.
    pub fn begin(&mut self, now: Instant) {
        self.started_at = Some(now);
        self.samples.clear();
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Record one normalized level sample. Ignored unless a run is active.
    pub fn push(&mut self, sample: f32) {
        if self.started_at.is_some() {
            self.samples.push(sample.clamp(0.0, 1.0));
        }
    }

    /// Fraction of the window elapsed, clamped to 1.0.
    pub fn progress(&self, now: Instant) -> f32 {
        match self.started_at {
            Some(started) => {
                let elapsed = now.saturating_duration_since(started).as_secs_f32();
                (elapsed / self.duration.as_secs_f32()).clamp(0.0, 1.0)
            }
            None => 0.0,
        }
    }

    /// Whether the run should finish: the window elapsed, or enough samples
    /// accumulated for the early exit.
    pub fn is_due(&self, now: Instant) -> bool {
        let Some(started) = self.started_at else {
            return false;
        };
        now.saturating_duration_since(started) >= self.duration
            || self.samples.len() >= self.min_samples.saturating_mul(EARLY_EXIT_FACTOR)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Close the run and derive the result.
    ///
    /// # Errors
    /// [`VivavoceError::InsufficientCalibrationSamples`] when fewer than the
    /// minimum were collected — the run produced no usable estimate.
    pub fn finish(&mut self, now: Instant) -> Result<CalibrationResult> {
        let started = self.started_at.take().unwrap_or(now);
        let elapsed = now.saturating_duration_since(started);
        let mut samples = std::mem::take(&mut self.samples);

        if samples.len() < self.min_samples {
            return Err(VivavoceError::InsufficientCalibrationSamples {
                collected: samples.len(),
                required: self.min_samples,
            });
        }

        samples.sort_by(|a, b| a.total_cmp(b));
        let noise_level = percentile(&samples, NOISE_PERCENTILE);
        // The ordering invariant (threshold ≥ noise) wins over the ceiling in
        // pathologically loud rooms; the analyzer's too-noisy warning covers
        // those separately.
        let recommended_threshold = (noise_level + self.margin)
            .clamp(self.threshold_floor, self.threshold_ceil)
            .max(noise_level);

        info!(
            noise_level,
            recommended_threshold,
            samples = samples.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "calibration complete"
        );

        Ok(CalibrationResult {
            noise_level,
            recommended_threshold,
            samples_collected: samples.len(),
            duration_secs: elapsed.as_secs_f32(),
        })
    }
}

/// Value at `pct` (0..1) of an ascending-sorted slice.
fn percentile(sorted: &[f32], pct: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f32 * pct) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Run a full calibration against a capture session, blocking the caller.
///
/// Samples at `poll_interval`, reports [`CalibrationStatus::InProgress`] at
/// ~10 Hz through `on_progress`, and polls `cancelled` between samples. The
/// session's recording buffer is discarded on every exit path — success,
/// insufficient samples, cancellation — so no calibration audio leaks into a
/// later utterance.
pub fn calibrate_session(
    session: &mut dyn CaptureSession,
    mut calibrator: NoiseCalibrator,
    cancelled: impl Fn() -> bool,
    poll_interval: Duration,
    mut on_progress: impl FnMut(CalibrationStatus),
) -> Result<CalibrationResult> {
    let start = Instant::now();
    calibrator.begin(start);
    let mut last_progress = start;
    on_progress(CalibrationStatus::InProgress { progress: 0.0 });

    loop {
        if cancelled() {
            session.discard_recording();
            debug!("calibration cancelled");
            return Err(VivavoceError::CalibrationCancelled);
        }

        if let Some(db) = session.poll_level_db() {
            calibrator.push(level::normalized_level(db));
        }

        let now = Instant::now();
        if calibrator.is_due(now) {
            let outcome = calibrator.finish(now);
            session.discard_recording();
            return outcome;
        }

        if now.saturating_duration_since(last_progress) >= PROGRESS_INTERVAL {
            on_progress(CalibrationStatus::InProgress {
                progress: calibrator.progress(now),
            });
            last_progress = now;
        }

        std::thread::sleep(poll_interval);
    }
}
