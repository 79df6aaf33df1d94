//! `VoiceDetector` — top-level listening lifecycle.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceDetector::new()
//!     └─► start_listening()   → capture open, loop spawned, status = Calibrating
//!         │                     (gate + auto-calibration) → Listening
//!         ├─► pause_listening()/resume_listening()
//!         └─► stop_listening() → running=false, session dropped, status = Idle
//! ```
//!
//! `start_listening` errors when already listening; `stop_listening` is
//! idempotent and safe in any state.
//!
//! ## Threading
//!
//! The capture session (a cpal stream in production) is `!Send`, so it is
//! created *inside* the `spawn_blocking` closure and never crosses a thread
//! boundary. Every state transition — analyzer updates, machine transitions,
//! silence/fallback deadlines, event emission — happens on that one loop
//! thread; the handle communicates through atomics and a sync open-ack
//! channel, so there is no shared mutable state to race.

pub mod machine;

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::audio::{CaptureSession, RecordedAudio};
use crate::calibrate::{self, CalibrationResult, CalibrationStatus, NoiseCalibrator};
use crate::error::{Result, VivavoceError};
use crate::events::{
    DetectorStatus, DetectorStatusEvent, UtteranceAudio, VoiceEvent, VoiceEventKind,
};
use crate::level;
use crate::noise::{
    AdaptiveNoiseAnalyzer, NoiseAnalysisResult, NoiseAnalyzerConfig, MAX_ADAPTIVE_THRESHOLD,
};
use crate::trim;
use machine::{MachineConfig, MachineOutput, VadMachine};

/// Broadcast channel capacity per event stream.
const BROADCAST_CAP: usize = 256;

/// Back-off when the capture session had no fresh audio.
const EMPTY_POLL_SLEEP: Duration = Duration::from_millis(5);

/// Cadence for calibration progress on the calibration channel.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for [`VoiceDetector`].
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Speech-start threshold used until auto-calibration completes (and
    /// whenever it is disabled or failed). Hot-reloadable. Default: 0.15.
    pub speech_start_threshold: f32,
    /// Sustained silence confirming the end of an utterance. Hot-reloadable.
    /// Default: 1.5 s.
    pub silence_timeout: Duration,
    /// Levels below this never classify as speech. Hot-reloadable.
    /// Default: 0.08.
    pub min_speech_level: f32,
    /// Sustained speech confirming an onset. Default: 300 ms.
    pub min_speech_duration: Duration,
    /// Recording length forcing a capture restart. Default: 30 s.
    pub max_recording_duration: Duration,
    /// Gate after start during which no speech decisions are made.
    /// Default: 1 s.
    pub calibration_delay: Duration,
    /// Sampling cadence of the level feed. Default: 50 ms.
    pub sample_interval: Duration,
    /// Run noise calibration at the start of every listening session.
    /// Default: true.
    pub auto_calibrate: bool,
    /// Analyzer tuning (presets: `default`, `sensitive`, `strict`).
    pub analyzer: NoiseAnalyzerConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            speech_start_threshold: 0.15,
            silence_timeout: Duration::from_millis(1_500),
            min_speech_level: 0.08,
            min_speech_duration: Duration::from_millis(300),
            max_recording_duration: Duration::from_secs(30),
            calibration_delay: Duration::from_secs(1),
            sample_interval: Duration::from_millis(50),
            auto_calibrate: true,
            analyzer: NoiseAnalyzerConfig::default(),
        }
    }
}

fn machine_config(config: &DetectorConfig) -> MachineConfig {
    MachineConfig {
        calibration_delay: config.calibration_delay,
        silence_timeout: config.silence_timeout,
        min_speech_duration: config.min_speech_duration,
        max_recording_duration: config.max_recording_duration,
        ..MachineConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct DetectorDiagnostics {
    pub samples_seen: AtomicUsize,
    pub speech_ticks: AtomicUsize,
    pub utterances_emitted: AtomicUsize,
    pub onsets_discarded: AtomicUsize,
    pub trim_failures: AtomicUsize,
    pub capture_restarts: AtomicUsize,
}

impl DetectorDiagnostics {
    pub fn reset(&self) {
        self.samples_seen.store(0, Ordering::Relaxed);
        self.speech_ticks.store(0, Ordering::Relaxed);
        self.utterances_emitted.store(0, Ordering::Relaxed);
        self.onsets_discarded.store(0, Ordering::Relaxed);
        self.trim_failures.store(0, Ordering::Relaxed);
        self.capture_restarts.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_seen: self.samples_seen.load(Ordering::Relaxed),
            speech_ticks: self.speech_ticks.load(Ordering::Relaxed),
            utterances_emitted: self.utterances_emitted.load(Ordering::Relaxed),
            onsets_discarded: self.onsets_discarded.load(Ordering::Relaxed),
            trim_failures: self.trim_failures.load(Ordering::Relaxed),
            capture_restarts: self.capture_restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub samples_seen: usize,
    pub speech_ticks: usize,
    pub utterances_emitted: usize,
    pub onsets_discarded: usize,
    pub trim_failures: usize,
    pub capture_restarts: usize,
}

// ---------------------------------------------------------------------------
// Hot-reloadable tuning
// ---------------------------------------------------------------------------

/// Settings the UI may change mid-session. Stored as atomic bit patterns so
/// the loop reads them once per tick without locking.
struct Tuning {
    threshold_bits: AtomicU32,
    min_speech_level_bits: AtomicU32,
    silence_timeout_ms: AtomicU64,
    paused: AtomicBool,
}

impl Tuning {
    fn new(config: &DetectorConfig) -> Self {
        Self {
            threshold_bits: AtomicU32::new(config.speech_start_threshold.to_bits()),
            min_speech_level_bits: AtomicU32::new(config.min_speech_level.to_bits()),
            silence_timeout_ms: AtomicU64::new(config.silence_timeout.as_millis() as u64),
            paused: AtomicBool::new(false),
        }
    }

    fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    fn set_threshold(&self, value: f32) {
        self.threshold_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    fn min_speech_level(&self) -> f32 {
        f32::from_bits(self.min_speech_level_bits.load(Ordering::Relaxed))
    }

    fn set_min_speech_level(&self, value: f32) {
        self.min_speech_level_bits
            .store(value.to_bits(), Ordering::Relaxed);
    }

    fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms.load(Ordering::Relaxed))
    }

    fn set_silence_timeout(&self, value: Duration) {
        self.silence_timeout_ms
            .store(value.as_millis() as u64, Ordering::Relaxed);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// VoiceDetector
// ---------------------------------------------------------------------------

/// Builds capture sessions on the loop thread. The factory must be callable
/// from any thread; the session it returns never leaves the one it was
/// created on.
pub type CaptureFactory = Arc<dyn Fn() -> Result<Box<dyn CaptureSession>> + Send + Sync>;

/// The voice-activity detector handle.
///
/// All fields use interior mutability, so the handle is `Send + Sync`; wrap
/// it in an `Arc` to share between the orchestration layer and UI tasks.
pub struct VoiceDetector {
    config: DetectorConfig,
    factory: CaptureFactory,
    /// `true` while a listening loop (or a standalone calibration) owns the
    /// capture device.
    running: Arc<AtomicBool>,
    tuning: Arc<Tuning>,
    status: Arc<Mutex<DetectorStatus>>,
    event_tx: broadcast::Sender<VoiceEvent>,
    status_tx: broadcast::Sender<DetectorStatusEvent>,
    activity_tx: broadcast::Sender<NoiseAnalysisResult>,
    calibration_tx: broadcast::Sender<CalibrationStatus>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<DetectorDiagnostics>,
}

impl VoiceDetector {
    /// Detector over the default microphone.
    #[cfg(feature = "audio-cpal")]
    pub fn new(config: DetectorConfig) -> Self {
        Self::for_device(config, None)
    }

    /// Detector over a named input device, with fallback to the default.
    #[cfg(feature = "audio-cpal")]
    pub fn for_device(config: DetectorConfig, preferred_device: Option<String>) -> Self {
        let factory: CaptureFactory = Arc::new(move || {
            crate::audio::capture::MicCapture::open(preferred_device.as_deref())
                .map(|session| Box::new(session) as Box<dyn CaptureSession>)
        });
        Self::with_capture(config, factory)
    }

    /// Detector over an arbitrary capture backend.
    pub fn with_capture(config: DetectorConfig, factory: CaptureFactory) -> Self {
        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (calibration_tx, _) = broadcast::channel(BROADCAST_CAP);
        let tuning = Arc::new(Tuning::new(&config));

        Self {
            config,
            factory,
            running: Arc::new(AtomicBool::new(false)),
            tuning,
            status: Arc::new(Mutex::new(DetectorStatus::Idle)),
            event_tx,
            status_tx,
            activity_tx,
            calibration_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(DetectorDiagnostics::default()),
        }
    }

    /// Open capture and start the listening loop.
    ///
    /// Blocks until the capture device is confirmed open (or failed), then
    /// returns; the loop continues on a background blocking thread. Must be
    /// called within a tokio runtime.
    ///
    /// # Errors
    /// - [`VivavoceError::AlreadyListening`] when already started.
    /// - Any capture error from the session factory; the detector is left
    ///   idle and a [`VoiceEventKind::CaptureError`] event is emitted.
    pub fn start_listening(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(VivavoceError::AlreadyListening);
        }

        self.diagnostics.reset();
        self.tuning.paused.store(false, Ordering::Relaxed);
        let initial = if self.config.auto_calibrate {
            DetectorStatus::Calibrating
        } else {
            DetectorStatus::Listening
        };
        self.set_status(initial, None);

        let ctx = LoopContext {
            config: self.config.clone(),
            running: Arc::clone(&self.running),
            tuning: Arc::clone(&self.tuning),
            status: Arc::clone(&self.status),
            event_tx: self.event_tx.clone(),
            status_tx: self.status_tx.clone(),
            activity_tx: self.activity_tx.clone(),
            calibration_tx: self.calibration_tx.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let factory = Arc::clone(&self.factory);

        // Sync ack: the loop thread reports device-open success or failure
        // before start_listening returns.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            // Capture must be created on THIS thread — the session is !Send.
            let session = match factory() {
                Ok(session) => {
                    let _ = open_tx.send(Ok(()));
                    session
                }
                Err(e) => {
                    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
                    let _ = ctx.event_tx.send(VoiceEvent {
                        seq,
                        kind: VoiceEventKind::CaptureError(e.to_string()),
                    });
                    *ctx.status.lock() = DetectorStatus::Error;
                    let _ = ctx.status_tx.send(DetectorStatusEvent {
                        status: DetectorStatus::Error,
                        detail: Some(e.to_string()),
                    });
                    ctx.running.store(false, Ordering::SeqCst);
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };

            run_loop(ctx, session);
            // Session drops here, releasing the audio device on this thread.
        });

        match open_rx.recv() {
            Ok(Ok(())) => {
                info!("detector started — listening");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Channel closed without an ack — the loop task died early.
                self.running.store(false, Ordering::SeqCst);
                self.set_status(DetectorStatus::Error, Some("listening loop failed".into()));
                Err(VivavoceError::Other(anyhow::anyhow!(
                    "listening loop died before confirming capture"
                )))
            }
        }
    }

    /// Stop listening: cancels pending confirmations, discards any in-flight
    /// utterance or calibration, and releases the capture device. Idempotent;
    /// also clears a lingering `Error` status back to `Idle`.
    pub fn stop_listening(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.tuning.paused.store(false, Ordering::Relaxed);
        if was_running {
            self.set_status(DetectorStatus::Idle, None);
            info!("detector stop requested");
        } else if self.status() != DetectorStatus::Idle {
            self.set_status(DetectorStatus::Idle, None);
        }
    }

    /// Suspend the sampler; capture and detection state are preserved. Used
    /// while the playback side is speaking.
    pub fn pause_listening(&self) {
        if self.is_listening() && !self.tuning.paused.swap(true, Ordering::Relaxed) {
            self.set_status(DetectorStatus::Paused, None);
            info!("sampling paused");
        }
    }

    /// Resume a paused sampler.
    pub fn resume_listening(&self) {
        if self.tuning.paused.swap(false, Ordering::Relaxed) && self.is_listening() {
            self.set_status(DetectorStatus::Listening, None);
            info!("sampling resumed");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Hot-reload the speech-start threshold without restarting capture.
    pub fn update_threshold(&self, threshold: f32) {
        let threshold = threshold.clamp(0.0, 1.0);
        self.tuning.set_threshold(threshold);
        info!(threshold, "speech-start threshold updated");
    }

    /// Hot-reload the silence-confirmation timeout.
    pub fn update_silence_timeout(&self, timeout: Duration) {
        self.tuning.set_silence_timeout(timeout);
        info!(timeout_ms = timeout.as_millis() as u64, "silence timeout updated");
    }

    /// Hot-reload the absolute minimum speech level.
    pub fn update_min_speech_level(&self, min_level: f32) {
        let min_level = min_level.clamp(0.0, 1.0);
        self.tuning.set_min_speech_level(min_level);
        info!(min_level, "minimum speech level updated");
    }

    /// Run a standalone noise calibration, blocking until it resolves.
    ///
    /// Owns the capture device for the duration; progress and the terminal
    /// status are broadcast on the calibration channel. `stop_listening`
    /// cancels an in-flight run.
    ///
    /// # Errors
    /// - [`VivavoceError::AlreadyListening`] when the detector is busy.
    /// - [`VivavoceError::InsufficientCalibrationSamples`] when the window
    ///   closed with too little data; the status channel reports `Failed`.
    pub fn run_calibration(&self) -> Result<CalibrationResult> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(VivavoceError::AlreadyListening);
        }
        self.set_status(DetectorStatus::Calibrating, None);

        let analyzer = &self.config.analyzer;
        let calibrator = NoiseCalibrator::new(
            analyzer.calibration_duration,
            analyzer.min_calibration_samples,
        )
        .with_threshold_bounds(
            analyzer.min_signal_above_noise,
            analyzer.min_absolute_level,
            MAX_ADAPTIVE_THRESHOLD,
        );

        let outcome = (self.factory)().and_then(|mut session| {
            calibrate::calibrate_session(
                session.as_mut(),
                calibrator,
                || !self.running.load(Ordering::SeqCst),
                self.config.sample_interval,
                |status| {
                    let _ = self.calibration_tx.send(status);
                },
            )
            // Session drops here on every path, releasing the device.
        });

        self.running.store(false, Ordering::SeqCst);
        match &outcome {
            Ok(result) => {
                let _ = self.calibration_tx.send(CalibrationStatus::Completed {
                    noise_level: result.noise_level,
                });
                self.set_status(DetectorStatus::Idle, None);
            }
            Err(e) => {
                let _ = self.calibration_tx.send(CalibrationStatus::Failed {
                    reason: e.to_string(),
                });
                self.set_status(DetectorStatus::Idle, Some(e.to_string()));
            }
        }
        outcome
    }

    /// Current lifecycle status (snapshot).
    pub fn status(&self) -> DetectorStatus {
        *self.status.lock()
    }

    /// Subscribe to speech events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to lifecycle status changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<DetectorStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to per-tick analysis results (live level meters).
    pub fn subscribe_activity(&self) -> broadcast::Receiver<NoiseAnalysisResult> {
        self.activity_tx.subscribe()
    }

    /// Subscribe to calibration progress and outcomes.
    pub fn subscribe_calibration(&self) -> broadcast::Receiver<CalibrationStatus> {
        self.calibration_tx.subscribe()
    }

    /// Snapshot of loop counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn set_status(&self, status: DetectorStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(DetectorStatusEvent { status, detail });
    }
}

// ---------------------------------------------------------------------------
// Listening loop
// ---------------------------------------------------------------------------

/// Everything the loop needs, passed as one struct so the closure stays tidy.
struct LoopContext {
    config: DetectorConfig,
    running: Arc<AtomicBool>,
    tuning: Arc<Tuning>,
    status: Arc<Mutex<DetectorStatus>>,
    event_tx: broadcast::Sender<VoiceEvent>,
    status_tx: broadcast::Sender<DetectorStatusEvent>,
    activity_tx: broadcast::Sender<NoiseAnalysisResult>,
    calibration_tx: broadcast::Sender<CalibrationStatus>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<DetectorDiagnostics>,
}

fn loop_status(ctx: &LoopContext, status: DetectorStatus, detail: Option<String>) {
    *ctx.status.lock() = status;
    let _ = ctx.status_tx.send(DetectorStatusEvent { status, detail });
}

fn next_seq(ctx: &LoopContext) -> u64 {
    ctx.seq.fetch_add(1, Ordering::Relaxed)
}

/// Run the blocking detection loop until `ctx.running` goes false.
fn run_loop(ctx: LoopContext, mut session: Box<dyn CaptureSession>) {
    info!("detector loop started");

    let start = Instant::now();
    let mut analyzer = AdaptiveNoiseAnalyzer::new(ctx.config.analyzer.clone());
    let mut machine = VadMachine::start(machine_config(&ctx.config), start);
    if ctx.config.auto_calibrate {
        analyzer.begin_calibration(start);
        machine.set_calibration_hold(true);
    }

    // When the current recording buffer began; anchors trim offsets.
    let mut capture_started_at = start;
    // Auto-calibration resolution is announced exactly once.
    let mut calibration_resolved = !ctx.config.auto_calibrate;
    let mut last_progress = start;
    let mut tick = 0u64;
    // Span covering the current utterance, from onset to delivery.
    let mut utterance_span: Option<Span> = None;

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        if ctx.tuning.is_paused() {
            // Sampler suspended: keep draining so the RT producer never
            // stalls, but feed nothing downstream.
            let _ = session.poll_level_db();
            std::thread::sleep(ctx.config.sample_interval);
            continue;
        }

        // Hot-reloaded tuning, applied once per tick.
        machine.set_silence_timeout(ctx.tuning.silence_timeout());
        analyzer.set_min_absolute_level(ctx.tuning.min_speech_level());

        let output = match session.poll_level_db() {
            Some(db) => {
                let now = Instant::now();
                let audio_level = level::normalized_level(db);
                ctx.diagnostics.samples_seen.fetch_add(1, Ordering::Relaxed);

                let result = analyzer.analyze(audio_level, now);
                if !calibration_resolved {
                    calibration_resolved = announce_calibration(
                        &ctx,
                        &result.calibration,
                        &mut machine,
                        now,
                        &mut last_progress,
                    );
                }

                // One authoritative threshold: adaptive once calibrated, the
                // configured static value otherwise.
                let threshold = if analyzer.is_calibrated() {
                    result.adaptive_threshold
                } else {
                    ctx.tuning.threshold().max(ctx.tuning.min_speech_level())
                };
                let above = audio_level > threshold;
                if above {
                    ctx.diagnostics.speech_ticks.fetch_add(1, Ordering::Relaxed);
                }

                let _ = ctx.activity_tx.send(result);
                if tick % 50 == 0 {
                    debug!(audio_level, threshold, above, "audio level check");
                }
                tick = tick.wrapping_add(1);

                let out = machine.on_sample(above, now);
                std::thread::sleep(ctx.config.sample_interval);
                out
            }
            None => {
                // No fresh audio; deadline checks still run so a stalled
                // sampler cannot wedge a pending silence confirmation.
                let out = machine.on_idle(Instant::now());
                if out.is_none() {
                    std::thread::sleep(EMPTY_POLL_SLEEP);
                }
                out
            }
        };

        if let Some(out) = output {
            handle_output(
                &ctx,
                session.as_mut(),
                &mut machine,
                &mut capture_started_at,
                &mut utterance_span,
                out,
            );
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_seen = snap.samples_seen,
        speech_ticks = snap.speech_ticks,
        utterances_emitted = snap.utterances_emitted,
        onsets_discarded = snap.onsets_discarded,
        trim_failures = snap.trim_failures,
        capture_restarts = snap.capture_restarts,
        "detector loop stopped — diagnostics"
    );
}

/// Forward auto-calibration progress and react when it resolves. Returns
/// `true` once the outcome (completed or failed) has been announced.
fn announce_calibration(
    ctx: &LoopContext,
    status: &CalibrationStatus,
    machine: &mut VadMachine,
    now: Instant,
    last_progress: &mut Instant,
) -> bool {
    match status {
        CalibrationStatus::InProgress { .. } => {
            if now.saturating_duration_since(*last_progress) >= PROGRESS_INTERVAL {
                let _ = ctx.calibration_tx.send(status.clone());
                *last_progress = now;
            }
            false
        }
        CalibrationStatus::Completed { noise_level } => {
            let _ = ctx.calibration_tx.send(status.clone());
            machine.set_calibration_hold(false);
            loop_status(ctx, DetectorStatus::Listening, None);
            info!(noise_level, "auto-calibration complete");
            true
        }
        CalibrationStatus::Failed { reason } => {
            let _ = ctx.calibration_tx.send(status.clone());
            machine.set_calibration_hold(false);
            loop_status(
                ctx,
                DetectorStatus::Listening,
                Some(format!(
                    "calibration failed ({reason}); using configured threshold"
                )),
            );
            true
        }
        CalibrationStatus::NotStarted => false,
    }
}

fn handle_output(
    ctx: &LoopContext,
    session: &mut dyn CaptureSession,
    machine: &mut VadMachine,
    capture_started_at: &mut Instant,
    utterance_span: &mut Option<Span>,
    output: MachineOutput,
) {
    match output {
        MachineOutput::SpeechStarted { at } => {
            let seq = next_seq(ctx);
            let span = info_span!("utterance", seq);
            span.in_scope(|| {
                info!(
                    offset_ms =
                        at.saturating_duration_since(*capture_started_at).as_millis() as u64,
                    "speech started"
                );
            });
            *utterance_span = Some(span);
            let _ = ctx.event_tx.send(VoiceEvent {
                seq,
                kind: VoiceEventKind::SpeechStarted,
            });
        }

        MachineOutput::OnsetAborted => {
            ctx.diagnostics
                .onsets_discarded
                .fetch_add(1, Ordering::Relaxed);
            debug!("onset below minimum speech duration — discarded as noise");
        }

        MachineOutput::RecordingExpired => {
            warn!(
                recorded_secs = session.recorded().as_secs_f32(),
                "recording cap reached with no speech — restarting capture"
            );
            session.discard_recording();
            let now = Instant::now();
            machine.note_capture_restarted(now);
            *capture_started_at = now;
            ctx.diagnostics
                .capture_restarts
                .fetch_add(1, Ordering::Relaxed);
        }

        MachineOutput::UtteranceComplete {
            started_at,
            ended_at,
        } => {
            // Take the buffer first: the restart is a buffer reset, so the
            // delivered audio is owned and cannot race the next recording.
            let recording = session.take_recording();
            let now = Instant::now();
            let epoch = *capture_started_at;
            machine.note_capture_restarted(now);
            *capture_started_at = now;

            let start_offset = started_at.saturating_duration_since(epoch);
            let speech = ended_at.saturating_duration_since(started_at);

            let guard = utterance_span.as_ref().map(|s| s.enter());
            deliver_utterance(ctx, recording, start_offset, speech);
            drop(guard);
            *utterance_span = None;
        }
    }
}

/// Trim and emit one completed utterance. Trim failures degrade to the
/// untrimmed capture; the utterance is never dropped.
fn deliver_utterance(
    ctx: &LoopContext,
    recording: RecordedAudio,
    start_offset: Duration,
    speech: Duration,
) {
    let full = match recording.to_wav_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to encode utterance container: {e}");
            let seq = next_seq(ctx);
            let _ = ctx.event_tx.send(VoiceEvent {
                seq,
                kind: VoiceEventKind::CaptureError(e.to_string()),
            });
            return;
        }
    };

    let (wav, trimmed) = match trim::trim_wav(&full, start_offset, speech) {
        Ok(t) => (t, true),
        Err(e) => {
            warn!("trim failed ({e}); delivering untrimmed capture");
            ctx.diagnostics.trim_failures.fetch_add(1, Ordering::Relaxed);
            (full, false)
        }
    };
    let duration_secs = if trimmed {
        speech.as_secs_f32()
    } else {
        recording.duration().as_secs_f32()
    };

    let seq = next_seq(ctx);
    info!(seq, duration_secs, trimmed, "speech ended");
    let _ = ctx.event_tx.send(VoiceEvent {
        seq,
        kind: VoiceEventKind::SpeechEnded(UtteranceAudio {
            wav,
            duration_secs,
            trimmed,
        }),
    });
    ctx.diagnostics
        .utterances_emitted
        .fetch_add(1, Ordering::Relaxed);
}
