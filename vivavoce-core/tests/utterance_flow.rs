//! End-to-end utterance flow against a scripted capture session.
//!
//! Durations are shortened proportionally from the production defaults
//! (1.5 s silence timeout → 300 ms, and so on) so the scenarios finish in a
//! few seconds of real time while exercising the same ratios.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use vivavoce_core::audio::{CaptureSession, RecordedAudio};
use vivavoce_core::detector::CaptureFactory;
use vivavoce_core::{
    CalibrationStatus, DetectorConfig, DetectorStatus, NoiseAnalyzerConfig, UtteranceAudio,
    VoiceDetector, VoiceEvent, VoiceEventKind,
};

/// Scripted capture: one dBFS reading per poll, with matching synthetic
/// samples appended to the recording buffer (10 ms of audio per poll).
struct ScriptedSession {
    script: VecDeque<f32>,
    samples_per_poll: usize,
    recording: Vec<i16>,
}

impl CaptureSession for ScriptedSession {
    fn poll_level_db(&mut self) -> Option<f32> {
        let db = self.script.pop_front()?;
        let amplitude = 10f32.powf(db / 20.0).clamp(0.0, 1.0);
        let value = (amplitude * i16::MAX as f32) as i16;
        self.recording
            .extend(std::iter::repeat(value).take(self.samples_per_poll));
        Some(db)
    }

    fn recorded(&self) -> Duration {
        Duration::from_secs_f64(self.recording.len() as f64 / 16_000.0)
    }

    fn take_recording(&mut self) -> RecordedAudio {
        RecordedAudio::new(std::mem::take(&mut self.recording), 16_000)
    }

    fn discard_recording(&mut self) {
        self.recording.clear();
    }
}

/// Factory handing out the script once; later sessions (continuous-listening
/// restarts never reopen, so there are none in these tests) get silence.
fn scripted_factory(script: Vec<f32>) -> CaptureFactory {
    let scripts = Mutex::new(Some(script));
    Arc::new(move || {
        let script = scripts.lock().unwrap().take().unwrap_or_default();
        Ok(Box::new(ScriptedSession {
            script: script.into(),
            samples_per_poll: 160,
            recording: Vec::new(),
        }) as Box<dyn CaptureSession>)
    })
}

fn scenario_config() -> DetectorConfig {
    DetectorConfig {
        speech_start_threshold: 0.15,
        silence_timeout: Duration::from_millis(300),
        min_speech_duration: Duration::from_millis(60),
        calibration_delay: Duration::from_millis(100),
        sample_interval: Duration::from_millis(10),
        auto_calibrate: false,
        ..DetectorConfig::default()
    }
}

/// -55 dBFS normalizes to ≈0.083 (below the 0.15 threshold); -30 dBFS to 0.5.
const SILENCE_DB: f32 = -55.0;
const SPEECH_DB: f32 = -30.0;

fn script(segments: &[(usize, f32)]) -> Vec<f32> {
    segments
        .iter()
        .flat_map(|&(polls, db)| std::iter::repeat(db).take(polls))
        .collect()
}

fn recv_event(rx: &mut broadcast::Receiver<VoiceEvent>, timeout: Duration) -> VoiceEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for voice event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("event channel closed unexpectedly"),
        }
    }
}

fn assert_no_event_for(rx: &mut broadcast::Receiver<VoiceEvent>, timeout: Duration) {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => panic!("expected no event, got seq={} {:?}", ev.seq, ev.kind),
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return,
        }
    }
}

fn expect_ended(event: VoiceEvent) -> UtteranceAudio {
    match event.kind {
        VoiceEventKind::SpeechEnded(audio) => audio,
        other => panic!("expected SpeechEnded, got {other:?}"),
    }
}

fn decoded_duration_secs(wav: &[u8]) -> f32 {
    let reader = hound::WavReader::new(std::io::Cursor::new(wav)).expect("parse utterance wav");
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 16_000);
    reader.duration() as f32 / spec.sample_rate as f32
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_utterance_produces_one_started_and_one_trimmed_ended() {
    // 0.6 s of silence, 0.8 s of speech, then 1.0 s of silence.
    let detector = VoiceDetector::with_capture(
        scenario_config(),
        scripted_factory(script(&[
            (60, SILENCE_DB),
            (80, SPEECH_DB),
            (100, SILENCE_DB),
        ])),
    );
    let mut events = detector.subscribe_events();

    detector.start_listening().expect("start succeeds");

    let started = recv_event(&mut events, Duration::from_secs(5));
    assert!(matches!(started.kind, VoiceEventKind::SpeechStarted));

    let ended = recv_event(&mut events, Duration::from_secs(5));
    assert!(started.seq < ended.seq);
    let audio = expect_ended(ended);

    assert!(audio.trimmed, "trim must succeed for an in-range window");
    assert!(
        (0.6..=1.1).contains(&audio.duration_secs),
        "expected ≈0.8 s of speech, got {}",
        audio.duration_secs
    );
    let decoded = decoded_duration_secs(&audio.wav);
    assert!(
        (decoded - audio.duration_secs).abs() < 0.05,
        "payload ({decoded}s) must match the declared duration ({}s)",
        audio.duration_secs
    );

    // Exactly one utterance: nothing further arrives.
    assert_no_event_for(&mut events, Duration::from_millis(300));
    assert_eq!(detector.diagnostics_snapshot().utterances_emitted, 1);

    detector.stop_listening();
    assert_eq!(detector.status(), DetectorStatus::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn continuous_listening_delivers_consecutive_utterances_in_order() {
    let mut config = scenario_config();
    config.silence_timeout = Duration::from_millis(200);
    config.min_speech_duration = Duration::from_millis(50);

    let detector = VoiceDetector::with_capture(
        config,
        scripted_factory(script(&[
            (30, SILENCE_DB),
            (40, SPEECH_DB),
            (50, SILENCE_DB),
            (40, SPEECH_DB),
            (60, SILENCE_DB),
        ])),
    );
    let mut events = detector.subscribe_events();

    detector.start_listening().expect("start succeeds");

    let first_start = recv_event(&mut events, Duration::from_secs(5));
    assert!(matches!(first_start.kind, VoiceEventKind::SpeechStarted));
    let first_audio = expect_ended(recv_event(&mut events, Duration::from_secs(5)));

    let second_start = recv_event(&mut events, Duration::from_secs(5));
    assert!(
        matches!(second_start.kind, VoiceEventKind::SpeechStarted),
        "capture restart must re-arm detection"
    );
    let second_audio = expect_ended(recv_event(&mut events, Duration::from_secs(5)));

    for (label, audio) in [("first", &first_audio), ("second", &second_audio)] {
        assert!(
            (0.25..=0.7).contains(&audio.duration_secs),
            "{label} utterance expected ≈0.4 s, got {}",
            audio.duration_secs
        );
        assert!(!audio.wav.is_empty());
    }

    assert_eq!(detector.diagnostics_snapshot().utterances_emitted, 2);
    detector.stop_listening();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_calibration_gates_detection_then_adapts_the_threshold() {
    let mut config = scenario_config();
    config.auto_calibrate = true;
    config.analyzer = NoiseAnalyzerConfig {
        calibration_duration: Duration::from_millis(200),
        min_calibration_samples: 5,
        ..NoiseAnalyzerConfig::default()
    };

    // -25 dBFS speech (≈0.58) against a -55 dBFS ambient floor (≈0.083):
    // well above the adapted threshold of noise + margin.
    let detector = VoiceDetector::with_capture(
        config,
        scripted_factory(script(&[
            (60, SILENCE_DB),
            (50, -25.0),
            (60, SILENCE_DB),
        ])),
    );
    let mut events = detector.subscribe_events();
    let mut calibration = detector.subscribe_calibration();

    detector.start_listening().expect("start succeeds");
    assert_eq!(detector.status(), DetectorStatus::Calibrating);

    let started = recv_event(&mut events, Duration::from_secs(5));
    assert!(matches!(started.kind, VoiceEventKind::SpeechStarted));
    let audio = expect_ended(recv_event(&mut events, Duration::from_secs(5)));
    assert!(!audio.wav.is_empty());

    // By the time speech was classified, calibration must have resolved.
    assert_eq!(detector.status(), DetectorStatus::Listening);
    let mut saw_completed = false;
    while let Ok(status) = calibration.try_recv() {
        if let CalibrationStatus::Completed { noise_level } = status {
            assert!(
                noise_level < 0.15,
                "quiet ambient expected, floor={noise_level}"
            );
            saw_completed = true;
        }
    }
    assert!(saw_completed, "calibration outcome must reach subscribers");

    detector.stop_listening();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_mid_utterance_discards_the_in_flight_speech() {
    // Speech that never ends: the detector is stopped while active.
    let detector = VoiceDetector::with_capture(
        scenario_config(),
        scripted_factory(script(&[(30, SILENCE_DB), (500, SPEECH_DB)])),
    );
    let mut events = detector.subscribe_events();

    detector.start_listening().expect("start succeeds");
    let started = recv_event(&mut events, Duration::from_secs(5));
    assert!(matches!(started.kind, VoiceEventKind::SpeechStarted));

    detector.stop_listening();
    assert_eq!(detector.status(), DetectorStatus::Idle);

    // The in-flight utterance is discarded, not delivered.
    assert_no_event_for(&mut events, Duration::from_millis(400));
    assert_eq!(detector.diagnostics_snapshot().utterances_emitted, 0);
}
