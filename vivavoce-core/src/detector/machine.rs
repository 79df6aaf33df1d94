//! VAD state-machine core.
//!
//! ## States
//!
//! ```text
//! Calibrating ──gate──► Armed ──above──► OnsetPending ──sustained──► SpeechActive
//!                         ▲                  │ below                     │
//!                         └──────────────────┴──────silence confirmed────┘
//! ```
//!
//! Speech onset is confirmed only after the level stays above threshold for
//! the minimum speech duration, so sub-minimum blips (breath noise, clicks)
//! produce no events at all. Speech end is confirmed by hysteresis: the level
//! must stay below threshold for the full silence timeout.
//!
//! ## Timers are data
//!
//! The pending silence confirmation is one owned [`SilenceWindow`] value that
//! exists only inside the `SpeechActive` state. Arming is guarded by the
//! window's absence, cancelling is assignment to `None`, and firing is a
//! deadline comparison — so there is no second timer to race and no stale
//! callback to fire after the state has moved on. The window carries two
//! deadlines: the primary one, checked when level samples flow, and a
//! fallback at a small grace past it, checked by [`VadMachine::on_idle`] even
//! when the sampler has stalled.
//!
//! Every method takes `now` explicitly, which keeps the whole machine
//! deterministic under test.

use std::time::{Duration, Instant};

/// Timing knobs for the state machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Gate after listening starts during which samples are observed but
    /// never classified.
    pub calibration_delay: Duration,
    /// Sustained silence required to confirm the end of an utterance.
    pub silence_timeout: Duration,
    /// Grace past the silence timeout at which the sampler-independent
    /// fallback check forces the same completion.
    pub fallback_grace: Duration,
    /// Sustained speech required to confirm an onset.
    pub min_speech_duration: Duration,
    /// Recording length at which capture is force-restarted.
    pub max_recording_duration: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            calibration_delay: Duration::from_secs(1),
            silence_timeout: Duration::from_millis(1_500),
            fallback_grace: Duration::from_millis(250),
            min_speech_duration: Duration::from_millis(300),
            max_recording_duration: Duration::from_secs(30),
        }
    }
}

/// Externally visible phase of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Calibrating,
    Armed,
    OnsetPending,
    SpeechActive,
}

/// The pending end-of-utterance confirmation.
#[derive(Debug, Clone, Copy)]
struct SilenceWindow {
    /// When the level first fell below threshold — the utterance's end time
    /// if this window runs to confirmation.
    since: Instant,
    /// Primary confirmation deadline.
    deadline: Instant,
    /// Sampler-independent fallback deadline.
    fallback: Instant,
}

impl SilenceWindow {
    fn arm(now: Instant, timeout: Duration, grace: Duration) -> Self {
        let deadline = now + timeout;
        Self {
            since: now,
            deadline,
            fallback: deadline + grace,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Calibrating,
    Armed,
    OnsetPending {
        since: Instant,
    },
    SpeechActive {
        since: Instant,
        silence: Option<SilenceWindow>,
    },
}

/// What a transition asks the orchestrating loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOutput {
    /// Onset confirmed; `at` is when the level first crossed the threshold.
    SpeechStarted { at: Instant },
    /// End of utterance confirmed; the speech interval is
    /// `started_at..ended_at`.
    UtteranceComplete {
        started_at: Instant,
        ended_at: Instant,
    },
    /// A threshold crossing died before the minimum speech duration.
    OnsetAborted,
    /// The recording cap elapsed with no active speech; restart capture.
    RecordingExpired,
}

pub struct VadMachine {
    config: MachineConfig,
    state: State,
    /// When listening started; anchors the calibration-delay gate.
    listening_since: Instant,
    /// When the current recording buffer started; anchors the cap.
    capture_epoch: Instant,
    /// Keeps the gate closed while noise calibration is still running.
    calibration_hold: bool,
}

impl VadMachine {
    pub fn start(config: MachineConfig, now: Instant) -> Self {
        Self {
            config,
            state: State::Calibrating,
            listening_since: now,
            capture_epoch: now,
            calibration_hold: false,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Calibrating => Phase::Calibrating,
            State::Armed => Phase::Armed,
            State::OnsetPending { .. } => Phase::OnsetPending,
            State::SpeechActive { .. } => Phase::SpeechActive,
        }
    }

    pub fn is_speech_active(&self) -> bool {
        matches!(self.state, State::SpeechActive { .. })
    }

    /// While held, the gate stays closed past the calibration delay.
    pub fn set_calibration_hold(&mut self, hold: bool) {
        self.calibration_hold = hold;
    }

    /// Hot-reload the silence timeout. A pending confirmation is re-anchored
    /// to its original silence start with the new timeout.
    pub fn set_silence_timeout(&mut self, timeout: Duration) {
        if self.config.silence_timeout == timeout {
            return;
        }
        self.config.silence_timeout = timeout;
        if let State::SpeechActive {
            silence: Some(window),
            ..
        } = &mut self.state
        {
            window.deadline = window.since + timeout;
            window.fallback = window.deadline + self.config.fallback_grace;
        }
    }

    /// The loop restarted the recording buffer; re-anchor the cap.
    pub fn note_capture_restarted(&mut self, now: Instant) {
        self.capture_epoch = now;
    }

    /// Process one classified level sample.
    pub fn on_sample(&mut self, above_threshold: bool, now: Instant) -> Option<MachineOutput> {
        if let Some(out) = self.check_recording_cap(now) {
            return Some(out);
        }

        if let State::Calibrating = self.state {
            let gate_elapsed =
                now.saturating_duration_since(self.listening_since) >= self.config.calibration_delay;
            if !gate_elapsed || self.calibration_hold {
                return None;
            }
            self.state = State::Armed;
        }

        match self.state {
            State::Calibrating => None,
            State::Armed => {
                if !above_threshold {
                    return None;
                }
                if self.config.min_speech_duration.is_zero() {
                    self.state = State::SpeechActive {
                        since: now,
                        silence: None,
                    };
                    return Some(MachineOutput::SpeechStarted { at: now });
                }
                self.state = State::OnsetPending { since: now };
                None
            }
            State::OnsetPending { since } => {
                if !above_threshold {
                    self.state = State::Armed;
                    return Some(MachineOutput::OnsetAborted);
                }
                if now.saturating_duration_since(since) >= self.config.min_speech_duration {
                    self.state = State::SpeechActive {
                        since,
                        silence: None,
                    };
                    return Some(MachineOutput::SpeechStarted { at: since });
                }
                None
            }
            State::SpeechActive { since, silence } => {
                if let Some(window) = silence {
                    if now >= window.deadline {
                        return Some(self.confirm_end(since, window));
                    }
                }
                if above_threshold {
                    // Speech continuing: cancel any pending confirmation.
                    self.state = State::SpeechActive {
                        since,
                        silence: None,
                    };
                    None
                } else if silence.is_none() {
                    self.state = State::SpeechActive {
                        since,
                        silence: Some(SilenceWindow::arm(
                            now,
                            self.config.silence_timeout,
                            self.config.fallback_grace,
                        )),
                    };
                    None
                } else {
                    None
                }
            }
        }
    }

    /// Deadline checks that must run even when no sample arrived — the
    /// fallback confirmation and the recording cap.
    pub fn on_idle(&mut self, now: Instant) -> Option<MachineOutput> {
        if let Some(out) = self.check_recording_cap(now) {
            return Some(out);
        }
        if let State::SpeechActive {
            since,
            silence: Some(window),
        } = self.state
        {
            if now >= window.fallback {
                return Some(self.confirm_end(since, window));
            }
        }
        None
    }

    fn confirm_end(&mut self, started_at: Instant, window: SilenceWindow) -> MachineOutput {
        self.state = State::Armed;
        MachineOutput::UtteranceComplete {
            started_at,
            ended_at: window.since,
        }
    }

    fn check_recording_cap(&mut self, now: Instant) -> Option<MachineOutput> {
        let elapsed = now.saturating_duration_since(self.capture_epoch);
        if elapsed < self.config.max_recording_duration {
            return None;
        }
        match self.state {
            State::SpeechActive { since, silence } => {
                // Close the running utterance at the cap rather than dropping
                // everything captured so far.
                let ended_at = silence.map(|w| w.since).unwrap_or(now);
                self.state = State::Armed;
                Some(MachineOutput::UtteranceComplete {
                    started_at: since,
                    ended_at,
                })
            }
            State::Calibrating => Some(MachineOutput::RecordingExpired),
            State::Armed | State::OnsetPending { .. } => {
                self.state = State::Armed;
                Some(MachineOutput::RecordingExpired)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    fn test_config() -> MachineConfig {
        MachineConfig {
            calibration_delay: Duration::from_millis(1_000),
            silence_timeout: Duration::from_millis(1_500),
            fallback_grace: Duration::from_millis(250),
            min_speech_duration: Duration::from_millis(200),
            max_recording_duration: Duration::from_secs(30),
        }
    }

    /// Drive the machine with 50 ms ticks of `above` flags, collecting
    /// outputs; returns (outputs, end time).
    fn drive(
        machine: &mut VadMachine,
        base: Instant,
        start_ms: u64,
        flags: impl IntoIterator<Item = bool>,
    ) -> (Vec<MachineOutput>, u64) {
        let mut outputs = Vec::new();
        let mut t = start_ms;
        for above in flags {
            if let Some(out) = machine.on_sample(above, at(base, t)) {
                outputs.push(out);
            }
            t += 50;
        }
        (outputs, t)
    }

    fn ticks(count: usize, above: bool) -> Vec<bool> {
        vec![above; count]
    }

    #[test]
    fn samples_inside_the_gate_never_transition() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        let (outputs, _) = drive(&mut machine, base, 0, ticks(19, true));
        assert!(outputs.is_empty(), "gate leaked: {outputs:?}");
        assert_eq!(machine.phase(), Phase::Calibrating);
    }

    #[test]
    fn calibration_hold_keeps_the_gate_closed_past_the_delay() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        machine.set_calibration_hold(true);
        let (outputs, _) = drive(&mut machine, base, 1_200, ticks(10, true));
        assert!(outputs.is_empty());
        assert_eq!(machine.phase(), Phase::Calibrating);

        machine.set_calibration_hold(false);
        // Onset still needs the minimum speech duration after release.
        let (outputs, _) = drive(&mut machine, base, 1_800, ticks(6, true));
        assert_eq!(outputs.len(), 1);
        assert!(matches!(outputs[0], MachineOutput::SpeechStarted { .. }));
    }

    #[test]
    fn sustained_speech_confirms_onset_at_the_crossing_time() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        // Past the gate; first crossing at t=2000.
        let (outputs, _) = drive(&mut machine, base, 2_000, ticks(10, true));
        assert_eq!(outputs.len(), 1);
        match outputs[0] {
            MachineOutput::SpeechStarted { at: started } => {
                assert_eq!(started, at(base, 2_000), "onset anchors to the crossing");
            }
            other => panic!("unexpected output: {other:?}"),
        }
        assert!(machine.is_speech_active());
    }

    #[test]
    fn at_most_one_speech_started_until_the_utterance_completes() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        let (outputs, end) = drive(&mut machine, base, 2_000, ticks(100, true));
        let starts = outputs
            .iter()
            .filter(|o| matches!(o, MachineOutput::SpeechStarted { .. }))
            .count();
        assert_eq!(starts, 1);

        // Confirm the end, then a new utterance may start again.
        let (outputs, _) = drive(&mut machine, base, end, ticks(40, false));
        assert_eq!(
            outputs
                .iter()
                .filter(|o| matches!(o, MachineOutput::UtteranceComplete { .. }))
                .count(),
            1
        );
        assert!(!machine.is_speech_active());
    }

    #[test]
    fn sub_minimum_blip_produces_no_speech_events() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        // 150 ms above (3 ticks < 200 ms minimum), then long silence.
        let (outputs, end) = drive(&mut machine, base, 2_000, ticks(3, true));
        assert!(outputs.is_empty());
        let (outputs, _) = drive(&mut machine, base, end, ticks(40, false));
        assert_eq!(outputs, vec![MachineOutput::OnsetAborted]);
        assert_eq!(machine.phase(), Phase::Armed);
    }

    #[test]
    fn end_to_end_utterance_timing() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);

        // 1.0 s of silence after the gate.
        let (outputs, t) = drive(&mut machine, base, 1_000, ticks(20, false));
        assert!(outputs.is_empty());

        // 0.8 s of speech starting at t=2000.
        let speech_start = t;
        let (outputs, t) = drive(&mut machine, base, t, ticks(16, true));
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            outputs[0],
            MachineOutput::SpeechStarted {
                at: at(base, speech_start)
            }
        );

        // 1.6 s of silence; confirmation lands one tick past the 1.5 s
        // timeout.
        let silence_start = t;
        let (outputs, _) = drive(&mut machine, base, t, ticks(32, false));
        assert_eq!(outputs.len(), 1);
        match outputs[0] {
            MachineOutput::UtteranceComplete {
                started_at,
                ended_at,
            } => {
                assert_eq!(started_at, at(base, speech_start));
                assert_eq!(ended_at, at(base, silence_start));
                let speech = ended_at.duration_since(started_at);
                assert_eq!(speech, Duration::from_millis(800));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn brief_dip_cancels_the_pending_confirmation() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        drive(&mut machine, base, 2_000, ticks(10, true));

        // 0.5 s dip (< 1.5 s timeout), then speech resumes.
        let (outputs, t) = drive(&mut machine, base, 2_500, ticks(10, false));
        assert!(outputs.is_empty());
        let (outputs, t) = drive(&mut machine, base, t, ticks(10, true));
        assert!(outputs.is_empty(), "dip must not complete the utterance");

        // Now a full silence window does.
        let (outputs, _) = drive(&mut machine, base, t, ticks(40, false));
        assert_eq!(outputs.len(), 1);
        assert!(matches!(
            outputs[0],
            MachineOutput::UtteranceComplete { .. }
        ));
    }

    #[test]
    fn fallback_confirms_when_the_sampler_stalls() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        drive(&mut machine, base, 2_000, ticks(10, true));
        // One below-threshold sample arms the window at t=2500, then the
        // sampler dies.
        machine.on_sample(false, at(base, 2_500));

        assert_eq!(machine.on_idle(at(base, 3_900)), None, "before deadline");
        assert_eq!(
            machine.on_idle(at(base, 4_100)),
            None,
            "past the primary deadline but inside the grace, idle stays quiet"
        );
        match machine.on_idle(at(base, 4_300)) {
            Some(MachineOutput::UtteranceComplete { ended_at, .. }) => {
                assert_eq!(ended_at, at(base, 2_500));
            }
            other => panic!("fallback did not fire: {other:?}"),
        }
    }

    #[test]
    fn late_sample_past_the_deadline_completes_before_anything_else() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        drive(&mut machine, base, 2_000, ticks(10, true));
        machine.on_sample(false, at(base, 2_500));

        // The next sample arrives well past the deadline and is loud; the
        // stale utterance must close first, not be resurrected.
        match machine.on_sample(true, at(base, 4_200)) {
            Some(MachineOutput::UtteranceComplete { ended_at, .. }) => {
                assert_eq!(ended_at, at(base, 2_500));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(!machine.is_speech_active());
    }

    #[test]
    fn recording_cap_restarts_capture_when_nothing_was_said() {
        let base = Instant::now();
        let mut config = test_config();
        config.max_recording_duration = Duration::from_secs(5);
        let mut machine = VadMachine::start(config, base);

        let (outputs, _) = drive(&mut machine, base, 1_500, ticks(20, false));
        assert!(outputs.is_empty());
        assert_eq!(
            machine.on_idle(at(base, 5_100)),
            Some(MachineOutput::RecordingExpired)
        );

        machine.note_capture_restarted(at(base, 5_100));
        assert_eq!(machine.on_idle(at(base, 9_000)), None, "cap re-anchored");
    }

    #[test]
    fn recording_cap_closes_a_running_utterance_instead_of_dropping_it() {
        let base = Instant::now();
        let mut config = test_config();
        config.max_recording_duration = Duration::from_secs(5);
        let mut machine = VadMachine::start(config, base);

        // Speech from t=2000, held above threshold across the cap. The loop
        // restarts the recording buffer after every delivery, so mirror that
        // by re-anchoring the cap whenever an output appears.
        drive(&mut machine, base, 2_000, ticks(10, true));
        let mut outputs = Vec::new();
        let mut t = 2_500;
        while t <= 5_200 {
            if let Some(out) = machine.on_sample(true, at(base, t)) {
                outputs.push(out);
                machine.note_capture_restarted(at(base, t));
            }
            t += 50;
        }
        assert_eq!(outputs.len(), 1);
        assert!(matches!(
            outputs[0],
            MachineOutput::UtteranceComplete { .. }
        ));
        assert!(!machine.is_speech_active());
    }

    #[test]
    fn silence_timeout_hot_reload_reanchors_a_pending_window() {
        let base = Instant::now();
        let mut machine = VadMachine::start(test_config(), base);
        drive(&mut machine, base, 2_000, ticks(10, true));
        machine.on_sample(false, at(base, 2_500));

        machine.set_silence_timeout(Duration::from_millis(500));
        match machine.on_sample(false, at(base, 3_050)) {
            Some(MachineOutput::UtteranceComplete { ended_at, .. }) => {
                assert_eq!(ended_at, at(base, 2_500));
            }
            other => panic!("shortened timeout did not apply: {other:?}"),
        }
    }

    #[test]
    fn zero_minimum_duration_starts_speech_immediately() {
        let base = Instant::now();
        let mut config = test_config();
        config.min_speech_duration = Duration::ZERO;
        let mut machine = VadMachine::start(config, base);
        let out = machine.on_sample(true, at(base, 1_500));
        assert_eq!(
            out,
            Some(MachineOutput::SpeechStarted {
                at: at(base, 1_500)
            })
        );
    }
}
