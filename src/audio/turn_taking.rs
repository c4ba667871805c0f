// Turn-Taking Coordinator (C5): one condvar guarding a small mutex with two
// booleans, per the redesign note for the source's "shared mutex around
// is_speaking + event for is_silent." Predicate functions are the only
// callers that touch the booleans directly.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner {
    caller_is_silent: bool,
    bot_is_speaking: bool,
    last_speech_time: Instant,
}

pub struct TurnTakingFlags {
    inner: Mutex<Inner>,
    silence_cv: Condvar,
}

pub enum WaitOutcome {
    Silent,
    TimedOut,
}

impl TurnTakingFlags {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                caller_is_silent: true,
                bot_is_speaking: false,
                last_speech_time: Instant::now(),
            }),
            silence_cv: Condvar::new(),
        }
    }

    /// A speech frame arrived: clear `caller_is_silent`, record the time.
    pub fn mark_speech_observed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.caller_is_silent = false;
        inner.last_speech_time = Instant::now();
    }

    /// The utterance state machine declared end-of-sentence.
    pub fn mark_silence_declared(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.caller_is_silent = true;
        self.silence_cv.notify_all();
    }

    pub fn caller_is_silent(&self) -> bool {
        self.inner.lock().unwrap().caller_is_silent
    }

    pub fn set_bot_is_speaking(&self, speaking: bool) {
        self.inner.lock().unwrap().bot_is_speaking = speaking;
    }

    pub fn bot_is_speaking(&self) -> bool {
        self.inner.lock().unwrap().bot_is_speaking
    }

    /// Block until `caller_is_silent` is set or `timeout` elapses.
    pub fn wait_for_silence(&self, timeout: Duration) -> WaitOutcome {
        let inner = self.inner.lock().unwrap();
        if inner.caller_is_silent {
            return WaitOutcome::Silent;
        }
        let (guard, result) = self
            .silence_cv
            .wait_timeout_while(inner, timeout, |inner| !inner.caller_is_silent)
            .unwrap();
        drop(guard);
        if result.timed_out() {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Silent
        }
    }

    /// Time elapsed since the caller was last observed speaking.
    pub fn time_since_last_speech(&self) -> Duration {
        self.inner.lock().unwrap().last_speech_time.elapsed()
    }
}

impl Default for TurnTakingFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Decision rule enforced by the Playback Scheduler before starting a new
/// message, per the 6s wait + 2s forced-progress policy.
pub fn gate_before_new_message(flags: &TurnTakingFlags) {
    if flags.caller_is_silent() {
        return;
    }
    if let WaitOutcome::Silent = flags.wait_for_silence(Duration::from_secs(6)) {
        return;
    }
    if flags.time_since_last_speech() < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_secs(2));
    }
    // Forced progress: proceed regardless.
}
