// Utterance State Machine (C4): dual-threshold progressive chunking, noise
// timeout, and phrase pauses, driven one 20ms frame at a time.
//
// Durations are tracked in frame counts (each frame is a fixed 20ms) rather
// than wall-clock timestamps — frames arrive from the PCM capture thread at
// real-time cadence, so "frames elapsed * 20ms" and "time elapsed" coincide,
// and frame counts make the transition table exactly reproducible in tests.

use crate::audio::vad::FRAME_DURATION_MS;
use crate::config::VoiceConfig;

const MIN_SPEECH_FRAMES_FOR_AUDIO_CHUNK: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Silence,
    Speech,
    PostSpeechSilence,
}

#[derive(Debug, PartialEq)]
pub enum UtteranceEvent {
    /// A speech frame arrived; the turn-taking coordinator should clear
    /// `caller_is_silent` and record the speech timestamp.
    SpeechObserved,
    /// A committed chunk of PCM, ready for the Dialog Dispatcher.
    AudioChunk { chunk_num: u64, pcm: Vec<i16> },
    /// An intermediate chunk emitted mid-utterance at a phrase-pause
    /// boundary. Does not set `caller_is_silent` or advance `end_signal_sent`.
    ProgressiveChunk { chunk_num: u64, pcm: Vec<i16> },
    /// Zero-audio finalization of `chunk_num`. Sets `caller_is_silent`.
    EndSignal { chunk_num: u64 },
    /// Continuous speech classification exceeded `T_max`; buffer dropped,
    /// `chunk_num` unchanged, caller should be told it's too noisy.
    NoiseTimeout,
}

/// Thresholds derived from `VoiceConfig`, expressed in frame counts.
struct Thresholds {
    t_audio: u32,
    t_end: u32,
    t_phrase: u32,
    t_long: u32,
    t_max: u32,
}

impl Thresholds {
    fn from_config(config: &VoiceConfig) -> Self {
        let to_frames = |ms: u64| ((ms as u32) / FRAME_DURATION_MS).max(1);
        Self {
            t_audio: to_frames(config.audio_chunk_threshold_ms),
            t_end: to_frames(config.silence_timeout_ms),
            t_phrase: to_frames(config.phrase_pause_ms),
            t_long: to_frames(config.long_speech_threshold_ms),
            t_max: to_frames(config.max_speech_duration_ms),
        }
    }
}

pub struct UtteranceStateMachine {
    thresholds: Thresholds,
    state: State,

    frame_index: u32,
    utterance_start_frame: u32,
    last_chunk_frame: u32,
    silence_frames: u32,
    speech_frame_count: u32,

    current_chunk_num: u64,
    audio_chunk_sent: bool,
    end_signal_sent: bool,
    caller_has_spoken: bool,

    pending_pcm: Vec<i16>,
}

impl UtteranceStateMachine {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            thresholds: Thresholds::from_config(config),
            state: State::Silence,
            frame_index: 0,
            utterance_start_frame: 0,
            last_chunk_frame: 0,
            silence_frames: 0,
            speech_frame_count: 0,
            current_chunk_num: 0,
            audio_chunk_sent: false,
            end_signal_sent: false,
            caller_has_spoken: false,
            pending_pcm: Vec::new(),
        }
    }

    pub fn caller_has_spoken(&self) -> bool {
        self.caller_has_spoken
    }

    pub fn current_chunk_num(&self) -> u64 {
        self.current_chunk_num
    }

    /// Process one 20ms frame, returning the events it produced (0 or 1 in
    /// practice, never more).
    pub fn process_frame(&mut self, is_speech: bool, samples: &[i16]) -> Vec<UtteranceEvent> {
        self.frame_index += 1;
        let mut events = Vec::new();

        match self.state {
            State::Silence => {
                if is_speech {
                    self.begin_utterance(samples);
                    self.caller_has_spoken = true;
                    events.push(UtteranceEvent::SpeechObserved);
                }
                // Silence frame while already silent: no-op.
            }
            State::Speech => {
                if is_speech {
                    self.pending_pcm.extend_from_slice(samples);
                    self.speech_frame_count += 1;
                    self.silence_frames = 0;

                    if self.utterance_duration_frames() >= self.thresholds.t_max {
                        self.drop_for_noise_timeout();
                        events.push(UtteranceEvent::NoiseTimeout);
                    } else {
                        events.push(UtteranceEvent::SpeechObserved);
                    }
                } else {
                    self.pending_pcm.extend_from_slice(samples);
                    self.state = State::PostSpeechSilence;
                    self.silence_frames = 1;
                    if let Some(event) = self.check_silence_thresholds() {
                        events.push(event);
                    }
                }
            }
            State::PostSpeechSilence => {
                if is_speech {
                    self.state = State::Speech;
                    self.pending_pcm.extend_from_slice(samples);
                    self.speech_frame_count += 1;
                    self.silence_frames = 0;
                    self.audio_chunk_sent = false;
                    events.push(UtteranceEvent::SpeechObserved);
                } else {
                    self.pending_pcm.extend_from_slice(samples);
                    self.silence_frames += 1;
                    if let Some(event) = self.check_silence_thresholds() {
                        events.push(event);
                    }
                }
            }
        }

        events
    }

    fn begin_utterance(&mut self, samples: &[i16]) {
        self.utterance_start_frame = self.frame_index;
        self.last_chunk_frame = self.frame_index;
        self.silence_frames = 0;
        self.speech_frame_count = 1;
        self.audio_chunk_sent = false;
        self.end_signal_sent = false;
        self.pending_pcm.clear();
        self.pending_pcm.extend_from_slice(samples);
        self.state = State::Speech;
    }

    fn utterance_duration_frames(&self) -> u32 {
        self.frame_index - self.utterance_start_frame + 1
    }

    fn frames_since_last_chunk(&self) -> u32 {
        self.frame_index - self.last_chunk_frame
    }

    /// Tie-break order per frame: T_max -> progressive chunk -> T_audio -> T_end.
    fn check_silence_thresholds(&mut self) -> Option<UtteranceEvent> {
        let t = &self.thresholds;

        if self.utterance_duration_frames() >= t.t_max {
            self.drop_for_noise_timeout();
            return Some(UtteranceEvent::NoiseTimeout);
        }

        if self.utterance_duration_frames() >= t.t_long
            && self.frames_since_last_chunk() >= t.t_long
            && self.silence_frames >= t.t_phrase
        {
            let chunk_num = self.commit_chunk();
            return Some(UtteranceEvent::ProgressiveChunk {
                chunk_num,
                pcm: std::mem::take(&mut self.pending_pcm),
            });
        }

        if self.silence_frames >= t.t_audio
            && !self.audio_chunk_sent
            && self.speech_frame_count >= MIN_SPEECH_FRAMES_FOR_AUDIO_CHUNK
        {
            self.audio_chunk_sent = true;
            let chunk_num = self.commit_chunk();
            return Some(UtteranceEvent::AudioChunk {
                chunk_num,
                pcm: std::mem::take(&mut self.pending_pcm),
            });
        }

        if self.silence_frames >= t.t_end && self.audio_chunk_sent && !self.end_signal_sent {
            self.end_signal_sent = true;
            self.state = State::Silence;
            return Some(UtteranceEvent::EndSignal {
                chunk_num: self.current_chunk_num,
            });
        }

        None
    }

    fn commit_chunk(&mut self) -> u64 {
        self.current_chunk_num += 1;
        self.last_chunk_frame = self.frame_index;
        self.current_chunk_num
    }

    fn drop_for_noise_timeout(&mut self) {
        self.pending_pcm.clear();
        self.state = State::Silence;
        self.silence_frames = 0;
        self.speech_frame_count = 0;
        // chunk_num intentionally unchanged: no audio was committed.
    }

    /// Duration in ms of the speech run that just ended with an end signal,
    /// used by the Call Controller's greeting gate (>= 680ms).
    pub fn last_utterance_duration_ms(&self) -> u32 {
        self.utterance_duration_frames() * FRAME_DURATION_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_defaults() -> VoiceConfig {
        VoiceConfig::default()
    }

    fn frame(n: i16) -> Vec<i16> {
        vec![n; 160]
    }

    #[test]
    fn test_quiet_then_greeting_scenario() {
        // 300ms silence, 800ms speech, 1s silence -> chunk at 550ms silence,
        // end-signal at 800ms silence.
        let mut sm = UtteranceStateMachine::new(&config_with_defaults());

        for _ in 0..15 {
            // 300ms / 20ms
            assert!(sm.process_frame(false, &frame(0)).is_empty());
        }

        // 800ms speech = 40 frames, need >=10 speech frames for audio chunk eligibility.
        for _ in 0..40 {
            let events = sm.process_frame(true, &frame(2000));
            assert_eq!(events, vec![UtteranceEvent::SpeechObserved]);
        }
        assert!(sm.caller_has_spoken());

        // Silence: chunk at 550ms (27.5 -> 28 frames), end signal at 800ms (40 frames).
        let mut saw_chunk = false;
        let mut saw_end = false;
        for i in 0..60 {
            let events = sm.process_frame(false, &frame(0));
            for event in events {
                match event {
                    UtteranceEvent::AudioChunk { chunk_num, .. } => {
                        assert_eq!(chunk_num, 1);
                        saw_chunk = true;
                        assert!(!saw_end, "chunk should arrive before end signal");
                    }
                    UtteranceEvent::EndSignal { chunk_num } => {
                        assert_eq!(chunk_num, 1);
                        saw_end = true;
                        assert!(saw_chunk, "end signal should follow the chunk");
                        assert!(i >= 39, "end signal should not fire before 800ms");
                    }
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }
        assert!(saw_chunk && saw_end);
    }

    #[test]
    fn test_noise_timeout_scenario() {
        // 7000ms unbroken speech classification -> exactly one NoiseTimeout,
        // chunk_num unchanged.
        let mut sm = UtteranceStateMachine::new(&config_with_defaults());
        let mut noise_events = 0;
        for _ in 0..350 {
            // 7000ms / 20ms
            for event in sm.process_frame(true, &frame(2000)) {
                if event == UtteranceEvent::NoiseTimeout {
                    noise_events += 1;
                }
            }
        }
        assert_eq!(noise_events, 1);
        assert_eq!(sm.current_chunk_num, 0);
    }

    #[test]
    fn test_progressive_chunk_fires_during_long_speech() {
        let mut sm = UtteranceStateMachine::new(&config_with_defaults());

        // 5.5s speech (>= T_long=4500ms) then 400ms silence, 400ms speech, 900ms silence.
        for _ in 0..275 {
            sm.process_frame(true, &frame(2000));
        }

        let mut progressive_seen = false;
        for _ in 0..20 {
            // 400ms silence
            for event in sm.process_frame(false, &frame(0)) {
                if let UtteranceEvent::ProgressiveChunk { chunk_num, .. } = event {
                    assert_eq!(chunk_num, 1);
                    progressive_seen = true;
                }
            }
        }
        assert!(progressive_seen, "expected a progressive chunk during the phrase pause");

        for _ in 0..20 {
            sm.process_frame(true, &frame(2000)); // 400ms speech, resets silence
        }

        let mut saw_final_chunk = false;
        let mut saw_end = false;
        for _ in 0..45 {
            // 900ms silence
            for event in sm.process_frame(false, &frame(0)) {
                match event {
                    UtteranceEvent::AudioChunk { chunk_num, .. } => {
                        assert_eq!(chunk_num, 2);
                        saw_final_chunk = true;
                    }
                    UtteranceEvent::EndSignal { chunk_num } => {
                        assert_eq!(chunk_num, 2);
                        saw_end = true;
                    }
                    _ => {}
                }
            }
        }
        assert!(saw_final_chunk && saw_end);
    }

    #[test]
    fn test_audio_chunk_requires_minimum_speech_frames() {
        // Fewer than 10 speech frames should never yield an audio chunk,
        // even after the silence threshold is crossed.
        let mut sm = UtteranceStateMachine::new(&config_with_defaults());
        for _ in 0..5 {
            sm.process_frame(true, &frame(2000));
        }
        let mut saw_chunk = false;
        for _ in 0..60 {
            for event in sm.process_frame(false, &frame(0)) {
                if matches!(event, UtteranceEvent::AudioChunk { .. }) {
                    saw_chunk = true;
                }
            }
        }
        assert!(!saw_chunk);
    }

    #[test]
    fn test_speech_before_end_clears_audio_chunk_sent() {
        let mut sm = UtteranceStateMachine::new(&config_with_defaults());
        for _ in 0..40 {
            sm.process_frame(true, &frame(2000));
        }
        // Cross T_audio (550ms = 28 frames) but not T_end (800ms = 40 frames).
        for _ in 0..30 {
            sm.process_frame(false, &frame(0));
        }
        assert!(sm.audio_chunk_sent);
        sm.process_frame(true, &frame(2000));
        assert!(!sm.audio_chunk_sent);
    }
}
