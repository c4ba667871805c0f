// CallSession (§3): one per active call. Exactly one may exist at a time.

use std::time::Instant;

use crate::config::AudioFormat;

#[derive(Debug, Clone)]
pub enum Role {
    Caller,
    Bot,
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
}

pub struct CallSession {
    pub call_id: String,
    pub session_id: String,
    pub caller_id: String,
    pub audio_format: AudioFormat,
    pub started_at: Instant,
    transcript: Vec<TranscriptEntry>,
}

impl CallSession {
    pub fn new(call_id: String, session_id: String, caller_id: String, audio_format: AudioFormat) -> Self {
        Self {
            call_id,
            session_id,
            caller_id,
            audio_format,
            started_at: Instant::now(),
            transcript: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio_format.sample_rate()
    }

    /// Bytes per frame_bytes = sample_rate * 0.02 * 2.
    pub fn pcm_frame_bytes(&self) -> usize {
        crate::audio::vad::frame_bytes(self.sample_rate())
    }

    pub fn append_transcript(&mut self, role: Role, text: String) {
        self.transcript.push(TranscriptEntry { role, text });
    }

    /// Last `n` transcript entries, joined, for the dialog service's
    /// `context` field.
    pub fn recent_context(&self, n: usize) -> String {
        self.transcript
            .iter()
            .rev()
            .take(n)
            .rev()
            .map(|entry| match entry.role {
                Role::Caller => format!("Caller: {}", entry.text),
                Role::Bot => format!("Bot: {}", entry.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_frame_bytes_8khz() {
        let session = CallSession::new("c1".into(), "s1".into(), "unknown".into(), AudioFormat::Eight);
        assert_eq!(session.pcm_frame_bytes(), 320);
    }

    #[test]
    fn test_recent_context_limits_to_n() {
        let mut session =
            CallSession::new("c1".into(), "s1".into(), "unknown".into(), AudioFormat::Eight);
        for i in 0..10 {
            session.append_transcript(Role::Caller, format!("turn {i}"));
        }
        let context = session.recent_context(5);
        assert_eq!(context.lines().count(), 5);
        assert!(context.contains("turn 9"));
        assert!(!context.contains("turn 4"));
    }
}
