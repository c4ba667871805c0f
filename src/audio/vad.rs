// VAD Framer (C3): slices the PCM stream into fixed-duration frames and
// classifies each one speech/silence. The classifier is stateless with
// respect to utterances — all temporal logic (thresholds, chunking, noise
// timeout) lives in `utterance`.

use webrtc_vad::{SampleRate, Vad, VadMode};

pub const FRAME_DURATION_MS: u32 = 20;

/// Bytes per 20ms frame of 16-bit mono PCM at the given sample rate.
pub fn frame_bytes(sample_rate: u32) -> usize {
    (sample_rate as f64 * (FRAME_DURATION_MS as f64 / 1000.0) * 2.0) as usize
}

/// Mean-absolute-amplitude fallback threshold, used when no higher-quality
/// classifier is available.
const AMPLITUDE_THRESHOLD: i32 = 500;

/// No `Send` supertrait: a classifier is built and consumed entirely within
/// the capture thread's own call to `UtteranceStateMachine::process_frame`,
/// never handed across a thread boundary, and the WebRTC-class classifier's
/// underlying C instance (unlike `AmplitudeVad`) is not safe to move.
pub trait VadClassifier {
    /// `samples` is exactly one 20ms frame of 16-bit PCM.
    fn is_speech(&mut self, samples: &[i16]) -> bool;
}

/// Builds the primary classifier for `sample_rate`: a WebRTC-class VAD at
/// aggressiveness level 3 (`VadMode::VeryAggressive`), matching the original
/// `webrtcvad`-at-mode-3 configuration. Falls back to the mean-amplitude
/// classifier for a sample rate WebRTC's VAD doesn't support.
pub fn new_vad(sample_rate: u32) -> Box<dyn VadClassifier> {
    match WebRtcVad::new(sample_rate) {
        Some(vad) => Box::new(vad),
        None => {
            tracing::warn!(sample_rate, "webrtc VAD unsupported at this rate, falling back to amplitude VAD");
            Box::new(AmplitudeVad::new())
        }
    }
}

/// WebRTC-class classifier (aggressiveness level 3), grounded on libfvad via
/// the `webrtc-vad` crate. Requires exactly one 10/20/30ms frame per call at
/// one of 8/16/32/48 kHz; the Call Controller only ever feeds it 20ms frames.
pub struct WebRtcVad {
    vad: Vad,
}

impl WebRtcVad {
    pub fn new(sample_rate: u32) -> Option<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            _ => return None,
        };
        let mut vad = Vad::new();
        vad.set_mode(VadMode::VeryAggressive);
        let _ = vad.set_sample_rate(rate);
        Some(Self { vad })
    }
}

impl VadClassifier for WebRtcVad {
    fn is_speech(&mut self, samples: &[i16]) -> bool {
        self.vad.is_voice_segment(samples).unwrap_or(false)
    }
}

/// Mean-absolute-amplitude classifier. Used whenever a WebRTC-class VAD is
/// unavailable for the target platform.
pub struct AmplitudeVad {
    threshold: i32,
}

impl AmplitudeVad {
    pub fn new() -> Self {
        Self {
            threshold: AMPLITUDE_THRESHOLD,
        }
    }

    pub fn with_threshold(threshold: i32) -> Self {
        Self { threshold }
    }
}

impl Default for AmplitudeVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VadClassifier for AmplitudeVad {
    fn is_speech(&mut self, samples: &[i16]) -> bool {
        if samples.is_empty() {
            return false;
        }
        let sum: i64 = samples.iter().map(|&s| (s as i64).abs()).sum();
        let mean = sum / samples.len() as i64;
        mean > self.threshold as i64
    }
}

/// Splits a raw PCM byte stream into fixed-size 20ms frames, buffering any
/// partial frame across calls.
pub struct FrameSlicer {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameSlicer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frame_bytes: frame_bytes(sample_rate),
            pending: Vec::new(),
        }
    }

    /// Feed newly-read bytes; returns every complete 20ms frame now
    /// available, as `i16` little-endian samples, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_bytes {
            let frame_bytes: Vec<u8> = self.pending.drain(..self.frame_bytes).collect();
            let samples: Vec<i16> = frame_bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            frames.push(samples);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_8khz() {
        assert_eq!(frame_bytes(8000), 320);
    }

    #[test]
    fn test_frame_bytes_16khz() {
        assert_eq!(frame_bytes(16000), 640);
    }

    #[test]
    fn test_amplitude_vad_silence() {
        let mut vad = AmplitudeVad::new();
        let silence = vec![0i16; 320];
        assert!(!vad.is_speech(&silence));
    }

    #[test]
    fn test_amplitude_vad_speech() {
        let mut vad = AmplitudeVad::new();
        let speech = vec![2000i16; 320];
        assert!(vad.is_speech(&speech));
    }

    #[test]
    fn test_amplitude_vad_below_threshold() {
        let mut vad = AmplitudeVad::with_threshold(500);
        let quiet = vec![100i16; 320];
        assert!(!vad.is_speech(&quiet));
    }

    #[test]
    fn test_frame_slicer_buffers_partial_frames() {
        let mut slicer = FrameSlicer::new(8000); // 320 bytes/frame
        let frames = slicer.push(&[0u8; 100]);
        assert!(frames.is_empty());
        let frames = slicer.push(&[0u8; 220]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 160); // 320 bytes / 2
    }

    #[test]
    fn test_frame_slicer_multiple_frames_in_one_push() {
        let mut slicer = FrameSlicer::new(8000);
        let frames = slicer.push(&[0u8; 640]); // exactly 2 frames
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_webrtc_vad_supports_8k_and_16k() {
        assert!(WebRtcVad::new(8000).is_some());
        assert!(WebRtcVad::new(16000).is_some());
    }

    #[test]
    fn test_webrtc_vad_rejects_unsupported_rate() {
        assert!(WebRtcVad::new(44100).is_none());
    }

    #[test]
    fn test_new_vad_falls_back_for_unsupported_rate() {
        // 44100Hz isn't one of WebRTC's four supported rates, so the factory
        // must still hand back a usable classifier.
        let mut vad = new_vad(44100);
        let silence = vec![0i16; 882]; // 20ms at 44.1kHz
        assert!(!vad.is_speech(&silence));
    }
}
