pub mod playback;
pub mod turn_taking;
pub mod utterance;
pub mod vad;
