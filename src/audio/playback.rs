// Playback Scheduler (C8): paces PCM artifacts to real-time on the PCM
// port, honoring the turn-taking gate before the first chunk of a message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::turn_taking::{gate_before_new_message, TurnTakingFlags};
use crate::serial::port::PcmPort;

const CHUNK_DURATION_MS: u32 = 40;

/// One playback message: raw 16-bit PCM produced by the TTS engine.
pub struct PlaybackMessage {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

pub enum PlaybackEvent {
    Complete,
}

/// Bytes written per second of playback at `sample_rate` (mono, 16-bit):
/// the core pacing invariant.
pub fn bytes_per_second(sample_rate: u32) -> u32 {
    sample_rate * 2
}

fn chunk_bytes(sample_rate: u32) -> usize {
    (sample_rate as f64 * 2.0 * (CHUNK_DURATION_MS as f64 / 1000.0)) as usize
}

pub fn run_playback_scheduler(
    pcm_port: Arc<PcmPort>,
    flags: Arc<TurnTakingFlags>,
    inbox: Receiver<PlaybackMessage>,
    in_call: Arc<AtomicBool>,
    on_event: impl Fn(PlaybackEvent),
) {
    while in_call.load(Ordering::Relaxed) {
        let message = match inbox.recv_timeout(Duration::from_millis(200)) {
            Ok(m) => m,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        gate_before_new_message(&flags);
        flags.set_bot_is_speaking(true);

        if let Err(e) = play_artifact(&pcm_port, &message, &in_call) {
            tracing::warn!("playback write failed: {e}");
        }

        flags.set_bot_is_speaking(false);
        on_event(PlaybackEvent::Complete);
    }
}

fn play_artifact(
    pcm_port: &PcmPort,
    message: &PlaybackMessage,
    in_call: &AtomicBool,
) -> std::io::Result<()> {
    let chunk_size = chunk_bytes(message.sample_rate);
    let chunk_duration = Duration::from_millis(CHUNK_DURATION_MS as u64);

    for chunk in message.pcm.chunks(chunk_size) {
        if !in_call.load(Ordering::Relaxed) {
            break;
        }
        let started = Instant::now();
        pcm_port.write_all(chunk)?;
        let elapsed = started.elapsed();
        if elapsed < chunk_duration {
            std::thread::sleep(chunk_duration - elapsed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_second_matches_pacing_invariant() {
        assert_eq!(bytes_per_second(8000), 16000);
        assert_eq!(bytes_per_second(16000), 32000);
    }

    #[test]
    fn test_chunk_bytes_40ms_at_8khz() {
        // 8000 * 2 bytes/sample * 0.04s = 640 bytes
        assert_eq!(chunk_bytes(8000), 640);
    }

    #[test]
    fn test_chunk_bytes_40ms_at_16khz() {
        assert_eq!(chunk_bytes(16000), 1280);
    }
}
