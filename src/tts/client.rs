// TTS Client (C7): sends synthesis requests to the TTS engine and exposes
// synthesized PCM to the Playback Scheduler via an in-process channel.
//
// The engine itself side-channels raw PCM into a staging directory rather
// than returning bytes in the HTTP response. A background poller thread
// watches that directory and feeds a channel, per the "filesystem as an
// async bus" redesign note: the core only ever sees the in-process channel,
// never the directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender};
use std::time::Duration;

use serde::Serialize;

use crate::audio::playback::PlaybackMessage;
use crate::tts::cache;

const STAGING_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsPriority {
    Normal,
    High,
}

impl TtsPriority {
    fn as_str(self) -> &'static str {
        match self {
            TtsPriority::Normal => "normal",
            TtsPriority::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsAction {
    Speak,
    Hangup,
}

impl TtsAction {
    fn as_str(self) -> &'static str {
        match self {
            TtsAction::Speak => "speak",
            TtsAction::Hangup => "hangup",
        }
    }
}

#[derive(Clone)]
pub struct TtsRequest {
    pub call_id: String,
    pub session_id: String,
    pub text: String,
    pub priority: TtsPriority,
    pub language: String,
    pub audio_format: String,
}

#[derive(Serialize)]
struct TtsEngineBody<'a> {
    #[serde(rename = "callId")]
    call_id: &'a str,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    text: &'a str,
    action: &'a str,
    priority: &'a str,
    language: &'a str,
    audio_format: &'a str,
}

pub struct TtsClientConfig {
    pub tts_url: String,
    pub cache_root: PathBuf,
    pub staging_dir: PathBuf,
    pub voice: String,
    pub sample_rate: u32,
}

/// Consumes requests from `rx`. A High-priority request (noise-timeout or
/// dialog-error fallback) cancels whatever is already pending — it empties
/// the queue before enqueueing itself — rather than merely jumping the
/// line ahead of a Normal backlog.
pub fn run_tts_client(
    client: reqwest::blocking::Client,
    config: TtsClientConfig,
    rx: Receiver<TtsRequest>,
    playback_tx: SyncSender<PlaybackMessage>,
) {
    let mut pending: Vec<TtsRequest> = Vec::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(req) => enqueue_with_priority(&mut pending, req),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let next = if pending.is_empty() { None } else { Some(pending.remove(0)) };

        if let Some(req) = next {
            if let Some(pcm) = synthesize(&client, &config, &req) {
                let message = PlaybackMessage {
                    pcm,
                    sample_rate: config.sample_rate,
                };
                if playback_tx.send(message).is_err() {
                    tracing::warn!(call_id = %req.call_id, "playback scheduler gone, dropping tts artifact");
                }
            }
        }
    }
}

/// A High request empties `pending` before joining it: a noise-timeout or
/// dialog-error fallback cancels whatever was queued up, it doesn't just cut
/// in line ahead of it. A Normal request always appends.
fn enqueue_with_priority(pending: &mut Vec<TtsRequest>, req: TtsRequest) {
    if req.priority == TtsPriority::High {
        if !pending.is_empty() {
            tracing::info!("high-priority tts request interrupting {} pending", pending.len());
        }
        pending.clear();
    }
    pending.push(req);
}

/// Cache-first synthesis: a hit returns immediately with zero HTTP traffic
/// (the cache round-trip property).
fn synthesize(client: &reqwest::blocking::Client, config: &TtsClientConfig, req: &TtsRequest) -> Option<Vec<u8>> {
    if let Some(cached) = cache::lookup(&config.cache_root, &req.audio_format, &config.voice, &req.text) {
        return Some(cached);
    }

    let body = TtsEngineBody {
        call_id: &req.call_id,
        session_id: &req.session_id,
        text: &req.text,
        action: TtsAction::Speak.as_str(),
        priority: req.priority.as_str(),
        language: &req.language,
        audio_format: &req.audio_format,
    };

    let resp = client
        .post(&config.tts_url)
        .timeout(Duration::from_secs(10))
        .json(&body)
        .send();

    match resp {
        Ok(r) if r.status().is_success() => {
            match wait_for_staged_artifact(&config.staging_dir, &req.call_id, Duration::from_secs(8)) {
                Some(pcm) => {
                    if let Err(e) = cache::store(&config.cache_root, &req.audio_format, &config.voice, &req.text, &pcm) {
                        tracing::warn!(error = %e, "failed to persist tts cache artifact");
                    }
                    Some(pcm)
                }
                None => {
                    tracing::warn!(call_id = %req.call_id, "tts engine accepted request but no staged artifact appeared");
                    None
                }
            }
        }
        Ok(r) => {
            tracing::warn!(call_id = %req.call_id, status = %r.status(), "tts engine request failed");
            None
        }
        Err(e) => {
            tracing::warn!(call_id = %req.call_id, error = %e, "tts engine request failed");
            None
        }
    }
}

/// Polls the staging directory for `tts_{call_id}_{millis}.raw`, consuming
/// (reading + removing) the first match found.
fn wait_for_staged_artifact(staging_dir: &Path, call_id: &str, timeout: Duration) -> Option<Vec<u8>> {
    let prefix = format!("tts_{call_id}_");
    let deadline = std::time::Instant::now() + timeout;

    loop {
        if let Some(path) = find_staged_file(staging_dir, &prefix) {
            let bytes = fs::read(&path).ok();
            let _ = fs::remove_file(&path);
            return bytes;
        }
        if std::time::Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(STAGING_POLL_INTERVAL);
    }
}

fn find_staged_file(staging_dir: &Path, prefix: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(staging_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && name.ends_with(".raw") {
            return Some(entry.path());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(text: &str, priority: TtsPriority) -> TtsRequest {
        TtsRequest {
            call_id: "call-1".to_string(),
            session_id: "call-1".to_string(),
            text: text.to_string(),
            priority,
            language: "en".to_string(),
            audio_format: "8k".to_string(),
        }
    }

    #[test]
    fn test_normal_requests_append() {
        let mut pending = Vec::new();
        enqueue_with_priority(&mut pending, request("one", TtsPriority::Normal));
        enqueue_with_priority(&mut pending, request("two", TtsPriority::Normal));
        let texts: Vec<&str> = pending.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn test_high_priority_request_cancels_pending_backlog() {
        let mut pending = Vec::new();
        enqueue_with_priority(&mut pending, request("queued one", TtsPriority::Normal));
        enqueue_with_priority(&mut pending, request("queued two", TtsPriority::Normal));
        enqueue_with_priority(&mut pending, request("noise timeout fallback", TtsPriority::High));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].text, "noise timeout fallback");
    }

    #[test]
    fn test_find_staged_file_matches_prefix_and_suffix() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("tts_call1_12345.raw"), b"pcm").unwrap();
        fs::write(tmp.path().join("tts_call2_99999.raw"), b"other").unwrap();
        let found = find_staged_file(tmp.path(), "tts_call1_").unwrap();
        assert_eq!(found.file_name().unwrap().to_str().unwrap(), "tts_call1_12345.raw");
    }

    #[test]
    fn test_wait_for_staged_artifact_consumes_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("tts_call1_1.raw"), b"abc").unwrap();
        let bytes = wait_for_staged_artifact(tmp.path(), "call1", Duration::from_millis(500)).unwrap();
        assert_eq!(bytes, b"abc");
        assert!(!tmp.path().join("tts_call1_1.raw").exists());
    }

    #[test]
    fn test_wait_for_staged_artifact_times_out_when_absent() {
        let tmp = TempDir::new().unwrap();
        let result = wait_for_staged_artifact(tmp.path(), "ghost", Duration::from_millis(150));
        assert!(result.is_none());
    }
}
