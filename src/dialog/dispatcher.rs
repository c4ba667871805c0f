// Dialog Dispatcher (C6): turns committed utterance chunks into dialog-
// service HTTP calls, splits the spoken response into TTS-sized tokens, and
// keeps the per-call transcript up to date.
//
// Runs on its own thread, fed by a bounded queue so a stalled dialog service
// cannot back up the VAD/utterance pipeline indefinitely; once full, the
// caller drops the chunk and logs a warning (PcmOverrun) rather than blocking.

use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::call::session::{CallSession, Role};
use crate::dialog::opus_codec;
use crate::dialog::tokenizer;
use crate::error::GatewayError;
use crate::tts::client::{TtsRequest, TtsPriority};

pub const DISPATCH_QUEUE_CAPACITY: usize = 50;
const DIALOG_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONTEXT_TURNS: usize = 5;

const FALLBACK_PHRASE: &str = "Sorry, I'm having trouble understanding right now. Could you repeat that?";
const NOISE_TIMEOUT_PHRASE: &str = "It sounds a bit noisy, could you say that again?";

/// One unit of work handed to the dispatcher. `pcm: None` represents a
/// zero-audio message: either the end-of-sentence signal for `chunk_num`
/// (`end_sentence = true`) or a noise-timeout notification that bypasses the
/// dialog service entirely (`noise_timeout = true`).
pub struct DialogChunk {
    pub chunk_num: u64,
    pub pcm: Option<Vec<i16>>,
    pub sample_rate: u32,
    pub duration_ms: u64,
    pub end_sentence: bool,
    pub noise_timeout: bool,
}

impl DialogChunk {
    /// Zero-audio end-of-sentence signal finalizing `chunk_num`.
    pub fn end_signal(chunk_num: u64) -> Self {
        Self {
            chunk_num,
            pcm: None,
            sample_rate: 0,
            duration_ms: 0,
            end_sentence: true,
            noise_timeout: false,
        }
    }

    /// Speech classified continuously for >= T_max: no dialog-service round
    /// trip, just a "too noisy" TTS fallback.
    pub fn noise_timeout(chunk_num: u64) -> Self {
        Self {
            chunk_num,
            pcm: None,
            sample_rate: 0,
            duration_ms: 0,
            end_sentence: false,
            noise_timeout: true,
        }
    }
}

#[derive(Serialize)]
struct Metadata {
    timestamp: String,
    duration_ms: u64,
    sample_rate: u32,
}

#[derive(Serialize)]
struct DialogRequestBody {
    call_id: String,
    chunk_number: u64,
    audio: String,
    language: String,
    context: String,
    caller_id: String,
    metadata: Metadata,
    end_sentence: bool,
}

#[derive(Deserialize)]
struct DialogResponse {
    status: String,
    transcription: Option<String>,
    response: Option<String>,
    #[serde(rename = "continue")]
    keep_going: Option<bool>,
    #[serde(default)]
    #[allow(dead_code)]
    processing_time_ms: Option<u64>,
    error: Option<String>,
    fallback_response: Option<String>,
}

/// Bounded, non-blocking enqueue: on a full queue the chunk is dropped and
/// `PcmOverrun` is returned for the caller to log.
pub fn try_enqueue(sender: &SyncSender<DialogChunk>, chunk: DialogChunk) -> Result<(), GatewayError> {
    let chunk_num = chunk.chunk_num;
    match sender.try_send(chunk) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(GatewayError::PcmOverrun(chunk_num)),
        Err(TrySendError::Disconnected(_)) => Err(GatewayError::DialogHttpError(
            "dialog dispatcher thread is gone".to_string(),
        )),
    }
}

pub struct DispatcherContext {
    pub http: reqwest::blocking::Client,
    pub dialog_url: String,
    pub call_id: String,
    pub session_id: String,
    pub caller_id: String,
    pub language: String,
    pub audio_format: String,
    pub session: Arc<Mutex<CallSession>>,
    pub tts_tx: SyncSender<TtsRequest>,
    pub archive_tx: Option<SyncSender<crate::archive::ArchiveItem>>,
}

/// Main loop: receives chunks until the channel is closed (call teardown).
pub fn run_dialog_dispatcher(rx: Receiver<DialogChunk>, ctx: DispatcherContext) {
    for chunk in rx.iter() {
        if chunk.noise_timeout {
            // Per the noise-timeout testable property: exactly one high-
            // priority "too noisy" TTS request, no dialog-service round trip.
            enqueue_tts(&ctx, NOISE_TIMEOUT_PHRASE, TtsPriority::High);
            continue;
        }

        if let Some(archive_tx) = &ctx.archive_tx {
            if let Some(pcm) = &chunk.pcm {
                crate::archive::try_archive(
                    archive_tx,
                    crate::archive::ArchiveItem {
                        stream: crate::archive::Stream::Caller,
                        pcm: pcm.clone(),
                        sample_rate: chunk.sample_rate,
                    },
                );
            }
        }
        if let Err(e) = dispatch_one(&ctx, &chunk) {
            tracing::warn!(call_id = %ctx.call_id, chunk = chunk.chunk_num, error = %e, "dialog dispatch failed");
        }
    }
}

fn dispatch_one(ctx: &DispatcherContext, chunk: &DialogChunk) -> Result<(), GatewayError> {
    let audio_b64 = match &chunk.pcm {
        Some(pcm) if !pcm.is_empty() => {
            let opus = opus_codec::encode(pcm, chunk.sample_rate)
                .map_err(GatewayError::DialogHttpError)?;
            base64::engine::general_purpose::STANDARD.encode(opus)
        }
        _ => String::new(),
    };

    let context = {
        let session = ctx.session.lock().unwrap();
        session.recent_context(CONTEXT_TURNS)
    };

    let body = DialogRequestBody {
        call_id: ctx.call_id.clone(),
        chunk_number: chunk.chunk_num,
        audio: audio_b64,
        language: ctx.language.clone(),
        context,
        caller_id: ctx.caller_id.clone(),
        metadata: Metadata {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_ms: chunk.duration_ms,
            sample_rate: chunk.sample_rate,
        },
        end_sentence: chunk.end_sentence,
    };

    let result = ctx
        .http
        .post(&ctx.dialog_url)
        .timeout(DIALOG_REQUEST_TIMEOUT)
        .json(&body)
        .send()
        .and_then(|resp| resp.json::<DialogResponse>());

    match result {
        Ok(parsed) if parsed.status == "success" => {
            if let Some(transcription) = parsed.transcription.filter(|t| !t.is_empty()) {
                let mut session = ctx.session.lock().unwrap();
                session.append_transcript(Role::Caller, transcription);
            }
            if let Some(response) = parsed.response.filter(|t| !t.is_empty()) {
                {
                    let mut session = ctx.session.lock().unwrap();
                    session.append_transcript(Role::Bot, response.clone());
                }
                for token in tokenizer::split_into_tokens(&response) {
                    enqueue_tts(ctx, &token, TtsPriority::Normal);
                }
            }
            if parsed.keep_going == Some(false) {
                tracing::info!(call_id = %ctx.call_id, "dialog service signaled end of conversation");
            }
            Ok(())
        }
        Ok(parsed) => {
            let fallback = parsed.fallback_response.unwrap_or_else(|| FALLBACK_PHRASE.to_string());
            tracing::warn!(call_id = %ctx.call_id, error = ?parsed.error, "dialog service returned error status");
            enqueue_tts(ctx, &fallback, TtsPriority::Normal);
            Ok(())
        }
        Err(e) => {
            tracing::warn!(call_id = %ctx.call_id, error = %e, "dialog service request failed");
            enqueue_tts(ctx, FALLBACK_PHRASE, TtsPriority::Normal);
            Err(GatewayError::from(e))
        }
    }
}

fn enqueue_tts(ctx: &DispatcherContext, text: &str, priority: TtsPriority) {
    let request = TtsRequest {
        call_id: ctx.call_id.clone(),
        session_id: ctx.session_id.clone(),
        text: text.to_string(),
        priority,
        language: ctx.language.clone(),
        audio_format: ctx.audio_format.clone(),
    };
    if ctx.tts_tx.send(request).is_err() {
        tracing::warn!(call_id = %ctx.call_id, "tts client thread is gone, dropping request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn test_try_enqueue_succeeds_within_capacity() {
        let (tx, rx) = sync_channel(2);
        let chunk = DialogChunk {
            chunk_num: 1,
            pcm: Some(vec![0i16; 10]),
            sample_rate: 8000,
            duration_ms: 550,
            end_sentence: false,
            noise_timeout: false,
        };
        assert!(try_enqueue(&tx, chunk).is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_try_enqueue_reports_overrun_when_full() {
        let (tx, _rx) = sync_channel(1);
        try_enqueue(&tx, DialogChunk::end_signal(1)).unwrap();
        let err = try_enqueue(&tx, DialogChunk::end_signal(2)).unwrap_err();
        matches!(err, GatewayError::PcmOverrun(2));
    }

    #[test]
    fn test_noise_timeout_chunk_carries_no_audio() {
        let chunk = DialogChunk::noise_timeout(3);
        assert!(chunk.pcm.is_none());
        assert!(chunk.noise_timeout);
        assert_eq!(chunk.chunk_num, 3);
    }

    #[test]
    fn test_end_signal_chunk_sets_end_sentence() {
        let chunk = DialogChunk::end_signal(4);
        assert!(chunk.end_sentence);
        assert!(!chunk.noise_timeout);
    }
}
