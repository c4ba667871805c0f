// Call Controller (C9): owns one call end-to-end. Idle -> Ringing ->
// Answered -> Active -> Ended, spawning the per-call worker threads
// (PCM capture/VAD/utterance, dialog dispatcher, TTS client, playback) and
// tearing all of them down, idempotently, on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::turn_taking::TurnTakingFlags;
use crate::audio::utterance::{UtteranceEvent, UtteranceStateMachine};
use crate::audio::vad::{self, FrameSlicer, VadClassifier};
use crate::audio::playback::{self, PlaybackMessage};
use crate::call::session::{CallSession, Role};
use crate::dialog::dispatcher::{self, DialogChunk, DispatcherContext};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::serial::port::PcmPort;
use crate::timing::TimingSink;
use crate::tts::client::{self, TtsClientConfig, TtsPriority, TtsRequest};

/// Minimum speech-run duration (ms) required before the greeting is allowed
/// to play, in addition to crossing `T_end`. Two differing computations in
/// the source (680ms flat vs. the T_end gate) are unified here: both must
/// hold, per spec.md §9's resolution.
const GREETING_MIN_SPEECH_MS: u32 = 680;

const PCM_READ_CHUNK: usize = 4096;
const CAPTURE_POLL_IDLE: Duration = Duration::from_millis(5);

/// Settle delay between `ATA` (answer) and `AT+CPCMREG=1` (enable PCM), per
/// spec.md §4.9's Active-state entry: the modem needs a moment after
/// answering before the PCM path is ready to register.
const ACTIVE_SETTLE_DELAY: Duration = Duration::from_secs(2);

pub fn run_call(
    gateway: &Gateway,
    pcm_port: Arc<PcmPort>,
    timing: Arc<TimingSink>,
    call_id: String,
    caller_id: String,
) -> Result<(), GatewayError> {
    let config = gateway.config.read().unwrap().clone();
    let session_id = call_id.clone();

    timing.record("call_started");
    gateway.webhook.call_started(&call_id, &session_id, &caller_id);

    std::thread::sleep(ACTIVE_SETTLE_DELAY);
    {
        let at = gateway.at_session.lock().unwrap();
        at.enable_pcm()?;
    }

    let in_call = Arc::new(AtomicBool::new(true));
    let session = Arc::new(Mutex::new(CallSession::new(
        call_id.clone(),
        session_id.clone(),
        caller_id.clone(),
        config.audio_format,
    )));

    let (dialog_tx, dialog_rx) = sync_channel::<DialogChunk>(dispatcher::DISPATCH_QUEUE_CAPACITY);
    let (tts_tx, tts_rx) = sync_channel::<TtsRequest>(32);
    let (playback_tx, playback_rx) = sync_channel::<PlaybackMessage>(8);

    let archive_tx = crate::archive::spawn(&config.audio_archive_dir, &call_id);

    let dispatcher_ctx = DispatcherContext {
        http: gateway.http.clone(),
        dialog_url: gateway.dialog_url.clone(),
        call_id: call_id.clone(),
        session_id: session_id.clone(),
        caller_id: caller_id.clone(),
        language: config.language.clone(),
        audio_format: config.audio_format.tag().to_string(),
        session: session.clone(),
        tts_tx: tts_tx.clone(),
        archive_tx,
    };
    let dialog_handle = std::thread::Builder::new()
        .name(format!("dialog-{call_id}"))
        .spawn(move || dispatcher::run_dialog_dispatcher(dialog_rx, dispatcher_ctx))
        .map_err(|e| GatewayError::ModemTransient(e.to_string()))?;

    let tts_config = TtsClientConfig {
        tts_url: gateway.tts_url.clone(),
        cache_root: gateway.tts_cache_root.clone(),
        staging_dir: gateway.tts_staging_dir.clone(),
        voice: config.voice_settings.voice.clone(),
        sample_rate: config.audio_format.sample_rate(),
    };
    let tts_http = gateway.http.clone();
    let tts_playback_tx = playback_tx.clone();
    let tts_handle = std::thread::Builder::new()
        .name(format!("tts-{call_id}"))
        .spawn(move || client::run_tts_client(tts_http, tts_config, tts_rx, tts_playback_tx))
        .map_err(|e| GatewayError::ModemTransient(e.to_string()))?;

    let playback_pcm_port = pcm_port.clone();
    let playback_flags = gateway.flags.clone();
    let playback_in_call = in_call.clone();
    let playback_handle = std::thread::Builder::new()
        .name(format!("playback-{call_id}"))
        .spawn(move || {
            playback::run_playback_scheduler(
                playback_pcm_port,
                playback_flags,
                playback_rx,
                playback_in_call,
                |_event| {},
            )
        })
        .map_err(|e| GatewayError::ModemTransient(e.to_string()))?;

    // One VAD/slicer/state-machine instance spans the whole call: the
    // pre-greeting phase and the main-body capture loop are two phases of a
    // single continuous chunk_num sequence, not independent streams.
    let mut vad = vad::new_vad(config.audio_format.sample_rate());
    let mut slicer = FrameSlicer::new(config.audio_format.sample_rate());
    let mut sm = UtteranceStateMachine::new(&config);

    let greeted = greet_when_ready(
        &config,
        &pcm_port,
        &gateway.flags,
        &in_call,
        &dialog_tx,
        &tts_tx,
        &session,
        &timing,
        vad.as_mut(),
        &mut slicer,
        &mut sm,
    );
    if !greeted {
        tracing::info!(call_id = %call_id, "call ended before a greeting condition was reached");
    }

    run_capture_loop(
        &pcm_port,
        &gateway.flags,
        &in_call,
        &dialog_tx,
        &timing,
        config.audio_format.sample_rate(),
        vad.as_mut(),
        &mut slicer,
        &mut sm,
    );

    drop(dialog_tx);
    drop(tts_tx);
    drop(playback_tx);
    let _ = dialog_handle.join();
    let _ = tts_handle.join();
    let _ = playback_handle.join();

    cleanup(gateway);
    timing.record("call_ended");
    timing.flush();
    gateway.webhook.call_ended(&call_id, &session_id, "hangup");

    Ok(())
}

/// Waits for the caller's first utterance to cross `T_end` with at least
/// `GREETING_MIN_SPEECH_MS` of speech, then enqueues the welcome message.
/// Returns false if the call ends (`NO CARRIER`) before that happens.
///
/// Every frame event is forwarded to the dispatcher exactly as the main-body
/// capture loop does it (`handle_utterance_event`): any caller speech that
/// arrives before the greeting still reaches the dialog service, and the
/// `chunk_num` sequence it produces is the same one the capture loop
/// continues afterward.
#[allow(clippy::too_many_arguments)]
fn greet_when_ready(
    config: &crate::config::VoiceConfig,
    pcm_port: &Arc<PcmPort>,
    flags: &Arc<TurnTakingFlags>,
    in_call: &Arc<AtomicBool>,
    dialog_tx: &std::sync::mpsc::SyncSender<DialogChunk>,
    tts_tx: &std::sync::mpsc::SyncSender<TtsRequest>,
    session: &Arc<Mutex<CallSession>>,
    timing: &Arc<TimingSink>,
    vad: &mut dyn VadClassifier,
    slicer: &mut FrameSlicer,
    sm: &mut UtteranceStateMachine,
) -> bool {
    let mut buf = [0u8; PCM_READ_CHUNK];
    let sample_rate = config.audio_format.sample_rate();

    while in_call.load(Ordering::Relaxed) {
        let n = match pcm_port.read(&mut buf) {
            Ok(n) => n,
            Err(_) => {
                in_call.store(false, Ordering::SeqCst);
                return false;
            }
        };
        if n == 0 {
            std::thread::sleep(CAPTURE_POLL_IDLE);
            continue;
        }

        for frame in slicer.push(&buf[..n]) {
            let is_speech = vad.is_speech(&frame);
            for event in sm.process_frame(is_speech, &frame) {
                let is_end_signal = matches!(event, UtteranceEvent::EndSignal { .. });
                handle_utterance_event(event, flags, dialog_tx, sample_rate, timing, sm.current_chunk_num());
                if is_end_signal
                    && sm.caller_has_spoken()
                    && sm.last_utterance_duration_ms() >= GREETING_MIN_SPEECH_MS
                {
                    timing.record("greeting_gate_opened");
                    enqueue_greeting(config, tts_tx, session);
                    return true;
                }
            }
        }
    }
    false
}

/// Forwards one state-machine event to the dispatcher and/or turn-taking
/// flags. Shared by the pre-greeting and main-body capture loops so neither
/// phase can silently drop an event kind the other handles.
fn handle_utterance_event(
    event: UtteranceEvent,
    flags: &TurnTakingFlags,
    dialog_tx: &std::sync::mpsc::SyncSender<DialogChunk>,
    sample_rate: u32,
    timing: &TimingSink,
    current_chunk_num: u64,
) {
    match event {
        UtteranceEvent::SpeechObserved => flags.mark_speech_observed(),
        UtteranceEvent::AudioChunk { chunk_num, pcm } | UtteranceEvent::ProgressiveChunk { chunk_num, pcm } => {
            let duration_ms = (pcm.len() as u64 * 1000) / sample_rate as u64;
            let chunk = DialogChunk {
                chunk_num,
                pcm: Some(pcm),
                sample_rate,
                duration_ms,
                end_sentence: false,
                noise_timeout: false,
            };
            if let Err(e) = dispatcher::try_enqueue(dialog_tx, chunk) {
                tracing::warn!(chunk = chunk_num, error = %e, "dropping chunk, dispatcher queue full");
            }
        }
        UtteranceEvent::EndSignal { chunk_num } => {
            flags.mark_silence_declared();
            let _ = dispatcher::try_enqueue(dialog_tx, DialogChunk::end_signal(chunk_num));
        }
        UtteranceEvent::NoiseTimeout => {
            flags.mark_silence_declared();
            timing.record("noise_timeout");
            let _ = dispatcher::try_enqueue(dialog_tx, DialogChunk::noise_timeout(current_chunk_num));
        }
    }
}

fn enqueue_greeting(
    config: &crate::config::VoiceConfig,
    tts_tx: &std::sync::mpsc::SyncSender<TtsRequest>,
    session: &Arc<Mutex<CallSession>>,
) {
    let text = config.welcome_message.clone();
    let (call_id, session_id) = {
        let mut session = session.lock().unwrap();
        session.append_transcript(Role::Bot, text.clone());
        (session.call_id.clone(), session.session_id.clone())
    };
    let _ = tts_tx.send(TtsRequest {
        call_id,
        session_id,
        text,
        priority: TtsPriority::High,
        language: config.language.clone(),
        audio_format: config.audio_format.tag().to_string(),
    });
}

/// Main-body capture loop: runs for the remainder of the call after the
/// greeting gate, continuing the same `vad`/`slicer`/`sm` instances
/// `greet_when_ready` used so the `chunk_num` sequence stays gap-free across
/// both phases.
#[allow(clippy::too_many_arguments)]
fn run_capture_loop(
    pcm_port: &Arc<PcmPort>,
    flags: &Arc<TurnTakingFlags>,
    in_call: &Arc<AtomicBool>,
    dialog_tx: &std::sync::mpsc::SyncSender<DialogChunk>,
    timing: &Arc<TimingSink>,
    sample_rate: u32,
    vad: &mut dyn VadClassifier,
    slicer: &mut FrameSlicer,
    sm: &mut UtteranceStateMachine,
) {
    let mut buf = [0u8; PCM_READ_CHUNK];

    while in_call.load(Ordering::Relaxed) {
        let n = match pcm_port.read(&mut buf) {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            std::thread::sleep(CAPTURE_POLL_IDLE);
            continue;
        }

        for frame in slicer.push(&buf[..n]) {
            let is_speech = vad.is_speech(&frame);
            for event in sm.process_frame(is_speech, &frame) {
                handle_utterance_event(event, flags, dialog_tx, sample_rate, timing, sm.current_chunk_num());
            }
        }
    }
}

/// Idempotent teardown: always re-issues `ATH`/`AT+CPCMREG=0`/`AT+CLIP=1`
/// regardless of how the call ended (hangup, error, or modem dropout).
fn cleanup(gateway: &Gateway) {
    let at = gateway.at_session.lock().unwrap();
    at.shutdown();
}
