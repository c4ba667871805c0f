// Top-level ownership (A1/§10.1): the `Gateway` struct is the Core value
// every component borrows from, replacing the module-level globals the
// original handler relied on. One `Gateway` is built per process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::audio::turn_taking::TurnTakingFlags;
use crate::call::controller;
use crate::cli::Cli;
use crate::config::VoiceConfig;
use crate::error::GatewayError;
use crate::serial::at_session::AtSession;
use crate::serial::port::PcmPort;
use crate::timing::TimingSink;
use crate::webhook::WebhookClient;

const RING_POLL_INTERVAL: Duration = Duration::from_millis(300);
const MAX_CONSECUTIVE_INIT_FAILURES: u32 = 3;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub struct Gateway {
    pub config: Arc<RwLock<VoiceConfig>>,
    pub at_session: Arc<Mutex<AtSession>>,
    pub flags: Arc<TurnTakingFlags>,
    pub http: reqwest::blocking::Client,
    pub webhook: WebhookClient,

    pub pcm_device: String,
    pub dialog_url: String,
    pub tts_url: String,
    pub config_url: String,
    pub vpn_ip: String,
    pub tts_staging_dir: PathBuf,

    pub tts_cache_root: PathBuf,
    pub config_cache_path: PathBuf,
    pub transcript_root: PathBuf,
    pub timing_root: PathBuf,

    pub shutdown: Arc<AtomicBool>,
}

impl Gateway {
    pub fn new(cli: &Cli) -> Result<Self, GatewayError> {
        let http = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| GatewayError::ConfigFetchFailed(e.to_string()))?;

        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("callgate");

        let config_cache_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("voice_config.json"));
        let config_url = env_or("CALLGATE_CONFIG_URL", "http://127.0.0.1:8080/api/voice-config");
        let vpn_ip = env_or("CALLGATE_VPN_IP", "0.0.0.0");

        let config = VoiceConfig::load(&http, &config_url, &vpn_ip, &config_cache_path);

        let at_session = AtSession::open(&cli.at_port)?;
        at_session.initialize(config.audio_format)?;
        at_session.set_auto_answer(config.answer_after_rings)?;

        let webhook_url = env_or("CALLGATE_WEBHOOK_URL", "");

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            at_session: Arc::new(Mutex::new(at_session)),
            flags: Arc::new(TurnTakingFlags::new()),
            webhook: WebhookClient::new(http.clone(), webhook_url),
            http,

            pcm_device: cli.pcm_port.clone(),
            dialog_url: env_or("CALLGATE_DIALOG_URL", "http://127.0.0.1:8080/api/dialog"),
            tts_url: env_or("CALLGATE_TTS_URL", "http://127.0.0.1:8080/api/tts"),
            config_url,
            vpn_ip,
            tts_staging_dir: PathBuf::from(env_or("CALLGATE_TTS_STAGING_DIR", "/tmp/callgate-tts")),

            tts_cache_root: data_dir.join("tts_cache"),
            config_cache_path,
            transcript_root: data_dir.join("transcripts"),
            timing_root: data_dir.join("timing"),

            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Accept loop: polls for `RING`, honors `answer_after_rings`, and runs
    /// one call to completion at a time (the modem supports a single active
    /// call). Re-opens the AT session after `ModemTransient`, exiting the
    /// process for supervisor restart after 3 consecutive init failures.
    pub fn run(&self) -> Result<(), GatewayError> {
        let mut consecutive_init_failures = 0u32;

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.wait_for_ring() {
                Ok(RingOutcome::Idle) => {}
                Ok(RingOutcome::Declined) => {
                    consecutive_init_failures = 0;
                }
                Ok(RingOutcome::Answered { caller_id }) => {
                    consecutive_init_failures = 0;
                    if let Err(e) = self.handle_incoming_call(caller_id) {
                        tracing::warn!(error = %e, "call handling ended with an error");
                    }
                }
                Ok(RingOutcome::AnswerRejected { caller_id, reason }) => {
                    // BUSY/NO CARRIER/ERROR on ATA is a normal declined call,
                    // not a modem fault — it must never feed the supervisor-
                    // restart counter below.
                    consecutive_init_failures = 0;
                    tracing::warn!(caller_id = %caller_id, reason = %reason, "answer attempt failed, discarding call setup");
                    self.webhook.answer_failed(&caller_id, &caller_id, &reason);
                }
                Err(e) => {
                    consecutive_init_failures += 1;
                    tracing::warn!(error = %e, attempt = consecutive_init_failures, "modem transient error while idle");
                    if consecutive_init_failures >= MAX_CONSECUTIVE_INIT_FAILURES {
                        tracing::error!("3 consecutive modem init failures, exiting for supervisor restart");
                        std::process::exit(1);
                    }
                }
            }
            std::thread::sleep(RING_POLL_INTERVAL);
        }
        Ok(())
    }

    /// Drains unsolicited notifications for a `RING`. Per the answer-
    /// rejection scenario, `answer_after_rings = -1` must issue no `ATA` and
    /// create no `CallSession`. A positive `answer_after_rings = n` waits
    /// 2n seconds (the modem's own ring period) before issuing `ATA`, so the
    /// caller actually hears `n` rings rather than being picked up instantly.
    ///
    /// A modem-reported BUSY/NO CARRIER/ERROR on `ATA` is a normal declined
    /// call (`AnswerRejected`), not a transient modem fault — only a
    /// genuine `Err` here (port I/O failure) should ever reach `run`'s
    /// consecutive-failure counter.
    fn wait_for_ring(&self) -> Result<RingOutcome, GatewayError> {
        let caller_id = {
            let at = self.at_session.lock().unwrap();
            let lines = at.drain_unsolicited();
            if !lines.iter().any(|l| l.contains("RING")) {
                return Ok(RingOutcome::Idle);
            }
            lines
                .iter()
                .find_map(|l| parse_clip_number(l))
                .unwrap_or_else(|| "unknown".to_string())
        };

        let answer_after_rings = self.config.read().unwrap().answer_after_rings;
        if !should_answer(answer_after_rings) {
            tracing::info!("answer_after_rings < 0, declining ring without answering");
            return Ok(RingOutcome::Declined);
        }

        if let Some(wait) = ring_wait_duration(answer_after_rings) {
            std::thread::sleep(wait);
        }

        let at = self.at_session.lock().unwrap();
        match at.answer() {
            Ok(()) => Ok(RingOutcome::Answered { caller_id }),
            Err(GatewayError::AnswerFailed(reason)) => Ok(RingOutcome::AnswerRejected { caller_id, reason }),
            Err(e) => Err(e),
        }
    }

    fn handle_incoming_call(&self, caller_id: String) -> Result<(), GatewayError> {
        let pcm_port = Arc::new(PcmPort::open(&self.pcm_device).map_err(GatewayError::ModemTransient)?);
        let call_id = next_call_id();
        let timing = Arc::new(TimingSink::new(&self.timing_root, &call_id));
        controller::run_call(self, pcm_port, timing, call_id, caller_id)
    }
}

enum RingOutcome {
    Idle,
    Declined,
    Answered { caller_id: String },
    AnswerRejected { caller_id: String, reason: String },
}

/// A negative `answer_after_rings` means "never pick up": the ring is
/// acknowledged (for logging) but no `ATA` is issued and no `CallSession`
/// is created.
fn should_answer(answer_after_rings: i32) -> bool {
    answer_after_rings >= 0
}

/// `n` rings at the modem's ~2s ring period: waiting `2n` seconds before
/// `ATA` makes the caller actually hear `n` rings instead of an instant
/// pickup. `n <= 0` answers immediately.
fn ring_wait_duration(answer_after_rings: i32) -> Option<Duration> {
    if answer_after_rings > 0 {
        Some(Duration::from_secs(2 * answer_after_rings as u64))
    } else {
        None
    }
}

/// Parses the caller number out of `+CLIP: "<number>",...`.
fn parse_clip_number(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix("+CLIP:")?;
    let first_quote = rest.find('"')?;
    let after = &rest[first_quote + 1..];
    let second_quote = after.find('"')?;
    Some(after[..second_quote].to_string())
}

fn next_call_id() -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("call-{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clip_number_extracts_quoted_digits() {
        let line = r#"+CLIP: "+15551234567",145,"",0,"",0"#;
        assert_eq!(parse_clip_number(line), Some("+15551234567".to_string()));
    }

    #[test]
    fn test_parse_clip_number_returns_none_for_unrelated_line() {
        assert_eq!(parse_clip_number("RING"), None);
    }

    #[test]
    fn test_should_answer_declines_negative_rings() {
        assert!(!should_answer(-1));
        assert!(should_answer(0));
        assert!(should_answer(3));
    }

    #[test]
    fn test_ring_wait_duration_scales_with_ring_count() {
        assert_eq!(ring_wait_duration(0), None);
        assert_eq!(ring_wait_duration(-1), None);
        assert_eq!(ring_wait_duration(3), Some(Duration::from_secs(6)));
    }
}
