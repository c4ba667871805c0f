// Error taxonomy for the voice call pipeline, aligned with the recovery
// policy table: each variant names a recovery action at its call site, not
// just a cause.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("modem I/O error: {0}")]
    ModemTransient(String),

    #[error("call ended: NO CARRIER")]
    ModemHangup,

    #[error("answer failed: {0}")]
    AnswerFailed(String),

    #[error("dialog chunk queue full, dropping chunk {0}")]
    PcmOverrun(u64),

    #[error("dialog service request failed: {0}")]
    DialogHttpError(String),

    #[error("tts engine request failed: {0}")]
    TtsEngineError(String),

    #[error("voice config fetch failed: {0}")]
    ConfigFetchFailed(String),

    #[error("caller speech exceeded max duration")]
    SpeechNoiseTimeout,
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::DialogHttpError(e.to_string())
    }
}
