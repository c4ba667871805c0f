use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "callgate",
    version,
    about = "Cellular-modem voice call gateway: VAD, turn-taking, dialog dispatch, and TTS playback"
)]
pub struct Cli {
    /// Path to the cached voice-config JSON file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// AT command serial device.
    #[arg(long, default_value = "/dev/ttyUSB3")]
    pub at_port: String,

    /// PCM audio serial device.
    #[arg(long, default_value = "/dev/ttyUSB4")]
    pub pcm_port: String,

    /// Tracing filter directive, e.g. "callgate=debug".
    #[arg(long, default_value = "callgate=info")]
    pub log_level: String,

    /// Exercise modem init + teardown once, then exit, without waiting for a
    /// call. Useful for verifying wiring on a fresh SIM/modem combination.
    #[arg(long)]
    pub self_test: bool,
}
