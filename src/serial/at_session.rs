// AT Session (C2): the fixed command sequences the Call Controller issues
// at call boundaries. Owns the AtPort; does not own the PCM port (that is
// opened separately by the Call Controller when a call becomes Active).

use std::time::Duration;

use crate::config::AudioFormat;
use crate::error::GatewayError;
use crate::serial::port::AtPort;

const INIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
const ANSWER_TIMEOUT: Duration = Duration::from_millis(300);

pub struct AtSession {
    port: AtPort,
}

impl AtSession {
    pub fn open(device: &str) -> Result<Self, GatewayError> {
        let port = AtPort::open(device).map_err(GatewayError::ModemTransient)?;
        Ok(Self { port })
    }

    /// Echo-off, disable sleep, set volume, enable caller-ID + ring
    /// notifications, set the PCM frame rate for the current audio format.
    pub fn initialize(&self, audio_format: AudioFormat) -> Result<(), GatewayError> {
        self.expect_ok("ATE0", INIT_COMMAND_TIMEOUT)
            .map_err(|_| GatewayError::ModemTransient("echo-off (ATE0) never succeeded".into()))?;

        for cmd in ["AT+CSCLK=0", "AT+CLVL=5", "AT+CLIP=1", "AT+CRC=1"] {
            self.expect_ok(cmd, INIT_COMMAND_TIMEOUT)?;
        }

        let frm = format!("AT+CPCMFRM={}", audio_format.cpcmfrm_value());
        self.expect_ok(&frm, INIT_COMMAND_TIMEOUT)
            .map_err(|_| GatewayError::ModemTransient("PcmRejected: AT+CPCMFRM failed".into()))?;

        Ok(())
    }

    /// `ATA` with a tight budget. Returns an error (no CallSession created)
    /// if the modem reports BUSY, NO CARRIER, or ERROR.
    pub fn answer(&self) -> Result<(), GatewayError> {
        let resp = self
            .port
            .command("ATA", ANSWER_TIMEOUT)
            .map_err(GatewayError::ModemTransient)?;
        if resp.contains("BUSY") || resp.contains("NO CARRIER") || resp.contains("ERROR") {
            return Err(GatewayError::AnswerFailed(resp));
        }
        Ok(())
    }

    /// `ATS0=<rings>`: arms the modem's own auto-answer register so it picks
    /// up after `rings` rings without the Gateway having to issue `ATA`
    /// itself. `rings <= 0` disables auto-answer (`ATS0=0`) and leaves
    /// answering to `wait_for_ring`'s explicit `ATA`.
    pub fn set_auto_answer(&self, rings: i32) -> Result<(), GatewayError> {
        let rings = rings.max(0);
        self.expect_ok(&format!("ATS0={rings}"), INIT_COMMAND_TIMEOUT)
    }

    pub fn enable_pcm(&self) -> Result<(), GatewayError> {
        self.expect_ok("AT+CPCMREG=1", INIT_COMMAND_TIMEOUT)
    }

    pub fn disable_pcm(&self) -> Result<(), GatewayError> {
        self.expect_ok("AT+CPCMREG=0", INIT_COMMAND_TIMEOUT)
    }

    pub fn hangup(&self) -> Result<(), GatewayError> {
        self.expect_ok("ATH", INIT_COMMAND_TIMEOUT)
    }

    pub fn query_network_mode(&self) -> Result<String, GatewayError> {
        self.port
            .command("AT+CNSMOD?", INIT_COMMAND_TIMEOUT)
            .map_err(GatewayError::ModemTransient)
    }

    /// Unsolicited notifications observed since the last call (RING,
    /// `+CLIP: "<number>",...`, NO CARRIER, BUSY, ERROR).
    pub fn drain_unsolicited(&self) -> Vec<String> {
        self.port.drain_unsolicited()
    }

    /// Teardown is idempotent: callable after any partial setup. Always
    /// re-issues ATH and AT+CPCMREG=0, then re-arms caller-ID notification.
    pub fn shutdown(&self) {
        let _ = self.port.command("AT+CPCMREG=0", INIT_COMMAND_TIMEOUT);
        let _ = self.port.command("ATH", INIT_COMMAND_TIMEOUT);
        let _ = self.port.command("AT+CLIP=1", INIT_COMMAND_TIMEOUT);
    }

    fn expect_ok(&self, command: &str, timeout: Duration) -> Result<(), GatewayError> {
        let resp = self
            .port
            .command(command, timeout)
            .map_err(GatewayError::ModemTransient)?;
        if resp.contains("OK") {
            Ok(())
        } else {
            Err(GatewayError::ModemTransient(format!(
                "{command} did not return OK: {resp:?}"
            )))
        }
    }

    pub fn device(&self) -> &str {
        self.port.device()
    }
}
