// Raw serial ports for the modem's two character devices: a line-oriented
// AT command port and a raw-byte PCM audio port. Both are opened the same
// way (115200 8N1, no flow control, CLOCAL|CREAD) but serve very different
// access patterns: the AT port serializes one in-flight request at a time
// through a dedicated I/O thread; the PCM port is read and written directly
// by its callers (capture and playback run on separate threads, full
// duplex, no framing).
//
// Grounded on a native AT-modem client's termios configuration and
// request/response framing (OK/ERROR/+CME ERROR/+CMS ERROR detection, echo
// stripping, control-byte sanitizing), adapted from a tokio mpsc/oneshot
// channel pair to std::sync::mpsc since nothing else in this crate runs an
// async runtime.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;

const READ_BUF_SIZE: usize = 1024;

fn open_raw(path: &str) -> Result<RawFd, String> {
    let fd = fcntl::open(
        path,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .map_err(|e| format!("open {path}: {e}"))?;

    // Clear O_NONBLOCK now that the device is open: reads should block up to
    // VTIME, not return EAGAIN immediately.
    let raw = fd.as_raw_fd();
    let flags = fcntl::fcntl(&fd, fcntl::FcntlArg::F_GETFL).map_err(|e| format!("fcntl GETFL: {e}"))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.remove(OFlag::O_NONBLOCK);
    fcntl::fcntl(&fd, fcntl::FcntlArg::F_SETFL(flags)).map_err(|e| format!("fcntl SETFL: {e}"))?;

    configure_termios(raw)?;

    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    termios::tcflush(borrowed, termios::FlushArg::TCIOFLUSH)
        .map_err(|e| format!("tcflush: {e}"))?;

    std::mem::forget(fd); // we now own `raw` directly for the port's lifetime
    Ok(raw)
}

fn configure_termios(fd: RawFd) -> Result<(), String> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut tio = termios::tcgetattr(borrowed).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);
    termios::cfsetispeed(&mut tio, BaudRate::B115200).map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, BaudRate::B115200).map_err(|e| format!("cfsetospeed: {e}"))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    // VMIN=0, VTIME=1: a read returns after 100ms idle or when data arrives.
    // Callers loop their own deadline on top of this.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;
    Ok(())
}

/// A single AT command request, replied to via a one-shot channel.
struct AtRequest {
    command: String,
    timeout: Duration,
    reply: mpsc::Sender<Result<String, String>>,
}

/// Line-oriented AT command port. Owns a dedicated I/O thread so callers
/// never block the rest of the process on modem latency; one request is
/// in flight at a time. Unsolicited notifications (`RING`, `+CLIP:`,
/// `NO CARRIER`, `BUSY`) that arrive while no command is in flight are
/// forwarded on a separate channel rather than mixed into a command's
/// response.
pub struct AtPort {
    tx: mpsc::Sender<AtRequest>,
    unsolicited_rx: std::sync::Mutex<mpsc::Receiver<String>>,
    device: String,
}

impl AtPort {
    pub fn open(device: &str) -> Result<Self, String> {
        let fd = open_raw(device)?;
        let (tx, rx) = mpsc::channel::<AtRequest>();
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel::<String>();
        let dev_name = device.to_string();

        std::thread::Builder::new()
            .name(format!("at-port-{dev_name}"))
            .spawn(move || at_io_thread(fd, rx, unsolicited_tx, &dev_name))
            .map_err(|e| format!("spawn at-port thread: {e}"))?;

        Ok(Self {
            tx,
            unsolicited_rx: std::sync::Mutex::new(unsolicited_rx),
            device: device.to_string(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn command(&self, command: &str, timeout: Duration) -> Result<String, String> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(AtRequest {
                command: command.to_string(),
                timeout,
                reply: reply_tx,
            })
            .map_err(|_| "AT port I/O thread is gone".to_string())?;
        reply_rx
            .recv()
            .map_err(|_| "AT port I/O thread dropped the reply".to_string())?
    }

    /// Drains any unsolicited lines (RING, +CLIP, NO CARRIER, BUSY) observed
    /// since the last call, without blocking.
    pub fn drain_unsolicited(&self) -> Vec<String> {
        let rx = self.unsolicited_rx.lock().unwrap();
        rx.try_iter().collect()
    }
}

fn at_io_thread(fd: RawFd, rx: mpsc::Receiver<AtRequest>, unsolicited_tx: mpsc::Sender<String>, device: &str) {
    let mut idle_buf = String::new();
    loop {
        match rx.try_recv() {
            Ok(req) => {
                let result = execute_at(fd, &req.command, req.timeout);
                match &result {
                    Ok(resp) => tracing::debug!("AT {} on {device}: {:?}", req.command, resp),
                    Err(e) => tracing::warn!("AT {} on {device} failed: {e}", req.command),
                }
                let _ = req.reply.send(result);
            }
            Err(mpsc::TryRecvError::Empty) => {
                poll_unsolicited(fd, &mut idle_buf, &unsolicited_tx);
            }
            Err(mpsc::TryRecvError::Disconnected) => break,
        }
    }
    tracing::debug!("AT port {device} I/O thread exiting");
    let _ = unistd::close(fd);
}

/// Reads whatever arrived during the VTIME idle window (no command in
/// flight) and forwards complete lines as unsolicited notifications.
fn poll_unsolicited(fd: RawFd, idle_buf: &mut String, unsolicited_tx: &mpsc::Sender<String>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    match unistd::read(fd, &mut buf) {
        Ok(0) | Err(nix::errno::Errno::EAGAIN) => {}
        Ok(n) => idle_buf.push_str(&String::from_utf8_lossy(&buf[..n])),
        Err(_) => {}
    }

    while let Some(pos) = idle_buf.find('\n') {
        let line: String = idle_buf.drain(..=pos).collect();
        let trimmed = sanitize_response(&line);
        let trimmed = trimmed.trim();
        if !trimmed.is_empty() {
            let _ = unsolicited_tx.send(trimmed.to_string());
        }
    }
}

fn execute_at(fd: RawFd, command: &str, timeout: Duration) -> Result<String, String> {
    let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
    termios::tcflush(bfd, termios::FlushArg::TCIOFLUSH).map_err(|e| format!("tcflush: {e}"))?;

    let cmd_bytes = format!("{command}\r");
    unistd::write(bfd, cmd_bytes.as_bytes()).map_err(|e| format!("write: {e}"))?;

    let mut buf = [0u8; READ_BUF_SIZE];
    let mut response = String::with_capacity(256);
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            return Err(format!(
                "timeout after {:.1}s, partial: {}",
                timeout.as_secs_f64(),
                response.trim()
            ));
        }

        match unistd::read(fd, &mut buf) {
            Ok(0) => {
                if response_is_complete(&response) {
                    break;
                }
            }
            Ok(n) => {
                response.push_str(&String::from_utf8_lossy(&buf[..n]));
                if response_is_complete(&response) {
                    break;
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {
                if response_is_complete(&response) {
                    break;
                }
            }
            Err(e) => return Err(format!("read: {e}")),
        }
    }

    let cleaned = sanitize_response(&response);
    Ok(strip_echo(&cleaned))
}

fn response_is_complete(response: &str) -> bool {
    for line in response.lines() {
        let trimmed = line.trim();
        if trimmed == "OK"
            || trimmed == "ERROR"
            || trimmed.starts_with("+CME ERROR:")
            || trimmed.starts_with("+CMS ERROR:")
        {
            return true;
        }
    }
    false
}

fn sanitize_response(response: &str) -> String {
    response
        .chars()
        .filter(|&c| c == '\r' || c == '\n' || !c.is_control())
        .filter(|&c| c != '\u{FFFD}')
        .collect()
}

fn strip_echo(response: &str) -> String {
    response
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return false;
            }
            match trimmed.find(|c: char| c.is_ascii_alphabetic()) {
                Some(pos) => !trimmed[pos..].starts_with("AT"),
                None => true,
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Raw PCM audio port: read side delivers caller audio as 16-bit signed
/// little-endian mono PCM; write side paces playback to the caller. Both
/// sides may run concurrently from different threads (full duplex).
pub struct PcmPort {
    fd: RawFd,
}

// SAFETY: the underlying fd is a character device; concurrent read()/write()
// syscalls on it from different threads are independent (no shared file
// offset semantics that matter here), matching spec's full-duplex
// requirement (capture reads, playback writes).
unsafe impl Send for PcmPort {}
unsafe impl Sync for PcmPort {}

impl PcmPort {
    pub fn open(device: &str) -> Result<Self, String> {
        let fd = open_raw(device)?;
        Ok(Self { fd })
    }

    /// Read up to `buf.len()` bytes of raw PCM. Returns `Ok(0)` on a VTIME
    /// idle timeout with no data (not EOF) — callers loop on this.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match unistd::read(self.fd, buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        }
    }

    /// Write the full buffer, looping over short writes.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        let bfd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        while !buf.is_empty() {
            match unistd::write(bfd, buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => buf = &buf[n..],
                Err(nix::errno::Errno::EAGAIN) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
        Ok(())
    }
}

impl Drop for PcmPort {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_complete_ok() {
        assert!(response_is_complete("+CSQ: 15,99\r\nOK\r\n"));
    }

    #[test]
    fn test_response_is_complete_error() {
        assert!(response_is_complete("ERROR\r\n"));
    }

    #[test]
    fn test_response_is_complete_cme_error() {
        assert!(response_is_complete("+CME ERROR: 516\r\n"));
    }

    #[test]
    fn test_response_is_complete_partial() {
        assert!(!response_is_complete("+CSQ: 15,99\r\n"));
    }

    #[test]
    fn test_strip_echo() {
        let response = "ATA\r\nOK\r\n";
        let stripped = strip_echo(response);
        assert!(stripped.contains("OK"));
        assert!(!stripped.contains("ATA"));
    }

    #[test]
    fn test_sanitize_response_removes_nul() {
        let response = "\x00AT+CSQ\r\n+CSQ: 15,99\r\nOK\r\n";
        let cleaned = sanitize_response(response);
        assert!(!cleaned.contains('\x00'));
        assert!(cleaned.contains("+CSQ: 15,99"));
    }
}
