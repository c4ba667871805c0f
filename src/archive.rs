// Optional audio archive sink (A7): writes Opus-compressed call recordings,
// opt-in via `VoiceConfig::audio_archive_dir`. Per the design note on
// PCM-to-Opus archiving, this must never block the dispatch path: the
// producer side only ever does a non-blocking `try_send`, dropping and
// logging on backpressure rather than waiting on disk I/O.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use crate::dialog::opus_codec;

const ARCHIVE_QUEUE_CAPACITY: usize = 32;

pub enum Stream {
    Caller,
    Bot,
}

impl Stream {
    fn tag(&self) -> &'static str {
        match self {
            Stream::Caller => "caller",
            Stream::Bot => "bot",
        }
    }
}

pub struct ArchiveItem {
    pub stream: Stream,
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
}

/// Spawns the archive writer thread. Returns `None` if `archive_dir` is
/// empty (archiving disabled).
pub fn spawn(archive_dir: &str, call_id: &str) -> Option<SyncSender<ArchiveItem>> {
    if archive_dir.is_empty() {
        return None;
    }
    let dir = PathBuf::from(archive_dir);
    let call_id = call_id.to_string();
    let (tx, rx) = sync_channel(ARCHIVE_QUEUE_CAPACITY);

    let spawn_result = std::thread::Builder::new()
        .name(format!("archive-{call_id}"))
        .spawn(move || run_archive_sink(dir, call_id, rx));

    match spawn_result {
        Ok(_) => Some(tx),
        Err(e) => {
            tracing::warn!(error = %e, "failed to spawn archive sink thread, archiving disabled for this call");
            None
        }
    }
}

pub fn try_archive(tx: &SyncSender<ArchiveItem>, item: ArchiveItem) {
    if let Err(TrySendError::Full(_)) = tx.try_send(item) {
        tracing::warn!("audio archive queue full, dropping chunk");
    }
}

fn run_archive_sink(dir: PathBuf, call_id: String, rx: Receiver<ArchiveItem>) {
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(error = %e, "failed to create audio archive directory, archiving disabled");
        return;
    }

    let mut files: std::collections::HashMap<&'static str, File> = std::collections::HashMap::new();

    for item in rx.iter() {
        let tag = item.stream.tag();
        let encoded = match opus_codec::encode(&item.pcm, item.sample_rate) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode archive chunk, skipping");
                continue;
            }
        };

        if !files.contains_key(tag) {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let path = dir.join(format!("{call_id}_{tag}_{timestamp}.opus"));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => {
                    files.insert(tag, f);
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = ?path, "failed to open archive file, dropping chunk");
                    continue;
                }
            }
        }

        if let Some(file) = files.get_mut(tag) {
            if let Err(e) = file.write_all(&encoded) {
                tracing::warn!(error = %e, "failed to write archive chunk");
            }
        }
    }
}
