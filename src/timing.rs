// Profiling/timing sink (A5): records named timing events per call to
// `{timing_root}/{call_id}.json`, for offline latency analysis. Never on the
// hot path: writes are best-effort and logged, not propagated.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Serialize)]
struct TimingEvent {
    event: String,
    timestamp: String,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

pub struct TimingSink {
    path: PathBuf,
    started_at: std::time::Instant,
    events: Mutex<Vec<TimingEvent>>,
}

impl TimingSink {
    pub fn new(timing_root: &Path, call_id: &str) -> Self {
        Self {
            path: timing_root.join(format!("{call_id}.json")),
            started_at: std::time::Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, event: &str) {
        self.record_with_detail(event, None);
    }

    pub fn record_with_detail(&self, event: &str, detail: Option<serde_json::Value>) {
        let mut events = self.events.lock().unwrap();
        events.push(TimingEvent {
            event: event.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
            detail,
        });
    }

    /// Flushes all recorded events to disk. Called at call teardown; safe to
    /// call more than once (idempotent overwrite).
    pub fn flush(&self) {
        let events = self.events.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "failed to create timing directory");
                return;
            }
        }
        match serde_json::to_string_pretty(&*events) {
            Ok(content) => {
                if let Err(e) = fs::write(&self.path, content) {
                    tracing::warn!(error = %e, path = ?self.path, "failed to write timing events");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize timing events"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_flush_writes_json() {
        let tmp = TempDir::new().unwrap();
        let sink = TimingSink::new(tmp.path(), "call-1");
        sink.record("call_started");
        sink.record("answered");
        sink.flush();

        let content = fs::read_to_string(tmp.path().join("call-1.json")).unwrap();
        assert!(content.contains("call_started"));
        assert!(content.contains("answered"));
    }

    #[test]
    fn test_record_with_detail_embeds_json_value() {
        let tmp = TempDir::new().unwrap();
        let sink = TimingSink::new(tmp.path(), "call-2");
        sink.record_with_detail("chunk_committed", Some(serde_json::json!({ "chunk_num": 3 })));
        sink.flush();
        let content = fs::read_to_string(tmp.path().join("call-2.json")).unwrap();
        assert!(content.contains("chunk_num"));
    }
}
