// Call-event webhook (A6): fire-and-forget notifications to the VPS backend
// for call lifecycle events. Failures are logged, never propagated — a
// webhook outage must not affect an in-progress call.

use serde::Serialize;
use serde_json::Value;

#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::blocking::Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    event: &'a str,
    #[serde(rename = "callId")]
    call_id: &'a str,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    timestamp: String,
    data: Value,
}

impl WebhookClient {
    pub fn new(http: reqwest::blocking::Client, url: String) -> Self {
        Self { http, url }
    }

    pub fn send(&self, event: &str, call_id: &str, session_id: &str, data: Value) {
        if self.url.is_empty() {
            return;
        }
        let body = WebhookBody {
            event,
            call_id,
            session_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        };
        if let Err(e) = self
            .http
            .post(&self.url)
            .timeout(std::time::Duration::from_secs(5))
            .json(&body)
            .send()
        {
            tracing::warn!(%event, call_id, error = %e, "webhook delivery failed");
        }
    }

    pub fn call_started(&self, call_id: &str, session_id: &str, caller_id: &str) {
        self.send("call_started", call_id, session_id, serde_json::json!({ "callerId": caller_id }));
    }

    pub fn call_ended(&self, call_id: &str, session_id: &str, reason: &str) {
        self.send("call_ended", call_id, session_id, serde_json::json!({ "reason": reason }));
    }

    pub fn noise_timeout(&self, call_id: &str, session_id: &str) {
        self.send("noise_timeout", call_id, session_id, serde_json::json!({}));
    }

    pub fn answer_failed(&self, call_id: &str, session_id: &str, reason: &str) {
        self.send("answer_failed", call_id, session_id, serde_json::json!({ "reason": reason }));
    }
}
