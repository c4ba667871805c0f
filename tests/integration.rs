// Integration tests driving the Dialog Dispatcher and TTS Client against
// fake HTTP servers (a raw `TcpListener` standing in for the dialog/TTS
// backends), the way the teacher's `tests/integration.rs` drives real
// threads and channels rather than mocking the library boundary.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, sync_channel};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use callgate::call::session::CallSession;
use callgate::config::AudioFormat;
use callgate::dialog::dispatcher::{run_dialog_dispatcher, DialogChunk, DispatcherContext};
use callgate::tts::client::{run_tts_client, TtsClientConfig, TtsPriority, TtsRequest};

/// Reads one HTTP request off `stream` (headers + body, assuming
/// Content-Length is present) and writes back `body` as a 200 JSON
/// response. Good enough for a single-shot fake backend.
fn serve_one(stream: &mut TcpStream, body: &str) {
    let mut buf = [0u8; 8192];
    let mut received = String::new();
    loop {
        let n = stream.read(&mut buf).unwrap_or(0);
        if n == 0 {
            break;
        }
        received.push_str(&String::from_utf8_lossy(&buf[..n]));
        if received.contains("\r\n\r\n") {
            let header_end = received.find("\r\n\r\n").unwrap();
            let headers = &received[..header_end];
            let content_length: usize = headers
                .lines()
                .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let body_so_far = received.len() - header_end - 4;
            if body_so_far >= content_length {
                break;
            }
        }
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Spawns a fake dialog-service endpoint that always replies with a fixed
/// HTTP 500-equivalent (status 200 transport-wise, `status: "error"` at the
/// application level per the dialog contract, exactly as the dialog service
/// is documented to report a failure). Returns the bound URL and a shared
/// request counter.
fn spawn_fake_dialog_error_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            count_clone.fetch_add(1, Ordering::SeqCst);
            serve_one(
                &mut stream,
                r#"{"status":"error","error":"model timeout","fallback_response":"Sorry, I'm having trouble understanding right now. Could you repeat that?"}"#,
            );
        }
    });
    (format!("http://{addr}"), count)
}

/// Scenario: a dialog-service chunk POST comes back as an application-level
/// error. Expect the dispatcher to request TTS for the fallback phrase and
/// keep the call going (it must not tear down the dispatcher thread or
/// poison the session for subsequent chunks).
#[test]
fn test_dialog_service_error_triggers_fallback_tts() {
    let (dialog_url, request_count) = spawn_fake_dialog_error_server();

    let session = Arc::new(Mutex::new(CallSession::new(
        "call-1".to_string(),
        "call-1".to_string(),
        "+15550001111".to_string(),
        AudioFormat::Eight,
    )));
    let (tts_tx, tts_rx) = sync_channel(8);
    let (dialog_tx, dialog_rx) = sync_channel(4);

    let ctx = DispatcherContext {
        http: reqwest::blocking::Client::new(),
        dialog_url,
        call_id: "call-1".to_string(),
        session_id: "call-1".to_string(),
        caller_id: "+15550001111".to_string(),
        language: "en".to_string(),
        audio_format: "8k".to_string(),
        session,
        tts_tx,
        archive_tx: None,
    };

    let handle = std::thread::spawn(move || run_dialog_dispatcher(dialog_rx, ctx));

    let chunk = DialogChunk {
        chunk_num: 3,
        pcm: Some(vec![100i16; 160]),
        sample_rate: 8000,
        duration_ms: 500,
        end_sentence: false,
        noise_timeout: false,
    };
    dialog_tx.send(chunk).unwrap();

    let tts_request = tts_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert!(tts_request.text.contains("trouble understanding"));
    assert_eq!(tts_request.priority, TtsPriority::Normal);

    // A subsequent chunk is still processed normally (the dispatcher loop
    // didn't exit after the error).
    let chunk2 = DialogChunk {
        chunk_num: 4,
        pcm: Some(vec![100i16; 160]),
        sample_rate: 8000,
        duration_ms: 500,
        end_sentence: false,
        noise_timeout: false,
    };
    dialog_tx.send(chunk2).unwrap();
    let tts_request2 = tts_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert!(tts_request2.text.contains("trouble understanding"));

    assert_eq!(request_count.load(Ordering::SeqCst), 2);

    drop(dialog_tx);
    handle.join().unwrap();
}

/// Spawns a fake TTS engine endpoint that accepts every POST with a 200 and
/// counts how many requests it sees.
fn spawn_fake_tts_accept_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            count_clone.fetch_add(1, Ordering::SeqCst);
            serve_one(&mut stream, "{}");
        }
    });
    (format!("http://{addr}"), count)
}

/// Cache round-trip property: synthesizing the same (text, format, voice)
/// twice must hit the TTS engine over HTTP exactly once.
#[test]
fn test_tts_cache_round_trip_avoids_second_http_request() {
    let staging = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    let (tts_url, request_count) = spawn_fake_tts_accept_server();

    let config = TtsClientConfig {
        tts_url,
        cache_root: cache_root.path().to_path_buf(),
        staging_dir: staging.path().to_path_buf(),
        voice: "default".to_string(),
        sample_rate: 8000,
    };

    let (req_tx, req_rx) = channel::<TtsRequest>();
    let (playback_tx, playback_rx) = sync_channel(8);

    let client = reqwest::blocking::Client::new();
    let handle = std::thread::spawn(move || run_tts_client(client, config, req_rx, playback_tx));

    let request = TtsRequest {
        call_id: "call-9".to_string(),
        session_id: "call-9".to_string(),
        text: "hello there".to_string(),
        priority: TtsPriority::Normal,
        language: "en".to_string(),
        audio_format: "8k".to_string(),
    };
    req_tx.send(request.clone()).unwrap();

    // Give the client a moment to POST, then drop a staged artifact for it
    // to pick up (the staging poller retries for up to 8s).
    std::thread::sleep(std::time::Duration::from_millis(150));
    std::fs::write(staging.path().join("tts_call-9_1.raw"), b"PCMBYTES").unwrap();

    let first = playback_rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
    assert_eq!(first.pcm, b"PCMBYTES".to_vec());
    assert_eq!(request_count.load(Ordering::SeqCst), 1);

    req_tx.send(request).unwrap();
    let second = playback_rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();
    assert_eq!(second.pcm, b"PCMBYTES".to_vec());
    // Second request is a cache hit: no additional HTTP traffic.
    assert_eq!(request_count.load(Ordering::SeqCst), 1);

    drop(req_tx);
    handle.join().unwrap();
}
