//! In-process HTTP server standing in for the executor in tests.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// What the fake executor does with one request.
pub(crate) enum Reply {
    Respond(String),
    /// Send the head and body, then keep the connection open.
    Hold(String),
    /// Read the request and never answer.
    Silent,
}

pub(crate) type Requests = Arc<Mutex<Vec<String>>>;

/// Minimal HTTP/1.1 server standing in for the executor. Records `METHOD PATH` and body.
pub(crate) async fn spawn_executor<F>(respond: F) -> (String, Requests)
where
    F: Fn(&str) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/api", listener.local_addr().unwrap());
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let seen = seen.clone();
            let respond = respond.clone();
            tokio::spawn(async move {
                let request = read_request(&mut sock).await;
                seen.lock().push(request.clone());
                match respond(&request) {
                    Reply::Respond(raw) => {
                        let _ = sock.write_all(raw.as_bytes()).await;
                        let _ = sock.shutdown().await;
                    }
                    Reply::Hold(raw) => {
                        let _ = sock.write_all(raw.as_bytes()).await;
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Reply::Silent => tokio::time::sleep(Duration::from_secs(60)).await,
                }
            });
        }
    });
    (base, requests)
}

async fn read_request(sock: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = sock.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length")
                .then(|| v.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = sock.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    let body = String::from_utf8_lossy(&buf[head_end..]).to_string();
    format!("{method} {path}\n{body}")
}

pub(crate) fn json_response(status: &str, body: &str) -> Reply {
    Reply::Respond(format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ))
}

pub(crate) fn sse_head() -> String {
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n".into()
}

pub(crate) fn wire_run(run_id: &str, status: &str) -> serde_json::Value {
    json!({
        "run_id": run_id,
        "status": status,
        "function_name": "add",
        "code": "def add(a, b):\n    return a + b\n",
        "options": {
            "max_iterations": 3, "test_style": "unit", "coverage_threshold": 80,
            "edge_case_categories": {"none": false, "empty": true, "large": true,
                "unicode": false, "floats": false, "timezones": false},
            "create_pr": false, "repo_url": null, "branch": "main"
        },
        "inferred_spec": "adds",
        "edge_cases": [],
        "generated_tests": "def test_add(): pass\n",
        "test_run_output": {"stdout": "1 passed", "stderr": "", "exit_code": 0},
        "coverage_summary": {"lines": 100, "branches": 100, "functions": 100, "files": []},
        "patch_diff": "",
        "artifacts_path": format!("experiments/{run_id}"),
        "iterations_used": 1,
        "steps": [],
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:05Z"
    })
}
