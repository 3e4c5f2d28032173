//! HTTP API for the text2sql agent.
//!
//! Plain tokio TCP handling, no web framework. `/api/chat/stream` streams
//! progress events as JSON lines over chunked transfer encoding, terminated
//! by a `[DONE]` sentinel; client disconnect cancels the in-flight turn.

use std::collections::HashMap;
use std::sync::Arc;
use text2sql_agent::app::{bootstrap, AppContext};
use text2sql_agent::config::AppConfig;
use text2sql_agent::events::EventSink;
use text2sql_agent::session::SessionStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    let ctx = Arc::new(bootstrap(&config).await?);

    let addr = std::env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = TcpListener::bind(&addr).await?;
    println!("✅ text2sql-agent API listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                warn!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    ctx: Arc<AppContext>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/api/health") => {
            let body = r#"{"status":"ok","service":"text2sql-agent"}"#;
            stream
                .write_all(create_response(200, "OK", body).as_bytes())
                .await?;
        }
        ("POST", "/api/reset") => {
            let session_id = request.json_field("session_id").unwrap_or_default();
            let removed = ctx.sessions.reset(&session_id);
            let body = serde_json::json!({
                "success": true,
                "removed": removed,
                "session_id": SessionStore::generate_id(),
            });
            stream
                .write_all(create_response(200, "OK", &body.to_string()).as_bytes())
                .await?;
        }
        ("POST", "/api/chat") => {
            let Some(message) = request.json_field("message") else {
                stream
                    .write_all(
                        create_response(400, "Bad Request", r#"{"error":"message is required"}"#)
                            .as_bytes(),
                    )
                    .await?;
                return Ok(());
            };
            let session_id = request
                .json_field("session_id")
                .unwrap_or_else(SessionStore::generate_id);
            let body = run_chat(&ctx, &session_id, &message).await;
            stream
                .write_all(create_response(200, "OK", &body).as_bytes())
                .await?;
        }
        ("POST", "/api/chat/stream") => {
            let Some(message) = request.json_field("message") else {
                stream
                    .write_all(
                        create_response(400, "Bad Request", r#"{"error":"message is required"}"#)
                            .as_bytes(),
                    )
                    .await?;
                return Ok(());
            };
            let session_id = request
                .json_field("session_id")
                .unwrap_or_else(SessionStore::generate_id);
            stream_chat(&mut stream, &ctx, &session_id, &message).await?;
        }
        ("OPTIONS", _) => {
            stream
                .write_all(create_response(200, "OK", "").as_bytes())
                .await?;
        }
        (method, path) => {
            let body = format!(r#"{{"error":"endpoint not found: {} {}"}}"#, method, path);
            stream
                .write_all(create_response(404, "Not Found", &body).as_bytes())
                .await?;
        }
    }
    Ok(())
}

/// Non-streaming turn: events are discarded, only the outcome is returned.
async fn run_chat(ctx: &AppContext, session_id: &str, message: &str) -> String {
    let entry = ctx.sessions.get_or_create(session_id);
    let mut state = entry.lock().await;
    let mut sink = EventSink::disabled();
    let cancel = CancellationToken::new();

    match ctx.graph.run_turn(&mut state, message, &mut sink, &cancel).await {
        Ok(outcome) => serde_json::json!({
            "session_id": session_id,
            "answer": outcome.answer,
            "need_clarification": outcome.need_clarification,
            "sql": outcome.sql,
            "rows": outcome.rows,
        })
        .to_string(),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "chat turn failed");
            serde_json::json!({
                "session_id": session_id,
                "error": "查询处理失败，请稍后重试。",
            })
            .to_string()
        }
    }
}

/// Streaming turn: the event channel is forwarded to the socket as JSON
/// lines while the graph runs; a failed write cancels the turn.
async fn stream_chat(
    stream: &mut TcpStream,
    ctx: &AppContext,
    session_id: &str,
    message: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let head = "HTTP/1.1 200 OK\r\n\
        Content-Type: application/x-ndjson; charset=utf-8\r\n\
        Transfer-Encoding: chunked\r\n\
        Cache-Control: no-cache\r\n\
        Access-Control-Allow-Origin: *\r\n\
        Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
        Access-Control-Allow-Headers: Content-Type\r\n\
        \r\n";
    stream.write_all(head.as_bytes()).await?;

    let entry = ctx.sessions.get_or_create(session_id);
    let mut state = entry.lock().await;
    let (sink, mut rx) = EventSink::channel();
    let cancel = CancellationToken::new();

    let graph = ctx.graph.clone();
    let run = async {
        let mut sink = sink;
        let result = graph.run_turn(&mut state, message, &mut sink, &cancel).await;
        // Dropping the sink closes the channel and ends the forward loop.
        drop(sink);
        result
    };

    let forward = async {
        while let Some(event) = rx.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(_) => continue,
            };
            if write_chunk(stream, &line).await.is_err() {
                info!(session_id = %session_id, "client disconnected, cancelling turn");
                cancel.cancel();
                break;
            }
        }
        // Drain whatever the cancelled turn still emitted.
        while rx.try_recv().is_ok() {}
    };

    let (result, ()) = tokio::join!(run, forward);
    if let Err(e) = result {
        warn!(session_id = %session_id, error = %e, "stream turn failed");
    }

    let _ = write_chunk(stream, "[DONE]").await;
    let _ = stream.write_all(b"0\r\n\r\n").await;
    Ok(())
}

async fn write_chunk(stream: &mut TcpStream, data: &str) -> std::io::Result<()> {
    let payload = format!("{}\n", data);
    let chunk = format!("{:X}\r\n{}\r\n", payload.len(), payload);
    stream.write_all(chunk.as_bytes()).await?;
    stream.flush().await
}

struct Request {
    method: String,
    path: String,
    body: String,
}

impl Request {
    fn json_field(&self, field: &str) -> Option<String> {
        let json: serde_json::Value = serde_json::from_str(self.body.trim()).ok()?;
        json.get(field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Reads one HTTP request: headers, then `Content-Length` bytes of body.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
    };

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = header_text.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let mut path = parts.next().unwrap_or_default().to_string();
    if let Some(query_start) = path.find('?') {
        path.truncate(query_start);
    }
    path = path.trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Ok(None);
    }

    let body_start = header_end + 4;
    while buffer.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buffer[body_start..buffer.len().min(body_start + content_length)])
        .to_string();

    Ok(Some(Request { method, path, body }))
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
