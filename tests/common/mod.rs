//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use ensemble::config::EnsembleConfig;
use ensemble::{ChatClient, ChatPrompt, ClientError};

/// What a scripted backend does when called.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(String),
    /// Never completes.
    Hang,
    Panic,
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub delay: Duration,
    pub reply: Reply,
}

impl Behavior {
    pub fn text(text: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Text(text.to_string()),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Error(message.to_string()),
        }
    }

    pub fn hang() -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Hang,
        }
    }

    pub fn panic() -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Panic,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct Call {
    pub backend: String,
    pub prompt: ChatPrompt,
    pub refinement: bool,
    pub at: Instant,
}

/// In-process chat client with per-backend scripted behavior.
///
/// Calls carrying a system prompt are refinement calls and use the
/// refinement behavior instead of the backend's own.
#[derive(Default)]
pub struct ScriptedClient {
    backends: HashMap<String, Behavior>,
    refinement: Option<Behavior>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, name: &str, behavior: Behavior) -> Self {
        self.backends.insert(name.to_string(), behavior);
        self
    }

    pub fn refinement(mut self, behavior: Behavior) -> Self {
        self.refinement = Some(behavior);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refinement_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.refinement).collect()
    }

    pub fn calls_to(&self, backend: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.backend == backend && !c.refinement)
            .count()
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn complete(&self, backend: &str, prompt: &ChatPrompt) -> Result<String, ClientError> {
        let refinement = prompt.system.is_some();
        self.calls.lock().unwrap().push(Call {
            backend: backend.to_string(),
            prompt: prompt.clone(),
            refinement,
            at: Instant::now(),
        });

        let behavior = if refinement {
            self.refinement.clone()
        } else {
            self.backends.get(backend).cloned()
        }
        .unwrap_or_else(|| Behavior::error("unknown backend"));

        tokio::time::sleep(behavior.delay).await;
        match behavior.reply {
            Reply::Text(text) => Ok(text),
            Reply::Error(message) => Err(ClientError::Other(message)),
            Reply::Hang => std::future::pending().await,
            Reply::Panic => panic!("scripted panic in {backend}"),
        }
    }
}

/// Configuration tuned for tests: generous limits, fast retries.
pub fn test_config(models: &[&str]) -> EnsembleConfig {
    let mut config = EnsembleConfig {
        models: models.iter().map(|m| m.to_string()).collect(),
        ..Default::default()
    };
    config.api.api_key = Some("sk-test-key".into());
    config.rate_limit.requests_per_minute = 1000;
    config.rate_limit.requests_per_second = 1000;
    config.rate_limit.burst_limit = 1000;
    config.retries.base_delay_ms = 100;
    config.retries.max_delay_ms = 1000;
    config.timeouts.request_secs = 10;
    config
}

pub fn names(models: &[&str]) -> Vec<String> {
    models.iter().map(|m| m.to_string()).collect()
}

/// Read one HTTP/1.1 request, returning its body.
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(String::from_utf8_lossy(&buf[header_end..]).into_owned())
}

/// Start a programmable mock chat backend on an ephemeral port.
///
/// `f` receives the request body and returns a status code and JSON body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let Some(body) = read_request(&mut socket).await else {
                            return;
                        };
                        let (status, body) = f(body).await;
                        let status_text = match status {
                            200 => "200 OK",
                            400 => "400 Bad Request",
                            401 => "401 Unauthorized",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            504 => "504 Gateway Timeout",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// A chat-completions body whose first choice says `content`.
pub fn completion_body(content: &str) -> String {
    serde_json::json!({
        "id": "gen-1",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    })
    .to_string()
}
