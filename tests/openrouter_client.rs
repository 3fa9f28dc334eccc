//! OpenRouter client against a local mock chat API.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{completion_body, start_programmable_backend};
use ensemble::config::{ApiConfig, CircuitBreakerConfig, RateLimitConfig};
use ensemble::observability::PerformanceMonitor;
use ensemble::resilience::{
    CircuitBreakerRegistry, FailureKind, RateLimiter, RequestDriver, RetryPolicy,
};
use ensemble::{ChatClient, ChatPrompt, ClientError, OpenRouterClient};

fn client_for(addr: std::net::SocketAddr) -> OpenRouterClient {
    OpenRouterClient::new(&ApiConfig {
        base_url: format!("http://{addr}/api/v1"),
        api_key: Some("sk-or-test-0123456789".into()),
        ..Default::default()
    })
}

fn driver() -> RequestDriver {
    RequestDriver::new(
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        Arc::new(PerformanceMonitor::default()),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_ratio: 0.0,
            timeout_buffer: Duration::from_secs(1),
        },
    )
}

#[tokio::test]
async fn test_completion_sends_model_and_messages() {
    let seen = Arc::new(std::sync::Mutex::new(None));
    let captured = seen.clone();
    let addr = start_programmable_backend(move |body| {
        *captured.lock().unwrap() = Some(body);
        async { (200, completion_body("Rust is a systems language.")) }
    })
    .await;

    let client = client_for(addr);
    let prompt = ChatPrompt::user("What is Rust?").with_system("be brief");
    let text = client.complete("openai/gpt-4o", &prompt).await.unwrap();
    assert_eq!(text, "Rust is a systems language.");

    let body: serde_json::Value =
        serde_json::from_str(seen.lock().unwrap().as_deref().unwrap()).unwrap();
    assert_eq!(body["model"], "openai/gpt-4o");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "What is Rust?");
}

#[tokio::test]
async fn test_status_codes_map_to_client_errors() {
    let addr = start_programmable_backend(|_| async { (429, r#"{"error":"slow down"}"#.to_string()) }).await;
    let err = client_for(addr)
        .complete("a/b", &ChatPrompt::user("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RateLimited(_)));

    let addr = start_programmable_backend(|_| async { (401, r#"{"error":"bad key"}"#.to_string()) }).await;
    let err = client_for(addr)
        .complete("a/b", &ChatPrompt::user("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 401, .. }));
}

#[tokio::test]
async fn test_error_in_success_body() {
    let addr = start_programmable_backend(|_| async {
        (200, r#"{"error":{"message":"upstream overloaded","code":429}}"#.to_string())
    })
    .await;
    let err = client_for(addr)
        .complete("a/b", &ChatPrompt::user("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RateLimited(ref m) if m == "upstream overloaded"));

    let addr = start_programmable_backend(|_| async { (200, r#"{"choices":[]}"#.to_string()) }).await;
    let err = client_for(addr)
        .complete("a/b", &ChatPrompt::user("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Decode(_)));
}

#[tokio::test]
async fn test_driver_retries_rate_limited_backend() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let addr = start_programmable_backend(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                (429, r#"{"error":"slow down"}"#.to_string())
            } else {
                (200, completion_body("eventually"))
            }
        }
    })
    .await;

    let client = client_for(addr);
    let driven = driver()
        .send_tracked(
            &client,
            &ChatPrompt::user("hi"),
            "a/b",
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(driven.response.unwrap(), "eventually");
    assert_eq!(driven.outcome.attempts, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_driver_does_not_retry_auth_failure() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let addr = start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { (401, r#"{"error":"invalid key sk-or-leaked-0123456789"}"#.to_string()) }
    })
    .await;

    let client = client_for(addr);
    let failure = driver()
        .send(
            &client,
            &ChatPrompt::user("hi"),
            "a/b",
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Backend);
    assert!(!failure.message.contains("sk-or-leaked"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
