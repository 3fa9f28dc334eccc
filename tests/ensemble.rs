//! End-to-end ensemble runs against scripted backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{names, test_config, Behavior, ScriptedClient};
use ensemble::ensemble::Stage;
use ensemble::resilience::{CircuitState, FailureKind, ERROR_MARKER};
use ensemble::{EnsembleError, Orchestrator, Strategy};

fn orchestrator(models: &[&str], client: ScriptedClient) -> (Orchestrator, Arc<ScriptedClient>) {
    let client = Arc::new(client);
    let orchestrator = Orchestrator::new(test_config(models), client.clone());
    (orchestrator, client)
}

#[tokio::test(start_paused = true)]
async fn test_answers_keep_input_order_under_variable_latency() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("from a").after(Duration::from_secs(3)))
        .backend("b", Behavior::text("from b").after(Duration::from_secs(1)))
        .backend("c", Behavior::text("from c").after(Duration::from_secs(2)))
        .refinement(Behavior::text("refined"));
    let (orchestrator, client) = orchestrator(&["a", "b", "c"], client);

    let start = Instant::now();
    let answer = orchestrator.run("What is Rust?").await.unwrap();

    assert_eq!(answer.backends(), vec!["a", "b", "c"]);
    let texts: Vec<_> = answer.responses.iter().map(|r| r.text().unwrap()).collect();
    assert_eq!(texts, vec!["from a", "from b", "from c"]);

    // All three were in flight together.
    assert!(start.elapsed() < Duration::from_secs(4));
    let fanout_starts: Vec<_> = client.calls().iter().filter(|c| !c.refinement).map(|c| c.at).collect();
    assert_eq!(fanout_starts.len(), 3);
    assert!(fanout_starts.iter().all(|&at| at == fanout_starts[0]));

    assert_eq!(answer.text, "refined");
    assert_eq!(answer.strategy, Strategy::Synthesized);
    assert!(!answer.degraded);
}

#[tokio::test(start_paused = true)]
async fn test_all_backends_failing_skips_refinement() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::error("service unavailable"))
        .backend("b", Behavior::error("service unavailable"))
        .backend("c", Behavior::error("service unavailable"))
        .refinement(Behavior::text("should not be used"));
    let (orchestrator, client) = orchestrator(&["a", "b", "c"], client);

    let err = orchestrator.run("What is Rust?").await.unwrap_err();
    assert!(matches!(err, EnsembleError::AllBackendsFailed { attempted: 3 }));
    assert_eq!(err.stage(), Stage::Fanout);
    assert!(client.refinement_calls().is_empty());

    let stats = orchestrator.monitor().ensemble_stats(None).unwrap();
    assert_eq!(stats.total_operations, 1);
    assert_eq!(stats.refined_operations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_single_survivor_returned_when_refinement_fails() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("only answer"))
        .backend("b", Behavior::error("service unavailable"))
        .backend("c", Behavior::error("service unavailable"))
        .refinement(Behavior::error("service unavailable"));
    let client = Arc::new(client);
    let mut config = test_config(&["a", "b", "c"]);
    config.refinement.refine_single_response = true;
    let orchestrator = Orchestrator::new(config, client.clone());

    let answer = orchestrator.run("What is Rust?").await.unwrap();
    assert_eq!(answer.text, "only answer");
    assert_eq!(answer.strategy, Strategy::SingleResponse);
    assert!(answer.degraded);
    assert_eq!(client.refinement_calls().len(), 1);

    let stats = orchestrator.monitor().ensemble_stats(None).unwrap();
    assert_eq!(stats.completed_operations, 1);
    assert_eq!(stats.successful_operations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_single_survivor_skips_refinement_by_default() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::error("service unavailable"))
        .backend("b", Behavior::text("only answer"))
        .refinement(Behavior::text("refined"));
    let (orchestrator, client) = orchestrator(&["a", "b"], client);

    let answer = orchestrator.run("What is Rust?").await.unwrap();
    assert_eq!(answer.text, "only answer");
    assert_eq!(answer.strategy, Strategy::SingleResponse);
    assert!(client.refinement_calls().is_empty());

    let stats = orchestrator.monitor().ensemble_stats(None).unwrap();
    assert_eq!(stats.successful_operations, 1);
    assert_eq!(stats.operation_success_rate, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_prompt_lists_only_valid_answers() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("answer one"))
        .backend("b", Behavior::error("service unavailable"))
        .backend("c", Behavior::text("answer three"))
        .refinement(Behavior::text("combined"));
    let (orchestrator, client) = orchestrator(&["a", "b", "c"], client);

    let answer = orchestrator.run("Explain ownership").await.unwrap();
    assert_eq!(answer.text, "combined");
    assert_eq!(answer.strategy, Strategy::Synthesized);
    assert!(!answer.degraded);

    let refinement = client.refinement_calls();
    assert_eq!(refinement.len(), 1);
    assert_eq!(refinement[0].backend, "a");
    let user = &refinement[0].prompt.user;
    assert!(user.contains("Original prompt:\nExplain ownership"));
    assert!(user.contains("Model 1 Response (a):\nanswer one"));
    assert!(user.contains("Model 2 Response (c):\nanswer three"));
    assert!(!user.contains("(b)"));
    assert!(!user.contains(ERROR_MARKER));
}

#[tokio::test(start_paused = true)]
async fn test_refinement_failure_concatenates_answers() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("answer one"))
        .backend("b", Behavior::text("answer two"))
        .refinement(Behavior::error("service unavailable"));
    let (orchestrator, _client) = orchestrator(&["a", "b"], client);

    let answer = orchestrator.run("Explain ownership").await.unwrap();
    assert_eq!(answer.strategy, Strategy::Concatenated);
    assert_eq!(
        answer.text,
        "Response from a:\nanswer one\n\nResponse from b:\nanswer two"
    );
    assert!(answer.degraded);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_backend_is_marked_and_excluded() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("alpha"))
        .backend("b", Behavior::hang())
        .backend("c", Behavior::text("gamma"))
        .refinement(Behavior::text("refined"));
    let (orchestrator, client) = orchestrator(&["a", "b", "c"], client);

    let answer = orchestrator.run("What is Rust?").await.unwrap();

    let failure = answer.responses[1].response.as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(answer.responses[1].display_text().starts_with(ERROR_MARKER));
    assert_eq!(client.calls_to("b"), 3);

    let user = &client.refinement_calls()[0].prompt.user;
    assert!(user.contains("alpha"));
    assert!(user.contains("gamma"));
    assert!(!user.contains("(b)"));
    assert_eq!(answer.text, "refined");

    let stats = orchestrator.monitor().backend_stats("b").unwrap();
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.error_counts.get("timeout"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_backend_occupies_its_slot() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("alpha"))
        .backend("b", Behavior::panic())
        .backend("c", Behavior::text("gamma"))
        .refinement(Behavior::text("refined"));
    let (orchestrator, _client) = orchestrator(&["a", "b", "c"], client);

    let answer = orchestrator.run("What is Rust?").await.unwrap();
    assert_eq!(answer.responses.len(), 3);
    let failure = answer.responses[1].response.as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Panicked);
    assert_eq!(answer.text, "refined");
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_stops_the_run() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::hang())
        .backend("b", Behavior::hang());
    let (orchestrator, _client) = orchestrator(&["a", "b"], client);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = orchestrator
        .run_ensemble_with_cancel("What is Rust?", &names(&["a", "b"]), "a", cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));

    // Cancellation is not a backend failure.
    let circuits = orchestrator.circuit_snapshot();
    assert_eq!(circuits["a"].state, CircuitState::Closed);
    assert_eq!(circuits["a"].failure_count, 0);
    assert_eq!(orchestrator.monitor().ensemble_stats(None).unwrap().total_operations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ensemble_deadline() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("alpha"))
        .backend("b", Behavior::hang());
    let client = Arc::new(client);
    let mut config = test_config(&["a", "b"]);
    config.timeouts.ensemble_secs = Some(5);
    let orchestrator = Orchestrator::new(config, client);

    let start = Instant::now();
    let err = orchestrator.run("What is Rust?").await.unwrap_err();
    assert!(matches!(err, EnsembleError::DeadlineExceeded(limit) if limit == Duration::from_secs(5)));
    assert_eq!(start.elapsed().as_secs(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skips_failing_backend() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("alpha"))
        .backend("b", Behavior::error("service unavailable"))
        .refinement(Behavior::text("refined"));
    let client = Arc::new(client);
    let mut config = test_config(&["a", "b"]);
    config.circuit_breaker.failure_threshold = 2;
    let orchestrator = Orchestrator::new(config, client.clone());

    for _ in 0..3 {
        let answer = orchestrator.run("What is Rust?").await.unwrap();
        assert_eq!(answer.text, "alpha");
    }

    assert_eq!(client.calls_to("b"), 2);
    assert_eq!(orchestrator.circuit_snapshot()["b"].state, CircuitState::Open);
    let stats = orchestrator.monitor().backend_stats("b").unwrap();
    assert_eq!(stats.error_counts.get("circuit_open"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_input_fails_before_any_call() {
    let client = ScriptedClient::new().backend("a", Behavior::text("alpha"));
    let (orchestrator, client) = orchestrator(&["a"], client);

    let err = orchestrator.run("   ").await.unwrap_err();
    assert_eq!(err.stage(), Stage::Input);

    let err = orchestrator
        .run_ensemble("What is Rust?", &[], "a")
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::NoBackends));

    let err = orchestrator
        .run_ensemble("What is Rust?", &names(&["bad model!"]), "a")
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::Configuration(_)));

    assert!(client.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_updated_config_applies_to_next_run() {
    let client = ScriptedClient::new()
        .backend("a", Behavior::text("alpha"))
        .backend("b", Behavior::text("beta"))
        .refinement(Behavior::text("refined"));
    let (orchestrator, _client) = orchestrator(&["a"], client);

    let answer = orchestrator.run("What is Rust?").await.unwrap();
    assert_eq!(answer.backends(), vec!["a"]);

    orchestrator.update_config(test_config(&["a", "b"]));
    let answer = orchestrator.run("What is Rust?").await.unwrap();
    assert_eq!(answer.backends(), vec!["a", "b"]);
    assert_eq!(answer.strategy, Strategy::Synthesized);
}
