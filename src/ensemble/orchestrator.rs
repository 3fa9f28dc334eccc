//! Ensemble orchestrator.
//!
//! Owns every piece of shared resilience state (rate limiter, circuit
//! breakers, monitor) so independent orchestrators never interfere. Each run
//! snapshots the live configuration once and uses it throughout.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::client::{ChatClient, ChatPrompt};
use crate::config::validation::validate_model_name;
use crate::config::EnsembleConfig;
use crate::ensemble::error::EnsembleError;
use crate::ensemble::fanout::FanoutCoordinator;
use crate::ensemble::refine::Refiner;
use crate::ensemble::types::{EnsembleAnswer, Strategy};
use crate::observability::tracing::{ensemble_span, new_correlation_id};
use crate::observability::{PerformanceMonitor, RunCompletion};
use crate::resilience::{
    CircuitBreakerRegistry, CircuitSnapshot, RateLimitStats, RateLimiter, RequestDriver,
    RetryPolicy,
};
use crate::security::sanitize_prompt;

pub struct Orchestrator {
    config: ArcSwap<EnsembleConfig>,
    client: Arc<dyn ChatClient>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: Arc<PerformanceMonitor>,
}

impl Orchestrator {
    pub fn new(config: EnsembleConfig, client: Arc<dyn ChatClient>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(
            config.observability.max_history,
            config.observability.latency_window,
        ));
        Self {
            config: ArcSwap::from_pointee(config),
            client,
            limiter,
            breakers,
            monitor,
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<EnsembleConfig> {
        self.config.load_full()
    }

    /// Swap in a new configuration for subsequent runs.
    ///
    /// Rate-limit and circuit-breaker tuning keep their startup values.
    pub fn update_config(&self, config: EnsembleConfig) {
        tracing::info!(models = config.models.len(), "Ensemble configuration updated");
        self.config.store(Arc::new(config));
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn rate_limit_stats(&self) -> BTreeMap<String, RateLimitStats> {
        self.limiter.stats()
    }

    pub fn circuit_snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers.snapshot()
    }

    /// Run with the configured models and refinement model.
    pub async fn run(&self, prompt: &str) -> Result<EnsembleAnswer, EnsembleError> {
        let config = self.config();
        let refinement = config.refinement_model().unwrap_or_default().to_string();
        self.run_ensemble(prompt, &config.models, &refinement).await
    }

    /// Query `backends` with `prompt` and refine their answers with `refinement_backend`.
    pub async fn run_ensemble(
        &self,
        prompt: &str,
        backends: &[String],
        refinement_backend: &str,
    ) -> Result<EnsembleAnswer, EnsembleError> {
        self.run_ensemble_with_cancel(prompt, backends, refinement_backend, CancellationToken::new())
            .await
    }

    /// Like [`run_ensemble`](Self::run_ensemble), stopping early when `cancel` fires
    /// or the configured ensemble deadline passes.
    pub async fn run_ensemble_with_cancel(
        &self,
        prompt: &str,
        backends: &[String],
        refinement_backend: &str,
        cancel: CancellationToken,
    ) -> Result<EnsembleAnswer, EnsembleError> {
        let config = self.config();
        let correlation_id = new_correlation_id();
        let span = ensemble_span(&correlation_id, backends.len());

        let run_token = cancel.child_token();
        let work = self
            .execute(&config, correlation_id, prompt, backends, refinement_backend, &run_token)
            .instrument(span);
        tokio::pin!(work);

        let Some(limit) = config.timeouts.ensemble() else {
            return work.await;
        };

        tokio::select! {
            result = &mut work => result,
            _ = tokio::time::sleep(limit) => {
                tracing::warn!(deadline_ms = limit.as_millis() as u64, "Ensemble deadline exceeded, cancelling");
                run_token.cancel();
                match work.await {
                    Err(EnsembleError::Cancelled) if !cancel.is_cancelled() => {
                        Err(EnsembleError::DeadlineExceeded(limit))
                    }
                    other => other,
                }
            }
        }
    }

    async fn execute(
        &self,
        config: &EnsembleConfig,
        correlation_id: String,
        prompt: &str,
        backends: &[String],
        refinement_backend: &str,
        cancel: &CancellationToken,
    ) -> Result<EnsembleAnswer, EnsembleError> {
        if backends.is_empty() {
            return Err(EnsembleError::NoBackends);
        }
        for backend in backends.iter().map(String::as_str).chain([refinement_backend]) {
            validate_model_name(backend)
                .map_err(|e| EnsembleError::Configuration(e.to_string()))?;
        }

        let clean = sanitize_prompt(prompt, config.prompt.max_length)?;
        tracing::info!(
            backends = backends.len(),
            refinement_backend,
            prompt_len = clean.len(),
            "Starting ensemble run"
        );

        let driver = RequestDriver::new(
            self.limiter.clone(),
            self.breakers.clone(),
            self.monitor.clone(),
            RetryPolicy::from_config(&config.retries, &config.timeouts),
        );
        let mut tracker = self.monitor.start_ensemble(clean.len());

        let fanout = FanoutCoordinator::new(driver.clone(), config.refinement.min_success_ratio);
        let fanned = match fanout
            .fetch_all(
                &*self.client,
                &ChatPrompt::user(clean.as_str()),
                backends,
                config.timeouts.request(),
                cancel,
                &mut tracker,
            )
            .await
        {
            Ok(fanned) => fanned,
            Err(e) => {
                self.monitor.finish_ensemble(tracker, RunCompletion::Failed);
                return Err(e);
            }
        };

        let refiner = Refiner::new(driver, config.refinement.refine_single_response);
        let refined = match refiner
            .refine(
                &*self.client,
                &clean,
                &fanned.answers,
                refinement_backend,
                config.timeouts.refinement(),
                cancel,
            )
            .await
        {
            Ok(refined) => refined,
            Err(e) => {
                self.monitor.finish_ensemble(tracker, RunCompletion::Failed);
                return Err(e);
            }
        };

        self.monitor.finish_ensemble(
            tracker,
            RunCompletion::Answered {
                refined: refined.strategy == Strategy::Synthesized,
                fallback: refined.fallback,
                output_len: refined.text.len(),
            },
        );

        Ok(EnsembleAnswer {
            correlation_id,
            prompt: clean,
            text: refined.text,
            strategy: refined.strategy,
            refinement_backend: refinement_backend.to_string(),
            degraded: fanned.degraded || refined.fallback,
            responses: fanned.answers,
        })
    }
}
