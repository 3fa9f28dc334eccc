//! Concurrent fan-out to every backend.
//!
//! # Design Decisions
//! - One driven call per backend, joined with `join_all`; no detached tasks,
//!   so dropping the run drops every call
//! - A panic in one call is caught and becomes that slot's failure
//! - Results keep the input order regardless of completion order
//! - A low success ratio is only logged and flagged

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::client::{ChatClient, ChatPrompt};
use crate::ensemble::error::EnsembleError;
use crate::ensemble::types::{BackendAnswer, FanoutResult};
use crate::observability::tracing::backend_span;
use crate::observability::EnsembleTracker;
use crate::resilience::{DrivenResponse, RequestDriver};

/// Issues one request per backend concurrently.
#[derive(Debug, Clone)]
pub struct FanoutCoordinator {
    driver: RequestDriver,
    min_success_ratio: f64,
}

impl FanoutCoordinator {
    pub fn new(driver: RequestDriver, min_success_ratio: f64) -> Self {
        Self {
            driver,
            min_success_ratio,
        }
    }

    /// Query every backend and wait for all of them to settle.
    ///
    /// Each outcome is added to `tracker`. Fails when no backend answered or
    /// the run was cancelled.
    pub async fn fetch_all(
        &self,
        client: &dyn ChatClient,
        prompt: &ChatPrompt,
        backends: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
        tracker: &mut EnsembleTracker,
    ) -> Result<FanoutResult, EnsembleError> {
        if backends.is_empty() {
            return Err(EnsembleError::NoBackends);
        }

        let calls = backends.iter().map(|backend| {
            let call = self
                .driver
                .send_tracked(client, prompt, backend, timeout, cancel)
                .instrument(backend_span(backend));
            async move {
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(driven) => driven,
                    Err(payload) => self.driver.record_panic(backend, panic_message(&*payload)),
                }
            }
        });
        let driven: Vec<DrivenResponse> = join_all(calls).await;

        let mut answers = Vec::with_capacity(driven.len());
        let mut outcomes = Vec::with_capacity(driven.len());
        for (backend, DrivenResponse { response, outcome }) in backends.iter().zip(driven) {
            tracker.add_request(outcome.clone());
            outcomes.push(outcome);
            answers.push(BackendAnswer::new(backend.as_str(), response));
        }

        if cancel.is_cancelled() {
            tracing::warn!("Fan-out cancelled");
            return Err(EnsembleError::Cancelled);
        }

        let success_count = answers.iter().filter(|a| a.is_valid()).count();
        if success_count == 0 {
            tracing::error!(attempted = backends.len(), "All backends failed");
            return Err(EnsembleError::AllBackendsFailed {
                attempted: backends.len(),
            });
        }

        let result = FanoutResult {
            degraded: false,
            answers,
            outcomes,
            success_count,
        };
        let ratio = result.success_ratio();
        let degraded = ratio < self.min_success_ratio;
        if degraded {
            tracing::warn!(
                success_count,
                attempted = backends.len(),
                success_ratio = ratio,
                "Fan-out degraded: fewer backends than expected answered"
            );
        } else {
            tracing::info!(success_count, attempted = backends.len(), "Fan-out complete");
        }

        Ok(FanoutResult { degraded, ..result })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "backend task panicked".to_string()
    }
}
