//! Periodic health evaluation.
//!
//! # Responsibilities
//! - Re-evaluate health on a fixed interval while the server runs
//! - Log status transitions and newly observed issues

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::health::checker::{HealthChecker, HealthStatus};

pub struct HealthReporter {
    checker: HealthChecker,
    interval: Duration,
}

impl HealthReporter {
    pub fn new(checker: HealthChecker, interval: Duration) -> Self {
        Self { checker, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if self.interval.is_zero() {
            tracing::info!("Periodic health evaluation disabled");
            return;
        }

        tracing::info!(interval_secs = self.interval.as_secs(), "Health reporter starting");

        let mut ticker = time::interval(self.interval);
        let mut last = HealthStatus::Healthy;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    last = self.evaluate(last);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health reporter received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    fn evaluate(&self, previous: HealthStatus) -> HealthStatus {
        let report = self.checker.check();
        if report.status != previous {
            match report.status {
                HealthStatus::Healthy => {
                    tracing::info!(from = previous.as_str(), "Service health recovered");
                }
                status => tracing::warn!(
                    from = previous.as_str(),
                    to = status.as_str(),
                    issues = ?report.issues,
                    "Service health changed"
                ),
            }
        }
        report.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::client::{ChatClient, ChatPrompt, ClientError};
    use crate::config::EnsembleConfig;
    use crate::ensemble::Orchestrator;

    struct Idle;

    #[async_trait]
    impl ChatClient for Idle {
        async fn complete(&self, _backend: &str, _prompt: &ChatPrompt) -> Result<String, ClientError> {
            Ok("ok".into())
        }
    }

    fn checker(models: &[&str]) -> HealthChecker {
        let config = EnsembleConfig {
            models: models.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        };
        HealthChecker::new(Arc::new(Orchestrator::new(config, Arc::new(Idle))))
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let reporter = HealthReporter::new(checker(&["a/x"]), Duration::from_secs(30));
        let handle = tokio::spawn(reporter.run(rx));

        tokio::time::sleep(Duration::from_secs(95)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_disables() {
        let (_tx, rx) = broadcast::channel(1);
        HealthReporter::new(checker(&["a/x"]), Duration::ZERO).run(rx).await;
    }

    #[test]
    fn test_evaluate_reports_current_status() {
        let reporter = HealthReporter::new(checker(&[]), Duration::from_secs(30));
        assert_eq!(reporter.evaluate(HealthStatus::Healthy), HealthStatus::Unhealthy);
    }
}
