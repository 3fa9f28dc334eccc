//! Multi-model ensemble (v1)
//!
//! Dispatches one prompt to several LLM backends and refines their answers
//! into one.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                        ENSEMBLE                          │
//!                 │                                                          │
//!   run / serve   │  ┌──────────┐   ┌──────────────┐   ┌─────────────────┐   │
//!  ───────────────┼─▶│ sanitize │──▶│   fan-out    │──▶│ RequestDriver×N │───┼──▶ Backends
//!                 │  └──────────┘   │ (join_all)   │   │ breaker/limiter │   │
//!                 │                 └──────┬───────┘   │ timeout/retry   │   │
//!                 │                        ▼           └─────────────────┘   │
//!                 │                 ┌──────────────┐   ┌─────────────────┐   │
//!   answer        │                 │   refiner    │──▶│  RequestDriver  │───┼──▶ Refinement
//!  ◀──────────────┼─────────────────│ degradation  │   └─────────────────┘   │    backend
//!                 │                 └──────────────┘                         │
//!                 │  ┌────────────────────────────────────────────────────┐  │
//!                 │  │  config │ observability │ health │ lifecycle │ http │  │
//!                 │  └────────────────────────────────────────────────────┘  │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use ensemble::config::watcher::ConfigWatcher;
use ensemble::config::{load_config, EnsembleConfig};
use ensemble::health::{HealthChecker, HealthReporter};
use ensemble::http::{AppState, GenerateResponse, HttpServer};
use ensemble::lifecycle::{trigger_on_signal, Shutdown};
use ensemble::observability::{init_logging, metrics};
use ensemble::output::write_answer;
use ensemble::{OpenRouterClient, Orchestrator};

#[derive(Parser)]
#[command(name = "ensemble", version)]
#[command(about = "Query several LLMs and refine their answers into one", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "ENSEMBLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ensemble and print the refined answer
    Run {
        /// Prompt to send to every model
        #[arg(short, long)]
        prompt: String,
        /// Comma-separated models overriding the configuration
        #[arg(short, long, value_delimiter = ',')]
        models: Vec<String>,
        /// Model used to refine the answers
        #[arg(short, long)]
        refinement_model: Option<String>,
        /// Directory receiving a markdown copy of the result
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP API
    Serve {
        /// Bind address overriding the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Validate the configuration and print it
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    init_logging(config.observability.log_format);

    tracing::info!(models = config.models.len(), "ensemble v0.1.0 starting");

    match cli.command {
        Commands::Check => {
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# configuration is valid");
            Ok(())
        }
        Commands::Run {
            prompt,
            models,
            refinement_model,
            output_dir,
            json,
        } => {
            if !models.is_empty() {
                config.models = models;
            }
            if refinement_model.is_some() {
                config.refinement_model = refinement_model;
            }
            if output_dir.is_some() {
                config.output.directory = output_dir;
            }
            run_once(config, &prompt, json).await
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            serve(config, cli.config).await
        }
    }
}

async fn run_once(config: EnsembleConfig, prompt: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = config.output.directory.clone();
    let client = Arc::new(OpenRouterClient::new(&config.api));
    let orchestrator = Orchestrator::new(config, client);

    let config = orchestrator.config();
    let refinement = config.refinement_model().unwrap_or_default();

    let shutdown = Shutdown::new();
    let answer = tokio::select! {
        result = orchestrator.run_ensemble_with_cancel(prompt, &config.models, refinement, shutdown.token()) => result?,
        _ = trigger_on_signal(&shutdown) => {
            return Err("interrupted".into());
        }
    };

    if let Some(directory) = output_dir {
        write_answer(&directory, &answer)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&GenerateResponse::from(&answer))?);
    } else {
        println!("{}", answer.text);
    }
    Ok(())
}

async fn serve(config: EnsembleConfig, config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let metrics_handle = if config.observability.metrics_enabled {
        let handle = metrics::install_prometheus();
        tokio::spawn(metrics::run_upkeep(handle.clone(), Duration::from_secs(5)));
        Some(handle)
    } else {
        None
    };

    let client = Arc::new(OpenRouterClient::new(&config.api));
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), client));
    let shutdown = Arc::new(Shutdown::new());

    // Keep the watcher alive for the lifetime of the server.
    let _watcher = match config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(&path);
            let watcher = watcher.run()?;
            let target = orchestrator.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    target.update_config(new_config);
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let reporter = HealthReporter::new(
        HealthChecker::new(orchestrator.clone()),
        Duration::from_secs(config.observability.health_interval_secs),
    );
    tokio::spawn(reporter.run(shutdown.subscribe()));

    let state = AppState::new(orchestrator)
        .with_metrics(metrics_handle)
        .with_shutdown(shutdown.token());
    let server = HttpServer::new(&config.server, state);

    let signal_shutdown = shutdown.clone();
    server
        .run(listener, async move { trigger_on_signal(&signal_shutdown).await })
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
