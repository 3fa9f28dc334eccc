use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "ensemble-cli")]
#[command(about = "Client for a running ensemble server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:5000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ensemble on the server
    Generate {
        /// Prompt to send to every model
        prompt: String,
        /// Comma-separated models overriding the server's list
        #[arg(short, long, value_delimiter = ',')]
        models: Vec<String>,
        /// Model used to refine the answers
        #[arg(short, long)]
        refinement_model: Option<String>,
    },
    /// Show the server's health report
    Health,
    /// Show backend, rate limiter and circuit statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Generate {
            prompt,
            models,
            refinement_model,
        } => {
            let mut body = json!({ "prompt": prompt });
            if !models.is_empty() {
                body["models"] = json!(models);
            }
            if let Some(model) = refinement_model {
                body["refinement_model"] = json!(model);
            }
            let res = client
                .post(format!("{base}/generate"))
                .json(&body)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Health => {
            let res = client.get(format!("{base}/health")).send().await?;
            print_response(res).await?;
        }
        Commands::Stats => {
            let res = client.get(format!("{base}/stats")).send().await?;
            print_response(res).await?;
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    let rendered = match serde_json::from_str::<Value>(&text) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => text,
    };

    if status.is_success() {
        println!("{rendered}");
    } else {
        eprintln!("Error: server returned status {status}");
        eprintln!("{rendered}");
        std::process::exit(1);
    }
    Ok(())
}
