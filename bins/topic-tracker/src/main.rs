mod cmd;

use clap::Parser;
use cmd::config::{Effective, TrackerArgs};

#[derive(Parser)]
#[command(name = "topic-tracker", about = "Records which broker topics carry traffic")]
struct Cli {
    #[command(flatten)]
    args: TrackerArgs,
}

#[tokio::main]
async fn main() {
    // Before clap reads the environment.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Ok(path) = dotenv {
        tracing::info!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();

    let eff = match Effective::new(&cli.args) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    match cmd::run::run(eff).await {
        Ok(report) => {
            if report.lost > 0 {
                tracing::warn!(lost = report.lost, "stopped with unflushed records");
            }
            tracing::info!("topic-tracker stopped");
        }
        Err(e) => {
            tracing::error!(error = %e, "topic-tracker failed");
            std::process::exit(1);
        }
    }
}
