use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pscx_sync::{ExtractConfig, ExtractionCoordinator, RunOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pscx-cli")]
#[command(about = "Practitioner registry snapshot extractor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP trigger/download API (default).
    Serve,
    /// Run one extraction inline.
    Extract {
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Keep only the newest extract and the pinned test artifact.
    Cleanup,
    /// Print the path of the newest extract.
    Latest,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => pscx_web::serve_from_env().await?,
        Commands::Extract { page_size } => {
            if page_size == Some(0) {
                bail!("--page-size must be positive");
            }
            let coordinator = ExtractionCoordinator::from_config(ExtractConfig::from_env())?;
            match coordinator.run_now(page_size).await? {
                RunOutcome::Succeeded(summary) => println!(
                    "extract complete: run_id={} pages={} rows={} artifact={} sha256={}",
                    summary.run_id,
                    summary.pages,
                    summary.rows,
                    summary.artifact.display(),
                    summary.sha256
                ),
                RunOutcome::Failed(failure) => {
                    bail!("extract failed: run_id={} {}", failure.run_id, failure.reason)
                }
            }
        }
        Commands::Cleanup => {
            let coordinator = ExtractionCoordinator::from_config(ExtractConfig::from_env())?;
            let report = coordinator.cleanup()?;
            println!(
                "cleanup complete: kept={} deleted={} failed={}",
                report.kept.as_deref().unwrap_or("none"),
                report.deleted.len(),
                report.failed.len()
            );
        }
        Commands::Latest => {
            let coordinator = ExtractionCoordinator::from_config(ExtractConfig::from_env())?;
            match coordinator.latest_artifact()? {
                Some(path) => println!("{}", path.display()),
                None => bail!("no extract available"),
            }
        }
    }

    Ok(())
}
