use anyhow::Result;
use clap::{Parser, Subcommand};
use dealpress_pipeline::PipelineConfig;

#[derive(Debug, Parser)]
#[command(name = "dealpress-cli")]
#[command(about = "Deal sheet enrichment command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process the sheet once and print the run summary.
    Run,
    /// Start the API-key-gated HTTP trigger endpoint.
    Serve {
        /// Listen port (overrides the PORT environment variable).
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let report = dealpress_pipeline::run_from_env().await?;
            println!(
                "run complete: run_id={} rows={} processed={} skipped={} errored={}",
                report.run_id, report.rows, report.processed, report.skipped, report.errored
            );
        }
        Commands::Serve { port } => {
            let mut config = PipelineConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            dealpress_web::serve(config).await?;
        }
    }

    Ok(())
}
