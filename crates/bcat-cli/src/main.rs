use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bcat-cli")]
#[command(about = "Book catalog harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest pass with settings from the environment.
    Collect {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the destination table if it does not exist.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bcat=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Collect { json: false }) {
        Commands::Collect { json } => {
            let summary = bcat_sync::run_harvest_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "harvest complete: run_id={} mode={} terms={} pages={} written={} new={} carried={} abandoned={}",
                    summary.run_id,
                    summary.mode,
                    summary.terms.len(),
                    summary.pages_fetched,
                    summary.records_written,
                    summary.new_identities,
                    summary.carried_identities,
                    summary.abandoned_loops
                );
            }
        }
        Commands::Migrate => {
            bcat_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
