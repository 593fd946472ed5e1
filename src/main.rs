use clap::{Parser, Subcommand};
use coordinator::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "coordinator")]
#[command(about = "Batch reconciliation for equipment telemetry", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation scheduler and web API (default)
    Run,
    /// Run a single reconciliation pass and print its summary
    Reconcile,
    /// Print the work progress board as JSON
    Progress {
        /// Comma separated equipment types
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        #[arg(long)]
        line: Option<String>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            coordinator::cli::run::run(config_path).await?;
        }
        Some(Commands::Reconcile) => {
            coordinator::cli::run::reconcile_once(config_path).await?;
        }
        Some(Commands::Progress { types, line }) => {
            coordinator::cli::run::print_progress(config_path, types, line).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                coordinator::cli::config::init(stdout)?;
            }
        },
    }

    Ok(())
}
