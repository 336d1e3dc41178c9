//! Prime checker - submit numbers and run the delivery pipeline services.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use checker_config_and_utils::{init_telemetry, Config};

/// Prime checker command-line interface.
#[derive(Parser)]
#[command(name = "prime-checker")]
#[command(about = "Asynchronous prime checks delivered through a transactional outbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file. Defaults apply when omitted
    #[arg(short, long, env = "PRIME_CHECKER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// SQLite database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a prime check and queue it for processing
    Submit {
        /// Number to check
        number: String,
        /// Requesting user
        #[arg(short, long, default_value = "1")]
        user_id: i64,
    },
    /// Show one prime check
    Get {
        /// Prime check ID
        id: i64,
    },
    /// List prime checks, newest first
    List,
    /// Run the outbox publisher
    Publisher,
    /// Run the prime-check worker
    PrimeWorker,
    /// Run the email-send worker
    EmailWorker,
    /// Consume and count messages with unrecognised event types
    UnknownSink,
}

impl Commands {
    fn service_name(&self) -> &'static str {
        match self {
            Self::Submit { .. } | Self::Get { .. } | Self::List => "prime-checker-cli",
            Self::Publisher => "outbox-publisher",
            Self::PrimeWorker => "prime-worker",
            Self::EmailWorker => "email-worker",
            Self::UnknownSink => "unknown-sink",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let telemetry = init_telemetry(cli.command.service_name(), &config)?;
    let propagator = telemetry.propagator();

    let result = match cli.command {
        Commands::Submit { number, user_id } => {
            app::submit(&config, propagator, user_id, &number).await
        }
        Commands::Get { id } => app::get(&config, propagator, id).await,
        Commands::List => app::list(&config, propagator).await,
        Commands::Publisher => app::run_publisher(&config, propagator).await,
        Commands::PrimeWorker => app::run_prime_worker(&config, propagator).await,
        Commands::EmailWorker => app::run_email_worker(&config, propagator).await,
        Commands::UnknownSink => app::run_unknown_sink(&config, propagator).await,
    };

    if let Err(e) = telemetry.shutdown() {
        eprintln!("Telemetry shutdown failed: {}", e);
    }
    result
}
