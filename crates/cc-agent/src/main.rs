use cc_agent::config::DaemonArgs;
use cc_agent::daemon;
use cc_agent::exec::{self, ExecArgs};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cc-agent",
    about = "CronCommander agent: bridges cron-based hosts to the CronCommander control plane"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as a background daemon maintaining the control-plane uplink
    Daemon(DaemonArgs),
    /// Execute a command, capture its output, and report the result
    Exec(ExecArgs),
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Daemon(args) => {
            if let Err(err) = daemon::run_daemon(args).await {
                error!(event = "fatal", error = %format!("{err:#}"));
                std::process::exit(1);
            }
        }
        Command::Exec(args) => {
            // Exit mirrors the wrapped child so cron sees the real outcome.
            std::process::exit(exec::run(args));
        }
    }
}

fn init_logging() {
    let level = if let Ok(level) = std::env::var("CC_AGENT_LOG") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
