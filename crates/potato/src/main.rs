//! potato — desired-state node agent and plan server.
//!
//! One binary, two roles:
//! - `agent` runs on every node, pulls its plan over gRPC and drives the
//!   local Docker Swarm toward it
//! - `server` answers plan requests from the release table in PostgreSQL
//!
//! # Usage
//!
//! ```text
//! potato --database-url postgres://potato@db/potato server
//! potato --listen-address planner:9000 agent
//! ```

mod agent_mode;
mod server_mode;
mod version;

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "potato", about = "Potato desired-state agent and plan server")]
struct Cli {
    #[command(flatten)]
    opts: Opts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Reconcile the local Docker Swarm against this node's plan.
    Agent,
    /// Serve plans from the release store.
    Server,
    /// Print version information.
    Version,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Opts {
    /// Load environment variables from this file before reading flags.
    #[arg(short = 'e', long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Node id. Defaults to the host name.
    #[arg(long, env = "ID", global = true)]
    pub id: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Plan server address: bind address for `server`, dial address for `agent`.
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:9000", global = true)]
    pub listen_address: String,

    /// Agent metrics bind address.
    #[arg(long, env = "ADVERTISE_ADDRESS", default_value = "0.0.0.0:9100", global = true)]
    pub advertise_address: String,

    /// Seconds between reconciliation ticks.
    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value = "1", global = true)]
    pub sync_interval_secs: u64,

    #[arg(long, env = "DOCKER_SOCKET", default_value = potato_cluster::docker::DEFAULT_SOCKET, global = true)]
    pub docker_socket: String,

    /// Listen address used when the agent has to initialise a swarm.
    #[arg(long, env = "SWARM_LISTEN_ADDRESS", default_value = "0.0.0.0:2377", global = true)]
    pub swarm_listen_address: String,

    /// PostgreSQL connection string. Required by `server`.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "MIGRATIONS_PATH", default_value = "migrations", global = true)]
    pub migrations_path: PathBuf,

    /// Do not apply migrations before serving.
    #[arg(long, env = "SKIP_MIGRATION", global = true)]
    pub skip_migration: bool,
}

impl Opts {
    /// The configured node id, or the host name.
    pub fn node_id(&self) -> anyhow::Result<String> {
        match &self.id {
            Some(id) if !id.is_empty() => Ok(id.clone()),
            _ => hostname().context("no --id given and the host name is unavailable"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    if let Some(path) = cli.opts.env_file.clone() {
        dotenv::from_path(&path)
            .with_context(|| format!("failed to load env file {}", path.display()))?;
        cli = Cli::parse();
    }

    init_tracing(&cli.opts.log_level)?;

    match cli.command {
        Command::Agent => agent_mode::run_agent(&cli.opts).await,
        Command::Server => server_mode::run_server(&cli.opts).await,
        Command::Version => {
            println!("{}", version::version_string());
            Ok(())
        }
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}

/// Resolve on Ctrl-C, or once the group is stopping for another reason.
pub(crate) async fn until_interrupted(stop: watch::Receiver<bool>) -> anyhow::Result<()> {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutdown signal received");
        }
        _ = potato_cluster::wait_for(stop) => {}
    }
    Ok(())
}

fn hostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
