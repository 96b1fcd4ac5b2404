use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strand::api::{AppState, create_router};
use strand::auth::KubeClients;
use strand::settings::ServerConfig;

const APP_NAME: &str = "strand";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;

    match cli.command {
        Command::Serve(cmd) => run_serve(cli.common, cmd),
        Command::Config => {
            let config = ServerConfig::load(config_path(&cli.common).as_deref())
                .context("loading configuration")?;
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            print!("{rendered}");
            Ok(())
        }
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

/// Resolve the config file: an explicit flag wins, otherwise the user's
/// config directory is consulted if a file exists there.
fn config_path(common: &CommonOpts) -> Option<PathBuf> {
    common.config.clone().or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join(APP_NAME).join("config.toml"))
            .filter(|path| path.exists())
    })
}

#[tokio::main]
async fn run_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    let mut config =
        ServerConfig::load(config_path(&common).as_deref()).context("loading configuration")?;
    if let Some(bind) = cmd.bind {
        config.bind_addr = bind.parse().context("parsing --bind address")?;
    }
    if let Some(state_dir) = cmd.state_dir {
        config.state_dir = state_dir;
    }

    let kube = KubeClients::initialize()
        .await
        .context("connecting to the Kubernetes API")?;
    let state = AppState::new(config.clone(), kube);
    let router = create_router(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, state_dir = %config.state_dir.display(), "serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

fn init_logging(common: &CommonOpts) -> Result<()> {
    let default_level = if common.trace {
        "trace"
    } else if common.debug || common.verbose >= 2 {
        "debug"
    } else if common.quiet {
        "error"
    } else if common.verbose == 1 {
        "info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={default_level},info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("initializing logging: {e}"))?;
    Ok(())
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "strand - control plane for agentic sessions on Kubernetes.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve(ServeCommand),
    /// Print the resolved configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Bind address, e.g. 0.0.0.0:8080
    #[arg(long, env = "STRAND_BIND_ADDR")]
    bind: Option<String>,
    /// Base directory for per-session state
    #[arg(long, env = "STRAND_STATE_DIR")]
    state_dir: Option<PathBuf>,
}
