//! chatrelay server - TCP chat relay daemon

use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use chatrelay_server::console::run_console;
use chatrelay_server::tcp::{bind, run_accept_loop};
use chatrelay_server::{AppConfig, ConfigLoader, ServerConfig, SharedState};
use chatrelay_utils::{init_logging_with_config, LogConfig, RelayError, Result};

#[derive(Parser, Debug)]
#[command(name = "chatrelay-server")]
#[command(about = "Relay chat and direct messages between TCP clients")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/chatrelay/config.toml)
    #[arg(short, long, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, env = "CHATRELAY_BIND")]
    bind: Option<String>,

    /// Port to listen on (0 for any free port)
    #[arg(short, long, env = "CHATRELAY_PORT")]
    port: Option<u16>,

    /// Log filter, e.g. "debug" or "chatrelay_server=trace"
    #[arg(long)]
    log: Option<String>,
}

/// Config file values with command-line overrides applied
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = ConfigLoader::load(args.config.as_deref())?;

    if let Some(bind) = &args.bind {
        config.server.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    ConfigLoader::validate(&config)?;
    Ok(config)
}

/// Forward stdin lines from a dedicated thread
///
/// A blocking terminal read on a runtime thread would keep the process
/// alive after shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);

    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    rx
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    let listener = bind(&config).await?;
    let state = SharedState::new(config);

    let mut accept = tokio::spawn(run_accept_loop(listener, state.clone()));
    let console = tokio::spawn(run_console(
        spawn_stdin_reader(),
        tokio::io::stdout(),
        state.clone(),
    ));
    info!("Type 'help' for console commands");

    let result = tokio::select! {
        joined = &mut accept => match joined {
            Ok(result) => result,
            Err(e) => Err(RelayError::internal(format!("accept loop panicked: {}", e))),
        },
        _ = interrupted() => {
            info!("Interrupted");
            Ok(())
        }
        _ = state.stopped() => Ok(()),
    };

    state.shutdown().await;
    console.abort();

    info!("chatrelay stopped");
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let mut log_config = LogConfig::server(config.logging.output, &config.logging.filter);
    if let Some(filter) = &args.log {
        log_config.filter = filter.clone();
    }
    init_logging_with_config(log_config)?;

    info!("chatrelay starting");
    run(config.server).await
}
