//! Operator console
//!
//! Line-oriented commands read from the relay's stdin. Lines arrive over a
//! channel so the blocking terminal read lives on its own thread and never
//! holds up runtime shutdown.

use std::fmt::Write as _;
use std::str::FromStr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::info;

use crate::state::SharedState;

const HELP: &str = "\
Commands:
  users  list connected users
  stats  show relay counters
  help   show this help
  exit   stop the relay (also: quit)
";

/// A parsed console line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Users,
    Stats,
    Help,
    Exit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim().to_lowercase().as_str() {
            "users" => Ok(Self::Users),
            "stats" => Ok(Self::Stats),
            "help" | "?" => Ok(Self::Help),
            "exit" | "quit" => Ok(Self::Exit),
            other => Err(format!("Unknown command: {} (try help)", other)),
        }
    }
}

/// Text printed in response to `command`
pub fn render(command: ConsoleCommand, state: &SharedState) -> String {
    match command {
        ConsoleCommand::Users => render_users(state),
        ConsoleCommand::Stats => format!("{}\n", state.metrics.snapshot()),
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Exit => "Stopping relay\n".to_string(),
    }
}

fn render_users(state: &SharedState) -> String {
    let mut sessions = state.registry.snapshot_all();
    if sessions.is_empty() {
        return "No users connected\n".to_string();
    }
    sessions.sort_by(|(a, _), (b, _)| a.cmp(b));

    let width = sessions.iter().map(|(id, _)| id.chars().count()).max().unwrap_or(0);
    let mut out = format!("Connected users ({}):\n", sessions.len());
    for (identity, session) in &sessions {
        let _ = writeln!(out, "  {:<width$}  {}", identity, session.remote_addr());
    }
    out
}

/// Serve console commands until `exit`, end of input or relay shutdown
pub async fn run_console<W>(
    mut lines: mpsc::Receiver<String>,
    mut out: W,
    state: SharedState,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            biased;
            _ = state.shutdown_signal() => return Ok(()),
            line = lines.recv() => line,
        };

        // Input closed (detached relay): keep serving clients without a console
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<ConsoleCommand>() {
            Ok(ConsoleCommand::Exit) => {
                out.write_all(render(ConsoleCommand::Exit, &state).as_bytes())
                    .await?;
                out.flush().await?;
                info!("Shutdown requested from console");
                state.shutdown().await;
                return Ok(());
            }
            Ok(command) => out.write_all(render(command, &state).as_bytes()).await?,
            Err(message) => {
                out.write_all(message.as_bytes()).await?;
                out.write_all(b"\n").await?;
            }
        }
        out.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::session::Session;
    use std::time::Duration;

    #[test]
    fn test_parse_commands() {
        assert_eq!("users".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Users));
        assert_eq!("  STATS \n".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Stats));
        assert_eq!("quit".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Exit));
        assert_eq!("exit".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Exit));
        assert!("reboot".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_render_users() {
        let state = SharedState::new(ServerConfig::default());
        assert_eq!(render(ConsoleCommand::Users, &state), "No users connected\n");

        let (bob, _bob_rx) = Session::detached(2, "bob", 16);
        let (alice, _alice_rx) = Session::detached(1, "alice", 16);
        state.router.join(&bob).unwrap();
        state.router.join(&alice).unwrap();

        let text = render(ConsoleCommand::Users, &state);
        assert!(text.starts_with("Connected users (2):"));
        let alice_at = text.find("alice").unwrap();
        let bob_at = text.find("bob").unwrap();
        assert!(alice_at < bob_at);
        assert!(text.contains(&alice.remote_addr().to_string()));
    }

    #[test]
    fn test_render_stats() {
        let state = SharedState::new(ServerConfig::default());
        state.metrics.record_connection();
        assert!(render(ConsoleCommand::Stats, &state).contains("connections accepted: 1"));
    }

    #[tokio::test]
    async fn test_console_session() {
        let state = SharedState::new(ServerConfig::default());
        let (tx, rx) = mpsc::channel(8);
        let mut out = Vec::new();

        tx.send("help".into()).await.unwrap();
        tx.send("".into()).await.unwrap();
        tx.send("dance".into()).await.unwrap();
        tx.send("exit".into()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), run_console(rx, &mut out, state.clone()))
            .await
            .expect("console did not exit")
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Commands:"));
        assert!(text.contains("Unknown command: dance"));
        assert!(text.ends_with("Stopping relay\n"));
        assert!(state.is_shutting_down());
    }

    #[tokio::test]
    async fn test_console_input_closed() {
        let state = SharedState::new(ServerConfig::default());
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);

        run_console(rx, tokio::io::sink(), state.clone()).await.unwrap();
        assert!(!state.is_shutting_down());
    }
}
