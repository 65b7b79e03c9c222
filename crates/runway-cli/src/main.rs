mod commands;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::Commands;

#[derive(Parser)]
#[command(name = "runway")]
#[command(about = "Runway - batch test dispatch across local, LSF, task-queue and Windows backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into());
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Tests may initialize tracing multiple times; it's fine once a global
        // subscriber is already installed.
        return Ok(());
    }
    Ok(())
}

/// SIGINT and SIGTERM both flip the token; commands pass it down to
/// their runner so in-flight work gets stopped rather than orphaned.
fn spawn_signal_bridge() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    // Install the handler before returning so a signal arriving right
    // after spawn is not lost to the default disposition.
    #[cfg(unix)]
    let terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
    tokio::spawn(async move {
        let interrupted = {
            #[cfg(unix)]
            {
                match terminate {
                    Ok(mut terminate) => {
                        tokio::select! {
                            result = tokio::signal::ctrl_c() => result.is_ok(),
                            _ = terminate.recv() => true,
                        }
                    }
                    Err(e) => {
                        warn!("failed to install SIGTERM handler: {e}");
                        tokio::signal::ctrl_c().await.is_ok()
                    }
                }
            }
            #[cfg(not(unix))]
            {
                tokio::signal::ctrl_c().await.is_ok()
            }
        };
        if interrupted {
            warn!("interrupt received, cancelling in-flight work");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cancel = spawn_signal_bridge();
    let passed = match Cli::parse().command {
        Commands::Batch(cmd) => cmd.execute(&cancel).await?,
        Commands::Compare(cmd) => cmd.execute().await?,
    };
    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::types::{ExistingPolicy, PendingPolicy, RunnerKind};

    #[test]
    fn test_cli_parses_batch_defaults() {
        let cli = Cli::parse_from([
            "runway", "batch", "--batch", "nightly", "--command", "echo {input}",
        ]);
        let Commands::Batch(cmd) = cli.command else {
            panic!("expected batch command");
        };
        assert_eq!(cmd.batches, vec!["nightly"]);
        assert_eq!(cmd.runner, RunnerKind::Local);
        assert!(!cmd.no_wait);
        assert_eq!(cmd.action_on_existing, ExistingPolicy::Run);
        assert_eq!(cmd.action_on_pending, PendingPolicy::Wait);
    }

    #[test]
    fn test_cli_parses_batch_flags() {
        let cli = Cli::parse_from([
            "runway",
            "batch",
            "--batch",
            "a",
            "--batch",
            "b",
            "--batches-file",
            "qa/batches.yaml",
            "--command",
            "run {input}",
            "--runner",
            "lsf",
            "--no-wait",
            "--configuration",
            "base:low-light",
            "--label",
            "ci-42",
        ]);
        let Commands::Batch(cmd) = cli.command else {
            panic!("expected batch command");
        };
        assert_eq!(cmd.batches, vec!["a", "b"]);
        assert_eq!(cmd.runner, RunnerKind::Lsf);
        assert!(cmd.no_wait);
        assert_eq!(cmd.label, "ci-42");
    }

    #[test]
    fn test_cli_rejects_unknown_enum_values() {
        assert!(Cli::try_parse_from([
            "runway", "batch", "--batch", "a", "--command", "echo", "--runner", "slurm",
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "runway", "batch", "--batch", "a", "--command", "echo",
            "--action-on-pending", "retry",
        ])
        .is_err());
    }

    #[test]
    fn test_cli_parses_compare() {
        let cli = Cli::parse_from([
            "runway", "compare", "/out/a", "/out/b", "--strict", "--ignore", "*.txt",
        ]);
        let Commands::Compare(cmd) = cli.command else {
            panic!("expected compare command");
        };
        assert!(cmd.strict);
        assert_eq!(cmd.ignore, vec!["*.txt"]);
    }

    #[test]
    fn test_cli_rejects_missing_subcommand() {
        assert!(Cli::try_parse_from(["runway"]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_flips_cancellation_token() {
        let cancel = spawn_signal_bridge();
        assert!(!cancel.is_cancelled());
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("send SIGTERM");
        assert!(status.success());
        tokio::time::timeout(std::time::Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("SIGTERM did not cancel the token");
    }
}
