// inference-gateway/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use inference_gateway::{backends::BackendKind, config::Config, release::ReleaseManager, run_server};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "inference-gateway", version, about = "OpenAI-compatible gateway over pluggable model workers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Serve the OpenAI-compatible API (default)
    Run,
    /// Serve a single in-process worker over the wire
    Worker {
        /// store | remote-openai
        #[arg(long, env = "WORKER_BACKEND", default_value = "store")]
        backend: String,
        #[arg(long, env = "WORKER_ADDR", default_value = "127.0.0.1:50051")]
        addr: String,
    },
    /// Manage the LocalAI release binary
    Release {
        #[command(subcommand)]
        action: ReleaseAction,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum ReleaseAction {
    /// Compare the installed version with the latest release
    Check,
    /// Download and verify a release (latest when no version is given)
    Install {
        #[arg(long)]
        version: Option<String>,
    },
    /// Verify the installed binary, removing it if corrupted
    Verify,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_server(cfg).await,
        Command::Worker { backend, addr } => {
            inference_gateway::telemetry::init_tracing();
            let kind: BackendKind = backend.parse()?;
            inference_gateway::worker::server::serve(&addr, kind.instantiate()).await
        }
        Command::Release { action } => {
            inference_gateway::telemetry::init_tracing();
            let manager = ReleaseManager::new(&cfg.release_owner, &cfg.release_repo);
            release(manager, action).await
        }
    }
}

#[cfg(feature = "cli")]
async fn release(manager: ReleaseManager, action: ReleaseAction) -> anyhow::Result<()> {
    use anyhow::Context;

    match action {
        ReleaseAction::Check => {
            let installed = manager.get_installed_version().await;
            let (update, latest) = manager.is_update_available().await.context("checking latest release")?;
            println!("installed: {}", installed.as_deref().unwrap_or("none"));
            println!("latest:    {}", latest);
            if update {
                println!("an update is available");
            }
        }
        ReleaseAction::Install { version } => {
            let version = match version {
                Some(v) => v,
                None => manager.get_latest_release().await.context("fetching latest release")?.version,
            };
            manager.cleanup_partial_downloads();
            let report: &inference_gateway::release::ProgressFn<'_> = &|ratio: f64| {
                let percent = (ratio * 100.0) as u32;
                if percent % 10 == 0 {
                    tracing::debug!("download {}%", percent);
                }
            };
            manager
                .download_release(&version, Some(report))
                .await
                .with_context(|| format!("installing {}", version))?;
            println!("installed {} at {}", version, manager.binary_path().display());
        }
        ReleaseAction::Verify => {
            if manager.is_local_ai_installed() {
                println!("{} verified", manager.binary_path().display());
            } else {
                anyhow::bail!("no verified binary at {}", manager.binary_path().display());
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
