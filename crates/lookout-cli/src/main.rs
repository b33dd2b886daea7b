use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lookout_sync::{Lookout, LookoutConfig, WatchAction, WatchlistKind};
use lookout_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lookout")]
#[command(about = "Patch-note poller, roster tracker and watchlist boards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every scheduled job and the operator API until interrupted.
    Run,
    /// Poll every configured source once.
    Poll,
    /// Take one roster snapshot and score it against the previous one.
    Compare,
    /// Broadcast one watchlist board.
    Board { list: WatchlistKind },
    /// Apply an operator verb (add, remove, edit, online, list) to a watchlist.
    Watch {
        list: WatchlistKind,
        action: String,
        #[arg(default_value = "")]
        name: String,
        #[arg(default_value = "None")]
        reason: String,
    },
    /// Show the significant associations recorded for a character.
    Check { name: String },
    /// Drop associations seen at most `threshold` times.
    Purge { threshold: u32 },
    /// Serve the operator API only.
    Serve,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lookout=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let lookout = Lookout::from_config(LookoutConfig::from_env())
        .await
        .context("initializing lookout")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let port = lookout.config.web_port;
            let scheduler = lookout.scheduler();
            info!(jobs = scheduler.jobs().len(), port, "lookout running");
            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "ctrl-c listener failed, stopping");
                }
            };
            tokio::select! {
                served = lookout_web::serve(AppState::from_lookout(&lookout), port) => served?,
                () = scheduler.run_until(shutdown) => {}
            }
        }
        Commands::Poll => {
            let delivered = lookout.poller.run_all(&lookout.sources).await;
            println!(
                "poll complete: sources={} delivered={delivered}",
                lookout.sources.len()
            );
        }
        Commands::Compare => {
            let report = lookout.tracker.compare().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Board { list } => {
            let outcome = lookout.watchlist(list).broadcast_pass().await?;
            println!("{list} board: {outcome:?}");
        }
        Commands::Watch {
            list,
            action,
            name,
            reason,
        } => {
            let result = lookout
                .watchlist(list)
                .handle(WatchAction::parse(&action), name.trim(), &reason)
                .await?;
            println!("{result}");
        }
        Commands::Check { name } => {
            println!("{}", lookout.tracker.check(&name).await);
        }
        Commands::Purge { threshold } => {
            println!("{}", lookout.tracker.purge(threshold).await.result);
        }
        Commands::Serve => {
            lookout_web::serve(AppState::from_lookout(&lookout), lookout.config.web_port).await?;
        }
    }

    Ok(())
}
