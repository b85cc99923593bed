//! Plotforge CLI entry point.
//!
//! The chat-platform adapter lives outside this crate and drives the
//! library through the router and command surface. This binary owns the
//! shared state: it bootstraps the store, cache, and broker, runs the
//! maintenance loops (vote cache sweep, pending-proposal expiry, store
//! health ping), and offers a few inspection subcommands.

use clap::{Parser, Subcommand};
use plotforge::cache::VolatileCache;
use plotforge::config::Config;
use plotforge::llm::broker::LlmBroker;
use plotforge::store::Store;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "plotforge", version)]
#[command(about = "Versioned narrative engine for a chat-group AI game master")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory (defaults to the platform data dir)
    #[arg(short, long, global = true)]
    data_dir: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service loops until interrupted (default)
    Run,
    /// List all games in the store
    Games,
    /// Show one game's branches and tags
    Inspect {
        /// Game id
        game_id: i64,
    },
    /// Check that the database answers
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let cli = Cli::parse();

    if let Some(data_dir) = &cli.data_dir {
        // Config::load reads the environment; the flag overrides it.
        unsafe { std::env::set_var("PLOTFORGE_DATA_DIR", data_dir) };
    }
    let config = Config::load()?;

    let default_filter = if cli.debug { "plotforge=debug" } else { "plotforge=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let (file_writer, _log_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(config.data_dir.join("logs"), "plotforge.log"),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let store = Store::connect(&config.sqlite_path()).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_service(config, store).await,
        Command::Games => list_games(&store).await,
        Command::Inspect { game_id } => inspect_game(&store, game_id).await,
        Command::Ping => {
            store.ping().await?;
            println!("ok");
            Ok(())
        }
    }
}

async fn run_service(config: Config, store: Store) -> anyhow::Result<()> {
    let cache = VolatileCache::new(
        config.cache_path(),
        config.cache_save_delay,
        config.vote_entry_ttl,
        config.vote_sweep_interval,
        config.web_token_ttl,
    );
    cache.load().await?;

    let broker = Arc::new(LlmBroker::open(&config.data_dir)?);
    broker.load().await?;

    tracing::info!(data_dir = %config.data_dir.display(), "plotforge core is up");

    // Periodic sweep of stale vote entries, beyond the opportunistic sweep
    // that rides on vote mutations.
    let sweep_cache = cache.clone();
    let sweep_interval = config.vote_sweep_interval;
    let vote_sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_cache.sweep_stale_votes().await;
        }
    });

    // Pending proposals expire on reaction arrival; this backstop clears
    // them when nobody ever reacts.
    let expiry_cache = cache.clone();
    let pending_timeout = config.pending_game_timeout;
    let proposal_expirer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(pending_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            expiry_cache.cleanup_expired_pending_games(pending_timeout).await;
        }
    });

    let ping_store = store.clone();
    let ping_interval = config.db_ping_interval;
    let health_pinger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = ping_store.ping().await {
                tracing::error!(%error, "store health check failed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    vote_sweeper.abort();
    proposal_expirer.abort();
    health_pinger.abort();
    cache.shutdown().await;

    Ok(())
}

async fn list_games(store: &Store) -> anyhow::Result<()> {
    let games = store.get_all_games().await?;
    if games.is_empty() {
        println!("no games");
        return Ok(());
    }
    for game in games {
        println!(
            "#{} channel={} host={} frozen={} created={}",
            game.game_id,
            game.channel_id.as_deref().unwrap_or("-"),
            game.host_user_id,
            game.is_frozen,
            game.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn inspect_game(store: &Store, game_id: i64) -> anyhow::Result<()> {
    let Some(game) = store.get_game_by_game_id(game_id).await? else {
        anyhow::bail!("game {game_id} not found");
    };

    println!("game #{game_id}");
    println!("  channel: {}", game.channel_id.as_deref().unwrap_or("-"));
    println!("  host: {}", game.host_user_id);
    println!("  frozen: {}", game.is_frozen);

    for branch in store.get_all_branches_for_game(game_id).await? {
        let head_marker = if game.head_branch_id == Some(branch.branch_id) {
            " (HEAD)"
        } else {
            ""
        };
        println!(
            "  branch {}{} -> round {}",
            branch.name,
            head_marker,
            branch
                .tip_round_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    for tag in store.get_all_tags_for_game(game_id).await? {
        println!("  tag {} -> round {}", tag.name, tag.round_id);
    }
    Ok(())
}
