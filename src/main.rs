//! Turnkeeper CLI
//!
//! Records conversations through the batched, reconnecting persistence layer
//! and queries long-term memory.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use turnkeeper::config::default_home;
use turnkeeper::session::backend_factory;
use turnkeeper::warehouse::JsonlStore;
use turnkeeper::{
    ConnectionManager, ConversationTurn, RetryPolicy, SessionManager, StoreCommand,
    TurnkeeperConfig,
};

/// Turnkeeper - resilient conversation persistence
#[derive(Parser, Debug)]
#[command(name = "turnkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration home (defaults to $TURNKEEPER_HOME or ~/.turnkeeper)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Directory holding the conversation history files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record `role: content` lines from stdin, then flush
    Ingest {
        #[arg(long)]
        user: String,
    },
    /// Print a user's persisted history
    History {
        #[arg(long)]
        user: String,

        /// Only the last N turns
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Query both long-term memory slots
    Recall {
        #[arg(long)]
        user: String,

        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// Show connection state and configuration
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let home = match cli.home.clone() {
        Some(home) => home,
        None => default_home()?,
    };
    let mut config = TurnkeeperConfig::load(&home)?;
    if let Some(dir) = cli.data_dir.clone() {
        config = config.with_data_dir(dir);
    }

    let store = Arc::new(JsonlStore::new(config.data_dir.clone()));
    let connection = Arc::new(ConnectionManager::new(
        store,
        RetryPolicy::from_config(&config),
    ));
    let factory = backend_factory(&config);
    let manager = SessionManager::new(config, connection, factory);

    let result = run(&manager, cli.command).await;
    let closed = manager.close_all().await;
    result?;
    closed?;
    Ok(())
}

async fn run(manager: &SessionManager, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ingest { user } => ingest(manager, &user).await,
        Command::History { user, limit } => {
            let history = manager.load_history(&user).await?;
            let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
            for turn in history.iter().skip(skip) {
                println!(
                    "[{}] {}",
                    turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    turn.format()
                );
            }
            Ok(())
        }
        Command::Recall { user, query } => {
            let session = manager.open(&user).await?;
            let context = session.recall(&query.join(" ")).await;
            if context.is_degraded() {
                for outcome in context.outcomes.iter().filter(|o| !o.succeeded) {
                    warn!(
                        "{} memory unavailable: {}",
                        outcome.backend,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            println!("User memories:");
            print_memories(&context.user_text());
            println!("Assistant memories:");
            print_memories(&context.assistant_text());
            Ok(())
        }
        Command::Status => status(manager).await,
    }
}

async fn ingest(manager: &SessionManager, user: &str) -> anyhow::Result<()> {
    let session = manager.open(user).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut recorded = 0usize;

    while let Some(line) = lines.next_line().await? {
        let Some(turn) = ConversationTurn::parse_line(&line) else {
            continue;
        };
        session.record(turn.role, turn.content).await?;
        recorded += 1;
    }

    manager.close(user).await?;
    info!("Recorded {} turns for {}", recorded, user);
    println!("{recorded} turns recorded");
    Ok(())
}

async fn status(manager: &SessionManager) -> anyhow::Result<()> {
    if let Err(e) = manager.connection().execute(StoreCommand::Ping).await {
        warn!("Warehouse ping failed: {}", e);
    }
    let status = manager.status().await;
    let config = manager.config();

    println!("Connection: {}", status.connection.status);
    println!("Reconnect attempts: {}", status.connection.retry_count);
    if let Some(error) = &status.connection.last_error {
        println!("Last error: {}", error);
    }
    println!("Data dir: {}", config.data_dir.display());
    println!(
        "Batching: {} turns or {}s",
        config.batch_size,
        config.batch_interval.as_secs()
    );
    let policy = manager.connection().policy();
    println!(
        "Reconnect: {} retries, {:.1}s base backoff, {:.0}% jitter",
        policy.max_retries,
        policy.base_delay.as_secs_f64(),
        policy.jitter_ratio() * 100.0
    );
    println!(
        "Long-term memory: {} ({})",
        if status.memory_enabled { "enabled" } else { "disabled" },
        if status.parallel_memory { "parallel" } else { "sequential" }
    );
    Ok(())
}

fn print_memories(text: &str) {
    if text.is_empty() {
        println!("  (none)");
        return;
    }
    for line in text.lines() {
        println!("  - {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_recall_query() {
        let cli = Cli::parse_from(["turnkeeper", "recall", "--user", "alice", "q3", "revenue"]);
        match cli.command {
            Command::Recall { user, query } => {
                assert_eq!(user, "alice");
                assert_eq!(query, vec!["q3", "revenue"]);
            }
            other => panic!("Expected recall, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["turnkeeper", "status", "-v", "--data-dir", "/tmp/wh"]);
        assert!(cli.verbose);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/wh")));
    }
}
