use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use brute_guard::config::{GuardConfig, LoggingConfig};
use brute_guard::guard::{
    AttemptRecord, AttemptStore, ManualClock, Outcome, StoreError,
};
use brute_guard::{Attempt, DecisionEngine, MemoryStore};

#[derive(Parser)]
#[command(name = "brute-guard", version, about = "Brute-force mitigation engine")]
struct Cli {
    /// Configuration file (YAML); BRUTE_GUARD__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the delay schedule of the configured policy
    Schedule,

    /// Validate a configuration file
    CheckConfig { path: PathBuf },

    /// Replay attempts for one identity against an in-memory store
    Simulate {
        #[arg(long, default_value_t = 10)]
        attempts: u32,
        /// Milliseconds between attempts
        #[arg(long, default_value_t = 250)]
        interval_ms: i64,
        /// Fire this many attempts at once on every step
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Use plain get/set instead of the store's atomic increment
        #[arg(long)]
        plain: bool,
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
        #[arg(long, default_value = "alice")]
        user: String,
    },
}

/// Hides the atomic capability of the wrapped store.
struct PlainStore(MemoryStore);

#[async_trait]
impl AttemptStore for PlainStore {
    async fn get(&self, key: &str) -> Result<Option<AttemptRecord>, StoreError> {
        self.0.get(key).await
    }

    async fn set(&self, key: &str, record: &AttemptRecord, ttl_secs: u64) -> Result<(), StoreError> {
        self.0.set(key, record, ttl_secs).await
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.0.reset(key).await
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // check-config validates its own file, through the same loader as every other command
    let source = match &cli.cmd {
        Command::CheckConfig { path } => Some(path.as_path()),
        _ => cli.config.as_deref(),
    };
    let config = GuardConfig::load(source).context("loading configuration")?;
    init_tracing(&config.logging);

    match cli.cmd {
        Command::Schedule => {
            let policy = config.policy.to_policy()?;
            println!("free retries: {}", policy.free_retries());
            println!("lifetime:     {}s", policy.lifetime_secs());
            for (i, delay) in policy.schedule().delays().iter().enumerate() {
                let attempt = policy.free_retries() + i as u64 + 2;
                println!("attempt {:>3}: wait {}ms", attempt, delay);
            }
        }
        Command::CheckConfig { path } => {
            config.validate()?;
            println!("{}: OK", path.display());
        }
        Command::Simulate {
            attempts,
            interval_ms,
            concurrency,
            plain,
            ip,
            user,
        } => {
            let memory = MemoryStore::with_prefix(config.store.prefix.clone());
            let store: Arc<dyn AttemptStore> = if plain {
                Arc::new(PlainStore(memory))
            } else {
                Arc::new(memory)
            };
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let engine = DecisionEngine::builder(store)
                .config(&config.policy)?
                .clock(clock.clone())
                .build();

            info!(limiter = engine.name(), plain = plain, "Simulating attempts");

            let attempt = Attempt::new().from_network(ip).sub_key(user);
            for step in 1..=attempts {
                let outcomes = futures::future::join_all(
                    (0..concurrency.max(1)).map(|_| engine.evaluate(&attempt)),
                )
                .await;

                for outcome in outcomes {
                    match outcome {
                        Outcome::Allowed(admission) => {
                            println!("step {:>3}: allowed (count {})", step, admission.count)
                        }
                        Outcome::Denied(denial) => {
                            let response = denial.response();
                            println!(
                                "step {:>3}: denied, status {}, retry after {}s",
                                step, response.status, response.retry_after_secs
                            )
                        }
                        Outcome::StoreError(failure) => println!("step {:>3}: {}", step, failure),
                    }
                }
                clock.advance_millis(interval_ms);
            }
        }
    }

    Ok(())
}
