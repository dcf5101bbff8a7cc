//! reapkv demo
//!
//! Loads an in-memory store with keys spread over a few tables, registers a
//! TTL for each, and runs the expiry reaper until every key is gone or Ctrl+C
//! is pressed.

use reapkv::config::ReaperConfig;
use reapkv::keyspace::{split_key, table_db_name};
use reapkv::storage::{DbKind, PRIMARY_INDEX_DB};
use reapkv::{register_ttl, Database, Environment, ExpiryIndex, ExpiryReaper, MemEnv, Reaper, RoleContext, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TABLES: [&str; 3] = ["orders", "sessions", ""];

/// Demo configuration
struct Config {
    /// Number of keys to load
    keys: u32,
    /// Longest TTL handed out, in seconds
    max_ttl: u32,
    /// Reaper tick interval
    tick: Duration,
    /// Candidates per scan transaction
    batch_cap: usize,
    /// Start as a standby and get promoted after one tick interval
    standby: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keys: 1000,
            max_ttl: 5,
            tick: Duration::from_millis(500),
            batch_cap: 100,
            standby: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--keys" | "-k" => {
                    config.keys = parse_value(&args, i);
                    i += 2;
                }
                "--max-ttl" | "-t" => {
                    config.max_ttl = parse_value::<u32>(&args, i).max(1);
                    i += 2;
                }
                "--tick-ms" => {
                    config.tick = Duration::from_millis(parse_value(&args, i));
                    i += 2;
                }
                "--batch-cap" | "-b" => {
                    config.batch_cap = parse_value(&args, i);
                    i += 2;
                }
                "--standby" => {
                    config.standby = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("reapkv version {}", reapkv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize) -> T {
    let Some(raw) = args.get(i + 1) else {
        eprintln!("Error: {} requires a value", args[i]);
        std::process::exit(1);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}: {}", args[i], raw);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
reapkv - TTL expiration demo

USAGE:
    reapkv [OPTIONS]

OPTIONS:
    -k, --keys <N>          Keys to load (default: 1000)
    -t, --max-ttl <SECS>    Longest TTL handed out (default: 5)
        --tick-ms <MS>      Reaper tick interval (default: 500)
    -b, --batch-cap <N>     Candidates per scan transaction (default: 100)
        --standby           Start as a standby, promote after one tick
    -v, --version           Print version information
        --help              Print this help message

Set RUST_LOG=reapkv=debug to watch every cycle.
"#
    );
}

/// Creates the data tables and loads `keys` records with TTLs.
fn load(env: &MemEnv, config: &Config) -> anyhow::Result<()> {
    let index = ExpiryIndex::open(env, true)?;

    for i in 0..config.keys {
        let table = TABLES[i as usize % TABLES.len()];
        let key = if table.is_empty() {
            format!("key-{}", i)
        } else {
            format!("{}:{}", table, i)
        };

        let (table, name) = split_key(key.as_bytes());
        let db_name = table_db_name(&table);
        env.create_db(&db_name, DbKind::Btree);
        let db = env.open_db(&db_name, DbKind::Unknown, false)?;
        db.put(None, &name, format!("value-{}", i).as_bytes())?;

        let ttl = 1 + i % config.max_ttl;
        register_ttl(env, &index, &SystemClock, key.as_bytes(), ttl, i, 1)?;
    }

    index.close()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!(version = reapkv::VERSION, "reapkv demo starting");

    let env = Arc::new(MemEnv::new());
    load(&env, &config)?;
    info!(
        keys = config.keys,
        pending = env.len(PRIMARY_INDEX_DB),
        "Registered TTLs"
    );

    let role = RoleContext::new(!config.standby);
    let reaper_config = ReaperConfig::default()
        .with_tick_interval(config.tick)
        .with_batch_cap(config.batch_cap);
    let reaper = Reaper::new(Arc::clone(&env), role.gate(), reaper_config);
    let handle = ExpiryReaper::start(reaper, role.clone());

    if config.standby {
        tokio::time::sleep(config.tick).await;
        info!(pending = env.len(PRIMARY_INDEX_DB), "Promoting to master");
        role.set_master(true);
    }

    // Report progress until the index drains or we are interrupted
    let progress = async {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let pending = env.len(PRIMARY_INDEX_DB);
            let stats = handle.stats();
            info!(pending, reaped = stats.reaped, cycles = stats.cycles, "Progress");
            if pending == 0 {
                break;
            }
        }
    };

    tokio::select! {
        _ = progress => {
            info!("All keys expired");
        }
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutdown signal received, stopping reaper...");
        }
    }

    let stats = handle.shutdown().await;
    let env_stats = env.stats();
    info!(
        reaped = stats.reaped,
        superseded = stats.superseded,
        missing = stats.missing + stats.target_missing,
        batches = stats.batches,
        max_batch = stats.max_batch,
        commits = env_stats.commits,
        aborts = env_stats.aborts,
        "Shutdown complete"
    );
    Ok(())
}
