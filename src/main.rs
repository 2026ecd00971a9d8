//! fetchstash - fetch JSON resources through a persistent response cache
//!
//! Each invocation restores the cache from disk, runs one command, and flushes
//! on the way out.

use std::error::Error;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use fetchstash::cli::{Cli, Command, StartupConfig};
use fetchstash::{
    FileStorage, HttpFetcher, KeyedStore, NetworkStatus, RequestCoordinator, RequestOptions,
};

/// Installs a stderr log subscriber. `RUST_LOG` wins over `--log-level`.
fn setup_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Cache key for a GET of `url`
fn request_key(url: &str) -> String {
    format!("GET {}", url)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    let config = StartupConfig::from_cli(&cli)?;
    let storage = Arc::new(FileStorage::new(config.cache_dir.clone()));
    let store: Arc<KeyedStore<Value>> =
        Arc::new(KeyedStore::with_storage(config.cache.clone(), storage));
    store.init();

    let result = run(&cli.command, &store, &config).await;

    // Flush even when the command failed
    store.shutdown();
    result
}

async fn run(
    command: &Command,
    store: &Arc<KeyedStore<Value>>,
    config: &StartupConfig,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Get {
            url,
            ttl,
            no_cache,
            offline,
            stale_on_error,
        } => {
            let network = NetworkStatus::new();
            network.set_online(!offline);
            let coordinator = RequestCoordinator::with_connectivity(store.clone(), Arc::new(network));

            let mut options = RequestOptions::default();
            if let Some(ttl) = ttl {
                options = options.with_ttl(*ttl);
            }
            if *no_cache {
                options = options.no_cache();
            }
            if *stale_on_error {
                options = options.with_stale_on_error();
            }

            let executor = HttpFetcher::new().executor::<Value>(url.clone());
            let value = coordinator
                .request(&request_key(url), executor, options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::List => {
            for key in store.keys() {
                if let Some(cached) = store.peek(&key) {
                    println!(
                        "{}\texpires {}",
                        key,
                        cached
                            .expires_at
                            .with_timezone(&Local)
                            .format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        Command::Invalidate { key, prefix } => {
            let removed = if *prefix {
                store.remove_prefix(key)
            } else {
                usize::from(store.remove(key))
            };
            println!("Removed {} entries", removed);
        }
        Command::Purge => {
            let count = store.len();
            store.clear();
            println!("Removed {} entries", count);
        }
        Command::Stats => {
            println!("directory: {}", config.cache_dir.display());
            println!("namespace: {}", config.cache.namespace);
            let stats = store.stats();
            println!("entries: {}", stats.entries);
            println!("hits: {}", stats.hits);
            println!("misses: {}", stats.misses);
            println!("expirations: {}", stats.expirations);
        }
    }
    Ok(())
}
