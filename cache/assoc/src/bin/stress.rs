//! Multi-threaded stress test for the primary key index.
//!
//! Worker threads insert, look up and delete keys under their bucket locks
//! while the maintenance thread grows the table underneath them. Every
//! lookup is checked against what the worker knows it linked, and the whole
//! table is verified once the workers stop.

use assoc::{AssocTable, EntryArena, EntryId, EntryStore, MaintenanceHandle};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "assoc-stress")]
#[command(about = "Concurrent stress test for the primary key index")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    general: GeneralConfig,
    #[serde(default)]
    assoc: assoc::Config,
    #[serde(default)]
    logging: LoggingConfig,
}

impl Config {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if config.general.threads == 0 {
            return Err("threads must be at least 1".into());
        }
        if config.general.keys < config.general.threads {
            return Err(format!(
                "keys ({}) must be at least threads ({})",
                config.general.keys, config.general.threads
            )
            .into());
        }
        config.assoc.validate()?;

        Ok(config)
    }
}

/// Workload settings.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneralConfig {
    /// Number of worker threads.
    #[serde(default = "default_threads")]
    threads: usize,
    /// Run time in seconds.
    #[serde(default = "default_duration")]
    duration: u64,
    /// Number of distinct keys, split evenly across workers.
    #[serde(default = "default_keys")]
    keys: usize,
    /// Percentage of operations on a linked key that delete it.
    #[serde(default = "default_delete_percent")]
    delete_percent: u8,
}

fn default_threads() -> usize {
    4
}

fn default_duration() -> u64 {
    10
}

fn default_keys() -> usize {
    1 << 20
}

fn default_delete_percent() -> u8 {
    10
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            duration: default_duration(),
            keys: default_keys(),
            delete_percent: default_delete_percent(),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default)]
    format: LogFormat,
    #[serde(default = "default_true")]
    timestamps: bool,
    #[serde(default = "default_true")]
    thread_names: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: true,
        }
    }
}

/// RUST_LOG takes precedence over the configured level.
fn init_logging(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);
    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry
            .with(fmt::layer().with_thread_names(config.thread_names))
            .init(),
        (LogFormat::Pretty, false) => registry
            .with(
                fmt::layer()
                    .with_thread_names(config.thread_names)
                    .without_time(),
            )
            .init(),
        (LogFormat::Json, true) => registry
            .with(fmt::layer().json().with_thread_names(config.thread_names))
            .init(),
        (LogFormat::Json, false) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_thread_names(config.thread_names)
                    .without_time(),
            )
            .init(),
        (LogFormat::Compact, true) => registry
            .with(fmt::layer().compact().with_thread_names(config.thread_names))
            .init(),
        (LogFormat::Compact, false) => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_thread_names(config.thread_names)
                    .without_time(),
            )
            .init(),
    }
}

fn main() {
    let args = Args::parse();

    let config = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    init_logging(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

type Table = AssocTable<EntryArena>;

/// State shared between workers and the reporting loop.
struct Shared {
    running: AtomicBool,
    items: AtomicU64,
    ops: AtomicU64,
    errors: AtomicU64,
}

fn make_key(i: usize) -> Vec<u8> {
    format!("key:{:016x}", i).into_bytes()
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let general = &config.general;
    tracing::info!(
        threads = general.threads,
        duration = general.duration,
        keys = general.keys,
        hash_power = config.assoc.initial_power(),
        "starting stress test"
    );

    let store = EntryArena::with_capacity(general.keys);
    let table = Arc::new(AssocTable::new(config.assoc.clone(), store)?);
    let maintenance = MaintenanceHandle::start(table.clone())?;

    let shared = Arc::new(Shared {
        running: AtomicBool::new(true),
        items: AtomicU64::new(0),
        ops: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });

    let per_worker = general.keys / general.threads;
    let mut handles = Vec::with_capacity(general.threads);
    for id in 0..general.threads {
        let table = table.clone();
        let shared = shared.clone();
        let keys = id * per_worker..(id + 1) * per_worker;
        let delete_percent = general.delete_percent;

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || run_worker(id, &table, &shared, keys, delete_percent))?;
        handles.push(handle);
    }

    let start = Instant::now();
    let duration = Duration::from_secs(general.duration);
    let mut last_ops = 0;
    while start.elapsed() < duration {
        thread::sleep(Duration::from_secs(1));
        let ops = shared.ops.load(Ordering::Relaxed);
        let stats = table.stats();
        tracing::info!(
            ops_per_sec = ops - last_ops,
            items = shared.items.load(Ordering::Relaxed),
            hash_power = stats.hash_power_level,
            hash_bytes = stats.hash_bytes,
            expanding = stats.hash_is_expanding,
            "progress"
        );
        last_ops = ops;
    }

    shared.running.store(false, Ordering::SeqCst);
    let mut linked = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(keys) => linked.extend(keys),
            Err(_) => return Err("worker thread panicked".into()),
        }
    }
    maintenance.stop();

    verify(&table, &linked)?;

    let errors = shared.errors.load(Ordering::Relaxed);
    if errors > 0 {
        return Err(format!("{errors} lookups returned the wrong entry").into());
    }

    let stats = table.stats();
    tracing::info!(
        ops = shared.ops.load(Ordering::Relaxed),
        items = linked.len(),
        hash_power = stats.hash_power_level,
        "stress test passed"
    );
    Ok(())
}

/// Churn the worker's own key range. Returns the keys left linked.
fn run_worker(
    id: usize,
    table: &Table,
    shared: &Shared,
    keys: std::ops::Range<usize>,
    delete_percent: u8,
) -> Vec<(usize, EntryId)> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42 + id as u64);
    let mut linked: Vec<Option<EntryId>> = vec![None; keys.len()];

    while shared.running.load(Ordering::Relaxed) {
        let slot = rng.gen_range(0..linked.len());
        let key = make_key(keys.start + slot);
        let hv = assoc::hash(&key);

        let guard = table.lock(hv);
        let found = table.find(&key, hv);
        if found != linked[slot] {
            shared.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(key = keys.start + slot, "lookup mismatch");
        }

        match linked[slot] {
            Some(id) if rng.gen_range(0..100) < delete_percent => {
                if table.delete(&key, hv) == Some(id) {
                    drop(guard);
                    table.store().free(id);
                    linked[slot] = None;
                    shared.items.fetch_sub(1, Ordering::Relaxed);
                } else {
                    shared.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(_) => {}
            None => {
                if let Some(id) = table.store().alloc(&key, hv) {
                    table.insert(id, hv);
                    drop(guard);
                    linked[slot] = Some(id);
                    let items = shared.items.fetch_add(1, Ordering::Relaxed) + 1;
                    table.start_expand(items);
                }
            }
        }

        shared.ops.fetch_add(1, Ordering::Relaxed);
    }

    linked
        .into_iter()
        .enumerate()
        .filter_map(|(slot, id)| id.map(|id| (keys.start + slot, id)))
        .collect()
}

/// Every linked key is findable, and the table holds nothing else.
fn verify(table: &Table, linked: &[(usize, EntryId)]) -> Result<(), Box<dyn std::error::Error>> {
    let iterated = table.iter().count();
    if iterated != linked.len() {
        return Err(format!(
            "iteration found {iterated} entries, expected {}",
            linked.len()
        )
        .into());
    }

    for (index, id) in linked {
        let key = make_key(*index);
        let hv = assoc::hash(&key);
        let _guard = table.lock(hv);
        if table.find(&key, hv) != Some(*id) {
            return Err(format!("key {index} lost").into());
        }
        if table.store().hash(*id) != hv {
            return Err(format!("key {index} has a corrupt hash").into());
        }
    }

    Ok(())
}
