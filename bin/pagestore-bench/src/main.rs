//! pagestore-bench - concurrent workload driver
//!
//! Opens a set of paged storages over one shared lock context and hammers
//! them with random typed reads and writes from several threads. Every
//! thread owns a disjoint set of value slots and verifies what it reads
//! back, so lost writes (for example a dirty page dropped on eviction) show
//! up as mismatches. Cache, channel and file I/O statistics are printed at
//! the end.

use anyhow::{Context, Result, bail};
use clap::Parser;
use pagestore_common::Config;
use pagestore_storage::{PagedFileStorage, StorageLockContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Width of one value slot
const SLOT: u64 = 8;

#[derive(Parser, Debug)]
#[command(name = "pagestore-bench")]
#[command(about = "Concurrent workload driver for pagestore")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "pagestore-bench.toml")]
    config: String,

    /// Directory for the storage files (default: a fresh dir under the system temp dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Number of storage files
    #[arg(long, default_value = "4")]
    storages: usize,

    /// Number of worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Operations per thread
    #[arg(long, default_value = "100000")]
    ops: u64,

    /// Size of each storage file in pages
    #[arg(long, default_value = "64")]
    pages: u64,

    /// Page size override in bytes
    #[arg(long)]
    page_size: Option<usize>,

    /// Shared cache capacity override in MiB
    #[arg(long)]
    cache_mb: Option<usize>,

    /// Keep values within a page (aligned fast path)
    #[arg(long)]
    aligned: bool,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Keep the storage files after the run
    #[arg(long)]
    keep: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(flatten)]
    engine: Config,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default)]
    level: Option<String>,
}

#[derive(Debug, Default)]
struct WorkerReport {
    reads: u64,
    writes: u64,
    forces: u64,
    mismatches: u64,
}

fn load_config(path: &str) -> Result<FileConfig> {
    if !Path::new(path).exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path}"))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {path}"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file_config = load_config(&args.config)?;

    // CLI takes precedence over the config file
    let log_level = match file_config.logging.level {
        Some(level) if args.log_level == "info" => level,
        _ => args.log_level.clone(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = file_config.engine;
    if let Some(page_size) = args.page_size {
        config.storage.page_size = page_size;
    }
    if let Some(cache_mb) = args.cache_mb {
        config.cache.capacity_bytes = cache_mb * 1024 * 1024;
    }
    config.storage.values_aligned |= args.aligned;
    config.storage.read_only = false;
    config.validate()?;

    if args.storages == 0 || args.threads == 0 || args.pages == 0 {
        bail!("--storages, --threads and --pages must be positive");
    }

    let dir = args
        .dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("pagestore-bench-{}", std::process::id())));
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let page_size = config.storage.effective_page_size() as u64;
    let file_bytes = args.pages * page_size;
    info!("Starting pagestore bench");
    info!("Config file: {}", args.config);
    info!("Directory: {}", dir.display());
    info!(
        "{} storage(s) of {} pages x {} bytes, {} thread(s) x {} ops, aligned {}",
        args.storages, args.pages, page_size, args.threads, args.ops, config.storage.values_aligned
    );
    info!("Cache capacity: {} MB", config.cache.capacity_bytes / 1024 / 1024);

    let context = Arc::new(StorageLockContext::from_config(&config.cache));
    let storages = (0..args.storages)
        .map(|i| {
            PagedFileStorage::open(
                dir.join(format!("storage-{i}.dat")),
                &config.storage,
                Some(context.clone()),
            )
        })
        .collect::<pagestore_common::Result<Vec<_>>>()?;

    let started = Instant::now();
    for storage in &storages {
        storage.resize(file_bytes)?;
        storage.force()?;
    }
    info!("Zero-filled storages in {:?}", started.elapsed());

    // Unaligned runs shift every slot so values straddle page boundaries
    let shift = if config.storage.values_aligned { 0 } else { 3 };
    let slots = (file_bytes - shift) / SLOT;

    let started = Instant::now();
    let reports = std::thread::scope(|s| {
        let handles: Vec<_> = (0..args.threads)
            .map(|worker| {
                let storages = &storages;
                let seed = args.seed.wrapping_add(worker as u64);
                let threads = args.threads as u64;
                let ops = args.ops;
                s.spawn(move || {
                    run_worker(storages, worker as u64, threads, slots, shift, ops, seed)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(report) => report,
                Err(_) => Err(anyhow::anyhow!("worker thread panicked")),
            })
            .collect::<Vec<_>>()
    });
    let elapsed = started.elapsed();

    let mut total = WorkerReport::default();
    for report in reports {
        let report = report?;
        total.reads += report.reads;
        total.writes += report.writes;
        total.forces += report.forces;
        total.mismatches += report.mismatches;
    }

    print_report(&total, elapsed, &context, &storages);

    let mut close_failed = false;
    for storage in &storages {
        if let Err(e) = storage.close() {
            error!("Failed to close {}: {}", storage.path().display(), e);
            close_failed = true;
        }
    }
    if !args.keep {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }

    if total.mismatches > 0 {
        bail!("{} read(s) returned unexpected values", total.mismatches);
    }
    if close_failed {
        bail!("some storages failed to close");
    }
    Ok(())
}

fn run_worker(
    storages: &[PagedFileStorage],
    worker: u64,
    threads: u64,
    slots: u64,
    shift: u64,
    ops: u64,
    seed: u64,
) -> Result<WorkerReport> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut expected: HashMap<(usize, u64), i64> = HashMap::new();
    let mut report = WorkerReport::default();
    let owned = (slots + threads - 1 - worker) / threads;
    if owned == 0 {
        return Ok(report);
    }

    for _ in 0..ops {
        let index = rng.gen_range(0..storages.len());
        let storage = &storages[index];
        let slot = rng.gen_range(0..owned) * threads + worker;
        let addr = shift + slot * SLOT;

        if rng.gen_bool(0.5) {
            let value = rng.gen_range(i64::MIN..i64::MAX);
            storage.put_long(addr, value)?;
            expected.insert((index, slot), value);
            report.writes += 1;
        } else {
            let value = storage.get_long(addr)?;
            let want = expected.get(&(index, slot)).copied().unwrap_or(0);
            if value != want {
                error!(
                    "Mismatch in {} at {}: read {:#x}, expected {:#x}",
                    storage.path().display(),
                    addr,
                    value,
                    want
                );
                report.mismatches += 1;
            }
            report.reads += 1;
        }

        if rng.gen_ratio(1, 10_000) {
            storage.force()?;
            report.forces += 1;
        }
    }
    Ok(report)
}

fn print_report(
    report: &WorkerReport,
    elapsed: Duration,
    context: &StorageLockContext,
    storages: &[PagedFileStorage],
) {
    let ops = report.reads + report.writes;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("=== pagestore-bench ===");
    println!(
        "ops: {} ({} reads, {} writes, {} forces) in {:.2?} -> {:.0} ops/s",
        ops,
        report.reads,
        report.writes,
        report.forces,
        elapsed,
        ops as f64 / secs
    );

    let cache = context.buffer_cache();
    let stats = cache.stats();
    println!(
        "page cache: {} resident, hit ratio {:.3}, hits {}, fast hits {}, misses {}, evictions {}, write-backs {}, overflows {}",
        cache.len(),
        stats.hit_ratio(),
        stats.hits.load(Ordering::Relaxed),
        stats.fast_cache_hits.load(Ordering::Relaxed),
        stats.misses.load(Ordering::Relaxed),
        stats.evictions.load(Ordering::Relaxed),
        stats.writebacks.load(Ordering::Relaxed),
        stats.overflows.load(Ordering::Relaxed),
    );

    let channels = context.channel_cache().stats();
    println!(
        "channels: {} pooled, hits {}, opens {}, uncached opens {}, evictions {}",
        context.channel_cache().len(),
        channels.hits.load(Ordering::Relaxed),
        channels.opens.load(Ordering::Relaxed),
        channels.uncached_opens.load(Ordering::Relaxed),
        channels.evictions.load(Ordering::Relaxed),
    );

    let (mut page_reads, mut page_writes, mut bytes_read, mut bytes_written) = (0, 0, 0, 0);
    for storage in storages {
        let io = storage.io_stats();
        page_reads += io.page_reads.load(Ordering::Relaxed);
        page_writes += io.page_writes.load(Ordering::Relaxed);
        bytes_read += io.bytes_read.load(Ordering::Relaxed);
        bytes_written += io.bytes_written.load(Ordering::Relaxed);
    }
    println!(
        "file I/O: {page_reads} page reads ({} MB), {page_writes} page writes ({} MB)",
        bytes_read / 1024 / 1024,
        bytes_written / 1024 / 1024
    );
}
