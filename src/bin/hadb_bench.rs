//! HADB Bench Binary
//!
//! Drives one engine over a SQLite file with concurrent write transactions,
//! memory lookups and fast updates, then verifies the mirror against the
//! store.
//!
//! # Examples
//!
//! ```bash
//! # Default run: 1000 objects, 10 concurrent tasks
//! cargo run --release --bin hadb_bench
//!
//! # Heavier fast update load with a write ceiling
//! cargo run --release --bin hadb_bench -- --objects 5000 --fast-updates 20 --max-writes 4
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hadb::{
    ConfigValue, DynamicConfig, EngineOptions, Error, Hadb, IndexFields, SqliteStore, TxnOptions,
    UserRecord,
};

#[derive(Parser, Debug)]
#[command(name = "hadb_bench")]
#[command(about = "Concurrent load generator and consistency check for HADB")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Objects to create
    #[arg(short, long, default_value_t = 1000)]
    objects: usize,

    /// Concurrent tasks
    #[arg(short, long, default_value_t = 10)]
    concurrency: usize,

    /// Fast updates per object
    #[arg(short, long, default_value_t = 5)]
    fast_updates: usize,

    /// Global write transaction ceiling (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_writes: i64,

    /// Parallel flush connections
    #[arg(long, default_value_t = 2)]
    flush_connections: usize,

    /// Database path (default: temp file)
    #[arg(short, long)]
    db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Bench record: one host per object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Host {
    name: String,
    zone: String,
    hits: u64,
}

impl UserRecord for Host {
    fn type_name(&self) -> &str {
        "Host"
    }

    fn keys(&self) -> IndexFields {
        IndexFields::new([&self.name])
    }

    fn labels(&self) -> IndexFields {
        IndexFields::new([&self.zone])
    }

    fn max_archive_count(&self) -> usize {
        2
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    rejected: AtomicU64,
    fast_updates: AtomicU64,
    lookups: AtomicU64,
    errors: AtomicU64,
}

#[tokio::main]
async fn main() -> hadb::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hadb={},hadb_bench={}", args.log_level, args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let temp_dir = std::env::temp_dir().join(format!("hadb-bench-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir)?;
    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| temp_dir.join("bench.db").to_string_lossy().to_string());

    info!(
        objects = args.objects,
        concurrency = args.concurrency,
        fast_updates = args.fast_updates,
        db = %db_path,
        "starting bench"
    );

    let options = EngineOptions {
        backup_dir: Some(temp_dir.join("backup")),
        flush_connections: args.flush_connections,
        initial_config: DynamicConfig {
            partial_reload_interval_ms: 500,
            fast_update_flush_interval_ms: 200,
            ..DynamicConfig::default()
        },
        ..EngineOptions::new("bench")
    };
    let hadb: Hadb<Host, SqliteStore> = Hadb::new(SqliteStore::open(&db_path)?, options);
    hadb.start();
    hadb.wait_ready(5).await?;
    hadb.set_config("max_write_txns", ConfigValue::Int(args.max_writes))
        .await?;

    let counters = Arc::new(Counters::default());
    let start = Instant::now();

    let concurrency = args.concurrency.max(1);
    let per_task = args.objects / concurrency;
    let mut handles = Vec::with_capacity(concurrency);
    for task_id in 0..concurrency {
        let hadb = hadb.clone();
        let counters = Arc::clone(&counters);
        let fast_updates = args.fast_updates;
        handles.push(tokio::spawn(async move {
            for i in 0..per_task {
                let name = format!("host-{task_id}-{i}");
                let zone = format!("zone-{}", i % 8);
                let created = hadb
                    .write(TxnOptions::new().client(format!("task-{task_id}")), |txn| {
                        let host = Host {
                            name: name.clone(),
                            zone: zone.clone(),
                            hits: 0,
                        };
                        async move { txn.add("default", host).await }.boxed()
                    })
                    .await;
                let created = match created {
                    Ok(obj) => obj,
                    Err(Error::AdmissionRejected { .. }) => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "write failed");
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                counters.created.fetch_add(1, Ordering::Relaxed);

                match hadb.search_by_key(&IndexFields::new([&name]), "Host", "default") {
                    Ok(Some(_)) => {
                        counters.lookups.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }

                for _ in 0..fast_updates {
                    let result = hadb.fast_update(&created.uid, |h| {
                        h.hits += 1;
                        true
                    });
                    match result {
                        Ok(_) => counters.fast_updates.fetch_add(1, Ordering::Relaxed),
                        Err(_) => counters.errors.fetch_add(1, Ordering::Relaxed),
                    };
                }
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "bench task panicked");
        }
    }
    let elapsed = start.elapsed();

    let report = hadb.flush_now().await?;
    info!(
        flushed = report.flushed,
        requeued = report.requeued,
        superseded = report.superseded,
        failed = report.failed,
        "flushed pending fast updates"
    );

    let created = counters.created.load(Ordering::Relaxed);
    println!();
    println!("Results");
    println!("-------");
    println!("Objects created:     {}", created);
    println!("Admission rejected:  {}", counters.rejected.load(Ordering::Relaxed));
    println!("Key lookups:         {}", counters.lookups.load(Ordering::Relaxed));
    println!("Fast updates:        {}", counters.fast_updates.load(Ordering::Relaxed));
    println!("Errors:              {}", counters.errors.load(Ordering::Relaxed));
    println!("Duration:            {:?}", elapsed);
    println!(
        "Throughput:          {:.2} objects/sec",
        created as f64 / elapsed.as_secs_f64()
    );
    println!();

    // A full reload rebuilds the mirror from the store; the hit counters must
    // survive it.
    println!("Verifying...");
    hadb.reload_now(true).await?;
    let counts = hadb.counts()?;
    let live = counts
        .get(&("Host".to_string(), "default".to_string()))
        .copied()
        .unwrap_or(0);
    println!("  Live objects in mirror: {}", live);

    let mut short = 0usize;
    for zone in 0..8 {
        let hosts = hadb.search_by_labels(&IndexFields::new([format!("zone-{zone}")]), "Host", "default")?;
        short += hosts
            .iter()
            .filter(|h| h.user_data.hits < args.fast_updates as u64)
            .count();
    }
    println!("  Objects missing fast updates: {}", short);

    let metrics = hadb.metrics();
    println!("  Deadlocks retried: {}", metrics.deadlocks);
    println!("  Pending after flush: {}", metrics.pending_fast_updates);

    hadb.dispose().await;

    if live as u64 != created || short != 0 {
        println!();
        println!("Bench FAILED");
        std::process::exit(1);
    }
    println!();
    println!("Bench PASSED");
    Ok(())
}
