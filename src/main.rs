use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use memtune::{
    config::defaults::DEFAULT_TICK_INTERVAL_MS,
    pool::{buffer_factory, shared_array_pool},
    system_clock, BucketArrayPool, CollectionScheduler, MemoryProfiler, MemtuneConfig, PoolOptions,
    PooledBuffer, ProcessMemorySource, ResourcePool, WorkloadType,
};

const STATUS_BUFFER_CLASS: &str = "status_line";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("memtune")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Watch process memory with an adaptive collection scheduler and profiler")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("workload")
                .short('w')
                .long("workload")
                .value_name("TYPE")
                .help("Threshold preset: web_request|batch_processing|long_running|memory_intensive|default"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .value_name("MS")
                .help("Tick interval in milliseconds (default 1000)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("ticks")
                .long("ticks")
                .value_name("N")
                .help("Stop after N ticks instead of waiting for Ctrl-C")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("Print the effective configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let config = MemtuneConfig::load(config_path.as_deref())?;

    // Reports go to stdout, logs to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if matches.get_flag("print-config") {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let clock = system_clock();
    let ceiling = config.memory_ceiling()?;
    let memory = Arc::new(ProcessMemorySource::new(ceiling).context("Process memory is not observable")?);
    info!("Monitoring process memory (ceiling: {:?} bytes)", ceiling);

    let mut scheduler = CollectionScheduler::new(config.scheduler.clone(), memory.clone(), clock.clone())?;
    if let Some(workload) = matches.get_one::<String>("workload") {
        let workload: WorkloadType = workload.parse()?;
        scheduler.optimize_for(workload);
        info!("Applied '{}' threshold preset", workload);
    }

    let mut profiler = MemoryProfiler::new(config.profiler.clone(), memory, clock.clone())?;
    profiler.snapshot("startup");

    let array_pool = shared_array_pool(BucketArrayPool::new(&config.array_pool)?);
    let mut pool = ResourcePool::new(config.pool.clone(), clock.clone());
    pool.register_with_factory(STATUS_BUFFER_CLASS, PoolOptions::max_size(4), buffer_factory(array_pool))?;

    let interval_ms = matches.get_one::<u64>("interval-ms").copied().unwrap_or(DEFAULT_TICK_INTERVAL_MS);
    let max_ticks = matches.get_one::<u64>("ticks").copied();
    let cleanup_every = (config.pool.cleanup_interval().as_millis() as u64 / interval_ms.max(1)).max(1);

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, writing reports");
                break;
            }
        }
        ticks += 1;

        if let Some(outcome) = scheduler.tick() {
            debug!(
                "Collection pass: {} collected in {:?}, skipped: {}",
                outcome.collected, outcome.duration, outcome.skipped
            );
        }
        if let Some(delta) = profiler.observe_memory_delta() {
            debug!("Memory grew by {} bytes since the last tick", delta);
        }
        if profiler.check_memory_limit(Some(&mut scheduler)) {
            warn!("Memory usage is close to the configured ceiling");
        }
        if ticks % cleanup_every == 0 {
            let report = pool.cleanup();
            if report.evicted > 0 {
                debug!("Pool cleanup evicted {} buffers", report.evicted);
            }
        }

        let mut line = pool.acquire_registered::<PooledBuffer>(STATUS_BUFFER_CLASS)?;
        line.append("tick ")
            .append(&ticks.to_string())
            .append(": state=")
            .append(&format!("{:?}", scheduler.state()))
            .append(" runs=")
            .append(&scheduler.metrics().runs.to_string());
        debug!("{}", *line);
        pool.release(line);

        if max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }
    }

    profiler.snapshot("shutdown");
    let reports = serde_json::json!({
        "scheduler": scheduler.report(),
        "profiler": profiler.generate_report(),
        "pool": pool.stats(None),
    });
    println!("{}", serde_json::to_string_pretty(&reports)?);

    Ok(())
}
