use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hyperpool::{PoolConfig, ProcessPool, Registry, ThreadPool, Value};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "hyperpool-bench.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    tasks: usize,
    work: u64,
    pool: PoolConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            tasks: 10_000,
            work: 1_000,
            pool: PoolConfig::default(),
        }
    }
}

fn spin(seed: u64, rounds: u64) -> u64 {
    let mut acc = seed;
    for i in 0..rounds {
        acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
    }
    acc
}

fn registry(work: u64) -> Registry {
    let mut registry = Registry::new();
    registry.register_fn("spin", move |args| {
        let seed = args.first().and_then(Value::as_int).unwrap_or(0);
        Ok(Value::Int(spin(seed as u64, work) as i64))
    });
    registry
}

fn report(name: &str, tasks: usize, start: Instant) {
    let duration = start.elapsed();
    let per_sec = (tasks as f64) / duration.as_secs_f64();
    println!(
        "{}: {:#?} tasks/s. Total time: {:#?}",
        name, per_sec as u64, duration
    );
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();
    let mut cfg: BenchConfig = confy::load_path(&opts.config)
        .with_context(|| format!("loading {}", opts.config))?;
    hyperpool::bootstrap(&registry(cfg.work));

    // Workers re-run this binary and must load the same config.
    cfg.pool.launch.args = vec!["-c".to_string(), opts.config.clone()];
    let work = cfg.work;
    info!(tasks = cfg.tasks, work, size = cfg.pool.pool_size, "starting benchmark");
    let items: Vec<i64> = (0..cfg.tasks as i64).collect();

    let threads = ThreadPool::new(cfg.pool.clone())?;
    let start = Instant::now();
    let out = threads.map(move |x: i64| spin(x as u64, work), items.clone())?;
    report("thread pool", out.len(), start);
    threads.shutdown(true)?;

    let processes = ProcessPool::new(cfg.pool, Arc::new(registry(work)))?;
    let start = Instant::now();
    let out = processes.map("spin", items)?;
    report("process pool", out.len(), start);
    processes.shutdown(true)?;
    Ok(())
}
