//! Process pool scenarios. Runs without the libtest harness because the
//! test binary doubles as the worker executable.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context};
use tracing_subscriber::EnvFilter;

use hyperpool::{
    as_completed, Callable, HyperError, LocalObject, Lock, PoolConfig, PoolState, ProcessPool,
    Registry, Value,
};

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static INIT_VALUE: AtomicI64 = AtomicI64::new(0);

fn int(args: &[Value], i: usize) -> anyhow::Result<i64> {
    args.get(i)
        .and_then(Value::as_int)
        .with_context(|| format!("argument {} must be an int", i))
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_fn("square", |args| {
            let x = int(&args, 0)?;
            Ok(Value::Int(x * x))
        })
        .register_fn("add", |args| Ok(Value::Int(int(&args, 0)? + int(&args, 1)?)))
        .register_fn("pid", |_| Ok(Value::Int(i64::from(process::id()))))
        .register_fn("sleep", |args| {
            let ms = int(&args, 0)?;
            thread::sleep(Duration::from_millis(ms as u64));
            Ok(Value::Int(ms))
        })
        .register_fn("fail", |_| bail!("task refused"))
        .register_fn("panic", |_| panic!("task panicked"))
        .register_fn("abort", |_| process::abort())
        .register_fn("crash_once", |args| {
            let dir = args
                .first()
                .and_then(Value::as_str)
                .context("marker directory")?;
            let marker = Path::new(dir).join("crashed");
            if marker.exists() {
                return Ok(Value::from("recovered"));
            }
            std::fs::write(&marker, b"1")?;
            process::abort()
        })
        .register_fn("init", |_| {
            INITIALIZED.store(true, Ordering::SeqCst);
            Ok(Value::None)
        })
        .register_fn("initialized", |_| Ok(Value::Bool(INITIALIZED.load(Ordering::SeqCst))))
        .register_fn("init_with", |args| {
            INIT_VALUE.store(int(&args, 0)? * 10 + int(&args, 1)?, Ordering::SeqCst);
            Ok(Value::None)
        })
        .register_fn("init_value", |_| Ok(Value::Int(INIT_VALUE.load(Ordering::SeqCst))))
        .register_fn("locked_add", |args| {
            let shm = args
                .first()
                .and_then(Value::as_shared_memory)
                .context("shared memory handle")?;
            let lock = args.get(1).and_then(Value::as_sync).context("lock handle")?;
            let rounds = int(&args, 2)?;
            let block = shm.attach()?;
            let lock = Lock::open(lock)?;
            for _ in 0..rounds {
                block.write_locked(&lock, None, |bytes| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&bytes[..8]);
                    let next = u64::from_le_bytes(raw) + 1;
                    bytes[..8].copy_from_slice(&next.to_le_bytes());
                })?;
            }
            Ok(Value::None)
        });
    registry
}

fn pool(size: usize) -> anyhow::Result<ProcessPool> {
    let config = PoolConfig::builder().pool_size(size).build()?;
    Ok(ProcessPool::new(config, Arc::new(registry()))?)
}

fn map_keeps_input_order() -> anyhow::Result<()> {
    let pool = pool(3)?;
    let out = pool.map("square", vec![1, 2, 3, 4, 5])?;
    let ints: Vec<i64> = out.iter().filter_map(Value::as_int).collect();
    ensure!(ints == vec![1, 4, 9, 16, 25], "got {:?}", ints);

    let sums = pool.starmap(
        "add",
        vec![vec![1.into(), 2.into()], vec![10.into(), 20.into()]],
    )?;
    ensure!(sums == vec![Value::Int(3), Value::Int(30)], "got {:?}", sums);
    ensure!(pool.map("square", Vec::<i64>::new())?.is_empty());
    pool.shutdown(true)?;
    ensure!(pool.state() == PoolState::Closed);
    Ok(())
}

fn closures_carry_captured_arguments() -> anyhow::Result<()> {
    let pool = pool(2)?;
    let add_ten = Callable::closure("add", vec![Value::Int(10)]);
    let out = pool.map(add_ten, vec![1, 2])?;
    ensure!(out == vec![Value::Int(11), Value::Int(12)], "got {:?}", out);
    Ok(())
}

fn unordered_results_arrive_as_they_finish() -> anyhow::Result<()> {
    let pool = pool(2)?;
    let slow = pool.submit("sleep", vec![400.into()])?;
    let fast = pool.submit("sleep", vec![10.into()])?;
    let order: Vec<Value> = as_completed(vec![slow, fast])
        .map(|f| f.result(None))
        .collect::<hyperpool::Result<_>>()?;
    ensure!(order == vec![Value::Int(10), Value::Int(400)], "got {:?}", order);

    let mut all: Vec<i64> = pool
        .map_unordered("square", vec![3, 1, 2])?
        .map(|r| r.map(|v| v.as_int().unwrap_or(-1)))
        .collect::<hyperpool::Result<_>>()?;
    all.sort();
    ensure!(all == vec![1, 4, 9]);
    Ok(())
}

fn task_errors_reach_the_caller() -> anyhow::Result<()> {
    let pool = pool(1)?;
    match pool.apply("fail", vec![]) {
        Err(HyperError::TaskFailed(msg)) => ensure!(msg.contains("task refused"), "{}", msg),
        other => bail!("expected TaskFailed, got {:?}", other),
    }
    match pool.apply("panic", vec![]) {
        Err(HyperError::TaskFailed(msg)) => ensure!(msg.contains("task panicked"), "{}", msg),
        other => bail!("expected TaskFailed, got {:?}", other),
    }
    // The worker survives both.
    ensure!(pool.apply("square", vec![7.into()])? == Value::Int(49));
    Ok(())
}

fn unserializable_payloads_fail_at_submit() -> anyhow::Result<()> {
    let pool = pool(1)?;
    let local = Value::from(LocalObject::new(5u32));
    match pool.submit("square", vec![local]) {
        Err(HyperError::Unserializable(msg)) => ensure!(msg.contains("args[0]"), "{}", msg),
        other => bail!("expected Unserializable, got {:?}", other),
    }
    match pool.submit("not_registered", vec![]) {
        Err(HyperError::Unserializable(_)) => {}
        other => bail!("expected Unserializable, got {:?}", other),
    }
    // A batch with one bad item queues nothing.
    let batch = vec![Value::Int(1), Value::from(LocalObject::new(()))];
    ensure!(pool.map("square", batch).is_err());
    ensure!(pool.pending() == 0);
    Ok(())
}

fn crashed_task_is_requeued_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = pool(2)?;
    let dir_arg = Value::from(dir.path().to_string_lossy().into_owned());
    let out = pool.apply("crash_once", vec![dir_arg])?;
    ensure!(out == Value::from("recovered"), "got {:?}", out);
    // The pool keeps its full size after the crash.
    ensure!(pool.map("square", vec![2, 3])? == vec![Value::Int(4), Value::Int(9)]);
    Ok(())
}

fn repeated_crashes_fail_the_task() -> anyhow::Result<()> {
    let pool = pool(2)?;
    match pool.apply("abort", vec![]) {
        Err(HyperError::WorkerCrashed { attempts, .. }) => ensure!(attempts == 2, "{}", attempts),
        other => bail!("expected WorkerCrashed, got {:?}", other),
    }
    ensure!(pool.apply("square", vec![5.into()])? == Value::Int(25));
    Ok(())
}

fn slow_task_times_out_and_pool_recovers() -> anyhow::Result<()> {
    let config = PoolConfig::builder()
        .pool_size(1)
        .task_timeout(Duration::from_millis(300))
        .build()?;
    let pool = ProcessPool::new(config, Arc::new(registry()))?;
    let started = Instant::now();
    match pool.apply("sleep", vec![5_000.into()]) {
        Err(HyperError::Timeout) => {}
        other => bail!("expected Timeout, got {:?}", other),
    }
    ensure!(started.elapsed() < Duration::from_secs(4));
    ensure!(pool.apply("square", vec![6.into()])? == Value::Int(36));
    Ok(())
}

fn workers_are_recycled_after_max_tasks() -> anyhow::Result<()> {
    let config = PoolConfig::builder()
        .pool_size(1)
        .max_tasks_per_worker(2)
        .build()?;
    let pool = ProcessPool::new(config, Arc::new(registry()))?;
    let mut pids = HashSet::new();
    for _ in 0..6 {
        pids.insert(pool.apply("pid", vec![])?.as_int().context("pid")?);
    }
    ensure!(pids.len() == 3, "saw {} workers", pids.len());
    Ok(())
}

fn initializer_runs_in_every_worker() -> anyhow::Result<()> {
    let config = PoolConfig::builder().pool_size(2).build()?;
    let pool = ProcessPool::with_initializer(config, Arc::new(registry()), "init")?;
    let seen = pool.map("initialized", vec![(); 4])?;
    ensure!(seen.iter().all(|v| *v == Value::Bool(true)), "got {:?}", seen);
    // The parent never ran it.
    ensure!(!INITIALIZED.load(Ordering::SeqCst));
    Ok(())
}

fn initializer_receives_its_arguments() -> anyhow::Result<()> {
    let config = PoolConfig::builder().pool_size(2).build()?;
    let init = Callable::closure("init_with", vec![Value::Int(4), Value::Int(2)]);
    let pool = ProcessPool::with_initializer(config, Arc::new(registry()), init)?;
    let seen = pool.map("init_value", vec![(); 4])?;
    ensure!(seen.iter().all(|v| *v == Value::Int(42)), "got {:?}", seen);
    Ok(())
}

fn map_async_returns_one_ordered_future() -> anyhow::Result<()> {
    let pool = pool(3)?;
    let all = pool.map_async("sleep", vec![120, 10, 60, 30])?;
    let (tx, rx) = crossbeam_channel::unbounded();
    all.on_done(move |id| {
        let _ = tx.send(id);
    });
    ensure!(!all.done());
    let id = rx
        .recv_timeout(Duration::from_secs(10))
        .context("completion callback never ran")?;
    ensure!(id == all.id());
    let out = all.result(None)?;
    ensure!(out == vec![Value::Int(120), Value::Int(10), Value::Int(60), Value::Int(30)], "got {:?}", out);

    let failing = pool.map_async("fail", vec![(); 2])?;
    match failing.result(Some(Duration::from_secs(10))) {
        Err(HyperError::TaskFailed(_)) => Ok(()),
        other => bail!("expected TaskFailed, got {:?}", other),
    }
}

fn shutdown_waits_for_queued_tasks() -> anyhow::Result<()> {
    let pool = pool(2)?;
    let futures = (0..6)
        .map(|_| pool.submit("sleep", vec![100.into()]))
        .collect::<hyperpool::Result<Vec<_>>>()?;
    pool.shutdown(true)?;
    ensure!(pool.state() == PoolState::Closed);
    for f in &futures {
        ensure!(f.done(), "task {} unresolved after shutdown", f.id());
        ensure!(f.result(None)? == Value::Int(100));
    }
    Ok(())
}

fn shutdown_resolves_every_future() -> anyhow::Result<()> {
    let pool = pool(2)?;
    let futures = (0..10)
        .map(|_| pool.submit("sleep", vec![50.into()]))
        .collect::<hyperpool::Result<Vec<_>>>()?;
    pool.shutdown(false)?;
    let mut cancelled = 0;
    for f in &futures {
        ensure!(f.wait(Some(Duration::from_secs(10))), "task {} never resolved", f.id());
        if f.cancelled() {
            cancelled += 1;
        }
    }
    ensure!(cancelled > 0);
    match pool.submit("square", vec![1.into()]) {
        Err(HyperError::PoolClosed) => Ok(()),
        other => bail!("expected PoolClosed, got {:?}", other),
    }
}

fn unspawnable_pool_is_degraded() -> anyhow::Result<()> {
    let config = PoolConfig::builder()
        .pool_size(2)
        .spawn_retries(1)
        .program("/nonexistent/hyperpool-worker")
        .build()?;
    let pool = ProcessPool::new(config, Arc::new(registry()))?;
    match pool.submit("square", vec![1.into()]) {
        Err(HyperError::PoolDegraded(_)) => {}
        other => bail!("expected PoolDegraded, got {:?}", other),
    }
    pool.shutdown(true)?;
    Ok(())
}

fn workers_share_memory_under_a_lock() -> anyhow::Result<()> {
    let pool = pool(4)?;
    let block = pool.shared_memory().allocate(8)?;
    block.write_at(0, &0u64.to_le_bytes())?;
    let lock = Lock::new()?;
    let calls = (0..4).map(|_| {
        vec![
            Value::from(block.handle()),
            Value::from(lock.handle()),
            Value::Int(250),
        ]
    });
    pool.starmap("locked_add", calls)?;
    let mut raw = [0u8; 8];
    block.read_at(0, &mut raw)?;
    ensure!(u64::from_le_bytes(raw) == 1_000, "counter is {}", u64::from_le_bytes(raw));

    let infos = pool.workers();
    ensure!(infos.iter().all(|w| w.pid.is_some()));
    ensure!(infos.iter().map(|w| w.tasks_completed).sum::<u64>() >= 4);

    let name = block.name().to_string();
    pool.shutdown(true)?;
    ensure!(pool.shared_memory().allocated() == 0);
    ensure!(hyperpool::SharedMemoryBlock::attach(&name).is_err());
    Ok(())
}

type Case = fn() -> anyhow::Result<()>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    hyperpool::bootstrap(&registry());

    let cases: &[(&str, Case)] = &[
        ("map_keeps_input_order", map_keeps_input_order),
        ("closures_carry_captured_arguments", closures_carry_captured_arguments),
        ("unordered_results_arrive_as_they_finish", unordered_results_arrive_as_they_finish),
        ("task_errors_reach_the_caller", task_errors_reach_the_caller),
        ("unserializable_payloads_fail_at_submit", unserializable_payloads_fail_at_submit),
        ("crashed_task_is_requeued_once", crashed_task_is_requeued_once),
        ("repeated_crashes_fail_the_task", repeated_crashes_fail_the_task),
        ("slow_task_times_out_and_pool_recovers", slow_task_times_out_and_pool_recovers),
        ("workers_are_recycled_after_max_tasks", workers_are_recycled_after_max_tasks),
        ("initializer_runs_in_every_worker", initializer_runs_in_every_worker),
        ("initializer_receives_its_arguments", initializer_receives_its_arguments),
        ("map_async_returns_one_ordered_future", map_async_returns_one_ordered_future),
        ("shutdown_waits_for_queued_tasks", shutdown_waits_for_queued_tasks),
        ("shutdown_resolves_every_future", shutdown_resolves_every_future),
        ("unspawnable_pool_is_degraded", unspawnable_pool_is_degraded),
        ("workers_share_memory_under_a_lock", workers_share_memory_under_a_lock),
    ];

    let mut failed = 0;
    for (name, case) in cases {
        match panic::catch_unwind(AssertUnwindSafe(case)) {
            Ok(Ok(())) => println!("test {} ... ok", name),
            Ok(Err(e)) => {
                println!("test {} ... FAILED: {:#}", name, e);
                failed += 1;
            }
            Err(_) => {
                println!("test {} ... FAILED: panicked", name);
                failed += 1;
            }
        }
    }
    println!("\n{} passed; {} failed", cases.len() - failed, failed);
    if failed > 0 {
        process::exit(1);
    }
}
