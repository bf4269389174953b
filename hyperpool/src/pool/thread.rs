use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    as_completed, collect_ordered, gather, pair, panic_message, with_retries, Abort, Future, PoolState, TaskId,
    WorkerInfo, WorkerState,
};
use crate::config::PoolConfig;
use crate::errors::{HyperError, Result};
use crate::queue::TaskQueue;

type Initializer = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct Job {
    id: TaskId,
    run: Box<dyn FnOnce() + Send>,
    abort: Arc<dyn Abort>,
}

struct Table {
    state: PoolState,
    workers: Vec<WorkerInfo>,
    handles: Vec<JoinHandle<()>>,
    live: usize,
    degraded: Option<String>,
}

struct Shared {
    config: PoolConfig,
    initializer: Option<Initializer>,
    queue: TaskQueue<Job>,
    table: Mutex<Table>,
    next_id: AtomicU64,
}

/// Runs closures on a fixed set of threads in this process.
///
/// Tasks share memory with the caller, so nothing is serialized and
/// [`crate::Value::Local`] payloads are fine here. A panicking task
/// resolves its future with `TaskFailed` and the thread keeps serving.
/// `task_timeout` is not enforced: a thread cannot be killed.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Result<ThreadPool> {
        ThreadPool::start(config, None)
    }

    /// Like [`ThreadPool::new`], running `init` once on every worker thread
    /// before it takes tasks. A thread whose initializer fails is dead.
    pub fn with_initializer<I>(config: PoolConfig, init: I) -> Result<ThreadPool>
    where
        I: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        ThreadPool::start(config, Some(Arc::new(init)))
    }

    fn start(config: PoolConfig, initializer: Option<Initializer>) -> Result<ThreadPool> {
        config.validate()?;
        let size = config.pool_size;
        let shared = Arc::new(Shared {
            initializer,
            queue: TaskQueue::new(),
            table: Mutex::new(Table {
                state: PoolState::Created,
                workers: (0..size).map(WorkerInfo::new).collect(),
                handles: Vec::with_capacity(size),
                live: 0,
                degraded: None,
            }),
            next_id: AtomicU64::new(0),
            config,
        });
        for slot in 0..size {
            if let Err(e) = spawn_worker(&shared, slot, false) {
                shared.queue.close();
                join_all(&shared);
                return Err(e);
            }
        }
        shared.table.lock().state = PoolState::Running;
        info!(size, "thread pool started");
        Ok(ThreadPool { shared })
    }

    pub fn submit<F, T>(&self, f: F) -> Result<Future<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let table = self.shared.table.lock();
        if let Some(reason) = &table.degraded {
            return Err(HyperError::PoolDegraded(reason.clone()));
        }
        if table.state != PoolState::Running {
            return Err(HyperError::PoolClosed);
        }
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (future, promise) = pair::<T>(id);
        let promise = Arc::new(promise);
        let resolver = promise.clone();
        let run = Box::new(move || {
            if !resolver.set_running() {
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|p| HyperError::TaskFailed(panic_message(p.as_ref())));
            resolver.resolve(outcome);
        });
        self.shared.queue.put(Job {
            id,
            run,
            abort: promise,
        })?;
        Ok(future)
    }

    /// Submit and wait for the value.
    pub fn apply<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(f)?.result(None)
    }

    /// Apply `f` to every item. Results come back in input order.
    pub fn map<F, A, T, I>(&self, f: F, items: I) -> Result<Vec<T>>
    where
        F: Fn(A) -> T + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + 'static,
        I: IntoIterator<Item = A>,
    {
        collect_ordered(self.submit_all(f, items)?)
    }

    /// Like [`ThreadPool::map`] without blocking: the returned future
    /// resolves with every result in input order.
    pub fn map_async<F, A, T, I>(&self, f: F, items: I) -> Result<Future<Vec<T>>>
    where
        F: Fn(A) -> T + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + 'static,
        I: IntoIterator<Item = A>,
    {
        let futures = self.submit_all(f, items)?;
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(gather(id, futures))
    }

    /// Like [`ThreadPool::map`] but yields results as they complete.
    pub fn map_unordered<F, A, T, I>(
        &self,
        f: F,
        items: I,
    ) -> Result<impl Iterator<Item = Result<T>>>
    where
        F: Fn(A) -> T + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + 'static,
        I: IntoIterator<Item = A>,
    {
        let futures = self.submit_all(f, items)?;
        Ok(as_completed(futures).map(|fut| fut.result(None)))
    }

    fn submit_all<F, A, T, I>(&self, f: F, items: I) -> Result<Vec<Future<T>>>
    where
        F: Fn(A) -> T + Send + Sync + 'static,
        A: Send + 'static,
        T: Send + 'static,
        I: IntoIterator<Item = A>,
    {
        let f = Arc::new(f);
        let mut futures = Vec::new();
        for item in items {
            let f = f.clone();
            match self.submit(move || f(item)) {
                Ok(fut) => futures.push(fut),
                Err(e) => {
                    for fut in &futures {
                        fut.cancel();
                    }
                    return Err(e);
                }
            }
        }
        Ok(futures)
    }

    /// Stop accepting tasks. With `wait`, queued tasks still run and this
    /// returns once every thread has exited; without it, queued tasks are
    /// cancelled and running ones finish in the background.
    pub fn shutdown(&self, wait: bool) -> Result<()> {
        {
            let mut table = self.shared.table.lock();
            match table.state {
                PoolState::Closed => return Ok(()),
                PoolState::Created | PoolState::Running => {
                    table.state = PoolState::ShuttingDown;
                }
                PoolState::ShuttingDown => {}
            }
            if table.live == 0 {
                table.state = PoolState::Closed;
            }
        }
        self.shared.queue.close();
        if !wait {
            let cancelled = self.shared.queue.drain();
            debug!(count = cancelled.len(), "cancelling queued tasks");
            for job in cancelled {
                job.abort.cancel();
            }
            return Ok(());
        }
        join_all(&self.shared);
        self.shared.table.lock().state = PoolState::Closed;
        info!("thread pool closed");
        Ok(())
    }

    pub fn state(&self) -> PoolState {
        self.shared.table.lock().state
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.shared.table.lock().workers.clone()
    }

    pub fn size(&self) -> usize {
        self.shared.config.pool_size
    }

    /// Tasks submitted but not yet picked up by a thread.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(true) {
            warn!(error = %e, "thread pool shutdown failed");
        }
    }
}

fn join_all(shared: &Shared) {
    loop {
        let handles = std::mem::take(&mut shared.table.lock().handles);
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("pool thread panicked");
            }
        }
    }
}

/// `replacing` keeps the live count as is: the slot's previous thread is
/// handing over to the new one.
fn spawn_worker(shared: &Arc<Shared>, slot: usize, replacing: bool) -> Result<()> {
    let name = format!("hyperpool-{}", slot);
    {
        let mut table = shared.table.lock();
        if !replacing {
            table.live += 1;
        }
        let info = &mut table.workers[slot];
        *info = WorkerInfo::new(slot);
        info.thread_name = Some(name.clone());
    }
    let spawned = with_retries("worker thread", shared.config.spawn_retries, |_| {
        let worker = shared.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_main(worker, slot))
            .map_err(|e| HyperError::Spawn(e.to_string()))
    });
    let mut table = shared.table.lock();
    match spawned {
        Ok(handle) => {
            if replacing {
                table.handles.retain(|h| !h.is_finished());
            }
            table.handles.push(handle);
            Ok(())
        }
        Err(e) => {
            if !replacing {
                table.live -= 1;
            }
            table.workers[slot].state = WorkerState::Dead;
            Err(e)
        }
    }
}

fn worker_main(shared: Arc<Shared>, slot: usize) {
    if let Some(init) = &shared.initializer {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| init()));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(p) => Some(panic_message(p.as_ref())),
        };
        if let Some(reason) = failure {
            error!(slot, %reason, "worker initializer failed");
            slot_exited(&shared, slot, Some(reason));
            return;
        }
    }
    shared.table.lock().workers[slot].state = WorkerState::Idle;

    let mut completed = 0usize;
    while let Some(job) = shared.queue.get() {
        shared.table.lock().workers[slot].state = WorkerState::Busy;
        debug!(slot, task = %job.id, "running task");
        (job.run)();
        completed += 1;
        {
            let mut table = shared.table.lock();
            let info = &mut table.workers[slot];
            info.state = WorkerState::Idle;
            info.tasks_completed += 1;
        }
        if shared.config.max_tasks_per_worker == Some(completed) {
            debug!(slot, completed, "recycling worker thread");
            if let Err(e) = spawn_worker(&shared, slot, true) {
                error!(slot, error = %e, "could not replace worker thread");
                slot_exited(&shared, slot, Some(e.to_string()));
            }
            return;
        }
    }
    slot_exited(&shared, slot, None);
}

fn slot_exited(shared: &Shared, slot: usize, failure: Option<String>) {
    let mut table = shared.table.lock();
    table.workers[slot].state = WorkerState::Dead;
    table.live -= 1;
    if table.live > 0 {
        return;
    }
    match table.state {
        PoolState::ShuttingDown => table.state = PoolState::Closed,
        PoolState::Created | PoolState::Running => {
            let reason = failure.unwrap_or_else(|| "all worker threads exited".to_string());
            warn!(%reason, "thread pool degraded");
            table.degraded = Some(reason.clone());
            let orphaned = shared.queue.drain();
            drop(table);
            for job in orphaned {
                job.abort.fail(HyperError::PoolDegraded(reason.clone()));
            }
        }
        PoolState::Closed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    fn pool(size: usize) -> ThreadPool {
        ThreadPool::new(PoolConfig::builder().pool_size(size).build().unwrap()).unwrap()
    }

    #[test]
    fn map_preserves_input_order() {
        let pool = pool(4);
        let out = pool
            .map(
                |x: u64| {
                    thread::sleep(Duration::from_millis(10 - x * 2));
                    x * x
                },
                1..=5,
            )
            .unwrap();
        assert_eq!(out, vec![1, 4, 9, 16, 25]);
    }

    #[test]
    fn map_unordered_yields_every_result() {
        let pool = pool(3);
        let mut out: Vec<i32> = pool
            .map_unordered(|x: i32| x + 1, vec![1, 2, 3, 4])
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        out.sort();
        assert_eq!(out, vec![2, 3, 4, 5]);
    }

    #[test]
    fn panicking_task_fails_only_its_future() {
        let pool = pool(1);
        let bad = pool.submit(|| -> u8 { panic!("kaboom") }).unwrap();
        let good = pool.submit(|| 7u8).unwrap();
        match bad.result(None) {
            Err(HyperError::TaskFailed(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(good.result(None).unwrap(), 7);
    }

    #[test]
    fn local_objects_are_shared_by_reference() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..10)
            .map(|_| {
                let counter = counter.clone();
                pool.submit(move || counter.fetch_add(1, Ordering::SeqCst)).unwrap()
            })
            .collect();
        for f in futures {
            f.result(None).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn shutdown_without_wait_cancels_queued_tasks() {
        let pool = pool(1);
        let gate = Arc::new(Barrier::new(2));
        let running = {
            let gate = gate.clone();
            pool.submit(move || {
                gate.wait();
                thread::sleep(Duration::from_millis(30));
                1
            })
            .unwrap()
        };
        let queued = pool.submit(|| 2).unwrap();
        gate.wait();
        pool.shutdown(false).unwrap();
        assert!(matches!(queued.result(None), Err(HyperError::Cancelled)));
        assert_eq!(running.result(None).unwrap(), 1);
        assert!(matches!(pool.submit(|| 3), Err(HyperError::PoolClosed)));
    }

    #[test]
    fn shutdown_with_wait_drains_the_queue() {
        let pool = pool(2);
        let futures: Vec<_> = (0..20).map(|i| pool.submit(move || i * 2).unwrap()).collect();
        pool.shutdown(true).unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
        for (i, f) in futures.into_iter().enumerate() {
            assert!(f.done());
            assert_eq!(f.result(None).unwrap(), i * 2);
        }
    }

    #[test]
    fn workers_are_recycled_after_max_tasks() {
        let config = PoolConfig::builder()
            .pool_size(1)
            .max_tasks_per_worker(2)
            .build()
            .unwrap();
        let pool = ThreadPool::new(config).unwrap();
        let ids: Vec<_> = (0..6)
            .map(|_| pool.submit(|| format!("{:?}", thread::current().id())).unwrap())
            .collect();
        let ids: Vec<String> = ids.into_iter().map(|f| f.result(None).unwrap()).collect();
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_eq!(ids[2], ids[3]);
        assert_ne!(ids[3], ids[4]);
    }

    #[test]
    fn recycled_threads_are_reaped() {
        let config = PoolConfig::builder()
            .pool_size(1)
            .max_tasks_per_worker(1)
            .build()
            .unwrap();
        let pool = ThreadPool::new(config).unwrap();
        for i in 0..12 {
            assert_eq!(pool.apply(move || i).unwrap(), i);
        }
        let handles = pool.shared.table.lock().handles.len();
        assert!(handles <= 3, "{} join handles kept", handles);
        pool.shutdown(true).unwrap();
        assert!(pool.shared.table.lock().handles.is_empty());
    }

    #[test]
    fn map_async_resolves_in_input_order() {
        let pool = pool(3);
        let all = pool
            .map_async(
                |x: u64| {
                    thread::sleep(Duration::from_millis(12 - x * 2));
                    x + 100
                },
                0..6,
            )
            .unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        all.on_done(move |id| tx.send(id).unwrap());
        let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, all.id());
        assert_eq!(all.result(None).unwrap(), vec![100, 101, 102, 103, 104, 105]);
    }

    #[test]
    fn map_async_reports_the_earliest_failure() {
        let pool = pool(2);
        let all = pool
            .map_async(
                |x: u64| {
                    if x == 1 {
                        thread::sleep(Duration::from_millis(30));
                    }
                    if x == 1 || x == 2 {
                        panic!("bad input {}", x);
                    }
                    x
                },
                0..4,
            )
            .unwrap();
        match all.result(Some(Duration::from_secs(5))) {
            Err(HyperError::TaskFailed(msg)) => assert!(msg.contains("bad input 1")),
            other => panic!("unexpected {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn initializer_runs_once_per_thread() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let config = PoolConfig::builder().pool_size(3).build().unwrap();
        let pool = ThreadPool::with_initializer(config, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        pool.shutdown(true).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failing_initializer_degrades_the_pool() {
        let config = PoolConfig::builder().pool_size(2).build().unwrap();
        let pool = ThreadPool::with_initializer(config, || anyhow::bail!("no database")).unwrap();
        let mut degraded = false;
        for _ in 0..100 {
            match pool.submit(|| ()) {
                Err(HyperError::PoolDegraded(reason)) => {
                    assert!(reason.contains("no database"));
                    degraded = true;
                    break;
                }
                Ok(f) => {
                    let _ = f.result(Some(Duration::from_millis(10)));
                }
                Err(e) => panic!("unexpected {}", e),
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(degraded);
        assert!(pool.workers().iter().all(|w| w.state == WorkerState::Dead));
    }
}
