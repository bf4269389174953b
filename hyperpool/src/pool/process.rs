use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    as_completed, collect_ordered, gather, pair, with_retries, Future, PoolState, Promise, TaskId, WorkerInfo,
    WorkerState,
};
use crate::config::PoolConfig;
use crate::errors::{HyperError, Result};
use crate::process::{RunError, WorkerProcess};
use crate::protocol::{Task, WorkerMessage, WorkerOptions};
use crate::queue::{ConnectionQueue, TaskQueue};
use crate::reduction::{Callable, Registry, Value};
use crate::shm::SharedMemoryManager;

/// A task that passed the submit-time checks and is already encoded.
struct Prepared {
    id: TaskId,
    frame: Vec<u8>,
}

struct Pending {
    id: TaskId,
    frame: Vec<u8>,
    promise: Promise<Value>,
    attempts: u32,
}

struct Table {
    state: PoolState,
    workers: Vec<WorkerInfo>,
    live: usize,
    degraded: Option<String>,
}

struct Shared {
    config: PoolConfig,
    registry: Arc<Registry>,
    initializer: Option<Callable>,
    queue: TaskQueue<Pending>,
    table: Mutex<Table>,
    next_id: AtomicU64,
    shm: SharedMemoryManager,
}

/// Runs registered functions in separate worker processes.
///
/// Every slot owns one handler thread in this process which feeds its
/// worker one task at a time, watches heartbeats, and replaces the worker
/// when it dies, times out, or reaches `max_tasks_per_worker`. Payloads
/// are checked and encoded at submit time, so anything that cannot cross a
/// process boundary fails before it is queued.
pub struct ProcessPool {
    shared: Arc<Shared>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, registry: Arc<Registry>) -> Result<ProcessPool> {
        ProcessPool::start(config, registry, None)
    }

    /// Like [`ProcessPool::new`], running `initializer` in every worker
    /// before it accepts tasks. A failing initializer counts as a failed
    /// spawn.
    pub fn with_initializer<C: Into<Callable>>(
        config: PoolConfig,
        registry: Arc<Registry>,
        initializer: C,
    ) -> Result<ProcessPool> {
        let initializer = initializer.into();
        registry.check_callable(&initializer)?;
        ProcessPool::start(config, registry, Some(initializer))
    }

    fn start(
        config: PoolConfig,
        registry: Arc<Registry>,
        initializer: Option<Callable>,
    ) -> Result<ProcessPool> {
        config.validate()?;
        let size = config.pool_size;
        let shared = Arc::new(Shared {
            registry,
            initializer,
            queue: TaskQueue::new(),
            table: Mutex::new(Table {
                state: PoolState::Created,
                workers: (0..size).map(WorkerInfo::new).collect(),
                live: size,
                degraded: None,
            }),
            next_id: AtomicU64::new(0),
            shm: SharedMemoryManager::new(),
            config,
        });

        let (ready_tx, ready_rx) = unbounded();
        let mut handlers = Vec::with_capacity(size);
        for slot in 0..size {
            let worker_shared = shared.clone();
            let ready = ready_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("hyperpool-slot-{}", slot))
                .spawn(move || handler_main(worker_shared, slot, ready));
            match spawned {
                Ok(handle) => handlers.push(handle),
                Err(e) => {
                    shared.slot_failed(slot, format!("handler thread: {}", e), None);
                    let _ = ready_tx.send(());
                }
            }
        }
        drop(ready_tx);
        for _ in 0..size {
            if ready_rx.recv().is_err() {
                break;
            }
        }

        let mut table = shared.table.lock();
        table.state = PoolState::Running;
        match &table.degraded {
            Some(reason) => warn!(size, %reason, "process pool started degraded"),
            None => info!(size, "process pool started"),
        }
        drop(table);
        Ok(ProcessPool {
            shared,
            handlers: Mutex::new(handlers),
        })
    }

    fn prepare(&self, callable: &Callable, args: Vec<Value>) -> Result<Prepared> {
        let registry = &self.shared.registry;
        registry.check_callable(callable)?;
        registry.check_args(&args)?;
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let task = WorkerMessage::Task(Task {
            id,
            callable: callable.clone(),
            args,
            submitted_at: SystemTime::now(),
        });
        let frame = ConnectionQueue::encode(&task)
            .map_err(|e| HyperError::Unserializable(format!("task {}: {}", id, e)))?;
        Ok(Prepared { id, frame })
    }

    fn enqueue(&self, prepared: Vec<Prepared>) -> Result<Vec<Future<Value>>> {
        let table = self.shared.table.lock();
        if let Some(reason) = &table.degraded {
            return Err(HyperError::PoolDegraded(reason.clone()));
        }
        if table.state != PoolState::Running {
            return Err(HyperError::PoolClosed);
        }
        let mut futures = Vec::with_capacity(prepared.len());
        for Prepared { id, frame } in prepared {
            let (future, promise) = pair(id);
            self.shared.queue.put(Pending {
                id,
                frame,
                promise,
                attempts: 0,
            })?;
            futures.push(future);
        }
        Ok(futures)
    }

    pub fn submit<C: Into<Callable>>(&self, callable: C, args: Vec<Value>) -> Result<Future<Value>> {
        let prepared = self.prepare(&callable.into(), args)?;
        let mut futures = self.enqueue(vec![prepared])?;
        futures
            .pop()
            .ok_or_else(|| HyperError::Protocol("no future for submitted task".into()))
    }

    /// Submit and wait for the value.
    pub fn apply<C: Into<Callable>>(&self, callable: C, args: Vec<Value>) -> Result<Value> {
        self.submit(callable, args)?.result(None)
    }

    /// Call `callable` once per item, each item being the only argument.
    /// Results come back in input order. Nothing is queued unless every
    /// item can be transferred.
    pub fn map<C, I>(&self, callable: C, items: I) -> Result<Vec<Value>>
    where
        C: Into<Callable>,
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let calls = items.into_iter().map(|item| vec![item.into()]);
        self.starmap(callable, calls)
    }

    /// Like [`ProcessPool::map`] with a full argument list per call.
    pub fn starmap<C, I>(&self, callable: C, calls: I) -> Result<Vec<Value>>
    where
        C: Into<Callable>,
        I: IntoIterator<Item = Vec<Value>>,
    {
        collect_ordered(self.submit_all(callable.into(), calls)?)
    }

    /// Like [`ProcessPool::map`] without blocking: the returned future
    /// resolves with every result in input order. Use
    /// [`Future::on_done`] for a completion callback.
    pub fn map_async<C, I>(&self, callable: C, items: I) -> Result<Future<Vec<Value>>>
    where
        C: Into<Callable>,
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let calls = items.into_iter().map(|item| vec![item.into()]);
        let futures = self.submit_all(callable.into(), calls)?;
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(gather(id, futures))
    }

    /// Like [`ProcessPool::map`] but yields results as they complete.
    pub fn map_unordered<C, I>(
        &self,
        callable: C,
        items: I,
    ) -> Result<impl Iterator<Item = Result<Value>>>
    where
        C: Into<Callable>,
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let calls = items.into_iter().map(|item| vec![item.into()]);
        let futures = self.submit_all(callable.into(), calls)?;
        Ok(as_completed(futures).map(|fut| fut.result(None)))
    }

    fn submit_all<I>(&self, callable: Callable, calls: I) -> Result<Vec<Future<Value>>>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let prepared = calls
            .into_iter()
            .map(|args| self.prepare(&callable, args))
            .collect::<Result<Vec<_>>>()?;
        self.enqueue(prepared)
    }

    /// Stop accepting tasks. With `wait`, queued tasks still run, workers
    /// exit, and shared memory allocated through the pool is reclaimed
    /// before this returns. Without it, queued tasks are cancelled and the
    /// rest winds down in the background.
    pub fn shutdown(&self, wait: bool) -> Result<()> {
        {
            let mut table = self.shared.table.lock();
            match table.state {
                PoolState::Closed => return Ok(()),
                PoolState::Created | PoolState::Running => {
                    table.state = PoolState::ShuttingDown;
                    info!(wait, "process pool shutting down");
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
            for task in cancelled {
                task.promise.cancel();
            }
            return Ok(());
        }
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handle in handlers {
            if handle.join().is_err() {
                error!("pool handler thread panicked");
            }
        }
        let orphaned = {
            let mut table = self.shared.table.lock();
            table.state = PoolState::Closed;
            self.shared.queue.drain()
        };
        self.shared.fail_orphans(orphaned);
        self.shared.shm.shutdown();
        info!("process pool closed");
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

    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// Blocks allocated here are reclaimed when the pool shuts down.
    pub fn shared_memory(&self) -> &SharedMemoryManager {
        &self.shared.shm
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(true) {
            warn!(error = %e, "process pool shutdown failed");
        }
    }
}

impl Shared {
    fn spawn_worker(&self, slot: usize) -> Result<WorkerProcess> {
        let options = WorkerOptions {
            slot,
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            initializer: self.initializer.clone(),
        };
        let timeout = self.config.connection_timeout();
        with_retries("worker process", self.config.spawn_retries, |_| {
            {
                let mut table = self.table.lock();
                let info = &mut table.workers[slot];
                info.state = WorkerState::Starting;
                info.pid = None;
            }
            let worker = WorkerProcess::spawn(&self.config.launch, options.clone(), timeout)?;
            let mut table = self.table.lock();
            let info = &mut table.workers[slot];
            info.pid = Some(worker.pid());
            info.state = WorkerState::Idle;
            info.tasks_completed = 0;
            info.last_heartbeat = None;
            debug!(slot, pid = worker.pid(), "worker spawned");
            Ok(worker)
        })
    }

    fn set_state(&self, slot: usize, state: WorkerState) {
        self.table.lock().workers[slot].state = state;
    }

    fn heartbeat(&self, slot: usize) {
        self.table.lock().workers[slot].last_heartbeat = Some(Instant::now());
    }

    fn finished(&self, slot: usize) {
        let mut table = self.table.lock();
        let info = &mut table.workers[slot];
        info.state = WorkerState::Idle;
        info.tasks_completed += 1;
    }

    /// Requeue a task whose worker died under it, or give up on it.
    fn requeue_or_fail(&self, mut task: Pending, reason: &str) {
        task.attempts += 1;
        if task.attempts <= self.config.max_requeues {
            warn!(task = %task.id, attempts = task.attempts, %reason, "requeueing task");
            task.promise.requeued();
            self.queue.put_front(task);
        } else {
            error!(task = %task.id, attempts = task.attempts, %reason, "task lost its worker");
            task.promise.resolve(Err(HyperError::WorkerCrashed {
                task_id: task.id,
                attempts: task.attempts,
            }));
        }
    }

    /// A slot could not get a worker and is gone for good. `task`, if any,
    /// goes back to the queue for the remaining slots.
    fn slot_failed(&self, slot: usize, reason: String, task: Option<Pending>) {
        let mut table = self.table.lock();
        table.workers[slot].state = WorkerState::Dead;
        table.workers[slot].pid = None;
        table.live -= 1;
        error!(slot, %reason, live = table.live, "worker slot is dead");
        if table.live > 0 {
            if let Some(task) = task {
                task.promise.requeued();
                self.queue.put_front(task);
            }
            return;
        }
        let failed: Vec<Pending> = task.into_iter().chain(self.queue.drain()).collect();
        match table.state {
            PoolState::ShuttingDown | PoolState::Closed => {
                table.state = PoolState::Closed;
                self.shm.shutdown();
            }
            PoolState::Created | PoolState::Running => table.degraded = Some(reason.clone()),
        }
        drop(table);
        for pending in failed {
            pending
                .promise
                .resolve(Err(HyperError::PoolDegraded(reason.clone())));
        }
    }

    /// A handler left its loop. The last one out fails whatever a crashing
    /// sibling put back on the queue after the others stopped reading it.
    fn slot_exited(&self, slot: usize) {
        let mut table = self.table.lock();
        table.workers[slot].state = WorkerState::Dead;
        table.workers[slot].pid = None;
        table.live -= 1;
        if table.live > 0 {
            return;
        }
        let orphaned = self.queue.drain();
        if table.state == PoolState::ShuttingDown {
            table.state = PoolState::Closed;
            self.shm.shutdown();
            debug!("last worker slot exited");
        }
        drop(table);
        self.fail_orphans(orphaned);
    }

    fn fail_orphans(&self, orphaned: Vec<Pending>) {
        for task in orphaned {
            error!(task = %task.id, attempts = task.attempts, "no worker left for task");
            task.promise.resolve(Err(HyperError::WorkerCrashed {
                task_id: task.id,
                attempts: task.attempts,
            }));
        }
    }
}

fn handler_main(shared: Arc<Shared>, slot: usize, ready: Sender<()>) {
    let mut worker = match shared.spawn_worker(slot) {
        Ok(worker) => Some(worker),
        Err(e) => {
            shared.slot_failed(slot, e.to_string(), None);
            let _ = ready.send(());
            return;
        }
    };
    let _ = ready.send(());
    drop(ready);

    let grace = shared.config.heartbeat_timeout();
    let mut completed = 0usize;
    while let Some(task) = shared.queue.get() {
        if task.promise.is_cancelled() {
            continue;
        }
        let alive = worker.as_mut().map_or(false, |w| w.is_alive());
        if !alive {
            if let Some(mut dead) = worker.take() {
                warn!(slot, pid = dead.pid(), "worker exited while idle");
                dead.kill();
            }
            match shared.spawn_worker(slot) {
                Ok(w) => worker = Some(w),
                Err(e) => {
                    shared.slot_failed(slot, e.to_string(), Some(task));
                    return;
                }
            }
            completed = 0;
        }
        let current = match worker.as_mut() {
            Some(w) => w,
            None => continue,
        };
        if !task.promise.set_running() {
            continue;
        }
        shared.set_state(slot, WorkerState::Busy);
        let outcome = current.run(
            &task.frame,
            task.id,
            shared.config.task_timeout(),
            shared.config.heartbeat_timeout(),
            || shared.heartbeat(slot),
        );
        match outcome {
            Ok(outcome) => {
                debug!(slot, task = %task.id, success = outcome.success(), "task finished");
                task.promise
                    .resolve(outcome.outcome.map_err(HyperError::TaskFailed));
                shared.finished(slot);
                completed += 1;
                if shared.config.max_tasks_per_worker == Some(completed) {
                    debug!(slot, completed, "recycling worker");
                    if let Some(w) = worker.take() {
                        w.shutdown(grace);
                    }
                }
            }
            Err(RunError::TimedOut) => {
                warn!(slot, task = %task.id, pid = current.pid(), "task timed out, killing worker");
                current.kill();
                task.promise.resolve(Err(HyperError::Timeout));
                worker = None;
            }
            Err(RunError::Crashed(reason)) => {
                warn!(slot, task = %task.id, pid = current.pid(), %reason, "worker crashed");
                current.kill();
                worker = None;
                shared.requeue_or_fail(task, &reason);
            }
        }
    }
    if let Some(w) = worker {
        w.shutdown(grace);
    }
    shared.slot_exited(slot);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(size: usize) -> Shared {
        Shared {
            config: PoolConfig::builder().pool_size(size).build().unwrap(),
            registry: Arc::new(Registry::new()),
            initializer: None,
            queue: TaskQueue::new(),
            table: Mutex::new(Table {
                state: PoolState::ShuttingDown,
                workers: (0..size).map(WorkerInfo::new).collect(),
                live: size,
                degraded: None,
            }),
            next_id: AtomicU64::new(0),
            shm: SharedMemoryManager::new(),
        }
    }

    fn pending(id: u64) -> (Future<Value>, Pending) {
        let (future, promise) = pair(TaskId(id));
        assert!(promise.set_running());
        let task = Pending {
            id: TaskId(id),
            frame: Vec::new(),
            promise,
            attempts: 1,
        };
        (future, task)
    }

    #[test]
    fn task_requeued_after_siblings_stopped_reading_is_failed() {
        let shared = shared(2);
        shared.queue.close();
        let (future, task) = pending(7);
        // Slot 1 loses its worker and cannot respawn while slot 0 is still
        // counted as live but has already seen the closed queue.
        shared.slot_failed(1, "spawn failed".into(), Some(task));
        assert!(!future.done());
        shared.slot_exited(0);
        assert!(future.done());
        match future.result(None) {
            Err(HyperError::WorkerCrashed { task_id, attempts }) => {
                assert_eq!(task_id, TaskId(7));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        let table = shared.table.lock();
        assert_eq!(table.state, PoolState::Closed);
        assert_eq!(table.live, 0);
        assert!(shared.queue.is_empty());
    }

    #[test]
    fn last_slot_out_leaves_an_empty_queue_alone() {
        let shared = shared(1);
        shared.queue.close();
        shared.slot_exited(0);
        assert_eq!(shared.table.lock().state, PoolState::Closed);
    }
}
