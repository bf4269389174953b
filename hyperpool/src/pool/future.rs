use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::{Condvar, Mutex};

use super::TaskId;
use crate::errors::{HyperError, Result};

type Callback = Box<dyn FnOnce() + Send>;

enum Slot<T> {
    Pending,
    Running,
    Done(Result<T>),
    Taken,
    Cancelled,
}

impl<T> Slot<T> {
    fn is_final(&self) -> bool {
        matches!(self, Slot::Done(_) | Slot::Taken | Slot::Cancelled)
    }
}

struct Inner<T> {
    slot: Mutex<(Slot<T>, Vec<Callback>)>,
    cond: Condvar,
}

impl<T> Inner<T> {
    fn finish(&self, next: Slot<T>, only_if_pending: bool) -> bool {
        let callbacks = {
            let mut guard = self.slot.lock();
            let allowed = match guard.0 {
                Slot::Pending => true,
                Slot::Running => !only_if_pending,
                _ => false,
            };
            if !allowed {
                return false;
            }
            guard.0 = next;
            self.cond.notify_all();
            std::mem::take(&mut guard.1)
        };
        for cb in callbacks {
            cb();
        }
        true
    }
}

/// Caller's handle on the outcome of one task.
///
/// Futures are matched to results by task id, so completion order does not
/// matter.
pub struct Future<T> {
    id: TaskId,
    inner: Arc<Inner<T>>,
}

/// The resolving side of a [`Future`], held by the pool.
pub(crate) struct Promise<T> {
    id: TaskId,
    inner: Arc<Inner<T>>,
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.id)
            .field("done", &self.done())
            .finish()
    }
}

pub(crate) fn pair<T>(id: TaskId) -> (Future<T>, Promise<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new((Slot::Pending, Vec::new())),
        cond: Condvar::new(),
    });
    (
        Future {
            id,
            inner: inner.clone(),
        },
        Promise { id, inner },
    )
}

impl<T> Future<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn done(&self) -> bool {
        self.inner.slot.lock().0.is_final()
    }

    pub fn running(&self) -> bool {
        matches!(self.inner.slot.lock().0, Slot::Running)
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.inner.slot.lock().0, Slot::Cancelled)
    }

    fn failed(&self) -> bool {
        matches!(self.inner.slot.lock().0, Slot::Done(Err(_)))
    }

    /// Cancel a task that has not been dispatched yet. Dispatched tasks run
    /// to completion and this returns `false`.
    pub fn cancel(&self) -> bool {
        self.inner.finish(Slot::Cancelled, true)
    }

    /// Block until the outcome is known or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.inner.slot.lock();
        while !guard.0.is_final() {
            match deadline {
                Some(d) => {
                    if self.inner.cond.wait_until(&mut guard, d).timed_out() {
                        return guard.0.is_final();
                    }
                }
                None => self.inner.cond.wait(&mut guard),
            }
        }
        true
    }

    /// Take the outcome. A timeout leaves the future usable; a second call
    /// after a successful one is a protocol error.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T> {
        if !self.wait(timeout) {
            return Err(HyperError::Timeout);
        }
        let mut guard = self.inner.slot.lock();
        match std::mem::replace(&mut guard.0, Slot::Taken) {
            Slot::Done(outcome) => outcome,
            Slot::Cancelled => {
                guard.0 = Slot::Cancelled;
                Err(HyperError::Cancelled)
            }
            Slot::Taken => Err(HyperError::Protocol(format!(
                "result of task {} was already taken",
                self.id
            ))),
            Slot::Pending | Slot::Running => Err(HyperError::Protocol(format!(
                "task {} has not completed",
                self.id
            ))),
        }
    }

    /// Run `callback` once the future completes (immediately if it already
    /// has). The callback runs on the resolving thread and receives the
    /// task id.
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce(TaskId) + Send + 'static,
    {
        let id = self.id;
        let mut guard = self.inner.slot.lock();
        if guard.0.is_final() {
            drop(guard);
            callback(id);
        } else {
            guard.1.push(Box::new(move || callback(id)));
        }
    }
}

impl<T> Promise<T> {
    /// Pending → Running. `false` if the task was cancelled meanwhile.
    pub(crate) fn set_running(&self) -> bool {
        let mut guard = self.inner.slot.lock();
        match guard.0 {
            Slot::Pending => {
                guard.0 = Slot::Running;
                true
            }
            _ => false,
        }
    }

    /// Running → Pending, for a task going back on the queue.
    pub(crate) fn requeued(&self) {
        let mut guard = self.inner.slot.lock();
        if matches!(guard.0, Slot::Running) {
            guard.0 = Slot::Pending;
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(self.inner.slot.lock().0, Slot::Cancelled)
    }

    pub(crate) fn resolve(&self, outcome: Result<T>) -> bool {
        self.inner.finish(Slot::Done(outcome), false)
    }

    pub(crate) fn cancel(&self) -> bool {
        self.inner.finish(Slot::Cancelled, true)
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let err = HyperError::Protocol(format!("task {} was dropped without a result", self.id));
        self.inner.finish(Slot::Done(Err(err)), false);
    }
}

/// Type-erased view of a queued promise, so queues of different result
/// types can be cancelled or failed in bulk.
pub(crate) trait Abort: Send + Sync {
    fn cancel(&self) -> bool;
    fn fail(&self, err: HyperError) -> bool;
}

impl<T: Send> Abort for Promise<T> {
    fn cancel(&self) -> bool {
        Promise::cancel(self)
    }

    fn fail(&self, err: HyperError) -> bool {
        self.resolve(Err(err))
    }
}

/// Yields futures in completion order.
pub struct AsCompleted<T> {
    pending: HashMap<TaskId, Future<T>>,
    rx: Receiver<TaskId>,
}

pub fn as_completed<T: Send + 'static>(futures: Vec<Future<T>>) -> AsCompleted<T> {
    let (tx, rx) = unbounded();
    let mut pending = HashMap::with_capacity(futures.len());
    for fut in futures {
        let tx = tx.clone();
        fut.on_done(move |id| {
            let _ = tx.send(id);
        });
        pending.insert(fut.id(), fut);
    }
    AsCompleted { pending, rx }
}

impl<T> Iterator for AsCompleted<T> {
    type Item = Future<T>;

    fn next(&mut self) -> Option<Future<T>> {
        while !self.pending.is_empty() {
            let id = self.rx.recv().ok()?;
            if let Some(fut) = self.pending.remove(&id) {
                return Some(fut);
            }
        }
        None
    }
}

/// Collect results in submission order regardless of completion order.
/// A failure cancels every later input that is still queued; when several
/// inputs fail, the one submitted first is reported.
pub fn collect_ordered<T: Send + 'static>(futures: Vec<Future<T>>) -> Result<Vec<T>> {
    let index: HashMap<TaskId, usize> = futures
        .iter()
        .enumerate()
        .map(|(i, f)| (f.id(), i))
        .collect();
    let mut slots: Vec<Option<T>> = (0..futures.len()).map(|_| None).collect();
    let mut failure: Option<(usize, HyperError)> = None;
    let mut completed = as_completed(futures);
    while let Some(fut) = completed.next() {
        let i = index[&fut.id()];
        match fut.result(None) {
            Ok(v) => slots[i] = Some(v),
            Err(e) => {
                if failure.as_ref().map_or(true, |(first, _)| i < *first) {
                    for rest in completed.pending.values() {
                        if index[&rest.id()] > i {
                            rest.cancel();
                        }
                    }
                    failure = Some((i, e));
                }
            }
        }
    }
    if let Some((_, e)) = failure {
        return Err(e);
    }
    slots
        .into_iter()
        .map(|s| s.ok_or_else(|| HyperError::Protocol("missing result slot".into())))
        .collect()
}

struct Gather<T> {
    futures: Vec<Future<T>>,
    remaining: usize,
    promise: Option<Promise<Vec<T>>>,
}

/// One future for a whole batch: resolves with the results in submission
/// order once every input has completed, under the same failure rules as
/// [`collect_ordered`].
pub(crate) fn gather<T: Send + 'static>(id: TaskId, futures: Vec<Future<T>>) -> Future<Vec<T>> {
    let (output, promise) = pair(id);
    if futures.is_empty() {
        promise.resolve(Ok(Vec::new()));
        return output;
    }
    let observers: Vec<Future<T>> = futures
        .iter()
        .map(|f| Future {
            id: f.id,
            inner: f.inner.clone(),
        })
        .collect();
    let state = Arc::new(Mutex::new(Gather {
        remaining: futures.len(),
        futures,
        promise: Some(promise),
    }));
    for (i, observer) in observers.into_iter().enumerate() {
        let state = state.clone();
        observer.on_done(move |_| gather_one(&state, i));
    }
    output
}

fn gather_one<T: Send + 'static>(state: &Mutex<Gather<T>>, i: usize) {
    let mut guard = state.lock();
    guard.remaining -= 1;
    if guard.remaining > 0 {
        // Cancel outside the lock: cancelled futures re-enter here.
        let later: Vec<Future<T>> = if guard.futures[i].failed() {
            guard.futures[i + 1..]
                .iter()
                .map(|f| Future {
                    id: f.id,
                    inner: f.inner.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };
        drop(guard);
        for fut in later {
            fut.cancel();
        }
        return;
    }
    let futures = std::mem::take(&mut guard.futures);
    let promise = guard.promise.take();
    drop(guard);
    let outcome = futures
        .iter()
        .map(|f| f.result(Some(Duration::ZERO)))
        .collect::<Result<Vec<T>>>();
    if let Some(promise) = promise {
        promise.resolve(outcome);
    }
}
