//! Locks, semaphores, conditions, barriers and events that work across
//! processes.
//!
//! Each primitive lives in its own named shared-memory segment laid out as
//! a process-shared `raw_sync` mutex guarding a small state record, plus a
//! `raw_sync` auto-reset event used to wake waiters. Waits are sliced, so a
//! coalesced wake-up never strands a waiter for longer than `POLL_SLICE`.
//! The serializable [`SyncHandle`] lets another process open the same
//! primitive by name.

use std::cell::Cell;
use std::fmt;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::shared_memory::{Shmem, ShmemConf};
use raw_sync::events::{Event as RawEvent, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockImpl, LockInit, Mutex as RawMutex};
use raw_sync::Timeout;
use serde_derive::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{HyperError, Result};
use crate::shm::unique_name;

const SEGMENT_SIZE: usize = 4096;
const ALIGN: usize = 64;
const STATE_MAGIC: u32 = 0x6870_7379;
const POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncKind {
    Lock,
    Semaphore,
    Condition,
    Barrier,
    Event,
}

impl SyncKind {
    fn code(self) -> u32 {
        match self {
            SyncKind::Lock => 1,
            SyncKind::Semaphore => 2,
            SyncKind::Condition => 3,
            SyncKind::Barrier => 4,
            SyncKind::Event => 5,
        }
    }
}

/// Name reference to a primitive; a condition also names its lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncHandle {
    pub kind: SyncKind,
    pub name: String,
    pub lock_name: Option<String>,
}

static THREAD_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// (pid, per-process thread token) of the caller.
fn caller_identity() -> (u32, u64) {
    let token = THREAD_TOKEN.with(|t| {
        if t.get() == 0 {
            t.set(THREAD_COUNTER.fetch_add(1, Ordering::Relaxed));
        }
        t.get()
    });
    (process::id(), token)
}

#[repr(C)]
#[derive(Default)]
struct State {
    magic: u32,
    kind: u32,
    held: u32,
    owner_pid: u32,
    owner_thread: u64,
    count: u32,
    max: u32,
    waiters: u32,
    tickets: u32,
    parties: u32,
    arrived: u32,
    generation: u64,
}

fn align_up(n: usize) -> usize {
    n.div_ceil(ALIGN) * ALIGN
}

// Field order matters: the raw lock objects must drop before the mapping.
struct Segment {
    mutex: Box<dyn LockImpl>,
    event: Box<dyn EventImpl>,
    name: String,
    shmem: Shmem,
}

// pthread process-shared objects are safe to use from any thread, and the
// state record behind `mutex` is only touched while holding it.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn offsets(base: *mut u8) -> (usize, usize) {
        let mutex_size = RawMutex::size_of(Some(base));
        let event_off = align_up(mutex_size);
        let event_size = unsafe { RawEvent::size_of(Some(base.add(event_off))) };
        let state_off = align_up(event_off + event_size);
        (event_off, state_off)
    }

    fn create(kind: SyncKind, init: State) -> Result<Segment> {
        let name = unique_name("sync");
        let shmem = ShmemConf::new().os_id(&name).size(SEGMENT_SIZE).create()?;
        let base = shmem.as_ptr();
        let (event_off, state_off) = Segment::offsets(base);
        if state_off + std::mem::size_of::<State>() > SEGMENT_SIZE {
            return Err(HyperError::Lock("sync segment too small for this platform".into()));
        }
        unsafe {
            let state = base.add(state_off);
            std::ptr::write(
                state as *mut State,
                State {
                    magic: STATE_MAGIC,
                    kind: kind.code(),
                    ..init
                },
            );
            let (mutex, _) = RawMutex::new(base, state).map_err(HyperError::lock)?;
            let (event, _) = RawEvent::new(base.add(event_off), true).map_err(HyperError::lock)?;
            Ok(Segment {
                shmem,
                mutex,
                event,
                name,
            })
        }
    }

    fn open(kind: SyncKind, name: &str) -> Result<Segment> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|_| HyperError::NotFound(name.to_string()))?;
        if shmem.len() < SEGMENT_SIZE {
            return Err(HyperError::NotFound(name.to_string()));
        }
        let base = shmem.as_ptr();
        let (event_off, state_off) = Segment::offsets(base);
        unsafe {
            let state = base.add(state_off);
            let header = &*(state as *const State);
            if header.magic != STATE_MAGIC || header.kind != kind.code() {
                return Err(HyperError::NotFound(name.to_string()));
            }
            let (mutex, _) = RawMutex::from_existing(base, state).map_err(HyperError::lock)?;
            let (event, _) = RawEvent::from_existing(base.add(event_off)).map_err(HyperError::lock)?;
            Ok(Segment {
                shmem,
                mutex,
                event,
                name: name.to_string(),
            })
        }
    }

    fn with_state<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut State) -> R,
    {
        let guard = self.mutex.lock().map_err(HyperError::lock)?;
        let state = unsafe { &mut *(*guard as *mut State) };
        Ok(f(state))
    }

    fn signal(&self) -> Result<()> {
        self.event.set(EventState::Signaled).map_err(HyperError::lock)
    }

    fn park(&self, slice: Duration) {
        // Err here is the slice elapsing.
        if self.event.wait(Timeout::Val(slice)).is_err() {
            trace!(name = %self.name, "wait slice elapsed");
        }
    }

    /// Run `try_take` under the state mutex until it succeeds or the deadline
    /// passes.
    fn wait_until<F>(&self, deadline: Option<Instant>, mut try_take: F) -> Result<bool>
    where
        F: FnMut(&mut State) -> bool,
    {
        loop {
            if self.with_state(&mut try_take)? {
                return Ok(true);
            }
            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(false);
                    }
                    (d - now).min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };
            self.park(slice);
        }
    }

    fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// Binary mutual exclusion with holder tracking.
#[derive(Clone)]
pub struct Lock {
    segment: Arc<Segment>,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.segment.name)
            .field("creator", &self.segment.is_owner())
            .finish()
    }
}

impl Lock {
    pub fn new() -> Result<Lock> {
        Ok(Lock {
            segment: Arc::new(Segment::create(SyncKind::Lock, State::default())?),
        })
    }

    pub fn open(handle: &SyncHandle) -> Result<Lock> {
        expect_kind(handle, SyncKind::Lock)?;
        Lock::open_name(&handle.name)
    }

    fn open_name(name: &str) -> Result<Lock> {
        Ok(Lock {
            segment: Arc::new(Segment::open(SyncKind::Lock, name)?),
        })
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            kind: SyncKind::Lock,
            name: self.segment.name.clone(),
            lock_name: None,
        }
    }

    /// Block until the lock is ours or `timeout` elapses (`Ok(false)`).
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        let (pid, thread) = caller_identity();
        self.segment.wait_until(deadline(timeout), |s| {
            if s.held == 0 {
                s.held = 1;
                s.owner_pid = pid;
                s.owner_thread = thread;
                true
            } else {
                false
            }
        })
    }

    pub fn try_acquire(&self) -> Result<bool> {
        self.acquire(Some(Duration::ZERO))
    }

    /// Only the holding thread may release.
    pub fn release(&self) -> Result<()> {
        let (pid, thread) = caller_identity();
        let owned = self.segment.with_state(|s| {
            if s.held == 1 && s.owner_pid == pid && s.owner_thread == thread {
                s.held = 0;
                s.owner_pid = 0;
                s.owner_thread = 0;
                true
            } else {
                false
            }
        })?;
        if !owned {
            return Err(HyperError::NotOwner);
        }
        self.segment.signal()
    }

    pub fn is_locked(&self) -> Result<bool> {
        self.segment.with_state(|s| s.held == 1)
    }

    pub fn held_by_caller(&self) -> Result<bool> {
        let (pid, thread) = caller_identity();
        self.segment
            .with_state(|s| s.held == 1 && s.owner_pid == pid && s.owner_thread == thread)
    }

    /// Acquire and release on drop. Fails with `Timeout` if the lock could
    /// not be taken in time.
    pub fn guard(&self, timeout: Option<Duration>) -> Result<LockGuard<'_>> {
        if self.acquire(timeout)? {
            Ok(LockGuard { lock: self })
        } else {
            Err(HyperError::Timeout)
        }
    }
}

pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::warn!(error = %e, "failed to release lock guard");
        }
    }
}

fn expect_kind(handle: &SyncHandle, kind: SyncKind) -> Result<()> {
    if handle.kind != kind {
        return Err(HyperError::Protocol(format!(
            "expected a {:?} handle, got {:?}",
            kind, handle.kind
        )));
    }
    Ok(())
}

/// Counting semaphore, unbounded above unless built with
/// [`Semaphore::bounded`] or [`Semaphore::with_max`].
#[derive(Clone)]
pub struct Semaphore {
    segment: Arc<Segment>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore").field("name", &self.segment.name).finish()
    }
}

impl Semaphore {
    /// `permits` available now. Any holder may release, any number of
    /// times; `Semaphore::new(0)` is a plain signal.
    pub fn new(permits: u32) -> Result<Semaphore> {
        Semaphore::with_max(permits, u32::MAX)
    }

    /// `permits` available now, and never more than that: a release past
    /// the bound fails with `SemaphoreOverflow`.
    pub fn bounded(permits: u32) -> Result<Semaphore> {
        Semaphore::with_max(permits, permits)
    }

    pub fn with_max(initial: u32, max: u32) -> Result<Semaphore> {
        if initial > max {
            return Err(HyperError::Config(format!(
                "semaphore initial value {} exceeds bound {}",
                initial, max
            )));
        }
        let init = State {
            count: initial,
            max,
            ..State::default()
        };
        Ok(Semaphore {
            segment: Arc::new(Segment::create(SyncKind::Semaphore, init)?),
        })
    }

    pub fn open(handle: &SyncHandle) -> Result<Semaphore> {
        expect_kind(handle, SyncKind::Semaphore)?;
        Ok(Semaphore {
            segment: Arc::new(Segment::open(SyncKind::Semaphore, &handle.name)?),
        })
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            kind: SyncKind::Semaphore,
            name: self.segment.name.clone(),
            lock_name: None,
        }
    }

    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut more_left = false;
        let taken = self.segment.wait_until(deadline(timeout), |s| {
            if s.count > 0 {
                s.count -= 1;
                more_left = s.count > 0;
                true
            } else {
                false
            }
        })?;
        if taken && more_left {
            self.segment.signal()?;
        }
        Ok(taken)
    }

    pub fn release(&self) -> Result<()> {
        let ok = self.segment.with_state(|s| {
            if s.count >= s.max {
                false
            } else {
                s.count += 1;
                true
            }
        })?;
        if !ok {
            return Err(HyperError::SemaphoreOverflow);
        }
        self.segment.signal()
    }

    pub fn value(&self) -> Result<u32> {
        self.segment.with_state(|s| s.count)
    }
}

/// Wait/notify bound to a [`Lock`].
#[derive(Clone)]
pub struct Condition {
    segment: Arc<Segment>,
    lock: Lock,
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.segment.name)
            .field("lock", &self.lock)
            .finish()
    }
}

impl Condition {
    pub fn new(lock: Lock) -> Result<Condition> {
        Ok(Condition {
            segment: Arc::new(Segment::create(SyncKind::Condition, State::default())?),
            lock,
        })
    }

    pub fn open(handle: &SyncHandle) -> Result<Condition> {
        expect_kind(handle, SyncKind::Condition)?;
        let lock_name = handle
            .lock_name
            .as_deref()
            .ok_or_else(|| HyperError::Protocol("condition handle without a lock".into()))?;
        Ok(Condition {
            segment: Arc::new(Segment::open(SyncKind::Condition, &handle.name)?),
            lock: Lock::open_name(lock_name)?,
        })
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            kind: SyncKind::Condition,
            name: self.segment.name.clone(),
            lock_name: Some(self.lock.segment.name.clone()),
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        self.lock.acquire(timeout)
    }

    pub fn release(&self) -> Result<()> {
        self.lock.release()
    }

    /// Release the lock, sleep until notified or timed out, then re-acquire
    /// the lock. Returns `false` on timeout. The caller must hold the lock.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if !self.lock.held_by_caller()? {
            return Err(HyperError::NotOwner);
        }
        self.segment.with_state(|s| s.waiters += 1)?;
        self.lock.release()?;

        let woke = self.segment.wait_until(deadline(timeout), |s| {
            if s.tickets > 0 {
                s.tickets -= 1;
                true
            } else {
                false
            }
        });
        let woke = match woke {
            Ok(true) => true,
            Ok(false) => {
                // A notify may have raced the deadline; take its ticket if so.
                self.segment.with_state(|s| {
                    if s.tickets > 0 {
                        s.tickets -= 1;
                        true
                    } else {
                        s.waiters = s.waiters.saturating_sub(1);
                        false
                    }
                })?
            }
            Err(e) => {
                self.lock.acquire(None)?;
                return Err(e);
            }
        };
        if self.segment.with_state(|s| s.tickets > 0)? {
            self.segment.signal()?;
        }
        self.lock.acquire(None)?;
        Ok(woke)
    }

    /// Wait until `predicate` holds. The caller must hold the lock.
    pub fn wait_for<P>(&self, mut predicate: P, timeout: Option<Duration>) -> Result<bool>
    where
        P: FnMut() -> bool,
    {
        let end = deadline(timeout);
        loop {
            if predicate() {
                return Ok(true);
            }
            let remaining = match end {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(false);
                    }
                    Some(d - now)
                }
                None => None,
            };
            self.wait(remaining)?;
        }
    }

    /// Wake up to `n` waiters.
    pub fn notify(&self, n: u32) -> Result<()> {
        if !self.lock.held_by_caller()? {
            return Err(HyperError::NotOwner);
        }
        let woken = self.segment.with_state(|s| {
            let k = n.min(s.waiters);
            s.waiters -= k;
            s.tickets += k;
            k
        })?;
        if woken > 0 {
            self.segment.signal()?;
        }
        Ok(())
    }

    pub fn notify_all(&self) -> Result<()> {
        self.notify(u32::MAX)
    }
}

/// Cyclic barrier for a fixed number of parties.
#[derive(Clone)]
pub struct Barrier {
    segment: Arc<Segment>,
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").field("name", &self.segment.name).finish()
    }
}

impl Barrier {
    pub fn new(parties: u32) -> Result<Barrier> {
        if parties == 0 {
            return Err(HyperError::Config("a barrier needs at least one party".into()));
        }
        let init = State {
            parties,
            ..State::default()
        };
        Ok(Barrier {
            segment: Arc::new(Segment::create(SyncKind::Barrier, init)?),
        })
    }

    pub fn open(handle: &SyncHandle) -> Result<Barrier> {
        expect_kind(handle, SyncKind::Barrier)?;
        Ok(Barrier {
            segment: Arc::new(Segment::open(SyncKind::Barrier, &handle.name)?),
        })
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            kind: SyncKind::Barrier,
            name: self.segment.name.clone(),
            lock_name: None,
        }
    }

    pub fn parties(&self) -> Result<u32> {
        self.segment.with_state(|s| s.parties)
    }

    pub fn n_waiting(&self) -> Result<u32> {
        self.segment.with_state(|s| s.arrived)
    }

    /// Arrive and block until all parties have arrived. Returns the arrival
    /// index (0-based) within the cycle. On timeout the arrival is withdrawn
    /// and `Timeout` is returned.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<u32> {
        let (index, generation, tripped) = self.segment.with_state(|s| {
            let index = s.arrived;
            let generation = s.generation;
            s.arrived += 1;
            if s.arrived == s.parties {
                s.arrived = 0;
                s.generation += 1;
                (index, generation, true)
            } else {
                (index, generation, false)
            }
        })?;
        if tripped {
            self.segment.signal()?;
            return Ok(index);
        }
        let passed = self
            .segment
            .wait_until(deadline(timeout), |s| s.generation != generation)?;
        if passed {
            // Pass the wake-up on to the next waiter of this cycle.
            self.segment.signal()?;
            return Ok(index);
        }
        let withdrawn = self.segment.with_state(|s| {
            if s.generation == generation {
                s.arrived -= 1;
                true
            } else {
                false
            }
        })?;
        if withdrawn {
            Err(HyperError::Timeout)
        } else {
            Ok(index)
        }
    }
}

/// A flag that processes can set, clear and wait for. Setting it wakes
/// every waiter; it stays set until cleared.
#[derive(Clone)]
pub struct Event {
    segment: Arc<Segment>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("name", &self.segment.name).finish()
    }
}

impl Event {
    pub fn new() -> Result<Event> {
        Ok(Event {
            segment: Arc::new(Segment::create(SyncKind::Event, State::default())?),
        })
    }

    pub fn open(handle: &SyncHandle) -> Result<Event> {
        expect_kind(handle, SyncKind::Event)?;
        Ok(Event {
            segment: Arc::new(Segment::open(SyncKind::Event, &handle.name)?),
        })
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            kind: SyncKind::Event,
            name: self.segment.name.clone(),
            lock_name: None,
        }
    }

    pub fn is_set(&self) -> Result<bool> {
        self.segment.with_state(|s| s.held == 1)
    }

    pub fn set(&self) -> Result<()> {
        self.segment.with_state(|s| s.held = 1)?;
        self.segment.signal()
    }

    pub fn clear(&self) -> Result<()> {
        self.segment.with_state(|s| s.held = 0)
    }

    /// Block until the flag is set. Returns `false` if `timeout` elapsed
    /// first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let set = self.segment.wait_until(deadline(timeout), |s| s.held == 1)?;
        if set {
            // The raw event wakes one waiter; pass it on.
            self.segment.signal()?;
        }
        Ok(set)
    }
}
