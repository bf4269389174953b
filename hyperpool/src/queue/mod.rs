//! FIFO queues: an in-process task queue shared by pool threads and a
//! typed queue over a [`Connection`] for talking to another process.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::Connection;
use crate::errors::{HyperError, Result};
use crate::reduction;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    unfinished: usize,
}

/// Multi-producer multi-consumer FIFO with close and join semantics.
///
/// `get` hands out items until the queue is both closed and empty. Each
/// `put` counts as unfinished work until a matching `task_done`.
pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
    capacity: Option<usize>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        TaskQueue::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> TaskQueue<T> {
        TaskQueue::build(None)
    }

    pub fn bounded(capacity: usize) -> TaskQueue<T> {
        TaskQueue::build(Some(capacity.max(1)))
    }

    fn build(capacity: Option<usize>) -> TaskQueue<T> {
        TaskQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
            capacity,
        }
    }

    /// Append, blocking while a bounded queue is full.
    pub fn put(&self, item: T) -> Result<()> {
        self.put_timeout(item, None)
    }

    /// Append, failing with `QueueFull` if no room frees up in time.
    pub fn put_timeout(&self, item: T, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(HyperError::QueueClosed);
            }
            match self.capacity {
                Some(cap) if state.items.len() >= cap => match deadline {
                    Some(d) => {
                        if self.not_full.wait_until(&mut state, d).timed_out()
                            && state.items.len() >= cap
                        {
                            return Err(HyperError::QueueFull);
                        }
                    }
                    None => self.not_full.wait(&mut state),
                },
                _ => break,
            }
        }
        state.items.push_back(item);
        state.unfinished += 1;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Put an item back at the head. Capacity and the closed flag are not
    /// checked: the item was already accepted once.
    pub fn put_front(&self, item: T) {
        let mut state = self.state.lock();
        state.items.push_front(item);
        self.not_empty.notify_one();
    }

    /// Next item, or `None` once the queue is closed and drained.
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`TaskQueue::get`], failing with `Timeout` if nothing arrives.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out()
                && state.items.is_empty()
                && !state.closed
            {
                return Err(HyperError::Timeout);
            }
        }
    }

    pub fn try_get(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Refuse further puts and wake every blocked consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Remove and return everything still queued. Drained items count as
    /// finished.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let items: Vec<T> = state.items.drain(..).collect();
        state.unfinished = state.unfinished.saturating_sub(items.len());
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        self.not_full.notify_all();
        items
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Mark one item returned by `get` as processed.
    pub fn task_done(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.unfinished == 0 {
            return Err(HyperError::Protocol(
                "task_done called more times than there were items".into(),
            ));
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        Ok(())
    }

    /// Block until every item put so far has been marked done.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            self.all_done.wait(&mut state);
        }
    }
}

#[derive(serde_derive::Serialize, serde_derive::Deserialize)]
enum Frame<T> {
    Item(T),
    End,
}

/// A typed FIFO whose items travel over a connection to another process.
///
/// Reads and writes use separate handles on the stream and separate locks,
/// so one thread can block in `get` while others `put`. Closing sends an
/// end marker; the reader sees it as end-of-queue.
pub struct ConnectionQueue<T> {
    reader: Mutex<Connection>,
    writer: Mutex<Connection>,
    closed: AtomicBool,
    _item: PhantomData<fn() -> T>,
}

impl<T> ConnectionQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(conn: Connection) -> Result<ConnectionQueue<T>> {
        let writer = conn.try_clone()?;
        Ok(ConnectionQueue {
            reader: Mutex::new(conn),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            _item: PhantomData,
        })
    }

    /// Frame an item ahead of time, so payload errors surface before the
    /// item is handed to a sender.
    pub fn encode(item: &T) -> Result<Vec<u8>> {
        reduction::serialize(&Frame::Item(item))
    }

    pub fn put(&self, item: &T) -> Result<()> {
        let bytes = Self::encode(item)?;
        self.put_encoded(&bytes)
    }

    pub fn put_encoded(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HyperError::QueueClosed);
        }
        self.writer.lock().send(frame)
    }

    /// Next item, `None` on the end marker or when the peer went away.
    pub fn get(&self) -> Result<Option<T>> {
        self.get_timeout(None)
    }

    pub fn get_timeout(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let mut reader = self.reader.lock();
        match reader.recv_timeout(timeout)? {
            Some(bytes) => match reduction::deserialize::<Frame<T>>(&bytes)? {
                Frame::Item(item) => Ok(Some(item)),
                Frame::End => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send the end marker. Further puts fail with `QueueClosed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let bytes = reduction::serialize(&Frame::<()>::End)?;
        self.writer.lock().send(&bytes)
    }

    /// Tear down the transport in both directions.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.writer.lock().close();
    }
}
