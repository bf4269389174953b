//! Named shared-memory blocks with a cross-process reference count.
//!
//! Every segment starts with a small header holding the count and a
//! released flag, both updated atomically in place so that any process
//! mapping the segment observes the same lifecycle. Writers are not
//! serialized here: pair a block with a [`crate::sync::Lock`] (see
//! [`SharedMemoryBlock::write_locked`]) when more than one worker mutates it.

use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use ::shared_memory::{Shmem, ShmemConf};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{HyperError, Result};
use crate::sync::Lock;

const MAGIC: u64 = 0x6879_7065_7270_6f6f; // "hyperpoo"
const HEADER_SIZE: usize = 64;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
});

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub(crate) fn round_to_page(size: usize) -> usize {
    let page = page_size();
    size.max(1).div_ceil(page) * page
}

/// A process-wide unique segment name.
pub(crate) fn unique_name(prefix: &str) -> String {
    format!(
        "/hp_{}_{}_{}_{:08x}",
        prefix,
        process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::SeqCst),
        rand::random::<u32>()
    )
}

#[repr(C)]
struct Header {
    magic: u64,
    size: u64,
    refcount: AtomicU32,
    released: AtomicU32,
}

/// What crosses a process boundary in place of the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShmHandle {
    pub name: String,
    pub size: usize,
}

impl ShmHandle {
    pub fn new<S: Into<String>>(name: S, size: usize) -> ShmHandle {
        ShmHandle {
            name: name.into(),
            size,
        }
    }

    pub fn attach(&self) -> Result<SharedMemoryBlock> {
        SharedMemoryBlock::attach(&self.name)
    }
}

pub struct SharedMemoryBlock {
    shmem: Shmem,
    name: String,
    size: usize,
    released: bool,
}

// The mapping stays valid for the lifetime of `shmem` in every thread; all
// mutation of the header goes through atomics and the data region follows
// the documented external-locking contract.
unsafe impl Send for SharedMemoryBlock {}
unsafe impl Sync for SharedMemoryBlock {}

impl fmt::Debug for SharedMemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryBlock")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl SharedMemoryBlock {
    fn create(size: usize) -> Result<SharedMemoryBlock> {
        let size = round_to_page(size);
        let name = unique_name("shm");
        let mut shmem = ShmemConf::new()
            .os_id(&name)
            .size(HEADER_SIZE + size)
            .create()?;
        // Ownership (unlinking the name on drop) is decided by `release`.
        shmem.set_owner(false);
        unsafe {
            let header = shmem.as_ptr() as *mut Header;
            ptr::write(
                header,
                Header {
                    magic: MAGIC,
                    size: size as u64,
                    refcount: AtomicU32::new(1),
                    released: AtomicU32::new(0),
                },
            );
        }
        debug!(%name, size, "shared memory block allocated");
        Ok(SharedMemoryBlock {
            shmem,
            name,
            size,
            released: false,
        })
    }

    fn open_raw(name: &str) -> Result<Shmem> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|_| HyperError::NotFound(name.to_string()))?;
        if shmem.len() < HEADER_SIZE {
            return Err(HyperError::NotFound(name.to_string()));
        }
        let magic = unsafe { (*(shmem.as_ptr() as *const Header)).magic };
        if magic != MAGIC {
            return Err(HyperError::NotFound(name.to_string()));
        }
        Ok(shmem)
    }

    /// Map an existing block by name and take a reference on it.
    pub fn attach(name: &str) -> Result<SharedMemoryBlock> {
        let shmem = SharedMemoryBlock::open_raw(name)?;
        let header = unsafe { &*(shmem.as_ptr() as *const Header) };
        let mut count = header.refcount.load(Ordering::Acquire);
        loop {
            if count == 0 || header.released.load(Ordering::Acquire) != 0 {
                return Err(HyperError::NotFound(name.to_string()));
            }
            match header.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        let size = header.size as usize;
        Ok(SharedMemoryBlock {
            shmem,
            name: name.to_string(),
            size,
            released: false,
        })
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.shmem.as_ptr() as *const Header) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Usable bytes, the requested size rounded up to the page size.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn handle(&self) -> ShmHandle {
        ShmHandle::new(self.name.clone(), self.size)
    }

    pub fn refcount(&self) -> u32 {
        self.header().refcount.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released || self.header().released.load(Ordering::Acquire) != 0
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            Err(HyperError::NotFound(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(HyperError::Protocol(format!(
                "range {}..{} outside block of {} bytes",
                offset,
                offset.saturating_add(len),
                self.size
            ))),
        }
    }

    /// Start of the data region.
    ///
    /// # Safety
    /// The pointer is valid for `size()` bytes while this handle lives; the
    /// caller is responsible for synchronizing with other writers.
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr().add(HEADER_SIZE)
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.ensure_live()?;
        self.check_range(offset, buf.len())?;
        unsafe {
            ptr::copy(self.as_mut_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.check_range(offset, data.len())?;
        unsafe {
            ptr::copy(data.as_ptr(), self.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn with_bytes<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.ensure_live()?;
        let bytes = unsafe { std::slice::from_raw_parts(self.as_mut_ptr(), self.size) };
        Ok(f(bytes))
    }

    /// Mutable view of the data region. Writers in other threads or
    /// processes are not excluded.
    pub fn with_bytes_mut<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.ensure_live()?;
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size) };
        Ok(f(bytes))
    }

    /// [`SharedMemoryBlock::with_bytes_mut`] while holding `lock`.
    pub fn write_locked<R, F>(&self, lock: &Lock, timeout: Option<Duration>, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let _guard = lock.guard(timeout)?;
        self.with_bytes_mut(f)
    }

    /// Drop this handle's reference. The last release reclaims the segment,
    /// after which every attach fails with `NotFound`.
    pub fn release(mut self) -> Result<()> {
        self.release_inner();
        Ok(())
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.header().released.load(Ordering::Acquire) != 0 {
            return;
        }
        let prev = self.header().refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.header().released.store(1, Ordering::Release);
            self.shmem.set_owner(true);
            debug!(name = %self.name, "shared memory block reclaimed");
        }
    }
}

impl Drop for SharedMemoryBlock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Allocates blocks on behalf of one pool and reclaims whatever is left
/// when the pool shuts down.
#[derive(Debug, Default)]
pub struct SharedMemoryManager {
    owned: Mutex<HashSet<String>>,
}

impl SharedMemoryManager {
    pub fn new() -> SharedMemoryManager {
        SharedMemoryManager::default()
    }

    pub fn allocate(&self, size: usize) -> Result<SharedMemoryBlock> {
        let block = SharedMemoryBlock::create(size)?;
        self.owned.lock().insert(block.name.clone());
        Ok(block)
    }

    pub fn attach(&self, name: &str) -> Result<SharedMemoryBlock> {
        SharedMemoryBlock::attach(name)
    }

    /// Release the manager's handle and stop tracking the block. Other
    /// handles keep it alive; the last of them reclaims it.
    pub fn release(&self, block: SharedMemoryBlock) -> Result<()> {
        self.owned.lock().remove(&block.name);
        block.release()
    }

    pub fn allocated(&self) -> usize {
        self.owned.lock().len()
    }

    /// Reclaim every block this manager allocated, whatever its count.
    /// Live handles elsewhere start failing with `NotFound`.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.owned.lock().drain().collect();
        for name in names {
            match SharedMemoryBlock::open_raw(&name) {
                Ok(mut shmem) => {
                    let header = unsafe { &*(shmem.as_ptr() as *const Header) };
                    if header.released.swap(1, Ordering::AcqRel) == 0 {
                        header.refcount.store(0, Ordering::Release);
                        shmem.set_owner(true);
                        debug!(%name, "shared memory block reclaimed at shutdown");
                    }
                }
                Err(HyperError::NotFound(_)) => {}
                Err(e) => warn!(%name, error = %e, "could not reclaim shared memory block"),
            }
        }
    }
}

impl Drop for SharedMemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const _: () = assert!(mem::size_of::<Header>() <= HEADER_SIZE);
