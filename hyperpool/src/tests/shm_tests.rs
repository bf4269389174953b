use std::sync::Arc;
use std::thread;

use crate::errors::{HyperError, Result};
use crate::shm::{page_size, SharedMemoryBlock, SharedMemoryManager};
use crate::sync::Lock;

#[test]
fn allocation_rounds_up_to_whole_pages() -> Result<()> {
    let manager = SharedMemoryManager::new();
    let block = manager.allocate(10)?;
    assert_eq!(block.size(), page_size());
    assert_eq!(block.refcount(), 1);
    assert_eq!(manager.allocated(), 1);
    manager.release(block)?;
    assert_eq!(manager.allocated(), 0);
    Ok(())
}

#[test]
fn attached_handles_see_the_same_bytes() -> Result<()> {
    let manager = SharedMemoryManager::new();
    let block = manager.allocate(64)?;
    block.write_at(8, b"shared")?;
    let other = block.handle().attach()?;
    assert_eq!(block.refcount(), 2);
    let mut buf = [0u8; 6];
    other.read_at(8, &mut buf)?;
    assert_eq!(&buf, b"shared");
    other.release()?;
    assert_eq!(block.refcount(), 1);
    Ok(())
}

#[test]
fn released_block_cannot_be_attached_or_read() -> Result<()> {
    let manager = SharedMemoryManager::new();
    let block = manager.allocate(32)?;
    let handle = block.handle();
    let survivor = handle.attach()?;
    manager.release(block)?;
    // One reference is left, so the block is still alive.
    assert!(survivor.read_at(0, &mut [0u8; 4]).is_ok());
    survivor.release()?;
    assert!(matches!(handle.attach(), Err(HyperError::NotFound(_))));
    Ok(())
}

#[test]
fn manager_forgets_blocks_it_released_before_other_handles() -> Result<()> {
    let manager = SharedMemoryManager::new();
    let block = manager.allocate(32)?;
    let handle = block.handle();
    let other = handle.attach()?;
    manager.release(block)?;
    assert_eq!(manager.allocated(), 0);
    other.release()?;
    assert_eq!(manager.allocated(), 0);
    assert!(matches!(handle.attach(), Err(HyperError::NotFound(_))));
    manager.shutdown();
    Ok(())
}

#[test]
fn manager_shutdown_reclaims_live_blocks() -> Result<()> {
    let manager = SharedMemoryManager::new();
    let block = manager.allocate(16)?;
    let handle = block.handle();
    manager.shutdown();
    assert!(block.is_released());
    assert!(matches!(block.write_at(0, b"x"), Err(HyperError::NotFound(_))));
    assert!(matches!(SharedMemoryBlock::attach(&handle.name), Err(HyperError::NotFound(_))));
    Ok(())
}

#[test]
fn out_of_range_access_is_rejected() -> Result<()> {
    let manager = SharedMemoryManager::new();
    let block = manager.allocate(16)?;
    let size = block.size();
    assert!(block.write_at(size - 1, b"ab").is_err());
    assert!(block.read_at(usize::MAX, &mut [0u8; 1]).is_err());
    Ok(())
}

#[test]
fn locked_increments_from_many_threads_are_not_lost() -> Result<()> {
    const THREADS: usize = 8;
    const ROUNDS: u64 = 200;

    let manager = SharedMemoryManager::new();
    let block = manager.allocate(8)?;
    block.write_at(0, &0u64.to_le_bytes())?;
    let handle = block.handle();
    let lock = Lock::new()?;
    let lock_handle = Arc::new(lock.handle());

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let handle = handle.clone();
            let lock_handle = lock_handle.clone();
            thread::spawn(move || -> Result<()> {
                let block = handle.attach()?;
                let lock = Lock::open(&lock_handle)?;
                for _ in 0..ROUNDS {
                    block.write_locked(&lock, None, |bytes| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&bytes[..8]);
                        let next = u64::from_le_bytes(raw) + 1;
                        bytes[..8].copy_from_slice(&next.to_le_bytes());
                    })?;
                }
                block.release()
            })
        })
        .collect();
    for w in workers {
        w.join().expect("worker panicked")?;
    }
    let mut raw = [0u8; 8];
    block.read_at(0, &mut raw)?;
    assert_eq!(u64::from_le_bytes(raw), THREADS as u64 * ROUNDS);
    Ok(())
}
