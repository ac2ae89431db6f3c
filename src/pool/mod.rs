//! Buffer pools for relay IO
//!
//! Two pools back the data path: 32 KiB buffers for TCP copies and
//! 65507-byte buffers (the largest UDP payload over IPv4) for datagrams.
//! Buffers come out through an RAII guard that puts them back on drop,
//! so every exit path returns its buffer. Contents are not zeroed on
//! return; they are overwritten before use.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Buffer size for TCP relay copies.
pub const TCP_BUFFER_SIZE: usize = 32 * 1024;

/// Buffer size for UDP datagrams (maximum UDP payload over IPv4).
pub const UDP_BUFFER_SIZE: usize = 65507;

/// A pool of fixed-size byte buffers with a locked free list.
#[derive(Debug)]
pub struct BufferPool {
    buf_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buf_size` bytes.
    pub fn new(buf_size: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            buf_size,
            free: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Borrow a buffer, allocating a fresh one when the free list is empty.
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size]);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Size of the buffers this pool hands out.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently borrowed.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Number of buffers sitting on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().expect("buffer pool lock poisoned").len()
    }

    fn put(&self, buf: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().expect("buffer pool lock poisoned").push(buf);
    }
}

/// RAII guard for a borrowed buffer; returns it to the pool on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().expect("buffer already returned")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().expect("buffer already returned")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_full_size() {
        let pool = BufferPool::new(TCP_BUFFER_SIZE);
        let buf = pool.get();
        assert_eq!(buf.len(), TCP_BUFFER_SIZE);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_drop_returns_buffer() {
        let pool = BufferPool::new(64);
        {
            let _buf = pool.get();
            assert_eq!(pool.in_use(), 1);
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_reuse_does_not_zero() {
        let pool = BufferPool::new(8);
        {
            let mut buf = pool.get();
            buf[0] = 0xAB;
        }
        let buf = pool.get();
        assert_eq!(buf[0], 0xAB);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_no_leaks_after_burst() {
        let pool = BufferPool::new(16);
        let burst: Vec<_> = (0..100).map(|_| pool.get()).collect();
        assert_eq!(pool.in_use(), 100);
        drop(burst);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle(), 100);
    }

    #[test]
    fn test_concurrent_borrow_return() {
        let pool = BufferPool::new(32);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let mut buf = pool.get();
                    buf[0] = 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
