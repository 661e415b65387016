//! Free-list of client read buffers.
//!
//! Each connection borrows one `BytesMut` for its lifetime and hands it back
//! on drop. Returned buffers are cleared; buffers that grew far beyond the
//! configured size are dropped instead of retained.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

/// Largest capacity, as a multiple of the buffer size, worth retaining.
const MAX_RETAINED_FACTOR: usize = 4;

pub struct BufferPool {
    buffers: Mutex<VecDeque<BytesMut>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(VecDeque::with_capacity(max_idle.min(1024))),
            buffer_size: buffer_size.max(1),
            max_idle,
        })
    }

    /// Borrow an empty buffer.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .buffers
            .lock()
            .pop_front()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Idle buffers currently retained.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.buffer_size * MAX_RETAINED_FACTOR {
            trace!(capacity = buf.capacity(), "dropping oversized read buffer");
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle {
            buffers.push_back(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused_and_reset() {
        let pool = BufferPool::new(64, 2);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"leftover");
        }
        assert_eq!(pool.idle(), 1);
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn retention_is_bounded() {
        let pool = BufferPool::new(16, 1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn oversized_buffers_are_dropped() {
        let pool = BufferPool::new(16, 4);
        {
            let mut buf = pool.acquire();
            buf.reserve(16 * 1024);
        }
        assert_eq!(pool.idle(), 0);
    }
}
