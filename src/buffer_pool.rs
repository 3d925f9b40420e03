use std::sync::{Mutex, PoisonError};

const MAX_POOL_SIZE: usize = 256;

/// Size of each relay buffer
pub const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Pool of fixed-size relay buffers shared by all flows
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a new buffer pool
    pub fn new(buf_size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buf_size,
            max_pooled,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Get a buffer from the pool or create a new one
    pub fn get_buffer(&self) -> Vec<u8> {
        let pooled = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match pooled {
            Some(buffer) if buffer.len() == self.buf_size => buffer,
            _ => vec![0u8; self.buf_size],
        }
    }

    /// Return a buffer to the pool for reuse
    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < self.buf_size || buffer.capacity() > self.buf_size * 2 {
            return;
        }

        // Zero the buffer on return to avoid leaking data between flows
        buffer.clear();
        buffer.resize(self.buf_size, 0);

        let mut pool = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }

    /// Get statistics about the buffer pool
    pub fn stats(&self) -> BufferPoolStats {
        let available = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        BufferPoolStats {
            buffers_available: available,
            total_memory_pooled: available * self.buf_size,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(RELAY_BUF_SIZE, MAX_POOL_SIZE)
    }
}

/// Statistics about the buffer pool
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub buffers_available: usize,
    pub total_memory_pooled: usize,
}

/// Global buffer pool instance
pub static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

/// Get or initialize the global buffer pool
pub fn get_buffer_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::default)
}

/// RAII lease that returns the buffer to its pool on drop
pub struct BufferLease<'a> {
    buffer: Vec<u8>,
    pool: &'a BufferPool,
}

impl<'a> BufferLease<'a> {
    /// Create a new lease by pulling a buffer from `pool`
    pub fn new(pool: &'a BufferPool) -> Self {
        Self {
            buffer: pool.get_buffer(),
            pool,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Access the underlying buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Length of the buffer (always the pool's buffer size)
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        self.pool.return_buffer(std::mem::take(&mut self.buffer));
    }
}

/// Convenience function to lease a buffer from the global pool
pub fn lease_buffer() -> BufferLease<'static> {
    BufferLease::new(get_buffer_pool())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic_operations() {
        let pool = BufferPool::new(1024, 4);

        let buf = pool.get_buffer();
        assert_eq!(buf.len(), 1024);

        pool.return_buffer(buf);
        assert_eq!(pool.stats().buffers_available, 1);

        let reused = pool.get_buffer();
        assert_eq!(reused.len(), 1024);
        assert_eq!(pool.stats().buffers_available, 0);
    }

    #[test]
    fn test_buffer_pool_size_limit() {
        let pool = BufferPool::new(1024, 4);

        let bufs: Vec<_> = (0..10).map(|_| pool.get_buffer()).collect();
        for buf in bufs {
            pool.return_buffer(buf);
        }

        assert_eq!(pool.stats().buffers_available, 4);
        assert_eq!(pool.stats().total_memory_pooled, 4 * 1024);
    }

    #[test]
    fn test_buffer_pool_wrong_size_rejection() {
        let pool = BufferPool::new(1024, 4);

        pool.return_buffer(vec![0u8; 256]);

        assert_eq!(pool.stats().buffers_available, 0);
    }

    #[test]
    fn test_reused_buffer_is_zeroed() {
        let pool = BufferPool::new(1024, 4);

        let mut buf = pool.get_buffer();
        buf.fill(0xAA);
        buf.truncate(128);
        pool.return_buffer(buf);

        let reused = pool.get_buffer();
        assert_eq!(reused.len(), 1024);
        assert!(reused.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_lease_returns_buffer_on_drop() {
        let pool = BufferPool::new(512, 4);

        {
            let mut lease = BufferLease::new(&pool);
            assert_eq!(lease.len(), 512);
            lease.as_mut_slice()[0] = 7;
            assert_eq!(pool.stats().buffers_available, 0);
        }

        assert_eq!(pool.stats().buffers_available, 1);
    }

    #[test]
    fn test_lease_returns_buffer_on_unwind() {
        let pool = BufferPool::new(512, 4);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _lease = BufferLease::new(&pool);
            panic!("copy loop failed");
        }));

        assert!(result.is_err());
        assert_eq!(pool.stats().buffers_available, 1);
    }
}
