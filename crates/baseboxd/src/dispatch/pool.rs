//! Bounded pool of packet buffers for frames travelling from the tap
//! devices to the datapath.

use std::ops::Deref;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tracing::info;

use crate::error::{BaseboxError, Result};

#[derive(Debug)]
struct Shared {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

/// Fixed number of preallocated buffers; [`PacketPool::acquire`] never
/// blocks and never allocates.
#[derive(Debug, Clone)]
pub struct PacketPool {
    shared: Arc<Shared>,
}

impl PacketPool {
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let free = ArrayQueue::new(pool_size.max(1));
        for _ in 0..pool_size {
            // cannot be full, capacity is pool_size
            let _ = free.push(Vec::with_capacity(buffer_size));
        }
        info!(buffers = pool_size, buffer_size, "packet pool created");
        Self {
            shared: Arc::new(Shared { free, buffer_size }),
        }
    }

    /// Takes a buffer and fills it with `frame`.
    ///
    /// Fails with [`BaseboxError::PoolExhausted`] when no buffer is free and
    /// with [`BaseboxError::InvalidArgument`] when `frame` does not fit.
    pub fn acquire(&self, frame: &[u8]) -> Result<PacketBuffer> {
        if frame.len() > self.shared.buffer_size {
            return Err(BaseboxError::InvalidArgument(format!(
                "frame of {} bytes exceeds buffer size {}",
                frame.len(),
                self.shared.buffer_size
            )));
        }
        let mut data = self.shared.free.pop().ok_or(BaseboxError::PoolExhausted)?;
        data.clear();
        data.extend_from_slice(frame);
        Ok(PacketBuffer {
            data,
            pool: Arc::clone(&self.shared),
        })
    }

    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.free.capacity()
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }
}

/// A frame held in a pool buffer; goes back to the pool on drop.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
    pool: Arc<Shared>,
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        // the pool never holds more than it handed out
        let _ = self.pool.free.push(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_acquire_and_release() {
        let pool = PacketPool::new(2, 64);
        let first = pool.acquire(&[1, 2, 3]).unwrap();
        assert_eq!(&*first, &[1, 2, 3]);
        assert_eq!(pool.available(), 1);
        drop(first);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhausted() {
        let pool = PacketPool::new(1, 64);
        let _held = pool.acquire(&[0; 10]).unwrap();
        assert!(matches!(pool.acquire(&[0; 10]), Err(BaseboxError::PoolExhausted)));
    }

    #[test]
    fn test_oversized_frame_keeps_pool_intact() {
        let pool = PacketPool::new(1, 64);
        assert!(matches!(
            pool.acquire(&[0; 65]),
            Err(BaseboxError::InvalidArgument(_))
        ));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_shared_bytes_hold_the_buffer() {
        let pool = PacketPool::new(1, 64);
        let bytes = bytes::Bytes::from_owner(pool.acquire(&[4, 5]).unwrap());
        let clone = bytes.clone();
        drop(bytes);
        assert_eq!(pool.available(), 0);
        assert_eq!(&clone[..], &[4, 5]);
        drop(clone);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_buffer_is_cleared_on_reuse() {
        let pool = PacketPool::new(1, 64);
        drop(pool.acquire(&[9; 20]).unwrap());
        let again = pool.acquire(&[1]).unwrap();
        assert_eq!(&*again, &[1]);
    }
}
