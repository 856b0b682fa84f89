use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::error::{StoryError, StoryResult};
use crate::media::{BYTES_PER_SAMPLE, MAX_BUFFER_SIZE};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_owner_id() -> u64 {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A reusable fixed-capacity byte buffer with a content window.
///
/// Exactly one holder owns a buffer between acquisition and release; since
/// release consumes the buffer by value, double-release and concurrent
/// sharing cannot be expressed. The owner tag still catches handing a buffer
/// back to a pool or queue that never allocated it.
#[derive(Debug)]
pub struct MediaBuffer {
    owner: u64,
    slot: usize,
    data: Vec<u8>,
    len: usize,
}

impl MediaBuffer {
    pub(crate) fn new(owner: u64, slot: usize, capacity: usize) -> Self {
        Self {
            owner,
            slot,
            data: vec![0; capacity],
            len: 0,
        }
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current content window.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reset the content window without touching capacity.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Replace the content window with raw bytes.
    pub fn write_bytes(&mut self, src: &[u8]) -> StoryResult<()> {
        if src.len() > self.data.len() {
            return Err(StoryError::invalid_buffer(format!(
                "write of {} bytes exceeds buffer capacity {}",
                src.len(),
                self.data.len()
            )));
        }
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
        Ok(())
    }

    /// Replace the content window with interleaved i16 samples.
    pub fn write_samples(&mut self, samples: &[i16]) -> StoryResult<()> {
        let byte_len = samples.len() * BYTES_PER_SAMPLE;
        if byte_len > self.data.len() {
            return Err(StoryError::invalid_buffer(format!(
                "write of {} samples exceeds buffer capacity {}",
                samples.len(),
                self.data.len()
            )));
        }
        for (chunk, &s) in self.data.chunks_exact_mut(2).zip(samples.iter()) {
            chunk.copy_from_slice(&s.to_le_bytes());
        }
        self.len = byte_len;
        Ok(())
    }

    /// Append the content window to `out` as interleaved i16 samples.
    pub fn read_samples_into(&self, out: &mut Vec<i16>) {
        out.reserve(self.len / BYTES_PER_SAMPLE);
        for chunk in self.bytes().chunks_exact(2) {
            out.push(i16::from_le_bytes([chunk[0], chunk[1]]));
        }
    }

    /// Number of interleaved samples in the content window.
    pub fn sample_count(&self) -> usize {
        self.len / BYTES_PER_SAMPLE
    }
}

struct PoolSlot {
    /// `None` while the buffer is checked out.
    parked: Option<MediaBuffer>,
}

/// A growable pool of reusable buffers.
///
/// `acquire` hands out the first free buffer or grows the pool; `release`
/// validates ownership, clears the content window and parks the buffer for
/// reuse. Both operations are mutually exclusive critical sections, so one
/// pool may serve multiple concurrent callers.
pub struct BufferPool {
    id: u64,
    capacity: usize,
    slots: Mutex<Vec<PoolSlot>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BUFFER_SIZE)
    }

    /// Pool whose buffers each hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: next_owner_id(),
            capacity,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide shared pool.
    pub fn shared() -> &'static BufferPool {
        static SHARED: OnceLock<BufferPool> = OnceLock::new();
        SHARED.get_or_init(BufferPool::new)
    }

    /// Take a free buffer, allocating a new one if none are parked.
    pub fn acquire(&self) -> MediaBuffer {
        let mut slots = self.slots.lock().expect("buffer pool lock poisoned");
        for slot in slots.iter_mut() {
            if let Some(buffer) = slot.parked.take() {
                return buffer;
            }
        }
        let index = slots.len();
        slots.push(PoolSlot { parked: None });
        MediaBuffer::new(self.id, index, self.capacity)
    }

    /// Park a buffer for reuse. Fails if the buffer was not allocated by
    /// this pool.
    pub fn release(&self, mut buffer: MediaBuffer) -> StoryResult<()> {
        if buffer.owner() != self.id {
            return Err(StoryError::invalid_buffer(
                "buffer released to a pool that does not own it",
            ));
        }
        let mut slots = self.slots.lock().expect("buffer pool lock poisoned");
        let slot = buffer.slot();
        if slot >= slots.len() {
            return Err(StoryError::invalid_buffer(
                "buffer slot index out of range for this pool",
            ));
        }
        buffer.clear();
        slots[slot].parked = Some(buffer);
        Ok(())
    }

    /// Number of buffers currently allocated (parked or checked out).
    pub fn allocated(&self) -> usize {
        self.slots.lock().expect("buffer pool lock poisoned").len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycles_do_not_grow_the_pool() {
        let pool = BufferPool::with_capacity(64);
        for _ in 0..100 {
            let buf = pool.acquire();
            pool.release(buf).unwrap();
        }
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn pool_grows_under_concurrent_checkout() {
        let pool = BufferPool::with_capacity(64);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.allocated(), 2);
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        let _c = pool.acquire();
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn releasing_a_foreign_buffer_is_rejected() {
        let pool_a = BufferPool::with_capacity(64);
        let pool_b = BufferPool::with_capacity(64);
        let buf = pool_a.acquire();
        let err = pool_b.release(buf).unwrap_err();
        assert!(err.to_string().contains("does not own"));
    }

    #[test]
    fn release_clears_the_content_window() {
        let pool = BufferPool::with_capacity(64);
        let mut buf = pool.acquire();
        buf.write_bytes(&[1, 2, 3]).unwrap();
        pool.release(buf).unwrap();
        let buf = pool.acquire();
        assert!(buf.is_empty());
        pool.release(buf).unwrap();
    }

    #[test]
    fn sample_round_trip() {
        let pool = BufferPool::with_capacity(16);
        let mut buf = pool.acquire();
        buf.write_samples(&[1, -2, 32_767, -32_768]).unwrap();
        assert_eq!(buf.sample_count(), 4);
        let mut out = Vec::new();
        buf.read_samples_into(&mut out);
        assert_eq!(out, vec![1, -2, 32_767, -32_768]);
        pool.release(buf).unwrap();
    }

    #[test]
    fn oversized_write_is_rejected() {
        let pool = BufferPool::with_capacity(4);
        let mut buf = pool.acquire();
        assert!(buf.write_samples(&[0; 3]).is_err());
        pool.release(buf).unwrap();
    }

    #[test]
    fn shared_pool_is_usable_from_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..50 {
                        let buf = BufferPool::shared().acquire();
                        BufferPool::shared().release(buf).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
