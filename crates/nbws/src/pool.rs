//! Pooled byte-buffer allocation.
//!
//! Payload and accumulation buffers churn on every read, so the engine
//! allocates them through an [`Allocator`] shared by all connections of an
//! [`Engine`](crate::Engine). The default [`BucketPool`] keeps freed buffers
//! in power-of-two size classes and hands them back on the next `malloc`.

use std::sync::Mutex;

use bytes::BytesMut;

/// Pooled byte-buffer allocator.
///
/// `malloc` returns an *empty* buffer with capacity for at least `n` bytes;
/// callers fill it with `extend_from_slice`. `free` returns a buffer to the
/// pool for reuse. Implementations must be safe for concurrent use across
/// connections.
pub trait Allocator: Send + Sync {
    fn malloc(&self, n: usize) -> BytesMut;
    fn free(&self, buf: BytesMut);
}

/// Smallest size class, 256 bytes.
const MIN_CLASS_SHIFT: u32 = 8;
/// Largest pooled size class, 512 KiB. Bigger buffers are not retained.
const NUM_CLASSES: usize = 12;
/// Retained buffers per class; beyond this, freed buffers just drop.
const MAX_FREE_PER_CLASS: usize = 32;

/// Size-class buffer pool.
///
/// Each class holds buffers of capacity `2^(MIN_CLASS_SHIFT + class)` or
/// more, behind its own lock so connections on different threads rarely
/// contend on the same class.
pub struct BucketPool {
    classes: [Mutex<Vec<BytesMut>>; NUM_CLASSES],
}

impl BucketPool {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Smallest class whose buffers can hold `n` bytes.
    fn class_for_request(n: usize) -> Option<usize> {
        let bits = usize::BITS - n.saturating_sub(1).leading_zeros();
        let class = bits.saturating_sub(MIN_CLASS_SHIFT) as usize;
        (class < NUM_CLASSES).then_some(class)
    }

    /// Largest class whose size a buffer of capacity `cap` satisfies.
    /// Buffers beyond the largest class are not retained.
    fn class_for_capacity(cap: usize) -> Option<usize> {
        if cap < (1 << MIN_CLASS_SHIFT) {
            return None;
        }
        let class = (usize::BITS - 1 - cap.leading_zeros() - MIN_CLASS_SHIFT) as usize;
        (class < NUM_CLASSES).then_some(class)
    }
}

impl Default for BucketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for BucketPool {
    fn malloc(&self, n: usize) -> BytesMut {
        let Some(class) = Self::class_for_request(n) else {
            return BytesMut::with_capacity(n);
        };
        if let Ok(mut free) = self.classes[class].lock() {
            if let Some(mut buf) = free.pop() {
                buf.clear();
                return buf;
            }
        }
        BytesMut::with_capacity(1 << (MIN_CLASS_SHIFT + class as u32))
    }

    fn free(&self, buf: BytesMut) {
        let Some(class) = Self::class_for_capacity(buf.capacity()) else {
            return;
        };
        if let Ok(mut free) = self.classes[class].lock() {
            if free.len() < MAX_FREE_PER_CLASS {
                free.push(buf);
            }
        }
    }
}
