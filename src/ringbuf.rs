//! Single-producer single-consumer index rings for the interrupt/foreground
//! packet hand-off.
//!
//! A [`RingIndex`] manages indices into a storage array owned by the caller:
//! the producer reserves a slot with `peek_put`, fills the backing entry,
//! then publishes it with `put`. The consumer mirrors this with
//! `peek_get`/`get`, reading the entry before releasing the slot. Capacity
//! must be a power of two so free-running counters can be masked.

use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RingIndex<const N: usize> {
    put: AtomicUsize,
    get: AtomicUsize,
}

impl<const N: usize> RingIndex<N> {
    const POWER_OF_TWO: () = assert!(N.is_power_of_two());
    const MASK: usize = N - 1;

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::POWER_OF_TWO;
        Self {
            put: AtomicUsize::new(0),
            get: AtomicUsize::new(0),
        }
    }

    /// Number of published, unconsumed entries
    pub fn elements(&self) -> usize {
        self.put
            .load(Ordering::Acquire)
            .wrapping_sub(self.get.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.elements() == 0
    }

    pub fn is_full(&self) -> bool {
        self.elements() == N
    }

    /// Reserve the next write index without publishing it.
    ///
    /// Returns `None` when the ring is full. The reservation is implicit:
    /// the producer is single, so the index stays valid until `put`.
    pub fn peek_put(&self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.put.load(Ordering::Relaxed) & Self::MASK)
    }

    /// Publish the previously reserved entry.
    ///
    /// The backing entry must be fully written first; the release store is
    /// what makes it visible to the consumer.
    pub fn put(&self) {
        let put = self.put.load(Ordering::Relaxed);
        self.put.store(put.wrapping_add(1), Ordering::Release);
    }

    /// Index of the oldest published entry, if any
    pub fn peek_get(&self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        Some(self.get.load(Ordering::Relaxed) & Self::MASK)
    }

    /// Release the oldest entry after its contents have been read
    pub fn get(&self) {
        let get = self.get.load(Ordering::Relaxed);
        self.get.store(get.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserve_publish_consume() {
        let ring: RingIndex<4> = RingIndex::new();
        assert!(ring.is_empty());

        // Reservation alone publishes nothing
        assert_eq!(ring.peek_put(), Some(0));
        assert!(ring.is_empty());

        ring.put();
        assert_eq!(ring.elements(), 1);
        assert_eq!(ring.peek_get(), Some(0));

        ring.get();
        assert!(ring.is_empty());
        assert_eq!(ring.peek_get(), None);
    }

    #[test]
    fn full_ring_refuses_reservation() {
        let ring: RingIndex<2> = RingIndex::new();

        assert_eq!(ring.peek_put(), Some(0));
        ring.put();
        assert_eq!(ring.peek_put(), Some(1));
        ring.put();

        assert!(ring.is_full());
        assert_eq!(ring.peek_put(), None);

        // Consuming one frees one slot, indices keep cycling
        ring.get();
        assert_eq!(ring.peek_put(), Some(0));
    }

    #[test]
    fn indices_wrap_with_mask() {
        let ring: RingIndex<2> = RingIndex::new();

        for i in 0..7 {
            assert_eq!(ring.peek_put(), Some(i % 2));
            ring.put();
            assert_eq!(ring.peek_get(), Some(i % 2));
            ring.get();
        }
    }
}
