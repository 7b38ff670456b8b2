//! Stream Ring - Fixed-capacity byte ring shared between interrupt and foreground
//!
//! # Purpose
//! Provides the circular byte buffers that sit between a serial peripheral's
//! interrupt routine and the foreground control loop. One ring carries received
//! bytes (produced in interrupt context), the other carries bytes waiting to be
//! transmitted (produced in foreground context).
//!
//! # Integration Points
//! - Depends on: nothing (core only)
//! - Provides to: `serial-stream` (StreamPort and InterruptRouter)
//!
//! # Architecture
//! Lock-free single-producer/single-consumer ring using atomic indices:
//! - Producer writes the slot, then publishes `head` with Release ordering
//! - Consumer loads `head` with Acquire ordering before trusting the slot
//! - One slot always stays empty so that `head == tail` means empty and
//!   `head + 1 == tail` means full
//!
//! Capacity `N` must be a power of two so index wrap is a mask. This is
//! checked when the ring is constructed.

#![no_std]

#[cfg(test)]
extern crate std;

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use static_assertions::const_assert;

/// Default receive ring capacity (bytes, including the reserved slot)
pub const DEFAULT_RX_CAPACITY: usize = 1024;

/// Default transmit ring capacity (bytes, including the reserved slot)
pub const DEFAULT_TX_CAPACITY: usize = 512;

const_assert!(DEFAULT_RX_CAPACITY.is_power_of_two());
const_assert!(DEFAULT_TX_CAPACITY.is_power_of_two());

/// Fixed-capacity circular byte buffer
///
/// # Type Parameters
/// * `N` - Slot count (must be a power of 2, at least 2). Usable capacity is `N - 1`.
///
/// # Safety
/// All methods take `&self` so the ring can live in a `static` shared by an
/// interrupt routine and foreground code. Correctness relies on the caller
/// keeping the SPSC discipline: only the producer calls [`try_push`], only the
/// consumer calls [`try_pop`]. [`Producer`] and [`Consumer`] handles make that
/// split explicit.
///
/// [`try_push`]: RingBuffer::try_push
/// [`try_pop`]: RingBuffer::try_pop
pub struct RingBuffer<const N: usize> {
    /// Slot storage
    buffer: UnsafeCell<[u8; N]>,
    /// Next slot to write (advanced by producer)
    head: AtomicUsize,
    /// Next slot to read (advanced by consumer)
    tail: AtomicUsize,
    /// Sticky flag raised by the producer when a byte had to be dropped
    overflow: AtomicBool,
}

// Slots are only touched through raw pointers at indices owned by one side.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> RingBuffer<N> {
    const MASK: usize = N - 1;

    const VALID_CAPACITY: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "Ring buffer size must be power of 2"
    );

    /// Create a new empty ring
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_CAPACITY;

        Self {
            buffer: UnsafeCell::new([0; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    /// Number of bytes the ring can hold at once
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut u8 {
        debug_assert!(index < N);
        // SAFETY: index is always masked into 0..N
        unsafe { (self.buffer.get() as *mut u8).add(index) }
    }

    /// Push a byte (producer side)
    ///
    /// Returns `false` without touching any state when the ring is full. What
    /// happens to the rejected byte is the caller's decision.
    pub fn try_push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let next = (head + 1) & Self::MASK;

        if next == tail {
            return false;
        }

        // SAFETY: the slot at `head` is not visible to the consumer until the
        // Release store below publishes it.
        unsafe { self.slot(head).write_volatile(byte) };
        self.head.store(next, Ordering::Release);
        true
    }

    /// Pop a byte (consumer side)
    ///
    /// Returns `None` if the ring is empty.
    pub fn try_pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: Acquire load of `head` makes the producer's slot write visible.
        let byte = unsafe { self.slot(tail).read_volatile() };
        self.tail.store((tail + 1) & Self::MASK, Ordering::Release);
        Some(byte)
    }

    /// Look at the next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        if head == tail {
            None
        } else {
            Some(unsafe { self.slot(tail).read_volatile() })
        }
    }

    /// Number of queued bytes
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & Self::MASK
    }

    /// Number of bytes that can still be pushed
    pub fn free_count(&self) -> usize {
        Self::MASK - self.count()
    }

    /// Check if the ring is empty
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Check if the ring is full
    pub fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    /// Drop everything queued
    ///
    /// Moves `tail` onto `head`, so from the flushing side's point of view the
    /// ring is emptied in one store.
    ///
    /// `tail` belongs to the consumer. When the producer flushes, the consumer
    /// must be held off (e.g. inside a critical section that masks its
    /// interrupt) or a pop in flight can move `tail` back.
    pub fn flush(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }

    /// Replace the contents with a single sentinel byte
    ///
    /// The next [`try_pop`](Self::try_pop) returns exactly `sentinel`, ahead of
    /// anything the producer queues afterwards.
    ///
    /// Called from the consumer side, but writes `head`. The producer must be
    /// held off for the duration or its push can land in the sentinel's slot.
    pub fn cancel_and_signal(&self, sentinel: u8) {
        let head = self.head.load(Ordering::Acquire);

        unsafe { self.slot(head).write_volatile(sentinel) };
        self.tail.store(head, Ordering::Release);
        self.head.store((head + 1) & Self::MASK, Ordering::Release);
    }

    /// Check the sticky overflow flag
    pub fn overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Raise the overflow flag (producer side)
    pub fn set_overflow(&self) {
        self.overflow.store(true, Ordering::Release);
    }

    /// Clear the overflow flag, returning its previous value
    pub fn clear_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }

    /// Handle for the writing side
    pub fn producer(&self) -> Producer<'_, N> {
        Producer { ring: self }
    }

    /// Handle for the reading side
    pub fn consumer(&self) -> Consumer<'_, N> {
        Consumer { ring: self }
    }

    /// Split into producer and consumer handles
    pub fn split(&self) -> (Producer<'_, N>, Consumer<'_, N>) {
        (self.producer(), self.consumer())
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for RingBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("slots", &N)
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("count", &self.count())
            .field("overflow", &self.overflow())
            .finish()
    }
}

/// Producer handle for a ring
///
/// Only allows the operations that belong to the writing side.
#[derive(Clone, Copy)]
pub struct Producer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<'a, const N: usize> Producer<'a, N> {
    /// Push a byte into the ring
    pub fn try_push(&self, byte: u8) -> bool {
        self.ring.try_push(byte)
    }

    /// Push a byte, raising the overflow flag if it had to be dropped
    pub fn push_or_flag(&self, byte: u8) -> bool {
        let pushed = self.ring.try_push(byte);
        if !pushed {
            self.ring.set_overflow();
        }
        pushed
    }

    /// Remaining free slots
    pub fn free_count(&self) -> usize {
        self.ring.free_count()
    }

    /// Check if the ring is full
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

/// Consumer handle for a ring
///
/// Only allows the operations that belong to the reading side.
#[derive(Clone, Copy)]
pub struct Consumer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<'a, const N: usize> Consumer<'a, N> {
    /// Pop a byte from the ring
    pub fn try_pop(&self) -> Option<u8> {
        self.ring.try_pop()
    }

    /// Queued byte count
    pub fn count(&self) -> usize {
        self.ring.count()
    }

    /// Look at the next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.ring.peek()
    }

    /// Check if the ring is empty
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Drop everything queued
    pub fn flush(&self) {
        self.ring.flush()
    }

    /// See [`RingBuffer::cancel_and_signal`]
    pub fn cancel_and_signal(&self, sentinel: u8) {
        self.ring.cancel_and_signal(sentinel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_new_ring_is_empty() {
        let ring = RingBuffer::<16>::new();
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.free_count(), 15);
        assert_eq!(ring.capacity(), 15);
        assert_eq!(ring.try_pop(), None);
        assert!(!ring.overflow());
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let ring = RingBuffer::<16>::new();
        let input = b"G1 X10 F300\n";

        for &b in input.iter() {
            assert!(ring.try_push(b));
        }
        assert_eq!(ring.count(), input.len());

        let output: Vec<u8> = core::iter::from_fn(|| ring.try_pop()).collect();
        assert_eq!(output, input);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_keeps_oldest_bytes() {
        let ring = RingBuffer::<16>::new();
        let (producer, consumer) = ring.split();

        let mut accepted = 0;
        for b in 0u8..20 {
            if producer.push_or_flag(b) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 15);
        assert!(ring.overflow());
        assert!(ring.is_full());
        assert_eq!(ring.count(), 15);

        for expected in 0u8..15 {
            assert_eq!(consumer.try_pop(), Some(expected));
        }
        assert_eq!(consumer.try_pop(), None);
        // Flag is sticky until cleared explicitly
        assert!(ring.overflow());
        assert!(ring.clear_overflow());
        assert!(!ring.overflow());
    }

    #[test]
    fn test_failed_push_changes_nothing() {
        let ring = RingBuffer::<4>::new();
        assert!(ring.try_push(1));
        assert!(ring.try_push(2));
        assert!(ring.try_push(3));
        assert!(!ring.try_push(4));
        assert!(!ring.overflow());
        assert_eq!(ring.count(), 3);
        assert_eq!(ring.peek(), Some(1));
    }

    #[test]
    fn test_count_invariant_under_interleaving() {
        let ring = RingBuffer::<32>::new();
        let mut model: std::collections::VecDeque<u8> = std::collections::VecDeque::new();
        let mut seed: u32 = 0x1234_5678;

        for step in 0..5000u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if (seed >> 16) % 3 != 0 {
                let byte = (step & 0xFF) as u8;
                if ring.try_push(byte) {
                    model.push_back(byte);
                } else {
                    assert_eq!(model.len(), 31);
                }
            } else {
                assert_eq!(ring.try_pop(), model.pop_front());
            }

            assert_eq!(ring.count(), model.len());
            assert!(ring.count() <= ring.capacity());
            assert_eq!(ring.free_count() + ring.count(), 31);
        }
    }

    #[test]
    fn test_flush_discards_pending() {
        let ring = RingBuffer::<8>::new();
        for b in 0..5 {
            ring.try_push(b);
        }
        ring.flush();
        assert!(ring.is_empty());
        assert_eq!(ring.free_count(), 7);
        assert!(ring.try_push(9));
        assert_eq!(ring.try_pop(), Some(9));
    }

    #[test]
    fn test_cancel_and_signal_leaves_only_sentinel() {
        let ring = RingBuffer::<16>::new();
        for b in b"M3 S1000\n".iter() {
            ring.try_push(*b);
        }
        ring.try_pop();

        ring.cancel_and_signal(0x18);

        assert_eq!(ring.count(), 1);
        assert_eq!(ring.try_pop(), Some(0x18));
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn test_cancel_on_full_and_wrapped_ring() {
        let ring = RingBuffer::<8>::new();
        // Walk the indices past the wrap point first
        for b in 0..6 {
            ring.try_push(b);
        }
        for _ in 0..6 {
            ring.try_pop();
        }
        while ring.try_push(0xAA) {}
        assert!(ring.is_full());

        ring.cancel_and_signal(0x18);
        assert_eq!(ring.count(), 1);
        assert!(ring.try_push(b'?'));
        assert_eq!(ring.try_pop(), Some(0x18));
        assert_eq!(ring.try_pop(), Some(b'?'));
    }

    #[test]
    fn test_spsc_across_threads() {
        static RING: RingBuffer<64> = RingBuffer::new();
        const TOTAL: usize = 100_000;

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut sent = 0usize;
                while sent < TOTAL {
                    if RING.try_push((sent % 251) as u8) {
                        sent += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            });

            let mut received = 0usize;
            while received < TOTAL {
                match RING.try_pop() {
                    Some(b) => {
                        assert_eq!(b, (received % 251) as u8);
                        received += 1;
                    }
                    None => std::thread::yield_now(),
                }
            }
        });

        assert!(RING.is_empty());
        assert!(!RING.overflow());
    }
}
