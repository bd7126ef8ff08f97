use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use tracing::trace;

pub(crate) const DEFAULT_BLOCK_CAPACITY: usize = 1024;

#[inline]
#[cold]
fn cold() {}

#[inline(always)]
fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}

struct Block<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    next: AtomicPtr<Block<T>>,
}

impl<T> Block<T> {
    fn alloc(capacity: usize) -> *mut Block<T> {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Block {
            slots,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

struct ProducerCursor<T> {
    tail: *mut Block<T>,
    write_idx: usize,
    reserved: u64,
    slot_open: bool,
}

struct ConsumerCursor<T> {
    head: *mut Block<T>,
    read_idx: usize,
    consumed: u64,
}

/// Unbounded append buffer for one producer and one consumer thread.
///
/// See the crate-level documentation for the access contract.
pub struct SpscBuffer<T> {
    committed: CachePadded<AtomicU64>,
    prod: UnsafeCell<ProducerCursor<T>>,
    cons: UnsafeCell<ConsumerCursor<T>>,
    block_capacity: usize,
}

unsafe impl<T: Send> Send for SpscBuffer<T> {}
unsafe impl<T: Send> Sync for SpscBuffer<T> {}

impl<T> SpscBuffer<T> {
    pub fn new() -> Self {
        Self::with_block_capacity(DEFAULT_BLOCK_CAPACITY)
    }

    pub fn with_block_capacity(block_capacity: usize) -> Self {
        assert!(block_capacity > 0, "block capacity must be non-zero");
        let first = Block::alloc(block_capacity);
        SpscBuffer {
            committed: CachePadded::new(AtomicU64::new(0)),
            prod: UnsafeCell::new(ProducerCursor {
                tail: first,
                write_idx: 0,
                reserved: 0,
                slot_open: false,
            }),
            cons: UnsafeCell::new(ConsumerCursor {
                head: first,
                read_idx: 0,
                consumed: 0,
            }),
            block_capacity,
        }
    }

    /// Producer-only. Returns a writable slot that must be fully initialized
    /// and then published with [`commit_slot`](Self::commit_slot) before the
    /// next reservation.
    #[allow(clippy::mut_from_ref)]
    pub fn reserve_slot(&self) -> &mut MaybeUninit<T> {
        let prod = unsafe { &mut *self.prod.get() };
        debug_assert!(!prod.slot_open, "previous slot was never committed");

        let slot = unsafe { &mut *(*prod.tail).slots[prod.write_idx].get() };
        prod.write_idx += 1;
        prod.slot_open = true;

        // Keep the tail pointing at a block with free space so a fully
        // drained block is never also the producer's current block.
        if unlikely(prod.write_idx == self.block_capacity) {
            let next = Block::alloc(self.block_capacity);
            unsafe { (*prod.tail).next.store(next, Ordering::Release) };
            prod.tail = next;
            prod.write_idx = 0;
            trace!(reserved = prod.reserved + 1, "linked new block");
        }

        slot
    }

    /// Producer-only. Publishes the slot returned by the last
    /// [`reserve_slot`](Self::reserve_slot) to the consumer.
    pub fn commit_slot(&self) {
        let prod = unsafe { &mut *self.prod.get() };
        debug_assert!(prod.slot_open, "commit without a reserved slot");
        prod.slot_open = false;
        prod.reserved += 1;
        self.committed.store(prod.reserved, Ordering::Release);
    }

    /// Producer-only convenience for `reserve_slot` + write + `commit_slot`.
    #[inline]
    pub fn push(&self, value: T) {
        self.reserve_slot().write(value);
        self.commit_slot();
    }

    /// Consumer-only. Cheap check for committed-but-undrained elements.
    pub fn has_pending(&self) -> bool {
        let cons = unsafe { &*self.cons.get() };
        self.committed.load(Ordering::Acquire) > cons.consumed
    }

    /// Consumer-only. Number of committed-but-undrained elements.
    pub fn pending_len(&self) -> u64 {
        let cons = unsafe { &*self.cons.get() };
        self.committed
            .load(Ordering::Acquire)
            .saturating_sub(cons.consumed)
    }

    /// Consumer-only. Moves every committed element into `out`, in commit
    /// order. If `out`'s spare capacity exceeds `max_slack_bytes` it is
    /// shrunk first (pass a negative value to never shrink); capacity for
    /// the whole batch is then reserved once. Fully drained blocks are
    /// freed.
    pub fn drain_all(&self, out: &mut Vec<T>, max_slack_bytes: i64) {
        let committed = self.committed.load(Ordering::Acquire);
        let cons = unsafe { &mut *self.cons.get() };
        let n = (committed - cons.consumed) as usize;

        if max_slack_bytes >= 0 {
            let slack = (out.capacity() - out.len()) * std::mem::size_of::<T>();
            if slack as i64 > max_slack_bytes {
                out.shrink_to_fit();
            }
        }
        out.reserve(n);

        for _ in 0..n {
            if cons.read_idx == self.block_capacity {
                let next = unsafe { (*cons.head).next.load(Ordering::Acquire) };
                debug_assert!(!next.is_null(), "committed element past unlinked block");
                drop(unsafe { Box::from_raw(cons.head) });
                cons.head = next;
                cons.read_idx = 0;
            }
            let value = unsafe {
                ptr::read((*cons.head).slots[cons.read_idx].get()).assume_init()
            };
            out.push(value);
            cons.read_idx += 1;
            cons.consumed += 1;
        }

        if n > 0 {
            trace!(drained = n, consumed = cons.consumed, "drained buffer");
        }
    }
}

impl<T> Default for SpscBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SpscBuffer<T> {
    fn drop(&mut self) {
        let committed = self.committed.load(Ordering::Acquire);
        let cons = unsafe { &mut *self.cons.get() };
        let mut remaining = committed - cons.consumed;

        // Drop committed-but-undrained elements in place, then free the
        // whole block chain (including trailing blocks with no committed
        // elements and any reserved-but-uncommitted slot, which is uninit).
        while remaining > 0 {
            if cons.read_idx == self.block_capacity {
                let next = unsafe { (*cons.head).next.load(Ordering::Acquire) };
                drop(unsafe { Box::from_raw(cons.head) });
                cons.head = next;
                cons.read_idx = 0;
            }
            unsafe {
                ptr::drop_in_place(
                    (*(*cons.head).slots[cons.read_idx].get()).as_mut_ptr(),
                );
            }
            cons.read_idx += 1;
            remaining -= 1;
        }

        let mut block = cons.head;
        while !block.is_null() {
            let next = unsafe { (*block).next.load(Ordering::Acquire) };
            drop(unsafe { Box::from_raw(block) });
            block = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[fixture]
    fn small_buffer() -> SpscBuffer<u64> {
        SpscBuffer::with_block_capacity(4)
    }

    #[rstest]
    fn test_empty_buffer(small_buffer: SpscBuffer<u64>) {
        assert!(!small_buffer.has_pending());
        assert_eq!(small_buffer.pending_len(), 0);

        let mut out = Vec::new();
        small_buffer.drain_all(&mut out, -1);
        assert!(out.is_empty());
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(5)]
    #[case(64)]
    fn test_commit_order_across_blocks(small_buffer: SpscBuffer<u64>, #[case] n: u64) {
        for i in 0..n {
            small_buffer.push(i);
        }
        assert_eq!(small_buffer.pending_len(), n);

        let mut out = Vec::new();
        small_buffer.drain_all(&mut out, -1);
        assert_eq!(out, (0..n).collect::<Vec<_>>());
        assert!(!small_buffer.has_pending());
    }

    #[rstest]
    fn test_reserve_commit_primitive_pair(small_buffer: SpscBuffer<u64>) {
        small_buffer.reserve_slot().write(7);
        // Not visible until committed.
        assert!(!small_buffer.has_pending());
        small_buffer.commit_slot();
        assert!(small_buffer.has_pending());

        let mut out = Vec::new();
        small_buffer.drain_all(&mut out, -1);
        assert_eq!(out, vec![7]);
    }

    #[rstest]
    fn test_interleaved_drains(small_buffer: SpscBuffer<u64>) {
        let mut out = Vec::new();
        let mut total = Vec::new();
        for i in 0..30u64 {
            small_buffer.push(i);
            if i % 3 == 0 {
                small_buffer.drain_all(&mut out, -1);
                total.append(&mut out);
            }
        }
        small_buffer.drain_all(&mut out, -1);
        total.append(&mut out);
        assert_eq!(total, (0..30).collect::<Vec<_>>());
    }

    #[rstest]
    fn test_slack_trim() {
        let buffer: SpscBuffer<u64> = SpscBuffer::with_block_capacity(8);
        let mut out: Vec<u64> = Vec::with_capacity(4096);
        buffer.push(1);
        buffer.drain_all(&mut out, 64);
        // 4096 * 8 bytes of slack exceeds the 64-byte cap, so the backing
        // storage was shrunk before reserving for the single element.
        assert!(out.capacity() < 4096);
        assert_eq!(out, vec![1]);
    }

    #[rstest]
    fn test_negative_slack_never_trims() {
        let buffer: SpscBuffer<u64> = SpscBuffer::with_block_capacity(8);
        let mut out: Vec<u64> = Vec::with_capacity(4096);
        buffer.push(1);
        buffer.drain_all(&mut out, -1);
        assert!(out.capacity() >= 4096);
    }

    #[rstest]
    fn test_non_copy_elements() {
        let buffer: SpscBuffer<String> = SpscBuffer::with_block_capacity(2);
        for i in 0..5 {
            buffer.push(format!("sample-{i}"));
        }
        let mut out = Vec::new();
        buffer.drain_all(&mut out, -1);
        assert_eq!(out.len(), 5);
        assert_eq!(out[4], "sample-4");
    }

    struct DropCounted(Arc<AtomicUsize>);

    impl Drop for DropCounted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[rstest]
    fn test_drop_releases_undrained_elements() {
        let drops = Arc::new(AtomicUsize::new(0));
        let buffer: SpscBuffer<DropCounted> = SpscBuffer::with_block_capacity(2);
        for _ in 0..5 {
            buffer.push(DropCounted(drops.clone()));
        }
        let mut out = Vec::new();
        buffer.drain_all(&mut out, -1);
        drop(out);
        assert_eq!(drops.load(Ordering::SeqCst), 5);

        let drops2 = Arc::new(AtomicUsize::new(0));
        let buffer: SpscBuffer<DropCounted> = SpscBuffer::with_block_capacity(2);
        for _ in 0..5 {
            buffer.push(DropCounted(drops2.clone()));
        }
        drop(buffer);
        assert_eq!(drops2.load(Ordering::SeqCst), 5);
    }

    #[rstest]
    fn test_concurrent_producer_consumer() {
        let buffer: Arc<SpscBuffer<u64>> = Arc::new(SpscBuffer::with_block_capacity(16));
        let num_messages = 100_000u64;

        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 0..num_messages {
                    buffer.push(i);
                }
            })
        };

        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut received = Vec::new();
                let mut out = Vec::new();
                while (received.len() as u64) < num_messages {
                    buffer.drain_all(&mut out, -1);
                    received.append(&mut out);
                    thread::yield_now();
                }
                received
            })
        };

        producer.join().expect("producer thread panicked");
        let received = consumer.join().expect("consumer thread panicked");

        assert_eq!(received.len() as u64, num_messages);
        for (i, value) in received.iter().enumerate() {
            assert_eq!(*value, i as u64);
        }
    }
}
