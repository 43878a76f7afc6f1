use super::entry::CompletionEntry;
use super::mmap::MappedRegion;
use crate::sys::Params;
use std::sync::atomic::{AtomicU32, Ordering};

/// Consumer side of the CQ ring. The application is the only consumer, so it
/// is the only writer of the head.
#[derive(Debug)]
pub(crate) struct CompletionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    overflow: *const AtomicU32,
    cqes: *const CompletionEntry,
    mask: u32,
    entries: u32,
}

impl CompletionQueue {
    /// # Safety
    ///
    /// `ring` must be the `IORING_OFF_CQ_RING` mapping created from `params`
    /// and must outlive the returned queue.
    pub(crate) unsafe fn new(ring: &MappedRegion, params: &Params) -> Self {
        let off = &params.cq_off;

        unsafe {
            Self {
                head: ring.at::<AtomicU32>(off.head),
                tail: ring.at::<AtomicU32>(off.tail),
                overflow: ring.at::<AtomicU32>(off.overflow),
                cqes: ring.at::<CompletionEntry>(off.cqes),
                mask: ring.at::<u32>(off.ring_mask).read(),
                entries: ring.at::<u32>(off.ring_entries).read(),
            }
        }
    }

    fn head(&self) -> &AtomicU32 {
        unsafe { &*self.head }
    }

    // Kernel writes the tail as it posts completions.
    fn tail(&self) -> &AtomicU32 {
        unsafe { &*self.tail }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.entries
    }

    /// Completions visible to the consumer right now.
    pub(crate) fn ready(&self) -> u32 {
        self.tail()
            .load(Ordering::Acquire)
            .wrapping_sub(self.head().load(Ordering::Relaxed))
    }

    /// Completions the kernel could not post because the ring was full.
    pub(crate) fn overflow(&self) -> u32 {
        unsafe { (*self.overflow).load(Ordering::Acquire) }
    }

    /// Hands every visible completion to `f`, then releases the slots back to
    /// the kernel in one head update.
    pub(crate) fn drain(&mut self, mut f: impl FnMut(CompletionEntry)) -> usize {
        let mut head = self.head().load(Ordering::Relaxed);

        // Pairs with the kernel's release store of the tail: every CQE up to
        // `tail` is fully written.
        let tail = self.tail().load(Ordering::Acquire);

        let mut consumed = 0;
        while head != tail {
            // SAFETY: masked index is within the CQE array.
            let cqe = unsafe { self.cqes.add((head & self.mask) as usize).read() };
            f(cqe);

            head = head.wrapping_add(1);
            consumed += 1;
        }

        if consumed > 0 {
            // The kernel may reuse the slots only after we copied them out.
            self.head().store(head, Ordering::Release);
        }

        consumed
    }
}
