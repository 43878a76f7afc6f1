use super::entry::SubmissionEntry;
use super::mmap::MappedRegion;
use crate::sys::{Params, SqFlags};
use std::sync::atomic::{self, AtomicU32, Ordering};

/// Producer side of the SQ ring. The application is the only producer, so
/// the tail is mirrored locally and only ever published with a release store.
#[derive(Debug)]
pub(crate) struct SubmissionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    flags: *const AtomicU32,
    dropped: *const AtomicU32,
    array: *mut u32,
    sqes: *mut SubmissionEntry,
    mask: u32,
    entries: u32,
    local_tail: u32,
}

impl SubmissionQueue {
    /// # Safety
    ///
    /// `ring` must be the `IORING_OFF_SQ_RING` mapping and `sqes` the
    /// `IORING_OFF_SQES` mapping created from `params`, and both must outlive
    /// the returned queue.
    pub(crate) unsafe fn new(ring: &MappedRegion, sqes: &MappedRegion, params: &Params) -> Self {
        let off = &params.sq_off;

        unsafe {
            let tail = ring.at::<AtomicU32>(off.tail);

            Self {
                head: ring.at::<AtomicU32>(off.head),
                tail,
                flags: ring.at::<AtomicU32>(off.flags),
                dropped: ring.at::<AtomicU32>(off.dropped),
                array: ring.at::<u32>(off.array),
                sqes: sqes.at::<SubmissionEntry>(0),
                mask: ring.at::<u32>(off.ring_mask).read(),
                entries: ring.at::<u32>(off.ring_entries).read(),
                local_tail: (*tail).load(Ordering::Relaxed),
            }
        }
    }

    // Kernel writes the head as it consumes entries.
    fn head(&self) -> &AtomicU32 {
        unsafe { &*self.head }
    }

    fn tail(&self) -> &AtomicU32 {
        unsafe { &*self.tail }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.entries
    }

    /// Entries published but not yet consumed by the kernel. Exceeds
    /// `capacity()` after an overrun.
    pub(crate) fn pending(&self) -> u32 {
        self.local_tail
            .wrapping_sub(self.head().load(Ordering::Acquire))
    }

    /// Writes `entry` at the tail slot, then publishes the new tail.
    ///
    /// There is no full-ring check: pushing onto a full ring overwrites the
    /// oldest unconsumed slot.
    pub(crate) fn push(&mut self, entry: &SubmissionEntry) {
        let tail = self.local_tail;
        let index = tail & self.mask;

        // SAFETY: `index <= mask < entries`, within both the SQE array and the
        // index array.
        unsafe {
            self.sqes.add(index as usize).write(*entry);
            self.array.add(index as usize).write(index);
        }

        self.local_tail = tail.wrapping_add(1);

        // Pairs with the kernel's acquire load of the tail: the entry and the
        // index array slot above are visible before the new tail is.
        self.tail().store(self.local_tail, Ordering::Release);
    }

    /// Whether the SQPOLL thread went to sleep and needs a wake-up.
    pub(crate) fn needs_wakeup(&self) -> bool {
        // The tail store must be ordered before the flags load, otherwise the
        // poller may go idle between our publish and our check. Release and
        // acquire do not order a store before a later load; only a full
        // fence does.
        atomic::fence(Ordering::SeqCst);
        self.flags().contains(SqFlags::NEED_WAKEUP)
    }

    pub(crate) fn flags(&self) -> SqFlags {
        SqFlags::from_bits_retain(unsafe { (*self.flags).load(Ordering::Relaxed) })
    }

    /// Submissions the kernel discarded as invalid.
    pub(crate) fn dropped(&self) -> u32 {
        unsafe { (*self.dropped).load(Ordering::Acquire) }
    }

    /// Reads back the entry stored in slot `index & mask`.
    pub(crate) fn entry_at(&self, index: u32) -> SubmissionEntry {
        // SAFETY: masked index is in bounds.
        unsafe { self.sqes.add((index & self.mask) as usize).read() }
    }
}
