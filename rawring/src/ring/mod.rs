//! A hand-managed `io_uring` instance.
//!
//! [`RingTransport`] owns the three shared mappings of one ring and drives
//! them directly: submissions are written into the SQE array and published
//! with a release store of the SQ tail, completions are read after an acquire
//! load of the CQ tail and released with a release store of the CQ head.

use crate::config::{RingConfig, RingMode};
use crate::error::RingError;
use crate::sys::{self, Features, Params, SqFlags};
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

mod completion;
use completion::CompletionQueue;

mod entry;
pub use entry::{CompletionEntry, Opcode, SubmissionEntry, Target};

mod mmap;
use mmap::MappedRegion;

mod submission;
use submission::SubmissionQueue;

#[cfg(test)]
mod tests;

/// Anything operations can be queued on. Implemented by [`RingTransport`];
/// state machines are written against this so they can be driven without a
/// kernel ring.
pub trait Submit {
    fn submit(&mut self, entry: &SubmissionEntry);
}

#[derive(Debug)]
pub struct RingTransport {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    mode: RingMode,
    features: Features,

    // Declared after the queues so the views are gone before the regions
    // are unmapped.
    _sq_ring: MappedRegion,
    _sqes: MappedRegion,
    _cq_ring: MappedRegion,
    fd: OwnedFd,
}

// SAFETY: the raw pointers only reach into mappings owned by this struct.
// Moving the ring to another thread moves the mappings with it; `&self`
// methods never write, so the type is still deliberately not `Sync`.
unsafe impl Send for RingTransport {}

impl RingTransport {
    pub fn init(config: &RingConfig) -> Result<Self, RingError> {
        config.validate()?;

        let mut params = Params {
            // Oversized rings are clamped to the kernel maximum instead of
            // failing.
            flags: sys::IORING_SETUP_CLAMP,
            ..Default::default()
        };

        if config.get_mode().is_kernel_polled() {
            params.flags |= sys::IORING_SETUP_SQPOLL;
            params.sq_thread_idle = config.idle_timeout_ms();

            if let Some(cpu) = config.get_sq_thread_cpu() {
                params.flags |= sys::IORING_SETUP_SQ_AFF;
                params.sq_thread_cpu = cpu;
            }
        }

        let raw = sys::io_uring_setup(config.get_queue_depth(), &mut params)
            .map_err(RingError::Setup)?;

        // SAFETY: io_uring_setup returned a new descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let sq_len = params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>();
        let sqes_len = params.sq_entries as usize * size_of::<SubmissionEntry>();
        let cq_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * size_of::<CompletionEntry>();

        let sq_ring = MappedRegion::map(fd.as_raw_fd(), sq_len, sys::IORING_OFF_SQ_RING)
            .map_err(RingError::Map)?;
        let sqes = MappedRegion::map(fd.as_raw_fd(), sqes_len, sys::IORING_OFF_SQES)
            .map_err(RingError::Map)?;
        let cq_ring = MappedRegion::map(fd.as_raw_fd(), cq_len, sys::IORING_OFF_CQ_RING)
            .map_err(RingError::Map)?;

        // SAFETY: regions were mapped from `params` above and are stored in
        // the same struct as the views.
        let (sq, cq) = unsafe {
            (
                SubmissionQueue::new(&sq_ring, &sqes, &params),
                CompletionQueue::new(&cq_ring, &params),
            )
        };

        let features = Features::from_bits_retain(params.features);

        if !features.contains(Features::NODROP) {
            tracing::warn!(
                "IORING_FEAT_NODROP is not supported by this kernel; completions are \
                 silently dropped when the CQ ring is full"
            );
        }

        tracing::debug!(
            fd = fd.as_raw_fd(),
            sq_entries = params.sq_entries,
            cq_entries = params.cq_entries,
            mode = ?config.get_mode(),
            features = ?features,
            "io_uring ring initialised"
        );

        Ok(Self {
            sq,
            cq,
            mode: config.get_mode(),
            features,
            _sq_ring: sq_ring,
            _sqes: sqes,
            _cq_ring: cq_ring,
            fd,
        })
    }

    /// Registers `fds` as the ring's fixed descriptor table; submissions then
    /// address them with [`Target::Fixed`] by position.
    pub fn register_descriptors(&mut self, fds: &[RawFd]) -> Result<(), RingError> {
        sys::io_uring_register_files(self.fd.as_raw_fd(), fds).map_err(RingError::Register)?;
        tracing::debug!(count = fds.len(), "registered descriptors");
        Ok(())
    }

    /// Queues `entry` without blocking. Overrunning the ring overwrites
    /// unconsumed entries; callers size the ring for their maximum in-flight
    /// count.
    pub fn submit(&mut self, entry: &SubmissionEntry) {
        self.sq.push(entry);
    }

    /// Kernel-polled mode: wakes the poller thread if it went idle. Must be
    /// called after queueing work on a ring that may have been idle longer
    /// than its idle timeout. Returns whether a wake-up was issued.
    pub fn wake_if_needed(&mut self) -> Result<bool, RingError> {
        if !self.mode.is_kernel_polled() || !self.sq.needs_wakeup() {
            return Ok(false);
        }

        tracing::trace!("waking up kernel poller");
        self.enter(0, 0, sys::IORING_ENTER_SQ_WAKEUP)?;
        Ok(true)
    }

    /// Hands pending submissions to the kernel and, when `min_complete > 0`,
    /// blocks until at least that many completions are visible.
    pub fn submit_and_wait(&mut self, min_complete: u32) -> Result<u32, RingError> {
        let flags = if min_complete > 0 {
            sys::IORING_ENTER_GETEVENTS
        } else {
            0
        };

        match self.mode {
            RingMode::KernelPolled => {
                self.wake_if_needed()?;

                if min_complete == 0 {
                    return Ok(0);
                }

                // The poller submits on its own; only wait here.
                self.enter(0, min_complete, flags)
            }
            RingMode::Default => {
                let to_submit = self.sq.pending();

                if to_submit == 0 && min_complete == 0 {
                    return Ok(0);
                }

                self.enter(to_submit, min_complete, flags)
            }
        }
    }

    /// Pops every visible completion into `on_complete` and returns how many
    /// were consumed. When `min_wait > 0`, first blocks (submitting pending
    /// work) until at least `min_wait` completions are visible.
    pub fn drain_completions(
        &mut self,
        min_wait: u32,
        on_complete: impl FnMut(CompletionEntry),
    ) -> Result<usize, RingError> {
        if min_wait > 0 && self.cq.ready() < min_wait {
            self.submit_and_wait(min_wait)?;
        }

        Ok(self.cq.drain(on_complete))
    }

    fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32, RingError> {
        loop {
            match sys::io_uring_enter(self.fd.as_raw_fd(), to_submit, min_complete, flags) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RingError::Enter(e)),
            }
        }
    }

    pub fn mode(&self) -> RingMode {
        self.mode
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn sq_capacity(&self) -> u32 {
        self.sq.capacity()
    }

    pub fn cq_capacity(&self) -> u32 {
        self.cq.capacity()
    }

    /// Published submissions the kernel has not consumed yet.
    pub fn sq_pending(&self) -> u32 {
        self.sq.pending()
    }

    pub fn sq_flags(&self) -> SqFlags {
        self.sq.flags()
    }

    pub fn sq_dropped(&self) -> u32 {
        self.sq.dropped()
    }

    pub fn cq_ready(&self) -> u32 {
        self.cq.ready()
    }

    pub fn cq_overflow(&self) -> u32 {
        self.cq.overflow()
    }

    /// Reads back the submission stored in slot `index` modulo the ring size.
    pub fn sqe_at(&self, index: u32) -> SubmissionEntry {
        self.sq.entry_at(index)
    }
}

impl Submit for RingTransport {
    fn submit(&mut self, entry: &SubmissionEntry) {
        RingTransport::submit(self, entry);
    }
}

impl AsRawFd for RingTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
