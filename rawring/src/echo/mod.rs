//! The per-connection echo state machine.
//!
//! Every connection cycles `Accepting → Reading → Writing → Reading → …`
//! until a read returns 0 or an error, or a write fails, at which point it
//! is `Closed`. Exactly one operation is in flight per connection, plus one
//! accept per shard on the shared listener.

use crate::arena::{OperationArena, Tag};
use crate::buffer_pool::BufferPool;
use crate::error::ArenaError;
use crate::ring::{CompletionEntry, Submit, SubmissionEntry};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

mod connection;
use connection::ConnectionTable;
pub use connection::{ConnState, SlotId};


/// Context of one in-flight operation, owned by the arena until its
/// completion is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Accept,
    Read { slot: SlotId },
    Write { slot: SlotId, len: u32 },
}

/// Counters kept by one [`EchoMachine`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EchoStats {
    pub accepted: u64,
    /// Accepted while the connection table was full; closed immediately.
    pub refused: u64,
    pub closed: u64,
    pub echoed_bytes: u64,
}

#[derive(Debug)]
pub struct EchoMachine {
    listener: RawFd,
    conns: ConnectionTable,
    buffers: BufferPool,
    ops: OperationArena<Operation>,
    stats: EchoStats,
}

impl EchoMachine {
    /// `capacity` connections, each with a `message_size` buffer. The
    /// listener must outlive the machine.
    pub fn new(listener: RawFd, capacity: usize, message_size: usize) -> Self {
        Self {
            listener,
            conns: ConnectionTable::with_capacity(capacity),
            buffers: BufferPool::new(capacity, message_size),
            // One op per connection plus the outstanding accept.
            ops: OperationArena::with_capacity(capacity + 1),
            stats: EchoStats::default(),
        }
    }

    /// Issues the first accept.
    pub fn start(&mut self, sq: &mut impl Submit) -> Result<(), ArenaError> {
        self.issue_accept(sq)
    }

    /// Routes one completion to its handler. A completion whose tag owns no
    /// context is logged and dropped.
    pub fn dispatch(
        &mut self,
        sq: &mut impl Submit,
        cqe: CompletionEntry,
    ) -> Result<(), ArenaError> {
        let op = match self.ops.take(Tag::from_user_data(cqe.user_data())) {
            Ok(op) => op,
            Err(e) => {
                tracing::warn!(error = %e, res = cqe.result(), "dropping completion");
                return Ok(());
            }
        };

        match op {
            Operation::Accept => self.on_accept_complete(sq, cqe.result()),
            Operation::Read { slot } => self.on_read_complete(sq, slot, cqe.result()),
            Operation::Write { slot, len } => {
                self.on_write_complete(sq, slot, len, cqe.result())
            }
        }
    }

    fn on_accept_complete(&mut self, sq: &mut impl Submit, res: i32) -> Result<(), ArenaError> {
        if res < 0 {
            tracing::warn!(errno = -res, "accept failed; retrying");
            return self.issue_accept(sq);
        }

        // SAFETY: a non-negative accept result is a new descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(res) };

        let slot = match self.conns.insert(fd) {
            Ok(slot) => Some(slot),
            Err(fd) => {
                tracing::warn!(
                    capacity = self.conns.capacity(),
                    "connection table full; closing new connection"
                );
                drop(fd);
                self.stats.refused += 1;
                None
            }
        };

        self.issue_accept(sq)?;

        if let Some(slot) = slot {
            self.stats.accepted += 1;
            tracing::debug!(fd = res, slot = slot.index(), "accepted");
            self.issue_read(sq, slot)?;
        }

        Ok(())
    }

    fn on_read_complete(
        &mut self,
        sq: &mut impl Submit,
        slot: SlotId,
        res: i32,
    ) -> Result<(), ArenaError> {
        debug_assert!(self.conns.is_in(slot, ConnState::Reading));

        if res <= 0 {
            if res < 0 {
                tracing::debug!(slot = slot.index(), errno = -res, "read failed");
            }
            self.close(slot);
            return Ok(());
        }

        self.issue_write(sq, slot, res as u32)
    }

    fn on_write_complete(
        &mut self,
        sq: &mut impl Submit,
        slot: SlotId,
        len: u32,
        res: i32,
    ) -> Result<(), ArenaError> {
        debug_assert!(self.conns.is_in(slot, ConnState::Writing));

        if res < 0 {
            tracing::debug!(slot = slot.index(), errno = -res, "write failed");
            self.close(slot);
            return Ok(());
        }

        if (res as u32) < len {
            tracing::debug!(slot = slot.index(), len, sent = res, "short write");
        }

        self.stats.echoed_bytes += res as u64;
        self.issue_read(sq, slot)
    }

    fn issue_accept(&mut self, sq: &mut impl Submit) -> Result<(), ArenaError> {
        let tag = self.ops.insert(Operation::Accept)?;
        sq.submit(&SubmissionEntry::accept(self.listener).user_data(tag.user_data()));
        Ok(())
    }

    fn issue_read(&mut self, sq: &mut impl Submit, slot: SlotId) -> Result<(), ArenaError> {
        let (Some(fd), Some(buf)) = (
            self.conns.get(slot).map(|c| c.raw_fd()),
            self.buffers.as_mut_ptr(slot.index()),
        ) else {
            tracing::error!(slot = slot.index(), "read on a slot without a connection or buffer");
            self.close(slot);
            return Ok(());
        };

        let tag = self.ops.insert(Operation::Read { slot })?;
        self.conns.set_state(slot, ConnState::Reading);
        sq.submit(
            &SubmissionEntry::recv(fd, buf, self.buffers.buf_size() as u32)
                .user_data(tag.user_data()),
        );

        Ok(())
    }

    fn issue_write(
        &mut self,
        sq: &mut impl Submit,
        slot: SlotId,
        len: u32,
    ) -> Result<(), ArenaError> {
        let (Some(fd), Some(buf)) = (
            self.conns.get(slot).map(|c| c.raw_fd()),
            self.buffers.as_ptr(slot.index()),
        ) else {
            tracing::error!(slot = slot.index(), "write on a slot without a connection or buffer");
            self.close(slot);
            return Ok(());
        };

        let tag = self.ops.insert(Operation::Write { slot, len })?;
        self.conns.set_state(slot, ConnState::Writing);
        sq.submit(&SubmissionEntry::send(fd, buf, len).user_data(tag.user_data()));

        Ok(())
    }

    fn close(&mut self, slot: SlotId) {
        if self.conns.close(slot) {
            self.stats.closed += 1;
            tracing::debug!(slot = slot.index(), "closed");
        }
    }

    /// `Closed` for slots that are not live.
    pub fn connection_state(&self, slot: SlotId) -> ConnState {
        self.conns.state(slot)
    }

    pub fn open_connections(&self) -> usize {
        self.conns.len()
    }

    /// Operations submitted and not yet dispatched.
    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }

    /// Bytes currently in the slot's buffer.
    pub fn buffer(&self, slot: SlotId) -> Option<&[u8]> {
        self.buffers.buffer(slot.index())
    }

    pub fn stats(&self) -> EchoStats {
        self.stats
    }
}
