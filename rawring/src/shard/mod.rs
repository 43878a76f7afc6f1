use crate::config::ServerConfig;
use crate::echo::EchoMachine;
use crate::error::{RingError, ShardError};
use crate::ring::{CompletionEntry, RingTransport};
use crate::sys::Features;
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;


/// One echo worker: a ring and the connections it drives. Runs on a single
/// thread and shares nothing with other shards except the listener.
#[derive(Debug)]
pub struct Shard {
    id: usize,

    ring: RingTransport,

    // Closing the ring cancels in-flight operations asynchronously, so the
    // machine is only freed by `Drop` once no read or write can land in it.
    machine: ManuallyDrop<EchoMachine>,

    /// Reused every turn so the steady state does not allocate.
    completions: Vec<CompletionEntry>,

    listener: Arc<OwnedFd>,
}

impl Shard {
    /// Creates the shard's ring and issues its first accept.
    pub fn try_new(
        id: usize,
        listener: Arc<OwnedFd>,
        cfg: &ServerConfig,
    ) -> Result<Self, ShardError> {
        let mut ring = RingTransport::init(&cfg.ring)?;

        if !ring.features().contains(Features::FAST_POLL) {
            return Err(RingError::Unsupported("IORING_FEAT_FAST_POLL").into());
        }

        let mut machine = EchoMachine::new(
            listener.as_raw_fd(),
            cfg.connections_per_shard,
            cfg.message_size,
        );
        machine.start(&mut ring)?;

        tracing::debug!(
            shard = id,
            sq_entries = ring.sq_capacity(),
            connections = cfg.connections_per_shard,
            "shard ready"
        );

        Ok(Self {
            id,
            completions: Vec::with_capacity(ring.cq_capacity() as usize),
            ring,
            machine: ManuallyDrop::new(machine),
            listener,
        })
    }

    /// Waits for at least one completion, then dispatches everything that is
    /// visible. Returns the number of completions handled.
    pub fn turn(&mut self) -> Result<usize, ShardError> {
        let completions = &mut self.completions;
        self.ring.drain_completions(1, |cqe| completions.push(cqe))?;

        let n = self.completions.len();
        for cqe in self.completions.drain(..) {
            self.machine.dispatch(&mut self.ring, cqe)?;
        }

        Ok(n)
    }

    /// Runs the event loop. Only returns on a fatal error.
    pub fn run(&mut self) -> Result<(), ShardError> {
        loop {
            match self.turn() {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(shard = self.id, error = %e, "transient ring error");
                }
                Err(e) => {
                    tracing::error!(shard = self.id, error = %e, "shard stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Whether a read or write into a connection buffer may still be pending.
    /// Every open connection has exactly one of them in flight; the accept
    /// touches no buffer.
    pub fn buffers_in_flight(&self) -> bool {
        self.machine.open_connections() > 0
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn machine(&self) -> &EchoMachine {
        &self.machine
    }

    pub fn ring(&self) -> &RingTransport {
        &self.ring
    }

    pub fn listener(&self) -> &Arc<OwnedFd> {
        &self.listener
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if self.buffers_in_flight() {
            tracing::warn!(
                shard = self.id,
                connections = self.machine.open_connections(),
                "leaking connection buffers with operations in flight"
            );
            return;
        }

        // SAFETY: `machine` is not touched again, and nothing the kernel still
        // holds points into it.
        unsafe { ManuallyDrop::drop(&mut self.machine) };
    }
}
