use slab::Slab;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Index of a connection in its shard's table. Also indexes the connection's
/// buffer in the shard's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub(crate) fn new(index: usize) -> Self {
        SlotId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Where a connection is in its accept → read → write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted; the first read is not issued yet.
    Accepting,

    /// A receive into the slot's buffer is in flight.
    Reading,

    /// A send of the received bytes is in flight.
    Writing,

    /// Descriptor closed and slot released. Terminal.
    Closed,
}

#[derive(Debug)]
pub(crate) struct ConnectionSlot {
    fd: OwnedFd,
    state: ConnState,
}

impl ConnectionSlot {
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }
}

/// Fixed-capacity table of live connections.
#[derive(Debug)]
pub(crate) struct ConnectionTable {
    slots: Slab<ConnectionSlot>,
    capacity: usize,
}

impl ConnectionTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Takes ownership of an accepted descriptor. When the table is full the
    /// descriptor is handed back so the caller decides how to dispose of it.
    pub(crate) fn insert(&mut self, fd: OwnedFd) -> Result<SlotId, OwnedFd> {
        if self.slots.len() == self.capacity {
            return Err(fd);
        }

        Ok(SlotId(self.slots.insert(ConnectionSlot {
            fd,
            state: ConnState::Accepting,
        })))
    }

    pub(crate) fn get(&self, slot: SlotId) -> Option<&ConnectionSlot> {
        self.slots.get(slot.0)
    }

    pub(crate) fn set_state(&mut self, slot: SlotId, state: ConnState) {
        if let Some(conn) = self.slots.get_mut(slot.0) {
            conn.state = state;
        }
    }

    /// Whether `slot` is live and in `state`.
    pub(crate) fn is_in(&self, slot: SlotId, state: ConnState) -> bool {
        self.get(slot).is_some_and(|c| c.state == state)
    }

    /// Releases `slot`, closing its descriptor.
    pub(crate) fn close(&mut self, slot: SlotId) -> bool {
        self.slots.try_remove(slot.0).is_some()
    }

    pub(crate) fn state(&self, slot: SlotId) -> ConnState {
        self.get(slot).map_or(ConnState::Closed, ConnectionSlot::state)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::os::unix::net::UnixStream;

    fn fd() -> Result<OwnedFd> {
        let (a, _b) = UnixStream::pair()?;
        Ok(a.into())
    }

    #[test]
    fn test_insert_starts_accepting() -> Result<()> {
        let mut table = ConnectionTable::with_capacity(2);
        let slot = table.insert(fd()?).map_err(|_| anyhow::anyhow!("table full"))?;

        assert_eq!(table.state(slot), ConnState::Accepting);
        assert!(table.is_in(slot, ConnState::Accepting));
        assert_eq!(table.len(), 1);

        Ok(())
    }

    #[test]
    fn test_full_table_hands_descriptor_back() -> Result<()> {
        let mut table = ConnectionTable::with_capacity(1);
        assert!(table.insert(fd()?).is_ok());

        let extra = fd()?;
        let raw = extra.as_raw_fd();
        let back = table.insert(extra).err().map(|fd| fd.as_raw_fd());
        assert_eq!(back, Some(raw));
        assert_eq!(table.len(), table.capacity());

        Ok(())
    }

    #[test]
    fn test_close_releases_slot() -> Result<()> {
        let mut table = ConnectionTable::with_capacity(1);
        let slot = table.insert(fd()?).map_err(|_| anyhow::anyhow!("table full"))?;

        table.set_state(slot, ConnState::Reading);
        assert!(table.close(slot));
        assert!(!table.close(slot));
        assert_eq!(table.state(slot), ConnState::Closed);

        // A closed slot ignores state updates.
        table.set_state(slot, ConnState::Writing);
        assert_eq!(table.state(slot), ConnState::Closed);

        Ok(())
    }
}
