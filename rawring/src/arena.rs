use crate::error::ArenaError;
use slab::Slab;

/// The tag carried in an operation's `user_data`; the arena key of the
/// operation's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(usize);

impl Tag {
    pub fn from_user_data(user_data: u64) -> Self {
        Tag(user_data as usize)
    }

    pub fn user_data(self) -> u64 {
        self.0 as u64
    }
}

/// Fixed-capacity slab of in-flight operation contexts.
///
/// A context is inserted when its operation is submitted and taken back out
/// exactly once when the operation completes, so every tag resolves to at
/// most one completion. Capacity never grows after construction.
#[derive(Debug)]
pub struct OperationArena<T> {
    slab: Slab<T>,
    capacity: usize,
}

impl<T> OperationArena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, value: T) -> Result<Tag, ArenaError> {
        if self.slab.len() == self.capacity {
            return Err(ArenaError::Full {
                capacity: self.capacity,
            });
        }

        Ok(Tag(self.slab.insert(value)))
    }

    /// Removes the context owned by `tag`. A second `take` of the same tag,
    /// or a tag never handed out, is `UnknownTag`.
    pub fn take(&mut self, tag: Tag) -> Result<T, ArenaError> {
        self.slab
            .try_remove(tag.0)
            .ok_or(ArenaError::UnknownTag(tag.user_data()))
    }

    pub fn get(&self, tag: Tag) -> Option<&T> {
        self.slab.get(tag.0)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
