//! Associations between client buffers and hardware buffers.
//!
//! A `BufferPool` remembers which `HwBuffer` currently stands for which
//! `BufferHandle`, in both directions. The mapping is one-to-one: a handle has
//! at most one hardware buffer and a hardware buffer belongs to at most one
//! handle. Entries are added when a buffer is handed to a module and removed
//! by the completion that gives it back, so `pop` returning `Some` is the
//! proof that a buffer is released only once.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;
use thiserror::Error;

use crate::memory::{BufferHandle, HwBuffer};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("handle {0} is already associated with a buffer")]
    HandleInUse(u64),
    #[error("hardware buffer {0} is already associated with a handle")]
    BufferInUse(u64),
}

struct Entry {
    handle: Arc<BufferHandle>,
    buffer: Arc<HwBuffer>,
}

#[derive(Default)]
struct PoolState {
    // Handle id -> entry.
    entries: HashMap<u64, Entry>,
    // Hardware buffer id -> handle id.
    reverse: HashMap<u64, u64>,
}

/// Thread-safe two-way map between client handles and hardware buffers.
pub struct BufferPool {
    name: &'static str,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(name: &'static str) -> Self {
        BufferPool {
            name,
            state: Default::default(),
        }
    }

    /// Associates `handle` with `buffer`. Fails if either of them is already
    /// part of an association.
    pub fn add(&self, handle: &Arc<BufferHandle>, buffer: &Arc<HwBuffer>) -> Result<(), PoolError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(&handle.id()) {
            return Err(PoolError::HandleInUse(handle.id()));
        }
        if state.reverse.contains_key(&buffer.id()) {
            return Err(PoolError::BufferInUse(buffer.id()));
        }

        trace!("{}: handle {} <-> buffer {}", self.name, handle.id(), buffer.id());
        state.reverse.insert(buffer.id(), handle.id());
        state.entries.insert(
            handle.id(),
            Entry {
                handle: Arc::clone(handle),
                buffer: Arc::clone(buffer),
            },
        );
        Ok(())
    }

    pub fn get(&self, handle: &BufferHandle) -> Option<Arc<HwBuffer>> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(&handle.id())
            .map(|e| Arc::clone(&e.buffer))
    }

    /// Removes the association of `handle` and returns its hardware buffer.
    pub fn pop(&self, handle: &BufferHandle) -> Option<Arc<HwBuffer>> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.remove(&handle.id())?;
        state.reverse.remove(&entry.buffer.id());
        trace!("{}: released handle {}", self.name, handle.id());
        Some(entry.buffer)
    }

    pub fn exist(&self, handle: &BufferHandle) -> bool {
        self.state.lock().unwrap().entries.contains_key(&handle.id())
    }

    /// Returns the handle `buffer` is associated with.
    pub fn handle_of(&self, buffer: &HwBuffer) -> Option<Arc<BufferHandle>> {
        let state = self.state.lock().unwrap();
        let handle_id = state.reverse.get(&buffer.id())?;
        state
            .entries
            .get(handle_id)
            .map(|e| Arc::clone(&e.handle))
    }

    /// Removes the association of `buffer` and returns its handle.
    pub fn pop_by_buffer(&self, buffer: &HwBuffer) -> Option<Arc<BufferHandle>> {
        let mut state = self.state.lock().unwrap();
        let handle_id = state.reverse.remove(&buffer.id())?;
        let entry = state.entries.remove(&handle_id)?;
        trace!("{}: released buffer {}", self.name, buffer.id());
        Some(entry.handle)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all associations and returns them.
    pub fn drain(&self) -> Vec<(Arc<BufferHandle>, Arc<HwBuffer>)> {
        let mut state = self.state.lock().unwrap();
        state.reverse.clear();
        state
            .entries
            .drain()
            .map(|(_, e)| (e.handle, e.buffer))
            .collect()
    }

    pub fn clear(&self) {
        let drained = self.drain();
        if !drained.is_empty() {
            trace!("{}: dropped {} associations", self.name, drained.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Mapping;

    fn hw_buffer_for(handle: &BufferHandle) -> Arc<HwBuffer> {
        HwBuffer::wrap(handle.mapping().unwrap(), handle.size())
    }

    #[test]
    fn add_get_pop() {
        let pool = BufferPool::new("test");
        let handle = BufferHandle::alloc(16);
        let buffer = hw_buffer_for(&handle);

        pool.add(&handle, &buffer).unwrap();
        assert!(pool.exist(&handle));
        assert_eq!(pool.get(&handle).unwrap().id(), buffer.id());
        assert_eq!(pool.handle_of(&buffer).unwrap().id(), handle.id());
        // get does not remove the association.
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.pop(&handle).unwrap().id(), buffer.id());
        assert!(!pool.exist(&handle));
        assert!(pool.pop(&handle).is_none());
        assert!(pool.handle_of(&buffer).is_none());
    }

    #[test]
    fn associations_are_one_to_one() {
        let pool = BufferPool::new("test");
        let h1 = BufferHandle::alloc(16);
        let h2 = BufferHandle::alloc(16);
        let b1 = hw_buffer_for(&h1);
        let b2 = hw_buffer_for(&h2);

        pool.add(&h1, &b1).unwrap();
        assert_eq!(pool.add(&h1, &b2), Err(PoolError::HandleInUse(h1.id())));
        assert_eq!(pool.add(&h2, &b1), Err(PoolError::BufferInUse(b1.id())));
        pool.add(&h2, &b2).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn pop_by_buffer() {
        let pool = BufferPool::new("test");
        let handle = BufferHandle::alloc(16);
        let buffer = HwBuffer::wrap(Mapping::Memory(Default::default()), 0);

        pool.add(&handle, &buffer).unwrap();
        assert_eq!(pool.pop_by_buffer(&buffer).unwrap().id(), handle.id());
        assert!(pool.is_empty());
        assert!(pool.pop_by_buffer(&buffer).is_none());

        // The handle can be associated again once released.
        pool.add(&handle, &buffer).unwrap();
    }

    #[test]
    fn drain_releases_buffers() {
        let pool = BufferPool::new("test");
        let handles: Vec<_> = (0..4).map(|_| BufferHandle::alloc(8)).collect();
        for h in &handles {
            pool.add(h, &hw_buffer_for(h)).unwrap();
        }

        let drained = pool.drain();
        assert_eq!(drained.len(), 4);
        assert!(pool.is_empty());
        for (h, b) in drained {
            // The pool did not keep any reference.
            assert_eq!(Arc::strong_count(&b), 1);
            assert!(handles.iter().any(|x| x.id() == h.id()));
        }
    }
}
