use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::memory::{AllocError, AllocationId, Allocator, Mapping};

/// Base of the fake bus addresses handed out by `DummyAllocator`.
const PHYSICAL_BASE: u64 = 0x8000_0000;

struct Allocation {
    mapping: Mapping,
    size: usize,
    physical: u64,
}

#[derive(Default)]
struct AllocatorState {
    allocations: BTreeMap<AllocationId, Allocation>,
    next_id: u64,
    next_physical: u64,
    allocated_bytes: usize,
}

/// Allocator backed by process memory. Imported dma-bufs are accessed through
/// their file descriptor.
pub struct DummyAllocator {
    capacity: usize,
    state: Mutex<AllocatorState>,
}

impl DummyAllocator {
    /// Creates an allocator able to hand out up to `capacity` bytes at once.
    pub fn new(capacity: usize) -> Self {
        DummyAllocator {
            capacity,
            state: Default::default(),
        }
    }

    /// Number of allocations not freed yet, imports included.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().allocations.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().unwrap().allocated_bytes
    }

    fn insert(&self, mapping: Mapping, size: usize, counted: bool) -> Result<AllocationId, AllocError> {
        let mut state = self.state.lock().unwrap();
        if counted && state.allocated_bytes + size > self.capacity {
            return Err(AllocError::OutOfMemory(size));
        }

        state.next_id += 1;
        let id = AllocationId(state.next_id);
        let physical = PHYSICAL_BASE + state.next_physical;
        // Keep buffers 4K-aligned on the bus.
        state.next_physical += (size as u64).div_ceil(4096).max(1) * 4096;
        if counted {
            state.allocated_bytes += size;
        }
        state.allocations.insert(
            id,
            Allocation {
                mapping,
                size: if counted { size } else { 0 },
                physical,
            },
        );
        trace!("Allocated {:?} ({} bytes)", id, size);
        Ok(id)
    }
}

impl Allocator for DummyAllocator {
    fn alloc(&self, size: usize) -> Result<AllocationId, AllocError> {
        self.insert(Mapping::Memory(Arc::new(Mutex::new(vec![0u8; size]))), size, true)
    }

    fn free(&self, id: AllocationId) {
        let mut state = self.state.lock().unwrap();
        if let Some(allocation) = state.allocations.remove(&id) {
            state.allocated_bytes -= allocation.size;
            trace!("Freed {:?}", id);
        }
    }

    fn mapping(&self, id: AllocationId) -> Result<Mapping, AllocError> {
        let state = self.state.lock().unwrap();
        state
            .allocations
            .get(&id)
            .map(|a| a.mapping.clone())
            .ok_or(AllocError::InvalidAllocation(id))
    }

    fn physical_address(&self, id: AllocationId) -> Result<u64, AllocError> {
        let state = self.state.lock().unwrap();
        state
            .allocations
            .get(&id)
            .map(|a| a.physical)
            .ok_or(AllocError::InvalidAllocation(id))
    }

    fn import_from_fd(&self, fd: BorrowedFd<'_>, size: usize) -> Result<AllocationId, AllocError> {
        let file = File::from(fd.try_clone_to_owned().map_err(AllocError::Import)?);
        let len = file.metadata().map_err(AllocError::Import)?.len() as usize;
        if len < size {
            return Err(AllocError::Import(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("dma-buf is {} bytes, {} expected", len, size),
            )));
        }
        // Imported memory does not count against our capacity.
        self.insert(Mapping::File(Arc::new(file)), size, false)
    }

    fn get_fd(&self, id: AllocationId) -> Result<OwnedFd, AllocError> {
        match self.mapping(id)? {
            Mapping::File(f) => Ok(f.try_clone()?.into()),
            Mapping::Memory(_) => Err(AllocError::NotExportable(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;
    use crate::memory::tests::fake_dmabuf;
    use crate::memory::{BufferHandle, HwBuffer};

    #[test]
    fn capacity() {
        let allocator = DummyAllocator::new(1000);
        let a = allocator.alloc(600).unwrap();
        assert!(matches!(
            allocator.alloc(600),
            Err(AllocError::OutOfMemory(600))
        ));
        allocator.free(a);
        allocator.alloc(600).unwrap();
        assert_eq!(allocator.allocated_bytes(), 600);
    }

    #[test]
    fn physical_addresses_do_not_overlap() {
        let allocator = DummyAllocator::new(1 << 20);
        let a = allocator.alloc(5000).unwrap();
        let b = allocator.alloc(10).unwrap();
        let pa = allocator.physical_address(a).unwrap();
        let pb = allocator.physical_address(b).unwrap();
        assert_eq!(pa % 4096, 0);
        assert!(pb >= pa + 5000);
        assert!(allocator.physical_address(AllocationId(1000)).is_err());
    }

    #[test]
    fn hw_buffers_free_on_drop() {
        let dummy = Arc::new(DummyAllocator::new(1 << 20));
        let allocator: Arc<dyn Allocator> = dummy.clone();
        let buffer = HwBuffer::allocate(&allocator, 128).unwrap();
        let other_ref = Arc::clone(&buffer);
        assert!(buffer.physical_address().is_some());
        // Plain allocations cannot be exported.
        assert!(matches!(buffer.fd(), Err(AllocError::NotExportable(_))));

        drop(buffer);
        assert_eq!(dummy.live_allocations(), 1);
        drop(other_ref);
        assert_eq!(dummy.live_allocations(), 0);
        assert_eq!(dummy.allocated_bytes(), 0);
    }

    #[test]
    fn import_dmabuf() {
        let dummy = Arc::new(DummyAllocator::new(0));
        let allocator: Arc<dyn Allocator> = dummy.clone();
        let handle = BufferHandle::from_dmabuf(fake_dmabuf(256), 256);

        let buffer = HwBuffer::from_handle(&handle, &allocator).unwrap();
        assert_eq!(dummy.live_allocations(), 1);
        buffer.mapping().unwrap().write_at(0, b"frame").unwrap();
        // Writes through the imported buffer land in the client memory.
        assert_eq!(
            handle.mapping().unwrap().to_vec(0, 5).unwrap(),
            b"frame".to_vec()
        );
        assert!(buffer.fd().is_ok());

        drop(buffer);
        assert_eq!(dummy.live_allocations(), 0);

        // Too small for the declared size.
        let small = fake_dmabuf(16);
        assert!(allocator.import_from_fd(small.as_fd(), 256).is_err());
    }
}
