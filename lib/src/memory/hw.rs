use std::fmt::{self, Debug};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use super::{AllocError, AllocationId, Allocator, BufferHandle, BufferMeta, ClientMemory, Mapping};

/// Memory backing a `HwBuffer`.
pub enum HwMemory {
    /// Client memory used in place.
    Wrapped(Mapping),
    /// Allocation owned by the buffer, freed when the buffer is dropped.
    Allocated {
        allocator: Arc<dyn Allocator>,
        id: AllocationId,
    },
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A buffer as seen by the codec SDK.
///
/// Shared as `Arc<HwBuffer>`: each clone is one reference held by either the
/// module or the SDK. Allocator-backed memory is released when the last
/// reference goes away.
pub struct HwBuffer {
    id: u64,
    memory: HwMemory,
    size: usize,
    meta: Mutex<BufferMeta>,
}

impl HwBuffer {
    fn new(memory: HwMemory, size: usize) -> Arc<Self> {
        Arc::new(HwBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            memory,
            size,
            meta: Default::default(),
        })
    }

    /// Wraps memory owned by someone else, without copy.
    pub fn wrap(mapping: Mapping, size: usize) -> Arc<Self> {
        Self::new(HwMemory::Wrapped(mapping), size)
    }

    /// Allocates a new buffer of `size` bytes from `allocator`.
    pub fn allocate(allocator: &Arc<dyn Allocator>, size: usize) -> Result<Arc<Self>, AllocError> {
        let id = allocator.alloc(size)?;
        Ok(Self::new(
            HwMemory::Allocated {
                allocator: Arc::clone(allocator),
                id,
            },
            size,
        ))
    }

    /// Makes the memory of a client buffer usable by the codec: dma-bufs are
    /// imported through `allocator`, plain memory is wrapped.
    pub fn from_handle(
        handle: &BufferHandle,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Arc<Self>, AllocError> {
        match handle.memory() {
            ClientMemory::Memory(m) => Ok(Self::wrap(Mapping::Memory(Arc::clone(m)), handle.size())),
            ClientMemory::DmaBuf(fd) => {
                let id = allocator.import_from_fd(fd.as_fd(), handle.size())?;
                debug!("Imported dma-buf of handle {} as {:?}", handle.id(), id);
                Ok(Self::new(
                    HwMemory::Allocated {
                        allocator: Arc::clone(allocator),
                        id,
                    },
                    handle.size(),
                ))
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mapping(&self) -> Result<Mapping, AllocError> {
        match &self.memory {
            HwMemory::Wrapped(m) => Ok(m.clone()),
            HwMemory::Allocated { allocator, id } => allocator.mapping(*id),
        }
    }

    /// Bus address of the buffer, if it was allocated by the device.
    pub fn physical_address(&self) -> Option<u64> {
        match &self.memory {
            HwMemory::Wrapped(_) => None,
            HwMemory::Allocated { allocator, id } => allocator.physical_address(*id).ok(),
        }
    }

    /// Exports the buffer as a dma-buf.
    pub fn fd(&self) -> Result<OwnedFd, AllocError> {
        match &self.memory {
            HwMemory::Wrapped(Mapping::File(f)) => Ok(f.try_clone()?.into()),
            HwMemory::Wrapped(Mapping::Memory(_)) => {
                Err(AllocError::Io(std::io::ErrorKind::Unsupported.into()))
            }
            HwMemory::Allocated { allocator, id } => allocator.get_fd(*id),
        }
    }

    pub fn meta(&self) -> MutexGuard<'_, BufferMeta> {
        self.meta.lock().unwrap()
    }
}

impl Drop for HwBuffer {
    fn drop(&mut self) {
        if let HwMemory::Allocated { allocator, id } = &self.memory {
            allocator.free(*id);
        }
    }
}

impl Debug for HwBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.memory {
            HwMemory::Wrapped(_) => "wrapped".to_string(),
            HwMemory::Allocated { id, .. } => format!("{:?}", id),
        };
        f.debug_struct("HwBuffer")
            .field("id", &self.id)
            .field("memory", &kind)
            .field("size", &self.size)
            .finish()
    }
}
