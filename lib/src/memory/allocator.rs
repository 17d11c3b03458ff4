use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use thiserror::Error;

use super::Mapping;

/// Identifies an allocation made by an `Allocator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("out of memory while allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("unknown allocation {0:?}")]
    InvalidAllocation(AllocationId),
    #[error("allocation {0:?} cannot be exported as a dma-buf")]
    NotExportable(AllocationId),
    #[error("failed to import dma-buf: {0}")]
    Import(io::Error),
    #[error("I/O error on buffer memory: {0}")]
    Io(#[from] io::Error),
}

/// Memory allocator of a codec device.
///
/// Allocations are referenced by `AllocationId` and must be given back through
/// `free` exactly once. `HwBuffer` takes care of this for the allocations it
/// owns.
pub trait Allocator: Send + Sync {
    fn alloc(&self, size: usize) -> Result<AllocationId, AllocError>;
    fn free(&self, id: AllocationId);

    /// Gives access to the bytes of an allocation.
    fn mapping(&self, id: AllocationId) -> Result<Mapping, AllocError>;
    /// Bus address of an allocation, as seen by the codec.
    fn physical_address(&self, id: AllocationId) -> Result<u64, AllocError>;

    /// Imports a dma-buf of `size` bytes. The allocator keeps its own
    /// reference to the underlying memory.
    fn import_from_fd(&self, fd: BorrowedFd<'_>, size: usize) -> Result<AllocationId, AllocError>;
    /// Exports an allocation as a dma-buf.
    fn get_fd(&self, id: AllocationId) -> Result<OwnedFd, AllocError>;
}
