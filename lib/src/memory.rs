//! Abstracts the memory a client hands to the codec and the buffers the
//! hardware SDK works on.
//!
//! A client buffer is represented by a `BufferHandle`, which is backed either
//! by plain process memory (`HandleType::Memory`) or by a dma-buf file
//! descriptor (`HandleType::DmaBuf`). The client owns the handle and shares it
//! with a module through an `Arc`; the module keeps a clone only while the
//! buffer is in flight, and reports the produced `offset`, `payload` and
//! `flags` through the handle before giving it back.
//!
//! The SDK side of a buffer is a `HwBuffer`. It either wraps the client memory
//! directly (no copy), or is backed by an allocation of the device's
//! `Allocator` (internal buffers and imported dma-bufs). Every `HwBuffer`
//! carries `BufferMeta`, the per-buffer metadata the SDK reads and writes.
//!
//! Byte access to both kinds of buffers goes through `Mapping`.
mod allocator;
mod hw;
mod meta;

pub use allocator::*;
pub use hw::*;
pub use meta::*;

use std::fmt::{self, Debug};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

/// Plain memory shared between the client and the module.
pub type SharedMemory = Arc<Mutex<Vec<u8>>>;

/// The kinds of memory a `BufferHandle` can be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleType {
    #[default]
    Memory,
    DmaBuf,
}

/// Backing memory of a client buffer.
pub enum ClientMemory {
    Memory(SharedMemory),
    DmaBuf(OwnedFd),
}

impl Debug for ClientMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMemory::Memory(m) => write!(f, "Memory({} bytes)", m.lock().unwrap().len()),
            ClientMemory::DmaBuf(fd) => write!(f, "DmaBuf({:?})", fd),
        }
    }
}

bitflags! {
    /// Flags set by a module on the buffers it returns.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const END_OF_FRAME = 0b0001;
        const SYNC_FRAME = 0b0010;
        const CONFIG = 0b0100;
        const END_OF_STREAM = 0b1000;
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A client buffer.
///
/// Each handle receives a unique `id` on creation, which modules use to track
/// it while it is in flight.
pub struct BufferHandle {
    id: u64,
    memory: ClientMemory,
    size: usize,
    offset: AtomicUsize,
    payload: AtomicUsize,
    flags: AtomicU32,
}

impl BufferHandle {
    fn new(memory: ClientMemory, size: usize) -> Self {
        BufferHandle {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            memory,
            size,
            offset: AtomicUsize::new(0),
            payload: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
        }
    }

    /// Allocates a zeroed buffer of `size` bytes in process memory.
    pub fn alloc(size: usize) -> Arc<Self> {
        Self::from_memory(Arc::new(Mutex::new(vec![0u8; size])))
    }

    /// Creates a handle over existing process memory.
    pub fn from_memory(memory: SharedMemory) -> Arc<Self> {
        let size = memory.lock().unwrap().len();
        Arc::new(Self::new(ClientMemory::Memory(memory), size))
    }

    /// Creates a handle over a dma-buf of `size` bytes.
    pub fn from_dmabuf(fd: OwnedFd, size: usize) -> Arc<Self> {
        Arc::new(Self::new(ClientMemory::DmaBuf(fd), size))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn memory(&self) -> &ClientMemory {
        &self.memory
    }

    pub fn handle_type(&self) -> HandleType {
        match self.memory {
            ClientMemory::Memory(_) => HandleType::Memory,
            ClientMemory::DmaBuf(_) => HandleType::DmaBuf,
        }
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.memory {
            ClientMemory::Memory(_) => None,
            ClientMemory::DmaBuf(fd) => Some(fd.as_fd()),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, offset: usize) {
        self.offset.store(offset, Ordering::Release)
    }

    pub fn payload(&self) -> usize {
        self.payload.load(Ordering::Acquire)
    }

    pub fn set_payload(&self, payload: usize) {
        self.payload.store(payload, Ordering::Release)
    }

    pub fn flags(&self) -> BufferFlags {
        BufferFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: BufferFlags) {
        self.flags.store(flags.bits(), Ordering::Release)
    }

    /// Returns a `Mapping` giving access to the bytes of this buffer.
    pub fn mapping(&self) -> io::Result<Mapping> {
        match &self.memory {
            ClientMemory::Memory(m) => Ok(Mapping::Memory(Arc::clone(m))),
            ClientMemory::DmaBuf(fd) => Ok(Mapping::File(Arc::new(File::from(fd.try_clone()?)))),
        }
    }
}

impl Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id)
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("offset", &self.offset())
            .field("payload", &self.payload())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Byte-level access to the memory of a buffer.
#[derive(Debug, Clone)]
pub enum Mapping {
    Memory(SharedMemory),
    File(Arc<File>),
}

fn out_of_bounds(offset: usize, len: usize, size: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!(
            "access of {} bytes at offset {} exceeds buffer size {}",
            len, offset, size
        ),
    )
}

impl Mapping {
    pub fn len(&self) -> io::Result<usize> {
        match self {
            Mapping::Memory(m) => Ok(m.lock().unwrap().len()),
            Mapping::File(f) => Ok(f.metadata()?.len() as usize),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        self.len().map(|l| l == 0)
    }

    /// Fills `buf` with the bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Mapping::Memory(m) => {
                let data = m.lock().unwrap();
                let src = data
                    .get(offset..offset + buf.len())
                    .ok_or_else(|| out_of_bounds(offset, buf.len(), data.len()))?;
                buf.copy_from_slice(src);
                Ok(())
            }
            Mapping::File(f) => f.read_exact_at(buf, offset as u64),
        }
    }

    /// Writes `data` starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> io::Result<()> {
        match self {
            Mapping::Memory(m) => {
                let mut mem = m.lock().unwrap();
                let size = mem.len();
                let dst = mem
                    .get_mut(offset..offset + data.len())
                    .ok_or_else(|| out_of_bounds(offset, data.len(), size))?;
                dst.copy_from_slice(data);
                Ok(())
            }
            Mapping::File(f) => f.write_all_at(data, offset as u64),
        }
    }

    /// Reads `len` bytes starting at `offset` into a new vector.
    pub fn to_vec(&self, offset: usize, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}
