//! Copying encoded data out of stream buffers.
//!
//! The codec writes the sections of a frame wherever it sees fit in a stream
//! buffer (parameter sets and SEI messages at its end, picture data at its
//! start). Clients expect a contiguous bitstream, so sections are gathered
//! and written back in stream order.
use std::io;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::memory::{BufferHandle, Mapping, Section, SectionFlags};

/// Reads the bytes of `sections`, in order, into a single vector.
pub(super) fn gather(source: &Mapping, sections: &[Section]) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(sections.iter().map(|s| s.length).sum());
    for section in sections {
        data.extend_from_slice(&source.to_vec(section.offset, section.length)?);
    }
    Ok(data)
}

/// Writes the sections of `source` contiguously at the start of
/// `destination`, which may be the same memory. Returns the number of bytes
/// written.
pub(super) fn reconstruct(
    source: &Mapping,
    sections: &[Section],
    destination: &Mapping,
) -> io::Result<usize> {
    let data = gather(source, sections)?;
    destination.write_at(0, &data)?;
    Ok(data.len())
}

/// Splits sections between parameter sets and everything else, keeping
/// their order.
pub(super) fn split_configuration(sections: &[Section]) -> (Vec<Section>, Vec<Section>) {
    sections
        .iter()
        .copied()
        .partition(|s| s.flags.contains(SectionFlags::CONFIG))
}

#[derive(Default)]
struct SlotState {
    handle: Option<Arc<BufferHandle>>,
    closed: bool,
    /// Set once the first parameter sets of the run got their buffer.
    served: bool,
}

/// Holds the output buffer reserved for parameter sets when they are
/// delivered separately from picture data.
///
/// The first parameter sets of a run must be delivered on their own, so the
/// completion thread blocks in `take` until the client provides a buffer or
/// the slot is closed. Later parameter sets only use a buffer if one is
/// already held.
#[derive(Default)]
pub(super) struct ConfigSlot {
    state: Mutex<SlotState>,
    available: Condvar,
}

impl ConfigSlot {
    pub(super) fn open(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = false;
        state.served = false;
    }

    /// Keeps `handle` for the next parameter sets. Gives it back if a buffer
    /// is already held or the slot is closed.
    pub(super) fn offer(&self, handle: Arc<BufferHandle>) -> Result<(), Arc<BufferHandle>> {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.handle.is_some() {
            return Err(handle);
        }
        debug!("Encoder: handle {} reserved for parameter sets", handle.id());
        state.handle = Some(handle);
        self.available.notify_all();
        Ok(())
    }

    /// Returns the buffer held, waiting for one if no parameter sets were
    /// delivered yet in this run. Returns `None` once the slot is closed.
    pub(super) fn take(&self) -> Option<Arc<BufferHandle>> {
        let state = self.state.lock().unwrap();
        let mut state = self
            .available
            .wait_while(state, |s| s.handle.is_none() && !s.closed && !s.served)
            .unwrap();
        if state.closed {
            return None;
        }
        let handle = state.handle.take();
        if handle.is_some() {
            state.served = true;
        }
        handle
    }

    /// Wakes up waiters and returns the buffer held, if any.
    pub(super) fn close(&self) -> Option<Arc<BufferHandle>> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.available.notify_all();
        state.handle.take()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::memory::StreamMeta;

    fn memory(data: &[u8]) -> Mapping {
        Mapping::Memory(Arc::new(Mutex::new(data.to_vec())))
    }

    #[test]
    fn reconstruct_in_place() {
        // Picture data at the start, parameter sets at the end.
        let mapping = memory(b"DATA....CONF");
        let mut meta = StreamMeta::default();
        meta.add_section(8, 4, SectionFlags::CONFIG);
        meta.add_section(0, 4, SectionFlags::END_OF_FRAME);

        assert_eq!(reconstruct(&mapping, &meta.sections, &mapping).unwrap(), 8);
        assert_eq!(mapping.to_vec(0, 8).unwrap(), b"CONFDATA");
    }

    #[test]
    fn configuration_split() {
        let mut meta = StreamMeta::default();
        meta.add_section(60, 4, SectionFlags::CONFIG);
        meta.add_section(50, 10, SectionFlags::SEI);
        meta.add_section(0, 8, SectionFlags::empty());
        meta.add_section(8, 8, SectionFlags::END_OF_FRAME);

        let (config, data) = split_configuration(&meta.sections);
        assert_eq!(config, vec![meta.sections[0]]);
        assert_eq!(data, meta.sections[1..].to_vec());
    }

    #[test]
    fn slot_hands_over_buffer() {
        let slot = Arc::new(ConfigSlot::default());
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.take().map(|h| h.id()))
        };
        thread::sleep(Duration::from_millis(10));
        let handle = BufferHandle::alloc(16);
        slot.offer(handle.clone()).unwrap();
        assert_eq!(waiter.join().unwrap(), Some(handle.id()));

        // Only one buffer is held at a time.
        slot.offer(BufferHandle::alloc(16)).unwrap();
        assert!(slot.offer(BufferHandle::alloc(16)).is_err());
    }

    #[test]
    fn only_first_configuration_waits() {
        let slot = Arc::new(ConfigSlot::default());
        let first = BufferHandle::alloc(16);
        slot.offer(first.clone()).unwrap();
        assert_eq!(slot.take().map(|h| h.id()), Some(first.id()));

        // Nothing held: the caller keeps the parameter sets inline.
        assert!(slot.take().is_none());
        let second = BufferHandle::alloc(16);
        slot.offer(second.clone()).unwrap();
        assert_eq!(slot.take().map(|h| h.id()), Some(second.id()));

        // A new run waits again.
        slot.close();
        slot.open();
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.take().map(|h| h.id()))
        };
        thread::sleep(Duration::from_millis(10));
        let third = BufferHandle::alloc(16);
        slot.offer(third.clone()).unwrap();
        assert_eq!(waiter.join().unwrap(), Some(third.id()));
    }

    #[test]
    fn closing_unblocks_waiters() {
        let slot = Arc::new(ConfigSlot::default());
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.take())
        };
        thread::sleep(Duration::from_millis(10));
        assert!(slot.close().is_none());
        assert!(waiter.join().unwrap().is_none());

        let handle = BufferHandle::alloc(16);
        assert!(slot.offer(handle.clone()).is_err());
        slot.open();
        slot.offer(handle.clone()).unwrap();
        assert_eq!(slot.close().map(|h| h.id()), Some(handle.id()));
    }
}
