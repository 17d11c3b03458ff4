use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, trace};

use super::driver::{BufferDescriptor, PlaneRange, AUTO_SEARCH, BUFFERS_PER_CHANNEL};
use super::{ChannelErrors, ChannelStatus, SyncError, SyncIp};
use crate::memory::{HwBuffer, SourceMeta};
use crate::ChromaMode;

impl BufferDescriptor {
    /// Describes the picture held in `buffer`, laid out as `meta` says.
    ///
    /// Only buffers with a bus address (allocated or imported by the device)
    /// can be tracked by the sync IP.
    pub fn for_picture(buffer: &HwBuffer, meta: &SourceMeta) -> Result<Self, SyncError> {
        let base = buffer
            .physical_address()
            .ok_or(SyncError::NoBusAddress(buffer.id()))?;
        let width = meta.format.line_bytes(meta.resolution.width).unwrap_or(0) as u64;
        let pitch = meta.stride.horizontal as u64;
        let plane_end = |start: u64, lines: u64| start + pitch * lines.saturating_sub(1) + width.saturating_sub(1);

        let luma_start = base;
        let luma_end = plane_end(luma_start, meta.resolution.height as u64);
        let chroma_mode = meta.format.chroma_mode();
        let chroma_start = base + meta.chroma_offset() as u64;
        let chroma_end = match chroma_mode {
            Some(mode) => plane_end(chroma_start, mode.chroma_lines(meta.resolution.height) as u64),
            None => chroma_start,
        };

        Ok(BufferDescriptor {
            channel: AUTO_SEARCH,
            fb: AUTO_SEARCH,
            luma: PlaneRange {
                start: luma_start,
                end: luma_end,
            },
            chroma: PlaneRange {
                start: chroma_start,
                end: chroma_end,
            },
            luma_margin: 0,
            chroma_margin: 0,
            monochrome: chroma_mode == Some(ChromaMode::Monochrome),
            buffer_id: buffer.id(),
        })
    }
}

#[derive(Default)]
struct QueueState {
    enabled: bool,
    queue: VecDeque<BufferDescriptor>,
    /// Slot the next buffer goes into, for round-robin channels.
    next_slot: usize,
}

/// Buffers waiting to be programmed into a channel.
struct ChannelQueue {
    id: u8,
    sync: Arc<SyncIp>,
    round_robin: bool,
    state: Mutex<QueueState>,
}

impl ChannelQueue {
    fn new(sync: Arc<SyncIp>, round_robin: bool) -> Result<Arc<Self>, SyncError> {
        let id = sync.reserve_channel()?;
        Ok(Arc::new(ChannelQueue {
            id,
            sync,
            round_robin,
            state: Default::default(),
        }))
    }

    fn push(&self, mut descriptor: BufferDescriptor) -> Result<(), SyncError> {
        descriptor.channel = self.id;
        let mut state = self.state.lock().unwrap();
        if state
            .queue
            .iter()
            .any(|d| d.buffer_id == descriptor.buffer_id)
        {
            return Err(SyncError::AlreadyQueued(descriptor.buffer_id));
        }
        state.queue.push_back(descriptor);
        if state.enabled {
            self.program_queued(&mut state);
        }
        Ok(())
    }

    /// Programs as many queued buffers as the hardware has free slots for.
    /// Returns the number of buffers programmed.
    fn program_queued(&self, state: &mut QueueState) -> usize {
        let mut programmed = 0;
        while let Some(front) = state.queue.front() {
            let mut descriptor = *front;
            if self.round_robin {
                descriptor.fb = state.next_slot as u8;
            }
            match self.sync.add_buffer(&descriptor) {
                Ok(()) => {
                    state.queue.pop_front();
                    state.next_slot = (state.next_slot + 1) % BUFFERS_PER_CHANNEL;
                    programmed += 1;
                }
                Err(SyncError::NoFreeSlot(_)) => break,
                Err(e) => {
                    error!("Sync channel {}: dropping buffer {}: {}", self.id, descriptor.buffer_id, e);
                    state.queue.pop_front();
                }
            }
        }
        programmed
    }

    fn enable(&self) -> Result<usize, SyncError> {
        let mut state = self.state.lock().unwrap();
        if state.enabled {
            return Err(SyncError::AlreadyEnabled(self.id));
        }
        state.enabled = true;
        let programmed = self.program_queued(&mut state);
        self.sync.enable_channel(self.id)?;
        debug!("Sync channel {} enabled, {} buffers programmed", self.id, programmed);
        Ok(programmed)
    }

    fn disable(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        if !state.enabled {
            error!("Sync channel {} disabled twice", self.id);
            return Err(SyncError::AlreadyDisabled(self.id));
        }
        state.enabled = false;
        state.queue.clear();
        state.next_slot = 0;
        self.sync.disable_channel(self.id)?;
        debug!("Sync channel {} disabled", self.id);
        Ok(())
    }

    fn on_status(&self, status: &ChannelStatus) {
        let mut state = self.state.lock().unwrap();
        if state.enabled && !state.queue.is_empty() {
            let programmed = self.program_queued(&mut state);
            trace!(
                "Sync channel {}: refilled {} slots ({:?})",
                self.id,
                programmed,
                status.fb_available
            );
        }
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

impl Drop for ChannelQueue {
    fn drop(&mut self) {
        self.sync.set_listener(self.id, None);
        self.sync.set_watcher(self.id, None);
        if self.state.get_mut().map(|s| s.enabled).unwrap_or(false) {
            if let Err(e) = self.sync.disable_channel(self.id) {
                error!("Cannot disable sync channel {}: {}", self.id, e);
            }
        }
        if let Err(e) = self.sync.release_channel(self.id) {
            error!("Cannot release sync channel {}: {}", self.id, e);
        }
    }
}

/// Sync channel in front of an encoder.
///
/// Source buffers are queued as they are submitted and programmed into the
/// channel slots in round-robin order, as slots become free.
pub struct EncSyncChannel {
    queue: Arc<ChannelQueue>,
}

impl EncSyncChannel {
    pub fn new(sync: Arc<SyncIp>) -> Result<Self, SyncError> {
        let queue = ChannelQueue::new(sync, true)?;
        let weak: Weak<ChannelQueue> = Arc::downgrade(&queue);
        queue.sync.set_watcher(
            queue.id,
            Some(Arc::new(move |status: &ChannelStatus| {
                if let Some(queue) = weak.upgrade() {
                    queue.on_status(status);
                }
            })),
        );
        Ok(EncSyncChannel { queue })
    }

    pub fn id(&self) -> u8 {
        self.queue.id
    }

    /// Queues a buffer, programming it right away if a slot is free.
    pub fn add_buffer(&self, descriptor: BufferDescriptor) -> Result<(), SyncError> {
        self.queue.push(descriptor)
    }

    /// Programs the queued buffers and starts synchronization. Returns the
    /// number of buffers programmed.
    pub fn enable(&self) -> Result<usize, SyncError> {
        self.queue.enable()
    }

    /// Stops synchronization and forgets the queued buffers.
    pub fn disable(&self) -> Result<(), SyncError> {
        self.queue.disable()
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_enabled()
    }

    /// Number of buffers waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.queue.queued()
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn Fn(ChannelErrors) + Send + Sync>>) {
        self.queue.sync.set_listener(self.queue.id, listener);
    }
}

/// Sync channel behind a decoder.
///
/// Once enabled, frame buffers are programmed as they are added, in any free
/// slot. `add_buffer` fails with `SyncError::NoFreeSlot` when none is free.
pub struct DecSyncChannel {
    queue: Arc<ChannelQueue>,
}

impl DecSyncChannel {
    pub fn new(sync: Arc<SyncIp>) -> Result<Self, SyncError> {
        Ok(DecSyncChannel {
            queue: ChannelQueue::new(sync, false)?,
        })
    }

    pub fn id(&self) -> u8 {
        self.queue.id
    }

    pub fn add_buffer(&self, mut descriptor: BufferDescriptor) -> Result<(), SyncError> {
        if !self.queue.is_enabled() {
            return self.queue.push(descriptor);
        }
        descriptor.channel = self.queue.id;
        self.queue.sync.add_buffer(&descriptor)
    }

    pub fn enable(&self) -> Result<usize, SyncError> {
        self.queue.enable()
    }

    pub fn disable(&self) -> Result<(), SyncError> {
        self.queue.disable()
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_enabled()
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn Fn(ChannelErrors) + Send + Sync>>) {
        self.queue.sync.set_listener(self.queue.id, listener);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::super::dummy::DummySyncDriver;
    use super::*;
    use crate::device::dummy::DummyAllocator;
    use crate::memory::Allocator;
    use crate::{PixelFormat, Resolution, Stride};

    fn sync_ip(encoder: bool) -> (Arc<DummySyncDriver>, Arc<SyncIp>) {
        let driver = Arc::new(DummySyncDriver::new(encoder, 2));
        let sync = Arc::new(SyncIp::new(driver.clone()).unwrap());
        (driver, sync)
    }

    fn pictures(count: usize) -> Vec<(Arc<HwBuffer>, SourceMeta)> {
        let allocator: Arc<dyn Allocator> = Arc::new(DummyAllocator::new(1 << 20));
        let resolution = Resolution::new(64, 32);
        let stride = Stride::for_picture(
            resolution,
            PixelFormat::NV12,
            Stride {
                horizontal: 128,
                vertical: 32,
            },
        )
        .unwrap();
        let meta = SourceMeta {
            resolution,
            format: PixelFormat::NV12,
            stride,
        };
        let size = stride.picture_size(PixelFormat::NV12).unwrap();
        (0..count)
            .map(|_| (HwBuffer::allocate(&allocator, size).unwrap(), meta))
            .collect()
    }

    #[test]
    fn descriptor_layout() {
        let (buffer, meta) = pictures(1).remove(0);
        let d = BufferDescriptor::for_picture(&buffer, &meta).unwrap();
        let base = buffer.physical_address().unwrap();
        assert_eq!(d.luma.start, base);
        assert_eq!(d.luma.end, base + 128 * 31 + 63);
        assert_eq!(d.chroma.start, base + 128 * 32);
        assert_eq!(d.chroma.end, d.chroma.start + 128 * 15 + 63);
        assert!(!d.monochrome);

        let wrapped = HwBuffer::wrap(
            crate::memory::Mapping::Memory(Arc::new(Mutex::new(vec![0; 16]))),
            16,
        );
        assert!(matches!(
            BufferDescriptor::for_picture(&wrapped, &meta),
            Err(SyncError::NoBusAddress(_))
        ));
    }

    #[test]
    fn double_disable() {
        let (driver, sync) = sync_ip(true);
        let channel = EncSyncChannel::new(sync).unwrap();
        assert!(matches!(
            channel.disable(),
            Err(SyncError::AlreadyDisabled(_))
        ));
        // Nothing queued: nothing programmed.
        assert_eq!(channel.enable().unwrap(), 0);
        assert!(driver.is_enabled(channel.id()));
        assert!(matches!(
            channel.enable(),
            Err(SyncError::AlreadyEnabled(_))
        ));
        channel.disable().unwrap();
        assert!(matches!(
            channel.disable(),
            Err(SyncError::AlreadyDisabled(_))
        ));
        assert!(!driver.is_enabled(channel.id()));
    }

    #[test]
    fn dropped_channels_are_released() {
        let driver = Arc::new(DummySyncDriver::new(true, 1));
        let sync = Arc::new(SyncIp::new(driver.clone()).unwrap());
        let channel = EncSyncChannel::new(sync.clone()).unwrap();
        let id = channel.id();
        channel.enable().unwrap();
        channel.disable().unwrap();
        assert!(matches!(
            DecSyncChannel::new(sync.clone()),
            Err(SyncError::NoFreeChannel)
        ));
        drop(channel);
        assert!(!driver.is_reserved(id));

        // Also when dropped while enabled.
        let channel = EncSyncChannel::new(sync.clone()).unwrap();
        assert_eq!(channel.id(), id);
        channel.enable().unwrap();
        drop(channel);
        assert!(!driver.is_enabled(id));
        let channel = DecSyncChannel::new(sync).unwrap();
        assert_eq!(channel.id(), id);
    }

    #[test]
    fn encoder_refills_slots_in_order() {
        let (driver, sync) = sync_ip(true);
        let channel = EncSyncChannel::new(sync).unwrap();
        let pictures = pictures(5);
        for (buffer, meta) in &pictures {
            channel
                .add_buffer(BufferDescriptor::for_picture(buffer, meta).unwrap())
                .unwrap();
        }
        let (buffer, meta) = &pictures[4];
        assert!(matches!(
            channel.add_buffer(BufferDescriptor::for_picture(buffer, meta).unwrap()),
            Err(SyncError::AlreadyQueued(_))
        ));

        assert_eq!(channel.enable().unwrap(), BUFFERS_PER_CHANNEL);
        assert_eq!(channel.queued(), 2);

        // Slot 0 is done: the next buffer takes it, slot 1 is next in line.
        driver.complete(channel.id(), 0);
        while channel.queued() > 1 {
            thread::sleep(Duration::from_millis(1));
        }
        // Slot 2 finishing first does not break the round-robin order.
        driver.complete(channel.id(), 2);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(channel.queued(), 1);
        driver.complete(channel.id(), 1);
        while channel.queued() > 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let ids: Vec<u64> = pictures.iter().map(|(b, _)| b.id()).collect();
        assert_eq!(driver.programmed(channel.id()), ids);
        let slots: Vec<Option<u64>> = driver
            .slots(channel.id())
            .into_iter()
            .map(|s| s.map(|d| d.buffer_id))
            .collect();
        assert_eq!(slots, vec![Some(ids[3]), Some(ids[4]), None]);
    }

    #[test]
    fn decoder_reports_full_channel() {
        let (_driver, sync) = sync_ip(false);
        let channel = DecSyncChannel::new(sync).unwrap();
        let pictures = pictures(BUFFERS_PER_CHANNEL + 1);
        channel
            .add_buffer(BufferDescriptor::for_picture(&pictures[0].0, &pictures[0].1).unwrap())
            .unwrap();
        assert_eq!(channel.enable().unwrap(), 1);

        for (buffer, meta) in &pictures[1..BUFFERS_PER_CHANNEL] {
            channel
                .add_buffer(BufferDescriptor::for_picture(buffer, meta).unwrap())
                .unwrap();
        }
        let (buffer, meta) = &pictures[BUFFERS_PER_CHANNEL];
        assert!(matches!(
            channel.add_buffer(BufferDescriptor::for_picture(buffer, meta).unwrap()),
            Err(SyncError::NoFreeSlot(_))
        ));
    }
}
