use std::time::Duration;

use super::{ChannelErrors, SyncError};

/// Lets the driver pick a free channel or frame buffer slot.
pub const AUTO_SEARCH: u8 = 0xff;

/// Largest number of channels a sync IP can have.
pub const MAX_CHANNELS: usize = 4;
/// Frame buffers each channel can track at the same time.
pub const BUFFERS_PER_CHANNEL: usize = 3;

/// Index of the producer role in per-role arrays.
pub const PRODUCER: usize = 0;
/// Index of the consumer role in per-role arrays.
pub const CONSUMER: usize = 1;

/// Static properties of a sync IP instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Whether the IP sits in front of an encoder (as opposed to behind a
    /// decoder).
    pub encoder: bool,
    pub max_channels: u8,
}

/// Status of one channel as reported by the driver. Flags are 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelSnapshot {
    /// Per slot and role: whether the role is done with the frame buffer.
    pub fb_done: [[u8; 2]; BUFFERS_PER_CHANNEL],
    pub enable: u8,
    pub sync_err: u8,
    pub wdg_err: u8,
    pub ldiff_err: u8,
    pub cdiff_err: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub channels: [ChannelSnapshot; MAX_CHANNELS],
}

/// Bus address range of a plane, end included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneRange {
    pub start: u64,
    pub end: u64,
}

/// A frame buffer to track, as programmed into a channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub channel: u8,
    pub fb: u8,
    pub luma: PlaneRange,
    pub chroma: PlaneRange,
    /// Lines the consumer stays behind the producer.
    pub luma_margin: u32,
    pub chroma_margin: u32,
    pub monochrome: bool,
    /// Id of the `HwBuffer` described. Not sent to the hardware.
    pub buffer_id: u64,
}

/// Requests understood by a sync driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMessage {
    GetConfig,
    GetStatus,
    /// Reserves the first free channel.
    ReserveChannel,
    /// Gives back a channel obtained through `ReserveChannel`.
    ReleaseChannel(u8),
    /// Programs a frame buffer into a slot of a channel.
    SetChannelConfig(BufferDescriptor),
    Enable(u8),
    Disable(u8),
    ClearErrors(u8, ChannelErrors),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReply {
    Done,
    Config(SyncConfig),
    Status(SyncStatus),
    Channel(u8),
}

/// Access to the sync IP.
pub trait SyncDriver: Send + Sync {
    fn post(&self, message: SyncMessage) -> Result<SyncReply, SyncError>;
    /// Waits up to `timeout` for a status change. Returns whether one
    /// happened.
    fn poll(&self, timeout: Duration) -> Result<bool, SyncError>;

    fn config(&self) -> Result<SyncConfig, SyncError> {
        match self.post(SyncMessage::GetConfig)? {
            SyncReply::Config(config) => Ok(config),
            _ => Err(SyncError::UnexpectedReply),
        }
    }

    fn status(&self) -> Result<SyncStatus, SyncError> {
        match self.post(SyncMessage::GetStatus)? {
            SyncReply::Status(status) => Ok(status),
            _ => Err(SyncError::UnexpectedReply),
        }
    }

    fn reserve_channel(&self) -> Result<u8, SyncError> {
        match self.post(SyncMessage::ReserveChannel)? {
            SyncReply::Channel(channel) => Ok(channel),
            _ => Err(SyncError::UnexpectedReply),
        }
    }
}
