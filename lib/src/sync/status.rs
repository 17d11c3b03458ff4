use bitflags::bitflags;

use super::driver::{ChannelSnapshot, BUFFERS_PER_CHANNEL, CONSUMER, PRODUCER};

bitflags! {
    /// Errors the sync IP can raise on a channel.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ChannelErrors: u8 {
        /// Consumer read a line before the producer wrote it.
        const SYNC = 0b0001;
        /// A frame took too long.
        const WATCHDOG = 0b0010;
        const LUMA_DIFF = 0b0100;
        const CHROMA_DIFF = 0b1000;
    }
}

/// Our view of a channel, refreshed every time the driver reports an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    /// Per slot: whether the producer and consumer are done with the frame
    /// buffer.
    pub fb_available: [[bool; 2]; BUFFERS_PER_CHANNEL],
    pub enabled: bool,
    pub errors: ChannelErrors,
}

impl ChannelStatus {
    /// Whether both roles are done with slot `fb`.
    pub fn is_available(&self, fb: usize) -> bool {
        self.fb_available
            .get(fb)
            .map(|roles| roles[PRODUCER] && roles[CONSUMER])
            .unwrap_or(false)
    }
}

impl From<&ChannelSnapshot> for ChannelStatus {
    fn from(snapshot: &ChannelSnapshot) -> Self {
        let mut errors = ChannelErrors::empty();
        errors.set(ChannelErrors::SYNC, snapshot.sync_err != 0);
        errors.set(ChannelErrors::WATCHDOG, snapshot.wdg_err != 0);
        errors.set(ChannelErrors::LUMA_DIFF, snapshot.ldiff_err != 0);
        errors.set(ChannelErrors::CHROMA_DIFF, snapshot.cdiff_err != 0);

        ChannelStatus {
            fb_available: snapshot.fb_done.map(|roles| roles.map(|done| done != 0)),
            enabled: snapshot.enable != 0,
            errors,
        }
    }
}

impl From<&ChannelStatus> for ChannelSnapshot {
    fn from(status: &ChannelStatus) -> Self {
        let flag = |e| status.errors.contains(e) as u8;
        ChannelSnapshot {
            fb_done: status.fb_available.map(|roles| roles.map(u8::from)),
            enable: status.enabled as u8,
            sync_err: flag(ChannelErrors::SYNC),
            wdg_err: flag(ChannelErrors::WATCHDOG),
            ldiff_err: flag(ChannelErrors::LUMA_DIFF),
            cdiff_err: flag(ChannelErrors::CHROMA_DIFF),
        }
    }
}
