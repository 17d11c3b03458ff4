//! Software sync IP.
//!
//! Frame buffers stay in their slot until the test calls `complete`, which
//! also reports the slot as done on the next status read.
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::trace;

use super::driver::*;
use super::{ChannelErrors, SyncError};

#[derive(Default)]
struct DummyChannel {
    reserved: bool,
    enabled: bool,
    slots: [Option<BufferDescriptor>; BUFFERS_PER_CHANNEL],
    fb_done: [[u8; 2]; BUFFERS_PER_CHANNEL],
    errors: ChannelErrors,
    /// Every descriptor programmed, in order.
    programmed: Vec<BufferDescriptor>,
}

#[derive(Default)]
struct DummyState {
    channels: Vec<DummyChannel>,
    event: bool,
}

impl DummyState {
    fn channel_mut(&mut self, channel: u8) -> Result<&mut DummyChannel, SyncError> {
        self.channels
            .get_mut(channel as usize)
            .ok_or(SyncError::InvalidChannel(channel))
    }
}

pub struct DummySyncDriver {
    config: SyncConfig,
    state: Mutex<DummyState>,
    wakeup: Condvar,
}

impl DummySyncDriver {
    pub fn new(encoder: bool, max_channels: u8) -> Self {
        let max_channels = max_channels.min(MAX_CHANNELS as u8);
        DummySyncDriver {
            config: SyncConfig {
                encoder,
                max_channels,
            },
            state: Mutex::new(DummyState {
                channels: (0..max_channels).map(|_| Default::default()).collect(),
                event: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    fn signal(&self, state: &mut DummyState) {
        state.event = true;
        self.wakeup.notify_all();
    }

    /// Both roles are done with slot `fb` of `channel`, which becomes free.
    pub fn complete(&self, channel: u8, fb: u8) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.channels.get_mut(channel as usize) {
            if let Some(slot) = c.slots.get_mut(fb as usize) {
                slot.take();
                c.fb_done[fb as usize] = [1, 1];
            }
        }
        self.signal(&mut state);
    }

    pub fn raise_errors(&self, channel: u8, errors: ChannelErrors) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.channels.get_mut(channel as usize) {
            c.errors |= errors;
        }
        self.signal(&mut state);
    }

    pub fn errors(&self, channel: u8) -> ChannelErrors {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(channel as usize)
            .map(|c| c.errors)
            .unwrap_or_default()
    }

    /// Descriptors currently in the slots of `channel`.
    pub fn slots(&self, channel: u8) -> Vec<Option<BufferDescriptor>> {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(channel as usize)
            .map(|c| c.slots.to_vec())
            .unwrap_or_default()
    }

    /// Ids of the buffers programmed into `channel` so far, in order.
    pub fn programmed(&self, channel: u8) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(channel as usize)
            .map(|c| c.programmed.iter().map(|d| d.buffer_id).collect())
            .unwrap_or_default()
    }

    pub fn is_reserved(&self, channel: u8) -> bool {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(channel as usize)
            .map(|c| c.reserved)
            .unwrap_or(false)
    }

    pub fn is_enabled(&self, channel: u8) -> bool {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(channel as usize)
            .map(|c| c.enabled)
            .unwrap_or(false)
    }
}

impl SyncDriver for DummySyncDriver {
    fn post(&self, message: SyncMessage) -> Result<SyncReply, SyncError> {
        let mut state = self.state.lock().unwrap();
        trace!("Dummy sync driver: {:?}", message);

        Ok(match message {
            SyncMessage::GetConfig => SyncReply::Config(self.config),
            SyncMessage::GetStatus => {
                let mut status = SyncStatus::default();
                for (snapshot, c) in status.channels.iter_mut().zip(state.channels.iter_mut()) {
                    *snapshot = ChannelSnapshot {
                        // Reading the status acknowledges completed slots.
                        fb_done: std::mem::take(&mut c.fb_done),
                        enable: c.enabled as u8,
                        sync_err: c.errors.contains(ChannelErrors::SYNC) as u8,
                        wdg_err: c.errors.contains(ChannelErrors::WATCHDOG) as u8,
                        ldiff_err: c.errors.contains(ChannelErrors::LUMA_DIFF) as u8,
                        cdiff_err: c.errors.contains(ChannelErrors::CHROMA_DIFF) as u8,
                    };
                }
                SyncReply::Status(status)
            }
            SyncMessage::ReserveChannel => {
                let (i, c) = state
                    .channels
                    .iter_mut()
                    .enumerate()
                    .find(|(_, c)| !c.reserved)
                    .ok_or(SyncError::NoFreeChannel)?;
                c.reserved = true;
                SyncReply::Channel(i as u8)
            }
            SyncMessage::ReleaseChannel(channel) => {
                let c = state.channel_mut(channel)?;
                *c = DummyChannel {
                    programmed: std::mem::take(&mut c.programmed),
                    ..Default::default()
                };
                SyncReply::Done
            }
            SyncMessage::SetChannelConfig(descriptor) => {
                let c = state.channel_mut(descriptor.channel)?;
                let fb = if descriptor.fb == AUTO_SEARCH {
                    c.slots.iter().position(Option::is_none)
                } else {
                    Some(descriptor.fb as usize).filter(|fb| {
                        c.slots.get(*fb).map(Option::is_none).unwrap_or(false)
                    })
                };
                let fb = fb.ok_or(SyncError::NoFreeSlot(descriptor.channel))?;
                let descriptor = BufferDescriptor {
                    fb: fb as u8,
                    ..descriptor
                };
                c.slots[fb] = Some(descriptor);
                c.programmed.push(descriptor);
                SyncReply::Done
            }
            SyncMessage::Enable(channel) => {
                state.channel_mut(channel)?.enabled = true;
                SyncReply::Done
            }
            SyncMessage::Disable(channel) => {
                let c = state.channel_mut(channel)?;
                c.enabled = false;
                c.slots = Default::default();
                SyncReply::Done
            }
            SyncMessage::ClearErrors(channel, errors) => {
                state.channel_mut(channel)?.errors.remove(errors);
                SyncReply::Done
            }
        })
    }

    fn poll(&self, timeout: Duration) -> Result<bool, SyncError> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .wakeup
            .wait_timeout_while(state, timeout, |s| !s.event)
            .unwrap();
        Ok(std::mem::take(&mut state.event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(channel: u8, fb: u8) -> BufferDescriptor {
        BufferDescriptor {
            channel,
            fb,
            luma: Default::default(),
            chroma: Default::default(),
            luma_margin: 0,
            chroma_margin: 0,
            monochrome: true,
            buffer_id: 1,
        }
    }

    #[test]
    fn slots() {
        let driver = DummySyncDriver::new(true, 1);
        for _ in 0..BUFFERS_PER_CHANNEL {
            driver
                .post(SyncMessage::SetChannelConfig(descriptor(0, AUTO_SEARCH)))
                .unwrap();
        }
        assert!(matches!(
            driver.post(SyncMessage::SetChannelConfig(descriptor(0, AUTO_SEARCH))),
            Err(SyncError::NoFreeSlot(0))
        ));
        assert!(matches!(
            driver.post(SyncMessage::SetChannelConfig(descriptor(1, 0))),
            Err(SyncError::InvalidChannel(1))
        ));

        driver.complete(0, 1);
        assert!(driver.poll(Duration::ZERO).unwrap());
        assert!(!driver.poll(Duration::ZERO).unwrap());

        let status = driver.status().unwrap();
        assert_eq!(status.channels[0].fb_done[1], [1, 1]);
        // Acknowledged by the first read.
        assert_eq!(driver.status().unwrap().channels[0].fb_done[1], [0, 0]);

        driver
            .post(SyncMessage::SetChannelConfig(descriptor(0, 1)))
            .unwrap();
        assert_eq!(driver.programmed(0).len(), BUFFERS_PER_CHANNEL + 1);
    }

    #[test]
    fn released_channels_can_be_reserved_again() {
        let driver = DummySyncDriver::new(true, 1);
        assert_eq!(driver.reserve_channel().unwrap(), 0);
        assert!(matches!(
            driver.reserve_channel(),
            Err(SyncError::NoFreeChannel)
        ));
        driver.post(SyncMessage::Enable(0)).unwrap();
        driver
            .post(SyncMessage::SetChannelConfig(descriptor(0, AUTO_SEARCH)))
            .unwrap();

        driver.post(SyncMessage::ReleaseChannel(0)).unwrap();
        assert!(!driver.is_reserved(0));
        assert!(!driver.is_enabled(0));
        assert_eq!(driver.slots(0), vec![None; BUFFERS_PER_CHANNEL]);
        assert_eq!(driver.reserve_channel().unwrap(), 0);
    }
}
