//! Control of the frame-buffer synchronization IP.
//!
//! The sync IP sits between a producer (e.g. a capture pipeline or the
//! decoder) and a consumer (e.g. the encoder or a display) sharing frame
//! buffers, and lets the consumer start reading a frame before the producer
//! is done writing it. Each channel tracks a few frame buffers at a time,
//! programmed through `add_buffer`.
//!
//! `SyncIp` owns a thread polling the driver. Every time the driver reports
//! an event the status of all channels is refreshed; channels with errors
//! have their error listener invoked and their errors cleared, and status
//! watchers are told about the new status.
mod channel;
pub mod driver;
pub mod dummy;
mod status;
pub mod xvsfsync;

pub use channel::{DecSyncChannel, EncSyncChannel};
pub use driver::*;
pub use status::{ChannelErrors, ChannelStatus};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How long the poll thread waits for an event before checking whether it
/// should stop.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient: the slot will be free again once the hardware is done with
    /// a frame.
    #[error("no free frame buffer slot on channel {0}")]
    NoFreeSlot(u8),
    #[error("no free sync channel")]
    NoFreeChannel,
    #[error("invalid sync channel {0}")]
    InvalidChannel(u8),
    #[error("sync channel {0} is already enabled")]
    AlreadyEnabled(u8),
    #[error("sync channel {0} is already disabled")]
    AlreadyDisabled(u8),
    #[error("buffer {0} is already queued")]
    AlreadyQueued(u64),
    #[error("buffer {0} has no bus address")]
    NoBusAddress(u64),
    #[error("unexpected reply from the sync driver")]
    UnexpectedReply,
    #[error("sync driver error: {0}")]
    Driver(#[from] nix::Error),
    #[error("cannot start the poll thread: {0}")]
    Thread(std::io::Error),
}

pub type ErrorListener = Arc<dyn Fn(ChannelErrors) + Send + Sync>;
pub type StatusWatcher = Arc<dyn Fn(&ChannelStatus) + Send + Sync>;

#[derive(Default)]
struct SyncState {
    statuses: Vec<ChannelStatus>,
    listeners: BTreeMap<u8, ErrorListener>,
    watchers: BTreeMap<u8, StatusWatcher>,
}

struct SyncShared {
    driver: Arc<dyn SyncDriver>,
    config: SyncConfig,
    state: Mutex<SyncState>,
}

impl SyncShared {
    fn refresh(&self) {
        let status = match self.driver.status() {
            Ok(status) => status,
            Err(e) => {
                error!("Cannot read sync IP status: {}", e);
                return;
            }
        };

        let mut erroneous = Vec::new();
        let mut watched = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            for (i, snapshot) in status
                .channels
                .iter()
                .enumerate()
                .take(self.config.max_channels as usize)
            {
                let channel = i as u8;
                let status = ChannelStatus::from(snapshot);
                state.statuses[i] = status;
                if !status.errors.is_empty() {
                    if let Some(listener) = state.listeners.get(&channel) {
                        erroneous.push((channel, Arc::clone(listener), status.errors));
                    }
                }
                if let Some(watcher) = state.watchers.get(&channel) {
                    watched.push((Arc::clone(watcher), status));
                }
            }
        }

        for (channel, listener, errors) in erroneous {
            warn!("Sync channel {}: {:?}", channel, errors);
            listener(errors);
            match self
                .driver
                .post(SyncMessage::ClearErrors(channel, errors))
            {
                Ok(_) => {
                    let mut state = self.state.lock().unwrap();
                    state.statuses[channel as usize].errors.remove(errors);
                }
                Err(e) => error!("Cannot clear errors of sync channel {}: {}", channel, e),
            }
        }
        for (watcher, status) in watched {
            watcher(&status);
        }
    }

    fn poll_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.driver.poll(POLL_TIMEOUT) {
                Ok(true) => self.refresh(),
                Ok(false) => (),
                Err(e) => {
                    warn!("Sync IP poll failed: {}", e);
                    // Do not spin if the driver keeps failing.
                    thread::sleep(POLL_TIMEOUT);
                }
            }
        }

        // Deliver an event that came in while we were asked to stop.
        if let Ok(true) = self.driver.poll(Duration::ZERO) {
            self.refresh();
        }
        trace!("Sync IP poll thread exiting");
    }
}

/// A sync IP instance and its poll thread.
pub struct SyncIp {
    shared: Arc<SyncShared>,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SyncIp {
    pub fn new(driver: Arc<dyn SyncDriver>) -> Result<Self, SyncError> {
        let config = driver.config()?;
        let max_channels = (config.max_channels as usize).min(MAX_CHANNELS);
        debug!("Sync IP: {:?}", config);

        let shared = Arc::new(SyncShared {
            driver,
            config: SyncConfig {
                max_channels: max_channels as u8,
                ..config
            },
            state: Mutex::new(SyncState {
                statuses: vec![Default::default(); max_channels],
                ..Default::default()
            }),
        });

        let cancel = CancellationToken::new();
        let poller = {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("sync poll".into())
                .spawn(move || shared.poll_loop(cancel))
                .map_err(SyncError::Thread)?
        };

        Ok(SyncIp {
            shared,
            cancel,
            poller: Mutex::new(Some(poller)),
        })
    }

    pub fn config(&self) -> SyncConfig {
        self.shared.config
    }

    fn check_channel(&self, channel: u8) -> Result<(), SyncError> {
        if channel as usize >= self.shared.config.max_channels as usize {
            return Err(SyncError::InvalidChannel(channel));
        }
        Ok(())
    }

    pub fn reserve_channel(&self) -> Result<u8, SyncError> {
        let channel = self.shared.driver.reserve_channel()?;
        self.check_channel(channel)?;
        debug!("Reserved sync channel {}", channel);
        Ok(channel)
    }

    /// Gives back a channel from `reserve_channel`, forgetting its status.
    pub fn release_channel(&self, channel: u8) -> Result<(), SyncError> {
        self.check_channel(channel)?;
        self.shared.driver.post(SyncMessage::ReleaseChannel(channel))?;
        self.shared.state.lock().unwrap().statuses[channel as usize] = Default::default();
        debug!("Released sync channel {}", channel);
        Ok(())
    }

    /// Programs a frame buffer. Fails with `SyncError::NoFreeSlot` if the
    /// requested slot (or all of them, with `AUTO_SEARCH`) is still in use.
    pub fn add_buffer(&self, descriptor: &BufferDescriptor) -> Result<(), SyncError> {
        self.check_channel(descriptor.channel)?;
        trace!(
            "Sync channel {}: buffer {} in slot {}",
            descriptor.channel,
            descriptor.buffer_id,
            descriptor.fb
        );
        self.shared
            .driver
            .post(SyncMessage::SetChannelConfig(*descriptor))
            .map(|_| ())
    }

    pub fn enable_channel(&self, channel: u8) -> Result<(), SyncError> {
        self.check_channel(channel)?;
        self.shared.driver.post(SyncMessage::Enable(channel))?;
        self.shared.state.lock().unwrap().statuses[channel as usize].enabled = true;
        Ok(())
    }

    pub fn disable_channel(&self, channel: u8) -> Result<(), SyncError> {
        self.check_channel(channel)?;
        self.shared.driver.post(SyncMessage::Disable(channel))?;
        self.shared.state.lock().unwrap().statuses[channel as usize].enabled = false;
        Ok(())
    }

    /// Last known status of `channel`.
    pub fn status(&self, channel: u8) -> Result<ChannelStatus, SyncError> {
        self.check_channel(channel)?;
        Ok(self.shared.state.lock().unwrap().statuses[channel as usize])
    }

    /// Sets the function called with the errors of `channel`, before they
    /// are cleared.
    pub fn set_listener(&self, channel: u8, listener: Option<ErrorListener>) {
        let mut state = self.shared.state.lock().unwrap();
        match listener {
            Some(l) => state.listeners.insert(channel, l),
            None => state.listeners.remove(&channel),
        };
    }

    /// Sets the function called with the status of `channel` after every
    /// refresh.
    pub fn set_watcher(&self, channel: u8, watcher: Option<StatusWatcher>) {
        let mut state = self.shared.state.lock().unwrap();
        match watcher {
            Some(w) => state.watchers.insert(channel, w),
            None => state.watchers.remove(&channel),
        };
    }

    /// Stops the poll thread. Called on drop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.lock().unwrap().take() {
            if poller.join().is_err() {
                error!("Sync poll thread panicked");
            }
        }
    }
}

impl Drop for SyncIp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::dummy::DummySyncDriver;
    use super::*;

    fn descriptor(channel: u8, fb: u8, buffer_id: u64) -> BufferDescriptor {
        BufferDescriptor {
            channel,
            fb,
            luma: PlaneRange {
                start: 0x1000,
                end: 0x1fff,
            },
            chroma: PlaneRange {
                start: 0x2000,
                end: 0x27ff,
            },
            luma_margin: 0,
            chroma_margin: 0,
            monochrome: false,
            buffer_id,
        }
    }

    #[test]
    fn listeners_get_errors_once() {
        let driver = Arc::new(DummySyncDriver::new(true, 2));
        let sync = SyncIp::new(driver.clone()).unwrap();
        let channel = sync.reserve_channel().unwrap();

        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        sync.set_listener(
            channel,
            Some(Arc::new(move |errors| {
                sender.lock().unwrap().send(errors).unwrap()
            })),
        );

        driver.raise_errors(channel, ChannelErrors::WATCHDOG | ChannelErrors::SYNC);
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            ChannelErrors::WATCHDOG | ChannelErrors::SYNC
        );
        // Errors were cleared in the hardware: no second notification.
        driver.complete(channel, 0);
        assert!(receiver.recv_timeout(POLL_TIMEOUT * 4).is_err());
        assert_eq!(driver.errors(channel), ChannelErrors::empty());
    }

    #[test]
    fn watchers_see_refreshed_status() {
        let driver = Arc::new(DummySyncDriver::new(false, 1));
        let sync = SyncIp::new(driver.clone()).unwrap();
        let channel = sync.reserve_channel().unwrap();
        assert!(matches!(
            sync.reserve_channel(),
            Err(SyncError::NoFreeChannel)
        ));

        let refreshes = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&refreshes);
        sync.set_watcher(
            channel,
            Some(Arc::new(move |status: &ChannelStatus| {
                if status.is_available(1) {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );

        sync.add_buffer(&descriptor(channel, 1, 7)).unwrap();
        assert!(matches!(
            sync.add_buffer(&descriptor(channel, 1, 8)),
            Err(SyncError::NoFreeSlot(0))
        ));
        sync.enable_channel(channel).unwrap();
        driver.complete(channel, 1);
        while refreshes.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(sync.status(channel).unwrap().enabled);
        sync.add_buffer(&descriptor(channel, 1, 8)).unwrap();
        assert!(sync.status(4).is_err());
    }

    #[test]
    fn shutdown_drains_pending_event() {
        let driver = Arc::new(DummySyncDriver::new(true, 1));
        let sync = SyncIp::new(driver.clone()).unwrap();
        let channel = sync.reserve_channel().unwrap();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notified);
        sync.set_listener(
            channel,
            Some(Arc::new(move |_| {
                n.fetch_add(1, Ordering::SeqCst);
            })),
        );

        driver.raise_errors(channel, ChannelErrors::LUMA_DIFF);
        sync.shutdown();
        // Whether the loop or the final poll caught it, the event was
        // delivered exactly once.
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        sync.shutdown();
    }
}
