//! Software implementation of the codec SDK.
//!
//! `DummyDevice` behaves like the hardware as far as buffer ownership,
//! ordering and callbacks are concerned, but produces a toy bitstream (see
//! `packet`) instead of real video. Every channel runs on its own thread and
//! reports completions from it.
//!
//! The device keeps a log of what each channel was asked to process, which
//! tests use to check the order in which frames reach the hardware.
mod allocator;
mod decoder;
mod encoder;
pub mod packet;

pub use allocator::DummyAllocator;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::device::{
    DecChannelConfig, DecodeCallbacks, DecodeChannel, Device, EncChannelConfig, EncodeCallback,
    EncodeChannel,
};
use crate::error::HwError;
use crate::memory::Allocator;

use decoder::DummyDecodeChannel;
use encoder::DummyEncodeChannel;

/// Behavior of a `DummyDevice`.
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Number of channels that can exist at the same time.
    pub max_channels: usize,
    /// Bytes the allocator can hand out.
    pub memory: usize,
    /// Error returned by the next channel creations, if any.
    pub create_error: Option<HwError>,
    /// Errors reported by encoding channels for the given frame indices.
    pub encode_errors: Vec<(u64, HwError)>,
    /// Time spent on each frame.
    pub latency: Duration,
}

impl Default for DummyConfig {
    fn default() -> Self {
        DummyConfig {
            max_channels: 8,
            memory: 256 * 1024 * 1024,
            create_error: None,
            encode_errors: Vec::new(),
            latency: Duration::ZERO,
        }
    }
}

/// What a channel was asked to process.
#[derive(Debug, Default)]
pub struct ChannelLog {
    /// Ids of the buffers submitted, `None` for end of stream.
    submissions: Mutex<Vec<Option<u64>>>,
    /// Number of frames completed.
    completed: AtomicUsize,
}

impl ChannelLog {
    fn record(&self, buffer: Option<u64>) {
        self.submissions.lock().unwrap().push(buffer);
    }

    pub fn submissions(&self) -> Vec<Option<u64>> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

pub struct DummyDevice {
    config: Mutex<DummyConfig>,
    allocator: Arc<DummyAllocator>,
    initialized: AtomicBool,
    live_channels: Arc<AtomicUsize>,
    logs: Mutex<Vec<Arc<ChannelLog>>>,
}

impl DummyDevice {
    pub fn new(config: DummyConfig) -> Self {
        DummyDevice {
            allocator: Arc::new(DummyAllocator::new(config.memory)),
            config: Mutex::new(config),
            initialized: AtomicBool::new(false),
            live_channels: Default::default(),
            logs: Default::default(),
        }
    }

    pub fn dummy_allocator(&self) -> &Arc<DummyAllocator> {
        &self.allocator
    }

    /// Changes the error returned when creating channels.
    pub fn set_create_error(&self, error: Option<HwError>) {
        self.config.lock().unwrap().create_error = error;
    }

    /// Number of channels currently alive.
    pub fn live_channels(&self) -> usize {
        self.live_channels.load(Ordering::SeqCst)
    }

    /// Log of the `index`-th channel created on this device.
    pub fn channel_log(&self, index: usize) -> Option<Arc<ChannelLog>> {
        self.logs.lock().unwrap().get(index).cloned()
    }

    pub fn channels_created(&self) -> usize {
        self.logs.lock().unwrap().len()
    }

    /// Reserves a channel slot, returning its index and log.
    fn reserve_channel(&self) -> Result<(usize, Arc<ChannelLog>), HwError> {
        if !self.initialized.load(Ordering::SeqCst) {
            warn!("Channel requested on uninitialized device");
            return Err(HwError::ResourceUnavailable);
        }
        let config = self.config.lock().unwrap();
        if let Some(e) = config.create_error {
            return Err(e);
        }
        let live = self.live_channels.fetch_add(1, Ordering::SeqCst);
        if live >= config.max_channels {
            self.live_channels.fetch_sub(1, Ordering::SeqCst);
            return Err(HwError::NoChannelAvailable);
        }

        let mut logs = self.logs.lock().unwrap();
        let log = Arc::new(ChannelLog::default());
        logs.push(Arc::clone(&log));
        Ok((logs.len() - 1, log))
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl Device for DummyDevice {
    fn init(&self) -> Result<(), HwError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Dummy device already initialized");
        } else {
            info!("Dummy device initialized");
        }
        Ok(())
    }

    fn deinit(&self) {
        if self.live_channels() > 0 {
            warn!("Dummy device deinitialized with {} live channels", self.live_channels());
        }
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn create_encoder(
        &self,
        config: EncChannelConfig,
        on_complete: EncodeCallback,
    ) -> Result<Box<dyn EncodeChannel>, HwError> {
        let (index, log) = self.reserve_channel()?;
        debug!("Creating encoder channel {}: {:?}", index, config);
        let errors = self.config.lock().unwrap().encode_errors.clone();
        let latency = self.config.lock().unwrap().latency;
        match DummyEncodeChannel::new(
            index,
            config,
            on_complete,
            log,
            errors,
            latency,
            Arc::clone(&self.live_channels),
        ) {
            Ok(channel) => Ok(Box::new(channel)),
            Err(e) => {
                self.live_channels.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn create_decoder(
        &self,
        config: DecChannelConfig,
        callbacks: DecodeCallbacks,
    ) -> Result<Box<dyn DecodeChannel>, HwError> {
        let (index, log) = self.reserve_channel()?;
        debug!("Creating decoder channel {}: {:?}", index, config);
        let latency = self.config.lock().unwrap().latency;
        match DummyDecodeChannel::new(
            index,
            config,
            callbacks,
            log,
            latency,
            Arc::clone(&self.live_channels),
        ) {
            Ok(channel) => Ok(Box::new(channel)),
            Err(e) => {
                self.live_channels.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}
