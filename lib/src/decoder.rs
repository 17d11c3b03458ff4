//! Decoder module.
//!
//! `DecModule` feeds client bitstream buffers to a decoding channel and hands
//! decoded pictures back to the client. Output buffers are either decoded
//! into directly, or, when copy on display is enabled, decoded into internal
//! buffers and copied into the client buffer when the picture is displayed.
//!
//! The association between a client output buffer and the frame buffer the
//! channel decodes into lives as long as the module runs, since the channel
//! may keep referencing a displayed picture: giving the same handle to `fill`
//! again reuses the same frame buffer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, trace, warn};

use crate::copier::{BufferCopier, CopyJob};
use crate::device::{
    DecChannelConfig, DecodeCallbacks, DecodeChannel, Device, SeiMessage, StreamInfo,
};
use crate::error::{check_hw_error, ErrorCode, HwError};
use crate::memory::{
    AllocError, BufferFlags, BufferHandle, HandleType, HwBuffer, PictureMeta, SourceMeta,
};
use crate::module::{Callbacks, Dynamic, DynamicIndex, Event, Module, ModuleError, ModuleState};
use crate::pool::BufferPool;
use crate::settings::{DecSettings, MediaSettings, Property, PropertyValue, SettingsResult};
use crate::sync::{BufferDescriptor, DecSyncChannel, SyncError};

struct DecInner {
    device: Arc<dyn Device>,
    settings: Mutex<DecSettings>,
    callbacks: Mutex<Option<Arc<dyn Callbacks>>>,
    state: Mutex<ModuleState>,
    channel: Mutex<Option<Arc<dyn DecodeChannel>>>,

    inputs: BufferPool,
    outputs: BufferPool,
    /// End of stream buffer given by the client, returned once the channel
    /// is drained.
    eos_input: Mutex<Option<Arc<BufferHandle>>>,
    /// Whether the stream properties were latched into the settings.
    latched: AtomicBool,
    copy_on_display: AtomicBool,
    /// Picture being delivered through `filled`.
    display_info: Mutex<Option<PictureMeta>>,
    copier: BufferCopier,
    sync: Mutex<Option<Arc<DecSyncChannel>>>,
}

impl DecInner {
    fn client(&self) -> Option<Arc<dyn Callbacks>> {
        self.callbacks.lock().unwrap().clone()
    }

    fn state(&self) -> ModuleState {
        *self.state.lock().unwrap()
    }

    fn running_channel(&self) -> Result<Arc<dyn DecodeChannel>, ModuleError> {
        let state = self.state();
        if state != ModuleState::Running {
            return Err(ModuleError::Undefined(state));
        }
        self.channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(ModuleError::Undefined(state))
    }

    fn on_resolution_found(&self, info: &StreamInfo) -> anyhow::Result<()> {
        if self.latched.swap(true, Ordering::SeqCst) {
            warn!(
                "Decoder: stream properties changed to {} and ignored",
                info.resolution
            );
            return Ok(());
        }

        self.settings.lock().unwrap().latch_stream(
            info.resolution,
            info.format,
            info.min_buffers,
            info.crop,
        );
        info!("Decoder: stream is {} {}", info.resolution, info.format);
        if let Some(client) = self.client() {
            client.event(Event::ResolutionDetected(*info));
        }
        Ok(())
    }

    fn on_end_decoding(&self, frame: Option<Arc<HwBuffer>>, bitstream: &HwBuffer, error: Option<HwError>) {
        let Some(client) = self.client() else {
            return;
        };
        if let Some(code) = check_hw_error("Decoder", error) {
            client.event(Event::Error(code));
            return;
        }
        let Some(frame) = frame else {
            return;
        };
        match (self.inputs.handle_of(bitstream), self.outputs.handle_of(&frame)) {
            (Some(input), Some(output)) => client.associate(input, output),
            _ => warn!("Decoder: picture decoded from or into an unknown buffer"),
        }
    }

    fn on_display(self: Arc<Self>, frame: Option<Arc<HwBuffer>>, picture: Option<PictureMeta>) {
        let Some(client) = self.client() else {
            return;
        };
        match (frame, picture) {
            (None, _) => {
                // Pictures being copied are delivered before the end of stream.
                self.copier.flush();
                debug!("Decoder: end of stream");
                client.filled(None, 0, 0);
                let eos = self.eos_input.lock().unwrap().take();
                if let Some(eos) = eos {
                    client.emptied(eos);
                }
            }
            (Some(frame), None) => match self.outputs.pop_by_buffer(&frame) {
                Some(handle) => client.release(false, handle),
                None => warn!("Decoder: unknown frame buffer {} returned", frame.id()),
            },
            (Some(frame), Some(picture)) => self.display(client, frame, picture),
        }
    }

    fn display(self: Arc<Self>, client: Arc<dyn Callbacks>, frame: Arc<HwBuffer>, picture: PictureMeta) {
        let Some(handle) = self.outputs.handle_of(&frame) else {
            warn!("Decoder: unknown frame buffer {} displayed", frame.id());
            return;
        };
        let payload = frame.size().min(handle.size());
        handle.set_offset(0);
        handle.set_payload(payload);
        handle.set_flags(BufferFlags::END_OF_FRAME);
        trace!("Decoder: display {:?} in handle {}", picture, handle.id());

        if !self.copy_on_display.load(Ordering::SeqCst) {
            self.deliver(&*client, handle, picture, payload);
            return;
        }

        let source = match frame.mapping() {
            Ok(m) => m,
            Err(e) => {
                error!("Decoder: cannot map frame buffer: {}", e);
                client.event(Event::Error(ErrorCode::Undefined));
                self.deliver(&*client, handle, picture, 0);
                return;
            }
        };
        let destination = match handle.mapping() {
            Ok(m) => m,
            Err(e) => {
                error!("Decoder: cannot map handle {}: {}", handle.id(), e);
                client.event(Event::Error(ErrorCode::Undefined));
                self.deliver(&*client, handle, picture, 0);
                return;
            }
        };

        let inner = Arc::downgrade(&self);
        let copied = Arc::clone(&handle);
        let job = CopyJob {
            source,
            source_offset: 0,
            destination,
            destination_offset: 0,
            len: payload,
            on_done: Box::new(move |res| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let payload = match res {
                    Ok(()) => payload,
                    Err(_) => {
                        client.event(Event::Error(ErrorCode::Undefined));
                        0
                    }
                };
                inner.deliver(&*client, copied, picture, payload);
            }),
        };
        if let Err(e) = self.copier.copy(job) {
            error!("Decoder: cannot queue copy: {}", e);
        }
    }

    fn deliver(&self, client: &dyn Callbacks, handle: Arc<BufferHandle>, picture: PictureMeta, payload: usize) {
        handle.set_payload(payload);
        *self.display_info.lock().unwrap() = Some(picture);
        client.filled(Some(handle), 0, payload);
        *self.display_info.lock().unwrap() = None;
    }

    fn on_input_released(&self, bitstream: Arc<HwBuffer>) {
        match self.inputs.pop_by_buffer(&bitstream) {
            Some(handle) => {
                if let Some(client) = self.client() {
                    client.emptied(handle);
                }
            }
            None => warn!("Decoder: unknown bitstream buffer {} released", bitstream.id()),
        }
    }

    fn on_parsed_sei(&self, sei: SeiMessage) {
        trace!("Decoder: SEI message of type {}", sei.payload_type);
        if let Some(client) = self.client() {
            client.event(Event::SeiParsed(sei));
        }
    }

    /// Tracks a frame buffer on the sync channel, if there is one.
    fn sync_frame(&self, frame: &HwBuffer) {
        let Some(sync) = self.sync.lock().unwrap().clone() else {
            return;
        };
        let Some(source) = frame.meta().source else {
            return;
        };
        match BufferDescriptor::for_picture(frame, &source).and_then(|d| sync.add_buffer(d)) {
            Ok(()) => (),
            Err(SyncError::NoFreeSlot(channel)) => {
                warn!("Decoder: sync channel {} is full, frame not tracked", channel)
            }
            Err(e) => debug!("Decoder: frame {} not tracked: {}", frame.id(), e),
        }
    }
}

fn decode_callbacks(inner: &Arc<DecInner>) -> DecodeCallbacks {
    let resolution_found = Arc::downgrade(inner);
    let end_decoding = Arc::downgrade(inner);
    let display = Arc::downgrade(inner);
    let input_released = Arc::downgrade(inner);
    let parsed_sei: Weak<DecInner> = Arc::downgrade(inner);

    DecodeCallbacks {
        resolution_found: Box::new(move |info: &StreamInfo| match resolution_found.upgrade() {
            Some(inner) => inner.on_resolution_found(info),
            None => Ok(()),
        }),
        end_decoding: Box::new(move |frame, bitstream: &Arc<HwBuffer>, error| {
            if let Some(inner) = end_decoding.upgrade() {
                inner.on_end_decoding(frame, bitstream, error);
            }
        }),
        display: Box::new(move |frame, picture| {
            if let Some(inner) = display.upgrade() {
                inner.on_display(frame, picture);
            }
        }),
        input_released: Box::new(move |bitstream| {
            if let Some(inner) = input_released.upgrade() {
                inner.on_input_released(bitstream);
            }
        }),
        parsed_sei: Box::new(move |sei| {
            if let Some(inner) = parsed_sei.upgrade() {
                inner.on_parsed_sei(sei);
            }
        }),
    }
}

pub struct DecModule {
    inner: Arc<DecInner>,
}

impl DecModule {
    pub fn new(device: Arc<dyn Device>, settings: DecSettings) -> Result<Self, ModuleError> {
        let copier = BufferCopier::new("decoder").map_err(AllocError::Io)?;
        Ok(DecModule {
            inner: Arc::new(DecInner {
                device,
                settings: Mutex::new(settings),
                callbacks: Default::default(),
                state: Default::default(),
                channel: Default::default(),
                inputs: BufferPool::new("decoder inputs"),
                outputs: BufferPool::new("decoder outputs"),
                eos_input: Default::default(),
                latched: AtomicBool::new(false),
                copy_on_display: AtomicBool::new(false),
                display_info: Default::default(),
                copier,
                sync: Default::default(),
            }),
        })
    }

    /// Attaches a sync channel. Frame buffers are tracked by it as they are
    /// given to the decoder, and sync errors are reported as
    /// `Event::SyncError`.
    pub fn set_sync_channel(&self, channel: Option<DecSyncChannel>) -> Result<(), ModuleError> {
        let state = self.inner.state();
        if state == ModuleState::Running {
            return Err(ModuleError::Undefined(state));
        }
        let channel = channel.map(Arc::new);
        if let Some(channel) = &channel {
            let inner = Arc::downgrade(&self.inner);
            channel.set_listener(Some(Arc::new(move |errors| {
                if let Some(client) = inner.upgrade().and_then(|i| i.client()) {
                    client.event(Event::SyncError(errors));
                }
            })));
        }
        *self.inner.sync.lock().unwrap() = channel;
        Ok(())
    }

    pub fn state(&self) -> ModuleState {
        self.inner.state()
    }
}

impl Module for DecModule {
    fn set_callbacks(&self, callbacks: Arc<dyn Callbacks>) -> Result<(), ModuleError> {
        *self.inner.callbacks.lock().unwrap() = Some(callbacks);
        Ok(())
    }

    fn create(&self) -> Result<(), ModuleError> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != ModuleState::Uninitialized {
            error!("Decoder: create called in state {:?}", *state);
            return Err(ModuleError::Undefined(*state));
        }
        self.inner.device.init()?;
        *state = ModuleState::Created;
        Ok(())
    }

    fn destroy(&self) -> Result<(), ModuleError> {
        match self.inner.state() {
            ModuleState::Uninitialized => {
                error!("Decoder: destroy called before create");
                return Err(ModuleError::Undefined(ModuleState::Uninitialized));
            }
            ModuleState::Running => self.stop()?,
            _ => (),
        }
        self.inner.device.deinit();
        *self.inner.state.lock().unwrap() = ModuleState::Uninitialized;
        Ok(())
    }

    fn run(&self) -> Result<(), ModuleError> {
        let inner = &self.inner;
        let initial = inner.state();
        match initial {
            ModuleState::Created | ModuleState::Stopped => (),
            s => {
                error!("Decoder: run called in state {:?}", s);
                return Err(ModuleError::Undefined(s));
            }
        }
        if inner.client().is_none() {
            error!("Decoder: run called without callbacks");
            return Err(ModuleError::Undefined(initial));
        }

        let settings = inner.settings.lock().unwrap().clone();
        inner.latched.store(false, Ordering::SeqCst);
        inner
            .copy_on_display
            .store(settings.copy_on_display(), Ordering::SeqCst);

        let channel: Arc<dyn DecodeChannel> = Arc::from(
            inner
                .device
                .create_decoder(DecChannelConfig::from(&settings), decode_callbacks(inner))?,
        );
        let mut state = inner.state.lock().unwrap();
        if *state != initial {
            let current = *state;
            drop(state);
            error!("Decoder: state changed to {:?} during run", current);
            channel.destroy();
            return Err(ModuleError::Undefined(current));
        }
        *inner.channel.lock().unwrap() = Some(channel);

        if let Some(sync) = inner.sync.lock().unwrap().as_ref() {
            match sync.enable() {
                Ok(_) | Err(SyncError::AlreadyEnabled(_)) => (),
                Err(e) => warn!("Decoder: cannot enable sync channel: {}", e),
            }
        }
        *state = ModuleState::Running;
        debug!("Decoder running");
        Ok(())
    }

    fn stop(&self) -> Result<(), ModuleError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().unwrap();
            if *state != ModuleState::Running {
                debug!("Decoder: stop called in state {:?}", *state);
                return Ok(());
            }
            *state = ModuleState::Stopped;
        }

        // Pending buffers come back through the callbacks.
        let channel = inner.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.destroy();
        }
        inner.copier.flush();

        // Displayed pictures are owned by the client already.
        inner.outputs.clear();
        let client = inner.client();
        let mut returned = inner.inputs.drain();
        if !returned.is_empty() {
            warn!("Decoder: {} bitstream buffers not released by the channel", returned.len());
        }
        let eos = inner.eos_input.lock().unwrap().take();
        if let Some(client) = client {
            for (handle, _) in returned.drain(..) {
                client.emptied(handle);
            }
            if let Some(eos) = eos {
                client.emptied(eos);
            }
        }

        if let Some(sync) = inner.sync.lock().unwrap().as_ref() {
            if let Err(e) = sync.disable() {
                debug!("Decoder: sync channel: {}", e);
            }
        }
        debug!("Decoder stopped");
        Ok(())
    }

    fn empty(&self, handle: Arc<BufferHandle>) -> Result<(), ModuleError> {
        let inner = &self.inner;
        let channel = inner.running_channel()?;

        if handle.payload() == 0 {
            debug!("Decoder: end of stream requested");
            let previous = inner.eos_input.lock().unwrap().replace(Arc::clone(&handle));
            if let Some(previous) = previous {
                warn!("Decoder: end of stream requested twice");
                if let Some(client) = inner.client() {
                    client.emptied(previous);
                }
            }
            if let Err(e) = channel.flush() {
                inner.eos_input.lock().unwrap().take();
                return Err(e.into());
            }
            return Ok(());
        }

        let expected = inner.settings.lock().unwrap().handles.input;
        if handle.handle_type() != expected {
            return Err(ModuleError::WrongHandleType(handle.id()));
        }
        let buffer = HwBuffer::from_handle(&handle, &inner.device.allocator())?;
        inner.inputs.add(&handle, &buffer)?;
        trace!("Decoder: {} bytes in handle {}", handle.payload(), handle.id());
        if let Err(e) = channel.push_bitstream(buffer, handle.payload(), handle.flags()) {
            inner.inputs.pop(&handle);
            return Err(e.into());
        }
        Ok(())
    }

    fn fill(&self, handle: Arc<BufferHandle>) -> Result<(), ModuleError> {
        let inner = &self.inner;
        let channel = inner.running_channel()?;

        let frame = match inner.outputs.get(&handle) {
            Some(frame) => frame,
            None => {
                let settings = inner.settings.lock().unwrap().clone();
                let size = settings.buffer_sizes().output;
                let allocator = inner.device.allocator();
                let copy = inner.copy_on_display.load(Ordering::SeqCst);
                let expected = if copy {
                    HandleType::Memory
                } else {
                    settings.handles.output
                };
                if handle.handle_type() != expected {
                    return Err(ModuleError::WrongHandleType(handle.id()));
                }
                // Pictures are copied whole on display.
                if handle.size() < size {
                    return Err(ModuleError::BufferTooSmall(handle.id(), size));
                }
                let frame = if copy {
                    HwBuffer::allocate(&allocator, size)?
                } else {
                    HwBuffer::from_handle(&handle, &allocator)?
                };
                frame.meta().source = Some(SourceMeta {
                    resolution: settings.resolution,
                    format: settings.format,
                    stride: settings.stride(),
                });
                inner.outputs.add(&handle, &frame)?;
                frame
            }
        };

        inner.sync_frame(&frame);
        if let Err(e) = channel.put_display_picture(frame) {
            inner.outputs.pop(&handle);
            return Err(e.into());
        }
        Ok(())
    }

    fn set_dynamic(&self, value: Dynamic) -> Result<(), ModuleError> {
        Err(ModuleError::NotSupported(value.index()))
    }

    fn get_dynamic(&self, index: DynamicIndex) -> Result<Dynamic, ModuleError> {
        match index {
            DynamicIndex::PictureInfo => Ok(Dynamic::PictureInfo(
                *self.inner.display_info.lock().unwrap(),
            )),
            index => Err(ModuleError::NotSupported(index)),
        }
    }

    fn get(&self, property: Property) -> SettingsResult<PropertyValue> {
        self.inner.settings.lock().unwrap().get(property)
    }

    fn set(&self, value: PropertyValue) -> SettingsResult<()> {
        self.inner.settings.lock().unwrap().set(value)
    }
}

impl Drop for DecModule {
    fn drop(&mut self) {
        if self.inner.state() == ModuleState::Running {
            if let Err(e) = self.stop() {
                error!("Decoder: cannot stop on drop: {}", e);
            }
        }
    }
}
