//! Encoder module.
//!
//! `EncModule` feeds client source pictures through one or two encoding
//! passes and hands the encoded bitstream back to the client.
//!
//! With look-ahead or two-pass encoding enabled, a first pass analyzes every
//! frame. Analyzed frames wait in a FIFO until the look-ahead window is full
//! (or the stream ends), then go to the final pass with hints computed by a
//! `TwoPassManager` from the statistics of the frames in the window:
//!
//! ```text
//! empty() -> [pass 0] -> FIFO (S frames) -> [pass 1] -> filled()
//!               ^                              ^
//!     internal stream buffers           client stream buffers (fill())
//! ```
//!
//! Every source handle comes back through `emptied` once the final pass is
//! done with it, or when the module is stopped.
mod lookahead;
mod pass;
mod roi;
mod stream;

pub use lookahead::{LookAheadManager, ManagerFactory, TwoPassManager};
pub use roi::{block_size, RoiError, RoiTable, MAX_QP_DELTA};

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, trace, warn};

use crate::device::{Device, DynamicCommand, EncodeCompletion};
use crate::error::{check_hw_error, ErrorCode};
use crate::memory::{
    AllocError, BufferFlags, BufferHandle, HwBuffer, LookAheadMeta, PictureMeta, Section,
    SourceMeta, StreamMeta,
};
use crate::module::{Callbacks, Dynamic, DynamicIndex, Event, Module, ModuleError, ModuleState};
use crate::pool::BufferPool;
use crate::settings::{EncSettings, MediaSettings, Property, PropertyValue, SettingsResult};
use crate::sync::{BufferDescriptor, EncSyncChannel, SyncError};
use crate::{PictureType, Resolution};

use pass::PassEncoder;
use stream::ConfigSlot;

struct EncInner {
    device: Arc<dyn Device>,
    settings: Mutex<EncSettings>,
    callbacks: Mutex<Option<Arc<dyn Callbacks>>>,
    state: Mutex<ModuleState>,
    /// Passes of the current run, the final pass last.
    passes: Mutex<Vec<Arc<PassEncoder>>>,

    sources: BufferPool,
    streams: BufferPool,
    eos_input: Mutex<Option<Arc<BufferHandle>>>,
    config_slot: ConfigSlot,
    roi: Mutex<RoiTable>,
    /// Picture being delivered through `filled`.
    picture_info: Mutex<Option<PictureMeta>>,
    last_resolution: Mutex<Option<Resolution>>,
    manager_factory: Mutex<Option<ManagerFactory>>,
    sync: Mutex<Option<Arc<EncSyncChannel>>>,
}

impl EncInner {
    fn client(&self) -> Option<Arc<dyn Callbacks>> {
        self.callbacks.lock().unwrap().clone()
    }

    fn state(&self) -> ModuleState {
        *self.state.lock().unwrap()
    }

    fn report(&self, event: Event) {
        if let Some(client) = self.client() {
            client.event(event);
        }
    }

    fn running_passes(&self) -> Result<Vec<Arc<PassEncoder>>, ModuleError> {
        let state = self.state();
        let passes = self.passes.lock().unwrap().clone();
        if state != ModuleState::Running || passes.is_empty() {
            return Err(ModuleError::Undefined(state));
        }
        Ok(passes)
    }

    fn new_manager(&self) -> Box<dyn TwoPassManager> {
        match self.manager_factory.lock().unwrap().as_ref() {
            Some(factory) => factory(),
            None => Box::new(LookAheadManager::new()),
        }
    }

    fn create_passes(self: &Arc<Self>, settings: &EncSettings) -> Result<Vec<Arc<PassEncoder>>, ModuleError> {
        let mut passes = Vec::with_capacity(settings.passes());
        for index in 0..settings.passes() {
            match PassEncoder::new(index, settings, &self.device, Arc::downgrade(self)) {
                Ok(pass) => passes.push(pass),
                Err(e) => {
                    error!("Encoder: cannot create pass {}: {}", index, e);
                    for pass in &passes {
                        pass.destroy_channel();
                    }
                    return Err(e);
                }
            }
        }

        let window = settings.lookahead_window() as usize;
        for pair in passes.windows(2) {
            if let Err(e) = pair[0].start_worker(Arc::clone(&pair[1]), window, self.new_manager()) {
                for pass in &passes {
                    pass.destroy_channel();
                    pass.stop_worker();
                }
                return Err(e);
            }
        }
        Ok(passes)
    }

    /// Gives a source buffer back to the client.
    fn return_source(&self, source: &HwBuffer) {
        match self.sources.pop_by_buffer(source) {
            Some(handle) => {
                if let Some(client) = self.client() {
                    client.emptied(handle);
                }
            }
            None => warn!("Encoder: unknown source buffer {} returned", source.id()),
        }
    }

    fn end_encoding(&self, completion: EncodeCompletion) {
        let EncodeCompletion {
            stream,
            source,
            error,
            ..
        } = completion;
        let Some(client) = self.client() else {
            return;
        };
        if let Some(code) = check_hw_error("Encoder", error) {
            client.event(Event::Error(code));
        }

        match (stream, source) {
            (Some(stream), Some(source)) => self.encoded(&*client, &stream, &source),
            (None, Some(source)) => self.return_source(&source),
            (Some(stream), None) => match self.streams.pop_by_buffer(&stream) {
                Some(handle) => client.release(false, handle),
                None => warn!("Encoder: unknown stream buffer {} returned", stream.id()),
            },
            (None, None) => {
                debug!("Encoder: end of stream");
                let eos = self.eos_input.lock().unwrap().take();
                if let Some(eos) = eos {
                    client.emptied(eos);
                }
                client.filled(None, 0, 0);
            }
        }
    }

    /// Delivers a section of an encoded frame.
    fn encoded(&self, client: &dyn Callbacks, stream: &HwBuffer, source: &HwBuffer) {
        let Some(handle) = self.streams.pop_by_buffer(stream) else {
            warn!("Encoder: frame encoded in unknown stream buffer {}", stream.id());
            return;
        };
        let (meta, picture) = {
            let meta = stream.meta();
            (meta.stream.clone().unwrap_or_default(), meta.picture)
        };
        if let Some(picture) = picture {
            self.check_resolution(client, picture.resolution);
        }

        let separate =
            meta.has_config() && self.settings.lock().unwrap().separate_configuration;
        let config = if separate {
            self.config_slot.take()
        } else {
            None
        };
        let separated = config.is_some();
        let result = match config {
            Some(config) => self.deliver_configuration(client, stream, &handle, config, &meta, picture),
            None => copy_sections(stream, &meta.sections, &handle),
        };
        let payload = result.unwrap_or_else(|e| {
            error!("Encoder: cannot copy stream of frame {}: {}", source.id(), e);
            client.event(Event::Error(ErrorCode::Undefined));
            0
        });

        let mut flags = BufferFlags::empty();
        if meta.is_end_of_frame() {
            flags |= BufferFlags::END_OF_FRAME;
        }
        if matches!(
            picture.map(|p| p.picture_type),
            Some(PictureType::Idr | PictureType::I)
        ) {
            flags |= BufferFlags::SYNC_FRAME;
        }
        if meta.has_config() && !separated {
            flags |= BufferFlags::CONFIG;
        }
        handle.set_offset(0);
        handle.set_payload(payload);
        handle.set_flags(flags);

        match self.sources.handle_of(source) {
            Some(input) => client.associate(input, Arc::clone(&handle)),
            None => warn!("Encoder: frame encoded from unknown source {}", source.id()),
        }
        self.deliver(client, handle, payload, picture);
        if meta.is_end_of_frame() {
            self.return_source(source);
        }
    }

    fn deliver(
        &self,
        client: &dyn Callbacks,
        handle: Arc<BufferHandle>,
        payload: usize,
        picture: Option<PictureMeta>,
    ) {
        trace!("Encoder: {} bytes in handle {}", payload, handle.id());
        *self.picture_info.lock().unwrap() = picture;
        client.filled(Some(handle), 0, payload);
        *self.picture_info.lock().unwrap() = None;
    }

    /// Delivers the parameter sets of a frame in `config`, then the rest of
    /// the frame in `handle`. Returns the size of the latter.
    fn deliver_configuration(
        &self,
        client: &dyn Callbacks,
        stream: &HwBuffer,
        handle: &BufferHandle,
        config: Arc<BufferHandle>,
        meta: &StreamMeta,
        picture: Option<PictureMeta>,
    ) -> Result<usize, AllocError> {
        let (config_sections, data_sections) = stream::split_configuration(&meta.sections);
        let source = stream.mapping()?;
        let destination = handle.mapping()?;
        // Read before the data is moved to the start of the buffer.
        let parameter_sets = stream::gather(&source, &config_sections)?;

        let data = thread::scope(|s| {
            let data = s.spawn(|| stream::reconstruct(&source, &data_sections, &destination));

            let written = config
                .mapping()
                .and_then(|m| m.write_at(0, &parameter_sets))
                .map(|_| parameter_sets.len());
            let len = written.unwrap_or_else(|e| {
                error!("Encoder: cannot write parameter sets: {}", e);
                client.event(Event::Error(ErrorCode::Undefined));
                0
            });
            config.set_offset(0);
            config.set_payload(len);
            config.set_flags(BufferFlags::CONFIG);
            self.deliver(client, config, len, picture);

            data.join()
        });
        match data {
            Ok(len) => Ok(len?),
            Err(_) => {
                error!("Encoder: stream copy panicked");
                Err(AllocError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "stream copy panicked",
                )))
            }
        }
    }

    fn check_resolution(&self, client: &dyn Callbacks, resolution: Resolution) {
        let previous = self.last_resolution.lock().unwrap().replace(resolution);
        if previous.is_some_and(|p| p != resolution) {
            info!("Encoder: resolution changed to {}", resolution);
            client.event(Event::ResolutionChanged(resolution));
        }
    }

    /// Programs a source buffer into the sync channel, if there is one.
    fn sync_source(&self, source: &HwBuffer) {
        let Some(sync) = self.sync.lock().unwrap().clone() else {
            return;
        };
        let Some(meta) = source.meta().source else {
            return;
        };
        match BufferDescriptor::for_picture(source, &meta).and_then(|d| sync.add_buffer(d)) {
            Ok(()) => (),
            Err(SyncError::NoBusAddress(id)) => debug!("Encoder: source {} not tracked", id),
            Err(e) => warn!("Encoder: cannot track source {}: {}", source.id(), e),
        }
    }

    /// Applies a command to every pass, if running.
    fn apply_all(&self, command: DynamicCommand) -> Result<(), ModuleError> {
        let passes = self.passes.lock().unwrap().clone();
        for pass in passes {
            pass.apply(command.clone())?;
        }
        Ok(())
    }

    fn fill_roi_buffer(&self) -> Result<(), ModuleError> {
        let passes = self.running_passes()?;
        let table = self.roi.lock().unwrap().clone();
        let qp_table = HwBuffer::allocate(&self.device.allocator(), table.size())?;
        table.fill(&qp_table.mapping()?).map_err(AllocError::Io)?;
        passes[0].set_qp_table(qp_table);
        Ok(())
    }
}

fn copy_sections(
    stream: &HwBuffer,
    sections: &[Section],
    handle: &BufferHandle,
) -> Result<usize, AllocError> {
    let source = stream.mapping()?;
    let destination = handle.mapping()?;
    Ok(stream::reconstruct(&source, sections, &destination)?)
}

pub struct EncModule {
    inner: Arc<EncInner>,
}

impl EncModule {
    pub fn new(device: Arc<dyn Device>, settings: EncSettings) -> Self {
        let roi = RoiTable::new(settings.resolution, block_size(settings.codec));
        EncModule {
            inner: Arc::new(EncInner {
                device,
                settings: Mutex::new(settings),
                callbacks: Default::default(),
                state: Default::default(),
                passes: Default::default(),
                sources: BufferPool::new("encoder sources"),
                streams: BufferPool::new("encoder streams"),
                eos_input: Default::default(),
                config_slot: Default::default(),
                roi: Mutex::new(roi),
                picture_info: Default::default(),
                last_resolution: Default::default(),
                manager_factory: Default::default(),
                sync: Default::default(),
            }),
        }
    }

    /// Replaces the look-ahead manager used from the next `run`.
    pub fn set_two_pass_manager(&self, factory: ManagerFactory) {
        *self.inner.manager_factory.lock().unwrap() = Some(factory);
    }

    /// Attaches a sync channel. Source buffers are programmed into it as they
    /// are given to the encoder, and sync errors are reported as
    /// `Event::SyncError`.
    pub fn set_sync_channel(&self, channel: Option<EncSyncChannel>) -> Result<(), ModuleError> {
        let state = self.inner.state();
        if state == ModuleState::Running {
            return Err(ModuleError::Undefined(state));
        }
        let channel = channel.map(Arc::new);
        if let Some(channel) = &channel {
            let inner = Arc::downgrade(&self.inner);
            channel.set_listener(Some(Arc::new(move |errors| {
                if let Some(inner) = inner.upgrade() {
                    inner.report(Event::SyncError(errors));
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

impl Module for EncModule {
    fn set_callbacks(&self, callbacks: Arc<dyn Callbacks>) -> Result<(), ModuleError> {
        *self.inner.callbacks.lock().unwrap() = Some(callbacks);
        Ok(())
    }

    fn create(&self) -> Result<(), ModuleError> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != ModuleState::Uninitialized {
            error!("Encoder: create called in state {:?}", *state);
            return Err(ModuleError::Undefined(*state));
        }
        self.inner.device.init()?;
        *state = ModuleState::Created;
        Ok(())
    }

    fn destroy(&self) -> Result<(), ModuleError> {
        match self.inner.state() {
            ModuleState::Uninitialized => {
                error!("Encoder: destroy called before create");
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
                error!("Encoder: run called in state {:?}", s);
                return Err(ModuleError::Undefined(s));
            }
        }
        if inner.client().is_none() {
            error!("Encoder: run called without callbacks");
            return Err(ModuleError::Undefined(initial));
        }

        let settings = inner.settings.lock().unwrap().clone();
        *inner.last_resolution.lock().unwrap() = Some(settings.resolution);
        {
            let mut roi = inner.roi.lock().unwrap();
            if roi.resolution() != settings.resolution {
                *roi = RoiTable::new(settings.resolution, block_size(settings.codec));
            }
        }
        inner.config_slot.open();

        let passes = inner.create_passes(&settings)?;
        let mut state = inner.state.lock().unwrap();
        if *state != initial {
            let current = *state;
            drop(state);
            error!("Encoder: state changed to {:?} during run", current);
            for pass in &passes {
                pass.destroy_channel();
                pass.stop_worker();
            }
            return Err(ModuleError::Undefined(current));
        }
        info!(
            "Encoder: {} pass(es), look-ahead window of {}",
            passes.len(),
            settings.lookahead_window()
        );
        *inner.passes.lock().unwrap() = passes;

        if let Some(sync) = inner.sync.lock().unwrap().as_ref() {
            match sync.enable() {
                Ok(_) | Err(SyncError::AlreadyEnabled(_)) => (),
                Err(e) => warn!("Encoder: cannot enable sync channel: {}", e),
            }
        }
        *state = ModuleState::Running;
        debug!("Encoder running");
        Ok(())
    }

    fn stop(&self) -> Result<(), ModuleError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().unwrap();
            if *state != ModuleState::Running {
                debug!("Encoder: stop called in state {:?}", *state);
                return Ok(());
            }
            *state = ModuleState::Stopped;
        }

        // The final pass may be waiting for a parameter sets buffer.
        let held = inner.config_slot.close();
        let passes = std::mem::take(&mut *inner.passes.lock().unwrap());
        if let Some((last, analysis)) = passes.split_last() {
            // Frames come back through the completions, then from the FIFOs.
            for pass in analysis {
                pass.destroy_channel();
                for source in pass.stop_worker() {
                    inner.return_source(&source);
                }
            }
            last.destroy_channel();
        }

        let client = inner.client();
        let sources = inner.sources.drain();
        let streams = inner.streams.drain();
        if !sources.is_empty() || !streams.is_empty() {
            warn!(
                "Encoder: {} sources and {} streams not returned by the channels",
                sources.len(),
                streams.len()
            );
        }
        let eos = inner.eos_input.lock().unwrap().take();
        if let Some(client) = client {
            for (handle, _) in sources {
                client.emptied(handle);
            }
            for (handle, _) in streams {
                client.release(false, handle);
            }
            if let Some(eos) = eos {
                client.emptied(eos);
            }
            if let Some(held) = held {
                client.release(false, held);
            }
        }

        if let Some(sync) = inner.sync.lock().unwrap().as_ref() {
            if let Err(e) = sync.disable() {
                debug!("Encoder: sync channel: {}", e);
            }
        }
        debug!("Encoder stopped");
        Ok(())
    }

    fn empty(&self, handle: Arc<BufferHandle>) -> Result<(), ModuleError> {
        let inner = &self.inner;
        let passes = inner.running_passes()?;
        let first = &passes[0];

        if handle.payload() == 0 {
            debug!("Encoder: end of stream requested");
            let previous = inner.eos_input.lock().unwrap().replace(Arc::clone(&handle));
            if let Some(previous) = previous {
                warn!("Encoder: end of stream requested twice");
                if let Some(client) = inner.client() {
                    client.emptied(previous);
                }
            }
            if let Err(e) = first.submit(None, None) {
                inner.eos_input.lock().unwrap().take();
                return Err(e.into());
            }
            return Ok(());
        }

        let settings = inner.settings.lock().unwrap().clone();
        if handle.handle_type() != settings.handles.input {
            return Err(ModuleError::WrongHandleType(handle.id()));
        }
        let size = settings.buffer_sizes().input;
        if handle.size() < size {
            return Err(ModuleError::BufferTooSmall(handle.id(), size));
        }

        let source = HwBuffer::from_handle(&handle, &inner.device.allocator())?;
        {
            let mut meta = source.meta();
            meta.source = Some(SourceMeta {
                resolution: settings.resolution,
                format: settings.format,
                stride: settings.stride(),
            });
            if passes.len() > 1 {
                // Filled in by the analysis pass.
                meta.lookahead = Some(LookAheadMeta::default());
            }
        }
        inner.sources.add(&handle, &source)?;
        inner.sync_source(&source);
        trace!("Encoder: source handle {} submitted", handle.id());
        if let Err(e) = first.submit(Some(source), None) {
            inner.sources.pop(&handle);
            return Err(e.into());
        }
        Ok(())
    }

    fn fill(&self, handle: Arc<BufferHandle>) -> Result<(), ModuleError> {
        let inner = &self.inner;
        let passes = inner.running_passes()?;
        let Some(last) = passes.last() else {
            return Err(ModuleError::Undefined(inner.state()));
        };

        let settings = inner.settings.lock().unwrap().clone();
        if handle.handle_type() != settings.handles.output {
            return Err(ModuleError::WrongHandleType(handle.id()));
        }
        let size = settings.buffer_sizes().output;
        if handle.size() < size {
            return Err(ModuleError::BufferTooSmall(handle.id(), size));
        }
        let handle = if settings.separate_configuration {
            match inner.config_slot.offer(handle) {
                Ok(()) => return Ok(()),
                Err(handle) => handle,
            }
        } else {
            handle
        };

        let stream = HwBuffer::from_handle(&handle, &inner.device.allocator())?;
        inner.streams.add(&handle, &stream)?;
        if let Err(e) = last.put_stream_buffer(stream) {
            inner.streams.pop(&handle);
            return Err(e.into());
        }
        Ok(())
    }

    fn set_dynamic(&self, value: Dynamic) -> Result<(), ModuleError> {
        let inner = &self.inner;
        let index = value.index();
        debug!("Encoder: set {:?}", index);
        match value {
            Dynamic::Bitrate(bitrate) => {
                inner
                    .settings
                    .lock()
                    .unwrap()
                    .set(PropertyValue::Bitrate(bitrate))?;
                inner.apply_all(DynamicCommand::Bitrate(bitrate))
            }
            Dynamic::Gop(gop) => {
                inner.settings.lock().unwrap().set(PropertyValue::Gop(gop))?;
                inner.apply_all(DynamicCommand::Gop(gop))
            }
            Dynamic::Clock(clock) => {
                inner.settings.lock().unwrap().set(PropertyValue::Clock(clock))?;
                inner.apply_all(DynamicCommand::Clock(clock))
            }
            Dynamic::Resolution(resolution) => {
                let codec = {
                    let mut settings = inner.settings.lock().unwrap();
                    settings.set(PropertyValue::Resolution(resolution))?;
                    settings.codec
                };
                *inner.roi.lock().unwrap() = RoiTable::new(resolution, block_size(codec));
                inner.apply_all(DynamicCommand::Resolution(resolution))
            }
            Dynamic::LoopFilterBeta(beta) => {
                {
                    let mut settings = inner.settings.lock().unwrap();
                    let mut filter = settings.loop_filter;
                    filter.beta_offset = beta;
                    settings.set(PropertyValue::LoopFilter(filter))?;
                }
                inner.apply_all(DynamicCommand::LoopFilterBeta(beta))
            }
            Dynamic::LoopFilterTc(tc) => {
                {
                    let mut settings = inner.settings.lock().unwrap();
                    let mut filter = settings.loop_filter;
                    filter.tc_offset = tc;
                    settings.set(PropertyValue::LoopFilter(filter))?;
                }
                inner.apply_all(DynamicCommand::LoopFilterTc(tc))
            }
            Dynamic::InsertIdr => {
                for pass in inner.running_passes()? {
                    pass.apply(DynamicCommand::InsertIdr)?;
                }
                Ok(())
            }
            // SEI messages only make sense in the final bitstream.
            Dynamic::InsertSei(sei) => {
                let passes = inner.running_passes()?;
                match passes.last() {
                    Some(last) => Ok(last.apply(DynamicCommand::InsertSei(sei))?),
                    None => Err(ModuleError::Undefined(inner.state())),
                }
            }
            Dynamic::HdrMetadata(hdr) => {
                let passes = inner.running_passes()?;
                match passes.last() {
                    Some(last) => Ok(last.apply(DynamicCommand::HdrMetadata(hdr))?),
                    None => Err(ModuleError::Undefined(inner.state())),
                }
            }
            Dynamic::AddRoi(roi) => Ok(inner.roi.lock().unwrap().add(roi)?),
            Dynamic::ClearRoi => {
                inner.roi.lock().unwrap().clear();
                Ok(())
            }
            Dynamic::FillRoiBuffer => inner.fill_roi_buffer(),
            Dynamic::LoopFilter(_) | Dynamic::PictureInfo(_) => Err(ModuleError::NotSupported(index)),
        }
    }

    fn get_dynamic(&self, index: DynamicIndex) -> Result<Dynamic, ModuleError> {
        let settings = self.inner.settings.lock().unwrap().clone();
        Ok(match index {
            DynamicIndex::Bitrate => Dynamic::Bitrate(settings.bitrate),
            DynamicIndex::Gop => Dynamic::Gop(settings.gop),
            DynamicIndex::Clock => Dynamic::Clock(settings.clock),
            DynamicIndex::Resolution => Dynamic::Resolution(settings.resolution),
            DynamicIndex::LoopFilter => Dynamic::LoopFilter(settings.loop_filter),
            DynamicIndex::LoopFilterBeta => Dynamic::LoopFilterBeta(settings.loop_filter.beta_offset),
            DynamicIndex::LoopFilterTc => Dynamic::LoopFilterTc(settings.loop_filter.tc_offset),
            DynamicIndex::PictureInfo => {
                Dynamic::PictureInfo(*self.inner.picture_info.lock().unwrap())
            }
            index => return Err(ModuleError::NotSupported(index)),
        })
    }

    fn get(&self, property: Property) -> SettingsResult<PropertyValue> {
        self.inner.settings.lock().unwrap().get(property)
    }

    fn set(&self, value: PropertyValue) -> SettingsResult<()> {
        self.inner.settings.lock().unwrap().set(value)
    }
}

impl Drop for EncModule {
    fn drop(&mut self) {
        if self.inner.state() == ModuleState::Running {
            if let Err(e) = self.stop() {
                error!("Encoder: cannot stop on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::device::dummy::{DummyConfig, DummyDevice};
    use crate::error::HwError;
    use crate::memory::tests::fake_dmabuf;
    use crate::memory::{HandleType, PassHints};
    use crate::module::tests::{HookedDevice, Received, Recorder};
    use crate::module::Roi;
    use crate::settings::{Bitrate, BufferHandleTypes, BufferSizes, Gop, SettingsError};
    use crate::sync::dummy::DummySyncDriver;
    use crate::sync::SyncIp;
    use crate::Rect;

    const RESOLUTION: Resolution = Resolution::new(64, 64);

    fn settings(lookahead: u32) -> EncSettings {
        let mut settings = EncSettings::default();
        settings
            .set(PropertyValue::Resolution(RESOLUTION))
            .unwrap();
        settings.set(PropertyValue::LookAhead(lookahead)).unwrap();
        settings
    }

    fn running(device: &Arc<DummyDevice>, settings: EncSettings) -> (EncModule, Arc<Recorder>) {
        let module = EncModule::new(device.clone(), settings);
        let recorder = Arc::new(Recorder::default());
        module.set_callbacks(recorder.clone()).unwrap();
        module.create().unwrap();
        module.run().unwrap();
        (module, recorder)
    }

    fn sizes(module: &EncModule) -> BufferSizes {
        match module.get(Property::BufferSizes).unwrap() {
            PropertyValue::BufferSizes(sizes) => sizes,
            _ => unreachable!(),
        }
    }

    /// A picture whose first bytes are all `value`.
    fn picture(size: usize, value: u8) -> Arc<BufferHandle> {
        let handle = BufferHandle::alloc(size);
        handle.mapping().unwrap().write_at(0, &[value; 16]).unwrap();
        handle.set_payload(size);
        handle
    }

    fn outputs(module: &EncModule, count: usize) -> Vec<Arc<BufferHandle>> {
        let size = sizes(module).output;
        let outputs: Vec<_> = (0..count).map(|_| BufferHandle::alloc(size)).collect();
        for output in &outputs {
            module.fill(output.clone()).unwrap();
        }
        outputs
    }

    fn wait_until(f: impl Fn() -> bool) {
        let start = Instant::now();
        while !f() {
            assert!(start.elapsed() < Duration::from_secs(5), "timeout");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_for(recorder: &Recorder, f: impl Fn(&[Received]) -> bool) {
        let start = Instant::now();
        while !f(&recorder.received()) {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "timeout, received {:?}",
                recorder.received()
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn is_eos(r: &[Received]) -> bool {
        r.contains(&Received::Filled(None, 0, 0))
    }

    #[test]
    fn single_pass_returns_every_buffer() {
        let device = Arc::new(DummyDevice::default());
        let (module, recorder) = running(&device, settings(0));
        let outputs = outputs(&module, 4);
        let input_size = sizes(&module).input;
        let sources: Vec<_> = (1..=3).map(|i| picture(input_size, i)).collect();
        for source in &sources {
            module.empty(source.clone()).unwrap();
        }
        let eos = BufferHandle::alloc(16);
        module.empty(eos.clone()).unwrap();
        wait_for(&recorder, is_eos);

        let received = recorder.received();
        for (source, output) in sources.iter().zip(&outputs) {
            assert!(received.contains(&Received::Associate(source.id(), output.id())));
            assert_eq!(recorder.count(|r| *r == Received::Emptied(source.id())), 1);
        }
        assert_eq!(recorder.count(|r| *r == Received::Emptied(eos.id())), 1);
        assert_eq!(recorder.count(|r| matches!(r, Received::Filled(..))), 4);
        assert_eq!(
            received
                .iter()
                .rposition(|r| matches!(r, Received::Filled(..))),
            received.iter().position(|r| *r == Received::Filled(None, 0, 0))
        );

        // Parameter sets come first, in the same buffer as the first frame.
        let payloads = recorder.payloads.lock().unwrap().clone();
        assert!(payloads[0].starts_with(b"VCUP"));
        assert!(payloads[1].starts_with(b"VCUF"));
        assert_eq!(
            outputs[0].flags(),
            BufferFlags::CONFIG | BufferFlags::SYNC_FRAME | BufferFlags::END_OF_FRAME
        );
        assert_eq!(outputs[1].flags(), BufferFlags::END_OF_FRAME);

        module.stop().unwrap();
        assert_eq!(
            recorder.count(|r| matches!(r, Received::Release(..))),
            1
        );
        assert!(recorder
            .received()
            .contains(&Received::Release(false, outputs[3].id())));
        module.destroy().unwrap();
        assert_eq!(device.live_channels(), 0);
    }

    #[test]
    fn lookahead_forwards_frames_in_order() {
        let device = Arc::new(DummyDevice::default());
        let (module, recorder) = running(&device, settings(2));
        let analysis = device.channel_log(0).unwrap();
        let last = device.channel_log(1).unwrap();
        outputs(&module, 3);
        let input_size = sizes(&module).input;
        let sources: Vec<_> = (1..=3).map(|i| picture(input_size, i)).collect();

        module.empty(sources[0].clone()).unwrap();
        wait_until(|| analysis.completed() == 1);
        thread::sleep(Duration::from_millis(20));
        // The window is not full yet.
        assert!(last.submissions().is_empty());

        module.empty(sources[1].clone()).unwrap();
        wait_until(|| last.submissions().len() == 1);
        module.empty(sources[2].clone()).unwrap();
        wait_until(|| last.submissions().len() == 2);

        let eos = BufferHandle::alloc(16);
        module.empty(eos.clone()).unwrap();
        wait_for(&recorder, is_eos);

        let submitted = analysis.submissions();
        assert_eq!(submitted.len(), 4);
        assert_eq!(submitted[3], None);
        assert_eq!(last.submissions(), submitted);

        for source in &sources {
            assert_eq!(recorder.count(|r| *r == Received::Emptied(source.id())), 1);
        }
        assert_eq!(recorder.count(|r| *r == Received::Filled(None, 0, 0)), 1);
        assert_eq!(recorder.count(|r| *r == Received::Emptied(eos.id())), 1);
        assert_eq!(
            recorder.count(|r| matches!(r, Received::Filled(Some(_), _, _))),
            3
        );

        module.stop().unwrap();
        assert_eq!(device.dummy_allocator().live_allocations(), 0);
    }

    #[test]
    fn stop_returns_frames_waiting_in_lookahead() {
        let device = Arc::new(DummyDevice::default());
        let (module, recorder) = running(&device, settings(4));
        let analysis = device.channel_log(0).unwrap();
        let outputs = outputs(&module, 1);
        let input_size = sizes(&module).input;
        let sources: Vec<_> = (1..=2).map(|i| picture(input_size, i)).collect();
        for source in &sources {
            module.empty(source.clone()).unwrap();
        }
        wait_until(|| analysis.completed() == 2);
        assert!(device.dummy_allocator().live_allocations() > 0);

        module.stop().unwrap();
        for source in &sources {
            assert_eq!(recorder.count(|r| *r == Received::Emptied(source.id())), 1);
        }
        assert_eq!(
            recorder.count(|r| *r == Received::Release(false, outputs[0].id())),
            1
        );
        assert_eq!(recorder.count(|r| matches!(r, Received::Filled(..))), 0);
        assert_eq!(device.dummy_allocator().live_allocations(), 0);
        assert_eq!(device.live_channels(), 0);
    }

    #[test]
    fn separate_configuration_is_delivered_first() {
        let device = Arc::new(DummyDevice::default());
        let mut settings = settings(0);
        settings
            .set(PropertyValue::SeparateConfiguration(true))
            .unwrap();
        let (module, recorder) = running(&device, settings);
        // The first buffer is kept for parameter sets.
        let outputs = outputs(&module, 3);
        let source = picture(sizes(&module).input, 1);
        module.empty(source.clone()).unwrap();
        let eos = BufferHandle::alloc(16);
        module.empty(eos).unwrap();
        wait_for(&recorder, is_eos);

        let filled: Vec<_> = recorder
            .received()
            .into_iter()
            .filter_map(|r| match r {
                Received::Filled(Some(id), _, _) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(filled, vec![outputs[0].id(), outputs[1].id()]);
        let payloads = recorder.payloads.lock().unwrap().clone();
        assert!(payloads[0].starts_with(b"VCUP"));
        assert!(payloads[1].starts_with(b"VCUF"));
        assert_eq!(outputs[0].flags(), BufferFlags::CONFIG);
        assert!(!outputs[1].flags().contains(BufferFlags::CONFIG));
        assert!(recorder
            .received()
            .contains(&Received::Associate(source.id(), outputs[1].id())));

        module.stop().unwrap();
        assert_eq!(
            recorder.count(|r| *r == Received::Release(false, outputs[2].id())),
            1
        );
    }

    #[test]
    fn later_configurations_do_not_wait_for_a_buffer() {
        let device = Arc::new(DummyDevice::default());
        let mut settings = settings(0);
        settings
            .set(PropertyValue::SeparateConfiguration(true))
            .unwrap();
        settings
            .set(PropertyValue::Gop(Gop {
                idr_frequency: 2,
                ..Default::default()
            }))
            .unwrap();
        let (module, recorder) = running(&device, settings);
        let outputs = outputs(&module, 6);
        let input_size = sizes(&module).input;
        let sources: Vec<_> = (1..=5).map(|i| picture(input_size, i)).collect();

        module.empty(sources[0].clone()).unwrap();
        let first_data = outputs[1].id();
        wait_for(&recorder, |r| {
            r.iter()
                .any(|r| matches!(r, Received::Filled(Some(id), ..) if *id == first_data))
        });
        // Kept for the parameter sets of the next IDR picture.
        let extra = BufferHandle::alloc(sizes(&module).output);
        module.fill(extra.clone()).unwrap();

        for source in &sources[1..] {
            module.empty(source.clone()).unwrap();
        }
        module.empty(BufferHandle::alloc(16)).unwrap();
        wait_for(&recorder, is_eos);

        let filled: Vec<_> = recorder
            .received()
            .into_iter()
            .filter_map(|r| match r {
                Received::Filled(Some(id), _, _) => Some(id),
                _ => None,
            })
            .collect();
        let expected = [
            &outputs[0],
            &outputs[1],
            &outputs[2],
            &extra,
            &outputs[3],
            &outputs[4],
            &outputs[5],
        ];
        assert_eq!(filled, expected.iter().map(|h| h.id()).collect::<Vec<_>>());
        let payloads = recorder.payloads.lock().unwrap().clone();
        for (i, prefix) in [b"VCUP", b"VCUF", b"VCUF", b"VCUP", b"VCUF", b"VCUF", b"VCUP"]
            .iter()
            .enumerate()
        {
            assert!(payloads[i].starts_with(*prefix), "payload {}", i);
        }
        assert_eq!(extra.flags(), BufferFlags::CONFIG);
        // No buffer held for the last IDR picture: parameter sets stay inline.
        assert_eq!(
            outputs[5].flags(),
            BufferFlags::CONFIG | BufferFlags::SYNC_FRAME | BufferFlags::END_OF_FRAME
        );
        for source in &sources {
            assert_eq!(recorder.count(|r| *r == Received::Emptied(source.id())), 1);
        }

        module.stop().unwrap();
        assert_eq!(recorder.count(|r| matches!(r, Received::Release(..))), 0);
    }

    #[test]
    fn stop_releases_buffer_kept_for_configuration() {
        let device = Arc::new(DummyDevice::default());
        let mut settings = settings(0);
        settings
            .set(PropertyValue::SeparateConfiguration(true))
            .unwrap();
        let (module, recorder) = running(&device, settings);
        let outputs = outputs(&module, 1);
        module.stop().unwrap();
        assert_eq!(recorder.received(), vec![Received::Release(false, outputs[0].id())]);
    }

    #[test]
    fn qp_tables() {
        let device = Arc::new(DummyDevice::default());
        let (module, recorder) = running(&device, settings(0));
        outputs(&module, 2);

        module
            .set_dynamic(Dynamic::AddRoi(Roi {
                rect: Rect::new(0, 0, 32, 32),
                qp_delta: -4,
            }))
            .unwrap();
        assert!(matches!(
            module.set_dynamic(Dynamic::AddRoi(Roi {
                rect: Rect::new(48, 0, 32, 32),
                qp_delta: -4,
            })),
            Err(ModuleError::Roi(RoiError::OutOfPicture(_)))
        ));
        module.set_dynamic(Dynamic::FillRoiBuffer).unwrap();
        assert_eq!(device.dummy_allocator().live_allocations(), 1);
        // Only the last table is kept.
        module.set_dynamic(Dynamic::ClearRoi).unwrap();
        module.set_dynamic(Dynamic::FillRoiBuffer).unwrap();
        assert_eq!(device.dummy_allocator().live_allocations(), 1);

        module
            .empty(picture(sizes(&module).input, 1))
            .unwrap();
        module.empty(BufferHandle::alloc(16)).unwrap();
        wait_for(&recorder, is_eos);
        // Released with the frame.
        assert_eq!(device.dummy_allocator().live_allocations(), 0);
        module.stop().unwrap();
    }

    #[test]
    fn qp_table_goes_through_lookahead() {
        let device = Arc::new(DummyDevice::default());
        let (module, recorder) = running(&device, settings(2));
        outputs(&module, 2);
        let internal = device.dummy_allocator().live_allocations();

        module.set_dynamic(Dynamic::FillRoiBuffer).unwrap();
        assert_eq!(device.dummy_allocator().live_allocations(), internal + 1);
        module
            .empty(picture(sizes(&module).input, 1))
            .unwrap();
        module.empty(BufferHandle::alloc(16)).unwrap();
        wait_for(&recorder, is_eos);
        assert_eq!(device.dummy_allocator().live_allocations(), internal);

        module.stop().unwrap();
        assert_eq!(device.dummy_allocator().live_allocations(), 0);
    }

    #[test]
    fn errors_are_reported_and_encoding_continues() {
        let device = Arc::new(DummyDevice::new(DummyConfig {
            encode_errors: vec![(1, HwError::OutOfMemory), (2, HwError::StreamOverflow)],
            ..Default::default()
        }));
        let (module, recorder) = running(&device, settings(0));
        let outputs = outputs(&module, 3);
        let input_size = sizes(&module).input;
        let sources: Vec<_> = (1..=3).map(|i| picture(input_size, i)).collect();
        for source in &sources {
            module.empty(source.clone()).unwrap();
        }
        module.empty(BufferHandle::alloc(16)).unwrap();
        wait_for(&recorder, is_eos);

        // Warnings are only logged.
        assert_eq!(
            recorder.count(|r| matches!(r, Received::Event(Event::Error(_)))),
            1
        );
        assert!(recorder
            .received()
            .contains(&Received::Event(Event::Error(ErrorCode::OutOfMemory))));
        assert!(recorder
            .received()
            .contains(&Received::Filled(Some(outputs[1].id()), 0, 0)));
        for source in &sources {
            assert_eq!(recorder.count(|r| *r == Received::Emptied(source.id())), 1);
        }
        module.stop().unwrap();
    }

    #[test]
    fn dynamic_controls() {
        let device = Arc::new(DummyDevice::default());
        let module = EncModule::new(device.clone(), settings(0));
        module.set_callbacks(Arc::new(Recorder::default())).unwrap();
        module.create().unwrap();

        let bitrate = Bitrate {
            target: 1000,
            max: 2000,
            ..Default::default()
        };
        module.set_dynamic(Dynamic::Bitrate(bitrate)).unwrap();
        assert_eq!(
            module.get_dynamic(DynamicIndex::Bitrate).unwrap(),
            Dynamic::Bitrate(bitrate)
        );
        assert!(matches!(
            module.set_dynamic(Dynamic::InsertIdr),
            Err(ModuleError::Undefined(ModuleState::Created))
        ));

        assert!(matches!(
            module.set_dynamic(Dynamic::LoopFilterBeta(7)),
            Err(ModuleError::Settings(SettingsError::BadParameter(..)))
        ));
        module.set_dynamic(Dynamic::LoopFilterBeta(-2)).unwrap();
        module.set_dynamic(Dynamic::LoopFilterTc(3)).unwrap();
        match module.get_dynamic(DynamicIndex::LoopFilter).unwrap() {
            Dynamic::LoopFilter(filter) => {
                assert_eq!((filter.beta_offset, filter.tc_offset), (-2, 3))
            }
            other => panic!("unexpected value {:?}", other),
        }
        assert!(matches!(
            module.set_dynamic(Dynamic::PictureInfo(None)),
            Err(ModuleError::NotSupported(DynamicIndex::PictureInfo))
        ));
        assert!(matches!(
            module.get_dynamic(DynamicIndex::AddRoi),
            Err(ModuleError::NotSupported(DynamicIndex::AddRoi))
        ));

        module.run().unwrap();
        module.set_dynamic(Dynamic::InsertIdr).unwrap();
        module
            .set_dynamic(Dynamic::InsertSei(crate::device::SeiMessage {
                prefix: true,
                payload_type: 5,
                payload: vec![0; 16],
            }))
            .unwrap();
        module.set_dynamic(Dynamic::Bitrate(Bitrate::default())).unwrap();
        module.destroy().unwrap();
    }

    #[test]
    fn resolution_change_and_picture_info() {
        let device = Arc::new(DummyDevice::default());
        let module = Arc::new(EncModule::new(device.clone(), settings(0)));
        let recorder = Arc::new(Recorder::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let module = Arc::downgrade(&module);
            let seen = seen.clone();
            *recorder.on_filled.lock().unwrap() = Some(Box::new(move || {
                if let Some(module) = module.upgrade() {
                    seen.lock()
                        .unwrap()
                        .push(module.get_dynamic(DynamicIndex::PictureInfo).unwrap());
                }
            }));
        }
        module.set_callbacks(recorder.clone()).unwrap();
        module.create().unwrap();
        module.run().unwrap();
        outputs(&module, 2);

        let input_size = sizes(&module).input;
        module.empty(picture(input_size, 1)).unwrap();
        let smaller = Resolution::new(32, 32);
        module.set_dynamic(Dynamic::Resolution(smaller)).unwrap();
        module.empty(picture(input_size, 2)).unwrap();
        wait_until(|| seen.lock().unwrap().len() == 2);

        let seen = seen.lock().unwrap().clone();
        match &seen[..] {
            [Dynamic::PictureInfo(Some(first)), Dynamic::PictureInfo(Some(second))] => {
                assert_eq!(first.resolution, RESOLUTION);
                assert_eq!(first.picture_type, PictureType::Idr);
                assert_eq!(second.resolution, smaller);
                assert_eq!(second.picture_type, PictureType::Idr);
            }
            other => panic!("unexpected picture info {:?}", other),
        }
        assert_eq!(
            recorder.count(|r| matches!(r, Received::Event(Event::ResolutionChanged(_)))),
            1
        );
        assert!(recorder
            .received()
            .contains(&Received::Event(Event::ResolutionChanged(smaller))));
        assert_eq!(
            module.get_dynamic(DynamicIndex::PictureInfo).unwrap(),
            Dynamic::PictureInfo(None)
        );
        module.stop().unwrap();
    }

    struct RecordingManager {
        frames: Arc<Mutex<Vec<LookAheadMeta>>>,
        flushes: Arc<Mutex<usize>>,
    }

    impl TwoPassManager for RecordingManager {
        fn add_frame(&mut self, stats: &LookAheadMeta) {
            self.frames.lock().unwrap().push(*stats);
        }

        fn hints(&mut self, _window: &[LookAheadMeta]) -> PassHints {
            PassHints {
                scene_change: true,
                ..Default::default()
            }
        }

        fn flush(&mut self) {
            *self.flushes.lock().unwrap() += 1;
        }
    }

    #[test]
    fn custom_two_pass_manager() {
        let device = Arc::new(DummyDevice::default());
        let frames = Arc::new(Mutex::new(Vec::new()));
        let flushes = Arc::new(Mutex::new(0));
        let mut settings = settings(0);
        settings.set(PropertyValue::TwoPass(true)).unwrap();

        let module = EncModule::new(device.clone(), settings);
        {
            let frames = frames.clone();
            let flushes = flushes.clone();
            module.set_two_pass_manager(Box::new(move || -> Box<dyn TwoPassManager> {
                Box::new(RecordingManager {
                    frames: frames.clone(),
                    flushes: flushes.clone(),
                })
            }));
        }
        let recorder = Arc::new(Recorder::default());
        module.set_callbacks(recorder.clone()).unwrap();
        module.create().unwrap();
        module.run().unwrap();
        let outputs = outputs(&module, 2);

        let input_size = sizes(&module).input;
        for i in 1..=2 {
            module.empty(picture(input_size, i)).unwrap();
        }
        module.empty(BufferHandle::alloc(16)).unwrap();
        wait_for(&recorder, is_eos);

        let frames = frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.picture_size > 0));
        assert_eq!(frames[0].percent_intra, 100);
        assert_eq!(*flushes.lock().unwrap(), 1);
        // The scene change hint turns the second frame into an intra frame.
        assert!(outputs[1].flags().contains(BufferFlags::SYNC_FRAME));
        module.stop().unwrap();
    }

    #[test]
    fn sources_are_tracked_by_sync_channel() {
        let device = Arc::new(DummyDevice::default());
        let driver = Arc::new(DummySyncDriver::new(true, 1));
        let sync = Arc::new(SyncIp::new(driver.clone()).unwrap());
        let channel = EncSyncChannel::new(sync).unwrap();
        let id = channel.id();

        let mut settings = settings(0);
        settings
            .set(PropertyValue::BufferHandles(BufferHandleTypes {
                input: HandleType::DmaBuf,
                output: HandleType::Memory,
            }))
            .unwrap();
        let module = EncModule::new(device.clone(), settings);
        module.set_sync_channel(Some(channel)).unwrap();
        let recorder = Arc::new(Recorder::default());
        module.set_callbacks(recorder.clone()).unwrap();
        module.create().unwrap();
        module.run().unwrap();
        assert!(driver.is_enabled(id));
        assert!(matches!(
            module.set_sync_channel(None),
            Err(ModuleError::Undefined(ModuleState::Running))
        ));

        let size = sizes(&module).input;
        let source = BufferHandle::from_dmabuf(fake_dmabuf(size), size);
        source.set_payload(size);
        assert!(matches!(
            module.empty(picture(size, 1)),
            Err(ModuleError::WrongHandleType(_))
        ));
        module.empty(source.clone()).unwrap();
        assert_eq!(driver.programmed(id).len(), 1);

        driver.raise_errors(id, crate::sync::ChannelErrors::WATCHDOG);
        wait_for(&recorder, |r| {
            r.iter()
                .any(|r| matches!(r, Received::Event(Event::SyncError(_))))
        });
        module.stop().unwrap();
        assert!(!driver.is_enabled(id));
        assert_eq!(recorder.count(|r| *r == Received::Emptied(source.id())), 1);
    }

    #[test]
    fn lifecycle_errors() {
        let device = Arc::new(DummyDevice::default());
        let module = EncModule::new(device.clone(), settings(2));
        assert!(matches!(
            module.run(),
            Err(ModuleError::Undefined(ModuleState::Uninitialized))
        ));
        module.create().unwrap();
        assert!(module.run().is_err());
        module.set_callbacks(Arc::new(Recorder::default())).unwrap();

        device.set_create_error(Some(HwError::NoChannelAvailable));
        assert!(matches!(
            module.run(),
            Err(ModuleError::Hardware(ErrorCode::NoChannelAvailable))
        ));
        device.set_create_error(None);
        module.run().unwrap();
        assert_eq!(device.live_channels(), 2);

        let sizes = sizes(&module);
        assert!(matches!(
            module.empty(picture(16, 1)),
            Err(ModuleError::BufferTooSmall(..))
        ));
        assert!(matches!(
            module.fill(BufferHandle::alloc(16)),
            Err(ModuleError::BufferTooSmall(..))
        ));
        let source = picture(sizes.input, 1);
        module.empty(source.clone()).unwrap();
        assert!(matches!(
            module.empty(source),
            Err(ModuleError::Pool(_))
        ));

        module.destroy().unwrap();
        assert_eq!(device.live_channels(), 0);
        assert!(matches!(
            module.fill(BufferHandle::alloc(sizes.output)),
            Err(ModuleError::Undefined(ModuleState::Uninitialized))
        ));
    }

    #[test]
    fn state_is_unlocked_while_creating_channels() {
        let device = Arc::new(HookedDevice::new(Arc::new(DummyDevice::default())));
        let module = EncModule::new(device.clone(), settings(2));
        let creations = Arc::new(Mutex::new(Vec::new()));
        {
            let inner = Arc::downgrade(&module.inner);
            let creations = creations.clone();
            *device.on_create.lock().unwrap() = Some(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    creations.lock().unwrap().push(inner.state.try_lock().is_ok());
                }
            }));
        }
        module.set_callbacks(Arc::new(Recorder::default())).unwrap();
        module.create().unwrap();
        module.run().unwrap();
        assert_eq!(*creations.lock().unwrap(), vec![true, true]);
        assert_eq!(module.state(), ModuleState::Running);
        module.destroy().unwrap();
        assert_eq!(device.device.live_channels(), 0);
    }
}
