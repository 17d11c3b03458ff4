//! Contract between the encoder/decoder modules and their clients.
//!
//! Clients hand buffers to a module through `Module::empty` (input) and
//! `Module::fill` (output), and get them back through their `Callbacks`. Every
//! handle given to a module is returned exactly once, through `emptied`,
//! `filled` or `release`, including when the module is stopped with buffers
//! still in flight.
use std::sync::Arc;

use thiserror::Error;

use crate::device::{HdrMetadata, SeiMessage, StreamInfo};
use crate::encoder::RoiError;
use crate::error::{ErrorCode, HwError};
use crate::memory::{AllocError, BufferHandle, PictureMeta};
use crate::pool::PoolError;
use crate::settings::{
    Bitrate, Gop, LoopFilter, Property, PropertyValue, SettingsError, SettingsResult,
};
use crate::sync::{ChannelErrors, SyncError};
use crate::{Clock, Rect, Resolution};

/// Asynchronous notifications sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The decoder found the properties of the stream. Output buffers must
    /// match the new buffer requirements.
    ResolutionDetected(StreamInfo),
    /// The encoder produced a frame with different dimensions than the
    /// previous one.
    ResolutionChanged(Resolution),
    SeiParsed(SeiMessage),
    /// The sync IP reported errors on the channel attached to the module.
    SyncError(ChannelErrors),
    /// A frame could not be processed. The module keeps running.
    Error(ErrorCode),
}

/// Client side of a module. Methods are invoked from threads owned by the
/// codec SDK, not necessarily always the same one.
pub trait Callbacks: Send + Sync {
    /// The module is done with an input buffer.
    fn emptied(&self, handle: Arc<BufferHandle>);
    /// `output` was produced from `input`.
    fn associate(&self, input: Arc<BufferHandle>, output: Arc<BufferHandle>);
    /// An output buffer contains `payload` bytes starting at `offset`. `None`
    /// signals the end of the stream.
    fn filled(&self, handle: Option<Arc<BufferHandle>>, offset: usize, payload: usize);
    /// A buffer is given back without having been used.
    fn release(&self, is_input: bool, handle: Arc<BufferHandle>);
    fn event(&self, event: Event);
}

/// Lifecycle of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleState {
    #[default]
    Uninitialized,
    Created,
    Running,
    Stopped,
}

/// A region of the picture encoded with a different quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub rect: Rect,
    /// QP offset applied to the blocks covered by `rect`. Negative values
    /// increase the quality.
    pub qp_delta: i8,
}

/// Identifiers of the parameters that can be changed while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DynamicIndex {
    Bitrate,
    Gop,
    InsertIdr,
    AddRoi,
    ClearRoi,
    FillRoiBuffer,
    Clock,
    Resolution,
    InsertSei,
    HdrMetadata,
    LoopFilterBeta,
    LoopFilterTc,
    /// Read-only: the whole loop filter configuration.
    LoopFilter,
    /// Read-only: properties of the picture being delivered. Only valid
    /// while the `filled` callback for that picture runs.
    PictureInfo,
}

/// A parameter changed while running, with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dynamic {
    Bitrate(Bitrate),
    Gop(Gop),
    InsertIdr,
    AddRoi(Roi),
    ClearRoi,
    /// Builds a QP table from the current regions of interest, attached to
    /// the next frame submitted.
    FillRoiBuffer,
    Clock(Clock),
    Resolution(Resolution),
    InsertSei(SeiMessage),
    HdrMetadata(HdrMetadata),
    LoopFilterBeta(i8),
    LoopFilterTc(i8),
    LoopFilter(LoopFilter),
    PictureInfo(Option<PictureMeta>),
}

impl Dynamic {
    pub fn index(&self) -> DynamicIndex {
        match self {
            Dynamic::Bitrate(_) => DynamicIndex::Bitrate,
            Dynamic::Gop(_) => DynamicIndex::Gop,
            Dynamic::InsertIdr => DynamicIndex::InsertIdr,
            Dynamic::AddRoi(_) => DynamicIndex::AddRoi,
            Dynamic::ClearRoi => DynamicIndex::ClearRoi,
            Dynamic::FillRoiBuffer => DynamicIndex::FillRoiBuffer,
            Dynamic::Clock(_) => DynamicIndex::Clock,
            Dynamic::Resolution(_) => DynamicIndex::Resolution,
            Dynamic::InsertSei(_) => DynamicIndex::InsertSei,
            Dynamic::HdrMetadata(_) => DynamicIndex::HdrMetadata,
            Dynamic::LoopFilterBeta(_) => DynamicIndex::LoopFilterBeta,
            Dynamic::LoopFilterTc(_) => DynamicIndex::LoopFilterTc,
            Dynamic::LoopFilter(_) => DynamicIndex::LoopFilter,
            Dynamic::PictureInfo(_) => DynamicIndex::PictureInfo,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("hardware error: {0}")]
    Hardware(ErrorCode),
    #[error("cannot use buffer: {0}")]
    Buffer(#[from] AllocError),
    #[error("buffer {0} is too small ({1} bytes needed)")]
    BufferTooSmall(u64, usize),
    #[error("buffer {0} has the wrong handle type")]
    WrongHandleType(u64),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("sync channel error: {0}")]
    Sync(#[from] SyncError),
    #[error("invalid region of interest: {0}")]
    Roi(#[from] RoiError),
    #[error("dynamic parameter {0:?} not supported")]
    NotSupported(DynamicIndex),
    /// The operation is not valid in the current state of the module.
    #[error("operation invalid in state {0:?}")]
    Undefined(ModuleState),
}

impl From<HwError> for ModuleError {
    fn from(error: HwError) -> Self {
        ModuleError::Hardware(error.into())
    }
}

impl ModuleError {
    /// Code to report to clients for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ModuleError::Hardware(code) => *code,
            ModuleError::Buffer(AllocError::OutOfMemory(_)) => ErrorCode::OutOfMemory,
            ModuleError::Buffer(_)
            | ModuleError::BufferTooSmall(..)
            | ModuleError::WrongHandleType(_)
            | ModuleError::Settings(_)
            | ModuleError::Roi(_)
            | ModuleError::NotSupported(_) => ErrorCode::BadParameter,
            ModuleError::Pool(_) | ModuleError::Sync(_) | ModuleError::Undefined(_) => {
                ErrorCode::Undefined
            }
        }
    }
}

/// An encoder or decoder.
///
/// The lifecycle is `create` -> `run` -> `stop` -> `destroy`, with `run` and
/// `stop` callable any number of times in between. `flush` and `pause` stop
/// the module and run it again.
pub trait Module: Send + Sync {
    fn set_callbacks(&self, callbacks: Arc<dyn Callbacks>) -> Result<(), ModuleError>;
    /// Brings up the device.
    fn create(&self) -> Result<(), ModuleError>;
    fn destroy(&self) -> Result<(), ModuleError>;
    /// Creates the hardware channels. Buffers can be given to the module
    /// afterwards.
    fn run(&self) -> Result<(), ModuleError>;
    /// Destroys the hardware channels. Buffers still in flight are returned
    /// to the client before this method returns.
    fn stop(&self) -> Result<(), ModuleError>;
    fn flush(&self) -> Result<(), ModuleError> {
        self.stop()?;
        self.run()
    }
    fn pause(&self) -> Result<(), ModuleError> {
        self.stop()?;
        self.run()
    }
    /// Gives an input buffer to the module. A buffer without payload marks
    /// the end of the stream.
    fn empty(&self, handle: Arc<BufferHandle>) -> Result<(), ModuleError>;
    /// Gives an output buffer to the module.
    fn fill(&self, handle: Arc<BufferHandle>) -> Result<(), ModuleError>;
    fn set_dynamic(&self, value: Dynamic) -> Result<(), ModuleError>;
    fn get_dynamic(&self, index: DynamicIndex) -> Result<Dynamic, ModuleError>;
    fn get(&self, property: Property) -> SettingsResult<PropertyValue>;
    fn set(&self, value: PropertyValue) -> SettingsResult<()>;
}
