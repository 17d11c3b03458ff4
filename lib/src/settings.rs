//! Typed property store describing how a module is configured.
//!
//! Each module owns a settings object (`EncSettings` or `DecSettings`) that
//! validates the values it is given. Clients reach it through the
//! `MediaSettings` trait, keyed by the closed `Property` vocabulary. A property
//! that means nothing for a given module is reported as `BadIndex`.
mod dec;
mod enc;

pub use dec::*;
pub use enc::*;

use bitflags::bitflags;
use thiserror::Error;

use crate::memory::HandleType;
use crate::{Clock, PixelFormat, Rect, Resolution, Stride};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SettingsError {
    #[error("property {0:?} is not supported by this module")]
    BadIndex(Property),
    #[error("invalid value for {0:?}: {1}")]
    BadParameter(Property, String),
    #[error("property {0:?} is not implemented")]
    NotImplemented(Property),
    #[error("undefined settings error")]
    Undefined,
}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub(crate) fn bad_parameter<T>(property: Property, reason: impl Into<String>) -> SettingsResult<T> {
    Err(SettingsError::BadParameter(property, reason.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Avc,
    Hevc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControlMode {
    ConstantQp,
    #[default]
    Cbr,
    Vbr,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitrate {
    /// Target bitrate, in kbps.
    pub target: u32,
    /// Maximum bitrate, in kbps.
    pub max: u32,
    pub mode: RateControlMode,
}

impl Default for Bitrate {
    fn default() -> Self {
        Bitrate {
            target: 5000,
            max: 5000,
            mode: RateControlMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gop {
    pub length: u32,
    pub b_frames: u32,
    /// Distance between IDR pictures, 0 meaning only the first picture.
    pub idr_frequency: u32,
}

impl Default for Gop {
    fn default() -> Self {
        Gop {
            length: 30,
            b_frames: 0,
            idr_frequency: 0,
        }
    }
}

/// Number of buffers of each direction a module needs to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCounts {
    pub input: u32,
    pub output: u32,
}

/// Size in bytes of each buffer of each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferSizes {
    pub input: usize,
    pub output: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferHandleTypes {
    pub input: HandleType,
    pub output: HandleType,
}

bitflags! {
    /// SEI messages a module inserts or reports.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SeiFlags: u32 {
        const BUFFERING_PERIOD = 0b00001;
        const PICTURE_TIMING = 0b00010;
        const RECOVERY_POINT = 0b00100;
        const MASTERING_DISPLAY = 0b01000;
        const CONTENT_LIGHT_LEVEL = 0b10000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopFilter {
    pub enabled: bool,
    pub beta_offset: i8,
    pub tc_offset: i8,
}

impl Default for LoopFilter {
    fn default() -> Self {
        LoopFilter {
            enabled: true,
            beta_offset: 0,
            tc_offset: 0,
        }
    }
}

impl LoopFilter {
    pub const OFFSET_RANGE: std::ops::RangeInclusive<i8> = -6..=6;
}

/// Keys of the property store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Codec,
    Resolution,
    Format,
    StrideAlignment,
    Clock,
    Bitrate,
    Gop,
    BufferCounts,
    BufferSizes,
    BufferHandles,
    LookAhead,
    TwoPass,
    Sei,
    RateControlPlugin,
    Crop,
    SeparateConfiguration,
    SubframeLatency,
    LoopFilter,
    CopyOnDisplay,
}

/// A property together with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Codec(Codec),
    Resolution(Resolution),
    Format(PixelFormat),
    StrideAlignment(Stride),
    Clock(Clock),
    Bitrate(Bitrate),
    Gop(Gop),
    BufferCounts(BufferCounts),
    BufferSizes(BufferSizes),
    BufferHandles(BufferHandleTypes),
    LookAhead(u32),
    TwoPass(bool),
    Sei(SeiFlags),
    RateControlPlugin(bool),
    Crop(Rect),
    SeparateConfiguration(bool),
    SubframeLatency(bool),
    LoopFilter(LoopFilter),
    CopyOnDisplay(bool),
}

impl PropertyValue {
    pub fn property(&self) -> Property {
        match self {
            PropertyValue::Codec(_) => Property::Codec,
            PropertyValue::Resolution(_) => Property::Resolution,
            PropertyValue::Format(_) => Property::Format,
            PropertyValue::StrideAlignment(_) => Property::StrideAlignment,
            PropertyValue::Clock(_) => Property::Clock,
            PropertyValue::Bitrate(_) => Property::Bitrate,
            PropertyValue::Gop(_) => Property::Gop,
            PropertyValue::BufferCounts(_) => Property::BufferCounts,
            PropertyValue::BufferSizes(_) => Property::BufferSizes,
            PropertyValue::BufferHandles(_) => Property::BufferHandles,
            PropertyValue::LookAhead(_) => Property::LookAhead,
            PropertyValue::TwoPass(_) => Property::TwoPass,
            PropertyValue::Sei(_) => Property::Sei,
            PropertyValue::RateControlPlugin(_) => Property::RateControlPlugin,
            PropertyValue::Crop(_) => Property::Crop,
            PropertyValue::SeparateConfiguration(_) => Property::SeparateConfiguration,
            PropertyValue::SubframeLatency(_) => Property::SubframeLatency,
            PropertyValue::LoopFilter(_) => Property::LoopFilter,
            PropertyValue::CopyOnDisplay(_) => Property::CopyOnDisplay,
        }
    }
}

/// Get/set access to the configuration of a module.
pub trait MediaSettings: Send {
    fn get(&self, property: Property) -> SettingsResult<PropertyValue>;
    fn set(&mut self, value: PropertyValue) -> SettingsResult<()>;
}

/// Largest picture the codec can process in either dimension.
pub const MAX_DIMENSION: u32 = 8192;

pub(crate) fn check_resolution(resolution: Resolution, format: PixelFormat) -> SettingsResult<()> {
    let Resolution { width, height } = resolution;
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return bad_parameter(
            Property::Resolution,
            format!("{} is outside of the supported range", resolution),
        );
    }
    if format.chroma_mode() == Some(crate::ChromaMode::Yuv420) && (width % 2 != 0 || height % 2 != 0)
    {
        return bad_parameter(
            Property::Resolution,
            format!("{} cannot be subsampled in {}", resolution, format),
        );
    }
    Ok(())
}

pub(crate) fn check_format(format: PixelFormat) -> SettingsResult<()> {
    match format.chroma_mode() {
        Some(_) => Ok(()),
        None => bad_parameter(Property::Format, format!("unsupported format {:?}", format)),
    }
}

pub(crate) fn check_alignment(alignment: Stride) -> SettingsResult<()> {
    if !(alignment.horizontal.is_power_of_two() && alignment.vertical.is_power_of_two()) {
        return bad_parameter(
            Property::StrideAlignment,
            "alignments must be powers of two",
        );
    }
    Ok(())
}

pub(crate) fn check_clock(clock: Clock) -> SettingsResult<()> {
    if clock.framerate == 0 || clock.clock_ratio == 0 {
        return bad_parameter(Property::Clock, "framerate and clock ratio must be non-zero");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_keys() {
        assert_eq!(
            PropertyValue::LookAhead(4).property(),
            Property::LookAhead
        );
        assert_eq!(
            PropertyValue::Crop(Rect::default()).property(),
            Property::Crop
        );
    }

    #[test]
    fn resolution_checks() {
        assert!(check_resolution(Resolution::new(1920, 1080), PixelFormat::NV12).is_ok());
        assert!(check_resolution(Resolution::new(0, 1080), PixelFormat::NV12).is_err());
        assert!(check_resolution(Resolution::new(9000, 16), PixelFormat::NV12).is_err());
        assert!(check_resolution(Resolution::new(15, 16), PixelFormat::NV12).is_err());
        assert!(check_resolution(Resolution::new(15, 16), PixelFormat::Y800).is_ok());
    }

    #[test]
    fn alignment_checks() {
        assert!(check_alignment(Stride {
            horizontal: 32,
            vertical: 8
        })
        .is_ok());
        assert!(check_alignment(Stride {
            horizontal: 24,
            vertical: 8
        })
        .is_err());
    }
}
