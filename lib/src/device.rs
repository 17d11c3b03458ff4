//! Interface to the codec SDK.
//!
//! A `Device` creates encoding and decoding channels and provides the
//! allocator their buffers come from. Channels take `Arc<HwBuffer>`s and give
//! them back through completion callbacks, so every buffer submitted is a
//! single in-flight reference that returns exactly once.
//!
//! The `dummy` module provides a software implementation of this interface.
pub mod dummy;
mod traits;

pub use traits::*;

use crate::settings::{Bitrate, Codec, DecSettings, EncSettings, Gop, LoopFilter, SeiFlags};
use crate::{Clock, PixelFormat, Rect, Resolution, Stride};

/// Parameters of an encoding channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncChannelConfig {
    pub codec: Codec,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub stride: Stride,
    pub clock: Clock,
    pub bitrate: Bitrate,
    pub gop: Gop,
    pub loop_filter: LoopFilter,
    pub sei: SeiFlags,
    pub crop: Rect,
    /// Slices per frame, each one delivered in its own stream buffer.
    pub slices: u32,
    /// Whether the channel produces look-ahead statistics.
    pub lookahead: bool,
}

impl EncChannelConfig {
    /// Parameters of the channel running pass `pass` out of `settings.passes()`.
    pub fn from_settings(settings: &EncSettings, pass: usize) -> Self {
        let last = pass + 1 == settings.passes();
        EncChannelConfig {
            codec: settings.codec,
            resolution: settings.resolution,
            format: settings.format,
            stride: settings.stride(),
            clock: settings.clock,
            bitrate: settings.bitrate,
            gop: settings.gop,
            loop_filter: settings.loop_filter,
            sei: if last { settings.sei } else { SeiFlags::empty() },
            crop: settings.crop,
            slices: if last && settings.subframe_latency {
                settings.slices.max(1)
            } else {
                1
            },
            lookahead: !last,
        }
    }
}

/// Parameters of a decoding channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecChannelConfig {
    pub codec: Codec,
    pub format: PixelFormat,
    pub stride_alignment: Stride,
    pub subframe_latency: bool,
    /// SEI messages reported through `parsed_sei`.
    pub sei: SeiFlags,
}

impl From<&DecSettings> for DecChannelConfig {
    fn from(settings: &DecSettings) -> Self {
        DecChannelConfig {
            codec: settings.codec,
            format: settings.format,
            stride_alignment: settings.stride_alignment,
            subframe_latency: settings.subframe_latency,
            sei: settings.sei,
        }
    }
}

/// Properties of a stream, as parsed by a decoding channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub crop: Rect,
    /// Number of frame buffers needed to decode the stream.
    pub min_buffers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeiMessage {
    /// Prefix SEI messages come before the picture data, suffix ones after.
    pub prefix: bool,
    pub payload_type: u32,
    pub payload: Vec<u8>,
}

/// Static HDR metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdrMetadata {
    /// Display primaries (x, y) for green, blue and red, in 0.00002 units.
    pub primaries: [[u16; 2]; 3],
    pub white_point: [u16; 2],
    /// Display luminance, in 0.0001 cd/m2 units.
    pub max_luminance: u32,
    pub min_luminance: u32,
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

/// Changes applied to a running encoding channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicCommand {
    Bitrate(Bitrate),
    Gop(Gop),
    InsertIdr,
    Clock(Clock),
    Resolution(Resolution),
    InsertSei(SeiMessage),
    HdrMetadata(HdrMetadata),
    LoopFilterBeta(i8),
    LoopFilterTc(i8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MediaSettings, PropertyValue};

    #[test]
    fn pass_configs() {
        let mut settings = EncSettings::default();
        settings.set(PropertyValue::LookAhead(4)).unwrap();
        settings.set(PropertyValue::SubframeLatency(true)).unwrap();
        settings
            .set(PropertyValue::Sei(SeiFlags::RECOVERY_POINT))
            .unwrap();

        let analysis = EncChannelConfig::from_settings(&settings, 0);
        assert!(analysis.lookahead);
        assert_eq!(analysis.slices, 1);
        assert_eq!(analysis.sei, SeiFlags::empty());

        let last = EncChannelConfig::from_settings(&settings, 1);
        assert!(!last.lookahead);
        assert_eq!(last.slices, settings.slices);
        assert_eq!(last.sei, SeiFlags::RECOVERY_POINT);
    }
}
