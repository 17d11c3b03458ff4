//! Metadata attached to hardware buffers.
use bitflags::bitflags;

use crate::{PictureType, PixelFormat, Resolution, Stride};

/// Layout of a source picture, attached to every picture buffer given to a
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceMeta {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub stride: Stride,
}

impl SourceMeta {
    /// Offset of the chroma plane from the start of the buffer.
    pub fn chroma_offset(&self) -> usize {
        self.stride.horizontal as usize * self.stride.vertical as usize
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// Parameter sets (VPS/SPS/PPS).
        const CONFIG = 0b0001;
        /// Last section of a frame.
        const END_OF_FRAME = 0b0010;
        /// Supplemental enhancement information.
        const SEI = 0b0100;
        /// Section belongs to a random access point.
        const SYNC = 0b1000;
    }
}

/// A contiguous run of bytes written by the encoder in a stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub offset: usize,
    pub length: usize,
    pub flags: SectionFlags,
}

/// Layout of the data an encoder wrote in a stream buffer. Sections are listed
/// in stream order but are not necessarily contiguous in the buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMeta {
    pub sections: Vec<Section>,
}

impl StreamMeta {
    pub fn add_section(&mut self, offset: usize, length: usize, flags: SectionFlags) {
        self.sections.push(Section {
            offset,
            length,
            flags,
        });
    }

    pub fn payload(&self) -> usize {
        self.sections.iter().map(|s| s.length).sum()
    }

    pub fn is_end_of_frame(&self) -> bool {
        self.sections
            .iter()
            .any(|s| s.flags.contains(SectionFlags::END_OF_FRAME))
    }

    pub fn has_config(&self) -> bool {
        self.sections
            .iter()
            .any(|s| s.flags.contains(SectionFlags::CONFIG))
    }
}

/// Statistics produced by a look-ahead pass for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookAheadMeta {
    /// Size in bytes of the frame as encoded by the look-ahead pass.
    pub picture_size: u32,
    /// Share of intra-coded blocks, in percent.
    pub percent_intra: u8,
    pub scene_change: bool,
}

/// Encoding hints computed from look-ahead statistics, consumed by the final
/// pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassHints {
    /// Complexity of the frame relative to the window average, in percent.
    pub complexity: Option<u32>,
    pub scene_change: bool,
    /// QP delta to apply to the whole frame.
    pub qp_offset: i8,
}

/// Information about an encoded or decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PictureMeta {
    pub picture_type: PictureType,
    pub skipped: bool,
    pub concealed: bool,
    pub resolution: Resolution,
}

/// All the metadata a hardware buffer can carry.
#[derive(Debug, Clone, Default)]
pub struct BufferMeta {
    pub source: Option<SourceMeta>,
    pub stream: Option<StreamMeta>,
    pub lookahead: Option<LookAheadMeta>,
    pub hints: Option<PassHints>,
    pub picture: Option<PictureMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_meta_summary() {
        let mut meta = StreamMeta::default();
        meta.add_section(100, 20, SectionFlags::CONFIG);
        meta.add_section(0, 50, SectionFlags::END_OF_FRAME | SectionFlags::SYNC);

        assert_eq!(meta.payload(), 70);
        assert!(meta.is_end_of_frame());
        assert!(meta.has_config());
        assert!(!StreamMeta::default().is_end_of_frame());
    }

    #[test]
    fn chroma_offset() {
        let meta = SourceMeta {
            resolution: Resolution::new(64, 30),
            format: PixelFormat::NV12,
            stride: Stride {
                horizontal: 64,
                vertical: 32,
            },
        };
        assert_eq!(meta.chroma_offset(), 64 * 32);
    }
}
