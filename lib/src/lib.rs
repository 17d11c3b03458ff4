//! This library drives a fixed-function video codec IP (typically attached
//! through an FPGA) from user-space. It provides three layers:
//!
//! * The `device` module describes the hardware SDK the library sits on: a
//!   channel scheduler, an allocator able to import dma-bufs, and encode/decode
//!   channels reporting their completions through callbacks invoked on SDK
//!   threads. A software implementation (`device::dummy`) is provided for
//!   testing.
//!
//! * The `encoder` and `decoder` modules are the orchestration layer: they
//!   translate the settings model into channel parameters, keep track of the
//!   ownership of every client buffer while it is in flight, and run the
//!   asynchronous pipeline (including the two-pass look-ahead encoder).
//!
//! * The `sync` module controls the frame-buffer synchronization IP that lets
//!   a producer and a consumer share frame buffers at sub-frame granularity.
//!
//! Clients interact with the encoder and decoder through the `module::Module`
//! trait and receive buffers back through `module::Callbacks`.
pub mod copier;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod error;
pub mod memory;
pub mod module;
pub mod pool;
pub mod settings;
pub mod sync;

use std::fmt;

/// A Fourcc pixel format. It can be converted back and forth from a 32-bit
/// integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 8-bit 4:2:0, interleaved chroma.
    pub const NV12: PixelFormat = PixelFormat::from_fourcc(b"NV12");
    /// 8-bit 4:2:2, interleaved chroma.
    pub const NV16: PixelFormat = PixelFormat::from_fourcc(b"NV16");
    /// 10-bit 4:2:0, 16 bits per sample.
    pub const P010: PixelFormat = PixelFormat::from_fourcc(b"P010");
    /// 10-bit 4:2:0, three samples packed in 32 bits.
    pub const XV15: PixelFormat = PixelFormat::from_fourcc(b"XV15");
    /// 8-bit monochrome.
    pub const Y800: PixelFormat = PixelFormat::from_fourcc(b"Y800");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Chroma subsampling of the format, if the format is known.
    pub fn chroma_mode(self) -> Option<ChromaMode> {
        match self {
            Self::NV12 | Self::P010 | Self::XV15 => Some(ChromaMode::Yuv420),
            Self::NV16 => Some(ChromaMode::Yuv422),
            Self::Y800 => Some(ChromaMode::Monochrome),
            _ => None,
        }
    }

    /// Bit depth of one sample, if the format is known.
    pub fn bit_depth(self) -> Option<u8> {
        match self {
            Self::NV12 | Self::NV16 | Self::Y800 => Some(8),
            Self::P010 | Self::XV15 => Some(10),
            _ => None,
        }
    }

    /// Number of bytes used to store `width` luma samples on one line.
    pub fn line_bytes(self, width: u32) -> Option<u32> {
        match self {
            Self::NV12 | Self::NV16 | Self::Y800 => Some(width),
            Self::P010 => Some(width * 2),
            Self::XV15 => Some((width + 2) / 3 * 4),
            _ => None,
        }
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use vcumod::PixelFormat;
/// // Fourcc representation of NV12.
/// let nv12 = u32::from_le(0x3231564e);
/// let f = PixelFormat::from(nv12);
/// assert_eq!(u32::from(f), nv12);
/// assert_eq!(f, PixelFormat::NV12);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"NV12") into a pixel format.
///
/// # Examples
///
/// ```
/// # use vcumod::PixelFormat;
/// let f = PixelFormat::from(b"NV16");
/// assert_eq!(&<[u8; 4]>::from(f), b"NV16");
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use vcumod::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::NV12), "0x3231564e (NV12)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaMode {
    Monochrome,
    Yuv420,
    Yuv422,
}

impl ChromaMode {
    /// Height of the chroma plane for a luma plane of `height` lines.
    pub fn chroma_lines(self, height: u32) -> u32 {
        match self {
            ChromaMode::Monochrome => 0,
            ChromaMode::Yuv420 => (height + 1) / 2,
            ChromaMode::Yuv422 => height,
        }
    }
}

/// Dimensions of a picture, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Memory layout of a picture: bytes per line and number of lines allocated
/// for the luma plane (possibly larger than the visible height).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stride {
    pub horizontal: u32,
    pub vertical: u32,
}

impl Stride {
    /// Computes the layout of `resolution` in `format`, with lines aligned to
    /// `alignment` (horizontal bytes, vertical lines).
    pub fn for_picture(resolution: Resolution, format: PixelFormat, alignment: Stride) -> Option<Self> {
        let line_bytes = format.line_bytes(resolution.width)?;
        Some(Stride {
            horizontal: align_up(line_bytes, alignment.horizontal),
            vertical: align_up(resolution.height, alignment.vertical),
        })
    }

    /// Size in bytes of a picture using this layout.
    pub fn picture_size(&self, format: PixelFormat) -> Option<usize> {
        let chroma_lines = format.chroma_mode()?.chroma_lines(self.vertical);
        Some(self.horizontal as usize * (self.vertical + chroma_lines) as usize)
    }
}

pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// A more elegant representation for a crop rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Rect {
        Rect {
            left,
            top,
            width,
            height,
        }
    }

    /// Whether this rectangle fits inside a picture of `resolution`.
    pub fn fits(&self, resolution: Resolution) -> bool {
        self.left + self.width <= resolution.width && self.top + self.height <= resolution.height
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}), {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}

/// Frame rate expressed as `framerate * 1000 / clock_ratio` frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    pub framerate: u32,
    pub clock_ratio: u32,
}

impl Default for Clock {
    fn default() -> Self {
        Clock {
            framerate: 60,
            clock_ratio: 1000,
        }
    }
}

/// Coding type of an encoded or decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    #[default]
    Idr,
    I,
    P,
    B,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_for_nv12() {
        let stride = Stride::for_picture(
            Resolution::new(1920, 1080),
            PixelFormat::NV12,
            Stride {
                horizontal: 32,
                vertical: 16,
            },
        )
        .unwrap();

        assert_eq!(stride.horizontal, 1920);
        assert_eq!(stride.vertical, 1088);
        assert_eq!(
            stride.picture_size(PixelFormat::NV12),
            Some(1920 * (1088 + 544))
        );
    }

    #[test]
    fn stride_for_packed_10bit() {
        let stride = Stride::for_picture(
            Resolution::new(100, 10),
            PixelFormat::XV15,
            Stride {
                horizontal: 64,
                vertical: 1,
            },
        )
        .unwrap();

        // 34 words of 3 samples, 136 bytes rounded up to 192.
        assert_eq!(stride.horizontal, 192);
        assert_eq!(stride.vertical, 10);
    }

    #[test]
    fn unknown_formats_have_no_layout() {
        let fmt = PixelFormat::from(b"ABCD");
        assert_eq!(fmt.chroma_mode(), None);
        assert_eq!(
            Stride::for_picture(Resolution::new(16, 16), fmt, Stride::default()),
            None
        );
    }

    #[test]
    fn rect_fits() {
        let res = Resolution::new(64, 32);
        assert!(Rect::new(0, 0, 64, 32).fits(res));
        assert!(!Rect::new(1, 0, 64, 32).fits(res));
    }
}
