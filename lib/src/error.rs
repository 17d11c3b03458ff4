//! Error codes reported by the codec hardware and their translation into the
//! codes delivered to clients.
use enumn::N;
use log::{error, warn};
use thiserror::Error;

/// Raw status codes reported by the hardware on channel creation or at the
/// end of an encode/decode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Error)]
#[repr(u32)]
pub enum HwError {
    #[error("malformed request")]
    BadParameter = 0x01,
    #[error("out of memory")]
    OutOfMemory = 0x02,
    #[error("no channel available on the codec")]
    NoChannelAvailable = 0x03,
    #[error("not enough codec resources for the requested channel")]
    ResourceUnavailable = 0x04,
    #[error("codec resources are too fragmented for the requested channel")]
    ResourceFragmented = 0x05,
    #[error("request cannot be processed by the hardware")]
    Unsupported = 0x06,
    #[error("decoded stream is corrupted")]
    Concealed = 0x07,
    #[error("stream buffer overflowed, output was truncated")]
    StreamOverflow = 0x41,
    #[error("too many bits for a coding unit, QP was raised")]
    LcuOverflow = 0x42,
    #[error("number of slices was adjusted to the hardware limits")]
    SliceCountAdjusted = 0x43,
}

impl HwError {
    /// Warnings do not abort the operation: the output is still valid.
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            HwError::StreamOverflow | HwError::LcuOverflow | HwError::SliceCountAdjusted
        )
    }

    /// Decodes a raw status word. Zero means success, unknown codes are
    /// reported as `Err` with the raw value.
    pub fn from_status(status: u32) -> Result<Option<HwError>, u32> {
        match status {
            0 => Ok(None),
            s => HwError::n(s).map(Some).ok_or(s),
        }
    }
}

/// Error codes reported to clients through `Event::Error` or returned by
/// module operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Error)]
#[repr(u32)]
pub enum ErrorCode {
    #[error("no channel available")]
    NoChannelAvailable = 1,
    #[error("resource unavailable")]
    ResourceUnavailable = 2,
    #[error("resource fragmented")]
    ResourceFragmented = 3,
    #[error("bad parameter")]
    BadParameter = 4,
    #[error("out of memory")]
    OutOfMemory = 5,
    #[error("undefined error")]
    Undefined = 6,
}

impl From<HwError> for ErrorCode {
    fn from(error: HwError) -> Self {
        match error {
            HwError::NoChannelAvailable => ErrorCode::NoChannelAvailable,
            HwError::ResourceUnavailable => ErrorCode::ResourceUnavailable,
            HwError::ResourceFragmented => ErrorCode::ResourceFragmented,
            HwError::BadParameter | HwError::Unsupported => ErrorCode::BadParameter,
            HwError::OutOfMemory => ErrorCode::OutOfMemory,
            HwError::Concealed
            | HwError::StreamOverflow
            | HwError::LcuOverflow
            | HwError::SliceCountAdjusted => ErrorCode::Undefined,
        }
    }
}

/// Logs `error` with a message matching its severity and returns the code to
/// report to the client, if any.
pub(crate) fn check_hw_error(context: &str, error: Option<HwError>) -> Option<ErrorCode> {
    match error {
        None => None,
        Some(e) if e.is_warning() => {
            warn!("{}: {}", context, e);
            None
        }
        Some(e) => {
            error!("{}: {}", context, e);
            Some(e.into())
        }
    }
}
