use std::sync::Arc;

use crate::error::HwError;
use crate::memory::{Allocator, BufferFlags, HwBuffer, PictureMeta};

use super::{DecChannelConfig, DynamicCommand, EncChannelConfig, SeiMessage, StreamInfo};

/// Result of one encode operation, passed to the channel's completion
/// callback.
///
/// Which buffers are present tells what happened:
///
/// * `stream` and `source`: a section of a frame was encoded,
/// * `source` only: the source is given back without being encoded (e.g. the
///   channel was destroyed),
/// * `stream` only: the stream buffer is given back unused,
/// * neither: end of stream.
#[derive(Debug, Default)]
pub struct EncodeCompletion {
    pub stream: Option<Arc<HwBuffer>>,
    pub source: Option<Arc<HwBuffer>>,
    pub qp_table: Option<Arc<HwBuffer>>,
    pub error: Option<HwError>,
}

pub type EncodeCallback = Box<dyn Fn(EncodeCompletion) + Send + Sync>;

/// An encoding context on the codec.
///
/// Completions are reported on a thread owned by the channel, in submission
/// order.
pub trait EncodeChannel: Send + Sync {
    /// Queues `source` for encoding with an optional QP table. `None` marks
    /// the end of the stream.
    fn process(
        &self,
        source: Option<Arc<HwBuffer>>,
        qp_table: Option<Arc<HwBuffer>>,
    ) -> Result<(), HwError>;
    /// Gives a buffer the channel can write encoded data into.
    fn put_stream_buffer(&self, buffer: Arc<HwBuffer>) -> Result<(), HwError>;
    /// Changes a parameter of the channel, effective from the next frame.
    fn apply(&self, command: DynamicCommand) -> Result<(), HwError>;
    /// Cancels all pending work. Buffers still owned by the channel are given
    /// back through the completion callback before this method returns.
    fn destroy(&self);
}

/// Callbacks a decoding channel invokes on its own thread.
pub struct DecodeCallbacks {
    /// The stream properties were parsed. Returning an error aborts decoding.
    pub resolution_found: Box<dyn Fn(&StreamInfo) -> anyhow::Result<()> + Send + Sync>,
    /// A picture was decoded from `bitstream` into `frame`, or failed to.
    pub end_decoding:
        Box<dyn Fn(Option<Arc<HwBuffer>>, &Arc<HwBuffer>, Option<HwError>) + Send + Sync>,
    /// Output of a frame buffer:
    ///
    /// * `(Some(frame), Some(info))`: `frame` is to be displayed,
    /// * `(Some(frame), None)`: `frame` is given back without content,
    /// * `(None, None)`: end of stream.
    pub display: Box<dyn Fn(Option<Arc<HwBuffer>>, Option<PictureMeta>) + Send + Sync>,
    /// The channel is done reading a bitstream buffer.
    pub input_released: Box<dyn Fn(Arc<HwBuffer>) + Send + Sync>,
    pub parsed_sei: Box<dyn Fn(SeiMessage) + Send + Sync>,
}

/// A decoding context on the codec.
pub trait DecodeChannel: Send + Sync {
    /// Queues `payload` bytes of `buffer` for decoding.
    fn push_bitstream(
        &self,
        buffer: Arc<HwBuffer>,
        payload: usize,
        flags: BufferFlags,
    ) -> Result<(), HwError>;
    /// Gives a buffer the channel can decode a picture into.
    fn put_display_picture(&self, frame: Arc<HwBuffer>) -> Result<(), HwError>;
    /// Decodes everything queued so far, then signals the end of stream.
    fn flush(&self) -> Result<(), HwError>;
    /// Cancels all pending work. Frame buffers still owned by the channel are
    /// given back through `display`, bitstream buffers through
    /// `input_released`, before this method returns.
    fn destroy(&self);
}

/// The codec, as exposed by its SDK.
pub trait Device: Send + Sync {
    /// Brings up the channel scheduler.
    fn init(&self) -> Result<(), HwError>;
    fn deinit(&self);
    fn allocator(&self) -> Arc<dyn Allocator>;
    fn create_encoder(
        &self,
        config: EncChannelConfig,
        on_complete: EncodeCallback,
    ) -> Result<Box<dyn EncodeChannel>, HwError>;
    fn create_decoder(
        &self,
        config: DecChannelConfig,
        callbacks: DecodeCallbacks,
    ) -> Result<Box<dyn DecodeChannel>, HwError>;
}
