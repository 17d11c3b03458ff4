use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use super::packet::{self, FrameFlags, Packet};
use super::ChannelLog;
use crate::device::{DecChannelConfig, DecodeCallbacks, DecodeChannel, StreamInfo};
use crate::error::HwError;
use crate::memory::{BufferFlags, HwBuffer, PictureMeta};
use crate::Rect;

enum DecoderCommand {
    Push(Arc<HwBuffer>, usize),
    PutFrame(Arc<HwBuffer>),
    Flush,
    Destroy,
}

struct Input {
    buffer: Arc<HwBuffer>,
    packets: VecDeque<Packet>,
}

pub(super) struct DecoderThread {
    config: DecChannelConfig,
    receiver: mpsc::Receiver<DecoderCommand>,
    callbacks: DecodeCallbacks,
    log: Arc<ChannelLog>,
    latency: Duration,

    inputs: VecDeque<Input>,
    frames: VecDeque<Arc<HwBuffer>>,
    stream: Option<StreamInfo>,
    // Set when the client rejected the stream; nothing is decoded anymore.
    failed: bool,
    flush_pending: bool,
}

impl DecoderThread {
    fn run(mut self) {
        while let Ok(command) = self.receiver.recv() {
            match command {
                DecoderCommand::Push(buffer, payload) => {
                    self.log.record(Some(buffer.id()));
                    self.push(buffer, payload);
                }
                DecoderCommand::PutFrame(frame) => self.frames.push_back(frame),
                DecoderCommand::Flush => self.flush_pending = true,
                DecoderCommand::Destroy => break,
            }
            self.decode_pending();
        }

        self.cancel();
    }

    fn push(&mut self, buffer: Arc<HwBuffer>, payload: usize) {
        let data = buffer.mapping().and_then(|m| Ok(m.to_vec(0, payload)?));
        let packets = match data.map(|d| packet::parse(&d)) {
            Ok(Ok(packets)) => packets,
            Ok(Err(e)) => {
                warn!("Decoder channel: malformed bitstream: {}", e);
                (self.callbacks.end_decoding)(None, &buffer, Some(HwError::BadParameter));
                vec![]
            }
            Err(e) => {
                error!("Decoder channel: cannot read bitstream: {}", e);
                (self.callbacks.end_decoding)(None, &buffer, Some(HwError::BadParameter));
                vec![]
            }
        };
        self.inputs.push_back(Input {
            buffer,
            packets: packets.into(),
        });
    }

    fn decode_pending(&mut self) {
        while let Some(input) = self.inputs.front_mut() {
            while let Some(packet) = input.packets.pop_front() {
                if self.failed {
                    continue;
                }
                match packet {
                    Packet::Config {
                        resolution,
                        min_buffers,
                        ..
                    } => {
                        if self.stream.map(|s| s.resolution) == Some(resolution) {
                            continue;
                        }
                        let info = StreamInfo {
                            resolution,
                            format: self.config.format,
                            crop: Rect::new(0, 0, resolution.width, resolution.height),
                            min_buffers: min_buffers as u32,
                        };
                        debug!("Decoder channel: stream is {:?}", info);
                        self.stream = Some(info);
                        if let Err(e) = (self.callbacks.resolution_found)(&info) {
                            error!("Decoder channel: stream rejected: {:#}", e);
                            self.failed = true;
                        }
                    }
                    Packet::Sei(sei) => {
                        if !self.config.sei.is_empty() {
                            (self.callbacks.parsed_sei)(sei);
                        }
                    }
                    Packet::Frame {
                        resolution,
                        picture_type,
                        flags,
                        data,
                    } => {
                        if self.stream.is_none() || flags.contains(FrameFlags::CORRUPT) {
                            warn!("Decoder channel: cannot decode frame");
                            (self.callbacks.end_decoding)(
                                None,
                                &input.buffer,
                                Some(HwError::Unsupported),
                            );
                            continue;
                        }
                        let Some(frame) = self.frames.pop_front() else {
                            // Wait for a frame buffer.
                            input.packets.push_front(Packet::Frame {
                                resolution,
                                picture_type,
                                flags,
                                data,
                            });
                            return;
                        };

                        if let Err(e) = frame.mapping().and_then(|m| {
                            let len = data.len().min(frame.size());
                            Ok(m.write_at(0, &data[..len])?)
                        }) {
                            error!("Decoder channel: cannot write frame: {}", e);
                        }
                        let picture = PictureMeta {
                            picture_type,
                            skipped: flags.contains(FrameFlags::SKIPPED),
                            concealed: flags.contains(FrameFlags::CONCEALED),
                            resolution,
                        };
                        frame.meta().picture = Some(picture);

                        if !self.latency.is_zero() {
                            thread::sleep(self.latency);
                        }
                        trace!("Decoder channel: decoded {:?}", picture);
                        self.log.completed.fetch_add(1, Ordering::SeqCst);
                        (self.callbacks.end_decoding)(Some(Arc::clone(&frame)), &input.buffer, None);
                        (self.callbacks.display)(Some(frame), Some(picture));
                    }
                }
            }

            if let Some(input) = self.inputs.pop_front() {
                (self.callbacks.input_released)(input.buffer);
            }
        }

        if self.flush_pending {
            self.flush_pending = false;
            trace!("Decoder channel: end of stream");
            (self.callbacks.display)(None, None);
        }
    }

    fn cancel(&mut self) {
        for input in std::mem::take(&mut self.inputs) {
            (self.callbacks.input_released)(input.buffer);
        }
        for frame in std::mem::take(&mut self.frames) {
            (self.callbacks.display)(Some(frame), None);
        }
    }
}

pub(super) struct DummyDecodeChannel {
    sender: Mutex<mpsc::Sender<DecoderCommand>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    live_channels: Arc<AtomicUsize>,
}

impl DummyDecodeChannel {
    pub(super) fn new(
        index: usize,
        config: DecChannelConfig,
        callbacks: DecodeCallbacks,
        log: Arc<ChannelLog>,
        latency: Duration,
        live_channels: Arc<AtomicUsize>,
    ) -> Result<Self, HwError> {
        let (sender, receiver) = mpsc::channel();
        let decoder_thread = DecoderThread {
            config,
            receiver,
            callbacks,
            log,
            latency,
            inputs: Default::default(),
            frames: Default::default(),
            stream: None,
            failed: false,
            flush_pending: false,
        };

        let handle = thread::Builder::new()
            .name(format!("dummy decoder {}", index))
            .spawn(move || decoder_thread.run())
            .map_err(|e| {
                error!("Cannot spawn decoder thread: {}", e);
                HwError::ResourceUnavailable
            })?;

        Ok(DummyDecodeChannel {
            sender: Mutex::new(sender),
            handle: Mutex::new(Some(handle)),
            live_channels,
        })
    }

    fn send(&self, command: DecoderCommand) -> Result<(), HwError> {
        self.sender
            .lock()
            .unwrap()
            .send(command)
            .map_err(|_| HwError::BadParameter)
    }
}

impl DecodeChannel for DummyDecodeChannel {
    fn push_bitstream(
        &self,
        buffer: Arc<HwBuffer>,
        payload: usize,
        flags: BufferFlags,
    ) -> Result<(), HwError> {
        if payload > buffer.size() {
            return Err(HwError::BadParameter);
        }
        trace!("Decoder channel: {} bytes ({:?})", payload, flags);
        self.send(DecoderCommand::Push(buffer, payload))
    }

    fn put_display_picture(&self, frame: Arc<HwBuffer>) -> Result<(), HwError> {
        self.send(DecoderCommand::PutFrame(frame))
    }

    fn flush(&self) -> Result<(), HwError> {
        self.send(DecoderCommand::Flush)
    }

    fn destroy(&self) {
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return;
        };
        let _ = self.send(DecoderCommand::Destroy);
        if handle.thread().id() == thread::current().id() {
            error!("Decoder channel destroyed from its own callback");
        } else if handle.join().is_err() {
            error!("Decoder thread panicked");
        }
        self.live_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for DummyDecodeChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}
