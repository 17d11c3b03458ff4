use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use super::packet::{FrameFlags, Packet};
use super::ChannelLog;
use crate::device::{
    DynamicCommand, EncChannelConfig, EncodeCallback, EncodeChannel, EncodeCompletion,
    HdrMetadata, SeiMessage,
};
use crate::error::HwError;
use crate::memory::{HwBuffer, LookAheadMeta, PictureMeta, SectionFlags, StreamMeta};
use crate::settings::SeiFlags;
use crate::PictureType;

/// Number of source bytes copied into each encoded frame.
const SAMPLE_SIZE: usize = 16;

/// SEI payload types emitted by the software encoder.
const SEI_RECOVERY_POINT: u32 = 6;
const SEI_MASTERING_DISPLAY: u32 = 137;
const SEI_CONTENT_LIGHT_LEVEL: u32 = 144;

enum EncoderCommand {
    Process {
        source: Option<Arc<HwBuffer>>,
        qp_table: Option<Arc<HwBuffer>>,
    },
    PutStream(Arc<HwBuffer>),
    Apply(DynamicCommand),
    Destroy,
}

struct Job {
    source: Option<Arc<HwBuffer>>,
    qp_table: Option<Arc<HwBuffer>>,
}

/// A frame being split into slices, one per stream buffer.
struct InProgress {
    job: Job,
    slices: Vec<Vec<Vec<u8>>>,
    picture: PictureMeta,
    error: Option<HwError>,
    next_slice: usize,
}

pub(super) struct EncoderThread {
    config: EncChannelConfig,
    receiver: mpsc::Receiver<EncoderCommand>,
    on_complete: EncodeCallback,
    log: Arc<ChannelLog>,
    errors: Vec<(u64, HwError)>,
    latency: Duration,

    jobs: VecDeque<Job>,
    streams: VecDeque<Arc<HwBuffer>>,
    current: Option<InProgress>,

    frame_count: u64,
    force_idr: bool,
    pending_sei: Vec<SeiMessage>,
    hdr: Option<HdrMetadata>,
    previous_sample: Option<Vec<u8>>,
}

impl EncoderThread {
    fn run(mut self) {
        while let Ok(command) = self.receiver.recv() {
            match command {
                EncoderCommand::Process { source, qp_table } => {
                    self.log.record(source.as_ref().map(|s| s.id()));
                    self.jobs.push_back(Job { source, qp_table });
                }
                EncoderCommand::PutStream(buffer) => self.streams.push_back(buffer),
                EncoderCommand::Apply(command) => self.apply(command),
                EncoderCommand::Destroy => break,
            }
            self.encode_pending();
        }

        self.cancel();
    }

    fn apply(&mut self, command: DynamicCommand) {
        debug!("Encoder channel: {:?}", command);
        match command {
            DynamicCommand::Bitrate(bitrate) => self.config.bitrate = bitrate,
            DynamicCommand::Gop(gop) => self.config.gop = gop,
            DynamicCommand::InsertIdr => self.force_idr = true,
            DynamicCommand::Clock(clock) => self.config.clock = clock,
            DynamicCommand::Resolution(resolution) => {
                self.config.resolution = resolution;
                self.force_idr = true;
            }
            DynamicCommand::InsertSei(sei) => self.pending_sei.push(sei),
            DynamicCommand::HdrMetadata(hdr) => self.hdr = Some(hdr),
            DynamicCommand::LoopFilterBeta(beta) => self.config.loop_filter.beta_offset = beta,
            DynamicCommand::LoopFilterTc(tc) => self.config.loop_filter.tc_offset = tc,
        }
    }

    fn complete(&self, completion: EncodeCompletion) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.log.completed.fetch_add(1, Ordering::SeqCst);
        (self.on_complete)(completion);
    }

    fn encode_pending(&mut self) {
        loop {
            if self.current.is_none() {
                match self.jobs.front() {
                    None => return,
                    Some(Job { source: None, .. }) => {
                        // EOS is reported once all previous frames are out.
                        self.jobs.pop_front();
                        trace!("Encoder channel: end of stream");
                        self.complete(EncodeCompletion::default());
                        continue;
                    }
                    Some(_) => (),
                }
                let Some(job) = self.jobs.pop_front() else {
                    return;
                };
                self.current = Some(self.start_frame(job));
            }

            let Some(stream) = self.streams.pop_front() else {
                return;
            };
            let Some(mut frame) = self.current.take() else {
                return;
            };
            let slice = std::mem::take(&mut frame.slices[frame.next_slice]);
            frame.next_slice += 1;
            let last = frame.next_slice == frame.slices.len();

            let overflow = write_slice(&stream, slice, last);
            stream.meta().picture = Some(frame.picture);
            let error = frame.error.or(overflow);

            if last {
                self.complete(EncodeCompletion {
                    stream: Some(stream),
                    source: frame.job.source,
                    qp_table: frame.job.qp_table,
                    error,
                });
            } else {
                self.complete(EncodeCompletion {
                    stream: Some(stream),
                    source: frame.job.source.clone(),
                    qp_table: None,
                    error,
                });
                self.current = Some(frame);
            }
        }
    }

    fn picture_type(&mut self, scene_change: bool) -> PictureType {
        let gop = self.config.gop;
        let n = self.frame_count;
        let idr = n == 0
            || std::mem::take(&mut self.force_idr)
            || (gop.idr_frequency > 0 && n % gop.idr_frequency as u64 == 0);
        if idr {
            PictureType::Idr
        } else if scene_change || n % gop.length.max(1) as u64 == 0 {
            PictureType::I
        } else {
            PictureType::P
        }
    }

    fn sei_messages(&mut self, picture_type: PictureType) -> Vec<SeiMessage> {
        let mut messages = std::mem::take(&mut self.pending_sei);
        if picture_type == PictureType::Idr {
            if self.config.sei.contains(SeiFlags::RECOVERY_POINT) {
                messages.push(SeiMessage {
                    prefix: true,
                    payload_type: SEI_RECOVERY_POINT,
                    payload: vec![0],
                });
            }
            if let Some(hdr) = &self.hdr {
                if self.config.sei.contains(SeiFlags::MASTERING_DISPLAY) {
                    let mut payload = Vec::new();
                    for p in hdr.primaries.iter().chain(std::iter::once(&hdr.white_point)) {
                        payload.extend_from_slice(&p[0].to_be_bytes());
                        payload.extend_from_slice(&p[1].to_be_bytes());
                    }
                    payload.extend_from_slice(&hdr.max_luminance.to_be_bytes());
                    payload.extend_from_slice(&hdr.min_luminance.to_be_bytes());
                    messages.push(SeiMessage {
                        prefix: true,
                        payload_type: SEI_MASTERING_DISPLAY,
                        payload,
                    });
                }
                if self.config.sei.contains(SeiFlags::CONTENT_LIGHT_LEVEL) {
                    let mut payload = hdr.max_content_light_level.to_be_bytes().to_vec();
                    payload.extend_from_slice(&hdr.max_frame_average_light_level.to_be_bytes());
                    messages.push(SeiMessage {
                        prefix: true,
                        payload_type: SEI_CONTENT_LIGHT_LEVEL,
                        payload,
                    });
                }
            }
        }
        messages
    }

    fn start_frame(&mut self, job: Job) -> InProgress {
        // Only called for jobs with a source.
        let sample = job
            .source
            .as_ref()
            .and_then(|s| {
                let len = SAMPLE_SIZE.min(s.size());
                s.mapping().and_then(|m| Ok(m.to_vec(0, len)?)).ok()
            })
            .unwrap_or_default();

        let scene_change = match &self.previous_sample {
            Some(prev) => {
                let diff: u32 = prev
                    .iter()
                    .zip(sample.iter())
                    .map(|(a, b)| a.abs_diff(*b) as u32)
                    .sum();
                diff > 64 * SAMPLE_SIZE as u32
            }
            None => true,
        };
        let hinted_scene_change = job
            .source
            .as_ref()
            .and_then(|s| s.meta().hints)
            .map(|h| h.scene_change)
            .unwrap_or(false);
        let picture_type = self.picture_type(hinted_scene_change);
        let frame_index = self.frame_count;
        self.frame_count += 1;
        self.previous_sample = Some(sample.clone());

        let error = self
            .errors
            .iter()
            .find(|(n, _)| *n == frame_index)
            .map(|(_, e)| *e);
        if let Some(e) = error {
            warn!("Encoder channel: injecting {:?} on frame {}", e, frame_index);
        }

        let picture = PictureMeta {
            picture_type,
            skipped: false,
            concealed: false,
            resolution: self.config.resolution,
        };

        let mut prefix = Vec::new();
        if picture_type == PictureType::Idr {
            prefix.push(
                Packet::Config {
                    codec: self.config.codec,
                    resolution: self.config.resolution,
                    min_buffers: (2 + self.config.gop.b_frames).min(u8::MAX as u32) as u8,
                }
                .encode(),
            );
        }
        for sei in self.sei_messages(picture_type) {
            prefix.push(Packet::Sei(sei).encode());
        }

        let frame = Packet::Frame {
            resolution: self.config.resolution,
            picture_type,
            flags: FrameFlags::empty(),
            data: sample,
        }
        .encode();

        if self.config.lookahead {
            if let Some(source) = &job.source {
                let mut meta = source.meta();
                if meta.lookahead.is_some() {
                    meta.lookahead = Some(LookAheadMeta {
                        picture_size: (frame.len() + prefix.iter().map(Vec::len).sum::<usize>())
                            as u32,
                        percent_intra: match picture_type {
                            PictureType::Idr | PictureType::I => 100,
                            _ => (frame.iter().map(|b| *b as u32).sum::<u32>() % 100) as u8,
                        },
                        scene_change,
                    });
                }
            }
        }

        // Hardware errors produce no data.
        let slices = if error.map(|e| !e.is_warning()).unwrap_or(false) {
            vec![vec![]]
        } else {
            split_slices(prefix, frame, self.config.slices.max(1) as usize)
        };

        InProgress {
            job,
            slices,
            picture,
            error,
            next_slice: 0,
        }
    }

    /// Gives back everything the channel still owns.
    fn cancel(&mut self) {
        if let Some(frame) = self.current.take() {
            self.complete(EncodeCompletion {
                source: frame.job.source,
                qp_table: frame.job.qp_table,
                ..Default::default()
            });
        }
        for job in std::mem::take(&mut self.jobs) {
            if job.source.is_some() {
                self.complete(EncodeCompletion {
                    source: job.source,
                    qp_table: job.qp_table,
                    ..Default::default()
                });
            }
        }
        for stream in std::mem::take(&mut self.streams) {
            self.complete(EncodeCompletion {
                stream: Some(stream),
                ..Default::default()
            });
        }
    }
}

/// Splits an encoded frame into `slices` parts. The first slice carries the
/// parameter sets and SEI messages. Each slice is a list of sections.
fn split_slices(prefix: Vec<Vec<u8>>, frame: Vec<u8>, slices: usize) -> Vec<Vec<Vec<u8>>> {
    let chunk = frame.len().div_ceil(slices).max(1);
    let mut parts: Vec<Vec<Vec<u8>>> = frame.chunks(chunk).map(|c| vec![c.to_vec()]).collect();
    parts.resize(slices, vec![]);
    let mut first = prefix;
    first.append(&mut parts[0]);
    parts[0] = first;
    parts
}

/// Writes the sections of a slice into `stream`: picture data from the start
/// of the buffer, parameter sets and SEI messages from its end. Returns a
/// warning if the slice did not fit.
fn write_slice(stream: &HwBuffer, sections: Vec<Vec<u8>>, last: bool) -> Option<HwError> {
    let mut meta = StreamMeta::default();
    let mut overflow = None;

    let mapping = match stream.mapping() {
        Ok(m) => m,
        Err(e) => {
            error!("Encoder channel: cannot access stream buffer: {}", e);
            stream.meta().stream = Some(meta);
            return Some(HwError::BadParameter);
        }
    };

    let size = stream.size();
    let mut head = 0;
    let mut tail = size;
    let count = sections.len();
    for (i, section) in sections.into_iter().enumerate() {
        let mut flags = match section.get(..4) {
            Some(b"VCUP") => SectionFlags::CONFIG,
            Some(b"VCUS") => SectionFlags::SEI,
            _ => SectionFlags::empty(),
        };
        if last && i + 1 == count {
            flags |= SectionFlags::END_OF_FRAME;
        }

        let offset = if flags.intersects(SectionFlags::CONFIG | SectionFlags::SEI) {
            if tail - head < section.len() {
                overflow = Some(HwError::StreamOverflow);
                continue;
            }
            tail -= section.len();
            tail
        } else {
            let len = section.len().min(tail - head);
            if len < section.len() {
                overflow = Some(HwError::StreamOverflow);
            }
            let offset = head;
            head += len;
            if let Err(e) = mapping.write_at(offset, &section[..len]) {
                error!("Encoder channel: cannot write stream buffer: {}", e);
            }
            meta.add_section(offset, len, flags);
            continue;
        };

        if let Err(e) = mapping.write_at(offset, &section) {
            error!("Encoder channel: cannot write stream buffer: {}", e);
        }
        meta.add_section(offset, section.len(), flags);
    }

    if last && count == 0 {
        meta.add_section(0, 0, SectionFlags::END_OF_FRAME);
    }
    stream.meta().stream = Some(meta);
    overflow
}

pub(super) struct DummyEncodeChannel {
    sender: Mutex<mpsc::Sender<EncoderCommand>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    live_channels: Arc<AtomicUsize>,
}

impl DummyEncodeChannel {
    pub(super) fn new(
        index: usize,
        config: EncChannelConfig,
        on_complete: EncodeCallback,
        log: Arc<ChannelLog>,
        errors: Vec<(u64, HwError)>,
        latency: Duration,
        live_channels: Arc<AtomicUsize>,
    ) -> Result<Self, HwError> {
        let (sender, receiver) = mpsc::channel();
        let encoder_thread = EncoderThread {
            config,
            receiver,
            on_complete,
            log,
            errors,
            latency,
            jobs: Default::default(),
            streams: Default::default(),
            current: None,
            frame_count: 0,
            force_idr: false,
            pending_sei: Vec::new(),
            hdr: None,
            previous_sample: None,
        };

        let handle = thread::Builder::new()
            .name(format!("dummy encoder {}", index))
            .spawn(move || encoder_thread.run())
            .map_err(|e| {
                error!("Cannot spawn encoder thread: {}", e);
                HwError::ResourceUnavailable
            })?;

        Ok(DummyEncodeChannel {
            sender: Mutex::new(sender),
            handle: Mutex::new(Some(handle)),
            live_channels,
        })
    }

    fn send(&self, command: EncoderCommand) -> Result<(), HwError> {
        self.sender
            .lock()
            .unwrap()
            .send(command)
            .map_err(|_| HwError::BadParameter)
    }
}

impl EncodeChannel for DummyEncodeChannel {
    fn process(
        &self,
        source: Option<Arc<HwBuffer>>,
        qp_table: Option<Arc<HwBuffer>>,
    ) -> Result<(), HwError> {
        self.send(EncoderCommand::Process { source, qp_table })
    }

    fn put_stream_buffer(&self, buffer: Arc<HwBuffer>) -> Result<(), HwError> {
        self.send(EncoderCommand::PutStream(buffer))
    }

    fn apply(&self, command: DynamicCommand) -> Result<(), HwError> {
        self.send(EncoderCommand::Apply(command))
    }

    fn destroy(&self) {
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return;
        };
        let _ = self.send(EncoderCommand::Destroy);
        if handle.thread().id() == thread::current().id() {
            error!("Encoder channel destroyed from its own completion callback");
        } else if handle.join().is_err() {
            error!("Encoder thread panicked");
        }
        self.live_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for DummyEncodeChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Mapping;

    fn stream_buffer(size: usize) -> Arc<HwBuffer> {
        HwBuffer::wrap(Mapping::Memory(Arc::new(Mutex::new(vec![0; size]))), size)
    }

    #[test]
    fn sections_are_split_between_head_and_tail() {
        let stream = stream_buffer(64);
        let config = b"VCUPconfig".to_vec();
        let data = vec![7u8; 20];
        assert_eq!(write_slice(&stream, vec![config.clone(), data.clone()], true), None);

        let meta = stream.meta().stream.clone().unwrap();
        assert_eq!(meta.sections.len(), 2);
        assert_eq!(meta.sections[0].offset, 64 - config.len());
        assert_eq!(meta.sections[0].flags, SectionFlags::CONFIG);
        assert_eq!(meta.sections[1].offset, 0);
        assert_eq!(meta.sections[1].flags, SectionFlags::END_OF_FRAME);

        let mapping = stream.mapping().unwrap();
        assert_eq!(mapping.to_vec(0, 20).unwrap(), data);
        assert_eq!(mapping.to_vec(54, 10).unwrap(), config);
    }

    #[test]
    fn overflow_truncates_data() {
        let stream = stream_buffer(16);
        assert_eq!(
            write_slice(&stream, vec![vec![1u8; 20]], true),
            Some(HwError::StreamOverflow)
        );
        assert_eq!(stream.meta().stream.as_ref().unwrap().payload(), 16);
    }

    #[test]
    fn slices() {
        let parts = split_slices(vec![b"VCUPxx".to_vec()], vec![1u8; 10], 4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[0][1].len(), 3);
        assert_eq!(parts[3], vec![vec![1u8; 1]]);

        // More slices than bytes.
        let parts = split_slices(vec![], vec![1u8; 2], 4);
        assert_eq!(parts[2], Vec::<Vec<u8>>::new());
    }
}
