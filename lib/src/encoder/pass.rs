//! A single pass of the encoder.
//!
//! Every pass owns an encoding channel. All passes but the last one analyze
//! frames: their completions push the analyzed source into a FIFO drained by
//! a worker thread, which forwards frames to the next pass once enough of
//! them have been analyzed to compute hints.
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};

use super::lookahead::TwoPassManager;
use super::EncInner;
use crate::device::{
    Device, DynamicCommand, EncChannelConfig, EncodeCallback, EncodeChannel, EncodeCompletion,
};
use crate::error::{check_hw_error, ErrorCode, HwError};
use crate::memory::{HwBuffer, LookAheadMeta, PassHints};
use crate::module::{Event, ModuleError};
use crate::settings::EncSettings;

/// A source frame waiting in the look-ahead FIFO, with the QP table it was
/// analyzed with.
pub(super) struct FifoEntry {
    source: Arc<HwBuffer>,
    qp_table: Option<Arc<HwBuffer>>,
}

enum PassTask {
    /// A frame was analyzed.
    Push(FifoEntry),
    /// The analysis channel reached the end of the stream.
    Eos,
    Stop,
}

pub(super) struct PassEncoder {
    index: usize,
    channel: Mutex<Option<Arc<dyn EncodeChannel>>>,
    /// QP table attached to the next frame submitted.
    next_qp: Mutex<Option<Arc<HwBuffer>>>,
    fifo: Arc<Mutex<VecDeque<FifoEntry>>>,
    tasks: Mutex<Option<mpsc::Sender<PassTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    module: Weak<EncInner>,
}

impl PassEncoder {
    /// Creates the channel of pass `index`. Analysis passes are given their
    /// internal stream buffers right away, but their worker only starts with
    /// `start_worker`.
    pub(super) fn new(
        index: usize,
        settings: &EncSettings,
        device: &Arc<dyn Device>,
        module: Weak<EncInner>,
    ) -> Result<Arc<Self>, ModuleError> {
        let last = index + 1 == settings.passes();
        let pass = Arc::new(PassEncoder {
            index,
            channel: Default::default(),
            next_qp: Default::default(),
            fifo: Default::default(),
            tasks: Default::default(),
            worker: Default::default(),
            module: module.clone(),
        });

        let on_complete: EncodeCallback = if last {
            Box::new(move |completion| {
                if let Some(inner) = module.upgrade() {
                    inner.end_encoding(completion);
                }
            })
        } else {
            let pass = Arc::downgrade(&pass);
            Box::new(move |completion| {
                if let Some(pass) = pass.upgrade() {
                    pass.on_analyzed(completion);
                }
            })
        };
        let config = EncChannelConfig::from_settings(settings, index);
        let channel: Arc<dyn EncodeChannel> = Arc::from(device.create_encoder(config, on_complete)?);

        if !last {
            // One more than the window, so the channel never waits for the
            // FIFO to release a stream buffer.
            let allocator = device.allocator();
            let size = settings.buffer_sizes().output;
            for _ in 0..=settings.lookahead_window() {
                let stream = HwBuffer::allocate(&allocator, size).map_err(ModuleError::from);
                if let Err(e) = stream.and_then(|s| Ok(channel.put_stream_buffer(s)?)) {
                    channel.destroy();
                    return Err(e);
                }
            }
        }

        *pass.channel.lock().unwrap() = Some(channel);
        debug!("Encoder: pass {} created", index);
        Ok(pass)
    }

    pub(super) fn index(&self) -> usize {
        self.index
    }

    fn channel(&self) -> Result<Arc<dyn EncodeChannel>, HwError> {
        self.channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(HwError::BadParameter)
    }

    /// Starts forwarding analyzed frames to `next`, `window` at a time.
    pub(super) fn start_worker(
        &self,
        next: Arc<PassEncoder>,
        window: usize,
        manager: Box<dyn TwoPassManager>,
    ) -> Result<(), ModuleError> {
        let (sender, receiver) = mpsc::channel();
        let worker = FifoWorker {
            fifo: Arc::clone(&self.fifo),
            next,
            window: window.max(1),
            manager,
            receiver,
            module: self.module.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("lookahead {}", self.index))
            .spawn(move || worker.run())
            .map_err(|e| {
                error!("Encoder: cannot spawn look-ahead worker: {}", e);
                ModuleError::Hardware(ErrorCode::ResourceUnavailable)
            })?;
        *self.tasks.lock().unwrap() = Some(sender);
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Queues `source` for encoding, `None` marking the end of the stream.
    /// A QP table given here replaces the pending one; frames take the
    /// pending table with them.
    pub(super) fn submit(
        &self,
        source: Option<Arc<HwBuffer>>,
        qp_table: Option<Arc<HwBuffer>>,
    ) -> Result<(), HwError> {
        let channel = self.channel()?;
        let qp_table = {
            let mut next = self.next_qp.lock().unwrap();
            if qp_table.is_some() {
                *next = qp_table;
            }
            match source {
                Some(_) => next.take(),
                None => None,
            }
        };
        channel.process(source, qp_table)
    }

    /// Sets the QP table of the next frame submitted. The previous one, if
    /// still pending, is dropped.
    pub(super) fn set_qp_table(&self, qp_table: Arc<HwBuffer>) {
        if let Some(previous) = self.next_qp.lock().unwrap().replace(qp_table) {
            trace!("Encoder: QP table {} replaced", previous.id());
        }
    }

    /// Gives the channel a buffer to write encoded data into.
    pub(super) fn put_stream_buffer(&self, stream: Arc<HwBuffer>) -> Result<(), HwError> {
        self.channel()?.put_stream_buffer(stream)
    }

    pub(super) fn apply(&self, command: DynamicCommand) -> Result<(), HwError> {
        self.channel()?.apply(command)
    }

    fn report(&self, event: Event) {
        if let Some(inner) = self.module.upgrade() {
            inner.report(event);
        }
    }

    fn on_analyzed(&self, completion: EncodeCompletion) {
        let EncodeCompletion {
            stream,
            source,
            qp_table,
            error,
        } = completion;
        if let Some(code) = check_hw_error("Look-ahead", error) {
            self.report(Event::Error(code));
        }

        let analyzed = stream.is_some();
        if let Some(stream) = stream {
            // Only absent when the channel is being destroyed.
            if let Ok(channel) = self.channel() {
                if let Err(e) = channel.put_stream_buffer(stream) {
                    warn!("Encoder: pass {} cannot recycle stream buffer: {:?}", self.index, e);
                }
            }
        }

        match source {
            Some(source) if analyzed => self.send(PassTask::Push(FifoEntry { source, qp_table })),
            Some(source) => {
                if let Some(inner) = self.module.upgrade() {
                    inner.return_source(&source);
                }
            }
            None if !analyzed => self.send(PassTask::Eos),
            None => (),
        }
    }

    fn send(&self, task: PassTask) {
        let unsent = match self.tasks.lock().unwrap().as_ref() {
            Some(tasks) => tasks.send(task).err().map(|e| e.0),
            None => Some(task),
        };
        match unsent {
            Some(PassTask::Push(entry)) => {
                warn!("Encoder: pass {} is not forwarding frames", self.index);
                if let Some(inner) = self.module.upgrade() {
                    inner.return_source(&entry.source);
                }
            }
            Some(_) => warn!("Encoder: pass {} worker is gone", self.index),
            None => (),
        }
    }

    /// Destroys the channel. Buffers it owned come back through the
    /// completion callback before this returns.
    pub(super) fn destroy_channel(&self) {
        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.destroy();
        }
        self.next_qp.lock().unwrap().take();
        debug!("Encoder: pass {} destroyed", self.index);
    }

    /// Stops the worker and returns the frames left in the FIFO.
    pub(super) fn stop_worker(&self) -> Vec<Arc<HwBuffer>> {
        let tasks = self.tasks.lock().unwrap().take();
        if let Some(tasks) = tasks {
            let _ = tasks.send(PassTask::Stop);
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Encoder: pass {} worker panicked", self.index);
            }
        }
        let leftovers: Vec<_> = self
            .fifo
            .lock()
            .unwrap()
            .drain(..)
            .map(|e| e.source)
            .collect();
        if !leftovers.is_empty() {
            debug!(
                "Encoder: {} frames left in the look-ahead of pass {}",
                leftovers.len(),
                self.index
            );
        }
        leftovers
    }
}

struct FifoWorker {
    fifo: Arc<Mutex<VecDeque<FifoEntry>>>,
    next: Arc<PassEncoder>,
    window: usize,
    manager: Box<dyn TwoPassManager>,
    receiver: mpsc::Receiver<PassTask>,
    module: Weak<EncInner>,
}

impl FifoWorker {
    fn run(mut self) {
        while let Ok(task) = self.receiver.recv() {
            match task {
                PassTask::Push(entry) => {
                    let stats = entry.source.meta().lookahead.unwrap_or_default();
                    self.manager.add_frame(&stats);
                    self.fifo.lock().unwrap().push_back(entry);
                    self.empty_fifo(false);
                }
                PassTask::Eos => self.empty_fifo(true),
                PassTask::Stop => break,
            }
        }
        trace!("Encoder: look-ahead worker for pass {} done", self.next.index() - 1);
    }

    /// Pops the oldest frame if the window is full, or if the stream ended.
    fn pop(&mut self, eos: bool) -> Option<(FifoEntry, PassHints)> {
        let mut fifo = self.fifo.lock().unwrap();
        if fifo.len() < self.window && !(eos && !fifo.is_empty()) {
            return None;
        }
        let window: Vec<LookAheadMeta> = fifo
            .iter()
            .map(|e| e.source.meta().lookahead.unwrap_or_default())
            .collect();
        let hints = self.manager.hints(&window);
        fifo.pop_front().map(|entry| (entry, hints))
    }

    fn empty_fifo(&mut self, eos: bool) {
        while let Some((entry, hints)) = self.pop(eos) {
            self.forward(entry, hints);
        }
        if eos {
            debug!("Encoder: forwarding end of stream to pass {}", self.next.index());
            if let Err(e) = self.next.submit(None, None) {
                error!("Encoder: cannot forward end of stream: {:?}", e);
            }
            self.manager.flush();
        }
    }

    fn forward(&self, entry: FifoEntry, hints: PassHints) {
        let FifoEntry { source, qp_table } = entry;
        trace!("Encoder: forwarding frame {} with {:?}", source.id(), hints);
        source.meta().hints = Some(hints);
        if let Err(e) = self.next.submit(Some(Arc::clone(&source)), qp_table) {
            error!("Encoder: cannot forward frame {}: {:?}", source.id(), e);
            if let Some(inner) = self.module.upgrade() {
                inner.report(Event::Error(ErrorCode::from(e)));
                inner.return_source(&source);
            }
        }
    }
}
