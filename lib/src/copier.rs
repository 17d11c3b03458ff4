//! Asynchronous memory copies.
//!
//! `BufferCopier` owns a worker thread that copies between buffer mappings in
//! submission order, so callers on latency-sensitive threads (e.g. the codec
//! SDK callbacks) do not have to wait for large copies.
use std::io;
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, trace};

use crate::memory::Mapping;

/// Called from the copier thread once a copy is done.
pub type CopyDone = Box<dyn FnOnce(io::Result<()>) + Send>;

pub struct CopyJob {
    pub source: Mapping,
    pub source_offset: usize,
    pub destination: Mapping,
    pub destination_offset: usize,
    pub len: usize,
    pub on_done: CopyDone,
}

impl CopyJob {
    fn execute(&self) -> io::Result<()> {
        let data = self.source.to_vec(self.source_offset, self.len)?;
        self.destination.write_at(self.destination_offset, &data)
    }
}

/// Number of jobs submitted but not completed yet.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    done: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn remove(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.done.notify_all();
        }
    }
}

pub struct BufferCopier {
    sender: Mutex<Option<mpsc::Sender<CopyJob>>>,
    pending: Arc<Pending>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BufferCopier {
    pub fn new(name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<CopyJob>();
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);

        let handle = thread::Builder::new()
            .name(format!("{} copier", name))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    let res = job.execute();
                    if let Err(e) = &res {
                        error!("Copy of {} bytes failed: {}", job.len, e);
                    } else {
                        trace!("Copied {} bytes", job.len);
                    }
                    (job.on_done)(res);
                    worker_pending.remove();
                }
            })?;

        Ok(BufferCopier {
            sender: Mutex::new(Some(sender)),
            pending,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues `job`. It is performed after all the jobs queued before it.
    pub fn copy(&self, job: CopyJob) -> io::Result<()> {
        let sender = self.sender.lock().unwrap();
        let Some(sender) = sender.as_ref() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        self.pending.add();
        sender.send(job).map_err(|_| {
            self.pending.remove();
            io::Error::from(io::ErrorKind::BrokenPipe)
        })
    }

    /// Blocks until all queued jobs are done and their `on_done` callbacks
    /// have returned. Must not be called from an `on_done` callback.
    pub fn flush(&self) {
        let mut count = self.pending.count.lock().unwrap();
        while *count > 0 {
            count = self.pending.done.wait(count).unwrap();
        }
    }
}

impl Drop for BufferCopier {
    fn drop(&mut self) {
        // Closing the channel makes the worker exit once the queue is empty.
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("Copier thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn memory(data: Vec<u8>) -> Mapping {
        Mapping::Memory(Arc::new(Mutex::new(data)))
    }

    #[test]
    fn copies_in_order() {
        let copier = BufferCopier::new("test").unwrap();
        let source = memory((0..64).collect());
        let destination = memory(vec![0; 64]);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = Arc::clone(&order);
            copier
                .copy(CopyJob {
                    source: source.clone(),
                    source_offset: i * 16,
                    destination: destination.clone(),
                    destination_offset: 48 - i * 16,
                    len: 16,
                    on_done: Box::new(move |res| {
                        res.unwrap();
                        order.lock().unwrap().push(i);
                    }),
                })
                .unwrap();
        }
        copier.flush();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        let copied = destination.to_vec(0, 64).unwrap();
        assert_eq!(&copied[48..], &(0..16).collect::<Vec<u8>>()[..]);
        assert_eq!(&copied[..16], &(48..64).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn errors_are_reported() {
        let copier = BufferCopier::new("test").unwrap();
        let failures = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&failures);
        copier
            .copy(CopyJob {
                source: memory(vec![0; 8]),
                source_offset: 0,
                destination: memory(vec![0; 4]),
                destination_offset: 0,
                len: 8,
                on_done: Box::new(move |res| {
                    if res.is_err() {
                        f.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            })
            .unwrap();
        copier.flush();
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // Nothing pending: returns immediately.
        copier.flush();
    }
}
