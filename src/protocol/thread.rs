use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use log::{debug, error};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads, each serving one connection at a time.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    busy: Arc<AtomicUsize>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let size = size.max(1);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let busy = Arc::new(AtomicUsize::new(0));

        for i in 0..size {
            workers.push(Worker::new(
                format!("{name}-{i}"),
                i,
                Arc::clone(&receiver),
                Arc::clone(&busy),
            )?);
        }

        Ok(Self {
            workers,
            sender: Some(sender),
            busy,
        })
    }

    /// Queues `f` for the next idle worker.
    ///
    /// Returns `false` when the pool is shutting down and the job was dropped.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };

        self.busy.fetch_add(1, Ordering::SeqCst);
        if sender.send(Box::new(f)).is_err() {
            self.busy.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs queued or running.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.busy() < self.size()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                error!("worker {} exited abnormally", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(
        name: String,
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
        busy: Arc<AtomicUsize>,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new().name(name).spawn(move || {
            loop {
                let msg = receiver
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
                match msg {
                    Ok(job) => {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("worker {id}: connection handler panicked");
                        }
                        busy.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        })?;

        Ok(Self { id, thread })
    }
}
