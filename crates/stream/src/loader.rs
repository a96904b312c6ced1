//! Content loading boundary.
//!
//! Loads run off the frame thread. Their results come back through a
//! completion queue that the scene drains once per frame, so cache and
//! runtime state are only ever mutated from the frame thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tilestream_common::{ContentRef, TileKey};

/// Why a tile's content could not be produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("failed to fetch {content}: {reason}")]
    Transport { content: ContentRef, reason: String },
    #[error("failed to decode {content}: {reason}")]
    Decode { content: ContentRef, reason: String },
    #[error("loader panicked while loading {content}")]
    Panicked { content: ContentRef },
    #[error("load workers have shut down")]
    WorkerGone,
}

/// One dispatched load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadJob {
    pub key: TileKey,
    pub content: ContentRef,
    pub priority: f64,
}

/// Result of a load, handed back to the frame thread.
#[derive(Debug)]
pub struct LoadCompletion<C> {
    pub key: TileKey,
    pub result: Result<C, LoadError>,
    /// Cache cost of the content; 1 unless the loader says otherwise.
    pub cost: usize,
}

/// Turns a content reference into decoded content. Called on worker threads.
pub trait ContentLoader: Send + Sync + 'static {
    type Content: Send + 'static;

    fn load(&self, job: &LoadJob) -> Result<Self::Content, LoadError>;

    fn cost(&self, _content: &Self::Content) -> usize {
        1
    }
}

/// Where dispatched loads go and where their completions come back from.
pub trait LoadQueue<C> {
    fn submit(&mut self, job: LoadJob);

    /// Completions that arrived since the last poll. Never blocks.
    fn poll_completed(&mut self) -> Vec<LoadCompletion<C>>;
}

fn run_job<L: ContentLoader>(loader: &L, job: &LoadJob) -> LoadCompletion<L::Content> {
    let result = catch_unwind(AssertUnwindSafe(|| loader.load(job))).unwrap_or_else(|_| {
        Err(LoadError::Panicked {
            content: job.content.clone(),
        })
    });
    let cost = result.as_ref().map_or(1, |c| loader.cost(c).max(1));
    LoadCompletion {
        key: job.key,
        result,
        cost,
    }
}

/// Fixed set of worker threads fed through a job channel.
pub struct WorkerPool<L: ContentLoader> {
    job_sender: Option<Sender<LoadJob>>,
    completion_receiver: Receiver<LoadCompletion<L::Content>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    undeliverable: Vec<LoadCompletion<L::Content>>,
}

impl<L: ContentLoader> WorkerPool<L> {
    pub fn new(loader: Arc<L>, thread_count: usize) -> std::io::Result<Self> {
        let (job_sender, job_receiver) = unbounded::<LoadJob>();
        let (completion_sender, completion_receiver) = unbounded();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count.max(1) {
            let jobs = job_receiver.clone();
            let done = completion_sender.clone();
            let loader = Arc::clone(&loader);
            let in_flight = Arc::clone(&in_flight);
            let handle = std::thread::Builder::new()
                .name(format!("tile-load-{i}"))
                .spawn(move || {
                    while let Ok(job) = jobs.recv() {
                        let completion = run_job(loader.as_ref(), &job);
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                        if done.send(completion).is_err() {
                            break;
                        }
                    }
                })?;
            workers.push(handle);
        }
        tracing::debug!(threads = workers.len(), "tile load workers started");

        Ok(Self {
            job_sender: Some(job_sender),
            completion_receiver,
            workers,
            in_flight,
            undeliverable: Vec::new(),
        })
    }

    /// Jobs submitted but not yet finished by a worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Block until at least one completion arrives or `timeout` passes, then
    /// drain everything available.
    pub fn wait_completed(&mut self, timeout: Duration) -> Vec<LoadCompletion<L::Content>> {
        let mut out = std::mem::take(&mut self.undeliverable);
        if out.is_empty() {
            match self.completion_receiver.recv_timeout(timeout) {
                Ok(c) => out.push(c),
                Err(_) => return out,
            }
        }
        out.extend(self.completion_receiver.try_iter());
        out
    }
}

impl<L: ContentLoader> LoadQueue<L::Content> for WorkerPool<L> {
    fn submit(&mut self, job: LoadJob) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let sent = match &self.job_sender {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        };
        if let Err(job) = sent {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(key = %job.key, "load workers gone, failing request");
            self.undeliverable.push(LoadCompletion {
                key: job.key,
                result: Err(LoadError::WorkerGone),
                cost: 1,
            });
        }
    }

    fn poll_completed(&mut self) -> Vec<LoadCompletion<L::Content>> {
        let mut out = std::mem::take(&mut self.undeliverable);
        out.extend(self.completion_receiver.try_iter());
        out
    }
}

impl<L: ContentLoader> Drop for WorkerPool<L> {
    fn drop(&mut self) {
        // Closing the job channel ends every worker loop.
        self.job_sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Runs each load synchronously on submit and releases the result on the
/// next poll, so results still show up a frame later. Deterministic.
pub struct InlineLoads<L: ContentLoader> {
    loader: L,
    ready: Vec<LoadCompletion<L::Content>>,
    submitted: usize,
}

impl<L: ContentLoader> InlineLoads<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            ready: Vec::new(),
            submitted: 0,
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Total jobs ever submitted.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Completions waiting for the next poll.
    pub fn waiting(&self) -> usize {
        self.ready.len()
    }
}

impl<L: ContentLoader> LoadQueue<L::Content> for InlineLoads<L> {
    fn submit(&mut self, job: LoadJob) {
        self.submitted += 1;
        let completion = run_job(&self.loader, &job);
        self.ready.push(completion);
    }

    fn poll_completed(&mut self) -> Vec<LoadCompletion<L::Content>> {
        std::mem::take(&mut self.ready)
    }
}
