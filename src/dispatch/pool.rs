//! Worker Pool
//!
//! Fixed set of OS threads pulling jobs from a crossbeam channel. Each job
//! runs exactly once and its completion (outcome plus the descriptor
//! itself) is sent back to the event loop.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::config::Config;
use crate::error::{AtlasError, EngineError, ErrorKind, Result};

use super::request::{Descriptor, Reply};
use super::RequestId;

pub(crate) struct Job {
    pub(crate) id: RequestId,
    pub(crate) descriptor: Descriptor,
}

pub(crate) struct Completion {
    pub(crate) id: RequestId,
    pub(crate) outcome: Result<Reply>,
    pub(crate) descriptor: Descriptor,
}

pub(crate) struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_threads` workers reporting to `completions`
    pub(crate) fn spawn(config: &Config, completions: Sender<Completion>) -> Result<Self> {
        let (jobs, queue) = channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(config.worker_threads);
        for n in 0..config.worker_threads {
            let queue = queue.clone();
            let completions = completions.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, n))
                .spawn(move || work(queue, completions))
                .map_err(|e| AtlasError::Engine(e.into()))?;
            workers.push(handle);
        }

        tracing::debug!(workers = workers.len(), "worker pool started");
        Ok(Self {
            jobs: Some(jobs),
            workers,
        })
    }

    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let jobs = self.jobs.as_ref().ok_or(AtlasError::Disconnected)?;
        jobs.send(job).map_err(|_| AtlasError::Disconnected)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends each worker's loop
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn work(queue: Receiver<Job>, completions: Sender<Completion>) {
    for Job { id, descriptor } in queue.iter() {
        tracing::trace!(id, op = descriptor.name(), "executing");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| descriptor.execute()))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::warn!(id, op = descriptor.name(), %message, "engine panicked");
                Err(EngineError::new(ErrorKind::SystemError, message).into())
            });

        if let Err(e) = &outcome {
            tracing::debug!(id, op = descriptor.name(), error = %e, "request failed");
        }

        let completion = Completion {
            id,
            outcome,
            descriptor,
        };
        if completions.send(completion).is_err() {
            // Event loop is gone; nothing left to deliver to
            break;
        }
    }
}
