//! Background merge workers.
//!
//! Jobs are page ids sent over a crossbeam channel. A page id already
//! queued is not queued again; it leaves the pending set when a worker picks
//! it up, so updates arriving during a merge can queue the next one.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::page::PageId;
use crate::storage::RecordDirectory;
use crate::version::ChainSplicer;

use super::merge_stack;

#[derive(Default)]
struct JobState {
    pending: HashSet<PageId>,
    /// Queued or running jobs
    outstanding: usize,
}

#[derive(Default)]
struct Shared {
    jobs: Mutex<JobState>,
    idle: Condvar,
}

pub struct MergeScheduler {
    sender: Mutex<Option<Sender<PageId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl MergeScheduler {
    /// Spawn `workers` merge threads for one table
    pub fn start(
        directory: Arc<RecordDirectory>,
        splicer: Arc<ChainSplicer>,
        workers: usize,
    ) -> Self {
        let (sender, receiver) = unbounded::<PageId>();
        let shared = Arc::new(Shared::default());

        let handles = (0..workers.max(1))
            .map(|n| {
                let receiver = receiver.clone();
                let directory = Arc::clone(&directory);
                let splicer = Arc::clone(&splicer);
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("lstore-merge-{}", n))
                    .spawn(move || run_worker(receiver, directory, splicer, shared))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn merge worker");
                    None
                }
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            shared,
        }
    }

    /// Queue a merge of `page_id`. Returns false if one is already pending
    /// or the scheduler is shut down.
    pub fn schedule(&self, page_id: PageId) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };

        let mut jobs = self.shared.jobs.lock();
        if !jobs.pending.insert(page_id) {
            return false;
        }
        if sender.send(page_id).is_err() {
            jobs.pending.remove(&page_id);
            return false;
        }
        jobs.outstanding += 1;
        tracing::trace!(page_id, "merge queued");
        true
    }

    /// Number of queued or running jobs
    pub fn outstanding(&self) -> usize {
        self.shared.jobs.lock().outstanding
    }

    /// Block until every queued merge has finished
    pub fn wait_idle(&self) {
        let mut jobs = self.shared.jobs.lock();
        while jobs.outstanding > 0 {
            self.shared.idle.wait(&mut jobs);
        }
    }

    /// Finish queued merges and stop the workers
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("merge worker panicked");
            }
        }
        tracing::debug!("merge workers stopped");
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    receiver: Receiver<PageId>,
    directory: Arc<RecordDirectory>,
    splicer: Arc<ChainSplicer>,
    shared: Arc<Shared>,
) {
    for page_id in receiver.iter() {
        shared.jobs.lock().pending.remove(&page_id);

        if let Err(e) = merge_stack(&directory, &splicer, page_id) {
            tracing::warn!(page_id, error = %e, "background merge failed");
        }

        let mut jobs = shared.jobs.lock();
        jobs.outstanding -= 1;
        if jobs.outstanding == 0 {
            shared.idle.notify_all();
        }
    }
}
