use super::{Barrier, Scheduler};
use crate::job::{Job, JobSlice, JobStatus};
use crate::types::{JobId, Numel, WorkerTid};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

/// First-in-first-out scheduler.
///
/// Worker threads rendezvous on a barrier before every pickup, so all of
/// them always work on the same job at the same time. That is what keeps
/// switch slots collision-free: slot ranges are disjoint per thread only
/// within a single job.
pub struct FifoScheduler {
    num_threads: WorkerTid,
    inner: Mutex<Inner>,
    job_submitted: Condvar,
    barrier: Barrier,
}

struct Inner {
    queue: VecDeque<Arc<Job>>,
    /// Slices not yet handed out, per queued job.
    undispatched: HashMap<JobId, u16>,
    /// Slices not yet completed, per live job.
    unfinished: HashMap<JobId, u16>,
    stopped: bool,
}

impl FifoScheduler {
    pub fn new(num_threads: WorkerTid) -> Self {
        Self {
            num_threads,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                undispatched: HashMap::new(),
                unfinished: HashMap::new(),
                stopped: false,
            }),
            job_submitted: Condvar::new(),
            barrier: Barrier::new(num_threads as usize),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler mutex poisoned")
    }

    /// Deterministic slice of `numel` elements for one worker thread:
    /// everyone gets ⌊numel / T⌋, the first `numel mod T` threads get one
    /// extra, offsets are cumulative.
    fn partition(numel: Numel, num_threads: WorkerTid, tid: WorkerTid) -> (Numel, Numel) {
        let t = num_threads as Numel;
        let tid = tid as Numel;
        let base = numel / t;
        let remainder = numel % t;
        if tid < remainder {
            let count = base + 1;
            (tid * count, count)
        } else {
            (tid * base + remainder, base)
        }
    }
}

impl Scheduler for FifoScheduler {
    fn enqueue(&self, job: Arc<Job>) {
        let mut inner = self.lock();
        job.set_status(JobStatus::Queued);
        inner.undispatched.insert(job.id, self.num_threads);
        inner.unfinished.insert(job.id, self.num_threads);
        tracing::debug!(job_id = job.id, numel = job.tensor.numel, "queued job");
        inner.queue.push_back(job);
        self.job_submitted.notify_all();
    }

    fn get_job_slice(&self, tid: WorkerTid) -> Option<JobSlice> {
        {
            let inner = self.lock();
            if inner.stopped {
                return None;
            }
        }

        // Converge with the other worker threads before touching the
        // queue, so every thread starts the same job together.
        if !self.barrier.wait() {
            return None;
        }

        let mut inner = self.lock();
        while !inner.stopped && inner.queue.is_empty() {
            inner = self
                .job_submitted
                .wait(inner)
                .expect("scheduler mutex poisoned");
        }
        if inner.stopped {
            return None;
        }

        let job = Arc::clone(inner.queue.front().expect("queue non-empty"));
        let remaining = inner
            .undispatched
            .get_mut(&job.id)
            .expect("job missing from dispatch map");
        *remaining -= 1;
        if *remaining == 0 {
            inner.queue.pop_front();
            inner.undispatched.remove(&job.id);
        }
        drop(inner);

        let (offset, count) = Self::partition(job.tensor.numel, self.num_threads, tid);
        let slice = job.tensor.subrange(offset, count);
        job.set_status(JobStatus::Running);
        tracing::debug!(job_id = job.id, tid, offset, count, "dispatched job slice");

        Some(JobSlice { job, slice, offset })
    }

    fn notify_slice_done(&self, tid: WorkerTid, slice: &JobSlice) -> bool {
        let mut inner = self.lock();
        if inner.stopped {
            return false;
        }
        let remaining = inner
            .unfinished
            .get_mut(&slice.job.id)
            .expect("job missing from completion map");
        *remaining -= 1;
        tracing::debug!(job_id = slice.job.id, tid, remaining = *remaining, "slice done");
        if *remaining == 0 {
            inner.unfinished.remove(&slice.job.id);
            true
        } else {
            false
        }
    }

    fn stop(&self) {
        {
            let mut inner = self.lock();
            inner.stopped = true;
            for job in inner.queue.drain(..) {
                job.set_status(JobStatus::Failed);
            }
            inner.undispatched.clear();
            inner.unfinished.clear();
        }
        self.job_submitted.notify_all();
        self.barrier.destroy();
    }
}
