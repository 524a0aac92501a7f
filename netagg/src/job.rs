use crate::tensor::Tensor;
use crate::types::{JobId, Numel, ReduceOp};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Lifecycle of a job. Status only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum JobStatus {
    /// Just constructed, not yet handed to the scheduler.
    Init = 0,
    /// Sitting in the scheduler's queue.
    Queued = 1,
    /// Worker threads are processing slices of it.
    Running = 2,
    /// All slices completed successfully.
    Finished = 3,
    /// Dropped because the context stopped before it completed.
    Failed = 4,
}

impl JobStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobStatus::Init,
            1 => JobStatus::Queued,
            2 => JobStatus::Running,
            3 => JobStatus::Finished,
            _ => JobStatus::Failed,
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Init => "init",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

/// One submitted collective operation.
///
/// Created by the context at submission, sliced by the scheduler, and
/// completed (or failed) when the last slice reports in. Submitters hold
/// it through a [`JobHandle`].
pub struct Job {
    /// Monotonically assigned unique id.
    pub id: JobId,
    /// The tensor to reduce.
    pub tensor: Tensor,
    /// Reduction operation.
    pub op: ReduceOp,
    status: AtomicU8,
    done: Mutex<()>,
    done_event: Condvar,
}

impl Job {
    pub(crate) fn new(tensor: Tensor, op: ReduceOp) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            tensor,
            op,
            status: AtomicU8::new(JobStatus::Init as u8),
            done: Mutex::new(()),
            done_event: Condvar::new(),
        })
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Advance the status. Moving backwards is ignored with a warning;
    /// reaching a terminal state wakes every waiter.
    pub(crate) fn set_status(&self, status: JobStatus) {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if status as u8 == current {
                return;
            }
            if (status as u8) < current {
                tracing::warn!(
                    job_id = self.id,
                    from = %JobStatus::from_u8(current),
                    to = %status,
                    "ignoring regressing job status transition"
                );
                return;
            }
            match self.status.compare_exchange(
                current,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if status.is_terminal() {
            let _guard = self.done.lock().expect("job mutex poisoned");
            self.done_event.notify_all();
        }
    }

    /// Block until the job reaches a terminal state.
    pub fn wait_to_complete(&self) {
        let mut guard = self.done.lock().expect("job mutex poisoned");
        while !self.status().is_terminal() {
            guard = self.done_event.wait(guard).expect("job mutex poisoned");
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("numel", &self.tensor.numel)
            .field("dtype", &self.tensor.dtype)
            .field("op", &self.op)
            .field("status", &self.status())
            .finish()
    }
}

/// The submitter's view of a job.
pub type JobHandle = Arc<Job>;

/// A worker thread's share of a job: the job handle plus the slice of the
/// tensor assigned to this thread (pointers already offset).
#[derive(Clone)]
pub struct JobSlice {
    pub job: Arc<Job>,
    pub slice: Tensor,
    /// Element offset of this slice within the full tensor.
    pub offset: Numel,
}
