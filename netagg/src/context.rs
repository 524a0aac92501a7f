//! The engine API: lifecycle, job submission, and the capability handle
//! worker threads operate through.

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{NetaggError, Result};
use crate::job::{Job, JobHandle, JobSlice, JobStatus};
use crate::scheduler::{self, Scheduler};
use crate::signals;
use crate::stats::{Stats, StatsSnapshot};
use crate::tensor::Tensor;
use crate::types::{JobId, ReduceOp, WorkerTid};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Lifecycle of the engine. States advance strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ContextState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ContextState::Created,
            1 => ContextState::Starting,
            2 => ContextState::Running,
            3 => ContextState::Stopping,
            _ => ContextState::Stopped,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ContextState::Created => "Created",
            ContextState::Starting => "Starting",
            ContextState::Running => "Running",
            ContextState::Stopping => "Stopping",
            ContextState::Stopped => "Stopped",
        }
    }
}

pub(crate) struct ContextInner {
    state: AtomicU8,
    config: Config,
    stats: Stats,
    scheduler: Arc<dyn Scheduler>,
    /// Jobs submitted but not yet terminal, for wait_for_all_jobs and for
    /// failing everything at stop.
    live_jobs: Mutex<HashMap<JobId, Arc<Job>>>,
    all_jobs_done: Condvar,
    backend: Mutex<Option<Backend>>,
}

impl ContextInner {
    fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn stop(&self) {
        // Only the transition Running → Stopping proceeds; concurrent or
        // repeated stops are no-ops.
        if self
            .state
            .compare_exchange(
                ContextState::Running as u8,
                ContextState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(state = self.state().name(), "stop is a no-op in this state");
            return;
        }
        tracing::info!("stopping netagg context");

        // Wake threads parked in the scheduler and drop queued jobs.
        self.scheduler.stop();

        // Every job that has not completed fails now, including ones
        // whose slices were mid-flight.
        {
            let mut live = self.live_jobs.lock().expect("live jobs mutex poisoned");
            for (_, job) in live.drain() {
                job.set_status(JobStatus::Failed);
            }
        }
        self.all_jobs_done.notify_all();

        // Worker threads observe Stopping and exit their loops.
        if let Some(backend) = self
            .backend
            .lock()
            .expect("backend mutex poisoned")
            .take()
        {
            backend.shutdown();
        }

        self.stats.log();
        self.state
            .store(ContextState::Stopped as u8, Ordering::Release);
        tracing::info!("netagg context stopped");
    }
}

/// The engine. Create one with [`Context::start`], submit jobs, and stop
/// it when done.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Validate the configuration, set up the scheduler and the selected
    /// backend, and launch worker threads.
    pub fn start(mut config: Config) -> Result<Context> {
        tracing::info!("starting netagg context");
        config.validate()?;

        let stats = Stats::new(config.general.num_worker_threads);
        let sched = scheduler::create(&config);

        let inner = Arc::new(ContextInner {
            state: AtomicU8::new(ContextState::Starting as u8),
            config,
            stats,
            scheduler: sched,
            live_jobs: Mutex::new(HashMap::new()),
            all_jobs_done: Condvar::new(),
            backend: Mutex::new(None),
        });

        // Workers must observe Running or they would exit immediately,
        // and they must inherit the blocked signal mask.
        signals::block_shutdown_signals();
        inner
            .state
            .store(ContextState::Running as u8, Ordering::Release);

        let backend = match Backend::start(WorkerHandle {
            inner: Arc::clone(&inner),
        }) {
            Ok(backend) => backend,
            Err(e) => {
                inner.scheduler.stop();
                inner
                    .state
                    .store(ContextState::Stopped as u8, Ordering::Release);
                return Err(e);
            }
        };
        *inner.backend.lock().expect("backend mutex poisoned") = Some(backend);

        signals::register_for_shutdown(Arc::downgrade(&inner));

        tracing::info!("netagg context started");
        Ok(Context { inner })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.inner.state()
    }

    /// Submit an AllReduce and return immediately.
    ///
    /// The reduced result lands in the tensor's output buffer once the
    /// returned handle reports `Finished`.
    pub fn all_reduce_async(&self, tensor: Tensor, op: ReduceOp) -> Result<JobHandle> {
        let state = self.inner.state();
        if state != ContextState::Running {
            return Err(NetaggError::State {
                operation: "all_reduce_async",
                required: "Running",
                actual: state.name(),
            });
        }

        let job = Job::new(tensor, op);
        self.inner
            .live_jobs
            .lock()
            .expect("live jobs mutex poisoned")
            .insert(job.id, Arc::clone(&job));
        self.inner.stats.inc_jobs_submitted(tensor.numel);
        self.inner.scheduler.enqueue(Arc::clone(&job));
        Ok(job)
    }

    /// Submit an AllReduce and block until it completes or fails.
    pub fn all_reduce(&self, tensor: Tensor, op: ReduceOp) -> Result<JobHandle> {
        let job = self.all_reduce_async(tensor, op)?;
        job.wait_to_complete();
        Ok(job)
    }

    /// Block until every submitted job has reached a terminal state.
    pub fn wait_for_all_jobs(&self) -> Result<()> {
        let state = self.inner.state();
        if state != ContextState::Running {
            return Err(NetaggError::State {
                operation: "wait_for_all_jobs",
                required: "Running",
                actual: state.name(),
            });
        }
        let mut live = self
            .inner
            .live_jobs
            .lock()
            .expect("live jobs mutex poisoned");
        while !live.is_empty() && self.inner.state() == ContextState::Running {
            live = self
                .inner
                .all_jobs_done
                .wait(live)
                .expect("live jobs mutex poisoned");
        }
        Ok(())
    }

    /// Stop the engine: fail queued and in-flight jobs, wake all waiters,
    /// and join worker threads. Safe to call more than once.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// A copy of the active configuration (post-validation).
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.inner.state() == ContextState::Running {
            tracing::warn!("context dropped without stop(); stopping now");
            self.inner.stop();
        }
    }
}

/// The narrow capability record worker threads get instead of the whole
/// context: a liveness probe, the slice fetch/completion pair, and the
/// stats sink. Nothing else of the engine is reachable from a transport.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<ContextInner>,
}

impl WorkerHandle {
    /// Worker loops poll this every iteration and exit when it turns
    /// false.
    pub fn is_running(&self) -> bool {
        self.inner.state() == ContextState::Running
    }

    /// Blocking fetch of this thread's slice of the next job. `None`
    /// means the engine is shutting down.
    pub fn get_job_slice(&self, tid: WorkerTid) -> Option<JobSlice> {
        if !self.is_running() {
            return None;
        }
        self.inner.scheduler.get_job_slice(tid)
    }

    /// Report a completed slice. When it was the job's last one, the job
    /// finishes and wait_for_all_jobs waiters are woken as appropriate.
    pub fn notify_slice_done(&self, tid: WorkerTid, slice: &JobSlice) {
        if !self.inner.scheduler.notify_slice_done(tid, slice) {
            return;
        }
        slice.job.set_status(JobStatus::Finished);
        self.inner.stats.inc_jobs_finished();

        let mut live = self
            .inner
            .live_jobs
            .lock()
            .expect("live jobs mutex poisoned");
        live.remove(&slice.job.id);
        let drained = live.is_empty();
        drop(live);
        tracing::debug!(job_id = slice.job.id, "job finished");
        if drained {
            self.inner.all_jobs_done.notify_all();
        }
    }

    /// Counter sink for per-slice statistics.
    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn dummy_context(threads: u16) -> Context {
        let mut config = Config::default();
        config.general.backend = BackendKind::Dummy;
        config.general.num_worker_threads = threads;
        Context::start(config).expect("context start")
    }

    #[test]
    fn test_start_reaches_running() {
        let ctx = dummy_context(1);
        assert_eq!(ctx.state(), ContextState::Running);
        ctx.stop();
        assert_eq!(ctx.state(), ContextState::Stopped);
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let mut config = Config::default();
        config.general.packet_numel = 48;
        assert!(matches!(
            Context::start(config),
            Err(NetaggError::Config(_))
        ));
    }

    #[test]
    fn test_allreduce_through_dummy() {
        let ctx = dummy_context(2);
        let input: Vec<i32> = (0..100).collect();
        let mut output = vec![0i32; 100];
        let job = ctx
            .all_reduce(Tensor::from_i32(&input, &mut output), ReduceOp::Sum)
            .unwrap();
        assert_eq!(job.status(), JobStatus::Finished);
        ctx.stop();
        assert_eq!(output, input); // one worker: sum of one contribution
    }

    #[test]
    fn test_wait_rejected_after_stop() {
        let ctx = dummy_context(1);
        ctx.stop();
        assert!(matches!(
            ctx.wait_for_all_jobs(),
            Err(NetaggError::State { .. })
        ));
    }

    #[test]
    fn test_drop_without_stop_stops() {
        let ctx = dummy_context(1);
        let inner = Arc::clone(&ctx.inner);
        drop(ctx);
        assert_eq!(inner.state(), ContextState::Stopped);
    }

    #[test]
    fn test_stats_snapshot_counts_submissions() {
        let ctx = dummy_context(1);
        let input = vec![0i32; 32];
        let mut output = vec![0i32; 32];
        ctx.all_reduce(Tensor::from_i32(&input, &mut output), ReduceOp::Sum)
            .unwrap();
        let snap = ctx.stats();
        assert_eq!(snap.jobs_submitted, 1);
        assert_eq!(snap.jobs_finished, 1);
        ctx.stop();
    }
}
