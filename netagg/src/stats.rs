//! Engine statistics.
//!
//! Worker threads accumulate counters in locals for the duration of a job
//! slice and flush them here once per slice, so the hot loops never touch
//! the mutex.

use crate::types::WorkerTid;
use std::sync::Mutex;

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_finished: u64,
    /// Element counts of every submitted job, in submission order.
    pub submitted_numel: Vec<u64>,
    /// Per-worker-thread counters, indexed by thread id.
    pub packets_sent: Vec<u64>,
    pub correct_packets_received: Vec<u64>,
    pub wrong_packets_received: Vec<u64>,
    pub timeouts: Vec<u64>,
}

#[derive(Debug, Default)]
struct StatsInner {
    jobs_submitted: u64,
    jobs_finished: u64,
    submitted_numel: Vec<u64>,
    packets_sent: Vec<u64>,
    correct_packets_received: Vec<u64>,
    wrong_packets_received: Vec<u64>,
    timeouts: Vec<u64>,
}

/// All engine counters behind one mutex.
#[derive(Debug)]
pub struct Stats {
    inner: Mutex<StatsInner>,
}

impl Stats {
    pub fn new(num_worker_threads: WorkerTid) -> Self {
        let n = num_worker_threads as usize;
        Self {
            inner: Mutex::new(StatsInner {
                packets_sent: vec![0; n],
                correct_packets_received: vec![0; n],
                wrong_packets_received: vec![0; n],
                timeouts: vec![0; n],
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().expect("stats mutex poisoned")
    }

    pub fn inc_jobs_submitted(&self, numel: u64) {
        let mut s = self.lock();
        s.jobs_submitted += 1;
        s.submitted_numel.push(numel);
    }

    pub fn inc_jobs_finished(&self) {
        self.lock().jobs_finished += 1;
    }

    pub fn add_packets_sent(&self, tid: WorkerTid, n: u64) {
        self.lock().packets_sent[tid as usize] += n;
    }

    pub fn add_correct_packets_received(&self, tid: WorkerTid, n: u64) {
        self.lock().correct_packets_received[tid as usize] += n;
    }

    pub fn add_wrong_packets_received(&self, tid: WorkerTid, n: u64) {
        self.lock().wrong_packets_received[tid as usize] += n;
    }

    pub fn add_timeouts(&self, tid: WorkerTid, n: u64) {
        self.lock().timeouts[tid as usize] += n;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let s = self.lock();
        StatsSnapshot {
            jobs_submitted: s.jobs_submitted,
            jobs_finished: s.jobs_finished,
            submitted_numel: s.submitted_numel.clone(),
            packets_sent: s.packets_sent.clone(),
            correct_packets_received: s.correct_packets_received.clone(),
            wrong_packets_received: s.wrong_packets_received.clone(),
            timeouts: s.timeouts.clone(),
        }
    }

    /// Clear every counter.
    pub fn reset(&self) {
        let mut s = self.lock();
        let n = s.packets_sent.len();
        *s = StatsInner {
            packets_sent: vec![0; n],
            correct_packets_received: vec![0; n],
            wrong_packets_received: vec![0; n],
            timeouts: vec![0; n],
            ..Default::default()
        };
    }

    /// Emit a summary of everything counted so far.
    pub fn log(&self) {
        let s = self.lock();
        tracing::info!(
            jobs_submitted = s.jobs_submitted,
            jobs_finished = s.jobs_finished,
            job_numel = %describe(&s.submitted_numel),
            "job statistics"
        );
        tracing::info!(
            sent = ?s.packets_sent,
            correct = ?s.correct_packets_received,
            wrong = ?s.wrong_packets_received,
            timeouts = ?s.timeouts,
            "per-thread packet statistics"
        );
    }
}

/// One-line distribution summary: sum, mean, min, max, median, stdev.
fn describe(list: &[u64]) -> String {
    if list.is_empty() {
        return "n=0".to_string();
    }
    let n = list.len();
    let sum: u64 = list.iter().sum();
    let mean = sum as f64 / n as f64;
    let min = *list.iter().min().expect("non-empty");
    let max = *list.iter().max().expect("non-empty");

    let mut sorted = list.to_vec();
    sorted.sort_unstable();
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    } else {
        sorted[n / 2] as f64
    };

    let variance = list
        .iter()
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    let stdev = variance.sqrt();

    format!("n={n} sum={sum} mean={mean:.2} min={min} max={max} median={median:.1} stdev={stdev:.2}")
}
