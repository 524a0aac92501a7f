//! In-process backend that fakes the switch.
//!
//! No packets leave the host. Each worker thread pulls its slices and,
//! if `process_packets` is on, writes what a real aggregation of
//! `num_workers` identical contributions would produce. A configurable
//! simulated bandwidth turns the no-op into a realistic-duration sleep
//! so scheduling behavior can be studied without hardware.

use crate::context::WorkerHandle;
use crate::error::Result;
use crate::types::{DataType, WorkerTid};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct DummyBackend {
    threads: Vec<JoinHandle<()>>,
}

impl DummyBackend {
    pub(crate) fn start(handle: WorkerHandle) -> Result<Self> {
        let num_threads = handle.config().general.num_worker_threads;
        let threads = (0..num_threads)
            .map(|tid| {
                let handle = handle.clone();
                std::thread::Builder::new()
                    .name(format!("netagg-dummy-{tid}"))
                    .spawn(move || worker_loop(handle, tid))
                    .expect("spawning worker thread")
            })
            .collect();
        Ok(Self { threads })
    }

    pub(crate) fn shutdown(self) {
        for t in self.threads {
            let _ = t.join();
        }
    }
}

fn worker_loop(handle: WorkerHandle, tid: WorkerTid) {
    tracing::info!(tid, "dummy worker thread starting");
    let config = handle.config().clone();
    let num_workers = config.general.num_workers;

    while handle.is_running() {
        let Some(job_slice) = handle.get_job_slice(tid) else {
            continue;
        };
        tracing::debug!(tid, job_id = job_slice.job.id, numel = job_slice.slice.numel, "got slice");

        if job_slice.slice.numel == 0 || config.general.instant_job_completion {
            handle.notify_slice_done(tid, &job_slice);
            continue;
        }

        if config.dummy.bandwidth_mbps > 0.0 {
            let bits = job_slice.slice.size_in_bytes() as f64 * 8.0;
            let secs = bits / (config.dummy.bandwidth_mbps as f64 * 1e6);
            std::thread::sleep(Duration::from_secs_f64(secs));
        }

        if config.dummy.process_packets {
            // What the switch would have computed with num_workers
            // identical contributions.
            let n = job_slice.slice.numel as usize;
            match job_slice.slice.dtype {
                DataType::Int32 => {
                    let input = job_slice.slice.input_i32(0, n);
                    let output = job_slice.slice.output_i32(0, n);
                    for (out, &x) in output.iter_mut().zip(input) {
                        *out = x * num_workers as i32;
                    }
                }
                DataType::Float32 => {
                    let input = job_slice.slice.input_f32(0, n);
                    let output = job_slice.slice.output_f32(0, n);
                    for (out, &x) in output.iter_mut().zip(input) {
                        *out = x * num_workers as f32;
                    }
                }
            }
        }

        handle.notify_slice_done(tid, &job_slice);
    }
    tracing::info!(tid, "dummy worker thread exiting");
}
