//! netagg: an in-network AllReduce client engine.
//!
//! Worker nodes stream tensors to a programmable switch that sums the
//! contributions of all workers on the wire and streams the result back.
//! The engine partitions each job across worker threads, converts
//! floating-point data to an integer-quantized wire form, keeps a
//! pipelined window of packets bound to switch aggregator slots, and
//! recovers losses by per-slot retransmission.
//!
//! ```no_run
//! use netagg::{Config, Context, ReduceOp, Tensor};
//!
//! let mut config = Config::default();
//! config.general.backend = "udp".parse().unwrap();
//! config.udp.switch_ip = "10.0.0.1".to_string();
//!
//! let ctx = Context::start(config).unwrap();
//! let input = vec![1.0f32; 1 << 20];
//! let mut output = vec![0.0f32; 1 << 20];
//! let job = ctx
//!     .all_reduce_async(Tensor::from_f32(&input, &mut output), ReduceOp::Sum)
//!     .unwrap();
//! job.wait_to_complete();
//! ctx.stop();
//! ```

pub mod backend;
pub mod bitmap;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod job;
pub mod prepost;
pub mod scheduler;
mod signals;
pub mod slots;
pub mod stats;
pub mod tensor;
pub mod timeout;
pub mod types;
pub mod wire;

pub use config::{BackendKind, Config, PrePostKind, SchedulerKind};
pub use context::{Context, ContextState, WorkerHandle};
pub use error::{NetaggError, Result};
pub use job::{JobHandle, JobStatus};
pub use stats::StatsSnapshot;
pub use tensor::Tensor;
pub use types::{DataType, ReduceOp};
