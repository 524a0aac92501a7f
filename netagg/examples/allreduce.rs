//! Minimal end-to-end AllReduce.
//!
//! Configure rank and peers through the environment:
//!
//! ```text
//! NETAGG_RANK=0 NETAGG_NUM_WORKERS=2 NETAGG_CONTROLLER_IP=10.0.0.10 \
//!     cargo run --example allreduce
//! ```

use netagg::{Config, Context, ReduceOp, Tensor};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn main() {
    tracing_subscriber::fmt().init();

    let mut config = Config::default();
    config.general.rank = env_or("NETAGG_RANK", 0);
    config.general.num_workers = env_or("NETAGG_NUM_WORKERS", 1);
    config.general.num_worker_threads = env_or("NETAGG_NUM_WORKER_THREADS", 1);
    config.general.backend = env_or("NETAGG_BACKEND", "dummy".to_string())
        .parse()
        .expect("valid backend id");
    config.general.controller_ip = env_or("NETAGG_CONTROLLER_IP", String::new());
    config.udp.worker_ip = env_or("NETAGG_WORKER_IP", String::new());
    config.udp.switch_ip = env_or("NETAGG_SWITCH_IP", String::new());

    let numel = env_or("NETAGG_NUMEL", 1u64 << 20) as usize;
    let input: Vec<f32> = (0..numel).map(|i| (i % 1000) as f32 * 0.01).collect();
    let mut output = vec![0f32; numel];

    let ctx = Context::start(config).expect("context start");
    let job = ctx
        .all_reduce(Tensor::from_f32(&input, &mut output), ReduceOp::Sum)
        .expect("submit");
    println!(
        "job {} finished with status {} (first elements: {:?})",
        job.id,
        job.status(),
        &output[..4.min(numel)]
    );
    ctx.stop();
}
