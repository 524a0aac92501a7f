//! Cross-cutting engine invariants.

use crate::support::{self, Faults, SwitchEmulator};
use netagg::{Context, JobStatus, NetaggError, ReduceOp, Tensor};
use std::time::{Duration, Instant};

/// The partial final packet of a slice is handled exactly: no stray
/// elements, no missing ones.
#[test]
fn test_partial_last_packet() {
    let switch = SwitchEmulator::spawn(3, Faults::default());
    let ctx = Context::start(support::udp_config(1, 3, 64, &switch)).unwrap();

    let input: Vec<i32> = (0..100).collect();
    let mut output = vec![0i32; 100];
    ctx.all_reduce(Tensor::from_i32(&input, &mut output), ReduceOp::Sum)
        .unwrap();
    ctx.stop();

    let expected: Vec<i32> = (0..100).map(|x| x * 3).collect();
    assert_eq!(output, expected);
}

/// Loss recovery composes with quantization: a dropped f32 payload
/// packet is retransmitted from the retained buffer with its side
/// channel intact.
#[test]
fn test_float32_with_loss() {
    let switch = SwitchEmulator::spawn(
        2,
        Faults {
            // Packet ids include the priming batch: 8 LTUs of priming,
            // then 8 of payload. Id 10 is the third payload packet.
            drop_once: Some(10),
            ..Default::default()
        },
    );
    let mut config = support::udp_config(1, 2, 64, &switch);
    config.general.timeout_ms = 30.0;
    let ctx = Context::start(config).unwrap();

    let input: Vec<f32> = (0..512).map(|i| (i as f32) * 0.25 - 60.0).collect();
    let mut output = vec![0f32; 512];
    let job = ctx
        .all_reduce(Tensor::from_f32(&input, &mut output), ReduceOp::Sum)
        .unwrap();
    assert_eq!(job.status(), JobStatus::Finished);
    ctx.stop();

    assert_eq!(ctx.stats().timeouts.iter().sum::<u64>(), 1);
    for (i, (&x, &y)) in input.iter().zip(output.iter()).enumerate() {
        let expected = x * 2.0;
        if expected == 0.0 {
            assert_eq!(y, 0.0, "element {i}");
        } else {
            assert!(
                ((y - expected) / expected).abs() <= 0.01,
                "element {i}: {y} vs {expected}"
            );
        }
    }
}

/// Multiple jobs in flight when stop lands: every handle ends terminal,
/// nothing hangs.
#[test]
fn test_stop_leaves_all_jobs_terminal() {
    let mut config = support::dummy_config(4, 2);
    // Slow the dummy down so jobs are genuinely in flight at stop.
    config.dummy.bandwidth_mbps = 10.0;
    let ctx = Context::start(config).unwrap();

    let input: Vec<i32> = (0..65536).collect();
    let outputs: Vec<Vec<i32>> = (0..8).map(|_| vec![0i32; 65536]).collect();
    let mut outputs = outputs;
    let jobs: Vec<_> = outputs
        .iter_mut()
        .map(|out| {
            ctx.all_reduce_async(Tensor::from_i32(&input, out), ReduceOp::Sum)
                .unwrap()
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    let begin = Instant::now();
    ctx.stop();
    assert!(begin.elapsed() < Duration::from_secs(3));

    for job in &jobs {
        assert!(
            job.status().is_terminal(),
            "job {} left in {:?}",
            job.id,
            job.status()
        );
    }
}

/// Submission outside Running is a state error.
#[test]
fn test_submit_after_stop_rejected() {
    let ctx = Context::start(support::dummy_config(1, 1)).unwrap();
    ctx.stop();

    let input = vec![0i32; 4];
    let mut output = vec![0i32; 4];
    let err = ctx
        .all_reduce_async(Tensor::from_i32(&input, &mut output), ReduceOp::Sum)
        .unwrap_err();
    assert!(matches!(err, NetaggError::State { .. }), "got {err:?}");
}

/// Stop is idempotent in effect.
#[test]
fn test_stop_twice() {
    let ctx = Context::start(support::dummy_config(2, 1)).unwrap();
    ctx.stop();
    ctx.stop();
}

/// wait_for_all_jobs returns once every async submission has drained.
#[test]
fn test_wait_for_all_jobs() {
    let ctx = Context::start(support::dummy_config(2, 2)).unwrap();

    let input: Vec<f32> = (0..1000).map(|i| i as f32).collect();
    let mut outputs: Vec<Vec<f32>> = (0..4).map(|_| vec![0f32; 1000]).collect();
    let jobs: Vec<_> = outputs
        .iter_mut()
        .map(|out| {
            ctx.all_reduce_async(Tensor::from_f32(&input, out), ReduceOp::Sum)
                .unwrap()
        })
        .collect();

    ctx.wait_for_all_jobs().unwrap();
    for job in &jobs {
        assert_eq!(job.status(), JobStatus::Finished);
    }
    assert_eq!(ctx.stats().jobs_finished, 4);
    ctx.stop();

    for out in &outputs {
        for (i, &y) in out.iter().enumerate() {
            assert_eq!(y, i as f32 * 2.0);
        }
    }
}

/// The stats snapshot tracks submissions and their sizes.
#[test]
fn test_job_size_distribution() {
    let ctx = Context::start(support::dummy_config(1, 1)).unwrap();

    for numel in [64u64, 128, 256] {
        let input = vec![1i32; numel as usize];
        let mut output = vec![0i32; numel as usize];
        ctx.all_reduce(Tensor::from_i32(&input, &mut output), ReduceOp::Sum)
            .unwrap();
    }
    let stats = ctx.stats();
    ctx.stop();

    assert_eq!(stats.jobs_submitted, 3);
    assert_eq!(stats.jobs_finished, 3);
    assert_eq!(stats.submitted_numel, vec![64, 128, 256]);
}
