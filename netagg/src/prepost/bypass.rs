use super::{total_main_ltus, PrePostProcessor};
use crate::job::JobSlice;
use crate::types::Numel;
use crate::wire::SIDE_CHANNEL_SIZE;

/// Placeholder processor that moves no data.
///
/// Used to measure raw transport overhead: packets carry whatever the
/// send buffers already hold and received payloads are discarded.
pub struct BypassProcessor {
    ltu_numel: Numel,
}

impl BypassProcessor {
    pub fn new(ltu_numel: Numel) -> Self {
        Self { ltu_numel }
    }
}

impl PrePostProcessor for BypassProcessor {
    fn setup_slice(&mut self, slice: &JobSlice, _batch_ltus: u64) -> u64 {
        total_main_ltus(slice.slice.numel, self.ltu_numel)
    }

    fn needs_extra_batch(&self) -> bool {
        false
    }

    fn preprocess(&mut self, _ltu_id: u64, _payload: &mut [u8], _side: &mut [u8; SIDE_CHANNEL_SIZE]) {}

    fn postprocess(&mut self, _ltu_id: u64, _payload: &[u8], _side: &[u8; SIDE_CHANNEL_SIZE]) {}

    fn cleanup_slice(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::tensor::Tensor;
    use crate::types::ReduceOp;

    #[test]
    fn test_ltu_count_only() {
        let input = vec![0i32; 300];
        let mut output = vec![0i32; 300];
        let tensor = Tensor::from_i32(&input, &mut output);
        let job = Job::new(tensor, ReduceOp::Sum);
        let slice = JobSlice {
            job,
            slice: tensor,
            offset: 0,
        };

        let mut ppp = BypassProcessor::new(64);
        assert_eq!(ppp.setup_slice(&slice, 8), 5);
        assert!(!ppp.needs_extra_batch());

        let mut payload = vec![1u8; 256];
        let mut side = [9u8; SIDE_CHANNEL_SIZE];
        ppp.preprocess(0, &mut payload, &mut side);
        // Nothing is touched.
        assert!(payload.iter().all(|&b| b == 1));
        assert_eq!(side, [9, 9]);
    }
}
