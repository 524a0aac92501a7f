//! Pre/post-processors: convert between the caller's tensor
//! representation and the on-wire payload.
//!
//! The backend hands every transmission unit through the processor twice:
//! once to fill the send buffer (`preprocess`) and once to unload a
//! received payload (`postprocess`). LTU ids count from zero per job
//! slice and include the priming batch when one is used, so the
//! quantizer can tell priming ids from payload ids by comparing against
//! the batch size.

mod bypass;
mod quantizer;

pub use bypass::BypassProcessor;
pub use quantizer::ExponentQuantizer;

use crate::config::PrePostKind;
use crate::job::JobSlice;
use crate::types::Numel;
use crate::wire::SIDE_CHANNEL_SIZE;

/// Converts between tensor data and wire payload, one LTU at a time.
pub trait PrePostProcessor: Send {
    /// Begin a job slice. Returns the number of payload-carrying LTUs
    /// (the priming batch, if any, is not included).
    fn setup_slice(&mut self, slice: &JobSlice, batch_ltus: u64) -> u64;

    /// Whether the first batch carries only side-channel metadata.
    fn needs_extra_batch(&self) -> bool;

    /// Fill `payload` (and the side channel) for LTU `ltu_id`.
    fn preprocess(&mut self, ltu_id: u64, payload: &mut [u8], side: &mut [u8; SIDE_CHANNEL_SIZE]);

    /// Unload a received `payload` (and side channel) for LTU `ltu_id`.
    fn postprocess(&mut self, ltu_id: u64, payload: &[u8], side: &[u8; SIDE_CHANNEL_SIZE]);

    /// Drop per-slice state.
    fn cleanup_slice(&mut self);
}

/// Number of payload LTUs a slice of `numel` elements needs.
pub fn total_main_ltus(numel: Numel, ltu_numel: Numel) -> u64 {
    numel.div_ceil(ltu_numel)
}

/// Instantiate the configured processor for one worker thread.
pub fn create(kind: PrePostKind, num_workers: u16, ltu_numel: Numel) -> Box<dyn PrePostProcessor> {
    match kind {
        PrePostKind::Bypass => Box::new(BypassProcessor::new(ltu_numel)),
        PrePostKind::CpuExponentQuantizer => {
            Box::new(ExponentQuantizer::new(num_workers, ltu_numel))
        }
    }
}
