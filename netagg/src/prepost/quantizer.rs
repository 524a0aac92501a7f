use super::{total_main_ltus, PrePostProcessor};
use crate::job::JobSlice;
use crate::types::{DataType, Numel};
use crate::wire::SIDE_CHANNEL_SIZE;

/// The production processor.
///
/// i32 tensors are byte-swapped to big-endian and back; nothing else.
///
/// f32 tensors are block-quantized: every LTU travels as big-endian i32
/// scaled by a factor derived from a per-LTU exponent that the switch
/// max-reduces across workers. Because a packet's scaling factor must be
/// known *before* that packet is quantized, each packet carries the
/// exponent for the next LTU that will occupy its switch slot, and an
/// extra metadata-only batch primes the first window. LTU ids therefore
/// include the priming batch: id `p` carries the payload of main LTU
/// `p − batch` and the exponent of main LTU `p`.
pub struct ExponentQuantizer {
    num_workers: u16,
    ltu_numel: Numel,
    slice: Option<JobSlice>,
    /// Scaling factor for each main LTU, filled as exponents arrive.
    scaling_factors: Vec<f32>,
    batch_ltus: u64,
    total_main: u64,
}

impl ExponentQuantizer {
    pub fn new(num_workers: u16, ltu_numel: Numel) -> Self {
        Self {
            num_workers,
            ltu_numel,
            slice: None,
            scaling_factors: Vec::new(),
            batch_ltus: 0,
            total_main: 0,
        }
    }

    /// Element range of main LTU `m` within the slice.
    fn ltu_range(&self, m: u64) -> (Numel, usize) {
        let slice = self.slice.as_ref().expect("no active job slice");
        let offset = m * self.ltu_numel;
        let len = self.ltu_numel.min(slice.slice.numel - offset) as usize;
        (offset, len)
    }
}

/// Exponent `e` with `2^e >= max` for non-negative finite `max`: the
/// IEEE-754 exponent field, unbiased, plus one.
fn exponent_for(max: f32) -> i8 {
    (((max.to_bits() >> 23) & 0xFF) as i32 - 126) as i8
}

/// Scaling factor for a worker-count and a globally max-reduced exponent.
/// After summing `w` contributions of at most `2^e` each, values stay
/// within the i32 range.
fn scaling_factor(num_workers: u16, exponent: i8) -> f32 {
    (i32::MAX as f64 / (num_workers as f64 * (2f64).powi(exponent as i32))) as f32
}

impl PrePostProcessor for ExponentQuantizer {
    fn setup_slice(&mut self, slice: &JobSlice, batch_ltus: u64) -> u64 {
        let total_main = total_main_ltus(slice.slice.numel, self.ltu_numel);
        if slice.slice.dtype == DataType::Float32 {
            self.scaling_factors.clear();
            self.scaling_factors.resize(total_main as usize, 0.0);
        }
        self.slice = Some(slice.clone());
        self.batch_ltus = batch_ltus;
        self.total_main = total_main;
        total_main
    }

    fn needs_extra_batch(&self) -> bool {
        self.slice
            .as_ref()
            .map(|s| s.slice.dtype == DataType::Float32)
            .unwrap_or(false)
    }

    fn preprocess(&mut self, ltu_id: u64, payload: &mut [u8], side: &mut [u8; SIDE_CHANNEL_SIZE]) {
        let slice = self.slice.as_ref().expect("no active job slice");
        match slice.slice.dtype {
            DataType::Float32 => {
                if ltu_id >= self.batch_ltus {
                    // A payload-carrying packet: quantize main LTU
                    // `ltu_id - batch` with the factor its slot primed.
                    let m = ltu_id - self.batch_ltus;
                    let (offset, len) = self.ltu_range(m);
                    let input = slice.slice.input_f32(offset, len);
                    let s = self.scaling_factors[m as usize];
                    tracing::trace!(ltu_id, offset, len, scale = s, "quantizing LTU");
                    for (i, &x) in input.iter().enumerate() {
                        let q = (x * s).round() as i32;
                        payload[i * 4..i * 4 + 4].copy_from_slice(&q.to_be_bytes());
                    }
                }

                // Whether priming or payload, the side channel carries the
                // exponent for the next LTU to occupy this slot.
                *side = [0; SIDE_CHANNEL_SIZE];
                if ltu_id < self.total_main {
                    let (offset, len) = self.ltu_range(ltu_id);
                    let input = slice.slice.input_f32(offset, len);
                    let mut max = 0f32;
                    for &x in input {
                        max = max.max(x.abs());
                    }
                    let e = exponent_for(max);
                    tracing::trace!(ltu_id, max, exponent = e, "computed slot exponent");
                    side[0] = e as u8;
                }
            }
            DataType::Int32 => {
                let (offset, len) = self.ltu_range(ltu_id);
                let input = slice.slice.input_i32(offset, len);
                for (i, &x) in input.iter().enumerate() {
                    payload[i * 4..i * 4 + 4].copy_from_slice(&x.to_be_bytes());
                }
                *side = [0; SIDE_CHANNEL_SIZE];
            }
        }
    }

    fn postprocess(&mut self, ltu_id: u64, payload: &[u8], side: &[u8; SIDE_CHANNEL_SIZE]) {
        let slice = self.slice.as_ref().expect("no active job slice");
        match slice.slice.dtype {
            DataType::Float32 => {
                if ltu_id >= self.batch_ltus {
                    let m = ltu_id - self.batch_ltus;
                    let (offset, len) = self.ltu_range(m);
                    let s = self.scaling_factors[m as usize];
                    let output = slice.slice.output_f32(offset, len);
                    for (i, out) in output.iter_mut().enumerate() {
                        let v = i32::from_be_bytes(
                            payload[i * 4..i * 4 + 4].try_into().expect("4-byte chunk"),
                        );
                        *out = v as f32 / s;
                    }
                }

                // Store the scaling factor the slot's next occupant will
                // quantize with, from the globally max-reduced exponent.
                if ltu_id < self.total_main {
                    let e = side[0] as i8;
                    self.scaling_factors[ltu_id as usize] = scaling_factor(self.num_workers, e);
                    tracing::trace!(
                        ltu_id,
                        exponent = e,
                        scale = self.scaling_factors[ltu_id as usize],
                        "stored scaling factor"
                    );
                }
            }
            DataType::Int32 => {
                let (offset, len) = self.ltu_range(ltu_id);
                let output = slice.slice.output_i32(offset, len);
                for (i, out) in output.iter_mut().enumerate() {
                    *out = i32::from_be_bytes(
                        payload[i * 4..i * 4 + 4].try_into().expect("4-byte chunk"),
                    );
                }
            }
        }
    }

    fn cleanup_slice(&mut self) {
        self.slice = None;
        self.scaling_factors.clear();
    }
}
