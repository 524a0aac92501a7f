//! On-wire encodings shared by the transports.
//!
//! UDP carries an 8-byte application header, a 2-byte side channel, and
//! the big-endian payload. RDMA squeezes the same information into the
//! 32-bit write immediate and the rkey field: the immediate carries the
//! short message id and the exponent, the rkey carries the slot index
//! with the pool bit in its lowest bit.

use crate::slots::SwitchSlot;
use crate::types::JobId;

/// Bytes in the UDP application header.
pub const HEADER_SIZE: usize = 8;

/// Bytes in the side channel following the header (exponent byte plus a
/// reserved zero byte; all-zero for i32 jobs).
pub const SIDE_CHANNEL_SIZE: usize = 2;

/// Job type nibble. Only AllReduce exists on the data plane today.
pub const JOB_TYPE_ALLREDUCE: u8 = 0;

/// Payload size category carried in the header's low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SizeCategory {
    Numel64 = 0,
    Numel128 = 1,
    Numel256 = 2,
    Numel512 = 3,
}

impl SizeCategory {
    pub fn from_numel(numel: u64) -> Option<Self> {
        match numel {
            64 => Some(SizeCategory::Numel64),
            128 => Some(SizeCategory::Numel128),
            256 => Some(SizeCategory::Numel256),
            512 => Some(SizeCategory::Numel512),
            _ => None,
        }
    }

    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(SizeCategory::Numel64),
            1 => Some(SizeCategory::Numel128),
            2 => Some(SizeCategory::Numel256),
            3 => Some(SizeCategory::Numel512),
            _ => None,
        }
    }

    pub fn numel(self) -> u64 {
        64 << (self as u8)
    }
}

/// The UDP application header.
///
/// ```text
/// [0]    job-type nibble | size-category nibble
/// [1]    short job id (low 8 bits of the job id)
/// [2..6] packet id, big-endian
/// [6..8] slot field, big-endian (MSB = pool bit)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub size_category: SizeCategory,
    pub short_job_id: u8,
    pub pkt_id: u32,
    pub slot: SwitchSlot,
}

impl PacketHeader {
    pub fn new(job_id: JobId, pkt_id: u32, slot: SwitchSlot, size_category: SizeCategory) -> Self {
        Self {
            size_category,
            short_job_id: job_id as u8,
            pkt_id,
            slot,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = (JOB_TYPE_ALLREDUCE << 4) | self.size_category as u8;
        buf[1] = self.short_job_id;
        buf[2..6].copy_from_slice(&self.pkt_id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.slot.to_wire().to_be_bytes());
    }

    /// Decode a header. Fails on an unknown size category or a job type
    /// other than AllReduce.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        if buf[0] >> 4 != JOB_TYPE_ALLREDUCE {
            return None;
        }
        Some(Self {
            size_category: SizeCategory::from_nibble(buf[0] & 0x0F)?,
            short_job_id: buf[1],
            pkt_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            slot: SwitchSlot::from_wire(u16::from_be_bytes([buf[6], buf[7]])),
        })
    }
}

/// Total UDP datagram length for a given payload element count.
pub fn datagram_len(packet_numel: u64) -> usize {
    HEADER_SIZE + SIDE_CHANNEL_SIZE + packet_numel as usize * crate::types::ELEMENT_SIZE
}

/// The 32-bit RDMA write immediate.
///
/// Low 16 bits: short message id. Next 8 bits: quantization exponent.
/// Top 8 bits: reserved, zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmData {
    pub short_msg_id: u16,
    pub exponent: i8,
}

impl ImmData {
    pub fn encode(self) -> u32 {
        (self.short_msg_id as u32) | ((self.exponent as u8 as u32) << 16)
    }

    pub fn decode(imm: u32) -> Self {
        Self {
            short_msg_id: imm as u16,
            exponent: (imm >> 16) as u8 as i8,
        }
    }
}

/// Initial rkey value for an RDMA queue pair's slot range.
///
/// The low bit is the pool bit, set here so the flip before the first
/// post clears it; the remaining bits address the packet-granular slot
/// where this queue pair's messages land.
pub fn initial_rkey_pool_index(
    worker_tid: u16,
    qp_index: u64,
    qps_per_thread: u64,
    pkts_per_msg: u64,
) -> u32 {
    let msg_slot = qps_per_thread * worker_tid as u64 + qp_index;
    ((msg_slot * pkts_per_msg * 2) | 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_categories() {
        assert_eq!(SizeCategory::from_numel(64), Some(SizeCategory::Numel64));
        assert_eq!(SizeCategory::from_numel(256), Some(SizeCategory::Numel256));
        assert_eq!(SizeCategory::from_numel(100), None);
        assert_eq!(SizeCategory::Numel64.numel(), 64);
        assert_eq!(SizeCategory::Numel128.numel(), 128);
        assert_eq!(SizeCategory::Numel256.numel(), 256);
        assert_eq!(SizeCategory::Numel512.numel(), 512);
    }

    #[test]
    fn test_header_roundtrip() {
        let hdr = PacketHeader::new(
            0x1234_5678_9abc_deff,
            42,
            SwitchSlot {
                index: 77,
                shadow: true,
            },
            SizeCategory::Numel256,
        );
        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        let decoded = PacketHeader::decode(&buf).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.short_job_id, 0xff);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let hdr = PacketHeader::new(
            1,
            0x0102_0304,
            SwitchSlot {
                index: 0x0102,
                shadow: false,
            },
            SizeCategory::Numel64,
        );
        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(buf, [0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert_eq!(PacketHeader::decode(&[0u8; 4]), None);
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0x0F; // size category 15
        assert_eq!(PacketHeader::decode(&buf), None);
        buf[0] = 0x50; // job type 5
        assert_eq!(PacketHeader::decode(&buf), None);
    }

    #[test]
    fn test_datagram_len() {
        assert_eq!(datagram_len(64), 8 + 2 + 256);
        assert_eq!(datagram_len(256), 8 + 2 + 1024);
    }

    #[test]
    fn test_imm_data_roundtrip() {
        for (id, exp) in [(0u16, 0i8), (0xFFFF, -126), (513, 17), (42, -1)] {
            let imm = ImmData {
                short_msg_id: id,
                exponent: exp,
            };
            assert_eq!(ImmData::decode(imm.encode()), imm);
        }
    }

    #[test]
    fn test_imm_data_reserved_bits_zero() {
        let imm = ImmData {
            short_msg_id: 7,
            exponent: 3,
        }
        .encode();
        assert_eq!(imm >> 24, 0);
    }

    #[test]
    fn test_initial_rkey_has_pool_bit_set() {
        let rkey = initial_rkey_pool_index(0, 0, 4, 4);
        assert_eq!(rkey & 1, 1);
        // First flip clears the pool bit, leaving the slot address.
        assert_eq!(rkey ^ 1, 0);
    }

    #[test]
    fn test_rkey_slot_ranges_are_disjoint() {
        use std::collections::HashSet;
        let qps_per_thread = 4;
        let pkts_per_msg = 4;
        let mut seen = HashSet::new();
        for tid in 0..3u16 {
            for qp in 0..qps_per_thread {
                let rkey = initial_rkey_pool_index(tid, qp, qps_per_thread, pkts_per_msg);
                assert!(seen.insert(rkey), "duplicate rkey slot for tid={tid} qp={qp}");
                // Slots are packet-granular and leave room for the
                // shadow copy of every packet in the message.
                assert_eq!((rkey >> 1) % pkts_per_msg as u32, 0);
            }
        }
    }
}
