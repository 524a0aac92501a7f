//! Configuration schema and validation.
//!
//! Plain structs with defaults; parsing a config file into them is the
//! embedding application's job. `Config::validate` normalizes the window
//! sizes and rejects anything the data plane cannot honor.

use crate::error::{NetaggError, Result};
use crate::types::Rank;

/// Which transport drives the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process backend that fakes aggregation; used by tests and for
    /// measuring everything above the transport.
    Dummy,
    /// UDP packets against the switch-native protocol.
    Udp,
    /// RoCEv2 RDMA-write-with-immediate.
    Rdma,
}

impl std::str::FromStr for BackendKind {
    type Err = NetaggError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dummy" => Ok(BackendKind::Dummy),
            // "dpdk" is the historical name for the packet-per-datagram
            // transport; both ids select the UDP backend.
            "udp" | "dpdk" => Ok(BackendKind::Udp),
            "rdma" => Ok(BackendKind::Rdma),
            other => Err(NetaggError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Which scheduler dispatches jobs to worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// First-in-first-out; all worker threads process the same job
    /// together.
    Fifo,
}

impl std::str::FromStr for SchedulerKind {
    type Err = NetaggError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(SchedulerKind::Fifo),
            other => Err(NetaggError::Config(format!("unknown scheduler '{other}'"))),
        }
    }
}

/// Which pre/post-processor moves data between tensors and the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrePostKind {
    /// No transformation; measures raw transport throughput.
    Bypass,
    /// Production path: block-quantizes f32 to i32 with a shared exponent,
    /// byte-swaps i32.
    CpuExponentQuantizer,
}

impl std::str::FromStr for PrePostKind {
    type Err = NetaggError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bypass" => Ok(PrePostKind::Bypass),
            "cpu_exponent_quantizer" => Ok(PrePostKind::CpuExponentQuantizer),
            other => Err(NetaggError::Config(format!(
                "unknown prepostprocessor '{other}'"
            ))),
        }
    }
}

/// Options every deployment must set.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// This worker node's rank, unique across the cluster.
    pub rank: Rank,

    /// Number of worker nodes participating in every reduction.
    pub num_workers: u16,

    /// Number of worker threads this node launches.
    pub num_worker_threads: u16,

    /// Maximum in-flight packets for the whole worker node. Divided
    /// evenly between worker threads; normalized down by `validate`.
    pub max_outstanding_packets: u32,

    /// Elements per packet. The switch program supports 64 and 256.
    pub packet_numel: u64,

    /// Transport selection.
    pub backend: BackendKind,

    /// Scheduler selection.
    pub scheduler: SchedulerKind,

    /// Pre/post-processor selection.
    pub prepostprocessor: PrePostKind,

    /// Complete every job instantly without touching the network. The
    /// backend is still set up and torn down; useful to isolate
    /// scheduling overhead.
    pub instant_job_completion: bool,

    /// Controller address for session negotiation. An empty IP skips the
    /// controller and uses the statically configured switch address.
    pub controller_ip: String,
    pub controller_port: u16,

    /// Initial per-slot timeout in milliseconds before a packet is
    /// retransmitted.
    pub timeout_ms: f64,

    /// Number of timeouts after which the timeout value doubles.
    pub timeout_threshold: u64,

    /// How much the threshold grows each time it is exceeded.
    pub timeout_threshold_increment: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            num_workers: 1,
            num_worker_threads: 1,
            max_outstanding_packets: 256,
            packet_numel: 256,
            backend: BackendKind::Dummy,
            scheduler: SchedulerKind::Fifo,
            prepostprocessor: PrePostKind::CpuExponentQuantizer,
            instant_job_completion: false,
            controller_ip: String::new(),
            controller_port: 50099,
            timeout_ms: 10.0,
            timeout_threshold: 100,
            timeout_threshold_increment: 100,
        }
    }
}

/// Options for the UDP backend.
#[derive(Debug, Clone)]
pub struct UdpBackendConfig {
    /// Base UDP port for this worker. Worker thread `t` binds
    /// `worker_port + t`.
    pub worker_port: u16,

    /// Local IP of the interface facing the switch. Empty binds the
    /// wildcard address.
    pub worker_ip: String,

    /// Core list for pinning worker threads, kernel cpulist syntax
    /// (e.g. `10-13`). Empty disables pinning.
    pub cores: String,

    /// Capacity of the per-thread packet buffer pool.
    pub pool_size: u32,

    /// Maximum packets pulled from the socket per poll.
    pub burst_rx: u32,

    /// Transmit buffer capacity; the buffer flushes when full.
    pub burst_tx: u32,

    /// Flush period for a partially filled transmit buffer, microseconds.
    pub bulk_drain_tx_us: u32,

    /// Switch data-plane address, used when no controller is configured
    /// (static deployments and tests). The controller response overrides
    /// these.
    pub switch_ip: String,
    pub switch_port: u16,
}

impl Default for UdpBackendConfig {
    fn default() -> Self {
        Self {
            worker_port: 47000,
            worker_ip: String::new(),
            cores: String::new(),
            pool_size: 1024,
            burst_rx: 64,
            burst_tx: 32,
            bulk_drain_tx_us: 100,
            switch_ip: String::new(),
            switch_port: 48000,
        }
    }
}

/// Options for the RDMA backend.
#[derive(Debug, Clone)]
pub struct RdmaBackendConfig {
    /// Elements per RDMA message. Must be a multiple of
    /// `general.packet_numel`; the NIC splits each message into that many
    /// wire packets. Larger messages amortize per-op overhead but make a
    /// loss cost the whole message.
    pub msg_numel: u64,

    /// Infiniband device name, e.g. `mlx5_0`.
    pub device_name: String,

    /// Physical port on the device (1-based, as ibv_devinfo reports).
    pub device_port_id: u8,

    /// GID table index: 0/1 select RoCEv1/v2 with MAC-based GIDs, 2/3
    /// with IP-based GIDs.
    pub gid_index: u16,

    /// Register the buffer in GPU memory via GPUDirect. Not implemented;
    /// must be false.
    pub use_gdr: bool,
}

impl Default for RdmaBackendConfig {
    fn default() -> Self {
        Self {
            msg_numel: 1024,
            device_name: "mlx5_0".to_string(),
            device_port_id: 1,
            gid_index: 3,
            use_gdr: false,
        }
    }
}

/// Options for the dummy backend.
#[derive(Debug, Clone)]
pub struct DummyBackendConfig {
    /// Simulated link bandwidth in Mbps used to compute sleep durations.
    /// Zero disables sleeping.
    pub bandwidth_mbps: f32,

    /// Whether the dummy backend computes what the switch would have:
    /// every output element = input element × num_workers.
    pub process_packets: bool,
}

impl Default for DummyBackendConfig {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 0.0,
            process_packets: true,
        }
    }
}

/// The full engine configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub udp: UdpBackendConfig,
    pub rdma: RdmaBackendConfig,
    pub dummy: DummyBackendConfig,
}

impl Config {
    /// Normalize window sizes and reject unsupported combinations.
    ///
    /// `max_outstanding_packets` is rounded down to a multiple of
    /// `num_worker_threads` (times packets-per-message for RDMA) so the
    /// window divides evenly across threads and slots.
    pub fn validate(&mut self) -> Result<()> {
        let g = &mut self.general;

        if g.num_workers == 0 {
            return Err(NetaggError::config("num_workers must be at least 1"));
        }
        if g.rank >= g.num_workers {
            return Err(NetaggError::Config(format!(
                "rank {} out of range for {} workers",
                g.rank, g.num_workers
            )));
        }
        if g.num_worker_threads == 0 {
            return Err(NetaggError::config("num_worker_threads must be at least 1"));
        }
        if g.packet_numel != 64 && g.packet_numel != 256 {
            return Err(NetaggError::Config(format!(
                "packet_numel must be 64 or 256, got {}",
                g.packet_numel
            )));
        }
        if g.timeout_ms <= 0.0 {
            return Err(NetaggError::config("timeout_ms must be positive"));
        }

        let threads = g.num_worker_threads as u32;
        if g.max_outstanding_packets < threads {
            return Err(NetaggError::Config(format!(
                "max_outstanding_packets {} is below num_worker_threads {threads}; \
                 every thread needs at least one outstanding packet",
                g.max_outstanding_packets
            )));
        }

        if g.backend == BackendKind::Rdma {
            let r = &mut self.rdma;
            if r.use_gdr {
                return Err(NetaggError::config("use_gdr is not implemented"));
            }
            if r.gid_index > 3 {
                return Err(NetaggError::Config(format!(
                    "gid_index must be 0..=3, got {}",
                    r.gid_index
                )));
            }
            if r.msg_numel < g.packet_numel {
                return Err(NetaggError::Config(format!(
                    "msg_numel {} is below packet_numel {}",
                    r.msg_numel, g.packet_numel
                )));
            }
            if r.msg_numel % g.packet_numel != 0 {
                let normalized = r.msg_numel / g.packet_numel * g.packet_numel;
                tracing::warn!(
                    msg_numel = r.msg_numel,
                    normalized,
                    "msg_numel is not a multiple of packet_numel, rounding down"
                );
                r.msg_numel = normalized;
            }
            let pkts_per_msg = (r.msg_numel / g.packet_numel) as u32;
            let quantum = threads * pkts_per_msg;
            if g.max_outstanding_packets < quantum {
                return Err(NetaggError::Config(format!(
                    "max_outstanding_packets {} is below num_worker_threads × \
                     packets-per-message = {quantum}",
                    g.max_outstanding_packets
                )));
            }
            let normalized = g.max_outstanding_packets / quantum * quantum;
            if normalized != g.max_outstanding_packets {
                tracing::warn!(
                    max_outstanding_packets = g.max_outstanding_packets,
                    normalized,
                    "max_outstanding_packets is not a multiple of threads × packets-per-message, \
                     rounding down"
                );
                g.max_outstanding_packets = normalized;
            }
        } else {
            let normalized = g.max_outstanding_packets / threads * threads;
            if normalized != g.max_outstanding_packets {
                tracing::warn!(
                    max_outstanding_packets = g.max_outstanding_packets,
                    normalized,
                    "max_outstanding_packets is not a multiple of num_worker_threads, rounding down"
                );
                g.max_outstanding_packets = normalized;
            }
        }

        Ok(())
    }

    /// Outstanding packets each worker thread may keep in flight.
    pub fn max_outstanding_per_thread(&self) -> u64 {
        (self.general.max_outstanding_packets / self.general.num_worker_threads as u32) as u64
    }

    /// Packets per RDMA message (1 for other backends).
    pub fn packets_per_message(&self) -> u64 {
        match self.general.backend {
            BackendKind::Rdma => self.rdma.msg_numel / self.general.packet_numel,
            _ => 1,
        }
    }

    /// Outstanding RDMA messages each worker thread may keep in flight.
    pub fn max_outstanding_msgs_per_thread(&self) -> u64 {
        self.max_outstanding_per_thread() / self.packets_per_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let mut cfg = Config::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_packet_numel() {
        let mut cfg = Config::default();
        cfg.general.packet_numel = 128;
        assert!(matches!(cfg.validate(), Err(NetaggError::Config(_))));
    }

    #[test]
    fn test_rejects_rank_out_of_range() {
        let mut cfg = Config::default();
        cfg.general.rank = 2;
        cfg.general.num_workers = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_normalizes_outstanding_to_thread_multiple() {
        let mut cfg = Config::default();
        cfg.general.num_worker_threads = 3;
        cfg.general.max_outstanding_packets = 256;
        cfg.validate().unwrap();
        assert_eq!(cfg.general.max_outstanding_packets, 255);
        assert_eq!(cfg.max_outstanding_per_thread(), 85);
    }

    #[test]
    fn test_rejects_outstanding_below_threads() {
        let mut cfg = Config::default();
        cfg.general.num_worker_threads = 8;
        cfg.general.max_outstanding_packets = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rdma_msg_numel_normalization() {
        let mut cfg = Config::default();
        cfg.general.backend = BackendKind::Rdma;
        cfg.general.packet_numel = 256;
        cfg.rdma.msg_numel = 300;
        cfg.general.max_outstanding_packets = 256;
        cfg.validate().unwrap();
        assert_eq!(cfg.rdma.msg_numel, 256);
    }

    #[test]
    fn test_rdma_outstanding_normalization() {
        let mut cfg = Config::default();
        cfg.general.backend = BackendKind::Rdma;
        cfg.general.packet_numel = 64;
        cfg.rdma.msg_numel = 256; // 4 packets per message
        cfg.general.num_worker_threads = 2;
        cfg.general.max_outstanding_packets = 100;
        cfg.validate().unwrap();
        // Quantum is 2 × 4 = 8, so 100 rounds down to 96.
        assert_eq!(cfg.general.max_outstanding_packets, 96);
        assert_eq!(cfg.max_outstanding_msgs_per_thread(), 12);
    }

    #[test]
    fn test_rdma_rejects_small_msg_numel() {
        let mut cfg = Config::default();
        cfg.general.backend = BackendKind::Rdma;
        cfg.general.packet_numel = 256;
        cfg.rdma.msg_numel = 64;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("dummy".parse::<BackendKind>().unwrap(), BackendKind::Dummy);
        assert_eq!("udp".parse::<BackendKind>().unwrap(), BackendKind::Udp);
        assert_eq!("dpdk".parse::<BackendKind>().unwrap(), BackendKind::Udp);
        assert_eq!("rdma".parse::<BackendKind>().unwrap(), BackendKind::Rdma);
        assert!("tcp".parse::<BackendKind>().is_err());

        assert_eq!("fifo".parse::<SchedulerKind>().unwrap(), SchedulerKind::Fifo);
        assert!("lifo".parse::<SchedulerKind>().is_err());

        assert_eq!("bypass".parse::<PrePostKind>().unwrap(), PrePostKind::Bypass);
        assert_eq!(
            "cpu_exponent_quantizer".parse::<PrePostKind>().unwrap(),
            PrePostKind::CpuExponentQuantizer
        );
    }
}
