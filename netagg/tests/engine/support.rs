//! Test support: a loopback switch emulator and config helpers.

use netagg::wire::{PacketHeader, HEADER_SIZE, SIDE_CHANNEL_SIZE};
use netagg::Config;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Each test gets its own band of worker ports so tests can run
/// concurrently.
static NEXT_PORT: AtomicU16 = AtomicU16::new(52000);

pub fn alloc_worker_port() -> u16 {
    NEXT_PORT.fetch_add(16, Ordering::Relaxed)
}

/// Fault injection knobs for the emulator.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Swallow the first occurrence of this packet id (forces one
    /// client-side timeout and retransmission).
    pub drop_once: Option<u32>,
    /// Send the response for this packet id twice, once.
    pub duplicate_once: Option<u32>,
}

/// An in-process stand-in for the aggregating switch.
///
/// Every received packet is echoed back to its sender with the payload
/// integers multiplied by `num_workers` (the sum of that many identical
/// contributions) and the side channel unchanged (the max exponent over
/// identical workers is the sent exponent). Faults can drop or duplicate
/// one response.
pub struct SwitchEmulator {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SwitchEmulator {
    pub fn spawn(num_workers: u16, faults: Faults) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("binding emulator socket");
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .expect("emulator read timeout");
        let addr = socket.local_addr().expect("emulator addr");
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut dropped = false;
                let mut duplicated = false;
                let mut buf = [0u8; 4096];
                while !stop.load(Ordering::Relaxed) {
                    let (n, src) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(_) => continue, // timeout or spurious error
                    };
                    let Some(header) = PacketHeader::decode(&buf[..n]) else {
                        continue;
                    };

                    if faults.drop_once == Some(header.pkt_id) && !dropped {
                        dropped = true;
                        continue;
                    }

                    // Aggregate: num_workers identical contributions.
                    let numel = header.size_category.numel() as usize;
                    let payload_start = HEADER_SIZE + SIDE_CHANNEL_SIZE;
                    for i in 0..numel {
                        let off = payload_start + i * 4;
                        if off + 4 > n {
                            break;
                        }
                        let v = i32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
                        buf[off..off + 4]
                            .copy_from_slice(&(v.wrapping_mul(num_workers as i32)).to_be_bytes());
                    }

                    socket.send_to(&buf[..n], src).expect("emulator send");
                    if faults.duplicate_once == Some(header.pkt_id) && !duplicated {
                        duplicated = true;
                        socket.send_to(&buf[..n], src).expect("emulator resend");
                    }
                }
            })
        };

        Self {
            addr,
            stop,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for SwitchEmulator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// A UDP-backend config pointed at the emulator, with no controller and
/// test-friendly timeouts.
pub fn udp_config(
    num_worker_threads: u16,
    num_workers: u16,
    packet_numel: u64,
    switch: &SwitchEmulator,
) -> Config {
    let mut config = Config::default();
    config.general.backend = "udp".parse().unwrap();
    config.general.num_workers = num_workers;
    config.general.num_worker_threads = num_worker_threads;
    config.general.packet_numel = packet_numel;
    config.general.timeout_ms = 150.0;
    config.udp.worker_port = alloc_worker_port();
    config.udp.switch_ip = "127.0.0.1".to_string();
    config.udp.switch_port = switch.addr().port();
    config
}

/// A dummy-backend config for lifecycle scenarios.
pub fn dummy_config(num_worker_threads: u16, num_workers: u16) -> Config {
    let mut config = Config::default();
    config.general.backend = "dummy".parse().unwrap();
    config.general.num_workers = num_workers;
    config.general.num_worker_threads = num_worker_threads;
    config
}
