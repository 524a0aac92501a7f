//! UDP transport against the switch-native packet protocol.
//!
//! One non-blocking socket per worker thread, source port
//! `worker_port + tid` so the switch can tell threads apart. The switch
//! address comes from the controller session when one is configured, or
//! from the static config otherwise.

mod worker;

use crate::context::WorkerHandle;
use crate::controller::{mint_session_id, ControllerClient};
use crate::error::{NetaggError, Result};
use crate::wire::SizeCategory;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::thread::JoinHandle;

pub struct UdpBackend {
    threads: Vec<JoinHandle<()>>,
}

impl UdpBackend {
    pub(crate) fn start(handle: WorkerHandle) -> Result<Self> {
        let config = handle.config();
        let switch_addr = resolve_switch_addr(&handle)?;
        tracing::info!(%switch_addr, "UDP backend targeting switch");

        let cores = if config.udp.cores.is_empty() {
            Vec::new()
        } else {
            let cores = parse_cpulist(&config.udp.cores).ok_or_else(|| {
                NetaggError::Config(format!("malformed cores list '{}'", config.udp.cores))
            })?;
            if cores.len() < config.general.num_worker_threads as usize {
                return Err(NetaggError::Config(format!(
                    "cores list '{}' names {} cores for {} worker threads",
                    config.udp.cores,
                    cores.len(),
                    config.general.num_worker_threads
                )));
            }
            cores
        };

        let bind_ip: Ipv4Addr = if config.udp.worker_ip.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            config.udp.worker_ip.parse().map_err(|e| {
                NetaggError::Config(format!("bad worker_ip '{}': {e}", config.udp.worker_ip))
            })?
        };

        let mut threads = Vec::new();
        for tid in 0..config.general.num_worker_threads {
            let port = config.udp.worker_port + tid;
            let socket = UdpSocket::bind(SocketAddrV4::new(bind_ip, port))
                .map_err(|e| NetaggError::TransportSetup(format!("binding {bind_ip}:{port}: {e}")))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| NetaggError::TransportSetup(format!("set_nonblocking: {e}")))?;

            let core = cores.get(tid as usize).copied();
            let worker = worker::UdpWorker::new(handle.clone(), tid, socket, switch_addr);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("netagg-udp-{tid}"))
                    .spawn(move || {
                        if let Some(core) = core {
                            pin_to_core(core);
                        }
                        worker.run();
                    })
                    .expect("spawning worker thread"),
            );
        }

        Ok(Self { threads })
    }

    pub(crate) fn shutdown(self) {
        for t in self.threads {
            let _ = t.join();
        }
    }
}

/// Where data-plane packets go: the controller's answer when one is
/// configured, the static config otherwise.
fn resolve_switch_addr(handle: &WorkerHandle) -> Result<SocketAddr> {
    let config = handle.config();
    if !config.general.controller_ip.is_empty() {
        return negotiate_session(handle);
    }
    if config.udp.switch_ip.is_empty() {
        return Err(NetaggError::config(
            "no controller configured and udp.switch_ip is empty",
        ));
    }
    let ip: Ipv4Addr = config.udp.switch_ip.parse().map_err(|e| {
        NetaggError::Config(format!("bad switch_ip '{}': {e}", config.udp.switch_ip))
    })?;
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, config.udp.switch_port)))
}

/// The one-shot control-plane exchange: agree on a session id, install
/// switch state (rank 0 first, so it can clear stale state), and barrier
/// until every worker's state is in place.
fn negotiate_session(handle: &WorkerHandle) -> Result<SocketAddr> {
    let config = handle.config();
    let g = &config.general;
    let mut client = ControllerClient::connect(&g.controller_ip, g.controller_port)?;

    let minted = if g.rank == 0 { mint_session_id() } else { 0 };
    let session_id = client.broadcast(minted, g.rank, g.num_workers, 0)?;
    tracing::debug!(session_id, "agreed on session id");

    if config.udp.worker_ip.is_empty() {
        return Err(NetaggError::config(
            "udp.worker_ip must be set when a controller is configured",
        ));
    }
    let worker_ip: Ipv4Addr = config.udp.worker_ip.parse().map_err(|e| {
        NetaggError::Config(format!("bad worker_ip '{}': {e}", config.udp.worker_ip))
    })?;
    let category = SizeCategory::from_numel(g.packet_numel).expect("validated packet_numel") as u8;

    let create = |client: &mut ControllerClient| {
        client.create_udp_session(
            session_id,
            g.rank,
            g.num_workers,
            u32::from(worker_ip),
            config.udp.worker_port,
            category,
        )
    };

    // Rank 0 clears and installs switch state before anyone else touches
    // the session.
    let (switch_ip, switch_port) = if g.rank == 0 {
        let result = create(&mut client)?;
        client.barrier(g.num_workers)?;
        result
    } else {
        client.barrier(g.num_workers)?;
        create(&mut client)?
    };

    // Nobody sends data-plane traffic until every worker is installed.
    client.barrier(g.num_workers)?;

    Ok(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(switch_ip),
        switch_port,
    )))
}

/// Parse the kernel's cpulist syntax, e.g. `10-13` or `0,2,4`.
fn parse_cpulist(list: &str) -> Option<Vec<usize>> {
    let mut cores = Vec::new();
    for part in list.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                cores.extend(lo..=hi);
            }
            None => cores.push(part.trim().parse().ok()?),
        }
    }
    Some(cores)
}

fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(core, "sched_setaffinity failed, thread stays unpinned");
        } else {
            tracing::debug!(core, "worker thread pinned");
        }
    }
}
