//! RoCEv2 transport: RDMA-write-with-immediate against the switch.
//!
//! One unreliable-connected queue pair per outstanding message, one
//! completion queue per worker thread, and a single registered region
//! mapped at the same fixed virtual address on every worker so the
//! switch can use one remote address for all of them. The rkey field of
//! each write is repurposed to carry the slot index (pool bit in the low
//! bit); the immediate carries the short message id and the exponent.

mod worker;

use crate::context::WorkerHandle;
use crate::controller::{mint_session_id, ControllerClient, RdmaSessionInfo};
use crate::error::{NetaggError, Result};
use crate::types::ELEMENT_SIZE;
use crate::wire::SizeCategory;
use netagg_rdma::qp::PathMtu;
use netagg_rdma::{gid, CompletionQueue, PinnedRegion, QueuePair, RdmaEndpoint};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Fixed virtual address of the registered region on every worker.
const REGION_BASE: usize = 1 << 44;

/// Shared verbs state all worker threads operate on. Declaration order
/// is teardown order: queue pairs before completion queues before the
/// region before the device.
pub(crate) struct Connection {
    qps: Vec<QueuePair>,
    cqs: Vec<CompletionQueue>,
    region: PinnedRegion,
    endpoint: RdmaEndpoint,
}

impl Connection {
    pub(crate) fn qp(&self, index: usize) -> &QueuePair {
        &self.qps[index]
    }

    pub(crate) fn cq(&self, worker: usize) -> &CompletionQueue {
        &self.cqs[worker]
    }

    pub(crate) fn region(&self) -> &PinnedRegion {
        &self.region
    }

    pub(crate) fn device_name(&self) -> &str {
        self.endpoint.device_name()
    }
}

pub struct RdmaBackend {
    threads: Vec<JoinHandle<()>>,
    _connection: Arc<Connection>,
}

impl RdmaBackend {
    pub(crate) fn start(handle: WorkerHandle) -> Result<Self> {
        let config = handle.config().clone();
        let g = &config.general;
        let r = &config.rdma;

        let pkts_per_msg = config.packets_per_message();
        let num_queue_pairs = (g.max_outstanding_packets as u64 / pkts_per_msg) as usize;
        let qps_per_thread = num_queue_pairs / g.num_worker_threads as usize;
        let region_size =
            g.packet_numel as usize * g.max_outstanding_packets as usize * ELEMENT_SIZE;

        let endpoint = RdmaEndpoint::open(
            &r.device_name,
            r.device_port_id,
            r.gid_index as u8,
        )?;
        let region = endpoint.register_fixed(REGION_BASE, region_size)?;
        tracing::info!(
            device = r.device_name,
            region_size,
            num_queue_pairs,
            "RDMA backend resources allocated"
        );

        // One CQ per worker thread; queue pairs are spread across threads
        // in contiguous runs so thread t owns QPs [t·n, (t+1)·n).
        let mut cqs = Vec::with_capacity(g.num_worker_threads as usize);
        for _ in 0..g.num_worker_threads {
            cqs.push(endpoint.create_cq((2 * qps_per_thread).max(256) as i32)?);
        }
        let mut qps = Vec::with_capacity(num_queue_pairs);
        for i in 0..num_queue_pairs {
            let qp = endpoint.create_uc_qp(&cqs[i / qps_per_thread], 2048)?;
            qp.to_init()?;
            qps.push(qp);
        }

        let session = negotiate_session(&config, &endpoint, &region, &qps)?;
        if session.qpns.len() != num_queue_pairs || session.psns.len() != num_queue_pairs {
            return Err(NetaggError::TransportSetup(format!(
                "controller returned {} switch queue pairs, expected {num_queue_pairs}",
                session.qpns.len()
            )));
        }

        // RoCE addressing: IP-based GIDs for gid_index 2/3, MAC-based
        // below.
        let dgid = if r.gid_index >= 2 {
            gid::ipv4_to_gid(session.ipv4)
        } else {
            gid::mac_to_gid(session.mac)
        };
        let mtu = if g.packet_numel == 256 {
            PathMtu::Mtu1024
        } else {
            PathMtu::Mtu256
        };
        for (i, qp) in qps.iter().enumerate() {
            qp.to_rtr(mtu, session.qpns[i], session.psns[i], dgid, r.gid_index as u8)?;
            qp.to_rts(qp.qp_num() / 2)?;
        }
        tracing::info!("RDMA session established, queue pairs ready");

        let connection = Arc::new(Connection {
            qps,
            cqs,
            region,
            endpoint,
        });

        let threads = (0..g.num_worker_threads)
            .map(|tid| {
                let worker = worker::RdmaWorker::new(
                    handle.clone(),
                    Arc::clone(&connection),
                    tid,
                    qps_per_thread,
                );
                std::thread::Builder::new()
                    .name(format!("netagg-rdma-{tid}"))
                    .spawn(move || worker.run())
                    .expect("spawning worker thread")
            })
            .collect();

        Ok(Self {
            threads,
            _connection: connection,
        })
    }

    pub(crate) fn shutdown(self) {
        for t in self.threads {
            let _ = t.join();
        }
    }
}

/// Agree on a session id, hand the controller this worker's region and
/// queue pairs, and learn the switch's. Rank 0 installs first so stale
/// switch state is cleared exactly once; the final barrier keeps data
/// off the wire until every worker is installed.
fn negotiate_session(
    config: &crate::config::Config,
    endpoint: &RdmaEndpoint,
    region: &PinnedRegion,
    qps: &[QueuePair],
) -> Result<RdmaSessionInfo> {
    let g = &config.general;
    let mut client = ControllerClient::connect(&g.controller_ip, g.controller_port)?;

    let minted = if g.rank == 0 { mint_session_id() } else { 0 };
    let session_id = client.broadcast(minted, g.rank, g.num_workers, 0)?;
    tracing::debug!(session_id, "agreed on session id");

    let category = SizeCategory::from_numel(g.packet_numel).expect("validated packet_numel") as u8;
    let qpns: Vec<u32> = qps.iter().map(|qp| qp.qp_num()).collect();
    // PSN convention mirrored by the switch side.
    let psns: Vec<u32> = qpns.iter().map(|&qpn| qpn / 2).collect();
    let message_size = (config.rdma.msg_numel * ELEMENT_SIZE as u64) as u32;

    let create = |client: &mut ControllerClient| {
        client.create_rdma_session(
            session_id,
            g.rank,
            g.num_workers,
            endpoint.mac(),
            endpoint.ipv4(),
            region.rkey(),
            category,
            message_size,
            qpns.clone(),
            psns.clone(),
        )
    };

    let session = if g.rank == 0 {
        let session = create(&mut client)?;
        client.barrier(g.num_workers)?;
        session
    } else {
        client.barrier(g.num_workers)?;
        create(&mut client)?
    };
    client.barrier(g.num_workers)?;
    Ok(session)
}
