//! The per-thread RDMA completion loop.
//!
//! Each worker thread owns a contiguous run of queue pairs, one per
//! outstanding message, and the matching partition of the registered
//! region. A received write-with-immediate completes one message: its
//! buffer is postprocessed in place, the next message for that queue
//! pair is preprocessed into the same buffer and posted, and the pool
//! bit in the rkey flips so the switch lands it on the shadow twin.

use super::Connection;
use crate::context::WorkerHandle;
use crate::job::JobSlice;
use crate::prepost::{self, PrePostProcessor};
use crate::timeout::TimeoutQueue;
use crate::types::{WorkerTid, ELEMENT_SIZE};
use crate::wire::{self, ImmData, SIDE_CHANNEL_SIZE};
use netagg_rdma::ibverbs_sys;
use netagg_rdma::numa;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(super) struct RdmaWorker {
    handle: WorkerHandle,
    connection: Arc<Connection>,
    tid: WorkerTid,
    qps_per_thread: usize,
    ppp: Box<dyn PrePostProcessor>,
    timers: TimeoutQueue,
    msg_numel: u64,
    msg_size: usize,
    pkts_per_msg: u64,
    max_msgs: u64,
    initial_timeout: Duration,
    timeout_threshold: u64,
    instant_completion: bool,
}

impl RdmaWorker {
    pub(super) fn new(
        handle: WorkerHandle,
        connection: Arc<Connection>,
        tid: WorkerTid,
        qps_per_thread: usize,
    ) -> Self {
        let config = handle.config().clone();
        let g = &config.general;
        let ppp = prepost::create(g.prepostprocessor, g.num_workers, config.rdma.msg_numel);
        let initial_timeout = Duration::from_secs_f64(g.timeout_ms / 1000.0);
        let max_msgs = config.max_outstanding_msgs_per_thread();

        Self {
            connection,
            tid,
            qps_per_thread,
            ppp,
            timers: TimeoutQueue::new(
                qps_per_thread,
                initial_timeout,
                g.timeout_threshold,
                g.timeout_threshold_increment,
            ),
            msg_numel: config.rdma.msg_numel,
            msg_size: (config.rdma.msg_numel * ELEMENT_SIZE as u64) as usize,
            pkts_per_msg: config.packets_per_message(),
            max_msgs,
            initial_timeout,
            timeout_threshold: g.timeout_threshold,
            instant_completion: g.instant_job_completion,
            handle,
        }
    }

    /// Absolute index of this thread's `q`-th queue pair.
    fn qp_index(&self, q: usize) -> usize {
        self.tid as usize * self.qps_per_thread + q
    }

    /// Start of the message buffer owned by this thread's `q`-th queue
    /// pair.
    fn msg_ptr(&self, q: usize) -> *mut u8 {
        unsafe {
            self.connection
                .region()
                .as_ptr()
                .add(self.qp_index(q) * self.msg_size)
        }
    }

    pub(super) fn run(mut self) {
        // A worker thread on the wrong socket pays a cross-socket hop on
        // every completion; refusing to start is better than silently
        // running slow.
        let core = numa::bind_current_thread(self.connection.device_name(), self.tid as usize)
            .unwrap_or_else(|e| panic!("worker thread {}: core binding failed: {e}", self.tid));
        tracing::info!(tid = self.tid, core, "RDMA worker thread starting");

        // Work-request templates live for the whole thread; the scatter
        // list points into `sges`, so neither vector may move after this.
        let mut sges: Vec<ibverbs_sys::ibv_sge> = Vec::with_capacity(self.qps_per_thread);
        let mut send_wrs: Vec<ibverbs_sys::ibv_send_wr> = Vec::with_capacity(self.qps_per_thread);
        let mut recv_wrs: Vec<ibverbs_sys::ibv_recv_wr> = Vec::with_capacity(self.qps_per_thread);
        for q in 0..self.qps_per_thread {
            let wr_id = ((self.tid as u64) << 16) | q as u64;

            let mut sge: ibverbs_sys::ibv_sge = unsafe { std::mem::zeroed() };
            sge.addr = self.msg_ptr(q) as u64;
            sge.length = self.msg_size as u32;
            sge.lkey = self.connection.region().lkey();
            sges.push(sge);

            let mut recv_wr: ibverbs_sys::ibv_recv_wr = unsafe { std::mem::zeroed() };
            recv_wr.wr_id = wr_id;
            recv_wr.sg_list = std::ptr::null_mut();
            recv_wr.num_sge = 0;
            recv_wrs.push(recv_wr);

            let mut send_wr: ibverbs_sys::ibv_send_wr = unsafe { std::mem::zeroed() };
            send_wr.wr_id = wr_id;
            send_wr.sg_list = &mut sges[q];
            send_wr.num_sge = 1;
            send_wr.opcode = ibverbs_sys::ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
            send_wr.send_flags = 0;
            unsafe {
                // The same buffer is written remotely and received into;
                // the switch mirrors our own layout.
                send_wr.wr.rdma.remote_addr = sge.addr;
                // Slot index in the rkey bits, pool bit set so the flip
                // before the first post clears it.
                send_wr.wr.rdma.rkey = wire::initial_rkey_pool_index(
                    self.tid,
                    q as u64,
                    self.qps_per_thread as u64,
                    self.pkts_per_msg,
                );
            }
            send_wrs.push(send_wr);
        }

        let mut msg_ids: Vec<u64> = vec![0; self.qps_per_thread];
        let mut posted_counts: Vec<u64> = vec![0; self.qps_per_thread];
        let mut completions: Vec<ibverbs_sys::ibv_wc> = (0..self.qps_per_thread.max(16))
            .map(|_| ibverbs_sys::ibv_wc::default())
            .collect();

        while self.handle.is_running() {
            let Some(job_slice) = self.handle.get_job_slice(self.tid) else {
                continue;
            };
            tracing::debug!(
                tid = self.tid,
                job_id = job_slice.job.id,
                numel = job_slice.slice.numel,
                "received job slice"
            );

            if job_slice.slice.numel == 0 || self.instant_completion {
                self.handle.notify_slice_done(self.tid, &job_slice);
                continue;
            }

            if self.run_slice(
                &job_slice,
                &mut send_wrs,
                &mut recv_wrs,
                &mut msg_ids,
                &mut posted_counts,
                &mut completions,
            ) {
                self.handle.notify_slice_done(self.tid, &job_slice);
            }
        }
        tracing::info!(tid = self.tid, "RDMA worker thread exiting");
    }

    #[allow(clippy::too_many_arguments)]
    fn run_slice(
        &mut self,
        job_slice: &JobSlice,
        send_wrs: &mut [ibverbs_sys::ibv_send_wr],
        recv_wrs: &mut [ibverbs_sys::ibv_recv_wr],
        msg_ids: &mut [u64],
        posted_counts: &mut [u64],
        completions: &mut [ibverbs_sys::ibv_wc],
    ) -> bool {
        let total_main = prepost::total_main_ltus(job_slice.slice.numel, self.msg_numel);
        let batch = total_main.min(self.max_msgs);
        self.ppp.setup_slice(job_slice, batch);
        let total = if self.ppp.needs_extra_batch() {
            total_main + batch
        } else {
            total_main
        };

        self.timers
            .reset_timeout(self.initial_timeout, self.timeout_threshold);
        for (q, id) in msg_ids.iter_mut().enumerate().take(batch as usize) {
            *id = q as u64;
        }

        let mut sent_pkts = 0u64;
        let mut correct_pkts = 0u64;
        let wrong_pkts = 0u64;
        let mut timeout_pkts = 0u64;

        tracing::debug!(tid = self.tid, total, batch, "posting first batch");
        for q in 0..batch as usize {
            self.post_recv(q, recv_wrs);
            self.post_send(q, send_wrs, msg_ids, posted_counts, true);
            sent_pkts += self.pkts_per_msg;
        }

        let mut received = 0u64;
        while received < total && self.handle.is_running() {
            let n = self
                .connection
                .cq(self.tid as usize)
                .poll(completions)
                .unwrap_or_else(|e| {
                    panic!("worker thread {}: completion poll failed: {e}", self.tid)
                });

            for completion in completions.iter().take(n) {
                if let Some((status, vendor_err)) = completion.error() {
                    panic!(
                        "worker thread {}: work completion failed \
                         (status={status:?}, vendor_err={vendor_err}, wr_id={})",
                        self.tid,
                        completion.wr_id()
                    );
                }

                if completion.opcode == ibverbs_sys::ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM {
                    let q = (completion.wr_id() & 0xFFFF) as usize;
                    let imm = ImmData::decode(unsafe { completion.__bindgen_anon_1.imm_data });
                    tracing::trace!(
                        tid = self.tid,
                        q,
                        msg_id = msg_ids[q],
                        short_msg_id = imm.short_msg_id,
                        "received message"
                    );

                    let payload = unsafe {
                        std::slice::from_raw_parts(self.msg_ptr(q), self.msg_size)
                    };
                    let side: [u8; SIDE_CHANNEL_SIZE] = [imm.exponent as u8, 0];
                    self.ppp.postprocess(msg_ids[q], payload, &side);

                    self.timers.remove(q);
                    msg_ids[q] += batch;
                    received += 1;
                    correct_pkts += self.pkts_per_msg;

                    if msg_ids[q] < total {
                        self.post_recv(q, recv_wrs);
                        self.post_send(q, send_wrs, msg_ids, posted_counts, true);
                        sent_pkts += self.pkts_per_msg;
                    }
                } else if completion.opcode == ibverbs_sys::ibv_wc_opcode::IBV_WC_RDMA_WRITE {
                    // Signaled send completion; resources reclaimed, no
                    // protocol action.
                    tracing::trace!(
                        tid = self.tid,
                        wr_id = completion.wr_id(),
                        "write completion"
                    );
                } else {
                    panic!(
                        "worker thread {}: unexpected completion opcode {:?} for wr_id {}",
                        self.tid,
                        completion.opcode,
                        completion.wr_id()
                    );
                }
            }

            if let Some(q) = self.timers.check(Instant::now()) {
                tracing::trace!(tid = self.tid, q, "message timed out, reposting");
                timeout_pkts += self.pkts_per_msg;
                // Resend only: the receive is still posted and the buffer
                // still holds the preprocessed payload.
                self.post_send(q, send_wrs, msg_ids, posted_counts, false);
                sent_pkts += self.pkts_per_msg;
            }
        }

        let completed = received == total;
        self.ppp.cleanup_slice();

        let stats = self.handle.stats();
        stats.add_packets_sent(self.tid, sent_pkts);
        stats.add_correct_packets_received(self.tid, correct_pkts);
        stats.add_wrong_packets_received(self.tid, wrong_pkts);
        stats.add_timeouts(self.tid, timeout_pkts);

        tracing::debug!(tid = self.tid, received, total, completed, "slice done");
        completed
    }

    fn post_recv(&self, q: usize, recv_wrs: &mut [ibverbs_sys::ibv_recv_wr]) {
        self.connection
            .qp(self.qp_index(q))
            .post_recv(&mut recv_wrs[q])
            .unwrap_or_else(|e| panic!("worker thread {}: {e}", self.tid));
    }

    fn post_send(
        &mut self,
        q: usize,
        send_wrs: &mut [ibverbs_sys::ibv_send_wr],
        msg_ids: &[u64],
        posted_counts: &mut [u64],
        preprocess: bool,
    ) {
        let wr = &mut send_wrs[q];

        // Unsignaled sends never generate completions; signal one in
        // every 1024 so the send queue's resources get reclaimed.
        wr.send_flags = if posted_counts[q] % 1024 == 0 {
            ibverbs_sys::ibv_send_flags::IBV_SEND_SIGNALED.0
        } else {
            0
        };

        // Alternate the shadow twin at the switch.
        unsafe {
            wr.wr.rdma.rkey ^= 1;
        }

        let exponent = if preprocess {
            let payload =
                unsafe { std::slice::from_raw_parts_mut(self.msg_ptr(q), self.msg_size) };
            let mut side = [0u8; SIDE_CHANNEL_SIZE];
            self.ppp.preprocess(msg_ids[q], payload, &mut side);
            side[0] as i8
        } else {
            // Retransmission: keep the exponent the original carried.
            ImmData::decode(unsafe { wr.__bindgen_anon_1.imm_data }).exponent
        };
        unsafe {
            wr.__bindgen_anon_1.imm_data = ImmData {
                short_msg_id: msg_ids[q] as u16,
                exponent,
            }
            .encode();
        }

        tracing::trace!(
            tid = self.tid,
            q,
            msg_id = msg_ids[q],
            rkey = unsafe { wr.wr.rdma.rkey },
            "posting write"
        );
        self.connection
            .qp(self.qp_index(q))
            .post_send(wr)
            .unwrap_or_else(|e| panic!("worker thread {}: {e}", self.tid));

        self.timers.push(q, Instant::now());
        posted_counts[q] += 1;
    }
}
