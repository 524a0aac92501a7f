//! The per-thread UDP send/receive loop.
//!
//! Per job slice the thread walks SETUP → PRIME → STEADY → DRAIN: size
//! the window, optionally send the exponent-only priming batch, then keep
//! `batch` packets in flight, turning every accepted packet around into
//! the next packet for the same window position. Receive processing has
//! strict priority; the transmit buffer and the timers are serviced only
//! on idle polls.

use crate::bitmap::ReceiveBitmap;
use crate::context::WorkerHandle;
use crate::job::JobSlice;
use crate::prepost::{self, PrePostProcessor};
use crate::slots::SlotSequencer;
use crate::timeout::TimeoutQueue;
use crate::types::WorkerTid;
use crate::wire::{datagram_len, PacketHeader, SizeCategory, HEADER_SIZE, SIDE_CHANNEL_SIZE};
use crossbeam_queue::ArrayQueue;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

pub(super) struct UdpWorker {
    handle: WorkerHandle,
    tid: WorkerTid,
    socket: UdpSocket,
    switch_addr: SocketAddr,
    ppp: Box<dyn PrePostProcessor>,
    seq: SlotSequencer,
    timers: TimeoutQueue,
    bitmap: ReceiveBitmap,
    /// Recycled packet buffers; survive across job slices.
    pool: ArrayQueue<Vec<u8>>,
    max_out: u64,
    dgram_len: usize,
    ltu_numel: u64,
    size_category: SizeCategory,
    burst_rx: u32,
    burst_tx: usize,
    drain_interval: Duration,
    initial_timeout: Duration,
    timeout_threshold: u64,
    instant_completion: bool,
}

impl UdpWorker {
    pub(super) fn new(
        handle: WorkerHandle,
        tid: WorkerTid,
        socket: UdpSocket,
        switch_addr: SocketAddr,
    ) -> Self {
        let config = handle.config().clone();
        let g = &config.general;
        let max_out = config.max_outstanding_per_thread();
        let ppp = prepost::create(g.prepostprocessor, g.num_workers, g.packet_numel);
        let initial_timeout = Duration::from_secs_f64(g.timeout_ms / 1000.0);

        Self {
            tid,
            socket,
            switch_addr,
            ppp,
            seq: SlotSequencer::new(tid, max_out),
            timers: TimeoutQueue::new(
                max_out as usize,
                initial_timeout,
                g.timeout_threshold,
                g.timeout_threshold_increment,
            ),
            bitmap: ReceiveBitmap::new(0),
            pool: ArrayQueue::new(config.udp.pool_size.max(1) as usize),
            max_out,
            dgram_len: datagram_len(g.packet_numel),
            ltu_numel: g.packet_numel,
            size_category: SizeCategory::from_numel(g.packet_numel).expect("validated packet_numel"),
            burst_rx: config.udp.burst_rx,
            burst_tx: config.udp.burst_tx.max(1) as usize,
            drain_interval: Duration::from_micros(config.udp.bulk_drain_tx_us as u64),
            initial_timeout,
            timeout_threshold: g.timeout_threshold,
            instant_completion: g.instant_job_completion,
            handle,
        }
    }

    pub(super) fn run(mut self) {
        tracing::info!(tid = self.tid, "UDP worker thread starting");
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

            if self.run_slice(&job_slice) {
                self.handle.notify_slice_done(self.tid, &job_slice);
            }
        }
        tracing::info!(tid = self.tid, "UDP worker thread exiting");
    }

    /// Drive one job slice to completion. Returns false when the loop
    /// was abandoned because the context stopped.
    fn run_slice(&mut self, job_slice: &JobSlice) -> bool {
        let total_main = prepost::total_main_ltus(job_slice.slice.numel, self.ltu_numel);
        let batch = total_main.min(self.max_out);
        self.ppp.setup_slice(job_slice, batch);
        let total = if self.ppp.needs_extra_batch() {
            total_main + batch
        } else {
            total_main
        };
        let short_job_id = job_slice.job.id as u8;

        self.bitmap.reset(total);
        self.timers
            .reset_timeout(self.initial_timeout, self.timeout_threshold);

        let mut window: Vec<Vec<u8>> = (0..batch).map(|_| self.checkout_buffer()).collect();

        let mut sent = 0u64;
        let mut correct = 0u64;
        let mut wrong = 0u64;
        let mut timeouts = 0u64;

        tracing::debug!(tid = self.tid, total, batch, "sending first batch");
        for pkt_id in 0..batch {
            let w = pkt_id as usize;
            self.build_packet(&mut window[w], short_job_id, pkt_id);
            self.blocking_send(&window[w]);
            sent += 1;
            self.timers.push(w, Instant::now());
        }

        let mut received = 0u64;
        let mut rx_buf = vec![0u8; self.dgram_len.max(2048)];
        let mut tx_queue: Vec<usize> = Vec::with_capacity(self.burst_tx);
        let mut last_drain = Instant::now();

        while received < total && self.handle.is_running() {
            let mut got_any = false;
            for _ in 0..self.burst_rx {
                let n = match self.socket.recv_from(&mut rx_buf) {
                    Ok((n, _src)) => n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    // ICMP unreachable surfacing through the socket is
                    // not a data-plane event.
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
                        ) =>
                    {
                        continue
                    }
                    Err(e) => panic!("worker thread {}: socket receive failed: {e}", self.tid),
                };
                got_any = true;

                let Some(header) = PacketHeader::decode(&rx_buf[..n]) else {
                    wrong += 1;
                    continue;
                };
                let pkt_id = header.pkt_id as u64;
                if n < self.dgram_len || pkt_id >= total {
                    tracing::trace!(tid = self.tid, pkt_id, n, "discarded malformed packet");
                    wrong += 1;
                    continue;
                }
                if self.bitmap.test(pkt_id) {
                    tracing::trace!(tid = self.tid, pkt_id, "discarded duplicate packet");
                    wrong += 1;
                    continue;
                }
                if header.short_job_id != short_job_id {
                    tracing::trace!(
                        tid = self.tid,
                        pkt_id,
                        got = header.short_job_id,
                        expected = short_job_id,
                        "discarded packet from wrong job"
                    );
                    wrong += 1;
                    continue;
                }

                let side: &[u8; SIDE_CHANNEL_SIZE] = rx_buf
                    [HEADER_SIZE..HEADER_SIZE + SIDE_CHANNEL_SIZE]
                    .try_into()
                    .expect("side channel slice");
                let payload = &rx_buf[HEADER_SIZE + SIDE_CHANNEL_SIZE..self.dgram_len];
                self.ppp.postprocess(pkt_id, payload, side);
                self.bitmap.set(pkt_id);
                received += 1;
                correct += 1;

                let w = (pkt_id % batch) as usize;
                self.timers.remove(w);

                // Turn the buffer around for the next packet of this
                // window position.
                let next = pkt_id + batch;
                if next < total {
                    self.build_packet(&mut window[w], short_job_id, next);
                    tx_queue.push(w);
                    self.timers.push(w, Instant::now());
                    if tx_queue.len() >= self.burst_tx {
                        sent += self.flush(&window, &mut tx_queue);
                        last_drain = Instant::now();
                    }
                }
            }

            // Receive processing has priority; only an idle poll services
            // the transmit buffer and the timers.
            if !got_any {
                let now = Instant::now();
                if !tx_queue.is_empty() && now.duration_since(last_drain) > self.drain_interval {
                    sent += self.flush(&window, &mut tx_queue);
                    last_drain = now;
                }
                if let Some(w) = self.timers.check(now) {
                    tracing::trace!(tid = self.tid, slot = w, "timeout, retransmitting");
                    timeouts += 1;
                    self.blocking_send(&window[w]);
                    sent += 1;
                    self.timers.push(w, Instant::now());
                }
            }
        }

        let completed = received == total;

        // The switch walk continues from here in the next slice even if
        // this one was abandoned.
        self.seq.advance_slice(total);
        self.ppp.cleanup_slice();
        for buf in window {
            let _ = self.pool.push(buf);
        }

        let stats = self.handle.stats();
        stats.add_packets_sent(self.tid, sent);
        stats.add_correct_packets_received(self.tid, correct);
        stats.add_wrong_packets_received(self.tid, wrong);
        stats.add_timeouts(self.tid, timeouts);

        tracing::debug!(tid = self.tid, received, total, completed, "slice done");
        completed
    }

    fn build_packet(&mut self, buf: &mut [u8], short_job_id: u8, pkt_id: u64) {
        let slot = self.seq.slot_for(pkt_id);
        let header = PacketHeader {
            size_category: self.size_category,
            short_job_id,
            pkt_id: pkt_id as u32,
            slot,
        };
        header.encode(&mut buf[..HEADER_SIZE]);
        let (side, payload) = buf[HEADER_SIZE..].split_at_mut(SIDE_CHANNEL_SIZE);
        let side: &mut [u8; SIDE_CHANNEL_SIZE] = side.try_into().expect("side channel slice");
        self.ppp.preprocess(pkt_id, payload, side);
        tracing::trace!(
            tid = self.tid,
            pkt_id,
            slot = slot.index,
            shadow = slot.shadow,
            "built packet"
        );
    }

    fn checkout_buffer(&self) -> Vec<u8> {
        self.pool
            .pop()
            .unwrap_or_else(|| vec![0u8; self.dgram_len])
    }

    fn blocking_send(&self, buf: &[u8]) {
        loop {
            match self.socket.send_to(buf, self.switch_addr) {
                Ok(_) => return,
                Err(e)
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
                {
                    std::hint::spin_loop();
                }
                // A pending ICMP unreachable can surface on the next
                // socket op; the datagram itself is on the wire or lost,
                // and loss is what the timers exist for.
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
                    ) =>
                {
                    return;
                }
                Err(e) => panic!("worker thread {}: socket send failed: {e}", self.tid),
            }
        }
    }

    fn flush(&self, window: &[Vec<u8>], tx_queue: &mut Vec<usize>) -> u64 {
        let n = tx_queue.len() as u64;
        for &w in tx_queue.iter() {
            self.blocking_send(&window[w]);
        }
        tx_queue.clear();
        n
    }
}
