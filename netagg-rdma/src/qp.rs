//! Unreliable-connected queue-pair bringup and work-request wrappers.
//!
//! Bringup follows the standard RESET → INIT → RTR → RTS sequence. UC
//! transport carries no ACK/retry machinery, so the RTR/RTS attribute
//! masks omit the RC-only fields.

use crate::error::{RdmaError, Result};
use std::os::raw::c_int;
use std::ptr;

/// Path MTU for the data path. One switch packet must fit in one MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMtu {
    Mtu256,
    Mtu1024,
}

/// A completion queue polled directly from a worker thread.
pub struct CompletionQueue {
    cq: *mut ibverbs_sys::ibv_cq,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    pub(crate) fn from_raw(cq: *mut ibverbs_sys::ibv_cq) -> Self {
        Self { cq }
    }

    pub(crate) fn as_raw(&self) -> *mut ibverbs_sys::ibv_cq {
        self.cq
    }

    /// Poll up to `completions.len()` entries. Returns how many were
    /// reaped.
    pub fn poll(&self, completions: &mut [ibverbs_sys::ibv_wc]) -> Result<usize> {
        unsafe {
            let ctx = (*self.cq).context;
            let ops = &mut (*ctx).ops;
            let n = ops.poll_cq.as_mut().expect("poll_cq missing")(
                self.cq,
                completions.len() as c_int,
                completions.as_mut_ptr(),
            );
            if n < 0 {
                return Err(RdmaError::Post(format!("ibv_poll_cq failed (rc={n})")));
            }
            Ok(n as usize)
        }
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
        }
    }
}

/// An unreliable-connected queue pair.
pub struct QueuePair {
    qp: *mut ibverbs_sys::ibv_qp,
    port: u8,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    pub(crate) fn from_raw(qp: *mut ibverbs_sys::ibv_qp, port: u8) -> Self {
        Self { qp, port }
    }

    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.qp).qp_num }
    }

    /// RESET → INIT. Generates the local queue pair number.
    pub fn to_init(&self) -> Result<()> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibverbs_sys::ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = self.port;
            attr.qp_access_flags = (ibverbs_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
                .0;

            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PORT
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(RdmaError::Setup(format!(
                    "ibv_modify_qp to INIT failed (rc={rc})"
                )));
            }
            Ok(())
        }
    }

    /// INIT → RTR: ready to receive from the remote queue pair.
    pub fn to_rtr(
        &self,
        mtu: PathMtu,
        dest_qpn: u32,
        rq_psn: u32,
        dgid: [u8; 16],
        gid_index: u8,
    ) -> Result<()> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibverbs_sys::ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = match mtu {
                PathMtu::Mtu256 => ibverbs_sys::IBV_MTU_256,
                PathMtu::Mtu1024 => ibverbs_sys::IBV_MTU_1024,
            };
            attr.dest_qp_num = dest_qpn;
            attr.rq_psn = rq_psn;

            attr.ah_attr.is_global = 1;
            attr.ah_attr.dlid = 0; // RoCE routes by GID, not LID
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = self.port;
            attr.ah_attr.grh.dgid.raw = dgid;
            attr.ah_attr.grh.sgid_index = gid_index;
            attr.ah_attr.grh.flow_label = 0;
            attr.ah_attr.grh.hop_limit = 0xFF;
            attr.ah_attr.grh.traffic_class = 1;

            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_AV
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_RQ_PSN;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(RdmaError::Setup(format!(
                    "ibv_modify_qp to RTR failed (rc={rc})"
                )));
            }
            Ok(())
        }
    }

    /// RTR → RTS: ready to send.
    pub fn to_rts(&self, sq_psn: u32) -> Result<()> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibverbs_sys::ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = sq_psn;

            let mask = ibverbs_sys::ibv_qp_attr_mask::IBV_QP_STATE
                | ibverbs_sys::ibv_qp_attr_mask::IBV_QP_SQ_PSN;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(RdmaError::Setup(format!(
                    "ibv_modify_qp to RTS failed (rc={rc})"
                )));
            }
            Ok(())
        }
    }

    /// Post a send work request built by the caller.
    pub fn post_send(&self, wr: &mut ibverbs_sys::ibv_send_wr) -> Result<()> {
        unsafe {
            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let rc = ops.post_send.as_mut().expect("post_send missing")(
                self.qp,
                wr as *mut _,
                &mut bad_wr as *mut _,
            );
            if rc != 0 || !bad_wr.is_null() {
                return Err(RdmaError::Post(format!(
                    "ibv_post_send failed (rc={rc}, wr_id={})",
                    wr.wr_id
                )));
            }
            Ok(())
        }
    }

    /// Post a receive work request built by the caller.
    pub fn post_recv(&self, wr: &mut ibverbs_sys::ibv_recv_wr) -> Result<()> {
        unsafe {
            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let rc = ops.post_recv.as_mut().expect("post_recv missing")(
                self.qp,
                wr as *mut _,
                &mut bad_wr as *mut _,
            );
            if rc != 0 || !bad_wr.is_null() {
                return Err(RdmaError::Post(format!(
                    "ibv_post_recv failed (rc={rc}, wr_id={})",
                    wr.wr_id
                )));
            }
            Ok(())
        }
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
        }
    }
}
