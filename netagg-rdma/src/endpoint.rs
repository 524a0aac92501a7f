//! Device discovery and shared per-device resources.

use crate::error::{RdmaError, Result};
use crate::gid;
use crate::mr::PinnedRegion;
use crate::qp::{CompletionQueue, QueuePair};
use std::ffi::CStr;
use std::os::raw::c_int;
use std::ptr;

/// An opened RDMA device: context, protection domain, and the queried GID
/// for the configured port. All queue pairs and memory regions for a
/// session are created from one endpoint.
pub struct RdmaEndpoint {
    ctx: *mut ibverbs_sys::ibv_context,
    pd: *mut ibverbs_sys::ibv_pd,
    device_name: String,
    port: u8,
    gid_index: u8,
    gid_raw: [u8; 16],
}

unsafe impl Send for RdmaEndpoint {}
unsafe impl Sync for RdmaEndpoint {}

impl RdmaEndpoint {
    /// Open the device with the given name (e.g. `mlx5_0`) and query the
    /// GID at `gid_index` on `port`.
    pub fn open(device_name: &str, port: u8, gid_index: u8) -> Result<Self> {
        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                return Err(RdmaError::setup("no RDMA devices found"));
            }

            let mut chosen = ptr::null_mut();
            for i in 0..num_devices as usize {
                let dev = *dev_list.add(i);
                let name = CStr::from_ptr(ibverbs_sys::ibv_get_device_name(dev));
                if name.to_string_lossy() == device_name {
                    chosen = dev;
                    break;
                }
            }
            if chosen.is_null() {
                ibverbs_sys::ibv_free_device_list(dev_list);
                return Err(RdmaError::Setup(format!(
                    "device '{device_name}' not found ({num_devices} devices present)"
                )));
            }

            let ctx = ibverbs_sys::ibv_open_device(chosen);
            ibverbs_sys::ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(RdmaError::Setup(format!(
                    "ibv_open_device failed for '{device_name}'"
                )));
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                ibverbs_sys::ibv_close_device(ctx);
                return Err(RdmaError::setup("ibv_alloc_pd failed"));
            }

            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            let rc =
                ibverbs_sys::ibv_query_gid(ctx, port, gid_index as c_int, &mut gid);
            if rc != 0 {
                ibverbs_sys::ibv_dealloc_pd(pd);
                ibverbs_sys::ibv_close_device(ctx);
                return Err(RdmaError::Setup(format!(
                    "ibv_query_gid failed for port {port} gid_index {gid_index} (rc={rc})"
                )));
            }

            tracing::debug!(device = device_name, port, gid_index, "opened RDMA device");

            Ok(Self {
                ctx,
                pd,
                device_name: device_name.to_string(),
                port,
                gid_index,
                gid_raw: gid.raw,
            })
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn gid_index(&self) -> u8 {
        self.gid_index
    }

    pub fn gid_raw(&self) -> [u8; 16] {
        self.gid_raw
    }

    /// MAC address implied by this port's GID (low 48 bits).
    pub fn mac(&self) -> u64 {
        gid::gid_to_mac(&self.gid_raw)
    }

    /// IPv4 address implied by this port's GID. Only meaningful for
    /// IP-based GIDs (gid_index 2 or 3).
    pub fn ipv4(&self) -> u32 {
        gid::gid_to_ipv4(&self.gid_raw)
    }

    /// Create a completion queue with `depth` entries, polled directly by
    /// a worker thread (no completion channel).
    pub fn create_cq(&self, depth: i32) -> Result<CompletionQueue> {
        unsafe {
            let cq = ibverbs_sys::ibv_create_cq(
                self.ctx,
                depth,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if cq.is_null() {
                return Err(RdmaError::Setup(format!(
                    "ibv_create_cq failed (depth {depth})"
                )));
            }
            Ok(CompletionQueue::from_raw(cq))
        }
    }

    /// Create an unreliable-connected queue pair bound to `cq` for both
    /// send and receive completions, left in the RESET state.
    pub fn create_uc_qp(&self, cq: &CompletionQueue, max_wr: u32) -> Result<QueuePair> {
        unsafe {
            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init_attr.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_UC;
            init_attr.send_cq = cq.as_raw();
            init_attr.recv_cq = cq.as_raw();
            init_attr.cap.max_send_wr = max_wr;
            init_attr.cap.max_recv_wr = max_wr;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;

            let qp = ibverbs_sys::ibv_create_qp(self.pd, &mut init_attr);
            if qp.is_null() {
                return Err(RdmaError::setup("ibv_create_qp failed"));
            }
            Ok(QueuePair::from_raw(qp, self.port))
        }
    }

    /// Map `len` bytes at the fixed virtual address `addr` and register
    /// the mapping for local and remote write.
    pub fn register_fixed(&self, addr: usize, len: usize) -> Result<PinnedRegion> {
        PinnedRegion::map_and_register(self.pd, addr, len)
    }
}

impl Drop for RdmaEndpoint {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}
