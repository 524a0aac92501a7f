//! NUMA-aware worker-thread pinning.
//!
//! The poll loops are latency-sensitive; a worker thread scheduled on the
//! far socket from the NIC costs a cross-socket hop on every completion.
//! Threads are pinned to distinct cores on the NIC's node, in core-id
//! order by worker index.

use crate::error::{RdmaError, Result};

/// NUMA node of an RDMA device, from sysfs. Returns -1 on single-node
/// systems, which `cores_on_node` treats as node 0.
pub fn device_numa_node(device_name: &str) -> Result<i32> {
    let path = format!("/sys/class/infiniband/{device_name}/device/numa_node");
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| RdmaError::Setup(format!("reading {path}: {e}")))?;
    contents
        .trim()
        .parse::<i32>()
        .map_err(|e| RdmaError::Setup(format!("parsing {path}: {e}")))
}

/// Physical core ids on the given NUMA node, in ascending order.
pub fn cores_on_node(node: i32) -> Result<Vec<usize>> {
    let node = node.max(0);
    let path = format!("/sys/devices/system/node/node{node}/cpulist");
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| RdmaError::Setup(format!("reading {path}: {e}")))?;
    parse_cpulist(contents.trim())
        .ok_or_else(|| RdmaError::Setup(format!("malformed cpulist in {path}: {contents:?}")))
}

/// Parse the kernel's cpulist format, e.g. `0-7,16-23` or `0,2,4`.
fn parse_cpulist(list: &str) -> Option<Vec<usize>> {
    let mut cores = Vec::new();
    if list.is_empty() {
        return Some(cores);
    }
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

/// Pin the calling thread to the `worker_index`-th core on the NUMA node
/// of `device_name`. Returns the chosen core id. Fails if the node has
/// fewer cores than worker threads.
pub fn bind_current_thread(device_name: &str, worker_index: usize) -> Result<usize> {
    let node = device_numa_node(device_name)?;
    let cores = cores_on_node(node)?;
    if worker_index >= cores.len() {
        return Err(RdmaError::Setup(format!(
            "worker {worker_index} cannot be pinned: only {} cores on NUMA node {node} of {device_name}",
            cores.len()
        )));
    }
    let core = cores[worker_index];

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(RdmaError::Io(std::io::Error::last_os_error()));
        }
    }

    tracing::debug!(worker_index, core, node, "pinned worker thread");
    Ok(core)
}
