//! Control-plane client.
//!
//! One synchronous TCP exchange per RPC against the controller that
//! programs the switch. The engine touches the controller only during
//! backend setup: agree on a session id, install switch state, and
//! rendezvous so no worker sends data-plane traffic before the switch is
//! ready.
//!
//! Frame layout: an 8-byte header (`payload_length: u32` LE, protocol
//! version, message kind, two reserved zero bytes) followed by the
//! rkyv-encoded message.

use crate::error::{NetaggError, Result};
use crate::types::Rank;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Control-plane protocol version.
pub const CONTROLLER_PROTOCOL_VERSION: u8 = 1;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

/// Requests the engine can make of the controller.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum ControllerRequest {
    /// Propagate a 64-bit value from `root` to every worker.
    Broadcast {
        value: u64,
        rank: Rank,
        num_workers: u16,
        root: Rank,
    },

    /// Rendezvous across all workers.
    Barrier { num_workers: u16 },

    /// Install switch state for a UDP session and learn the switch's
    /// data-plane address.
    CreateUdpSession {
        session_id: u64,
        rank: Rank,
        num_workers: u16,
        worker_ip: u32,
        worker_port: u16,
        packet_size_category: u8,
    },

    /// Install switch state for an RDMA session: this worker's memory
    /// region and queue pairs.
    CreateRdmaSession {
        session_id: u64,
        rank: Rank,
        num_workers: u16,
        mac: u64,
        ipv4: u32,
        rkey: u32,
        packet_size_category: u8,
        message_size: u32,
        qpns: Vec<u32>,
        psns: Vec<u32>,
    },
}

/// Controller replies, one variant per request.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum ControllerResponse {
    Broadcast {
        value: u64,
    },
    Barrier,
    UdpSession {
        switch_ip: u32,
        switch_port: u16,
    },
    RdmaSession {
        mac: u64,
        ipv4: u32,
        rkey: u32,
        qpns: Vec<u32>,
        psns: Vec<u32>,
    },
}

/// Switch-side connection info returned by `create_rdma_session`.
#[derive(Debug, Clone, PartialEq)]
pub struct RdmaSessionInfo {
    pub mac: u64,
    pub ipv4: u32,
    pub rkey: u32,
    pub qpns: Vec<u32>,
    pub psns: Vec<u32>,
}

fn encode_frame(payload: &[u8], kind: u8) -> Result<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(NetaggError::EncodeFailed(format!(
            "payload of {} bytes exceeds u32::MAX",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.push(CONTROLLER_PROTOCOL_VERSION);
    buf.push(kind);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode a request into a framed byte buffer.
pub fn encode_request(req: &ControllerRequest) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(req)
        .map_err(|e| NetaggError::EncodeFailed(e.to_string()))?;
    encode_frame(&payload, KIND_REQUEST)
}

/// Encode a response into a framed byte buffer.
pub fn encode_response(resp: &ControllerResponse) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(resp)
        .map_err(|e| NetaggError::EncodeFailed(e.to_string()))?;
    encode_frame(&payload, KIND_RESPONSE)
}

fn read_frame(stream: &mut impl Read, expected_kind: u8) -> Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if header[4] != CONTROLLER_PROTOCOL_VERSION {
        return Err(NetaggError::DecodeFailed(format!(
            "controller protocol version mismatch: {} != {CONTROLLER_PROTOCOL_VERSION}",
            header[4]
        )));
    }
    if header[5] != expected_kind {
        return Err(NetaggError::DecodeFailed(format!(
            "unexpected frame kind {} (wanted {expected_kind})",
            header[5]
        )));
    }
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Read and decode one request frame (the controller side of the wire).
pub fn read_request(stream: &mut impl Read) -> Result<ControllerRequest> {
    let payload = read_frame(stream, KIND_REQUEST)?;
    rkyv::from_bytes::<ControllerRequest, rkyv::rancor::Error>(&payload)
        .map_err(|e| NetaggError::DecodeFailed(e.to_string()))
}

/// Read and decode one response frame.
pub fn read_response(stream: &mut impl Read) -> Result<ControllerResponse> {
    let payload = read_frame(stream, KIND_RESPONSE)?;
    rkyv::from_bytes::<ControllerResponse, rkyv::rancor::Error>(&payload)
        .map_err(|e| NetaggError::DecodeFailed(e.to_string()))
}

/// Synchronous client for the controller RPCs.
pub struct ControllerClient {
    stream: TcpStream,
}

impl ControllerClient {
    pub fn connect(ip: &str, port: u16) -> Result<Self> {
        let addr = format!("{ip}:{port}");
        let stream = TcpStream::connect(&addr)
            .map_err(|e| NetaggError::controller("connect", format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        tracing::info!(%addr, "connected to controller");
        Ok(Self { stream })
    }

    fn call(&mut self, rpc: &'static str, req: &ControllerRequest) -> Result<ControllerResponse> {
        let frame = encode_request(req)?;
        self.stream
            .write_all(&frame)
            .map_err(|e| NetaggError::controller(rpc, e.to_string()))?;
        read_response(&mut self.stream)
            .map_err(|e| NetaggError::controller(rpc, e.to_string()))
    }

    /// Propagate `value` from `root`; every rank receives the root's
    /// value.
    pub fn broadcast(
        &mut self,
        value: u64,
        rank: Rank,
        num_workers: u16,
        root: Rank,
    ) -> Result<u64> {
        let resp = self.call(
            "broadcast",
            &ControllerRequest::Broadcast {
                value,
                rank,
                num_workers,
                root,
            },
        )?;
        match resp {
            ControllerResponse::Broadcast { value } => Ok(value),
            other => Err(NetaggError::controller(
                "broadcast",
                format!("unexpected response {other:?}"),
            )),
        }
    }

    /// Block until all `num_workers` workers have called.
    pub fn barrier(&mut self, num_workers: u16) -> Result<()> {
        match self.call("barrier", &ControllerRequest::Barrier { num_workers })? {
            ControllerResponse::Barrier => Ok(()),
            other => Err(NetaggError::controller(
                "barrier",
                format!("unexpected response {other:?}"),
            )),
        }
    }

    /// Install UDP session state; returns the switch data-plane address.
    #[allow(clippy::too_many_arguments)]
    pub fn create_udp_session(
        &mut self,
        session_id: u64,
        rank: Rank,
        num_workers: u16,
        worker_ip: u32,
        worker_port: u16,
        packet_size_category: u8,
    ) -> Result<(u32, u16)> {
        let resp = self.call(
            "create_udp_session",
            &ControllerRequest::CreateUdpSession {
                session_id,
                rank,
                num_workers,
                worker_ip,
                worker_port,
                packet_size_category,
            },
        )?;
        match resp {
            ControllerResponse::UdpSession {
                switch_ip,
                switch_port,
            } => Ok((switch_ip, switch_port)),
            other => Err(NetaggError::controller(
                "create_udp_session",
                format!("unexpected response {other:?}"),
            )),
        }
    }

    /// Install RDMA session state; returns the switch-side region and
    /// queue pairs.
    #[allow(clippy::too_many_arguments)]
    pub fn create_rdma_session(
        &mut self,
        session_id: u64,
        rank: Rank,
        num_workers: u16,
        mac: u64,
        ipv4: u32,
        rkey: u32,
        packet_size_category: u8,
        message_size: u32,
        qpns: Vec<u32>,
        psns: Vec<u32>,
    ) -> Result<RdmaSessionInfo> {
        let resp = self.call(
            "create_rdma_session",
            &ControllerRequest::CreateRdmaSession {
                session_id,
                rank,
                num_workers,
                mac,
                ipv4,
                rkey,
                packet_size_category,
                message_size,
                qpns,
                psns,
            },
        )?;
        match resp {
            ControllerResponse::RdmaSession {
                mac,
                ipv4,
                rkey,
                qpns,
                psns,
            } => Ok(RdmaSessionInfo {
                mac,
                ipv4,
                rkey,
                qpns,
                psns,
            }),
            other => Err(NetaggError::controller(
                "create_rdma_session",
                format!("unexpected response {other:?}"),
            )),
        }
    }
}

/// Session id minted by rank 0: nanoseconds since the epoch, unique
/// enough to tell stale switch state from the current session.
pub fn mint_session_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_request_roundtrip() {
        let req = ControllerRequest::CreateRdmaSession {
            session_id: 0xDEAD_BEEF,
            rank: 1,
            num_workers: 4,
            mac: 0x02_1b_21_aa_bb_cc,
            ipv4: 0x0a00002a,
            rkey: 77,
            packet_size_category: 2,
            message_size: 4096,
            qpns: vec![10, 11, 12],
            psns: vec![5, 5, 6],
        };
        let frame = encode_request(&req).unwrap();
        let decoded = read_request(&mut frame.as_slice()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = ControllerResponse::UdpSession {
            switch_ip: 0x0a000001,
            switch_port: 48000,
        };
        let frame = encode_response(&resp).unwrap();
        let decoded = read_response(&mut frame.as_slice()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let frame = encode_response(&ControllerResponse::Barrier).unwrap();
        assert!(read_request(&mut frame.as_slice()).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut frame = encode_response(&ControllerResponse::Barrier).unwrap();
        frame[4] = 99;
        assert!(read_response(&mut frame.as_slice()).is_err());
    }

    /// Spin up a single-connection controller stub and run the setup
    /// handshake against it.
    #[test]
    fn test_client_rpcs_against_stub() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            loop {
                let req = match read_request(&mut stream) {
                    Ok(req) => req,
                    Err(_) => break, // client hung up
                };
                let resp = match req {
                    ControllerRequest::Broadcast { value, .. } => {
                        ControllerResponse::Broadcast { value }
                    }
                    ControllerRequest::Barrier { .. } => ControllerResponse::Barrier,
                    ControllerRequest::CreateUdpSession { .. } => ControllerResponse::UdpSession {
                        switch_ip: 7,
                        switch_port: 9,
                    },
                    ControllerRequest::CreateRdmaSession { qpns, .. } => {
                        ControllerResponse::RdmaSession {
                            mac: 1,
                            ipv4: 2,
                            rkey: 3,
                            psns: vec![0; qpns.len()],
                            qpns,
                        }
                    }
                };
                stream.write_all(&encode_response(&resp).unwrap()).unwrap();
            }
        });

        let mut client = ControllerClient::connect("127.0.0.1", port).unwrap();
        assert_eq!(client.broadcast(42, 0, 2, 0).unwrap(), 42);
        client.barrier(2).unwrap();
        assert_eq!(
            client.create_udp_session(1, 0, 2, 0, 47000, 2).unwrap(),
            (7, 9)
        );
        let info = client
            .create_rdma_session(1, 0, 2, 10, 20, 30, 2, 4096, vec![1, 2], vec![0, 1])
            .unwrap();
        assert_eq!(info.qpns, vec![1, 2]);
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn test_session_ids_advance() {
        let a = mint_session_id();
        let b = mint_session_id();
        assert!(b >= a);
    }
}
