//! Register-protocol routing: `VPDT`-framed datagrams keyed by the
//! sender's network address.

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, warn};

use vpdt_shared::DETECTOR_REGISTER_PORT;
use vpdt_shared::frame::{self, RegisterKind};

use super::Wire;

/// Routing rules for the register protocol socket.
#[derive(Clone, Copy, Debug)]
pub struct RegisterWire {
    /// Port detectors answer from; anything else is foreign traffic
    pub detector_port: u16,
}

impl Default for RegisterWire {
    fn default() -> Self {
        Self {
            detector_port: DETECTOR_REGISTER_PORT,
        }
    }
}

impl Wire for RegisterWire {
    type Key = IpAddr;

    const NAME: &'static str = "register";

    fn decode(&self, datagram: &[u8], src: SocketAddr) -> Option<(IpAddr, u32, Vec<u8>)> {
        if src.port() != self.detector_port {
            return None;
        }
        let (id, payload) = frame::decode_register(datagram).ok()?;
        match RegisterKind::from(id) {
            RegisterKind::Control | RegisterKind::Stream => Some((src.ip(), id, payload.to_vec())),
            RegisterKind::Heartbeat => {
                // Reserved for liveness tracking.
                debug!("heartbeat/correction packet from {}", src.ip());
                None
            }
            RegisterKind::Unknown(other) => {
                warn!("unrecognized register packet type {other} from {}", src.ip());
                None
            }
        }
    }

    fn encode(&self, _key: &IpAddr, id: u32, payload: &[u8]) -> Vec<u8> {
        frame::encode_register(id, payload)
    }

    fn dest(&self, key: &IpAddr) -> SocketAddr {
        SocketAddr::new(*key, self.detector_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpdt_shared::frame::encode_register;

    fn src(port: u16) -> SocketAddr {
        ([10, 20, 22, 240], port).into()
    }

    #[test]
    fn routes_control_and_stream_by_source_ip() {
        let wire = RegisterWire::default();
        let datagram = encode_register(2, &[1, 2]);
        let (key, id, payload) = wire.decode(&datagram, src(DETECTOR_REGISTER_PORT)).unwrap();
        assert_eq!(key, IpAddr::from([10, 20, 22, 240]));
        assert_eq!(id, 2);
        assert_eq!(payload, vec![1, 2]);
    }

    #[test]
    fn drops_foreign_ports_heartbeats_and_garbage() {
        let wire = RegisterWire::default();
        assert!(wire.decode(&encode_register(1, &[]), src(9999)).is_none());
        assert!(
            wire.decode(&encode_register(3, &[]), src(DETECTOR_REGISTER_PORT))
                .is_none()
        );
        assert!(
            wire.decode(&encode_register(17, &[]), src(DETECTOR_REGISTER_PORT))
                .is_none()
        );
        assert!(wire.decode(b"shrt", src(DETECTOR_REGISTER_PORT)).is_none());
    }
}
