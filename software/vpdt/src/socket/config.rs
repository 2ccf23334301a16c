//! Config-protocol routing: `VPDTCH`-framed datagrams keyed by the
//! hardware MAC carried in the frame. Requests always go to the
//! broadcast target; the MAC in the frame selects which detector acts.

use std::net::{Ipv4Addr, SocketAddr};

use tracing::warn;

use vpdt_shared::DETECTOR_CONFIG_PORT;
use vpdt_shared::frame::{self, ConfigKind, Mac};

use super::Wire;

/// Routing rules for the config protocol socket.
#[derive(Clone, Copy, Debug)]
pub struct ConfigWire {
    /// Where requests are sent; detectors answer from this port
    pub target: SocketAddr,
}

impl Default for ConfigWire {
    fn default() -> Self {
        Self {
            target: (Ipv4Addr::BROADCAST, DETECTOR_CONFIG_PORT).into(),
        }
    }
}

impl Wire for ConfigWire {
    type Key = Mac;

    const NAME: &'static str = "config";

    fn decode(&self, datagram: &[u8], src: SocketAddr) -> Option<(Mac, u32, Vec<u8>)> {
        if src.port() != self.target.port() {
            return None;
        }
        let (mac, id, payload) = frame::decode_config(datagram).ok()?;
        match ConfigKind::from(id) {
            ConfigKind::Unknown(other) => {
                warn!("unrecognized config packet type {other} from {mac}");
                None
            }
            _ => Some((mac, id, payload.to_vec())),
        }
    }

    fn encode(&self, key: &Mac, id: u32, payload: &[u8]) -> Vec<u8> {
        frame::encode_config(*key, id, payload)
    }

    fn dest(&self, _key: &Mac) -> SocketAddr {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpdt_shared::frame::encode_config;

    const MAC: Mac = Mac([2, 4, 6, 8, 10, 12]);

    #[test]
    fn routes_by_frame_mac() {
        let wire = ConfigWire::default();
        let datagram = encode_config(MAC, 1, &[0; 4]);
        let src: SocketAddr = ([192, 168, 1, 7], DETECTOR_CONFIG_PORT).into();
        let (key, id, payload) = wire.decode(&datagram, src).unwrap();
        assert_eq!(key, MAC);
        assert_eq!(id, 1);
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn drops_foreign_ports_and_unknown_kinds() {
        let wire = ConfigWire::default();
        let good_src: SocketAddr = ([192, 168, 1, 7], DETECTOR_CONFIG_PORT).into();
        let bad_src: SocketAddr = ([192, 168, 1, 7], 1234).into();
        assert!(wire.decode(&encode_config(MAC, 1, &[0; 4]), bad_src).is_none());
        assert!(wire.decode(&encode_config(MAC, 99, &[0; 4]), good_src).is_none());
    }
}
