//! Register-protocol hub: socket ownership, background dispatch, and
//! subnet discovery of detector modules.
//!
//! Discovery exchanges broadcast probes directly on the hub socket and
//! is meant to run before [`DetectorHub::listen`] starts the background
//! threads, mirroring how the detectors are brought up in the field.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use vpdt_shared::control::{ByteStruct, ByteStructLen, RegReadReply, RegReadRequest};
use vpdt_shared::{DETECTOR_REGISTER_PORT, HOST_REGISTER_PORT};
use vpdt_shared::frame::{self, RegisterKind};
use vpdt_shared::models::model_params;

use crate::detector::Detector;
use crate::error::Result;
use crate::socket::{Dispatch, LOOP_TIMEOUT, RX_BUFFER_LEN, RegisterWire};

/// How long to collect responses to a discovery broadcast.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

/// Model identifier fragments live in registers 0 and 1.
const MODEL_FRAGMENT_REGS: [u16; 2] = [0, 1];

/// Owns the register-protocol socket and the set of discovered devices.
pub struct DetectorHub {
    dispatch: Arc<Dispatch<RegisterWire>>,
    broadcast: SocketAddr,
    devices: Mutex<BTreeMap<IpAddr, Detector>>,
}

impl DetectorHub {
    /// Bind on the standard host-side register port on all interfaces.
    pub fn bind_default() -> Result<Self> {
        Self::bind((Ipv4Addr::UNSPECIFIED, HOST_REGISTER_PORT).into())
    }

    /// Bind the hub socket with production routing (detector port 7493,
    /// subnet broadcast probes).
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with(
            addr,
            RegisterWire::default(),
            (Ipv4Addr::BROADCAST, DETECTOR_REGISTER_PORT).into(),
        )
    }

    /// Bind with explicit routing; used to point the hub at a
    /// non-standard port or a unicast probe target.
    pub fn bind_with(
        addr: SocketAddr,
        wire: RegisterWire,
        broadcast: SocketAddr,
    ) -> Result<Self> {
        Ok(Self {
            dispatch: Arc::new(Dispatch::bind(wire, addr)?),
            broadcast,
            devices: Mutex::new(BTreeMap::new()),
        })
    }

    /// Start the dispatch threads. Idempotent.
    pub fn listen(&self) -> Result<()> {
        self.dispatch.listen()
    }

    /// Stop the dispatch threads. Idempotent.
    pub fn close(&self) {
        self.dispatch.close();
    }

    /// The set of devices discovered or attached so far.
    pub fn devices(&self) -> BTreeMap<IpAddr, Detector> {
        self.devices
            .lock()
            .map(|devices| devices.clone())
            .unwrap_or_default()
    }

    /// Bind a device handle by hand, without discovery.
    pub fn attach(&self, ip: IpAddr, model: &str) -> Detector {
        let detector = Detector::bind(
            Arc::clone(&self.dispatch),
            ip,
            model.to_owned(),
            model_params(model).cloned(),
        );
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(ip, detector.clone());
        }
        detector
    }

    /// Broadcast model-identifier probes and build a device handle for
    /// every distinct responder, keyed by network address.
    pub fn discover(&self) -> Result<BTreeMap<IpAddr, Detector>> {
        self.discover_for(DISCOVERY_WINDOW)
    }

    /// [`Self::discover`] with an explicit collection window.
    pub fn discover_for(&self, window: Duration) -> Result<BTreeMap<IpAddr, Detector>> {
        if self.dispatch.is_listening() {
            warn!("discovery while dispatch threads are running will miss replies");
        }
        info!("scanning subnet for detectors");

        let socket = self.dispatch.socket();
        let control = u32::from(RegisterKind::Control);
        for addr in MODEL_FRAGMENT_REGS {
            let mut probe = [0_u8; RegReadRequest::BYTE_LEN];
            RegReadRequest::new(addr).write_bytes(&mut probe);
            socket.send_to(&frame::encode_register(control, &probe), self.broadcast)?;
        }

        let detector_port = self.dispatch.wire().detector_port;
        let mut fragments: BTreeMap<IpAddr, [u8; 4]> = BTreeMap::new();
        let mut found: BTreeMap<IpAddr, Detector> = BTreeMap::new();
        let mut buf = [0_u8; RX_BUFFER_LEN];
        let deadline = Instant::now() + window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            socket.set_read_timeout(Some((deadline - now).min(Duration::from_millis(500))))?;
            let (size, src) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // Model fragment replies are exactly header + read reply.
            if src.port() != detector_port || size != 16 {
                continue;
            }
            let Ok((id, payload)) = frame::decode_register(&buf[..size]) else {
                continue;
            };
            if id != control {
                continue;
            }
            let reply = RegReadReply::read_bytes(&payload[..RegReadReply::BYTE_LEN]);
            if reply.flag != 0 || reply.addr > 2 {
                continue;
            }

            let ip = src.ip();
            if reply.addr == 0 {
                fragments.insert(ip, reply.value.to_le_bytes());
            } else if !found.contains_key(&ip) {
                let Some(first) = fragments.get(&ip) else {
                    continue;
                };
                let mut raw = [0_u8; 8];
                raw[..4].copy_from_slice(first);
                raw[4..].copy_from_slice(&reply.value.to_le_bytes());
                let Some(model) = decode_model(&raw) else {
                    warn!("detector({ip}) reported a malformed model identifier");
                    continue;
                };
                found.insert(
                    ip,
                    Detector::bind(
                        Arc::clone(&self.dispatch),
                        ip,
                        model.clone(),
                        model_params(&model).cloned(),
                    ),
                );
            }
        }
        socket.set_read_timeout(Some(LOOP_TIMEOUT))?;

        info!("discovery finished, {} detector(s) found", found.len());
        if let Ok(mut devices) = self.devices.lock() {
            devices.extend(found.iter().map(|(ip, det)| (*ip, det.clone())));
        }
        Ok(found)
    }
}

/// Assemble the model string from its register fragments: strip the
/// 0xFF flash-erase padding, then trailing NULs.
fn decode_model(raw: &[u8]) -> Option<String> {
    let start = raw.iter().position(|&b| b != 0xFF)?;
    let end = raw.iter().rposition(|&b| b != 0xFF)? + 1;
    let text = std::str::from_utf8(&raw[start..end]).ok()?;
    Some(text.trim_end_matches('\0').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDetector;

    #[test]
    fn model_fragments_assemble() {
        assert_eq!(decode_model(b"D80\0\xff\xff\xff\xff").as_deref(), Some("D80"));
        assert_eq!(decode_model(b"HD140\0\0\0").as_deref(), Some("HD140"));
        assert_eq!(decode_model(&[0xFF; 8]), None);
        assert!(decode_model(&[b'D', 0x80, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x80]).is_none());
    }

    #[test]
    fn discovery_builds_one_handle_per_responder() {
        let device = FakeDetector::spawn("D80");
        let hub = DetectorHub::bind_with(
            (Ipv4Addr::LOCALHOST, 0).into(),
            RegisterWire {
                detector_port: device.addr.port(),
            },
            device.addr,
        )
        .unwrap();

        let found = hub.discover_for(Duration::from_millis(700)).unwrap();
        assert_eq!(found.len(), 1);
        let detector = &found[&device.addr.ip()];
        assert_eq!(detector.model(), "D80");
        assert_eq!(detector.params().unwrap().pixel_count, 80);
        assert_eq!(hub.devices().len(), 1);
    }
}
