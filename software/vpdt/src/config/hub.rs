//! Config-protocol hub: socket ownership, background dispatch, and
//! broadcast discovery of configurable detectors.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use vpdt_shared::control::{ByteStruct, ByteStructLen, PAGE_LEN, PageSubHeader};
use vpdt_shared::frame::{self, ConfigKind, Mac};

use crate::error::Result;
use crate::socket::{ConfigWire, Dispatch, Entry, LOOP_TIMEOUT, RX_BUFFER_LEN};

use super::DetectorConfig;

/// Config discovery collects replies over a much shorter window than
/// register discovery; page-0 replies come back immediately.
pub const CONFIG_DISCOVERY_WINDOW: Duration = Duration::from_secs(1);

/// Owns the config-protocol socket.
pub struct ConfigHub {
    dispatch: Dispatch<ConfigWire>,
}

impl ConfigHub {
    /// Bind with production routing: subnet broadcast to port 7492.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with(addr, ConfigWire::default())
    }

    pub fn bind_with(addr: SocketAddr, wire: ConfigWire) -> Result<Self> {
        Ok(Self {
            dispatch: Dispatch::bind(wire, addr)?,
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

    pub(crate) fn transact(
        &self,
        mac: Mac,
        id: u32,
        payload: Vec<u8>,
        predicate: impl Fn(&Entry) -> bool,
        timeout: Duration,
    ) -> Result<Entry> {
        self.dispatch
            .transact(&mac, id, payload, predicate, timeout)
            .inspect_err(|e| warn!("device({mac}) config exchange: {e}"))
    }

    /// Broadcast a page-0 read and decode every well-formed reply into
    /// a device config. Malformed or undersized packets are logged and
    /// skipped, never fatal.
    pub fn discover(&self) -> Result<Vec<DetectorConfig>> {
        self.discover_for(CONFIG_DISCOVERY_WINDOW)
    }

    pub fn discover_for(&self, window: Duration) -> Result<Vec<DetectorConfig>> {
        if self.dispatch.is_listening() {
            warn!("discovery while dispatch threads are running will miss replies");
        }
        info!("scanning subnet for configurable detectors");

        let socket = self.dispatch.socket();
        let probe = frame::encode_config(
            Mac::BROADCAST,
            u32::from(ConfigKind::PageRead),
            &PageSubHeader::new(0, 0).to_bytes(),
        );
        socket.send_to(&probe, self.dispatch.wire().target)?;

        let mut found = Vec::new();
        let mut buf = [0_u8; RX_BUFFER_LEN];
        let deadline = Instant::now() + window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            socket.set_read_timeout(Some((deadline - now).min(Duration::from_millis(200))))?;
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
            if src.port() != self.dispatch.wire().target.port() {
                continue;
            }

            let (mac, id, payload) = match frame::decode_config(&buf[..size]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("undecodable discovery reply from {src}: {e}");
                    continue;
                }
            };
            if ConfigKind::from(id) != ConfigKind::PageRead {
                warn!("unexpected discovery packet type {id} from {mac}");
                continue;
            }
            let sub = PageSubHeader::read_bytes(&payload[..PageSubHeader::BYTE_LEN]);
            let Some(body) = payload.get(PageSubHeader::BYTE_LEN..PageSubHeader::BYTE_LEN + PAGE_LEN)
            else {
                warn!("undersized page-0 reply from {mac}");
                continue;
            };
            if sub.page != 0 || sub.flag != 0 {
                warn!(
                    "rejected discovery reply from {mac}: page {}, status {}",
                    sub.page, sub.flag
                );
                continue;
            }
            let mut config = DetectorConfig::new(mac);
            if let Err(e) = config.decode_page(0, body) {
                warn!("could not decode page 0 from {mac}: {e}");
                continue;
            }
            info!("found device {mac}");
            found.push(config);
        }
        socket.set_read_timeout(Some(LOOP_TIMEOUT))?;

        info!("discovery finished, {} device(s) found", found.len());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::config::{FieldValue, PageLayout};
    use crate::error::Error;
    use crate::testutil::{ConfigOp, FakeConfigDetector, config_hub_for, sample_page0};

    const MAC: Mac = Mac([0xAA, 0xBB, 0xCC, 0, 0, 1]);

    fn device_with_page0(model: &str) -> FakeConfigDetector {
        let mut pages = BTreeMap::new();
        pages.insert(0, sample_page0(model));
        FakeConfigDetector::spawn(MAC, pages)
    }

    #[test]
    fn discovery_decodes_page0_replies() {
        let device = device_with_page0("HD280");
        let hub = config_hub_for(&device);
        let found = hub.discover_for(Duration::from_millis(500)).unwrap();
        assert_eq!(found.len(), 1);
        let config = &found[0];
        assert_eq!(config.mac(), device.mac);
        assert_eq!(config.layout(), PageLayout::Base);
        assert_eq!(config.str_field("model").unwrap(), "HD280");

        // Factory specialization picks the board count up from the
        // decoded model.
        let config = found[0].clone().into_factory();
        assert_eq!(config.layout(), PageLayout::Factory { board_count: 2 });
    }

    #[test]
    fn page_write_and_readback_clear_dirty() {
        let device = device_with_page0("D80");
        let hub = config_hub_for(&device);
        let mut config = hub
            .discover_for(Duration::from_millis(300))
            .unwrap()
            .remove(0);
        hub.listen().unwrap();

        config.set("det_mask", FieldValue::U8(16)).unwrap();
        config.set("server_port", FieldValue::U16(7000)).unwrap();
        assert_eq!(config.dirty_pages().collect::<Vec<_>>(), vec![0]);

        config.flush_dirty(&hub).unwrap();
        assert_eq!(device.ops(), vec![ConfigOp::PageWrite { page: 0 }]);
        let written = device.page(0).unwrap();
        assert_eq!(written[0x4C], 16);
        assert_eq!(&written[0x4E..0x50], &7000_u16.to_le_bytes());

        // Writes alone do not clear the dirty mark; a read does.
        assert_eq!(config.dirty_pages().count(), 1);
        config.read_page(&hub, 0).unwrap();
        assert_eq!(config.dirty_pages().count(), 0);
        // The identity fields were zeroed by the network-config write.
        assert_eq!(config.str_field("model").unwrap(), "");
    }

    #[test]
    fn absent_device_times_out() {
        let device = device_with_page0("D80");
        let hub = config_hub_for(&device);
        hub.listen().unwrap();
        let mut config = DetectorConfig::new(Mac([9; 6]));
        let err = config.read_page(&hub, 0);
        assert!(matches!(err, Err(Error::Timeout(_))));
    }
}
