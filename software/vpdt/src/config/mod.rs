//! Page-based device configuration over the config protocol.
//!
//! Each detector holds its configuration in 256-byte device-resident
//! pages. The host keeps a typed field map decoded from those pages;
//! mutating a field marks its owning page dirty, and a successful read
//! of a page clears the mark. Page layout is selected per model through
//! a descriptor, not inheritance: the base descriptor covers page 0
//! (identity and network config), the factory descriptor adds the
//! manufacturing and calibration pages.

pub mod factory;
pub mod hub;
pub mod update;

pub use factory::factory_board_count;
pub use hub::ConfigHub;
pub use update::{FirmwareUpdater, UpdateError, UpdatePhase};

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::debug;

use vpdt_shared::control::{ByteStruct, ByteStructLen, PAGE_LEN, PageSubHeader};
use vpdt_shared::frame::{ConfigKind, FrameError, Mac};

use crate::error::{Error, Result};

use factory::{
    BOARD_PAGE_STRIDE, CAL_MATRIX_FIRST, CAL_MATRIX_LAST, FACTORY_IDENTITY_PAGE, FACTORY_PAGE_BASE,
    VOLTAGE_PAGE,
};

/// Window for one page read/write round trip.
pub(crate) const PAGE_TIMEOUT: Duration = Duration::from_millis(500);

/// Most boards any model carries; the calibration matrix is allocated
/// for this many regardless of the configured count.
pub const MAX_BOARDS: usize = 8;

/// Calibration blocks per board, one device page each.
pub const CAL_BLOCKS: usize = 4;

/// 32-bit words per calibration block (one 256-byte page).
pub const CAL_BLOCK_WORDS: usize = PAGE_LEN / 4;

/// Page layout descriptor, selected by model at construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLayout {
    /// Identity and network configuration only (page 0). Models without
    /// a dedicated descriptor get this generic behavior.
    Base,
    /// Adds the factory pages: identity mirror, per-board calibration
    /// voltages, and the per-board calibration matrix block.
    Factory { board_count: usize },
}

/// Per-board 3-D calibration matrix, `MAX_BOARDS x CAL_BLOCKS x
/// CAL_BLOCK_WORDS`, stored flat in board-major order.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "ser", derive(serde::Serialize))]
pub struct CalMatrix {
    words: Vec<u32>,
}

impl CalMatrix {
    pub fn zeroed() -> Self {
        Self {
            words: vec![0; MAX_BOARDS * CAL_BLOCKS * CAL_BLOCK_WORDS],
        }
    }

    fn offset(board: usize, block: usize) -> usize {
        (board * CAL_BLOCKS + block) * CAL_BLOCK_WORDS
    }

    pub fn block(&self, board: usize, block: usize) -> &[u32] {
        let at = Self::offset(board, block);
        &self.words[at..at + CAL_BLOCK_WORDS]
    }

    pub fn set_block(&mut self, board: usize, block: usize, words: &[u32]) {
        let at = Self::offset(board, block);
        self.words[at..at + CAL_BLOCK_WORDS].copy_from_slice(words);
    }

    /// Compare only the first `boards` boards.
    fn boards_equal(&self, other: &CalMatrix, boards: usize) -> bool {
        let len = Self::offset(boards, 0);
        self.words[..len] == other.words[..len]
    }

    /// Copy only the first `boards` boards from `other`.
    fn copy_boards(&mut self, other: &CalMatrix, boards: usize) {
        let len = Self::offset(boards, 0);
        self.words[..len].copy_from_slice(&other.words[..len]);
    }
}

/// Typed value of one config field.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "ser", derive(serde::Serialize))]
pub enum FieldValue {
    Str(String),
    U8(u8),
    U16(u16),
    Matrix(CalMatrix),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Str(_) => "string",
            FieldValue::U8(_) => "u8",
            FieldValue::U16(_) => "u16",
            FieldValue::Matrix(_) => "matrix",
        }
    }
}

/// Configuration of one detector, addressed by hardware MAC.
///
/// Holds the field map, the field -> owning page side table, and the set
/// of dirty pages; the three are only ever mutated together through
/// [`DetectorConfig::set`] and the page decoders, which keeps them
/// consistent.
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    mac: Mac,
    layout: PageLayout,
    fields: BTreeMap<String, FieldValue>,
    field_page: BTreeMap<String, u16>,
    dirty: BTreeSet<u16>,
}

impl DetectorConfig {
    pub fn new(mac: Mac) -> Self {
        Self {
            mac,
            layout: PageLayout::Base,
            fields: BTreeMap::new(),
            field_page: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// The immutable device identity.
    pub fn mac(&self) -> Mac {
        self.mac
    }

    /// Hex rendering of the MAC, used to name the device in logs.
    pub fn name(&self) -> String {
        self.mac.to_string()
    }

    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Boards covered by the per-board factory pages; 1 for the base
    /// layout, which has none.
    pub fn board_count(&self) -> usize {
        match self.layout {
            PageLayout::Base => 1,
            PageLayout::Factory { board_count } => board_count,
        }
    }

    /// Pages with local edits not yet written back to the device.
    pub fn dirty_pages(&self) -> impl Iterator<Item = u16> + '_ {
        self.dirty.iter().copied()
    }

    pub fn get(&self, field: &str) -> Result<&FieldValue> {
        self.fields
            .get(field)
            .ok_or_else(|| Error::validation(format!("unknown field {field:?}")))
    }

    /// Update one field, marking its owning page dirty if the value
    /// changed. The MAC is immutable; unknown fields and type
    /// mismatches are refused.
    pub fn set(&mut self, field: &str, value: FieldValue) -> Result<()> {
        if field == "mac" {
            return Err(Error::validation("the mac field is immutable"));
        }
        let current = self
            .fields
            .get(field)
            .ok_or_else(|| Error::validation(format!("unknown field {field:?}")))?;
        if current.kind() != value.kind() {
            return Err(Error::validation(format!(
                "field {field:?} holds a {}, not a {}",
                current.kind(),
                value.kind()
            )));
        }
        let page = *self
            .field_page
            .get(field)
            .ok_or_else(|| Error::validation(format!("field {field:?} has no owning page")))?;

        // The calibration matrix compares and copies only the boards
        // this layout actually carries.
        if let (FieldValue::Matrix(current), FieldValue::Matrix(new)) = (current, &value) {
            let boards = self.board_count();
            if !current.boards_equal(new, boards) {
                let FieldValue::Matrix(stored) = self.fields.get_mut(field).unwrap() else {
                    unreachable!()
                };
                stored.copy_boards(new, boards);
                self.dirty.insert(page);
            }
            return Ok(());
        }

        if *current != value {
            self.fields.insert(field.to_owned(), value);
            self.dirty.insert(page);
        }
        Ok(())
    }

    /// Snapshot of every field, with the MAC rendered as hex.
    pub fn export(&self) -> BTreeMap<String, FieldValue> {
        let mut out = self.fields.clone();
        out.insert("mac".into(), FieldValue::Str(self.name()));
        if let PageLayout::Factory { board_count } = self.layout {
            out.insert("board_count".into(), FieldValue::U16(board_count as u16));
        }
        out
    }

    /// Record one decoded field and its owning page. Never dirties.
    fn insert_field(&mut self, name: &str, value: FieldValue, page: u16) {
        self.fields.insert(name.to_owned(), value);
        self.field_page.insert(name.to_owned(), page);
    }

    /// Decode one device page into the field map and clear its dirty
    /// mark. Pages absent from this layout are ignored.
    pub fn decode_page(&mut self, page_num: u16, page: &[u8]) -> Result<()> {
        if page.len() != PAGE_LEN {
            return Err(FrameError::TooShort {
                got: page.len(),
                need: PAGE_LEN,
            }
            .into());
        }
        let handled = match (page_num, self.layout) {
            (0, _) => {
                self.decode_page0(page);
                true
            }
            (_, PageLayout::Factory { .. }) if page_num >= FACTORY_PAGE_BASE => {
                self.decode_factory_page(page_num, page)
            }
            _ => false,
        };
        if handled {
            self.dirty.remove(&page_num);
        }
        Ok(())
    }

    /// Encode one page from the field map. Pages absent from this
    /// layout encode as all zeroes, same as the device treats them.
    pub fn encode_page(&self, page_num: u16) -> Result<[u8; PAGE_LEN]> {
        match (page_num, self.layout) {
            (0, _) => self.encode_page0(),
            (_, PageLayout::Factory { .. }) if page_num >= FACTORY_PAGE_BASE => {
                self.encode_factory_page(page_num)
            }
            _ => Ok([0_u8; PAGE_LEN]),
        }
    }

    fn decode_page0(&mut self, page: &[u8]) {
        self.insert_field("model", FieldValue::Str(ascii_field(&page[0x00..0x08])), 0);
        self.insert_field("sn", FieldValue::Str(ascii_field(&page[0x08..0x18])), 0);
        self.insert_field("sw_ver", FieldValue::Str(version3(&page[0x18..0x1C])), 0);
        self.insert_field("fw_ver", FieldValue::Str(version3(&page[0x20..0x24])), 0);
        self.insert_field("hw_ver", FieldValue::Str(version2(&page[0x24..0x26])), 0);
        self.insert_field("det_ip", FieldValue::Str(addr_field(&page[0x40..0x44])), 0);
        self.insert_field("gateway", FieldValue::Str(addr_field(&page[0x44..0x48])), 0);
        self.insert_field("server_ip", FieldValue::Str(addr_field(&page[0x48..0x4C])), 0);
        self.insert_field("det_mask", FieldValue::U8(page[0x4C]), 0);
        self.insert_field("hb_interval", FieldValue::U8(page[0x4D]), 0);
        self.insert_field(
            "server_port",
            FieldValue::U16(u16::from_le_bytes([page[0x4E], page[0x4F]])),
            0,
        );
    }

    /// Only the network configuration is host-writable; the identity
    /// area of page 0 stays zero on writes.
    fn encode_page0(&self) -> Result<[u8; PAGE_LEN]> {
        let mut page = [0_u8; PAGE_LEN];
        page[0x40..0x44].copy_from_slice(&self.addr_bytes("det_ip")?);
        page[0x44..0x48].copy_from_slice(&self.addr_bytes("gateway")?);
        page[0x48..0x4C].copy_from_slice(&self.addr_bytes("server_ip")?);
        page[0x4C] = self.u8_field("det_mask")?;
        page[0x4D] = self.u8_field("hb_interval")?;
        page[0x4E..0x50].copy_from_slice(&self.u16_field("server_port")?.to_le_bytes());
        Ok(page)
    }

    pub(crate) fn str_field(&self, name: &str) -> Result<&str> {
        match self.get(name)? {
            FieldValue::Str(s) => Ok(s),
            other => Err(Error::validation(format!(
                "field {name:?} holds a {}, not a string",
                other.kind()
            ))),
        }
    }

    fn u8_field(&self, name: &str) -> Result<u8> {
        match self.get(name)? {
            FieldValue::U8(v) => Ok(*v),
            other => Err(Error::validation(format!(
                "field {name:?} holds a {}, not a u8",
                other.kind()
            ))),
        }
    }

    pub(crate) fn u16_field(&self, name: &str) -> Result<u16> {
        match self.get(name)? {
            FieldValue::U16(v) => Ok(*v),
            other => Err(Error::validation(format!(
                "field {name:?} holds a {}, not a u16",
                other.kind()
            ))),
        }
    }

    fn addr_bytes(&self, name: &str) -> Result<[u8; 4]> {
        let text = self.str_field(name)?;
        let addr: Ipv4Addr = text
            .parse()
            .map_err(|_| Error::validation(format!("field {name:?} is not a dotted address")))?;
        let mut octets = addr.octets();
        octets.reverse();
        Ok(octets)
    }

    /// Read one page from the device and decode it.
    pub fn read_page(&mut self, hub: &ConfigHub, page: u16) -> Result<()> {
        debug!("device({}) reading page {page}", self.name());
        let request = PageSubHeader::new(0, page).to_bytes().to_vec();
        let entry = hub.transact(
            self.mac,
            u32::from(ConfigKind::PageRead),
            request,
            page_predicate(page),
            PAGE_TIMEOUT,
        )?;
        let sub = PageSubHeader::read_bytes(&entry.payload[..PageSubHeader::BYTE_LEN]);
        if sub.flag != 0 {
            return Err(Error::action(format!("read of page {page}"), sub.flag));
        }
        let body = entry
            .payload
            .get(PageSubHeader::BYTE_LEN..PageSubHeader::BYTE_LEN + PAGE_LEN)
            .ok_or(FrameError::TooShort {
                got: entry.payload.len(),
                need: PageSubHeader::BYTE_LEN + PAGE_LEN,
            })?;
        self.decode_page(page, body)?;
        debug!("device({}) page {page} read done", self.name());
        Ok(())
    }

    /// Encode one page and write it back to the device. The dirty mark
    /// stays until a subsequent read confirms the device content.
    pub fn write_page(&self, hub: &ConfigHub, page: u16) -> Result<()> {
        debug!("device({}) writing page {page}", self.name());
        let mut payload = PageSubHeader::new(0, page).to_bytes().to_vec();
        payload.extend_from_slice(&self.encode_page(page)?);
        let entry = hub.transact(
            self.mac,
            u32::from(ConfigKind::PageWrite),
            payload,
            page_predicate(page),
            PAGE_TIMEOUT,
        )?;
        let sub = PageSubHeader::read_bytes(&entry.payload[..PageSubHeader::BYTE_LEN]);
        if sub.flag != 0 {
            return Err(Error::action(format!("write of page {page}"), sub.flag));
        }
        debug!("device({}) page {page} write done", self.name());
        Ok(())
    }

    /// Write back every dirty page. Factory layouts fan the per-board
    /// pages out across the configured board count.
    pub fn flush_dirty(&self, hub: &ConfigHub) -> Result<()> {
        for page in self.pages_to_flush() {
            if page >= FACTORY_PAGE_BASE {
                self.write_factory_page(hub, page)?;
            } else {
                self.write_page(hub, page)?;
            }
        }
        Ok(())
    }

    /// Expand the dirty set into the concrete page writes it implies.
    pub(crate) fn pages_to_flush(&self) -> Vec<u16> {
        let boards = self.board_count() as u16;
        let mut pages = Vec::new();
        for &page in &self.dirty {
            match page {
                VOLTAGE_PAGE => {
                    pages.extend((0..boards).map(|b| b * BOARD_PAGE_STRIDE + VOLTAGE_PAGE))
                }
                CAL_MATRIX_FIRST => {
                    for board in 0..boards {
                        let shift = board * BOARD_PAGE_STRIDE;
                        pages.extend((CAL_MATRIX_FIRST..=CAL_MATRIX_LAST).map(|p| shift + p));
                    }
                }
                other => pages.push(other),
            }
        }
        pages
    }

    /// Read every page this layout defines.
    pub fn read_all_pages(&mut self, hub: &ConfigHub) -> Result<()> {
        self.read_page(hub, 0)?;
        if let PageLayout::Factory { board_count } = self.layout {
            self.read_factory_page(hub, FACTORY_IDENTITY_PAGE)?;
            for board in 0..board_count as u16 {
                let shift = board * BOARD_PAGE_STRIDE;
                self.read_factory_page(hub, shift + VOLTAGE_PAGE)?;
                for page in CAL_MATRIX_FIRST..=CAL_MATRIX_LAST {
                    self.read_factory_page(hub, shift + page)?;
                }
            }
        }
        Ok(())
    }
}

/// Accept replies that echo the requested page number; the status flag
/// is judged after the exchange.
pub(crate) fn page_predicate(page: u16) -> impl Fn(&crate::socket::Entry) -> bool {
    move |entry| {
        entry.payload.len() >= PageSubHeader::BYTE_LEN
            && PageSubHeader::read_bytes(&entry.payload[..PageSubHeader::BYTE_LEN]).page == page
    }
}

/// Identity strings are 0xFF-padded in flash and NUL-terminated.
fn ascii_field(raw: &[u8]) -> String {
    let start = raw.iter().position(|&b| b != 0xFF).unwrap_or(raw.len());
    let end = raw.iter().rposition(|&b| b != 0xFF).map_or(start, |i| i + 1);
    String::from_utf8_lossy(&raw[start..end])
        .trim_end_matches('\0')
        .to_owned()
}

/// Versions are stored low-segment-first.
fn version3(raw: &[u8]) -> String {
    format!("{}.{}.{}", raw[2], raw[1], raw[0])
}

fn version2(raw: &[u8]) -> String {
    format!("{}.{}", raw[1], raw[0])
}

/// Addresses are stored byte-reversed relative to network order.
fn addr_field(raw: &[u8]) -> String {
    format!("{}.{}.{}.{}", raw[3], raw[2], raw[1], raw[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_page0;

    fn decoded_config() -> DetectorConfig {
        let mut config = DetectorConfig::new(Mac([0, 1, 2, 3, 4, 5]));
        config.decode_page(0, &sample_page0("D80")).unwrap();
        config
    }

    #[test]
    fn page0_decodes_identity_and_network_fields() {
        let config = decoded_config();
        assert_eq!(config.str_field("model").unwrap(), "D80");
        assert_eq!(config.str_field("sn").unwrap(), "SN0001");
        assert_eq!(config.str_field("sw_ver").unwrap(), "3.2.1");
        assert_eq!(config.str_field("fw_ver").unwrap(), "6.5.4");
        assert_eq!(config.str_field("hw_ver").unwrap(), "8.7");
        assert_eq!(config.str_field("det_ip").unwrap(), "10.20.22.240");
        assert_eq!(config.str_field("gateway").unwrap(), "10.20.22.1");
        assert_eq!(config.str_field("server_ip").unwrap(), "10.20.22.2");
        assert_eq!(config.get("det_mask").unwrap(), &FieldValue::U8(24));
        assert_eq!(config.get("hb_interval").unwrap(), &FieldValue::U8(5));
        assert_eq!(config.get("server_port").unwrap(), &FieldValue::U16(7493));
        assert_eq!(config.dirty_pages().count(), 0);
    }

    #[test]
    fn encode_page0_writes_network_config_only() {
        let config = decoded_config();
        let page = config.encode_page(0).unwrap();
        // Identity area stays zero on writes
        assert!(page[..0x40].iter().all(|&b| b == 0));
        assert_eq!(&page[0x40..0x44], &[240, 22, 20, 10]);
        assert_eq!(&page[0x44..0x48], &[1, 22, 20, 10]);
        assert_eq!(page[0x4C], 24);
        assert_eq!(&page[0x4E..0x50], &7493_u16.to_le_bytes());
    }

    #[test]
    fn dirty_page_discipline() {
        let mut config = decoded_config();

        // Equal value: no dirty mark
        config
            .set("det_mask", FieldValue::U8(24))
            .unwrap();
        assert_eq!(config.dirty_pages().count(), 0);

        // Changed value dirties only the owning page
        config.set("det_mask", FieldValue::U8(16)).unwrap();
        assert_eq!(config.dirty_pages().collect::<Vec<_>>(), vec![0]);

        // A successful decode of that page clears the mark
        config.decode_page(0, &sample_page0("D80")).unwrap();
        assert_eq!(config.dirty_pages().count(), 0);
    }

    #[test]
    fn set_refuses_mac_unknown_fields_and_type_mismatches() {
        let mut config = decoded_config();
        assert!(matches!(
            config.set("mac", FieldValue::Str("ff".into())),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            config.set("no_such_field", FieldValue::U8(1)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            config.set("det_mask", FieldValue::Str("24".into())),
            Err(Error::Validation(_))
        ));
        assert_eq!(config.dirty_pages().count(), 0);
    }

    #[test]
    fn export_includes_the_mac_as_hex() {
        let config = decoded_config();
        let fields = config.export();
        assert_eq!(fields["mac"], FieldValue::Str("000102030405".into()));
    }

    #[cfg(feature = "ser")]
    #[test]
    fn exported_fields_serialize() {
        let config = decoded_config();
        let json = serde_json::to_string(&config.export()).unwrap();
        assert!(json.contains("\"det_ip\""));
    }
}
