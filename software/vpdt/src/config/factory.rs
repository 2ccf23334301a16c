//! Factory variant of the config page protocol: manufacturing
//! identifiers, per-board calibration voltages, and the per-board
//! calibration matrix, all living in the factory page window.
//!
//! Factory pages for board `b` sit at `b * 512` past the base factory
//! page numbers, so one logical page fans out across the populated
//! boards.

use tracing::warn;

use vpdt_shared::control::PAGE_LEN;

use crate::error::Result;

use super::{CalMatrix, ConfigHub, DetectorConfig, FieldValue, MAX_BOARDS, PageLayout};

/// First factory page; everything below is base configuration space.
pub const FACTORY_PAGE_BASE: u16 = 2048;

/// Page-number offset between consecutive boards' factory pages.
pub const BOARD_PAGE_STRIDE: u16 = 512;

/// Manufacturing identity mirror, shared by all boards.
pub const FACTORY_IDENTITY_PAGE: u16 = 2048;

/// Per-board calibration voltage page.
pub const VOLTAGE_PAGE: u16 = 2049;

/// The calibration matrix spans these four pages per board.
pub const CAL_MATRIX_FIRST: u16 = 2052;
pub const CAL_MATRIX_LAST: u16 = 2055;

/// Factory registry: boards populated per model. Kept separate from the
/// register-protocol model table; unknown models default to one board.
const FACTORY_MODELS: &[(&str, usize)] = &[
    ("D80", 1),
    ("D68", 1),
    ("HD140", 1),
    ("HD280", 2),
    ("HD420", 3),
    ("HD560", 4),
];

pub fn factory_board_count(model: &str) -> usize {
    FACTORY_MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(1, |(_, boards)| *boards)
}

impl DetectorConfig {
    /// Switch this config to the factory page layout, sizing the board
    /// count from the factory registry if page 0 has been decoded.
    pub fn into_factory(mut self) -> Self {
        let board_count = self
            .str_field("model")
            .map_or(1, factory_board_count);
        self.layout = PageLayout::Factory { board_count };
        self
    }

    /// Split a factory page number into (board, base page).
    fn board_page(page_num: u16) -> (usize, u16) {
        let rel = page_num - FACTORY_PAGE_BASE;
        (
            (rel / BOARD_PAGE_STRIDE) as usize,
            rel % BOARD_PAGE_STRIDE + FACTORY_PAGE_BASE,
        )
    }

    pub(super) fn decode_factory_page(&mut self, page_num: u16, page: &[u8]) -> bool {
        let (board, base) = Self::board_page(page_num);
        if board >= MAX_BOARDS {
            warn!("factory page {page_num} addresses board {board}, beyond the chassis");
            return false;
        }
        match base {
            FACTORY_IDENTITY_PAGE => {
                self.insert_field("model_f", FieldValue::Str(hex_field(&page[0x00..0x08])), page_num);
                self.insert_field("sn_f", FieldValue::Str(hex_field(&page[0x08..0x18])), page_num);
                self.insert_field("sw_ver_f", FieldValue::Str(hex_field(&page[0x18..0x1C])), page_num);
                self.insert_field("fw_ver_f", FieldValue::Str(hex_field(&page[0x20..0x24])), page_num);
                self.insert_field("hw_ver_f", FieldValue::Str(hex_field(&page[0x24..0x26])), page_num);
                true
            }
            VOLTAGE_PAGE => {
                let qtc = u16::from_le_bytes([page[0x08], page[0x09]]);
                let reference = u16::from_le_bytes([page[0x0A], page[0x0B]]);
                self.insert_field(&format!("qtc_volt{board}"), FieldValue::U16(qtc), page_num);
                self.insert_field(&format!("ref_volt{board}"), FieldValue::U16(reference), page_num);
                true
            }
            CAL_MATRIX_FIRST..=CAL_MATRIX_LAST => {
                let block = (base - CAL_MATRIX_FIRST) as usize;
                let words: Vec<u32> = page
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                let mut matrix = match self.fields.get("eng_cal") {
                    Some(FieldValue::Matrix(m)) => m.clone(),
                    _ => CalMatrix::zeroed(),
                };
                matrix.set_block(board, block, &words);
                // The whole matrix is owned by the first page of the block.
                self.insert_field("eng_cal", FieldValue::Matrix(matrix), CAL_MATRIX_FIRST);
                true
            }
            _ => false,
        }
    }

    pub(super) fn encode_factory_page(&self, page_num: u16) -> Result<[u8; PAGE_LEN]> {
        let mut page = [0_u8; PAGE_LEN];
        let (board, base) = Self::board_page(page_num);
        match base {
            FACTORY_IDENTITY_PAGE => {
                write_hex_field(&mut page[0x00..0x08], self.str_field("model_f")?);
                write_hex_field(&mut page[0x08..0x18], self.str_field("sn_f")?);
                write_hex_field(&mut page[0x18..0x1C], self.str_field("sw_ver_f")?);
                write_hex_field(&mut page[0x20..0x24], self.str_field("fw_ver_f")?);
                write_hex_field(&mut page[0x24..0x26], self.str_field("hw_ver_f")?);
            }
            VOLTAGE_PAGE => {
                let qtc = self.u16_field(&format!("qtc_volt{board}"))?;
                let reference = self.u16_field(&format!("ref_volt{board}"))?;
                page[0x08..0x0A].copy_from_slice(&qtc.to_le_bytes());
                page[0x0A..0x0C].copy_from_slice(&reference.to_le_bytes());
            }
            CAL_MATRIX_FIRST..=CAL_MATRIX_LAST => {
                let block = (base - CAL_MATRIX_FIRST) as usize;
                if let FieldValue::Matrix(matrix) = self.get("eng_cal")? {
                    for (slot, word) in page
                        .chunks_exact_mut(4)
                        .zip(matrix.block(board, block))
                    {
                        slot.copy_from_slice(&word.to_le_bytes());
                    }
                }
            }
            _ => {}
        }
        Ok(page)
    }

    /// Read a factory page.
    pub fn read_factory_page(&mut self, hub: &ConfigHub, page: u16) -> Result<()> {
        self.authorize_factory_access(page)?;
        self.read_page(hub, page)
    }

    /// Write a factory page.
    pub fn write_factory_page(&self, hub: &ConfigHub, page: u16) -> Result<()> {
        self.authorize_factory_access(page)?;
        self.write_page(hub, page)
    }

    // TODO: gate factory page access behind vendor authentication once
    // the device firmware exposes it.
    fn authorize_factory_access(&self, _page: u16) -> Result<()> {
        Ok(())
    }
}

/// Factory identity fields are raw bytes rendered as hex, not ASCII.
fn hex_field(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

fn write_hex_field(slot: &mut [u8], text: &str) {
    for (i, chunk) in text.as_bytes().chunks_exact(2).enumerate() {
        if i >= slot.len() {
            break;
        }
        if let Ok(byte) = core::str::from_utf8(chunk)
            .map_err(|_| ())
            .and_then(|t| u8::from_str_radix(t, 16).map_err(|_| ()))
        {
            slot[i] = byte;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CAL_BLOCK_WORDS;
    use crate::testutil::sample_page0;
    use vpdt_shared::frame::Mac;

    fn factory_config(model: &str) -> DetectorConfig {
        let mut config = DetectorConfig::new(Mac([0xAA, 0, 0, 0, 0, 1]));
        config.decode_page(0, &sample_page0(model)).unwrap();
        config.into_factory()
    }

    #[test]
    fn registry_sizes_board_count_by_model() {
        assert_eq!(factory_config("D80").board_count(), 1);
        assert_eq!(factory_config("HD280").board_count(), 2);
        assert_eq!(factory_config("HD560").board_count(), 4);
        // Unrecognized models get the generic single-board default
        assert_eq!(factory_config("X99").board_count(), 1);
    }

    #[test]
    fn identity_mirror_roundtrips_as_hex() {
        let mut config = factory_config("D80");
        let mut page = [0_u8; PAGE_LEN];
        page[0x00..0x08].copy_from_slice(&[0xDE, 0xAD, 0, 0, 0, 0, 0, 0]);
        config.decode_page(FACTORY_IDENTITY_PAGE, &page).unwrap();
        assert_eq!(config.str_field("model_f").unwrap(), "dead000000000000");

        let encoded = config.encode_page(FACTORY_IDENTITY_PAGE).unwrap();
        assert_eq!(&encoded[0x00..0x08], &page[0x00..0x08]);
    }

    #[test]
    fn voltage_pages_are_per_board() {
        let mut config = factory_config("HD280");
        let mut page = [0_u8; PAGE_LEN];
        page[0x08..0x0A].copy_from_slice(&1200_u16.to_le_bytes());
        page[0x0A..0x0C].copy_from_slice(&900_u16.to_le_bytes());
        // Board 1's voltage page
        let page_num = VOLTAGE_PAGE + BOARD_PAGE_STRIDE;
        config.decode_page(page_num, &page).unwrap();
        assert_eq!(config.get("qtc_volt1").unwrap(), &FieldValue::U16(1200));
        assert_eq!(config.get("ref_volt1").unwrap(), &FieldValue::U16(900));

        // Editing it dirties the board's own page, which flushes alone.
        config.set("qtc_volt1", FieldValue::U16(1250)).unwrap();
        assert_eq!(config.pages_to_flush(), vec![page_num]);
    }

    #[test]
    fn matrix_pages_assemble_and_fan_out() {
        let mut config = factory_config("HD280");
        let mut page = [0_u8; PAGE_LEN];
        page[..4].copy_from_slice(&0x01020304_u32.to_le_bytes());
        config.decode_page(CAL_MATRIX_FIRST + 1, &page).unwrap();

        let FieldValue::Matrix(matrix) = config.get("eng_cal").unwrap() else {
            panic!("eng_cal must decode as a matrix");
        };
        assert_eq!(matrix.block(0, 1)[0], 0x01020304);

        // Changing board 0 of the matrix dirties the block's first page
        // and fans out to all four pages of both boards.
        let mut edited = matrix.clone();
        edited.set_block(0, 0, &[7; CAL_BLOCK_WORDS]);
        config.set("eng_cal", FieldValue::Matrix(edited)).unwrap();
        assert_eq!(
            config.dirty_pages().collect::<Vec<_>>(),
            vec![CAL_MATRIX_FIRST]
        );
        assert_eq!(
            config.pages_to_flush(),
            vec![2052, 2053, 2054, 2055, 2564, 2565, 2566, 2567]
        );

        // A matrix differing only beyond the board count is not an edit.
        let mut config = factory_config("D80");
        config.decode_page(CAL_MATRIX_FIRST, &[0_u8; PAGE_LEN]).unwrap();
        let mut beyond = CalMatrix::zeroed();
        beyond.set_block(5, 0, &[9; CAL_BLOCK_WORDS]);
        config.set("eng_cal", FieldValue::Matrix(beyond)).unwrap();
        assert_eq!(config.dirty_pages().count(), 0);
    }

    #[test]
    fn matrix_block_encoding_roundtrips() {
        let mut config = factory_config("D80");
        let mut page = [0_u8; PAGE_LEN];
        for (i, chunk) in page.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&(i as u32).to_le_bytes());
        }
        config.decode_page(CAL_MATRIX_FIRST + 2, &page).unwrap();
        let encoded = config.encode_page(CAL_MATRIX_FIRST + 2).unwrap();
        assert_eq!(encoded, page);
    }
}
