//! Fixed-shape request/reply payloads for both protocols, plus the
//! register address map of the detector control space.

use byte_struct::*;
pub use byte_struct::{ByteStruct, ByteStructLen};

/// Register-protocol control opcode: read a register
pub const OP_READ: u16 = 0;

/// Register-protocol control opcode: write a register
pub const OP_WRITE: u16 = 1;

/// Request a register read. The detector answers with [`RegReadReply`].
#[derive(ByteStruct, Clone, Copy, Debug, Default)]
#[byte_struct_le]
pub struct RegReadRequest {
    pub op: u16,
    pub addr: u16,
}

impl RegReadRequest {
    pub fn new(addr: u16) -> Self {
        Self { op: OP_READ, addr }
    }
}

/// Write a 32-bit value to a register.
#[derive(ByteStruct, Clone, Copy, Debug, Default)]
#[byte_struct_le]
pub struct RegWriteRequest {
    pub op: u16,
    pub addr: u16,
    pub value: u32,
}

impl RegWriteRequest {
    pub fn new(addr: u16, value: u32) -> Self {
        Self {
            op: OP_WRITE,
            addr,
            value,
        }
    }
}

/// Reply to a register read.
#[derive(ByteStruct, Clone, Copy, Debug, Default)]
#[byte_struct_le]
pub struct RegReadReply {
    pub flag: u16,
    pub addr: u16,
    pub value: u32,
}

/// Sub-header of every config-protocol payload.
///
/// In requests, `flag` carries the operation modifier (zero for page
/// reads/writes, the block-size selector for erase commands) and `page`
/// the page index or update command type. In replies, `flag` is the
/// device status (non-zero means the operation was rejected) and `page`
/// echoes the request.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_le]
pub struct PageSubHeader {
    pub flag: u16,
    pub page: u16,
}

impl PageSubHeader {
    pub fn new(flag: u16, page: u16) -> Self {
        Self { flag, page }
    }

    pub fn to_bytes(self) -> [u8; Self::BYTE_LEN] {
        let mut buf = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut buf);
        buf
    }
}

/// Firmware image verification command, sent before erasing flash so
/// the detector can compare against what it already holds.
#[derive(ByteStruct, Clone, Copy, Debug, Default)]
#[byte_struct_le]
pub struct UpdateHashCommand {
    pub flag: u16,
    pub command: u16,
    pub image_len: u32,
    pub hash_kind: u32,
    pub hash: [u8; 20],
}

/// Hash kind selector for [`UpdateHashCommand`]: CRC32 of the full image
pub const HASH_KIND_CRC32: u32 = 3;

/// Update command types carried in the `page` slot of an id-3 payload
pub const UPDATE_UNLOCK: u16 = 1;
pub const UPDATE_HASH: u16 = 2;
pub const UPDATE_CHECKOUT: u16 = 3;

/// Token appended to the unlock command
pub const UNLOCK_TOKEN: &[u8] = b"ULCK";

/// Token appended to the image checkout command
pub const CHECKOUT_TOKEN: &[u8] = b"CHECKOUT";

/// Device-resident configuration pages are always this long.
pub const PAGE_LEN: usize = 256;

/// Register address map of the detector control space.
pub mod reg {
    /// Writing 1 starts the configured acquisition
    pub const ACQ_START: u16 = 0x0011;
    /// Acquisition trigger mode; 0x03 selects automatic sampling
    pub const ACQ_MODE: u16 = 0x0012;
    /// Acquisition sub-mode: 0 threshold counting, 1 histogram
    pub const ACQ_SUBMODE: u16 = 0x0013;
    /// Sample interval in 100 us units
    pub const ACQ_INTERVAL: u16 = 0x0014;
    /// Number of samples to acquire
    pub const ACQ_COUNT: u16 = 0x0015;
    /// Record header capability flags, see [`super::caps`]
    pub const ACQ_HEADER: u16 = 0x0018;

    /// Configured window count minus one
    pub const WINDOW_COUNT: u16 = 0x0020;
    /// Per-window threshold range, `high << 16 | low`; one register per window
    pub const WINDOW_RANGE_BASE: u16 = 0x0021;

    /// Encoder channel register blocks start here, one block per channel
    pub const ENCODER_SIGNAL_BASE: u16 = 0x0040;
    pub const ENCODER_CTRL_BASE: u16 = 0x0041;
    pub const ENCODER_POSITION_BASE: u16 = 0x0042;
    pub const ENCODER_ZERO_BASE: u16 = 0x0043;
    /// Register stride between encoder channel blocks
    pub const ENCODER_STRIDE: u16 = 8;

    /// Power rail switch control bits
    pub const POWER_CTRL: u16 = 0x0060;
    /// Per-channel rail state on the detector boards
    pub const POWER_LOCAL_STATUS: u16 = 0x0061;
    /// Rail state on the I/O board
    pub const POWER_IO_STATUS: u16 = 0x0062;

    /// Number of populated detector boards
    pub const BOARD_COUNT: u16 = 0x0080;
    /// Two packed temperatures per register, two registers per board
    pub const BOARD_TEMP_BASE: u16 = 0x0081;
    /// Two packed I/O board temperatures
    pub const IO_TEMP: u16 = 0x0091;

    pub const FAN_COUNT: u16 = 0x0092;
    /// Two packed fan speeds per register
    pub const FAN_SPEED_BASE: u16 = 0x0093;

    /// Supply telemetry, raw ADC counts
    pub const SUPPLY_VOLTAGE: u16 = 0x0097;
    pub const SUPPLY_CURRENT: u16 = 0x0098;
    pub const SUPPLY_POWER: u16 = 0x0099;
}

/// Capability bits of the [`reg::ACQ_HEADER`] register. The detector
/// only emits the optional record header fields it has been configured
/// to include, so the record layout must be derived from this register
/// before every acquisition.
pub mod caps {
    /// Record 0 of each frame carries the info word
    pub const INFO: u32 = 1 << 8;
    /// Record 0 carries encoder channel 0 head/tail positions
    pub const POS0: u32 = 1 << 29;
    /// Record 0 carries encoder channel 1 head/tail positions
    pub const POS1: u32 = 1 << 30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_sizes_match_the_wire() {
        assert_eq!(RegReadRequest::BYTE_LEN, 4);
        assert_eq!(RegWriteRequest::BYTE_LEN, 8);
        assert_eq!(RegReadReply::BYTE_LEN, 8);
        assert_eq!(PageSubHeader::BYTE_LEN, 4);
        // flag + command + len + kind + 20-byte hash slot
        assert_eq!(UpdateHashCommand::BYTE_LEN, 32);
    }

    #[test]
    fn subheader_field_order_is_flag_then_page() {
        let bytes = PageSubHeader::new(0x0102, 0x0304).to_bytes();
        assert_eq!(bytes, [0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn write_request_encodes_little_endian() {
        let mut buf = [0_u8; RegWriteRequest::BYTE_LEN];
        RegWriteRequest::new(0x0021, 0x00770011).write_bytes(&mut buf);
        assert_eq!(buf, [1, 0, 0x21, 0, 0x11, 0x00, 0x77, 0x00]);
    }
}
