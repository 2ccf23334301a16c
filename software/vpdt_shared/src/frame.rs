//! Datagram framing for the two detector wire protocols.
//!
//! Register protocol:  `"VPDT"` + packet id (u32 LE) + payload.
//! Config protocol:    `"VPDTCH"` + hardware MAC (6 bytes) + packet id (u32 LE) + payload.
//!
//! Decode failures are recoverable by construction: callers drop the
//! datagram and keep receiving.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

use crate::enum_with_unknown;

/// Leading magic of every register-protocol datagram
pub const REGISTER_MAGIC: &[u8; 4] = b"VPDT";

/// Leading magic of every config-protocol datagram
pub const CONFIG_MAGIC: &[u8; 6] = b"VPDTCH";

/// Register frame header: magic + packet id
pub const REGISTER_HEADER_LEN: usize = 8;

/// Config frame header: magic + MAC + packet id
pub const CONFIG_HEADER_LEN: usize = 16;

/// Config replies always carry at least a 4-byte status sub-header
/// after the frame header, so anything shorter is malformed.
pub const CONFIG_MIN_LEN: usize = 20;

/// A datagram that could not be interpreted against either wire format.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("datagram too short: {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },

    #[error("datagram magic does not match")]
    BadMagic,
}

enum_with_unknown!(
    /// Packet kinds carried by the register protocol
    pub enum RegisterKind(u32) {
        /// Register read/write request and reply
        Control = 1,
        /// Streaming acquisition record
        Stream = 2,
        /// Heartbeat/correction traffic, accepted but unacted
        Heartbeat = 3,
    }
);

enum_with_unknown!(
    /// Packet kinds carried by the config protocol
    pub enum ConfigKind(u32) {
        PageRead = 1,
        PageWrite = 2,
        UpdateCommand = 3,
        UpdateData = 4,
    }
);

/// A detector's hardware MAC, the device identity of the config protocol.
///
/// The fixed width makes malformed-length identifiers unrepresentable,
/// which is the only fatal misuse the original encoder guarded against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// Address every detector on the subnet at once
    pub const BROADCAST: Mac = Mac([0xFF; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A string that does not name a MAC.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("malformed mac address, expected 12 hex digits")]
pub struct MacParseError;

impl FromStr for Mac {
    type Err = MacParseError;

    /// Parse 12 contiguous hex digits, the same rendering `Display` produces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 12 || !s.is_ascii() {
            return Err(MacParseError);
        }
        let mut out = [0_u8; 6];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let text = core::str::from_utf8(chunk).map_err(|_| MacParseError)?;
            out[i] = u8::from_str_radix(text, 16).map_err(|_| MacParseError)?;
        }
        Ok(Mac(out))
    }
}

/// Frame a register-protocol payload for transmission.
pub fn encode_register(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REGISTER_HEADER_LEN + payload.len());
    buf.extend_from_slice(REGISTER_MAGIC);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a register-protocol datagram into packet id and payload.
pub fn decode_register(buf: &[u8]) -> Result<(u32, &[u8]), FrameError> {
    if buf.len() < REGISTER_HEADER_LEN {
        return Err(FrameError::TooShort {
            got: buf.len(),
            need: REGISTER_HEADER_LEN,
        });
    }
    if &buf[..4] != REGISTER_MAGIC {
        return Err(FrameError::BadMagic);
    }
    let id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((id, &buf[REGISTER_HEADER_LEN..]))
}

/// Frame a config-protocol payload for transmission to `mac`.
pub fn encode_config(mac: Mac, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CONFIG_HEADER_LEN + payload.len());
    buf.extend_from_slice(CONFIG_MAGIC);
    buf.extend_from_slice(mac.as_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a config-protocol datagram into MAC, packet id, and payload.
pub fn decode_config(buf: &[u8]) -> Result<(Mac, u32, &[u8]), FrameError> {
    if buf.len() < CONFIG_MIN_LEN {
        return Err(FrameError::TooShort {
            got: buf.len(),
            need: CONFIG_MIN_LEN,
        });
    }
    if &buf[..6] != CONFIG_MAGIC {
        return Err(FrameError::BadMagic);
    }
    let mut mac = [0_u8; 6];
    mac.copy_from_slice(&buf[6..12]);
    let id = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    Ok((Mac(mac), id, &buf[CONFIG_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_roundtrip() {
        let payload = [0_u8, 1, 2, 3, 4, 5];
        let framed = encode_register(2, &payload);
        let (id, body) = decode_register(&framed).unwrap();
        assert_eq!(id, 2);
        assert_eq!(body, payload);
    }

    #[test]
    fn register_frame_rejects_short_and_foreign() {
        for len in 0..REGISTER_HEADER_LEN {
            let buf = vec![0_u8; len];
            assert!(matches!(
                decode_register(&buf),
                Err(FrameError::TooShort { .. })
            ));
        }
        assert_eq!(
            decode_register(b"XXXX\x01\x00\x00\x00"),
            Err(FrameError::BadMagic)
        );
    }

    #[test]
    fn config_frame_roundtrip() {
        let mac = Mac([0x00, 0x1B, 0x44, 0x11, 0x3A, 0xB7]);
        let payload = [0_u8; 8];
        let framed = encode_config(mac, 1, &payload);
        let (got_mac, id, body) = decode_config(&framed).unwrap();
        assert_eq!(got_mac, mac);
        assert_eq!(id, 1);
        assert_eq!(body, payload);
    }

    #[test]
    fn config_frame_requires_status_subheader() {
        // A frame header alone (16 bytes) is not a valid config datagram.
        let framed = encode_config(Mac::BROADCAST, 1, &[]);
        assert!(matches!(
            decode_config(&framed),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn mac_display_parse_roundtrip() {
        let mac = Mac([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x42]);
        let text = mac.to_string();
        assert_eq!(text, "deadbeef0042");
        assert_eq!(text.parse::<Mac>().unwrap(), mac);
        assert!("nothex".parse::<Mac>().is_err());
    }

    #[test]
    fn packet_kinds_preserve_unknown_values() {
        assert_eq!(RegisterKind::from(2), RegisterKind::Stream);
        assert_eq!(RegisterKind::from(9), RegisterKind::Unknown(9));
        assert_eq!(u32::from(ConfigKind::UpdateData), 4);
    }
}
