//! Streaming acquisition record layout.
//!
//! The detector only includes the optional header fields it has been
//! configured to emit, and the data payload shape depends on the active
//! acquisition mode, so there is no static record struct. Instead, the
//! field order is assembled at runtime from the capability flags and the
//! decoder walks that field list over the raw buffer.

use crate::control::caps;
use crate::frame::FrameError;

/// Optional record header fields advertised by the acquisition header register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub info: bool,
    pub pos0: bool,
    pub pos1: bool,
    /// Timestamps are requested per acquisition, not advertised by the device.
    pub timestamp: bool,
}

impl Capabilities {
    /// Decode the acquisition header register.
    pub fn from_header(word: u32) -> Self {
        Self {
            info: word & caps::INFO != 0,
            pos0: word & caps::POS0 != 0,
            pos1: word & caps::POS1 != 0,
            timestamp: false,
        }
    }
}

/// Shape of the data payload of one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordShape {
    /// One histogram spanning the configured window's bin range
    Histogram { bins: usize },
    /// Per-window counts for one package of pixels
    Windowed {
        windows: usize,
        package_pixels: usize,
    },
}

impl RecordShape {
    /// Number of u16 entries in the data payload.
    pub fn data_len(&self) -> usize {
        match *self {
            RecordShape::Histogram { bins } => bins,
            RecordShape::Windowed {
                windows,
                package_pixels,
            } => windows * package_pixels,
        }
    }
}

/// The fields a record can carry, in no particular order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Flag,
    Ts1,
    Ts2,
    Pos0Head,
    Pos0Tail,
    Pos1Head,
    Pos1Tail,
    Info,
    Frame,
    Idx,
    DataLen,
    Data,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::Flag => "flag",
            Field::Ts1 => "ts1",
            Field::Ts2 => "ts2",
            Field::Pos0Head => "pos0_head",
            Field::Pos0Tail => "pos0_tail",
            Field::Pos1Head => "pos1_head",
            Field::Pos1Tail => "pos1_tail",
            Field::Info => "info",
            Field::Frame => "frame",
            Field::Idx => "idx",
            Field::DataLen => "data_len",
            Field::Data => "data",
        }
    }
}

/// Width and interpretation of one field slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    U16,
    U32,
    I32,
    U16Array(usize),
}

impl FieldKind {
    pub fn byte_len(&self) -> usize {
        match *self {
            FieldKind::U16 => 2,
            FieldKind::U32 => 4,
            FieldKind::I32 => 4,
            FieldKind::U16Array(len) => 2 * len,
        }
    }
}

/// One slot of an assembled record layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub field: Field,
    pub kind: FieldKind,
}

impl FieldSpec {
    fn new(field: Field, kind: FieldKind) -> Self {
        Self { field, kind }
    }
}

/// Assemble the record field order for one combination of capability
/// flags and payload shape.
///
/// The optional fields sit between `flag` and `frame`, in the fixed
/// order timestamps, encoder 0, encoder 1, info word.
pub fn record_layout(caps: Capabilities, shape: &RecordShape) -> Vec<FieldSpec> {
    let mut layout = Vec::with_capacity(12);
    layout.push(FieldSpec::new(Field::Flag, FieldKind::U32));
    if caps.timestamp {
        layout.push(FieldSpec::new(Field::Ts1, FieldKind::U32));
        layout.push(FieldSpec::new(Field::Ts2, FieldKind::U32));
    }
    if caps.pos0 {
        layout.push(FieldSpec::new(Field::Pos0Head, FieldKind::I32));
        layout.push(FieldSpec::new(Field::Pos0Tail, FieldKind::I32));
    }
    if caps.pos1 {
        layout.push(FieldSpec::new(Field::Pos1Head, FieldKind::I32));
        layout.push(FieldSpec::new(Field::Pos1Tail, FieldKind::I32));
    }
    if caps.info {
        layout.push(FieldSpec::new(Field::Info, FieldKind::U32));
    }
    layout.push(FieldSpec::new(Field::Frame, FieldKind::U32));
    layout.push(FieldSpec::new(Field::Idx, FieldKind::U16));
    layout.push(FieldSpec::new(Field::DataLen, FieldKind::U16));
    layout.push(FieldSpec::new(Field::Data, FieldKind::U16Array(shape.data_len())));
    layout
}

/// Total encoded length of a layout in bytes.
pub fn layout_len(layout: &[FieldSpec]) -> usize {
    layout.iter().map(|f| f.kind.byte_len()).sum()
}

/// Head/tail positions of one encoder channel over a record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "ser", derive(serde::Serialize))]
pub struct EncoderSpan {
    pub head: i32,
    pub tail: i32,
}

/// One decoded acquisition record.
///
/// The base fields reflect the record's own bytes. The optional fields
/// are present only on record 0 of each frame until
/// [`backfill_frame`] copies them across the rest of the frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "ser", derive(serde::Serialize))]
pub struct Record {
    pub flag: u32,
    pub frame: u32,
    pub idx: u16,
    pub data_len: u16,
    pub data: Vec<u16>,
    pub info: Option<u32>,
    pub pos0: Option<EncoderSpan>,
    pub pos1: Option<EncoderSpan>,
    pub timestamp: Option<(u32, u32)>,
}

/// Decode one record by walking `layout` over `buf`.
pub fn decode_record(layout: &[FieldSpec], buf: &[u8]) -> Result<Record, FrameError> {
    let need = layout_len(layout);
    if buf.len() < need {
        return Err(FrameError::TooShort {
            got: buf.len(),
            need,
        });
    }

    let mut record = Record::default();
    let mut cursor = 0_usize;
    let mut ts = (0_u32, 0_u32);
    for spec in layout {
        let width = spec.kind.byte_len();
        let bytes = &buf[cursor..cursor + width];
        cursor += width;
        match spec.field {
            Field::Flag => record.flag = read_u32(bytes),
            Field::Ts1 => ts.0 = read_u32(bytes),
            Field::Ts2 => {
                ts.1 = read_u32(bytes);
                record.timestamp = Some(ts);
            }
            Field::Pos0Head => {
                record.pos0.get_or_insert_with(Default::default).head = read_i32(bytes)
            }
            Field::Pos0Tail => {
                record.pos0.get_or_insert_with(Default::default).tail = read_i32(bytes)
            }
            Field::Pos1Head => {
                record.pos1.get_or_insert_with(Default::default).head = read_i32(bytes)
            }
            Field::Pos1Tail => {
                record.pos1.get_or_insert_with(Default::default).tail = read_i32(bytes)
            }
            Field::Info => record.info = Some(read_u32(bytes)),
            Field::Frame => record.frame = read_u32(bytes),
            Field::Idx => record.idx = read_u16(bytes),
            Field::DataLen => record.data_len = read_u16(bytes),
            Field::Data => {
                record.data = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect()
            }
        }
    }
    Ok(record)
}

/// Encode one record against `layout`. Missing optional fields encode as
/// zero; the data payload is zero-padded or truncated to the layout's
/// declared length.
pub fn encode_record(layout: &[FieldSpec], record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(layout_len(layout));
    for spec in layout {
        match spec.field {
            Field::Flag => buf.extend_from_slice(&record.flag.to_le_bytes()),
            Field::Ts1 => {
                buf.extend_from_slice(&record.timestamp.unwrap_or_default().0.to_le_bytes())
            }
            Field::Ts2 => {
                buf.extend_from_slice(&record.timestamp.unwrap_or_default().1.to_le_bytes())
            }
            Field::Pos0Head => {
                buf.extend_from_slice(&record.pos0.unwrap_or_default().head.to_le_bytes())
            }
            Field::Pos0Tail => {
                buf.extend_from_slice(&record.pos0.unwrap_or_default().tail.to_le_bytes())
            }
            Field::Pos1Head => {
                buf.extend_from_slice(&record.pos1.unwrap_or_default().head.to_le_bytes())
            }
            Field::Pos1Tail => {
                buf.extend_from_slice(&record.pos1.unwrap_or_default().tail.to_le_bytes())
            }
            Field::Info => buf.extend_from_slice(&record.info.unwrap_or_default().to_le_bytes()),
            Field::Frame => buf.extend_from_slice(&record.frame.to_le_bytes()),
            Field::Idx => buf.extend_from_slice(&record.idx.to_le_bytes()),
            Field::DataLen => buf.extend_from_slice(&record.data_len.to_le_bytes()),
            Field::Data => {
                let FieldKind::U16Array(len) = spec.kind else {
                    continue;
                };
                for i in 0..len {
                    let value = record.data.get(i).copied().unwrap_or(0);
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
    buf
}

/// Copy the frame-level optional fields from record 0 into the rest of
/// the frame. The base fields of records 1..N-1 keep their own decoded
/// values.
pub fn backfill_frame(records: &mut [Record]) {
    let Some((first, rest)) = records.split_first_mut() else {
        return;
    };
    for record in rest {
        record.info = first.info;
        record.pos0 = first.pos0;
        record.pos1 = first.pos1;
        record.timestamp = first.timestamp;
    }
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_names(layout: &[FieldSpec]) -> Vec<&'static str> {
        layout.iter().map(|f| f.field.name()).collect()
    }

    #[test]
    fn layout_order_tracks_capabilities() {
        let caps = Capabilities {
            info: true,
            pos0: true,
            pos1: false,
            timestamp: false,
        };
        let layout = record_layout(caps, &RecordShape::Histogram { bins: 120 });
        assert_eq!(
            field_names(&layout),
            [
                "flag",
                "pos0_head",
                "pos0_tail",
                "info",
                "frame",
                "idx",
                "data_len",
                "data"
            ]
        );
    }

    #[test]
    fn base_layout_is_fixed() {
        let layout = record_layout(
            Capabilities::default(),
            &RecordShape::Windowed {
                windows: 4,
                package_pixels: 20,
            },
        );
        assert_eq!(field_names(&layout), ["flag", "frame", "idx", "data_len", "data"]);
        // 4 + 4 + 2 + 2 + 2 * 4 * 20
        assert_eq!(layout_len(&layout), 172);
    }

    #[test]
    fn record_roundtrip_with_all_fields() {
        let caps = Capabilities {
            info: true,
            pos0: true,
            pos1: true,
            timestamp: true,
        };
        let shape = RecordShape::Histogram { bins: 3 };
        let layout = record_layout(caps, &shape);
        let record = Record {
            flag: 7,
            frame: 41,
            idx: 0,
            data_len: 3,
            data: vec![10, 20, 30],
            info: Some(0xAABB),
            pos0: Some(EncoderSpan { head: -5, tail: 9 }),
            pos1: Some(EncoderSpan { head: 1, tail: 2 }),
            timestamp: Some((100, 200)),
        };
        let bytes = encode_record(&layout, &record);
        assert_eq!(bytes.len(), layout_len(&layout));
        let decoded = decode_record(&layout, &bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_rejects_truncated_buffers() {
        let layout = record_layout(Capabilities::default(), &RecordShape::Histogram { bins: 8 });
        let bytes = vec![0_u8; layout_len(&layout) - 1];
        assert!(matches!(
            decode_record(&layout, &bytes),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn backfill_copies_frame_fields_only() {
        let caps = Capabilities {
            info: true,
            pos0: true,
            pos1: false,
            timestamp: false,
        };
        let shape = RecordShape::Histogram { bins: 2 };
        let head_layout = record_layout(caps, &shape);
        let base_layout = record_layout(Capabilities::default(), &shape);

        let head = Record {
            flag: 1,
            frame: 9,
            idx: 0,
            data_len: 2,
            data: vec![5, 6],
            info: Some(77),
            pos0: Some(EncoderSpan { head: 3, tail: 4 }),
            ..Default::default()
        };
        let tail = Record {
            flag: 2,
            frame: 9,
            idx: 1,
            data_len: 2,
            data: vec![7, 8],
            ..Default::default()
        };

        // Round-trip both through their own layouts first, as the
        // acquisition path does.
        let mut frame = vec![
            decode_record(&head_layout, &encode_record(&head_layout, &head)).unwrap(),
            decode_record(&base_layout, &encode_record(&base_layout, &tail)).unwrap(),
        ];
        backfill_frame(&mut frame);

        assert_eq!(frame[1].info, Some(77));
        assert_eq!(frame[1].pos0, Some(EncoderSpan { head: 3, tail: 4 }));
        // Own base fields survive untouched
        assert_eq!(frame[1].flag, 2);
        assert_eq!(frame[1].idx, 1);
        assert_eq!(frame[1].data, vec![7, 8]);
        assert_eq!(frame[0].flag, 1);
    }
}
