//! Streaming acquisition: program the acquisition registers, derive the
//! record layout from the live capability flags, then collect the
//! streamed records for every frame.

use std::time::Duration;

use tracing::{debug, info};

use vpdt_shared::control::{caps, reg};
use vpdt_shared::frame::RegisterKind;
use vpdt_shared::records::{
    Capabilities, FieldSpec, Record, RecordShape, backfill_frame, decode_record, record_layout,
};

use crate::error::{Error, Result};

use super::Detector;

/// Acquisition trigger mode register value for automatic sampling
const MODE_AUTO: u32 = 0x03;
const SUBMODE_THRESHOLD: u32 = 0x00;
const SUBMODE_HISTOGRAM: u32 = 0x01;

/// The interval and count registers are 16 bits wide.
const ACQ_LIMIT: u32 = u16::MAX as u32;

/// Result of one streaming acquisition: the extended record layout that
/// was in effect, and one fully back-filled record list per frame.
///
/// UDP delivery order is not guaranteed to match acquisition order;
/// call [`Acquisition::sort_by_index`] before consuming positionally.
#[derive(Clone, Debug)]
pub struct Acquisition {
    pub layout: Vec<FieldSpec>,
    pub frames: Vec<Vec<Record>>,
}

impl Acquisition {
    /// Re-sort every frame's records by their decoded sequence index.
    pub fn sort_by_index(&mut self) {
        for frame in &mut self.frames {
            frame.sort_by_key(|record| record.idx);
        }
    }
}

impl Detector {
    /// Acquire `count` histogram frames, one record per pixel, each
    /// spanning window 0's configured bin range.
    pub fn acquire_histogram(&self, count: u32, interval: u32) -> Result<Acquisition> {
        self.acquire(SUBMODE_HISTOGRAM, count, interval)
    }

    /// Acquire `count` threshold-counting frames, one record per pixel
    /// package, shaped window-count x package-pixels.
    pub fn acquire_threshold(&self, count: u32, interval: u32) -> Result<Acquisition> {
        self.acquire(SUBMODE_THRESHOLD, count, interval)
    }

    fn acquire(&self, submode: u32, count: u32, interval: u32) -> Result<Acquisition> {
        let params = self.require_params()?.clone();
        // Chunked multi-batch acquisition for larger totals is an
        // unimplemented extension, not a silent truncation.
        if count > ACQ_LIMIT {
            return Err(Error::validation(format!(
                "sample count {count} exceeds {ACQ_LIMIT}; chunked acquisition is not implemented"
            )));
        }
        if interval > ACQ_LIMIT {
            return Err(Error::validation(format!(
                "sample interval {interval} exceeds {ACQ_LIMIT}; chunked acquisition is not implemented"
            )));
        }

        self.write_register(reg::ACQ_MODE, MODE_AUTO)?;
        self.write_register(reg::ACQ_SUBMODE, submode)?;
        self.write_register(reg::ACQ_INTERVAL, interval)?;
        self.write_register(reg::ACQ_COUNT, count)?;

        // The device only emits the optional header fields it has been
        // configured to include, so the layout comes from hardware, not
        // from assumptions.
        let (shape, records_per_frame) = match submode {
            SUBMODE_HISTOGRAM => {
                let range = self.read_register(reg::WINDOW_RANGE_BASE)?;
                let (low, high) = (range & 0xFFFF, range >> 16);
                let shape = RecordShape::Histogram {
                    bins: (high - low + 1) as usize,
                };
                (shape, params.pixel_count)
            }
            _ => {
                let windows = self.read_register(reg::WINDOW_COUNT)? + 1;
                let shape = RecordShape::Windowed {
                    windows: windows as usize,
                    package_pixels: params.package_pixels,
                };
                (shape, params.pixel_count / params.package_pixels)
            }
        };
        let header = self.read_register(reg::ACQ_HEADER)?;
        let capabilities = Capabilities::from_header(header);
        let head_layout = record_layout(capabilities, &shape);
        let base_layout = record_layout(Capabilities::default(), &shape);

        // Scale the per-record window to the configured interval so a
        // slow capture does not false-timeout.
        let record_timeout =
            Duration::from_secs_f64((interval as f64 + 10000.0) / 10000.0 * 2.0);

        let stream = u32::from(RegisterKind::Stream);
        let rx = self
            .dispatch()
            .inbox(&self.ip())
            .ok_or_else(|| Error::UnknownDevice(self.ip().to_string()))?;

        info!("detector({}) acquisition started", self.ip());
        self.write_register(reg::ACQ_START, 1)?;

        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut frame = Vec::with_capacity(records_per_frame);
            for slot in 0..records_per_frame {
                let entry = loop {
                    let entry = rx
                        .recv_timeout(record_timeout)
                        .map_err(|_| Error::Timeout(record_timeout))?;
                    if entry.id == stream {
                        break entry;
                    }
                    debug!("detector({}) dropped non-stream packet mid-acquisition", self.ip());
                };
                // Only the first record of each frame carries the
                // extended header fields.
                let layout = if slot == 0 { &head_layout } else { &base_layout };
                frame.push(decode_record(layout, &entry.payload)?);
            }
            backfill_frame(&mut frame);
            frames.push(frame);
        }
        info!("detector({}) acquisition finished", self.ip());

        Ok(Acquisition {
            layout: head_layout,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeDetector, register_hub_for};
    use vpdt_shared::records::Field;

    #[test]
    fn bounds_are_16_bit() {
        let device = FakeDetector::spawn("D80");
        let hub = register_hub_for(&device);
        let detector = hub.attach(device.addr.ip(), "D80");
        hub.listen().unwrap();
        assert!(matches!(
            detector.acquire_histogram(70_000, 200),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            detector.acquire_histogram(10, 70_000),
            Err(Error::Validation(_))
        ));
        assert!(device.writes().is_empty());
    }

    /// End-to-end: a D80 histogram acquisition returns `count` frames of
    /// one record per pixel, each spanning the configured bin range,
    /// with sequence indices covering the full frame once re-sorted.
    #[test]
    fn histogram_acquisition_roundtrip() {
        let device = FakeDetector::spawn("D80");
        device.set_register(reg::ACQ_HEADER, caps::INFO | caps::POS0);
        let hub = register_hub_for(&device);
        let detector = hub.attach(device.addr.ip(), "D80");
        hub.listen().unwrap();

        detector.set_window_count(4).unwrap();
        detector.set_window_range(0, 0, 119).unwrap();
        let mut acq = detector.acquire_histogram(10, 200).unwrap();

        assert_eq!(acq.frames.len(), 10);
        acq.sort_by_index();
        for frame in &acq.frames {
            assert_eq!(frame.len(), 80);
            for (i, record) in frame.iter().enumerate() {
                assert_eq!(record.idx as usize, i);
                assert_eq!(record.data.len(), 120);
                // Frame-level fields back-filled from record 0
                assert_eq!(record.info, frame[0].info);
                assert_eq!(record.pos0, frame[0].pos0);
                assert_eq!(record.pos1, None);
            }
        }

        let fields: Vec<&str> = acq.layout.iter().map(|f| f.field.name()).collect();
        assert_eq!(
            fields,
            ["flag", "pos0_head", "pos0_tail", "info", "frame", "idx", "data_len", "data"]
        );
    }

    #[test]
    fn threshold_acquisition_shapes_by_window() {
        let device = FakeDetector::spawn("D80");
        let hub = register_hub_for(&device);
        let detector = hub.attach(device.addr.ip(), "D80");
        hub.listen().unwrap();

        detector.set_window_count(4).unwrap();
        let acq = detector.acquire_threshold(3, 100).unwrap();

        // 80 pixels in packages of 20
        assert_eq!(acq.frames.len(), 3);
        for frame in &acq.frames {
            assert_eq!(frame.len(), 4);
            for record in frame {
                // 4 windows x 20 package pixels
                assert_eq!(record.data.len(), 80);
            }
        }
        assert!(acq.layout.iter().any(|f| f.field == Field::Data));
    }
}
