//! Handle for one detector module on the register protocol: synchronous
//! register access, derived setters, and status queries. Streaming
//! acquisition lives in [`acquire`].

pub mod acquire;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use vpdt_shared::control::{
    ByteStruct, ByteStructLen, RegReadReply, RegReadRequest, RegWriteRequest, reg,
};
use vpdt_shared::frame::RegisterKind;
use vpdt_shared::models::DetectorParams;

use crate::error::{Error, Result};
use crate::socket::{Dispatch, RegisterWire};

pub use acquire::Acquisition;

/// Register read/write round-trip window.
const REG_TIMEOUT: Duration = Duration::from_secs(2);

/// One detector module, addressed by its network address.
///
/// Every operation round-trips to hardware; nothing is cached. The
/// dispatch engine does not serialize concurrent calls against the same
/// device, so keep one caller at a time per handle.
#[derive(Clone)]
pub struct Detector {
    ip: IpAddr,
    model: String,
    params: Option<DetectorParams>,
    dispatch: Arc<Dispatch<RegisterWire>>,
}

/// Desired state of the switchable power rails.
#[derive(Clone, Copy, Debug, Default)]
pub struct PowerSwitch {
    pub vcc12: bool,
    pub laser1: bool,
    pub laser0: bool,
    pub vdd25: bool,
    pub opa: bool,
    pub vbias: bool,
}

impl PowerSwitch {
    fn control_word(&self) -> u32 {
        ((self.vcc12 as u32) << 6)
            | ((self.laser1 as u32) << 5)
            | ((self.laser0 as u32) << 4)
            | ((self.vdd25 as u32) << 3)
            | ((self.opa as u32) << 1)
            | (self.vbias as u32)
    }
}

/// Configuration for one position encoder channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncoderChannel {
    /// Channel index, 0 or 1
    pub index: u8,
    pub enable: bool,
    pub polarity: bool,
    pub clear_position: bool,
    /// Zero offset in encoder counts
    pub zero_shift: i32,
}

/// One metric of a status query.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "ser", derive(serde::Serialize))]
pub enum StatusValue {
    Bool(bool),
    UInt(u32),
    Int(i64),
    Float(f64),
    /// Per-channel rail states rendered as a bit string
    Bits(String),
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Bool(v) => write!(f, "{v}"),
            StatusValue::UInt(v) => write!(f, "{v}"),
            StatusValue::Int(v) => write!(f, "{v}"),
            StatusValue::Float(v) => write!(f, "{v}"),
            StatusValue::Bits(v) => f.write_str(v),
        }
    }
}

/// Metric name → value for one status category.
pub type StatusMap = BTreeMap<String, StatusValue>;

impl Detector {
    pub(crate) fn bind(
        dispatch: Arc<Dispatch<RegisterWire>>,
        ip: IpAddr,
        model: String,
        params: Option<DetectorParams>,
    ) -> Self {
        dispatch.register(ip);
        Self {
            ip,
            model,
            params,
            dispatch,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Model string the device reported during discovery.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn params(&self) -> Option<&DetectorParams> {
        self.params.as_ref()
    }

    /// Override the parameter set, e.g. for lab modules whose pixel
    /// population differs from the model table.
    pub fn params_mut(&mut self) -> &mut Option<DetectorParams> {
        &mut self.params
    }

    fn require_params(&self) -> Result<&DetectorParams> {
        self.params.as_ref().ok_or_else(|| {
            Error::validation(format!(
                "model {:?} is not in the parameter table",
                self.model
            ))
        })
    }

    pub(crate) fn dispatch(&self) -> &Dispatch<RegisterWire> {
        &self.dispatch
    }

    /// Read one 32-bit register. A timeout leaves no value to return
    /// and is reported as an error.
    pub fn read_register(&self, addr: u16) -> Result<u32> {
        let control = u32::from(RegisterKind::Control);
        let mut payload = [0_u8; RegReadRequest::BYTE_LEN];
        RegReadRequest::new(addr).write_bytes(&mut payload);
        let entry = self
            .dispatch
            .transact(
                &self.ip,
                control,
                payload.to_vec(),
                |entry| entry.id == control,
                REG_TIMEOUT,
            )
            .inspect_err(|e| warn!("detector({}) read of {addr:#06x}: {e}", self.ip))?;
        if entry.payload.len() < RegReadReply::BYTE_LEN {
            return Err(vpdt_shared::frame::FrameError::TooShort {
                got: entry.payload.len(),
                need: RegReadReply::BYTE_LEN,
            }
            .into());
        }
        let reply = RegReadReply::read_bytes(&entry.payload[..RegReadReply::BYTE_LEN]);
        debug!("detector({}) read {addr:#06x} = {:#010x}", self.ip, reply.value);
        Ok(reply.value)
    }

    /// Write one 32-bit register. Unconfirmed on timeout; no retry.
    pub fn write_register(&self, addr: u16, value: u32) -> Result<()> {
        let control = u32::from(RegisterKind::Control);
        let mut payload = [0_u8; RegWriteRequest::BYTE_LEN];
        RegWriteRequest::new(addr, value).write_bytes(&mut payload);
        self.dispatch
            .transact(
                &self.ip,
                control,
                payload.to_vec(),
                |entry| entry.id == control,
                REG_TIMEOUT,
            )
            .inspect_err(|e| warn!("detector({}) write of {addr:#06x}: {e}", self.ip))?;
        debug!("detector({}) wrote {addr:#06x} = {value:#010x}", self.ip);
        Ok(())
    }

    /// Set how many energy windows the device populates.
    pub fn set_window_count(&self, count: u32) -> Result<()> {
        let params = self.require_params()?;
        if count > params.window_count {
            error!(
                "detector {} supports at most {} windows",
                params.model, params.window_count
            );
            return Err(Error::validation(format!(
                "window count {count} exceeds the {} supported by {}",
                params.window_count, params.model
            )));
        }
        if count == 0 {
            error!("window count must be at least one");
            return Err(Error::validation("window count must be at least one"));
        }
        self.write_register(reg::WINDOW_COUNT, count - 1)?;
        info!("detector({}) window count set to {count}", self.ip);
        Ok(())
    }

    /// Set one energy window's threshold range.
    pub fn set_window_range(&self, window: u32, low: u32, high: u32) -> Result<()> {
        let params = self.require_params()?;
        if window >= params.window_count {
            error!(
                "detector {} supports windows 0..{}",
                params.model, params.window_count
            );
            return Err(Error::validation(format!(
                "window {window} out of range for {}",
                params.model
            )));
        }
        if low > params.max_threshold || high > params.max_threshold {
            error!(
                "window bounds must be at most {} for {}",
                params.max_threshold, params.model
            );
            return Err(Error::validation(format!(
                "window bounds [{low}, {high}] exceed {}",
                params.max_threshold
            )));
        }
        if low > high {
            error!("window upper bound must not be below the lower bound");
            return Err(Error::validation(format!(
                "window range [{low}, {high}] is inverted"
            )));
        }
        self.write_register(reg::WINDOW_RANGE_BASE + window as u16, high << 16 | low)?;
        info!("detector({}) window {window} set to [{low}, {high}]", self.ip);
        Ok(())
    }

    /// Switch the power rails.
    pub fn set_power_switch(&self, power: &PowerSwitch) -> Result<()> {
        self.write_register(reg::POWER_CTRL, power.control_word())
    }

    /// Configure the position encoder channels. Channels with an
    /// out-of-range index are logged and skipped, the rest still apply.
    pub fn set_encoders(&self, channels: &[EncoderChannel]) -> Result<()> {
        for ch in channels {
            if ch.index > 1 {
                error!("encoder channel index must be 0 or 1, got {}", ch.index);
                continue;
            }
            let stride = ch.index as u16 * reg::ENCODER_STRIDE;
            self.write_register(reg::ENCODER_ZERO_BASE + stride, ch.zero_shift as u32)?;
            let ctrl = ((ch.enable as u32) << 2)
                | ((ch.clear_position as u32) << 1)
                | (ch.polarity as u32);
            self.write_register(reg::ENCODER_CTRL_BASE + stride, ctrl)?;
        }
        Ok(())
    }

    /// Supply rail telemetry in volts, amps, and watts.
    pub fn power_status(&self) -> Result<StatusMap> {
        let mut status = StatusMap::new();
        let voltage = self.read_register(reg::SUPPLY_VOLTAGE)? as f64 * 1.25 / 1000.0;
        let current = self.read_register(reg::SUPPLY_CURRENT)? as f64 / 1000.0;
        let power = self.read_register(reg::SUPPLY_POWER)? as f64 * 25.0 / 1000.0;
        status.insert("voltage".into(), StatusValue::Float(voltage));
        status.insert("current".into(), StatusValue::Float(current));
        status.insert("power".into(), StatusValue::Float(power));
        Ok(status)
    }

    /// State of the switchable rails: booleans for the I/O board rails,
    /// per-channel bit strings for the board-local ones.
    pub fn power_switch_status(&self) -> Result<StatusMap> {
        let local = self.read_register(reg::POWER_LOCAL_STATUS)?;
        let io = self.read_register(reg::POWER_IO_STATUS)?;
        let mut status = StatusMap::new();
        status.insert("vcc12".into(), StatusValue::Bool(io & (1 << 6) != 0));
        status.insert("laser1".into(), StatusValue::Bool(io & (1 << 5) != 0));
        status.insert("laser0".into(), StatusValue::Bool(io & (1 << 4) != 0));
        status.insert(
            "vdd25".into(),
            StatusValue::Bits(format!("{:08b}", (local >> 24) & 0xFF)),
        );
        status.insert(
            "opa".into(),
            StatusValue::Bits(format!("{:016b}", (local >> 8) & 0xFFFF)),
        );
        status.insert(
            "vbias".into(),
            StatusValue::Bits(format!("{:08b}", local & 0xFF)),
        );
        Ok(status)
    }

    /// Encoder signal levels and positions. With `lsb` given, positions
    /// are scaled to physical units.
    pub fn position_status(&self, lsb: Option<f64>) -> Result<StatusMap> {
        let mut status = StatusMap::new();
        for i in 0..2_u16 {
            let stride = i * reg::ENCODER_STRIDE;
            let signal = self.read_register(reg::ENCODER_SIGNAL_BASE + stride)?;
            status.insert(format!("pos{i}_a"), StatusValue::Bool(signal & 1 != 0));
            status.insert(format!("pos{i}_b"), StatusValue::Bool(signal & 2 != 0));
            let raw = self.read_register(reg::ENCODER_POSITION_BASE + stride)? as i32;
            let value = match lsb {
                Some(lsb) => StatusValue::Float(raw as f64 * lsb),
                None => StatusValue::Int(raw as i64),
            };
            status.insert(format!("pos{i}"), value);
        }
        Ok(status)
    }

    /// Board and I/O board temperatures in degrees C.
    pub fn temperature_status(&self) -> Result<StatusMap> {
        let mut status = StatusMap::new();
        let board_count = self.read_register(reg::BOARD_COUNT)?;
        status.insert("board_count".into(), StatusValue::UInt(board_count));
        let io = self.read_register(reg::IO_TEMP)?;
        status.insert("io_0".into(), StatusValue::Float(raw_temp(io & 0xFFFF)));
        status.insert("io_1".into(), StatusValue::Float(raw_temp(io >> 16)));
        for board in 0..board_count as u16 {
            for pair in 0..2_u16 {
                let word = self.read_register(reg::BOARD_TEMP_BASE + board * 2 + pair)?;
                status.insert(
                    format!("board{board}_{}", pair * 2),
                    StatusValue::Float(raw_temp(word & 0xFFFF)),
                );
                status.insert(
                    format!("board{board}_{}", pair * 2 + 1),
                    StatusValue::Float(raw_temp(word >> 16)),
                );
            }
        }
        Ok(status)
    }

    /// Fan tachometer readings, two packed per register.
    pub fn fan_status(&self) -> Result<StatusMap> {
        let mut status = StatusMap::new();
        let fan_count = self.read_register(reg::FAN_COUNT)?;
        status.insert("fan_count".into(), StatusValue::UInt(fan_count));
        let mut i = 0;
        while i < fan_count {
            let word = self.read_register(reg::FAN_SPEED_BASE + (i / 2) as u16)?;
            status.insert(
                format!("fan{i}"),
                StatusValue::Int((word & 0xFFFF) as u16 as i16 as i64),
            );
            if i + 1 < fan_count {
                status.insert(
                    format!("fan{}", i + 1),
                    StatusValue::Int((word >> 16) as u16 as i16 as i64),
                );
            }
            i += 2;
        }
        Ok(status)
    }

    /// Every status category in one nested map.
    pub fn full_status(&self, position_lsb: Option<f64>) -> Result<BTreeMap<&'static str, StatusMap>> {
        let mut status = BTreeMap::new();
        status.insert("temperature", self.temperature_status()?);
        status.insert("position", self.position_status(position_lsb)?);
        status.insert("power", self.power_status()?);
        status.insert("power_switch", self.power_switch_status()?);
        status.insert("fan", self.fan_status()?);
        Ok(status)
    }
}

/// Temperatures come as signed sixteenths-of-eighth degrees: i16 / 128.
fn raw_temp(raw: u32) -> f64 {
    (raw as u16 as i16) as f64 / 128.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeDetector, register_hub_for};

    #[test]
    fn window_validation_refuses_before_the_wire()  {
        let device = FakeDetector::spawn("D80");
        let hub = register_hub_for(&device);
        let detector = hub.attach(device.addr.ip(), "D80");
        hub.listen().unwrap();

        assert!(matches!(
            detector.set_window_range(0, 10, 5),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            detector.set_window_range(0, 0, 512),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            detector.set_window_range(4, 0, 100),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            detector.set_window_count(5),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            detector.set_window_count(0),
            Err(Error::Validation(_))
        ));
        // Nothing reached the device.
        assert!(device.writes().is_empty());

        detector.set_window_count(4).unwrap();
        detector.set_window_range(0, 0, 119).unwrap();
        assert_eq!(
            device.writes(),
            vec![(reg::WINDOW_COUNT, 3), (reg::WINDOW_RANGE_BASE, 119 << 16)]
        );
    }

    #[test]
    fn register_roundtrip_and_status() {
        let device = FakeDetector::spawn("D80");
        device.set_register(reg::SUPPLY_VOLTAGE, 8000);
        device.set_register(reg::SUPPLY_CURRENT, 1500);
        device.set_register(reg::SUPPLY_POWER, 400);
        let hub = register_hub_for(&device);
        let detector = hub.attach(device.addr.ip(), "D80");
        hub.listen().unwrap();

        detector.write_register(0x0070, 0xDEAD_BEEF).unwrap();
        assert_eq!(detector.read_register(0x0070).unwrap(), 0xDEAD_BEEF);

        let power = detector.power_status().unwrap();
        assert_eq!(power["voltage"], StatusValue::Float(10.0));
        assert_eq!(power["current"], StatusValue::Float(1.5));
        assert_eq!(power["power"], StatusValue::Float(10.0));
    }

    #[test]
    fn unknown_model_cannot_configure_windows() {
        let device = FakeDetector::spawn("D81");
        let hub = register_hub_for(&device);
        let detector = hub.attach(device.addr.ip(), "D81");
        hub.listen().unwrap();
        assert!(detector.params().is_none());
        assert!(matches!(
            detector.set_window_count(1),
            Err(Error::Validation(_))
        ));
    }
}
