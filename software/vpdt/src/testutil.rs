//! Scripted loopback detectors for exercising the stack end to end.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use vpdt_shared::control::{
    ByteStruct, ByteStructLen, OP_READ, OP_WRITE, PAGE_LEN, PageSubHeader, RegReadReply,
    RegWriteRequest, reg,
};
use vpdt_shared::frame::{self, ConfigKind, Mac, RegisterKind};
use vpdt_shared::models::model_params;
use vpdt_shared::records::{
    Capabilities, EncoderSpan, Record, RecordShape, encode_record, record_layout,
};

use crate::config::ConfigHub;
use crate::discovery::DetectorHub;
use crate::socket::{ConfigWire, RegisterWire};

/// Route test logs through the capture machinery; safe to call from
/// every test.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A hub whose probes and traffic all target the given fake detector.
pub(crate) fn register_hub_for(device: &FakeDetector) -> DetectorHub {
    DetectorHub::bind_with(
        (Ipv4Addr::LOCALHOST, 0).into(),
        RegisterWire {
            detector_port: device.addr.port(),
        },
        device.addr,
    )
    .unwrap()
}

pub(crate) fn config_hub_for(device: &FakeConfigDetector) -> ConfigHub {
    ConfigHub::bind_with(
        (Ipv4Addr::LOCALHOST, 0).into(),
        ConfigWire {
            target: device.addr,
        },
    )
    .unwrap()
}

/// Register-protocol detector simulator: answers reads and writes
/// against a register map, reports model fragments, and streams
/// acquisition records when started.
pub(crate) struct FakeDetector {
    pub addr: SocketAddr,
    regs: Arc<Mutex<BTreeMap<u16, u32>>>,
    writes: Arc<Mutex<Vec<(u16, u32)>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeDetector {
    pub fn spawn(model: &'static str) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();

        let regs = Arc::new(Mutex::new(BTreeMap::new()));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let regs = Arc::clone(&regs);
            let writes = Arc::clone(&writes);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || run_register_device(socket, model, regs, writes, stop))
        };

        Self {
            addr,
            regs,
            writes,
            stop,
            thread: Some(thread),
        }
    }

    pub fn set_register(&self, addr: u16, value: u32) {
        self.regs.lock().unwrap().insert(addr, value);
    }

    /// Register writes observed so far, excluding acquisition setup.
    pub fn writes(&self) -> Vec<(u16, u32)> {
        self.writes.lock().unwrap().clone()
    }
}

impl Drop for FakeDetector {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_register_device(
    socket: UdpSocket,
    model: &'static str,
    regs: Arc<Mutex<BTreeMap<u16, u32>>>,
    writes: Arc<Mutex<Vec<(u16, u32)>>>,
    stop: Arc<AtomicBool>,
) {
    let mut model_bytes = [0_u8; 8];
    model_bytes[..model.len()].copy_from_slice(model.as_bytes());
    let control = u32::from(RegisterKind::Control);

    let mut buf = [0_u8; 1522];
    while !stop.load(Ordering::SeqCst) {
        let Ok((size, src)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let Ok((id, payload)) = frame::decode_register(&buf[..size]) else {
            continue;
        };
        if id != control || payload.len() < 4 {
            continue;
        }
        let op = u16::from_le_bytes([payload[0], payload[1]]);
        let addr = u16::from_le_bytes([payload[2], payload[3]]);
        if op == OP_READ {
            let value = match addr {
                0 => u32::from_le_bytes(model_bytes[..4].try_into().unwrap()),
                1 => u32::from_le_bytes(model_bytes[4..].try_into().unwrap()),
                _ => regs.lock().unwrap().get(&addr).copied().unwrap_or(0),
            };
            reply_read(&socket, src, addr, value);
        } else if op == OP_WRITE && payload.len() >= RegWriteRequest::BYTE_LEN {
            let value = u32::from_le_bytes(payload[4..8].try_into().unwrap());
            regs.lock().unwrap().insert(addr, value);
            let acq_setup = matches!(
                addr,
                reg::ACQ_START | reg::ACQ_MODE | reg::ACQ_SUBMODE | reg::ACQ_INTERVAL | reg::ACQ_COUNT
            );
            if !acq_setup {
                writes.lock().unwrap().push((addr, value));
            }
            reply_read(&socket, src, addr, value);
            if addr == reg::ACQ_START && value == 1 {
                stream_records(&socket, src, model, &regs.lock().unwrap());
            }
        }
    }
}

fn reply_read(socket: &UdpSocket, dest: SocketAddr, addr: u16, value: u32) {
    let mut payload = [0_u8; RegReadReply::BYTE_LEN];
    RegReadReply {
        flag: 0,
        addr,
        value,
    }
    .write_bytes(&mut payload);
    let framed = frame::encode_register(u32::from(RegisterKind::Control), &payload);
    let _ = socket.send_to(&framed, dest);
}

/// Emit one acquisition's worth of stream records, shaped by the
/// registers the host just programmed.
fn stream_records(socket: &UdpSocket, dest: SocketAddr, model: &str, regs: &BTreeMap<u16, u32>) {
    let params = model_params(model).expect("fake detector model must be in the table");
    let count = regs.get(&reg::ACQ_COUNT).copied().unwrap_or(0);
    let submode = regs.get(&reg::ACQ_SUBMODE).copied().unwrap_or(0);
    let header = regs.get(&reg::ACQ_HEADER).copied().unwrap_or(0);

    let (shape, per_frame) = if submode == 1 {
        let range = regs.get(&reg::WINDOW_RANGE_BASE).copied().unwrap_or(0);
        let bins = ((range >> 16) - (range & 0xFFFF) + 1) as usize;
        (RecordShape::Histogram { bins }, params.pixel_count)
    } else {
        let windows = (regs.get(&reg::WINDOW_COUNT).copied().unwrap_or(0) + 1) as usize;
        (
            RecordShape::Windowed {
                windows,
                package_pixels: params.package_pixels,
            },
            params.pixel_count / params.package_pixels,
        )
    };

    let caps = Capabilities::from_header(header);
    let head_layout = record_layout(caps, &shape);
    let base_layout = record_layout(Capabilities::default(), &shape);
    let stream = u32::from(RegisterKind::Stream);

    for frame_no in 0..count {
        for idx in 0..per_frame {
            let mut record = Record {
                flag: 0xA5,
                frame: frame_no,
                idx: idx as u16,
                data_len: shape.data_len() as u16,
                data: vec![idx as u16; shape.data_len()],
                ..Default::default()
            };
            let layout = if idx == 0 {
                if caps.info {
                    record.info = Some(1000 + frame_no);
                }
                if caps.pos0 {
                    record.pos0 = Some(EncoderSpan {
                        head: frame_no as i32,
                        tail: frame_no as i32 + 5,
                    });
                }
                if caps.pos1 {
                    record.pos1 = Some(EncoderSpan { head: -1, tail: 1 });
                }
                &head_layout
            } else {
                &base_layout
            };
            let framed = frame::encode_register(stream, &encode_record(layout, &record));
            let _ = socket.send_to(&framed, dest);
            // Pace the burst so loopback buffers never overflow.
            if idx % 8 == 7 {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }
}

/// Operations a fake config detector has observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConfigOp {
    PageWrite { page: u16 },
    Command { kind: u16 },
    Erase { ctr: u16, page: u16 },
    Program { page: u16 },
}

/// Config-protocol detector simulator: serves pages from a page store,
/// acknowledges writes and update commands, and can be told to reject
/// one program page.
pub(crate) struct FakeConfigDetector {
    pub addr: SocketAddr,
    pub mac: Mac,
    pages: Arc<Mutex<BTreeMap<u16, [u8; PAGE_LEN]>>>,
    ops: Arc<Mutex<Vec<ConfigOp>>>,
    fail_program_page: Arc<Mutex<Option<u16>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeConfigDetector {
    pub fn spawn(mac: Mac, pages: BTreeMap<u16, [u8; PAGE_LEN]>) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();

        let pages = Arc::new(Mutex::new(pages));
        let ops = Arc::new(Mutex::new(Vec::new()));
        let fail_program_page = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let pages = Arc::clone(&pages);
            let ops = Arc::clone(&ops);
            let fail = Arc::clone(&fail_program_page);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || run_config_device(socket, mac, pages, ops, fail, stop))
        };

        Self {
            addr,
            mac,
            pages,
            ops,
            fail_program_page,
            stop,
            thread: Some(thread),
        }
    }

    pub fn page(&self, page: u16) -> Option<[u8; PAGE_LEN]> {
        self.pages.lock().unwrap().get(&page).copied()
    }

    pub fn ops(&self) -> Vec<ConfigOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn fail_program_at(&self, page: u16) {
        *self.fail_program_page.lock().unwrap() = Some(page);
    }
}

impl Drop for FakeConfigDetector {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_config_device(
    socket: UdpSocket,
    mac: Mac,
    pages: Arc<Mutex<BTreeMap<u16, [u8; PAGE_LEN]>>>,
    ops: Arc<Mutex<Vec<ConfigOp>>>,
    fail_program_page: Arc<Mutex<Option<u16>>>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0_u8; 1522];
    while !stop.load(Ordering::SeqCst) {
        let Ok((size, src)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let Ok((target, id, payload)) = frame::decode_config(&buf[..size]) else {
            continue;
        };
        if target != mac && target != Mac::BROADCAST {
            continue;
        }
        let sub = PageSubHeader::read_bytes(&payload[..PageSubHeader::BYTE_LEN]);
        let reply = match ConfigKind::from(id) {
            ConfigKind::PageRead => {
                let body = pages
                    .lock()
                    .unwrap()
                    .get(&sub.page)
                    .copied()
                    .unwrap_or([0_u8; PAGE_LEN]);
                let mut reply = PageSubHeader::new(0, sub.page).to_bytes().to_vec();
                reply.extend_from_slice(&body);
                reply
            }
            ConfigKind::PageWrite => {
                if payload.len() >= 4 + PAGE_LEN {
                    let mut body = [0_u8; PAGE_LEN];
                    body.copy_from_slice(&payload[4..4 + PAGE_LEN]);
                    pages.lock().unwrap().insert(sub.page, body);
                }
                ops.lock().unwrap().push(ConfigOp::PageWrite { page: sub.page });
                PageSubHeader::new(0, sub.page).to_bytes().to_vec()
            }
            ConfigKind::UpdateCommand => {
                ops.lock().unwrap().push(ConfigOp::Command { kind: sub.page });
                PageSubHeader::new(0, sub.page).to_bytes().to_vec()
            }
            ConfigKind::UpdateData => {
                let flag = if sub.flag != 0 {
                    ops.lock().unwrap().push(ConfigOp::Erase {
                        ctr: sub.flag,
                        page: sub.page,
                    });
                    0
                } else {
                    ops.lock().unwrap().push(ConfigOp::Program { page: sub.page });
                    match *fail_program_page.lock().unwrap() {
                        Some(bad) if bad == sub.page => 1,
                        _ => 0,
                    }
                };
                PageSubHeader::new(flag, sub.page).to_bytes().to_vec()
            }
            ConfigKind::Unknown(_) => continue,
        };
        let framed = frame::encode_config(mac, id, &reply);
        let _ = socket.send_to(&framed, src);
    }
}

/// A plausible page 0: identity plus network configuration.
pub(crate) fn sample_page0(model: &str) -> [u8; PAGE_LEN] {
    let mut page = [0_u8; PAGE_LEN];
    page[..model.len()].copy_from_slice(model.as_bytes());
    page[0x08..0x0E].copy_from_slice(b"SN0001");
    // Versions are stored low-segment-first
    page[0x18..0x1C].copy_from_slice(&[1, 2, 3, 0]); // 3.2.1
    page[0x20..0x24].copy_from_slice(&[4, 5, 6, 0]); // 6.5.4
    page[0x24..0x26].copy_from_slice(&[7, 8]); // 8.7
    // Addresses are stored byte-reversed
    page[0x40..0x44].copy_from_slice(&[240, 22, 20, 10]); // 10.20.22.240
    page[0x44..0x48].copy_from_slice(&[1, 22, 20, 10]); // 10.20.22.1
    page[0x48..0x4C].copy_from_slice(&[2, 22, 20, 10]); // 10.20.22.2
    page[0x4C] = 24;
    page[0x4D] = 5;
    page[0x4E..0x50].copy_from_slice(&7493_u16.to_le_bytes());
    page
}
