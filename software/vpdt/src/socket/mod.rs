//! UDP dispatch for the detector protocols.
//!
//! One engine owns one socket per protocol role. A receiver thread
//! drains inbound datagrams, frame-decodes them, and routes recognized
//! packets into per-device inboxes; a sender thread drains a shared
//! outbound queue. Everything above this layer is a synchronous
//! request/reply exchange built on [`Dispatch::transact`].
//!
//! The engine never retries on its own and never raises for malformed
//! or foreign traffic; retry policy belongs to the callers, and unknown
//! senders are silently dropped.

pub mod config;
pub mod register;

use std::collections::BTreeMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use socket2::{Domain, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub use config::ConfigWire;
pub use register::RegisterWire;

/// Receive buffer for one datagram; matches one ethernet frame with room
/// to spare.
pub(crate) const RX_BUFFER_LEN: usize = 1522;

/// How long the background threads block before re-checking the listen
/// flag; also the socket's steady-state read timeout.
pub(crate) const LOOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Requested kernel receive buffer. Streaming acquisition is bursty and
/// must not drop records to buffer exhaustion; the kernel clamps this to
/// its configured maximum.
const RECV_BUFFER_BYTES: usize = 1536 * 1024 * 1024;

/// One routed inbound packet, as seen by a device inbox.
#[derive(Clone, Debug)]
pub struct Entry {
    pub id: u32,
    pub payload: Vec<u8>,
}

struct Inbox {
    tx: Sender<Entry>,
    rx: Receiver<Entry>,
}

impl Inbox {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

struct Outbound<K> {
    key: K,
    id: u32,
    payload: Vec<u8>,
}

/// Wire-format routing for one protocol role. Implementations decide
/// which datagrams are deliverable and to which device identity, and
/// they own the logging for heartbeat/unrecognized traffic.
pub trait Wire: Send + Sync + 'static {
    /// Device identity within this protocol
    type Key: Ord + Clone + Send + Sync + std::fmt::Display + 'static;

    /// Role label used for thread names and diagnostics
    const NAME: &'static str;

    /// Decode one datagram into (device key, packet id, payload), or
    /// `None` to drop it.
    fn decode(&self, datagram: &[u8], src: SocketAddr) -> Option<(Self::Key, u32, Vec<u8>)>;

    /// Frame a payload for transmission to `key`.
    fn encode(&self, key: &Self::Key, id: u32, payload: &[u8]) -> Vec<u8>;

    /// Destination address for datagrams to `key`.
    fn dest(&self, key: &Self::Key) -> SocketAddr;
}

/// Dispatch engine for one protocol socket.
pub struct Dispatch<W: Wire> {
    wire: Arc<W>,
    socket: UdpSocket,
    inboxes: Arc<Mutex<BTreeMap<W::Key, Inbox>>>,
    out_tx: Sender<Outbound<W::Key>>,
    out_rx: Receiver<Outbound<W::Key>>,
    listening: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<W: Wire> Dispatch<W> {
    /// Bind the protocol socket: broadcast-capable, enlarged receive
    /// buffer, steady-state read timeout.
    pub fn bind(wire: W, addr: SocketAddr) -> Result<Self> {
        let raw = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        raw.set_broadcast(true)?;
        if let Err(e) = raw.set_recv_buffer_size(RECV_BUFFER_BYTES) {
            // The socket still works with the default buffer; bursty
            // acquisition just becomes more likely to drop records.
            warn!("could not enlarge {} receive buffer: {e}", W::NAME);
        }
        raw.bind(&addr.into())?;
        let socket: UdpSocket = raw.into();
        socket.set_read_timeout(Some(LOOP_TIMEOUT))?;

        let (out_tx, out_rx) = unbounded();
        Ok(Self {
            wire: Arc::new(wire),
            socket,
            inboxes: Arc::new(Mutex::new(BTreeMap::new())),
            out_tx,
            out_rx,
            listening: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn wire(&self) -> &W {
        &self.wire
    }

    /// Direct socket access for the discovery path, which exchanges
    /// broadcast probes before the background threads are started.
    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Start the receiver and sender threads. Idempotent: a second call
    /// while running does nothing.
    pub fn listen(&self) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let rx_socket = self.socket.try_clone()?;
        let tx_socket = self.socket.try_clone()?;
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| Error::validation("dispatch thread registry poisoned"))?;

        let wire = Arc::clone(&self.wire);
        let inboxes = Arc::clone(&self.inboxes);
        let flag = Arc::clone(&self.listening);
        threads.push(
            Builder::new()
                .name(format!("vpdt-{}-rx", W::NAME))
                .spawn(move || receiver_loop(wire, rx_socket, inboxes, flag))?,
        );

        let wire = Arc::clone(&self.wire);
        let out_rx = self.out_rx.clone();
        let flag = Arc::clone(&self.listening);
        threads.push(
            Builder::new()
                .name(format!("vpdt-{}-tx", W::NAME))
                .spawn(move || sender_loop(wire, tx_socket, out_rx, flag))?,
        );

        Ok(())
    }

    /// Stop the background threads and wait for them to exit.
    /// Idempotent: a second call while stopped does nothing.
    pub fn close(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Ensure an inbox exists for `key`, making it a known device whose
    /// traffic the receiver delivers instead of dropping.
    pub fn register(&self, key: W::Key) {
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.entry(key).or_insert_with(Inbox::new);
        }
    }

    /// Clone the inbox receiver for `key`, if it is a known device.
    pub fn inbox(&self, key: &W::Key) -> Option<Receiver<Entry>> {
        let inboxes = self.inboxes.lock().ok()?;
        inboxes.get(key).map(|inbox| inbox.rx.clone())
    }

    /// Queue one framed datagram for transmission.
    pub fn send(&self, key: W::Key, id: u32, payload: Vec<u8>) {
        // The queue outlives the background threads, so this cannot fail.
        let _ = self.out_tx.send(Outbound { key, id, payload });
    }

    /// Send a request and await a matching reply.
    ///
    /// Queues the datagram, drops stale entries from the device inbox,
    /// then polls the inbox until `predicate` accepts an entry or the
    /// window elapses. There is no internal retry.
    ///
    /// Concurrent calls against the same device race on the inbox drain
    /// and must be serialized by the caller.
    pub fn transact(
        &self,
        key: &W::Key,
        id: u32,
        payload: Vec<u8>,
        predicate: impl Fn(&Entry) -> bool,
        timeout: Duration,
    ) -> Result<Entry> {
        self.register(key.clone());
        let rx = self
            .inbox(key)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))?;

        self.send(key.clone(), id, payload);

        // Drop all stale entries, then await fresh ones.
        while rx.try_recv().is_ok() {}

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            match rx.recv_timeout(deadline - now) {
                Ok(entry) if predicate(&entry) => return Ok(entry),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Timeout(timeout)),
            }
        }
    }
}

impl<W: Wire> Drop for Dispatch<W> {
    fn drop(&mut self) {
        self.close();
    }
}

fn receiver_loop<W: Wire>(
    wire: Arc<W>,
    socket: UdpSocket,
    inboxes: Arc<Mutex<BTreeMap<W::Key, Inbox>>>,
    listening: Arc<AtomicBool>,
) {
    let mut buf = vec![0_u8; RX_BUFFER_LEN];
    while listening.load(Ordering::SeqCst) {
        let (size, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("{} receive failed: {e}", W::NAME);
                continue;
            }
        };

        let Some((key, id, payload)) = wire.decode(&buf[..size], src) else {
            continue;
        };

        let Ok(map) = inboxes.lock() else {
            break;
        };
        match map.get(&key) {
            Some(inbox) => {
                let _ = inbox.tx.send(Entry { id, payload });
            }
            // Spoofed or foreign traffic; discovery has not bound this
            // sender, so there is nowhere to deliver it.
            None => debug!("{} datagram from unknown device {key}", W::NAME),
        }
    }
}

fn sender_loop<W: Wire>(
    wire: Arc<W>,
    socket: UdpSocket,
    out_rx: Receiver<Outbound<W::Key>>,
    listening: Arc<AtomicBool>,
) {
    while listening.load(Ordering::SeqCst) {
        match out_rx.recv_timeout(LOOP_TIMEOUT) {
            Ok(out) => {
                let frame = wire.encode(&out.key, out.id, &out.payload);
                let dest = wire.dest(&out.key);
                if let Err(e) = socket.send_to(&frame, dest) {
                    warn!("{} send to {dest} failed: {e}", W::NAME);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
