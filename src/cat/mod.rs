//! CAT server: one loopback listener per slice, dialect detected per
//! connection.
//!
//! Three wire dialects share one server. The first bytes of a connection
//! pick the dialect; after that the connection runs a per-dialect command
//! loop against the same slice store. Peers are independent: a slow or
//! disconnecting peer never touches slice state.

pub mod hrd;
pub mod kenwood;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::slices::SliceStore;
use crate::types::{CatEvent, Mode};

/// Per-listener view of one slice: reads answer from the store, writes go
/// through the store optimistically and fan out to the coordinator.
#[derive(Clone)]
pub struct CatHandle {
    pub index: usize,
    pub rig_name: String,
    store: Arc<SliceStore>,
    events: mpsc::Sender<CatEvent>,
}

impl CatHandle {
    pub fn new(
        index: usize,
        rig_name: String,
        store: Arc<SliceStore>,
        events: mpsc::Sender<CatEvent>,
    ) -> Self {
        Self { index, rig_name, store, events }
    }

    pub fn frequency(&self) -> u64 {
        self.store.snapshot(self.index).map(|s| s.frequency_hz).unwrap_or(0)
    }

    pub fn mode(&self) -> Mode {
        self.store.snapshot(self.index).map(|s| s.mode).unwrap_or(Mode::Usb)
    }

    pub fn transmit(&self) -> bool {
        self.store.snapshot(self.index).map(|s| s.transmit).unwrap_or(false)
    }

    /// Returns false when the mutation could not be queued for the radio;
    /// the store is left untouched so reads stay honest.
    pub fn set_frequency(&self, hz: u64) -> bool {
        let ev = CatEvent::FrequencyChange { index: self.index, hz };
        if self.events.try_send(ev).is_err() {
            warn!(slice = self.index, hz, "backend queue full, frequency set dropped");
            return false;
        }
        let _ = self.store.set_frequency(self.index, hz);
        true
    }

    pub fn set_mode(&self, mode: Mode) -> bool {
        let ev = CatEvent::ModeChange { index: self.index, mode: mode.clone() };
        if self.events.try_send(ev).is_err() {
            warn!(slice = self.index, %mode, "backend queue full, mode set dropped");
            return false;
        }
        let _ = self.store.set_mode(self.index, mode);
        true
    }

    pub fn set_ptt(&self, on: bool) -> bool {
        let ev = CatEvent::PttChange { index: self.index, on };
        if self.events.try_send(ev).is_err() {
            warn!(slice = self.index, on, "backend queue full, ptt toggle dropped");
            return false;
        }
        // single-transmitter discipline lives in the store
        let _ = self.store.set_tx(self.index, on);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Kenwood,
    HrdText,
    HrdBinary,
}

/// Pick a dialect from the first buffered bytes of a connection, or `None`
/// while the evidence is still incomplete.
pub fn detect_dialect(buf: &[u8]) -> Option<Dialect> {
    if buf.is_empty() {
        return None;
    }
    if buf.len() >= 8 {
        let magic = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if hrd::is_hrd_magic(magic) {
            return Some(Dialect::HrdBinary);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if buf[0] < 0x80 && (1..=65535).contains(&len) {
            // plausible little-endian frame length; provisional binary
            return Some(Dialect::HrdBinary);
        }
    }
    // text dialects are told apart by their terminators, so wait for one
    if buf.contains(&b';') || buf.contains(&b'\r') {
        return Some(text_dialect(buf));
    }
    None
}

fn text_dialect(buf: &[u8]) -> Dialect {
    let first = buf.iter().copied().find(|b| !b.is_ascii_whitespace());
    match first {
        Some(b) if b.is_ascii_uppercase() && buf.contains(&b';') => Dialect::Kenwood,
        _ => Dialect::HrdText,
    }
}

/// A running per-slice CAT listener.
pub struct CatListener {
    pub index: usize,
    pub port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CatListener {
    /// Bind `127.0.0.1:port` and serve connections until stopped. Port 0
    /// lets the OS pick; `self.port` always carries the bound port.
    pub async fn spawn(
        index: usize,
        port: u16,
        rig_name: String,
        store: Arc<SliceStore>,
        events: mpsc::Sender<CatEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = CatHandle::new(index, rig_name, store, events);
        info!(slice = index, port, "CAT listener up");
        let task = tokio::spawn(accept_loop(listener, handle, shutdown_rx));
        Ok(Self { index, port, shutdown, task })
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        info!(slice = self.index, port = self.port, "CAT listener stopped");
    }
}

async fn accept_loop(listener: TcpListener, handle: CatHandle, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(slice = handle.index, %peer, "CAT peer connected");
                    tokio::spawn(serve_connection(stream, handle.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!(slice = handle.index, error = %e, "CAT accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Detect the dialect, then run the matching command loop until the peer
/// hangs up or shutdown is signalled.
async fn serve_connection(mut stream: TcpStream, cat: CatHandle, mut shutdown: watch::Receiver<bool>) {
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];

    let dialect = loop {
        if let Some(d) = detect_dialect(&buf) {
            break d;
        }
        tokio::select! {
            read = stream.read(&mut chunk) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            },
            _ = shutdown.changed() => return,
        }
    };
    debug!(slice = cat.index, ?dialect, "CAT dialect selected");

    let result = match dialect {
        Dialect::Kenwood => command_loop(&mut stream, &cat, &mut shutdown, buf, kenwood_step).await,
        Dialect::HrdText => command_loop(&mut stream, &cat, &mut shutdown, buf, hrd_text_step).await,
        Dialect::HrdBinary => command_loop(&mut stream, &cat, &mut shutdown, buf, hrd_binary_step).await,
    };
    if let Err(e) = result {
        debug!(slice = cat.index, error = %e, "CAT connection closed with error");
    }
}

/// One dialect step: drain any complete requests from the front of `buf`
/// and append the bytes to write back.
type DialectStep = fn(&mut Vec<u8>, &CatHandle, &mut Vec<u8>);

async fn command_loop(
    stream: &mut TcpStream,
    cat: &CatHandle,
    shutdown: &mut watch::Receiver<bool>,
    mut buf: Vec<u8>,
    step: DialectStep,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 1024];
    let mut out: Vec<u8> = Vec::new();
    loop {
        step(&mut buf, cat, &mut out);
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
        tokio::select! {
            read = stream.read(&mut chunk) => match read {
                Ok(0) => return Ok(()),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e),
            },
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

fn kenwood_step(buf: &mut Vec<u8>, cat: &CatHandle, out: &mut Vec<u8>) {
    while let Some(pos) = buf.iter().position(|&b| b == b';') {
        let raw: Vec<u8> = buf.drain(..=pos).collect();
        let cmd = String::from_utf8_lossy(&raw[..raw.len() - 1]).to_string();
        if let Some(resp) = kenwood::handle_command(&cmd, cat) {
            out.extend_from_slice(resp.as_bytes());
        }
    }
}

fn hrd_text_step(buf: &mut Vec<u8>, cat: &CatHandle, out: &mut Vec<u8>) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\r' || b == b'\n') {
        let raw: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).to_string();
        if line.trim().is_empty() {
            continue;
        }
        let resp = hrd::handle_request(&line, cat);
        out.extend_from_slice(resp.as_bytes());
        out.push(b'\r');
    }
}

fn hrd_binary_step(buf: &mut Vec<u8>, cat: &CatHandle, out: &mut Vec<u8>) {
    while let Some((decoded, used)) = hrd::decode_frame(buf) {
        buf.drain(..used);
        let resp = match decoded {
            Ok(cmd) => hrd::handle_request(&cmd, cat),
            Err(()) => "ERROR".to_string(),
        };
        out.extend_from_slice(&hrd::encode_frame(&resp));
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_handle;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn detects_binary_by_magic() {
        // len 0x20, then a swapped magic on bytes 4..8
        let head = [0x20, 0x00, 0x00, 0x00, 0xCD, 0xAB, 0x34, 0x12];
        assert_eq!(detect_dialect(&head), Some(Dialect::HrdBinary));
        let alt = [0x20, 0x00, 0x00, 0x00, 0x34, 0x12, 0xCD, 0xAB];
        assert_eq!(detect_dialect(&alt), Some(Dialect::HrdBinary));
    }

    #[test]
    fn detects_binary_by_plausible_length() {
        let head = [0x1E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(detect_dialect(&head), Some(Dialect::HrdBinary));
    }

    #[test]
    fn detects_kenwood_ascii() {
        assert_eq!(detect_dialect(b"FA;"), Some(Dialect::Kenwood));
        assert_eq!(detect_dialect(b"FA00014074000;"), Some(Dialect::Kenwood));
        assert_eq!(detect_dialect(b"ID;AI0;"), Some(Dialect::Kenwood));
    }

    #[test]
    fn detects_hrd_text() {
        assert_eq!(detect_dialect(b"get id\r"), Some(Dialect::HrdText));
        assert_eq!(detect_dialect(b"get frequency\r"), Some(Dialect::HrdText));
        assert_eq!(detect_dialect(b"[1] get mode\r"), Some(Dialect::HrdText));
    }

    #[test]
    fn withholds_judgement_until_terminator_or_magic() {
        assert_eq!(detect_dialect(b""), None);
        assert_eq!(detect_dialect(b"FA"), None);
        assert_eq!(detect_dialect(b"get"), None);
        assert_eq!(detect_dialect(b"get freq"), None);
    }

    #[test]
    fn kenwood_step_drains_multiple_commands() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        let mut buf = b"FA;ID;FA000".to_vec();
        let mut out = Vec::new();
        kenwood_step(&mut buf, &cat, &mut out);
        assert_eq!(out, b"FA00014074000;ID019;".to_vec());
        // incomplete trailing command stays buffered
        assert_eq!(buf, b"FA000".to_vec());
    }

    #[test]
    fn hrd_binary_step_replies_in_kind() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        let mut buf = hrd::encode_frame("get frequency");
        let mut out = Vec::new();
        hrd_binary_step(&mut buf, &cat, &mut out);
        assert!(buf.is_empty());
        let (resp, _) = hrd::decode_frame(&out).unwrap();
        assert_eq!(resp.unwrap(), "14074000");
    }

    async fn spawn_test_listener(cat: CatHandle) -> (u16, watch::Sender<bool>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, cat, shutdown_rx));
        (port, tx)
    }

    #[tokio::test]
    async fn listener_reports_os_assigned_port() {
        let store = SliceStore::new();
        let (events, _rx) = mpsc::channel(4);
        let listener = CatListener::spawn(0, 0, "Slice-A".into(), store, events)
            .await
            .unwrap();
        assert_ne!(listener.port, 0);
        // the reported port is the one actually accepting connections
        TcpStream::connect(("127.0.0.1", listener.port)).await.unwrap();
        listener.stop().await;
    }

    #[tokio::test]
    async fn listener_end_to_end_kenwood() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        let (port, _tx) = spawn_test_listener(cat).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        peer.write_all(b"FA;").await.unwrap();
        let mut resp = [0u8; 14];
        peer.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"FA00014074000;");
    }

    #[tokio::test]
    async fn listener_end_to_end_hrd_binary_split_delivery() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        let (port, _tx) = spawn_test_listener(cat).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let frame = hrd::encode_frame("get frequency");
        // dribble the frame so detection and framing both see partial data
        peer.write_all(&frame[..6]).await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        peer.write_all(&frame[6..]).await.unwrap();

        let mut resp = vec![0u8; 256];
        let mut filled = 0;
        let total = loop {
            let n = peer.read(&mut resp[filled..]).await.unwrap();
            assert!(n > 0, "peer closed early");
            filled += n;
            if filled >= 4 {
                let total =
                    u32::from_le_bytes(resp[0..4].try_into().unwrap()) as usize;
                if filled >= total {
                    break total;
                }
            }
        };
        let (decoded, used) = hrd::decode_frame(&resp[..total]).unwrap();
        assert_eq!(used, total);
        // response framed like the request, payload is the decimal frequency
        assert_eq!(decoded.unwrap(), "14074000");
    }

    #[tokio::test]
    async fn dialect_is_fixed_for_the_connection_lifetime() {
        let (cat, _rx) = test_handle(0, 14_074_000, Mode::Usb);
        let (port, _tx) = spawn_test_listener(cat).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        peer.write_all(b"FA;").await.unwrap();
        let mut resp = [0u8; 14];
        peer.read_exact(&mut resp).await.unwrap();
        // an HRD-looking request on a kenwood connection is just a bad command
        peer.write_all(b"get frequency;ID;").await.unwrap();
        let mut resp = [0u8; 6];
        peer.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"ID019;");
    }
}
