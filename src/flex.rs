//! Radio backend session (SDR control connection).
//!
//! Line-oriented TCP: we write sequence-numbered commands
//! (`C<seq>|<command>`), the radio pushes status lines
//! (`S<handle>|slice <index> key=value ...`) that merge into the slice
//! store. The session reconnects forever with jittered exponential
//! backoff; while it is down, mutations are rejected softly instead of
//! buffering without bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};
use crate::slices::SliceStore;
use crate::types::{Mode, SliceDelta, MAX_SLICES};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const COMMAND_QUEUE: usize = 64;

/// Commands the control plane sends to the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioCommand {
    Tune { index: usize, hz: u64 },
    SetMode { index: usize, mode: Mode },
    /// Global transmit toggle; slice selection happened in the store.
    Xmit(bool),
}

impl RadioCommand {
    pub fn render(&self) -> String {
        match self {
            RadioCommand::Tune { index, hz } => {
                format!("slice tune {index} {}", hz_to_mhz(*hz))
            }
            RadioCommand::SetMode { index, mode } => {
                format!("slice set {index} mode={}", mode.as_backend())
            }
            RadioCommand::Xmit(on) => format!("xmit {}", *on as u8),
        }
    }
}

/// Handle for queueing commands into the live session.
#[derive(Clone)]
pub struct RadioClient {
    cmd_tx: mpsc::Sender<RadioCommand>,
    connected: Arc<AtomicBool>,
}

impl RadioClient {
    /// Spawn the session task. `host` is the fallback when discovery stays
    /// silent; a zero `discovery_timeout` skips listening entirely.
    pub fn spawn(
        host: String,
        port: u16,
        discovery_timeout: Duration,
        store: Arc<SliceStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let connected = Arc::new(AtomicBool::new(false));
        let client = Self { cmd_tx, connected: connected.clone() };
        tokio::spawn(session_loop(
            host,
            port,
            discovery_timeout,
            store,
            cmd_rx,
            connected,
            shutdown,
        ));
        client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Soft-fail enqueue: disconnected or saturated queues reject the
    /// command instead of blocking the caller.
    pub fn send(&self, cmd: RadioCommand) -> Result<()> {
        if !self.is_connected() {
            warn!(cmd = %cmd.render(), "radio backend down, command dropped");
            return Err(LinkError::BackendDisconnected);
        }
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(cmd) => {
                warn!(cmd = %cmd.render(), "radio command queue full");
                LinkError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => LinkError::BackendDisconnected,
        })
    }
}

async fn session_loop(
    host: String,
    port: u16,
    discovery_timeout: Duration,
    store: Arc<SliceStore>,
    mut cmd_rx: mpsc::Receiver<RadioCommand>,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let discovered = if discovery_timeout.is_zero() {
            None
        } else {
            discover(port, discovery_timeout).await
        };
        let (target, target_port) = match discovered {
            Some(info) => {
                info!(model = %info.model, serial = %info.serial, nickname = %info.nickname,
                    callsign = %info.callsign, ip = %info.ip,
                    protocol = %info.protocol_version, "radio discovered by broadcast");
                let p = if info.port != 0 { info.port } else { port };
                (info.ip, p)
            }
            None => (host.clone(), port),
        };
        match TcpStream::connect((target.as_str(), target_port)).await {
            Ok(stream) => {
                info!(host = %target, port = target_port, "radio backend connected");
                connected.store(true, Ordering::Relaxed);
                attempt = 0;
                let why = run_session(stream, &store, &mut cmd_rx, &mut shutdown).await;
                connected.store(false, Ordering::Relaxed);
                match why {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(e) => warn!(error = %e, "radio backend session lost"),
                }
            }
            Err(e) => {
                debug!(host = %target, error = %e, "radio backend connect failed");
            }
        }
        attempt = attempt.saturating_add(1);
        let delay = backoff_delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Full-jitter exponential backoff: uniform over (0, min(cap, base * 2^n)].
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.min(16));
    let cap = exp.min(BACKOFF_CAP.as_millis() as u64);
    Duration::from_millis(rand::thread_rng().gen_range(1..=cap.max(1)))
}

enum SessionEnd {
    Shutdown,
    Lost(std::io::Error),
}

async fn run_session(
    stream: TcpStream,
    store: &SliceStore,
    cmd_rx: &mut mpsc::Receiver<RadioCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut seq: u32 = 0;

    // subscribe to slice state, then ask for the current slice list
    for cmd in ["sub slice all", "slice list"] {
        seq += 1;
        if let Err(e) = write_half.write_all(format!("C{seq}|{cmd}\n").as_bytes()).await {
            return SessionEnd::Lost(e);
        }
    }

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_push_line(&line, store),
                Ok(None) => return SessionEnd::Lost(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof, "backend closed the session")),
                Err(e) => return SessionEnd::Lost(e),
            },
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return SessionEnd::Shutdown };
                seq += 1;
                let line = format!("C{seq}|{}\n", cmd.render());
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    return SessionEnd::Lost(e);
                }
            }
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        }
    }
}

/// `S<handle>|<message>` lines mutate the store; everything else (command
/// replies, version banners) is ignored.
fn handle_push_line(line: &str, store: &SliceStore) {
    let Some(rest) = line.strip_prefix('S') else { return };
    let Some((_handle, message)) = rest.split_once('|') else { return };
    if let Some((index, delta)) = parse_slice_status(message) {
        if delta.is_empty() {
            return;
        }
        if let Err(e) = store.apply_push(index, &delta) {
            warn!(index, error = %e, "slice push rejected");
        }
    }
}

/// Parse `slice <index> key=value ...`; unknown keys are ignored.
pub fn parse_slice_status(message: &str) -> Option<(usize, SliceDelta)> {
    let mut words = message.split_whitespace();
    if words.next() != Some("slice") {
        return None;
    }
    let index: usize = words.next()?.parse().ok()?;
    if index >= MAX_SLICES {
        return None;
    }
    let mut delta = SliceDelta::default();
    for pair in words {
        let Some((key, value)) = pair.split_once('=') else { continue };
        match key {
            "RF_frequency" => delta.frequency_hz = mhz_str_to_hz(value),
            "mode" => delta.mode = Some(Mode::from_backend(value)),
            "in_use" => delta.in_use = Some(value == "1"),
            "tx" => delta.transmit = Some(value == "1"),
            "dax" => delta.dax_channel = value.parse().ok(),
            // recognized but without a consumer in the slice table
            "rxant" => {}
            _ => {}
        }
    }
    Some((index, delta))
}

/// Decimal-string MHz to integer Hz without a float in the middle, so
/// `14.0740000` lands on exactly 14_074_000.
pub fn mhz_str_to_hz(s: &str) -> Option<u64> {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    let mhz: u64 = int_part.parse().ok()?;
    let mut frac = [b'0'; 7];
    for (i, b) in frac_part.bytes().take(7).enumerate() {
        if !b.is_ascii_digit() {
            return None;
        }
        frac[i] = b;
    }
    // seventh fractional digit rounds the sub-Hz remainder
    let sub_hz: u64 = std::str::from_utf8(&frac[..6]).ok()?.parse().ok()?;
    let round_up = frac[6] >= b'5';
    Some(mhz * 1_000_000 + sub_hz + round_up as u64)
}

/// Render Hz back to the six-fractional-digit MHz the backend expects.
pub fn hz_to_mhz(hz: u64) -> String {
    format!("{}.{:06}", hz / 1_000_000, hz % 1_000_000)
}

/// Identity payload broadcast by the radio on its control port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryInfo {
    pub protocol_version: String,
    pub model: String,
    pub serial: String,
    pub ip: String,
    pub port: u16,
    pub nickname: String,
    pub callsign: String,
}

/// Pull `key=value` tokens out of a discovery datagram. Non-text framing
/// around the payload is tolerated; `ip` is the one required key.
pub fn parse_discovery(payload: &[u8]) -> Option<DiscoveryInfo> {
    let text = String::from_utf8_lossy(payload);
    let mut info = DiscoveryInfo::default();
    let mut saw_ip = false;
    for token in text.split(|c: char| c.is_whitespace() || c == '\0') {
        let Some((key, value)) = token.split_once('=') else { continue };
        let key = key.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
        match key {
            "discovery_protocol_version" => info.protocol_version = value.into(),
            "model" => info.model = value.into(),
            "serial" => info.serial = value.into(),
            "ip" => {
                info.ip = value.into();
                saw_ip = true;
            }
            "port" => info.port = value.parse().unwrap_or(0),
            "nickname" => info.nickname = value.into(),
            "callsign" => info.callsign = value.into(),
            _ => {}
        }
    }
    saw_ip.then_some(info)
}

/// Wait for one discovery broadcast; `None` means fall back to the
/// configured host.
pub async fn discover(port: u16, timeout: Duration) -> Option<DiscoveryInfo> {
    let sock = match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(s) => s,
        Err(e) => {
            debug!(port, error = %e, "discovery bind failed");
            return None;
        }
    };
    let mut buf = vec![0u8; 2048];
    match tokio::time::timeout(timeout, sock.recv_from(&mut buf)).await {
        Ok(Ok((n, _src))) => parse_discovery(&buf[..n]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mhz_parsing_is_exact() {
        assert_eq!(mhz_str_to_hz("14.0740000"), Some(14_074_000));
        assert_eq!(mhz_str_to_hz("14.074"), Some(14_074_000));
        assert_eq!(mhz_str_to_hz("14"), Some(14_000_000));
        assert_eq!(mhz_str_to_hz("7.0747505"), Some(7_074_751));
        assert_eq!(mhz_str_to_hz("banana"), None);
        assert_eq!(mhz_str_to_hz("14.07x"), None);
    }

    #[test]
    fn mhz_rendering_uses_six_digits() {
        assert_eq!(hz_to_mhz(14_076_000), "14.076000");
        assert_eq!(hz_to_mhz(7_000_001), "7.000001");
        assert_eq!(
            RadioCommand::Tune { index: 0, hz: 14_076_000 }.render(),
            "slice tune 0 14.076000"
        );
        assert_eq!(
            RadioCommand::SetMode { index: 2, mode: Mode::Digu }.render(),
            "slice set 2 mode=DIGU"
        );
        assert_eq!(RadioCommand::Xmit(true).render(), "xmit 1");
    }

    #[test]
    fn slice_status_parsing() {
        let (index, delta) =
            parse_slice_status("slice 0 in_use=1 RF_frequency=14.074000 mode=USB rxant=ANT1")
                .unwrap();
        assert_eq!(index, 0);
        assert_eq!(delta.in_use, Some(true));
        assert_eq!(delta.frequency_hz, Some(14_074_000));
        assert_eq!(delta.mode, Some(Mode::Usb));
        // unknown keys ignored
        let (_, delta) = parse_slice_status("slice 1 wide=0 foo=bar in_use=0").unwrap();
        assert_eq!(delta.in_use, Some(false));
        assert_eq!(delta.frequency_hz, None);
        assert!(parse_slice_status("interlock state=READY").is_none());
        assert!(parse_slice_status("slice 99 in_use=1").is_none());
    }

    #[test]
    fn discovery_parsing() {
        let payload = b"\x00\x08discovery_protocol_version=3.0.0.1 model=FLEX-6600 \
serial=1418-6579-6600-1234 ip=192.168.1.42 port=4992 nickname=Shack callsign=W1ABC\x00";
        let info = parse_discovery(payload).unwrap();
        assert_eq!(info.ip, "192.168.1.42");
        assert_eq!(info.model, "FLEX-6600");
        assert_eq!(info.port, 4992);
        assert_eq!(info.callsign, "W1ABC");
        assert!(parse_discovery(b"model=FLEX-6600").is_none());
    }

    #[tokio::test]
    async fn session_merges_pushes_and_writes_commands() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = SliceStore::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = RadioClient::spawn(
            "127.0.0.1".into(),
            port,
            Duration::ZERO,
            store.clone(),
            shutdown_rx,
        );

        let (backend, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = backend.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // subscription handshake comes first, in sequence order
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "C1|sub slice all");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "C2|slice list");

        write_half
            .write_all(b"S12345678|slice 0 in_use=1 RF_frequency=14.074000 mode=USB\n")
            .await
            .unwrap();
        // push is applied asynchronously; poll the store briefly
        for _ in 0..50 {
            if store.snapshot(0).unwrap().in_use {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let slice = store.snapshot(0).unwrap();
        assert!(slice.in_use);
        assert_eq!(slice.frequency_hz, 14_074_000);

        client.send(RadioCommand::Tune { index: 0, hz: 14_076_000 }).unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "C3|slice tune 0 14.076000"
        );
    }

    #[tokio::test]
    async fn session_reconnects_after_backend_drop() {
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = SliceStore::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _client = RadioClient::spawn(
            "127.0.0.1".into(),
            port,
            Duration::ZERO,
            store,
            shutdown_rx,
        );

        // first session dies immediately
        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        // the client comes back on its own and re-subscribes from scratch
        let (second, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("no reconnect before timeout")
            .unwrap();
        let mut lines = BufReader::new(second).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "C1|sub slice all");
    }

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= BACKOFF_CAP);
            assert!(d > Duration::ZERO);
        }
    }
}
