//! Telemetry listener: one UDP socket shared by every decoder-app
//! instance.
//!
//! Inbound datagrams are demultiplexed by the instance id embedded in each
//! frame and re-published as typed events. The same socket carries
//! outbound command frames back to whichever source address an instance
//! last sent from. A datagram that fails to parse is counted and dropped;
//! it never stalls the loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{LinkError, Result};
use crate::types::TelemetryEvent;
use crate::wsjtx::{self, Command};

const EVENT_CAPACITY: usize = 1024;

/// Shared telemetry endpoint: listener state plus the outbound sink.
#[derive(Clone)]
pub struct TelemetryHub {
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<String, SocketAddr>>,
    events: broadcast::Sender<TelemetryEvent>,
    parse_errors: Arc<AtomicU64>,
}

impl TelemetryHub {
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            socket: Arc::new(socket),
            peers: Arc::new(DashMap::new()),
            events,
            parse_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Local address, useful when bound to port 0 in tests.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Last address an instance sent from, if it has spoken yet.
    pub fn peer_addr(&self, instance_id: &str) -> Option<SocketAddr> {
        self.peers.get(instance_id).map(|e| *e.value())
    }

    /// Drop the peer mapping when an instance goes away.
    pub fn forget_peer(&self, instance_id: &str) {
        self.peers.remove(instance_id);
    }

    /// Send one command frame to an instance over the shared socket.
    pub async fn send_command(&self, instance_id: &str, cmd: &Command) -> Result<()> {
        let addr = self
            .peer_addr(instance_id)
            .ok_or_else(|| LinkError::UnknownInstance(instance_id.to_string()))?;
        let frame = cmd.encode(instance_id);
        self.socket.send_to(&frame, addr).await?;
        trace!(instance_id, %addr, bytes = frame.len(), "command frame sent");
        Ok(())
    }

    /// Run the receive loop until shutdown.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    received = hub.socket.recv_from(&mut buf) => match received {
                        Ok((n, src)) => hub.handle_datagram(&buf[..n], src),
                        Err(e) => {
                            warn!(error = %e, "telemetry recv failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        match wsjtx::decode_datagram(datagram) {
            Ok(Some(event)) => {
                let id = event.instance_id().to_string();
                if id.is_empty() {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.peers.insert(id, src);
                // receivers may lag; the listener never waits on them
                let _ = self.events.send(event);
            }
            Ok(None) => trace!(%src, "ignored telemetry frame type"),
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%src, error = %LinkError::from(e), "telemetry datagram dropped");
            }
        }
    }
}
