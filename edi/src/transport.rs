//! Packet transports for EDI output: UDP (unicast or multicast), a
//! reconnecting TCP client and a fan-out TCP server. Sends never block
//! the frame loop: UDP is fire-and-forget, TCP writes go through bounded
//! per-peer queues with slow peers disconnected.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, TrySendError};
use failure::{bail, Error};
use log::{debug, info, warn};

/// A destination for encoded EDI packets.
pub trait Transport: Send {
    fn send_packet(&mut self, packet: &[u8]);
    /// Errors since creation (sends are lossy, never retried inline).
    fn error_count(&self) -> u64;
    fn flush(&mut self) {}
}

/// Reconnect backoff bounds for the TCP client.
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
/// Per-peer send queue depth for the TCP server; a peer that falls this
/// far behind is disconnected.
const SERVER_QUEUE_PACKETS: usize = 64;
/// Bounded TCP write deadline; beyond it the peer is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UdpTransport {
    socket: UdpSocket,
    dest: SocketAddr,
    errors: u64,
}

impl UdpTransport {
    /// `source` selects the local interface for multicast membership.
    pub fn new(host: &str, port: u16, source: Option<&str>) -> Result<Self, Error> {
        let dest = (host, port)
            .to_socket_addrs()
            .map_err(|e| failure::format_err!("resolve {}:{}: {}", host, port, e))?
            .next()
            .ok_or_else(|| failure::format_err!("no address for {}:{}", host, port))?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        if let SocketAddr::V4(v4) = dest {
            // 224/4 is multicast.
            if v4.ip().is_multicast() {
                if let Some(source) = source {
                    let iface: Ipv4Addr = source
                        .parse()
                        .map_err(|_| failure::format_err!("bad multicast source {:?}", source))?;
                    socket.join_multicast_v4(v4.ip(), &iface)?;
                    info!("EDI multicast group {} joined via {}", v4.ip(), iface);
                }
            }
        }
        Ok(UdpTransport { socket, dest, errors: 0 })
    }
}

impl Transport for UdpTransport {
    fn send_packet(&mut self, packet: &[u8]) {
        if let Err(e) = self.socket.send_to(packet, self.dest) {
            self.errors += 1;
            debug!("EDI UDP send to {} failed: {}", self.dest, e);
        }
    }

    fn error_count(&self) -> u64 {
        self.errors
    }
}

enum ClientState {
    Connected(TcpStream),
    Backoff { until: Instant, delay: Duration },
}

pub struct TcpClientTransport {
    dest: String,
    state: ClientState,
    errors: u64,
}

impl TcpClientTransport {
    pub fn new(host: &str, port: u16) -> Self {
        let dest = format!("{}:{}", host, port);
        let state = match Self::connect(&dest) {
            Ok(stream) => ClientState::Connected(stream),
            Err(e) => {
                warn!("EDI TCP {} unavailable, will retry: {}", dest, e);
                ClientState::Backoff {
                    until: Instant::now() + RECONNECT_INITIAL,
                    delay: RECONNECT_INITIAL,
                }
            }
        };
        TcpClientTransport { dest, state, errors: 0 }
    }

    fn connect(dest: &str) -> Result<TcpStream, Error> {
        let stream = TcpStream::connect(dest)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(stream)
    }
}

impl Transport for TcpClientTransport {
    fn send_packet(&mut self, packet: &[u8]) {
        if let ClientState::Backoff { until, delay } = &self.state {
            if Instant::now() < *until {
                return;
            }
            let delay = *delay;
            match Self::connect(&self.dest) {
                Ok(stream) => {
                    info!("EDI TCP {} connected", self.dest);
                    self.state = ClientState::Connected(stream);
                }
                Err(e) => {
                    let next = (delay * 2).min(RECONNECT_MAX);
                    debug!("EDI TCP {} reconnect failed: {}", self.dest, e);
                    self.state =
                        ClientState::Backoff { until: Instant::now() + next, delay: next };
                    return;
                }
            }
        }
        if let ClientState::Connected(stream) = &mut self.state {
            if let Err(e) = stream.write_all(packet) {
                warn!("EDI TCP {} write failed, reconnecting: {}", self.dest, e);
                self.errors += 1;
                self.state = ClientState::Backoff {
                    until: Instant::now() + RECONNECT_INITIAL,
                    delay: RECONNECT_INITIAL,
                };
            }
        }
    }

    fn error_count(&self) -> u64 {
        self.errors
    }

    fn flush(&mut self) {
        if let ClientState::Connected(stream) = &mut self.state {
            let _ = stream.flush();
        }
    }
}

struct ServerPeer {
    addr: SocketAddr,
    queue: Sender<Vec<u8>>,
}

pub struct TcpServerTransport {
    peers: Arc<Mutex<Vec<ServerPeer>>>,
    errors: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
    local_port: u16,
}

impl TcpServerTransport {
    pub fn bind(host: &str, port: u16) -> Result<Self, Error> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| failure::format_err!("EDI TCP bind {}:{}: {}", host, port, e))?;
        let local_port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        let peers: Arc<Mutex<Vec<ServerPeer>>> = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_peers = Arc::clone(&peers);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = std::thread::Builder::new()
            .name(format!("edi-tcp-accept-{}", local_port))
            .spawn(move || {
                while !accept_shutdown.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            info!("EDI TCP peer {} connected", addr);
                            if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
                                warn!("EDI TCP peer {}: {}", addr, e);
                                continue;
                            }
                            let (tx, rx) = bounded::<Vec<u8>>(SERVER_QUEUE_PACKETS);
                            accept_peers
                                .lock()
                                .expect("peer list lock")
                                .push(ServerPeer { addr, queue: tx });
                            let _ = std::thread::Builder::new()
                                .name(format!("edi-tcp-peer-{}", addr))
                                .spawn(move || {
                                    let mut stream = stream;
                                    // Drains until the queue closes (peer
                                    // dropped) or a write fails.
                                    while let Ok(packet) = rx.recv() {
                                        if let Err(e) = stream.write_all(&packet) {
                                            info!("EDI TCP peer {} dropped: {}", addr, e);
                                            break;
                                        }
                                    }
                                });
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            warn!("EDI TCP accept error: {}", e);
                            std::thread::sleep(Duration::from_millis(200));
                        }
                    }
                }
            })?;

        info!("EDI TCP server listening on port {}", local_port);
        Ok(TcpServerTransport {
            peers,
            errors,
            shutdown,
            accept_thread: Some(accept_thread),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer list lock").len()
    }
}

impl Transport for TcpServerTransport {
    fn send_packet(&mut self, packet: &[u8]) {
        let mut peers = self.peers.lock().expect("peer list lock");
        peers.retain(|peer| match peer.queue.try_send(packet.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Slow peer: dropping the sender closes its writer.
                warn!("EDI TCP peer {} too slow, disconnecting", peer.addr);
                self.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("EDI TCP peer {} gone", peer.addr);
                false
            }
        });
    }

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl Drop for TcpServerTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.peers.lock().expect("peer list lock").clear();
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
    }
}

/// Parses an EDI destination URL: `udp://host:port` or `tcp://host:port`.
pub fn parse_edi_url(url: &str) -> Result<(bool, String, u16), Error> {
    let (tcp, rest) = if let Some(rest) = url.strip_prefix("udp://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        (true, rest)
    } else {
        bail!("EDI destination {:?} must be udp:// or tcp://", url);
    };
    let mut parts = rest.rsplitn(2, ':');
    let port = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| failure::format_err!("EDI destination {:?} lacks a port", url))?;
    let host = match parts.next() {
        Some(h) if !h.is_empty() => h.to_owned(),
        _ => bail!("EDI destination {:?} lacks a host", url),
    };
    Ok((tcp, host, port))
}
