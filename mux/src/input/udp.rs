//! UDP input: a background receiver thread feeds a bounded frame queue.
//! Each datagram must carry exactly one frame; anything else is dropped
//! and counted. The frame loop side never blocks longer than the queue
//! timeout.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use failure::{bail, Error};
use log::{debug, error, warn};

use super::InputSource;

/// Frames buffered between the receiver thread and the frame loop.
pub const DEFAULT_QUEUE_FRAMES: usize = 10;
/// How long the frame loop waits on an empty queue.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Receiver socket timeout; bounds the shutdown latency.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    size_errors: AtomicU64,
}

pub struct UdpInput {
    host: String,
    port: u16,
    bitrate: u16,
    /// Expected datagram size; pre-encoded DAB+ streams are framed as
    /// bitrate * 3 bytes per 24 ms.
    frame_size: usize,
    queue_frames: usize,
    rx: Option<Receiver<Vec<u8>>>,
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    underruns: u64,
}

impl UdpInput {
    pub fn new(host: &str, port: u16, bitrate: u16) -> Self {
        UdpInput {
            host: host.to_owned(),
            port,
            bitrate,
            frame_size: usize::from(bitrate) * 3,
            queue_frames: DEFAULT_QUEUE_FRAMES,
            rx: None,
            thread: None,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            underruns: 0,
        }
    }
}

impl InputSource for UdpInput {
    fn open(&mut self) -> Result<(), Error> {
        let socket = match UdpSocket::bind((self.host.as_str(), self.port)) {
            Ok(s) => s,
            Err(e) => bail!("bind udp://{}:{}: {}", self.host, self.port, e),
        };
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let (tx, rx) = bounded(self.queue_frames);
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let frame_size = self.frame_size;
        let port = self.port;
        running.store(true, Ordering::SeqCst);
        let thread = std::thread::Builder::new()
            .name(format!("udp-input-{}", port))
            .spawn(move || {
                let mut packet = vec![0u8; frame_size + 100];
                while running.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut packet) {
                        Ok((len, addr)) => {
                            if len != frame_size {
                                warn!(
                                    "udp input :{}: {} byte packet from {} (expected {})",
                                    port, len, addr, frame_size
                                );
                                counters.size_errors.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            match tx.try_send(packet[..len].to_vec()) {
                                Ok(()) => {
                                    counters.received.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(_) => {
                                    warn!("udp input :{}: queue full, dropping frame", port);
                                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            if running.load(Ordering::SeqCst) {
                                error!("udp input :{} receive error: {}", port, e);
                            }
                        }
                    }
                }
                debug!("udp input :{} receiver stopped", port);
            })?;

        debug!(
            "udp input {}:{} open, frame size {}",
            self.host, self.port, self.frame_size
        );
        self.rx = Some(rx);
        self.thread = Some(thread);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn read_frame(&mut self, size: usize) -> Vec<u8> {
        let rx = match &self.rx {
            Some(rx) => rx,
            None => {
                self.underruns += 1;
                return vec![0; size];
            }
        };
        match rx.recv_timeout(READ_TIMEOUT) {
            Ok(mut frame) => {
                frame.resize(size, 0);
                frame
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.underruns += 1;
                vec![0; size]
            }
        }
    }

    fn bitrate(&self) -> u16 {
        self.bitrate
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.rx = None;
        debug!(
            "udp input {}:{} closed ({} received, {} dropped)",
            self.host,
            self.port,
            self.counters.received.load(Ordering::Relaxed),
            self.counters.dropped.load(Ordering::Relaxed)
        );
    }

    fn underruns(&self) -> u64 {
        self.underruns
    }

    fn buffered(&self) -> usize {
        self.rx.as_ref().map(|rx| rx.len()).unwrap_or(0)
    }
}

impl Drop for UdpInput {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_exact_size_packets_and_counts_mismatches() {
        let mut input = UdpInput::new("127.0.0.1", 0, 48);
        // Bind to an ephemeral port by asking the OS directly.
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        input.port = port;
        input.open().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = ("127.0.0.1", port);
        // One good frame (144 bytes for 48 kbps), one runt.
        sender.send_to(&[0xA5u8; 144], dest).unwrap();
        sender.send_to(&[0x01u8; 10], dest).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let frame = input.read_frame(144);
        assert_eq!(frame, vec![0xA5; 144]);
        // The runt was discarded, so the next read underruns.
        let frame = input.read_frame(144);
        assert_eq!(frame, vec![0; 144]);
        assert_eq!(input.underruns(), 1);
        assert_eq!(input.counters.size_errors.load(Ordering::Relaxed), 1);
        input.close();
    }

    #[test]
    fn close_joins_receiver() {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let mut input = UdpInput::new("127.0.0.1", port, 48);
        input.open().unwrap();
        assert!(input.is_open());
        input.close();
        assert!(!input.is_open());
    }
}
