//! Listener + dialer + per-peer reader/writer over a framed, obfuscated
//! byte stream (spec §4.5, C5).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{FramingError, TransportError};
use crate::obfuscation::{self, EnvelopeType};

const ACCEPT_POLL: Duration = Duration::from_secs(1);
const READ_POLL: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 4096;
const FRAME_LEN_PREFIX: usize = 4;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { peer_id: String },
    Disconnected { peer_id: String },
    Message { peer_id: String, data: Vec<u8> },
}

struct PeerHandle {
    stream: TcpStream,
}

/// Owns the listener socket and every per-peer connection socket.
pub struct Transport {
    listener: Mutex<Option<TcpListener>>,
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
    running: Arc<Mutex<bool>>,
    events_tx: Sender<TransportEvent>,
    events_rx: Receiver<TransportEvent>,
    bound_port: Mutex<u16>,
}

impl Transport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Transport {
            listener: Mutex::new(None),
            peers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(Mutex::new(false)),
            events_tx,
            events_rx,
            bound_port: Mutex::new(0),
        }
    }

    pub fn events(&self) -> Receiver<TransportEvent> {
        self.events_rx.clone()
    }

    /// Bind `(host, port)` — `port = 0` asks the OS to assign one — and
    /// start accepting connections concurrently.
    pub fn start(&self, host: &str, port: u16) -> Result<u16, TransportError> {
        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(false)?;
        let bound_port = listener.local_addr()?.port();
        *self.bound_port.lock().unwrap() = bound_port;

        *self.running.lock().unwrap() = true;

        let accept_listener = listener.try_clone()?;
        *self.listener.lock().unwrap() = Some(listener);

        let running = self.running.clone();
        let peers = self.peers.clone();
        let events_tx = self.events_tx.clone();

        thread::spawn(move || {
            accept_loop(accept_listener, running, peers, events_tx);
        });

        Ok(bound_port)
    }

    pub fn bound_port(&self) -> u16 {
        *self.bound_port.lock().unwrap()
    }

    /// Outbound dial with a timeout; the resulting connection is tagged
    /// with the same `host:port` peer-id scheme as inbound connections.
    pub fn dial(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(TransportError::DialTimeout {
                host: host.to_string(),
                port,
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|_| TransportError::DialTimeout {
                host: host.to_string(),
                port,
            })?;

        let peer_id = format!("{host}:{port}");
        self.adopt(peer_id.clone(), stream)?;
        Ok(peer_id)
    }

    /// Adopt an already-connected socket (used by hole-punch paths) under
    /// `peer_id`.
    pub fn adopt(&self, peer_id: String, stream: TcpStream) -> Result<(), TransportError> {
        stream.set_read_timeout(Some(READ_POLL))?;
        let handler_stream = stream.try_clone()?;

        self.peers
            .write()
            .unwrap()
            .insert(peer_id.clone(), PeerHandle { stream });

        let _ = self.events_tx.send(TransportEvent::Connected {
            peer_id: peer_id.clone(),
        });

        let running = self.running.clone();
        let peers = self.peers.clone();
        let events_tx = self.events_tx.clone();

        thread::spawn(move || {
            reader_loop(peer_id, handler_stream, running, peers, events_tx);
        });

        Ok(())
    }

    /// Wrap, jitter, frame and send `data` to a single connected peer.
    pub fn send(&self, peer_id: &str, data: &[u8]) -> Result<(), TransportError> {
        let mut stream = {
            let peers = self.peers.read().unwrap();
            let handle = peers
                .get(peer_id)
                .ok_or_else(|| TransportError::PeerNotConnected(peer_id.to_string()))?;
            handle.stream.try_clone()?
        };

        let envelope = obfuscation::wrap_envelope(data, EnvelopeType::Message);
        thread::sleep(obfuscation::jitter_delay());

        let mut frame = Vec::with_capacity(FRAME_LEN_PREFIX + envelope.len());
        frame.extend_from_slice(&(envelope.len() as u32).to_be_bytes());
        frame.extend_from_slice(&envelope);

        stream.write_all(&frame)?;
        Ok(())
    }

    /// Send to every currently-known peer; a single failure does not abort the rest.
    pub fn broadcast(&self, data: &[u8]) {
        let peer_ids: Vec<String> = self.peers.read().unwrap().keys().cloned().collect();
        for peer_id in peer_ids {
            if let Err(e) = self.send(&peer_id, data) {
                log::warn!("broadcast to {peer_id} failed: {e}");
            }
        }
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.peers.read().unwrap().keys().cloned().collect()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.read().unwrap().contains_key(peer_id)
    }

    /// Close the listener, then every peer socket.
    pub fn stop(&self) {
        *self.running.lock().unwrap() = false;
        if let Some(listener) = self.listener.lock().unwrap().take() {
            drop(listener);
        }
        let mut peers = self.peers.write().unwrap();
        for (_, handle) in peers.drain() {
            let _ = handle.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

fn accept_loop(
    listener: TcpListener,
    running: Arc<Mutex<bool>>,
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
    events_tx: Sender<TransportEvent>,
) {
    listener
        .set_nonblocking(false)
        .expect("listener supports blocking mode");

    loop {
        if !*running.lock().unwrap() {
            break;
        }

        match accept_with_timeout(&listener) {
            Ok(Some((stream, addr))) => {
                let peer_id = format!("{}:{}", addr.ip(), addr.port());
                if stream.set_read_timeout(Some(READ_POLL)).is_err() {
                    continue;
                }
                let handler_stream = match stream.try_clone() {
                    Ok(s) => s,
                    Err(_) => continue,
                };

                peers
                    .write()
                    .unwrap()
                    .insert(peer_id.clone(), PeerHandle { stream });

                let _ = events_tx.send(TransportEvent::Connected {
                    peer_id: peer_id.clone(),
                });

                let running2 = running.clone();
                let peers2 = peers.clone();
                let events_tx2 = events_tx.clone();
                thread::spawn(move || {
                    reader_loop(peer_id, handler_stream, running2, peers2, events_tx2);
                });
            }
            Ok(None) => continue,
            Err(e) => {
                if *running.lock().unwrap() {
                    log::warn!("accept error: {e}");
                }
            }
        }
    }
}

fn accept_with_timeout(
    listener: &TcpListener,
) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    // std::net has no accept timeout; emulate the 1s poll with a short-lived
    // nonblocking probe loop so the accept loop stays cancellable.
    listener.set_nonblocking(true)?;
    let deadline = std::time::Instant::now() + ACCEPT_POLL;
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                return Ok(Some((stream, addr)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if std::time::Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
}

fn reader_loop(
    peer_id: String,
    mut stream: TcpStream,
    running: Arc<Mutex<bool>>,
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
    events_tx: Sender<TransportEvent>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    'outer: while *running.lock().unwrap() {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);

                loop {
                    match try_extract_frame(&buffer) {
                        Ok(Some((envelope_len, consumed))) => {
                            let envelope = &buffer[FRAME_LEN_PREFIX..FRAME_LEN_PREFIX + envelope_len];
                            match obfuscation::unwrap_envelope(envelope) {
                                Ok((EnvelopeType::Message, payload)) => {
                                    let _ = events_tx.send(TransportEvent::Message {
                                        peer_id: peer_id.clone(),
                                        data: payload.to_vec(),
                                    });
                                }
                                Ok((EnvelopeType::Reserved(_), _)) => {}
                                Err(e) => {
                                    log::warn!("malformed envelope from {peer_id}: {e}");
                                    buffer.drain(..consumed);
                                    break 'outer;
                                }
                            }
                            buffer.drain(..consumed);
                        }
                        Ok(None) => break,
                        Err(_) => break 'outer,
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(_) => break,
        }
    }

    peers.write().unwrap().remove(&peer_id);
    let _ = events_tx.send(TransportEvent::Disconnected { peer_id });
}

/// Read the 4-byte outer length prefix and, if the full envelope has
/// arrived, return `(envelope_len, total_bytes_consumed)`.
fn try_extract_frame(buffer: &[u8]) -> Result<Option<(usize, usize)>, FramingError> {
    if buffer.len() < FRAME_LEN_PREFIX {
        return Ok(None);
    }
    let declared = u32::from_be_bytes(
        buffer[..FRAME_LEN_PREFIX]
            .try_into()
            .expect("4 bytes"),
    ) as usize;

    let total = FRAME_LEN_PREFIX + declared;
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some((declared, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn recv_event(rx: &Receiver<TransportEvent>) -> TransportEvent {
        rx.recv_timeout(StdDuration::from_secs(5))
            .expect("event within timeout")
    }

    #[test]
    fn dial_and_send_round_trips_a_message() {
        let server = Transport::new();
        let port = server.start("127.0.0.1", 0).unwrap();
        let server_events = server.events();

        let client = Transport::new();
        client.start("127.0.0.1", 0).unwrap();
        let client_events = client.events();

        let client_peer_id = client
            .dial("127.0.0.1", port, Duration::from_secs(2))
            .unwrap();

        assert!(matches!(
            recv_event(&server_events),
            TransportEvent::Connected { .. }
        ));
        assert!(matches!(
            recv_event(&client_events),
            TransportEvent::Connected { .. }
        ));

        client.send(&client_peer_id, b"hello world").unwrap();

        let msg = recv_event(&server_events);
        match msg {
            TransportEvent::Message { data, .. } => assert_eq!(data, b"hello world"),
            other => panic!("expected Message, got {other:?}"),
        }

        server.stop();
        client.stop();
    }

    #[test]
    fn send_to_unknown_peer_errors() {
        let t = Transport::new();
        t.start("127.0.0.1", 0).unwrap();
        let err = t.send("127.0.0.1:1", b"x").unwrap_err();
        assert!(matches!(err, TransportError::PeerNotConnected(_)));
    }

    #[test]
    fn frame_extraction_waits_for_full_envelope() {
        let partial = vec![0, 0, 0, 10, 1, 2, 3];
        assert!(try_extract_frame(&partial).unwrap().is_none());

        let mut full = vec![0, 0, 0, 3];
        full.extend_from_slice(&[9, 9, 9]);
        let (len, consumed) = try_extract_frame(&full).unwrap().unwrap();
        assert_eq!(len, 3);
        assert_eq!(consumed, 7);
    }
}
