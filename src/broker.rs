//! Device-ID-based connection establishment: local-first, public fallback,
//! hole-punch, inbound-wait (spec §4.8, C8).

use std::net::{TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::registry::Addr;
use crate::rendezvous_client::RendezvousClient;
use crate::stun;
use crate::transport::Transport;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HOLE_PUNCH_TIMEOUT: Duration = Duration::from_secs(5);
const INBOUND_WAIT_SECS: u64 = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub device_id: String,
    pub local: Option<Addr>,
    pub public: Option<Addr>,
}

/// Drives discovery and NAT traversal for a single device identity.
pub struct ConnectionBroker {
    transport: Arc<Transport>,
    device_id: String,
    rendezvous: Arc<RendezvousClient>,
    local_addr: Mutex<Option<Addr>>,
    public_addr: Mutex<Option<Addr>>,
    polling: Arc<Mutex<bool>>,
}

impl ConnectionBroker {
    pub fn new(transport: Arc<Transport>, device_id: String, rendezvous_url: &str) -> Self {
        ConnectionBroker {
            transport,
            device_id,
            rendezvous: Arc::new(RendezvousClient::new(rendezvous_url)),
            local_addr: Mutex::new(None),
            public_addr: Mutex::new(None),
            polling: Arc::new(Mutex::new(false)),
        }
    }

    /// Probe the local address, discover the public address via STUN
    /// (falling back to local on failure), register with the rendezvous,
    /// and if registration succeeds start the incoming-request poller.
    pub fn initialize(&self) -> bool {
        let port = self.transport.bound_port();
        let local_ip = local_ip_guess();
        let local = Addr {
            ip: local_ip.clone(),
            port,
        };
        *self.local_addr.lock().unwrap() = Some(local.clone());

        let public = match stun::discover_public_address(port) {
            Some((ip, port)) => Addr { ip, port },
            None => {
                log::warn!("STUN discovery failed, falling back to local address");
                local.clone()
            }
        };
        *self.public_addr.lock().unwrap() = Some(public.clone());

        let registered = self
            .rendezvous
            .register_device(&self.device_id, &public, Some(&local));

        if registered {
            self.start_polling();
        }
        registered
    }

    fn start_polling(&self) {
        if *self.polling.lock().unwrap() {
            return;
        }
        *self.polling.lock().unwrap() = true;

        let polling = self.polling.clone();
        let rendezvous = self.rendezvous.clone();
        let transport = self.transport.clone();
        let device_id = self.device_id.clone();

        thread::spawn(move || {
            while *polling.lock().unwrap() {
                for req in rendezvous.get_connect_requests(&device_id) {
                    let requester_id = req
                        .get("requester_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if requester_id.is_empty() {
                        continue;
                    }

                    if let Some(peer_id) = connect_via_requester_info(&transport, &req) {
                        rendezvous.clear_connect_request(&device_id, &requester_id);
                        log::info!("connected to {requester_id} via incoming request -> {peer_id}");
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
        });
    }

    /// Establish a live connection to `target_id`, stopping at the first
    /// successful step. Returns the resulting transport `peer_id`.
    pub fn connect(&self, target_id: &str) -> Option<String> {
        let target_info = self
            .rendezvous
            .send_connect_request(&self.device_id, target_id)?;

        let peer_id = connect_via_device_info(&self.transport, &target_info)
            .or_else(|| self.wait_for_inbound(target_id));

        if peer_id.is_some() {
            self.rendezvous
                .clear_connect_request(target_id, &self.device_id);
        }
        peer_id
    }

    fn wait_for_inbound(&self, _target_id: &str) -> Option<String> {
        let initial: std::collections::HashSet<String> =
            self.transport.connected_peers().into_iter().collect();

        for _ in 0..INBOUND_WAIT_SECS {
            thread::sleep(Duration::from_secs(1));
            let current: std::collections::HashSet<String> =
                self.transport.connected_peers().into_iter().collect();
            if let Some(new_peer) = current.difference(&initial).next() {
                return Some(new_peer.clone());
            }
        }
        None
    }

    pub fn shutdown(&self) {
        *self.polling.lock().unwrap() = false;
        self.rendezvous.unregister_device(&self.device_id);
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            device_id: self.device_id.clone(),
            local: self.local_addr.lock().unwrap().clone(),
            public: self.public_addr.lock().unwrap().clone(),
        }
    }
}

fn connect_via_device_info(transport: &Transport, device_info: &Value) -> Option<String> {
    connect_via_addr_pair(
        transport,
        device_info.get("local_addr"),
        device_info.get("public_addr"),
    )
}

fn connect_via_requester_info(transport: &Transport, request: &Value) -> Option<String> {
    let info = request.get("requester_info")?;
    connect_via_addr_pair(transport, info.get("local_addr"), info.get("public_addr"))
}

fn connect_via_addr_pair(
    transport: &Transport,
    local_addr: Option<&Value>,
    public_addr: Option<&Value>,
) -> Option<String> {
    if let Some(addr) = local_addr.and_then(parse_addr) {
        if let Ok(peer_id) = transport.dial(&addr.ip, addr.port, DIAL_TIMEOUT) {
            return Some(peer_id);
        }
    }

    if let Some(addr) = public_addr.and_then(parse_addr) {
        if let Ok(peer_id) = transport.dial(&addr.ip, addr.port, DIAL_TIMEOUT) {
            return Some(peer_id);
        }

        if let Some(stream) = hole_punch(transport.bound_port(), &addr) {
            let peer_id = format!("{}:{}", addr.ip, addr.port);
            if transport.adopt(peer_id.clone(), stream).is_ok() {
                return Some(peer_id);
            }
        }
    }

    None
}

fn parse_addr(v: &Value) -> Option<Addr> {
    let ip = v.get("ip")?.as_str()?.to_string();
    let port = v.get("port")?.as_u64()? as u16;
    Some(Addr { ip, port })
}

/// Simultaneous-connect hole punch: bind `local_port` with address reuse
/// and attempt an outbound connect to `remote`.
fn hole_punch(local_port: u16, remote: &Addr) -> Option<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).ok()?;
    socket.set_reuse_address(true).ok()?;
    #[cfg(unix)]
    socket.set_reuse_port(true).ok()?;

    let local: SockAddr = std::net::SocketAddr::from(([0, 0, 0, 0], local_port)).into();
    socket.bind(&local).ok()?;

    let remote_addr: std::net::SocketAddr = format!("{}:{}", remote.ip, remote.port)
        .parse()
        .ok()?;
    let remote_sockaddr: SockAddr = remote_addr.into();

    socket
        .connect_timeout(&remote_sockaddr, HOLE_PUNCH_TIMEOUT)
        .ok()?;
    Some(socket.into())
}

/// Best-effort local IP guess via a connected UDP socket (no packet sent).
fn local_ip_guess() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
