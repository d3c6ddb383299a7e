//! Minimal STUN (RFC 5389) binding client. The connection broker treats
//! this as a black box with a single contract: return a reflexive public
//! address, or nothing (spec §1, §4.8: the STUN client is an out-of-scope
//! collaborator specified only by that interface).

use std::net::UdpSocket;
use std::time::Duration;

use rand::RngCore;

const STUN_SERVERS: &[(&str, u16)] = &[
    ("stun.l.google.com", 19302),
    ("stun1.l.google.com", 19302),
];

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const MAPPED_ADDRESS: u16 = 0x0001;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe the configured STUN servers in turn, returning the first
/// reflexive `(public_ip, public_port)` obtained, or `None` if every
/// server is unreachable or returns something unparsable.
pub fn discover_public_address(local_port: u16) -> Option<(String, u16)> {
    let socket = UdpSocket::bind(("0.0.0.0", local_port)).ok()?;
    socket.set_read_timeout(Some(RECV_TIMEOUT)).ok()?;

    for (host, port) in STUN_SERVERS {
        if let Some(addr) = probe_server(&socket, host, *port) {
            return Some(addr);
        }
    }
    None
}

fn probe_server(socket: &UdpSocket, host: &str, port: u16) -> Option<(String, u16)> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    let request = build_binding_request(&transaction_id);
    socket.send_to(&request, (host, port)).ok()?;

    let mut buf = [0u8; 512];
    let (len, _) = socket.recv_from(&mut buf).ok()?;
    parse_binding_response(&buf[..len], &transaction_id)
}

fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Option<(String, u16)> {
    if data.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes(data[0..2].try_into().ok()?);
    if msg_type != BINDING_RESPONSE {
        return None;
    }
    if &data[8..20] != transaction_id {
        return None;
    }

    let msg_length = u16::from_be_bytes(data[2..4].try_into().ok()?) as usize;
    let mut offset = 20usize;

    while offset + 4 <= 20 + msg_length && offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes(data[offset..offset + 2].try_into().ok()?);
        let attr_len = u16::from_be_bytes(data[offset + 2..offset + 4].try_into().ok()?) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }
        let attr = &data[offset..offset + attr_len];

        match attr_type {
            XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_xor_mapped_address(attr) {
                    return Some(addr);
                }
            }
            MAPPED_ADDRESS => {
                if let Some(addr) = parse_mapped_address(attr) {
                    return Some(addr);
                }
            }
            _ => {}
        }

        offset += attr_len;
        if attr_len % 4 != 0 {
            offset += 4 - (attr_len % 4);
        }
    }
    None
}

fn parse_xor_mapped_address(data: &[u8]) -> Option<(String, u16)> {
    if data.len() < 8 || data[1] != 0x01 {
        return None;
    }
    let xor_port = u16::from_be_bytes(data[2..4].try_into().ok()?);
    let port = xor_port ^ ((MAGIC_COOKIE >> 16) as u16);

    let xor_ip = u32::from_be_bytes(data[4..8].try_into().ok()?);
    let ip = xor_ip ^ MAGIC_COOKIE;
    let ip_str = std::net::Ipv4Addr::from(ip).to_string();

    Some((ip_str, port))
}

fn parse_mapped_address(data: &[u8]) -> Option<(String, u16)> {
    if data.len() < 8 || data[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes(data[2..4].try_into().ok()?);
    let ip = std::net::Ipv4Addr::new(data[4], data[5], data[6], data[7]);
    Some((ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_xor_mapped_address_recovers_loopback() {
        let transaction_id = [0u8; 12];
        let ip: u32 = 0x7F000001 ^ MAGIC_COOKIE;
        let port: u16 = 4242 ^ ((MAGIC_COOKIE >> 16) as u16);

        let mut attr = vec![0u8, 0x01];
        attr.extend_from_slice(&port.to_be_bytes());
        attr.extend_from_slice(&ip.to_be_bytes());

        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&((4 + attr.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&transaction_id);
        msg.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        msg.extend_from_slice(&attr);

        let (resolved_ip, resolved_port) =
            parse_binding_response(&msg, &transaction_id).unwrap();
        assert_eq!(resolved_ip, "127.0.0.1");
        assert_eq!(resolved_port, 4242);
    }

    #[test]
    fn unreachable_host_returns_none() {
        // Port 1 on loopback is not a STUN server; the probe must swallow
        // the failure rather than panic.
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        assert!(probe_server(&socket, "127.0.0.1", 1).is_none());
    }
}
