//! DNS probe: one A query for `example.com` sent to the target server.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::ProbeError;

const QUERY_NAME: &[&str] = &["example", "com"];

/// Query the DNS server at `address` (port 53 unless given) and return the
/// response time. Any well-formed answer to our query counts as reachable,
/// including error RCODEs: the server responded.
pub async fn run_dns_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    tokio::time::timeout(timeout, query(address))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn query(address: &str) -> Result<Duration, ProbeError> {
    let server = resolve_server(address).await?;
    let bind: SocketAddr = if server.is_ipv4() {
        (IpAddr::from([0u8; 4]), 0).into()
    } else {
        (IpAddr::from([0u16; 8]), 0).into()
    };

    let net = |what: &str, e: std::io::Error| ProbeError::Network(format!("{}: {}", what, e));
    let socket = UdpSocket::bind(bind).await.map_err(|e| net("failed to bind socket", e))?;
    socket.connect(server).await.map_err(|e| net("failed to connect", e))?;

    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id);

    let start = Instant::now();
    socket.send(&packet).await.map_err(|e| net("failed to send", e))?;

    let mut response = [0u8; 512];
    loop {
        let n = socket.recv(&mut response).await.map_err(|e| net("failed to recv", e))?;
        if is_response_to(&response[..n], tx_id) {
            return Ok(start.elapsed());
        }
        tracing::trace!("Ignoring unrelated {} byte datagram from {}", n, server);
    }
}

async fn resolve_server(address: &str) -> Result<SocketAddr, ProbeError> {
    if let Ok(sa) = address.parse::<SocketAddr>() {
        return Ok(sa);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }

    let lookup: std::io::Result<Vec<SocketAddr>> = if address.contains(':') {
        tokio::net::lookup_host(address).await.map(Iterator::collect)
    } else {
        tokio::net::lookup_host((address, 53)).await.map(Iterator::collect)
    };
    lookup
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", address, e)))?
        .into_iter()
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

/// True for a response (QR bit set) carrying our transaction ID.
fn is_response_to(packet: &[u8], tx_id: u16) -> bool {
    packet.len() >= 12 && u16::from_be_bytes([packet[0], packet[1]]) == tx_id && packet[2] & 0x80 != 0
}

/// Standard recursive query for the A record of `example.com`.
fn build_dns_query(tx_id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(32);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // AN/NS/AR counts

    for label in QUERY_NAME {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dns_query() {
        let packet = build_dns_query(0xbeef);
        assert_eq!(packet.len(), 12 + 13 + 4);
        assert_eq!(packet[0..2], [0xbe, 0xef]);
        assert_eq!(packet[12], 7);
        assert_eq!(&packet[13..20], b"example");
    }

    #[test]
    fn test_is_response_to() {
        let mut packet = build_dns_query(42);
        assert!(!is_response_to(&packet, 42), "a query is not a response");
        packet[2] |= 0x80;
        assert!(is_response_to(&packet, 42));
        assert!(!is_response_to(&packet, 43));
        assert!(!is_response_to(&packet[..8], 42));
    }

    #[tokio::test]
    async fn test_resolve_server_hostnames() {
        let default_port = resolve_server("localhost").await.unwrap();
        assert!(default_port.ip().is_loopback());
        assert_eq!(default_port.port(), 53);

        let explicit = resolve_server("localhost:5353").await.unwrap();
        assert!(explicit.ip().is_loopback());
        assert_eq!(explicit.port(), 5353);

        let literal = resolve_server("127.0.0.1").await.unwrap();
        assert_eq!(literal, "127.0.0.1:53".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_dns_probe_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            // Echo the question back as a SERVFAIL response.
            buf[2] |= 0x80;
            buf[3] = (buf[3] & 0xf0) | 2;
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let latency = run_dns_probe(&addr.to_string(), Duration::from_secs(2)).await.unwrap();
        assert!(latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dns_probe_times_out_on_silence() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let err = run_dns_probe(&addr.to_string(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::Timeout(Duration::from_millis(100)));
        drop(server);
    }
}
