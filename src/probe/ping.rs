//! ICMP echo probe.
//!
//! Prefers a native ICMP socket (RAW when privileged, DGRAM otherwise) driven
//! from a blocking thread for accurate timing. Falls back to the system
//! `ping` command when no ICMP socket can be opened.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Ping `address` once and return the round-trip time.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(address, timeout).await;
    }

    let ip = resolve_address(address).await?;
    let result = tokio::task::spawn_blocking(move || echo(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?;

    match result {
        Err(EchoError::PermissionDenied(msg)) => {
            tracing::warn!("Native ping to {} not permitted ({}), using ping command", address, msg);
            run_ping_command(address, timeout).await
        }
        Err(EchoError::Probe(e)) => Err(e),
        Ok(rtt) => Ok(rtt),
    }
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", address, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

enum EchoError {
    PermissionDenied(String),
    Probe(ProbeError),
}

impl From<ProbeError> for EchoError {
    fn from(e: ProbeError) -> Self {
        EchoError::Probe(e)
    }
}

/// Per address family ICMP parameters.
struct Family {
    domain: Domain,
    protocol: Protocol,
    request: u8,
    reply: u8,
}

const ICMPV4: Family = Family {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    request: 8,
    reply: 0,
};

const ICMPV6: Family = Family {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    request: 128,
    reply: 129,
};

fn open_socket(family: &Family) -> Result<(Socket, bool), EchoError> {
    if let Ok(socket) = Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
        return Ok((socket, true));
    }
    Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
        .map(|s| (s, false))
        .map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => EchoError::PermissionDenied(e.to_string()),
            _ => ProbeError::Network(format!("failed to create ICMP socket: {}", e)).into(),
        })
}

/// Send one echo request and wait for the matching reply.
fn echo(ip: IpAddr, timeout: Duration) -> Result<Duration, EchoError> {
    let family = if ip.is_ipv4() { &ICMPV4 } else { &ICMPV6 };
    let (socket, raw) = open_socket(family)?;

    let net = |e: std::io::Error| ProbeError::Network(e.to_string());
    socket.set_write_timeout(Some(timeout)).map_err(net)?;
    socket.connect(&SocketAddr::new(ip, 0).into()).map_err(net)?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(family.request, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => EchoError::PermissionDenied(e.to_string()),
        _ => ProbeError::Network(format!("failed to send echo request: {}", e)).into(),
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket.set_read_timeout(Some(remaining)).map_err(net)?;

        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Network(format!("failed to receive echo reply: {}", e)),
        })?;
        let elapsed = start.elapsed();

        // DGRAM sockets get the identifier rewritten by the kernel, which
        // already filters replies per socket, so only RAW checks it.
        if is_echo_reply(&buf[..len], family.reply, ip.is_ipv4(), sequence)
            && (!raw || reply_identifier(&buf[..len], ip.is_ipv4()) == Some(identifier))
        {
            return Ok(elapsed);
        }
    }
}

/// Build an echo request. The kernel fills in the ICMPv6 checksum.
fn build_echo_request(kind: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, byte) in packet[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Offset of the ICMP header. IPv4 replies may carry the IP header: always
/// on RAW sockets, and on DGRAM sockets on some platforms (macOS). An ICMPv4
/// type never has 4 in its high nibble, so the version field tells them apart.
fn icmp_offset(buf: &[u8], ipv4: bool) -> usize {
    match buf.first() {
        Some(&first) if ipv4 && first >> 4 == 4 => usize::from(first & 0x0f) * 4,
        _ => 0,
    }
}

fn is_echo_reply(buf: &[u8], reply: u8, ipv4: bool, sequence: u16) -> bool {
    let off = icmp_offset(buf, ipv4);
    buf.len() >= off + 8
        && buf[off] == reply
        && u16::from_be_bytes([buf[off + 6], buf[off + 7]]) == sequence
}

fn reply_identifier(buf: &[u8], ipv4: bool) -> Option<u16> {
    let off = icmp_offset(buf, ipv4);
    (buf.len() >= off + 8).then(|| u16::from_be_bytes([buf[off + 4], buf[off + 5]]))
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let mut cmd = Command::new("ping");
    if cfg!(windows) {
        cmd.args(["-n", "1", "-w", &timeout.as_millis().max(1).to_string(), address]);
    } else {
        cmd.args(["-c", "1", "-W", &timeout.as_secs().max(1).to_string(), address]);
    }

    let start = Instant::now();
    let output = tokio::time::timeout(
        timeout + Duration::from_secs(2),
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| ProbeError::Timeout(timeout))?
    .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;
    let elapsed = start.elapsed();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    ping_command_result(output.status.success(), &stdout, &stderr, timeout)
        .map(|parsed| parsed.unwrap_or(elapsed))
}

/// Interpret `ping` output. `Ok(None)` means success without a parseable
/// round-trip time.
fn ping_command_result(
    success: bool,
    stdout: &str,
    stderr: &str,
    timeout: Duration,
) -> Result<Option<Duration>, ProbeError> {
    let lower = stdout.to_ascii_lowercase();

    // Windows exits 0 for "destination net unreachable"; only an echo reply
    // carries a TTL.
    if success && cfg!(windows) && !lower.contains("ttl=") {
        return Err(ProbeError::Command("no echo reply".to_string()));
    }

    if !success {
        if stderr.contains("timeout") || lower.contains("100% packet loss") || lower.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        let reason = stderr.trim();
        let reason = if reason.is_empty() { stdout.trim() } else { reason };
        return Err(ProbeError::Command(format!("ping failed: {}", reason)));
    }

    Ok(parse_ping_rtt(stdout))
}

/// Extract the round-trip time from Linux, macOS or Windows ping output.
fn parse_ping_rtt(output: &str) -> Option<Duration> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<]\s*([0-9.]+)\s*ms").unwrap());
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = [0-9.]+/([0-9.]+)/").unwrap()
    });

    per_packet
        .captures(output)
        .or_else(|| summary.captures(output))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_nanos((ms * 1_000_000.0).round() as u64))
}
