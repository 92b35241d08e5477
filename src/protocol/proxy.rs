//! Proxy-protocol header parsing (v1 text, v2 binary).
//!
//! Listeners configured with allowed networks accept a PROXY header ahead
//! of the normal handshake exchange and replace the session's perceived
//! client address with the one the header carries. The header must be
//! complete before any TLS bytes are consumed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ipnet::IpNet;

/// v2 binary signature.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const V1_PREFIX: &[u8] = b"PROXY ";
const V1_MAX_LEN: usize = 107;

#[derive(Debug, thiserror::Error)]
pub enum ProxyHeaderError {
    #[error("malformed PROXY v1 header")]
    BadV1,
    #[error("malformed PROXY v2 header")]
    BadV2,
    #[error("PROXY v1 header exceeds the maximum length")]
    V1TooLong,
    #[error("unsupported PROXY v2 command {0:#x}")]
    UnsupportedCommand(u8),
}

/// A parsed proxy-protocol header. `LOCAL`/`UNKNOWN` headers carry no
/// address and leave the session's peer address untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// What the first bytes of a fresh connection look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// Starts with "PROX": a v1 text header follows.
    V1,
    /// Starts with the v2 binary signature prefix.
    V2,
    /// Not a proxy header; the bytes belong to the protocol exchange.
    NotProxy,
    /// Too few bytes to decide yet.
    NeedMore,
}

/// Inspect up to the first 4 bytes without consuming them.
pub fn sniff(peek: &[u8]) -> Sniff {
    if peek.is_empty() {
        return Sniff::NeedMore;
    }
    let n = peek.len().min(4);
    if V1_PREFIX[..n] == peek[..n] {
        if n < 4 {
            return Sniff::NeedMore;
        }
        return Sniff::V1;
    }
    if V2_SIGNATURE[..n] == peek[..n] {
        if n < 4 {
            return Sniff::NeedMore;
        }
        return Sniff::V2;
    }
    Sniff::NotProxy
}

/// Check whether the real peer address is allowed to send a PROXY header.
pub fn peer_allowed(networks: &[IpNet], peer: IpAddr) -> bool {
    networks.iter().any(|net| net.contains(&peer))
}

/// Result of an incremental parse: header plus number of consumed bytes,
/// or None when more data is needed.
pub type ParseResult = Result<Option<(ProxyHeader, usize)>, ProxyHeaderError>;

/// Parse a v1 text header: `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`.
pub fn parse_v1(buf: &[u8]) -> ParseResult {
    let end = match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => pos,
        None => {
            if buf.len() >= V1_MAX_LEN {
                return Err(ProxyHeaderError::V1TooLong);
            }
            return Ok(None);
        }
    };
    if end + 2 > V1_MAX_LEN {
        return Err(ProxyHeaderError::V1TooLong);
    }

    let line = std::str::from_utf8(&buf[..end]).map_err(|_| ProxyHeaderError::BadV1)?;
    let mut parts = line.split(' ');

    if parts.next() != Some("PROXY") {
        return Err(ProxyHeaderError::BadV1);
    }

    let header = match parts.next() {
        Some("UNKNOWN") => ProxyHeader {
            source: None,
            destination: None,
        },
        Some(proto @ ("TCP4" | "TCP6")) => {
            let src_ip: IpAddr = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(ProxyHeaderError::BadV1)?;
            let dst_ip: IpAddr = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(ProxyHeaderError::BadV1)?;
            let src_port: u16 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(ProxyHeaderError::BadV1)?;
            let dst_port: u16 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(ProxyHeaderError::BadV1)?;

            let family_ok = match proto {
                "TCP4" => src_ip.is_ipv4() && dst_ip.is_ipv4(),
                _ => src_ip.is_ipv6() && dst_ip.is_ipv6(),
            };
            if !family_ok || parts.next().is_some() {
                return Err(ProxyHeaderError::BadV1);
            }

            ProxyHeader {
                source: Some(SocketAddr::new(src_ip, src_port)),
                destination: Some(SocketAddr::new(dst_ip, dst_port)),
            }
        }
        _ => return Err(ProxyHeaderError::BadV1),
    };

    Ok(Some((header, end + 2)))
}

/// Parse a v2 binary header.
pub fn parse_v2(buf: &[u8]) -> ParseResult {
    if buf.len() < 16 {
        return Ok(None);
    }
    if buf[..12] != V2_SIGNATURE {
        return Err(ProxyHeaderError::BadV2);
    }

    let ver_cmd = buf[12];
    if ver_cmd & 0xF0 != 0x20 {
        return Err(ProxyHeaderError::BadV2);
    }
    let command = ver_cmd & 0x0F;
    let family = buf[13];
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;

    let total = 16 + addr_len;
    if buf.len() < total {
        return Ok(None);
    }

    // LOCAL: health checks and the like, keep the real peer address.
    if command == 0x00 {
        return Ok(Some((
            ProxyHeader {
                source: None,
                destination: None,
            },
            total,
        )));
    }
    if command != 0x01 {
        return Err(ProxyHeaderError::UnsupportedCommand(command));
    }

    let addr = &buf[16..total];
    let header = match family {
        // TCP over IPv4
        0x11 => {
            if addr_len < 12 {
                return Err(ProxyHeaderError::BadV2);
            }
            let src = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let dst = Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7]);
            let src_port = u16::from_be_bytes([addr[8], addr[9]]);
            let dst_port = u16::from_be_bytes([addr[10], addr[11]]);
            ProxyHeader {
                source: Some(SocketAddr::new(IpAddr::V4(src), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V4(dst), dst_port)),
            }
        }
        // TCP over IPv6
        0x21 => {
            if addr_len < 36 {
                return Err(ProxyHeaderError::BadV2);
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&addr[..16]);
            dst.copy_from_slice(&addr[16..32]);
            let src_port = u16::from_be_bytes([addr[32], addr[33]]);
            let dst_port = u16::from_be_bytes([addr[34], addr[35]]);
            ProxyHeader {
                source: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port)),
                destination: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port)),
            }
        }
        // AF_UNSPEC or UNIX: no usable address.
        _ => ProxyHeader {
            source: None,
            destination: None,
        },
    };

    Ok(Some((header, total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_classifies_prefixes() {
        assert_eq!(sniff(b"PROX"), Sniff::V1);
        assert_eq!(sniff(&V2_SIGNATURE[..4]), Sniff::V2);
        assert_eq!(sniff(&[0x20, 0x00, 0x00, 0x00]), Sniff::NotProxy);
        assert_eq!(sniff(b"PR"), Sniff::NeedMore);
    }

    #[test]
    fn v1_tcp4_parses() {
        let buf = b"PROXY TCP4 192.168.0.1 10.0.0.1 56324 3306\r\nrest";
        let (header, consumed) = parse_v1(buf).unwrap().unwrap();
        assert_eq!(
            header.source,
            Some("192.168.0.1:56324".parse().unwrap())
        );
        assert_eq!(&buf[consumed..], b"rest");
    }

    #[test]
    fn v1_unknown_keeps_peer() {
        let buf = b"PROXY UNKNOWN\r\n";
        let (header, _) = parse_v1(buf).unwrap().unwrap();
        assert_eq!(header.source, None);
    }

    #[test]
    fn v1_incomplete_needs_more() {
        assert!(parse_v1(b"PROXY TCP4 192.168.0.1").unwrap().is_none());
    }

    #[test]
    fn v1_mixed_families_rejected() {
        let buf = b"PROXY TCP4 ::1 10.0.0.1 1 2\r\n";
        assert!(parse_v1(buf).is_err());
    }

    #[test]
    fn v2_tcp4_parses() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&V2_SIGNATURE);
        buf.push(0x21); // version 2, PROXY command
        buf.push(0x11); // TCP over IPv4
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&[192, 168, 0, 1]);
        buf.extend_from_slice(&[10, 0, 0, 1]);
        buf.extend_from_slice(&56324u16.to_be_bytes());
        buf.extend_from_slice(&3306u16.to_be_bytes());

        let (header, consumed) = parse_v2(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(
            header.source,
            Some("192.168.0.1:56324".parse().unwrap())
        );
    }

    #[test]
    fn v2_local_has_no_address() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&V2_SIGNATURE);
        buf.push(0x20); // LOCAL
        buf.push(0x00);
        buf.extend_from_slice(&0u16.to_be_bytes());

        let (header, consumed) = parse_v2(&buf).unwrap().unwrap();
        assert_eq!(consumed, 16);
        assert_eq!(header.source, None);
    }

    #[test]
    fn peer_network_check() {
        let nets: Vec<IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        assert!(peer_allowed(&nets, "10.1.2.3".parse().unwrap()));
        assert!(!peer_allowed(&nets, "192.168.0.1".parse().unwrap()));
    }
}
