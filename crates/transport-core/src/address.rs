//! Transport address grammar
//!
//! Addresses are tagged strings of the form `proto$host[:port]` where the
//! proto is one of `tcp`, `udp`, `tls`, `ws`, `wss` or `ip`. The host part
//! is a numeric IP (IPv6 bracketed), a hostname, `*` for any interface, or
//! a local interface device prefixed with `%`. A trailing `+` requests an
//! exclusive bind.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Protocol tag of a transport address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransportProto {
    /// Reliable stream with TPKT framing
    Tcp,
    /// Datagram
    Udp,
    /// TLS over TCP
    Tls,
    /// WebSocket
    Ws,
    /// Secure WebSocket
    Wss,
    /// Any IP transport; compatible with tcp, udp and tls
    Ip,
}

impl TransportProto {
    /// All protocols this tag is compatible with
    pub fn is_compatible_with(self, other: TransportProto) -> bool {
        if self == other {
            return true;
        }
        // "ip" subsumes the concrete IP based protocols
        matches!(
            (self, other),
            (TransportProto::Ip, TransportProto::Tcp)
                | (TransportProto::Ip, TransportProto::Udp)
                | (TransportProto::Ip, TransportProto::Tls)
                | (TransportProto::Tcp, TransportProto::Ip)
                | (TransportProto::Udp, TransportProto::Ip)
                | (TransportProto::Tls, TransportProto::Ip)
        )
    }

    /// Tag as it appears on the wire side of the `$`
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProto::Tcp => "tcp",
            TransportProto::Udp => "udp",
            TransportProto::Tls => "tls",
            TransportProto::Ws => "ws",
            TransportProto::Wss => "wss",
            TransportProto::Ip => "ip",
        }
    }
}

impl FromStr for TransportProto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportProto::Tcp),
            "udp" => Ok(TransportProto::Udp),
            "tls" => Ok(TransportProto::Tls),
            "ws" => Ok(TransportProto::Ws),
            "wss" => Ok(TransportProto::Wss),
            "ip" => Ok(TransportProto::Ip),
            _ => Err(Error::InvalidAddress(s.to_string(), "unknown protocol tag")),
        }
    }
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The host part of a transport address
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum HostPart {
    /// Numeric IP address
    Ip(IpAddr),
    /// DNS name, resolved at connect time
    Name(String),
    /// Any interface (`*`); with no port this also means any port
    Any,
    /// A specific local interface device (`%eth0`)
    Interface(String),
}

impl fmt::Display for HostPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPart::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            HostPart::Ip(IpAddr::V4(ip)) => write!(f, "{}", ip),
            HostPart::Name(name) => f.write_str(name),
            HostPart::Any => f.write_str("*"),
            HostPart::Interface(dev) => write!(f, "%{}", dev),
        }
    }
}

/// A parsed transport address
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TransportAddress {
    /// Protocol tag before the `$`
    pub proto: TransportProto,

    /// Host, interface or wildcard
    pub host: HostPart,

    /// Port, if one was given
    pub port: Option<u16>,

    /// Trailing `+` was present: request an exclusive (non reusable) bind
    pub exclusive: bool,
}

impl TransportAddress {
    /// Build an address from a protocol and socket address
    pub fn from_socket_addr(proto: TransportProto, addr: SocketAddr) -> Self {
        Self {
            proto,
            host: HostPart::Ip(addr.ip()),
            port: Some(addr.port()),
            exclusive: false,
        }
    }

    /// Build a wildcard listening address
    pub fn any(proto: TransportProto, port: Option<u16>) -> Self {
        Self { proto, host: HostPart::Any, port, exclusive: false }
    }

    /// Numeric socket address, if the host part is numeric and a port is set
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match (&self.host, self.port) {
            (HostPart::Ip(ip), Some(port)) => Some(SocketAddr::new(*ip, port)),
            _ => None,
        }
    }

    /// True when the host part is the `*` wildcard
    pub fn is_wildcard(&self) -> bool {
        matches!(self.host, HostPart::Any)
    }

    /// Compatibility relation between two addresses.
    ///
    /// Protocol families must match (`ip` subsumes tcp/udp/tls) and, when
    /// both hosts are numeric, the IP versions must agree. A wildcard host
    /// is compatible with anything of a matching protocol family.
    pub fn is_compatible(&self, other: &TransportAddress) -> bool {
        if !self.proto.is_compatible_with(other.proto) {
            return false;
        }
        match (&self.host, &other.host) {
            (HostPart::Ip(a), HostPart::Ip(b)) => a.is_ipv4() == b.is_ipv4(),
            _ => true,
        }
    }
}

impl FromStr for TransportAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (proto_str, rest) = s
            .split_once('$')
            .ok_or_else(|| Error::InvalidAddress(s.to_string(), "missing '$' separator"))?;
        let proto: TransportProto = proto_str.parse()?;

        let (rest, exclusive) = match rest.strip_suffix('+') {
            Some(stripped) => (stripped, true),
            None => (rest, false),
        };

        if rest.is_empty() {
            return Err(Error::InvalidAddress(s.to_string(), "empty host part"));
        }

        // Bracketed IPv6 literal, optionally followed by :port
        if let Some(after_bracket) = rest.strip_prefix('[') {
            let (ip_str, tail) = after_bracket
                .split_once(']')
                .ok_or_else(|| Error::InvalidAddress(s.to_string(), "unterminated '['"))?;
            let ip: IpAddr = ip_str
                .parse()
                .map_err(|_| Error::InvalidAddress(s.to_string(), "bad IPv6 literal"))?;
            let port = parse_port_suffix(s, tail)?;
            return Ok(Self { proto, host: HostPart::Ip(ip), port, exclusive });
        }

        // Split trailing :port off everything else. rfind so hostnames with
        // no colon and v4 literals both work; v6 must use brackets.
        let (host_str, port) = match rest.rfind(':') {
            Some(pos) => {
                let port = rest[pos + 1..]
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidAddress(s.to_string(), "bad port number"))?;
                (&rest[..pos], Some(port))
            }
            None => (rest, None),
        };

        if host_str.is_empty() {
            return Err(Error::InvalidAddress(s.to_string(), "empty host part"));
        }

        let host = if host_str == "*" {
            HostPart::Any
        } else if let Some(dev) = host_str.strip_prefix('%') {
            HostPart::Interface(dev.to_string())
        } else if let Ok(ip) = host_str.parse::<IpAddr>() {
            HostPart::Ip(ip)
        } else {
            HostPart::Name(host_str.to_string())
        };

        Ok(Self { proto, host, port, exclusive })
    }
}

fn parse_port_suffix(whole: &str, tail: &str) -> Result<Option<u16>> {
    if tail.is_empty() {
        return Ok(None);
    }
    let digits = tail
        .strip_prefix(':')
        .ok_or_else(|| Error::InvalidAddress(whole.to_string(), "junk after host"))?;
    digits
        .parse::<u16>()
        .map(Some)
        .map_err(|_| Error::InvalidAddress(whole.to_string(), "bad port number"))
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.proto, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if self.exclusive {
            f.write_str("+")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_with_port() {
        let addr: TransportAddress = "tcp$10.0.0.1:1720".parse().unwrap();
        assert_eq!(addr.proto, TransportProto::Tcp);
        assert_eq!(addr.host, HostPart::Ip("10.0.0.1".parse().unwrap()));
        assert_eq!(addr.port, Some(1720));
        assert!(!addr.exclusive);
    }

    #[test]
    fn test_parse_hostname_no_port() {
        let addr: TransportAddress = "udp$gw.example.com".parse().unwrap();
        assert_eq!(addr.host, HostPart::Name("gw.example.com".to_string()));
        assert_eq!(addr.port, None);
    }

    #[test]
    fn test_parse_wildcard_and_exclusive() {
        let addr: TransportAddress = "tcp$*:1720+".parse().unwrap();
        assert!(addr.is_wildcard());
        assert!(addr.exclusive);
        assert_eq!(addr.port, Some(1720));
    }

    #[test]
    fn test_parse_interface() {
        let addr: TransportAddress = "udp$%eth0:5060".parse().unwrap();
        assert_eq!(addr.host, HostPart::Interface("eth0".to_string()));
        assert_eq!(addr.port, Some(5060));
    }

    #[test]
    fn test_parse_ipv6_bracketed() {
        let addr: TransportAddress = "tls$[::1]:5061".parse().unwrap();
        assert_eq!(addr.host, HostPart::Ip("::1".parse().unwrap()));
        assert_eq!(addr.port, Some(5061));
    }

    #[test]
    fn test_display_round_trip() {
        for s in [
            "tcp$10.0.0.1:1720",
            "udp$*",
            "tls$[::1]:5061",
            "udp$%eth0:5060",
            "tcp$host.example.com:1720+",
            "ip$192.168.1.1",
        ] {
            let addr: TransportAddress = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn test_reject_malformed() {
        assert!("10.0.0.1:1720".parse::<TransportAddress>().is_err());
        assert!("bogus$10.0.0.1".parse::<TransportAddress>().is_err());
        assert!("tcp$".parse::<TransportAddress>().is_err());
        assert!("tcp$host:notaport".parse::<TransportAddress>().is_err());
        assert!("tcp$[::1".parse::<TransportAddress>().is_err());
    }

    #[test]
    fn test_compatibility_ip_subsumes() {
        let ip: TransportAddress = "ip$10.0.0.1".parse().unwrap();
        let tcp: TransportAddress = "tcp$10.0.0.2:1720".parse().unwrap();
        let udp: TransportAddress = "udp$10.0.0.3:5060".parse().unwrap();
        assert!(ip.is_compatible(&tcp));
        assert!(ip.is_compatible(&udp));
        assert!(!tcp.is_compatible(&udp));
    }

    #[test]
    fn test_compatibility_ip_version() {
        let v4: TransportAddress = "udp$10.0.0.1:5060".parse().unwrap();
        let v6: TransportAddress = "udp$[::1]:5060".parse().unwrap();
        let any: TransportAddress = "udp$*".parse().unwrap();
        assert!(!v4.is_compatible(&v6));
        assert!(any.is_compatible(&v4));
        assert!(any.is_compatible(&v6));
    }
}
