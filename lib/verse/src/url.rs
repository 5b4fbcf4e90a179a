//! Data-plane URLs: `verse-<transport>-<security>://host[:port|:*]` plus
//! family-aware comparison of network addresses.

use crate::error::{ErrorType, NetworkError, NetworkResult};
use std::fmt;
use std::net::SocketAddr;

/// Default port of the public stream listener.
pub const DEFAULT_PORT: u16 = 12345;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
    WebSocket,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Security {
    None,
    Dtls,
    Tls,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Port component of a URL; `Any` is the `*` form, "server picks".
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UrlPort {
    Any,
    Number(u16),
}

/// A parsed verse URL.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VerseUrl {
    pub transport: Transport,
    pub security: Security,
    pub host: String,
    pub port: UrlPort,
    /// Detected from a literal address; None for a hostname.
    pub family: Option<IpFamily>,
}

impl VerseUrl {
    pub fn new(transport: Transport, security: Security, host: &str, port: UrlPort) -> VerseUrl {
        VerseUrl {
            transport,
            security,
            host: host.to_owned(),
            port,
            family: detect_family(host),
        }
    }

    /// Parses the grammar
    /// `verse-(udp|tcp|wss)-(none|dtls|tls)://(host|[ipv6])(:port|:*)`.
    pub fn parse(url: &str) -> NetworkResult<VerseUrl> {
        let parse_err = || NetworkError::Fatal(ErrorType::UrlParse);

        let separator = url.find("://").ok_or_else(parse_err)?;
        let (scheme, rest) = url.split_at(separator);
        let rest = &rest[3..];

        let mut scheme_parts = scheme.split('-');

        if scheme_parts.next() != Some("verse") {
            return Err(parse_err());
        }

        let transport = match scheme_parts.next() {
            Some("udp") => Transport::Udp,
            Some("tcp") => Transport::Tcp,
            Some("wss") => Transport::WebSocket,
            _ => return Err(parse_err()),
        };

        let security = match scheme_parts.next() {
            Some("none") => Security::None,
            Some("dtls") => Security::Dtls,
            Some("tls") => Security::Tls,
            _ => return Err(parse_err()),
        };

        if scheme_parts.next().is_some() {
            return Err(parse_err());
        }

        // An IPv6 literal is recognized by the leading bracket.
        let (host, port_str) = if rest.starts_with('[') {
            let close = rest.find(']').ok_or_else(parse_err)?;
            let host = &rest[1..close];
            let tail = &rest[close + 1..];
            if !tail.starts_with(':') {
                return Err(parse_err());
            }
            (host, &tail[1..])
        } else {
            let colon = rest.rfind(':').ok_or_else(parse_err)?;
            (&rest[..colon], &rest[colon + 1..])
        };

        if host.is_empty() || port_str.is_empty() {
            return Err(parse_err());
        }

        let port = if port_str == "*" {
            UrlPort::Any
        } else {
            UrlPort::Number(port_str.parse::<u16>().map_err(|_| parse_err())?)
        };

        Ok(VerseUrl::new(transport, security, host, port))
    }
}

impl fmt::Display for VerseUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let transport = match self.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::WebSocket => "wss",
        };
        let security = match self.security {
            Security::None => "none",
            Security::Dtls => "dtls",
            Security::Tls => "tls",
        };

        write!(f, "verse-{}-{}://", transport, security)?;

        match self.family {
            Some(IpFamily::V6) => write!(f, "[{}]", self.host)?,
            _ => write!(f, "{}", self.host)?,
        }

        match self.port {
            UrlPort::Any => write!(f, ":*"),
            UrlPort::Number(port) => write!(f, ":{}", port),
        }
    }
}

fn detect_family(host: &str) -> Option<IpFamily> {
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        Some(IpFamily::V4)
    } else if host.parse::<std::net::Ipv6Addr>().is_ok() {
        Some(IpFamily::V6)
    } else {
        None
    }
}

/// Compares two socket addresses with family awareness.
#[inline]
pub fn addr_eq(left: &SocketAddr, right: &SocketAddr) -> bool {
    match (left, right) {
        (SocketAddr::V4(l), SocketAddr::V4(r)) => l.ip() == r.ip(),
        (SocketAddr::V6(l), SocketAddr::V6(r)) => l.ip() == r.ip(),
        _ => false,
    }
}

/// Address equality including the 16-bit port.
#[inline]
pub fn addr_eq_port(left: &SocketAddr, right: &SocketAddr) -> bool {
    addr_eq(left, right) && left.port() == right.port()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_dtls() {
        let url = VerseUrl::parse("verse-udp-dtls://example.org:20001").unwrap();

        assert_eq!(url.transport, Transport::Udp);
        assert_eq!(url.security, Security::Dtls);
        assert_eq!(url.host, "example.org");
        assert_eq!(url.port, UrlPort::Number(20001));
        assert_eq!(url.family, None);
    }

    #[test]
    fn test_parse_wildcard_port() {
        let url = VerseUrl::parse("verse-tcp-tls://10.0.0.1:*").unwrap();

        assert_eq!(url.port, UrlPort::Any);
        assert_eq!(url.family, Some(IpFamily::V4));
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let url = VerseUrl::parse("verse-udp-none://[::1]:12345").unwrap();

        assert_eq!(url.host, "::1");
        assert_eq!(url.family, Some(IpFamily::V6));
        assert_eq!(url.port, UrlPort::Number(12345));
    }

    #[test]
    fn test_display_roundtrip() {
        for &text in &[
            "verse-udp-dtls://example.org:20001",
            "verse-wss-tls://host:443",
            "verse-udp-none://[::1]:*",
        ] {
            let url = VerseUrl::parse(text).unwrap();
            assert_eq!(url.to_string(), text);
            assert_eq!(VerseUrl::parse(&url.to_string()).unwrap(), url);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for &bad in &[
            "http://example.org:80",
            "verse-udp://example.org:80",
            "verse-udp-none://example.org",
            "verse-udp-none://:80",
            "verse-ipx-none://example.org:80",
            "verse-udp-none://[::1:80",
            "verse-udp-none://example.org:notaport",
        ] {
            assert!(VerseUrl::parse(bad).is_err(), "Accepted {}", bad);
        }
    }

    #[test]
    fn test_addr_comparison() {
        let a4: SocketAddr = "127.0.0.1:100".parse().unwrap();
        let b4: SocketAddr = "127.0.0.1:200".parse().unwrap();
        let a6: SocketAddr = "[::1]:100".parse().unwrap();

        assert!(addr_eq(&a4, &b4));
        assert!(!addr_eq_port(&a4, &b4));
        assert!(!addr_eq(&a4, &a6));
        assert!(addr_eq_port(&a4, &a4));
    }
}
