//! Endpoint URLs.
//!
//! Services advertise their endpoints as scheme-prefixed URLs:
//!
//! | Scheme | Transport |
//! |--------|-----------|
//! | `tcp://host:port` | plain TCP |
//! | `tcps://host:port` | TCP + TLS (parsed, not compiled in) |
//!
//! Port `0` on a listen URL means "pick a free port"; the resolved port is
//! reported back through [`TransportServer::endpoints`](crate::transport::TransportServer::endpoints).

use std::fmt;

use crate::error::{Error, Result};

/// A parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    scheme: String,
    host: String,
    port: u16,
}

impl Url {
    /// Default scheme when none is given.
    pub const DEFAULT_SCHEME: &'static str = "tcp";

    /// Parse a `scheme://host:port` string.
    ///
    /// A missing scheme defaults to `tcp`; a missing port defaults to `0`.
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = match s.find("://") {
            Some(idx) => (&s[..idx], &s[idx + 3..]),
            None => (Self::DEFAULT_SCHEME, s),
        };
        if scheme.is_empty() || rest.is_empty() {
            return Err(Error::Protocol(format!("invalid url '{}'", s)));
        }
        let (host, port) = match rest.rfind(':') {
            Some(idx) => {
                let port = rest[idx + 1..]
                    .parse::<u16>()
                    .map_err(|_| Error::Protocol(format!("invalid port in url '{}'", s)))?;
                (&rest[..idx], port)
            }
            None => (rest, 0),
        };
        if host.is_empty() {
            return Err(Error::Protocol(format!("missing host in url '{}'", s)));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Build a URL from parts.
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// The scheme (`tcp`, `tcps`).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part (`0` = unspecified).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same URL with a different port (used to publish a resolved listen port).
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port,
        }
    }

    /// True for loopback endpoints (RFC 3330: `127.0.0.0/8`, plus `localhost`).
    pub fn is_loopback(&self) -> bool {
        self.host.starts_with("127.") || self.host == "localhost"
    }

    /// `host:port` form for socket address resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl std::str::FromStr for Url {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn parses_full_url() {
        let url = Url::parse("tcp://192.168.0.5:9559").unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.host(), "192.168.0.5");
        assert_eq!(url.port(), 9559);
        assert_eq!(url.to_string(), "tcp://192.168.0.5:9559");
    }

    #[test_log::test]
    fn defaults_scheme_and_port() {
        let url = Url::parse("localhost").unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.port(), 0);
        assert!(url.is_loopback());
    }

    #[test_log::test]
    fn loopback_detection() {
        assert!(Url::parse("tcp://127.0.0.1:1").unwrap().is_loopback());
        assert!(Url::parse("tcp://127.8.4.2:1").unwrap().is_loopback());
        assert!(Url::parse("tcp://localhost:1").unwrap().is_loopback());
        assert!(!Url::parse("tcp://10.0.0.1:1").unwrap().is_loopback());
    }

    #[test_log::test]
    fn rejects_garbage() {
        assert!(Url::parse("").is_err());
        assert!(Url::parse("tcp://").is_err());
        assert!(Url::parse("tcp://host:notaport").is_err());
    }
}
