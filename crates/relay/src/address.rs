//! Relay DSN parsing.
//!
//! A relay descriptor is either the pipe token (`pipes` or `pipe`) or a
//! `scheme://endpoint` pair naming a socket family and its bind target:
//!
//! - `pipes` → worker stdin/stdout
//! - `tcp://:6001`, `tcp4://127.0.0.1:6001`, `tcp6://[::1]:6001`
//! - `unix://rr.sock`
//!
//! The string is parsed exactly once into [`RelayAddress`]; everything
//! downstream matches on the variant.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{RelayError, Result};

pub const DSN_SEPARATOR: &str = "://";

/// Socket family selected by the DSN scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketFamily {
    /// `tcp`: IPv4 or IPv6, whichever the endpoint resolves to first.
    Tcp,
    Tcp4,
    Tcp6,
    /// `unix`: filesystem-path stream socket.
    #[cfg(unix)]
    Unix,
}

impl SocketFamily {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(Self::Tcp),
            "tcp4" => Some(Self::Tcp4),
            "tcp6" => Some(Self::Tcp6),
            #[cfg(unix)]
            "unix" => Some(Self::Unix),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            #[cfg(unix)]
            Self::Unix => "unix",
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp | Self::Tcp4 | Self::Tcp6)
    }

    /// Whether a resolved address belongs to this family.
    pub(crate) fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
            #[cfg(unix)]
            Self::Unix => false,
        }
    }

    /// Expand a bare `:port` endpoint into a bindable `host:port`.
    pub(crate) fn bind_endpoint(&self, endpoint: &str) -> String {
        match (self, endpoint.starts_with(':')) {
            (Self::Tcp6, true) => format!("[::]{endpoint}"),
            (_, true) if self.is_tcp() => format!("0.0.0.0{endpoint}"),
            _ => endpoint.to_string(),
        }
    }

    /// Expand a bare `:port` endpoint into a dialable loopback `host:port`.
    pub(crate) fn dial_endpoint(&self, endpoint: &str) -> String {
        match (self, endpoint.starts_with(':')) {
            (Self::Tcp6, true) => format!("[::1]{endpoint}"),
            (_, true) if self.is_tcp() => format!("127.0.0.1{endpoint}"),
            _ => endpoint.to_string(),
        }
    }
}

impl fmt::Display for SocketFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Parsed relay descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelayAddress {
    /// Worker stdin/stdout, attached at spawn time.
    Pipes,
    /// Listening socket the workers dial into.
    Socket {
        family: SocketFamily,
        endpoint: String,
    },
}

impl RelayAddress {
    /// Parse a relay DSN.
    ///
    /// Anything other than the pipe token must split on `://` into exactly two
    /// non-empty parts, and the scheme must name a supported socket family.
    pub fn parse(dsn: &str) -> Result<Self> {
        if dsn == "pipes" || dsn == "pipe" {
            return Ok(Self::Pipes);
        }

        let parts: Vec<&str> = dsn.split(DSN_SEPARATOR).collect();
        let [scheme, endpoint] = parts.as_slice() else {
            return Err(RelayError::InvalidDsn(dsn.to_string()));
        };
        if scheme.is_empty() || endpoint.is_empty() {
            return Err(RelayError::InvalidDsn(dsn.to_string()));
        }

        let family =
            SocketFamily::from_scheme(scheme).ok_or_else(|| RelayError::UnsupportedScheme {
                scheme: scheme.to_string(),
                dsn: dsn.to_string(),
            })?;

        Ok(Self::Socket {
            family,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn is_pipes(&self) -> bool {
        matches!(self, Self::Pipes)
    }

    pub fn family(&self) -> Option<SocketFamily> {
        match self {
            Self::Pipes => None,
            Self::Socket { family, .. } => Some(*family),
        }
    }
}

impl FromStr for RelayAddress {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipes => f.write_str("pipes"),
            Self::Socket { family, endpoint } => {
                write!(f, "{}{}{}", family, DSN_SEPARATOR, endpoint)
            }
        }
    }
}
