//! Endpoint address validation.
//!
//! See [`PeerAddr`] and [`validate_ip`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// A validated `(ip, port)` pair identifying one endpoint of a connection.
///
/// The IP is kept as the originally-validated string rather than re-parsed
/// into [`std::net::IpAddr`] and reformatted, so that a decoded [`Packet`](crate::packet::Packet)
/// re-encodes to byte-identical address fields (case, leading zeros and all).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// Dotted-quad IPv4 or uncompressed colon-hex IPv6 string.
    pub ip: String,
    /// Port in `1..=65535`.
    pub port: u16,
}

impl PeerAddr {
    /// Creates a new address without validating it.
    ///
    /// Prefer [`PeerAddr::parse`] for data coming from the network.
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Validates `ip` and `port`, returning an address on success.
    ///
    /// # Errors
    ///
    /// Errors if `ip` is not a valid dotted-quad IPv4 address or uncompressed
    /// IPv6 address, or if `port` is `0`.
    pub fn parse(ip: &str, port: u16) -> Result<Self, AddrError> {
        validate_ip(ip)?;
        if port == 0 {
            return Err(AddrError::PortOutOfRange { port: 0 });
        }
        Ok(Self::new(ip, port))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Error produced by [`validate_ip`] or [`PeerAddr::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    /// The IP string matched neither the IPv4 nor the IPv6 grammar.
    #[error("malformed ip address: {ip:?}")]
    MalformedIp {
        /// The offending string.
        ip: String,
    },
    /// The port was `0`, or (at the JSON layer) outside `1..=65535`.
    #[error("port {port} out of range 1..=65535")]
    PortOutOfRange {
        /// The offending port.
        port: u32,
    },
}

/// Validates that `ip` is a standard dotted-quad IPv4 address, or an
/// uncompressed (no `::`) colon-hex IPv6 address using uppercase hex digits.
///
/// Compressed IPv6 notation is intentionally rejected: the grammar requires
/// exactly 8 groups, matching what a peer running this same validation would
/// ever produce on the wire.
///
/// # Errors
///
/// Errors if `ip` matches neither grammar.
pub fn validate_ip(ip: &str) -> Result<(), AddrError> {
    if is_valid_ipv4(ip) || is_valid_ipv6(ip) {
        Ok(())
    } else {
        Err(AddrError::MalformedIp { ip: ip.to_owned() })
    }
}

fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|part| is_valid_ipv4_octet(part))
}

fn is_valid_ipv4_octet(part: &str) -> bool {
    if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    // reject leading zeros like "01", but allow the literal "0"
    if part.len() > 1 && part.starts_with('0') {
        return false;
    }
    part.parse::<u16>().is_ok_and(|n| n <= 255)
}

fn is_valid_ipv6(ip: &str) -> bool {
    let groups: Vec<&str> = ip.split(':').collect();
    if groups.len() != 8 {
        return false;
    }
    groups
        .iter()
        .all(|g| !g.is_empty() && g.len() <= 4 && g.bytes().all(is_upper_hex_digit))
}

fn is_upper_hex_digit(b: u8) -> bool {
    b.is_ascii_digit() || (b'A'..=b'F').contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ipv4() {
        assert!(validate_ip("123.45.67.89").is_ok());
        assert!(validate_ip("0.0.0.0").is_ok());
        assert!(validate_ip("255.255.255.255").is_ok());
    }

    #[test]
    fn rejects_malformed_ipv4() {
        assert!(validate_ip("256.0.0.1").is_err());
        assert!(validate_ip("1.2.3").is_err());
        assert!(validate_ip("01.2.3.4").is_err());
        assert!(validate_ip("1.2.3.4.5").is_err());
    }

    #[test]
    fn accepts_uncompressed_ipv6() {
        assert!(validate_ip("2001:0DB8:0000:0000:0000:FF00:0042:8329").is_ok());
    }

    #[test]
    fn rejects_compressed_ipv6() {
        assert!(validate_ip("2001:DB8::8a2e:370:7334").is_err());
        assert!(validate_ip("::1").is_err());
    }

    #[test]
    fn rejects_lowercase_ipv6() {
        assert!(validate_ip("2001:0db8:0000:0000:0000:ff00:0042:8329").is_err());
    }

    #[test]
    fn parse_rejects_zero_port() {
        assert_eq!(
            PeerAddr::parse("1.2.3.4", 0),
            Err(AddrError::PortOutOfRange { port: 0 })
        );
    }
}
