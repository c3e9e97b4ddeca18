//! Broker address parsing.
//!
//! Accepts either a URL (`mqtt://host:1883`, `mqtts://host`) or a bare
//! `host[:port]` pair.

use crate::{TransportError, DEFAULT_PORT, DEFAULT_TLS_PORT};
use url::Url;

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    /// Host name or IP address
    pub host: String,
    /// Port; `0` when the input did not name one
    pub port: u16,
    /// Whether the scheme asked for TLS
    pub tls: bool,
}

impl BrokerUrl {
    /// Parse a broker address.
    ///
    /// # Errors
    ///
    /// Returns error for unsupported schemes, a missing host or a bad port.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        if input.contains("://") {
            let url = Url::parse(input)
                .map_err(|e| TransportError::InvalidBrokerUrl(format!("{input}: {e}")))?;

            let tls = match url.scheme() {
                "tcp" | "mqtt" => false,
                "ssl" | "tls" | "mqtts" => true,
                scheme => {
                    return Err(TransportError::InvalidBrokerUrl(format!(
                        "{input}: unsupported scheme '{scheme}'"
                    )));
                }
            };

            let host = url
                .host_str()
                .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;

            return Ok(Self {
                host: host.to_string(),
                port: url.port().unwrap_or(0),
                tls,
            });
        }

        let mut parts = input.split(':');
        let host = parts
            .next()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = match parts.next() {
            None => 0,
            Some(port) => port.parse().map_err(|_| {
                TransportError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
            })?,
        };
        if parts.next().is_some() {
            return Err(TransportError::InvalidBrokerUrl(format!(
                "{input}: too many ':' separators"
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls: false,
        })
    }

    /// Port with the scheme default filled in.
    #[must_use]
    pub fn port_or_default(&self) -> u16 {
        match (self.port, self.tls) {
            (0, false) => DEFAULT_PORT,
            (0, true) => DEFAULT_TLS_PORT,
            (port, _) => port,
        }
    }
}
