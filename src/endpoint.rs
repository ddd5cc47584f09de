//! Endpoint parsing and domain classification.
//!
//! An endpoint is the immutable string `<protocol>://<address>` used to bind
//! or connect a [`crate::channel::Channel`]. Construction normalizes the
//! protocol to lower case and classifies the endpoint into a [`Domain`].

use std::fmt;

use crate::error::ChannelError;

/// Transport protocol recognised by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Inproc,
    Ipc,
    Tcp,
    Pgm,
    Epgm,
    Vmci,
}

impl Protocol {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "inproc" => Protocol::Inproc,
            "ipc" => Protocol::Ipc,
            "tcp" => Protocol::Tcp,
            "pgm" => Protocol::Pgm,
            "epgm" => Protocol::Epgm,
            "vmci" => Protocol::Vmci,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Inproc => "inproc",
            Protocol::Ipc => "ipc",
            Protocol::Tcp => "tcp",
            Protocol::Pgm => "pgm",
            Protocol::Epgm => "epgm",
            Protocol::Vmci => "vmci",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of an endpoint's reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Same process (`inproc`).
    Local,
    /// Same host (`ipc`, or `tcp` to a loopback address).
    Node,
    /// Reachable over the network.
    Network,
}

fn is_loopback_address(address: &str) -> bool {
    let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
    host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]"
}

/// An immutable, validated, normalized transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    raw: String,
    protocol: Protocol,
    address: String,
}

impl Endpoint {
    /// Parse and classify an endpoint string of the form
    /// `<protocol>://<address>`. The protocol is matched case-insensitively
    /// and normalized to lower case in [`Endpoint::as_str`].
    pub fn parse(s: &str) -> Result<Self, ChannelError> {
        let (proto_str, address) = s
            .split_once("://")
            .ok_or_else(|| ChannelError::InvalidEndpoint(s.to_string()))?;
        let protocol = Protocol::parse(&proto_str.to_ascii_lowercase())
            .ok_or_else(|| ChannelError::InvalidEndpoint(s.to_string()))?;
        if address.is_empty() {
            return Err(ChannelError::InvalidEndpoint(s.to_string()));
        }
        let raw = format!("{}://{}", protocol.as_str(), address);
        Ok(Endpoint {
            raw,
            protocol,
            address: address.to_string(),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Classify this endpoint's reachability domain.
    pub fn domain(&self) -> Domain {
        match self.protocol {
            Protocol::Inproc => Domain::Local,
            Protocol::Ipc => Domain::Node,
            Protocol::Tcp if is_loopback_address(&self.address) => Domain::Node,
            Protocol::Tcp | Protocol::Pgm | Protocol::Epgm | Protocol::Vmci => Domain::Network,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}
