//! Published port specs and alias names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use vessel_common::{VesselError, VesselResult};

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(VesselError::invalid_config(format!(
                "invalid protocol {}",
                s
            ))),
        }
    }
}

/// A port exposed by an endpoint.
///
/// Canonical form is `<host>:<container>/<proto>`; the host side is omitted
/// when the port is exposed without a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Port {
    /// Host-side port of a mapping.
    pub host_port: Option<u16>,
    /// Port inside the container.
    pub container_port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl Port {
    /// A TCP port exposed without a host mapping.
    #[must_use]
    pub const fn tcp(container_port: u16) -> Self {
        Self {
            host_port: None,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// A UDP port exposed without a host mapping.
    #[must_use]
    pub const fn udp(container_port: u16) -> Self {
        Self {
            host_port: None,
            container_port,
            protocol: Protocol::Udp,
        }
    }

    /// Map the port to `host_port`.
    #[must_use]
    pub const fn with_host_port(mut self, host_port: u16) -> Self {
        self.host_port = Some(host_port);
        self
    }

    /// Parse a port spec, expanding container port ranges.
    ///
    /// Grammar: `[host ":"] container ["-" container] "/" proto`. A host
    /// mapping may not be combined with a range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for malformed specs.
    pub fn parse_spec(spec: &str) -> VesselResult<Vec<Self>> {
        let invalid = |why: &str| VesselError::invalid_config(format!("invalid port spec {}: {}", spec, why));

        let (ports, proto) = spec
            .rsplit_once('/')
            .ok_or_else(|| invalid("protocol is required"))?;
        let protocol: Protocol = proto.parse().map_err(|_| invalid("unknown protocol"))?;

        let (host, container) = match ports.split_once(':') {
            Some((host, container)) => (Some(host), container),
            None => (None, ports),
        };

        let parse_port = |p: &str| {
            p.parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid("port must be a number between 1 and 65535"))
        };

        let (low, high) = match container.split_once('-') {
            Some((low, high)) => {
                let (low, high) = (parse_port(low)?, parse_port(high)?);
                if low > high {
                    return Err(invalid("range start is greater than range end"));
                }
                (low, high)
            }
            None => {
                let port = parse_port(container)?;
                (port, port)
            }
        };

        let host_port = match host {
            Some(_) if low != high => {
                return Err(invalid("a host mapping cannot be combined with a range"));
            }
            Some(host) => Some(parse_port(host)?),
            None => None,
        };

        Ok((low..=high)
            .map(|container_port| Self {
                host_port,
                container_port,
                protocol,
            })
            .collect())
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_port {
            Some(host) => write!(f, "{}:{}/{}", host, self.container_port, self.protocol),
            None => write!(f, "{}/{}", self.container_port, self.protocol),
        }
    }
}

/// Fully qualified alias name: `<scope>:<container>:<alias>`, or
/// `<scope>:<alias>` when `container` is empty.
#[must_use]
pub fn scoped_alias_name(scope: &str, container: &str, alias: &str) -> String {
    if container.is_empty() {
        format!("{}:{}", scope, alias)
    } else {
        format!("{}:{}:{}", scope, container, alias)
    }
}

/// Split an alias spec `[peer]:name` into its peer and name.
///
/// # Errors
///
/// Returns `InvalidConfig` unless the spec has exactly one colon.
pub fn parse_alias_spec(spec: &str) -> VesselResult<(&str, &str)> {
    let mut parts = spec.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(peer), Some(name), None) => Ok((peer, name)),
        _ => Err(VesselError::invalid_config(format!(
            "parsing network alias {} failed",
            spec
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_short_and_mapped_specs() {
        assert_eq!(Port::parse_spec("80/tcp").unwrap(), vec![Port::tcp(80)]);
        assert_eq!(
            Port::parse_spec("8080:80/tcp").unwrap(),
            vec![Port::tcp(80).with_host_port(8080)]
        );
        assert_eq!(Port::parse_spec("53/udp").unwrap(), vec![Port::udp(53)]);
    }

    #[test]
    fn parse_range_expands() {
        let ports = Port::parse_spec("8000-8002/tcp").unwrap();
        assert_eq!(ports, vec![Port::tcp(8000), Port::tcp(8001), Port::tcp(8002)]);
    }

    #[test]
    fn parse_rejects_bad_specs() {
        assert!(Port::parse_spec("80").is_err());
        assert!(Port::parse_spec("80/sctp").is_err());
        assert!(Port::parse_spec("http/tcp").is_err());
        assert!(Port::parse_spec("0/tcp").is_err());
        assert!(Port::parse_spec("8080:8000-8010/tcp").is_err());
        assert!(Port::parse_spec("9-3/tcp").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for spec in ["80/tcp", "8080:80/tcp", "53/udp"] {
            let port = Port::parse_spec(spec).unwrap()[0];
            assert_eq!(port.to_string(), spec);
        }
    }

    #[test]
    fn scoped_names() {
        assert_eq!(scoped_alias_name("bridge", "", "web"), "bridge:web");
        assert_eq!(scoped_alias_name("bridge", "c1", "db"), "bridge:c1:db");
    }

    #[test]
    fn alias_specs_need_exactly_one_colon() {
        assert_eq!(parse_alias_spec("c2:peer2").unwrap(), ("c2", "peer2"));
        assert_eq!(parse_alias_spec(":self1").unwrap(), ("", "self1"));
        assert!(parse_alias_spec("bad1").is_err());
        assert!(parse_alias_spec("foo:bar:baz").is_err());
    }
}
