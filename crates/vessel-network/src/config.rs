//! Network configuration.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use vessel_common::{VesselError, VesselResult};

use crate::ip::Range;
use crate::scope::{ScopeType, TrustLevel};

/// Default pool bridge scopes carve their subnets from.
pub const DEFAULT_BRIDGE_RANGE: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12);

/// Default prefix length of a bridge scope subnet.
pub const DEFAULT_BRIDGE_WIDTH: u8 = 16;

/// Default name of the builtin bridge scope.
pub const DEFAULT_BRIDGE_NETWORK: &str = "bridge";

/// Reference to the infrastructure port group backing a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroup {
    /// Managed object reference, e.g. `dvportgroup-42`.
    pub reference: String,
    /// Distributed switch the port group belongs to.
    #[serde(default)]
    pub switch: Option<String>,
}

impl PortGroup {
    /// A port group with the given reference.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            switch: None,
        }
    }
}

/// A network materialised as a builtin scope at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerNetworkConfig {
    /// Scope type.
    #[serde(rename = "type")]
    pub scope_type: ScopeType,
    /// Gateway address with the network's prefix length.
    pub gateway: Option<Ipv4Net>,
    /// Nameservers.
    pub nameservers: Vec<Ipv4Addr>,
    /// Address pools, as CIDRs or ranges.
    pub pools: Vec<String>,
    /// Firewall policy.
    pub trust_level: TrustLevel,
    /// Internal networks never carry a default route.
    pub internal: bool,
}

impl ContainerNetworkConfig {
    /// A bridge network.
    #[must_use]
    pub fn bridge() -> Self {
        Self::default()
    }

    /// An external network reached through `gateway`.
    #[must_use]
    pub fn external(gateway: Ipv4Net) -> Self {
        Self {
            scope_type: ScopeType::External,
            gateway: Some(gateway),
            ..Self::default()
        }
    }

    /// Add a nameserver.
    #[must_use]
    pub fn with_nameserver(mut self, server: Ipv4Addr) -> Self {
        self.nameservers.push(server);
        self
    }

    /// Add an address pool.
    #[must_use]
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pools.push(pool.into());
        self
    }

    /// Set the trust level.
    #[must_use]
    pub const fn with_trust_level(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = trust_level;
        self
    }

    /// The subnet implied by the gateway.
    #[must_use]
    pub fn subnet(&self) -> Option<Ipv4Net> {
        self.gateway.map(|gw| gw.trunc())
    }
}

/// Configuration of the network context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Name of the builtin default bridge network.
    pub bridge_network: String,
    /// Pool bridge subnets are carved from.
    pub bridge_ip_range: Option<Ipv4Net>,
    /// Prefix length of each bridge subnet.
    pub bridge_network_width: Option<u8>,
    /// Networks materialised as builtin scopes.
    pub container_networks: BTreeMap<String, ContainerNetworkConfig>,
    /// Port groups keyed by network name.
    pub port_groups: BTreeMap<String, PortGroup>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let bridge = DEFAULT_BRIDGE_NETWORK.to_string();
        Self {
            container_networks: BTreeMap::from([(bridge.clone(), ContainerNetworkConfig::bridge())]),
            port_groups: BTreeMap::from([(bridge.clone(), PortGroup::new(bridge.clone()))]),
            bridge_network: bridge,
            bridge_ip_range: None,
            bridge_network_width: None,
        }
    }
}

impl NetworkConfig {
    /// Load and validate a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> VesselResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or validated.
    pub fn from_toml_str(content: &str) -> VesselResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the bridge pool.
    #[must_use]
    pub const fn with_bridge_ip_range(mut self, range: Ipv4Net) -> Self {
        self.bridge_ip_range = Some(range);
        self
    }

    /// Set the bridge subnet width.
    #[must_use]
    pub const fn with_bridge_network_width(mut self, width: u8) -> Self {
        self.bridge_network_width = Some(width);
        self
    }

    /// Add a builtin network.
    #[must_use]
    pub fn with_container_network(mut self, name: impl Into<String>, network: ContainerNetworkConfig) -> Self {
        self.container_networks.insert(name.into(), network);
        self
    }

    /// Add a port group.
    #[must_use]
    pub fn with_port_group(mut self, name: impl Into<String>, port_group: PortGroup) -> Self {
        self.port_groups.insert(name.into(), port_group);
        self
    }

    /// The bridge pool, falling back to [`DEFAULT_BRIDGE_RANGE`].
    #[must_use]
    pub fn bridge_pool(&self) -> Ipv4Net {
        self.bridge_ip_range
            .filter(|net| !net.addr().is_unspecified())
            .map(|net| net.trunc())
            .unwrap_or(DEFAULT_BRIDGE_RANGE)
    }

    /// The bridge subnet width, falling back to [`DEFAULT_BRIDGE_WIDTH`].
    #[must_use]
    pub fn bridge_width(&self) -> u8 {
        self.bridge_network_width.unwrap_or(DEFAULT_BRIDGE_WIDTH)
    }

    /// Check the configuration before any allocation happens.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> VesselResult<()> {
        let width = self.bridge_width();
        let pool = self.bridge_pool();
        if width > 32 || width < pool.prefix_len() {
            return Err(VesselError::invalid_config(format!(
                "bridge mask /{} is not compatible with bridge pool mask /{}",
                width,
                pool.prefix_len()
            )));
        }

        let bridge = self
            .container_networks
            .get(&self.bridge_network)
            .ok_or_else(|| {
                VesselError::invalid_config(format!(
                    "default bridge network {} not present in config",
                    self.bridge_network
                ))
            })?;
        if bridge.scope_type != ScopeType::Bridge {
            return Err(VesselError::invalid_config(format!(
                "default bridge network {} must be of type bridge",
                self.bridge_network
            )));
        }
        if !self.port_groups.contains_key(&self.bridge_network) {
            return Err(VesselError::invalid_config(format!(
                "no port group for bridge network {}",
                self.bridge_network
            )));
        }

        for (name, network) in &self.container_networks {
            for pool in &network.pools {
                Range::parse(pool).map_err(|_| {
                    VesselError::invalid_config(format!("invalid pool {} for network {}", pool, name))
                })?;
            }

            if network.scope_type == ScopeType::External
                && !network.pools.is_empty()
                && network.gateway.is_none()
            {
                return Err(VesselError::invalid_config(format!(
                    "network {}: pools cannot be specified without a gateway",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = NetworkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bridge_pool(), DEFAULT_BRIDGE_RANGE);
        assert_eq!(config.bridge_pool().to_string(), "172.16.0.0/12");
        assert_eq!(config.bridge_width(), 16);
    }

    #[test]
    fn parse_toml() {
        let config = NetworkConfig::from_toml_str(
            r#"
bridge_network = "bridge"
bridge_ip_range = "10.128.0.0/12"
bridge_network_width = 24

[container_networks.bridge]
type = "bridge"

[container_networks.public]
type = "external"
gateway = "192.168.10.1/24"
nameservers = ["192.168.10.53"]
pools = ["192.168.10.100-192.168.10.200"]
trust_level = "peers"

[port_groups.bridge]
reference = "dvportgroup-1"

[port_groups.public]
reference = "dvportgroup-2"
switch = "dvs-1"
"#,
        )
        .unwrap();

        assert_eq!(config.bridge_width(), 24);
        let public = &config.container_networks["public"];
        assert_eq!(public.scope_type, ScopeType::External);
        assert_eq!(public.trust_level, TrustLevel::Peers);
        assert_eq!(public.subnet(), Some("192.168.10.0/24".parse().unwrap()));
        assert_eq!(config.port_groups["public"].switch.as_deref(), Some("dvs-1"));
    }

    #[test]
    fn incompatible_mask_is_rejected() {
        let config = NetworkConfig::default()
            .with_bridge_ip_range("10.0.0.0/16".parse().unwrap())
            .with_bridge_network_width(12);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), vessel_common::ErrorKind::InvalidConfig);
    }

    #[test]
    fn missing_bridge_network_is_rejected() {
        let mut config = NetworkConfig::default();
        config.bridge_network = "missing".to_string();
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::default();
        config.port_groups.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn external_pools_need_gateway() {
        let mut network = ContainerNetworkConfig::bridge().with_pool("10.1.0.0/24");
        network.scope_type = ScopeType::External;
        let config = NetworkConfig::default().with_container_network("ext", network);
        assert!(config.validate().is_err());

        let config = NetworkConfig::default().with_container_network(
            "ext",
            ContainerNetworkConfig::external("10.1.0.1/16".parse().unwrap()).with_pool("not-a-pool"),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.toml");
        std::fs::write(&path, "bridge_network_width = 20\n").unwrap();
        let config = NetworkConfig::from_file(&path).unwrap();
        assert_eq!(config.bridge_width(), 20);
        assert!(config.container_networks.contains_key("bridge"));
    }
}
