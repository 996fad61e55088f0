//! Network scopes.
//!
//! A scope is a named network with its own address space, gateway, DNS
//! servers and trust policy. Containers join a scope through an
//! [`Endpoint`]; the scope reserves the endpoint's address from its pools
//! unless the scope is dynamic, in which case addresses are assigned by the
//! infrastructure and picked up on refresh.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use vessel_common::{ContainerId, ScopeId, VesselError, VesselResult};

use crate::config::PortGroup;
use crate::container::Container;
use crate::endpoint::Endpoint;
use crate::ip::{Range, all_ones, all_zeros};
use crate::ipam::AddressSpace;

/// Kind of scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    /// Private network behind the host bridge.
    #[default]
    Bridge,
    /// Network mapped directly onto an infrastructure port group.
    External,
}

impl ScopeType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::External => "external",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScopeType {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(Self::Bridge),
            "external" => Ok(Self::External),
            _ => Err(VesselError::invalid_config(format!(
                "scope type {} not supported",
                s
            ))),
        }
    }
}

/// Firewall policy of a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// All traffic allowed.
    Open,
    /// Traffic between containers on the scope allowed.
    Peers,
    /// Only published ports reachable.
    #[default]
    Published,
    /// Only outbound connections allowed.
    Outbound,
    /// No traffic allowed.
    Closed,
}

impl TrustLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Peers => "peers",
            Self::Published => "published",
            Self::Outbound => "outbound",
            Self::Closed => "closed",
        }
    }

    /// Whether ports may be published on a scope with this policy.
    #[must_use]
    pub const fn allows_publishing(self) -> bool {
        matches!(self, Self::Open | Self::Peers | Self::Published)
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "peers" => Ok(Self::Peers),
            "published" => Ok(Self::Published),
            "outbound" => Ok(Self::Outbound),
            "closed" => Ok(Self::Closed),
            _ => Err(VesselError::invalid_config(format!(
                "invalid trust level {}",
                s
            ))),
        }
    }
}

/// Parameters for creating a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeData {
    /// Scope type.
    pub scope_type: ScopeType,
    /// Unique scope name.
    pub name: String,
    /// Subnet; bridge scopes get one from the default pool when absent.
    pub subnet: Option<Ipv4Net>,
    /// Gateway; picked from the first pool when absent.
    pub gateway: Option<Ipv4Addr>,
    /// Nameservers handed to containers.
    pub dns: Vec<Ipv4Addr>,
    /// Firewall policy.
    pub trust_level: TrustLevel,
    /// Address pools inside the subnet, as CIDRs or ranges.
    pub pools: Vec<String>,
    /// Opaque annotations.
    pub annotations: BTreeMap<String, String>,
    /// Internal scopes never carry a default route.
    pub internal: bool,
}

impl ScopeData {
    /// A bridge scope named `name`.
    #[must_use]
    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Bridge,
            name: name.into(),
            ..Self::default()
        }
    }

    /// An external scope named `name`.
    #[must_use]
    pub fn external(name: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::External,
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the subnet.
    #[must_use]
    pub const fn with_subnet(mut self, subnet: Ipv4Net) -> Self {
        self.subnet = Some(subnet);
        self
    }

    /// Set the gateway.
    #[must_use]
    pub const fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Add a nameserver.
    #[must_use]
    pub fn with_dns(mut self, server: Ipv4Addr) -> Self {
        self.dns.push(server);
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

    /// Add an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Mark the scope internal.
    #[must_use]
    pub const fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Parse the pool strings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for the first pool that does not parse.
    pub fn parsed_pools(&self) -> VesselResult<Vec<Range>> {
        self.pools
            .iter()
            .map(|p| {
                Range::parse(p).map_err(|_| {
                    VesselError::invalid_config(format!(
                        "invalid pool {} specified for scope {}",
                        p, self.name
                    ))
                })
            })
            .collect()
    }
}

/// Address allocation backing a scope.
#[derive(Debug, Clone)]
pub(crate) struct Addressing {
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub spaces: Vec<AddressSpace>,
    /// The subnet space the pools were carved from, when there are pools.
    pub parent_space: Option<AddressSpace>,
}

#[derive(Debug)]
struct ScopeInner {
    subnet: Option<Ipv4Net>,
    gateway: Ipv4Addr,
    dns: Vec<Ipv4Addr>,
    trust_level: TrustLevel,
    containers: HashMap<ContainerId, Arc<Container>>,
    endpoints: Vec<Arc<Endpoint>>,
    spaces: Vec<AddressSpace>,
    parent_space: Option<AddressSpace>,
    builtin: bool,
    network: Option<PortGroup>,
    annotations: BTreeMap<String, String>,
    internal: bool,
}

impl ScopeInner {
    fn is_dynamic(&self, scope_type: ScopeType) -> bool {
        scope_type != ScopeType::Bridge && self.spaces.is_empty()
    }

    fn pools(&self) -> Vec<Range> {
        self.spaces.iter().map(AddressSpace::as_range).collect()
    }
}

/// A named network.
#[derive(Debug)]
pub struct Scope {
    id: ScopeId,
    name: String,
    scope_type: ScopeType,
    inner: RwLock<ScopeInner>,
}

impl Scope {
    /// A scope with no address allocation yet.
    pub(crate) fn new(id: ScopeId, data: &ScopeData) -> Self {
        Self {
            id,
            name: data.name.clone(),
            scope_type: data.scope_type,
            inner: RwLock::new(ScopeInner {
                subnet: data.subnet,
                gateway: data.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
                dns: data.dns.clone(),
                trust_level: data.trust_level,
                containers: HashMap::new(),
                endpoints: Vec::new(),
                spaces: Vec::new(),
                parent_space: None,
                builtin: false,
                network: None,
                annotations: data.annotations.clone(),
                internal: data.internal,
            }),
        }
    }

    pub(crate) fn with_network(self, network: PortGroup) -> Self {
        self.inner.write().network = Some(network);
        self
    }

    pub(crate) fn with_addressing(self, addressing: Addressing) -> Self {
        {
            let mut inner = self.inner.write();
            inner.subnet = Some(addressing.subnet);
            inner.gateway = addressing.gateway;
            inner.spaces = addressing.spaces;
            inner.parent_space = addressing.parent_space;
        }
        self
    }

    pub(crate) fn set_builtin(&self, builtin: bool) {
        self.inner.write().builtin = builtin;
    }

    /// Scope ID.
    #[must_use]
    pub const fn id(&self) -> &ScopeId {
        &self.id
    }

    /// Scope name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope type.
    #[must_use]
    pub const fn scope_type(&self) -> ScopeType {
        self.scope_type
    }

    /// Subnet, if one is known.
    #[must_use]
    pub fn subnet(&self) -> Option<Ipv4Net> {
        self.inner.read().subnet
    }

    /// Gateway; unspecified when none is known.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.inner.read().gateway
    }

    /// Nameservers.
    #[must_use]
    pub fn dns(&self) -> Vec<Ipv4Addr> {
        self.inner.read().dns.clone()
    }

    /// Firewall policy.
    #[must_use]
    pub fn trust_level(&self) -> TrustLevel {
        self.inner.read().trust_level
    }

    /// The ranges backing address allocation.
    #[must_use]
    pub fn pools(&self) -> Vec<Range> {
        self.inner.read().pools()
    }

    /// Annotations.
    #[must_use]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.inner.read().annotations.clone()
    }

    /// Whether the scope is internal.
    #[must_use]
    pub fn internal(&self) -> bool {
        self.inner.read().internal
    }

    /// Whether the scope came from startup configuration.
    #[must_use]
    pub fn builtin(&self) -> bool {
        self.inner.read().builtin
    }

    /// The infrastructure port group backing the scope.
    #[must_use]
    pub fn network(&self) -> Option<PortGroup> {
        self.inner.read().network.clone()
    }

    /// Whether addresses on this scope are assigned by the infrastructure.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.inner.read().is_dynamic(self.scope_type)
    }

    /// Member containers.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.inner.read().containers.values().cloned().collect()
    }

    /// A member container by ID.
    #[must_use]
    pub fn container(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.inner.read().containers.get(id).cloned()
    }

    /// Attached endpoints, in attach order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.inner.read().endpoints.clone()
    }

    /// The endpoint holding `addr`. The unspecified address never matches.
    #[must_use]
    pub fn container_by_addr(&self, addr: Ipv4Addr) -> Option<Arc<Endpoint>> {
        if addr.is_unspecified() {
            return None;
        }

        self.inner
            .read()
            .endpoints
            .iter()
            .find(|e| e.ip() == addr)
            .cloned()
    }

    /// Attach `con` through `e`, reserving the endpoint address.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` when the container is already a member, or the
    /// allocation error when no pool can supply the address.
    pub(crate) fn add_container(&self, con: &Arc<Container>, e: Arc<Endpoint>) -> VesselResult<()> {
        let mut inner = self.inner.write();

        if inner.containers.contains_key(con.id()) {
            return Err(VesselError::duplicate(format!(
                "container {} in scope {}",
                con.id(),
                self.name
            )));
        }

        tracing::debug!(container = %con.id(), scope = %self.name, id = %self.id, "Adding container to scope");

        if !inner.is_dynamic(self.scope_type) {
            Self::reserve_endpoint_ip(&mut inner.spaces, &e)?;
        }

        con.add_endpoint(Arc::clone(&e));
        inner.endpoints.push(e);
        inner.containers.insert(con.id().clone(), Arc::clone(con));
        Ok(())
    }

    fn reserve_endpoint_ip(spaces: &mut [AddressSpace], e: &Endpoint) -> VesselResult<()> {
        let wanted = e.ip();
        let mut last_err = None;

        for space in spaces {
            let res = if wanted.is_unspecified() {
                space.reserve_next_ip4().map(|ip| e.set_ip(ip))
            } else {
                space.reserve_ip4(wanted)
            };

            match res {
                Ok(()) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Detach `con`, releasing its endpoint address.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when `con` is not a member or has no endpoint on
    /// this scope.
    pub(crate) fn remove_container(&self, con: &Arc<Container>) -> VesselResult<()> {
        let mut inner = self.inner.write();

        let member = inner
            .containers
            .get(con.id())
            .is_some_and(|c| Arc::ptr_eq(c, con));
        if !member {
            tracing::debug!(container = %con.id(), scope = %self.name, "Container not found in scope");
            return Err(VesselError::not_found(format!(
                "container {} in scope {}",
                con.id(),
                self.name
            )));
        }

        let e = con
            .endpoint(self)
            .ok_or_else(|| VesselError::not_found(format!(
                "endpoint of container {} in scope {}",
                con.id(),
                self.name
            )))?;

        if !inner.is_dynamic(self.scope_type) {
            Self::release_endpoint_ip(&mut inner.spaces, &e)?;
        }

        inner.containers.remove(con.id());
        inner.endpoints.retain(|other| !Arc::ptr_eq(other, &e));
        con.remove_endpoint(&e);

        tracing::debug!(container = %con.id(), scope = %self.name, "Container removed from scope");
        Ok(())
    }

    fn release_endpoint_ip(spaces: &mut [AddressSpace], e: &Endpoint) -> VesselResult<()> {
        let ip = e.ip();
        for space in spaces {
            if space.release_ip4(ip).is_ok() {
                if !e.is_static() {
                    e.set_ip(Ipv4Addr::UNSPECIFIED);
                }
                return Ok(());
            }
        }

        Err(VesselError::state_conflict(format!(
            "could not release IP {} for endpoint of container {}",
            ip,
            e.id()
        )))
    }

    /// Undo the address allocation of this scope.
    ///
    /// Releases the DNS, gateway, all-zeros and all-ones reservations from
    /// every pool, returns the pools to the subnet space they were carved
    /// from, and hands back the subnet space so the caller can return it
    /// to the pool it came from.
    pub(crate) fn release_addressing(&self) -> Option<AddressSpace> {
        let mut inner = self.inner.write();
        let inner = &mut *inner;

        let mut reserved: Vec<Ipv4Addr> = inner.dns.clone();
        reserved.push(inner.gateway);
        if let Some(subnet) = inner.subnet {
            reserved.push(all_zeros(&subnet));
            reserved.push(all_ones(&subnet));
        }

        for space in &mut inner.spaces {
            for ip in reserved.iter().filter(|ip| !ip.is_unspecified()) {
                let _ = space.release_ip4(*ip);
            }

            if let Some(parent) = inner.parent_space.as_mut() {
                if let Err(e) = parent.release_ip4_range(space) {
                    tracing::warn!(scope = %self.name, error = %e, "Could not return pool to subnet space");
                }
            }
        }

        let outer = match inner.parent_space.take() {
            Some(parent) => Some(parent),
            None if inner.spaces.len() == 1 => inner.spaces.first().cloned(),
            None => None,
        };
        inner.spaces.clear();
        outer
    }

    /// The persisted form of the scope.
    #[must_use]
    pub fn record(&self) -> ScopeRecord {
        let inner = self.inner.read();
        ScopeRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            scope_type: self.scope_type,
            subnet: inner.subnet,
            gateway: inner.gateway,
            dns: inner.dns.clone(),
            builtin: inner.builtin,
            pools: inner.pools(),
            annotations: inner.annotations.clone(),
            internal: inner.internal,
        }
    }
}

/// Serialised scope, as stored under `context.scopes.<name>`.
///
/// Endpoints and membership are runtime state and are not part of the
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// Scope ID.
    #[serde(rename = "ID")]
    pub id: ScopeId,
    /// Scope name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Scope type.
    #[serde(rename = "Type")]
    pub scope_type: ScopeType,
    /// Subnet.
    #[serde(rename = "Subnet")]
    pub subnet: Option<Ipv4Net>,
    /// Gateway.
    #[serde(rename = "Gateway")]
    pub gateway: Ipv4Addr,
    /// Nameservers.
    #[serde(rename = "DNS", default)]
    pub dns: Vec<Ipv4Addr>,
    /// Whether the scope came from startup configuration.
    #[serde(rename = "Builtin", default)]
    pub builtin: bool,
    /// Pools backing address allocation.
    #[serde(rename = "Pools", default)]
    pub pools: Vec<Range>,
    /// Annotations.
    #[serde(rename = "Annotations", default)]
    pub annotations: BTreeMap<String, String>,
    /// Whether the scope is internal.
    #[serde(rename = "Internal", default)]
    pub internal: bool,
}

impl ScopeRecord {
    /// Creation parameters that reproduce this record.
    ///
    /// A single pool spanning exactly the subnet is the implicit pool of a
    /// scope created without pools, so it is dropped.
    #[must_use]
    pub fn to_scope_data(&self) -> ScopeData {
        let implicit = self.subnet.map(Range::from);
        let pools = match self.pools.as_slice() {
            [only] if Some(*only) == implicit => Vec::new(),
            pools => pools.iter().map(ToString::to_string).collect(),
        };

        ScopeData {
            scope_type: self.scope_type,
            name: self.name.clone(),
            subnet: self.subnet,
            gateway: Some(self.gateway).filter(|gw| !gw.is_unspecified()),
            dns: self.dns.clone(),
            trust_level: TrustLevel::default(),
            pools,
            annotations: self.annotations.clone(),
            internal: self.internal,
        }
    }
}
