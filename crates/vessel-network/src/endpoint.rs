//! Attachment of one container to one scope.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use ipnet::Ipv4Net;
use parking_lot::RwLock;

use vessel_common::{ContainerId, ScopeId, VesselError, VesselResult};

use crate::container::Container;
use crate::exec::Handle;
use crate::port::{Port, scoped_alias_name};
use crate::scope::Scope;

/// A name by which a container wants itself or a peer to be reachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias {
    /// The alias.
    pub name: String,
    /// Name of the container the alias resolves to.
    pub container: String,
}

#[derive(Debug, Clone)]
struct EndpointState {
    ip: Ipv4Addr,
    is_static: bool,
    ports: BTreeSet<Port>,
    aliases: BTreeMap<String, Vec<Alias>>,
    gateway: Option<Ipv4Addr>,
    subnet: Option<Ipv4Net>,
}

/// Per-(container, scope) attachment point.
///
/// The endpoint refers back to its container and scope without owning
/// them; the identity of both is cached so detached snapshots stay
/// readable after the live objects are gone.
#[derive(Debug)]
pub struct Endpoint {
    container: Weak<Container>,
    scope: Weak<Scope>,
    container_id: ContainerId,
    container_name: String,
    scope_id: ScopeId,
    scope_name: String,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    /// A new endpoint for `container` on `scope`.
    ///
    /// A specified `ip` makes the endpoint static.
    pub(crate) fn new(container: &Arc<Container>, scope: &Arc<Scope>, ip: Option<Ipv4Addr>) -> Self {
        let ip = ip.filter(|ip| !ip.is_unspecified());
        Self {
            container: Arc::downgrade(container),
            scope: Arc::downgrade(scope),
            container_id: container.id().clone(),
            container_name: container.name().to_string(),
            scope_id: scope.id().clone(),
            scope_name: scope.name().to_string(),
            state: RwLock::new(EndpointState {
                ip: ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
                is_static: ip.is_some(),
                ports: BTreeSet::new(),
                aliases: BTreeMap::new(),
                gateway: None,
                subnet: None,
            }),
        }
    }

    /// The assigned address; unspecified while unassigned.
    #[must_use]
    pub fn ip(&self) -> Ipv4Addr {
        self.state.read().ip
    }

    pub(crate) fn set_ip(&self, ip: Ipv4Addr) {
        self.state.write().ip = ip;
    }

    /// Whether the address was supplied by the caller.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.state.read().is_static
    }

    pub(crate) fn set_static(&self, is_static: bool) {
        self.state.write().is_static = is_static;
    }

    /// ID of the owning container.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Name of the owning container.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.container_name
    }

    /// ID of the scope.
    #[must_use]
    pub const fn scope_id(&self) -> &ScopeId {
        &self.scope_id
    }

    /// Name of the scope.
    #[must_use]
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// The scope, while it exists.
    #[must_use]
    pub fn scope(&self) -> Option<Arc<Scope>> {
        self.scope.upgrade()
    }

    /// The container, while it is bound.
    #[must_use]
    pub fn container(&self) -> Option<Arc<Container>> {
        self.container.upgrade()
    }

    /// The gateway: the refreshed override, else the scope's.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        if let Some(gw) = self.state.read().gateway {
            return gw;
        }
        self.scope()
            .map_or(Ipv4Addr::UNSPECIFIED, |s| s.gateway())
    }

    /// The subnet: the refreshed override, else the scope's.
    #[must_use]
    pub fn subnet(&self) -> Option<Ipv4Net> {
        if let Some(subnet) = self.state.read().subnet {
            return Some(subnet);
        }
        self.scope().and_then(|s| s.subnet())
    }

    /// Exposed ports, in order.
    #[must_use]
    pub fn ports(&self) -> Vec<Port> {
        self.state.read().ports.iter().copied().collect()
    }

    /// Expose a port.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` when the port is already exposed.
    pub fn add_port(&self, port: Port) -> VesselResult<()> {
        if !self.state.write().ports.insert(port) {
            return Err(VesselError::duplicate(format!("port {}", port)));
        }
        Ok(())
    }

    /// Register `name` as an alias for `peer`; an empty peer means this
    /// container. Returns the alias and whether it already existed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty alias name.
    pub fn add_alias(&self, peer: &str, name: &str) -> VesselResult<(Alias, bool)> {
        if name.is_empty() {
            return Err(VesselError::invalid_config(format!(
                "empty alias for container {}",
                self.container_name
            )));
        }

        let peer = if peer.is_empty() {
            self.container_name.as_str()
        } else {
            peer
        };

        let mut state = self.state.write();
        let aliases = state.aliases.entry(peer.to_string()).or_default();
        if let Some(existing) = aliases.iter().find(|a| a.name == name) {
            return Ok((existing.clone(), true));
        }

        let alias = Alias {
            name: name.to_string(),
            container: peer.to_string(),
        };
        aliases.push(alias.clone());
        Ok((alias, false))
    }

    /// Aliases this endpoint holds for `peer`; empty means this container.
    #[must_use]
    pub fn aliases(&self, peer: &str) -> Vec<Alias> {
        let peer = if peer.is_empty() {
            self.container_name.as_str()
        } else {
            peer
        };
        self.state
            .read()
            .aliases
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Every alias this endpoint holds, for all peers.
    #[must_use]
    pub fn all_aliases(&self) -> Vec<Alias> {
        self.state
            .read()
            .aliases
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// The fully qualified name of an alias held by this endpoint.
    ///
    /// Aliases are scoped by network and by the container that declared
    /// them, except names the container declared for itself, which are
    /// scoped by network only.
    #[must_use]
    pub fn scoped_name(&self, alias: &Alias) -> String {
        let is_self_name = self
            .aliases("")
            .iter()
            .any(|own| own.name == alias.name);

        if is_self_name {
            scoped_alias_name(&self.scope_name, "", &alias.name)
        } else {
            scoped_alias_name(&self.scope_name, &self.container_name, &alias.name)
        }
    }

    /// Update address, gateway and subnet from the container handle.
    ///
    /// Only endpoints on dynamic scopes are refreshed; their addressing is
    /// assigned outside this process.
    ///
    /// # Errors
    ///
    /// Fails when the handle has no descriptor for the scope or the
    /// descriptor carries no gateway.
    pub fn refresh(&self, handle: &Handle) -> VesselResult<()> {
        let Some(scope) = self.scope() else {
            return Ok(());
        };
        if !scope.is_dynamic() {
            return Ok(());
        }

        let ne = handle
            .exec_config
            .networks
            .get(&self.scope_name)
            .ok_or_else(|| {
                VesselError::not_found(format!(
                    "network {} in config of container {}",
                    self.scope_name, handle.exec_config.id
                ))
            })?;

        let gateway = ne
            .assigned
            .gateway
            .filter(|gw| !gw.addr().is_unspecified())
            .ok_or_else(|| {
                VesselError::state_conflict(format!(
                    "updating endpoint for container {}: gateway not present for scope {}",
                    handle.exec_config.id, self.scope_name
                ))
            })?;

        let mut state = self.state.write();
        state.ip = ne.assigned.ip;
        state.gateway = Some(gateway.addr());
        state.subnet = Some(gateway.trunc());
        Ok(())
    }

    /// A detached snapshot with its own copy of the mutable state.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            container: self.container.clone(),
            scope: self.scope.clone(),
            container_id: self.container_id.clone(),
            container_name: self.container_name.clone(),
            scope_id: self.scope_id.clone(),
            scope_name: self.scope_name.clone(),
            state: RwLock::new(self.state.read().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeData;

    fn fixture() -> (Arc<Container>, Arc<Scope>) {
        let con = Arc::new(Container::new(ContainerId::new("c1").unwrap(), "c1"));
        let scope = Arc::new(Scope::new(ScopeId::generate(), &ScopeData::bridge("bridge")));
        (con, scope)
    }

    #[test]
    fn specified_ip_makes_endpoint_static() {
        let (con, scope) = fixture();
        let e = Endpoint::new(&con, &scope, Some("10.0.0.5".parse().unwrap()));
        assert!(e.is_static());
        assert_eq!(e.ip(), "10.0.0.5".parse::<Ipv4Addr>().unwrap());

        let e = Endpoint::new(&con, &scope, Some(Ipv4Addr::UNSPECIFIED));
        assert!(!e.is_static());
        assert!(e.ip().is_unspecified());
    }

    #[test]
    fn duplicate_ports_are_rejected() {
        let (con, scope) = fixture();
        let e = Endpoint::new(&con, &scope, None);
        e.add_port(Port::tcp(80)).unwrap();
        e.add_port(Port::tcp(80).with_host_port(8080)).unwrap();
        let err = e.add_port(Port::tcp(80)).unwrap_err();
        assert_eq!(err.kind(), vessel_common::ErrorKind::Duplicate);
        assert_eq!(e.ports().len(), 2);
    }

    #[test]
    fn aliases_default_to_self() {
        let (con, scope) = fixture();
        let e = Endpoint::new(&con, &scope, None);

        let (alias, existed) = e.add_alias("", "web").unwrap();
        assert!(!existed);
        assert_eq!(alias.container, "c1");

        let (_, existed) = e.add_alias("c1", "web").unwrap();
        assert!(existed);
        assert!(e.add_alias("c2", "").is_err());

        e.add_alias("c2", "db").unwrap();
        assert_eq!(e.aliases("").len(), 1);
        assert_eq!(e.all_aliases().len(), 2);
    }

    #[test]
    fn scoped_names_collapse_for_self_aliases() {
        let (con, scope) = fixture();
        let e = Endpoint::new(&con, &scope, None);
        let (own, _) = e.add_alias("", "web").unwrap();
        let (peer, _) = e.add_alias("c2", "db").unwrap();
        assert_eq!(e.scoped_name(&own), "bridge:web");
        assert_eq!(e.scoped_name(&peer), "bridge:c1:db");
    }

    #[test]
    fn copy_is_detached() {
        let (con, scope) = fixture();
        let e = Endpoint::new(&con, &scope, None);
        e.add_alias("", "web").unwrap();
        let snapshot = e.copy();
        e.add_alias("", "api").unwrap();
        e.set_ip("10.0.0.9".parse().unwrap());

        assert_eq!(snapshot.all_aliases().len(), 1);
        assert!(snapshot.ip().is_unspecified());
        assert_eq!(snapshot.scope_name(), "bridge");
    }
}
