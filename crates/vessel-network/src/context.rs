//! The network context.
//!
//! The [`Context`] owns every scope, the default bridge pool, the index of
//! bound containers and the alias index. All mutations run under a single
//! context lock; persistence, NIC and bridge link calls are the only
//! suspension points and happen while it is held.
//!
//! Lock order is context, then scope, then container.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use vessel_common::{AddrErrorKind, ContainerId, ErrorKind, ScopeId, VesselError, VesselResult};

use crate::bridge::{BridgeLink, NullLink};
use crate::config::{NetworkConfig, PortGroup};
use crate::container::Container;
use crate::endpoint::Endpoint;
use crate::exec::{ContainerNetwork, ContainerRegistry, DeviceAdapter, Handle, NetworkEndpoint, SlotAssigner};
use crate::ip::{Range, all_ones, all_zeros, is_routable};
use crate::ipam::AddressSpace;
use crate::kvstore::KeyValueStore;
use crate::port::{Port, parse_alias_spec, scoped_alias_name};
use crate::scope::{Addressing, Scope, ScopeData, ScopeRecord, ScopeType, TrustLevel};

/// Key under which a scope record is persisted.
#[must_use]
pub fn scope_key(name: &str) -> String {
    format!("context.scopes.{}", name)
}

/// Pattern matching every persisted scope key.
pub const SCOPE_KEY_PATTERN: &str = r"context\.scopes\..+";

/// Desired attachment of a container to a scope.
#[derive(Debug, Clone, Default)]
pub struct AddContainerOptions {
    /// Scope name, ID prefix or `default`.
    pub scope: String,
    /// Static address.
    pub ip: Option<Ipv4Addr>,
    /// Alias specs, `[peer]:name`.
    pub aliases: Vec<String>,
    /// Port specs.
    pub ports: Vec<String>,
}

impl AddContainerOptions {
    /// Attach to `scope`.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    /// Request a static address.
    #[must_use]
    pub const fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Add an alias spec.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Add a port spec.
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.ports.push(port.into());
        self
    }
}

async fn add_gateway_addr(link: &dyn BridgeLink, scope: &Scope) {
    let Some(subnet) = scope.subnet() else {
        return;
    };
    let Ok(addr) = Ipv4Net::new(scope.gateway(), subnet.prefix_len()) else {
        return;
    };

    match link.addr_add(addr).await {
        Ok(()) => {}
        Err(VesselError::LinkAddress {
            kind: AddrErrorKind::Exists,
            ..
        }) => {}
        Err(e) => {
            tracing::warn!(scope = %scope.name(), addr = %addr, link = %link.name(), error = %e, "Failed to add gateway address to bridge link");
        }
    }
}

async fn remove_gateway_addr(link: &dyn BridgeLink, scope: &Scope) {
    let Some(subnet) = scope.subnet() else {
        return;
    };
    let Ok(addr) = Ipv4Net::new(scope.gateway(), subnet.prefix_len()) else {
        return;
    };

    match link.addr_del(addr).await {
        Ok(()) => {}
        Err(VesselError::LinkAddress {
            kind: AddrErrorKind::NotAvailable,
            ..
        }) => {}
        Err(e) => {
            tracing::warn!(scope = %scope.name(), addr = %addr, link = %link.name(), error = %e, "Could not remove gateway address from bridge link");
        }
    }
}

async fn kv_put(
    kv: &dyn KeyValueStore,
    cancel: &CancellationToken,
    key: &str,
    value: &[u8],
) -> VesselResult<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(VesselError::cancelled(format!("put {}", key))),
        res = kv.put(cancel, key, value) => res,
    }
}

async fn kv_delete(kv: &dyn KeyValueStore, cancel: &CancellationToken, key: &str) -> VesselResult<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(VesselError::cancelled(format!("delete {}", key))),
        res = kv.delete(cancel, key) => res,
    }
}

/// Reserve each pool from `space`; no pools means the whole space.
fn reserve_pools(space: &mut AddressSpace, pools: &[Range]) -> VesselResult<Vec<AddressSpace>> {
    if pools.is_empty() {
        return Ok(vec![space.clone()]);
    }

    pools
        .iter()
        .map(|pool| match pool.network() {
            Some(net) => space.reserve_ip4_net(net),
            None => space.reserve_ip4_range(pool.first_ip, pool.last_ip),
        })
        .collect()
}

/// Reserve the gateway, or pick one from the first pool when unspecified.
fn reserve_gateway(gateway: Ipv4Addr, subnet: &Ipv4Net, spaces: &mut [AddressSpace]) -> VesselResult<Ipv4Addr> {
    let not_routable = |gw: Ipv4Addr| VesselError::OutOfRange {
        message: format!("gateway address {} is not routable on network {}", gw, subnet),
    };

    if !gateway.is_unspecified() {
        if !is_routable(gateway, subnet) {
            return Err(not_routable(gateway));
        }

        // the gateway may lie outside every pool
        for space in spaces.iter_mut() {
            if space.reserve_ip4(gateway).is_ok() {
                break;
            }
        }
        return Ok(gateway);
    }

    let first = spaces.first_mut().ok_or_else(|| VesselError::ExhaustedPool {
        message: format!("could not reserve gateway address for network {}", subnet),
    })?;
    let gateway = first.reserve_next_ip4()?;
    if !is_routable(gateway, subnet) {
        return Err(not_routable(gateway));
    }
    Ok(gateway)
}

/// Carve the addressing of a scope out of its subnet space.
///
/// Works on a copy of `space`, so a failure leaves nothing to undo inside
/// the subnet.
fn carve(space: &AddressSpace, subnet: Ipv4Net, data: &ScopeData, pools: &[Range]) -> VesselResult<Addressing> {
    let mut outer = space.clone();
    let mut spaces = reserve_pools(&mut outer, pools)?;
    let parent_space = (!pools.is_empty()).then_some(outer);

    let gateway = data.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let (zeros, ones) = (all_zeros(&subnet), all_ones(&subnet));
    for p in &mut spaces {
        let _ = p.reserve_ip4(ones);
        let _ = p.reserve_ip4(zeros);

        for dns in &data.dns {
            // the gateway is reserved below
            if *dns == gateway {
                continue;
            }
            let _ = p.reserve_ip4(*dns);
        }
    }

    let gateway = reserve_gateway(gateway, &subnet, &mut spaces)?;
    Ok(Addressing {
        subnet,
        gateway,
        spaces,
        parent_space,
    })
}

#[derive(Debug)]
struct ContextState {
    default_pool: AddressSpace,
    default_mask: u8,
    scopes: HashMap<String, Arc<Scope>>,
    /// Bound containers keyed by long ID, short ID and name.
    containers: HashMap<String, Arc<Container>>,
    aliases: HashMap<String, Vec<Arc<Container>>>,
}

impl ContextState {
    fn check_net_overlap(&self, subnet: Ipv4Net) -> VesselResult<()> {
        let wanted = Range::from(subnet);
        for scope in self.scopes.values() {
            let Some(existing) = scope.subnet() else {
                continue;
            };
            if Range::from(existing).overlaps(&wanted) {
                return Err(VesselError::OverlappingAllocation {
                    message: format!(
                        "subnet {} overlaps with scope {} subnet {}",
                        subnet,
                        scope.name(),
                        existing
                    ),
                });
            }
        }
        Ok(())
    }

    /// Allocate the subnet, from the default pool when possible.
    fn allocate(&mut self, subnet: Ipv4Net, data: &ScopeData, pools: &[Range]) -> VesselResult<Addressing> {
        self.check_net_overlap(subnet)?;

        let (space, from_default) = match self.default_pool.reserve_ip4_net(subnet) {
            Ok(space) => (space, true),
            Err(_) => (AddressSpace::from_network(subnet), false),
        };
        let subnet = space.network().unwrap_or_else(|| subnet.trunc());

        let result = carve(&space, subnet, data, pools);
        if result.is_err() && from_default {
            if let Err(e) = self.default_pool.release_ip4_range(&space.whole()) {
                tracing::warn!(subnet = %subnet, error = %e, "Could not return subnet to default bridge pool");
            }
        }
        result
    }

    /// Build a scope, allocate its addressing and register it.
    fn add_scope(&mut self, id: ScopeId, data: &ScopeData, network: PortGroup) -> VesselResult<Arc<Scope>> {
        if self.scopes.contains_key(&data.name) {
            return Err(VesselError::duplicate(format!("scope {}", data.name)));
        }

        let pools = data.parsed_pools()?;
        let mut scope = Scope::new(id, data).with_network(network);
        if let Some(subnet) = data.subnet {
            scope = scope.with_addressing(self.allocate(subnet, data, &pools)?);
        }

        let scope = Arc::new(scope);
        self.scopes.insert(data.name.clone(), Arc::clone(&scope));
        Ok(scope)
    }

    async fn new_scope(
        &mut self,
        config: &NetworkConfig,
        link: &dyn BridgeLink,
        id: ScopeId,
        mut data: ScopeData,
    ) -> VesselResult<Arc<Scope>> {
        if data.name.is_empty() {
            return Err(VesselError::invalid_config("scope name must not be empty"));
        }
        if self.scopes.contains_key(&data.name) {
            return Err(VesselError::duplicate(format!("scope {}", data.name)));
        }

        match data.scope_type {
            ScopeType::Bridge => {
                let network = config
                    .port_groups
                    .get(&config.bridge_network)
                    .cloned()
                    .ok_or_else(|| VesselError::invalid_config("bridge network not set"))?;

                if data.subnet.is_none() {
                    data.subnet = Some(self.default_pool.next_ip4_net(self.default_mask)?);
                }

                let scope = self.add_scope(id, &data, network)?;
                add_gateway_addr(link, &scope).await;
                Ok(scope)
            }
            ScopeType::External => {
                let gateway_given = data.gateway.is_some_and(|gw| !gw.is_unspecified());
                if !data.pools.is_empty() && (data.subnet.is_none() || !gateway_given) {
                    return Err(VesselError::invalid_config(
                        "ipam cannot be specified without gateway and subnet for external network",
                    ));
                }

                if let Some(subnet) = data.subnet {
                    if self.default_pool.pool().overlaps(&Range::from(subnet)) {
                        return Err(VesselError::OverlappingAllocation {
                            message: format!(
                                "external network {} cannot overlap with default bridge network {}",
                                subnet,
                                self.default_pool.pool()
                            ),
                        });
                    }
                }

                let network = config.port_groups.get(&data.name).cloned().ok_or_else(|| {
                    VesselError::invalid_config(format!(
                        "no network info for external scope {}",
                        data.name
                    ))
                })?;

                self.add_scope(id, &data, network)
            }
        }
    }

    /// Release everything a scope holds and forget it.
    async fn teardown_scope(&mut self, link: &dyn BridgeLink, scope: &Arc<Scope>) {
        if let Some(outer) = scope.release_addressing() {
            if outer.parent() == Some(self.default_pool.id()) {
                if let Err(e) = self.default_pool.release_ip4_range(&outer.whole()) {
                    tracing::warn!(scope = %scope.name(), error = %e, "Could not return subnet to default bridge pool");
                }
            }
        }

        self.scopes.remove(scope.name());

        if scope.scope_type() == ScopeType::Bridge {
            remove_gateway_addr(link, scope).await;
        }
    }

    fn find_scopes(&self, default_scope: &Arc<Scope>, id_or_name: Option<&str>) -> VesselResult<Vec<Arc<Scope>>> {
        let mut found: Vec<Arc<Scope>> = match id_or_name.filter(|s| !s.is_empty()) {
            None => self.scopes.values().cloned().collect(),
            Some("default") => return Ok(vec![Arc::clone(default_scope)]),
            Some(key) => {
                if let Some(scope) = self.scopes.get(key) {
                    return Ok(vec![Arc::clone(scope)]);
                }

                let matches: Vec<Arc<Scope>> = self
                    .scopes
                    .values()
                    .filter(|s| s.id().has_prefix(key))
                    .cloned()
                    .collect();
                if matches.is_empty() {
                    return Err(VesselError::not_found(format!("scope {}", key)));
                }
                matches
            }
        };

        found.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(found)
    }

    fn resolve_scope(&self, default_scope: &Arc<Scope>, key: &str) -> VesselResult<Arc<Scope>> {
        let mut scopes = self.find_scopes(default_scope, Some(key))?;
        if scopes.len() != 1 {
            return Err(VesselError::invalid_config(format!(
                "scope {} is ambiguous: {} matches",
                key,
                scopes.len()
            )));
        }
        scopes
            .pop()
            .ok_or_else(|| VesselError::not_found(format!("scope {}", key)))
    }

    fn bound(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.containers.get(id.as_str()).cloned()
    }

    fn bind(&mut self, handle: &mut Handle, cancel: &CancellationToken) -> VesselResult<Vec<Arc<Endpoint>>> {
        if let Some(con) = self.bound(handle.id()) {
            return Ok(con.endpoints());
        }

        let con = Arc::new(Container::new(
            handle.exec_config.id.clone(),
            handle.exec_config.name.clone(),
        ));

        let mut touched = Vec::new();
        let (endpoints, aliases) = match self.bind_endpoints(&con, handle, cancel, &mut touched) {
            Ok(bound) => bound,
            Err(e) => {
                for scope in &touched {
                    if let Err(err) = scope.remove_container(&con) {
                        tracing::debug!(container = %con.id(), scope = %scope.name(), error = %err, "Rollback of partial bind");
                    }
                }
                return Err(e);
            }
        };

        self.containers.insert(con.id().to_string(), Arc::clone(&con));
        self.containers.insert(con.id().short().to_string(), Arc::clone(&con));
        self.containers.insert(con.name().to_string(), Arc::clone(&con));

        for (alias, target) in aliases {
            tracing::debug!(alias = %alias, container = %target.name(), "Adding alias");
            let targets = self.aliases.entry(alias).or_default();
            if !targets.iter().any(|c| Arc::ptr_eq(c, &target)) {
                targets.push(target);
            }
        }

        tracing::info!(container = %con.id(), name = %con.name(), endpoints = endpoints.len(), "Bound container");
        Ok(endpoints)
    }

    #[allow(clippy::type_complexity)]
    fn bind_endpoints(
        &self,
        con: &Arc<Container>,
        handle: &mut Handle,
        cancel: &CancellationToken,
        touched: &mut Vec<Arc<Scope>>,
    ) -> VesselResult<(Vec<Arc<Endpoint>>, HashMap<String, Arc<Container>>)> {
        let mut aliases: HashMap<String, Arc<Container>> = HashMap::new();
        let mut endpoints = Vec::new();
        let mut default_marked = false;

        for (name, ne) in &mut handle.exec_config.networks {
            if cancel.is_cancelled() {
                return Err(VesselError::cancelled(format!("bind of container {}", con.id())));
            }

            let scope = self
                .scopes
                .get(name)
                .cloned()
                .ok_or_else(|| VesselError::not_found(format!("network {}", name)))?;

            let ip = if ne.is_static {
                tracing::debug!(container = %con.id(), ip = ?ne.ip, "Binding static endpoint");
                ne.ip.map(|net| net.addr())
            } else if !ne.assigned.ip.is_unspecified() {
                // an address in use by a running container is kept
                tracing::debug!(container = %con.id(), ip = %ne.assigned.ip, "Binding endpoint with assigned IP");
                Some(ne.assigned.ip)
            } else {
                None
            };

            let e = Arc::new(Endpoint::new(con, &scope, ip));
            e.set_static(ne.is_static);
            scope.add_container(con, Arc::clone(&e))?;
            touched.push(Arc::clone(&scope));

            for spec in &ne.ports {
                for port in Port::parse_spec(spec)? {
                    e.add_port(port)?;
                }
            }

            Self::write_back(ne, &scope, &e);

            ne.network.default = false;
            if !default_marked && scope.scope_type() == ScopeType::External && !scope.internal() {
                default_marked = true;
                ne.network.default = true;
            }

            aliases.insert(scoped_alias_name(scope.name(), "", con.name()), Arc::clone(con));
            aliases.insert(scoped_alias_name(scope.name(), "", con.id().short()), Arc::clone(con));

            for spec in &ne.network.aliases {
                let (peer, alias_name) = parse_alias_spec(spec)?;
                let (alias, existed) = e.add_alias(peer, alias_name)?;
                if existed {
                    continue;
                }

                let target = if alias.container == con.name() {
                    Some(Arc::clone(con))
                } else {
                    self.containers.get(&alias.container).cloned()
                };

                match target {
                    Some(target) => {
                        aliases.insert(e.scoped_name(&alias), target);
                    }
                    None => {
                        // fixed up when the peer is bound
                        tracing::debug!(alias = %spec, peer = %alias.container, "Skipping alias for unbound peer");
                    }
                }
            }

            for other in scope.endpoints() {
                if other.id() == con.id() {
                    continue;
                }
                for alias in other.aliases(con.name()) {
                    aliases.insert(other.scoped_name(&alias), Arc::clone(con));
                }
            }

            endpoints.push(e);
        }

        if !default_marked {
            if let Some(ne) = handle
                .exec_config
                .networks
                .iter_mut()
                .find(|(name, _)| self.scopes.get(*name).is_some_and(|s| !s.internal()))
                .map(|(_, ne)| ne)
            {
                ne.network.default = true;
            }
        }

        Ok((endpoints, aliases))
    }

    fn write_back(ne: &mut NetworkEndpoint, scope: &Scope, e: &Endpoint) {
        let subnet = e.subnet();
        let with_prefix = |ip: Ipv4Addr| subnet.and_then(|s| Ipv4Net::new(ip, s.prefix_len()).ok());

        if !e.ip().is_unspecified() {
            ne.ip = with_prefix(e.ip());
            ne.assigned.ip = e.ip();
        }

        let gateway = e.gateway();
        if !gateway.is_unspecified() {
            ne.network.gateway = with_prefix(gateway);
        }
        ne.network.nameservers = scope.dns();
        ne.internal = scope.internal();
    }

    /// Alias index keys to evict when `con` leaves `scope`.
    ///
    /// The first list holds aliases owned by the departing endpoint, the
    /// second the keys under which `con` itself is listed.
    fn tombstones(con: &Container, scope: &Scope, e: &Endpoint) -> (Vec<String>, Vec<String>) {
        let mut owned = Vec::new();
        let mut listed = vec![
            scoped_alias_name(scope.name(), "", con.name()),
            scoped_alias_name(scope.name(), "", con.id().short()),
        ];

        let own_names: Vec<String> = e.aliases("").into_iter().map(|a| a.name).collect();
        for alias in e.all_aliases() {
            if own_names.contains(&alias.name) {
                listed.push(e.scoped_name(&alias));
            } else {
                owned.push(e.scoped_name(&alias));
            }
        }

        for other in scope.endpoints() {
            if other.id() == con.id() {
                continue;
            }
            for alias in other.aliases(con.name()) {
                listed.push(other.scoped_name(&alias));
            }
        }

        (owned, listed)
    }

    fn remove_aliases(&mut self, owned: &[String], listed: &[String], con: &Arc<Container>) {
        for key in owned {
            self.aliases.remove(key);
        }

        for key in listed {
            if let Some(targets) = self.aliases.get_mut(key) {
                targets.retain(|c| !Arc::ptr_eq(c, con));
                if targets.is_empty() {
                    self.aliases.remove(key);
                }
            }
        }

        // no entry may outlive the container it points at
        self.aliases.retain(|_, targets| {
            targets.retain(|c| !Arc::ptr_eq(c, con));
            !targets.is_empty()
        });

        self.containers.remove(con.id().as_str());
        self.containers.remove(con.id().short());
        self.containers.remove(con.name());
    }

    fn unbind(&mut self, con: &Arc<Container>, scopes: &[Arc<Scope>]) -> VesselResult<Vec<Arc<Endpoint>>> {
        let mut owned = Vec::new();
        let mut listed = Vec::new();
        let mut endpoints = Vec::new();

        let live = scopes
            .iter()
            .map(|scope| {
                con.endpoint(scope).ok_or_else(|| {
                    VesselError::not_found(format!(
                        "endpoint of container {} in scope {}",
                        con.id(),
                        scope.name()
                    ))
                })
            })
            .collect::<VesselResult<Vec<_>>>()?;

        for (scope, live) in scopes.iter().zip(live) {
            let snapshot = live.copy();

            scope.remove_container(con)?;

            let (o, l) = Self::tombstones(con, scope, &snapshot);
            owned.extend(o);
            listed.extend(l);
            endpoints.push(Arc::new(snapshot));
        }

        self.remove_aliases(&owned, &listed, con);
        tracing::info!(container = %con.id(), name = %con.name(), "Unbound container");
        Ok(endpoints)
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    config: NetworkConfig,
    kv: Option<Arc<dyn KeyValueStore>>,
    link: Arc<dyn BridgeLink>,
    devices: Arc<dyn DeviceAdapter>,
    registry: Option<Arc<dyn ContainerRegistry>>,
}

impl ContextBuilder {
    /// Start from `config` with no persistence and an in-memory link.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            kv: None,
            link: Arc::new(NullLink::new()),
            devices: Arc::new(SlotAssigner::default()),
            registry: None,
        }
    }

    /// Persist scopes to `kv`.
    #[must_use]
    pub fn with_kv(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Put bridge gateways on `link`.
    #[must_use]
    pub fn with_bridge_link(mut self, link: Arc<dyn BridgeLink>) -> Self {
        self.link = link;
        self
    }

    /// Attach NICs through `devices`.
    #[must_use]
    pub fn with_device_adapter(mut self, devices: Arc<dyn DeviceAdapter>) -> Self {
        self.devices = devices;
        self
    }

    /// Look up live container handles in `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn ContainerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Install the builtin scopes and reload persisted ones.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or a builtin scope cannot
    /// be created. Persisted scopes that cannot be restored are skipped.
    pub async fn build(self) -> VesselResult<Context> {
        let Self {
            config,
            kv,
            link,
            devices,
            registry,
        } = self;

        config.validate()?;

        let mut state = ContextState {
            default_pool: AddressSpace::from_network(config.bridge_pool()),
            default_mask: config.bridge_width(),
            scopes: HashMap::new(),
            containers: HashMap::new(),
            aliases: HashMap::new(),
        };

        let bridge = config
            .container_networks
            .get(&config.bridge_network)
            .ok_or_else(|| {
                VesselError::invalid_config(format!(
                    "default bridge network {} not present in config",
                    config.bridge_network
                ))
            })?;
        let data = ScopeData {
            trust_level: bridge.trust_level,
            internal: bridge.internal,
            ..ScopeData::bridge(config.bridge_network.clone())
        };
        let default_scope = state
            .new_scope(&config, link.as_ref(), ScopeId::generate(), data)
            .await?;
        default_scope.set_builtin(true);

        for (name, network) in &config.container_networks {
            if *name == config.bridge_network {
                continue;
            }

            let data = ScopeData {
                scope_type: network.scope_type,
                name: name.clone(),
                subnet: network.subnet(),
                gateway: network.gateway.map(|gw| gw.addr()),
                dns: network.nameservers.clone(),
                trust_level: network.trust_level,
                pools: network.pools.clone(),
                internal: network.internal,
                ..ScopeData::default()
            };
            let scope = state
                .new_scope(&config, link.as_ref(), ScopeId::generate(), data)
                .await?;
            scope.set_builtin(true);
        }

        if let Some(kv) = &kv {
            Self::load_scopes(&mut state, &config, link.as_ref(), kv.as_ref()).await;
        }

        tracing::info!(
            pool = %config.bridge_pool(),
            mask = config.bridge_width(),
            scopes = state.scopes.len(),
            "Network context initialized"
        );

        Ok(Context {
            config,
            kv,
            link,
            devices,
            registry,
            default_scope,
            state: Mutex::new(state),
        })
    }

    async fn load_scopes(
        state: &mut ContextState,
        config: &NetworkConfig,
        link: &dyn BridgeLink,
        kv: &dyn KeyValueStore,
    ) {
        let values = match kv.list(SCOPE_KEY_PATTERN).await {
            Ok(values) => values,
            Err(e) if e.kind() == ErrorKind::KeyNotFound => return,
            Err(e) => {
                tracing::warn!(store = %kv.name(), error = %e, "Error listing scopes from key value store");
                return;
            }
        };

        let mut entries: Vec<(String, Vec<u8>)> = values.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, value) in entries {
            let record: ScopeRecord = match serde_json::from_slice(&value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Error loading scope data, skipping");
                    continue;
                }
            };

            let port_group = match record.scope_type {
                ScopeType::Bridge => &config.bridge_network,
                ScopeType::External => &record.name,
            };
            let Some(network) = config.port_groups.get(port_group).cloned() else {
                tracing::warn!(scope = %record.name, port_group = %port_group, "Skipping scope: port group not found");
                continue;
            };

            let scope = match state.add_scope(record.id.clone(), &record.to_scope_data(), network) {
                Ok(scope) => scope,
                Err(e) => {
                    tracing::warn!(scope = %record.name, error = %e, "Skipping scope");
                    continue;
                }
            };

            if scope.scope_type() == ScopeType::Bridge {
                add_gateway_addr(link, &scope).await;
            }
            tracing::debug!(scope = %scope.name(), id = %scope.id(), "Restored scope");
        }
    }
}

/// The network context.
pub struct Context {
    config: NetworkConfig,
    kv: Option<Arc<dyn KeyValueStore>>,
    link: Arc<dyn BridgeLink>,
    devices: Arc<dyn DeviceAdapter>,
    registry: Option<Arc<dyn ContainerRegistry>>,
    default_scope: Arc<Scope>,
    state: Mutex<ContextState>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("bridge_network", &self.config.bridge_network)
            .field("default_scope", &self.default_scope.name())
            .field("link", &self.link.name())
            .field("kv", &self.kv.as_ref().map(|kv| kv.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl Context {
    /// A builder starting from `config`.
    #[must_use]
    pub fn builder(config: NetworkConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    /// A context with default collaborators.
    ///
    /// # Errors
    ///
    /// Fails like [`ContextBuilder::build`].
    pub async fn new(config: NetworkConfig) -> VesselResult<Self> {
        ContextBuilder::new(config).build().await
    }

    /// The configuration the context was built from.
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The builtin default bridge scope.
    #[must_use]
    pub const fn default_scope(&self) -> &Arc<Scope> {
        &self.default_scope
    }

    pub(crate) fn registry(&self) -> Option<&Arc<dyn ContainerRegistry>> {
        self.registry.as_ref()
    }

    /// Create and persist a scope.
    ///
    /// # Errors
    ///
    /// Returns the validation or allocation error, or the persistence
    /// error after undoing the creation.
    pub async fn new_scope(&self, cancel: &CancellationToken, data: ScopeData) -> VesselResult<Arc<Scope>> {
        let mut state = self.state.lock().await;

        let scope = state
            .new_scope(&self.config, self.link.as_ref(), ScopeId::generate(), data)
            .await?;
        tracing::debug!(scope = %scope.name(), id = %scope.id(), "New scope created");

        if let Some(kv) = &self.kv {
            let persisted = match serde_json::to_vec(&scope.record()) {
                Ok(value) => kv_put(kv.as_ref(), cancel, &scope_key(scope.name()), &value).await,
                Err(e) => Err(e.into()),
            };

            if let Err(e) = persisted {
                tracing::warn!(scope = %scope.name(), error = %e, "Failed to persist scope, rolling back");
                state.teardown_scope(self.link.as_ref(), &scope).await;
                return Err(e);
            }
        }

        tracing::info!(
            scope = %scope.name(),
            scope_type = %scope.scope_type(),
            subnet = ?scope.subnet(),
            gateway = %scope.gateway(),
            "Created scope"
        );
        Ok(scope)
    }

    /// Look up scopes.
    ///
    /// `None` lists every scope and `default` names the default bridge
    /// scope; anything else is an exact name, then an ID prefix. Endpoints
    /// on dynamic scopes are refreshed from live handles before returning.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when nothing matches.
    pub async fn scopes(&self, id_or_name: Option<&str>) -> VesselResult<Vec<Arc<Scope>>> {
        let state = self.state.lock().await;
        let scopes = state.find_scopes(&self.default_scope, id_or_name)?;

        if let Some(registry) = &self.registry {
            let mut containers: HashMap<ContainerId, Arc<Container>> = HashMap::new();
            for scope in scopes.iter().filter(|s| s.is_dynamic()) {
                for con in scope.containers() {
                    containers.insert(con.id().clone(), con);
                }
            }

            for con in containers.values() {
                let Some(handle) = registry.get_container(con.id()).await else {
                    continue;
                };
                if let Err(e) = con.refresh(&handle) {
                    tracing::warn!(container = %con.id(), error = %e, "Failed to refresh endpoints");
                }
            }
        }

        Ok(scopes)
    }

    /// Delete a scope.
    ///
    /// # Errors
    ///
    /// Fails for builtin scopes, scopes with endpoints and unknown scopes,
    /// and when the persisted record cannot be removed.
    pub async fn delete_scope(&self, cancel: &CancellationToken, name: &str) -> VesselResult<()> {
        let mut state = self.state.lock().await;
        let scope = state.resolve_scope(&self.default_scope, name)?;

        if scope.builtin() {
            return Err(VesselError::policy(format!(
                "cannot remove builtin scope {}",
                scope.name()
            )));
        }

        if !scope.endpoints().is_empty() {
            return Err(VesselError::state_conflict(format!(
                "{} has active endpoints",
                scope.name()
            )));
        }

        if let Some(kv) = &self.kv {
            match kv_delete(kv.as_ref(), cancel, &scope_key(scope.name())).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::KeyNotFound => {}
                Err(e) => return Err(e),
            }
        }

        state.teardown_scope(self.link.as_ref(), &scope).await;
        tracing::info!(scope = %scope.name(), id = %scope.id(), "Deleted scope");
        Ok(())
    }

    /// Declare that the container in `handle` should join a scope.
    ///
    /// Only the handle is annotated; nothing is bound.
    ///
    /// # Errors
    ///
    /// Returns `PolicyViolation` for a second external scope or ports the
    /// scope's trust level forbids, and any NIC attachment error.
    pub async fn add_container(&self, handle: &mut Handle, options: &AddContainerOptions) -> VesselResult<()> {
        let state = self.state.lock().await;
        let scope = state.resolve_scope(&self.default_scope, &options.scope)?;

        if handle.exec_config.networks.contains_key(scope.name()) {
            return Ok(());
        }

        if scope.scope_type() == ScopeType::External {
            let has_external = handle.exec_config.networks.keys().any(|name| {
                state
                    .resolve_scope(&self.default_scope, name)
                    .is_ok_and(|s| s.scope_type() == ScopeType::External)
            });
            if has_external {
                return Err(VesselError::policy(
                    "container can only be added to at most one mapped network",
                ));
            }

            Self::check_port_policy(&scope, &options.ports)?;
        }

        for spec in &options.ports {
            Port::parse_spec(spec)?;
        }

        let mut slot = 0;
        if scope.scope_type() == ScopeType::Bridge {
            for ne in handle.exec_config.networks.values() {
                let sc = state.resolve_scope(&self.default_scope, &ne.network.name)?;
                if sc.scope_type() == ScopeType::Bridge && ne.slot() != 0 {
                    slot = ne.slot();
                    break;
                }
            }
        }

        if slot == 0 {
            slot = self.devices.add_nic(handle, &scope).await?.slot;
        }

        let static_ip = options.ip.filter(|ip| !ip.is_unspecified());
        let prefix = scope.subnet().map_or(32, |s| s.prefix_len());
        let ne = NetworkEndpoint {
            id: slot.to_string(),
            is_static: static_ip.is_some(),
            ip: static_ip.and_then(|ip| Ipv4Net::new(ip, prefix).ok()),
            network: ContainerNetwork {
                name: scope.name().to_string(),
                aliases: options.aliases.clone(),
                scope_type: scope.scope_type(),
                trust_level: scope.trust_level(),
                pools: scope.pools(),
                ..ContainerNetwork::default()
            },
            ports: options.ports.clone(),
            ..NetworkEndpoint::default()
        };

        tracing::debug!(container = %handle.id(), scope = %scope.name(), slot, "Added container to scope");
        handle
            .exec_config
            .networks
            .insert(scope.name().to_string(), ne);
        Ok(())
    }

    fn check_port_policy(scope: &Scope, ports: &[String]) -> VesselResult<()> {
        if ports.is_empty() {
            return Ok(());
        }

        let trust = scope.trust_level();
        if !trust.allows_publishing() {
            let err = VesselError::policy(format!(
                "ports cannot be published via container network {} (firewall configured as either \"closed\" or \"outbound\")",
                scope.name()
            ));
            tracing::error!(scope = %scope.name(), trust = %trust, "{}", err);
            return Err(err);
        }

        for spec in ports {
            if spec.contains(':') {
                if spec.contains('-') {
                    let err = VesselError::policy(format!(
                        "ports published on external networks cannot include both a redirect and a range ({})",
                        spec
                    ));
                    tracing::error!(scope = %scope.name(), port = %spec, "{}", err);
                    return Err(err);
                }
            } else if trust == TrustLevel::Peers {
                let err = VesselError::policy(format!(
                    "ports published via container network {} must specify a mapping (firewall configured for \"peers\")",
                    scope.name()
                ));
                tracing::error!(scope = %scope.name(), port = %spec, "{}", err);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Undo [`Context::add_container`] for one scope.
    ///
    /// # Errors
    ///
    /// Returns `StateConflict` while the container is bound, and `NotFound`
    /// when the scope is unknown or the container is not part of it.
    pub async fn remove_container(&self, handle: &mut Handle, scope: &str) -> VesselResult<()> {
        let state = self.state.lock().await;

        if state.bound(handle.id()).is_some() {
            return Err(VesselError::state_conflict(format!(
                "container {} is bound",
                handle.id()
            )));
        }

        let scope = state.resolve_scope(&self.default_scope, scope)?;
        let ne = handle
            .exec_config
            .networks
            .get(scope.name())
            .ok_or_else(|| {
                VesselError::not_found(format!(
                    "container {} in network {}",
                    handle.id(),
                    scope.name()
                ))
            })?;

        let slot = ne.id.clone();
        let shared = handle
            .exec_config
            .networks
            .iter()
            .any(|(name, other)| name != scope.name() && other.id == slot);

        if !shared {
            let slot = ne.slot();
            self.devices.remove_nic(handle, &scope, slot).await?;
        }

        handle.exec_config.networks.remove(scope.name());
        tracing::debug!(container = %handle.id(), scope = %scope.name(), "Removed container from scope");
        Ok(())
    }

    /// Bind the container in `handle` to every scope it declares.
    ///
    /// Resolved addressing is written back onto the handle's descriptors.
    /// Binding an already bound container returns its endpoints.
    ///
    /// # Errors
    ///
    /// Returns the first failure after undoing any partial binding;
    /// `Cancelled` when `cancel` fires.
    pub async fn bind_container(&self, cancel: &CancellationToken, handle: &mut Handle) -> VesselResult<Vec<Arc<Endpoint>>> {
        let mut state = self.state.lock().await;
        state.bind(handle, cancel)
    }

    /// Unbind the container in `handle` and clear its assigned addresses.
    ///
    /// Returns snapshots of the removed endpoints; an unbound container
    /// yields none.
    ///
    /// # Errors
    ///
    /// Returns the scope removal error.
    pub async fn unbind_container(&self, handle: &mut Handle) -> VesselResult<Vec<Arc<Endpoint>>> {
        let mut state = self.state.lock().await;

        let Some(con) = state.bound(handle.id()) else {
            tracing::debug!(container = %handle.id(), "Container not bound");
            return Ok(Vec::new());
        };

        // descriptors added after binding have no endpoint yet
        let scopes = con.scopes();
        let endpoints = state.unbind(&con, &scopes)?;
        for ne in handle.exec_config.networks.values_mut() {
            ne.assigned.ip = Ipv4Addr::UNSPECIFIED;
        }
        Ok(endpoints)
    }

    /// Unbind a container known only by ID; its handle is left alone.
    ///
    /// # Errors
    ///
    /// Returns the scope removal error.
    pub async fn remove_id_from_scopes(&self, id: &ContainerId) -> VesselResult<Vec<Arc<Endpoint>>> {
        let mut state = self.state.lock().await;

        let Some(con) = state.bound(id) else {
            return Ok(Vec::new());
        };

        let scopes: Vec<Arc<Scope>> = con.scopes();
        state.unbind(&con, &scopes)
    }

    /// A bound container by long ID, short ID or name.
    pub async fn container(&self, key: &str) -> Option<Arc<Container>> {
        tracing::debug!(key, "Container lookup");
        self.state.lock().await.containers.get(key).cloned()
    }

    /// Containers reachable under a scoped alias name.
    pub async fn containers_by_alias(&self, alias: &str) -> Vec<Arc<Container>> {
        self.state
            .lock()
            .await
            .aliases
            .get(alias)
            .cloned()
            .unwrap_or_default()
    }

    /// The endpoint holding `addr` on any scope.
    pub async fn container_by_addr(&self, addr: Ipv4Addr) -> Option<Arc<Endpoint>> {
        let state = self.state.lock().await;
        state.scopes.values().find_map(|s| s.container_by_addr(addr))
    }

    /// Recreate scopes named by existing containers and bind the running
    /// ones, all under one lock.
    pub(crate) async fn replay(&self, cancel: &CancellationToken, handles: &mut [Handle]) -> VesselResult<()> {
        let mut state = self.state.lock().await;

        for handle in handles.iter_mut() {
            tracing::debug!(container = %handle.id(), "Replaying container");

            for (name, ne) in &handle.exec_config.networks {
                if state.scopes.contains_key(name) {
                    continue;
                }

                tracing::debug!(scope = %name, "Adding scope from container network");
                let data = ScopeData {
                    scope_type: ne.network.scope_type,
                    name: name.clone(),
                    subnet: ne.network.gateway.map(|gw| gw.trunc()),
                    gateway: ne.network.gateway.map(|gw| gw.addr()),
                    dns: ne.network.nameservers.clone(),
                    pools: ne.network.pools.iter().map(ToString::to_string).collect(),
                    ..ScopeData::default()
                };
                state
                    .new_scope(&self.config, self.link.as_ref(), ScopeId::generate(), data)
                    .await?;
            }

            if handle.runtime.power_state == crate::exec::PowerState::PoweredOn {
                state.bind(handle, cancel)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn reserve_gateway_rejects_unroutable() {
        let subnet = net("10.0.0.0/24");
        let mut spaces = vec![AddressSpace::from_network(subnet)];
        for bad in ["10.0.0.0", "10.0.0.255", "10.0.1.1"] {
            let err = reserve_gateway(ip(bad), &subnet, &mut spaces).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::OutOfRange);
        }
        assert_eq!(reserve_gateway(ip("10.0.0.254"), &subnet, &mut spaces).unwrap(), ip("10.0.0.254"));
    }

    #[test]
    fn reserve_gateway_picks_first_free() {
        let subnet = net("10.0.0.0/24");
        let mut spaces = vec![AddressSpace::from_network(subnet)];
        spaces[0].reserve_ip4(ip("10.0.0.0")).unwrap();
        assert_eq!(
            reserve_gateway(Ipv4Addr::UNSPECIFIED, &subnet, &mut spaces).unwrap(),
            ip("10.0.0.1")
        );

        // without the all-zeros reservation the picked address is unroutable
        let mut spaces = vec![AddressSpace::from_network(subnet)];
        assert!(reserve_gateway(Ipv4Addr::UNSPECIFIED, &subnet, &mut spaces).is_err());
    }

    #[test]
    fn carve_reserves_boundaries_dns_and_gateway() {
        let subnet = net("10.0.0.0/24");
        let data = ScopeData::bridge("s").with_subnet(subnet).with_dns(ip("10.0.0.53"));
        let addressing = carve(&AddressSpace::from_network(subnet), subnet, &data, &[]).unwrap();

        assert_eq!(addressing.gateway, ip("10.0.0.1"));
        assert!(addressing.parent_space.is_none());
        let mut pool = addressing.spaces[0].clone();
        for taken in ["10.0.0.0", "10.0.0.1", "10.0.0.53", "10.0.0.255"] {
            assert!(pool.reserve_ip4(ip(taken)).is_err(), "{} should be reserved", taken);
        }
        assert_eq!(pool.reserve_next_ip4().unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn carve_with_pools_keeps_subnet_space() {
        let subnet = net("10.0.0.0/16");
        let data = ScopeData::external("ext")
            .with_subnet(subnet)
            .with_gateway(ip("10.0.0.1"));
        let pools = vec![Range::parse("10.0.1.0/24").unwrap(), Range::parse("10.0.2.10-20").unwrap()];
        let addressing = carve(&AddressSpace::from_network(subnet), subnet, &data, &pools).unwrap();

        assert_eq!(addressing.spaces.len(), 2);
        assert_eq!(addressing.gateway, ip("10.0.0.1"));
        let parent = addressing.parent_space.unwrap();
        assert_eq!(addressing.spaces[0].parent(), Some(parent.id()));
    }

    #[test]
    fn carve_rejects_bad_pools() {
        let subnet = net("10.0.0.0/24");
        let data = ScopeData::external("ext").with_subnet(subnet).with_gateway(ip("10.0.0.1"));
        let space = AddressSpace::from_network(subnet);

        let outside = vec![Range::parse("10.0.1.0/28").unwrap()];
        let err = carve(&space, subnet, &data, &outside).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let overlapping = vec![
            Range::parse("10.0.0.0/28").unwrap(),
            Range::parse("10.0.0.8-10.0.0.20").unwrap(),
        ];
        let err = carve(&space, subnet, &data, &overlapping).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OverlappingAllocation);
    }

    #[test]
    fn scope_keys() {
        assert_eq!(scope_key("bridge1"), "context.scopes.bridge1");
        let re = regex::Regex::new(SCOPE_KEY_PATTERN).unwrap();
        assert!(re.is_match("context.scopes.bridge1"));
        assert!(!re.is_match("context.scopes."));
    }
}
