//! Container handles and the collaborators that own them.
//!
//! A [`Handle`] is the mutable, uncommitted view of a container's runtime
//! configuration. The context annotates it with network descriptors and
//! pending device changes; the [`ContainerRegistry`] stores it on commit.
//! NIC attachment is delegated to a [`DeviceAdapter`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use vessel_common::{ContainerId, VesselError, VesselResult};

use crate::config::PortGroup;
use crate::ip::Range;
use crate::scope::{Scope, ScopeType, TrustLevel};

/// Power state of a container VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Running.
    PoweredOn,
    /// Stopped.
    #[default]
    PoweredOff,
    /// Suspended.
    Suspended,
}

/// Addressing reported back by the infrastructure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assigned {
    /// Address in use; unspecified when unassigned.
    pub ip: Ipv4Addr,
    /// Gateway with the network's prefix length.
    pub gateway: Option<Ipv4Net>,
    /// Nameservers in use.
    pub nameservers: Vec<Ipv4Addr>,
}

impl Default for Assigned {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            gateway: None,
            nameservers: Vec::new(),
        }
    }
}

/// Network settings of a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNetwork {
    /// Scope name.
    pub name: String,
    /// Requested alias specs, `[peer]:name`.
    pub aliases: Vec<String>,
    /// Scope type.
    pub scope_type: ScopeType,
    /// Firewall policy of the scope.
    pub trust_level: TrustLevel,
    /// Pools the scope allocates from.
    pub pools: Vec<Range>,
    /// Gateway with the network's prefix length.
    pub gateway: Option<Ipv4Net>,
    /// Nameservers.
    pub nameservers: Vec<Ipv4Addr>,
    /// Whether this network carries the default route.
    pub default: bool,
}

/// A container's desired attachment to one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    /// PCI slot of the NIC, as a decimal string.
    pub id: String,
    /// Whether `ip` was supplied by the caller.
    pub is_static: bool,
    /// Desired or resolved address with the network's prefix length.
    pub ip: Option<Ipv4Net>,
    /// Network settings.
    pub network: ContainerNetwork,
    /// Port specs.
    pub ports: Vec<String>,
    /// Whether the scope is internal.
    pub internal: bool,
    /// Addressing reported by the infrastructure.
    pub assigned: Assigned,
}

impl NetworkEndpoint {
    /// The NIC slot; zero when unset or malformed.
    #[must_use]
    pub fn slot(&self) -> i32 {
        self.id.parse().unwrap_or(0)
    }
}

/// Runtime configuration of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Container ID.
    pub id: ContainerId,
    /// Container name.
    pub name: String,
    /// Network descriptors keyed by scope name.
    pub networks: BTreeMap<String, NetworkEndpoint>,
}

/// Runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    /// Power state.
    pub power_state: PowerState,
}

/// Kind of device change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceOperation {
    /// Attach the device.
    Add,
    /// Detach the device.
    Remove,
}

/// A virtual NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    /// PCI slot number.
    pub slot: i32,
    /// Label, the scope name.
    pub label: String,
    /// Port group backing the NIC.
    pub backing: PortGroup,
}

/// A device change applied when the handle is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    /// Operation.
    pub operation: DeviceOperation,
    /// Device.
    pub device: VirtualDevice,
}

/// Mutable view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    /// Runtime configuration.
    pub exec_config: ExecConfig,
    /// Runtime state.
    pub runtime: Runtime,
    /// Device changes pending commit.
    pub device_changes: Vec<DeviceChange>,
}

impl Handle {
    /// A handle for a container with no networks.
    #[must_use]
    pub fn new(id: ContainerId, name: impl Into<String>) -> Self {
        Self {
            exec_config: ExecConfig {
                id,
                name: name.into(),
                networks: BTreeMap::new(),
            },
            runtime: Runtime::default(),
            device_changes: Vec::new(),
        }
    }

    /// Set the power state.
    #[must_use]
    pub const fn with_power_state(mut self, power_state: PowerState) -> Self {
        self.runtime.power_state = power_state;
        self
    }

    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.exec_config.id
    }
}

/// Attaches and detaches NICs.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Attach a NIC backed by `scope`'s port group, returning the device.
    async fn add_nic(&self, handle: &mut Handle, scope: &Scope) -> VesselResult<VirtualDevice>;

    /// Schedule removal of the NIC in `slot`.
    async fn remove_nic(&self, handle: &mut Handle, scope: &Scope, slot: i32) -> VesselResult<()>;

    /// The port group backing NICs on `scope`.
    fn port_group_backing(&self, scope: &Scope) -> VesselResult<PortGroup>;
}

/// First PCI slot handed out to container NICs.
pub const DEFAULT_NIC_SLOT_BASE: i32 = 192;

/// Device adapter that records changes on the handle and assigns the
/// lowest free PCI slot.
#[derive(Debug, Clone)]
pub struct SlotAssigner {
    base: i32,
}

impl SlotAssigner {
    /// An assigner handing out slots from `base`.
    #[must_use]
    pub const fn new(base: i32) -> Self {
        Self { base }
    }

    fn used_slots(handle: &Handle) -> BTreeSet<i32> {
        let mut used: BTreeSet<i32> = handle
            .exec_config
            .networks
            .values()
            .map(NetworkEndpoint::slot)
            .filter(|slot| *slot != 0)
            .collect();
        used.extend(
            handle
                .device_changes
                .iter()
                .filter(|c| c.operation == DeviceOperation::Add)
                .map(|c| c.device.slot),
        );
        used
    }
}

impl Default for SlotAssigner {
    fn default() -> Self {
        Self::new(DEFAULT_NIC_SLOT_BASE)
    }
}

#[async_trait]
impl DeviceAdapter for SlotAssigner {
    async fn add_nic(&self, handle: &mut Handle, scope: &Scope) -> VesselResult<VirtualDevice> {
        let backing = self.port_group_backing(scope)?;

        // a pending add on the same port group is reused
        if let Some(change) = handle
            .device_changes
            .iter()
            .find(|c| c.operation == DeviceOperation::Add && c.device.backing == backing)
        {
            return Ok(change.device.clone());
        }

        let used = Self::used_slots(handle);
        let slot = (self.base..)
            .find(|slot| !used.contains(slot))
            .ok_or_else(|| VesselError::ExhaustedPool {
                message: "no free PCI slot".to_string(),
            })?;

        let device = VirtualDevice {
            slot,
            label: scope.name().to_string(),
            backing,
        };
        tracing::debug!(container = %handle.id(), scope = %scope.name(), slot, "Adding NIC");
        handle.device_changes.push(DeviceChange {
            operation: DeviceOperation::Add,
            device: device.clone(),
        });
        Ok(device)
    }

    async fn remove_nic(&self, handle: &mut Handle, scope: &Scope, slot: i32) -> VesselResult<()> {
        let backing = self.port_group_backing(scope)?;
        tracing::debug!(container = %handle.id(), scope = %scope.name(), slot, "Removing NIC");
        handle.device_changes.push(DeviceChange {
            operation: DeviceOperation::Remove,
            device: VirtualDevice {
                slot,
                label: scope.name().to_string(),
                backing,
            },
        });
        Ok(())
    }

    fn port_group_backing(&self, scope: &Scope) -> VesselResult<PortGroup> {
        scope
            .network()
            .ok_or_else(|| VesselError::not_found(format!("port group of scope {}", scope.name())))
    }
}

/// Source of container handles.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// A fresh handle for the container, if it exists.
    async fn get_container(&self, id: &ContainerId) -> Option<Handle>;

    /// Handles for every known container.
    async fn containers(&self) -> Vec<Handle>;

    /// Store the handle's changes.
    async fn commit(&self, handle: Handle) -> VesselResult<()>;
}

/// In-memory container registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    handles: RwLock<HashMap<ContainerId, Handle>>,
}

impl MemoryRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a container.
    pub fn insert(&self, handle: Handle) {
        self.handles.write().insert(handle.id().clone(), handle);
    }

    /// Forget a container.
    pub fn remove(&self, id: &ContainerId) -> Option<Handle> {
        self.handles.write().remove(id)
    }

    /// Change a container's power state.
    pub fn set_power_state(&self, id: &ContainerId, power_state: PowerState) {
        if let Some(handle) = self.handles.write().get_mut(id) {
            handle.runtime.power_state = power_state;
        }
    }
}

#[async_trait]
impl ContainerRegistry for MemoryRegistry {
    async fn get_container(&self, id: &ContainerId) -> Option<Handle> {
        self.handles.read().get(id).cloned()
    }

    async fn containers(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.handles.read().values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    async fn commit(&self, mut handle: Handle) -> VesselResult<()> {
        let mut handles = self.handles.write();
        if !handles.contains_key(handle.id()) {
            return Err(VesselError::not_found(format!("container {}", handle.id())));
        }

        // pending device changes are applied by the commit
        handle.device_changes.clear();
        handles.insert(handle.id().clone(), handle);
        Ok(())
    }
}
