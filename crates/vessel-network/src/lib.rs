//! # vessel-network
//!
//! Network context for Vessel containers.
//!
//! This crate tracks the networks ("scopes") containers attach to, carves
//! their subnets out of a hierarchical IPv4 allocator, binds containers to
//! endpoints with addresses, ports and aliases, and persists scope
//! metadata to a key-value store so it survives restarts.

#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod container;
pub mod context;
pub mod endpoint;
pub mod events;
pub mod exec;
pub mod ip;
pub mod ipam;
pub mod kvstore;
pub mod port;
pub mod scope;

pub use bridge::{BridgeLink, IpCommandLink, NullLink};
pub use config::{ContainerNetworkConfig, NetworkConfig, PortGroup};
pub use container::Container;
pub use context::{AddContainerOptions, Context, ContextBuilder};
pub use endpoint::{Alias, Endpoint};
pub use events::{ContainerEvent, EventBus, EventKind, EventWorker, handle_event};
pub use exec::{
    ContainerRegistry, DeviceAdapter, Handle, MemoryRegistry, NetworkEndpoint, PowerState,
    SlotAssigner,
};
pub use ip::Range;
pub use ipam::AddressSpace;
pub use kvstore::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use port::{Port, Protocol};
pub use scope::{Scope, ScopeData, ScopeRecord, ScopeType, TrustLevel};
