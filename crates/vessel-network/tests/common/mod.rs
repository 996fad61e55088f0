//! Shared fixtures for the network context integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vessel_common::ContainerId;
use vessel_network::{
    Context, ContainerNetworkConfig, Handle, MemoryKeyValueStore, NetworkConfig, NullLink,
    PortGroup, ScopeData,
};

/// Default config plus port groups for the external networks used in tests.
pub fn config() -> NetworkConfig {
    NetworkConfig::default()
        .with_port_group("ext", PortGroup::new("dvportgroup-ext"))
        .with_port_group("ext2", PortGroup::new("dvportgroup-ext2"))
        .with_port_group("public", PortGroup::new("dvportgroup-public"))
}

/// Config with a builtin external network named `public`.
pub fn config_with_public() -> NetworkConfig {
    config().with_container_network(
        "public",
        ContainerNetworkConfig::external("192.168.100.1/24".parse().unwrap())
            .with_nameserver("192.168.100.53".parse().unwrap()),
    )
}

pub struct Fixture {
    pub ctx: Arc<Context>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub link: Arc<NullLink>,
}

pub async fn fixture() -> Fixture {
    fixture_with(config()).await
}

pub async fn fixture_with(config: NetworkConfig) -> Fixture {
    let kv = Arc::new(MemoryKeyValueStore::new("test"));
    let link = Arc::new(NullLink::new());
    let ctx = Context::builder(config)
        .with_kv(kv.clone())
        .with_bridge_link(link.clone())
        .build()
        .await
        .unwrap();
    Fixture {
        ctx: Arc::new(ctx),
        kv,
        link,
    }
}

pub fn handle(name: &str) -> Handle {
    Handle::new(ContainerId::generate(), name)
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Bridge scope on 10.20.0.0/24 with gateway 10.20.0.1.
pub fn small_bridge(name: &str) -> ScopeData {
    ScopeData::bridge(name)
        .with_subnet("10.20.0.0/24".parse().unwrap())
        .with_gateway("10.20.0.1".parse().unwrap())
}
