//! Bridge link address management.
//!
//! Bridge scopes put their gateway address on the host bridge interface so
//! containers behind the bridge can route through it.

use std::collections::BTreeSet;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tokio::process::Command;

use vessel_common::{AddrErrorKind, VesselError, VesselResult};

/// Interface carrying bridge scope gateways.
#[async_trait]
pub trait BridgeLink: Send + Sync {
    /// Add `addr` to the link.
    ///
    /// Fails with [`AddrErrorKind::Exists`] when the address is present.
    async fn addr_add(&self, addr: Ipv4Net) -> VesselResult<()>;

    /// Remove `addr` from the link.
    ///
    /// Fails with [`AddrErrorKind::NotAvailable`] when the address is absent.
    async fn addr_del(&self, addr: Ipv4Net) -> VesselResult<()>;

    /// Interface name.
    fn name(&self) -> &str;
}

/// Link managed through the `ip` command.
#[derive(Debug, Clone)]
pub struct IpCommandLink {
    name: String,
}

impl IpCommandLink {
    /// Manage the interface `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    async fn addr(&self, op: &str, addr: Ipv4Net) -> VesselResult<()> {
        let cidr = addr.to_string();
        tracing::debug!(link = %self.name, op, addr = %cidr, "Updating bridge address");

        let output = Command::new("ip")
            .args(["addr", op, &cidr, "dev", &self.name])
            .output()
            .await
            .map_err(|e| VesselError::LinkAddress {
                kind: AddrErrorKind::Other,
                message: format!("Failed to execute ip addr {}: {}", op, e),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(VesselError::LinkAddress {
            kind: classify(&stderr),
            message: format!(
                "ip addr {} {} dev {} failed: {}",
                op,
                cidr,
                self.name,
                stderr.trim()
            ),
        })
    }
}

/// Map `ip` diagnostics onto the errno they report.
fn classify(stderr: &str) -> AddrErrorKind {
    if stderr.contains("File exists") {
        AddrErrorKind::Exists
    } else if stderr.contains("Cannot assign requested address") {
        AddrErrorKind::NotAvailable
    } else {
        AddrErrorKind::Other
    }
}

#[async_trait]
impl BridgeLink for IpCommandLink {
    async fn addr_add(&self, addr: Ipv4Net) -> VesselResult<()> {
        self.addr("add", addr).await
    }

    async fn addr_del(&self, addr: Ipv4Net) -> VesselResult<()> {
        self.addr("del", addr).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Link that only records addresses in memory.
#[derive(Debug, Default)]
pub struct NullLink {
    addrs: Mutex<BTreeSet<Ipv4Net>>,
}

impl NullLink {
    /// A link with no addresses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses currently on the link.
    #[must_use]
    pub fn addrs(&self) -> Vec<Ipv4Net> {
        self.addrs.lock().iter().copied().collect()
    }
}

#[async_trait]
impl BridgeLink for NullLink {
    async fn addr_add(&self, addr: Ipv4Net) -> VesselResult<()> {
        if !self.addrs.lock().insert(addr) {
            return Err(VesselError::LinkAddress {
                kind: AddrErrorKind::Exists,
                message: format!("address {} already on link", addr),
            });
        }
        Ok(())
    }

    async fn addr_del(&self, addr: Ipv4Net) -> VesselResult<()> {
        if !self.addrs.lock().remove(&addr) {
            return Err(VesselError::LinkAddress {
                kind: AddrErrorKind::NotAvailable,
                message: format!("address {} not on link", addr),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}
