//! Bound containers.

use std::sync::Arc;

use parking_lot::Mutex;

use vessel_common::{ContainerId, VesselResult};

use crate::endpoint::Endpoint;
use crate::exec::Handle;
use crate::scope::Scope;

/// A container bound to one or more scopes.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    name: String,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
}

impl Container {
    /// A container with no endpoints yet.
    #[must_use]
    pub fn new(id: ContainerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoints in bind order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.lock().clone()
    }

    /// The endpoint on `scope`, if bound there.
    #[must_use]
    pub fn endpoint(&self, scope: &Scope) -> Option<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .iter()
            .find(|e| e.scope_id() == scope.id())
            .cloned()
    }

    /// Scopes this container is bound to.
    #[must_use]
    pub fn scopes(&self) -> Vec<Arc<Scope>> {
        self.endpoints
            .lock()
            .iter()
            .filter_map(|e| e.scope())
            .collect()
    }

    pub(crate) fn add_endpoint(&self, e: Arc<Endpoint>) {
        self.endpoints.lock().push(e);
    }

    pub(crate) fn remove_endpoint(&self, e: &Arc<Endpoint>) {
        self.endpoints.lock().retain(|other| !Arc::ptr_eq(other, e));
    }

    /// Refresh every endpoint from the container's live handle.
    ///
    /// # Errors
    ///
    /// Returns the first endpoint refresh failure.
    pub fn refresh(&self, handle: &Handle) -> VesselResult<()> {
        for e in self.endpoints() {
            e.refresh(handle)?;
        }
        Ok(())
    }
}
