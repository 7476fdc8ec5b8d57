//! Host routes for the virtual device.

use crate::MeshError;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Routing table change: `/32` host routes towards the virtual device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Address of the virtual device
    pub local_address: Ipv4Addr,
    /// Destinations routed through the device
    pub routes: Vec<Ipv4Addr>,
}

impl RouterConfig {
    /// Config with no routes.
    #[must_use]
    pub fn new(local_address: Ipv4Addr) -> Self {
        Self {
            local_address,
            routes: Vec::new(),
        }
    }
}

/// Route table of a virtual device.
pub trait Router: Send + Sync {
    /// Replace every route with `config.routes`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Route`] if a route cannot be installed.
    fn set(&self, config: RouterConfig) -> Result<(), MeshError>;

    /// Install `config.routes` in addition to the existing ones.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Route`] if a route cannot be installed.
    fn add(&self, config: RouterConfig) -> Result<(), MeshError>;
}

/// Router that only records its table. Used by tests and by devices that
/// route everything in the virtual subnet anyway.
#[derive(Debug, Default)]
pub struct MemoryRouter {
    table: Mutex<(Option<Ipv4Addr>, BTreeSet<Ipv4Addr>)>,
}

impl MemoryRouter {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed routes in address order.
    #[must_use]
    pub fn routes(&self) -> Vec<Ipv4Addr> {
        self.table
            .lock()
            .map(|t| t.1.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Device address from the last change.
    #[must_use]
    pub fn local_address(&self) -> Option<Ipv4Addr> {
        self.table.lock().ok().and_then(|t| t.0)
    }
}

impl Router for MemoryRouter {
    fn set(&self, config: RouterConfig) -> Result<(), MeshError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| MeshError::InvalidState("router lock poisoned"))?;
        table.0 = Some(config.local_address);
        table.1 = config.routes.into_iter().collect();
        Ok(())
    }

    fn add(&self, config: RouterConfig) -> Result<(), MeshError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| MeshError::InvalidState("router lock poisoned"))?;
        table.0 = Some(config.local_address);
        table.1.extend(config.routes);
        Ok(())
    }
}
