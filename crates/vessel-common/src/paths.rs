//! Standard filesystem paths for Vessel.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Vessel data.
pub static VESSEL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VESSEL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/vessel"))
});

/// Default configuration directory for Vessel.
pub static VESSEL_CONFIG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VESSEL_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::config_dir()
                .map(|d| d.join("vessel"))
                .unwrap_or_else(|| PathBuf::from("/etc/vessel"))
        })
});

/// Standard paths used by the network control plane.
#[derive(Debug, Clone)]
pub struct VesselPaths {
    /// Root data directory (default: /var/lib/vessel).
    pub root: PathBuf,
    /// Configuration directory.
    pub config: PathBuf,
}

impl VesselPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config = root.join("etc");
        Self { root, config }
    }

    /// Network configuration file.
    #[must_use]
    pub fn network_config(&self) -> PathBuf {
        self.config.join("network.toml")
    }

    /// Directory for key-value store files.
    #[must_use]
    pub fn kv_dir(&self) -> PathBuf {
        self.root.join("kv")
    }

    /// Backing file of a named key-value store.
    #[must_use]
    pub fn kv_store(&self, name: &str) -> PathBuf {
        self.kv_dir().join(format!("{}.dat", name))
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.config)?;
        std::fs::create_dir_all(self.kv_dir())?;
        Ok(())
    }
}

impl Default for VesselPaths {
    fn default() -> Self {
        Self {
            root: VESSEL_ROOT.clone(),
            config: VESSEL_CONFIG_DIR.clone(),
        }
    }
}
