// src/catalog.rs
//
// Application catalog: descriptors, the three-way registry partition and
// the loaders that produce it.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigurationError;

/// Connector identifier of the built-in pass-through connector.
pub const PASS_THROUGH_CONNECTOR: &str = "default";

/// Longest idle timeout an application may declare, in seconds (one day).
pub const MAX_IDLE_TIMEOUT: u64 = 86_400;

/// Name of the manifest file inside a catalog directory.
pub const MANIFEST_FILE: &str = "catalog.yaml";

fn default_connector() -> String {
    PASS_THROUGH_CONNECTOR.to_string()
}

/// How the display and the broker reach an application.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Broker topic the application listens and publishes on.
    pub topic: String,
    /// Connector identifier, resolved through the connector registry.
    #[serde(default = "default_connector")]
    pub connector: String,
    /// Page the display loads when the application is on screen.
    pub display_url: String,
    /// Free-form tag forwarded to the display (e.g. `web`, `flash`).
    #[serde(default)]
    pub app_type: String,
    #[serde(default)]
    pub fullscreen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

/// One entry of the catalog. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct AppDescriptor {
    /// Short name, unique across the whole catalog.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    /// Seconds without interaction before the application may be replaced.
    pub idle_timeout: u64,
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl AppDescriptor {
    pub fn topic(&self) -> &str {
        &self.connection.topic
    }

    pub fn connector(&self) -> &str {
        &self.connection.connector
    }

    pub fn uses_pass_through(&self) -> bool {
        self.connection.connector == PASS_THROUGH_CONNECTOR
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Parameters as a map; a later duplicate name wins.
    pub fn parameter_map(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }
}

/// The catalog split into its three disjoint partitions.
///
/// Snapshots are shared as `Arc<AppRegistry>` and never mutated; a reload
/// produces a new registry with a higher `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppRegistry {
    version: u64,
    default: Arc<AppDescriptor>,
    running: Vec<Arc<AppDescriptor>>,
    available: Vec<Arc<AppDescriptor>>,
}

impl AppRegistry {
    pub fn new(
        default: AppDescriptor,
        running: Vec<AppDescriptor>,
        available: Vec<AppDescriptor>,
    ) -> Result<Self, ConfigurationError> {
        let mut seen = HashSet::new();
        for app in std::iter::once(&default).chain(&running).chain(&available) {
            if !seen.insert(app.id.clone()) {
                return Err(ConfigurationError::DuplicateId(app.id.clone()));
            }
            if app.idle_timeout > MAX_IDLE_TIMEOUT {
                return Err(ConfigurationError::InvalidSetting {
                    key: format!("{}.idle_timeout", app.id),
                    reason: format!("{} exceeds {} seconds", app.idle_timeout, MAX_IDLE_TIMEOUT),
                });
            }
        }
        Ok(Self {
            version: 0,
            default: Arc::new(default),
            running: running.into_iter().map(Arc::new).collect(),
            available: available.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn default_app(&self) -> &Arc<AppDescriptor> {
        &self.default
    }

    /// Selectable applications, in menu order.
    pub fn running(&self) -> &[Arc<AppDescriptor>] {
        &self.running
    }

    pub fn available(&self) -> &[Arc<AppDescriptor>] {
        &self.available
    }

    /// Zero-based menu lookup.
    pub fn running_at(&self, index: usize) -> Option<&Arc<AppDescriptor>> {
        self.running.get(index)
    }

    pub fn find(&self, id: &str) -> Option<&Arc<AppDescriptor>> {
        std::iter::once(&self.default)
            .chain(&self.running)
            .chain(&self.available)
            .find(|app| app.id == id)
    }

    /// Number of descriptors across all partitions (the default included).
    pub fn len(&self) -> usize {
        1 + self.running.len() + self.available.len()
    }
}

/// Produces a fresh registry, at startup and on every configuration reload.
pub trait CatalogLoader: Send + Sync {
    fn load(&self) -> Result<AppRegistry, ConfigurationError>;
}

/// Serves a fixed registry.
#[derive(Debug, Clone)]
pub struct StaticCatalogLoader {
    registry: AppRegistry,
}

impl StaticCatalogLoader {
    pub fn new(registry: AppRegistry) -> Self {
        Self { registry }
    }
}

impl CatalogLoader for StaticCatalogLoader {
    fn load(&self) -> Result<AppRegistry, ConfigurationError> {
        Ok(self.registry.clone())
    }
}

/// Which descriptor files go into which partition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CatalogManifest {
    pub default: String,
    #[serde(default)]
    pub running: Vec<String>,
    #[serde(default)]
    pub available: Vec<String>,
}

/// Reads `catalog.yaml` plus one `<id>.yaml` descriptor per application.
#[derive(Debug, Clone)]
pub struct DirCatalogLoader {
    dir: PathBuf,
}

impl DirCatalogLoader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigurationError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml_bw::from_str(&contents).map_err(|e| ConfigurationError::Parse {
            path: path.to_path_buf(),
            reason: format!("YAML parse error: {}", e),
        })
    }

    fn read_descriptor(&self, id: &str) -> Result<AppDescriptor, ConfigurationError> {
        let path = self.dir.join(format!("{id}.yaml"));
        let app: AppDescriptor = Self::read_yaml(&path)?;
        if app.id != id {
            return Err(ConfigurationError::Parse {
                path,
                reason: format!("descriptor declares id `{}`, expected `{}`", app.id, id),
            });
        }
        Ok(app)
    }
}

impl CatalogLoader for DirCatalogLoader {
    fn load(&self) -> Result<AppRegistry, ConfigurationError> {
        let manifest: CatalogManifest = Self::read_yaml(&self.dir.join(MANIFEST_FILE))?;
        if manifest.default.trim().is_empty() {
            return Err(ConfigurationError::MissingDefault);
        }

        info!("Loading application catalog from {}", self.dir.display());
        let default = self.read_descriptor(&manifest.default)?;
        let running = manifest
            .running
            .iter()
            .map(|id| self.read_descriptor(id))
            .collect::<Result<Vec<_>, _>>()?;
        let available = manifest
            .available
            .iter()
            .map(|id| self.read_descriptor(id))
            .collect::<Result<Vec<_>, _>>()?;

        let registry = AppRegistry::new(default, running, available)?;
        info!(
            "Catalog loaded: default `{}`, {} running, {} available",
            registry.default_app().id,
            registry.running().len(),
            registry.available().len()
        );
        Ok(registry)
    }
}
