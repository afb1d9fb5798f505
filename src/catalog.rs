//! The plugin catalog: static configuration describing how to launch or
//! reach each plugin, loaded from a JSON file at startup.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// How a plugin is reached: a locally launched binary, a locally launched
/// command line, or an already-running remote endpoint.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumString,
    AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PluginKind {
    #[default]
    Binary,
    Command,
    Remote,
}

/// One catalog entry. Immutable after load; unknown JSON fields are ignored
/// so older hosts keep reading newer catalogs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PluginDescriptor {
    #[serde(rename = "type", default)]
    pub kind: PluginKind,
    /// Executable path for local kinds. Relative paths resolve against the
    /// working directory the catalog was loaded from.
    #[serde(default, skip_serializing_if = "path_is_empty")]
    pub path: PathBuf,
    /// TCP port a local plugin must listen on.
    #[serde(default)]
    pub port: u16,
    /// Command template for `command` plugins. Must contain `{port}`; may
    /// contain `{path}` and `{args}`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// host:port of a `remote` plugin.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default)]
    pub description: String,
    /// Per-plugin parameter defaults; they beat the schema's own defaults.
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    #[serde(rename = "workdir", default)]
    pub working_dir: PathBuf,
    /// Extra environment entries appended to the inherited environment.
    #[serde(rename = "env", default)]
    pub environment: HashMap<String, String>,
}

fn path_is_empty(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

#[derive(Debug, Error, PartialEq)]
pub enum DescriptorError {
    #[error("path is required for {0} plugins")]
    MissingPath(PluginKind),

    #[error("invalid port for local plugin: {0}")]
    InvalidPort(u16),

    #[error("command is required for command plugins")]
    MissingCommand,

    #[error("command must contain the {{port}} placeholder")]
    MissingPortPlaceholder,

    #[error("address is required for remote plugins")]
    MissingAddress,
}

impl PluginDescriptor {
    /// Check the per-kind invariants. `Catalog::load` runs this for every
    /// entry; callers that build descriptors by hand should too.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        match self.kind {
            PluginKind::Binary | PluginKind::Command => {
                if self.path.as_os_str().is_empty() {
                    return Err(DescriptorError::MissingPath(self.kind));
                }
                if self.port == 0 {
                    return Err(DescriptorError::InvalidPort(self.port));
                }
            }
            PluginKind::Remote => {
                if self.address.is_empty() {
                    return Err(DescriptorError::MissingAddress);
                }
            }
        }

        if self.kind == PluginKind::Command {
            if self.command.is_empty() {
                return Err(DescriptorError::MissingCommand);
            }
            if !self.command.contains("{port}") {
                return Err(DescriptorError::MissingPortPlaceholder);
            }
        }

        Ok(())
    }

    pub fn is_local(&self) -> bool {
        self.kind != PluginKind::Remote
    }

    /// Where the host dials this plugin once it is up.
    pub fn dial_address(&self) -> String {
        match self.kind {
            PluginKind::Remote => self.address.clone(),
            _ => format!("localhost:{}", self.port),
        }
    }

    fn resolve(&mut self, root: &Path) {
        if !self.path.as_os_str().is_empty() && self.path.is_relative() {
            self.path = root.join(&self.path);
        }
        if !self.working_dir.as_os_str().is_empty() && self.working_dir.is_relative() {
            self.working_dir = root.join(&self.working_dir);
        }
        if self.working_dir.as_os_str().is_empty() && self.is_local() {
            if let Some(parent) = self.path.parent() {
                self.working_dir = parent.to_path_buf();
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse catalog file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to resolve the current working directory: {0}")]
    Workdir(std::io::Error),

    #[error("plugin {0:?} not found in catalog")]
    Unknown(String),

    #[error("invalid configuration for plugin {name:?}: {source}")]
    Descriptor {
        name: String,
        source: DescriptorError,
    },
}

/// Every plugin the host knows about. `{ "plugins": { name: descriptor } }`
/// on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Catalog {
    #[serde(default)]
    pub plugins: HashMap<String, PluginDescriptor>,
}

impl Catalog {
    pub fn new(plugins: HashMap<String, PluginDescriptor>) -> Self {
        Self { plugins }
    }

    /// Read, resolve and validate a catalog file. Relative paths resolve
    /// against the process's current working directory.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let data = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut catalog: Catalog = serde_json::from_str(&data)?;

        let root = env::current_dir().map_err(CatalogError::Workdir)?;
        for (name, descriptor) in catalog.plugins.iter_mut() {
            descriptor.resolve(&root);
            descriptor
                .validate()
                .map_err(|source| CatalogError::Descriptor {
                    name: name.clone(),
                    source,
                })?;
        }

        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Result<&PluginDescriptor, CatalogError> {
        self.plugins
            .get(name)
            .ok_or_else(|| CatalogError::Unknown(name.to_string()))
    }

    /// `(name, description)` pairs sorted by name, for `list`.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .plugins
            .iter()
            .map(|(name, d)| (name.clone(), d.description.clone()))
            .collect();
        entries.sort();
        entries
    }
}
