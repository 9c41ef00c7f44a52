//! Named router-installation descriptors.
//!
//! A `Version` pairs the install roots of a router build with the paths
//! derived from them: the daemon binary, the shared-library search path,
//! and the python-binding paths the router's management tooling needs.
//! Versions are immutable once registered and live for the lifetime of
//! the orchestrator. The first version registered becomes the default.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version {name}: install root {path} does not exist")]
    MissingRoot { name: String, path: PathBuf },
}

/// One installed router build.
#[derive(Debug, Clone)]
pub struct Version {
    name: String,
    router_root: PathBuf,
    runtime_root: PathBuf,
}

impl Version {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The router daemon binary under the install root.
    pub fn binary_path(&self) -> PathBuf {
        self.router_root.join("sbin/skrouterd")
    }

    /// Colon-joined LD_LIBRARY_PATH covering both install roots.
    pub fn ld_library_path(&self) -> String {
        format!(
            "{}:{}",
            self.router_root.join("lib").display(),
            self.runtime_root.join("lib64").display()
        )
    }

    /// Colon-joined PYTHONPATH for the router's management bindings.
    pub fn python_path(&self) -> String {
        format!(
            "{}:{}",
            self.router_root.join("lib/skrouter/python").display(),
            self.runtime_root.join("lib64/runtime/bindings/python").display()
        )
    }

    /// Include path handed to the router with `-I`.
    pub fn include_path(&self) -> PathBuf {
        self.router_root.join("lib/skrouter/python")
    }

    /// Static file root for the router's built-in web console.
    pub fn console_root(&self) -> PathBuf {
        self.router_root.join("share/skrouter/console")
    }
}

/// Insertion-ordered registry of router versions.
///
/// Registering a name twice replaces the earlier descriptor in place, so
/// lookup is last-registration-wins while the default (first-registered)
/// slot keeps its position.
#[derive(Debug, Default)]
pub struct VersionRegistry {
    versions: Vec<Version>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        router_root: impl Into<PathBuf>,
        runtime_root: impl Into<PathBuf>,
    ) -> Result<(), VersionError> {
        let router_root = router_root.into();
        let runtime_root = runtime_root.into();
        for root in [&router_root, &runtime_root] {
            if !root.exists() {
                return Err(VersionError::MissingRoot {
                    name: name.to_string(),
                    path: root.clone(),
                });
            }
        }

        let version = Version {
            name: name.to_string(),
            router_root,
            runtime_root,
        };
        info!(version = name, "registered router version");

        if let Some(slot) = self.versions.iter_mut().find(|v| v.name == name) {
            *slot = version;
        } else {
            self.versions.push(version);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.name == name)
    }

    /// The first version ever registered.
    pub fn default_version(&self) -> Option<&Version> {
        self.versions.first()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Convenience used by tests and the demo binary: fabricate an install
/// tree under `root` whose `sbin/skrouterd` is a copy of `stub`.
pub fn fabricate_install_root(root: &Path, stub: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root.join("sbin"))?;
    std::fs::copy(stub, root.join("sbin/skrouterd"))?;
    Ok(())
}
