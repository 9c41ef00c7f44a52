//! Session directory layout.
//!
//! Every run of the harness works inside one session root containing a
//! fixed set of subdirectories: generated router configs, process logs,
//! the shared events directory for marker files, and per-run results.

use std::io;
use std::path::{Path, PathBuf};

/// Path set shared by every node in one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub results: PathBuf,
    pub config: PathBuf,
    pub log: PathBuf,
    pub events: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            results: root.join("results"),
            config: root.join("config"),
            log: root.join("log"),
            events: root.join("events"),
            root,
        }
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [&self.results, &self.config, &self.log, &self.events] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Per-node setup directory holding the persisted command line and
    /// environment for that node.
    pub fn setup_dir(&self, node_name: &str) -> PathBuf {
        self.results.join("setup").join(node_name)
    }

    pub fn config_file(&self, router_name: &str) -> PathBuf {
        self.config.join(format!("{router_name}.conf"))
    }

    pub fn log_file(&self, node_name: &str) -> PathBuf {
        self.log.join(format!("{node_name}.log"))
    }
}

/// Create an existence-only marker file in `dir`.
pub fn write_marker(dir: &Path, name: &str) -> io::Result<()> {
    std::fs::File::create(dir.join(name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_the_root() {
        let paths = SessionPaths::new("/tmp/skein_session");
        assert_eq!(paths.config_file("A"), PathBuf::from("/tmp/skein_session/config/A.conf"));
        assert_eq!(paths.log_file("A"), PathBuf::from("/tmp/skein_session/log/A.log"));
        assert!(paths.setup_dir("A").starts_with(&paths.results));
    }
}
