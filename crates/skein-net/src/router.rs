//! Router node model.
//!
//! The normal order of operations on a router is: create, connect to
//! other routers, init, run, halt. `init` writes the configuration file
//! the router process reads at startup, so connections made after a
//! router is already running will not take effect until it is
//! re-initialized and restarted.
//!
//! Every router gets a client-facing listener, so a client can always
//! attach to it. Interior routers additionally listen for other interior
//! routers and for edge routers; edge routers never accept either.

use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;

use tracing::debug;

use crate::paths::SessionPaths;
use crate::ports::allocate_port;
use crate::process::{
    LaunchSpec, ProcessSupervisor, StartError, SupervisorState, ROUTER_HALT_TIMEOUT,
};
use crate::topology::TopologyError;
use crate::version::Version;

/// Role of a router node within the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterRole {
    /// Forwards among other interior routers and attached edges.
    Interior,
    /// Connects upward to one interior router; hosts clients at the
    /// periphery.
    Edge,
}

impl RouterRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterRole::Interior => "interior",
            RouterRole::Edge => "edge",
        }
    }
}

/// Role a connector announces to the listener it dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorRole {
    InterRouter,
    Edge,
}

impl ConnectorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorRole::InterRouter => "inter-router",
            ConnectorRole::Edge => "edge",
        }
    }
}

/// One outbound connection in a router's config.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peer: String,
    pub port: u16,
    pub role: ConnectorRole,
}

/// One router process: identity, allocated ports, connection lists, and
/// the supervisor driving its OS process.
pub struct RouterNode {
    name: String,
    role: RouterRole,
    version: String,
    worker_threads: usize,
    client_port: u16,
    router_port: u16,
    edge_port: u16,
    console_port: u16,
    outbound: Vec<Connection>,
    inbound_interior: Vec<String>,
    inbound_edge: Vec<String>,
    config_file: Option<PathBuf>,
    initialized: bool,
    supervisor: ProcessSupervisor,
}

impl RouterNode {
    /// Create a router and allocate its four ports up front. The ports
    /// come from the probe-then-release allocator in [`crate::ports`],
    /// with the reuse race documented there.
    pub fn new(
        name: &str,
        role: RouterRole,
        version: &str,
        worker_threads: usize,
    ) -> io::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            role,
            version: version.to_string(),
            worker_threads,
            client_port: allocate_port()?,
            router_port: allocate_port()?,
            edge_port: allocate_port()?,
            console_port: allocate_port()?,
            outbound: Vec::new(),
            inbound_interior: Vec::new(),
            inbound_edge: Vec::new(),
            config_file: None,
            initialized: false,
            supervisor: ProcessSupervisor::new(ROUTER_HALT_TIMEOUT),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> RouterRole {
        self.role
    }

    pub fn is_interior(&self) -> bool {
        self.role == RouterRole::Interior
    }

    pub fn version_name(&self) -> &str {
        &self.version
    }

    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    pub fn router_port(&self) -> u16 {
        self.router_port
    }

    pub fn edge_port(&self) -> u16 {
        self.edge_port
    }

    pub fn console_port(&self) -> u16 {
        self.console_port
    }

    pub fn outbound(&self) -> &[Connection] {
        &self.outbound
    }

    /// Names of edge routers that connect to this router.
    pub fn attached_edges(&self) -> &[String] {
        &self.inbound_edge
    }

    /// All peers this router shares a link with, in either direction.
    /// Used by the undirected connectivity traversal.
    pub fn neighbor_names(&self) -> impl Iterator<Item = &str> {
        self.outbound
            .iter()
            .map(|c| c.peer.as_str())
            .chain(self.inbound_interior.iter().map(String::as_str))
            .chain(self.inbound_edge.iter().map(String::as_str))
    }

    /// Merged node state: the supervisor's state, with config-written
    /// tracked as Initialized.
    pub fn state(&self) -> SupervisorState {
        let state = self.supervisor.state();
        if state == SupervisorState::Uninitialized && self.initialized {
            SupervisorState::Initialized
        } else {
            state
        }
    }

    /// Handle to the node's supervisor, for fan-out halt tasks.
    pub fn supervisor(&self) -> ProcessSupervisor {
        self.supervisor.clone()
    }

    /// Wire a directional connection from `self` to `other`.
    ///
    /// An edge router can never accept a connection, so `other` must be
    /// interior. The destination port depends on this router's role: an
    /// edge router dials the interior's edge-acceptance port, an
    /// interior router dials the inter-router port. The connection is
    /// also recorded as inbound on `other` so the connectivity check can
    /// treat the graph as undirected.
    pub fn connect_to(&mut self, other: &mut RouterNode) -> Result<(), TopologyError> {
        if other.role == RouterRole::Edge {
            return Err(TopologyError::EdgeCannotAccept {
                from: self.name.clone(),
                to: other.name.clone(),
            });
        }

        let (port, role) = match self.role {
            RouterRole::Edge => (other.edge_port, ConnectorRole::Edge),
            RouterRole::Interior => (other.router_port, ConnectorRole::InterRouter),
        };

        self.outbound.push(Connection {
            peer: other.name.clone(),
            port,
            role,
        });
        match self.role {
            RouterRole::Edge => other.inbound_edge.push(self.name.clone()),
            RouterRole::Interior => other.inbound_interior.push(self.name.clone()),
        }
        debug!(
            from = %self.name,
            to = %other.name,
            port,
            role = role.as_str(),
            "connected routers"
        );
        Ok(())
    }

    /// Write this router's configuration file.
    ///
    /// A no-op once the router is running or halted. Below that, every
    /// call regenerates the file, so connections added after an earlier
    /// init are picked up.
    pub fn init(&mut self, version: &Version, paths: &SessionPaths) -> io::Result<()> {
        if self.supervisor.state() >= SupervisorState::Running {
            return Ok(());
        }
        let path = paths.config_file(&self.name);
        std::fs::write(&path, self.render_config(version, paths))?;
        self.config_file = Some(path.clone());
        self.initialized = true;
        debug!(router = %self.name, config = %path.display(), "config file written");
        Ok(())
    }

    /// Render the ordered stanza configuration.
    fn render_config(&self, version: &Version, paths: &SessionPaths) -> String {
        let mut out = String::new();
        let w = &mut out;

        let _ = writeln!(w, "router {{");
        let _ = writeln!(w, "  workerThreads : {}", self.worker_threads);
        let _ = writeln!(w, "  mode          : {}", self.role.as_str());
        let _ = writeln!(w, "  id            : {}", self.name);
        let _ = writeln!(w, "}}");

        // The three supported address-distribution classes, always
        // present in this fixed order.
        for class in ["closest", "balanced", "multicast"] {
            let _ = writeln!(w, "address {{");
            let _ = writeln!(w, "  prefix       : {class}");
            let _ = writeln!(w, "  distribution : {class}");
            let _ = writeln!(w, "}}");
        }

        let _ = writeln!(w, "log {{");
        let _ = writeln!(w, "  outputFile    : {}", paths.log_file(&self.name).display());
        let _ = writeln!(w, "  includeSource : true");
        let _ = writeln!(w, "  module        : DEFAULT");
        let _ = writeln!(w, "}}");

        // Every router gets a client listener, even if no client ever
        // attaches: the support tooling also talks to this port.
        self.render_listener(w, "normal", self.client_port, false, version);
        self.render_listener(w, "normal", self.console_port, true, version);

        if self.role == RouterRole::Interior {
            self.render_listener(w, "inter-router", self.router_port, false, version);
            self.render_listener(w, "edge", self.edge_port, false, version);
        }

        for conn in &self.outbound {
            let _ = writeln!(w, "connector {{");
            let _ = writeln!(w, "  name               : {}_connector_to_{}", self.name, conn.port);
            let _ = writeln!(w, "  idleTimeoutSeconds : 120");
            let _ = writeln!(w, "  saslMechanisms     : ANONYMOUS");
            let _ = writeln!(w, "  host               : 127.0.0.1");
            let _ = writeln!(w, "  port               : {}", conn.port);
            let _ = writeln!(w, "  role               : {}", conn.role.as_str());
            let _ = writeln!(w, "}}");
        }

        out
    }

    fn render_listener(
        &self,
        w: &mut String,
        role: &str,
        port: u16,
        console: bool,
        version: &Version,
    ) {
        let _ = writeln!(w, "listener {{");
        let _ = writeln!(w, "  role               : {role}");
        let _ = writeln!(w, "  host               : 0.0.0.0");
        let _ = writeln!(w, "  port               : {port}");
        let _ = writeln!(w, "  stripAnnotations   : no");
        let _ = writeln!(w, "  idleTimeoutSeconds : 120");
        let _ = writeln!(w, "  saslMechanisms     : ANONYMOUS");
        let _ = writeln!(w, "  authenticatePeer   : no");
        if console {
            let _ = writeln!(w, "  http               : true");
            let _ = writeln!(w, "  httpRoot           : {}", version.console_root().display());
        }
        let _ = writeln!(w, "}}");
    }

    /// Launch the router process with the active version's binary and
    /// environment. Call only after [`RouterNode::init`].
    pub async fn run(&mut self, version: &Version, paths: &SessionPaths) -> Result<(), StartError> {
        let Some(config_file) = self.config_file.clone() else {
            return Err(StartError::NotConfigured);
        };
        let spec = LaunchSpec {
            executable: version.binary_path(),
            args: vec![
                "--config".into(),
                config_file.display().to_string(),
                "-I".into(),
                version.include_path().display().to_string(),
            ],
            env: vec![
                ("LD_LIBRARY_PATH".into(), version.ld_library_path()),
                ("PYTHONPATH".into(), version.python_path()),
            ],
            setup_dir: paths.setup_dir(&self.name),
        };
        self.supervisor.start(spec).await
    }

    pub async fn halt(&self) -> Result<(), crate::process::HaltError> {
        self.supervisor.halt().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionRegistry;

    fn scratch_session(tag: &str) -> SessionPaths {
        let root = std::env::temp_dir().join(format!(
            "skein_router_{tag}_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let paths = SessionPaths::new(root);
        paths.ensure_dirs().unwrap();
        paths
    }

    fn test_version(paths: &SessionPaths) -> crate::version::Version {
        let mut reg = VersionRegistry::new();
        reg.register("latest", &paths.root, &paths.root).unwrap();
        reg.get("latest").unwrap().clone()
    }

    #[test]
    fn interior_to_interior_targets_router_port() {
        let mut a = RouterNode::new("A", RouterRole::Interior, "latest", 4).unwrap();
        let mut b = RouterNode::new("B", RouterRole::Interior, "latest", 4).unwrap();
        a.connect_to(&mut b).unwrap();
        let conn = &a.outbound()[0];
        assert_eq!(conn.port, b.router_port());
        assert_eq!(conn.role, ConnectorRole::InterRouter);
        assert!(b.neighbor_names().any(|n| n == "A"));
    }

    #[test]
    fn edge_to_interior_targets_edge_port() {
        let mut e = RouterNode::new("edge_0001", RouterRole::Edge, "latest", 4).unwrap();
        let mut a = RouterNode::new("A", RouterRole::Interior, "latest", 4).unwrap();
        e.connect_to(&mut a).unwrap();
        let conn = &e.outbound()[0];
        assert_eq!(conn.port, a.edge_port());
        assert_eq!(conn.role, ConnectorRole::Edge);
        assert_eq!(a.attached_edges(), ["edge_0001"]);
    }

    #[test]
    fn connecting_toward_an_edge_is_refused() {
        let mut a = RouterNode::new("A", RouterRole::Interior, "latest", 4).unwrap();
        let mut e = RouterNode::new("edge_0001", RouterRole::Edge, "latest", 4).unwrap();
        let err = a.connect_to(&mut e).unwrap_err();
        assert!(matches!(err, TopologyError::EdgeCannotAccept { .. }));
        assert!(a.outbound().is_empty());
    }

    #[test]
    fn edge_config_has_no_router_facing_listeners() {
        let paths = scratch_session("edgecfg");
        let version = test_version(&paths);
        let edge = RouterNode::new("edge_0001", RouterRole::Edge, "latest", 4).unwrap();
        let config = edge.render_config(&version, &paths);
        assert!(!config.contains("role               : inter-router"));
        assert!(!config.contains("role               : edge\n"));
        assert!(config.contains("role               : normal"));
    }

    #[test]
    fn interior_config_has_all_listeners_and_connectors() {
        let paths = scratch_session("intcfg");
        let version = test_version(&paths);
        let mut a = RouterNode::new("A", RouterRole::Interior, "latest", 4).unwrap();
        let mut b = RouterNode::new("B", RouterRole::Interior, "latest", 4).unwrap();
        a.connect_to(&mut b).unwrap();
        let config = a.render_config(&version, &paths);
        assert!(config.contains("mode          : interior"));
        assert!(config.contains("role               : inter-router"));
        assert!(config.contains(&format!("port               : {}", a.edge_port())));
        assert!(config.contains(&format!("A_connector_to_{}", b.router_port())));
        // Fixed distribution classes are always present.
        for class in ["closest", "balanced", "multicast"] {
            assert!(config.contains(&format!("prefix       : {class}")));
        }
    }

    #[test]
    fn reinit_below_running_regenerates_connectors() {
        let paths = scratch_session("reinit");
        let version = test_version(&paths);
        let mut a = RouterNode::new("A", RouterRole::Interior, "latest", 4).unwrap();
        let mut b = RouterNode::new("B", RouterRole::Interior, "latest", 4).unwrap();
        a.init(&version, &paths).unwrap();
        let before = std::fs::read_to_string(paths.config_file("A")).unwrap();
        assert!(!before.contains("connector {"));

        a.connect_to(&mut b).unwrap();
        a.init(&version, &paths).unwrap();
        let after = std::fs::read_to_string(paths.config_file("A")).unwrap();
        assert!(after.contains("connector {"));
    }
}
