//! Network orchestrator.
//!
//! [`Network`] owns the topology, the version registry, and the session
//! paths, and drives the whole lifecycle: build, init, run, watch for
//! completion, halt. Fault injection (killing routers, edges, and
//! clients mid-run) also lives here.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::SmallRng;
use rand::{RngExt as _, SeedableRng};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::ClientRole;
use crate::events::{
    Completion, DoneFileSource, EventWatcher, DUMP_DATA, POLL_INTERVAL, START_SENDING,
};
use crate::paths::SessionPaths;
use crate::process::{HaltError, StartError, SupervisorState};
use crate::router::{RouterRole, RouterNode};
use crate::topology::{Attachment, Topology, TopologyError};
use crate::version::{Version, VersionError, VersionRegistry};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Halt(#[from] HaltError),
    #[error("no router versions registered")]
    NoVersions,
    #[error("no registered version named {0}")]
    UnknownVersion(String),
    #[error("no edge router is currently running")]
    NoRunningEdge,
    #[error("no client is currently running")]
    NoRunningClients,
    #[error("completion watcher ended without a verdict")]
    WatcherClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tunables for a network run.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub worker_threads: usize,
    /// Nap between starting the routers and starting the clients, so
    /// routing tables settle before traffic begins.
    pub stabilization: Duration,
    /// Pause between consecutive client launches.
    pub client_pacing: Duration,
    /// Time given to clients to flush results after the dump marker.
    pub completion_grace: Duration,
    /// Pause between killing a client and bringing it back.
    pub client_restart_pause: Duration,
    pub poll_interval: Duration,
    /// Write configs and stop before launching anything.
    pub dry_run: bool,
    pub client_executable: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            stabilization: Duration::from_secs(10),
            client_pacing: Duration::from_millis(100),
            completion_grace: Duration::from_secs(30),
            client_restart_pause: Duration::from_secs(5),
            poll_interval: POLL_INTERVAL,
            dry_run: false,
            client_executable: PathBuf::new(),
        }
    }
}

/// What [`Network::init`] left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Configs written, ready to run.
    Ready,
    /// Configs written, dry-run requested, nothing will be launched.
    DryRun,
}

pub struct Network {
    name: String,
    paths: SessionPaths,
    config: NetworkConfig,
    versions: VersionRegistry,
    topology: Topology,
    edge_count: usize,
    sender_count: usize,
    receiver_count: usize,
}

impl Network {
    pub fn new(name: &str, session_root: impl Into<PathBuf>, config: NetworkConfig) -> Self {
        Self {
            name: name.to_string(),
            paths: SessionPaths::new(session_root),
            config,
            versions: VersionRegistry::new(),
            topology: Topology::new(),
            edge_count: 0,
            sender_count: 0,
            receiver_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn register_version(
        &mut self,
        name: &str,
        router_root: impl Into<PathBuf>,
        runtime_root: impl Into<PathBuf>,
    ) -> Result<(), NetworkError> {
        self.versions.register(name, router_root, runtime_root)?;
        Ok(())
    }

    fn resolve_version(
        versions: &VersionRegistry,
        name: Option<&str>,
    ) -> Result<Version, NetworkError> {
        match name {
            Some(n) => versions
                .get(n)
                .cloned()
                .ok_or_else(|| NetworkError::UnknownVersion(n.to_string())),
            None => versions
                .default_version()
                .cloned()
                .ok_or(NetworkError::NoVersions),
        }
    }

    /// Add one interior router. `version` defaults to the first
    /// registered version.
    pub fn add_router(&mut self, name: &str, version: Option<&str>) -> Result<(), NetworkError> {
        let version = Self::resolve_version(&self.versions, version)?;
        self.topology.add_router(
            name,
            RouterRole::Interior,
            version.name(),
            self.config.worker_threads,
        )?;
        Ok(())
    }

    /// Add one edge router by name, not yet connected to anything.
    pub fn add_edge(&mut self, name: &str, version: Option<&str>) -> Result<(), NetworkError> {
        let version = Self::resolve_version(&self.versions, version)?;
        self.topology.add_router(
            name,
            RouterRole::Edge,
            version.name(),
            self.config.worker_threads,
        )?;
        Ok(())
    }

    /// Add an auto-named edge router attached to the named interior
    /// router and return its generated name.
    pub fn attach_edge(&mut self, to: &str, version: Option<&str>) -> Result<String, NetworkError> {
        self.edge_count += 1;
        let name = format!("edge_{:04}", self.edge_count);
        self.add_edge(&name, version)?;
        self.topology.connect(&name, to)?;
        Ok(name)
    }

    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), NetworkError> {
        self.topology.connect(from, to)?;
        Ok(())
    }

    pub fn build_linear(&mut self, count: usize, version: Option<&str>) -> Result<(), NetworkError> {
        let version = Self::resolve_version(&self.versions, version)?;
        self.topology
            .build_linear(count, version.name(), self.config.worker_threads)?;
        Ok(())
    }

    pub fn build_mesh(&mut self, count: usize, version: Option<&str>) -> Result<(), NetworkError> {
        let version = Self::resolve_version(&self.versions, version)?;
        self.topology
            .build_mesh(count, version.name(), self.config.worker_threads)?;
        Ok(())
    }

    pub fn build_ring(&mut self, count: usize, version: Option<&str>) -> Result<(), NetworkError> {
        let version = Self::resolve_version(&self.versions, version)?;
        self.topology
            .build_ring(count, version.name(), self.config.worker_threads)?;
        Ok(())
    }

    pub fn build_star(&mut self, count: usize, version: Option<&str>) -> Result<(), NetworkError> {
        let version = Self::resolve_version(&self.versions, version)?;
        self.topology
            .build_star(count, version.name(), self.config.worker_threads)?;
        Ok(())
    }

    pub fn build_random(
        &mut self,
        count: usize,
        seed: u64,
        attachment: Attachment,
        version: Option<&str>,
    ) -> Result<(), NetworkError> {
        let version = Self::resolve_version(&self.versions, version)?;
        self.topology.build_random(
            count,
            seed,
            attachment,
            version.name(),
            self.config.worker_threads,
        )?;
        Ok(())
    }

    /// Add a sender attached to the named router; returns the generated
    /// client name.
    pub fn add_sender(&mut self, router: &str) -> Result<String, NetworkError> {
        self.sender_count += 1;
        let name = format!("sender_{:04}", self.sender_count);
        self.topology.add_client(&name, ClientRole::Send, router)?;
        Ok(name)
    }

    /// Add a receiver attached to the named router; returns the
    /// generated client name. The receiver count drives the completion
    /// watcher's expected total.
    pub fn add_receiver(&mut self, router: &str) -> Result<String, NetworkError> {
        self.receiver_count += 1;
        let name = format!("receiver_{:04}", self.receiver_count);
        self.topology.add_client(&name, ClientRole::Receive, router)?;
        Ok(name)
    }

    pub fn add_client_address(&mut self, client: &str, address: &str) -> Result<(), NetworkError> {
        self.topology
            .client_mut(client)
            .ok_or_else(|| TopologyError::UnknownClient(client.to_string()))?
            .add_address(address);
        Ok(())
    }

    /// Create the session directories and write every router's config.
    pub fn init(&mut self) -> Result<InitOutcome, NetworkError> {
        self.paths.ensure_dirs()?;
        let paths = self.paths.clone();
        for router in self.topology.routers_mut() {
            let version = Self::resolve_version(&self.versions, Some(router.version_name()))?;
            router.init(&version, &paths)?;
        }
        info!(
            network = %self.name,
            routers = self.topology.routers().len(),
            clients = self.topology.clients().len(),
            "network initialized"
        );
        if self.config.dry_run {
            info!(config_dir = %self.paths.config.display(), "dry run requested, stopping here");
            return Ok(InitOutcome::DryRun);
        }
        Ok(InitOutcome::Ready)
    }

    /// Launch every initialized router, wait for the network to settle,
    /// then launch the clients. Routers already running are skipped, so
    /// a second call only picks up newly added nodes.
    pub async fn run(&mut self) -> Result<(), NetworkError> {
        let paths = self.paths.clone();

        let mut fresh_routers = 0usize;
        for router in self.topology.routers_mut() {
            if router.state() != SupervisorState::Initialized {
                continue;
            }
            let version = Self::resolve_version(&self.versions, Some(router.version_name()))?;
            match router.run(&version, &paths).await {
                Ok(()) => fresh_routers += 1,
                Err(e) => warn!(router = %router.name(), error = %e, "router failed to start"),
            }
        }
        info!(started = fresh_routers, "routers launched");

        let total_clients = self.topology.clients().len();
        if total_clients == 0 {
            return Ok(());
        }
        if fresh_routers > 0 {
            debug!(nap = ?self.config.stabilization, "waiting for routing tables to settle");
            sleep(self.config.stabilization).await;
        }

        let executable = self.config.client_executable.clone();
        let pacing = self.config.client_pacing;
        let mut launched = 0usize;
        for client in self.topology.clients_mut() {
            if client.state() >= SupervisorState::Running {
                continue;
            }
            if let Err(e) = client
                .run(&executable, &paths.results, &paths.events, &paths.log)
                .await
            {
                warn!(client = %client.name(), error = %e, "client failed to start");
                continue;
            }
            launched += 1;
            if launched % 25 == 0 {
                info!(launched, total = total_clients, "client launch progress");
            }
            sleep(pacing).await;
        }
        info!(launched, "clients launched");
        Ok(())
    }

    /// Halt everything concurrently. Each node gets its own task so a
    /// slow shutdown cannot serialize the rest. Clients that already
    /// finished their work self-terminate, which is expected; a router
    /// exiting on its own is not.
    pub async fn halt(&mut self) {
        let mut handles = Vec::new();
        for router in self.topology.routers() {
            let name = router.name().to_string();
            let supervisor = router.supervisor();
            handles.push(tokio::spawn(async move {
                match supervisor.halt().await {
                    Ok(()) => {}
                    Err(e) => warn!(router = %name, error = %e, "router halt"),
                }
            }));
        }
        for client in self.topology.clients() {
            let name = client.name().to_string();
            let supervisor = client.supervisor();
            handles.push(tokio::spawn(async move {
                match supervisor.halt().await {
                    Ok(()) => {}
                    Err(e) if e.is_self_terminated() => {
                        debug!(client = %name, "client had already finished")
                    }
                    Err(e) => warn!(client = %name, error = %e, "client halt"),
                }
            }));
        }
        join_all(handles).await;
        info!(network = %self.name, "network halted");
    }

    /// Kill one router without waiting for the result.
    pub fn halt_router(&mut self, name: &str) -> Result<(), NetworkError> {
        let router = self
            .topology
            .router(name)
            .ok_or_else(|| TopologyError::UnknownRouter(name.to_string()))?;
        let supervisor = router.supervisor();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = supervisor.halt().await {
                warn!(router = %name, error = %e, "fault-injection halt");
            }
        });
        Ok(())
    }

    /// Kill a router, wait `pause`, and bring it back with the same
    /// command line.
    pub async fn halt_and_restart_router(
        &mut self,
        name: &str,
        pause: Duration,
    ) -> Result<(), NetworkError> {
        let supervisor = self
            .topology
            .router(name)
            .ok_or_else(|| TopologyError::UnknownRouter(name.to_string()))?
            .supervisor();
        info!(router = %name, pause = ?pause, "restarting router");
        supervisor.kill_and_restart(pause).await?;
        Ok(())
    }

    /// Pick a running client at random, kill it, and restart it after
    /// the configured pause.
    pub async fn kill_and_restart_random_client(&mut self) -> Result<String, NetworkError> {
        let running: Vec<_> = self
            .topology
            .clients()
            .iter()
            .filter(|c| c.state() == SupervisorState::Running)
            .map(|c| (c.name().to_string(), c.supervisor()))
            .collect();
        if running.is_empty() {
            return Err(NetworkError::NoRunningClients);
        }
        let mut rng = SmallRng::seed_from_u64(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
        );
        let (name, supervisor) = &running[rng.random_range(0..running.len())];
        info!(client = %name, "restarting random client");
        supervisor
            .kill_and_restart(self.config.client_restart_pause)
            .await?;
        Ok(name.clone())
    }

    /// Kill the first edge router, in creation order, that is still
    /// running. Returns its name.
    pub async fn halt_first_edge(&mut self) -> Result<String, NetworkError> {
        let edge = self
            .topology
            .routers()
            .iter()
            .find(|r| r.role() == RouterRole::Edge && r.state() == SupervisorState::Running)
            .map(|r| (r.name().to_string(), r.supervisor()));
        let Some((name, supervisor)) = edge else {
            return Err(NetworkError::NoRunningEdge);
        };
        info!(edge = %name, "halting first running edge");
        supervisor.halt().await?;
        Ok(name)
    }

    /// Release the senders, watch the receivers to a verdict, tell the
    /// clients to dump their data, then halt the network.
    pub async fn run_to_completion(&mut self) -> Result<Completion, NetworkError> {
        crate::events::release_marker(&self.paths.events, START_SENDING)?;
        info!(receivers = self.receiver_count, "senders released, watching for completion");

        let source = DoneFileSource::new(&self.paths.events);
        let mut rx = EventWatcher::spawn(source, self.receiver_count, self.config.poll_interval);
        let verdict = rx.recv().await.ok_or(NetworkError::WatcherClosed)?;

        crate::events::release_marker(&self.paths.events, DUMP_DATA)?;
        debug!(grace = ?self.config.completion_grace, "waiting for clients to flush results");
        sleep(self.config.completion_grace).await;
        self.halt().await;
        Ok(verdict)
    }

    /// Client-facing port of the named router.
    pub fn client_port(&self, router: &str) -> Result<u16, NetworkError> {
        self.topology
            .router(router)
            .map(RouterNode::client_port)
            .ok_or_else(|| TopologyError::UnknownRouter(router.to_string()).into())
    }

    /// Console ports of every router, in creation order.
    pub fn console_ports(&self) -> Vec<(String, u16)> {
        self.topology
            .routers()
            .iter()
            .map(|r| (r.name().to_string(), r.console_port()))
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.topology.is_connected()
    }

    pub fn router_edges(&self, name: &str) -> Result<Vec<String>, NetworkError> {
        Ok(self.topology.router_edges(name)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "skein_network_{tag}_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    fn network(tag: &str) -> Network {
        let root = scratch_root(tag);
        std::fs::create_dir_all(&root).unwrap();
        let mut net = Network::new("test", &root, NetworkConfig::default());
        net.register_version("latest", &root, &root).unwrap();
        net
    }

    #[test]
    fn nodes_without_explicit_version_use_the_default() {
        let mut net = network("defver");
        net.add_router("A", None).unwrap();
        assert_eq!(net.topology().router("A").unwrap().version_name(), "latest");
        assert!(matches!(
            net.add_router("B", Some("nightly")),
            Err(NetworkError::UnknownVersion(_))
        ));
    }

    #[test]
    fn edges_and_clients_get_sequential_names() {
        let mut net = network("names");
        net.add_router("A", None).unwrap();
        assert_eq!(net.attach_edge("A", None).unwrap(), "edge_0001");
        assert_eq!(net.attach_edge("A", None).unwrap(), "edge_0002");
        assert_eq!(net.add_sender("A").unwrap(), "sender_0001");
        assert_eq!(net.add_receiver("A").unwrap(), "receiver_0001");
        assert_eq!(net.add_receiver("edge_0002").unwrap(), "receiver_0002");
        assert_eq!(net.router_edges("A").unwrap(), ["edge_0001", "edge_0002"]);
    }

    #[test]
    fn init_writes_a_config_per_router() {
        let mut net = network("init");
        net.build_linear(3, None).unwrap();
        assert_eq!(net.init().unwrap(), InitOutcome::Ready);
        for name in ["A", "B", "C"] {
            assert!(net.paths().config_file(name).exists());
        }
    }

    #[test]
    fn dry_run_still_writes_configs() {
        let root = scratch_root("dry");
        std::fs::create_dir_all(&root).unwrap();
        let config = NetworkConfig {
            dry_run: true,
            ..NetworkConfig::default()
        };
        let mut net = Network::new("test", &root, config);
        net.register_version("latest", &root, &root).unwrap();
        net.add_router("A", None).unwrap();
        assert_eq!(net.init().unwrap(), InitOutcome::DryRun);
        assert!(net.paths().config_file("A").exists());
    }

    #[test]
    fn client_port_matches_the_routers_listener() {
        let mut net = network("port");
        net.add_router("A", None).unwrap();
        let expected = net.topology().router("A").unwrap().client_port();
        assert_eq!(net.client_port("A").unwrap(), expected);
        assert_eq!(net.console_ports().len(), 1);
    }

    #[tokio::test]
    async fn fault_injection_on_empty_network_reports_errors() {
        let mut net = network("faults");
        net.add_router("A", None).unwrap();
        assert!(matches!(
            net.halt_first_edge().await,
            Err(NetworkError::NoRunningEdge)
        ));
        assert!(matches!(
            net.kill_and_restart_random_client().await,
            Err(NetworkError::NoRunningClients)
        ));
        assert!(matches!(
            net.halt_router("missing"),
            Err(NetworkError::Topology(TopologyError::UnknownRouter(_)))
        ));
    }
}
