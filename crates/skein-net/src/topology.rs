//! Node collection and topology construction.
//!
//! The topology owns every router and client in creation order. Shape
//! builders produce the common interior layouts; edges and clients are
//! always attached one at a time.

use std::collections::HashSet;
use std::io;

use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use thiserror::Error;
use tracing::debug;

use crate::client::{ClientNode, ClientRole};
use crate::router::{RouterNode, RouterRole};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no router named {0}")]
    UnknownRouter(String),
    #[error("no client named {0}")]
    UnknownClient(String),
    #[error("no registered version named {0}")]
    UnknownVersion(String),
    #[error("a node named {0} already exists")]
    DuplicateName(String),
    #[error("cannot connect {from} to {to}: edge routers accept no connections")]
    EdgeCannotAccept { from: String, to: String },
    #[error("cannot connect {0} to itself")]
    SelfConnection(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How a new router picks its peer in a randomly grown topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Uniformly among all previously created routers.
    AnyPrior,
    /// Always the router created immediately before it.
    MostRecent,
}

/// Interior router names run A, B, C... and fall back to numbered names
/// once the alphabet is exhausted.
pub fn interior_name(index: usize) -> String {
    if index < 26 {
        char::from(b'A' + index as u8).to_string()
    } else {
        format!("R{index}")
    }
}

#[derive(Default)]
pub struct Topology {
    routers: Vec<RouterNode>,
    clients: Vec<ClientNode>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routers(&self) -> &[RouterNode] {
        &self.routers
    }

    pub fn routers_mut(&mut self) -> &mut [RouterNode] {
        &mut self.routers
    }

    pub fn clients(&self) -> &[ClientNode] {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut [ClientNode] {
        &mut self.clients
    }

    pub fn router(&self, name: &str) -> Option<&RouterNode> {
        self.routers.iter().find(|r| r.name() == name)
    }

    pub fn router_mut(&mut self, name: &str) -> Option<&mut RouterNode> {
        self.routers.iter_mut().find(|r| r.name() == name)
    }

    pub fn client(&self, name: &str) -> Option<&ClientNode> {
        self.clients.iter().find(|c| c.name() == name)
    }

    pub fn client_mut(&mut self, name: &str) -> Option<&mut ClientNode> {
        self.clients.iter_mut().find(|c| c.name() == name)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.router(name).is_some() || self.client(name).is_some()
    }

    pub fn add_router(
        &mut self,
        name: &str,
        role: RouterRole,
        version: &str,
        worker_threads: usize,
    ) -> Result<(), TopologyError> {
        if self.name_taken(name) {
            return Err(TopologyError::DuplicateName(name.to_string()));
        }
        let node = RouterNode::new(name, role, version, worker_threads)?;
        debug!(router = name, role = role.as_str(), "added router");
        self.routers.push(node);
        Ok(())
    }

    pub fn add_client(&mut self, name: &str, role: ClientRole, router: &str) -> Result<(), TopologyError> {
        if self.name_taken(name) {
            return Err(TopologyError::DuplicateName(name.to_string()));
        }
        let port = self
            .router(router)
            .ok_or_else(|| TopologyError::UnknownRouter(router.to_string()))?
            .client_port();
        self.clients.push(ClientNode::new(name, role, router, port));
        Ok(())
    }

    /// Connect router `from` to router `to` by name.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), TopologyError> {
        if from == to {
            return Err(TopologyError::SelfConnection(from.to_string()));
        }
        let from_idx = self
            .routers
            .iter()
            .position(|r| r.name() == from)
            .ok_or_else(|| TopologyError::UnknownRouter(from.to_string()))?;
        let to_idx = self
            .routers
            .iter()
            .position(|r| r.name() == to)
            .ok_or_else(|| TopologyError::UnknownRouter(to.to_string()))?;

        // Disjoint mutable borrows of the two endpoints.
        let (a, b) = if from_idx < to_idx {
            let (head, tail) = self.routers.split_at_mut(to_idx);
            (&mut head[from_idx], &mut tail[0])
        } else {
            let (head, tail) = self.routers.split_at_mut(from_idx);
            (&mut tail[0], &mut head[to_idx])
        };
        a.connect_to(b)
    }

    /// Chain of interior routers: A - B - C - ...
    pub fn build_linear(
        &mut self,
        count: usize,
        version: &str,
        worker_threads: usize,
    ) -> Result<(), TopologyError> {
        let base = self.routers.len();
        for i in 0..count {
            self.add_router(&interior_name(base + i), RouterRole::Interior, version, worker_threads)?;
        }
        for i in 1..count {
            self.connect(&interior_name(base + i), &interior_name(base + i - 1))?;
        }
        Ok(())
    }

    /// Fully connected interior routers.
    pub fn build_mesh(
        &mut self,
        count: usize,
        version: &str,
        worker_threads: usize,
    ) -> Result<(), TopologyError> {
        let base = self.routers.len();
        for i in 0..count {
            self.add_router(&interior_name(base + i), RouterRole::Interior, version, worker_threads)?;
        }
        for i in 0..count {
            for j in 0..i {
                self.connect(&interior_name(base + i), &interior_name(base + j))?;
            }
        }
        Ok(())
    }

    /// A linear chain with the last router connected back to the first.
    pub fn build_ring(
        &mut self,
        count: usize,
        version: &str,
        worker_threads: usize,
    ) -> Result<(), TopologyError> {
        let base = self.routers.len();
        self.build_linear(count, version, worker_threads)?;
        if count > 2 {
            self.connect(&interior_name(base + count - 1), &interior_name(base))?;
        }
        Ok(())
    }

    /// All routers connected to the first one.
    pub fn build_star(
        &mut self,
        count: usize,
        version: &str,
        worker_threads: usize,
    ) -> Result<(), TopologyError> {
        let base = self.routers.len();
        for i in 0..count {
            self.add_router(&interior_name(base + i), RouterRole::Interior, version, worker_threads)?;
        }
        for i in 1..count {
            self.connect(&interior_name(base + i), &interior_name(base))?;
        }
        Ok(())
    }

    /// Grow a random connected interior topology. Each new router picks
    /// one existing peer per the attachment policy. The same seed always
    /// produces the same shape.
    pub fn build_random(
        &mut self,
        count: usize,
        seed: u64,
        attachment: Attachment,
        version: &str,
        worker_threads: usize,
    ) -> Result<(), TopologyError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let base = self.routers.len();
        for i in 0..count {
            self.add_router(&interior_name(base + i), RouterRole::Interior, version, worker_threads)?;
            if i == 0 {
                continue;
            }
            let target = match attachment {
                Attachment::MostRecent => i - 1,
                Attachment::AnyPrior => rng.random_range(0..i),
            };
            self.connect(&interior_name(base + i), &interior_name(base + target))?;
        }
        Ok(())
    }

    /// Whether every router can reach every other, treating links as
    /// undirected. Trivially true for zero or one routers.
    pub fn is_connected(&self) -> bool {
        if self.routers.len() < 2 {
            return true;
        }
        let mut visited = HashSet::new();
        let mut frontier = vec![self.routers[0].name().to_string()];
        visited.insert(self.routers[0].name().to_string());
        while let Some(name) = frontier.pop() {
            let Some(router) = self.router(&name) else {
                continue;
            };
            for neighbor in router.neighbor_names() {
                if visited.insert(neighbor.to_string()) {
                    frontier.push(neighbor.to_string());
                }
            }
        }
        visited.len() == self.routers.len()
    }

    /// Number of interior-role routers.
    pub fn interior_count(&self) -> usize {
        self.routers.iter().filter(|r| r.is_interior()).count()
    }

    /// The nth interior router in creation order. Client-placement
    /// commands use this to spread clients over the interior set.
    pub fn nth_interior(&self, n: usize) -> Option<&RouterNode> {
        self.routers.iter().filter(|r| r.is_interior()).nth(n)
    }

    /// Names of every edge router in the network, in creation order.
    pub fn edge_list(&self) -> Vec<String> {
        self.routers
            .iter()
            .filter(|r| !r.is_interior())
            .map(|r| r.name().to_string())
            .collect()
    }

    /// Names of the edge routers attached to the named interior router.
    pub fn router_edges(&self, name: &str) -> Result<&[String], TopologyError> {
        self.router(name)
            .map(|r| r.attached_edges())
            .ok_or_else(|| TopologyError::UnknownRouter(name.to_string()))
    }
}
