//! Sender and receiver client nodes.
//!
//! A client is a thin wrapper over a [`ProcessSupervisor`]: all of its
//! behavior lives in the external client executable, and this module's
//! job is to assemble the right command line for it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::process::{
    LaunchSpec, ProcessSupervisor, StartError, SupervisorState, CLIENT_HALT_TIMEOUT,
};

/// Direction of message flow for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Send,
    Receive,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Send => "send",
            ClientRole::Receive => "receive",
        }
    }
}

/// Message-traffic knobs for a client, passed through to its command
/// line verbatim.
#[derive(Debug, Clone)]
pub struct ClientThrottle {
    /// Number of messages to move, as the client executable expects it
    /// (senders may accept "all").
    pub messages: String,
    /// Upper bound on generated message body length, in bytes.
    pub max_message_length: usize,
    /// Inter-message pause in milliseconds. Receivers never throttle,
    /// the value is overridden to "0" for them.
    pub throttle: String,
    /// Seconds to wait before the client starts its work.
    pub delay: String,
    /// Run indefinitely instead of stopping at the message count.
    pub soak: bool,
}

impl Default for ClientThrottle {
    fn default() -> Self {
        Self {
            messages: "100".to_string(),
            max_message_length: 1000,
            throttle: "0".to_string(),
            delay: "0".to_string(),
            soak: false,
        }
    }
}

/// One sender or receiver process attached to a router's client port.
pub struct ClientNode {
    name: String,
    role: ClientRole,
    router: String,
    port: u16,
    addresses: Vec<String>,
    throttle: ClientThrottle,
    supervisor: ProcessSupervisor,
}

impl ClientNode {
    pub fn new(name: &str, role: ClientRole, router: &str, port: u16) -> Self {
        let mut throttle = ClientThrottle::default();
        if role == ClientRole::Receive {
            throttle.throttle = "0".to_string();
        }
        Self {
            name: name.to_string(),
            role,
            router: router.to_string(),
            port,
            addresses: Vec::new(),
            throttle,
            supervisor: ProcessSupervisor::new(CLIENT_HALT_TIMEOUT),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    /// Name of the router this client attaches to.
    pub fn router(&self) -> &str {
        &self.router
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        self.supervisor.clone()
    }

    pub fn add_address(&mut self, address: &str) {
        self.addresses.push(address.to_string());
    }

    /// Adjust traffic knobs before the client is launched. Receivers
    /// keep their forced zero throttle.
    pub fn set_throttle(&mut self, mut throttle: ClientThrottle) {
        if self.role == ClientRole::Receive {
            throttle.throttle = "0".to_string();
        }
        self.throttle = throttle;
    }

    /// Launch the client executable.
    ///
    /// `results_path` is where the client writes its per-message flight
    /// times; launching without one would silently discard the data the
    /// whole run exists to collect, so an empty path fails fast.
    pub async fn run(
        &mut self,
        executable: &Path,
        results_path: &Path,
        events_path: &Path,
        log_path: &Path,
    ) -> Result<(), StartError> {
        if results_path.as_os_str().is_empty() {
            return Err(StartError::MissingResultsPath);
        }

        let mut args = vec![
            "--name".to_string(),
            self.name.clone(),
            "--operation".to_string(),
            self.role.as_str().to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--log".to_string(),
            log_path.join(&self.name).display().to_string(),
            "--messages".to_string(),
            self.throttle.messages.clone(),
            "--max_message_length".to_string(),
            self.throttle.max_message_length.to_string(),
            "--throttle".to_string(),
            self.throttle.throttle.clone(),
            "--delay".to_string(),
            self.throttle.delay.clone(),
            "--flight_times_file_name".to_string(),
            results_path.join(&self.name).display().to_string(),
            "--events_path".to_string(),
            events_path.display().to_string(),
        ];
        for address in &self.addresses {
            args.push("--address".to_string());
            args.push(address.clone());
        }
        if self.throttle.soak {
            args.push("--soak".to_string());
        }

        debug!(client = %self.name, role = self.role.as_str(), port = self.port, "launching client");
        let spec = LaunchSpec {
            executable: PathBuf::from(executable),
            args,
            env: Vec::new(),
            setup_dir: results_path.join("setup").join(&self.name),
        };
        self.supervisor.start(spec).await
    }

    pub async fn halt(&self) -> Result<(), crate::process::HaltError> {
        self.supervisor.halt().await
    }
}
