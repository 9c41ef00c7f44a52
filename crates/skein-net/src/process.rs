//! Child-process supervisor.
//!
//! Wraps one external OS process: spawn it, classify how it terminated,
//! force-kill it, restart it. The supervisor is cheaply cloneable so the
//! orchestrator can fan halt tasks out over many nodes at once; each
//! clone shares the same underlying state.
//!
//! Halting is a race between two outcomes. We wait for natural process
//! exit with a fixed timeout. If the timeout fires first, the process
//! was still running when we killed it, which is the expected case for
//! a test being torn down. If the process exits on its own before the
//! timeout, it stopped early without being asked to, which is a test
//! failure even when its exit code is zero.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Halt timeout for router processes.
pub const ROUTER_HALT_TIMEOUT: Duration = Duration::from_millis(500);

/// Halt timeout for client processes.
pub const CLIENT_HALT_TIMEOUT: Duration = Duration::from_millis(250);

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SupervisorState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Halted = 3,
}

impl SupervisorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SupervisorState::Initialized,
            2 => SupervisorState::Running,
            3 => SupervisorState::Halted,
            _ => SupervisorState::Uninitialized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Uninitialized => "uninitialized",
            SupervisorState::Initialized => "initialized",
            SupervisorState::Running => "running",
            SupervisorState::Halted => "halted",
        }
    }
}

/// Everything needed to launch (and re-launch) the supervised process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Per-node directory where the literal command line and environment
    /// are persisted so a failed run can be reproduced by hand.
    pub setup_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("executable {0} does not exist")]
    MissingExecutable(PathBuf),
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to persist launch record: {0}")]
    Record(#[from] io::Error),
    #[error("process was never started, nothing to restart")]
    NeverStarted,
    #[error("node has no configuration written, init it first")]
    NotConfigured,
    #[error("client has no results path, flight times would be lost")]
    MissingResultsPath,
}

#[derive(Debug, Error)]
pub enum HaltError {
    /// The process exited on its own inside the halt window. Early
    /// termination was not requested, so this is an error regardless of
    /// the reported exit code.
    #[error("process self-terminated early (status: {status:?})")]
    SelfTerminated { status: Option<ExitStatus> },
    #[error("failed to kill process: {0}")]
    KillFailed(#[source] io::Error),
}

impl HaltError {
    pub fn is_self_terminated(&self) -> bool {
        matches!(self, HaltError::SelfTerminated { .. })
    }
}

#[derive(Default)]
struct Inner {
    child: Option<Child>,
    spec: Option<LaunchSpec>,
    pid: Option<u32>,
}

/// Lifecycle wrapper around one external OS process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    halt_timeout: Duration,
    state: Arc<AtomicU8>,
    inner: Arc<Mutex<Inner>>,
}

impl ProcessSupervisor {
    /// The timeout bounds the halt race; see [`ProcessSupervisor::halt`].
    pub fn new(halt_timeout: Duration) -> Self {
        Self {
            halt_timeout,
            state: Arc::new(AtomicU8::new(SupervisorState::Uninitialized as u8)),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn halt_timeout(&self) -> Duration {
        self.halt_timeout
    }

    /// PID of the supervised process, if it has been started.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.pid
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Spawn the process described by `spec`.
    ///
    /// A no-op (not an error) when the process is already running or was
    /// halted. The command line and environment are written into the
    /// spec's setup directory before spawning.
    pub async fn start(&self, spec: LaunchSpec) -> Result<(), StartError> {
        let mut inner = self.inner.lock().await;
        if self.state() >= SupervisorState::Running {
            debug!(state = self.state().as_str(), "start skipped");
            return Ok(());
        }
        self.spawn_locked(&mut inner, spec).await
    }

    async fn spawn_locked(&self, inner: &mut Inner, spec: LaunchSpec) -> Result<(), StartError> {
        if !spec.executable.exists() {
            return Err(StartError::MissingExecutable(spec.executable.clone()));
        }

        persist_launch_record(&spec)?;

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|source| StartError::Spawn {
            executable: spec.executable.clone(),
            source,
        })?;

        inner.pid = child.id();
        inner.child = Some(child);
        inner.spec = Some(spec);
        self.set_state(SupervisorState::Running);
        debug!(pid = ?inner.pid, "process started");
        Ok(())
    }

    /// Halt the process.
    ///
    /// Already halted: no-op returning success. Never spawned: transition
    /// straight to Halted. Otherwise wait for natural exit with the halt
    /// timeout:
    ///
    /// - timeout elapses → the process was still running; kill it and
    ///   return success (the expected outcome);
    /// - the process exits first → [`HaltError::SelfTerminated`], even
    ///   with exit code zero;
    /// - the kill itself fails → [`HaltError::KillFailed`].
    pub async fn halt(&self) -> Result<(), HaltError> {
        let mut inner = self.inner.lock().await;
        if self.state() == SupervisorState::Halted {
            debug!("already halted");
            return Ok(());
        }
        let Some(mut child) = inner.child.take() else {
            self.set_state(SupervisorState::Halted);
            return Ok(());
        };
        // Mark halted up front so a concurrent re-halt on another clone
        // of this supervisor is an immediate no-op.
        self.set_state(SupervisorState::Halted);
        drop(inner);

        match timeout(self.halt_timeout, child.wait()).await {
            Err(_elapsed) => {
                child.kill().await.map_err(HaltError::KillFailed)?;
                info!("process killed while running");
                Ok(())
            }
            Ok(status) => Err(HaltError::SelfTerminated {
                status: status.ok(),
            }),
        }
    }

    /// Re-launch with the parameters remembered from the last start.
    pub async fn restart(&self) -> Result<(), StartError> {
        let mut inner = self.inner.lock().await;
        let spec = inner.spec.clone().ok_or(StartError::NeverStarted)?;
        self.set_state(SupervisorState::Initialized);
        self.spawn_locked(&mut inner, spec).await
    }

    /// Halt, sleep `pause`, then restart with the original parameters.
    ///
    /// Self-termination during the halt is tolerated here: the point of
    /// this operation is fault injection, and a process that happened to
    /// die just before we killed it can still be restarted.
    pub async fn kill_and_restart(&self, pause: Duration) -> Result<(), StartError> {
        match self.halt().await {
            Ok(()) => {}
            Err(e) if e.is_self_terminated() => {
                warn!(error = %e, "process was already down before restart");
            }
            Err(e) => {
                warn!(error = %e, "halt failed before restart");
            }
        }
        tokio::time::sleep(pause).await;
        self.restart().await
    }
}

/// Write the literal command line and `export VAR=...` lines to the
/// node's setup directory so the user can reproduce the launch by hand.
fn persist_launch_record(spec: &LaunchSpec) -> io::Result<()> {
    std::fs::create_dir_all(&spec.setup_dir)?;

    let mut command_line = spec.executable.display().to_string();
    for arg in &spec.args {
        command_line.push(' ');
        command_line.push_str(arg);
    }
    command_line.push('\n');
    std::fs::write(spec.setup_dir.join("command_line"), command_line)?;

    let mut env_lines = String::new();
    for (key, value) in &spec.env {
        env_lines.push_str(&format!("export {key}={value}\n"));
    }
    std::fs::write(spec.setup_dir.join("environment_variables"), env_lines)?;
    Ok(())
}
