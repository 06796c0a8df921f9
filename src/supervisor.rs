//! Decoder-app child process supervision.
//!
//! Each instance is one child process owned by a monitor task. Stopping is
//! graceful first (SIGTERM), forceful after a timeout (SIGKILL), and
//! tolerant of being requested twice. Exits, expected or not, are consumed
//! asynchronously and reported on the exit channel.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::error::{LinkError, Result};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// What to run for one instance. The caller owns the argument convention;
/// the supervisor only owns the process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub instance_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Exit report delivered on the supervisor's exit channel.
#[derive(Debug, Clone)]
pub struct InstanceExit {
    pub instance_id: String,
    /// Unix exit code when the child exited on its own.
    pub code: Option<i32>,
    /// True when the exit was requested through [`Supervisor::stop`].
    pub requested: bool,
}

struct InstanceHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
}

pub struct Supervisor {
    instances: DashMap<String, InstanceHandle>,
    exits: mpsc::Sender<InstanceExit>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(grace: Duration) -> (Arc<Self>, mpsc::Receiver<InstanceExit>) {
        let (exits, exit_rx) = mpsc::channel(64);
        (Arc::new(Self { instances: DashMap::new(), exits, grace }), exit_rx)
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.instances
            .get(instance_id)
            .map(|h| h.alive.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn pid(&self, instance_id: &str) -> Option<u32> {
        self.instances.get(instance_id).and_then(|h| h.pid)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.instances
            .iter()
            .filter(|e| e.value().alive.load(Ordering::Relaxed))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Launch one child, stdio detached from our terminal.
    pub fn spawn(self: &Arc<Self>, spec: SpawnSpec) -> Result<()> {
        if self.is_running(&spec.instance_id) {
            return Err(LinkError::InvariantViolation(format!(
                "instance {} already running",
                spec.instance_id
            )));
        }
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        info!(instance_id = %spec.instance_id, ?pid, program = %spec.program.display(), "child spawned");

        let alive = Arc::new(AtomicBool::new(true));
        let (stop, stop_rx) = watch::channel(false);
        self.instances.insert(
            spec.instance_id.clone(),
            InstanceHandle { pid, alive: alive.clone(), stop },
        );
        let sup = self.clone();
        tokio::spawn(monitor(sup, spec.instance_id, child, alive, stop_rx));
        Ok(())
    }

    /// Request termination. Returns false for an unknown (or already
    /// reaped) instance; repeated calls are harmless.
    pub fn stop(&self, instance_id: &str) -> bool {
        match self.instances.get(instance_id) {
            Some(h) => {
                let _ = h.stop.send(true);
                true
            }
            None => false,
        }
    }

    /// Stop everything; used on shutdown and by the emergency path.
    pub fn stop_all(&self) {
        for entry in self.instances.iter() {
            let _ = entry.value().stop.send(true);
        }
    }
}

async fn monitor(
    sup: Arc<Supervisor>,
    instance_id: String,
    mut child: Child,
    alive: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut requested = false;
    let mut code = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            warn!(instance_id, ?code, "child exited on its own");
            code
        }
        _ = stop_rx.changed() => {
            requested = true;
            None
        }
    };
    if requested {
        code = terminate(&mut child, &instance_id, sup.grace).await;
    }
    alive.store(false, Ordering::Relaxed);
    sup.instances.remove(&instance_id);
    let _ = sup.exits.send(InstanceExit { instance_id, code, requested }).await;
}

/// Soft signal, bounded wait, then hard kill.
async fn terminate(child: &mut Child, instance_id: &str, grace: Duration) -> Option<i32> {
    soft_kill(child, instance_id);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok().and_then(|s| s.code()),
        Err(_) => {
            warn!(instance_id, grace_s = grace.as_secs(), "grace elapsed, killing child");
            let _ = child.start_kill();
            child.wait().await.ok().and_then(|s| s.code())
        }
    }
}

#[cfg(unix)]
fn soft_kill(child: &Child, instance_id: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(instance_id, %e, "SIGTERM failed");
            }
        }
        None => info!(instance_id, "child already reaped before soft kill"),
    }
}

#[cfg(not(unix))]
fn soft_kill(child: &Child, _instance_id: &str) {
    // no soft-termination signal on this platform
    let _ = child;
}
