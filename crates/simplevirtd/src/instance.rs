//! One supervised guest: its descriptor, NICs, PID cache, retry counter,
//! and the operation slot the reconciler dispatches on.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{self, VirtualMachine};
use crate::error::{Error, Result};
use crate::netdev::Netdev;
use crate::nic::{self, Nic};
use crate::qemu;
use crate::qmp::Qmp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Start,
    Shutdown,
    Reset,
}

/// One-shot channel a caller may attach to receive the outcome of the
/// tick that executes its request.
pub type OpResult = oneshot::Sender<Result<()>>;

struct OpSlot {
    op: Operation,
    result: Option<OpResult>,
}

pub struct Instance {
    name: String,
    config: VirtualMachine,
    nics: Vec<Nic>,
    runtime_dir: PathBuf,
    netdev: Arc<Netdev>,

    /// Cached PID, -1 when unknown. Refreshed from the PID file.
    pid: AtomicI32,
    retries: AtomicU32,
    op: RwLock<OpSlot>,
}

impl Instance {
    /// Read the descriptor and allocate NICs. Does NOT launch the
    /// hypervisor; the reconciler does that once it sees the new entry.
    pub fn new(
        config_dir: &Path,
        runtime_dir: &Path,
        netdev: Arc<Netdev>,
        name: &str,
        result: Option<OpResult>,
    ) -> Result<Instance> {
        let mut config = config::parse_config(config_dir, name)?;
        let nics = nic::allocate(&netdev, name, &mut config)?;

        Ok(Instance {
            name: name.to_string(),
            config,
            nics,
            runtime_dir: runtime_dir.to_path_buf(),
            netdev,
            pid: AtomicI32::new(-1),
            retries: AtomicU32::new(0),
            op: RwLock::new(OpSlot {
                op: Operation::Start,
                result,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // PID file and monitor socket paths are derived, never stored.

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.pid", self.name))
    }

    pub fn qmp_socket(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.sock", self.name))
    }

    fn qmp(&self) -> Qmp {
        Qmp::new(self.qmp_socket())
    }

    /// Snapshot the pending operation and detach its result channel.
    /// Called once per reconciler tick; the taken sender receives exactly
    /// that tick's outcome.
    pub async fn take_op(&self) -> (Operation, Option<OpResult>) {
        let mut slot = self.op.write().await;
        (slot.op, slot.result.take())
    }

    /// Request an operation. A result channel attached by an earlier,
    /// not-yet-executed request is dropped (its caller observes a closed
    /// channel).
    pub async fn request_op(&self, op: Operation, result: Option<OpResult>) {
        let mut slot = self.op.write().await;
        slot.op = op;
        slot.result = result;
    }

    /// Put the instance back under normal supervision after a reset tick,
    /// unless another operation was requested meanwhile.
    pub async fn finish_reset(&self) {
        let mut slot = self.op.write().await;
        if slot.op == Operation::Reset {
            slot.op = Operation::Start;
        }
    }

    fn read_pid_file(&self) -> Option<i32> {
        let content = std::fs::read_to_string(self.pid_file()).ok()?;
        content.trim().parse().ok().filter(|pid| *pid > 0)
    }

    fn pid_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    /// Whether the guest process exists: trust the cached PID first
    /// (cheap `kill(pid, 0)`), then fall back to re-reading the PID file
    /// and cache the result.
    pub fn process_running(&self) -> bool {
        let cached = self.pid.load(Ordering::SeqCst);
        if cached > 0 && Self::pid_alive(cached) {
            return true;
        }

        let Some(pid) = self.read_pid_file() else {
            return false;
        };
        self.pid.store(pid, Ordering::SeqCst);

        Self::pid_alive(pid)
    }

    /// Monitor status string, degraded to `exited` when the monitor is
    /// unreachable or confused.
    pub async fn status(&self) -> String {
        match self.qmp().query_status().await {
            Ok(st) => st.status,
            Err(e) => {
                debug!("monitor: {}: status: {e}", self.name);
                "exited".to_string()
            }
        }
    }

    /// Fully running: the process exists and the monitor reports the
    /// guest as running.
    pub async fn running(&self) -> bool {
        if !self.process_running() {
            return false;
        }

        match self.qmp().query_status().await {
            Ok(st) => st.running,
            Err(e) => {
                debug!("monitor: {}: running: {e}", self.name);
                false
            }
        }
    }

    /// One supervision tick: no-op while the process is up, relaunch while
    /// retries remain, `RetryExhausted` once they don't. The retry counter
    /// is never reset on success; a healthy guest simply stops failing the
    /// liveness check.
    pub async fn start(&self) -> Result<()> {
        if self.process_running() {
            return Ok(());
        }

        let retries = self.retries.load(Ordering::SeqCst);
        if retries > self.config.maximum_retries {
            return Err(Error::RetryExhausted {
                name: self.name.clone(),
                max: self.config.maximum_retries,
            });
        }

        info!("monitor: {}: start", self.name);
        if retries > 0 {
            warn!("monitor: {}: start: retry {retries}", self.name);
        }

        let qmp_socket = self.qmp_socket().to_string_lossy().into_owned();
        let pid_file = self.pid_file().to_string_lossy().into_owned();

        match qemu::run(&self.config, &self.name, &qmp_socket, &pid_file).await {
            Ok(()) => {
                info!("monitor: {}: start: done", self.name);
                Ok(())
            }
            Err(e) => {
                warn!("monitor: {}: start: failed", self.name);
                if retries == 0 {
                    warn!(
                        "monitor: {}: start: will retry {} times ...",
                        self.name, self.config.maximum_retries
                    );
                }
                self.retries.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Best-effort graceful shutdown escalating to SIGKILL, then NIC
    /// release. Registry removal is the supervisor's job once this
    /// returns `Ok`.
    pub async fn shutdown(&self) -> Result<()> {
        warn!("monitor: {}: shutdown", self.name);

        let wait_for_powerdown = match self.qmp().powerdown().await {
            Ok(()) => {
                info!(
                    "monitor: {}: sent powerdown command ({}s timeout)",
                    self.name, self.config.shutdown_timeout
                );
                true
            }
            Err(Error::MonitorUnreachable(e)) => {
                info!(
                    "monitor: {}: monitor unreachable ({e}), escalating to SIGKILL",
                    self.name
                );
                false
            }
            Err(e) => {
                error!("monitor: {}: powerdown failed: {e}", self.name);
                true
            }
        };

        if wait_for_powerdown {
            for _ in 0..self.config.shutdown_timeout {
                if !self.process_running() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        if self.process_running() {
            info!("monitor: {}: sending SIGKILL", self.name);

            // process_running just validated the cached PID
            let pid = self.pid.load(Ordering::SeqCst);
            kill(Pid::from_raw(pid), Signal::SIGKILL)
                .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        }

        info!("monitor: {}: waiting for process to exit", self.name);
        while self.process_running() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        nic::cleanup(&self.netdev, &self.name, &self.nics)?;

        warn!("monitor: {}: shutdown: done", self.name);

        Ok(())
    }

    /// ACPI reset via the monitor. A no-op when the guest is not running;
    /// the supervisor restores `op = Start` after this tick either way.
    pub async fn reset(&self) -> Result<()> {
        if !self.running().await {
            return Ok(());
        }

        warn!("monitor: {}: reset", self.name);
        self.qmp().reset().await?;
        warn!("monitor: {}: reset: done", self.name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_instance(dir: &Path) -> Instance {
        std::fs::write(
            dir.join("vm01.yml"),
            "drives:\n  - file: /srv/vm01.img\nnics:\n  - mac_address: 52:54:00:fc:70:3b\n",
        )
        .unwrap();

        Instance::new(dir, dir, Arc::new(Netdev::new()), "vm01", None).unwrap()
    }

    #[test]
    fn test_derived_paths() {
        let dir = tempfile::tempdir().unwrap();
        let inst = test_instance(dir.path());
        assert_eq!(inst.pid_file(), dir.path().join("vm01.pid"));
        assert_eq!(inst.qmp_socket(), dir.path().join("vm01.sock"));
    }

    #[test]
    fn test_process_running_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let inst = test_instance(dir.path());
        assert!(!inst.process_running());
    }

    #[test]
    fn test_process_running_with_garbage_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let inst = test_instance(dir.path());
        std::fs::write(inst.pid_file(), "not-a-pid\n").unwrap();
        assert!(!inst.process_running());
    }

    #[test]
    fn test_process_running_reads_and_caches_pid() {
        let dir = tempfile::tempdir().unwrap();
        let inst = test_instance(dir.path());

        // our own PID is as alive as it gets
        std::fs::write(inst.pid_file(), format!("{}\n", std::process::id())).unwrap();
        assert!(inst.process_running());
        assert_eq!(inst.pid.load(Ordering::SeqCst), std::process::id() as i32);

        // cache survives losing the PID file
        std::fs::remove_file(inst.pid_file()).unwrap();
        assert!(inst.process_running());
    }

    #[tokio::test]
    async fn test_op_slot_take_and_request() {
        let dir = tempfile::tempdir().unwrap();
        let inst = test_instance(dir.path());

        let (op, result) = inst.take_op().await;
        assert_eq!(op, Operation::Start);
        assert!(result.is_none());

        let (tx, mut rx) = oneshot::channel();
        inst.request_op(Operation::Shutdown, Some(tx)).await;

        let (op, result) = inst.take_op().await;
        assert_eq!(op, Operation::Shutdown);
        assert!(result.is_some());

        // the sender was detached; a second take has nothing to deliver to
        let (_, result2) = inst.take_op().await;
        assert!(result2.is_none());

        result.unwrap().send(Ok(())).unwrap();
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_finish_reset_keeps_newer_request() {
        let dir = tempfile::tempdir().unwrap();
        let inst = test_instance(dir.path());

        inst.request_op(Operation::Reset, None).await;
        inst.finish_reset().await;
        assert_eq!(inst.take_op().await.0, Operation::Start);

        inst.request_op(Operation::Shutdown, None).await;
        inst.finish_reset().await;
        assert_eq!(inst.take_op().await.0, Operation::Shutdown);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let inst = test_instance(dir.path());
        inst.retries.store(
            inst.config.maximum_retries + 1,
            Ordering::SeqCst,
        );

        let err = inst.start().await.unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { .. }), "got: {err}");
        assert_eq!(
            err.to_string(),
            "monitor: vm01: maximum number of retries exceeded (5)"
        );
    }
}
