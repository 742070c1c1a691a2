//! External worker processes.
//!
//! Backends that live in their own binary are started with
//! `--addr 127.0.0.1:<port>` and reached through the wire client once their
//! `Health` call answers.

use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::worker::{CallContext, NetworkClient, WorkerClient};

/// Health polls before a spawned worker is given up on.
pub const STARTUP_ATTEMPTS: u32 = 30;
pub const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A spawned worker binary. The child is killed when this is dropped.
pub struct WorkerProcess {
    backend: String,
    address: String,
    child: Mutex<Option<Child>>,
}

impl WorkerProcess {
    /// Locates `<backend>` in `binary_dir` first, then on `PATH`.
    pub fn locate(binary_dir: Option<&Path>, backend: &str) -> anyhow::Result<PathBuf> {
        if let Some(dir) = binary_dir {
            let candidate = dir.join(backend);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        which::which(backend)
            .map_err(|_| anyhow::anyhow!("worker binary '{}' not found in worker dir or PATH", backend))
    }

    /// Spawns the binary on a free loopback port and waits until it is healthy.
    pub async fn spawn(binary: &Path, backend: &str, extra_args: &[String]) -> anyhow::Result<Self> {
        let port = free_port()?;
        let address = format!("127.0.0.1:{}", port);

        info!("Starting {} worker: {} --addr {}", backend, binary.display(), address);
        let child = Command::new(binary)
            .arg("--addr")
            .arg(&address)
            .args(extra_args)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn {} worker: {}", backend, e))?;

        let process = Self {
            backend: backend.to_string(),
            address,
            child: Mutex::new(Some(child)),
        };
        process.wait_ready(STARTUP_ATTEMPTS, STARTUP_POLL_INTERVAL).await?;
        Ok(process)
    }

    async fn wait_ready(&self, attempts: u32, interval: Duration) -> anyhow::Result<()> {
        let client = NetworkClient::new(&self.address);
        for attempt in 1..=attempts {
            sleep(interval).await;

            if let Some(status) = self.exit_status() {
                return Err(anyhow::anyhow!("{} worker exited during startup ({})", self.backend, status));
            }
            if client.health_check(&CallContext::background()).await {
                info!("✅ {} worker ready on {} after {} attempts", self.backend, self.address, attempt);
                return Ok(());
            }
            if attempt % 5 == 0 {
                info!("Still waiting for {} worker... ({}/{})", self.backend, attempt, attempts);
            }
        }
        self.kill();
        Err(anyhow::anyhow!(
            "{} worker failed to become healthy after {} attempts",
            self.backend,
            attempts
        ))
    }

    fn exit_status(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().ok()?;
        guard.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn kill(&self) {
        let Ok(mut guard) = self.child.lock() else { return };
        if let Some(mut child) = guard.take() {
            match child.kill() {
                Ok(_) => {
                    info!("{} worker on {} stopped", self.backend, self.address);
                    let _ = child.wait();
                }
                Err(e) => warn!("Failed to kill {} worker: {}", self.backend, e),
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Asks the OS for an unused loopback port.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
