use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{ControllerError, ProxyController};

pub const DEFAULT_BINARY: &str = "sing-box-extensions";
const SYSTEMD_UNIT: &str = "sing-box-extensions";
/// Where the systemd unit expects its configuration.
const SYSTEMD_CONFIG_PATH: &str = "/etc/sing-box-extensions/config.json";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a directly spawned proxy must stay up to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// How the proxy process is supervised.
#[derive(Debug, Clone)]
pub enum ServiceMode {
    /// A systemd unit that reads its configuration from `config_path`.
    Systemd { unit: String, config_path: PathBuf },
    /// No supervisor: kill the running instance and spawn a new one.
    Direct,
}

impl ServiceMode {
    /// The packaged `sing-box-extensions` unit.
    pub fn systemd() -> Self {
        ServiceMode::Systemd {
            unit: SYSTEMD_UNIT.into(),
            config_path: PathBuf::from(SYSTEMD_CONFIG_PATH),
        }
    }

    pub fn select(no_systemd: bool) -> Self {
        if no_systemd {
            ServiceMode::Direct
        } else {
            Self::systemd()
        }
    }
}

/// Drives the sing-box binary through its CLI and, optionally, systemd.
///
/// In direct mode the controller owns the proxy process it spawned and
/// replaces it on every restart.
pub struct SingBoxController {
    binary: PathBuf,
    mode: ServiceMode,
    command_timeout: Duration,
    startup_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl SingBoxController {
    pub fn new(binary: impl Into<PathBuf>, mode: ServiceMode) -> Self {
        Self {
            binary: binary.into(),
            mode,
            command_timeout: COMMAND_TIMEOUT,
            startup_grace: STARTUP_GRACE,
            child: Mutex::new(None),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Run a short-lived command to completion. A command that outlives the
    /// timeout is killed, not left running.
    async fn run(&self, cmd: &mut Command) -> Result<std::process::Output, ControllerError> {
        let output = tokio::time::timeout(self.command_timeout, cmd.kill_on_drop(true).output())
            .await
            .map_err(|_| ControllerError::Timeout(self.command_timeout.as_secs()))??;
        Ok(output)
    }

    /// `pkill -f` pattern matching an instance spawned by `restart`.
    fn instance_pattern(&self) -> String {
        let mut pattern = String::new();
        for c in self.binary.to_string_lossy().chars() {
            if "\\.^$|?*+()[]{}".contains(c) {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push_str(" run --config");
        pattern
    }

    async fn restart_direct(&self, config: &Path) -> Result<(), ControllerError> {
        let mut running = self.child.lock().await;

        match running.take() {
            Some(mut previous) => {
                if let Err(e) = previous.kill().await {
                    log::debug!("Previous proxy instance already gone: {}", e);
                }
            }
            None => {
                // An instance left over from an earlier run of this server.
                // Nothing running is fine; pkill exits non-zero then.
                let _ = self
                    .run(Command::new("pkill").arg("-9").arg("-f").arg(self.instance_pattern()))
                    .await;
            }
        }

        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("--config")
            .arg(config)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| ControllerError::Restart(format!("spawn failed: {}", e)))?;

        tokio::time::sleep(self.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(ControllerError::Restart(format!(
                "{} exited right after start: {}",
                self.binary.display(),
                status
            )));
        }

        log::info!(
            "Started {} (pid {:?})",
            self.binary.display(),
            child.id()
        );
        *running = Some(child);
        Ok(())
    }
}

#[async_trait]
impl ProxyController for SingBoxController {
    async fn validate(&self, config: &Path) -> Result<(), ControllerError> {
        let output = self
            .run(Command::new(&self.binary).arg("check").arg("--config").arg(config))
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControllerError::Invalid(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn restart(&self, config: &Path) -> Result<(), ControllerError> {
        match &self.mode {
            ServiceMode::Systemd { unit, config_path } => {
                if let Some(parent) = config_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(config, config_path).await?;

                let output = self
                    .run(Command::new("systemctl").arg("restart").arg(unit))
                    .await?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(ControllerError::Restart(format!(
                        "systemctl restart {}: {}",
                        unit,
                        stderr.trim()
                    )));
                }
                log::info!("Restarted {} via systemd", unit);
            }
            ServiceMode::Direct => self.restart_direct(config).await?,
        }
        Ok(())
    }
}
