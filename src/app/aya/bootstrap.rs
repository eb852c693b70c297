use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::parse::has_abstract_socket;
use crate::app::adb::runner::{device_args, shell_args, CommandRunner};
use crate::app::cancel::CancelToken;
use crate::app::error::AppError;

const DEFAULT_PAYLOAD_NAME: &str = "aya.dex";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    Probe,
    LivenessCheck,
    PushPayload,
    StartServer,
    WaitForServer,
    Reconnect,
}

impl BootstrapStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::LivenessCheck => "liveness check",
            Self::PushPayload => "push payload",
            Self::StartServer => "start server",
            Self::WaitForServer => "wait for server",
            Self::Reconnect => "connect after start",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub socket_name: String,
    pub remote_dir: String,
    pub server_class: String,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
}

/// Gets the companion server running on one device.
pub struct Bootstrap<'a> {
    runner: Arc<dyn CommandRunner>,
    serial: &'a str,
    spec: &'a ServerSpec,
    cancel: &'a CancelToken,
    trace_id: &'a str,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        serial: &'a str,
        spec: &'a ServerSpec,
        cancel: &'a CancelToken,
        trace_id: &'a str,
    ) -> Self {
        Self {
            runner,
            serial,
            spec,
            cancel,
            trace_id,
        }
    }

    /// Connects through `connect`, starting the server first if the direct
    /// attempt fails. Cancellation is checked before every step.
    pub fn connect<T>(
        &self,
        payload: &Path,
        mut connect: impl FnMut() -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        self.cancel.check(self.trace_id)?;
        let socket_present = self.is_running();
        match self.probe(socket_present, &mut connect) {
            Ok(connection) => return Ok(connection),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                info!(
                    trace_id = %self.trace_id,
                    serial = %self.serial,
                    error = %err,
                    "initial connection failed; starting companion server"
                );
            }
        }

        self.cancel.check(self.trace_id)?;
        if socket_present {
            debug!(trace_id = %self.trace_id, "companion socket present; skipping push and start");
        } else {
            self.cancel.check(self.trace_id)?;
            self.push_payload(payload)
                .map_err(|err| AppError::bootstrap(BootstrapStep::PushPayload.as_str(), err))?;

            self.cancel.check(self.trace_id)?;
            self.start_server(payload)
                .map_err(|err| AppError::bootstrap(BootstrapStep::StartServer.as_str(), err))?;
        }

        self.cancel.check(self.trace_id)?;
        self.wait_for_server()
            .map_err(|err| AppError::bootstrap(BootstrapStep::WaitForServer.as_str(), err))?;

        self.cancel.check(self.trace_id)?;
        connect().map_err(|err| AppError::bootstrap(BootstrapStep::Reconnect.as_str(), err))
    }

    fn probe<T>(
        &self,
        socket_present: bool,
        connect: &mut impl FnMut() -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        // A forward to a missing abstract socket still accepts TCP, so the
        // socket listing is consulted before dialing.
        if !socket_present {
            self.cancel.check(self.trace_id)?;
            return Err(AppError::dependency("server not running", self.trace_id));
        }
        self.cancel.check(self.trace_id)?;
        connect()
    }

    /// Soft check: any failure reads as "not running".
    pub fn is_running(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let args = shell_args(self.serial, &["cat", "/proc/net/unix"]);
        match self.runner.run(&args, self.trace_id) {
            Ok(output) => has_abstract_socket(&output.stdout, &self.spec.socket_name),
            Err(err) => {
                debug!(trace_id = %self.trace_id, error = %err, "liveness check failed");
                false
            }
        }
    }

    pub fn remote_payload_path(&self, payload: &Path) -> String {
        let name = payload
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_PAYLOAD_NAME);
        format!("{}/{}", self.spec.remote_dir.trim_end_matches('/'), name)
    }

    fn push_payload(&self, payload: &Path) -> Result<(), AppError> {
        info!(
            trace_id = %self.trace_id,
            serial = %self.serial,
            payload = %payload.display(),
            "pushing companion payload"
        );

        let mkdir = shell_args(self.serial, &["mkdir", "-p", &self.spec.remote_dir]);
        match self.runner.run(&mkdir, self.trace_id) {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                trace_id = %self.trace_id,
                output = %output.combined().trim(),
                "mkdir warning"
            ),
            Err(err) => warn!(trace_id = %self.trace_id, error = %err, "mkdir warning"),
        }

        self.cancel.check(self.trace_id)?;

        let local = payload.to_string_lossy();
        let remote = self.remote_payload_path(payload);
        let push = device_args(self.serial, &["push", &local, &remote]);
        let output = self.runner.run(&push, self.trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("adb push exited with {:?}: {}", output.exit_code, output.combined().trim()),
                self.trace_id,
            ));
        }
        info!(trace_id = %self.trace_id, remote = %remote, "payload pushed");
        Ok(())
    }

    fn start_server(&self, payload: &Path) -> Result<(), AppError> {
        let classpath = format!("CLASSPATH={}", self.remote_payload_path(payload));
        let args = shell_args(
            self.serial,
            &[&classpath, "app_process", "/system/bin", &self.spec.server_class, "&"],
        );
        info!(trace_id = %self.trace_id, serial = %self.serial, "starting companion server");
        self.runner.spawn_detached(&args, self.trace_id)
    }

    fn wait_for_server(&self) -> Result<(), AppError> {
        debug!(trace_id = %self.trace_id, "waiting for companion server");
        let deadline = Instant::now() + self.spec.ready_timeout;
        loop {
            if self.cancel.wait_timeout(self.spec.ready_poll_interval) {
                return Err(AppError::cancelled(self.trace_id));
            }
            if Instant::now() > deadline {
                return Err(AppError::timeout(
                    format!(
                        "server start timeout after {}ms",
                        self.spec.ready_timeout.as_millis()
                    ),
                    self.trace_id,
                ));
            }
            if self.is_running() {
                info!(trace_id = %self.trace_id, "companion server is ready");
                return Ok(());
            }
        }
    }
}
