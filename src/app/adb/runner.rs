use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::error::AppError;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way adb prints both to a terminal.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        if self.stdout.ends_with('\n') {
            format!("{}{}", self.stdout, self.stderr)
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes adb invocations. The tracker and the companion client only ever
/// talk to the device through this seam.
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[String], trace_id: &str) -> Result<CommandOutput, AppError>;

    /// Starts the command without waiting for it to exit.
    fn spawn_detached(&self, args: &[String], trace_id: &str) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct AdbRunner {
    program: String,
    timeout: Duration,
}

impl AdbRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl CommandRunner for AdbRunner {
    fn run(&self, args: &[String], trace_id: &str) -> Result<CommandOutput, AppError> {
        debug!(trace_id = %trace_id, args = ?args, "running adb");
        run_command_with_timeout(&self.program, args, self.timeout, trace_id)
    }

    fn spawn_detached(&self, args: &[String], trace_id: &str) -> Result<(), AppError> {
        debug!(trace_id = %trace_id, args = ?args, "spawning detached adb");
        spawn_background(&self.program, args, trace_id)
    }
}

pub fn device_args(serial: &str, rest: &[&str]) -> Vec<String> {
    let mut args = Vec::with_capacity(rest.len() + 2);
    if !serial.is_empty() {
        args.push("-s".to_string());
        args.push(serial.to_string());
    }
    args.extend(rest.iter().map(|value| value.to_string()));
    args
}

pub fn shell_args(serial: &str, rest: &[&str]) -> Vec<String> {
    let mut args = device_args(serial, &["shell"]);
    args.extend(rest.iter().map(|value| value.to_string()));
    args
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::dependency(format!("Failed to spawn {program}: {err}"), trace_id))?;

    // Both pipes are drained concurrently; a full pipe buffer would otherwise
    // stall the child until the timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let stdout_handle = std::thread::spawn(move || drain(stdout));
    let stderr_handle = std::thread::spawn(move || drain(stderr));

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::timeout(
                        format!("{program} {} timed out", args.join(" ")),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn drain(mut reader: impl Read) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    buffer
}

/// Fire-and-forget launch. The child is reaped on its own thread so it never
/// lingers as a zombie.
pub fn spawn_background(program: &str, args: &[String], trace_id: &str) -> Result<(), AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| AppError::dependency(format!("Failed to spawn {program}: {err}"), trace_id))?;

    std::thread::Builder::new()
        .name("detached-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        })
        .map_err(|err| AppError::system(format!("Failed to spawn reaper thread: {err}"), trace_id))?;
    Ok(())
}
