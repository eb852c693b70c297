use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use prost::Message;
use tracing::{debug, info, warn};

use crate::app::adb::parse::parse_forward_port;
use crate::app::adb::runner::{device_args, CommandRunner};
use crate::app::aya::framing::encode_frame;
use crate::app::cancel::CancelToken;
use crate::app::error::AppError;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A `localhost:<port>` → `localabstract:<socket>` forward. Removed at most
/// once, either explicitly or when dropped.
pub struct PortForward {
    runner: Arc<dyn CommandRunner>,
    serial: String,
    local_port: u16,
    removed: AtomicBool,
    trace_id: String,
}

impl PortForward {
    pub fn create(
        runner: Arc<dyn CommandRunner>,
        serial: &str,
        socket_name: &str,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let target = format!("localabstract:{socket_name}");
        let args = device_args(serial, &["forward", "tcp:0", &target]);
        let output = runner.run(&args, trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("adb forward failed: {}", output.combined().trim()),
                trace_id,
            ));
        }
        let local_port = parse_forward_port(&output.stdout).ok_or_else(|| {
            AppError::protocol(
                format!("failed to get forwarded port from {:?}", output.stdout.trim()),
                trace_id,
            )
        })?;
        info!(trace_id = %trace_id, serial = %serial, local_port, "adb forward established");
        Ok(Self {
            runner,
            serial: serial.to_string(),
            local_port,
            removed: AtomicBool::new(false),
            trace_id: trace_id.to_string(),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let spec = format!("tcp:{}", self.local_port);
        let args = device_args(&self.serial, &["forward", "--remove", &spec]);
        match self.runner.run(&args, &self.trace_id) {
            Ok(output) if output.success() => {
                debug!(trace_id = %self.trace_id, local_port = self.local_port, "adb forward removed");
            }
            Ok(output) => warn!(
                trace_id = %self.trace_id,
                local_port = self.local_port,
                output = %output.combined().trim(),
                "failed to remove forward"
            ),
            Err(err) => warn!(
                trace_id = %self.trace_id,
                local_port = self.local_port,
                error = %err,
                "failed to remove forward"
            ),
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Byte stream to the companion server, reached through a port forward.
pub struct FramedChannel {
    forward: PortForward,
    writer: Mutex<TcpStream>,
    stream: TcpStream,
}

impl FramedChannel {
    /// Forwards a local port to the device socket and dials it. Any failure
    /// after the forward exists removes it again.
    pub fn open(
        runner: Arc<dyn CommandRunner>,
        serial: &str,
        socket_name: &str,
        dial_timeout: Duration,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        cancel.check(trace_id)?;
        let forward = PortForward::create(runner, serial, socket_name, trace_id)?;

        // Dropping `forward` on any early return tears it down.
        cancel.check(trace_id)?;
        let stream = dial(forward.local_port(), dial_timeout, cancel, trace_id)?;
        let _ = stream.set_nodelay(true);
        let writer = stream.try_clone().map_err(|err| {
            AppError::system(format!("failed to clone socket: {err}"), trace_id)
        })?;
        info!(trace_id = %trace_id, local_port = forward.local_port(), "socket connection established");

        Ok(Self {
            forward,
            writer: Mutex::new(writer),
            stream,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.forward.local_port()
    }

    /// A second handle for the read loop.
    pub fn reader(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    pub fn write_message<M: Message>(&self, message: &M) -> io::Result<()> {
        let frame = encode_frame(message);
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write_all(&frame)?;
        writer.flush()
    }

    /// Closes the socket. Reads blocked on any clone of it fail promptly.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    pub fn remove_forward(&self) {
        self.forward.remove();
    }
}

fn dial(
    port: u16,
    timeout: Duration,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<TcpStream, AppError> {
    let addr = format!("localhost:{port}");
    let candidates: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|err| AppError::system(format!("failed to resolve {addr}: {err}"), trace_id))?
        .collect();

    // connect_timeout cannot be interrupted, so the dial runs on its own thread
    // and this side watches for cancellation.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address to dial");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    let _ = tx.send(Ok(stream));
                    return;
                }
                Err(err) => last_err = err,
            }
        }
        let _ = tx.send(Err(last_err));
    });

    let deadline = Instant::now() + timeout * 2;
    loop {
        cancel.check(trace_id)?;
        match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                return Err(AppError::dependency(
                    format!("failed to connect to {addr}: {err}"),
                    trace_id,
                ))
            }
            Err(mpsc::RecvTimeoutError::Timeout) if Instant::now() < deadline => continue,
            Err(_) => {
                return Err(AppError::timeout(
                    format!("failed to connect to {addr}: dial timed out"),
                    trace_id,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{failed, ok_stdout, ScriptedRunner};
    use std::net::TcpListener;

    fn forwarding_runner(port: u16) -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(move |args| {
            if args.iter().any(|arg| arg == "--remove") {
                ok_stdout("")
            } else {
                ok_stdout(&format!("{port}\n"))
            }
        }))
    }

    #[test]
    fn opens_socket_and_removes_forward_once() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let runner = forwarding_runner(port);

        let channel = FramedChannel::open(
            runner.clone(),
            "SERIAL",
            "aya",
            Duration::from_secs(5),
            &CancelToken::new(),
            "t",
        )
        .expect("open");
        assert_eq!(channel.local_port(), port);
        assert_eq!(
            runner.calls()[0],
            vec!["-s", "SERIAL", "forward", "tcp:0", "localabstract:aya"]
        );

        channel.remove_forward();
        channel.remove_forward();
        drop(channel);
        assert_eq!(runner.count_calls("--remove"), 1);
    }

    #[test]
    fn dial_failure_tears_forward_down() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let runner = forwarding_runner(port);

        let result = FramedChannel::open(
            runner.clone(),
            "SERIAL",
            "aya",
            Duration::from_millis(500),
            &CancelToken::new(),
            "t",
        );
        assert!(result.is_err());
        assert_eq!(runner.count_calls("--remove"), 1);
    }

    #[test]
    fn forward_failure_is_reported() {
        let runner = Arc::new(ScriptedRunner::new(|_args| failed("error: device offline")));
        let err = FramedChannel::open(
            runner.clone(),
            "SERIAL",
            "aya",
            Duration::from_secs(1),
            &CancelToken::new(),
            "t",
        )
        .err()
        .expect("forward error");
        assert!(err.error.contains("device offline"));
        assert_eq!(runner.count_calls("--remove"), 0);
    }

    #[test]
    fn cancelled_before_open_skips_forward() {
        let runner = forwarding_runner(1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = FramedChannel::open(runner.clone(), "S", "aya", Duration::from_secs(1), &cancel, "t")
            .err()
            .expect("cancelled");
        assert!(err.is_cancelled());
        assert!(runner.calls().is_empty());
    }
}
