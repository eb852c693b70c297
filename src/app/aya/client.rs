use std::collections::HashMap;
use std::io::{self, Read};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use prost::Message;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::runner::CommandRunner;
use crate::app::aya::bootstrap::{Bootstrap, ServerSpec};
use crate::app::aya::channel::FramedChannel;
use crate::app::aya::framing::FrameDecoder;
use crate::app::aya::proto::{Request, Response};
use crate::app::cancel::CancelToken;
use crate::app::config::AyaSettings;
use crate::app::error::AppError;

const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server: ServerSpec,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub close_wait: Duration,
}

impl ClientOptions {
    pub fn from_settings(settings: &AyaSettings) -> Self {
        Self {
            server: ServerSpec {
                socket_name: settings.socket_name.clone(),
                remote_dir: settings.remote_dir.clone(),
                server_class: settings.server_class.clone(),
                ready_timeout: Duration::from_millis(settings.ready_timeout_ms),
                ready_poll_interval: Duration::from_millis(settings.ready_poll_interval_ms),
            },
            dial_timeout: Duration::from_millis(settings.dial_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            close_wait: Duration::from_millis(settings.close_wait_ms),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_settings(&AyaSettings::default())
    }
}

/// id → waiting caller. An entry is claimed exactly once: by the read loop
/// when its response arrives, or by the caller when it gives up.
#[derive(Default)]
struct PendingTable {
    waiters: Mutex<HashMap<String, SyncSender<Response>>>,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SyncSender<Response>>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, id: &str) -> Receiver<Response> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.lock().insert(id.to_string(), tx);
        rx
    }

    fn claim(&self, id: &str) -> Option<SyncSender<Response>> {
        self.lock().remove(id)
    }

    /// Drops every sender so blocked callers wake with a disconnect.
    fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct Connection {
    channel: FramedChannel,
    alive: Arc<AtomicBool>,
    read_done: Mutex<Option<Receiver<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Client for the companion server on one device.
///
/// Calls may be issued from many threads at once over the single
/// connection; responses are matched back to callers by request id, so
/// completion order follows the server, not submission order.
pub struct AyaClient {
    runner: Arc<dyn CommandRunner>,
    serial: String,
    options: ClientOptions,
    cancel: CancelToken,
    trace_id: String,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl AyaClient {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        serial: impl Into<String>,
        options: ClientOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            runner,
            serial: serial.into(),
            options,
            cancel,
            trace_id: Uuid::new_v4().to_string(),
            pending: Arc::new(PendingTable::default()),
            closed: Arc::new(AtomicBool::new(false)),
            connection: Mutex::new(None),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_connected(&self) -> bool {
        self.current_connection()
            .map(|connection| connection.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        match self.connection.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Connects to the companion server, pushing and starting it from
    /// `payload` when it is not already reachable.
    pub fn connect(&self, payload: &Path) -> Result<(), AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::validation("client is closed", &self.trace_id));
        }
        if self.is_connected() {
            return Ok(());
        }
        self.cancel.check(&self.trace_id)?;

        let bootstrap = Bootstrap::new(
            Arc::clone(&self.runner),
            &self.serial,
            &self.options.server,
            &self.cancel,
            &self.trace_id,
        );
        let channel = bootstrap.connect(payload, || {
            FramedChannel::open(
                Arc::clone(&self.runner),
                &self.serial,
                &self.options.server.socket_name,
                self.options.dial_timeout,
                &self.cancel,
                &self.trace_id,
            )
        })?;

        let reader = channel.reader().map_err(|err| {
            AppError::system(format!("failed to clone socket: {err}"), &self.trace_id)
        })?;
        let alive = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let loop_ctx = ReadLoop {
            stream: reader,
            pending: Arc::clone(&self.pending),
            closed: Arc::clone(&self.closed),
            alive: Arc::clone(&alive),
            trace_id: self.trace_id.clone(),
        };
        let handle = thread::spawn(move || {
            loop_ctx.run();
            drop(done_tx);
        });

        let connection = Arc::new(Connection {
            channel,
            alive,
            read_done: Mutex::new(Some(done_rx)),
            reader: Mutex::new(Some(handle)),
        });
        match self.connection.lock() {
            Ok(mut guard) => *guard = Some(connection),
            Err(poisoned) => *poisoned.into_inner() = Some(connection),
        }
        info!(trace_id = %self.trace_id, serial = %self.serial, "companion client connected");
        Ok(())
    }

    /// Sends one request and blocks until its response, the request
    /// timeout, or cancellation of the client's token.
    pub fn send_message<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<Map<String, Value>, AppError> {
        self.send_message_with_cancel(method, params, &self.cancel)
    }

    /// Like [`send_message`](Self::send_message) but cancelled by `cancel`.
    pub fn send_message_with_cancel<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
        cancel: &CancelToken,
    ) -> Result<Map<String, Value>, AppError> {
        let connection = match self.current_connection() {
            Some(connection)
                if !self.closed.load(Ordering::SeqCst)
                    && connection.alive.load(Ordering::SeqCst) =>
            {
                connection
            }
            _ => return Err(AppError::not_connected(&self.trace_id)),
        };
        cancel.check(&self.trace_id)?;

        let params = serde_json::to_string(params).map_err(|err| {
            AppError::validation(format!("failed to marshal params: {err}"), &self.trace_id)
        })?;
        let id = Uuid::new_v4().to_string();
        let request = Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        debug!(trace_id = %self.trace_id, method = %method, id = %id, "sending request");

        let rx = self.register_waiter(&connection, &id)?;
        if let Err(err) = connection.channel.write_message(&request) {
            self.pending.claim(&id);
            return Err(AppError::system(
                format!("failed to write request: {err}"),
                &self.trace_id,
            ));
        }

        let response = self.wait_for_response(&id, &rx, cancel)?;
        debug!(trace_id = %self.trace_id, id = %response.id, "received response");

        serde_json::from_str::<Map<String, Value>>(&response.result).map_err(|err| {
            AppError::protocol(
                format!("failed to unmarshal result: {err}, raw: {}", response.result),
                &self.trace_id,
            )
        })
    }

    /// Registers before the write so a fast response always finds its
    /// waiter. A read loop that exited in the meantime has already failed
    /// the table, so liveness is checked again once the entry is in.
    fn register_waiter(&self, connection: &Connection, id: &str) -> Result<Receiver<Response>, AppError> {
        let rx = self.pending.register(id);
        if !connection.alive.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            self.pending.claim(id);
            return Err(AppError::not_connected(&self.trace_id));
        }
        Ok(rx)
    }

    fn wait_for_response(
        &self,
        id: &str,
        rx: &Receiver<Response>,
        cancel: &CancelToken,
    ) -> Result<Response, AppError> {
        let deadline = Instant::now() + self.options.request_timeout;
        loop {
            if cancel.is_cancelled() {
                self.pending.claim(id);
                return Err(AppError::cancelled(&self.trace_id));
            }
            let now = Instant::now();
            if now >= deadline {
                self.pending.claim(id);
                return Err(AppError::timeout("request timeout", &self.trace_id));
            }
            match rx.recv_timeout(WAIT_SLICE.min(deadline - now)) {
                Ok(response) => return Ok(response),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.pending.claim(id);
                    return Err(AppError::not_connected(&self.trace_id));
                }
            }
        }
    }

    /// Shuts the connection down. Safe to call repeatedly and concurrently;
    /// only the first call does any work.
    pub fn close(&self) -> Result<(), AppError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let connection = match self.connection.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(connection) = connection else {
            return Ok(());
        };
        info!(trace_id = %self.trace_id, "closing companion client connection");

        let shutdown = connection.channel.shutdown();
        if let Err(err) = &shutdown {
            warn!(trace_id = %self.trace_id, error = %err, "error closing connection");
        }

        let done = connection.read_done.lock().ok().and_then(|mut slot| slot.take());
        if let Some(done) = done {
            match done.recv_timeout(self.options.close_wait) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(trace_id = %self.trace_id, "read loop did not finish in time");
                }
                _ => {
                    let handle = connection.reader.lock().ok().and_then(|mut slot| slot.take());
                    if let Some(handle) = handle {
                        let _ = handle.join();
                    }
                }
            }
        }

        let abandoned = self.pending.fail_all();
        if abandoned > 0 {
            debug!(trace_id = %self.trace_id, abandoned, "released pending requests");
        }
        connection.channel.remove_forward();

        shutdown.map_err(|err| {
            AppError::system(format!("error closing connection: {err}"), &self.trace_id)
        })
    }
}

impl Drop for AyaClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct ReadLoop {
    stream: TcpStream,
    pending: Arc<PendingTable>,
    closed: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    trace_id: String,
}

impl ReadLoop {
    fn run(self) {
        if let Err(err) = self.stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
            warn!(trace_id = %self.trace_id, error = %err, "failed to set read timeout");
        }
        self.pump();
        self.alive.store(false, Ordering::SeqCst);
        // Nothing will answer the callers still waiting.
        let abandoned = self.pending.fail_all();
        debug!(trace_id = %self.trace_id, abandoned, "read loop exited");
    }

    fn pump(&self) {
        let mut stream = &self.stream;
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; 4096];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let count = match stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(trace_id = %self.trace_id, "companion connection closed by peer");
                    return;
                }
                Ok(count) => count,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        warn!(trace_id = %self.trace_id, error = %err, "read error");
                    }
                    return;
                }
            };
            for body in decoder.push(&chunk[..count]) {
                match Response::decode(body.as_slice()) {
                    Ok(response) => self.deliver(response),
                    Err(err) => {
                        warn!(trace_id = %self.trace_id, error = %err, "failed to unmarshal response");
                    }
                }
            }
        }
    }

    fn deliver(&self, response: Response) {
        match self.pending.claim(&response.id) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => {
                debug!(trace_id = %self.trace_id, id = %response.id, "discarding unclaimed response");
            }
        }
    }
}
