use std::collections::HashMap;
use std::io::{BufRead, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::parse::{is_transient_name, parse_track_devices_payload};
use crate::app::adb::runner::{shell_args, CommandRunner};
use crate::app::adb::track_devices::TrackDevicesFrameDecoder;
use crate::app::cancel::CancelToken;
use crate::app::config::TrackerSettings;
use crate::app::models::{DeviceRecord, DeviceSnapshot};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives every device-set change. Called from tracker threads, so it
/// should hand the snapshot off rather than block.
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, snapshot: DeviceSnapshot);
}

impl<F> SnapshotListener for F
where
    F: Fn(DeviceSnapshot) + Send + Sync,
{
    fn on_snapshot(&self, snapshot: DeviceSnapshot) {
        self(snapshot)
    }
}

/// Fire-and-forget: a dropped receiver just stops seeing snapshots.
impl SnapshotListener for mpsc::Sender<DeviceSnapshot> {
    fn on_snapshot(&self, snapshot: DeviceSnapshot) {
        let _ = self.send(snapshot);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackerState {
    Idle,
    Running,
    WaitBackoff,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub program: String,
    pub args: Vec<String>,
    pub reconnect_delay: Duration,
    pub name_retry_delay: Duration,
}

impl TrackerOptions {
    pub fn new(adb_program: impl Into<String>, settings: &TrackerSettings) -> Self {
        Self {
            program: adb_program.into(),
            args: vec!["track-devices".to_string()],
            reconnect_delay: settings.reconnect_delay(),
            name_retry_delay: settings.name_retry_delay(),
        }
    }
}

/// Turns decoded payloads into snapshots: resolves names through a cache
/// that lives as long as the tracker and drops repeated identical snapshots.
pub(crate) struct SnapshotReconciler {
    runner: Arc<dyn CommandRunner>,
    listener: Arc<dyn SnapshotListener>,
    names: Mutex<HashMap<String, String>>,
    last_emitted: Mutex<Option<DeviceSnapshot>>,
    name_retry_delay: Duration,
    stop: CancelToken,
    trace_id: String,
}

impl SnapshotReconciler {
    pub(crate) fn new(
        runner: Arc<dyn CommandRunner>,
        listener: Arc<dyn SnapshotListener>,
        name_retry_delay: Duration,
        stop: CancelToken,
        trace_id: String,
    ) -> Self {
        Self {
            runner,
            listener,
            names: Mutex::new(HashMap::new()),
            last_emitted: Mutex::new(None),
            name_retry_delay,
            stop,
            trace_id,
        }
    }

    pub(crate) fn apply_payload(&self, payload: &str) {
        let ids = parse_track_devices_payload(payload);
        debug!(trace_id = %self.trace_id, devices = ?ids, "device list updated");
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if self.stop.is_cancelled() {
                return;
            }
            if let Some(name) = self.resolve_name(&id) {
                records.push(DeviceRecord { id, name });
            }
        }
        self.emit(DeviceSnapshot::from_records(records), false);
    }

    /// The stream died: whatever was attached is no longer known.
    pub(crate) fn connection_lost(&self) {
        self.emit(DeviceSnapshot::empty(), true);
    }

    fn emit(&self, snapshot: DeviceSnapshot, force: bool) {
        {
            let mut last = match self.last_emitted.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !force && last.as_ref() == Some(&snapshot) {
                return;
            }
            *last = Some(snapshot.clone());
        }
        info!(
            trace_id = %self.trace_id,
            count = snapshot.len(),
            "device snapshot"
        );
        self.listener.on_snapshot(snapshot);
    }

    fn cached_name(&self, id: &str) -> Option<String> {
        self.names.lock().ok()?.get(id).cloned()
    }

    /// Unresolvable devices return `None` and stay out of the cache so the
    /// next snapshot tries them again.
    fn resolve_name(&self, id: &str) -> Option<String> {
        if let Some(name) = self.cached_name(id) {
            return Some(name);
        }

        let mut name = self.query_name(id);
        if is_transient_name(&name) {
            debug!(trace_id = %self.trace_id, serial = %id, "device name not ready; retrying");
            if self.stop.wait_timeout(self.name_retry_delay) {
                return None;
            }
            name = self.query_name(id);
        }
        if is_transient_name(&name) {
            warn!(
                trace_id = %self.trace_id,
                serial = %id,
                "device name unresolved after retry; leaving it out of the snapshot"
            );
            return None;
        }

        let name = name.trim().to_string();
        if let Ok(mut names) = self.names.lock() {
            names.insert(id.to_string(), name.clone());
        }
        Some(name)
    }

    fn query_name(&self, id: &str) -> String {
        let args = shell_args(id, &["getprop", "ro.product.model"]);
        match self.runner.run(&args, &self.trace_id) {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                output.stdout.trim().to_string()
            }
            Ok(output) => output.combined().trim().to_string(),
            Err(err) => {
                debug!(trace_id = %self.trace_id, serial = %id, error = %err, "name lookup failed");
                String::new()
            }
        }
    }
}

/// Reads frames until EOF or a read error. A short read ends the loop; the
/// supervisor takes it from there.
pub(crate) fn pump_stream(mut reader: impl Read, reconciler: &SnapshotReconciler, trace_id: &str) {
    let mut decoder = TrackDevicesFrameDecoder::new();
    let mut chunk = [0u8; 4096];
    loop {
        let count = match reader.read(&mut chunk) {
            Ok(0) => {
                debug!(
                    trace_id = %trace_id,
                    pending = decoder.pending_len(),
                    "track-devices stream closed"
                );
                return;
            }
            Ok(count) => count,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to read track-devices stream");
                return;
            }
        };
        for payload in decoder.push(&chunk[..count]) {
            reconciler.apply_payload(&payload);
        }
    }
}

pub struct DeviceTrackerHandle {
    stop: CancelToken,
    child: Arc<Mutex<Option<Child>>>,
    state: Arc<Mutex<TrackerState>>,
    join: JoinHandle<()>,
}

impl DeviceTrackerHandle {
    pub fn state(&self) -> TrackerState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn stop(self) {
        self.stop.cancel();
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        let _ = self.join.join();
        set_state(&self.state, TrackerState::Stopped);
    }
}

fn set_state(slot: &Mutex<TrackerState>, next: TrackerState) {
    match slot.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

pub fn start_device_tracker(
    runner: Arc<dyn CommandRunner>,
    options: TrackerOptions,
    listener: Arc<dyn SnapshotListener>,
    trace_id: String,
) -> DeviceTrackerHandle {
    let stop = CancelToken::new();
    let child_slot: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
    let state = Arc::new(Mutex::new(TrackerState::Idle));

    let stop_thread = stop.clone();
    let child_thread = Arc::clone(&child_slot);
    let state_thread = Arc::clone(&state);

    let join = thread::spawn(move || {
        let reconciler = Arc::new(SnapshotReconciler::new(
            runner,
            listener,
            options.name_retry_delay,
            stop_thread.clone(),
            trace_id.clone(),
        ));
        supervise(
            &options,
            &reconciler,
            &stop_thread,
            &child_thread,
            &state_thread,
            &trace_id,
        );
        set_state(&state_thread, TrackerState::Stopped);
        info!(trace_id = %trace_id, "device tracker stopped");
    });

    DeviceTrackerHandle {
        stop,
        child: child_slot,
        state,
        join,
    }
}

fn supervise(
    options: &TrackerOptions,
    reconciler: &Arc<SnapshotReconciler>,
    stop: &CancelToken,
    child_slot: &Arc<Mutex<Option<Child>>>,
    state: &Arc<Mutex<TrackerState>>,
    trace_id: &str,
) {
    info!(trace_id = %trace_id, program = %options.program, "device tracker started");
    loop {
        if stop.is_cancelled() {
            return;
        }

        if run_once(options, reconciler, stop, child_slot, state, trace_id) {
            set_state(state, TrackerState::Idle);
            if stop.is_cancelled() {
                return;
            }
            info!(trace_id = %trace_id, "track-devices connection lost; clearing device list");
            reconciler.connection_lost();
        }

        set_state(state, TrackerState::WaitBackoff);
        debug!(
            trace_id = %trace_id,
            delay_ms = options.reconnect_delay.as_millis() as u64,
            "waiting before reconnecting"
        );
        if stop.wait_timeout(options.reconnect_delay) {
            return;
        }
        set_state(state, TrackerState::Idle);
    }
}

/// Runs one subprocess to completion. Returns whether it ever started.
fn run_once(
    options: &TrackerOptions,
    reconciler: &Arc<SnapshotReconciler>,
    stop: &CancelToken,
    child_slot: &Arc<Mutex<Option<Child>>>,
    state: &Arc<Mutex<TrackerState>>,
    trace_id: &str,
) -> bool {
    let mut child = match Command::new(&options.program)
        .args(&options.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "failed to spawn adb device tracker");
            return false;
        }
    };
    info!(trace_id = %trace_id, pid = child.id(), "adb track-devices started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    {
        let mut guard = match child_slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(child);
    }
    set_state(state, TrackerState::Running);

    let stderr_join = stderr.map(|stderr| {
        let trace_stderr = trace_id.to_string();
        thread::spawn(move || {
            let reader = std::io::BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                warn!(trace_id = %trace_stderr, stderr = %line, "adb device tracker stderr");
            }
        })
    });

    let reader_join = stdout.map(|stdout| {
        let reconciler = Arc::clone(reconciler);
        let trace_reader = trace_id.to_string();
        thread::spawn(move || pump_stream(stdout, &reconciler, &trace_reader))
    });

    loop {
        let exited = {
            let mut guard = match child_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match guard.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(trace_id = %trace_id, exit_code = ?status.code(), "adb track-devices exited");
                        true
                    }
                    Ok(None) => false,
                    Err(err) => {
                        warn!(trace_id = %trace_id, error = %err, "failed to poll adb device tracker");
                        true
                    }
                },
                // stop() already took and reaped the child.
                None => true,
            }
        };
        if exited || stop.is_cancelled() {
            break;
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }

    if let Ok(mut guard) = child_slot.lock() {
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
    if let Some(join) = reader_join {
        let _ = join.join();
    }
    if let Some(join) = stderr_join {
        let _ = join.join();
    }
    true
}
