use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aya_bridge_lib::app::adb::device_tracking::{start_device_tracker, TrackerOptions};
use aya_bridge_lib::app::adb::locator::{
    resolve_adb_program, resolve_payload_path, validate_adb_program,
};
use aya_bridge_lib::app::adb::runner::{AdbRunner, CommandRunner};
use aya_bridge_lib::app::aya::client::{AyaClient, ClientOptions};
use aya_bridge_lib::app::aya::packages::list_installed_packages;
use aya_bridge_lib::app::cancel::CancelToken;
use aya_bridge_lib::app::config::{load_config, BridgeConfig};
use aya_bridge_lib::app::error::AppError;
use aya_bridge_lib::app::logging::init_logging;
use aya_bridge_lib::app::models::{format_size, BatchProgress, DeviceSnapshot};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    track_secs: Option<u64>,
    packages: bool,
    json: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    adb_program: Option<String>,
    snapshots: Vec<DeviceSnapshot>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

const USAGE: &str =
    "Usage: cargo run --bin smoke -- [--track SECS] [--serial SERIAL [--packages]] [--json]\n";

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut track_secs: Option<u64> = None;
    let mut packages = false;
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--track" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--track requires a value".to_string())?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("--track expects seconds, got {value:?}"))?;
                track_secs = Some(secs);
            }
            "--packages" => {
                packages = true;
            }
            "--json" => {
                json = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    if packages && serial.is_none() {
        return Err("--packages requires --serial or ANDROID_SERIAL".to_string());
    }
    if track_secs.is_none() && serial.is_none() {
        return Err(USAGE.to_string());
    }

    Ok(Args {
        serial,
        track_secs,
        packages,
        json,
    })
}

fn run_check<T, F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<(T, Option<String>), AppError>,
{
    let start = Instant::now();
    match f() {
        Ok((value, detail)) => {
            checks.push(SmokeCheck {
                name,
                status: "pass",
                duration_ms: start.elapsed().as_millis(),
                detail,
                error_code: None,
                error: None,
            });
            Some(value)
        }
        Err(err) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: start.elapsed().as_millis(),
                detail: None,
                error_code: Some(err.code.as_str()),
                error: Some(err.error),
            });
            None
        }
    }
}

fn describe_snapshot(snapshot: &DeviceSnapshot) -> String {
    if snapshot.is_empty() {
        return "no devices".to_string();
    }
    snapshot
        .devices()
        .iter()
        .map(|device| format!("{} ({})", device.id, device.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn track_for(
    runner: Arc<dyn CommandRunner>,
    config: &BridgeConfig,
    adb_program: &str,
    secs: u64,
    json: bool,
    trace_id: &str,
) -> Vec<DeviceSnapshot> {
    let (tx, rx) = mpsc::channel::<DeviceSnapshot>();
    let handle = start_device_tracker(
        runner,
        TrackerOptions::new(adb_program, &config.tracker),
        Arc::new(tx),
        trace_id.to_string(),
    );

    let mut snapshots = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(secs);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(snapshot) => {
                if !json {
                    println!("devices: {}", describe_snapshot(&snapshot));
                }
                snapshots.push(snapshot);
            }
            Err(_) => break,
        }
    }
    handle.stop();
    snapshots
}

fn print_progress(progress: BatchProgress) {
    if progress.completed {
        eprintln!("packages: {}/{} done", progress.current, progress.total);
    } else {
        eprintln!("packages: {}/{}", progress.current, progress.total);
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let mut checks: Vec<SmokeCheck> = Vec::new();
    let mut snapshots: Vec<DeviceSnapshot> = Vec::new();

    let config = match run_check(&mut checks, "load_config", || {
        load_config(&trace_id).map(|config| (config, None))
    }) {
        Some(config) => config,
        None => BridgeConfig::default(),
    };
    init_logging(&config.logging.log_level);

    let adb_program = resolve_adb_program(&config.adb.command_path);
    let adb_ok = run_check(&mut checks, "check_adb", || {
        validate_adb_program(&adb_program, &trace_id).map(|_| ((), Some(adb_program.clone())))
    })
    .is_some();
    let runner: Arc<dyn CommandRunner> = Arc::new(AdbRunner::new(adb_program.clone()));

    if adb_ok {
        if let Some(secs) = args.track_secs {
            let start = Instant::now();
            snapshots = track_for(
                Arc::clone(&runner),
                &config,
                &adb_program,
                secs,
                args.json,
                &trace_id,
            );
            checks.push(SmokeCheck {
                name: "track_devices",
                status: if snapshots.is_empty() { "warn" } else { "pass" },
                duration_ms: start.elapsed().as_millis(),
                detail: Some(format!("{} snapshot(s)", snapshots.len())),
                error_code: None,
                error: None,
            });
        }
    }

    if let (true, Some(serial)) = (adb_ok, args.serial.as_deref()) {
        let client = AyaClient::new(
            Arc::clone(&runner),
            serial,
            ClientOptions::from_settings(&config.aya),
            CancelToken::new(),
        )
        .with_trace_id(trace_id.clone());

        let connected = run_check(&mut checks, "connect_companion", || {
            let payload = resolve_payload_path(&config.aya.payload_path, &trace_id)?;
            client.connect(&payload)?;
            Ok(((), Some(payload.display().to_string())))
        })
        .is_some();

        if connected && args.packages {
            let names = run_check(&mut checks, "list_packages", || {
                let names = list_installed_packages(runner.as_ref(), serial, &trace_id)?;
                let detail = format!("{} package(s)", names.len());
                Ok((names, Some(detail)))
            });
            if let Some(names) = names {
                let outcome = run_check(&mut checks, "fetch_package_infos", || {
                    let outcome = client.fetch_package_infos_batched(
                        &names,
                        config.aya.batch_size,
                        &print_progress,
                    )?;
                    let detail = format!(
                        "{} loaded, {} failed",
                        outcome.packages.len(),
                        outcome.failed.len()
                    );
                    Ok((outcome, Some(detail)))
                });
                if let (Some(outcome), false) = (outcome, args.json) {
                    for info in &outcome.packages {
                        let icon = match info.icon_bytes() {
                            Some(bytes) => format_size(bytes.len() as i64),
                            None => "-".to_string(),
                        };
                        println!(
                            "{}\t{}\t{}\t{}\ticon {}",
                            info.package_name,
                            info.version_name,
                            format_size(info.apk_size),
                            info.last_update_time_formatted(),
                            icon
                        );
                    }
                }
            }
        }

        run_check(&mut checks, "close_companion", || client.close().map(|_| ((), None)));
    }

    let status = if checks.iter().any(|check| check.status == "fail") {
        "fail"
    } else {
        "pass"
    };
    let summary = SmokeSummary {
        tool: "aya_bridge_smoke",
        status,
        trace_id,
        serial: args.serial,
        adb_program: Some(adb_program),
        snapshots,
        checks,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_default()
        );
    } else {
        for check in &summary.checks {
            let note = check
                .error
                .as_deref()
                .or(check.detail.as_deref())
                .unwrap_or("");
            println!(
                "[{}] {} ({} ms) {}",
                check.status, check.name, check.duration_ms, note
            );
        }
        println!("status: {}", summary.status);
    }

    if status == "fail" {
        std::process::exit(1);
    }
}
