use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::app::adb::parse::parse_pm_list_packages;
use crate::app::adb::runner::{shell_args, CommandRunner};
use crate::app::aya::client::AyaClient;
use crate::app::error::AppError;
use crate::app::models::{BatchOutcome, BatchProgress, PackageInfo};

impl AyaClient {
    pub fn get_package_info(&self, package_name: &str) -> Result<PackageInfo, AppError> {
        let result = self.send_message(
            "getPackageInfo",
            &serde_json::json!({ "packageName": package_name }),
        )?;
        let mut info: PackageInfo = decode_result(Value::Object(result), self.trace_id())?;
        info.package_name = package_name.to_string();
        if info.label.is_empty() {
            info.label = package_name.to_string();
        }
        Ok(info)
    }

    pub fn get_package_infos(&self, package_names: &[String]) -> Result<Vec<PackageInfo>, AppError> {
        let mut result = self.send_message(
            "getPackageInfos",
            &serde_json::json!({ "packageNames": package_names }),
        )?;
        let infos = take_field(&mut result, "packageInfos", self.trace_id())?;
        decode_result(infos, self.trace_id())
    }

    /// Fetches `package_names` in chunks of `batch_size`. A failed chunk is
    /// logged and recorded in `failed`; the rest still load. Cancellation
    /// aborts the whole fetch without a completion event.
    pub fn fetch_package_infos_batched(
        &self,
        package_names: &[String],
        batch_size: usize,
        progress: &dyn Fn(BatchProgress),
    ) -> Result<BatchOutcome, AppError> {
        let trace_id = self.trace_id();
        let total = package_names.len();
        let mut outcome = BatchOutcome::default();
        if total == 0 {
            return Ok(outcome);
        }
        let batch_size = batch_size.max(1);
        info!(trace_id = %trace_id, total, batch_size, "fetching package infos");
        progress(BatchProgress { total, current: 0, completed: false });

        for (index, batch) in package_names.chunks(batch_size).enumerate() {
            self.cancel_token().check(trace_id)?;
            let start = index * batch_size + 1;
            let end = start + batch.len() - 1;
            match self.get_package_infos(batch) {
                Ok(infos) => {
                    outcome.packages.extend(infos);
                    progress(BatchProgress {
                        total,
                        current: outcome.packages.len(),
                        completed: false,
                    });
                }
                Err(err) => {
                    if err.is_cancelled() || self.cancel_token().is_cancelled() {
                        return Err(AppError::cancelled(trace_id));
                    }
                    warn!(trace_id = %trace_id, start, end, total, error = %err, "failed to fetch package batch");
                    outcome.failed.extend(batch.iter().cloned());
                }
            }
        }

        self.cancel_token().check(trace_id)?;
        progress(BatchProgress {
            total,
            current: outcome.packages.len(),
            completed: true,
        });
        info!(
            trace_id = %trace_id,
            loaded = outcome.packages.len(),
            failed = outcome.failed.len(),
            "package infos fetched"
        );
        Ok(outcome)
    }
}

/// Every installed package on `serial`, as reported by `pm list packages`.
pub fn list_installed_packages(
    runner: &dyn CommandRunner,
    serial: &str,
    trace_id: &str,
) -> Result<Vec<String>, AppError> {
    let args = shell_args(serial, &["pm", "list", "packages"]);
    let output = runner.run(&args, trace_id)?;
    if !output.success() {
        return Err(AppError::dependency(
            format!("failed to get package list: {}", output.combined().trim()),
            trace_id,
        ));
    }
    Ok(parse_pm_list_packages(&output.stdout))
}

fn take_field(result: &mut Map<String, Value>, field: &str, trace_id: &str) -> Result<Value, AppError> {
    result
        .remove(field)
        .ok_or_else(|| AppError::protocol(format!("missing {field} field in response"), trace_id))
}

fn decode_result<T: serde::de::DeserializeOwned>(value: Value, trace_id: &str) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|err| {
        AppError::protocol(format!("failed to decode package info: {err}"), trace_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::aya::client::tests::{device_with_server, spawn_server, test_options};
    use crate::app::cancel::CancelToken;
    use crate::app::testing::{failed, ok_stdout, ScriptedRunner};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("com.example.app{index}")).collect()
    }

    fn package_server(fail_containing: Option<&'static str>) -> (u16, std::thread::JoinHandle<()>) {
        spawn_server(move |method, params| match method {
            "getPackageInfo" => serde_json::json!({
                "label": "",
                "versionName": "1.2.3",
                "versionCode": 42,
                "enabled": true,
                "signatures": ["abc"],
            }),
            "getPackageInfos" => {
                let requested: Vec<String> =
                    serde_json::from_value(params["packageNames"].clone()).unwrap_or_default();
                if let Some(marker) = fail_containing {
                    if requested.iter().any(|name| name == marker) {
                        return serde_json::json!({ "error": "boom" });
                    }
                }
                let infos: Vec<Value> = requested
                    .iter()
                    .map(|name| serde_json::json!({ "packageName": name, "label": name }))
                    .collect();
                serde_json::json!({ "packageInfos": infos })
            }
            _ => serde_json::json!({}),
        })
    }

    fn client_for(port: u16, cancel: CancelToken) -> AyaClient {
        let client = AyaClient::new(
            device_with_server(port),
            "SERIAL",
            test_options(Duration::from_secs(5)),
            cancel,
        );
        client.connect(&PathBuf::from("/tmp/aya.dex")).expect("connect");
        client
    }

    #[test]
    fn single_package_label_defaults_to_name() {
        let (port, server) = package_server(None);
        let client = client_for(port, CancelToken::new());

        let info = client.get_package_info("com.example").expect("info");
        assert_eq!(info.package_name, "com.example");
        assert_eq!(info.label, "com.example");
        assert_eq!(info.version_name, "1.2.3");
        assert_eq!(info.version_code, 42);
        assert!(info.enabled);
        assert_eq!(info.signatures, vec!["abc"]);

        client.close().expect("close");
        server.join().expect("server");
    }

    #[test]
    fn missing_package_infos_field_is_protocol_error() {
        let (port, server) = package_server(Some("com.example.app0"));
        let client = client_for(port, CancelToken::new());

        let err = client.get_package_infos(&names(1)).expect_err("missing field");
        assert_eq!(err.code, crate::app::error::ErrorCode::Protocol);
        assert!(err.error.contains("packageInfos"));

        client.close().expect("close");
        server.join().expect("server");
    }

    #[test]
    fn batches_report_progress_and_complete() {
        let (port, server) = package_server(None);
        let client = client_for(port, CancelToken::new());
        let events = Mutex::new(Vec::new());

        let outcome = client
            .fetch_package_infos_batched(&names(5), 2, &|event| {
                events.lock().expect("events").push(event)
            })
            .expect("outcome");
        assert_eq!(outcome.packages.len(), 5);
        assert!(outcome.failed.is_empty());

        let events = events.into_inner().expect("events");
        let currents: Vec<usize> = events.iter().map(|event| event.current).collect();
        assert_eq!(currents, vec![0, 2, 4, 5, 5]);
        assert!(events.iter().all(|event| event.total == 5));
        assert_eq!(events.iter().filter(|event| event.completed).count(), 1);
        assert!(events.last().expect("last").completed);

        client.close().expect("close");
        server.join().expect("server");
    }

    #[test]
    fn failed_batch_is_skipped_and_reported() {
        let (port, server) = package_server(Some("com.example.app2"));
        let client = client_for(port, CancelToken::new());

        let outcome = client
            .fetch_package_infos_batched(&names(5), 2, &|_event| {})
            .expect("outcome");
        let loaded: Vec<&str> = outcome.packages.iter().map(|info| info.package_name.as_str()).collect();
        assert_eq!(loaded, vec!["com.example.app0", "com.example.app1", "com.example.app4"]);
        assert_eq!(outcome.failed, vec!["com.example.app2", "com.example.app3"]);

        client.close().expect("close");
        server.join().expect("server");
    }

    #[test]
    fn loosely_typed_entries_stay_in_their_batch() {
        let (port, server) = spawn_server(|_method, params| {
            let requested: Vec<String> =
                serde_json::from_value(params["packageNames"].clone()).unwrap_or_default();
            let infos: Vec<Value> = requested
                .iter()
                .map(|name| {
                    serde_json::json!({
                        "packageName": name,
                        "label": null,
                        "versionCode": 42.0,
                        "signatures": null,
                    })
                })
                .collect();
            serde_json::json!({ "packageInfos": infos })
        });
        let client = client_for(port, CancelToken::new());

        let outcome = client
            .fetch_package_infos_batched(&names(3), 50, &|_event| {})
            .expect("outcome");
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.packages.len(), 3);
        assert!(outcome.packages.iter().all(|info| info.version_code == 42));

        client.close().expect("close");
        server.join().expect("server");
    }

    #[test]
    fn cancellation_suppresses_completion_event() {
        let (port, server) = package_server(None);
        let cancel = CancelToken::new();
        let client = client_for(port, cancel.clone());
        let events = Mutex::new(Vec::new());

        let err = client
            .fetch_package_infos_batched(&names(6), 2, &|event: BatchProgress| {
                if event.current >= 2 {
                    cancel.cancel();
                }
                events.lock().expect("events").push(event);
            })
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        let events = events.into_inner().expect("events");
        assert!(events.iter().all(|event| !event.completed));
        assert_eq!(events.len(), 2);

        cancel_safe_close(&client);
        server.join().expect("server");
    }

    fn cancel_safe_close(client: &AyaClient) {
        client.close().expect("close");
        assert!(!client.is_connected());
    }

    #[test]
    fn empty_input_emits_nothing() {
        let client = AyaClient::new(
            device_with_server(1),
            "SERIAL",
            test_options(Duration::from_secs(1)),
            CancelToken::new(),
        );
        let calls = Mutex::new(0);
        let outcome = client
            .fetch_package_infos_batched(&[], 50, &|_event| *calls.lock().expect("calls") += 1)
            .expect("outcome");
        assert!(outcome.packages.is_empty());
        assert_eq!(*calls.lock().expect("calls"), 0);
    }

    #[test]
    fn lists_installed_packages() {
        let runner = Arc::new(ScriptedRunner::new(|_args| {
            ok_stdout("package:com.android.settings\npackage:com.example\n\n")
        }));
        let packages = list_installed_packages(runner.as_ref(), "SERIAL", "t").expect("packages");
        assert_eq!(packages, vec!["com.android.settings", "com.example"]);
        assert_eq!(
            runner.calls()[0],
            vec!["-s", "SERIAL", "shell", "pm", "list", "packages"]
        );

        let broken = ScriptedRunner::new(|_args| failed("error: device offline"));
        let err = list_installed_packages(&broken, "SERIAL", "t").expect_err("offline");
        assert!(err.error.contains("device offline"));
    }
}
