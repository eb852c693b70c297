use base64::Engine;
use chrono::{Local, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
}

/// Devices currently attached and authorized. Ids are unique and kept sorted
/// so two snapshots of the same set compare equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceSnapshot {
    devices: Vec<DeviceRecord>,
}

impl DeviceSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let mut devices: Vec<DeviceRecord> = records.into_iter().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices.dedup_by(|later, earlier| later.id == earlier.id);
        Self { devices }
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.iter().any(|device| device.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageInfo {
    #[serde(deserialize_with = "null_as_default")]
    pub package_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub label: String,
    /// Base64 `data:` URL as delivered by the companion server.
    #[serde(deserialize_with = "null_as_default")]
    pub icon: String,
    #[serde(deserialize_with = "null_as_default")]
    pub version_name: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub version_code: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub first_install_time: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub last_update_time: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub apk_path: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub apk_size: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub app_size: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub data_size: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub cache_size: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub enabled: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub system: bool,
    #[serde(deserialize_with = "lenient_i32")]
    pub min_sdk_version: i32,
    #[serde(deserialize_with = "lenient_i32")]
    pub target_sdk_version: i32,
    #[serde(deserialize_with = "string_list")]
    pub signatures: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Integers may arrive as whole-valued floats; anything else reads as 0.
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                    .map(|float| float as i64)
            })
            .unwrap_or_default(),
        _ => 0,
    })
}

fn lenient_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    Ok(i32::try_from(lenient_i64(deserializer)?).unwrap_or_default())
}

/// Keeps the string entries of an array, like the per-item checks upstream.
fn string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

impl PackageInfo {
    pub fn first_install_time_formatted(&self) -> String {
        format_epoch_millis(self.first_install_time)
    }

    pub fn last_update_time_formatted(&self) -> String {
        format_epoch_millis(self.last_update_time)
    }

    /// Decodes the icon data URL into raw image bytes.
    pub fn icon_bytes(&self) -> Option<Vec<u8>> {
        let (_, payload) = self.icon.split_once(";base64,")?;
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .ok()
    }
}

fn format_epoch_millis(millis: i64) -> String {
    match Local.timestamp_opt(millis / 1000, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

pub fn format_size(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {suffix}B", bytes as f64 / div as f64)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: usize,
    pub current: usize,
    pub completed: bool,
}

/// Result of a best-effort batched retrieval. `failed` lists the inputs whose
/// batch could not be fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchOutcome {
    pub packages: Vec<PackageInfo>,
    pub failed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_dedups_and_sorts_ids() {
        let snapshot = DeviceSnapshot::from_records(vec![
            DeviceRecord { id: "B".into(), name: "Pixel 7".into() },
            DeviceRecord { id: "A".into(), name: "Pixel 6".into() },
            DeviceRecord { id: "B".into(), name: "Pixel 7".into() },
        ]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.devices()[0].id, "A");
        assert!(snapshot.contains("B"));
    }

    #[test]
    fn snapshot_equality_ignores_input_order() {
        let a = DeviceSnapshot::from_records(vec![
            DeviceRecord { id: "1".into(), name: "x".into() },
            DeviceRecord { id: "2".into(), name: "y".into() },
        ]);
        let b = DeviceSnapshot::from_records(vec![
            DeviceRecord { id: "2".into(), name: "y".into() },
            DeviceRecord { id: "1".into(), name: "x".into() },
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn package_info_reads_camel_case_with_missing_fields() {
        let info: PackageInfo = serde_json::from_value(serde_json::json!({
            "packageName": "com.example",
            "versionCode": 42,
            "targetSdkVersion": 34,
            "signatures": ["abc"]
        }))
        .expect("decode");
        assert_eq!(info.package_name, "com.example");
        assert_eq!(info.version_code, 42);
        assert_eq!(info.target_sdk_version, 34);
        assert!(info.label.is_empty());
        assert_eq!(info.signatures, vec!["abc".to_string()]);
    }

    #[test]
    fn package_info_treats_null_as_missing() {
        let info: PackageInfo = serde_json::from_value(serde_json::json!({
            "packageName": "com.example",
            "label": null,
            "versionCode": 42,
            "signatures": null,
            "enabled": null
        }))
        .expect("decode");
        assert_eq!(info.package_name, "com.example");
        assert!(info.label.is_empty());
        assert_eq!(info.version_code, 42);
        assert!(info.signatures.is_empty());
        assert!(!info.enabled);
    }

    #[test]
    fn package_info_accepts_whole_floats_for_integers() {
        let info: PackageInfo = serde_json::from_value(serde_json::json!({
            "packageName": "com.example",
            "versionCode": 42.0,
            "apkSize": 1048576.0,
            "minSdkVersion": 21.0,
            "firstInstallTime": 1.5,
            "signatures": ["abc", 7, null]
        }))
        .expect("decode");
        assert_eq!(info.version_code, 42);
        assert_eq!(info.apk_size, 1_048_576);
        assert_eq!(info.min_sdk_version, 21);
        assert_eq!(info.first_install_time, 0);
        assert_eq!(info.signatures, vec!["abc".to_string()]);
    }

    #[test]
    fn icon_bytes_decodes_data_url() {
        let info = PackageInfo {
            icon: "data:image/png;base64,aGVsbG8=".to_string(),
            ..PackageInfo::default()
        };
        assert_eq!(info.icon_bytes().as_deref(), Some(&b"hello"[..]));
        assert_eq!(PackageInfo::default().icon_bytes(), None);
    }

    #[test]
    fn format_size_uses_binary_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
