const DEVICES_HEADER: &str = "list of devices";
const AUTHORIZED_STATE: &str = "device";
const TRANSIENT_NAME_MARKERS: [&str; 3] = ["authorizing", "unauthorized", "offline"];

/// Extracts authorized device ids from one `track-devices` payload.
///
/// Only `<id> device` records count; headers, daemon notices and devices in
/// any other state are dropped. Ids are returned once, in first-seen order.
pub fn parse_track_devices_payload(payload: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in payload.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('*')
            || trimmed.to_lowercase().contains(DEVICES_HEADER)
        {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() != 2 || tokens[1] != AUTHORIZED_STATE {
            continue;
        }
        if !ids.iter().any(|id| id == tokens[0]) {
            ids.push(tokens[0].to_string());
        }
    }
    ids
}

/// True when a model-name lookup returned nothing usable yet.
pub fn is_transient_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    TRANSIENT_NAME_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Parses the port printed by `adb forward tcp:0 ...`.
pub fn parse_forward_port(output: &str) -> Option<u16> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u16>().ok())
        .filter(|port| *port != 0)
}

/// Checks a `/proc/net/unix` listing for the abstract socket `@<name>`.
pub fn has_abstract_socket(listing: &str, socket_name: &str) -> bool {
    let wanted = format!("@{socket_name}");
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|path| path == wanted)
}

pub fn parse_pm_list_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("package:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
