use std::path::{Path, PathBuf};

use crate::app::error::AppError;

fn strip_wrapping_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    trimmed
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = strip_wrapping_quotes(config_command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized.to_string()
    }
}

pub fn validate_adb_program(program: &str, trace_id: &str) -> Result<(), AppError> {
    if program.trim().is_empty() {
        return Err(AppError::validation("ADB command is empty", trace_id));
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err(AppError::validation(
            "ADB path must point to an executable file",
            trace_id,
        ));
    }
    if !path.exists() {
        return Err(AppError::dependency(
            "ADB executable not found at the configured path",
            trace_id,
        ));
    }
    Ok(())
}

/// Resolves the local companion payload that gets pushed during bootstrap.
pub fn resolve_payload_path(configured: &str, trace_id: &str) -> Result<PathBuf, AppError> {
    let normalized = strip_wrapping_quotes(configured);
    if normalized.is_empty() {
        return Err(AppError::validation(
            "companion payload path is not configured",
            trace_id,
        ));
    }
    let path = PathBuf::from(normalized);
    if !path.is_file() {
        return Err(AppError::dependency(
            format!("companion payload not found at {}", path.display()),
            trace_id,
        ));
    }
    Ok(path)
}
