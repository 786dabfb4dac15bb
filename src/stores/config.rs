//! JSON and plain-text config stores
//!
//! JSON configs are flat objects keyed by dotted identifier keys
//! (`"telemetry.machineId": "..."`). Rewrites preserve every other key and
//! land through a temp file plus rename, so a crash never leaves a torn file.

use crate::artifact::ConfigProbe;
use crate::error::{IdResetError, Result};
use crate::patterns::PatternConfig;
use crate::types::ConfigFormat;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix of in-flight atomic writes; discovery never reports these
pub const TEMP_SUFFIX: &str = ".idreset-tmp";

/// Read a JSON config that must be an object
pub fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let content = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        other => Err(IdResetError::integrity(
            path.display().to_string(),
            format!("expected a JSON object, found {}", json_type(&other)),
        )),
    }
}

/// Read a text config holding a single value
pub fn read_text_value(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Probe a config for planning. Never fails; unreadable content is reported
/// through `valid`/`error`.
pub fn probe_config(
    path: &Path,
    format: ConfigFormat,
    patterns: &PatternConfig,
    text_identifier: Option<&str>,
) -> ConfigProbe {
    let mut probe = ConfigProbe {
        format,
        valid: false,
        error: None,
        identifier_keys: Vec::new(),
    };

    match format {
        ConfigFormat::Json => match read_json_object(path) {
            Ok(map) => {
                probe.valid = true;
                probe.identifier_keys = patterns
                    .identifiers
                    .iter()
                    .filter(|d| map.contains_key(&d.key))
                    .map(|d| d.key.clone())
                    .collect();
            }
            Err(e) => probe.error = Some(e.to_string()),
        },
        ConfigFormat::Text => match read_text_value(path) {
            Ok(value) => {
                probe.valid = true;
                if let (false, Some(name)) = (value.is_empty(), text_identifier) {
                    probe.identifier_keys.push(name.to_string());
                }
            }
            Err(e) => probe.error = Some(e.to_string()),
        },
    }
    probe
}

/// Set `writes` in an existing JSON config, keeping all other keys
pub fn rewrite_json_fields(path: &Path, writes: &[(String, String)]) -> Result<()> {
    let mut map = read_json_object(path)?;
    for (key, value) in writes {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    write_json(path, &map)
}

/// Create a JSON config that does not exist yet. Fails if it does.
pub fn create_json_config(path: &Path, writes: &[(String, String)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let map: Map<String, Value> = writes
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(serde_json::to_string_pretty(&map)?.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Replace the content of a text config
pub fn write_text_value(path: &Path, value: &str) -> Result<()> {
    write_atomic(path, value.as_bytes())
}

fn write_json(path: &Path, map: &Map<String, Value>) -> Result<()> {
    let body = serde_json::to_string_pretty(map)?;
    write_atomic(path, body.as_bytes())
}

/// Temp file in the same directory, fsync, then rename over the target
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
