//! Registry access
//!
//! The pipeline talks to the registry only through [`RegistryAccess`]. On
//! Windows the default implementation shells out to `reg.exe` with a timeout;
//! elsewhere the registry is simply unavailable and discovery records a
//! warning instead of failing.

use crate::command::run_with_timeout;
use crate::error::{IdResetError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Read/write access to string registry values
pub trait RegistryAccess: Send + Sync {
    fn is_available(&self) -> bool;

    /// `Ok(None)` when the value does not exist
    fn read_value(&self, key: &str, value: &str) -> Result<Option<String>>;

    fn write_value(&self, key: &str, value: &str, data: &str) -> Result<()>;

    fn delete_value(&self, key: &str, value: &str) -> Result<()>;
}

/// Platform default
pub fn default_registry(timeout: Duration) -> Arc<dyn RegistryAccess> {
    if cfg!(windows) {
        Arc::new(RegExe::new(timeout))
    } else {
        Arc::new(NoRegistry)
    }
}

/// `reg.exe` backed registry
#[derive(Debug, Clone)]
pub struct RegExe {
    timeout: Duration,
}

impl RegExe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RegistryAccess for RegExe {
    fn is_available(&self) -> bool {
        cfg!(windows)
    }

    fn read_value(&self, key: &str, value: &str) -> Result<Option<String>> {
        let out = run_with_timeout("reg", &["query", key, "/v", value], self.timeout)?;
        if !out.success {
            // reg.exe exits 1 for a missing key or value
            debug!("reg query {}\\{}: {}", key, value, out.stderr.trim());
            return Ok(None);
        }
        Ok(parse_query_output(&out.stdout, value))
    }

    fn write_value(&self, key: &str, value: &str, data: &str) -> Result<()> {
        run_with_timeout(
            "reg",
            &["add", key, "/v", value, "/t", "REG_SZ", "/d", data, "/f"],
            self.timeout,
        )?
        .ensure_success("reg add")
        .map_err(|e| IdResetError::registry(format!("{}\\{}: {}", key, value, e)))
    }

    fn delete_value(&self, key: &str, value: &str) -> Result<()> {
        run_with_timeout("reg", &["delete", key, "/v", value, "/f"], self.timeout)?
            .ensure_success("reg delete")
            .map_err(|e| IdResetError::registry(format!("{}\\{}: {}", key, value, e)))
    }
}

/// Extract the data column for `value` from `reg query` output:
///
/// ```text
/// HKEY_CURRENT_USER\Software\App
///     MachineId    REG_SZ    0123abcd
/// ```
fn parse_query_output(stdout: &str, value: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut parts = line.trim().splitn(3, "    ");
        let name = parts.next()?.trim();
        let kind = parts.next()?.trim();
        if !name.eq_ignore_ascii_case(value) || !kind.starts_with("REG_") {
            return None;
        }
        Some(parts.next().unwrap_or("").trim().to_string())
    })
}

/// Registry that is never available
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegistry;

impl RegistryAccess for NoRegistry {
    fn is_available(&self) -> bool {
        false
    }

    fn read_value(&self, _key: &str, _value: &str) -> Result<Option<String>> {
        Err(IdResetError::registry("registry is not available on this platform"))
    }

    fn write_value(&self, _key: &str, _value: &str, _data: &str) -> Result<()> {
        Err(IdResetError::registry("registry is not available on this platform"))
    }

    fn delete_value(&self, _key: &str, _value: &str) -> Result<()> {
        Err(IdResetError::registry("registry is not available on this platform"))
    }
}

/// In-memory registry for tests and dry runs on non-Windows hosts
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    values: Mutex<BTreeMap<(String, String), String>>,
    fail_writes: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, key: &str, value: &str, data: &str) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(Self::slot(key, value), data.to_string());
        }
        self
    }

    /// Make every subsequent write or delete fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn slot(key: &str, value: &str) -> (String, String) {
        (key.to_lowercase(), value.to_lowercase())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(IdResetError::registry("write rejected"))
        } else {
            Ok(())
        }
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), String>>> {
        self.values
            .lock()
            .map_err(|_| IdResetError::registry("registry mutex poisoned"))
    }
}

impl RegistryAccess for MemoryRegistry {
    fn is_available(&self) -> bool {
        true
    }

    fn read_value(&self, key: &str, value: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(&Self::slot(key, value)).cloned())
    }

    fn write_value(&self, key: &str, value: &str, data: &str) -> Result<()> {
        self.check_writable()?;
        self.values()?.insert(Self::slot(key, value), data.to_string());
        Ok(())
    }

    fn delete_value(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.values()?.remove(&Self::slot(key, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reg_query_output() {
        let out = "\r\nHKEY_CURRENT_USER\\Software\\App\r\n    MachineId    REG_SZ    0123abcd\r\n\r\n";
        assert_eq!(parse_query_output(out, "machineid").as_deref(), Some("0123abcd"));
        assert_eq!(parse_query_output(out, "Other"), None);
    }

    #[test]
    fn test_memory_registry_is_case_insensitive() {
        let reg = MemoryRegistry::new().with_value(r"HKCU\Software\App", "MachineId", "old");
        assert_eq!(
            reg.read_value(r"hkcu\software\app", "machineid").unwrap().as_deref(),
            Some("old")
        );
        reg.write_value(r"HKCU\Software\App", "MachineId", "new").unwrap();
        assert_eq!(
            reg.read_value(r"HKCU\Software\App", "MachineId").unwrap().as_deref(),
            Some("new")
        );
        reg.delete_value(r"HKCU\Software\App", "MachineId").unwrap();
        assert_eq!(reg.read_value(r"HKCU\Software\App", "MachineId").unwrap(), None);
    }

    #[test]
    fn test_memory_registry_write_failure() {
        let reg = MemoryRegistry::new();
        reg.set_fail_writes(true);
        assert!(reg.write_value("k", "v", "d").is_err());
    }

    #[test]
    fn test_no_registry_is_unavailable() {
        assert!(!NoRegistry.is_available());
        assert!(NoRegistry.read_value("k", "v").is_err());
    }
}
