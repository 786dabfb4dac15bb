//! Backup store
//!
//! Backups are append-only during a run. Two layouts are supported:
//!
//! - sibling: `<original>.backup_<UTC stamp>` next to the original
//! - directory: `<backup_dir>/<UTC stamp>/<nnn>_<file name>`
//!
//! Every copy is verified by SHA-256 before the caller is allowed to mutate
//! the original. Pruning old backups is a separate maintenance call and never
//! happens during a run.

use crate::error::{IdResetError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Marker embedded in every sibling backup name
pub const BACKUP_MARKER: &str = ".backup_";

const REGISTRY_BACKUP_DIR: &str = "registry-backups";

/// Saved registry value, written as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub key: String,
    pub value: String,
    /// None when the value did not exist
    pub data: Option<String>,
}

/// Result of a prune pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
}

/// Timestamped backup destinations for one run
#[derive(Debug)]
pub struct BackupStore {
    backup_dir: Option<PathBuf>,
    state_dir: PathBuf,
    stamp: String,
    counter: AtomicUsize,
}

impl BackupStore {
    pub fn new(backup_dir: Option<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir,
            state_dir: state_dir.into(),
            stamp: Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string(),
            counter: AtomicUsize::new(1),
        }
    }

    /// UTC timestamp shared by every backup of this run
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    fn next_seq(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Where a copy of `original` goes
    pub fn file_destination(&self, original: &Path) -> PathBuf {
        let name = file_name(original);
        match &self.backup_dir {
            None => original.with_file_name(format!("{}{}{}", name, BACKUP_MARKER, self.stamp)),
            Some(dir) => dir
                .join(&self.stamp)
                .join(format!("{:03}_{}", self.next_seq(), name)),
        }
    }

    /// Where a registry value snapshot goes
    pub fn registry_destination(&self, value: &str) -> PathBuf {
        let safe: String = value
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.state_dir
            .join(REGISTRY_BACKUP_DIR)
            .join(&self.stamp)
            .join(format!("{:03}_{}.json", self.next_seq(), safe))
    }

    /// Dry check that `dest` could be written. Creates nothing.
    pub fn check_destination(&self, dest: &Path) -> Result<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| IdResetError::backup(dest, "destination has no parent directory"))?;
        let existing = nearest_existing(parent)
            .ok_or_else(|| IdResetError::backup(dest, "no existing ancestor directory"))?;
        if !existing.is_dir() {
            return Err(IdResetError::backup(
                dest,
                format!("{} is not a directory", existing.display()),
            ));
        }
        if !is_writable(&existing) {
            return Err(IdResetError::backup(
                dest,
                format!("{} is not writable", existing.display()),
            ));
        }
        Ok(())
    }

    /// Copy `src` (file or directory) to `dest` and verify the copy's digest
    pub fn copy_verified(&self, src: &Path, dest: &Path) -> Result<()> {
        let wrap = |e: IdResetError| IdResetError::backup(src, e);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| IdResetError::backup(src, e))?;
        }
        if src.is_dir() {
            copy_dir(src, dest).map_err(wrap)?;
        } else {
            fs::copy(src, dest).map_err(|e| IdResetError::backup(src, e))?;
        }

        let before = digest(src).map_err(wrap)?;
        let after = digest(dest).map_err(wrap)?;
        if before != after {
            return Err(IdResetError::backup(
                src,
                format!("checksum mismatch ({} != {})", &before[..12], &after[..12]),
            ));
        }
        debug!("backed up {} -> {}", src.display(), dest.display());
        Ok(())
    }

    /// Put a backup back over the original
    pub fn restore(&self, backup: &Path, original: &Path) -> Result<()> {
        if !backup.exists() {
            return Err(IdResetError::backup(backup, "backup is missing"));
        }
        if backup.is_dir() {
            if original.exists() {
                fs::remove_dir_all(original)?;
            }
            copy_dir(backup, original)?;
        } else {
            let tmp = original.with_file_name(format!(".{}.idreset-restore", file_name(original)));
            fs::copy(backup, &tmp)?;
            fs::rename(&tmp, original)?;
        }
        info!("restored {} from {}", original.display(), backup.display());
        Ok(())
    }

    pub fn save_registry(&self, dest: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, serde_json::to_string_pretty(snapshot)?)?;
        Ok(())
    }

    pub fn load_registry(&self, dest: &Path) -> Result<RegistrySnapshot> {
        Ok(serde_json::from_str(&fs::read_to_string(dest)?)?)
    }

    /// Remove all but the newest `keep` backups.
    ///
    /// In the directory layout whole run directories are pruned. In the sibling
    /// layout `search_roots` are walked and backups are grouped per original.
    /// Registry snapshots are always pruned per run directory.
    pub fn prune(&self, search_roots: &[PathBuf], keep: usize) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        match &self.backup_dir {
            Some(dir) => prune_run_dirs(dir, keep, &mut report)?,
            None => {
                let mut groups: BTreeMap<(PathBuf, String), Vec<(String, PathBuf)>> =
                    BTreeMap::new();
                for root in search_roots.iter().filter(|r| r.is_dir()) {
                    for entry in WalkDir::new(root).follow_links(false).max_depth(8) {
                        let entry = match entry {
                            Ok(e) => e,
                            Err(e) => {
                                warn!("prune: skipping unreadable entry: {}", e);
                                continue;
                            }
                        };
                        let name = entry.file_name().to_string_lossy().into_owned();
                        let Some((original, stamp)) = name.split_once(BACKUP_MARKER) else {
                            continue;
                        };
                        let parent = entry.path().parent().map(Path::to_path_buf).unwrap_or_default();
                        groups
                            .entry((parent, original.to_string()))
                            .or_default()
                            .push((stamp.to_string(), entry.path().to_path_buf()));
                    }
                }
                for (_, mut backups) in groups {
                    backups.sort_by(|a, b| b.0.cmp(&a.0));
                    for (i, (_, path)) in backups.into_iter().enumerate() {
                        if i < keep {
                            report.kept += 1;
                            continue;
                        }
                        remove_path(&path)?;
                        report.removed.push(path);
                    }
                }
            }
        }

        prune_run_dirs(&self.state_dir.join(REGISTRY_BACKUP_DIR), keep, &mut report)?;
        info!(
            "prune: removed {} backup(s), kept {}",
            report.removed.len(),
            report.kept
        );
        Ok(report)
    }
}

/// SHA-256 of a file, or of a directory's sorted relative paths and contents
pub fn digest(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    if path.is_dir() {
        let mut entries: Vec<_> = WalkDir::new(path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| IdResetError::Io(io::Error::other(e)))?;
        entries.retain(|e| e.file_type().is_file());
        for entry in entries {
            let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
            hasher.update(rel.to_string_lossy().as_bytes());
            hash_file(entry.path(), &mut hasher)?;
        }
    } else {
        hash_file(path, &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_file(path: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| IdResetError::Io(io::Error::other(e)))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn prune_run_dirs(dir: &Path, keep: usize, report: &mut PruneReport) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mut runs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    runs.sort();
    runs.reverse();
    for (i, run) in runs.into_iter().enumerate() {
        if i < keep {
            report.kept += 1;
        } else {
            fs::remove_dir_all(&run)?;
            report.removed.push(run);
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}

#[cfg(unix)]
fn is_writable(dir: &Path) -> bool {
    use nix::unistd::{AccessFlags, access};
    access(dir, AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn is_writable(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sibling_backup_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("state.vscdb");
        fs::write(&original, b"payload").unwrap();

        let store = BackupStore::new(None, dir.path().join("state"));
        let dest = store.file_destination(&original);
        assert!(dest.file_name().unwrap().to_string_lossy().starts_with("state.vscdb.backup_"));
        store.check_destination(&dest).unwrap();
        store.copy_verified(&original, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

    #[test]
    fn test_restore_puts_content_back() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("storage.json");
        fs::write(&original, "before").unwrap();
        let store = BackupStore::new(Some(dir.path().join("backups")), dir.path());
        let dest = store.file_destination(&original);
        store.copy_verified(&original, &dest).unwrap();

        fs::write(&original, "after").unwrap();
        store.restore(&dest, &original).unwrap();
        assert_eq!(fs::read_to_string(&original).unwrap(), "before");
    }

    #[test]
    fn test_directory_backup_and_digest() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("cache");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a"), "1").unwrap();
        fs::write(src.join("sub/b"), "2").unwrap();

        let store = BackupStore::new(None, dir.path());
        let dest = store.file_destination(&src);
        store.copy_verified(&src, &dest).unwrap();
        assert_eq!(digest(&src).unwrap(), digest(&dest).unwrap());
    }

    #[test]
    fn test_prune_keeps_newest_per_original() {
        let dir = TempDir::new().unwrap();
        for stamp in ["20250101T000000000Z", "20250102T000000000Z", "20250103T000000000Z"] {
            fs::write(dir.path().join(format!("state.vscdb.backup_{}", stamp)), stamp).unwrap();
        }
        fs::write(dir.path().join("storage.json.backup_20250101T000000000Z"), "x").unwrap();

        let store = BackupStore::new(None, dir.path().join("state"));
        let report = store.prune(&[dir.path().to_path_buf()], 1).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.kept, 2);
        assert!(dir.path().join("state.vscdb.backup_20250103T000000000Z").exists());
        assert!(!dir.path().join("state.vscdb.backup_20250101T000000000Z").exists());
    }

    #[test]
    fn test_prune_run_directories() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        for run in ["20250101T000000000Z", "20250102T000000000Z"] {
            fs::create_dir_all(backups.join(run)).unwrap();
        }
        let store = BackupStore::new(Some(backups.clone()), dir.path());
        let report = store.prune(&[], 1).unwrap();
        assert_eq!(report.removed, vec![backups.join("20250101T000000000Z")]);
    }

    #[test]
    fn test_registry_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(None, dir.path());
        let dest = store.registry_destination("Machine Id");
        let snapshot = RegistrySnapshot {
            key: r"HKCU\Software\App".into(),
            value: "Machine Id".into(),
            data: Some("abc".into()),
        };
        store.save_registry(&dest, &snapshot).unwrap();
        assert_eq!(store.load_registry(&dest).unwrap(), snapshot);
        assert!(dest.to_string_lossy().contains("Machine_Id"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_destination_is_rejected() {
        use std::os::unix::fs::PermissionsExt;
        // root ignores permission bits
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        let store = BackupStore::new(None, dir.path());
        let dest = store.file_destination(&locked.join("state.vscdb"));
        assert!(store.check_destination(&dest).is_err());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();
    }
}
