//! Discovered artifacts and the inventory that carries them
//!
//! An [`Inventory`] is created once per run by discovery and then only read.
//! Artifacts describe what was found, including a read-only [`StoreProbe`] of
//! their contents; planning and execution never modify these records.

use crate::types::{ArtifactKind, ConfigFormat, PriorityTier, ScanMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where an artifact lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactLocation {
    File { path: PathBuf },
    Registry { key: String, value: String },
}

impl ArtifactLocation {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    /// Filesystem path, if this is a file location
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path } => Some(path),
            Self::Registry { .. } => None,
        }
    }

    /// Stable key for deduplication
    pub fn dedup_key(&self) -> String {
        match self {
            Self::File { path } => path.to_string_lossy().into_owned(),
            Self::Registry { key, value } => {
                format!("registry:{}\\{}", key.to_lowercase(), value.to_lowercase())
            }
        }
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => write!(f, "{}", path.display()),
            Self::Registry { key, value } => write!(f, "{}\\{}", key, value),
        }
    }
}

/// Read-only snapshot of a SQLite store taken during discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbProbe {
    pub table_present: bool,
    pub integrity_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity_detail: Option<String>,
    /// Identifier keys present in the table
    pub identifier_keys: Vec<String>,
    /// Row count per configured row pattern
    pub pattern_matches: BTreeMap<String, u64>,
}

impl DbProbe {
    pub fn total_matches(&self) -> u64 {
        self.pattern_matches.values().sum()
    }
}

/// Read-only snapshot of a config file taken during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigProbe {
    pub format: ConfigFormat,
    /// JSON parsed to an object / text file readable
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifier keys present (JSON) or the single identifier held (text)
    pub identifier_keys: Vec<String>,
}

/// What discovery learned about an artifact's contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum StoreProbe {
    /// Contents are irrelevant (caches, temp files, directories)
    NotProbed,
    Database(DbProbe),
    Config(ConfigProbe),
    Registry {
        #[serde(skip_serializing_if = "Option::is_none")]
        identifier: Option<String>,
    },
    /// The store exists but could not be read
    Unreadable { reason: String },
}

/// A discovered unit of persisted state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Position in discovery order; the final ordering tie-break
    pub index: usize,
    pub location: ArtifactLocation,
    pub kind: ArtifactKind,
    pub priority: PriorityTier,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Application installation this artifact belongs to
    pub installation: String,
    pub is_dir: bool,
    pub probe: StoreProbe,
}

impl Artifact {
    pub fn config_format(&self) -> Option<ConfigFormat> {
        match &self.probe {
            StoreProbe::Config(probe) => Some(probe.format),
            _ => None,
        }
    }
}

/// A config file that should exist inside an installation but does not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedArtifact {
    pub path: PathBuf,
    pub format: ConfigFormat,
    pub installation: String,
    pub priority: PriorityTier,
}

/// A non-fatal problem met during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryWarning {
    pub location: String,
    pub reason: String,
}

/// Counts per kind and tier, for the run report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_tier: BTreeMap<String, usize>,
    pub missing: usize,
    pub warnings: usize,
}

/// Immutable result of one discovery run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub scan_mode: ScanMode,
    pub artifacts: Vec<Artifact>,
    pub missing: Vec<ExpectedArtifact>,
    pub warnings: Vec<DiscoveryWarning>,
    /// Installations whose application root was found
    pub installations: Vec<String>,
}

impl Inventory {
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.missing.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.index == index)
    }

    pub fn find(&self, location: &ArtifactLocation) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| &a.location == location)
    }

    pub fn summary(&self) -> InventorySummary {
        let mut summary = InventorySummary {
            total: self.artifacts.len(),
            missing: self.missing.len(),
            warnings: self.warnings.len(),
            ..Default::default()
        };
        for artifact in &self.artifacts {
            *summary.by_kind.entry(artifact.kind.to_string()).or_default() += 1;
            *summary
                .by_tier
                .entry(artifact.priority.to_string())
                .or_default() += 1;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(index: usize, kind: ArtifactKind, priority: PriorityTier) -> Artifact {
        Artifact {
            index,
            location: ArtifactLocation::file(format!("/tmp/a{}", index)),
            kind,
            priority,
            size: 10,
            last_modified: None,
            installation: "Code".into(),
            is_dir: false,
            probe: StoreProbe::NotProbed,
        }
    }

    #[test]
    fn test_summary_counts_kinds_and_tiers() {
        let inventory = Inventory {
            scan_mode: ScanMode::Standard,
            artifacts: vec![
                artifact(0, ArtifactKind::Database, PriorityTier::Critical),
                artifact(1, ArtifactKind::Database, PriorityTier::Important),
                artifact(2, ArtifactKind::CacheFile, PriorityTier::Optional),
            ],
            missing: vec![],
            warnings: vec![],
            installations: vec!["Code".into()],
        };
        let summary = inventory.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind.get("database"), Some(&2));
        assert_eq!(summary.by_tier.get("optional"), Some(&1));
    }

    #[test]
    fn test_registry_dedup_key_is_case_insensitive() {
        let a = ArtifactLocation::Registry {
            key: r"HKCU\Software\App".into(),
            value: "MachineId".into(),
        };
        let b = ArtifactLocation::Registry {
            key: r"hkcu\software\app".into(),
            value: "machineid".into(),
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.to_string(), r"HKCU\Software\App\MachineId");
    }
}
