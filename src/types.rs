//! Type-safe vocabulary for the reset pipeline
//!
//! Every closed set of values used by discovery, planning and execution is an
//! enum here instead of a string, so configuration typos fail at load time and
//! matches stay exhaustive.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Storage kind of a discovered artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    Database,
    ConfigFile,
    CacheFile,
    RegistryEntry,
    ExtensionDir,
    TempFile,
}

impl ArtifactKind {
    /// Execution order within a priority tier: databases first, then configs,
    /// then registry, then everything disposable.
    pub const fn order(self) -> u8 {
        match self {
            Self::Database => 0,
            Self::ConfigFile => 1,
            Self::RegistryEntry => 2,
            Self::CacheFile | Self::TempFile | Self::ExtensionDir => 3,
        }
    }

    /// Kinds whose contents carry identifier values the verifier can read back
    pub const fn holds_identifiers(self) -> bool {
        matches!(self, Self::Database | Self::ConfigFile | Self::RegistryEntry)
    }
}

/// Priority tier assigned at discovery time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PriorityTier {
    /// Authoritative identifier stores (main database, main config)
    Critical,
    Important,
    /// Artifacts likely to hold credentials or tokens
    Sensitive,
    /// Caches and logs that are safe to ignore
    Optional,
}

impl PriorityTier {
    /// Processing order: Critical first so identifiers are regenerated before
    /// anything that depends on them.
    pub const fn order(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::Important => 1,
            Self::Sensitive => 2,
            Self::Optional => 3,
        }
    }

    /// Tiers that must be backed up before any mutation
    pub const fn requires_backup(self) -> bool {
        matches!(self, Self::Critical | Self::Important)
    }
}

/// Discovery depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanMode {
    /// Roots plus one level of known subpaths
    #[default]
    Standard,
    /// Adds document/download trees, network caches and program data
    Comprehensive,
}

/// Named risk policy preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    Minimal,
    Conservative,
    #[default]
    Standard,
    Aggressive,
    Adaptive,
    Forensic,
    Custom,
}

/// Mutation applied by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum ActionType {
    DeleteMatchingRows,
    RewriteField,
    RegenerateIdentifier,
    DeleteFile,
    CreateDefaultConfig,
    NoOp,
}

/// Final per-operation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
    RolledBack,
}

/// Aggregated or per-finding risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// What happens to the rest of the run after a Critical operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    AbortOnCriticalFailure,
    Continue,
}

/// Shape of a generated identifier value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IdFormat {
    /// Lowercase hyphenated UUID v4
    Uuid,
    /// 64 lowercase hex characters
    Hex64,
    /// RFC 3339 UTC timestamp, millisecond precision
    Timestamp,
}

/// On-disk format of a config artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfigFormat {
    /// JSON object with flat dotted keys
    Json,
    /// File whose whole content is a single identifier value
    Text,
}
