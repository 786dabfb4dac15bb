//! Versioned pattern data
//!
//! Where identifiers live, which rows to delete, which files count as what:
//! all of it is data, not engine logic. The built-in set ships as
//! `data/patterns.v1.json`; a replacement file with the same schema can be
//! supplied at runtime.
//!
//! # Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "identifiers": [
//!     { "name": "machineId", "key": "telemetry.machineId", "format": "hex64", "required": true }
//!   ],
//!   "database": { "table": "ItemTable", "key_column": "key", "value_column": "value",
//!                 "extensions": [".vscdb"] },
//!   "row_patterns": [
//!     { "category": "telemetry", "patterns": ["telemetry.%", "%machineId%"] },
//!     { "category": "augment", "patterns": ["%augment%"] }
//!   ],
//!   ...
//! }
//! ```
//!
//! Everything is checked by [`PatternConfig::validate`] at load time; an
//! invalid file is a fatal configuration error, never a point-of-use surprise.

use crate::error::{IdResetError, Result};
use crate::sql;
use crate::types::{ConfigFormat, IdFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};

/// Pattern schema version this build understands
pub const SUPPORTED_VERSION: u32 = 1;

const BUILTIN_PATTERNS: &str = include_str!("../data/patterns.v1.json");

/// One logical identifier and where it is stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IdentifierDef {
    /// Logical name (e.g. "machineId")
    pub name: String,
    /// Flat dotted key used in databases and JSON configs (e.g. "telemetry.machineId")
    pub key: String,
    pub format: IdFormat,
    /// Required identifiers are written into Critical configs even when absent
    #[serde(default)]
    pub required: bool,
}

/// Key/value table layout of identifier databases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSchema {
    pub table: String,
    pub key_column: String,
    pub value_column: String,
    /// File extensions (with leading dot) treated as databases by name
    pub extensions: Vec<String>,
}

/// How files under a known subpath are classified
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubpathRole {
    /// Databases and configs; unknown small files are content-sniffed
    State,
    Cache,
    Logs,
}

/// A subpath below an application root that discovery walks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KnownSubpath {
    /// Relative to the application root; empty means the root itself
    pub path: String,
    pub max_depth: usize,
    pub role: SubpathRole,
    #[serde(default)]
    pub comprehensive_only: bool,
}

/// A config file discovery looks for by name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileSpec {
    pub name: String,
    /// Directory relative to the application root
    pub relative_dir: String,
    pub format: ConfigFormat,
    /// For text configs: the identifier the whole file holds
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub critical: bool,
    /// Create with fresh identifiers when the application root exists but the file does not
    #[serde(default)]
    pub create_if_missing: bool,
}

/// Content-sniffing rules for files that match no name pattern
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SniffRules {
    /// Files at or above this size are never read
    pub max_bytes: u64,
    /// Any of these in the content marks the file as identifier-bearing
    pub keywords: Vec<String>,
    /// Any of these in the content marks the file as Sensitive
    pub sensitive_keywords: Vec<String>,
}

/// Named group of `LIKE` patterns for rows removed from databases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RowPatternGroup {
    /// e.g. "telemetry", "augment", "extensions"
    pub category: String,
    pub patterns: Vec<String>,
}

/// A registry value discovery checks for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegistryEntrySpec {
    /// Full key path, e.g. `HKCU\Software\Vendor\App`
    pub key: String,
    pub value: String,
    /// Identifier held by this value; entries without one are deleted
    #[serde(default)]
    pub identifier: Option<String>,
    /// Installation this entry belongs to
    pub app: String,
}

/// Complete pattern set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PatternConfig {
    pub version: u32,
    pub identifiers: Vec<IdentifierDef>,
    pub database: DatabaseSchema,
    /// `LIKE` patterns for rows removed by `DeleteMatchingRows`, by category
    pub row_patterns: Vec<RowPatternGroup>,
    /// Application directory names below each config base
    pub app_dirs: Vec<String>,
    pub known_subpaths: Vec<KnownSubpath>,
    pub config_files: Vec<ConfigFileSpec>,
    /// Path suffixes (relative to an app root) of Critical databases
    pub critical_suffixes: Vec<String>,
    pub sniff: SniffRules,
    /// Lowercase substrings of file names that mark a file as Sensitive
    pub sensitive_name_markers: Vec<String>,
    /// Extension directories, relative to the home directory
    pub extension_dirs: Vec<String>,
    /// `LIKE` patterns over directory names selecting extensions to inventory
    pub extension_patterns: Vec<String>,
    /// Lowercase substrings selecting entries in temp directories
    pub temp_markers: Vec<String>,
    /// Home-relative trees walked in comprehensive mode
    pub document_dirs: Vec<String>,
    pub registry_entries: Vec<RegistryEntrySpec>,
}

impl PatternConfig {
    /// The built-in pattern set
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_PATTERNS)
    }

    /// Parse and validate pattern data
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IdResetError::configuration(format!("invalid pattern data: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load pattern data from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            IdResetError::configuration(format!(
                "cannot read pattern file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Validate the pattern set
    pub fn validate(&self) -> Result<()> {
        if self.version != SUPPORTED_VERSION {
            return Err(IdResetError::configuration(format!(
                "unsupported pattern version {} (expected {})",
                self.version, SUPPORTED_VERSION
            )));
        }

        if self.identifiers.is_empty() {
            return Err(IdResetError::configuration("at least one identifier is required"));
        }
        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for def in &self.identifiers {
            if def.name.trim().is_empty() || def.key.trim().is_empty() {
                return Err(IdResetError::configuration("identifier name and key must be set"));
            }
            if !names.insert(def.name.as_str()) {
                return Err(IdResetError::configuration(format!(
                    "duplicate identifier name '{}'",
                    def.name
                )));
            }
            if !keys.insert(def.key.as_str()) {
                return Err(IdResetError::configuration(format!(
                    "duplicate identifier key '{}'",
                    def.key
                )));
            }
        }

        sql::validate_identifier(&self.database.table)?;
        sql::validate_identifier(&self.database.key_column)?;
        sql::validate_identifier(&self.database.value_column)?;
        if let Some(ext) = self.database.extensions.iter().find(|e| !e.starts_with('.')) {
            return Err(IdResetError::configuration(format!(
                "database extension '{}' must start with '.'",
                ext
            )));
        }

        let mut categories = HashSet::new();
        for group in &self.row_patterns {
            if group.category.trim().is_empty() || !categories.insert(group.category.as_str()) {
                return Err(IdResetError::configuration(format!(
                    "row pattern category '{}' must be set and unique",
                    group.category
                )));
            }
            for pattern in &group.patterns {
                sql::validate_like_pattern(pattern)?;
            }
        }
        for pattern in &self.extension_patterns {
            sql::validate_like_pattern(pattern)?;
        }

        for sub in &self.known_subpaths {
            check_relative(&sub.path)?;
            if sub.max_depth == 0 || sub.max_depth > 8 {
                return Err(IdResetError::configuration(format!(
                    "known subpath '{}' depth must be 1-8",
                    sub.path
                )));
            }
        }

        for spec in &self.config_files {
            check_relative(&spec.relative_dir)?;
            match (spec.format, &spec.identifier) {
                (ConfigFormat::Text, None) => {
                    return Err(IdResetError::configuration(format!(
                        "text config '{}' must name the identifier it holds",
                        spec.name
                    )));
                }
                (ConfigFormat::Text, Some(id)) if self.identifier(id).is_none() => {
                    return Err(IdResetError::configuration(format!(
                        "text config '{}' references unknown identifier '{}'",
                        spec.name, id
                    )));
                }
                (ConfigFormat::Json, Some(_)) => {
                    return Err(IdResetError::configuration(format!(
                        "json config '{}' must not name a single identifier",
                        spec.name
                    )));
                }
                _ => {}
            }
        }

        for entry in &self.registry_entries {
            let unknown = entry
                .identifier
                .as_deref()
                .filter(|id| self.identifier(id).is_none());
            if let Some(id) = unknown {
                return Err(IdResetError::configuration(format!(
                    "registry entry {}\\{} references unknown identifier '{}'",
                    entry.key, entry.value, id
                )));
            }
        }

        if self.sniff.max_bytes == 0 {
            return Err(IdResetError::configuration("sniff.max_bytes must be positive"));
        }

        Ok(())
    }

    /// Look up an identifier by logical name
    pub fn identifier(&self, name: &str) -> Option<&IdentifierDef> {
        self.identifiers.iter().find(|d| d.name == name)
    }

    /// Look up an identifier by storage key
    pub fn identifier_by_key(&self, key: &str) -> Option<&IdentifierDef> {
        self.identifiers.iter().find(|d| d.key == key)
    }

    /// Every row pattern across categories, first occurrence only
    pub fn delete_patterns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.row_patterns
            .iter()
            .flat_map(|g| g.patterns.iter().map(String::as_str))
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Row patterns of one category
    pub fn category_patterns(&self, category: &str) -> &[String] {
        self.row_patterns
            .iter()
            .find(|g| g.category == category)
            .map(|g| g.patterns.as_slice())
            .unwrap_or_default()
    }

    /// Whether an extension directory name matches an extension pattern
    pub fn is_tracked_extension(&self, dir_name: &str) -> bool {
        self.extension_patterns
            .iter()
            .any(|p| sql::like_matches(p, dir_name))
    }

    pub fn required_identifiers(&self) -> impl Iterator<Item = &IdentifierDef> {
        self.identifiers.iter().filter(|d| d.required)
    }

    /// Whether a file name has a database extension
    pub fn is_database_name(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.database
            .extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
    }

    /// The config spec whose file name matches, if any
    pub fn config_spec(&self, file_name: &str) -> Option<&ConfigFileSpec> {
        self.config_files.iter().find(|s| s.name == file_name)
    }

    /// Whether a path relative to an application root names a Critical database
    pub fn is_critical_suffix(&self, relative: &Path) -> bool {
        self.critical_suffixes
            .iter()
            .any(|suffix| relative.ends_with(Path::new(suffix)))
    }

    /// Whether a file name carries a sensitive marker
    pub fn is_sensitive_name(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.sensitive_name_markers.iter().any(|m| lower.contains(m.as_str()))
    }
}

/// Reject absolute paths and parent-directory components in configured subpaths
fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(IdResetError::configuration(format!(
            "configured subpath '{}' must be relative and stay inside the application root",
            path
        )));
    }
    Ok(())
}
