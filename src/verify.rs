//! Consistency Verifier
//!
//! After execution, every identifier-bearing store that an executable
//! operation of the plan targeted is read back. Any identifier observed with
//! more than one value inside the same installation is reported as
//! `CONS_TELEMETRY_MISMATCH`; the verifier never picks a winner. Store
//! integrity is re-checked independently of what the executor already
//! verified.
//!
//! Stores the mode left alone (workspace databases in minimal mode, Sensitive
//! stores outside comprehensive mode) still hold their old values. They are
//! listed as [`UntargetedStore`]s and never count as issues.

use crate::artifact::{ArtifactLocation, Inventory, StoreProbe};
use crate::engine::strategy::Plan;
use crate::patterns::PatternConfig;
use crate::registry::RegistryAccess;
use crate::stores::config::read_text_value;
use crate::stores::{SqliteStore, read_json_object};
use crate::types::{ArtifactKind, ConfigFormat, PriorityTier};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::time::Duration;
use strum::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    ConsTelemetryMismatch,
    ConsRequiredKeyMissing,
    IntegritySqliteCorrupt,
    IntegrityJsonInvalid,
    StoreUnreadable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum VerificationStatus {
    Success,
    IssuesFound,
}

/// One value read from one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub store: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub code: IssueCode,
    pub installation: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<Observation>,
}

/// Identifier values found in a store no operation wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UntargetedStore {
    pub installation: String,
    pub store: String,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub overall_status: VerificationStatus,
    pub installations_checked: usize,
    pub stores_checked: usize,
    pub remaining_issues: Vec<Issue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub untargeted: Vec<UntargetedStore>,
}

impl VerificationReport {
    pub fn is_success(&self) -> bool {
        self.overall_status == VerificationStatus::Success
    }

    pub fn count(&self, code: IssueCode) -> usize {
        self.remaining_issues.iter().filter(|i| i.code == code).count()
    }
}

/// A store expected to hold identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRef {
    pub location: ArtifactLocation,
    pub kind: ArtifactKind,
    pub format: Option<ConfigFormat>,
    /// Required identifiers must be present (Critical JSON configs)
    pub critical: bool,
    /// Identifier held by a text config or registry value
    pub identifier: Option<String>,
    /// Written by an executable operation of the plan
    pub targeted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub name: String,
    pub stores: Vec<StoreRef>,
}

/// Group the identifier-bearing stores of an inventory per installation.
///
/// A store is targeted when an executable operation of `plan` touches it.
/// Configs that were expected but missing are included at their expected
/// path, so a config created during the run is checked too.
pub fn installations(inventory: &Inventory, patterns: &PatternConfig, plan: &Plan) -> Vec<Installation> {
    let written: HashSet<String> = plan
        .executable()
        .flat_map(|op| op.targets.iter().map(ArtifactLocation::dedup_key))
        .collect();
    let targeted = |location: &ArtifactLocation| written.contains(&location.dedup_key());
    let mut grouped: BTreeMap<String, Vec<StoreRef>> = BTreeMap::new();

    for artifact in &inventory.artifacts {
        let (kind, format, critical, identifier) = match (&artifact.kind, &artifact.probe) {
            (ArtifactKind::Database, _) => (
                ArtifactKind::Database,
                None,
                artifact.priority == PriorityTier::Critical,
                None,
            ),
            (ArtifactKind::ConfigFile, StoreProbe::Config(probe)) => (
                ArtifactKind::ConfigFile,
                Some(probe.format),
                artifact.priority == PriorityTier::Critical,
                text_identifier(patterns, &artifact.location),
            ),
            (ArtifactKind::RegistryEntry, StoreProbe::Registry { identifier: Some(id) }) => {
                (ArtifactKind::RegistryEntry, None, false, Some(id.clone()))
            }
            _ => continue,
        };
        grouped
            .entry(artifact.installation.clone())
            .or_default()
            .push(StoreRef {
                targeted: targeted(&artifact.location),
                location: artifact.location.clone(),
                kind,
                format,
                critical,
                identifier,
            });
    }

    for expected in &inventory.missing {
        let location = ArtifactLocation::file(&expected.path);
        grouped
            .entry(expected.installation.clone())
            .or_default()
            .push(StoreRef {
                identifier: text_identifier(patterns, &location),
                targeted: targeted(&location),
                location,
                kind: ArtifactKind::ConfigFile,
                format: Some(expected.format),
                critical: expected.priority == PriorityTier::Critical,
            });
    }

    grouped
        .into_iter()
        .map(|(name, stores)| Installation { name, stores })
        .collect()
}

fn text_identifier(patterns: &PatternConfig, location: &ArtifactLocation) -> Option<String> {
    let name = location.path()?.file_name()?.to_str()?;
    patterns.config_spec(name)?.identifier.clone()
}

pub struct Verifier<'a> {
    patterns: &'a PatternConfig,
    registry: &'a dyn RegistryAccess,
    timeout: Duration,
}

impl<'a> Verifier<'a> {
    pub fn new(patterns: &'a PatternConfig, registry: &'a dyn RegistryAccess, timeout: Duration) -> Self {
        Self {
            patterns,
            registry,
            timeout,
        }
    }

    pub fn verify(&self, installations: &[Installation]) -> VerificationReport {
        let mut issues = Vec::new();
        let mut untargeted = Vec::new();
        let mut stores_checked = 0;

        for installation in installations {
            // identifier name -> observations across this installation
            let mut seen: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
            for store in &installation.stores {
                if let Some(path) = store.location.path() {
                    if fs::symlink_metadata(path).is_err() {
                        debug!("verify: {} no longer exists", path.display());
                        continue;
                    }
                }
                if !store.targeted {
                    if let Some(note) = self.observe_untargeted(&installation.name, store) {
                        untargeted.push(note);
                    }
                    continue;
                }
                stores_checked += 1;
                let mut issue = |code: IssueCode, message: String| {
                    warn!("{} [{}]: {}", code, installation.name, message);
                    issues.push(Issue {
                        code,
                        installation: installation.name.clone(),
                        message,
                        observations: Vec::new(),
                    });
                };
                match self.read_store(store) {
                    Ok(values) => {
                        for (identifier, value) in values {
                            seen.entry(identifier).or_default().push(Observation {
                                store: store.location.to_string(),
                                value,
                            });
                        }
                    }
                    Err((code, message)) => issue(code, message),
                }
                if let Some(message) = self.missing_required(store) {
                    issue(IssueCode::ConsRequiredKeyMissing, message);
                }
            }

            for (identifier, observations) in seen {
                let mut distinct: Vec<&str> = observations.iter().map(|o| o.value.as_str()).collect();
                distinct.sort_unstable();
                distinct.dedup();
                if distinct.len() > 1 {
                    let message = format!(
                        "{} has {} distinct values across {} store(s)",
                        identifier,
                        distinct.len(),
                        observations.len()
                    );
                    warn!("{} [{}]: {}", IssueCode::ConsTelemetryMismatch, installation.name, message);
                    issues.push(Issue {
                        code: IssueCode::ConsTelemetryMismatch,
                        installation: installation.name.clone(),
                        message,
                        observations,
                    });
                }
            }
        }

        let overall_status = if issues.is_empty() {
            VerificationStatus::Success
        } else {
            VerificationStatus::IssuesFound
        };
        info!(
            "verification: {} ({} installation(s), {} store(s), {} issue(s), {} untargeted)",
            overall_status,
            installations.len(),
            stores_checked,
            issues.len(),
            untargeted.len()
        );
        VerificationReport {
            overall_status,
            installations_checked: installations.len(),
            stores_checked,
            remaining_issues: issues,
            untargeted,
        }
    }

    fn observe_untargeted(&self, installation: &str, store: &StoreRef) -> Option<UntargetedStore> {
        let values = match self.read_store(store) {
            Ok(values) if !values.is_empty() => values,
            Ok(_) => return None,
            Err((code, message)) => {
                debug!("verify: untargeted {} not read ({}): {}", store.location, code, message);
                return None;
            }
        };
        info!(
            "verify: {} was not written this run; {} identifier(s) keep their values",
            store.location,
            values.len()
        );
        Some(UntargetedStore {
            installation: installation.to_string(),
            store: store.location.to_string(),
            values: values.into_iter().collect(),
        })
    }

    /// `(identifier name, value)` pairs held by a store
    fn read_store(&self, store: &StoreRef) -> Result<Vec<(String, String)>, (IssueCode, String)> {
        let target = store.location.to_string();
        let unreadable = |e: &dyn std::fmt::Display| (IssueCode::StoreUnreadable, format!("{}: {}", target, e));

        match (store.kind, &store.location) {
            (ArtifactKind::Database, ArtifactLocation::File { path }) => {
                let db = SqliteStore::open_read_only(path, &self.patterns.database, self.timeout)
                    .map_err(|e| unreadable(&e))?;
                let integrity = db.integrity_check().map_err(|e| unreadable(&e))?;
                if !integrity.ok {
                    return Err((
                        IssueCode::IntegritySqliteCorrupt,
                        format!("{}: {}", target, integrity.detail.unwrap_or_default()),
                    ));
                }
                if !db.table_exists().map_err(|e| unreadable(&e))? {
                    return Ok(Vec::new());
                }
                let mut values = Vec::new();
                for def in &self.patterns.identifiers {
                    if let Some(value) = db.read_value(&def.key).map_err(|e| unreadable(&e))? {
                        values.push((def.name.clone(), value));
                    }
                }
                Ok(values)
            }
            (ArtifactKind::ConfigFile, ArtifactLocation::File { path }) => match store.format {
                Some(ConfigFormat::Text) => {
                    let value = read_text_value(path).map_err(|e| unreadable(&e))?;
                    Ok(match (&store.identifier, value.is_empty()) {
                        (Some(identifier), false) => vec![(identifier.clone(), value)],
                        _ => Vec::new(),
                    })
                }
                _ => {
                    let map = read_json_object(path)
                        .map_err(|e| (IssueCode::IntegrityJsonInvalid, format!("{}: {}", target, e)))?;
                    Ok(self
                        .patterns
                        .identifiers
                        .iter()
                        .filter_map(|def| match map.get(&def.key) {
                            Some(Value::String(s)) => Some((def.name.clone(), s.clone())),
                            _ => None,
                        })
                        .collect())
                }
            },
            (ArtifactKind::RegistryEntry, ArtifactLocation::Registry { key, value }) => {
                let Some(identifier) = &store.identifier else {
                    return Ok(Vec::new());
                };
                let data = self
                    .registry
                    .read_value(key, value)
                    .map_err(|e| unreadable(&e))?;
                Ok(data.map(|d| vec![(identifier.clone(), d)]).unwrap_or_default())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Required identifiers absent from a Critical JSON config
    fn missing_required(&self, store: &StoreRef) -> Option<String> {
        if !store.critical || store.format != Some(ConfigFormat::Json) {
            return None;
        }
        let map = read_json_object(store.location.path()?).ok()?;
        let missing: Vec<&str> = self
            .patterns
            .required_identifiers()
            .filter(|d| !matches!(map.get(&d.key), Some(Value::String(_))))
            .map(|d| d.key.as_str())
            .collect();
        (!missing.is_empty()).then(|| format!("{} lacks {}", store.location, missing.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, NoRegistry};
    use rusqlite::{Connection, params};
    use std::path::Path;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn make_db(path: &Path, rows: &[(&str, &str)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "CREATE TABLE ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)",
            [],
        )
        .unwrap();
        for (k, v) in rows {
            conn.execute("INSERT INTO ItemTable (key, value) VALUES (?1, ?2)", params![k, v])
                .unwrap();
        }
    }

    fn db_store(path: &Path) -> StoreRef {
        StoreRef {
            location: ArtifactLocation::file(path),
            kind: ArtifactKind::Database,
            format: None,
            critical: false,
            identifier: None,
            targeted: true,
        }
    }

    fn json_store(path: &Path, critical: bool) -> StoreRef {
        StoreRef {
            location: ArtifactLocation::file(path),
            kind: ArtifactKind::ConfigFile,
            format: Some(ConfigFormat::Json),
            critical,
            identifier: None,
            targeted: true,
        }
    }

    fn one(stores: Vec<StoreRef>) -> Vec<Installation> {
        vec![Installation {
            name: "Code".into(),
            stores,
        }]
    }

    #[test]
    fn test_consistent_stores_pass() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state.vscdb");
        make_db(&db, &[("telemetry.devDeviceId", "same"), ("foo", "bar")]);
        let json = dir.path().join("storage.json");
        fs::write(&json, r#"{"telemetry.devDeviceId": "same", "theme": 1}"#).unwrap();

        let patterns = PatternConfig::builtin().unwrap();
        let report = Verifier::new(&patterns, &NoRegistry, TIMEOUT)
            .verify(&one(vec![db_store(&db), json_store(&json, false)]));
        assert!(report.is_success(), "{:?}", report.remaining_issues);
        assert_eq!(report.stores_checked, 2);
    }

    #[test]
    fn test_mismatch_names_every_store() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state.vscdb");
        make_db(&db, &[("telemetry.devDeviceId", "one")]);
        let json = dir.path().join("storage.json");
        fs::write(&json, r#"{"telemetry.devDeviceId": "two"}"#).unwrap();

        let patterns = PatternConfig::builtin().unwrap();
        let report = Verifier::new(&patterns, &NoRegistry, TIMEOUT)
            .verify(&one(vec![db_store(&db), json_store(&json, false)]));
        assert_eq!(report.overall_status, VerificationStatus::IssuesFound);
        let issue = &report.remaining_issues[0];
        assert_eq!(issue.code, IssueCode::ConsTelemetryMismatch);
        assert_eq!(issue.observations.len(), 2);
        assert_eq!(issue.code.to_string(), "CONS_TELEMETRY_MISMATCH");
    }

    #[test]
    fn test_installations_are_checked_separately() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.vscdb");
        let b = dir.path().join("b.vscdb");
        make_db(&a, &[("telemetry.machineId", "one")]);
        make_db(&b, &[("telemetry.machineId", "two")]);

        let patterns = PatternConfig::builtin().unwrap();
        let installations = vec![
            Installation {
                name: "Code".into(),
                stores: vec![db_store(&a)],
            },
            Installation {
                name: "VSCodium".into(),
                stores: vec![db_store(&b)],
            },
        ];
        let report = Verifier::new(&patterns, &NoRegistry, TIMEOUT).verify(&installations);
        assert!(report.is_success());
        assert_eq!(report.installations_checked, 2);
    }

    #[test]
    fn test_invalid_json_and_missing_required_keys() {
        let dir = TempDir::new().unwrap();
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        let sparse = dir.path().join("storage.json");
        fs::write(&sparse, r#"{"telemetry.machineId": "m"}"#).unwrap();

        let patterns = PatternConfig::builtin().unwrap();
        let report = Verifier::new(&patterns, &NoRegistry, TIMEOUT)
            .verify(&one(vec![json_store(&broken, false), json_store(&sparse, true)]));
        assert_eq!(report.count(IssueCode::IntegrityJsonInvalid), 1);
        assert_eq!(report.count(IssueCode::ConsRequiredKeyMissing), 1);
    }

    #[test]
    fn test_corrupt_database_is_reported() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("state.vscdb");
        fs::write(&db, b"SQLite format 3\0garbage garbage garbage").unwrap();

        let patterns = PatternConfig::builtin().unwrap();
        let report = Verifier::new(&patterns, &NoRegistry, TIMEOUT).verify(&one(vec![db_store(&db)]));
        assert!(!report.is_success());
        let code = report.remaining_issues[0].code;
        assert!(matches!(code, IssueCode::IntegritySqliteCorrupt | IssueCode::StoreUnreadable));
    }

    #[test]
    fn test_registry_and_text_values_take_part() {
        let dir = TempDir::new().unwrap();
        let text = dir.path().join("machineid");
        fs::write(&text, "from-text\n").unwrap();
        let registry = MemoryRegistry::new().with_value(r"HKCU\Software\Code", "MachineId", "from-registry");

        let stores = vec![
            StoreRef {
                location: ArtifactLocation::file(&text),
                kind: ArtifactKind::ConfigFile,
                format: Some(ConfigFormat::Text),
                critical: true,
                identifier: Some("machineId".into()),
                targeted: true,
            },
            StoreRef {
                location: ArtifactLocation::Registry {
                    key: r"HKCU\Software\Code".into(),
                    value: "MachineId".into(),
                },
                kind: ArtifactKind::RegistryEntry,
                format: None,
                critical: false,
                identifier: Some("machineId".into()),
                targeted: true,
            },
        ];
        let patterns = PatternConfig::builtin().unwrap();
        let report = Verifier::new(&patterns, &registry, TIMEOUT).verify(&one(stores));
        assert_eq!(report.count(IssueCode::ConsTelemetryMismatch), 1);
    }

    #[test]
    fn test_untargeted_stores_are_informational() {
        let dir = TempDir::new().unwrap();
        let global = dir.path().join("state.vscdb");
        make_db(&global, &[("telemetry.machineId", "fresh")]);
        let workspace = dir.path().join("workspace.vscdb");
        make_db(&workspace, &[("telemetry.machineId", "old-m")]);
        let untouched = StoreRef {
            targeted: false,
            ..db_store(&workspace)
        };

        let patterns = PatternConfig::builtin().unwrap();
        let report = Verifier::new(&patterns, &NoRegistry, TIMEOUT)
            .verify(&one(vec![db_store(&global), untouched]));
        assert!(report.is_success(), "{:?}", report.remaining_issues);
        assert_eq!(report.stores_checked, 1);
        assert_eq!(report.untargeted.len(), 1);
        assert_eq!(
            report.untargeted[0].values.get("machineId").map(String::as_str),
            Some("old-m")
        );
    }

    #[test]
    fn test_deleted_stores_are_ignored() {
        let dir = TempDir::new().unwrap();
        let patterns = PatternConfig::builtin().unwrap();
        let report = Verifier::new(&patterns, &NoRegistry, TIMEOUT)
            .verify(&one(vec![db_store(&dir.path().join("gone.vscdb"))]));
        assert!(report.is_success());
        assert_eq!(report.stores_checked, 0);
    }
}
