//! Discovery Engine
//!
//! Walks the configured roots and returns an immutable [`Inventory`]. Nothing
//! here writes: databases are opened read-only, configs are only parsed, and
//! registry values are only queried. Inaccessible roots and entries become
//! warnings; discovery itself never fails.
//!
//! Standard scans cover each application root plus its known subpaths.
//! Comprehensive scans walk the same set first and then add document trees,
//! network caches and program data, so they only ever extend the result.

mod classify;
mod roots;

pub use classify::{SQLITE_HEADER, Sniffed, is_excluded_name, sniff_bytes, sniff_file, tier_for};
pub use roots::DiscoveryRoots;

use crate::artifact::{
    Artifact, ArtifactLocation, DiscoveryWarning, ExpectedArtifact, Inventory, StoreProbe,
};
use crate::patterns::{PatternConfig, SubpathRole};
use crate::registry::RegistryAccess;
use crate::stores::{SqliteStore, probe_config};
use crate::types::{ArtifactKind, ConfigFormat, PriorityTier, ScanMode};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Installation label for artifacts outside any application root
pub const UNSCOPED: &str = "(unscoped)";

/// Depth of document/download trees in comprehensive scans
const DOCUMENT_DEPTH: usize = 5;

/// Depth of program data trees in comprehensive scans
const PROGRAM_DATA_DEPTH: usize = 3;

/// Discovery switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscoveryOptions {
    pub scan_mode: ScanMode,
    pub include_registry: bool,
    pub include_volatile_temp: bool,
}

/// How files under a walked directory are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Name patterns first, then content sniffing
    State,
    /// Every file is disposable
    Disposable,
    /// Only files whose content matches are kept
    SniffOnly,
}

impl From<SubpathRole> for Scope {
    fn from(role: SubpathRole) -> Self {
        match role {
            SubpathRole::State => Scope::State,
            SubpathRole::Cache | SubpathRole::Logs => Scope::Disposable,
        }
    }
}

/// One installation root being walked
struct AppRoot<'r> {
    root: &'r Path,
    label: &'r str,
}

/// Mutable accumulator for one discovery run; frozen into an [`Inventory`]
#[derive(Default)]
struct Collector {
    seen: HashSet<String>,
    artifacts: Vec<Artifact>,
    missing: Vec<ExpectedArtifact>,
    warnings: Vec<DiscoveryWarning>,
    installations: Vec<String>,
}

impl Collector {
    fn warn(&mut self, location: impl ToString, reason: impl ToString) {
        let warning = DiscoveryWarning {
            location: location.to_string(),
            reason: reason.to_string(),
        };
        warn!("discovery: skipping {}: {}", warning.location, warning.reason);
        self.warnings.push(warning);
    }

    /// Record an artifact unless its canonical location was already seen
    fn push(&mut self, mut artifact: Artifact) {
        if let ArtifactLocation::File { path } = &artifact.location {
            let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
            artifact.location = ArtifactLocation::File { path: canonical };
        }
        if !self.seen.insert(artifact.location.dedup_key()) {
            return;
        }
        artifact.index = self.artifacts.len();
        debug!(
            "discovered {} {} [{}]",
            artifact.kind, artifact.location, artifact.priority
        );
        self.artifacts.push(artifact);
    }
}

/// The Discovery Engine
pub struct Discovery<'a> {
    patterns: &'a PatternConfig,
    roots: &'a DiscoveryRoots,
    registry: &'a dyn RegistryAccess,
    query_timeout: Duration,
}

impl<'a> Discovery<'a> {
    pub fn new(
        patterns: &'a PatternConfig,
        roots: &'a DiscoveryRoots,
        registry: &'a dyn RegistryAccess,
        query_timeout: Duration,
    ) -> Self {
        Self {
            patterns,
            roots,
            registry,
            query_timeout,
        }
    }

    /// Enumerate and classify every candidate artifact
    pub fn discover(&self, options: DiscoveryOptions) -> Inventory {
        let mut c = Collector::default();
        let comprehensive = options.scan_mode == ScanMode::Comprehensive;

        for base in &self.roots.config_bases {
            if !base.is_dir() {
                debug!("config base {} does not exist", base.display());
                continue;
            }
            for app in &self.patterns.app_dirs {
                let root = base.join(app);
                if !root.is_dir() {
                    continue;
                }
                let label = self.installation_label(&c, app, &root);
                c.installations.push(label.clone());
                let app_root = AppRoot {
                    root: &root,
                    label: &label,
                };
                self.scan_app_root(&mut c, &app_root, false);
                self.expect_configs(&mut c, &app_root);
            }
        }

        self.scan_extension_dirs(&mut c);

        if options.include_volatile_temp {
            self.scan_temp_dirs(&mut c);
        }

        if options.include_registry {
            self.scan_registry(&mut c);
        }

        if comprehensive {
            // Second pass over the same roots picks up the deeper subpaths
            for base in &self.roots.config_bases {
                for app in &self.patterns.app_dirs {
                    let root = base.join(app);
                    if !root.is_dir() {
                        continue;
                    }
                    let label = self.label_for_root(&c, app, &root);
                    self.scan_app_root(&mut c, &AppRoot { root: &root, label: &label }, true);
                }
            }
            self.scan_program_data(&mut c);
            self.scan_documents(&mut c);
        }

        info!(
            "discovery ({}): {} artifact(s), {} missing config(s), {} warning(s)",
            options.scan_mode,
            c.artifacts.len(),
            c.missing.len(),
            c.warnings.len()
        );

        Inventory {
            scan_mode: options.scan_mode,
            artifacts: c.artifacts,
            missing: c.missing,
            warnings: c.warnings,
            installations: c.installations,
        }
    }

    /// App dir name, or the full root when two bases hold the same app
    fn installation_label(&self, c: &Collector, app: &str, root: &Path) -> String {
        if c.installations.iter().any(|l| l == app) {
            root.display().to_string()
        } else {
            app.to_string()
        }
    }

    fn label_for_root(&self, c: &Collector, app: &str, root: &Path) -> String {
        let full = root.display().to_string();
        if c.installations.contains(&full) {
            full
        } else {
            app.to_string()
        }
    }

    fn scan_app_root(&self, c: &mut Collector, app: &AppRoot<'_>, comprehensive_pass: bool) {
        for sub in &self.patterns.known_subpaths {
            if sub.comprehensive_only != comprehensive_pass {
                continue;
            }
            let dir = if sub.path.is_empty() {
                app.root.to_path_buf()
            } else {
                app.root.join(&sub.path)
            };
            self.walk(c, &dir, sub.max_depth, sub.role.into(), Some(app));
        }
    }

    /// Config files that should exist in this installation but do not
    fn expect_configs(&self, c: &mut Collector, app: &AppRoot<'_>) {
        for spec in self.patterns.config_files.iter().filter(|s| s.create_if_missing) {
            let path = app.root.join(&spec.relative_dir).join(&spec.name);
            if path.exists() {
                continue;
            }
            debug!("expected config {} is missing", path.display());
            c.missing.push(ExpectedArtifact {
                path,
                format: spec.format,
                installation: app.label.to_string(),
                priority: if spec.critical {
                    PriorityTier::Critical
                } else {
                    PriorityTier::Important
                },
            });
        }
    }

    fn walk(
        &self,
        c: &mut Collector,
        dir: &Path,
        max_depth: usize,
        scope: Scope,
        app: Option<&AppRoot<'_>>,
    ) {
        if !dir.exists() {
            debug!("{} does not exist", dir.display());
            return;
        }
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let location = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| dir.display().to_string());
                    c.warn(location, &e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_excluded_name(&name) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    c.warn(entry.path().display(), &e);
                    continue;
                }
            };
            let size = metadata.len();
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            let label = app.map(|a| a.label).unwrap_or(UNSCOPED);

            let classified = match scope {
                Scope::Disposable => Some((
                    ArtifactKind::CacheFile,
                    tier_for(
                        ArtifactKind::CacheFile,
                        false,
                        self.patterns.is_sensitive_name(&name),
                    ),
                    StoreProbe::NotProbed,
                )),
                Scope::State => self.classify_state(c, entry.path(), &name, size, app),
                Scope::SniffOnly => self.classify_sniffed(c, entry.path(), &name, size),
            };

            if let Some((kind, priority, probe)) = classified {
                c.push(Artifact {
                    index: 0,
                    location: ArtifactLocation::file(entry.path()),
                    kind,
                    priority,
                    size,
                    last_modified: modified,
                    installation: label.to_string(),
                    is_dir: false,
                    probe,
                });
            }
        }
    }

    /// Databases and configs by name, everything else by content
    fn classify_state(
        &self,
        c: &mut Collector,
        path: &Path,
        name: &str,
        size: u64,
        app: Option<&AppRoot<'_>>,
    ) -> Option<(ArtifactKind, PriorityTier, StoreProbe)> {
        let relative = app.and_then(|a| path.strip_prefix(a.root).ok());
        let sensitive_name = self.patterns.is_sensitive_name(name);

        if self.patterns.is_database_name(name) {
            let critical = relative.is_some_and(|r| self.patterns.is_critical_suffix(r));
            let probe = self.probe_database(c, path);
            let tier = tier_for(ArtifactKind::Database, critical, sensitive_name);
            return Some((ArtifactKind::Database, tier, probe));
        }

        if let Some(spec) = self.patterns.config_spec(name) {
            // Critical only in its configured directory
            let in_place = relative
                .and_then(Path::parent)
                .is_some_and(|dir| dir == Path::new(&spec.relative_dir));
            let probe = probe_config(path, spec.format, self.patterns, spec.identifier.as_deref());
            let tier = tier_for(ArtifactKind::ConfigFile, spec.critical && in_place, sensitive_name);
            return Some((ArtifactKind::ConfigFile, tier, StoreProbe::Config(probe)));
        }

        self.classify_sniffed(c, path, name, size)
    }

    fn classify_sniffed(
        &self,
        c: &mut Collector,
        path: &Path,
        name: &str,
        size: u64,
    ) -> Option<(ArtifactKind, PriorityTier, StoreProbe)> {
        let sniffed = match sniff_file(path, size, &self.patterns.sniff) {
            Ok(s) => s,
            Err(e) => {
                c.warn(path.display(), &e);
                return None;
            }
        };
        let sensitive_name = self.patterns.is_sensitive_name(name);

        match sniffed {
            Sniffed::Nothing => None,
            Sniffed::Sqlite => {
                let probe = self.probe_database(c, path);
                // Unnamed databases are only interesting if they hold our table
                match &probe {
                    StoreProbe::Database(p) if p.table_present => Some((
                        ArtifactKind::Database,
                        tier_for(ArtifactKind::Database, false, sensitive_name),
                        probe,
                    )),
                    _ => None,
                }
            }
            Sniffed::JsonObject { sensitive } => {
                let probe = probe_config(path, ConfigFormat::Json, self.patterns, None);
                Some((
                    ArtifactKind::ConfigFile,
                    tier_for(ArtifactKind::ConfigFile, false, sensitive || sensitive_name),
                    StoreProbe::Config(probe),
                ))
            }
            Sniffed::Keyword { sensitive } => Some((
                ArtifactKind::CacheFile,
                tier_for(ArtifactKind::CacheFile, false, sensitive || sensitive_name),
                StoreProbe::NotProbed,
            )),
        }
    }

    fn probe_database(&self, c: &mut Collector, path: &Path) -> StoreProbe {
        let probed = SqliteStore::open_read_only(path, &self.patterns.database, self.query_timeout)
            .and_then(|store| store.probe(self.patterns));
        match probed {
            Ok(probe) => StoreProbe::Database(probe),
            Err(e) => {
                c.warn(path.display(), format!("database not readable: {}", e));
                StoreProbe::Unreadable {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Matching extension directories are inventoried, never mutated
    fn scan_extension_dirs(&self, c: &mut Collector) {
        let Some(home) = &self.roots.home else {
            return;
        };
        if self.patterns.extension_patterns.is_empty() {
            return;
        }
        for rel in &self.patterns.extension_dirs {
            let dir = home.join(rel);
            for (path, name) in self.list_dir(c, &dir) {
                if self.patterns.is_tracked_extension(&name) && path.is_dir() {
                    c.push(dir_artifact(path, ArtifactKind::ExtensionDir, UNSCOPED));
                }
            }
        }
    }

    /// Top-level entries of temp dirs whose names carry a temp marker
    fn scan_temp_dirs(&self, c: &mut Collector) {
        for dir in &self.roots.temp_dirs {
            for (path, name) in self.list_dir(c, dir) {
                let lower = name.to_lowercase();
                if is_excluded_name(&name)
                    || !self.patterns.temp_markers.iter().any(|m| lower.contains(m.as_str()))
                {
                    continue;
                }
                c.push(dir_artifact(path, ArtifactKind::TempFile, UNSCOPED));
            }
        }
    }

    fn scan_registry(&self, c: &mut Collector) {
        if self.patterns.registry_entries.is_empty() {
            return;
        }
        if !self.registry.is_available() {
            c.warn("registry", "registry is not available on this platform");
            return;
        }
        for spec in &self.patterns.registry_entries {
            match self.registry.read_value(&spec.key, &spec.value) {
                Ok(Some(_)) => c.push(Artifact {
                    index: 0,
                    location: ArtifactLocation::Registry {
                        key: spec.key.clone(),
                        value: spec.value.clone(),
                    },
                    kind: ArtifactKind::RegistryEntry,
                    priority: tier_for(ArtifactKind::RegistryEntry, false, false),
                    size: 0,
                    last_modified: None,
                    installation: spec.app.clone(),
                    is_dir: false,
                    probe: StoreProbe::Registry {
                        identifier: spec.identifier.clone(),
                    },
                }),
                Ok(None) => debug!("registry value {}\\{} not present", spec.key, spec.value),
                Err(e) => c.warn(format!("{}\\{}", spec.key, spec.value), e),
            }
        }
    }

    fn scan_program_data(&self, c: &mut Collector) {
        for base in &self.roots.program_data {
            for app in &self.patterns.app_dirs {
                let root = base.join(app);
                if !root.is_dir() {
                    continue;
                }
                let label = root.display().to_string();
                let app_root = AppRoot {
                    root: &root,
                    label: &label,
                };
                self.walk(c, &root, PROGRAM_DATA_DEPTH, Scope::State, Some(&app_root));
            }
        }
    }

    fn scan_documents(&self, c: &mut Collector) {
        let Some(home) = &self.roots.home else {
            return;
        };
        for rel in &self.patterns.document_dirs {
            self.walk(c, &home.join(rel), DOCUMENT_DEPTH, Scope::SniffOnly, None);
        }
    }

    /// Entries of one directory; a missing directory is silently empty
    fn list_dir(&self, c: &mut Collector, dir: &Path) -> Vec<(PathBuf, String)> {
        match fs::read_dir(dir) {
            Ok(entries) => {
                let mut out: Vec<(PathBuf, String)> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| (e.path(), e.file_name().to_string_lossy().into_owned()))
                    .collect();
                out.sort();
                out
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                c.warn(dir.display(), e);
                Vec::new()
            }
        }
    }
}

/// File or directory artifact that is never probed
fn dir_artifact(path: PathBuf, kind: ArtifactKind, installation: &str) -> Artifact {
    let metadata = fs::symlink_metadata(&path).ok();
    let is_dir = metadata.as_ref().is_some_and(|m| m.is_dir());
    Artifact {
        index: 0,
        size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
        last_modified: metadata
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from),
        location: ArtifactLocation::file(path),
        kind,
        priority: tier_for(kind, false, false),
        installation: installation.to_string(),
        is_dir,
        probe: StoreProbe::NotProbed,
    }
}
