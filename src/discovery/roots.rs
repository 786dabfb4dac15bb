//! Root location groups
//!
//! Discovery never looks outside these roots. They come from the environment
//! by default and can be given explicitly (tests, `RunConfig.roots`).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Root locations walked by discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryRoots {
    /// Per-user application config bases (`%APPDATA%`, `~/.config`,
    /// `~/Library/Application Support`); application dirs live below these
    #[serde(default)]
    pub config_bases: Vec<PathBuf>,
    /// User profile; extension and document trees are relative to it
    #[serde(default)]
    pub home: Option<PathBuf>,
    #[serde(default)]
    pub temp_dirs: Vec<PathBuf>,
    /// Machine-wide program data (comprehensive scans only)
    #[serde(default)]
    pub program_data: Vec<PathBuf>,
}

impl DiscoveryRoots {
    /// Roots for the current user and platform
    pub fn from_env() -> Self {
        let home = env_path("HOME").or_else(|| env_path("USERPROFILE"));

        let mut config_bases = Vec::new();
        if let Some(appdata) = env_path("APPDATA") {
            config_bases.push(appdata);
        }
        if let Some(xdg) = env_path("XDG_CONFIG_HOME") {
            config_bases.push(xdg);
        } else if let Some(home) = &home {
            if cfg!(target_os = "macos") {
                config_bases.push(home.join("Library").join("Application Support"));
            } else if cfg!(unix) {
                config_bases.push(home.join(".config"));
            }
        }

        let program_data = env_path("PROGRAMDATA").into_iter().collect();

        let mut roots = Self {
            config_bases,
            home,
            temp_dirs: vec![env::temp_dir()],
            program_data,
        };
        roots.dedup();
        roots
    }

    /// Explicit roots with a single config base; used by tests and sandboxes
    pub fn single(config_base: impl Into<PathBuf>) -> Self {
        Self {
            config_bases: vec![config_base.into()],
            ..Default::default()
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dirs.push(dir.into());
        self
    }

    pub fn with_program_data(mut self, dir: impl Into<PathBuf>) -> Self {
        self.program_data.push(dir.into());
        self
    }

    /// Every directory a prune pass should search for sibling backups
    pub fn backup_search_roots(&self, app_dirs: &[String]) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .config_bases
            .iter()
            .chain(self.program_data.iter())
            .flat_map(|base| app_dirs.iter().map(move |app| base.join(app)))
            .collect();
        out.extend(self.temp_dirs.iter().cloned());
        out
    }

    fn dedup(&mut self) {
        dedup_paths(&mut self.config_bases);
        dedup_paths(&mut self.temp_dirs);
        dedup_paths(&mut self.program_data);
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn dedup_paths(paths: &mut Vec<PathBuf>) {
    let mut seen: Vec<PathBuf> = Vec::with_capacity(paths.len());
    paths.retain(|p| {
        if seen.iter().any(|s| same_path(s, p)) {
            false
        } else {
            seen.push(p.clone());
            true
        }
    });
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
