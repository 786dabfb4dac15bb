//! Name and content classification

use crate::backup::BACKUP_MARKER;
use crate::patterns::SniffRules;
use crate::stores::config::TEMP_SUFFIX;
use crate::types::{ArtifactKind, PriorityTier};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// First 16 bytes of every SQLite database file
pub const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

const SQLITE_SIDECARS: &[&str] = &["-wal", "-journal", "-shm"];

/// What content sniffing found in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Sqlite,
    /// Parses as a JSON object and carries a keyword
    JsonObject { sensitive: bool },
    /// Carries a keyword but is not a JSON object
    Keyword { sensitive: bool },
    Nothing,
}

pub fn sniff_bytes(bytes: &[u8], rules: &SniffRules) -> Sniffed {
    if bytes.starts_with(SQLITE_HEADER) {
        return Sniffed::Sqlite;
    }
    let text = String::from_utf8_lossy(bytes);
    let identifying = rules.keywords.iter().any(|k| text.contains(k.as_str()));
    let sensitive = rules
        .sensitive_keywords
        .iter()
        .any(|k| text.contains(k.as_str()));
    if !identifying && !sensitive {
        return Sniffed::Nothing;
    }
    let is_object = matches!(
        serde_json::from_str::<serde_json::Value>(&text),
        Ok(serde_json::Value::Object(_))
    );
    if is_object && identifying {
        Sniffed::JsonObject { sensitive }
    } else {
        Sniffed::Keyword { sensitive }
    }
}

/// Sniff a file below the size threshold. Larger files are never read.
pub fn sniff_file(path: &Path, size: u64, rules: &SniffRules) -> io::Result<Sniffed> {
    if size >= rules.max_bytes {
        return Ok(Sniffed::Nothing);
    }
    let mut bytes = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    File::open(path)?.take(rules.max_bytes).read_to_end(&mut bytes)?;
    Ok(sniff_bytes(&bytes, rules))
}

/// Files discovery must never report: our own backups and temp files, and
/// SQLite sidecars (they travel with their database)
pub fn is_excluded_name(name: &str) -> bool {
    name.contains(BACKUP_MARKER)
        || name.ends_with(TEMP_SUFFIX)
        || name.ends_with(".idreset-restore")
        || SQLITE_SIDECARS.iter().any(|s| name.ends_with(s))
}

/// Priority tier from kind and markers. Sensitive never overrides Critical.
pub fn tier_for(kind: ArtifactKind, critical: bool, sensitive: bool) -> PriorityTier {
    if critical {
        PriorityTier::Critical
    } else if sensitive {
        PriorityTier::Sensitive
    } else if kind.holds_identifiers() {
        PriorityTier::Important
    } else {
        PriorityTier::Optional
    }
}
