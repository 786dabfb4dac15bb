//! Identifier generation
//!
//! An [`IdentifierSet`] holds exactly one freshly generated value per
//! identifier name for a whole pipeline run. Every operation that writes an
//! identifier reads it from here, which is what makes the verifier's
//! consistency check meaningful.

use crate::patterns::IdentifierDef;
use crate::types::IdFormat;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate a value in the given format
pub fn generate(format: IdFormat) -> String {
    match format {
        IdFormat::Uuid => Uuid::new_v4().to_string(),
        IdFormat::Hex64 => random_hex64(),
        IdFormat::Timestamp => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// 32 bytes hashed from two v4 UUIDs, so no nibble has a fixed value
fn random_hex64() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

/// Check that a value has the shape `format` produces
pub fn is_valid(format: IdFormat, value: &str) -> bool {
    match format {
        IdFormat::Uuid => value.len() == 36 && Uuid::parse_str(value).is_ok(),
        IdFormat::Hex64 => {
            value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
        }
        IdFormat::Timestamp => chrono::DateTime::parse_from_rfc3339(value).is_ok(),
    }
}

/// One generated value per identifier name, immutable after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierSet {
    values: BTreeMap<String, String>,
}

impl IdentifierSet {
    /// Generate one value for every definition
    pub fn generate(defs: &[IdentifierDef]) -> Self {
        let values = defs
            .iter()
            .map(|d| (d.name.clone(), generate(d.format)))
            .collect();
        Self { values }
    }

    /// Build from known values
    pub fn from_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternConfig;
    use std::collections::HashSet;

    #[test]
    fn test_generated_values_match_their_format() {
        for format in [IdFormat::Uuid, IdFormat::Hex64, IdFormat::Timestamp] {
            let value = generate(format);
            assert!(is_valid(format, &value), "{} produced {}", format, value);
        }
    }

    #[test]
    fn test_hex64_is_lowercase_64_chars() {
        let value = generate(IdFormat::Hex64);
        assert_eq!(value.len(), 64);
        assert_eq!(value, value.to_lowercase());
    }

    #[test]
    fn test_hex64_has_no_fixed_nibbles() {
        let samples: Vec<String> = (0..64).map(|_| generate(IdFormat::Hex64)).collect();
        // Version and variant nibbles of the two UUIDs a naive concatenation would expose
        for position in [12, 16, 44, 48] {
            let nibbles: HashSet<char> = samples
                .iter()
                .filter_map(|s| s.chars().nth(position))
                .collect();
            assert!(nibbles.len() > 4, "position {} only shows {:?}", position, nibbles);
        }
    }

    #[test]
    fn test_set_has_one_value_per_name() {
        let patterns = PatternConfig::builtin().unwrap();
        let set = IdentifierSet::generate(&patterns.identifiers);
        assert_eq!(set.len(), patterns.identifiers.len());
        for def in &patterns.identifiers {
            let value = set.get(&def.name).expect("every identifier has a value");
            assert!(is_valid(def.format, value));
        }
    }

    #[test]
    fn test_two_sets_differ() {
        let patterns = PatternConfig::builtin().unwrap();
        let a = IdentifierSet::generate(&patterns.identifiers);
        let b = IdentifierSet::generate(&patterns.identifiers);
        assert_ne!(a.get("machineId"), b.get("machineId"));
    }

    #[test]
    fn test_validation_rejects_wrong_shapes() {
        assert!(!is_valid(IdFormat::Uuid, "not-a-uuid"));
        assert!(!is_valid(IdFormat::Hex64, "abc"));
        assert!(!is_valid(IdFormat::Hex64, &"g".repeat(64)));
        assert!(!is_valid(IdFormat::Timestamp, "yesterday"));
    }
}
