//! Storage adapters
//!
//! Thin, typed access to the two file-backed store formats. Discovery opens
//! them read-only to probe; execution opens them read-write to mutate; the
//! verifier opens them read-only again to check the result.

pub mod config;
pub mod sqlite;

pub use config::{create_json_config, probe_config, read_json_object, rewrite_json_fields};
pub use sqlite::{IntegrityReport, SqliteStore};
