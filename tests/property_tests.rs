//! Property-Based Tests for idreset
//!
//! These tests verify:
//! - Enum string round-trips (parse → to_string → parse)
//! - Query safety: injected separators, comments and DDL never validate
//! - Operation ordering and batching invariants
//! - Generated identifier formats

use proptest::prelude::*;
use std::collections::HashSet;
use strum::IntoEnumIterator;

// =============================================================================
// Enum Property Tests
// =============================================================================

use idreset::types::{
    ActionType, ArtifactKind, ConfigFormat, ExecutionStatus, FailurePolicy, IdFormat, Mode,
    PriorityTier, RiskLevel, ScanMode,
};

fn pick<T: IntoEnumIterator + Clone + std::fmt::Debug + 'static>() -> impl Strategy<Value = T> {
    let all: Vec<T> = T::iter().collect();
    proptest::sample::select(all)
}

proptest! {
    /// Mode: to_string → parse round-trip is identity
    #[test]
    fn mode_roundtrip(mode in pick::<Mode>()) {
        let parsed: Mode = mode.to_string().parse().expect("Should parse");
        prop_assert_eq!(mode, parsed);
    }

    /// Tiers and kinds round-trip and render lowercase
    #[test]
    fn tier_and_kind_roundtrip(tier in pick::<PriorityTier>(), kind in pick::<ArtifactKind>()) {
        let s = tier.to_string();
        prop_assert_eq!(&s, &s.to_lowercase());
        prop_assert_eq!(tier, s.parse::<PriorityTier>().expect("Should parse"));
        prop_assert_eq!(kind, kind.to_string().parse::<ArtifactKind>().expect("Should parse"));
    }

    /// Every remaining closed value survives Display → FromStr
    #[test]
    fn closed_values_roundtrip(
        scan in pick::<ScanMode>(),
        risk in pick::<RiskLevel>(),
        policy in pick::<FailurePolicy>(),
        format in pick::<IdFormat>(),
        config in pick::<ConfigFormat>(),
        action in pick::<ActionType>(),
        status in pick::<ExecutionStatus>(),
    ) {
        prop_assert_eq!(scan, scan.to_string().parse::<ScanMode>().unwrap());
        prop_assert_eq!(risk, risk.to_string().parse::<RiskLevel>().unwrap());
        prop_assert_eq!(policy, policy.to_string().parse::<FailurePolicy>().unwrap());
        prop_assert_eq!(format, format.to_string().parse::<IdFormat>().unwrap());
        prop_assert_eq!(config, config.to_string().parse::<ConfigFormat>().unwrap());
        prop_assert_eq!(action, action.to_string().parse::<ActionType>().unwrap());
        prop_assert_eq!(status, status.to_string().parse::<ExecutionStatus>().unwrap());
    }

    /// serde and strum agree on the wire name of modes
    #[test]
    fn mode_serde_matches_display(mode in pick::<Mode>()) {
        let json = serde_json::to_string(&mode).unwrap();
        prop_assert_eq!(json, format!("\"{}\"", mode));
    }
}

#[test]
fn risk_levels_are_ordered() {
    let levels: Vec<RiskLevel> = RiskLevel::iter().collect();
    let mut sorted = levels.clone();
    sorted.sort();
    assert_eq!(levels, sorted);
    assert!(RiskLevel::Critical > RiskLevel::Medium);
}

// =============================================================================
// Query Safety Property Tests
// =============================================================================

use idreset::sql::{validate_identifier, validate_like_pattern, validate_statement};

const BASE_DELETE: &str = "DELETE FROM \"ItemTable\" WHERE \"key\" LIKE ?1";

fn separator_or_comment() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(";"), Just("--"), Just("/*"), Just("*/")]
}

fn ddl_keyword() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("DROP"),
        Just("drop"),
        Just("CREATE"),
        Just("Alter"),
        Just("ATTACH"),
        Just("DETACH"),
        Just("VACUUM"),
        Just("TRIGGER"),
    ]
}

proptest! {
    /// A separator or comment marker anywhere in the text is rejected
    #[test]
    fn injected_separator_is_rejected(
        marker in separator_or_comment(),
        tail in "[ a-zA-Z0-9_'=*]{0,30}",
        at in 0usize..BASE_DELETE.len(),
    ) {
        let mut sql = BASE_DELETE.to_string();
        // Insert on a char boundary; the base statement is ASCII
        sql.insert_str(at, &format!("{}{}", marker, tail));
        prop_assert!(validate_statement(&sql).is_err(), "accepted: {}", sql);
    }

    /// DDL keywords as standalone words are rejected after any allowed verb
    #[test]
    fn ddl_keyword_is_rejected(
        keyword in ddl_keyword(),
        verb in prop_oneof![Just("SELECT"), Just("DELETE"), Just("UPDATE"), Just("INSERT")],
        name in "[a-z]{1,10}",
    ) {
        let sql = format!("{} x FROM t WHERE k = 1 {} TABLE {}", verb, keyword, name);
        prop_assert!(validate_statement(&sql).is_err(), "accepted: {}", sql);
    }

    /// Two data-modifying verbs never validate together
    #[test]
    fn stacked_modifications_are_rejected(
        first in prop_oneof![Just("DELETE"), Just("UPDATE"), Just("INSERT")],
        second in prop_oneof![Just("DELETE"), Just("UPDATE"), Just("INSERT")],
    ) {
        let sql = format!("{} FROM t WHERE k IN ({} FROM t)", first, second);
        prop_assert!(validate_statement(&sql).is_err());
    }

    /// Table and column names are plain identifiers only
    #[test]
    fn quoted_or_spaced_identifiers_are_rejected(
        head in "[A-Za-z]{1,8}",
        bad in prop_oneof![Just("\""), Just(" "), Just("'"), Just(";"), Just("-"), Just("(")],
        tail in "[A-Za-z0-9]{0,8}",
    ) {
        let name = format!("{}{}{}", head, bad, tail);
        prop_assert!(validate_identifier(&name).is_err(), "accepted: {}", name);
    }

    /// Over-broad row patterns are rejected
    #[test]
    fn broad_patterns_are_rejected(pattern in "[%_]{1,6}[a-z]{0,2}") {
        prop_assert!(validate_like_pattern(&pattern).is_err(), "accepted: {}", pattern);
    }

    /// Plain prefix patterns are accepted
    #[test]
    fn prefix_patterns_are_accepted(prefix in "[a-z]{3,12}\\.") {
        let pattern = format!("{}%", prefix);
        prop_assert!(validate_like_pattern(&pattern).is_ok());
    }
}

#[test]
fn templates_always_validate() {
    use idreset::sql::StatementTemplate;
    let patterns = idreset::PatternConfig::builtin().unwrap();
    for template in [
        StatementTemplate::TableExists,
        StatementTemplate::IntegrityCheck,
        StatementTemplate::CountLike,
        StatementTemplate::KeysLike,
        StatementTemplate::DeleteLike,
        StatementTemplate::SelectValue,
        StatementTemplate::Upsert,
    ] {
        let rendered = template.render(&patterns.database).unwrap();
        assert!(validate_statement(rendered.sql()).is_ok(), "{}", rendered);
    }
}

// =============================================================================
// Operation Ordering Property Tests
// =============================================================================

use idreset::artifact::ArtifactLocation;
use idreset::engine::executor::batches;
use idreset::engine::{BackupPlan, Disposition, Mutation, Operation, RollbackPlan};

fn operation(index: usize, tier: PriorityTier, kind: ArtifactKind, target: usize) -> Operation {
    Operation {
        id: format!("op-{:04}", index + 1),
        targets: vec![ArtifactLocation::file(format!("/data/Code/store-{}", target))],
        kind,
        installation: "Code".into(),
        action: ActionType::DeleteFile,
        priority: tier,
        risk_tier: tier,
        mutation: Mutation::None,
        backup: BackupPlan::None,
        rollback: RollbackPlan::Nothing,
        disposition: Disposition::Execute,
        estimated_duration_ms: 5,
        order_index: index,
    }
}

fn operations() -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec((pick::<PriorityTier>(), pick::<ArtifactKind>(), 0usize..6), 0..24)
        .prop_map(|specs| {
            let mut ops: Vec<Operation> = specs
                .into_iter()
                .enumerate()
                .map(|(i, (tier, kind, target))| operation(i, tier, kind, target))
                .collect();
            ops.sort_by_key(Operation::sort_key);
            ops
        })
}

proptest! {
    /// Sorted operations never put a lower tier before a higher one
    #[test]
    fn tiers_are_processed_in_order(ops in operations()) {
        for pair in ops.windows(2) {
            prop_assert!(pair[0].priority.order() <= pair[1].priority.order());
            if pair[0].priority == pair[1].priority {
                prop_assert!(pair[0].kind.order() <= pair[1].kind.order());
            }
        }
    }

    /// Batches partition the plan in order and respect every grouping rule
    #[test]
    fn batches_partition_and_isolate(ops in operations(), max_parallel in 1usize..6) {
        let ranges = batches(&ops, max_parallel);

        let mut next = 0;
        for range in &ranges {
            prop_assert_eq!(range.start, next);
            prop_assert!(range.end > range.start);
            prop_assert!(range.len() <= max_parallel.max(1));
            next = range.end;

            let batch = &ops[range.clone()];
            if batch.len() > 1 {
                let tier = batch[0].priority;
                let mut targets = HashSet::new();
                for op in batch {
                    prop_assert_ne!(op.risk_tier, PriorityTier::Critical);
                    prop_assert_eq!(op.priority, tier);
                    prop_assert!(targets.insert(op.target_key()), "duplicate target in batch");
                }
            }
        }
        prop_assert_eq!(next, ops.len());
    }

    /// Without parallelism every operation runs alone
    #[test]
    fn sequential_mode_has_singleton_batches(ops in operations()) {
        let ranges = batches(&ops, 1);
        prop_assert_eq!(ranges.len(), ops.len());
    }
}

// =============================================================================
// Identifier Property Tests
// =============================================================================

use idreset::identifiers::{IdentifierSet, generate, is_valid};

proptest! {
    /// Generated values always satisfy their own format
    #[test]
    fn generated_values_are_valid(format in pick::<IdFormat>()) {
        let value = generate(format);
        prop_assert!(is_valid(format, &value), "{} is not a valid {}", value, format);
    }

    /// Arbitrary short strings are not mistaken for 64-hex machine ids
    #[test]
    fn short_strings_are_not_hex64(value in "[0-9a-f]{0,63}") {
        prop_assert!(!is_valid(IdFormat::Hex64, &value));
    }
}

#[test]
fn identifier_set_covers_every_definition() {
    let patterns = idreset::PatternConfig::builtin().unwrap();
    let set = IdentifierSet::generate(&patterns.identifiers);
    assert_eq!(set.len(), patterns.identifiers.len());
    for def in &patterns.identifiers {
        let value = set.get(&def.name).unwrap();
        assert!(is_valid(def.format, value), "{}={}", def.name, value);
    }
}
