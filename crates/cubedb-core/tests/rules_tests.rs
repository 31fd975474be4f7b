//! Rule scopes, triggers, the cell cursor, commands and write-time rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cubedb_core::{
    CellValue, Database, EngineError, Marker, Rule, RuleResult, RuleScope,
};

fn model_db() -> Database {
    let mut db = Database::new("model").unwrap();

    db.add_dimension("datatypes").unwrap();
    {
        let mut edit = db.edit_dimension("datatypes").unwrap();
        edit.add_member("Actual", None, 1.0).unwrap();
        edit.add_member("Plan", None, 1.0).unwrap();
        db.commit_dimension(edit).unwrap();
    }

    db.add_dimension("regions").unwrap();
    {
        let mut edit = db.edit_dimension("regions").unwrap();
        edit.add_member("Total", None, 1.0).unwrap();
        for r in ["North", "South", "West"] {
            edit.add_member(r, Some("Total"), 1.0).unwrap();
        }
        edit.define_subset("coastal", &["North", "West"]).unwrap();
        db.commit_dimension(edit).unwrap();
    }

    db.add_cube("sales", &["datatypes", "regions"]).unwrap();
    db
}

// ============================================================================
// Scope eligibility
// ============================================================================

#[test]
fn test_base_level_rule_replaces_stored_leaves_in_aggregation() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "North"], 10.0).unwrap();
    cube.set(&["Actual", "South"], 20.0).unwrap();

    cube.register_rule(Rule::new(
        "north override",
        &["regions:North"],
        RuleScope::BaseLevel,
        |_| Ok(RuleResult::Value(1000.0)),
    ))
    .unwrap();

    // Direct base read and the per-leaf replacement during roll-up.
    assert_eq!(cube.get_numeric(&["Actual", "North"]).unwrap(), 1000.0);
    assert_eq!(cube.get_numeric(&["Actual", "Total"]).unwrap(), 1020.0);
    // Only *stored* leaves are visited: West has no fact, its rule match
    // never runs.
    assert_eq!(cube.get_numeric(&["Plan", "Total"]).unwrap(), 0.0);
}

#[test]
fn test_aggregation_level_rule_preempts_the_walk() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "North"], 10.0).unwrap();

    cube.register_rule(Rule::new(
        "fixed total",
        &["regions:Total"],
        RuleScope::AggregationLevel,
        |_| Ok(RuleResult::Value(-1.0)),
    ))
    .unwrap();

    assert_eq!(cube.get_numeric(&["Actual", "Total"]).unwrap(), -1.0);
    // Not eligible on a base cell.
    assert_eq!(cube.get_numeric(&["Actual", "North"]).unwrap(), 10.0);
}

#[test]
fn test_aggregation_rule_continue_falls_through_to_sum() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "North"], 10.0).unwrap();
    cube.set(&["Actual", "South"], 5.0).unwrap();

    cube.register_rule(Rule::new(
        "transparent",
        &["regions:Total"],
        RuleScope::AggregationLevel,
        |_| Ok(RuleResult::Continue),
    ))
    .unwrap();

    assert_eq!(cube.get_numeric(&["Actual", "Total"]).unwrap(), 15.0);
}

#[test]
fn test_first_registered_match_wins() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();

    cube.register_rule(Rule::new(
        "first",
        &["regions:North"],
        RuleScope::AllLevels,
        |_| Ok(RuleResult::Value(1.0)),
    ))
    .unwrap();
    cube.register_rule(Rule::new(
        "second",
        &["regions:North"],
        RuleScope::AllLevels,
        |_| Ok(RuleResult::Value(2.0)),
    ))
    .unwrap();

    assert_eq!(cube.get_numeric(&["Actual", "North"]).unwrap(), 1.0);
}

#[test]
fn test_continue_passes_to_next_matching_rule() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "North"], 7.0).unwrap();

    cube.register_rule(Rule::new(
        "selective",
        &["regions:North"],
        RuleScope::AllLevels,
        |c| {
            if c.member("datatypes")? == "Plan" {
                Ok(RuleResult::Value(99.0))
            } else {
                Ok(RuleResult::Continue)
            }
        },
    ))
    .unwrap();

    assert_eq!(cube.get_numeric(&["Plan", "North"]).unwrap(), 99.0);
    // CONTINUE falls through to the stored fact.
    assert_eq!(cube.get_numeric(&["Actual", "North"]).unwrap(), 7.0);
}

// ============================================================================
// Triggers
// ============================================================================

#[test]
fn test_multi_selector_trigger_is_a_conjunction() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "North"], 3.0).unwrap();
    cube.set(&["Plan", "North"], 4.0).unwrap();

    cube.register_rule(Rule::new(
        "plan north only",
        &["datatypes:Plan", "regions:North"],
        RuleScope::AllLevels,
        |_| Ok(RuleResult::Value(42.0)),
    ))
    .unwrap();

    assert_eq!(cube.get_numeric(&["Plan", "North"]).unwrap(), 42.0);
    assert_eq!(cube.get_numeric(&["Actual", "North"]).unwrap(), 3.0);
    assert_eq!(cube.get_numeric(&["Plan", "South"]).unwrap(), 0.0);
}

#[test]
fn test_subset_trigger_matches_its_members() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();

    cube.register_rule(Rule::new(
        "coastal markup",
        &["regions:coastal"],
        RuleScope::AllLevels,
        |_| Ok(RuleResult::Value(8.0)),
    ))
    .unwrap();

    assert_eq!(cube.get_numeric(&["Actual", "North"]).unwrap(), 8.0);
    assert_eq!(cube.get_numeric(&["Actual", "West"]).unwrap(), 8.0);
    assert_eq!(cube.get_numeric(&["Actual", "South"]).unwrap(), 0.0);
}

#[test]
fn test_unknown_trigger_member_fails_registration() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    let err = cube
        .register_rule(Rule::new(
            "bad",
            &["regions:Atlantis"],
            RuleScope::AllLevels,
            |_| Ok(RuleResult::Continue),
        ))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownMember { .. }));
}

// ============================================================================
// Cursor behaviour
// ============================================================================

#[test]
fn test_cursor_shift_and_arithmetic() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "North"], 150.0).unwrap();
    cube.set(&["Plan", "North"], 100.0).unwrap();

    cube.register_rule(Rule::new(
        "growth",
        &["datatypes:Plan", "regions:South"],
        RuleScope::AllLevels,
        |c| {
            let actual = c.at("Actual")?.at("North")?;
            let plan = c.at("Plan")?.at("North")?;
            Ok(RuleResult::Value(&actual - &plan))
        },
    ))
    .unwrap();

    assert_eq!(cube.get_numeric(&["Plan", "South"]).unwrap(), 50.0);
}

#[test]
fn test_cursor_address_and_member() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();

    cube.register_rule(Rule::new(
        "introspect",
        &["regions:North"],
        RuleScope::AllLevels,
        |c| {
            assert_eq!(c.cube_name(), "sales");
            assert_eq!(c.member("regions")?, "North");
            assert_eq!(c.address(), vec!["Actual".to_string(), "North".to_string()]);
            Ok(RuleResult::NoValue)
        },
    ))
    .unwrap();

    assert_eq!(cube.get(&["Actual", "North"]).unwrap(), CellValue::NoValue);
}

#[test]
fn test_rule_error_via_question_mark() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();

    cube.register_rule(Rule::new(
        "bad shift",
        &["regions:North"],
        RuleScope::AllLevels,
        |c| {
            let nowhere = c.at("Atlantis")?; // UnknownMember surfaces as #ERR
            Ok(RuleResult::Value(nowhere.numeric()))
        },
    ))
    .unwrap();

    assert_eq!(
        cube.get(&["Actual", "North"]).unwrap(),
        CellValue::Marker(Marker::Error)
    );
}

// ============================================================================
// Write-time rules
// ============================================================================

#[test]
fn test_on_entry_rule_rewrites_the_incoming_value() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();

    cube.register_rule(Rule::new(
        "round up",
        &["datatypes:Plan"],
        RuleScope::OnEntry,
        |c| Ok(RuleResult::Value(c.numeric().ceil())),
    ))
    .unwrap();

    cube.set(&["Plan", "North"], 10.4).unwrap();
    assert_eq!(cube.get_numeric(&["Plan", "North"]).unwrap(), 11.0);
}

#[test]
fn test_on_entry_rule_rejects_the_write() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Plan", "North"], 5.0).unwrap();

    cube.register_rule(Rule::new(
        "no negatives",
        &["datatypes:Plan"],
        RuleScope::OnEntry,
        |c| {
            if c.numeric() < 0.0 {
                Ok(RuleResult::Error("negative plan values are not allowed".into()))
            } else {
                Ok(RuleResult::Continue)
            }
        },
    ))
    .unwrap();

    let err = cube.set(&["Plan", "North"], -1.0).unwrap_err();
    assert!(matches!(err, EngineError::Rule { .. }));
    // The previous value is restored.
    assert_eq!(cube.get_numeric(&["Plan", "North"]).unwrap(), 5.0);

    cube.set(&["Plan", "North"], 7.0).unwrap();
    assert_eq!(cube.get_numeric(&["Plan", "North"]).unwrap(), 7.0);
}

#[test]
fn test_on_entry_rule_not_part_of_read_evaluation() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();

    let calls = Arc::new(AtomicU64::new(0));
    let in_rule = calls.clone();
    cube.register_rule(Rule::new(
        "write counter",
        &["datatypes:Plan"],
        RuleScope::OnEntry,
        move |_| {
            in_rule.fetch_add(1, Ordering::SeqCst);
            Ok(RuleResult::Continue)
        },
    ))
    .unwrap();

    cube.set(&["Plan", "North"], 1.0).unwrap();
    cube.get(&["Plan", "North"]).unwrap();
    cube.get(&["Plan", "Total"]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_command_rule_runs_only_on_demand() {
    let db = model_db();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "North"], 4.0).unwrap();

    cube.register_rule(
        Rule::new("doubler", &["regions:North"], RuleScope::Command, |c| {
            Ok(RuleResult::Value(c.at("Actual")?.numeric() * 2.0))
        })
        .keywords(&["double"]),
    )
    .unwrap();

    // Reads are unaffected by command rules.
    assert_eq!(cube.get_numeric(&["Actual", "North"]).unwrap(), 4.0);

    let result = cube.command("double", &["Actual", "North"]).unwrap();
    assert_eq!(result, CellValue::Value(8.0));

    // Unknown keyword.
    assert!(cube.command("triple", &["Actual", "North"]).is_err());
    // Keyword known, trigger not matching.
    assert!(cube.command("double", &["Actual", "South"]).is_err());
}
