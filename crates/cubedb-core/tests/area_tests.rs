//! Bulk area operations: enumeration, mass writes, copies, aggregates.

use cubedb_core::{
    AttributeType, AttributeValue, Database, EngineConfig, EngineError,
};

fn planning_db(config: EngineConfig) -> Database {
    let mut db = Database::with_config("planning", config).unwrap();

    db.add_dimension("datatypes").unwrap();
    {
        let mut edit = db.edit_dimension("datatypes").unwrap();
        edit.add_member("Actual", None, 1.0).unwrap();
        edit.add_member("Plan", None, 1.0).unwrap();
        db.commit_dimension(edit).unwrap();
    }

    db.add_dimension("years").unwrap();
    {
        let mut edit = db.edit_dimension("years").unwrap();
        for y in ["2022", "2023"] {
            edit.add_member(y, None, 1.0).unwrap();
        }
        db.commit_dimension(edit).unwrap();
    }

    db.add_dimension("products").unwrap();
    {
        let mut edit = db.edit_dimension("products").unwrap();
        edit.add_member("Total", None, 1.0).unwrap();
        for p in ["Model S", "Model 3", "Model X", "Model Y"] {
            edit.add_member(p, Some("Total"), 1.0).unwrap();
        }
        edit.add_attribute("segment", AttributeType::Text).unwrap();
        edit.set_attribute("Model S", "segment", AttributeValue::Text("premium".into()))
            .unwrap();
        edit.set_attribute("Model X", "segment", AttributeValue::Text("premium".into()))
            .unwrap();
        edit.define_subset("suvs", &["Model X", "Model Y"]).unwrap();
        db.commit_dimension(edit).unwrap();
    }

    db.add_cube("sales", &["datatypes", "years", "products"]).unwrap();
    db
}

fn seeded() -> Database {
    let db = planning_db(EngineConfig::default());
    let cube = db.cube("sales").unwrap();
    cube.set(&["Actual", "2022", "Model S"], 100.0).unwrap();
    cube.set(&["Actual", "2022", "Model 3"], 200.0).unwrap();
    cube.set(&["Actual", "2022", "Model Y"], 50.0).unwrap();
    cube.set(&["Plan", "2022", "Model S"], 90.0).unwrap();
    db
}

// ============================================================================
// Enumeration & aggregates over existing facts
// ============================================================================

#[test]
fn test_items_enumerates_only_stored_facts_in_area() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube.area(&["Actual", "2022"]).unwrap();

    let items = area.items();
    assert_eq!(items.len(), 3);
    assert!(items
        .iter()
        .all(|(addr, _)| addr[0] == "Actual" && addr[1] == "2022"));

    assert_eq!(area.count(), 3);
    assert_eq!(area.sum(), 350.0);
    assert_eq!(area.min(), Some(50.0));
    assert_eq!(area.max(), Some(200.0));
    assert_eq!(area.avg(), Some(350.0 / 3.0));
}

#[test]
fn test_empty_area_aggregates() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube.area(&["Plan", "2023"]).unwrap();
    assert_eq!(area.count(), 0);
    assert_eq!(area.sum(), 0.0);
    assert_eq!(area.min(), None);
    assert_eq!(area.avg(), None);
}

// ============================================================================
// Mass writes
// ============================================================================

#[test]
fn test_set_value_existing_only_overwrites_stored_cells() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube.area(&["Actual", "2022"]).unwrap();

    let written = area.set_value(7.0, false).unwrap();
    assert_eq!(written, 3);
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Model S"]).unwrap(), 7.0);
    // Never-written cells stay absent.
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Model X"]).unwrap(), 0.0);
    assert_eq!(cube.fact_count(), 4);
}

#[test]
fn test_set_value_expand_all_writes_every_base_cell() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube.area(&["Plan", "2023", "products:Total"]).unwrap();

    let written = area.set_value(5.0, true).unwrap();
    assert_eq!(written, 4);
    for p in ["Model S", "Model 3", "Model X", "Model Y"] {
        assert_eq!(cube.get_numeric(&["Plan", "2023", p]).unwrap(), 5.0);
    }
    // The aggregation root equals value times leaf count (all weights +1).
    assert_eq!(cube.get_numeric(&["Plan", "2023", "Total"]).unwrap(), 20.0);
}

#[test]
fn test_expand_all_recreates_previously_deleted_cells() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Plan", "2023", "Model S"], 1.0).unwrap();
    cube.erase(&["Plan", "2023", "Model S"]).unwrap();

    let area = cube.area(&["Plan", "2023"]).unwrap();
    area.set_value(3.0, true).unwrap();
    assert_eq!(cube.get_numeric(&["Plan", "2023", "Model S"]).unwrap(), 3.0);
}

#[test]
fn test_expand_all_respects_area_guardrail() {
    let config = EngineConfig {
        max_area_cells: 4,
        ..EngineConfig::default()
    };
    let db = planning_db(config);
    let cube = db.cube("sales").unwrap();

    // datatypes(2) x years(2) x products(4) = 16 base cells > 4.
    let area = cube.area(&[]).unwrap();
    assert!(matches!(
        area.set_value(1.0, true),
        Err(EngineError::AreaTooLarge { cells: 16, limit: 4 })
    ));

    // A constrained area below the limit is fine.
    let area = cube.area(&["Plan", "2023"]).unwrap();
    assert_eq!(area.set_value(1.0, true).unwrap(), 4);
}

#[test]
fn test_clear_removes_only_area_facts() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let removed = cube.area(&["Actual", "2022"]).unwrap().clear();
    assert_eq!(removed, 3);
    assert_eq!(cube.fact_count(), 1);
    assert_eq!(cube.get_numeric(&["Plan", "2022", "Model S"]).unwrap(), 90.0);
}

#[test]
fn test_multiply_and_increment() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube.area(&["Actual", "2022"]).unwrap();

    area.multiply(2.0).unwrap();
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Model S"]).unwrap(), 200.0);
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Total"]).unwrap(), 700.0);

    area.increment(1.0).unwrap();
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Model S"]).unwrap(), 201.0);
    // Increment touches stored cells only.
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Model X"]).unwrap(), 0.0);
}

#[test]
fn test_copy_from_rewrites_fixed_coordinates() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();

    // Plan 2023 = Actual 2022 * 1.15
    let target = cube.area(&["Plan", "2023"]).unwrap();
    let source = cube.area(&["Actual", "2022"]).unwrap();
    let written = target.copy_from(&source, 1.15).unwrap();
    assert_eq!(written, 3);

    assert_eq!(
        cube.get_numeric(&["Plan", "2023", "Model S"]).unwrap(),
        100.0 * 1.15
    );
    let total = cube.get_numeric(&["Plan", "2023", "Total"]).unwrap();
    assert!((total - 350.0 * 1.15).abs() < 1e-9);
    // The source is untouched.
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Total"]).unwrap(), 350.0);
}

#[test]
fn test_copy_from_clears_target_first() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    cube.set(&["Plan", "2023", "Model X"], 999.0).unwrap();

    let target = cube.area(&["Plan", "2023"]).unwrap();
    let source = cube.area(&["Actual", "2022"]).unwrap();
    target.copy_from(&source, 1.0).unwrap();

    // Model X had no Actual/2022 source fact; the stale target value is gone.
    assert_eq!(cube.get_numeric(&["Plan", "2023", "Model X"]).unwrap(), 0.0);
}

// ============================================================================
// Set selectors
// ============================================================================

#[test]
fn test_subset_selector() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    // "suvs" = Model X, Model Y; only Model Y holds a fact.
    let area = cube.area(&["Actual", "2022", "suvs"]).unwrap();
    assert_eq!(area.sum(), 50.0);
}

#[test]
fn test_explicit_list_selector() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube
        .area(&["Actual", "2022", "products:Model S, Model 3"])
        .unwrap();
    assert_eq!(area.sum(), 300.0);
}

#[test]
fn test_glob_selector() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube.area(&["Actual", "2022", "products:Model ?"]).unwrap();
    // "Model ?" matches every single-character model name.
    assert_eq!(area.sum(), 350.0);
}

#[test]
fn test_attribute_filter_selector() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    let area = cube
        .area(&["Actual", "2022", "products:segment:premium"])
        .unwrap();
    // Premium products: Model S (100) and Model X (no fact).
    assert_eq!(area.sum(), 100.0);

    let written = area.set_value(11.0, true).unwrap();
    assert_eq!(written, 2);
    assert_eq!(cube.get_numeric(&["Actual", "2022", "Model X"]).unwrap(), 11.0);
}

#[test]
fn test_aggregated_selector_expands_to_base_cells() {
    let db = seeded();
    let cube = db.cube("sales").unwrap();
    // Selecting the aggregated Total covers the same base cells as "*".
    let area = cube.area(&["Actual", "2022", "products:Total"]).unwrap();
    assert_eq!(area.sum(), 350.0);
}
