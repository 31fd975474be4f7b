//! Aggregation invariants over randomized hierarchies and fact sets.
//!
//! Weights and values are kept integral so the expected sums are exact in
//! f64 and the assertions can use equality.

use proptest::prelude::*;

use cubedb_core::Database;

proptest! {
    /// A parent's value is the weighted sum of its children's values.
    #[test]
    fn prop_parent_is_weighted_sum_of_children(
        children in proptest::collection::vec((-3i32..=3i32, 0u32..=400u32), 1..6)
    ) {
        let mut db = Database::new("prop").unwrap();
        db.add_dimension("d").unwrap();
        let mut edit = db.edit_dimension("d").unwrap();
        edit.add_member("Parent", None, 1.0).unwrap();
        for (i, (weight, _)) in children.iter().enumerate() {
            edit.add_member(&format!("C{i}"), Some("Parent"), *weight as f64).unwrap();
        }
        db.commit_dimension(edit).unwrap();

        let cube = db.add_cube("c", &["d"]).unwrap();
        for (i, (_, value)) in children.iter().enumerate() {
            if *value != 0 {
                cube.set(&[format!("C{i}").as_str()], *value as f64).unwrap();
            }
        }

        let expected: f64 = children
            .iter()
            .map(|(weight, value)| (*weight as f64) * (*value as f64))
            .sum();
        prop_assert_eq!(cube.get_numeric(&["Parent"]).unwrap(), expected);

        // Each child still reads back its own stored value.
        for (i, (_, value)) in children.iter().enumerate() {
            prop_assert_eq!(
                cube.get_numeric(&[format!("C{i}").as_str()]).unwrap(),
                *value as f64
            );
        }
    }

    /// The grand total over two hierarchical dimensions equals the manual
    /// sum over all stored facts.
    #[test]
    fn prop_grand_total_matches_manual_sum(
        facts in proptest::collection::btree_map((0usize..2, 0usize..3), 1u32..100u32, 1..7)
    ) {
        let mut db = Database::new("prop").unwrap();
        db.add_dimension("rows").unwrap();
        {
            let mut edit = db.edit_dimension("rows").unwrap();
            edit.add_member("AllRows", None, 1.0).unwrap();
            edit.add_member("R0", Some("AllRows"), 1.0).unwrap();
            edit.add_member("R1", Some("AllRows"), 1.0).unwrap();
            db.commit_dimension(edit).unwrap();
        }
        db.add_dimension("cols").unwrap();
        {
            let mut edit = db.edit_dimension("cols").unwrap();
            edit.add_member("AllCols", None, 1.0).unwrap();
            for c in ["S0", "S1", "S2"] {
                edit.add_member(c, Some("AllCols"), 1.0).unwrap();
            }
            db.commit_dimension(edit).unwrap();
        }

        let cube = db.add_cube("grid", &["rows", "cols"]).unwrap();
        for ((r, c), value) in &facts {
            cube.set(
                &[format!("R{r}").as_str(), format!("S{c}").as_str()],
                *value as f64,
            )
            .unwrap();
        }

        let expected: f64 = facts.values().map(|v| *v as f64).sum();
        // Omitted coordinates default to the unique roots.
        prop_assert_eq!(cube.get_numeric(&[]).unwrap(), expected);
        prop_assert_eq!(cube.get_numeric(&["AllRows", "AllCols"]).unwrap(), expected);
    }

    /// Diamond shapes contribute once per path, with the path weights summed.
    #[test]
    fn prop_diamond_counts_each_path(
        w1 in -3i32..=3i32,
        w2 in -3i32..=3i32,
        value in 1u32..1000u32,
    ) {
        let mut db = Database::new("prop").unwrap();
        db.add_dimension("d").unwrap();
        let mut edit = db.edit_dimension("d").unwrap();
        edit.add_member("Top", None, 1.0).unwrap();
        edit.add_member("A", Some("Top"), 1.0).unwrap();
        edit.add_member("B", Some("Top"), 1.0).unwrap();
        edit.add_member("Leaf", Some("A"), w1 as f64).unwrap();
        edit.add_parent("Leaf", "B", w2 as f64).unwrap();
        db.commit_dimension(edit).unwrap();

        let cube = db.add_cube("c", &["d"]).unwrap();
        cube.set(&["Leaf"], value as f64).unwrap();

        let expected = ((w1 + w2) as f64) * value as f64;
        prop_assert_eq!(cube.get_numeric(&["Top"]).unwrap(), expected);
    }
}
