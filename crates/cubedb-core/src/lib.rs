//! CubeDB: an in-memory, model-driven multi-dimensional OLAP engine.
//!
//! Built for interactive planning, budgeting and forecasting workloads on
//! small-to-medium data sets (up to a few million stored base facts, up to
//! 32 dimensions per cube).
//!
//! Key pieces:
//! 1. **Dimensions** — hierarchical member registries with stable `u32` ids,
//!    aliases, typed attributes, subsets and weighted parent/child edges;
//!    structural changes go through snapshot-isolated edit sessions with
//!    atomic commit.
//! 2. **Cubes** — sparse base-fact stores over an ordered dimension tuple,
//!    with per-dimension inverted indexes (Roaring bitmaps) driving area
//!    queries.
//! 3. **Evaluation engine** — a cell read returns a stored base fact, an
//!    on-the-fly weighted aggregation over leaf expansions, a rule-computed
//!    value, or a default zero.
//! 4. **Rules** — user callables bound to trigger patterns that participate
//!    in evaluation through a [`CellCursor`], with recursion guarding and
//!    contained `#ERR`/`#REC` failures.
//! 5. **Result cache** — bounded, validated by structure/rules/data version
//!    stamps instead of eager invalidation.
//!
//! The [`Database`] is the single owning handle over dimensions, cubes,
//! configuration, the error sink and the pluggable persistence hook; there
//! is no process-wide registry. Reads are safe to run in parallel; writes
//! and structural edits serialize on the internal write locks.

mod area;
mod cache;
mod cell;
mod cube;
mod dimension;
mod error;
mod facts;
mod names;
mod persist;
mod resolver;
mod rules;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

pub use area::Area;
pub use cell::CellCursor;
pub use cube::{Address, Cube};
pub use dimension::{
    AttributeType, AttributeValue, Dimension, DimensionEdit, MemberId, MemberInfo,
};
pub use error::{EngineError, ErrorRecord, ErrorSink};
pub use persist::{
    AttributeSnapshot, CubeSnapshot, DatabaseSnapshot, DimensionSnapshot, FactSnapshot,
    JournalRecord, MemberSnapshot, PersistenceHook, StructureChange, SubsetSnapshot,
    ENGINE_VERSION,
};
pub use rules::{Rule, RuleId, RuleResult, RuleScope};

/// A contained per-cell failure, displayed instead of a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// A rule failed or returned a non-numeric result (`#ERR`).
    Error,
    /// Evaluation re-entered an address already on its stack (`#REC`).
    Recursion,
}

/// The result of evaluating a cell address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellValue {
    Value(f64),
    /// The explicit "no value" result, distinct from `0.0`.
    NoValue,
    Marker(Marker),
}

impl CellValue {
    /// Coerce to a number; "no value" and markers read as `0.0`.
    pub fn numeric(&self) -> f64 {
        match self {
            CellValue::Value(v) => *v,
            CellValue::NoValue | CellValue::Marker(_) => 0.0,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_no_value(&self) -> bool {
        matches!(self, CellValue::NoValue)
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, CellValue::Marker(_))
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Value(v) => write!(f, "{v}"),
            CellValue::NoValue => Ok(()),
            CellValue::Marker(Marker::Error) => write!(f, "#ERR"),
            CellValue::Marker(Marker::Recursion) => write!(f, "#REC"),
        }
    }
}

/// Engine tuning knobs, fixed per database.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Result-cache entries per cube.
    pub cache_capacity: usize,
    /// Upper bound on the Cartesian product an `expand_all` area write may
    /// enumerate.
    pub max_area_cells: u64,
    /// Default caching mode for new cubes.
    pub caching: bool,
    /// Maximum dimensions per cube.
    pub max_dimensions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 65_536,
            max_area_cells: 1_000_000,
            caching: true,
            max_dimensions: 32,
        }
    }
}

/// State shared between a database and its cubes.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub sink: RwLock<ErrorSink>,
    pub hook: RwLock<Option<Arc<dyn PersistenceHook>>>,
}

/// The owning handle over a data model: dimensions, cubes, rules, cache and
/// collaborator attachments.
pub struct Database {
    name: String,
    shared: Arc<Shared>,
    /// Folded name -> handle; sorted for deterministic enumeration.
    dimensions: BTreeMap<String, Arc<Dimension>>,
    cubes: BTreeMap<String, Arc<Cube>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("dimensions", &self.dimensions())
            .field("cubes", &self.cubes())
            .finish()
    }
}

impl Database {
    pub fn new(name: &str) -> Result<Self, EngineError> {
        Self::with_config(name, EngineConfig::default())
    }

    pub fn with_config(name: &str, config: EngineConfig) -> Result<Self, EngineError> {
        if names::fold(name).is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "database name must not be empty".to_string(),
            });
        }
        Ok(Self {
            name: name.trim().to_string(),
            shared: Arc::new(Shared {
                config,
                sink: RwLock::new(error::default_sink()),
                hook: RwLock::new(None),
            }),
            dimensions: BTreeMap::new(),
            cubes: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Replace the error sink receiving contained-failure and invalidation
    /// records.
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.shared.sink.write() = sink;
    }

    /// Attach a persistence collaborator; it receives every subsequent fact
    /// write and committed structure change.
    pub fn attach_persistence(&self, hook: Arc<dyn PersistenceHook>) {
        *self.shared.hook.write() = Some(hook);
    }

    pub fn detach_persistence(&self) {
        *self.shared.hook.write() = None;
    }

    // ------------------------------------------------------------------
    // dimensions
    // ------------------------------------------------------------------

    pub fn add_dimension(&mut self, name: &str) -> Result<Arc<Dimension>, EngineError> {
        let key = names::fold(name);
        if key.is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "dimension name must not be empty".to_string(),
            });
        }
        if self.dimensions.contains_key(&key) {
            return Err(EngineError::DuplicateName {
                name: name.to_string(),
                dimension: self.name.clone(),
            });
        }
        let dim = Arc::new(Dimension::new(name));
        self.dimensions.insert(key, dim.clone());
        self.journal(StructureChange::DimensionAdded {
            dimension: dim.name().to_string(),
        });
        Ok(dim)
    }

    /// Remove a dimension. Fails with `InUse` while any cube references it
    /// (referential integrity).
    pub fn remove_dimension(&mut self, name: &str) -> Result<(), EngineError> {
        let key = names::fold(name);
        if !self.dimensions.contains_key(&key) {
            return Err(EngineError::UnknownMember {
                name: name.to_string(),
                dimension: None,
            });
        }
        let users: Vec<String> = self
            .cubes
            .values()
            .filter(|c| c.uses_dimension(&key))
            .map(|c| c.name().to_string())
            .collect();
        if !users.is_empty() {
            return Err(EngineError::InUse {
                name: name.to_string(),
                detail: format!("referenced by cube(s) {users:?}"),
            });
        }
        self.dimensions.remove(&key);
        self.journal(StructureChange::DimensionRemoved {
            dimension: name.to_string(),
        });
        Ok(())
    }

    pub fn dimension(&self, name: &str) -> Result<Arc<Dimension>, EngineError> {
        self.dimensions
            .get(&names::fold(name))
            .cloned()
            .ok_or_else(|| EngineError::UnknownMember {
                name: name.to_string(),
                dimension: None,
            })
    }

    pub fn dimensions(&self) -> Vec<String> {
        self.dimensions
            .values()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Begin a structural edit session on a dimension. Concurrent reads keep
    /// seeing the pre-edit state until [`Self::commit_dimension`].
    pub fn edit_dimension(&self, name: &str) -> Result<DimensionEdit, EngineError> {
        Dimension::begin_edit(&self.dimension(name)?)
    }

    /// Validate and atomically install a staged dimension edit.
    ///
    /// Stored facts referencing members that were removed (or that stopped
    /// being base members) are cascade-deleted from every cube using the
    /// dimension; each cascade is reported as an invalidation event. A
    /// failed commit discards the edit buffer and leaves no partial change
    /// visible.
    pub fn commit_dimension(&self, mut edit: DimensionEdit) -> Result<(), EngineError> {
        let dim = edit.dimension().clone();
        let outcome = dim.commit_edit(&mut edit)?;

        if !outcome.invalidated.is_empty() {
            let ids: HashSet<MemberId> = outcome.invalidated.iter().copied().collect();
            let folded = names::fold(dim.name());
            for cube in self.cubes.values() {
                if !cube.uses_dimension(&folded) {
                    continue;
                }
                let removed = cube.cascade_remove(dim.name(), &ids);
                if removed > 0 {
                    self.report(ErrorRecord {
                        kind: "cascade_delete",
                        cube: Some(cube.name().to_string()),
                        address: None,
                        detail: format!(
                            "removed {removed} fact(s) referencing {} invalidated member(s) \
                             of dimension '{}'",
                            ids.len(),
                            dim.name()
                        ),
                    });
                }
            }
        }

        self.journal(StructureChange::DimensionCommitted {
            table: persist::snapshot_dimension(&dim),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // cubes
    // ------------------------------------------------------------------

    /// Create a cube over an ordered list of existing dimensions (at least
    /// one; the order is part of the cube's identity).
    pub fn add_cube(&mut self, name: &str, dimensions: &[&str]) -> Result<Arc<Cube>, EngineError> {
        let key = names::fold(name);
        if key.is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "cube name must not be empty".to_string(),
            });
        }
        if dimensions.is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "a cube needs at least one dimension".to_string(),
            });
        }
        if dimensions.len() > self.shared.config.max_dimensions {
            return Err(EngineError::InvalidOperation {
                detail: format!(
                    "a cube supports at most {} dimensions, got {}",
                    self.shared.config.max_dimensions,
                    dimensions.len()
                ),
            });
        }
        if self.cubes.contains_key(&key) {
            return Err(EngineError::DuplicateName {
                name: name.to_string(),
                dimension: self.name.clone(),
            });
        }
        let mut dims = Vec::with_capacity(dimensions.len());
        for dim_name in dimensions {
            dims.push(self.dimension(dim_name)?);
        }

        let cube = Arc::new(Cube::new(name, dims, self.shared.clone()));
        self.cubes.insert(key, cube.clone());
        self.journal(StructureChange::CubeAdded {
            cube: cube.name().to_string(),
            dimensions: cube.dimension_names(),
        });
        Ok(cube)
    }

    /// Remove a cube and all its facts.
    pub fn remove_cube(&mut self, name: &str) -> Result<(), EngineError> {
        if self.cubes.remove(&names::fold(name)).is_none() {
            return Err(EngineError::UnknownMember {
                name: name.to_string(),
                dimension: None,
            });
        }
        self.journal(StructureChange::CubeRemoved {
            cube: name.to_string(),
        });
        Ok(())
    }

    pub fn cube(&self, name: &str) -> Result<Arc<Cube>, EngineError> {
        self.cubes
            .get(&names::fold(name))
            .cloned()
            .ok_or_else(|| EngineError::UnknownMember {
                name: name.to_string(),
                dimension: None,
            })
    }

    pub fn cubes(&self) -> Vec<String> {
        self.cubes.values().map(|c| c.name().to_string()).collect()
    }

    /// Every stored fact across all cubes, as
    /// `(cube name, member names, value)`.
    pub fn facts(&self) -> Vec<(String, Vec<String>, f64)> {
        let mut out = Vec::new();
        for cube in self.cubes.values() {
            for (addr, value) in cube.facts() {
                out.push((cube.name().to_string(), addr, value));
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    /// The persisted-state model: metadata, dimension tables, cube table and
    /// fact table. Rules are code and are not part of it.
    pub fn snapshot(&self) -> DatabaseSnapshot {
        DatabaseSnapshot {
            name: self.name.clone(),
            engine_version: ENGINE_VERSION,
            dimensions: self
                .dimensions
                .values()
                .map(|d| persist::snapshot_dimension(d))
                .collect(),
            cubes: self
                .cubes
                .values()
                .map(|c| CubeSnapshot {
                    name: c.name().to_string(),
                    dimensions: c.dimension_names(),
                    facts: c
                        .facts_by_id()
                        .into_iter()
                        .map(|(addr, value)| FactSnapshot {
                            address: addr.iter().map(|id| id.raw()).collect(),
                            value,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Rebuild a database from a snapshot. Rules are not restored; the
    /// collaborator that owns them re-registers after loading.
    pub fn restore(
        snapshot: &DatabaseSnapshot,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut db = Self::with_config(&snapshot.name, config)?;
        for dim_snap in &snapshot.dimensions {
            let tables = persist::tables_from_snapshot(dim_snap);
            let dim = Arc::new(Dimension::from_tables(&dim_snap.name, tables)?);
            db.dimensions.insert(names::fold(&dim_snap.name), dim);
        }
        for cube_snap in &snapshot.cubes {
            let dim_names: Vec<&str> = cube_snap.dimensions.iter().map(String::as_str).collect();
            let cube = db.add_cube(&cube_snap.name, &dim_names)?;
            for fact in &cube_snap.facts {
                if fact.address.len() != cube.dimension_count() {
                    tracing::warn!(
                        cube = %cube_snap.name,
                        "skipping fact with mismatched address arity"
                    );
                    continue;
                }
                let coords: Vec<MemberId> =
                    fact.address.iter().map(|&id| MemberId::new(id)).collect();
                cube.load_fact(&coords, Some(fact.value));
            }
        }
        Ok(db)
    }

    /// Apply one replayed journal record. Fact writes bypass `OnEntry` rules
    /// and the hook, mirroring what the original write already did.
    pub fn apply_journal_record(&mut self, record: JournalRecord) -> anyhow::Result<()> {
        match record {
            JournalRecord::BeginBatch | JournalRecord::CommitBatch => {}
            JournalRecord::FactWrite {
                cube,
                address,
                value,
            } => {
                let cube = self.cube(&cube)?;
                if address.len() != cube.dimension_count() {
                    anyhow::bail!(
                        "journaled address arity {} does not match cube '{}'",
                        address.len(),
                        cube.name()
                    );
                }
                let coords: Vec<MemberId> =
                    address.iter().map(|&id| MemberId::new(id)).collect();
                cube.load_fact(&coords, value);
            }
            JournalRecord::Structure(change) => match change {
                StructureChange::DimensionAdded { dimension } => {
                    if self.dimension(&dimension).is_err() {
                        self.add_dimension(&dimension)?;
                    }
                }
                StructureChange::DimensionRemoved { dimension } => {
                    self.remove_dimension(&dimension)?;
                }
                StructureChange::DimensionCommitted { table } => {
                    let dim = match self.dimension(&table.name) {
                        Ok(dim) => dim,
                        Err(_) => self.add_dimension(&table.name)?,
                    };
                    dim.install_tables(persist::tables_from_snapshot(&table))?;
                }
                StructureChange::CubeAdded { cube, dimensions } => {
                    if self.cube(&cube).is_err() {
                        let dim_names: Vec<&str> =
                            dimensions.iter().map(String::as_str).collect();
                        self.add_cube(&cube, &dim_names)?;
                    }
                }
                StructureChange::CubeRemoved { cube } => {
                    self.remove_cube(&cube)?;
                }
            },
        }
        Ok(())
    }

    /// Save a snapshot through the attached persistence hook.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(hook) = self.shared.hook.read().clone() else {
            anyhow::bail!("no persistence hook attached to database '{}'", self.name);
        };
        hook.save_snapshot(&self.snapshot())
    }

    fn journal(&self, change: StructureChange) {
        let Some(hook) = self.shared.hook.read().clone() else {
            return;
        };
        if let Err(err) = hook.append_structure_change(&change) {
            self.report(ErrorRecord {
                kind: "persistence",
                cube: None,
                address: None,
                detail: format!("structure journal append failed: {err}"),
            });
        }
    }

    fn report(&self, record: ErrorRecord) {
        tracing::warn!(kind = record.kind, "{}", record.detail);
        let sink = self.shared.sink.read().clone();
        (sink.as_ref())(&record);
    }
}
