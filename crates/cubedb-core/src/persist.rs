//! The pluggable persistence boundary.
//!
//! The engine prescribes *what* is persisted — database metadata, dimension
//! tables, cube table and fact table (rules are code and are restored by the
//! collaborator) — but not *how*. A [`PersistenceHook`] attached to a
//! database receives every fact write and committed structure change as
//! journal appends, bracketed by batch markers for area operations, plus
//! whole-state snapshot save/load and journal replay.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::dimension::{
    AttributeDef, AttributeType, AttributeValue, DimTables, Dimension, MemberDef, MemberId,
    SubsetDef,
};

/// Bumped when the persisted layout changes incompatibly.
pub const ENGINE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub name: String,
    pub engine_version: u32,
    pub dimensions: Vec<DimensionSnapshot>,
    pub cubes: Vec<CubeSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionSnapshot {
    pub name: String,
    pub next_id: u32,
    pub members: Vec<MemberSnapshot>,
    pub attributes: Vec<AttributeSnapshot>,
    pub subsets: Vec<SubsetSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub id: u32,
    pub name: String,
    pub aliases: Vec<String>,
    /// Outgoing weighted edges: `(child id, weight)`.
    pub children: Vec<(u32, f64)>,
    /// Values keyed by folded attribute name.
    pub attributes: Vec<(String, AttributeValue)>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSnapshot {
    pub name: String,
    pub ty: AttributeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsetSnapshot {
    pub name: String,
    pub members: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeSnapshot {
    pub name: String,
    pub dimensions: Vec<String>,
    pub facts: Vec<FactSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSnapshot {
    pub address: Vec<u32>,
    pub value: f64,
}

/// A committed structural change, journaled as a whole-table replacement so
/// replay mirrors the engine's atomic-swap semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StructureChange {
    DimensionAdded { dimension: String },
    DimensionRemoved { dimension: String },
    DimensionCommitted { table: DimensionSnapshot },
    CubeAdded { cube: String, dimensions: Vec<String> },
    CubeRemoved { cube: String },
}

/// One replayed journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    BeginBatch,
    CommitBatch,
    FactWrite {
        cube: String,
        address: Vec<u32>,
        /// `None` is the explicit "no value" write (deletion).
        value: Option<f64>,
    },
    Structure(StructureChange),
}

/// Storage collaborator interface.
pub trait PersistenceHook: Send + Sync {
    fn begin_batch(&self) -> Result<()>;

    fn append_fact_write(
        &self,
        cube: &str,
        address: &[MemberId],
        value: Option<f64>,
    ) -> Result<()>;

    fn append_structure_change(&self, change: &StructureChange) -> Result<()>;

    fn commit_batch(&self) -> Result<()>;

    fn save_snapshot(&self, snapshot: &DatabaseSnapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<DatabaseSnapshot>>;

    /// Replay journal records appended since the last snapshot, in order.
    fn replay_journal(&self, apply: &mut dyn FnMut(JournalRecord) -> Result<()>) -> Result<()>;
}

// ----------------------------------------------------------------------
// model conversions
// ----------------------------------------------------------------------

pub(crate) fn snapshot_dimension(dim: &Dimension) -> DimensionSnapshot {
    let tables = dim.snapshot();
    DimensionSnapshot {
        name: dim.name().to_string(),
        next_id: tables.next_id,
        members: tables
            .order
            .iter()
            .filter_map(|id| tables.member(*id))
            .map(|m| MemberSnapshot {
                id: m.id.raw(),
                name: m.name.clone(),
                aliases: m.aliases.clone(),
                children: m.children.iter().map(|&(c, w)| (c.raw(), w)).collect(),
                attributes: m
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                format: m.format.clone(),
            })
            .collect(),
        attributes: tables
            .attributes
            .values()
            .map(|a| AttributeSnapshot {
                name: a.name.clone(),
                ty: a.ty,
            })
            .collect(),
        subsets: tables
            .subsets
            .values()
            .map(|s| SubsetSnapshot {
                name: s.name.clone(),
                members: s.members.iter().map(|id| id.raw()).collect(),
            })
            .collect(),
    }
}

pub(crate) fn tables_from_snapshot(snapshot: &DimensionSnapshot) -> DimTables {
    let mut tables = DimTables::default();
    tables.next_id = snapshot.next_id;

    for member in &snapshot.members {
        let id = MemberId::new(member.id);
        tables.order.push(id);
        tables.lookup.insert(crate::names::fold(&member.name), id);
        for alias in &member.aliases {
            tables.lookup.insert(crate::names::fold(alias), id);
        }
        tables.members.insert(
            id,
            MemberDef {
                id,
                name: member.name.clone(),
                aliases: member.aliases.clone(),
                parents: Vec::new(),
                children: member
                    .children
                    .iter()
                    .map(|&(c, w)| (MemberId::new(c), w))
                    .collect(),
                level: 0,
                attributes: member
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                format: member.format.clone(),
            },
        );
    }

    // Derive the parent lists from the persisted edges.
    let edges: Vec<(MemberId, MemberId)> = tables
        .members
        .values()
        .flat_map(|m| m.children.iter().map(move |&(c, _)| (m.id, c)))
        .collect();
    for (parent, child) in edges {
        if let Some(def) = tables.members.get_mut(&child) {
            if !def.parents.contains(&parent) {
                def.parents.push(parent);
            }
        }
    }

    for attr in &snapshot.attributes {
        tables.attributes.insert(
            crate::names::fold(&attr.name),
            AttributeDef {
                name: attr.name.clone(),
                ty: attr.ty,
            },
        );
    }
    for subset in &snapshot.subsets {
        tables.subsets.insert(
            crate::names::fold(&subset.name),
            SubsetDef {
                name: subset.name.clone(),
                members: subset.members.iter().map(|&id| MemberId::new(id)).collect(),
            },
        );
    }
    tables
}
