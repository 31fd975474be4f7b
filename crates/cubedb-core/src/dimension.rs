//! Dimensions: member registry, weighted hierarchy, leaf expansions and
//! edit sessions.
//!
//! A dimension is an ordered list of members with parent/child edges, each
//! edge carrying a float weight (default `+1.0`). Members without children
//! are *base* members (level 0) and can store facts; members with children
//! are *aggregated*. For every member the dimension derives its **leaf
//! expansion**: the set of base members reachable from it together with the
//! aggregate weight, multiplying edge weights along each path and summing
//! the weights of duplicate leaves in diamond shapes.
//!
//! Structural changes go through an explicit edit session
//! (`Clean → Editing → Commit | Rollback`). The session stages a private
//! copy of the dimension's tables; commit swaps them in atomically and bumps
//! the structure version, so readers either see the full pre-edit snapshot
//! or the full post-commit state, never a mix. Leaf expansions are memoized
//! per structure version and recomputed lazily on first use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::names;

/// Stable member identifier (4 bytes), unique within a dimension for the
/// member's lifetime. Ids are never reused while the member exists; renames
/// keep the id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct MemberId(u32);

impl MemberId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Declared value type of a dimension attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    Text,
    Number,
    Bool,
}

/// A typed attribute value attached to a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl AttributeValue {
    pub fn type_of(&self) -> AttributeType {
        match self {
            AttributeValue::Text(_) => AttributeType::Text,
            AttributeValue::Number(_) => AttributeType::Number,
            AttributeValue::Bool(_) => AttributeType::Bool,
        }
    }

    /// Parse a raw selector token into a value of the given type.
    pub(crate) fn parse(ty: AttributeType, raw: &str) -> Result<Self, EngineError> {
        match ty {
            AttributeType::Text => Ok(AttributeValue::Text(raw.to_string())),
            AttributeType::Number => raw
                .trim()
                .parse::<f64>()
                .map(AttributeValue::Number)
                .map_err(|_| EngineError::TypeError {
                    detail: format!("'{raw}' is not a number"),
                }),
            AttributeType::Bool => match names::fold(raw).as_str() {
                "true" | "1" | "yes" => Ok(AttributeValue::Bool(true)),
                "false" | "0" | "no" => Ok(AttributeValue::Bool(false)),
                _ => Err(EngineError::TypeError {
                    detail: format!("'{raw}' is not a bool"),
                }),
            },
        }
    }

    fn equals(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::Text(a), AttributeValue::Text(b)) => {
                names::fold(a) == names::fold(b)
            }
            (AttributeValue::Number(a), AttributeValue::Number(b)) => a == b,
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => a == b,
            _ => false,
        }
    }
}

/// Internal member record.
#[derive(Debug, Clone)]
pub(crate) struct MemberDef {
    pub id: MemberId,
    pub name: String,
    pub aliases: Vec<String>,
    pub parents: Vec<MemberId>,
    /// Outgoing edges with weights: `(child, weight)`.
    pub children: Vec<(MemberId, f64)>,
    /// 0 for base members; `1 + max(child level)` otherwise.
    pub level: u32,
    /// Keyed by folded attribute name.
    pub attributes: BTreeMap<String, AttributeValue>,
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AttributeDef {
    pub name: String,
    pub ty: AttributeType,
}

#[derive(Debug, Clone)]
pub(crate) struct SubsetDef {
    pub name: String,
    pub members: Vec<MemberId>,
}

/// The complete internal state of a dimension. Commit replaces the whole
/// table behind an `Arc`, which is what makes edit sessions snapshot
/// isolated.
#[derive(Debug, Clone, Default)]
pub(crate) struct DimTables {
    pub version: u64,
    pub members: BTreeMap<MemberId, MemberDef>,
    /// Insertion order, for stable member enumeration.
    pub order: Vec<MemberId>,
    /// Folded name or alias -> id. Names and aliases share this namespace.
    pub lookup: HashMap<String, MemberId>,
    /// Folded attribute name -> declaration.
    pub attributes: BTreeMap<String, AttributeDef>,
    /// Folded subset name -> definition.
    pub subsets: BTreeMap<String, SubsetDef>,
    pub next_id: u32,
}

impl DimTables {
    pub fn id_of(&self, name: &str) -> Option<MemberId> {
        self.lookup.get(&names::fold(name)).copied()
    }

    pub fn member(&self, id: MemberId) -> Option<&MemberDef> {
        self.members.get(&id)
    }

    pub fn is_base(&self, id: MemberId) -> bool {
        self.members
            .get(&id)
            .map(|m| m.children.is_empty())
            .unwrap_or(false)
    }

    pub fn roots(&self) -> Vec<MemberId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.members
                    .get(id)
                    .map(|m| m.parents.is_empty())
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn unique_root(&self) -> Option<MemberId> {
        let roots = self.roots();
        if roots.len() == 1 {
            Some(roots[0])
        } else {
            None
        }
    }

    /// Recompute member levels bottom-up. Fails if the edge set contains a
    /// cycle; commit runs this as its final validation.
    fn recompute_levels(&mut self, dimension: &str) -> Result<(), EngineError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        let ids: Vec<MemberId> = self.members.keys().copied().collect();
        let mut marks: HashMap<MemberId, Mark> =
            ids.iter().map(|&id| (id, Mark::New)).collect();
        let mut levels: HashMap<MemberId, u32> = HashMap::new();

        for &start in &ids {
            if marks[&start] == Mark::Done {
                continue;
            }
            // Iterative post-order: (id, children_expanded).
            let mut stack = vec![(start, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    let level = self.members[&id]
                        .children
                        .iter()
                        .map(|&(c, _)| levels.get(&c).copied().unwrap_or(0) + 1)
                        .max()
                        .unwrap_or(0);
                    levels.insert(id, level);
                    marks.insert(id, Mark::Done);
                    continue;
                }
                // Dangling child ids (possible in a hand-edited snapshot)
                // simply contribute nothing.
                let Some(mark) = marks.get(&id).copied() else {
                    continue;
                };
                match mark {
                    Mark::Done => continue,
                    Mark::Open => {
                        let name = self.members[&id].name.clone();
                        return Err(EngineError::CycleDetected {
                            dimension: dimension.to_string(),
                            parent: name.clone(),
                            child: name,
                        });
                    }
                    Mark::New => {
                        marks.insert(id, Mark::Open);
                        stack.push((id, true));
                        for &(child, _) in &self.members[&id].children {
                            if marks.get(&child) == Some(&Mark::Open) {
                                return Err(EngineError::CycleDetected {
                                    dimension: dimension.to_string(),
                                    parent: self.members[&id].name.clone(),
                                    child: self
                                        .members
                                        .get(&child)
                                        .map(|m| m.name.clone())
                                        .unwrap_or_default(),
                                });
                            }
                            stack.push((child, false));
                        }
                    }
                }
            }
        }

        for (id, level) in levels {
            if let Some(def) = self.members.get_mut(&id) {
                def.level = level;
            }
        }
        Ok(())
    }
}

/// Compute the leaf expansion of `id`: `(base_id, aggregate_weight)` pairs,
/// ascending by base id. Edge weights multiply along a path; a leaf
/// reachable over several paths sums the path weights.
fn compute_expansion(tables: &DimTables, id: MemberId) -> Vec<(MemberId, f64)> {
    let mut acc: BTreeMap<MemberId, f64> = BTreeMap::new();
    let mut stack: Vec<(MemberId, f64)> = vec![(id, 1.0)];
    while let Some((m, w)) = stack.pop() {
        let Some(def) = tables.members.get(&m) else {
            continue;
        };
        if def.children.is_empty() {
            *acc.entry(m).or_insert(0.0) += w;
        } else {
            for &(child, cw) in &def.children {
                stack.push((child, w * cw));
            }
        }
    }
    acc.into_iter().collect()
}

struct ExpansionMemo {
    version: u64,
    map: HashMap<MemberId, Arc<Vec<(MemberId, f64)>>>,
}

/// Read-only view of one member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub id: MemberId,
    pub name: String,
    pub aliases: Vec<String>,
    pub level: u32,
    pub parents: Vec<String>,
    pub children: Vec<(String, f64)>,
    pub format: Option<String>,
}

/// A named, hierarchically organized set of members.
///
/// Dimensions are owned by a [`crate::Database`] and shared with the cubes
/// that use them as axes. All structural mutation goes through
/// [`crate::Database::edit_dimension`] / [`crate::Database::commit_dimension`].
pub struct Dimension {
    name: String,
    tables: RwLock<Arc<DimTables>>,
    structure_version: AtomicU64,
    editing: AtomicBool,
    expansions: Mutex<ExpansionMemo>,
}

impl std::fmt::Debug for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dimension")
            .field("name", &self.name)
            .field("members", &self.len())
            .field("structure_version", &self.structure_version())
            .finish()
    }
}

impl Dimension {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            tables: RwLock::new(Arc::new(DimTables::default())),
            structure_version: AtomicU64::new(0),
            editing: AtomicBool::new(false),
            expansions: Mutex::new(ExpansionMemo {
                version: 0,
                map: HashMap::new(),
            }),
        }
    }

    pub(crate) fn from_tables(name: &str, mut tables: DimTables) -> Result<Self, EngineError> {
        tables.recompute_levels(name)?;
        let version = tables.version;
        Ok(Self {
            name: name.trim().to_string(),
            tables: RwLock::new(Arc::new(tables)),
            structure_version: AtomicU64::new(version),
            editing: AtomicBool::new(false),
            expansions: Mutex::new(ExpansionMemo {
                version,
                map: HashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.snapshot().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic counter bumped on every committed structural change.
    pub fn structure_version(&self) -> u64 {
        self.structure_version.load(Ordering::SeqCst)
    }

    /// Current table snapshot. Holding the returned `Arc` pins a consistent
    /// view across a concurrent commit.
    pub(crate) fn snapshot(&self) -> Arc<DimTables> {
        self.tables.read().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().id_of(name).is_some()
    }

    pub fn member_id(&self, name: &str) -> Option<MemberId> {
        self.snapshot().id_of(name)
    }

    pub fn member_name(&self, id: MemberId) -> Option<String> {
        self.snapshot().member(id).map(|m| m.name.clone())
    }

    pub(crate) fn member_level_by_id(&self, id: MemberId) -> Option<u32> {
        self.snapshot().member(id).map(|m| m.level)
    }

    pub fn is_base(&self, name: &str) -> Result<bool, EngineError> {
        let tables = self.snapshot();
        let id = tables.id_of(name).ok_or_else(|| self.unknown(name))?;
        Ok(tables.is_base(id))
    }

    /// Full view of a member, by name or alias.
    pub fn member(&self, name: &str) -> Result<MemberInfo, EngineError> {
        let tables = self.snapshot();
        let id = tables.id_of(name).ok_or_else(|| self.unknown(name))?;
        let def = tables.member(id).expect("lookup points at live member");
        let resolve = |id: MemberId| {
            tables
                .member(id)
                .map(|m| m.name.clone())
                .unwrap_or_default()
        };
        Ok(MemberInfo {
            id: def.id,
            name: def.name.clone(),
            aliases: def.aliases.clone(),
            level: def.level,
            parents: def.parents.iter().copied().map(resolve).collect(),
            children: def
                .children
                .iter()
                .map(|&(c, w)| (resolve(c), w))
                .collect(),
            format: def.format.clone(),
        })
    }

    /// All member names in insertion order.
    pub fn members(&self) -> Vec<String> {
        let tables = self.snapshot();
        tables
            .order
            .iter()
            .filter_map(|id| tables.member(*id).map(|m| m.name.clone()))
            .collect()
    }

    pub fn root_members(&self) -> Vec<String> {
        let tables = self.snapshot();
        tables
            .roots()
            .into_iter()
            .filter_map(|id| tables.member(id).map(|m| m.name.clone()))
            .collect()
    }

    /// Base (leaf) member names.
    pub fn leaf_members(&self) -> Vec<String> {
        self.members_by_predicate(|m| m.children.is_empty())
    }

    pub fn aggregated_members(&self) -> Vec<String> {
        self.members_by_predicate(|m| !m.children.is_empty())
    }

    pub fn members_by_level(&self, level: u32) -> Vec<String> {
        self.members_by_predicate(|m| m.level == level)
    }

    fn members_by_predicate(&self, pred: impl Fn(&MemberDef) -> bool) -> Vec<String> {
        let tables = self.snapshot();
        tables
            .order
            .iter()
            .filter_map(|id| tables.member(*id))
            .filter(|m| pred(m))
            .map(|m| m.name.clone())
            .collect()
    }

    /// Highest level over all members; 0 for a flat dimension.
    pub fn top_level(&self) -> u32 {
        let tables = self.snapshot();
        tables.members.values().map(|m| m.level).max().unwrap_or(0)
    }

    pub(crate) fn unique_root_id(&self) -> Option<MemberId> {
        self.snapshot().unique_root()
    }

    pub(crate) fn base_member_ids(&self) -> Vec<MemberId> {
        let tables = self.snapshot();
        tables
            .order
            .iter()
            .copied()
            .filter(|&id| tables.is_base(id))
            .collect()
    }

    pub fn children(&self, member: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.member(member)?.children.into_iter().map(|(n, _)| n).collect())
    }

    pub fn parents(&self, member: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.member(member)?.parents)
    }

    pub fn level(&self, member: &str) -> Result<u32, EngineError> {
        Ok(self.member(member)?.level)
    }

    /// Weight of the direct edge `parent -> child`.
    pub fn weight(&self, parent: &str, child: &str) -> Result<f64, EngineError> {
        let tables = self.snapshot();
        let pid = tables.id_of(parent).ok_or_else(|| self.unknown(parent))?;
        let cid = tables.id_of(child).ok_or_else(|| self.unknown(child))?;
        let def = tables.member(pid).expect("lookup points at live member");
        def.children
            .iter()
            .find(|&&(c, _)| c == cid)
            .map(|&(_, w)| w)
            .ok_or_else(|| EngineError::InvalidOperation {
                detail: format!(
                    "no edge '{parent}' -> '{child}' in dimension '{}'",
                    self.name
                ),
            })
    }

    /// Declared attributes as `(name, type)` pairs.
    pub fn attributes(&self) -> Vec<(String, AttributeType)> {
        self.snapshot()
            .attributes
            .values()
            .map(|a| (a.name.clone(), a.ty))
            .collect()
    }

    /// Attribute value for a member, `None` if unset.
    pub fn attribute(
        &self,
        member: &str,
        attribute: &str,
    ) -> Result<Option<AttributeValue>, EngineError> {
        let tables = self.snapshot();
        let key = names::fold(attribute);
        if !tables.attributes.contains_key(&key) {
            return Err(EngineError::UnknownMember {
                name: attribute.to_string(),
                dimension: Some(self.name.clone()),
            });
        }
        let id = tables.id_of(member).ok_or_else(|| self.unknown(member))?;
        let def = tables.member(id).expect("lookup points at live member");
        Ok(def.attributes.get(&key).cloned())
    }

    /// Names of members whose attribute equals `value`.
    pub fn members_by_attribute(
        &self,
        attribute: &str,
        value: &AttributeValue,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self
            .ids_by_attribute(attribute, value)?
            .into_iter()
            .filter_map(|id| self.member_name(id))
            .collect())
    }

    pub(crate) fn ids_by_attribute(
        &self,
        attribute: &str,
        value: &AttributeValue,
    ) -> Result<Vec<MemberId>, EngineError> {
        let tables = self.snapshot();
        let key = names::fold(attribute);
        let Some(decl) = tables.attributes.get(&key) else {
            return Err(EngineError::UnknownMember {
                name: attribute.to_string(),
                dimension: Some(self.name.clone()),
            });
        };
        if decl.ty != value.type_of() {
            return Err(EngineError::TypeError {
                detail: format!(
                    "attribute '{}' of dimension '{}' holds {:?} values",
                    decl.name, self.name, decl.ty
                ),
            });
        }
        Ok(tables
            .order
            .iter()
            .filter_map(|id| tables.member(*id))
            .filter(|m| m.attributes.get(&key).map(|v| v.equals(value)).unwrap_or(false))
            .map(|m| m.id)
            .collect())
    }

    /// Resolve a raw `attr:value` selector against the declared type.
    pub(crate) fn ids_matching_attribute_raw(
        &self,
        attribute: &str,
        raw: &str,
    ) -> Result<Vec<MemberId>, EngineError> {
        let tables = self.snapshot();
        let key = names::fold(attribute);
        let Some(decl) = tables.attributes.get(&key) else {
            return Err(EngineError::UnknownMember {
                name: attribute.to_string(),
                dimension: Some(self.name.clone()),
            });
        };
        let value = AttributeValue::parse(decl.ty, raw)?;
        self.ids_by_attribute(attribute, &value)
    }

    /// Declared subsets.
    pub fn subsets(&self) -> Vec<String> {
        self.snapshot()
            .subsets
            .values()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn subset(&self, name: &str) -> Option<Vec<String>> {
        let tables = self.snapshot();
        let def = tables.subsets.get(&names::fold(name))?;
        Some(
            def.members
                .iter()
                .filter_map(|id| tables.member(*id).map(|m| m.name.clone()))
                .collect(),
        )
    }

    pub(crate) fn subset_ids(&self, name: &str) -> Option<Vec<MemberId>> {
        self.snapshot()
            .subsets
            .get(&names::fold(name))
            .map(|s| s.members.clone())
    }

    /// Member ids whose name matches a `*`/`?` glob.
    pub(crate) fn ids_matching_glob(&self, pattern: &str) -> Vec<MemberId> {
        let tables = self.snapshot();
        tables
            .order
            .iter()
            .filter_map(|id| tables.member(*id))
            .filter(|m| names::glob_match(pattern, &m.name))
            .map(|m| m.id)
            .collect()
    }

    /// Memoized leaf expansion for `id`. Empty for unknown ids.
    pub(crate) fn leaf_expansion(&self, id: MemberId) -> Arc<Vec<(MemberId, f64)>> {
        let tables = self.snapshot();
        {
            let memo = self.expansions.lock();
            if memo.version == tables.version {
                if let Some(expansion) = memo.map.get(&id) {
                    return expansion.clone();
                }
            }
        }

        let expansion = Arc::new(compute_expansion(&tables, id));
        let mut memo = self.expansions.lock();
        if memo.version != tables.version {
            memo.map.clear();
            memo.version = tables.version;
        }
        memo.map.insert(id, expansion.clone());
        expansion
    }

    /// Leaf expansion by member name, as `(base member name, weight)` pairs.
    pub fn leaf_expansion_of(&self, member: &str) -> Result<Vec<(String, f64)>, EngineError> {
        let tables = self.snapshot();
        let id = tables.id_of(member).ok_or_else(|| self.unknown(member))?;
        Ok(self
            .leaf_expansion(id)
            .iter()
            .filter_map(|&(base, w)| tables.member(base).map(|m| (m.name.clone(), w)))
            .collect())
    }

    pub(crate) fn begin_edit(dim: &Arc<Dimension>) -> Result<DimensionEdit, EngineError> {
        if dim.editing.swap(true, Ordering::SeqCst) {
            return Err(EngineError::EditInProgress {
                dimension: dim.name.clone(),
            });
        }
        let staged = (*dim.snapshot()).clone();
        let pre_ids: HashSet<MemberId> = staged.members.keys().copied().collect();
        let pre_base: HashSet<MemberId> = staged
            .members
            .values()
            .filter(|m| m.children.is_empty())
            .map(|m| m.id)
            .collect();
        Ok(DimensionEdit {
            dim: dim.clone(),
            staged,
            pre_ids,
            pre_base,
            done: false,
        })
    }

    /// Atomically install the staged tables. Returns the member ids whose
    /// stored facts must be cascade-deleted: removed members plus members
    /// that were base and are now aggregated.
    pub(crate) fn commit_edit(
        &self,
        edit: &mut DimensionEdit,
    ) -> Result<CommitOutcome, EngineError> {
        let mut staged = std::mem::take(&mut edit.staged);
        staged.recompute_levels(&self.name)?;
        staged.version = self.snapshot().version + 1;

        let removed: Vec<MemberId> = edit
            .pre_ids
            .iter()
            .copied()
            .filter(|id| !staged.members.contains_key(id))
            .collect();
        let demoted: Vec<MemberId> = edit
            .pre_base
            .iter()
            .filter_map(|id| staged.members.get(id))
            .filter(|m| !m.children.is_empty())
            .map(|m| m.id)
            .collect();

        let version = staged.version;
        *self.tables.write() = Arc::new(staged);
        self.structure_version.store(version, Ordering::SeqCst);
        {
            let mut memo = self.expansions.lock();
            memo.map.clear();
            memo.version = version;
        }
        edit.done = true;
        self.editing.store(false, Ordering::SeqCst);

        let mut invalidated = removed;
        invalidated.extend(demoted);
        invalidated.sort_unstable();
        invalidated.dedup();
        Ok(CommitOutcome { invalidated })
    }

    /// Replace the dimension's tables wholesale, as journal replay of a
    /// committed edit does. Same swap semantics as a live commit.
    pub(crate) fn install_tables(&self, mut tables: DimTables) -> Result<(), EngineError> {
        tables.recompute_levels(&self.name)?;
        tables.version = self.snapshot().version + 1;
        let version = tables.version;
        *self.tables.write() = Arc::new(tables);
        self.structure_version.store(version, Ordering::SeqCst);
        let mut memo = self.expansions.lock();
        memo.map.clear();
        memo.version = version;
        Ok(())
    }

    fn unknown(&self, name: &str) -> EngineError {
        EngineError::UnknownMember {
            name: name.to_string(),
            dimension: Some(self.name.clone()),
        }
    }
}

/// Member ids a dimension commit invalidated; any stored fact referencing
/// one of them is cascade-deleted by the database.
pub(crate) struct CommitOutcome {
    pub invalidated: Vec<MemberId>,
}

/// A staged structural change to one dimension.
///
/// Acquired through [`crate::Database::edit_dimension`]. All mutators work on
/// a private copy; readers keep seeing the pre-edit state until
/// [`crate::Database::commit_dimension`] installs the new tables in one swap.
/// Dropping the session without committing rolls it back.
pub struct DimensionEdit {
    dim: Arc<Dimension>,
    staged: DimTables,
    pre_ids: HashSet<MemberId>,
    pre_base: HashSet<MemberId>,
    done: bool,
}

impl DimensionEdit {
    pub fn dimension_name(&self) -> &str {
        self.dim.name()
    }

    pub(crate) fn dimension(&self) -> &Arc<Dimension> {
        &self.dim
    }

    /// Insert a new member, optionally under a parent with an edge weight.
    ///
    /// The parent must already exist. To attach an existing member to an
    /// additional parent (diamond hierarchies), use [`Self::add_parent`].
    pub fn add_member(
        &mut self,
        name: &str,
        parent: Option<&str>,
        weight: f64,
    ) -> Result<MemberId, EngineError> {
        let key = names::fold(name);
        if key.is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "member name must not be empty".to_string(),
            });
        }
        if self.staged.lookup.contains_key(&key) {
            return Err(EngineError::DuplicateName {
                name: name.to_string(),
                dimension: self.dim.name().to_string(),
            });
        }

        let id = MemberId(self.staged.next_id);
        self.staged.next_id += 1;
        self.staged.members.insert(
            id,
            MemberDef {
                id,
                name: name.trim().to_string(),
                aliases: Vec::new(),
                parents: Vec::new(),
                children: Vec::new(),
                level: 0,
                attributes: BTreeMap::new(),
                format: None,
            },
        );
        self.staged.order.push(id);
        self.staged.lookup.insert(key, id);

        if let Some(parent) = parent {
            self.add_parent(name, parent, weight)?;
        }
        Ok(id)
    }

    /// Attach `child` to an additional `parent` with the given edge weight.
    pub fn add_parent(
        &mut self,
        child: &str,
        parent: &str,
        weight: f64,
    ) -> Result<(), EngineError> {
        let cid = self.require(child)?;
        let pid = self.require(parent)?;
        if cid == pid || self.is_ancestor(cid, pid) {
            return Err(EngineError::CycleDetected {
                dimension: self.dim.name().to_string(),
                parent: parent.to_string(),
                child: child.to_string(),
            });
        }

        let pdef = self.staged.members.get_mut(&pid).expect("id is staged");
        match pdef.children.iter_mut().find(|(c, _)| *c == cid) {
            Some(edge) => edge.1 = weight,
            None => pdef.children.push((cid, weight)),
        }
        let cdef = self.staged.members.get_mut(&cid).expect("id is staged");
        if !cdef.parents.contains(&pid) {
            cdef.parents.push(pid);
        }
        Ok(())
    }

    /// Remove a member and all its edges. Referencing facts are
    /// cascade-deleted at commit.
    pub fn remove_member(&mut self, name: &str) -> Result<(), EngineError> {
        let id = self.require(name)?;
        let def = self.staged.members.remove(&id).expect("id is staged");

        self.staged.lookup.remove(&names::fold(&def.name));
        for alias in &def.aliases {
            self.staged.lookup.remove(&names::fold(alias));
        }
        self.staged.order.retain(|&m| m != id);
        for other in self.staged.members.values_mut() {
            other.parents.retain(|&p| p != id);
            other.children.retain(|&(c, _)| c != id);
        }
        for subset in self.staged.subsets.values_mut() {
            subset.members.retain(|&m| m != id);
        }
        Ok(())
    }

    /// Rename a member. The id is kept; the old name stops resolving unless
    /// it was separately registered as an alias.
    pub fn rename(&mut self, member: &str, new_name: &str) -> Result<(), EngineError> {
        let id = self.require(member)?;
        let new_key = names::fold(new_name);
        if new_key.is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "member name must not be empty".to_string(),
            });
        }
        if let Some(&existing) = self.staged.lookup.get(&new_key) {
            if existing != id {
                return Err(EngineError::DuplicateName {
                    name: new_name.to_string(),
                    dimension: self.dim.name().to_string(),
                });
            }
        }
        let def = self.staged.members.get_mut(&id).expect("id is staged");
        let old_key = names::fold(&def.name);
        // Keep the entry if the old spelling is also an alias.
        let old_is_alias = def.aliases.iter().any(|a| names::fold(a) == old_key);
        def.name = new_name.trim().to_string();
        if !old_is_alias {
            self.staged.lookup.remove(&old_key);
        }
        self.staged.lookup.insert(new_key, id);
        Ok(())
    }

    /// Register an alias. Aliases share the member-name namespace.
    pub fn add_alias(&mut self, member: &str, alias: &str) -> Result<(), EngineError> {
        let id = self.require(member)?;
        let key = names::fold(alias);
        if key.is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "alias must not be empty".to_string(),
            });
        }
        if let Some(&existing) = self.staged.lookup.get(&key) {
            if existing != id {
                return Err(EngineError::DuplicateName {
                    name: alias.to_string(),
                    dimension: self.dim.name().to_string(),
                });
            }
            return Ok(());
        }
        self.staged.lookup.insert(key, id);
        self.staged
            .members
            .get_mut(&id)
            .expect("id is staged")
            .aliases
            .push(alias.trim().to_string());
        Ok(())
    }

    pub fn remove_alias(&mut self, member: &str, alias: &str) -> Result<(), EngineError> {
        let id = self.require(member)?;
        let key = names::fold(alias);
        let def = self.staged.members.get_mut(&id).expect("id is staged");
        if names::fold(&def.name) == key {
            return Err(EngineError::InvalidOperation {
                detail: format!("'{alias}' is the member's name, not an alias"),
            });
        }
        def.aliases.retain(|a| names::fold(a) != key);
        if self.staged.lookup.get(&key) == Some(&id) {
            self.staged.lookup.remove(&key);
        }
        Ok(())
    }

    /// Update the weight of an existing `parent -> child` edge.
    pub fn set_weight(
        &mut self,
        parent: &str,
        child: &str,
        weight: f64,
    ) -> Result<(), EngineError> {
        let pid = self.require(parent)?;
        let cid = self.require(child)?;
        let pdef = self.staged.members.get_mut(&pid).expect("id is staged");
        let Some(edge) = pdef.children.iter_mut().find(|(c, _)| *c == cid) else {
            return Err(EngineError::InvalidOperation {
                detail: format!(
                    "no edge '{parent}' -> '{child}' in dimension '{}'",
                    self.dim.name()
                ),
            });
        };
        edge.1 = weight;
        Ok(())
    }

    /// Declare a typed attribute field.
    pub fn add_attribute(
        &mut self,
        name: &str,
        ty: AttributeType,
    ) -> Result<(), EngineError> {
        let key = names::fold(name);
        if key.is_empty() {
            return Err(EngineError::InvalidOperation {
                detail: "attribute name must not be empty".to_string(),
            });
        }
        if self.staged.attributes.contains_key(&key) {
            return Err(EngineError::DuplicateName {
                name: name.to_string(),
                dimension: self.dim.name().to_string(),
            });
        }
        self.staged.attributes.insert(
            key,
            AttributeDef {
                name: name.trim().to_string(),
                ty,
            },
        );
        Ok(())
    }

    /// Remove an attribute declaration and every stored value.
    pub fn remove_attribute(&mut self, name: &str) -> Result<(), EngineError> {
        let key = names::fold(name);
        if self.staged.attributes.remove(&key).is_none() {
            return Err(EngineError::UnknownMember {
                name: name.to_string(),
                dimension: Some(self.dim.name().to_string()),
            });
        }
        for member in self.staged.members.values_mut() {
            member.attributes.remove(&key);
        }
        Ok(())
    }

    /// Set an attribute value; the value must match the declared type.
    pub fn set_attribute(
        &mut self,
        member: &str,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), EngineError> {
        let id = self.require(member)?;
        let key = names::fold(attribute);
        let Some(decl) = self.staged.attributes.get(&key) else {
            return Err(EngineError::UnknownMember {
                name: attribute.to_string(),
                dimension: Some(self.dim.name().to_string()),
            });
        };
        if decl.ty != value.type_of() {
            return Err(EngineError::TypeError {
                detail: format!(
                    "attribute '{}' of dimension '{}' holds {:?} values",
                    decl.name,
                    self.dim.name(),
                    decl.ty
                ),
            });
        }
        self.staged
            .members
            .get_mut(&id)
            .expect("id is staged")
            .attributes
            .insert(key, value);
        Ok(())
    }

    pub fn clear_attribute(&mut self, member: &str, attribute: &str) -> Result<(), EngineError> {
        let id = self.require(member)?;
        let key = names::fold(attribute);
        self.staged
            .members
            .get_mut(&id)
            .expect("id is staged")
            .attributes
            .remove(&key);
        Ok(())
    }

    /// Define (or replace) a named ordered subset.
    pub fn define_subset(&mut self, name: &str, members: &[&str]) -> Result<(), EngineError> {
        let mut ids = Vec::with_capacity(members.len());
        for m in members {
            ids.push(self.require(m)?);
        }
        self.staged.subsets.insert(
            names::fold(name),
            SubsetDef {
                name: name.trim().to_string(),
                members: ids,
            },
        );
        Ok(())
    }

    pub fn remove_subset(&mut self, name: &str) -> Result<(), EngineError> {
        if self.staged.subsets.remove(&names::fold(name)).is_none() {
            return Err(EngineError::UnknownMember {
                name: name.to_string(),
                dimension: Some(self.dim.name().to_string()),
            });
        }
        Ok(())
    }

    /// Set or clear a member's display format string.
    pub fn set_format(&mut self, member: &str, format: Option<&str>) -> Result<(), EngineError> {
        let id = self.require(member)?;
        self.staged
            .members
            .get_mut(&id)
            .expect("id is staged")
            .format = format.map(|f| f.to_string());
        Ok(())
    }

    /// Discard all staged changes and end the session.
    pub fn rollback(self) {}

    fn require(&self, name: &str) -> Result<MemberId, EngineError> {
        self.staged
            .id_of(name)
            .ok_or_else(|| EngineError::UnknownMember {
                name: name.to_string(),
                dimension: Some(self.dim.name().to_string()),
            })
    }

    /// Is `ancestor` reachable upwards from `id`?
    fn is_ancestor(&self, ancestor: MemberId, id: MemberId) -> bool {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(m) = stack.pop() {
            if !seen.insert(m) {
                continue;
            }
            let Some(def) = self.staged.members.get(&m) else {
                continue;
            };
            for &p in &def.parents {
                if p == ancestor {
                    return true;
                }
                stack.push(p);
            }
        }
        false
    }
}

impl Drop for DimensionEdit {
    fn drop(&mut self) {
        if !self.done {
            self.dim.editing.store(false, Ordering::SeqCst);
        }
    }
}
