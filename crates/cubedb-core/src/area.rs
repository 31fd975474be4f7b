//! Bulk operations over a cube sub-space.
//!
//! An [`Area`] is the Cartesian product of per-dimension selectors: a single
//! member, a member set (subset, list, glob, attribute filter) or
//! unconstrained. Selected members may be aggregated; for storage-level
//! operations every selector is expanded to the union of its members' base
//! leaves.
//!
//! Mutations run as one logical batch: the cube's data version (and with it
//! cache invalidation) is bumped once at batch end, and an attached
//! persistence hook sees the writes bracketed by `begin_batch` /
//! `commit_batch`. A write rejected by an `OnEntry` rule is reported and
//! skipped; it never aborts the rest of the area operation.

use crate::cube::Cube;
use crate::dimension::MemberId;
use crate::error::EngineError;
use crate::resolver::ResolvedArea;

/// A writable sub-space of one cube.
pub struct Area<'a> {
    cube: &'a Cube,
    selectors: Vec<Option<Vec<MemberId>>>,
}

impl<'a> Area<'a> {
    pub(crate) fn new(cube: &'a Cube, resolved: ResolvedArea) -> Self {
        Self {
            cube,
            selectors: resolved.selectors,
        }
    }

    pub fn cube_name(&self) -> &str {
        self.cube.name()
    }

    /// Per-dimension base-member selectors: each selected member replaced by
    /// the base ids of its leaf expansion, deduplicated and sorted.
    fn base_selectors(&self) -> Vec<Option<Vec<MemberId>>> {
        let dims = self.cube.dimension_handles();
        self.selectors
            .iter()
            .enumerate()
            .map(|(d, selector)| {
                let members = selector.as_ref()?;
                let mut base: Vec<MemberId> = members
                    .iter()
                    .flat_map(|&m| {
                        dims[d]
                            .leaf_expansion(m)
                            .iter()
                            .map(|&(b, _)| b)
                            .collect::<Vec<_>>()
                    })
                    .collect();
                base.sort_unstable();
                base.dedup();
                Some(base)
            })
            .collect()
    }

    /// Stored facts inside the area, ascending by packed address.
    fn rows(&self) -> Vec<(Vec<MemberId>, f64)> {
        self.cube.facts_in_area(&self.base_selectors())
    }

    /// Existing `(member names, value)` pairs inside the area.
    pub fn items(&self) -> Vec<(Vec<String>, f64)> {
        self.rows()
            .into_iter()
            .map(|(addr, v)| (self.cube.address_names(&addr), v))
            .collect()
    }

    /// Existing addresses inside the area.
    pub fn addresses(&self) -> Vec<Vec<String>> {
        self.rows()
            .into_iter()
            .map(|(addr, _)| self.cube.address_names(&addr))
            .collect()
    }

    /// Number of stored facts inside the area.
    pub fn count(&self) -> usize {
        self.rows().len()
    }

    pub fn sum(&self) -> f64 {
        self.rows().into_iter().map(|(_, v)| v).sum()
    }

    pub fn min(&self) -> Option<f64> {
        self.rows().into_iter().map(|(_, v)| v).reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.rows().into_iter().map(|(_, v)| v).reduce(f64::max)
    }

    pub fn avg(&self) -> Option<f64> {
        let rows = self.rows();
        if rows.is_empty() {
            return None;
        }
        let n = rows.len() as f64;
        Some(rows.into_iter().map(|(_, v)| v).sum::<f64>() / n)
    }

    /// Write `value` across the area.
    ///
    /// With `expand_all` the full Cartesian product of base cells is written
    /// (re-creating cells that were previously deleted), guarded by the
    /// configured area-size limit. Without it only *existing* stored facts
    /// are overwritten. Returns the number of cells written.
    pub fn set_value(&self, value: f64, expand_all: bool) -> Result<usize, EngineError> {
        if !value.is_finite() {
            return Err(EngineError::TypeError {
                detail: format!("cell values must be finite, got {value}"),
            });
        }
        if expand_all {
            let base = self.full_base_lists()?;
            self.with_batch(|| {
                let mut written = 0usize;
                for addr in CartesianProduct::new(&base) {
                    if self.try_write(&addr, Some(value)) {
                        written += 1;
                    }
                }
                Ok(written)
            })
        } else {
            let rows = self.rows();
            self.with_batch(|| {
                let mut written = 0usize;
                for (addr, _) in rows {
                    if self.try_write(&addr, Some(value)) {
                        written += 1;
                    }
                }
                Ok(written)
            })
        }
    }

    /// Delete every stored fact inside the area. Returns the number removed.
    pub fn clear(&self) -> usize {
        let rows = self.rows();
        let removed = self
            .with_batch(|| {
                let mut removed = 0usize;
                for (addr, _) in rows {
                    if self.try_write(&addr, None) {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .unwrap_or(0);
        removed
    }

    /// Multiply every stored fact by `factor` (a factor of zero deletes).
    pub fn multiply(&self, factor: f64) -> Result<usize, EngineError> {
        if !factor.is_finite() {
            return Err(EngineError::TypeError {
                detail: format!("factor must be finite, got {factor}"),
            });
        }
        let rows = self.rows();
        self.with_batch(|| {
            let mut written = 0usize;
            for (addr, value) in rows {
                if self.try_write(&addr, Some(value * factor)) {
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    /// Add `delta` to every stored fact.
    pub fn increment(&self, delta: f64) -> Result<usize, EngineError> {
        if !delta.is_finite() {
            return Err(EngineError::TypeError {
                detail: format!("delta must be finite, got {delta}"),
            });
        }
        let rows = self.rows();
        self.with_batch(|| {
            let mut written = 0usize;
            for (addr, value) in rows {
                if self.try_write(&addr, Some(value + delta)) {
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    /// Copy `source`'s stored facts into this area, scaled by `factor`.
    ///
    /// The target area is cleared first. For every dimension where this area
    /// fixes a single base member, the copied fact's coordinate is rewritten
    /// to it; unconstrained dimensions carry the source coordinate through.
    /// Both areas must belong to the same cube shape (same dimension count).
    pub fn copy_from(&self, source: &Area<'_>, factor: f64) -> Result<usize, EngineError> {
        let dims = self.cube.dimension_handles();
        if source.selectors.len() != self.selectors.len() {
            return Err(EngineError::InvalidOperation {
                detail: "source and target areas have different dimensionality".to_string(),
            });
        }

        // Precompute the per-dimension rewrite, rejecting shapes the
        // operation cannot express.
        let mut rewrite: Vec<Option<MemberId>> = Vec::with_capacity(self.selectors.len());
        for (d, selector) in self.selectors.iter().enumerate() {
            match selector {
                None => rewrite.push(None),
                Some(members) if members.len() == 1 => {
                    let id = members[0];
                    if dims[d].member_level_by_id(id).unwrap_or(0) != 0 {
                        return Err(EngineError::InvalidOperation {
                            detail: format!(
                                "copy target fixes aggregated member '{}' in dimension '{}'",
                                dims[d].member_name(id).unwrap_or_default(),
                                dims[d].name()
                            ),
                        });
                    }
                    rewrite.push(Some(id));
                }
                Some(_) => {
                    return Err(EngineError::InvalidOperation {
                        detail: format!(
                            "copy target must fix a single member or leave dimension '{}' \
                             unconstrained",
                            dims[d].name()
                        ),
                    })
                }
            }
        }

        let rows = source.rows();
        self.clear();
        self.with_batch(|| {
            let mut written = 0usize;
            for (mut addr, value) in rows {
                for (d, fixed) in rewrite.iter().enumerate() {
                    if let Some(id) = fixed {
                        addr[d] = *id;
                    }
                }
                if self.try_write(&addr, Some(value * factor)) {
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Full base-member lists per dimension (unconstrained dimensions expand
    /// to every base member), checked against the area-size guardrail.
    fn full_base_lists(&self) -> Result<Vec<Vec<MemberId>>, EngineError> {
        let dims = self.cube.dimension_handles();
        let expanded = self.base_selectors();
        let mut lists = Vec::with_capacity(expanded.len());
        let mut cells: u64 = 1;
        for (d, selector) in expanded.into_iter().enumerate() {
            let list = match selector {
                Some(base) => base,
                None => dims[d].base_member_ids(),
            };
            cells = cells.saturating_mul(list.len() as u64);
            lists.push(list);
        }
        let limit = self.cube.config().max_area_cells;
        if cells > limit {
            return Err(EngineError::AreaTooLarge { cells, limit });
        }
        Ok(lists)
    }

    /// Write one cell, containing `OnEntry` rejections: a rejected write is
    /// reported and skipped.
    fn try_write(&self, addr: &[MemberId], value: Option<f64>) -> bool {
        match self.cube.write_base(addr, value) {
            Ok(()) => true,
            Err(err) => {
                self.cube
                    .report("rule_error", Some(addr), &format!("write rejected: {err}"));
                false
            }
        }
    }

    fn with_batch<T>(&self, f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
        self.cube.begin_batch();
        let result = f();
        self.cube.end_batch();
        result
    }
}

/// Odometer-style iterator over the product of per-dimension member lists.
struct CartesianProduct<'a> {
    lists: &'a [Vec<MemberId>],
    cursor: Vec<usize>,
    done: bool,
}

impl<'a> CartesianProduct<'a> {
    fn new(lists: &'a [Vec<MemberId>]) -> Self {
        let done = lists.iter().any(|l| l.is_empty());
        Self {
            lists,
            cursor: vec![0; lists.len()],
            done,
        }
    }
}

impl Iterator for CartesianProduct<'_> {
    type Item = Vec<MemberId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let addr: Vec<MemberId> = self
            .cursor
            .iter()
            .zip(self.lists.iter())
            .map(|(&i, list)| list[i])
            .collect();

        // Advance, rightmost dimension fastest.
        for d in (0..self.cursor.len()).rev() {
            self.cursor[d] += 1;
            if self.cursor[d] < self.lists[d].len() {
                return Some(addr);
            }
            self.cursor[d] = 0;
        }
        self.done = true;
        Some(addr)
    }
}
