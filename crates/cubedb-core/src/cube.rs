//! Cubes and the cell evaluation engine.
//!
//! A cube is an ordered tuple of dimensions plus a sparse fact store. A cell
//! read resolves to a general address and then runs:
//!
//! 1. result-cache lookup (validated against the cube's version stamps);
//! 2. one ordered pass over the registered rules whose scope is eligible for
//!    the address (`AllLevels` always, `BaseLevel` on base addresses,
//!    `AggregationLevel` on aggregated ones) — the first trigger match is
//!    invoked and its result classified;
//! 3. for base addresses, the stored fact (absent means `0.0`);
//! 4. for aggregated addresses, the weighted sum over stored facts inside
//!    the Cartesian product of the coordinates' leaf expansions, visiting
//!    only stored rows (inverted-index intersection) in ascending packed
//!    address order; a base-scope rule matching a visited row replaces the
//!    stored value;
//! 5. cache publication, unless the evaluation touched a volatile rule or
//!    produced a marker.
//!
//! Rule failures and recursion re-entry never abort evaluation of a
//! surrounding area; they yield the `#ERR` / `#REC` markers and are reported
//! to the error sink.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::area::Area;
use crate::cache::{ResultCache, VersionStamp};
use crate::cell::{CellCursor, EvalContext};
use crate::dimension::{Dimension, MemberId};
use crate::error::{EngineError, ErrorRecord};
use crate::facts::FactStore;
use crate::resolver::{CoordinateSpec, Resolver};
use crate::rules::{
    CompiledTrigger, Rule, RuleBody, RuleId, RuleResult, RuleScope, RuleSet, TriggerSelector,
};
use crate::{CellValue, Marker, Shared};

/// A pre-resolved cell address: one member id per cube dimension.
///
/// Resolving once through [`Cube::address`] and reusing the handle skips
/// name lookup on repeated access. Member ids are stable across structural
/// edits, so a handle stays valid as long as its members exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    coords: Vec<MemberId>,
}

impl Address {
    pub fn member_ids(&self) -> &[MemberId] {
        &self.coords
    }
}

/// A multi-dimensional table addressed by member tuples.
///
/// Cubes are created through [`crate::Database::add_cube`] and handed out as
/// `Arc<Cube>`. Reads take shared locks and may run in parallel; writes
/// serialize on the fact store's write lock.
pub struct Cube {
    name: String,
    dims: Vec<Arc<Dimension>>,
    shared: Arc<Shared>,
    facts: RwLock<FactStore>,
    rules: RwLock<RuleSet>,
    cache: ResultCache,
    data_version: AtomicU64,
    rules_version: AtomicU64,
    caching: AtomicBool,
    batch_depth: AtomicU64,
    counter_cells: AtomicU64,
    counter_rules: AtomicU64,
    counter_aggregated: AtomicU64,
}

impl std::fmt::Debug for Cube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cube")
            .field("name", &self.name)
            .field("dimensions", &self.dimension_names())
            .field("facts", &self.fact_count())
            .finish()
    }
}

impl Cube {
    pub(crate) fn new(name: &str, dims: Vec<Arc<Dimension>>, shared: Arc<Shared>) -> Self {
        let cache = ResultCache::new(shared.config.cache_capacity);
        let caching = shared.config.caching;
        Self {
            name: name.trim().to_string(),
            facts: RwLock::new(FactStore::new(dims.len())),
            dims,
            shared,
            rules: RwLock::new(RuleSet::default()),
            cache,
            data_version: AtomicU64::new(0),
            rules_version: AtomicU64::new(0),
            caching: AtomicBool::new(caching),
            batch_depth: AtomicU64::new(0),
            counter_cells: AtomicU64::new(0),
            counter_rules: AtomicU64::new(0),
            counter_aggregated: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension_count(&self) -> usize {
        self.dims.len()
    }

    pub fn dimension_names(&self) -> Vec<String> {
        self.dims.iter().map(|d| d.name().to_string()).collect()
    }

    pub(crate) fn dimension_handles(&self) -> &[Arc<Dimension>] {
        &self.dims
    }

    pub(crate) fn uses_dimension(&self, folded_name: &str) -> bool {
        self.dims
            .iter()
            .any(|d| crate::names::fold(d.name()) == folded_name)
    }

    /// Number of stored base facts.
    pub fn fact_count(&self) -> usize {
        self.facts.read().count()
    }

    /// Rough retained-bytes estimate of the fact store.
    pub fn size_estimate(&self) -> usize {
        self.facts.read().size_estimate()
    }

    // ------------------------------------------------------------------
    // read / write
    // ------------------------------------------------------------------

    /// Evaluate the cell at `address`.
    ///
    /// Returns the stored base fact, a hierarchical aggregation, a
    /// rule-computed value, `0.0` by default — or a contained `#ERR`/`#REC`
    /// marker.
    pub fn get(&self, address: &[&str]) -> Result<CellValue, EngineError> {
        let resolved = self.resolver().resolve_address(address)?;
        let ctx = EvalContext::new();
        Ok(self.evaluate(&ctx, &resolved.coords))
    }

    /// Like [`Self::get`], coerced to `f64` (markers and "no value" read as
    /// `0.0`).
    pub fn get_numeric(&self, address: &[&str]) -> Result<f64, EngineError> {
        Ok(self.get(address)?.numeric())
    }

    /// Write a base-level fact. Writing `0.0` removes the stored fact.
    pub fn set(&self, address: &[&str], value: f64) -> Result<(), EngineError> {
        if !value.is_finite() {
            return Err(EngineError::TypeError {
                detail: format!("cell values must be finite, got {value}"),
            });
        }
        let resolved = self.resolver().resolve_address(address)?;
        if !resolved.is_base() {
            return Err(EngineError::InvalidOperation {
                detail: format!(
                    "write to aggregated cell '{}' of cube '{}' is not supported",
                    self.resolver().display(&resolved.coords),
                    self.name
                ),
            });
        }
        self.write_base(&resolved.coords, Some(value))
    }

    /// Remove the fact at `address` (the explicit "no value" write).
    pub fn erase(&self, address: &[&str]) -> Result<(), EngineError> {
        let resolved = self.resolver().resolve_address(address)?;
        if !resolved.is_base() {
            return Err(EngineError::InvalidOperation {
                detail: format!(
                    "write to aggregated cell '{}' of cube '{}' is not supported",
                    self.resolver().display(&resolved.coords),
                    self.name
                ),
            });
        }
        self.write_base(&resolved.coords, None)
    }

    /// Remove all facts from the cube.
    pub fn clear(&self) {
        self.facts.write().clear();
        self.bump_data();
    }

    /// Resolve `address` once into a reusable handle.
    pub fn address(&self, address: &[&str]) -> Result<Address, EngineError> {
        let resolved = self.resolver().resolve_address(address)?;
        Ok(Address {
            coords: resolved.coords,
        })
    }

    /// Evaluate a pre-resolved address.
    pub fn get_at(&self, address: &Address) -> CellValue {
        let ctx = EvalContext::new();
        self.evaluate(&ctx, &address.coords)
    }

    /// Write a base-level fact at a pre-resolved address.
    pub fn set_at(&self, address: &Address, value: f64) -> Result<(), EngineError> {
        if !value.is_finite() {
            return Err(EngineError::TypeError {
                detail: format!("cell values must be finite, got {value}"),
            });
        }
        let aggregated = address
            .coords
            .iter()
            .enumerate()
            .any(|(d, &id)| self.dims[d].member_level_by_id(id).unwrap_or(0) > 0);
        if aggregated {
            return Err(EngineError::InvalidOperation {
                detail: format!(
                    "write to aggregated cell '{}' of cube '{}' is not supported",
                    self.resolver().display(&address.coords),
                    self.name
                ),
            });
        }
        self.write_base(&address.coords, Some(value))
    }

    /// An [`Area`] over a partial address; omitted dimensions and `*` are
    /// unconstrained, tokens may be set selectors.
    pub fn area(&self, address: &[&str]) -> Result<Area<'_>, EngineError> {
        let resolved = self.resolver().resolve_area(address)?;
        Ok(Area::new(self, resolved))
    }

    /// All stored facts as `(member names, value)`, ascending by packed
    /// address.
    pub fn facts(&self) -> Vec<(Vec<String>, f64)> {
        self.facts
            .read()
            .all_sorted()
            .into_iter()
            .map(|(addr, v)| (self.address_names(&addr), v))
            .collect()
    }

    // ------------------------------------------------------------------
    // rules
    // ------------------------------------------------------------------

    /// Register a rule; its trigger is compiled against the current
    /// structure. Returns the id for [`Self::unregister_rule`].
    pub fn register_rule(&self, rule: Rule) -> Result<RuleId, EngineError> {
        let resolver = self.resolver();
        let mut trigger = CompiledTrigger::default();
        for token in &rule.trigger {
            let (dim, spec) = resolver.resolve_selector(token)?;
            let selector = match spec {
                CoordinateSpec::Single(id) => TriggerSelector::Member(id),
                CoordinateSpec::All => TriggerSelector::Any,
                CoordinateSpec::Many(mut ids) => {
                    ids.sort_unstable();
                    ids.dedup();
                    TriggerSelector::Members(ids)
                }
            };
            trigger.selectors.retain(|&(d, _)| d != dim);
            trigger.selectors.push((dim, selector));
        }
        let id = self.rules.write().register(&rule, trigger);
        self.rules_version.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    /// Remove a rule. Cache entries that depended on it become unreachable
    /// through the rules-version stamp.
    pub fn unregister_rule(&self, id: RuleId) -> bool {
        let removed = self.rules.write().unregister(id);
        if removed {
            self.rules_version.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Invoke the first `Command` rule carrying `keyword` that matches
    /// `address`.
    pub fn command(&self, keyword: &str, address: &[&str]) -> Result<CellValue, EngineError> {
        let resolved = self.resolver().resolve_address(address)?;
        let matched = {
            let rules = self.rules.read();
            rules
                .first_command(keyword, &resolved.coords)
                .map(|r| (r.volatile, r.name.clone(), r.body.clone()))
        };
        let Some((volatile, name, body)) = matched else {
            return Err(EngineError::InvalidOperation {
                detail: format!("no command rule for keyword '{keyword}' on cube '{}'", self.name),
            });
        };
        let ctx = EvalContext::new();
        if volatile {
            ctx.mark_volatile();
        }
        self.counter_rules.fetch_add(1, Ordering::Relaxed);
        match self.invoke_rule(&ctx, &resolved.coords, &name, &body) {
            RuleResult::Value(v) if ctx.error_count() == 0 => Ok(CellValue::Value(v)),
            RuleResult::Value(_) => Ok(CellValue::Marker(ctx.last_marker())),
            RuleResult::NoValue | RuleResult::Continue => Ok(CellValue::NoValue),
            RuleResult::Error(detail) => {
                self.report("rule_error", Some(&resolved.coords), &detail);
                Ok(CellValue::Marker(Marker::Error))
            }
        }
    }

    // ------------------------------------------------------------------
    // caching & counters
    // ------------------------------------------------------------------

    /// Whether evaluated results are memoized. On by default.
    pub fn caching(&self) -> bool {
        self.caching.load(Ordering::SeqCst)
    }

    pub fn set_caching(&self, enabled: bool) {
        self.caching.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.cache.clear();
        }
    }

    /// Cell requests served (including nested rule reads).
    pub fn counter_cell_requests(&self) -> u64 {
        self.counter_cells.load(Ordering::Relaxed)
    }

    /// Rule invocations executed.
    pub fn counter_rule_invocations(&self) -> u64 {
        self.counter_rules.load(Ordering::Relaxed)
    }

    /// Stored facts visited by aggregation walks.
    pub fn counter_aggregated_facts(&self) -> u64 {
        self.counter_aggregated.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.counter_cells.store(0, Ordering::Relaxed);
        self.counter_rules.store(0, Ordering::Relaxed);
        self.counter_aggregated.store(0, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // engine internals
    // ------------------------------------------------------------------

    pub(crate) fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.dims)
    }

    pub(crate) fn resolve_member(&self, token: &str) -> Result<(usize, MemberId), EngineError> {
        self.resolver().resolve_member(token)
    }

    pub(crate) fn address_names(&self, coords: &[MemberId]) -> Vec<String> {
        self.dims
            .iter()
            .zip(coords.iter())
            .map(|(dim, &id)| dim.member_name(id).unwrap_or_default())
            .collect()
    }

    fn structure_stamp(&self) -> u64 {
        self.dims.iter().map(|d| d.structure_version()).sum()
    }

    fn stamp(&self) -> VersionStamp {
        VersionStamp {
            structure: self.structure_stamp(),
            rules: self.rules_version.load(Ordering::SeqCst),
            data: self.data_version.load(Ordering::SeqCst),
        }
    }

    fn bump_data(&self) {
        if self.batch_depth.load(Ordering::SeqCst) == 0 {
            self.data_version.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Start a logical write batch: the data-version bump (and with it cache
    /// invalidation) is deferred until the matching [`Self::end_batch`].
    pub(crate) fn begin_batch(&self) {
        if self.batch_depth.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(hook) = self.hook() {
                if let Err(err) = hook.begin_batch() {
                    self.report("persistence", None, &format!("begin_batch failed: {err}"));
                }
            }
        }
    }

    pub(crate) fn end_batch(&self) {
        if self.batch_depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.data_version.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.hook() {
                if let Err(err) = hook.commit_batch() {
                    self.report("persistence", None, &format!("commit_batch failed: {err}"));
                }
            }
        }
    }

    fn hook(&self) -> Option<Arc<dyn crate::persist::PersistenceHook>> {
        self.shared.hook.read().clone()
    }

    pub(crate) fn config(&self) -> &crate::EngineConfig {
        &self.shared.config
    }

    /// Write or delete one base fact.
    ///
    /// A matching `OnEntry` rule runs against the freshly stored value and
    /// may rewrite it (`Value`), reject the write (`Error` — the previous
    /// value is restored and the error surfaces), or accept it.
    pub(crate) fn write_base(
        &self,
        coords: &[MemberId],
        value: Option<f64>,
    ) -> Result<(), EngineError> {
        let mut value = value.filter(|v| *v != 0.0);
        let store = |facts: &mut FactStore, value: Option<f64>| match value {
            Some(v) => facts.set(coords, v),
            None => {
                facts.remove(coords);
            }
        };

        let prior = self.facts.read().get(coords);
        store(&mut self.facts.write(), value);
        self.bump_data();

        let matched = {
            let rules = self.rules.read();
            rules
                .first_match(&[RuleScope::OnEntry], coords)
                .map(|r| (r.name.clone(), r.body.clone()))
        };
        if let Some((name, body)) = matched {
            let ctx = EvalContext::new();
            self.counter_rules.fetch_add(1, Ordering::Relaxed);
            match self.invoke_rule(&ctx, coords, &name, &body) {
                RuleResult::Value(v) => {
                    value = Some(v).filter(|v| *v != 0.0);
                    store(&mut self.facts.write(), value);
                    self.bump_data();
                }
                RuleResult::NoValue | RuleResult::Continue => {}
                RuleResult::Error(detail) => {
                    store(&mut self.facts.write(), prior);
                    self.bump_data();
                    self.report("rule_error", Some(coords), &detail);
                    return Err(EngineError::Rule { detail });
                }
            }
        }

        if let Some(hook) = self.hook() {
            if let Err(err) = hook.append_fact_write(&self.name, coords, value) {
                self.report("persistence", Some(coords), &format!("journal append failed: {err}"));
            }
        }
        Ok(())
    }

    /// Cascade-delete every fact referencing one of `ids` at any ordinal of
    /// `dimension`. Returns the number of deleted facts.
    pub(crate) fn cascade_remove(&self, dimension: &str, ids: &HashSet<MemberId>) -> usize {
        let folded = crate::names::fold(dimension);
        let ordinals: Vec<usize> = self
            .dims
            .iter()
            .enumerate()
            .filter(|(_, d)| crate::names::fold(d.name()) == folded)
            .map(|(i, _)| i)
            .collect();
        let mut removed = 0usize;
        {
            let mut facts = self.facts.write();
            for ordinal in ordinals {
                removed += facts.remove_members(ordinal, ids).len();
            }
        }
        if removed > 0 {
            self.bump_data();
        }
        removed
    }

    pub(crate) fn facts_by_id(&self) -> Vec<(Vec<MemberId>, f64)> {
        self.facts.read().all_sorted()
    }

    /// Install a fact during snapshot restore / journal replay, bypassing
    /// `OnEntry` rules and the persistence hook.
    pub(crate) fn load_fact(&self, coords: &[MemberId], value: Option<f64>) {
        {
            let mut facts = self.facts.write();
            match value {
                Some(v) => facts.set(coords, v),
                None => {
                    facts.remove(coords);
                }
            }
        }
        self.bump_data();
    }

    /// Stored facts intersecting the per-dimension base-member selectors.
    pub(crate) fn facts_in_area(
        &self,
        selectors: &[Option<Vec<MemberId>>],
    ) -> Vec<(Vec<MemberId>, f64)> {
        let facts = self.facts.read();
        let borrowed: Vec<Option<&[MemberId]>> = selectors
            .iter()
            .map(|s| s.as_deref())
            .collect();
        let slots = facts.area_slots(&borrowed);
        facts.collect_sorted(&slots)
    }

    /// The cell evaluation engine. Never fails: contained errors come back
    /// as markers.
    pub(crate) fn evaluate(&self, ctx: &EvalContext, coords: &[MemberId]) -> CellValue {
        self.counter_cells.fetch_add(1, Ordering::Relaxed);
        if !ctx.enter(coords) {
            ctx.mark_errored(Marker::Recursion);
            self.report("rule_recursion", Some(coords), "evaluation re-entered its own address");
            return CellValue::Marker(Marker::Recursion);
        }
        let result = self.evaluate_inner(ctx, coords);
        ctx.leave(coords);
        result
    }

    fn evaluate_inner(&self, ctx: &EvalContext, coords: &[MemberId]) -> CellValue {
        let stamp = self.stamp();
        if self.caching() {
            if let Some(value) = self.cache.lookup(coords, stamp) {
                return value;
            }
        }

        let level: u32 = coords
            .iter()
            .enumerate()
            .map(|(d, &id)| self.dims[d].member_level_by_id(id).unwrap_or(0))
            .sum();
        let scopes = if level == 0 {
            [RuleScope::AllLevels, RuleScope::BaseLevel]
        } else {
            [RuleScope::AllLevels, RuleScope::AggregationLevel]
        };

        let matched = {
            let rules = self.rules.read();
            rules
                .first_match(&scopes, coords)
                .map(|r| (r.volatile, r.name.clone(), r.body.clone()))
        };
        if let Some((volatile, name, body)) = matched {
            if volatile {
                ctx.mark_volatile();
            }
            self.counter_rules.fetch_add(1, Ordering::Relaxed);
            let errors_before = ctx.error_count();
            match self.invoke_rule(ctx, coords, &name, &body) {
                RuleResult::Value(v) => {
                    // A marker produced inside the rule (recursion, nested
                    // failure) taints this cell even when the rule coerced
                    // it to a number.
                    if ctx.error_count() > errors_before {
                        return CellValue::Marker(ctx.last_marker());
                    }
                    let out = CellValue::Value(v);
                    self.publish(ctx, coords, out, stamp);
                    return out;
                }
                RuleResult::NoValue => {
                    if ctx.error_count() > errors_before {
                        return CellValue::Marker(ctx.last_marker());
                    }
                    self.publish(ctx, coords, CellValue::NoValue, stamp);
                    return CellValue::NoValue;
                }
                RuleResult::Error(detail) => {
                    ctx.mark_errored(Marker::Error);
                    self.report("rule_error", Some(coords), &detail);
                    return CellValue::Marker(Marker::Error);
                }
                RuleResult::Continue => {}
            }
        }

        let out = if level == 0 {
            CellValue::Value(self.facts.read().get(coords).unwrap_or(0.0))
        } else {
            match self.aggregate(ctx, coords) {
                Ok(total) => CellValue::Value(total),
                Err(marker) => {
                    ctx.mark_errored(marker);
                    return CellValue::Marker(marker);
                }
            }
        };
        self.publish(ctx, coords, out, stamp);
        out
    }

    /// Weighted sum over the stored facts inside the address's leaf
    /// expansion product. `Err` carries a marker produced by a leaf rule.
    fn aggregate(&self, ctx: &EvalContext, coords: &[MemberId]) -> Result<f64, Marker> {
        let mut selectors: Vec<Option<Vec<MemberId>>> = Vec::with_capacity(self.dims.len());
        let mut weights: Vec<HashMap<MemberId, f64>> = Vec::with_capacity(self.dims.len());
        for (d, &id) in coords.iter().enumerate() {
            let expansion = self.dims[d].leaf_expansion(id);
            if expansion.is_empty() {
                return Ok(0.0);
            }
            selectors.push(Some(expansion.iter().map(|&(b, _)| b).collect()));
            weights.push(expansion.iter().copied().collect());
        }

        let rows = self.facts_in_area(&selectors);
        self.counter_aggregated
            .fetch_add(rows.len() as u64, Ordering::Relaxed);

        let leaf_rules = self
            .rules
            .read()
            .has_any(&[RuleScope::AllLevels, RuleScope::BaseLevel]);

        let mut total = 0.0;
        'rows: for (addr, stored) in rows {
            let mut weight = 1.0;
            for (d, member) in addr.iter().enumerate() {
                let Some(w) = weights[d].get(member) else {
                    continue 'rows;
                };
                weight *= w;
            }

            let mut value = stored;
            if leaf_rules {
                let matched = {
                    let rules = self.rules.read();
                    rules
                        .first_match(&[RuleScope::AllLevels, RuleScope::BaseLevel], &addr)
                        .map(|r| (r.volatile, r.name.clone(), r.body.clone()))
                };
                if let Some((volatile, name, body)) = matched {
                    if volatile {
                        ctx.mark_volatile();
                    }
                    if !ctx.enter(&addr) {
                        self.report(
                            "rule_recursion",
                            Some(&addr),
                            "leaf evaluation re-entered its own address",
                        );
                        return Err(Marker::Recursion);
                    }
                    self.counter_rules.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.invoke_rule(ctx, &addr, &name, &body);
                    ctx.leave(&addr);
                    match outcome {
                        RuleResult::Value(v) => value = v,
                        RuleResult::NoValue => continue 'rows,
                        RuleResult::Continue => {}
                        RuleResult::Error(detail) => {
                            self.report("rule_error", Some(&addr), &detail);
                            return Err(Marker::Error);
                        }
                    }
                }
            }
            total += weight * value;
        }
        Ok(total)
    }

    fn invoke_rule(
        &self,
        ctx: &EvalContext,
        coords: &[MemberId],
        name: &str,
        body: &Arc<RuleBody>,
    ) -> RuleResult {
        let cursor = CellCursor::new(self, coords.to_vec(), ctx);
        let call = body.as_ref();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| call(&cursor)));
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => RuleResult::Error(err.to_string()),
            Err(_) => RuleResult::Error(format!("rule '{name}' panicked")),
        }
    }

    fn publish(&self, ctx: &EvalContext, coords: &[MemberId], value: CellValue, stamp: VersionStamp) {
        if !self.caching() || ctx.volatile() || ctx.error_count() > 0 {
            return;
        }
        if matches!(value, CellValue::Marker(_)) {
            return;
        }
        // A write may have landed while this cell was being computed; the
        // stale result must not be published under the old stamp either.
        if stamp != self.stamp() {
            return;
        }
        self.cache.publish(coords.to_vec(), value, stamp);
    }

    pub(crate) fn report(&self, kind: &'static str, coords: Option<&[MemberId]>, detail: &str) {
        let record = ErrorRecord {
            kind,
            cube: Some(self.name.clone()),
            address: coords.map(|c| self.resolver().display(c)),
            detail: detail.to_string(),
        };
        tracing::warn!(
            kind,
            cube = %self.name,
            address = record.address.as_deref().unwrap_or(""),
            "{detail}"
        );
        let sink = self.shared.sink.read().clone();
        (sink.as_ref())(&record);
    }
}
