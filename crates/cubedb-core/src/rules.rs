//! User-defined rules: triggers, scopes, and the per-cube registry.
//!
//! A rule binds a callable to a trigger pattern over cell addresses. The
//! trigger is a conjunction of per-dimension selectors (explicit member,
//! subset, attribute filter, wildcard, or "any"); it is compiled to member-id
//! sets when the rule is registered. Rules form an ordered list per cube and
//! the first rule whose scope is eligible and whose trigger admits the
//! address is invoked.

use std::sync::Arc;

use crate::cell::CellCursor;
use crate::dimension::MemberId;
use crate::error::EngineError;
use crate::names;

/// Which evaluation phase a rule participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Eligible on every cell read, base or aggregated.
    AllLevels,
    /// Eligible only on base-level cells (including per-leaf evaluation
    /// during an aggregation walk, where a match replaces the stored fact).
    BaseLevel,
    /// Eligible only when the target address has at least one aggregated
    /// coordinate; runs before the leaf walk and preempts the sum.
    AggregationLevel,
    /// Not part of read evaluation: invoked on a matching base write and may
    /// rewrite or reject the value.
    OnEntry,
    /// Invoked only through [`crate::Cube::command`].
    Command,
}

/// What a rule callable produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleResult {
    /// A final numeric value for the current phase.
    Value(f64),
    /// The explicit "no value" result.
    NoValue,
    /// Proceed as if no rule had matched.
    Continue,
    /// The rule could not produce a result; the cell shows `#ERR`.
    Error(String),
}

/// Handle for unregistering a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(u64);

impl RuleId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// The rule callable ABI. Returning `Err` is equivalent to
/// `Ok(RuleResult::Error(..))`, so rule bodies can use `?` freely.
pub type RuleBody = dyn Fn(&CellCursor<'_>) -> Result<RuleResult, EngineError> + Send + Sync;

/// A rule definition, built by the caller and registered on a cube.
#[derive(Clone)]
pub struct Rule {
    pub(crate) name: String,
    pub(crate) trigger: Vec<String>,
    pub(crate) scope: RuleScope,
    pub(crate) keywords: Vec<String>,
    pub(crate) volatile: bool,
    pub(crate) body: Arc<RuleBody>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("scope", &self.scope)
            .field("volatile", &self.volatile)
            .finish()
    }
}

impl Rule {
    pub fn new(
        name: &str,
        trigger: &[&str],
        scope: RuleScope,
        body: impl Fn(&CellCursor<'_>) -> Result<RuleResult, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            trigger: trigger.iter().map(|t| t.to_string()).collect(),
            scope,
            keywords: Vec::new(),
            volatile: false,
            body: Arc::new(body),
        }
    }

    /// Mark the rule volatile: any evaluation that invoked it is excluded
    /// from the result cache.
    pub fn volatile(mut self, volatile: bool) -> Self {
        self.volatile = volatile;
        self
    }

    /// Command keywords, for `RuleScope::Command` rules.
    pub fn keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| names::fold(k)).collect();
        self
    }
}

/// A per-dimension trigger selector, compiled to ids at registration.
#[derive(Debug, Clone)]
pub(crate) enum TriggerSelector {
    Any,
    Member(MemberId),
    /// Sorted ascending for binary search.
    Members(Vec<MemberId>),
}

impl TriggerSelector {
    fn admits(&self, id: MemberId) -> bool {
        match self {
            TriggerSelector::Any => true,
            TriggerSelector::Member(m) => *m == id,
            TriggerSelector::Members(set) => set.binary_search(&id).is_ok(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CompiledTrigger {
    /// `(dimension ordinal, selector)`; unmentioned dimensions match any.
    pub selectors: Vec<(usize, TriggerSelector)>,
}

impl CompiledTrigger {
    pub fn matches(&self, addr: &[MemberId]) -> bool {
        self.selectors
            .iter()
            .all(|(d, sel)| addr.get(*d).map(|&id| sel.admits(id)).unwrap_or(false))
    }
}

pub(crate) struct CompiledRule {
    pub id: RuleId,
    pub name: String,
    pub scope: RuleScope,
    pub volatile: bool,
    pub keywords: Vec<String>,
    pub trigger: CompiledTrigger,
    pub body: Arc<RuleBody>,
}

/// Ordered rule registry for one cube.
#[derive(Default)]
pub(crate) struct RuleSet {
    rules: Vec<CompiledRule>,
    next_id: u64,
    counts: [usize; 5],
}

fn scope_slot(scope: RuleScope) -> usize {
    match scope {
        RuleScope::AllLevels => 0,
        RuleScope::BaseLevel => 1,
        RuleScope::AggregationLevel => 2,
        RuleScope::OnEntry => 3,
        RuleScope::Command => 4,
    }
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn register(
        &mut self,
        rule: &Rule,
        trigger: CompiledTrigger,
    ) -> RuleId {
        let id = RuleId(self.next_id);
        self.next_id += 1;
        self.counts[scope_slot(rule.scope)] += 1;
        self.rules.push(CompiledRule {
            id,
            name: rule.name.clone(),
            scope: rule.scope,
            volatile: rule.volatile,
            keywords: rule.keywords.clone(),
            trigger,
            body: rule.body.clone(),
        });
        id
    }

    pub fn unregister(&mut self, id: RuleId) -> bool {
        let Some(pos) = self.rules.iter().position(|r| r.id == id) else {
            return false;
        };
        let removed = self.rules.remove(pos);
        self.counts[scope_slot(removed.scope)] -= 1;
        true
    }

    /// Any rule registered with one of `scopes`? Cheap pre-check so the
    /// aggregation walk can skip per-leaf matching entirely.
    pub fn has_any(&self, scopes: &[RuleScope]) -> bool {
        scopes.iter().any(|&s| self.counts[scope_slot(s)] > 0)
    }

    /// First rule, in registration order, whose scope is one of `scopes` and
    /// whose trigger admits `addr`.
    pub fn first_match(&self, scopes: &[RuleScope], addr: &[MemberId]) -> Option<&CompiledRule> {
        if !self.has_any(scopes) {
            return None;
        }
        self.rules
            .iter()
            .find(|r| scopes.contains(&r.scope) && r.trigger.matches(addr))
    }

    /// First command rule carrying `keyword` whose trigger admits `addr`.
    pub fn first_command(&self, keyword: &str, addr: &[MemberId]) -> Option<&CompiledRule> {
        let keyword = names::fold(keyword);
        self.rules.iter().find(|r| {
            r.scope == RuleScope::Command
                && r.keywords.iter().any(|k| *k == keyword)
                && r.trigger.matches(addr)
        })
    }
}
