//! Address and area resolution.
//!
//! A user-facing address is a list of string tokens. Accepted forms:
//!
//! - positional: one token per dimension, in cube order
//!   (`["Plan", "2021", "Q1", "North", "Total"]`);
//! - qualified: `"dimension:member"` (or `"<ordinal>:member"`), in any order;
//! - a mixture of both.
//!
//! Tokens may also be **set selectors**: `*`/`?` globs over member names,
//! explicit lists (`"Model S, Model X"`), subset names, and attribute
//! filters (`"dimension:attribute:value"`). A fully single-valued address is
//! a read/write target; a set-bearing address defines an area for bulk
//! operations.
//!
//! Binding rules: qualified tokens bind their dimension directly. If no
//! token is qualified and the token count equals the cube's arity, tokens
//! bind positionally (member names may legitimately repeat across
//! dimensions). Otherwise each unqualified token is resolved by unique name
//! search across the still-unbound dimensions; a name found in two of them
//! is `AmbiguousMember`. Dimensions left without a coordinate default to
//! their unique root for cell targets and to "unconstrained" for areas.

use std::sync::Arc;

use crate::dimension::{Dimension, MemberId};
use crate::error::EngineError;
use crate::names;

/// A resolved per-dimension coordinate selector.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CoordinateSpec {
    /// A single member (base or aggregated).
    Single(MemberId),
    /// A set selector: subset, list, glob or attribute filter result.
    Many(Vec<MemberId>),
    /// `*` — every member / unconstrained.
    All,
}

/// A fully resolved single-cell target.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedAddress {
    pub coords: Vec<MemberId>,
    /// Sum of the coordinates' hierarchy levels; 0 means base address.
    pub level: u32,
}

impl ResolvedAddress {
    pub fn is_base(&self) -> bool {
        self.level == 0
    }
}

/// A resolved area: per dimension either a member set or unconstrained.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedArea {
    pub selectors: Vec<Option<Vec<MemberId>>>,
}

pub(crate) struct Resolver<'a> {
    dims: &'a [Arc<Dimension>],
}

impl<'a> Resolver<'a> {
    pub fn new(dims: &'a [Arc<Dimension>]) -> Self {
        Self { dims }
    }

    /// Resolve to a single-cell target; omitted dimensions default to their
    /// unique root, set selectors are rejected (`*` also means "the root"
    /// here so wildcard reads roll up to the top).
    pub fn resolve_address(&self, tokens: &[&str]) -> Result<ResolvedAddress, EngineError> {
        let specs = self.resolve(tokens)?;
        let mut coords = Vec::with_capacity(self.dims.len());
        let mut level = 0u32;
        for (d, spec) in specs.into_iter().enumerate() {
            let id = match spec {
                Some(CoordinateSpec::Single(id)) => id,
                Some(CoordinateSpec::All) | None => self.default_root(d)?,
                Some(CoordinateSpec::Many(_)) => {
                    return Err(EngineError::InvalidOperation {
                        detail: format!(
                            "coordinate for dimension '{}' selects multiple members; \
                             use an area operation",
                            self.dims[d].name()
                        ),
                    })
                }
            };
            level += self.dims[d].member_level_by_id(id).unwrap_or(0);
            coords.push(id);
        }
        Ok(ResolvedAddress { coords, level })
    }

    /// Resolve to an area; omitted dimensions and `*` are unconstrained.
    pub fn resolve_area(&self, tokens: &[&str]) -> Result<ResolvedArea, EngineError> {
        let specs = self.resolve(tokens)?;
        let selectors = specs
            .into_iter()
            .map(|spec| match spec {
                Some(CoordinateSpec::Single(id)) => Some(vec![id]),
                Some(CoordinateSpec::Many(ids)) => Some(ids),
                Some(CoordinateSpec::All) | None => None,
            })
            .collect();
        Ok(ResolvedArea { selectors })
    }

    /// Resolve one member token for cursor shifts: unique name search across
    /// *all* dimensions, or the qualified form.
    pub fn resolve_member(&self, token: &str) -> Result<(usize, MemberId), EngineError> {
        if let Some((ordinal, rest)) = self.split_qualified(token) {
            let dim = &self.dims[ordinal];
            let id = dim
                .member_id(rest)
                .ok_or_else(|| EngineError::UnknownMember {
                    name: rest.to_string(),
                    dimension: Some(dim.name().to_string()),
                })?;
            return Ok((ordinal, id));
        }

        let mut hits: Vec<(usize, MemberId)> = Vec::new();
        for (d, dim) in self.dims.iter().enumerate() {
            if let Some(id) = dim.member_id(token) {
                hits.push((d, id));
            }
        }
        match hits.len() {
            0 => Err(EngineError::UnknownMember {
                name: token.to_string(),
                dimension: None,
            }),
            1 => Ok(hits[0]),
            _ => Err(EngineError::AmbiguousMember {
                name: token.to_string(),
                dimensions: hits
                    .iter()
                    .map(|&(d, _)| self.dims[d].name().to_string())
                    .collect(),
            }),
        }
    }

    /// Resolve one selector token independently of other bindings, for rule
    /// trigger compilation: qualified form, or unique search across all
    /// dimensions.
    pub fn resolve_selector(&self, token: &str) -> Result<(usize, CoordinateSpec), EngineError> {
        if let Some((ordinal, rest)) = self.split_qualified(token) {
            return Ok((ordinal, self.selector_in_dim(ordinal, rest)?));
        }
        let unbound = vec![None; self.dims.len()];
        self.search_selector(token, &unbound)
    }

    /// Display form of a coordinate tuple, for logs and error records.
    pub fn display(&self, coords: &[MemberId]) -> String {
        coords
            .iter()
            .enumerate()
            .map(|(d, &id)| {
                self.dims
                    .get(d)
                    .and_then(|dim| dim.member_name(id))
                    .unwrap_or_else(|| format!("#{}", id.raw()))
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    // ------------------------------------------------------------------
    // binding
    // ------------------------------------------------------------------

    /// Bind tokens to dimensions; `None` entries are unspecified.
    fn resolve(&self, tokens: &[&str]) -> Result<Vec<Option<CoordinateSpec>>, EngineError> {
        let mut bound: Vec<Option<CoordinateSpec>> = vec![None; self.dims.len()];
        let mut unqualified: Vec<&str> = Vec::new();

        for &token in tokens {
            match self.split_qualified(token) {
                Some((ordinal, rest)) => {
                    // A dimension used twice in one cube binds its first
                    // still-free occurrence; a repeated qualifier for the
                    // same single occurrence wins over the earlier one.
                    let slot = self
                        .ordinals_of(self.dims[ordinal].name())
                        .into_iter()
                        .find(|&d| bound[d].is_none())
                        .unwrap_or(ordinal);
                    bound[slot] = Some(self.selector_in_dim(slot, rest)?);
                }
                None => unqualified.push(token),
            }
        }

        let unbound: Vec<usize> = (0..self.dims.len())
            .filter(|&d| bound[d].is_none())
            .collect();

        if unqualified.len() == unbound.len() && tokens.len() == unqualified.len() {
            // Pure positional form.
            for (&token, &d) in unqualified.iter().zip(unbound.iter()) {
                bound[d] = Some(self.selector_in_dim(d, token)?);
            }
            return Ok(bound);
        }

        // Name-search form.
        for token in unqualified {
            let (d, spec) = self.search_selector(token, &bound)?;
            bound[d] = Some(spec);
        }
        Ok(bound)
    }

    fn default_root(&self, d: usize) -> Result<MemberId, EngineError> {
        self.dims[d]
            .unique_root_id()
            .ok_or_else(|| EngineError::UnderdefinedAddress {
                dimension: self.dims[d].name().to_string(),
            })
    }

    /// `"months:Mar"`, `"1:Mar"`, `"regions:area:North"` → (ordinal, rest).
    fn split_qualified<'t>(&self, token: &'t str) -> Option<(usize, &'t str)> {
        let pos = token.find(':')?;
        let prefix = token[..pos].trim();
        let rest = token[pos + 1..].trim();
        if rest.is_empty() {
            return None;
        }
        if let Ok(ordinal) = prefix.parse::<usize>() {
            if ordinal < self.dims.len() {
                return Some((ordinal, rest));
            }
        }
        let key = names::fold(prefix);
        self.dims
            .iter()
            .position(|dim| names::fold(dim.name()) == key)
            .map(|ordinal| (ordinal, rest))
    }

    fn ordinals_of(&self, name: &str) -> Vec<usize> {
        let key = names::fold(name);
        self.dims
            .iter()
            .enumerate()
            .filter(|(_, dim)| names::fold(dim.name()) == key)
            .map(|(d, _)| d)
            .collect()
    }

    /// Resolve a selector string inside a known dimension.
    fn selector_in_dim(&self, d: usize, raw: &str) -> Result<CoordinateSpec, EngineError> {
        let dim = &self.dims[d];
        let raw = raw.trim();

        if raw == "*" {
            return Ok(CoordinateSpec::All);
        }

        // Attribute filter leftover: "attribute:value" after the dimension
        // qualifier was stripped.
        if let Some(pos) = raw.find(':') {
            let attr = raw[..pos].trim();
            let value = raw[pos + 1..].trim();
            return Ok(CoordinateSpec::Many(
                dim.ids_matching_attribute_raw(attr, value)?,
            ));
        }

        if raw.contains(',') {
            let mut ids = Vec::new();
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let id = dim
                    .member_id(part)
                    .ok_or_else(|| EngineError::UnknownMember {
                        name: part.to_string(),
                        dimension: Some(dim.name().to_string()),
                    })?;
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            return Ok(CoordinateSpec::Many(ids));
        }

        if names::is_glob(raw) {
            return Ok(CoordinateSpec::Many(dim.ids_matching_glob(raw)));
        }

        if let Some(id) = dim.member_id(raw) {
            return Ok(CoordinateSpec::Single(id));
        }
        if let Some(ids) = dim.subset_ids(raw) {
            return Ok(CoordinateSpec::Many(ids));
        }
        Err(EngineError::UnknownMember {
            name: raw.to_string(),
            dimension: Some(dim.name().to_string()),
        })
    }

    /// Resolve an unqualified token by unique name search over the unbound
    /// dimensions.
    fn search_selector(
        &self,
        token: &str,
        bound: &[Option<CoordinateSpec>],
    ) -> Result<(usize, CoordinateSpec), EngineError> {
        let token = token.trim();
        let unbound: Vec<usize> = (0..self.dims.len())
            .filter(|&d| bound[d].is_none())
            .collect();

        if token == "*" {
            // Without a dimension there is nothing to anchor the wildcard to,
            // unless only one dimension is still open.
            if unbound.len() == 1 {
                return Ok((unbound[0], CoordinateSpec::All));
            }
            return Err(EngineError::AmbiguousMember {
                name: token.to_string(),
                dimensions: unbound
                    .iter()
                    .map(|&d| self.dims[d].name().to_string())
                    .collect(),
            });
        }

        // Lists anchor on their first element.
        if token.contains(',') {
            let first = token
                .split(',')
                .map(str::trim)
                .find(|p| !p.is_empty())
                .unwrap_or("");
            let d = self.search_one(first, &unbound)?;
            return Ok((d, self.selector_in_dim(d, token)?));
        }

        if names::is_glob(token) {
            let hits: Vec<usize> = unbound
                .iter()
                .copied()
                .filter(|&d| !self.dims[d].ids_matching_glob(token).is_empty())
                .collect();
            return match hits.len() {
                0 => Err(EngineError::UnknownMember {
                    name: token.to_string(),
                    dimension: None,
                }),
                1 => Ok((hits[0], self.selector_in_dim(hits[0], token)?)),
                _ => Err(EngineError::AmbiguousMember {
                    name: token.to_string(),
                    dimensions: hits
                        .iter()
                        .map(|&d| self.dims[d].name().to_string())
                        .collect(),
                }),
            };
        }

        let d = self.search_one(token, &unbound)?;
        Ok((d, self.selector_in_dim(d, token)?))
    }

    /// Find the single unbound dimension containing `name` as a member or
    /// subset.
    fn search_one(&self, name: &str, unbound: &[usize]) -> Result<usize, EngineError> {
        let mut member_hits: Vec<usize> = unbound
            .iter()
            .copied()
            .filter(|&d| self.dims[d].member_id(name).is_some())
            .collect();
        if member_hits.is_empty() {
            member_hits = unbound
                .iter()
                .copied()
                .filter(|&d| self.dims[d].subset_ids(name).is_some())
                .collect();
        }
        match member_hits.len() {
            0 => Err(EngineError::UnknownMember {
                name: name.to_string(),
                dimension: None,
            }),
            1 => Ok(member_hits[0]),
            _ => Err(EngineError::AmbiguousMember {
                name: name.to_string(),
                dimensions: member_hits
                    .iter()
                    .map(|&d| self.dims[d].name().to_string())
                    .collect(),
            }),
        }
    }
}
