//! The cell cursor handed to rule callables.
//!
//! A cursor is a transient pointer to one cell of a cube, bound to the
//! evaluation context of the read that invoked the rule. Shifting a
//! coordinate (`c.at("Actual")`) returns a *new* cursor; reading forces
//! evaluation through the engine, so rules can freely reference other cells
//! (including rule-computed ones). Arithmetic operators are defined on
//! cursor references and behave like an `f64`.
//!
//! The shared context tracks the set of addresses currently being evaluated
//! on this stack: re-entering one of them is the recursion failure and
//! produces the `#REC` marker instead of looping. It also records whether a
//! volatile rule ran or an error marker was produced, which blocks cache
//! publication for every address on the stack.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::cube::Cube;
use crate::dimension::MemberId;
use crate::error::EngineError;
use crate::names;
use crate::CellValue;

/// Per-read evaluation state shared by every cursor on one stack.
#[derive(Default)]
pub(crate) struct EvalContext {
    in_flight: RefCell<HashSet<Vec<MemberId>>>,
    volatile: Cell<bool>,
    errors: Cell<u32>,
    last_marker: Cell<Option<crate::Marker>>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when `addr` is already being evaluated on this stack.
    pub fn enter(&self, addr: &[MemberId]) -> bool {
        self.in_flight.borrow_mut().insert(addr.to_vec())
    }

    pub fn leave(&self, addr: &[MemberId]) {
        self.in_flight.borrow_mut().remove(addr);
    }

    pub fn mark_volatile(&self) {
        self.volatile.set(true);
    }

    pub fn volatile(&self) -> bool {
        self.volatile.get()
    }

    pub fn mark_errored(&self, marker: crate::Marker) {
        self.errors.set(self.errors.get() + 1);
        self.last_marker.set(Some(marker));
    }

    pub fn error_count(&self) -> u32 {
        self.errors.get()
    }

    pub fn last_marker(&self) -> crate::Marker {
        self.last_marker.get().unwrap_or(crate::Marker::Error)
    }
}

/// An immutable pointer to a cell, usable as a number.
pub struct CellCursor<'a> {
    cube: &'a Cube,
    coords: Vec<MemberId>,
    ctx: &'a EvalContext,
}

impl<'a> CellCursor<'a> {
    pub(crate) fn new(cube: &'a Cube, coords: Vec<MemberId>, ctx: &'a EvalContext) -> Self {
        Self { cube, coords, ctx }
    }

    /// A new cursor with one coordinate shifted to `member`.
    ///
    /// `member` is a plain member name (resolved by unique name search
    /// across the cube's dimensions) or the `"dimension:member"` form.
    pub fn at(&self, member: &str) -> Result<CellCursor<'a>, EngineError> {
        let (dim, id) = self.cube.resolve_member(member)?;
        let mut coords = self.coords.clone();
        coords[dim] = id;
        Ok(CellCursor {
            cube: self.cube,
            coords,
            ctx: self.ctx,
        })
    }

    /// Evaluate the cell this cursor points at.
    pub fn value(&self) -> CellValue {
        self.cube.evaluate(self.ctx, &self.coords)
    }

    /// Evaluate and coerce to a number; "no value" and markers read as 0.0.
    pub fn numeric(&self) -> f64 {
        self.value().numeric()
    }

    /// The cursor's current member of `dimension`.
    pub fn member(&self, dimension: &str) -> Result<String, EngineError> {
        let key = names::fold(dimension);
        let Some(dim_idx) = self
            .cube
            .dimension_handles()
            .iter()
            .position(|d| names::fold(d.name()) == key)
        else {
            return Err(EngineError::UnknownMember {
                name: dimension.to_string(),
                dimension: None,
            });
        };
        Ok(self.cube.dimension_handles()[dim_idx]
            .member_name(self.coords[dim_idx])
            .unwrap_or_default())
    }

    /// Member names of the cursor's address, in cube order.
    pub fn address(&self) -> Vec<String> {
        self.cube
            .dimension_handles()
            .iter()
            .zip(self.coords.iter())
            .map(|(dim, &id)| dim.member_name(id).unwrap_or_default())
            .collect()
    }

    pub fn cube_name(&self) -> &str {
        self.cube.name()
    }
}

impl std::fmt::Debug for CellCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CellCursor({}: {})", self.cube.name(), self.address().join("/"))
    }
}

// ----------------------------------------------------------------------
// scalar behaviour
// ----------------------------------------------------------------------

impl Add<f64> for &CellCursor<'_> {
    type Output = f64;
    fn add(self, rhs: f64) -> f64 {
        self.numeric() + rhs
    }
}

impl Add<&CellCursor<'_>> for f64 {
    type Output = f64;
    fn add(self, rhs: &CellCursor<'_>) -> f64 {
        self + rhs.numeric()
    }
}

impl Add<&CellCursor<'_>> for &CellCursor<'_> {
    type Output = f64;
    fn add(self, rhs: &CellCursor<'_>) -> f64 {
        self.numeric() + rhs.numeric()
    }
}

impl Sub<f64> for &CellCursor<'_> {
    type Output = f64;
    fn sub(self, rhs: f64) -> f64 {
        self.numeric() - rhs
    }
}

impl Sub<&CellCursor<'_>> for f64 {
    type Output = f64;
    fn sub(self, rhs: &CellCursor<'_>) -> f64 {
        self - rhs.numeric()
    }
}

impl Sub<&CellCursor<'_>> for &CellCursor<'_> {
    type Output = f64;
    fn sub(self, rhs: &CellCursor<'_>) -> f64 {
        self.numeric() - rhs.numeric()
    }
}

impl Mul<f64> for &CellCursor<'_> {
    type Output = f64;
    fn mul(self, rhs: f64) -> f64 {
        self.numeric() * rhs
    }
}

impl Mul<&CellCursor<'_>> for f64 {
    type Output = f64;
    fn mul(self, rhs: &CellCursor<'_>) -> f64 {
        self * rhs.numeric()
    }
}

impl Mul<&CellCursor<'_>> for &CellCursor<'_> {
    type Output = f64;
    fn mul(self, rhs: &CellCursor<'_>) -> f64 {
        self.numeric() * rhs.numeric()
    }
}

impl Div<f64> for &CellCursor<'_> {
    type Output = f64;
    fn div(self, rhs: f64) -> f64 {
        self.numeric() / rhs
    }
}

impl Div<&CellCursor<'_>> for f64 {
    type Output = f64;
    fn div(self, rhs: &CellCursor<'_>) -> f64 {
        self / rhs.numeric()
    }
}

impl Div<&CellCursor<'_>> for &CellCursor<'_> {
    type Output = f64;
    fn div(self, rhs: &CellCursor<'_>) -> f64 {
        self.numeric() / rhs.numeric()
    }
}

impl Neg for &CellCursor<'_> {
    type Output = f64;
    fn neg(self) -> f64 {
        -self.numeric()
    }
}

impl PartialEq<f64> for CellCursor<'_> {
    fn eq(&self, other: &f64) -> bool {
        self.numeric() == *other
    }
}

impl PartialOrd<f64> for CellCursor<'_> {
    fn partial_cmp(&self, other: &f64) -> Option<std::cmp::Ordering> {
        self.numeric().partial_cmp(other)
    }
}
