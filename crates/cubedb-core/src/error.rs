//! Engine error taxonomy and the structured error sink.
//!
//! Two propagation regimes coexist:
//!
//! - structural and resolver errors surface to the caller as [`EngineError`];
//! - per-cell evaluation failures are contained, produce a marker value
//!   (`#ERR` / `#REC`, see [`crate::CellValue`]) and never abort a
//!   surrounding area or report operation.
//!
//! Both regimes report to the database's error sink so collaborators can
//! observe contained failures without crashing evaluation.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by structural edits, the resolver and write paths.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("unknown member '{name}'{}", dimension.as_deref().map(|d| format!(" in dimension '{d}'")).unwrap_or_default())]
    UnknownMember {
        name: String,
        dimension: Option<String>,
    },

    #[error("member name '{name}' is ambiguous across dimensions {dimensions:?}; use the 'dimension:member' form")]
    AmbiguousMember {
        name: String,
        dimensions: Vec<String>,
    },

    #[error("name '{name}' already exists in dimension '{dimension}'")]
    DuplicateName { name: String, dimension: String },

    #[error("edge '{parent}' -> '{child}' would create a cycle in dimension '{dimension}'")]
    CycleDetected {
        dimension: String,
        parent: String,
        child: String,
    },

    #[error("'{name}' is in use: {detail}")]
    InUse { name: String, detail: String },

    #[error("no coordinate given for dimension '{dimension}' and it has no unique root")]
    UnderdefinedAddress { dimension: String },

    #[error("type error: {detail}")]
    TypeError { detail: String },

    #[error("rule failed: {detail}")]
    Rule { detail: String },

    #[error("area expands to {cells} base cells, exceeding the limit of {limit}")]
    AreaTooLarge { cells: u64, limit: u64 },

    #[error("dimension '{dimension}' is already in edit mode")]
    EditInProgress { dimension: String },

    #[error("invalid operation: {detail}")]
    InvalidOperation { detail: String },
}

impl EngineError {
    /// Stable short tag for sink records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownMember { .. } => "unknown_member",
            EngineError::AmbiguousMember { .. } => "ambiguous_member",
            EngineError::DuplicateName { .. } => "duplicate_name",
            EngineError::CycleDetected { .. } => "cycle_detected",
            EngineError::InUse { .. } => "in_use",
            EngineError::UnderdefinedAddress { .. } => "underdefined_address",
            EngineError::TypeError { .. } => "type_error",
            EngineError::Rule { .. } => "rule_error",
            EngineError::AreaTooLarge { .. } => "area_too_large",
            EngineError::EditInProgress { .. } => "edit_in_progress",
            EngineError::InvalidOperation { .. } => "invalid_operation",
        }
    }
}

/// A structured record handed to the error sink.
///
/// Contained evaluation failures (rule errors, recursion re-entry) and
/// invalidation events (cascade fact deletes) are reported here in addition
/// to the `tracing` log, so UIs and ops tooling can observe them.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Stable tag, e.g. `"rule_error"`, `"rule_recursion"`, `"cascade_delete"`.
    pub kind: &'static str,
    /// Cube the event relates to, if any.
    pub cube: Option<String>,
    /// Display form of the affected address, if any.
    pub address: Option<String>,
    /// Human-readable detail.
    pub detail: String,
}

/// Callback receiving every [`ErrorRecord`].
pub type ErrorSink = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

/// Default sink: forward to `tracing` at warn level.
pub(crate) fn default_sink() -> ErrorSink {
    Arc::new(|record: &ErrorRecord| {
        tracing::warn!(
            kind = record.kind,
            cube = record.cube.as_deref().unwrap_or(""),
            address = record.address.as_deref().unwrap_or(""),
            "{}",
            record.detail
        );
    })
}
