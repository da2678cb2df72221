pub mod stability;
pub mod windows;

pub use stability::*;
pub use windows::*;

use thiserror::Error;

/// Input-shape failures of the analytics stages. The offending column is
/// always named so the operator can see what was piped in.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(
        "executions-level table detected (column '{column}' is present); \
         Stage A requires a positions-level table with one row per position"
    )]
    ExecutionsLevelInput { column: String },

    #[error("missing required column '{column}' in {path}")]
    MissingColumn { column: String, path: String },

    #[error("row {row}: invalid value in column '{column}': {detail}")]
    BadValue {
        row: usize,
        column: String,
        detail: String,
    },

    #[error("positions table not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
