//! Fluxgrid incremental update engine
//!
//! A columnar, primary-keyed in-memory analytics kernel. Callers push
//! batches of row fragments marked insert or delete; the engine keeps a
//! canonical master table keyed by `psp_pkey`, computes per-cell value
//! transitions, fans out transitional snapshots (delta, prev, current,
//! transitions, existed) to registered contexts, and evaluates derived
//! expression columns against master and batch tables.

pub mod data;
pub mod engine;

// Re-export main types
pub use data::{
    BitVec, Column, DataTable, DataType, Schema, Value, Vocabulary, EXISTED_COLUMN, OP_COLUMN,
    OP_DELETE, OP_INSERT, PKEY_COLUMN,
};
pub use engine::{
    Context, ContextKind, EngineConfig, Expression, GraphNode, MasterState, Port, PortMode,
    RowLookup, Transition, PORT_CURRENT, PORT_DELTA, PORT_EXISTED, PORT_FLATTENED, PORT_PREV,
    PORT_TRANSITIONS,
};

/// Engine error type
///
/// Covers the recoverable "user input" class: bad fragments, unknown
/// ports, rejected promotions. Programmer errors and internal invariant
/// violations panic with a pinpoint message instead.
#[derive(Debug, thiserror::Error)]
pub enum FluxError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("input port {0} does not exist")]
    UnknownPort(usize),

    #[error("invalid op code {0} in fragment (expected 0=insert, 1=delete)")]
    InvalidOp(u8),

    #[error("cannot promote column `{column}` from {from:?} to {to:?}")]
    InvalidPromotion {
        column: String,
        from: DataType,
        to: DataType,
    },

    #[error("context `{0}` is already registered")]
    ContextExists(String),
}

pub type Result<T> = std::result::Result<T, FluxError>;
