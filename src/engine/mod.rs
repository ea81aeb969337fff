//! Incremental update engine: ports, master state, batch processing,
//! contexts, expressions

pub mod config;
pub mod context;
pub mod expression;
pub mod node;
pub mod port;
mod process;
pub mod state;
pub mod transition;

pub use config::EngineConfig;
pub use context::{Context, ContextHandle, ContextKind, ContextRegistry};
pub use expression::{ExprFn, Expression, ExpressionRegistry};
pub use node::GraphNode;
pub use port::{Port, PortMode};
pub use state::{MasterState, RowLookup};
pub use transition::{calc_transition, Transition};

/// Stable output port indices read by consumers
pub const PORT_FLATTENED: usize = 0;
pub const PORT_DELTA: usize = 1;
pub const PORT_PREV: usize = 2;
pub const PORT_CURRENT: usize = 3;
pub const PORT_TRANSITIONS: usize = 4;
pub const PORT_EXISTED: usize = 5;
