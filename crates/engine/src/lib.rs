//! The rewind engine: call loop, recovery, and the manager facade
//!
//! This crate ties the vocabulary (`rewind-core`), the store
//! (`rewind-storage`) and the lock (`rewind-concurrency`) together:
//!
//! - [`registry`]: the seam to the host's functions — a [`FuncRegistry`]
//!   resolves a name to a callable plus capability metadata
//! - the call loop: one engine serving `call`, `rollback`, `undo` and
//!   `redo` by choosing a source and a sink call table
//! - recovery: at construction, interrupted transactions are rolled back to
//!   a terminal status under the exclusive lock
//! - [`TxManager`]: the public facade, one method per operation, every
//!   method answering with an [`Envelope`](rewind_core::Envelope)

#![warn(missing_docs)]

mod call_loop;
mod error;
mod manager;
mod recovery;
pub mod registry;

pub use call_loop::CallSpec;
pub use error::{EngineError, LoopError};
pub use manager::{TxManager, TxManagerBuilder};
pub use registry::{
    FuncInput, FuncMeta, FuncRegistry, ResolveError, SpecialArgs, StaticRegistry, TxAction,
    TxFunc, UndoAction,
};
