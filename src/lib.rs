//! # Rewind
//!
//! Embedded transaction manager with durable undo/redo and crash recovery.
//!
//! Rewind wraps calls to *transactional side-effecting functions* in a
//! durable envelope. Before a function runs, it is probed with a dry run
//! that reports the inverse calls; both the forward and inverse programs
//! are persisted in SQLite, so a running transaction can be rolled back on
//! failure, a committed transaction can be undone, and an undone one can
//! be redone. Opening a manager *is* the recovery path: anything a crashed
//! process left mid-flight is rolled back to a stable status first.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rewind::prelude::*;
//! use std::sync::Arc;
//!
//! let mut registry = StaticRegistry::new();
//! registry.register("app.setenv", FuncMeta::full(), |_tm, input| {
//!     // dry run: report the inverse call; real run: set the variable
//!     ...
//! });
//!
//! let mut tm = TxManager::builder()
//!     .data_dir("./data")
//!     .registry(Arc::new(registry))
//!     .open()?;
//!
//! tm.begin("deploy-42", Some("set app env"), None);
//! tm.call(None, "app.setenv", args, false);
//! tm.commit(None);
//!
//! // Later: take it back, or bring it back again.
//! tm.undo(None);
//! tm.redo(None);
//! ```
//!
//! ## Responses, not panics
//!
//! Every operation answers with an [`Envelope`] carrying an HTTP-like
//! status code (see [`codes`]); the manager never panics and never returns
//! `Err` after construction. The one fatal error is opening a data
//! directory written by an incompatible schema version.
//!
//! ## Concurrency model
//!
//! A manager is single-threaded; managers in different processes sharing a
//! data directory serialize through an advisory file lock (shared for
//! routine operations, exclusive for recovery, 15-second bounded wait).

#![warn(missing_docs)]

pub mod prelude;

pub use rewind_core::{codes, status, CallRecord, Envelope, TxRecord, TxStatus};
pub use rewind_engine::{
    CallSpec, EngineError, FuncInput, FuncMeta, FuncRegistry, ResolveError, SpecialArgs,
    StaticRegistry, TxAction, TxFunc, TxManager, TxManagerBuilder, UndoAction,
};

/// Result type for manager construction; everything else answers with an
/// [`Envelope`].
pub type Result<T> = std::result::Result<T, EngineError>;
