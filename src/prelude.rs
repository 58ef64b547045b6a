//! Convenience re-exports for typical usage.
//!
//! ```ignore
//! use rewind::prelude::*;
//! ```

pub use crate::{
    codes, CallSpec, Envelope, FuncInput, FuncMeta, FuncRegistry, SpecialArgs, StaticRegistry,
    TxManager, TxManagerBuilder, TxStatus,
};
