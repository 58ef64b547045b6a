//! The function seam
//!
//! The manager does not own any side-effecting function; it resolves fully
//! qualified names through a [`FuncRegistry`] supplied by the host. A
//! resolved [`TxFunc`] pairs the callable with [`FuncMeta`], which must
//! advertise all three capabilities (transactional, undoable,
//! dry-run-capable) before the manager will drive it.
//!
//! The callee channel is typed. Caller arguments travel in
//! [`FuncInput::args`] with every reserved `-`-prefixed key stripped; the
//! reserved channel is [`SpecialArgs`]. The `-` prefix convention only
//! exists at the serialization boundary ([`FuncInput::to_wire_args`]), for
//! registries that hand arguments to an external runtime. The back-
//! reference that the wire convention calls `-tx_manager` is the
//! `&mut TxManager` every callable receives as its first argument.
//!
//! Contract, from the callee's side:
//! - a dry-run probe (`dry_run` and `check_state` set) must not side-effect
//!   and must answer 200/304 with `extra.undo_data`, a list of `[f, args]`
//!   inverse calls;
//! - a real call answers 200/304 on success; anything else makes the
//!   manager roll the transaction back.

use crate::manager::TxManager;
use rewind_core::codes;
use rewind_core::Envelope;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a name could not be resolved.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The name is not even well-formed (reported as 400).
    #[error("malformed function name '{0}'")]
    Malformed(String),

    /// The name is well-formed but the function cannot be loaded
    /// (reported as 500).
    #[error("cannot load function '{name}': {reason}")]
    Load {
        /// The function name.
        name: String,
        /// What went wrong.
        reason: String,
    },
}

impl ResolveError {
    /// The envelope status code this failure reports under.
    pub fn code(&self) -> u16 {
        match self {
            ResolveError::Malformed(_) => codes::BAD_REQUEST,
            ResolveError::Load { .. } => codes::INTERNAL,
        }
    }
}

/// Capabilities a function's metadata advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuncMeta {
    /// The function participates in transactions.
    pub transactional: bool,
    /// The function can produce undo calls.
    pub undoable: bool,
    /// The function supports dry-run probing.
    pub dry_run: bool,
}

impl FuncMeta {
    /// All three capabilities present.
    pub fn full() -> Self {
        FuncMeta {
            transactional: true,
            undoable: true,
            dry_run: true,
        }
    }

    /// Whether the manager may drive this function: all three capabilities
    /// are required.
    pub fn supports_tx(&self) -> bool {
        self.transactional && self.undoable && self.dry_run
    }
}

/// The action the manager is performing when it invokes a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    /// The manager is rolling back; the function is being driven as part
    /// of an inverse program.
    Rollback,
}

/// Which direction of the function is wanted. Only `Do` is driven today;
/// the variant exists because the wire convention reserves the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UndoAction {
    /// Execute the function forward.
    #[default]
    Do,
}

/// The reserved argument channel between manager and callee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialArgs {
    /// Set to [`TxAction::Rollback`] while the manager rolls back; absent
    /// otherwise.
    pub tx_action: Option<TxAction>,
    /// Always [`UndoAction::Do`].
    pub undo_action: UndoAction,
    /// This invocation is a probe; do not side-effect.
    pub dry_run: bool,
    /// Probe flavor: inspect state and report undo data.
    pub check_state: bool,
}

/// What a callable receives: cleaned caller arguments plus the reserved
/// channel.
#[derive(Debug, Clone)]
pub struct FuncInput {
    /// Caller-supplied arguments; never contains `-`-prefixed keys.
    pub args: Map<String, Value>,
    /// The reserved channel.
    pub special: SpecialArgs,
}

impl FuncInput {
    /// Build an input from caller-supplied arguments, stripping every
    /// reserved `-`-prefixed key.
    pub fn from_caller_args(args: Map<String, Value>) -> Self {
        let args = args
            .into_iter()
            .filter(|(k, _)| !k.starts_with('-'))
            .collect();
        FuncInput {
            args,
            special: SpecialArgs::default(),
        }
    }

    /// Flatten to the wire form: caller args plus the reserved keys under
    /// their `-` names. For registries that serialize the whole map to an
    /// external runtime.
    pub fn to_wire_args(&self) -> Map<String, Value> {
        let mut wire = self.args.clone();
        if let Some(TxAction::Rollback) = self.special.tx_action {
            wire.insert("-tx_action".into(), Value::from("rollback"));
        }
        wire.insert("-undo_action".into(), Value::from("do"));
        if self.special.dry_run {
            wire.insert("-dry_run".into(), Value::from(true));
        }
        if self.special.check_state {
            wire.insert("-check_state".into(), Value::from(true));
        }
        wire
    }
}

/// The callable form every registered function takes. The manager passes
/// itself so that a function may call back into it (the sanctioned case is
/// `call` from inside a rollback handler).
pub type FuncBody = Arc<dyn Fn(&mut TxManager, &FuncInput) -> Envelope + Send + Sync>;

/// A resolved function: capability metadata plus the callable.
#[derive(Clone)]
pub struct TxFunc {
    /// Advertised capabilities.
    pub meta: FuncMeta,
    /// The callable.
    pub body: FuncBody,
}

impl fmt::Debug for TxFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxFunc").field("meta", &self.meta).finish()
    }
}

/// Resolves fully qualified function names for the manager.
pub trait FuncRegistry: Send + Sync {
    /// Resolve `name` to a callable plus metadata.
    fn resolve(&self, name: &str) -> Result<TxFunc, ResolveError>;
}

/// Whether a name is well-formed: nonempty, made of identifier characters
/// plus `::` path separators and dots.
pub fn valid_func_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.'))
}

/// An in-process registry: a name-to-function map populated up front.
#[derive(Default)]
pub struct StaticRegistry {
    funcs: BTreeMap<String, TxFunc>,
}

impl StaticRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a fully qualified name.
    pub fn register<F>(&mut self, name: impl Into<String>, meta: FuncMeta, body: F)
    where
        F: Fn(&mut TxManager, &FuncInput) -> Envelope + Send + Sync + 'static,
    {
        self.funcs.insert(
            name.into(),
            TxFunc {
                meta,
                body: Arc::new(body),
            },
        );
    }
}

impl FuncRegistry for StaticRegistry {
    fn resolve(&self, name: &str) -> Result<TxFunc, ResolveError> {
        if !valid_func_name(name) {
            return Err(ResolveError::Malformed(name.to_string()));
        }
        self.funcs
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::Load {
                name: name.to_string(),
                reason: "no such function".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_caller_args_are_stripped_of_reserved_keys() {
        let mut args = Map::new();
        args.insert("key".into(), json!("A"));
        args.insert("-dry_run".into(), json!(true));
        args.insert("-tx_manager".into(), json!("sneaky"));
        let input = FuncInput::from_caller_args(args);
        assert_eq!(input.args.len(), 1);
        assert_eq!(input.args["key"], json!("A"));
        assert!(!input.special.dry_run);
    }

    #[test]
    fn test_wire_args_carry_reserved_keys() {
        let mut args = Map::new();
        args.insert("key".into(), json!("A"));
        let mut input = FuncInput::from_caller_args(args);
        input.special.tx_action = Some(TxAction::Rollback);
        input.special.dry_run = true;
        input.special.check_state = true;
        let wire = input.to_wire_args();
        assert_eq!(wire["-tx_action"], json!("rollback"));
        assert_eq!(wire["-undo_action"], json!("do"));
        assert_eq!(wire["-dry_run"], json!(true));
        assert_eq!(wire["-check_state"], json!(true));
        assert_eq!(wire["key"], json!("A"));
    }

    #[test]
    fn test_name_validation() {
        assert!(valid_func_name("setenv"));
        assert!(valid_func_name("App::Env::setenv"));
        assert!(valid_func_name("pkg.mod.func_1"));
        assert!(!valid_func_name(""));
        assert!(!valid_func_name("has space"));
        assert!(!valid_func_name("semi;colon"));
    }

    #[test]
    fn test_static_registry_resolution() {
        let mut reg = StaticRegistry::new();
        reg.register("setenv", FuncMeta::full(), |_, _| Envelope::ok());

        let func = reg.resolve("setenv").unwrap();
        assert!(func.meta.supports_tx());

        match reg.resolve("missing") {
            Err(e @ ResolveError::Load { .. }) => assert_eq!(e.code(), 500),
            other => panic!("expected Load error, got {:?}", other),
        }
        match reg.resolve("bad name") {
            Err(e @ ResolveError::Malformed(_)) => assert_eq!(e.code(), 400),
            other => panic!("expected Malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_capabilities_do_not_support_tx() {
        let meta = FuncMeta {
            transactional: true,
            undoable: true,
            dry_run: false,
        };
        assert!(!meta.supports_tx());
        assert!(FuncMeta::full().supports_tx());
    }
}
