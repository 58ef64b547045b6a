//! The call loop
//!
//! One engine serves `call`, `rollback`, `undo` and `redo`. The shape is
//! always the same:
//!
//! - **A** — write the transient status (clearing the resume marker when
//!   the status actually changes), in its own autocommitted statement so
//!   other readers see it immediately. From here to the end of the loop,
//!   every statement is its own SQL transaction.
//! - **B/C** — pick the source (caller list, or one of the call tables read
//!   in reverse) and the sink table, applying the resume cursor.
//! - **D** — per entry: resolve, probe for undo data, record it into the
//!   sink, execute the real call, advance the resume marker.
//! - **E** — drop the stale table, write the terminal status.
//! - **F** — on failure: a failing rollback forces `X`; anything else rolls
//!   the transaction back and annotates the error with the outcome.
//!
//! Rollback never records undo data, and while a rollback is running the
//! manager accepts re-entrant `call`s from the function being driven
//! (again without recording); a nested `rollback` request is ignored by
//! the facade.

use crate::error::LoopError;
use crate::manager::TxManager;
use crate::registry::{FuncInput, TxAction};
use rewind_core::status::{Op, TxStatus};
use rewind_core::record::TxRecord;
use rewind_core::{codes, Envelope};
use rewind_storage::CallTable;
use serde_json::{json, Map, Value};
use tracing::debug;

/// One forward call as supplied by the caller of `call`.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// Fully qualified function name.
    pub f: String,
    /// Caller arguments.
    pub args: Map<String, Value>,
}

impl CallSpec {
    /// Build a call spec.
    pub fn new(f: impl Into<String>, args: Map<String, Value>) -> Self {
        CallSpec {
            f: f.into(),
            args,
        }
    }
}

/// What the loop is being driven as.
#[derive(Debug, Clone)]
pub(crate) enum LoopMode {
    /// Execute caller-supplied forward calls.
    Call {
        /// The calls to run.
        calls: Vec<CallSpec>,
        /// Probe only: collect undo data, execute nothing, record nothing.
        dry_run: bool,
    },
    /// Replay the inverse program of whatever is in flight.
    Rollback,
    /// Undo a committed transaction.
    Undo,
    /// Redo an undone transaction.
    Redo,
}

impl LoopMode {
    fn op(&self) -> Op {
        match self {
            LoopMode::Call { .. } => Op::Call,
            LoopMode::Rollback => Op::Rollback,
            LoopMode::Undo => Op::Undo,
            LoopMode::Redo => Op::Redo,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            LoopMode::Call { .. } => "call into",
            LoopMode::Rollback => "roll back",
            LoopMode::Undo => "undo",
            LoopMode::Redo => "redo",
        }
    }
}

/// One unit of work: a fresh caller call, or a row read from a table.
struct LoopEntry {
    f: String,
    args: Map<String, Value>,
    sp: Option<String>,
    /// Set when the entry came from a table; it is what the resume marker
    /// tracks for table-sourced modes.
    source_id: Option<i64>,
}

impl TxManager {
    /// Drive the loop in the given mode against the current transaction.
    pub(crate) fn run_loop(&mut self, mode: LoopMode) -> Result<Envelope, LoopError> {
        let rolling_back = matches!(mode, LoopMode::Rollback);
        let was_in_rollback = self.in_rollback;
        if rolling_back {
            self.in_rollback = true;
        }
        let result = self.run_loop_phases(mode);
        self.in_rollback = was_in_rollback;
        result
    }

    fn run_loop_phases(&mut self, mode: LoopMode) -> Result<Envelope, LoopError> {
        let rec = self
            .cur
            .clone()
            .ok_or_else(|| LoopError::new(codes::INTERNAL, "no current transaction"))?;

        // Phase A: status transition, in its own SQL transaction. This
        // deliberately exits the wrapper's transaction; every statement
        // from here on autocommits, so a crash at any point leaves a
        // transient status recovery can finish from.
        let transition = rec.status.transition(mode.op());
        if !matches!(mode, LoopMode::Call { .. }) && transition.is_none() {
            return Err(LoopError::new(
                codes::WRONG_TX_STATUS,
                format!(
                    "cannot {} transaction '{}' while it is {}",
                    mode.verb(),
                    rec.str_id,
                    rec.status.describe()
                ),
            ));
        }
        self.store.commit()?;

        let rec = if let Some((transient, _)) = transition {
            if transient != rec.status {
                self.store.set_tx_status(rec.ser_id, transient, true)?;
            }
            let reread = self
                .store
                .get_tx_by_ser_id(rec.ser_id)?
                .ok_or_else(|| {
                    LoopError::env(format!(
                        "transaction '{}' vanished during status update",
                        rec.str_id
                    ))
                })?;
            if reread.status != transient {
                return Err(LoopError::env(format!(
                    "status update of '{}' to '{}' was not applied",
                    rec.str_id, transient
                )));
            }
            reread
        } else {
            rec
        };
        self.cur = Some(rec.clone());
        let final_status = transition.map(|(_, terminal)| terminal);

        // Phases B/C: source and sink selection, with the resume cursor.
        let (entries, sink) = self.gather_entries(&mode, &rec)?;
        debug!(
            tx = %rec.str_id,
            mode = mode.verb(),
            entries = entries.len(),
            resume_after = ?rec.last_call_id,
            "call loop starting"
        );

        // Phases D/E, with F wrapped around them.
        match self.exec_entries(&rec, &mode, entries, sink, final_status) {
            Ok(env) => Ok(env),
            Err(err) => self.handle_failure(&rec, &mode, err),
        }
    }

    fn gather_entries(
        &mut self,
        mode: &LoopMode,
        rec: &TxRecord,
    ) -> Result<(Vec<LoopEntry>, Option<CallTable>), LoopError> {
        Ok(match mode {
            LoopMode::Call { calls, .. } => (
                calls
                    .iter()
                    .map(|c| LoopEntry {
                        f: c.f.clone(),
                        args: c.args.clone(),
                        sp: None,
                        source_id: None,
                    })
                    .collect(),
                Some(CallTable::Undo),
            ),
            LoopMode::Undo => (
                self.load_entries(CallTable::Undo, rec)?,
                Some(CallTable::Forward),
            ),
            LoopMode::Redo => (
                self.load_entries(CallTable::Forward, rec)?,
                Some(CallTable::Undo),
            ),
            LoopMode::Rollback => {
                let source = match rec.status {
                    TxStatus::Aborting => CallTable::Undo,
                    TxStatus::UndoAborting => CallTable::Forward,
                    TxStatus::RedoAborting => CallTable::Undo,
                    other => {
                        return Err(LoopError::new(
                            codes::INTERNAL,
                            format!("rollback loop entered with status '{}'", other),
                        ))
                    }
                };
                (self.load_entries(source, rec)?, None)
            }
        })
    }

    fn load_entries(
        &self,
        table: CallTable,
        rec: &TxRecord,
    ) -> Result<Vec<LoopEntry>, LoopError> {
        // Every table-sourced mode replays in reverse order of recording.
        let calls = self
            .store
            .select_calls(table, rec.ser_id, true, rec.last_call_id)?;
        Ok(calls
            .into_iter()
            .map(|c| LoopEntry {
                f: c.f,
                args: c.args,
                sp: c.sp,
                source_id: Some(c.id),
            })
            .collect())
    }

    fn exec_entries(
        &mut self,
        rec: &TxRecord,
        mode: &LoopMode,
        entries: Vec<LoopEntry>,
        sink: Option<CallTable>,
        final_status: Option<TxStatus>,
    ) -> Result<Envelope, LoopError> {
        let top_dry_run = matches!(mode, LoopMode::Call { dry_run: true, .. });
        // Rollback (including re-entrant calls made from inside one) never
        // records new undo data.
        let record_undo = sink.is_some() && !self.in_rollback;
        let mut collected_undo: Vec<Value> = Vec::new();

        for entry in &entries {
            let func = {
                let registry = self.registry.clone();
                registry
                    .resolve(&entry.f)
                    .map_err(|e| LoopError::new(e.code(), e.to_string()))?
            };
            if !func.meta.supports_tx() {
                return Err(LoopError::new(
                    codes::PRECONDITION_FAILED,
                    format!(
                        "function '{}' does not support transactions \
                         (transactional, undoable and dry-run are all required)",
                        entry.f
                    ),
                ));
            }

            let mut input = FuncInput::from_caller_args(entry.args.clone());
            input.special.tx_action = self.in_rollback.then_some(TxAction::Rollback);

            // Dry-run probe: only when undo data will be wanted.
            let mut undo_calls: Vec<(String, Map<String, Value>)> = Vec::new();
            if record_undo || top_dry_run {
                input.special.dry_run = true;
                input.special.check_state = true;
                let body = func.body.clone();
                let env = (body.as_ref())(self, &input);
                if !matches!(env.code, codes::OK | codes::NOT_MODIFIED) {
                    return Err(LoopError::env(format!(
                        "dry-run probe of '{}' failed with {}: {}",
                        entry.f, env.code, env.message
                    )));
                }
                undo_calls = parse_undo_data(env.undo_data()).map_err(|reason| {
                    LoopError::env(format!(
                        "function '{}' returned unusable undo data: {}",
                        entry.f, reason
                    ))
                })?;
                for (undo_f, _) in &undo_calls {
                    let registry = self.registry.clone();
                    let undo_func = registry
                        .resolve(undo_f)
                        .map_err(|e| LoopError::new(e.code(), e.to_string()))?;
                    if !undo_func.meta.transactional {
                        return Err(LoopError::new(
                            codes::PRECONDITION_FAILED,
                            format!("undo function '{}' is not transactional", undo_f),
                        ));
                    }
                }
                input.special.dry_run = false;
                input.special.check_state = false;
            }

            if top_dry_run {
                collected_undo.extend(undo_calls.iter().map(|(f, a)| json!([f, a])));
                continue;
            }

            // Record the undo program into the sink. Only the first row of
            // each top-level call carries the savepoint label.
            if let (true, Some(sink_table)) = (record_undo, sink) {
                let mut first = true;
                for (undo_f, undo_args) in &undo_calls {
                    let sp = if first { entry.sp.as_deref() } else { None };
                    self.store
                        .insert_call(sink_table, rec.ser_id, sp, undo_f, undo_args)?;
                    first = false;
                }
            }

            // In call mode the forward log grows too; its row id is what
            // the resume marker tracks. Table-sourced modes track the
            // source row instead.
            let marker_id = match mode {
                LoopMode::Call { .. } if !self.in_rollback => Some(self.store.insert_call(
                    CallTable::Forward,
                    rec.ser_id,
                    entry.sp.as_deref(),
                    &entry.f,
                    &entry.args,
                )?),
                _ => entry.source_id,
            };

            // The real call.
            let body = func.body.clone();
            let env = (body.as_ref())(self, &input);
            if !matches!(env.code, codes::OK | codes::NOT_MODIFIED) {
                return Err(LoopError::env(format!(
                    "function '{}' failed with {}: {}",
                    entry.f, env.code, env.message
                )));
            }

            // Advance the resume marker. Not transactional with the call
            // itself: a crash in between re-executes one idempotent step
            // on recovery.
            if let Some(id) = marker_id {
                self.store.set_last_call_id(rec.ser_id, Some(id))?;
            }
            debug!(tx = %rec.str_id, f = %entry.f, "call completed");
        }

        if top_dry_run {
            return Ok(if collected_undo.is_empty() {
                Envelope::new(codes::NOT_MODIFIED, "No undo data")
                    .with_payload(Value::Array(Vec::new()))
            } else {
                Envelope::ok().with_payload(Value::Array(collected_undo))
            });
        }

        // Phase E: the direction just consumed is stale. What survives is
        // exactly the program the terminal status needs later: `C` keeps
        // its undo program, `U` keeps its redo program, `R` needs nothing.
        match mode {
            LoopMode::Call { .. } => {}
            LoopMode::Undo | LoopMode::Redo => {
                if let Some(sink_table) = sink {
                    self.store
                        .delete_calls(sink_table.opposite(), rec.ser_id)?;
                }
            }
            LoopMode::Rollback => match final_status {
                Some(TxStatus::RolledBack) => {
                    self.store.delete_calls(CallTable::Forward, rec.ser_id)?;
                    self.store.delete_calls(CallTable::Undo, rec.ser_id)?;
                }
                Some(TxStatus::Committed) => {
                    self.store.delete_calls(CallTable::Forward, rec.ser_id)?
                }
                Some(TxStatus::Undone) => {
                    self.store.delete_calls(CallTable::Undo, rec.ser_id)?
                }
                _ => {}
            },
        }

        if let Some(terminal) = final_status {
            self.store.set_tx_status(rec.ser_id, terminal, true)?;
            if let Some(fresh) = self.store.get_tx_by_ser_id(rec.ser_id)? {
                self.cur = Some(fresh);
            }
            debug!(tx = %rec.str_id, status = %terminal, "call loop finished");
        }
        Ok(Envelope::ok())
    }

    /// Phase F: a failing rollback abandons the transaction as `X`;
    /// anything else triggers the internal rollback and annotates the
    /// original error with the outcome.
    fn handle_failure(
        &mut self,
        rec: &TxRecord,
        mode: &LoopMode,
        err: LoopError,
    ) -> Result<Envelope, LoopError> {
        if matches!(mode, LoopMode::Rollback) {
            tracing::warn!(tx = %rec.str_id, error = %err, "rollback failed; transaction is inconsistent");
            if let Err(e) = self.store.set_tx_status(rec.ser_id, TxStatus::Inconsistent, true) {
                tracing::warn!(tx = %rec.str_id, error = %e, "could not record inconsistent status");
            }
            if let Ok(Some(fresh)) = self.store.get_tx_by_ser_id(rec.ser_id) {
                self.cur = Some(fresh);
            }
            return Err(err);
        }
        if self.in_rollback {
            // A re-entrant call failing inside a rollback: the enclosing
            // rollback decides what happens next.
            return Err(err);
        }
        match self.rollback_current() {
            Ok(_) => Err(LoopError::new(
                err.code,
                format!("{} (rolled back)", err.message),
            )),
            Err(rollback_err) => Err(LoopError::new(
                err.code,
                format!("{} (rollback failed: {})", err.message, rollback_err.message),
            )),
        }
    }

    /// The internal rollback: refresh the current record and drive the
    /// loop in rollback mode. No locking, no wrapper; callers already hold
    /// whatever lock the operation needs.
    pub(crate) fn rollback_current(&mut self) -> Result<Envelope, LoopError> {
        let ser_id = self
            .cur
            .as_ref()
            .map(|r| r.ser_id)
            .ok_or_else(|| LoopError::new(codes::INTERNAL, "no current transaction"))?;
        let fresh = self
            .store
            .get_tx_by_ser_id(ser_id)?
            .ok_or_else(|| LoopError::env("transaction vanished before rollback"))?;
        self.cur = Some(fresh);
        self.run_loop(LoopMode::Rollback)
    }
}

/// Parse `extra.undo_data`: a list of `[f]` or `[f, args]` entries.
/// Absent undo data is an empty program, not an error.
fn parse_undo_data(raw: Option<&Value>) -> Result<Vec<(String, Map<String, Value>)>, String> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let items = raw.as_array().ok_or("not a list")?;
    let mut calls = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let pair = item
            .as_array()
            .ok_or_else(|| format!("entry {} is not a [f, args] pair", i))?;
        let f = pair
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| format!("entry {} has no function name", i))?
            .to_string();
        let args = match pair.get(1) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(format!("entry {} has non-object args: {}", i, other));
            }
        };
        calls.push((f, args));
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_undo_data_shapes() {
        assert!(parse_undo_data(None).unwrap().is_empty());
        assert!(parse_undo_data(Some(&json!([]))).unwrap().is_empty());

        let parsed =
            parse_undo_data(Some(&json!([["setenv", {"key": "A"}], ["unlink"]]))).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "setenv");
        assert_eq!(parsed[0].1["key"], json!("A"));
        assert_eq!(parsed[1].0, "unlink");
        assert!(parsed[1].1.is_empty());

        assert!(parse_undo_data(Some(&json!("nope"))).is_err());
        assert!(parse_undo_data(Some(&json!([42]))).is_err());
        assert!(parse_undo_data(Some(&json!([["f", 17]]))).is_err());
    }
}
