//! The manager facade
//!
//! `TxManager` is the public entry point: one method per operation, every
//! method answering with an [`Envelope`]. Construction is the recovery
//! path — interrupted transactions are rolled back before the manager is
//! handed out — so the only fallible-by-`Result` surface is
//! [`TxManagerBuilder::open`].
//!
//! Every transactional operation runs through the same wrapper: take the
//! shared file lock, resolve the transaction id, open a SQL transaction,
//! load the record, check the permitted statuses, run the body, then
//! commit or roll the SQL transaction back and release the lock. The
//! read-only variant (`list`, `discard_all`) skips the SQL transaction and
//! the load.

use crate::call_loop::{CallSpec, LoopMode};
use crate::error::{EngineError, LoopError};
use crate::registry::FuncRegistry;
use rewind_concurrency::{LockKind, Locker};
use rewind_core::status::TxStatus;
use rewind_core::record::TxRecord;
use rewind_core::{codes, Envelope};
use rewind_storage::{CallTable, Store};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest accepted transaction id, in characters.
const MAX_TX_ID_LEN: usize = 200;

const CALL_PERMITTED: &[TxStatus] = &[TxStatus::InProgress];
const CALL_PERMITTED_IN_ROLLBACK: &[TxStatus] = &[
    TxStatus::InProgress,
    TxStatus::Aborting,
    TxStatus::Undoing,
    TxStatus::Redoing,
    TxStatus::UndoAborting,
    TxStatus::RedoAborting,
];
const COMMIT_PERMITTED: &[TxStatus] = &[TxStatus::InProgress, TxStatus::Aborting];
const ROLLBACK_PERMITTED: &[TxStatus] = &[
    TxStatus::InProgress,
    TxStatus::Aborting,
    TxStatus::Undoing,
    TxStatus::Redoing,
    TxStatus::UndoAborting,
    TxStatus::RedoAborting,
    TxStatus::RolledBack,
];
const UNDO_PERMITTED: &[TxStatus] = &[TxStatus::Committed];
const REDO_PERMITTED: &[TxStatus] = &[TxStatus::Undone];
const DISCARD_PERMITTED: &[TxStatus] = &[
    TxStatus::Committed,
    TxStatus::Undone,
    TxStatus::Inconsistent,
];

/// How an operation picks its transaction when no id is supplied.
#[derive(Debug, Clone, Copy)]
enum Picker {
    /// `undo`: the most recently committed transaction.
    LatestCommitted,
    /// `redo`: the earliest undone transaction.
    EarliestUndone,
}

/// Per-operation wrapper configuration.
struct OpSpec {
    name: &'static str,
    /// Statuses the loaded record must be in; `None` skips the existence
    /// and status checks (only `begin` does).
    permitted: Option<&'static [TxStatus]>,
    /// Run the cleanup hook before the body (only `begin` does).
    cleanup: bool,
    /// Candidate picker for an omitted id.
    picker: Option<Picker>,
}

/// The transaction manager.
///
/// Holds the store, the file lock and the function registry. Methods take
/// `&mut self`; the manager is single-threaded by design, and instances on
/// the same data directory serialize through the file lock.
pub struct TxManager {
    pub(crate) store: Store,
    pub(crate) locker: Locker,
    pub(crate) registry: Arc<dyn FuncRegistry>,
    /// The record the current operation is working on. Also what
    /// `get_trash_dir`/`get_tmp_dir` answer for.
    pub(crate) cur: Option<TxRecord>,
    /// Default transaction id for operations that omit one; set by `begin`.
    pub(crate) sticky_tx_id: Option<String>,
    /// Set while a rollback is being driven; gates re-entrant calls.
    pub(crate) in_rollback: bool,
    /// Keeps the data directory alive (and removed on drop) for managers
    /// opened via [`TxManagerBuilder::open_temp`].
    pub(crate) temp_dir: Option<tempfile::TempDir>,
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxManager")
            .field("store", &self.store)
            .field("locker", &self.locker)
            .field("cur", &self.cur)
            .field("sticky_tx_id", &self.sticky_tx_id)
            .field("in_rollback", &self.in_rollback)
            .finish()
    }
}

impl TxManager {
    /// Start building a manager.
    pub fn builder() -> TxManagerBuilder {
        TxManagerBuilder::new()
    }

    /// The data directory.
    pub fn data_dir(&self) -> &std::path::Path {
        self.store.data_dir()
    }

    /// The record of the transaction the manager last operated on.
    pub fn current_tx(&self) -> Option<&TxRecord> {
        self.cur.as_ref()
    }

    // ------------------------------------------------------------------
    // Facade operations
    // ------------------------------------------------------------------

    /// Start a new transaction.
    ///
    /// The id must be unique across all transactions ever recorded; a
    /// duplicate answers 409. The new transaction becomes the sticky
    /// default for later operations that omit an id.
    pub fn begin(
        &mut self,
        tx_id: &str,
        summary: Option<&str>,
        owner_id: Option<&str>,
    ) -> Envelope {
        let id = tx_id.to_string();
        let summary = summary.map(str::to_string);
        let owner = owner_id.unwrap_or("").to_string();
        self.wrap(
            Some(tx_id),
            OpSpec {
                name: "begin",
                permitted: None,
                cleanup: true,
                picker: None,
            },
            move |tm| {
                if tm.cur.is_some() {
                    // Someone else's transaction; nothing of ours to undo
                    // in the enclosing SQL transaction.
                    return Ok(Envelope::new(
                        codes::DUPLICATE_TX,
                        format!("transaction '{}' already exists", id),
                    )
                    .with_extra("rollback", json!(false)));
                }
                let rec = tm.store.insert_tx(&id, &owner, summary.as_deref())?;
                debug!(tx = %rec.str_id, ser_id = rec.ser_id, "transaction started");
                tm.sticky_tx_id = Some(rec.str_id.clone());
                tm.cur = Some(rec);
                Ok(Envelope::ok())
            },
        )
    }

    /// Execute one function call inside the transaction.
    ///
    /// With `dry_run`, nothing is executed or recorded; the answer carries
    /// the undo data the call would have recorded.
    pub fn call(
        &mut self,
        tx_id: Option<&str>,
        f: &str,
        args: Map<String, Value>,
        dry_run: bool,
    ) -> Envelope {
        self.call_batch(tx_id, vec![CallSpec::new(f, args)], dry_run)
    }

    /// Execute a batch of calls inside the transaction, in order.
    pub fn call_batch(
        &mut self,
        tx_id: Option<&str>,
        calls: Vec<CallSpec>,
        dry_run: bool,
    ) -> Envelope {
        let permitted = if self.in_rollback {
            // Re-entry: a function driven by a rollback may call back in.
            CALL_PERMITTED_IN_ROLLBACK
        } else {
            CALL_PERMITTED
        };
        self.wrap(
            tx_id,
            OpSpec {
                name: "call",
                permitted: Some(permitted),
                cleanup: false,
                picker: None,
            },
            move |tm| tm.run_loop(LoopMode::Call { calls, dry_run }),
        )
    }

    /// Commit the transaction: drop its forward log and keep the undo
    /// program. A transaction stuck mid-abort is driven to `R` instead and
    /// the answer says so.
    pub fn commit(&mut self, tx_id: Option<&str>) -> Envelope {
        self.wrap(
            tx_id,
            OpSpec {
                name: "commit",
                permitted: Some(COMMIT_PERMITTED),
                cleanup: false,
                picker: None,
            },
            |tm| {
                let rec = tm.current_checked()?;
                if rec.status == TxStatus::Aborting {
                    tm.run_loop(LoopMode::Rollback)?;
                    return Ok(Envelope::new(codes::OK, "Rolled back"));
                }
                tm.store.delete_calls(CallTable::Forward, rec.ser_id)?;
                tm.store
                    .set_tx_status(rec.ser_id, TxStatus::Committed, true)?;
                let now = tm.store.now();
                tm.store.set_commit_time(rec.ser_id, now)?;
                if let Some(fresh) = tm.store.get_tx_by_ser_id(rec.ser_id)? {
                    tm.cur = Some(fresh);
                }
                debug!(tx = %rec.str_id, "committed");
                Ok(Envelope::ok())
            },
        )
    }

    /// Roll back whatever the transaction has in flight.
    ///
    /// Rolling back a transaction that is already rolled back is a 304
    /// no-op, as is a nested rollback request while one is running.
    /// Savepoints are reserved: a non-empty `sp` answers 501.
    pub fn rollback(&mut self, tx_id: Option<&str>, sp: Option<&str>) -> Envelope {
        if sp.is_some() {
            return Envelope::new(codes::NOT_IMPLEMENTED, "savepoints are not implemented");
        }
        if self.in_rollback {
            return Envelope::new(codes::NOT_MODIFIED, "a rollback is already in progress");
        }
        self.wrap(
            tx_id,
            OpSpec {
                name: "rollback",
                permitted: Some(ROLLBACK_PERMITTED),
                cleanup: false,
                picker: None,
            },
            |tm| {
                let rec = tm.current_checked()?;
                if rec.status == TxStatus::RolledBack {
                    return Ok(Envelope::new(
                        codes::NOT_MODIFIED,
                        "transaction is already rolled back",
                    ));
                }
                tm.run_loop(LoopMode::Rollback)?;
                Ok(Envelope::new(codes::OK, "Rolled back"))
            },
        )
    }

    /// Undo a committed transaction. With no id, picks the most recently
    /// committed one; answers 412 when there is none.
    pub fn undo(&mut self, tx_id: Option<&str>) -> Envelope {
        self.wrap(
            tx_id,
            OpSpec {
                name: "undo",
                permitted: Some(UNDO_PERMITTED),
                cleanup: false,
                picker: Some(Picker::LatestCommitted),
            },
            |tm| tm.run_loop(LoopMode::Undo),
        )
    }

    /// Redo an undone transaction. With no id, picks the earliest undone
    /// one; answers 412 when there is none.
    pub fn redo(&mut self, tx_id: Option<&str>) -> Envelope {
        self.wrap(
            tx_id,
            OpSpec {
                name: "redo",
                permitted: Some(REDO_PERMITTED),
                cleanup: false,
                picker: Some(Picker::EarliestUndone),
            },
            |tm| tm.run_loop(LoopMode::Redo),
        )
    }

    /// List transactions, ordered by creation. With `detail`, the payload
    /// is the full records; without, just the string ids.
    pub fn list(
        &mut self,
        tx_id: Option<&str>,
        status: Option<TxStatus>,
        detail: bool,
    ) -> Envelope {
        let tx_id = tx_id.map(str::to_string);
        self.wrap_readonly("list", move |tm| {
            let recs = tm.store.list_tx(tx_id.as_deref(), status)?;
            let payload = if detail {
                serde_json::to_value(&recs)
                    .map_err(|e| LoopError::env(format!("cannot encode records: {}", e)))?
            } else {
                Value::Array(
                    recs.into_iter()
                        .map(|r| Value::from(r.str_id))
                        .collect(),
                )
            };
            Ok(Envelope::ok().with_payload(payload))
        })
    }

    /// Discard a finished transaction (`C`, `U` or `X`): delete its record,
    /// both call logs, and its trash/tmp directories.
    pub fn discard(&mut self, tx_id: Option<&str>) -> Envelope {
        self.wrap(
            tx_id,
            OpSpec {
                name: "discard",
                permitted: Some(DISCARD_PERMITTED),
                cleanup: false,
                picker: None,
            },
            |tm| {
                let rec = tm.current_checked()?;
                tm.discard_one(&rec)?;
                Ok(Envelope::ok())
            },
        )
    }

    /// Discard every finished transaction. The payload lists the ids that
    /// were discarded.
    pub fn discard_all(&mut self) -> Envelope {
        self.wrap_readonly("discard_all", |tm| {
            let recs = tm.store.list_discardable()?;
            let mut discarded = Vec::with_capacity(recs.len());
            for rec in recs {
                tm.discard_one(&rec)?;
                discarded.push(Value::from(rec.str_id));
            }
            Ok(Envelope::ok().with_payload(Value::Array(discarded)))
        })
    }

    /// Per-transaction trash directory, created on first request. Needs a
    /// current transaction (412 otherwise).
    pub fn get_trash_dir(&mut self) -> Envelope {
        self.get_tx_subdir(true)
    }

    /// Per-transaction tmp directory, created on first request. Needs a
    /// current transaction (412 otherwise).
    pub fn get_tmp_dir(&mut self) -> Envelope {
        self.get_tx_subdir(false)
    }

    /// Reserved; answers 501.
    pub fn prepare(&mut self) -> Envelope {
        Envelope::new(codes::NOT_IMPLEMENTED, "prepare is not implemented")
    }

    /// Reserved; answers 501.
    pub fn savepoint(&mut self, _sp: &str) -> Envelope {
        Envelope::new(codes::NOT_IMPLEMENTED, "savepoints are not implemented")
    }

    /// Reserved; answers 501.
    pub fn release_savepoint(&mut self, _sp: &str) -> Envelope {
        Envelope::new(codes::NOT_IMPLEMENTED, "savepoints are not implemented")
    }

    // ------------------------------------------------------------------
    // The wrapper
    // ------------------------------------------------------------------

    fn wrap<F>(&mut self, tx_id: Option<&str>, spec: OpSpec, body: F) -> Envelope
    where
        F: FnOnce(&mut Self) -> Result<Envelope, LoopError>,
    {
        if let Err(e) = self.locker.acquire(LockKind::Shared) {
            return Envelope::new(codes::ENVIRONMENT, e.to_string());
        }
        let env = self.wrap_locked(tx_id, spec, body);
        self.locker.release();
        env
    }

    fn wrap_locked<F>(&mut self, tx_id: Option<&str>, spec: OpSpec, body: F) -> Envelope
    where
        F: FnOnce(&mut Self) -> Result<Envelope, LoopError>,
    {
        let tx_id = match self.resolve_tx_id(tx_id, &spec) {
            Ok(id) => id,
            Err(env) => return env,
        };
        let len = tx_id.chars().count();
        if len == 0 || len > MAX_TX_ID_LEN {
            return Envelope::new(
                codes::BAD_REQUEST,
                format!(
                    "transaction id must be 1..={} characters, got {}",
                    MAX_TX_ID_LEN, len
                ),
            );
        }
        if spec.cleanup {
            self.cleanup();
        }
        if let Err(e) = self.store.begin() {
            return Envelope::new(
                codes::ENVIRONMENT,
                format!("cannot open SQL transaction: {}", e),
            );
        }
        let env = self.wrap_in_sqltx(&tx_id, &spec, body);
        // The body may already have exited the SQL transaction (the call
        // loop does); both calls below are no-ops then.
        let finish = if env.is_success() || !env.wants_sql_rollback() {
            self.store.commit()
        } else {
            self.store.rollback()
        };
        if let Err(e) = finish {
            return Envelope::new(
                codes::ENVIRONMENT,
                format!("cannot finish SQL transaction: {}", e),
            );
        }
        env
    }

    fn wrap_in_sqltx<F>(&mut self, tx_id: &str, spec: &OpSpec, body: F) -> Envelope
    where
        F: FnOnce(&mut Self) -> Result<Envelope, LoopError>,
    {
        let rec = match self.store.get_tx_by_str_id(tx_id) {
            Ok(rec) => rec,
            Err(e) => return Envelope::new(codes::ENVIRONMENT, format!("database error: {}", e)),
        };
        self.cur = rec.clone();
        if let Some(permitted) = spec.permitted {
            match &rec {
                None => {
                    return Envelope::new(
                        codes::NO_SUCH_TX,
                        format!("no transaction with id '{}'", tx_id),
                    )
                }
                Some(r) if !permitted.contains(&r.status) => {
                    return Envelope::new(
                        codes::WRONG_TX_STATUS,
                        format!(
                            "transaction '{}' has status '{}' ({}), which {} does not accept",
                            tx_id,
                            r.status,
                            r.status.describe(),
                            spec.name
                        ),
                    )
                }
                _ => {}
            }
        }
        match body(self) {
            Ok(env) => env,
            Err(e) => e.to_envelope(),
        }
    }

    fn wrap_readonly<F>(&mut self, name: &'static str, body: F) -> Envelope
    where
        F: FnOnce(&mut Self) -> Result<Envelope, LoopError>,
    {
        if let Err(e) = self.locker.acquire(LockKind::Shared) {
            return Envelope::new(codes::ENVIRONMENT, e.to_string());
        }
        debug!(op = name, "read-side operation");
        let env = match body(self) {
            Ok(env) => env,
            Err(e) => e.to_envelope(),
        };
        self.locker.release();
        env
    }

    /// Resolve the transaction id: explicit argument, then the operation's
    /// picker, then the sticky default.
    fn resolve_tx_id(&mut self, tx_id: Option<&str>, spec: &OpSpec) -> Result<String, Envelope> {
        if let Some(id) = tx_id {
            return Ok(id.to_string());
        }
        match spec.picker {
            Some(Picker::LatestCommitted) => match self.store.latest_committed() {
                Ok(Some(rec)) => Ok(rec.str_id),
                Ok(None) => Err(Envelope::new(
                    codes::PRECONDITION_FAILED,
                    "there is no committed transaction to undo",
                )),
                Err(e) => Err(Envelope::new(
                    codes::ENVIRONMENT,
                    format!("database error: {}", e),
                )),
            },
            Some(Picker::EarliestUndone) => match self.store.earliest_undone() {
                Ok(Some(rec)) => Ok(rec.str_id),
                Ok(None) => Err(Envelope::new(
                    codes::PRECONDITION_FAILED,
                    "there is no undone transaction to redo",
                )),
                Err(e) => Err(Envelope::new(
                    codes::ENVIRONMENT,
                    format!("database error: {}", e),
                )),
            },
            None => match &self.sticky_tx_id {
                Some(id) => Ok(id.clone()),
                None => Err(Envelope::new(
                    codes::BAD_REQUEST,
                    format!("no transaction id given for {}", spec.name),
                )),
            },
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn current_checked(&self) -> Result<TxRecord, LoopError> {
        self.cur
            .clone()
            .ok_or_else(|| LoopError::new(codes::INTERNAL, "no current transaction"))
    }

    fn discard_one(&mut self, rec: &TxRecord) -> Result<(), LoopError> {
        self.store.delete_calls(CallTable::Forward, rec.ser_id)?;
        self.store.delete_calls(CallTable::Undo, rec.ser_id)?;
        self.store.delete_tx(rec.ser_id)?;
        for dir in [
            self.store.trash_dir(rec.ser_id),
            self.store.tmp_dir(rec.ser_id),
        ] {
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %e, "could not remove transaction directory");
                }
            }
        }
        if self.sticky_tx_id.as_deref() == Some(rec.str_id.as_str()) {
            self.sticky_tx_id = None;
        }
        if self.cur.as_ref().map(|c| c.ser_id) == Some(rec.ser_id) {
            self.cur = None;
        }
        debug!(tx = %rec.str_id, "discarded");
        Ok(())
    }

    fn get_tx_subdir(&mut self, trash: bool) -> Envelope {
        let Some(rec) = self.cur.as_ref() else {
            return Envelope::new(
                codes::PRECONDITION_FAILED,
                "no current transaction to own the directory",
            );
        };
        let dir = if trash {
            self.store.trash_dir(rec.ser_id)
        } else {
            self.store.tmp_dir(rec.ser_id)
        };
        if let Err(e) = fs::create_dir_all(&dir) {
            return Envelope::new(
                codes::ENVIRONMENT,
                format!("cannot create {}: {}", dir.display(), e),
            );
        }
        Envelope::ok().with_payload(Value::from(dir.to_string_lossy().into_owned()))
    }
}

/// Builder for [`TxManager`].
///
/// ```ignore
/// let tm = TxManager::builder()
///     .data_dir("/var/lib/myapp/tx")
///     .registry(registry)
///     .open()?;
/// ```
pub struct TxManagerBuilder {
    data_dir: Option<PathBuf>,
    registry: Option<Arc<dyn FuncRegistry>>,
    lock_retry: Option<Vec<Duration>>,
}

impl TxManagerBuilder {
    /// A builder with nothing configured.
    pub fn new() -> Self {
        TxManagerBuilder {
            data_dir: None,
            registry: None,
            lock_retry: None,
        }
    }

    /// Where the database, lock sidecar and per-transaction directories
    /// live. Defaults to `$HOME/.rewind`.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// The function registry; required.
    pub fn registry(mut self, registry: Arc<dyn FuncRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the lock retry schedule. Tests pass milliseconds; the
    /// default is the 1..=5 second linear backoff.
    pub fn lock_retry(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.lock_retry = Some(delays.into_iter().collect());
        self
    }

    /// Open the store, then run crash recovery under the exclusive lock.
    /// An incompatible schema version fails here; everything after
    /// construction answers with envelopes instead of errors.
    pub fn open(self) -> Result<TxManager, EngineError> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".rewind"))
                .ok_or(EngineError::NoDataDir)?,
        };
        let registry = self.registry.ok_or(EngineError::NoRegistry)?;

        let store = Store::open(&data_dir)?;
        let locker = match self.lock_retry {
            Some(delays) => Locker::with_retry(store.lock_path(), delays),
            None => Locker::new(store.lock_path()),
        };
        let mut tm = TxManager {
            store,
            locker,
            registry,
            cur: None,
            sticky_tx_id: None,
            in_rollback: false,
            temp_dir: None,
        };
        tm.recover_on_open()?;
        Ok(tm)
    }

    /// Open a manager on a fresh temporary directory.
    ///
    /// The directory lives as long as the manager and is removed when it
    /// is dropped. Useful for tests and throwaway work; everything else
    /// behaves exactly like [`open`](Self::open), recovery included.
    pub fn open_temp(self) -> Result<TxManager, EngineError> {
        let dir = tempfile::tempdir()?;
        let mut tm = self.data_dir(dir.path()).open()?;
        tm.temp_dir = Some(dir);
        Ok(tm)
    }
}

impl Default for TxManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
