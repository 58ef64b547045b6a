//! SQLite-backed store

use rewind_core::status::TxStatus;
use rewind_core::record::{CallRecord, TxRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Database file name inside the data directory.
pub const DB_FILE: &str = "tx.db";

/// Lock sidecar file name. The lock is never taken on the database file
/// itself; that would collide with SQLite's own OS-level locking.
pub const LOCK_FILE: &str = "tx.db.lck";

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 4;

const TRASH_DIR: &str = ".trash";
const TMP_DIR: &str = ".tmp";

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure while preparing the data directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The data directory was written by an older schema. Fatal at
    /// construction: silently upgrading would destroy user data.
    #[error(
        "data directory has schema version {found}, this build requires {SCHEMA_VERSION}; \
         migrate the data directory or downgrade to a matching release"
    )]
    SchemaTooOld {
        /// Version found in `_meta`.
        found: i64,
    },

    /// The data directory was written by a schema this build predates.
    /// Also fatal; there is nothing to migrate, only a newer release to
    /// run.
    #[error("data directory has schema version {found}, newer than this build's {SCHEMA_VERSION}")]
    SchemaTooNew {
        /// Version found in `_meta`.
        found: i64,
    },

    /// A persisted row that cannot be decoded (bad status char, bad args
    /// JSON, unparsable metadata).
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// `begin` while a SQL transaction is already open.
    #[error("SQL transaction already open")]
    NestedSqlTx,
}

type Result<T> = std::result::Result<T, StoreError>;

/// Which of the two structurally identical call tables to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTable {
    /// The forward log (`call`).
    Forward,
    /// The inverse log (`undo_call`).
    Undo,
}

impl CallTable {
    /// The other table.
    pub fn opposite(self) -> Self {
        match self {
            CallTable::Forward => CallTable::Undo,
            CallTable::Undo => CallTable::Forward,
        }
    }

    fn sql_name(self) -> &'static str {
        match self {
            CallTable::Forward => "call",
            CallTable::Undo => "undo_call",
        }
    }
}

/// The persistence layer: one connection, one data directory.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    data_dir: PathBuf,
    sqltx_open: bool,
    last_ctime: f64,
}

impl Store {
    /// Open (or create) the store under `data_dir`.
    ///
    /// Ensures the directory and its `.trash`/`.tmp` subdirectories exist,
    /// creates the tables on first use, and verifies the schema version.
    /// A version other than [`SCHEMA_VERSION`] fails construction; this is
    /// the one non-recoverable error in the system.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(data_dir.join(TRASH_DIR))?;
        fs::create_dir_all(data_dir.join(TMP_DIR))?;

        let conn = Connection::open(data_dir.join(DB_FILE))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tx (
                 ser_id       INTEGER PRIMARY KEY AUTOINCREMENT,
                 str_id       TEXT NOT NULL UNIQUE,
                 owner_id     TEXT NOT NULL DEFAULT '',
                 summary      TEXT,
                 status       TEXT NOT NULL,
                 ctime        REAL NOT NULL,
                 commit_time  REAL,
                 last_call_id INTEGER
             );
             CREATE TABLE IF NOT EXISTS \"call\" (
                 id        INTEGER PRIMARY KEY AUTOINCREMENT,
                 tx_ser_id INTEGER NOT NULL REFERENCES tx(ser_id),
                 sp        TEXT UNIQUE,
                 ctime     REAL NOT NULL,
                 f         TEXT NOT NULL,
                 args      TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS undo_call (
                 id        INTEGER PRIMARY KEY AUTOINCREMENT,
                 tx_ser_id INTEGER NOT NULL REFERENCES tx(ser_id),
                 sp        TEXT UNIQUE,
                 ctime     REAL NOT NULL,
                 f         TEXT NOT NULL,
                 args      TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS _meta (
                 name  TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;

        let version: Option<String> = conn
            .query_row("SELECT value FROM _meta WHERE name = 'v'", [], |row| {
                row.get(0)
            })
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO _meta (name, value) VALUES ('v', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(raw) => {
                let found: i64 = raw
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("schema version {:?}", raw)))?;
                if found < SCHEMA_VERSION {
                    return Err(StoreError::SchemaTooOld { found });
                }
                if found > SCHEMA_VERSION {
                    return Err(StoreError::SchemaTooNew { found });
                }
            }
        }

        debug!(dir = %data_dir.display(), "store opened");
        Ok(Store {
            conn,
            data_dir,
            sqltx_open: false,
            last_ctime: 0.0,
        })
    }

    /// The data directory this store lives in.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the lock sidecar next to the database file.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    /// Per-transaction trash directory path (not created here).
    pub fn trash_dir(&self, ser_id: i64) -> PathBuf {
        self.data_dir.join(TRASH_DIR).join(ser_id.to_string())
    }

    /// Per-transaction tmp directory path (not created here).
    pub fn tmp_dir(&self, ser_id: i64) -> PathBuf {
        self.data_dir.join(TMP_DIR).join(ser_id.to_string())
    }

    /// Current time in seconds since epoch, strictly increasing across
    /// calls on this store. A clock tie (or a clock step backwards) is
    /// bumped by one microsecond so that `(ctime, id)` stays a total order.
    pub fn now(&mut self) -> f64 {
        let mut t = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        if t <= self.last_ctime {
            t = self.last_ctime + 1e-6;
        }
        self.last_ctime = t;
        t
    }

    // ------------------------------------------------------------------
    // SQL transaction boundary
    // ------------------------------------------------------------------

    /// Open a SQL-level transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.sqltx_open {
            return Err(StoreError::NestedSqlTx);
        }
        self.conn.execute_batch("BEGIN")?;
        self.sqltx_open = true;
        Ok(())
    }

    /// Commit the open SQL transaction; a no-op when none is open.
    pub fn commit(&mut self) -> Result<()> {
        if self.sqltx_open {
            self.conn.execute_batch("COMMIT")?;
            self.sqltx_open = false;
        }
        Ok(())
    }

    /// Roll back the open SQL transaction; a no-op when none is open.
    pub fn rollback(&mut self) -> Result<()> {
        if self.sqltx_open {
            self.conn.execute_batch("ROLLBACK")?;
            self.sqltx_open = false;
        }
        Ok(())
    }

    /// Whether a SQL transaction is currently open.
    pub fn in_sqltx(&self) -> bool {
        self.sqltx_open
    }

    // ------------------------------------------------------------------
    // tx table
    // ------------------------------------------------------------------

    /// Insert a new transaction with status `i` and return the full record.
    pub fn insert_tx(
        &mut self,
        str_id: &str,
        owner_id: &str,
        summary: Option<&str>,
    ) -> Result<TxRecord> {
        let ctime = self.now();
        self.conn.execute(
            "INSERT INTO tx (str_id, owner_id, summary, status, ctime) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                str_id,
                owner_id,
                summary,
                TxStatus::InProgress.to_char().to_string(),
                ctime
            ],
        )?;
        Ok(TxRecord {
            ser_id: self.conn.last_insert_rowid(),
            str_id: str_id.to_string(),
            owner_id: owner_id.to_string(),
            summary: summary.map(str::to_string),
            status: TxStatus::InProgress,
            ctime,
            commit_time: None,
            last_call_id: None,
        })
    }

    /// Look a transaction up by its caller-supplied id.
    pub fn get_tx_by_str_id(&self, str_id: &str) -> Result<Option<TxRecord>> {
        self.select_one_tx("WHERE str_id = ?1", params![str_id])
    }

    /// Look a transaction up by its serial id.
    pub fn get_tx_by_ser_id(&self, ser_id: i64) -> Result<Option<TxRecord>> {
        self.select_one_tx("WHERE ser_id = ?1", params![ser_id])
    }

    /// Write a new status, optionally clearing the resume marker in the
    /// same statement (done whenever the status moves to a *new* transient
    /// state, so a stale marker can never leak into the next operation).
    pub fn set_tx_status(
        &mut self,
        ser_id: i64,
        status: TxStatus,
        clear_last_call_id: bool,
    ) -> Result<()> {
        let sql = if clear_last_call_id {
            "UPDATE tx SET status = ?1, last_call_id = NULL WHERE ser_id = ?2"
        } else {
            "UPDATE tx SET status = ?1 WHERE ser_id = ?2"
        };
        let n = self
            .conn
            .execute(sql, params![status.to_char().to_string(), ser_id])?;
        if n != 1 {
            return Err(StoreError::Corrupt(format!(
                "status update touched {} rows for tx {}",
                n, ser_id
            )));
        }
        Ok(())
    }

    /// Record the commit time.
    pub fn set_commit_time(&mut self, ser_id: i64, t: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE tx SET commit_time = ?1 WHERE ser_id = ?2",
            params![t, ser_id],
        )?;
        Ok(())
    }

    /// Advance (or clear) the resume marker. Both the marker and the owning
    /// transaction id are bound; the marker is meaningless without its row.
    pub fn set_last_call_id(&mut self, ser_id: i64, last_call_id: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE tx SET last_call_id = ?1 WHERE ser_id = ?2",
            params![last_call_id, ser_id],
        )?;
        Ok(())
    }

    /// Delete a transaction row.
    pub fn delete_tx(&mut self, ser_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM tx WHERE ser_id = ?1", params![ser_id])?;
        Ok(())
    }

    /// List transactions, optionally filtered, ordered `(ctime, ser_id)`
    /// ascending.
    pub fn list_tx(
        &self,
        str_id: Option<&str>,
        status: Option<TxStatus>,
    ) -> Result<Vec<TxRecord>> {
        let status_char = status.map(|s| s.to_char().to_string());
        self.select_many_tx(
            "WHERE (?1 IS NULL OR str_id = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY ctime ASC, ser_id ASC",
            params![str_id, status_char],
        )
    }

    /// Every transaction not yet in a terminal status, newest first. This
    /// is the recovery scan.
    pub fn list_nonterminal(&self) -> Result<Vec<TxRecord>> {
        self.select_many_tx(
            "WHERE status IN ('i','a','u','d','v','e') ORDER BY ctime DESC, ser_id DESC",
            params![],
        )
    }

    /// Every transaction in a discardable terminal status (`C`, `U`, `X`).
    pub fn list_discardable(&self) -> Result<Vec<TxRecord>> {
        self.select_many_tx(
            "WHERE status IN ('C','U','X') ORDER BY ctime ASC, ser_id ASC",
            params![],
        )
    }

    /// Default undo candidate: the most recently committed transaction.
    pub fn latest_committed(&self) -> Result<Option<TxRecord>> {
        self.select_one_tx(
            "WHERE status = 'C' ORDER BY commit_time DESC, ser_id DESC LIMIT 1",
            params![],
        )
    }

    /// Default redo candidate: the earliest undone transaction.
    pub fn earliest_undone(&self) -> Result<Option<TxRecord>> {
        self.select_one_tx(
            "WHERE status = 'U' ORDER BY commit_time ASC, ser_id ASC LIMIT 1",
            params![],
        )
    }

    // ------------------------------------------------------------------
    // call / undo_call tables
    // ------------------------------------------------------------------

    /// Append one call row and return its id.
    pub fn insert_call(
        &mut self,
        table: CallTable,
        tx_ser_id: i64,
        sp: Option<&str>,
        f: &str,
        args: &Map<String, Value>,
    ) -> Result<i64> {
        let ctime = self.now();
        let args_text = serde_json::to_string(args)
            .map_err(|e| StoreError::Corrupt(format!("cannot serialize args: {}", e)))?;
        self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (tx_ser_id, sp, ctime, f, args) VALUES (?1, ?2, ?3, ?4, ?5)",
                table.sql_name()
            ),
            params![tx_ser_id, sp, ctime, f, args_text],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Read a transaction's call program from one table, ordered
    /// `(ctime, id)` and reversed on request.
    ///
    /// `resume_after` is the resume cursor: the id of the last *completed*
    /// row. That row is always excluded; reversed reads keep rows at or
    /// before its ctime, forward reads keep rows at or after it. A cursor
    /// whose row no longer exists disables the filter (the only way that
    /// happens is a crash between a finalization delete and the final
    /// status write, and then the table is empty anyway).
    pub fn select_calls(
        &self,
        table: CallTable,
        tx_ser_id: i64,
        reverse: bool,
        resume_after: Option<i64>,
    ) -> Result<Vec<CallRecord>> {
        let cursor_ctime: Option<f64> = match resume_after {
            None => None,
            Some(id) => {
                let t = self
                    .conn
                    .query_row(
                        &format!("SELECT ctime FROM \"{}\" WHERE id = ?1", table.sql_name()),
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if t.is_none() {
                    warn!(table = table.sql_name(), id, "resume cursor row is gone; reading full program");
                }
                t
            }
        };

        let filter = match (cursor_ctime, reverse) {
            (None, _) => String::new(),
            (Some(_), true) => " AND ctime <= ?2 AND id != ?3".to_string(),
            (Some(_), false) => " AND ctime >= ?2 AND id != ?3".to_string(),
        };
        let sql = format!(
            "SELECT id, tx_ser_id, sp, ctime, f, args FROM \"{}\" \
             WHERE tx_ser_id = ?1{} ORDER BY ctime ASC, id ASC",
            table.sql_name(),
            filter
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(i64, i64, Option<String>, f64, String, String)> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        };
        let raw: Vec<_> = match cursor_ctime {
            None => stmt
                .query_map(params![tx_ser_id], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            Some(t) => stmt
                .query_map(params![tx_ser_id, t, resume_after], map_row)?
                .collect::<rusqlite::Result<_>>()?,
        };

        let mut calls = Vec::with_capacity(raw.len());
        for (id, tx_ser_id, sp, ctime, f, args_text) in raw {
            let args: Map<String, Value> = serde_json::from_str(&args_text).map_err(|e| {
                StoreError::Corrupt(format!("call {} has bad args: {}", id, e))
            })?;
            calls.push(CallRecord {
                id,
                tx_ser_id,
                sp,
                ctime,
                f,
                args,
            });
        }
        if reverse {
            calls.reverse();
        }
        Ok(calls)
    }

    /// Drop a transaction's rows from one table.
    pub fn delete_calls(&mut self, table: CallTable, tx_ser_id: i64) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM \"{}\" WHERE tx_ser_id = ?1", table.sql_name()),
            params![tx_ser_id],
        )?;
        Ok(())
    }

    /// Count a transaction's rows in one table.
    pub fn count_calls(&self, table: CallTable, tx_ser_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM \"{}\" WHERE tx_ser_id = ?1",
                table.sql_name()
            ),
            params![tx_ser_id],
            |row| row.get(0),
        )?)
    }

    // ------------------------------------------------------------------
    // row mapping
    // ------------------------------------------------------------------

    fn select_one_tx(
        &self,
        tail: &str,
        bind: impl rusqlite::Params,
    ) -> Result<Option<TxRecord>> {
        let sql = format!(
            "SELECT ser_id, str_id, owner_id, summary, status, ctime, commit_time, last_call_id \
             FROM tx {}",
            tail
        );
        let raw = self
            .conn
            .query_row(&sql, bind, Self::tx_row_fields)
            .optional()?;
        raw.map(Self::tx_from_fields).transpose()
    }

    fn select_many_tx(&self, tail: &str, bind: impl rusqlite::Params) -> Result<Vec<TxRecord>> {
        let sql = format!(
            "SELECT ser_id, str_id, owner_id, summary, status, ctime, commit_time, last_call_id \
             FROM tx {}",
            tail
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw: Vec<_> = stmt
            .query_map(bind, Self::tx_row_fields)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter().map(Self::tx_from_fields).collect()
    }

    #[allow(clippy::type_complexity)]
    fn tx_row_fields(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(i64, String, String, Option<String>, String, f64, Option<f64>, Option<i64>)>
    {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    fn tx_from_fields(
        (ser_id, str_id, owner_id, summary, status, ctime, commit_time, last_call_id): (
            i64,
            String,
            String,
            Option<String>,
            String,
            f64,
            Option<f64>,
            Option<i64>,
        ),
    ) -> Result<TxRecord> {
        let status_char = match (status.chars().next(), status.len()) {
            (Some(c), 1) => c,
            _ => return Err(StoreError::Corrupt(format!("status {:?}", status))),
        };
        let status = TxStatus::from_char(status_char)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(TxRecord {
            ser_id,
            str_id,
            owner_id,
            summary,
            status,
            ctime,
            commit_time,
            last_call_id,
        })
    }
}
