//! Persisted data model
//!
//! `TxRecord` is one row of the `tx` table; `CallRecord` is one row of the
//! structurally identical `call` and `undo_call` tables. The storage layer
//! maps rows to these structs; everything above storage works only with
//! them.

use crate::status::TxStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A logical transaction as persisted in the `tx` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    /// Monotonic id assigned by the store on insert; identity inside the
    /// store (owns the per-transaction trash/tmp directories).
    pub ser_id: i64,
    /// Caller-supplied id, 1..=200 chars, unique across all transactions
    /// ever recorded; identity across the API.
    pub str_id: String,
    /// Opaque owner token, empty by default.
    pub owner_id: String,
    /// Optional free-text summary.
    pub summary: Option<String>,
    /// Current status.
    pub status: TxStatus,
    /// Creation time, seconds since epoch.
    pub ctime: f64,
    /// Set when the transaction first reaches `C`.
    pub commit_time: Option<f64>,
    /// Resume marker: id of the most recent call row the loop fully
    /// executed. Cleared whenever the status moves to a new transient
    /// state; irrelevant once the status is terminal.
    pub last_call_id: Option<i64>,
}

/// One persisted call, forward (`call` table) or inverse (`undo_call`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Per-table monotonic id.
    pub id: i64,
    /// Owning transaction (`tx.ser_id`).
    pub tx_ser_id: i64,
    /// Reserved savepoint label, unique per table.
    pub sp: Option<String>,
    /// Insertion time; strictly increasing per table within a batch.
    pub ctime: f64,
    /// Fully qualified function name.
    pub f: String,
    /// Caller arguments (reserved `-`-prefixed keys are never persisted).
    pub args: Map<String, Value>,
}
