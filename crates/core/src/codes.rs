//! Response status codes
//!
//! HTTP-like codes carried by every [`Envelope`](crate::Envelope). These are
//! frozen; collaborating functions and clients match on them.
//!
//! | Code | Meaning |
//! |------|---------|
//! | 200  | OK |
//! | 304  | No change / nothing to do |
//! | 400  | Bad request (malformed name, missing or over-long tx id) |
//! | 409  | Duplicate tx id at begin |
//! | 412  | Precondition failed (no current tx, non-transactional function, no undo/redo candidate) |
//! | 480  | Transaction has an incompatible status |
//! | 484  | No such transaction |
//! | 500  | Implementation bug / function load failure |
//! | 501  | Operation not implemented |
//! | 532  | Environmental failure (lock, database, rollback failure) |

/// OK.
pub const OK: u16 = 200;
/// No change / nothing to do.
pub const NOT_MODIFIED: u16 = 304;
/// Bad request.
pub const BAD_REQUEST: u16 = 400;
/// Duplicate transaction id at begin.
pub const DUPLICATE_TX: u16 = 409;
/// Precondition failed.
pub const PRECONDITION_FAILED: u16 = 412;
/// Transaction has an incompatible status.
pub const WRONG_TX_STATUS: u16 = 480;
/// No such transaction.
pub const NO_SUCH_TX: u16 = 484;
/// Implementation bug or function load failure.
pub const INTERNAL: u16 = 500;
/// Operation not implemented.
pub const NOT_IMPLEMENTED: u16 = 501;
/// Environmental failure: lock, database, or rollback failure.
pub const ENVIRONMENT: u16 = 532;

/// Whether a code counts as success for the wrapper's commit-or-rollback
/// decision (2xx and 3xx commit, everything else rolls back).
pub fn is_success(code: u16) -> bool {
    (200..400).contains(&code)
}
