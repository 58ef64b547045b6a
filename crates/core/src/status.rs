//! Transaction status machine
//!
//! A transaction is always in exactly one of ten states. Four are terminal
//! (`C`, `R`, `U`, `X`); the other six mark work in flight. The transient
//! states `a`, `u`, `d`, `v`, `e` are written *before* the call loop starts
//! executing, so a crash at any point leaves a status that recovery can
//! finish from.
//!
//! The persisted form is a single character for compatibility with existing
//! data directories; in code the status is always this enum.

use crate::error::CoreError;
use std::fmt;

/// Status of a logical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// `i` — in progress: accepting calls.
    InProgress,
    /// `a` — aborting: rolling back an in-progress transaction.
    Aborting,
    /// `u` — undoing a committed transaction.
    Undoing,
    /// `d` — redoing an undone transaction.
    Redoing,
    /// `v` — aborting an undo.
    UndoAborting,
    /// `e` — aborting a redo.
    RedoAborting,
    /// `C` — committed (terminal).
    Committed,
    /// `R` — rolled back (terminal).
    RolledBack,
    /// `U` — committed, then undone (terminal).
    Undone,
    /// `X` — inconsistent: a rollback itself failed (terminal).
    Inconsistent,
}

/// The operations that drive status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Execute forward calls; no status transition.
    Call,
    /// Roll back whatever is in flight.
    Rollback,
    /// Undo a committed transaction.
    Undo,
    /// Redo an undone transaction.
    Redo,
}

/// All ten statuses, in a fixed order.
pub const ALL_STATUSES: [TxStatus; 10] = [
    TxStatus::InProgress,
    TxStatus::Aborting,
    TxStatus::Undoing,
    TxStatus::Redoing,
    TxStatus::UndoAborting,
    TxStatus::RedoAborting,
    TxStatus::Committed,
    TxStatus::RolledBack,
    TxStatus::Undone,
    TxStatus::Inconsistent,
];

impl TxStatus {
    /// Persisted single-character code.
    pub fn to_char(self) -> char {
        match self {
            TxStatus::InProgress => 'i',
            TxStatus::Aborting => 'a',
            TxStatus::Undoing => 'u',
            TxStatus::Redoing => 'd',
            TxStatus::UndoAborting => 'v',
            TxStatus::RedoAborting => 'e',
            TxStatus::Committed => 'C',
            TxStatus::RolledBack => 'R',
            TxStatus::Undone => 'U',
            TxStatus::Inconsistent => 'X',
        }
    }

    /// Parse the persisted code; unknown codes are an error, never a guess.
    pub fn from_char(c: char) -> Result<Self, CoreError> {
        Ok(match c {
            'i' => TxStatus::InProgress,
            'a' => TxStatus::Aborting,
            'u' => TxStatus::Undoing,
            'd' => TxStatus::Redoing,
            'v' => TxStatus::UndoAborting,
            'e' => TxStatus::RedoAborting,
            'C' => TxStatus::Committed,
            'R' => TxStatus::RolledBack,
            'U' => TxStatus::Undone,
            'X' => TxStatus::Inconsistent,
            other => return Err(CoreError::UnknownStatus(other)),
        })
    }

    /// Terminal statuses are never touched by recovery.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxStatus::Committed | TxStatus::RolledBack | TxStatus::Undone | TxStatus::Inconsistent
        )
    }

    /// Mid-operation statuses: recovery drives these to a terminal state.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TxStatus::Aborting
                | TxStatus::Undoing
                | TxStatus::Redoing
                | TxStatus::UndoAborting
                | TxStatus::RedoAborting
        )
    }

    /// Human-readable name, used in wrong-status error messages.
    pub fn describe(self) -> &'static str {
        match self {
            TxStatus::InProgress => "in progress",
            TxStatus::Aborting => "aborting",
            TxStatus::Undoing => "undoing",
            TxStatus::Redoing => "redoing",
            TxStatus::UndoAborting => "aborting an undo",
            TxStatus::RedoAborting => "aborting a redo",
            TxStatus::Committed => "committed",
            TxStatus::RolledBack => "rolled back",
            TxStatus::Undone => "undone",
            TxStatus::Inconsistent => "inconsistent",
        }
    }

    /// Transition table for an operation, from this status.
    ///
    /// Returns `(transient, terminal_goal)` when the operation applies:
    ///
    /// - rollback: `i|a -> (a, R)`, `u|v -> (v, C)`, `d|e -> (e, U)`
    /// - undo: `C -> (u, U)`
    /// - redo: `U -> (d, C)`
    /// - call: never transitions
    ///
    /// The "from its own transient" rows (`a -> (a, R)` etc.) are what let a
    /// crashed operation resume: the transient status is unchanged, so the
    /// resume marker survives.
    pub fn transition(self, op: Op) -> Option<(TxStatus, TxStatus)> {
        match op {
            Op::Call => None,
            Op::Rollback => match self {
                TxStatus::InProgress | TxStatus::Aborting => {
                    Some((TxStatus::Aborting, TxStatus::RolledBack))
                }
                TxStatus::Undoing | TxStatus::UndoAborting => {
                    Some((TxStatus::UndoAborting, TxStatus::Committed))
                }
                TxStatus::Redoing | TxStatus::RedoAborting => {
                    Some((TxStatus::RedoAborting, TxStatus::Undone))
                }
                _ => None,
            },
            Op::Undo => match self {
                TxStatus::Committed => Some((TxStatus::Undoing, TxStatus::Undone)),
                _ => None,
            },
            Op::Redo => match self {
                TxStatus::Undone => Some((TxStatus::Redoing, TxStatus::Committed)),
                _ => None,
            },
        }
    }
}

// Display writes the persisted code; describe() is for prose.
impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

impl serde::Serialize for TxStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_char().to_string())
    }
}

impl<'de> serde::Deserialize<'de> for TxStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => TxStatus::from_char(c).map_err(serde::de::Error::custom),
            _ => Err(serde::de::Error::custom(format!(
                "expected a single status character, got {:?}",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_codes_round_trip() {
        for status in ALL_STATUSES {
            assert_eq!(TxStatus::from_char(status.to_char()).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_char_is_an_error() {
        assert!(matches!(
            TxStatus::from_char('z'),
            Err(CoreError::UnknownStatus('z'))
        ));
    }

    #[test]
    fn test_terminal_and_transient_are_disjoint() {
        for status in ALL_STATUSES {
            assert!(!(status.is_terminal() && status.is_transient()));
        }
        // `i` is neither: it is stable but not finished.
        assert!(!TxStatus::InProgress.is_terminal());
        assert!(!TxStatus::InProgress.is_transient());
    }

    #[test]
    fn test_rollback_transitions() {
        use TxStatus::*;
        assert_eq!(
            InProgress.transition(Op::Rollback),
            Some((Aborting, RolledBack))
        );
        assert_eq!(Aborting.transition(Op::Rollback), Some((Aborting, RolledBack)));
        assert_eq!(Undoing.transition(Op::Rollback), Some((UndoAborting, Committed)));
        assert_eq!(
            UndoAborting.transition(Op::Rollback),
            Some((UndoAborting, Committed))
        );
        assert_eq!(Redoing.transition(Op::Rollback), Some((RedoAborting, Undone)));
        assert_eq!(
            RedoAborting.transition(Op::Rollback),
            Some((RedoAborting, Undone))
        );
        for terminal in [Committed, RolledBack, Undone, Inconsistent] {
            assert_eq!(terminal.transition(Op::Rollback), None);
        }
    }

    #[test]
    fn test_undo_redo_transitions() {
        use TxStatus::*;
        assert_eq!(Committed.transition(Op::Undo), Some((Undoing, Undone)));
        assert_eq!(Undone.transition(Op::Redo), Some((Redoing, Committed)));
        for status in ALL_STATUSES {
            if status != Committed {
                assert_eq!(status.transition(Op::Undo), None);
            }
            if status != Undone {
                assert_eq!(status.transition(Op::Redo), None);
            }
        }
    }

    #[test]
    fn test_call_never_transitions() {
        for status in ALL_STATUSES {
            assert_eq!(status.transition(Op::Call), None);
        }
    }

    #[test]
    fn test_transitions_pair_transient_with_terminal() {
        for status in ALL_STATUSES {
            for op in [Op::Rollback, Op::Undo, Op::Redo] {
                if let Some((transient, goal)) = status.transition(op) {
                    assert!(transient.is_transient(), "{:?} via {:?}", status, op);
                    assert!(goal.is_terminal(), "{:?} via {:?}", status, op);
                }
            }
        }
    }

    #[test]
    fn test_serde_form_is_the_char_code() {
        let json = serde_json::to_string(&TxStatus::Committed).unwrap();
        assert_eq!(json, "\"C\"");
        let back: TxStatus = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(back, TxStatus::Aborting);
        assert!(serde_json::from_str::<TxStatus>("\"zz\"").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Parsing an arbitrary character either round-trips through
            // to_char or errors; it never guesses a status.
            #[test]
            fn prop_from_char_is_exact(c in any::<char>()) {
                match TxStatus::from_char(c) {
                    Ok(status) => prop_assert_eq!(status.to_char(), c),
                    Err(_) => prop_assert!(!ALL_STATUSES.iter().any(|s| s.to_char() == c)),
                }
            }
        }
    }
}
