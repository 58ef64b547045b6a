//! Crash recovery
//!
//! Construction is the recovery path: before a manager is handed out, every
//! transaction left in a non-terminal status by a previous process is
//! driven to a terminal one through the internal rollback, under the
//! exclusive file lock so two recoveries can never race. Individual
//! failures are logged and leave the transaction as-is (a failed rollback
//! marks it `X`); they never abort construction.
//!
//! The cleanup hook that `begin` runs is the quota side of the same
//! routine. Quotas (transaction counts, ages) are not enforced, so the
//! hook currently does nothing; it deliberately does *not* roll back
//! non-terminal transactions, which under a shared lock could belong to
//! another live process.

use crate::call_loop::LoopMode;
use crate::error::EngineError;
use crate::manager::TxManager;
use rewind_concurrency::LockKind;
use tracing::{debug, info, warn};

impl TxManager {
    /// Roll interrupted transactions back to a terminal status. Called
    /// once, from the builder, before the manager is handed out.
    pub(crate) fn recover_on_open(&mut self) -> Result<(), EngineError> {
        self.locker.acquire(LockKind::Exclusive)?;
        let result = self.recover_all();
        self.locker.release();
        result
    }

    fn recover_all(&mut self) -> Result<(), EngineError> {
        let pending = self.store.list_nonterminal()?;
        if pending.is_empty() {
            debug!("recovery: nothing interrupted");
            return Ok(());
        }
        info!(count = pending.len(), "recovering interrupted transactions");
        for rec in pending {
            let str_id = rec.str_id.clone();
            let status = rec.status;
            self.cur = Some(rec);
            match self.run_loop(LoopMode::Rollback) {
                Ok(_) => info!(tx = %str_id, from = %status, "recovered"),
                Err(e) => {
                    warn!(tx = %str_id, from = %status, error = %e, "recovery failed")
                }
            }
        }
        self.cur = None;
        Ok(())
    }

    /// The `begin`-time cleanup hook: purge transactions past their
    /// quotas. No quota policy is configured, so there is nothing to do.
    pub(crate) fn cleanup(&mut self) {
        debug!("cleanup: no quota policy configured");
    }
}
