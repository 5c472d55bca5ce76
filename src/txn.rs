//! Explicit multi-operation transactions (§4.9): an opt-in alternative to each
//! top-level call's own short critical section, for a caller that needs several
//! operations to commit or roll back together.
//!
//! `{Off, On, Timeout}` mirrors the held lock: starting a transaction acquires it for
//! the whole sequence instead of per-call, and every write made while one is open goes
//! through the patch table instead of the buffer directly. Letting the held lock's
//! deadline lapse moves the transaction to `Timeout`, at which point only `rollback` is
//! accepted — committing against a deadline that may already have let another process
//! steal the lock would silently lose that other process's writes.

use eonix_errno::{Errno, KResult};

use crate::api::CozyFs;
use crate::backup;
use crate::lock::{self, Acquired};
use crate::sysif::SystemInterface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Off,
    On,
    Timeout,
}

impl<S: SystemInterface> CozyFs<'_, S> {
    /// Begin a transaction: acquire the lock for the whole sequence and start patching
    /// pages instead of writing them directly. Fails with `EINVAL` if one is already
    /// open. If the acquired lock reveals a crashed prior holder, restores the backup
    /// half first, exactly like [`enter_critical`](Self::enter_critical) does for a
    /// single operation — a transaction beginning right after a crash must not start
    /// mutating from the corrupted half.
    pub fn transaction_begin(&mut self) -> KResult<()> {
        if self.txn_state != TxnState::Off {
            return Err(Errno::Einval);
        }
        let timeout_ms = self.config.acquire_timeout_secs.saturating_mul(1000);
        let hold_for_ms = self.config.transaction_refresh_secs as u64 * 1000;
        let acquired = lock::acquire(self.buf, &mut self.sysif, timeout_ms, hold_for_ms)?;
        if acquired.crashed {
            log::warn!("transaction recovered the lock from a holder past its deadline");
            let half_len = self.half_len;
            if !backup::restore_backup(self.buf, half_len) {
                log::warn!("no backup configured; buffer left in its crashed state");
                let _ = lock::release(self.buf, &mut self.sysif, acquired.ticket);
                return Err(Errno::Ecorrupt);
            }
        }
        self.held = Some(acquired);
        self.txn_state = TxnState::On;
        Ok(())
    }

    /// Apply every patch collected since `transaction_begin`, release the lock, and
    /// return to `Off`. Fails with `ETIMEDOUT` (discarding all patches) if the lock's
    /// deadline lapsed before the commit could land, or if the conflict check below
    /// finds another process wrote one of the same pages in the meantime.
    pub fn transaction_commit(&mut self) -> KResult<()> {
        match self.txn_state {
            TxnState::Off => return Err(Errno::Einval),
            TxnState::Timeout => {
                self.patches.discard(&mut self.sysif);
                self.txn_state = TxnState::Off;
                self.held = None;
                return Err(Errno::Etimedout);
            }
            TxnState::On => {}
        }

        let ticket = self.held.as_ref().expect("ON state always holds the lock").ticket;
        if !lock::is_held_with_ticket(self.buf, ticket) {
            self.patches.discard(&mut self.sysif);
            self.txn_state = TxnState::Off;
            self.held = None;
            return Err(Errno::Etimedout);
        }

        let vh = backup::read_volatile(self.buf);
        let half_base = backup::active_base(self.half_len, vh.backup);
        let half_len = self.half_len;
        let half = &mut self.buf[half_base..half_base + half_len];

        if self.patches.has_conflict(half) {
            log::warn!("transaction commit aborted: a patched page changed underneath it");
            self.patches.discard(&mut self.sysif);
            self.txn_state = TxnState::Off;
            if self.held.take().is_some() {
                lock::release(self.buf, &mut self.sysif, ticket)?;
            }
            return Err(Errno::Etimedout);
        }

        self.patches.drain_into(half, &mut self.sysif);

        self.txn_state = TxnState::Off;
        if self.held.take().is_some() {
            lock::release(self.buf, &mut self.sysif, ticket)?;
        }
        Ok(())
    }

    /// Discard every patch collected since `transaction_begin`, release the lock, and
    /// return to `Off`.
    pub fn transaction_rollback(&mut self) -> KResult<()> {
        if self.txn_state == TxnState::Off {
            return Err(Errno::Einval);
        }
        self.patches.discard(&mut self.sysif);
        self.txn_state = TxnState::Off;
        if let Some(Acquired { ticket, .. }) = self.held.take() {
            lock::release(self.buf, &mut self.sysif, ticket)?;
        }
        Ok(())
    }

    /// Idle-time maintenance: refresh a held transaction's lock deadline, or — outside
    /// one — take the short critical section and run a backup cycle if due.
    pub fn idle(&mut self) -> KResult<()> {
        if self.txn_state == TxnState::On {
            return self.refresh_transaction_lock();
        }
        self.enter_critical()?;
        self.leave_critical()
    }
}
