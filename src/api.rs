//! The central engine handle (§4.1, §4.10) and buffer formatting/attachment.
//!
//! [`CozyFs`] is the single type every top-level operation hangs off; this module owns
//! its fields and the half-relative addressing every other module builds on. The
//! individual operations themselves (`mkdir`, `open`, `read`, `mkusr`, transactions...)
//! live in their own modules as further `impl<S: SystemInterface> CozyFs<'_, S>` blocks,
//! the way the teacher splits a large type's behavior across files by concern rather
//! than piling every method into one.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use eonix_errno::{Errno, KResult};

use crate::addr::{self, PatchTable};
use crate::backup;
use crate::buffer::{Entity, VolatileHeader, XPage, BACKUP_A, BACKUP_NONE, RPage};
use crate::config::{AttachConfig, InitConfig};
use crate::layout::{EntityFlags, Offset, NULL_OFFSET, PAGE_SIZE};
use crate::lock::{self, Acquired};
use crate::sysif::SystemInterface;
use crate::txn::TxnState;

/// A live attachment to a formatted buffer.
///
/// Holds the raw byte slice, the per-transaction copy-on-write patch table, and the
/// caller-supplied [`SystemInterface`] used for allocation, waiting and timing.
pub struct CozyFs<'buf, S: SystemInterface> {
    pub(crate) buf: &'buf mut [u8],
    pub(crate) half_len: usize,
    pub(crate) sysif: S,
    pub(crate) config: AttachConfig,
    pub(crate) patches: PatchTable,
    pub(crate) txn_state: TxnState,
    pub(crate) held: Option<Acquired>,
}

/// Format a freshly allocated buffer: lay down the volatile header page, an empty root
/// directory, and a free list covering every remaining page of each configured half.
///
/// `buf.len()` must be at least `PAGE_SIZE * 3` (header page plus two data pages) for a
/// single half, or `PAGE_SIZE + 2 * PAGE_SIZE * 2` if `config.backup` is set; anything
/// smaller fails with [`Errno::Enomem`].
pub fn init(buf: &mut [u8], config: InitConfig) -> KResult<()> {
    let half_len = backup::half_len(buf.len(), config.backup);
    buf.fill(0);

    let vh = VolatileHeader::new(0, if config.backup { BACKUP_A } else { BACKUP_NONE });
    vh.write_to(&mut buf[..core::mem::size_of::<VolatileHeader>()])
        .expect("volatile header page is at least size_of::<VolatileHeader>() bytes");

    format_half(&mut buf[backup::VOLATILE_PAGE_LEN..][..half_len], half_len)?;

    if config.backup {
        let (first, second) = buf[backup::VOLATILE_PAGE_LEN..].split_at_mut(half_len);
        second.copy_from_slice(first);
    }

    Ok(())
}

fn format_half(half: &mut [u8], half_len: usize) -> KResult<()> {
    let num_pages = (half_len / PAGE_SIZE) as u32;
    if num_pages < 2 {
        return Err(Errno::Enomem);
    }

    let mut free_head = NULL_OFFSET;
    for page_idx in (1..num_pages).rev() {
        let off = page_idx * PAGE_SIZE as u32;
        write_page(half, off, &XPage::new(free_head));
        free_head = off;
    }

    let root_entity = Entity {
        refs: 1,
        flags: EntityFlags::DIR.bits(),
        head: NULL_OFFSET,
        tail: NULL_OFFSET,
        owner: 0,
        head_start: 0,
        tail_end: 0,
    };
    let rpage = RPage::new(
        1,
        NULL_OFFSET,
        NULL_OFFSET,
        NULL_OFFSET,
        NULL_OFFSET,
        free_head,
        num_pages,
        1,
        root_entity,
    );
    write_page(half, 0, &rpage);
    Ok(())
}

fn write_page<T: IntoBytes + Immutable + KnownLayout>(half: &mut [u8], off: u32, value: &T) {
    let start = off as usize;
    value
        .write_to(&mut half[start..start + core::mem::size_of::<T>()])
        .expect("on-buffer struct is exactly one page and fits within its half");
}

/// Attach to an already-formatted buffer: resolve which half is active, confirm the
/// lock is obtainable, and hand back a live [`CozyFs`].
pub fn attach<'buf, S: SystemInterface>(
    buf: &'buf mut [u8],
    backup_enabled: bool,
    config: AttachConfig,
    sysif: S,
) -> KResult<CozyFs<'buf, S>> {
    let half_len = backup::half_len(buf.len(), backup_enabled);
    let mut fs = CozyFs {
        buf,
        half_len,
        sysif,
        config,
        patches: PatchTable::new(),
        txn_state: TxnState::Off,
        held: None,
    };
    fs.enter_critical()?;
    fs.leave_critical()?;
    Ok(fs)
}

impl<S: SystemInterface> CozyFs<'_, S> {
    fn half_base(&self) -> usize {
        let vh = backup::read_volatile(self.buf);
        backup::active_base(self.half_len, vh.backup)
    }

    fn half(&self) -> &[u8] {
        let base = self.half_base();
        &self.buf[base..base + self.half_len]
    }

    fn half_mut(&mut self) -> &mut [u8] {
        let base = self.half_base();
        &mut self.buf[base..base + self.half_len]
    }

    pub(crate) fn transaction_on(&self) -> bool {
        matches!(self.txn_state, TxnState::On)
    }

    pub(crate) fn read<T>(&self, off: Offset) -> T
    where
        T: FromBytes + Immutable + KnownLayout,
    {
        addr::read(self.half(), &self.patches, off)
    }

    pub(crate) fn write<T>(&mut self, off: Offset, value: &T) -> KResult<()>
    where
        T: IntoBytes + Immutable + KnownLayout,
    {
        let transaction_on = self.transaction_on();
        let half = self.half_mut();
        addr::write(half, &mut self.patches, transaction_on, &mut self.sysif, off, value)
    }

    pub(crate) fn root(&self) -> RPage {
        self.read(Offset(0))
    }

    pub(crate) fn write_root(&mut self, root: &RPage) -> KResult<()> {
        self.write(Offset(0), root)
    }

    pub(crate) fn update_root(&mut self, f: impl FnOnce(&mut RPage)) -> KResult<()> {
        let mut root = self.root();
        f(&mut root);
        self.write_root(&root)
    }

    /// Enter a short critical section for a single top-level operation (§4.10).
    ///
    /// While a transaction is `ON`, this instead refreshes the lock it already holds
    /// (the transaction's single acquisition backs every operation issued under it) and
    /// transitions to `TIMEOUT` if that refresh finds the deadline already lapsed. While
    /// `TIMEOUT`, every operation but commit/rollback is rejected outright.
    pub(crate) fn enter_critical(&mut self) -> KResult<()> {
        match self.txn_state {
            TxnState::Timeout => return Err(Errno::Etimedout),
            TxnState::On => {
                return self.refresh_transaction_lock();
            }
            TxnState::Off => {}
        }

        let timeout_ms = self.config.acquire_timeout_secs.saturating_mul(1000);
        let acquired = lock::acquire(self.buf, &mut self.sysif, timeout_ms, timeout_ms as u64)?;
        if acquired.crashed {
            log::warn!("recovered the lock from a holder past its deadline");
            let half_len = self.half_len;
            if !backup::restore_backup(self.buf, half_len) {
                log::warn!("no backup configured; buffer left in its crashed state");
                let _ = lock::release(self.buf, &mut self.sysif, acquired.ticket);
                return Err(Errno::Ecorrupt);
            }
        }
        self.held = Some(acquired);
        Ok(())
    }

    /// Leave the critical section entered by [`enter_critical`](Self::enter_critical),
    /// releasing the lock and running a due backup cycle before giving it up. A no-op
    /// while a transaction is open: it owns the lock until commit/rollback.
    pub(crate) fn leave_critical(&mut self) -> KResult<()> {
        if self.transaction_on() {
            return Ok(());
        }
        self.maybe_backup()?;
        if let Some(acquired) = self.held.take() {
            lock::release(self.buf, &mut self.sysif, acquired.ticket)?;
        }
        Ok(())
    }

    /// Push a held transaction's lock deadline back out, proving it hasn't already
    /// been stolen. On failure, transitions the state machine to `TIMEOUT` and
    /// surfaces `ETIMEDOUT` to the caller, exactly like a failed in-operation refresh.
    pub(crate) fn refresh_transaction_lock(&mut self) -> KResult<()> {
        let ticket = self.held.as_ref().expect("ON state always holds the lock").ticket;
        let hold_for_ms = self.config.transaction_refresh_secs as u64 * 1000;
        match lock::refresh(self.buf, &mut self.sysif, ticket, hold_for_ms) {
            Ok(new_ticket) => {
                self.held = Some(Acquired { ticket: new_ticket, crashed: false });
                Ok(())
            }
            Err(e) => {
                self.txn_state = TxnState::Timeout;
                Err(e)
            }
        }
    }

    pub(crate) fn maybe_backup(&mut self) -> KResult<()> {
        let root = self.root();
        let interval_ms = self.config.backup_interval_secs as u64 * 1000;
        let now = self.sysif.time_ms();
        if now.saturating_sub(root.last_backup_time) < interval_ms {
            return Ok(());
        }

        let half_len = self.half_len;
        backup::perform_backup(self.buf, half_len, &mut self.sysif)?;
        self.update_root(|r| r.last_backup_time = now)?;
        Ok(())
    }
}
