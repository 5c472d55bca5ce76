//! Timeout-encoded mutual-exclusion lock over the buffer's volatile prefix (§4.7).
//!
//! The lock word is a single `u64` at a fixed absolute offset in the buffer: `0` means
//! unlocked, any other value is the UTC-millisecond deadline by which the holder
//! promises to have released it. A holder that dies mid-transaction leaves a nonzero,
//! eventually-lapsed deadline behind instead of wedging every other attacher forever —
//! the next attempt to acquire notices the lapsed deadline and steals the lock rather
//! than waiting on a holder that will never wake it.
//!
//! The deadline a successful [`acquire`] writes doubles as the caller's *ticket*:
//! [`release`] and [`refresh`] only touch the word via `compare_exchange` from that
//! exact value, so a process whose deadline has already lapsed (and been stolen by
//! someone else) can never clobber the new holder's lock out from under it.

use core::sync::atomic::{AtomicU64, Ordering};

use eonix_errno::{Errno, KResult};

use crate::sysif::{SystemInterface, WaitOutcome};

/// Offset, in bytes, of the lock word from the start of the buffer. Fixed regardless of
/// which half is currently active: a process must be able to find the lock before it
/// can know which half holds the live image.
pub const LOCK_OFFSET: usize = 0;

/// Proof that [`acquire`] succeeded, handed back so the caller can later [`release`] or
/// [`refresh`] it. `ticket` is exactly the deadline this acquisition wrote into the lock
/// word.
pub struct Acquired {
    pub ticket: u64,
    /// Set when the previous holder's deadline had already lapsed, i.e. this acquire
    /// recovered from a crashed holder rather than waiting for a clean release.
    pub crashed: bool,
}

fn lock_word(buf: &[u8]) -> &AtomicU64 {
    debug_assert!(buf.len() >= LOCK_OFFSET + 8);
    let ptr = buf[LOCK_OFFSET..LOCK_OFFSET + 8].as_ptr() as *const AtomicU64;
    unsafe { &*ptr }
}

/// Acquire the lock, waiting (via [`SystemInterface::wait`]) for a clean release or a
/// stale deadline to steal. `timeout_ms` bounds each individual wait; `hold_for_ms` is
/// the deadline written into the word on success, by which the caller promises to have
/// called [`release`] or [`refresh`]d it.
pub fn acquire(
    buf: &[u8],
    sysif: &mut impl SystemInterface,
    timeout_ms: u32,
    hold_for_ms: u64,
) -> KResult<Acquired> {
    let word = lock_word(buf);
    let mut crashed = false;

    loop {
        let deadline = sysif.time_ms() + hold_for_ms;
        match word.compare_exchange(0, deadline, Ordering::Acquire, Ordering::Acquire) {
            Ok(_) => return Ok(Acquired { ticket: deadline, crashed }),
            Err(current) => {
                let now = sysif.time_ms();
                if current != 0 && current <= now {
                    log::warn!("stealing lock from a holder past its deadline");
                    if word
                        .compare_exchange(current, deadline, Ordering::Acquire, Ordering::Acquire)
                        .is_ok()
                    {
                        crashed = true;
                        return Ok(Acquired { ticket: deadline, crashed });
                    }
                    continue;
                }

                match sysif.wait(word, current, Some(timeout_ms)) {
                    Ok(WaitOutcome::Woken) => continue,
                    Ok(WaitOutcome::TimedOut) => return Err(Errno::Etimedout),
                    Err(_) => return Err(Errno::Esyswait),
                }
            }
        }
    }
}

/// Release the lock, but only if it still holds the ticket this caller was given by
/// `acquire`/`refresh`. A mismatch means the deadline lapsed and another process has
/// since stolen the lock — releasing anyway would drop *their* critical section, so
/// this reports [`Errno::Etimedout`] instead and leaves the word untouched.
pub fn release(buf: &[u8], sysif: &mut impl SystemInterface, ticket: u64) -> KResult<()> {
    let word = lock_word(buf);
    match word.compare_exchange(ticket, 0, Ordering::Release, Ordering::Acquire) {
        Ok(_) => sysif.wake(word).map_err(|_| Errno::Esyswake),
        Err(_) => {
            log::warn!("unlock found the lock had already been stolen");
            Err(Errno::Etimedout)
        }
    }
}

/// True if the lock word still holds exactly `ticket` — i.e. nobody has released,
/// refreshed, or stolen it since it was handed out. Used right before a transaction
/// commit applies patches to the shared buffer, since a stale ticket here would mean
/// another process's critical section is live right now.
pub fn is_held_with_ticket(buf: &[u8], ticket: u64) -> bool {
    lock_word(buf).load(Ordering::Acquire) == ticket
}

/// Push a held lock's deadline further out, proving ownership the same way `release`
/// does: the stored word must still equal `ticket`. Returns the new ticket on success.
/// Called periodically by a long-lived transaction so its timeout doesn't lapse out
/// from under it while still making progress (§1.1's "transaction refresh" cadence).
pub fn refresh(
    buf: &[u8],
    sysif: &mut impl SystemInterface,
    ticket: u64,
    hold_for_ms: u64,
) -> KResult<u64> {
    let word = lock_word(buf);
    let deadline = sysif.time_ms() + hold_for_ms;
    match word.compare_exchange(ticket, deadline, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            log::trace!("lock deadline refreshed to {deadline}");
            Ok(deadline)
        }
        Err(_) => {
            log::warn!("lock refresh found the deadline had already lapsed");
            Err(Errno::Etimedout)
        }
    }
}
