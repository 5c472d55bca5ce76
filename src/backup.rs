//! Double-buffered backup/restore of the non-volatile buffer contents (§4.8).
//!
//! The attached buffer is laid out as a fixed [`VOLATILE_PAGE_LEN`]-byte header page —
//! holding only the lock word and active-half marker — followed by one or two
//! equal-length halves of ordinary filesystem pages. The header page sits outside both
//! halves precisely so a process can find the lock and learn which half is active
//! before it has resolved a single half-relative offset.
//!
//! When [`InitConfig::backup`](crate::config::InitConfig) is set, `init` reserves two
//! halves and every `AttachConfig::backup_interval_secs` the engine mirrors the
//! currently active half onto the inactive one, then flips the active-half marker — in
//! that order, with a [`SystemInterface::sync`] between the copy and the flip, so a
//! crash can only ever leave the marker pointing at a fully intact image. The halves
//! ping-pong: the half just written to becomes active for the next interval, and the
//! half that was active becomes the new backup target.

use eonix_errno::KResult;
use zerocopy::FromBytes;

use crate::buffer::{VolatileHeader, BACKUP_A, BACKUP_B, BACKUP_NONE};
use crate::layout::PAGE_SIZE;
use crate::sysif::SystemInterface;

/// Length of the fixed header page ahead of both halves. A whole page rather than just
/// `size_of::<VolatileHeader>()` bytes, so every half that follows stays page-aligned.
pub const VOLATILE_PAGE_LEN: usize = PAGE_SIZE;

/// Half-length of the filesystem data given the buffer's total length and whether
/// backup is enabled.
pub fn half_len(total_len: usize, backup_enabled: bool) -> usize {
    let data_len = total_len - VOLATILE_PAGE_LEN;
    if backup_enabled {
        data_len / 2
    } else {
        data_len
    }
}

/// Absolute byte offset of the start of the half currently marked active.
pub fn active_base(half_len: usize, active: i32) -> usize {
    if active == BACKUP_B {
        VOLATILE_PAGE_LEN + half_len
    } else {
        VOLATILE_PAGE_LEN
    }
}

pub(crate) fn read_volatile(buf: &[u8]) -> VolatileHeader {
    VolatileHeader::read_from_bytes(&buf[..core::mem::size_of::<VolatileHeader>()])
        .expect("volatile header page always holds a full VolatileHeader")
}

/// Write just the active-half marker, leaving the lock word untouched.
fn write_marker(buf: &mut [u8], backup: i32) {
    let offset = core::mem::offset_of!(VolatileHeader, backup);
    buf[offset..offset + 4].copy_from_slice(&backup.to_ne_bytes());
}

/// Mirror the active half onto the inactive half and flip which half is active.
///
/// No-op if backup was never configured for this buffer (`vh.backup == BACKUP_NONE`).
pub fn perform_backup(
    buf: &mut [u8],
    half_len: usize,
    sysif: &mut impl SystemInterface,
) -> KResult<()> {
    let vh = read_volatile(buf);
    if vh.backup == BACKUP_NONE {
        return Ok(());
    }

    let active = active_base(half_len, vh.backup) - VOLATILE_PAGE_LEN;
    let (lo, hi) = buf[VOLATILE_PAGE_LEN..].split_at_mut(half_len);
    let (src, dst) = if active == 0 { (lo, hi) } else { (hi, lo) };
    dst.copy_from_slice(src);

    sysif.sync().map_err(|_| eonix_errno::Errno::Esyssync)?;

    let next = if active == 0 { BACKUP_B } else { BACKUP_A };
    write_marker(buf, next);
    log::debug!("backup flipped active half to {next}");
    Ok(())
}

/// Resolve the half to treat as active at attach time: whichever half the marker
/// names (or the first half, for a buffer attached without backup configured, since
/// `init` only ever formats one half in that case).
pub fn active_marker(buf: &[u8]) -> i32 {
    let vh = read_volatile(buf);
    if vh.backup == BACKUP_NONE {
        BACKUP_A
    } else {
        vh.backup
    }
}

/// Restore consistent state after [`lock::acquire`](crate::lock::acquire) reports it
/// recovered the lock from a crashed holder: copy the backup half — last known good as
/// of the previous [`perform_backup`] — over the active half, discarding whatever
/// partial mutation the crashed holder left behind.
///
/// Returns `false` ("no restore possible") if the buffer was never configured with a
/// backup half; the caller should then treat the active half as unrecoverable and
/// surface [`Errno::Ecorrupt`](eonix_errno::Errno::Ecorrupt).
pub fn restore_backup(buf: &mut [u8], half_len: usize) -> bool {
    let vh = read_volatile(buf);
    if vh.backup == BACKUP_NONE {
        return false;
    }

    let active = active_base(half_len, vh.backup) - VOLATILE_PAGE_LEN;
    let (lo, hi) = buf[VOLATILE_PAGE_LEN..].split_at_mut(half_len);
    let (backup_half, active_half) = if active == 0 { (hi, lo) } else { (lo, hi) };
    active_half.copy_from_slice(backup_half);
    log::warn!("restored active half from backup after detecting a crashed holder");
    true
}
