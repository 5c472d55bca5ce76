//! The host/embedder contract: everything the core needs from the outside world.
//!
//! The original ABI funnels six operations through a single tagged callback
//! (`malloc`/`free`/`wait`/`wake`/`sync`/`time`); here each becomes a method on a trait,
//! which is the idiomatic translation and lets the type system check each call site's
//! argument and return shapes instead of a `switch` on an opcode.

use crate::prelude::Box;
use eonix_errno::Errno;

/// Outcome of a `wait`: did the word change before the timeout elapsed?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
}

/// Host services the engine needs but cannot provide for itself: scratch allocation for
/// transaction patches, futex-style blocking on the lock word, durability, and a clock.
///
/// A type implementing `SystemInterface` is handed to [`attach`](crate::api::CozyFs::attach)
/// and is never assumed to be `Sync`; the engine itself does not spawn threads or hold the
/// implementation across an await point.
pub trait SystemInterface {
    /// Allocate a scratch buffer of exactly `len` bytes, used to hold a transaction's
    /// copy-on-write page patches. Returning `None` surfaces as [`Errno::Enomem`].
    fn malloc(&mut self, len: usize) -> Option<Box<[u8]>>;

    /// Release a buffer previously returned by [`malloc`](Self::malloc).
    fn free(&mut self, buf: Box<[u8]>);

    /// Block the calling process until `*word` no longer equals `old_word`, or
    /// `timeout_ms` milliseconds elapse (`None` means wait indefinitely). Implementations
    /// typically forward to a futex-style primitive (`FUTEX_WAIT`, `WaitOnAddress`, ...).
    fn wait(&mut self, word: &core::sync::atomic::AtomicU64, old_word: u64, timeout_ms: Option<u32>) -> Result<WaitOutcome, Errno>;

    /// Wake every process blocked in [`wait`](Self::wait) on `word`.
    fn wake(&mut self, word: &core::sync::atomic::AtomicU64) -> Result<(), Errno>;

    /// Flush the buffer to durable storage, if the embedder backs it with one. A no-op
    /// in-memory implementation should simply return `Ok(())`.
    fn sync(&mut self) -> Result<(), Errno>;

    /// Current time as milliseconds since the Unix epoch. Returning 0 is treated as
    /// "unknown" and surfaces as [`Errno::Esystime`].
    fn time_ms(&mut self) -> u64;
}
