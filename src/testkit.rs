//! An in-process [`SystemInterface`] good enough to drive the whole engine under
//! `#[test]`.
//!
//! This is explicitly not a platform shim: there is no real `mmap`, no real futex, no
//! real disk. It is the narrow stand-in the core itself must never provide (§1.1) —
//! the same way the teacher keeps platform glue (HAL, percpu, interrupts) out of its
//! algorithmic crates and lets small leaf crates carry their own `std`-backed
//! `#[cfg(test)] mod tests` instead. Anything that actually wants `mmap`-backed
//! persistence or cross-process shared memory is an external collaborator, per §1.
extern crate std;

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eonix_errno::Errno;

use crate::prelude::Box;
use crate::sysif::{SystemInterface, WaitOutcome};

/// The condition variable two or more [`MemorySystem`]s share so a `wake` issued
/// through one is observed by a `wait` blocked on another, the way two processes
/// attached to the same shared-memory buffer would notice each other's futex wake.
#[derive(Clone)]
struct WakeChannel(Arc<(Mutex<()>, Condvar)>);

impl WakeChannel {
    fn new() -> Self {
        Self(Arc::new((Mutex::new(()), Condvar::new())))
    }
}

/// A heap-backed, single-process stand-in for the external callback contract (§6):
/// `malloc`/`free` through the ordinary global allocator, `wait`/`wake` through a
/// `Condvar`, and `time_ms` from the system clock.
pub struct MemorySystem {
    wake: WakeChannel,
}

impl MemorySystem {
    pub fn new() -> Self {
        Self { wake: WakeChannel::new() }
    }

    /// Build a system interface that shares its wake channel with `other`, so the two
    /// behave like separate processes attached to the same buffer: a `wake` issued by
    /// one unblocks a `wait` the other is parked in.
    pub fn sharing(other: &MemorySystem) -> Self {
        Self { wake: other.wake.clone() }
    }
}

impl Default for MemorySystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemInterface for MemorySystem {
    fn malloc(&mut self, len: usize) -> Option<Box<[u8]>> {
        Some(alloc::vec![0u8; len].into_boxed_slice())
    }

    fn free(&mut self, _buf: Box<[u8]>) {}

    fn wait(
        &mut self,
        word: &AtomicU64,
        old_word: u64,
        timeout_ms: Option<u32>,
    ) -> Result<WaitOutcome, Errno> {
        if word.load(Ordering::Acquire) != old_word {
            return Ok(WaitOutcome::Woken);
        }

        let (mutex, cvar) = &*self.wake.0;
        let guard = mutex.lock().map_err(|_| Errno::Esyswait)?;
        let timeout = timeout_ms
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(Duration::from_millis(50));

        let (_guard, timed_out) = cvar
            .wait_timeout_while(guard, timeout, |()| word.load(Ordering::Acquire) == old_word)
            .map_err(|_| Errno::Esyswait)?;

        if timed_out.timed_out() && word.load(Ordering::Acquire) == old_word {
            Ok(WaitOutcome::TimedOut)
        } else {
            Ok(WaitOutcome::Woken)
        }
    }

    fn wake(&mut self, _word: &AtomicU64) -> Result<(), Errno> {
        let (_mutex, cvar) = &*self.wake.0;
        cvar.notify_all();
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn time_ms(&mut self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1)
    }
}

/// A fixed clock for tests that need to control exactly how much time has passed —
/// lock timeout/crash-detection scenarios (§8 scenario 3) are easiest to write against
/// a clock the test steps by hand rather than a real one subject to scheduling jitter.
pub struct FakeClock {
    now_ms: Arc<std::sync::atomic::AtomicU64>,
    wake: WakeChannel,
}

impl FakeClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(std::sync::atomic::AtomicU64::new(start_ms)),
            wake: WakeChannel::new(),
        }
    }

    /// A second handle sharing this clock and wake channel, simulating another
    /// process attached to the same buffer.
    pub fn handle(&self) -> FakeClockHandle {
        FakeClockHandle { now_ms: self.now_ms.clone(), wake: self.wake.clone() }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }
}

/// A [`SystemInterface`] reading a [`FakeClock`] shared with other handles instead of
/// the real system clock, so tests can deterministically age a lock past its deadline.
pub struct FakeClockHandle {
    now_ms: Arc<std::sync::atomic::AtomicU64>,
    wake: WakeChannel,
}

impl SystemInterface for FakeClockHandle {
    fn malloc(&mut self, len: usize) -> Option<Box<[u8]>> {
        Some(alloc::vec![0u8; len].into_boxed_slice())
    }

    fn free(&mut self, _buf: Box<[u8]>) {}

    fn wait(
        &mut self,
        word: &AtomicU64,
        old_word: u64,
        _timeout_ms: Option<u32>,
    ) -> Result<WaitOutcome, Errno> {
        if word.load(Ordering::Acquire) != old_word {
            Ok(WaitOutcome::Woken)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }

    fn wake(&mut self, _word: &AtomicU64) -> Result<(), Errno> {
        let (_mutex, cvar) = &*self.wake.0;
        cvar.notify_all();
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn time_ms(&mut self) -> u64 {
        self.now_ms.load(Ordering::SeqCst).max(1)
    }
}
