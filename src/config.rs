//! Tunables for locking, backup cadence and transaction keep-alive.
//!
//! Split the way `posix_types`/kernel config structs in the corpus split: one type
//! for the one-time, whole-buffer decision ([`InitConfig`]), one for the
//! per-attached-process behavior ([`AttachConfig`]).

/// Options fixed for the lifetime of the buffer, chosen once by whoever formats it.
#[derive(Debug, Clone, Copy)]
pub struct InitConfig {
    /// Keep a second, double-buffered copy of the whole image for crash recovery.
    /// Halves the usable capacity of the supplied memory region.
    pub backup: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self { backup: true }
    }
}

/// Options chosen per attached process; different processes attached to the same
/// buffer may use different values.
#[derive(Debug, Clone, Copy)]
pub struct AttachConfig {
    /// How long [`lock`](crate::lock) holds a deadline once acquired, in seconds.
    /// A process that goes silent for longer than this looks crashed to everyone else.
    pub acquire_timeout_secs: u32,
    /// Minimum interval between two backups performed on leaving a critical section,
    /// in seconds. Keeps `perform_backup` from copying the whole buffer on every call.
    pub backup_interval_secs: u32,
    /// How far into the future [`idle`](crate::api::CozyFs::idle) pushes the lock
    /// deadline while a transaction is open, in seconds.
    pub transaction_refresh_secs: u32,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 5,
            backup_interval_secs: 3,
            transaction_refresh_secs: 5,
        }
    }
}
