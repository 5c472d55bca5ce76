//! A position-independent, buffer-hosted file system core.
//!
//! The entire engine lives inside one caller-supplied byte slice: every cross-reference
//! inside it is a self-relative [`layout::Offset`] rather than a pointer, so the same
//! buffer can be `mmap`'d to a file, placed in shared memory, or just heap-allocated,
//! and multiple processes can attach to it concurrently (serialized by the buffer's own
//! [`lock`]). [`api::init`] formats a fresh buffer; [`api::attach`] hands back a
//! [`api::CozyFs`], the handle every POSIX-style operation (`mkdir`, `open`, `read`,
//! `write`, ...) and every explicit [`txn`]saction method hangs off.
//!
//! The host embedding this crate supplies a [`sysif::SystemInterface`]: scratch
//! allocation for transaction patches, futex-style wait/wake on the lock word, a clock,
//! and an optional durability hook. None of that is provided here — this crate is
//! `no_std` and never assumes an OS is present — except behind the `testkit` feature,
//! which exists purely so this crate's own test suite has something to drive.
#![no_std]

extern crate alloc;

pub mod addr;
pub mod api;
pub mod backup;
pub mod buffer;
pub mod config;
pub mod entity;
pub mod fileio;
pub mod handle;
pub mod layout;
mod prelude;
pub mod lock;
pub mod path;
pub mod sysif;
pub mod txn;
pub mod user;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use api::{attach, init, CozyFs};
pub use config::{AttachConfig, InitConfig};
pub use eonix_errno::{Errno, KResult};
pub use handle::Fd;
pub use layout::{EntityFlags, ReadFlags};
pub use sysif::{SystemInterface, WaitOutcome};
