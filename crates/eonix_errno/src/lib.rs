#![no_std]

//! Named error codes for the storage engine, in the spirit of `posix_types::result`:
//! a small enum at the FFI boundary instead of bare integers through the whole stack.

/// Every fallible core operation returns one of these instead of a raw errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Path malformed, operation issued in an invalid transaction state, or
    /// `CONSUME` requested with a non-zero cursor.
    Einval = 1,
    /// Patch table full, page allocator exhausted, path component overflow,
    /// or name longer than `MAX_NAME`.
    Enomem = 2,
    /// Path or user resolved to a missing entity.
    Enoent = 3,
    /// `create_entity` target name already exists in the parent directory.
    Eexist = 4,
    /// Wrong entity kind, non-empty directory on `rmdir`, or unlinking root.
    Eperm = 5,
    /// Lock held with no deadline (legacy form retained from the original ABI).
    Ebusy = 6,
    /// `open` called on a directory.
    Eisdir = 7,
    /// Handle table exhausted (root table and every `HPage` are full).
    Enfile = 8,
    /// Fd generation mismatch, or index out of range.
    Ebadf = 9,
    /// Lock deadline lapsed; any open transaction is no longer valid.
    Etimedout = 10,
    /// A crash was detected and no backup half is available to restore from.
    Ecorrupt = 11,
    /// The external `FREE` callback reported failure.
    Esysfree = 12,
    /// The external `SYNC` callback reported failure.
    Esyssync = 13,
    /// The external `TIME` callback reported "unknown" (returned 0).
    Esystime = 14,
    /// The external `WAIT` callback reported failure.
    Esyswait = 15,
    /// The external `WAKE` callback reported failure.
    Esyswake = 16,
}

impl Errno {
    /// The wire value used at the FFI boundary, mirroring the original
    /// `-COZYFS_E*` convention of a single negative integer per error.
    pub const fn into_raw(self) -> i32 {
        -(self as i32)
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Errno::Einval => "EINVAL",
            Errno::Enomem => "ENOMEM",
            Errno::Enoent => "ENOENT",
            Errno::Eexist => "EEXIST",
            Errno::Eperm => "EPERM",
            Errno::Ebusy => "EBUSY",
            Errno::Eisdir => "EISDIR",
            Errno::Enfile => "ENFILE",
            Errno::Ebadf => "EBADF",
            Errno::Etimedout => "ETIMEDOUT",
            Errno::Ecorrupt => "ECORRUPT",
            Errno::Esysfree => "ESYSFREE",
            Errno::Esyssync => "ESYSSYNC",
            Errno::Esystime => "ESYSTIME",
            Errno::Esyswait => "ESYSWAIT",
            Errno::Esyswake => "ESYSWAKE",
        };
        f.write_str(name)
    }
}

/// The result type threaded through the whole engine, mirroring the teacher's
/// `prelude::KResult<T> = Result<T, u32>` but with a named error type.
pub type KResult<T> = Result<T, Errno>;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn raw_values_are_negative() {
        assert_eq!(Errno::Einval.into_raw(), -1);
        assert_eq!(Errno::Esyswake.into_raw(), -16);
    }

    #[test]
    fn display_matches_posix_name() {
        assert_eq!(Errno::Enoent.to_string(), "ENOENT");
    }
}
