//! Page-layout constants and the self-relative [`Offset`] type.
//!
//! Every structure in the buffer is reached by a byte offset from the start
//! of the buffer rather than by pointer, so the whole image can be `mmap`'d
//! at a different address (or loaded into a plain `Vec<u8>`) without fixing
//! anything up.

use bitflags::bitflags;

/// Size of every page in the buffer, including the root page.
pub const PAGE_SIZE: usize = 4096;

/// Maximum length of a path component's name, zero-padded in a [`Link`](crate::buffer::Link).
pub const MAX_NAME: usize = 128;

/// Maximum length of a user name, zero-padded in a [`User`](crate::buffer::User).
pub const MAX_USER_NAME: usize = 30;

/// Number of `(Link, Entity)` slot pairs held by a single directory page.
pub const DPAGE_SLOTS: usize = 26;

/// Bytes of file content held by a single [`FPage`](crate::buffer::FPage).
pub const FPAGE_DATA: usize = 4084;

/// Handle slots embedded directly on the root page.
pub const ROOT_HANDLES: usize = 334;

/// Handle slots per overflow [`HPage`](crate::buffer::HPage).
pub const HPAGE_HANDLES: usize = 341;

/// User slots per [`UPage`](crate::buffer::UPage).
pub const UPAGE_USERS: usize = 127;

/// Maximum number of pages a single transaction may patch before `begin`/writes fail with
/// [`Errno::Enomem`](eonix_errno::Errno::Enomem).
pub const MAX_PATCHES: usize = 128;

/// Maximum number of components accepted in a single path.
pub const MAX_PATH_COMPONENTS: usize = 32;

/// Sentinel meaning "no page" / "end of list", used throughout instead of a null pointer.
pub const NULL_OFFSET: u32 = 0xFFFF_FFFF;

/// A self-relative byte offset into the attached buffer, or [`NULL_OFFSET`] ("no page").
///
/// `Offset` is a plain `u32` newtype rather than a pointer: the same value means the
/// same thing no matter where the buffer is currently mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Offset(pub u32);

impl Offset {
    pub const NULL: Offset = Offset(NULL_OFFSET);

    pub const fn is_null(self) -> bool {
        self.0 == NULL_OFFSET
    }

    pub const fn some(self) -> Option<Offset> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Offset {
    fn from(value: u32) -> Self {
        Offset(value)
    }
}

impl From<Offset> for u32 {
    fn from(value: Offset) -> Self {
        value.0
    }
}

bitflags! {
    /// Kind and mode bits carried by every [`Entity`](crate::buffer::Entity).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntityFlags: u32 {
        /// Entity is a directory; `head`/`tail` reference a `DPage` chain.
        const DIR = 1 << 0;
        /// Entity is a regular file; `head`/`tail` reference an `FPage` chain.
        const FILE = 1 << 1;
    }
}

bitflags! {
    /// Options accepted by the `read` operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadFlags: u32 {
        /// Advance (and truncate) the handle's cursor as bytes are consumed, turning `read`
        /// into a destructive "take" rather than a peek.
        const CONSUME = 1 << 0;
    }
}
