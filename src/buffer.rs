//! Typed, zero-copy views over pages of the attached buffer.
//!
//! Every struct here is `#[repr(C)]` with a fixed, native-endian layout and derives
//! `zerocopy`'s traits so it can be cast to and from the raw `&[u8]`/`&mut [u8]` page
//! slice without unsafe code or manual (de)serialization. Fields are plain `u32`/`u16`
//! rather than `zerocopy::little_endian::U32` wrappers: the buffer is never shared
//! across machines of different endianness, only mapped at different addresses on the
//! same machine, so paying for byte-swapped accessors would buy nothing.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::layout::{
    DPAGE_SLOTS, FPAGE_DATA, HPAGE_HANDLES, MAX_NAME, MAX_USER_NAME, NULL_OFFSET, PAGE_SIZE,
    ROOT_HANDLES, UPAGE_USERS,
};

/// Marker for the active half of a double-buffered backup: stable values so a restart
/// can tell a genuine value apart from a half-written word left by a crash.
pub const BACKUP_NONE: i32 = -1;
pub const BACKUP_A: i32 = 0;
pub const BACKUP_B: i32 = 1;

/// The lock word plus the active-half marker: the "volatile prefix" that `backup`/`restore`
/// never touch, because the running process may be updating it concurrently with a copy.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct VolatileHeader {
    /// 0 when unlocked; otherwise a UTC-millisecond deadline after which the lock is
    /// considered abandoned by a crashed holder.
    pub lock: u64,
    /// Which half (`BACKUP_A`/`BACKUP_B`) currently holds the live image, or `BACKUP_NONE`
    /// if backup/restore has never been configured for this buffer.
    pub backup: i32,
    _reserved: u32,
}

impl VolatileHeader {
    pub(crate) fn new(lock: u64, backup: i32) -> Self {
        Self {
            lock,
            backup,
            _reserved: 0,
        }
    }
}

/// An inode: the unit of ownership, reference counting and content addressing.
///
/// Embedded inline inside a [`DPage`] slot or the root page, never allocated on its own.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Entity {
    /// Number of links (for directories) or open handles plus links (for files) keeping
    /// this entity alive. Reaching zero frees its content chain and slot.
    pub refs: u32,
    /// Raw `EntityFlags` bits; use [`Entity::flags`] for the typed view.
    pub flags: u32,
    /// First page of the content chain (`DPage` chain for a directory, `FPage` chain for
    /// a file), or `Offset::NULL` for an empty file.
    pub head: u32,
    /// Last page of the content chain.
    pub tail: u32,
    /// Owning user id.
    pub owner: u32,
    /// Byte offset within `head` at which live content starts (directories: always 0).
    pub head_start: u16,
    /// Byte offset within `tail` at which live content ends.
    pub tail_end: u16,
}

impl Entity {
    /// An unused embedded-entity slot: `refs == 0` marks it free for
    /// [`find_unused_entity`](crate::entity::find_unused_entity) to reclaim.
    pub const EMPTY: Entity = Entity {
        refs: 0,
        flags: 0,
        head: NULL_OFFSET,
        tail: NULL_OFFSET,
        owner: 0,
        head_start: 0,
        tail_end: 0,
    };

    pub fn flags(&self) -> crate::layout::EntityFlags {
        crate::layout::EntityFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: crate::layout::EntityFlags) {
        self.flags = flags.bits();
    }
}

/// A directory entry: an offset to the referenced [`Entity`]'s owning page plus a
/// zero-padded name.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Link {
    /// Raw byte offset of the referenced `Entity`, wherever it is embedded (a slot in
    /// some `DPage.ents`, or the root entity). Not a page offset: entities are inline,
    /// so this points straight at the struct itself.
    pub off: u32,
    pub name: [u8; MAX_NAME],
}

impl Link {
    pub const EMPTY: Link = Link {
        off: crate::layout::NULL_OFFSET,
        name: [0; MAX_NAME],
    };

    pub fn is_empty(&self) -> bool {
        self.off == crate::layout::NULL_OFFSET
    }

    /// Name with trailing NUL padding stripped.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name = [0; MAX_NAME];
        self.name[..name.len()].copy_from_slice(name);
    }
}

/// A directory page: one node of the doubly-linked chain that makes up a directory's
/// content, plus a parallel doubly-linked "global" chain (anchored on the root page)
/// threading every `DPage` in the buffer regardless of which directory owns it.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DPage {
    pub gen: u32,
    pub flags: u32,
    /// Previous/next page in the buffer-wide chain of every `DPage`, used by the free
    /// entity-slot scan so it never has to walk directory trees to find room.
    pub global_prev: u32,
    pub global_next: u32,
    /// Previous/next page within this directory's own content chain.
    pub prev: u32,
    pub next: u32,
    pub links: [Link; DPAGE_SLOTS],
    pub ents: [Entity; DPAGE_SLOTS],
    _pad: [u8; 16],
}

const _: () = assert!(core::mem::size_of::<DPage>() == PAGE_SIZE);

impl DPage {
    pub(crate) fn new_empty(global_prev: u32, global_next: u32) -> Self {
        Self {
            gen: 0,
            flags: 0,
            global_prev,
            global_next,
            prev: NULL_OFFSET,
            next: NULL_OFFSET,
            links: [Link::EMPTY; DPAGE_SLOTS],
            ents: [Entity::EMPTY; DPAGE_SLOTS],
            _pad: [0; 16],
        }
    }
}

/// A file content page: one node of the doubly-linked chain making up a file's bytes.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FPage {
    pub gen: u32,
    pub prev: u32,
    pub next: u32,
    pub data: [u8; FPAGE_DATA],
}

const _: () = assert!(core::mem::size_of::<FPage>() == PAGE_SIZE);

impl FPage {
    pub(crate) fn new_empty(prev: u32, next: u32) -> Self {
        Self {
            gen: 0,
            prev,
            next,
            data: [0; FPAGE_DATA],
        }
    }
}

/// One open-file-descriptor slot, embedded in the root page or an [`HPage`].
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Handle {
    pub used: u8,
    _pad: u8,
    /// Bumped (skipping 0 and 0xFFFF) on close to invalidate outstanding fds referencing
    /// this slot.
    pub generation: u16,
    /// Raw byte offset of the `Entity` this handle refers to.
    pub entity: u32,
    /// Current read/write cursor, as a byte offset into the entity's content chain.
    pub cursor: u32,
}

impl Handle {
    pub const EMPTY: Handle = Handle {
        used: 0,
        _pad: 0,
        generation: 1,
        entity: crate::layout::NULL_OFFSET,
        cursor: 0,
    };
}

/// Overflow page of [`Handle`] slots, linked from the root page once the embedded table
/// fills up.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HPage {
    pub next: u32,
    pub handles: [Handle; HPAGE_HANDLES],
}

const _: () = assert!(core::mem::size_of::<HPage>() == PAGE_SIZE);

/// A registered user: just an id and a display name, chained into [`UPage`]s.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct User {
    pub id: u16,
    pub name: [u8; MAX_USER_NAME],
}

impl User {
    pub const EMPTY: User = User {
        id: 0,
        name: [0; MAX_USER_NAME],
    };

    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    /// Zero-pad `name` into the fixed-width field, truncating to [`MAX_USER_NAME`]
    /// bytes if it runs over (callers validate the length up front; this is the same
    /// defensive truncation `Link::set_name`'s directory-name counterpart skips because
    /// `create_entity` already rejects an oversized name before it gets here).
    pub fn set_name_truncated(&mut self, name: &[u8]) {
        let len = name.len().min(MAX_USER_NAME);
        self.name = [0; MAX_USER_NAME];
        self.name[..len].copy_from_slice(&name[..len]);
    }
}

/// Page of registered [`User`] entries, chained from the root page's `head_upage`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct UPage {
    pub gen: u32,
    pub prev: u32,
    pub next: u32,
    pub users: [User; UPAGE_USERS],
    _pad: [u8; 20],
}

const _: () = assert!(core::mem::size_of::<UPage>() == PAGE_SIZE);

impl UPage {
    pub(crate) fn new_empty(prev: u32, next: u32) -> Self {
        Self {
            gen: 0,
            prev,
            next,
            users: [User::EMPTY; UPAGE_USERS],
            _pad: [0; 20],
        }
    }
}

/// A free page sitting on the allocator's free list.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XPage {
    pub next: u32,
    _pad: [u8; PAGE_SIZE - 4],
}

const _: () = assert!(core::mem::size_of::<XPage>() == PAGE_SIZE);

impl XPage {
    pub(crate) fn new(next: u32) -> Self {
        Self {
            next,
            _pad: [0; PAGE_SIZE - 4],
        }
    }
}

/// The root page: page 0 of each half of the attached buffer.
///
/// The [`VolatileHeader`] (lock word and active-half marker) deliberately does *not*
/// live here: it sits on its own dedicated page ahead of both halves, at a fixed
/// absolute offset, so a process can find the lock and learn which half is active
/// before it has resolved any half-relative offset — including this page's own. What
/// follows is the rest of the filesystem's bookkeeping: the allocation-order page
/// lists, the user list head/tail, the root directory's own `Entity`, and the embedded
/// handle table.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RPage {
    /// UTC milliseconds of the last successful `perform_backup`, or 0 if none yet.
    pub last_backup_time: u64,
    pub gen: u32,
    /// Next id to hand out from `mkusr`.
    pub next_account_id: u32,
    /// Head of the buffer-wide `DPage` chain (see [`DPage::global_prev`]/`global_next`).
    pub dpages: u32,
    /// Head of the allocation-order `HPage` chain.
    pub hpages: u32,
    pub head_upage: u32,
    pub tail_upage: u32,
    /// Number of slots used in the page at `tail_upage`.
    pub tail_upage_used: u32,
    /// Head of the free-page list, threaded through [`XPage::next`].
    pub free_pages: u32,
    pub tot_pages: u32,
    pub num_pages: u32,
    pub root: Entity,
    pub handles: [Handle; ROOT_HANDLES],
    _pad: [u8; 16],
}

const _: () = assert!(core::mem::size_of::<RPage>() == PAGE_SIZE);

impl RPage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        next_account_id: u32,
        dpages: u32,
        hpages: u32,
        head_upage: u32,
        tail_upage: u32,
        free_pages: u32,
        tot_pages: u32,
        num_pages: u32,
        root: Entity,
    ) -> Self {
        Self {
            last_backup_time: 0,
            gen: 0,
            next_account_id,
            dpages,
            hpages,
            head_upage,
            tail_upage,
            tail_upage_used: 0,
            free_pages,
            tot_pages,
            num_pages,
            root,
            handles: [Handle::EMPTY; ROOT_HANDLES],
            _pad: [0; 16],
        }
    }
}
