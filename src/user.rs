//! Registered users (§4.3's `owner` field) and the `mkusr`/`rmusr`/`chown`/`chmod`
//! operations over them.
//!
//! Users are stored the same way directory entries are: a singly-extending chain of
//! fixed-size pages (here [`UPage`]s) appended to as needed, with a head/tail/used-count
//! on the root page tracking where the next one goes. There's no on-buffer permission
//! bit layout to speak of beyond the entity kind, so `chmod` treats `Entity::flags`
//! above the `DIR`/`FILE` bits as an opaque, caller-defined mode mask the engine stores
//! but never itself interprets.

use eonix_errno::{Errno, KResult};

use crate::api::CozyFs;
use crate::buffer::{Entity, UPage, User};
use crate::layout::{EntityFlags, Offset, MAX_USER_NAME, NULL_OFFSET, UPAGE_USERS};
use crate::sysif::SystemInterface;

const KIND_MASK: u32 = EntityFlags::DIR.bits() | EntityFlags::FILE.bits();

impl<S: SystemInterface> CozyFs<'_, S> {
    fn find_user(&self, name: &[u8]) -> KResult<User> {
        let root = self.root();
        let mut cur = root.head_upage;
        while cur != NULL_OFFSET {
            let up: UPage = self.read(Offset(cur));
            for u in up.users.iter() {
                if u.id != 0 && u.name_bytes() == name {
                    return Ok(*u);
                }
            }
            cur = up.next;
        }
        Err(Errno::Enoent)
    }

    fn find_user_by_id(&self, id: u32) -> KResult<(u32, usize)> {
        if id == 0 {
            return Err(Errno::Enoent);
        }
        let root = self.root();
        let mut cur = root.head_upage;
        while cur != NULL_OFFSET {
            let up: UPage = self.read(Offset(cur));
            for (i, u) in up.users.iter().enumerate() {
                if u.id as u32 == id {
                    return Ok((cur, i));
                }
            }
            cur = up.next;
        }
        Err(Errno::Enoent)
    }

    /// Register a new user named `name`, returning its id. Fails with `EEXIST` if the
    /// name is already taken.
    pub fn mkusr(&mut self, name: &[u8]) -> KResult<u32> {
        self.enter_critical()?;
        let result = self.mkusr_locked(name);
        self.leave_critical()?;
        result
    }

    fn mkusr_locked(&mut self, name: &[u8]) -> KResult<u32> {
        if name.is_empty() || name.len() > MAX_USER_NAME {
            return Err(Errno::Einval);
        }
        if self.find_user(name).is_ok() {
            return Err(Errno::Eexist);
        }

        if self.root().head_upage == NULL_OFFSET {
            let page = self.allocate_page()?;
            self.write(Offset(page), &UPage::new_empty(NULL_OFFSET, NULL_OFFSET))?;
            self.update_root(|r| {
                r.head_upage = page;
                r.tail_upage = page;
                r.tail_upage_used = 0;
            })?;
        }

        if self.root().tail_upage_used as usize == UPAGE_USERS {
            let tail = self.root().tail_upage;
            let new_page = self.allocate_page()?;
            self.write(Offset(new_page), &UPage::new_empty(tail, NULL_OFFSET))?;
            let mut old_tail: UPage = self.read(Offset(tail));
            old_tail.next = new_page;
            self.write(Offset(tail), &old_tail)?;
            self.update_root(|r| {
                r.tail_upage = new_page;
                r.tail_upage_used = 0;
            })?;
        }

        let root = self.root();
        let id = root.next_account_id;
        let mut tail: UPage = self.read(Offset(root.tail_upage));
        let slot = root.tail_upage_used as usize;
        tail.users[slot].id = id as u16;
        tail.users[slot].set_name_truncated(name);
        self.write(Offset(root.tail_upage), &tail)?;

        self.update_root(|r| {
            r.tail_upage_used += 1;
            r.next_account_id += 1;
        })?;
        Ok(id)
    }

    /// Unregister user `id`. Existing entities keep the now-dangling owner value —
    /// `chown` is how it gets fixed up, same as POSIX leaving orphaned uids behind.
    pub fn rmusr(&mut self, id: u32) -> KResult<()> {
        self.enter_critical()?;
        let result = self.rmusr_locked(id);
        self.leave_critical()?;
        result
    }

    fn rmusr_locked(&mut self, id: u32) -> KResult<()> {
        let (page_off, slot) = self.find_user_by_id(id)?;
        let mut up: UPage = self.read(Offset(page_off));
        up.users[slot] = User::EMPTY;
        self.write(Offset(page_off), &up)
    }

    /// Change the owner of the entity at `path` to the registered user `new_owner`.
    pub fn chown(&mut self, path: &[u8], new_owner: u32) -> KResult<()> {
        self.enter_critical()?;
        let result = self.chown_locked(path, new_owner);
        self.leave_critical()?;
        result
    }

    fn chown_locked(&mut self, path: &[u8], new_owner: u32) -> KResult<()> {
        self.find_user_by_id(new_owner)?;
        let parsed = crate::path::parse(path)?;
        let entity_off = self.find_entity(parsed.components())?;
        let mut entity: Entity = self.read(Offset(entity_off));
        entity.owner = new_owner;
        self.write(Offset(entity_off), &entity)
    }

    /// Overwrite the entity at `path`'s mode bits (everything in `flags` outside the
    /// `DIR`/`FILE` kind bits, which are preserved verbatim).
    pub fn chmod(&mut self, path: &[u8], mode: u32) -> KResult<()> {
        self.enter_critical()?;
        let result = self.chmod_locked(path, mode);
        self.leave_critical()?;
        result
    }

    fn chmod_locked(&mut self, path: &[u8], mode: u32) -> KResult<()> {
        let parsed = crate::path::parse(path)?;
        let entity_off = self.find_entity(parsed.components())?;
        let mut entity: Entity = self.read(Offset(entity_off));
        entity.flags = (entity.flags & KIND_MASK) | (mode & !KIND_MASK);
        self.write(Offset(entity_off), &entity)
    }
}
