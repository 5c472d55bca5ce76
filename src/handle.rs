//! Open file descriptors (§4.5): the embedded root handle table plus its [`HPage`]
//! overflow chain, and the `open`/`close`/`read`/`write` operations built on them.
//!
//! A file descriptor is a generation-tagged slot index rather than a bare offset, so a
//! stale fd from a since-closed (and possibly reused) slot is rejected instead of
//! silently acting on the wrong file: [`close`](CozyFs::close) bumps the slot's
//! generation, and every lookup checks it against the generation packed into the fd.

use eonix_errno::{Errno, KResult};

use crate::api::CozyFs;
use crate::buffer::{Entity, HPage, Handle};
use crate::layout::{EntityFlags, Offset, ReadFlags, HPAGE_HANDLES, NULL_OFFSET, ROOT_HANDLES};
use crate::sysif::SystemInterface;

/// An open file descriptor: a slot index and the generation it was issued under.
pub type Fd = u64;

fn pack_fd(index: u32, generation: u16) -> Fd {
    ((generation as u64) << 32) | index as u64
}

fn unpack_fd(fd: Fd) -> (u32, u16) {
    ((fd & 0xFFFF_FFFF) as u32, (fd >> 32) as u16)
}

impl<S: SystemInterface> CozyFs<'_, S> {
    fn handle_at(&self, index: u32) -> KResult<Handle> {
        if (index as usize) < ROOT_HANDLES {
            return Ok(self.root().handles[index as usize]);
        }
        let mut remaining = index as usize - ROOT_HANDLES;
        let mut cur = self.root().hpages;
        while cur != NULL_OFFSET {
            let hp: HPage = self.read(Offset(cur));
            if remaining < HPAGE_HANDLES {
                return Ok(hp.handles[remaining]);
            }
            remaining -= HPAGE_HANDLES;
            cur = hp.next;
        }
        Err(Errno::Ebadf)
    }

    fn set_handle_at(&mut self, index: u32, handle: Handle) -> KResult<()> {
        if (index as usize) < ROOT_HANDLES {
            return self.update_root(|r| r.handles[index as usize] = handle);
        }
        let mut remaining = index as usize - ROOT_HANDLES;
        let mut cur = self.root().hpages;
        while cur != NULL_OFFSET {
            let mut hp: HPage = self.read(Offset(cur));
            if remaining < HPAGE_HANDLES {
                hp.handles[remaining] = handle;
                return self.write(Offset(cur), &hp);
            }
            remaining -= HPAGE_HANDLES;
            cur = hp.next;
        }
        Err(Errno::Ebadf)
    }

    /// Find a free handle slot, growing the `HPage` overflow chain by one page if the
    /// root table and every existing overflow page are full.
    fn alloc_handle_slot(&mut self) -> KResult<u32> {
        let root = self.root();
        for i in 0..ROOT_HANDLES {
            if root.handles[i].used == 0 {
                return Ok(i as u32);
            }
        }

        let mut index_base = ROOT_HANDLES as u32;
        let mut cur = root.hpages;
        let mut prev = None;
        while cur != NULL_OFFSET {
            let hp: HPage = self.read(Offset(cur));
            for i in 0..HPAGE_HANDLES {
                if hp.handles[i].used == 0 {
                    return Ok(index_base + i as u32);
                }
            }
            index_base += HPAGE_HANDLES as u32;
            prev = Some(cur);
            cur = hp.next;
        }

        let new_page = self.allocate_page().map_err(|_| Errno::Enfile)?;
        self.write(
            Offset(new_page),
            &HPage {
                next: NULL_OFFSET,
                handles: [Handle::EMPTY; HPAGE_HANDLES],
            },
        )?;
        match prev {
            Some(p) => {
                let mut p_hp: HPage = self.read(Offset(p));
                p_hp.next = new_page;
                self.write(Offset(p), &p_hp)?;
            }
            None => self.update_root(|r| r.hpages = new_page)?,
        }
        Ok(index_base)
    }

    /// Open `path` for reading and writing, creating a new file there if `create` is
    /// set and nothing already exists. Fails with `EISDIR` if the target is a
    /// directory, `ENFILE` if the handle table is exhausted.
    pub fn open(&mut self, path: &[u8], create: bool, owner: u32) -> KResult<Fd> {
        self.enter_critical()?;
        let result = self.open_locked(path, create, owner);
        self.leave_critical()?;
        result
    }

    fn open_locked(&mut self, path: &[u8], create: bool, owner: u32) -> KResult<Fd> {
        let parsed = crate::path::parse(path)?;
        let entity_off = match self.find_entity(parsed.components()) {
            Ok(off) => off,
            Err(Errno::Enoent) if create => {
                let (parent_comps, name) = parsed.split_last().ok_or(Errno::Eexist)?;
                let parent_off = self.find_entity(parent_comps)?;
                self.create_entity(parent_off, name, EntityFlags::FILE, owner)?
            }
            Err(e) => return Err(e),
        };

        let mut entity: Entity = self.read(Offset(entity_off));
        if entity.flags().contains(EntityFlags::DIR) {
            return Err(Errno::Eisdir);
        }

        let index = self.alloc_handle_slot()?;
        let mut handle = self.handle_at(index)?;
        handle.used = 1;
        handle.entity = entity_off;
        handle.cursor = 0;
        self.set_handle_at(index, handle)?;

        entity.refs += 1;
        self.write(Offset(entity_off), &entity)?;

        Ok(pack_fd(index, handle.generation))
    }

    /// Close `fd`, dropping the entity's open-handle reference and freeing its content
    /// once nothing references it anymore.
    pub fn close(&mut self, fd: Fd) -> KResult<()> {
        self.enter_critical()?;
        let result = self.close_locked(fd);
        self.leave_critical()?;
        result
    }

    fn close_locked(&mut self, fd: Fd) -> KResult<()> {
        let (index, generation) = unpack_fd(fd);
        let mut handle = self.handle_at(index)?;
        if handle.used == 0 || handle.generation != generation {
            return Err(Errno::Ebadf);
        }
        let entity_off = handle.entity;

        handle.used = 0;
        handle.generation = match handle.generation.wrapping_add(1) {
            0 | 0xFFFF => 1,
            g => g,
        };
        handle.entity = NULL_OFFSET;
        handle.cursor = 0;
        self.set_handle_at(index, handle)?;

        let mut entity: Entity = self.read(Offset(entity_off));
        entity.refs = entity.refs.saturating_sub(1);
        if entity.refs == 0 {
            self.free_entity_content(&entity)?;
            self.clear_entity_slot(entity_off)?;
        } else {
            self.write(Offset(entity_off), &entity)?;
        }
        Ok(())
    }

    /// Read through `fd` into `out`, returning the number of bytes copied. Advances the
    /// handle's cursor unless `flags` requests [`ReadFlags::CONSUME`], which drains
    /// from the front of the file instead and requires the handle to be at cursor 0.
    pub fn read(&mut self, fd: Fd, out: &mut [u8], flags: ReadFlags) -> KResult<usize> {
        self.enter_critical()?;
        let result = self.read_locked(fd, out, flags);
        self.leave_critical()?;
        result
    }

    fn read_locked(&mut self, fd: Fd, out: &mut [u8], flags: ReadFlags) -> KResult<usize> {
        let (index, generation) = unpack_fd(fd);
        let handle = self.handle_at(index)?;
        if handle.used == 0 || handle.generation != generation {
            return Err(Errno::Ebadf);
        }
        let n = self.read_content(handle.entity, handle.cursor, out, flags)?;
        if !flags.contains(ReadFlags::CONSUME) {
            let mut h = handle;
            h.cursor += n as u32;
            self.set_handle_at(index, h)?;
        }
        Ok(n)
    }

    /// Append `data` to the file `fd` refers to.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> KResult<usize> {
        self.enter_critical()?;
        let result = self.write_locked(fd, data);
        self.leave_critical()?;
        result
    }

    fn write_locked(&mut self, fd: Fd, data: &[u8]) -> KResult<usize> {
        let (index, generation) = unpack_fd(fd);
        let handle = self.handle_at(index)?;
        if handle.used == 0 || handle.generation != generation {
            return Err(Errno::Ebadf);
        }
        self.write_content(handle.entity, data)
    }
}
