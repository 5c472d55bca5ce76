//! Page allocator (§4.2) and entity/directory model (§4.3): `mkdir`, `rmdir`, `link`,
//! `unlink`, and the lookup/allocation machinery underneath them.
//!
//! A directory's content is a chain of [`DPage`]s holding `(Link, Entity)` pairs at
//! matching indices. `create_entity` stores a brand-new entity right where its link
//! goes; `link` instead points a new `Link` at an entity that already lives elsewhere,
//! bumping its `refs`. Either way, [`find_unused_entity`] lets a directory that needs a
//! fresh page first check the buffer-wide chain of every `DPage` for one that's gone
//! completely vacant — no live link left in it, and no embedded entity any other page's
//! hard link still depends on — before falling back to the raw page allocator. A `DPage`
//! is detached from its owning directory's own `prev`/`next` chain (and that directory's
//! `head`/`tail` fixed up) the moment its last live link is cleared, so a directory a few
//! levels down can reclaim a page vacated by some unrelated directory on the other side
//! of the tree without either one walking the other's subtree to find it, and without a
//! stale `head`/`tail` pointing into a page that's since been handed to someone else.

use eonix_errno::{Errno, KResult};

use crate::api::CozyFs;
use crate::buffer::{DPage, Entity, Link, XPage};
use crate::layout::{EntityFlags, Offset, DPAGE_SLOTS, MAX_NAME, NULL_OFFSET, PAGE_SIZE};
use crate::sysif::SystemInterface;

/// Byte offset of the root directory's embedded [`Entity`] — the top of every lookup.
pub(crate) fn root_entity_offset() -> u32 {
    core::mem::offset_of!(crate::buffer::RPage, root) as u32
}

fn entity_addr(dpage_off: u32, slot: usize) -> u32 {
    dpage_off + core::mem::offset_of!(DPage, ents) as u32 + (slot * core::mem::size_of::<Entity>()) as u32
}

fn entity_slot_location(entity_off: u32) -> (u32, usize) {
    let page = entity_off & !(PAGE_SIZE as u32 - 1);
    let within = (entity_off - page) as usize;
    let ents_off = core::mem::offset_of!(DPage, ents);
    let slot = (within - ents_off) / core::mem::size_of::<Entity>();
    (page, slot)
}

impl<S: SystemInterface> CozyFs<'_, S> {
    /// Pop a page off the free list, or fail with `ENOMEM` once it's exhausted.
    pub(crate) fn allocate_page(&mut self) -> KResult<u32> {
        let root = self.root();
        if root.free_pages == NULL_OFFSET {
            log::warn!("page allocator exhausted");
            return Err(Errno::Enomem);
        }
        let xpage: XPage = self.read(Offset(root.free_pages));
        let allocated = root.free_pages;
        self.update_root(|r| {
            r.free_pages = xpage.next;
            r.num_pages += 1;
        })?;
        Ok(allocated)
    }

    /// Push a page back onto the free list.
    pub(crate) fn free_page(&mut self, off: u32) -> KResult<()> {
        let root = self.root();
        let xpage = XPage::new(root.free_pages);
        self.write(Offset(off), &xpage)?;
        self.update_root(|r| {
            r.free_pages = off;
            r.num_pages -= 1;
        })
    }

    /// Walk the buffer-wide `DPage` chain for one that's entirely vacant: every link
    /// slot empty (so no directory's lookup chain still names it) and every embedded
    /// entity at `refs == 0` (so no hard link elsewhere still depends on the storage a
    /// link in *this* page used to point at) — independent of which directory, if any,
    /// currently owns it.
    ///
    /// Both halves of the check matter on their own: a page full of hard links whose
    /// targets live on other pages has all-zero local `ents` while its `links` are very
    /// much alive, and a page whose own links were just cleared can still be the home of
    /// an entity some other directory's hard link still points at.
    pub(crate) fn find_unused_entity(&self) -> KResult<Option<u32>> {
        let root = self.root();
        let mut cur = root.dpages;
        while cur != NULL_OFFSET {
            let dp: DPage = self.read(Offset(cur));
            if dp.links.iter().all(Link::is_empty) && dp.ents.iter().all(|e| e.refs == 0) {
                return Ok(Some(cur));
            }
            cur = dp.global_next;
        }
        Ok(None)
    }

    fn push_global_dpage(&mut self, off: u32) -> KResult<()> {
        let root = self.root();
        let old_head = root.dpages;
        let mut dp: DPage = self.read(Offset(off));
        dp.global_prev = NULL_OFFSET;
        dp.global_next = old_head;
        self.write(Offset(off), &dp)?;
        if old_head != NULL_OFFSET {
            let mut head_dp: DPage = self.read(Offset(old_head));
            head_dp.global_prev = off;
            self.write(Offset(old_head), &head_dp)?;
        }
        self.update_root(|r| r.dpages = off)
    }

    fn unlink_global_dpage(&mut self, off: u32) -> KResult<()> {
        let dp: DPage = self.read(Offset(off));
        if dp.global_prev != NULL_OFFSET {
            let mut p: DPage = self.read(Offset(dp.global_prev));
            p.global_next = dp.global_next;
            self.write(Offset(dp.global_prev), &p)?;
        } else {
            self.update_root(|r| r.dpages = dp.global_next)?;
        }
        if dp.global_next != NULL_OFFSET {
            let mut n: DPage = self.read(Offset(dp.global_next));
            n.global_prev = dp.global_prev;
            self.write(Offset(dp.global_next), &n)?;
        }
        Ok(())
    }

    /// Get a `DPage` to extend a directory's own chain with, reclaiming a globally
    /// vacant one before allocating a fresh page.
    fn alloc_dpage_for(&mut self, prev: u32, next: u32) -> KResult<u32> {
        if let Some(off) = self.find_unused_entity()? {
            self.unlink_global_dpage(off)?;
            self.push_global_dpage(off)?;
            let mut dp: DPage = self.read(Offset(off));
            dp.prev = prev;
            dp.next = next;
            dp.flags = 0;
            self.write(Offset(off), &dp)?;
            return Ok(off);
        }

        let off = self.allocate_page()?;
        self.write(Offset(off), &DPage::new_empty(NULL_OFFSET, NULL_OFFSET))?;
        self.push_global_dpage(off)?;
        let mut dp: DPage = self.read(Offset(off));
        dp.prev = prev;
        dp.next = next;
        self.write(Offset(off), &dp)?;
        Ok(off)
    }

    fn write_entity(&mut self, off: u32, f: impl FnOnce(&mut Entity)) -> KResult<()> {
        let mut e: Entity = self.read(Offset(off));
        f(&mut e);
        self.write(Offset(off), &e)
    }

    pub(crate) fn clear_entity_slot(&mut self, entity_off: u32) -> KResult<()> {
        let (dpage_off, slot) = entity_slot_location(entity_off);
        let mut dp: DPage = self.read(Offset(dpage_off));
        dp.ents[slot] = Entity::EMPTY;
        self.write(Offset(dpage_off), &dp)
    }

    /// Clear a single link slot in `dir_entity_off`'s own chain, and if that leaves the
    /// `DPage` with no live link at all, detach it from the directory immediately rather
    /// than leaving a structurally empty page reachable from `head`/`tail` (§4.3).
    fn clear_link_slot(&mut self, dir_entity_off: u32, dpage_off: u32, slot: usize) -> KResult<()> {
        let mut dp: DPage = self.read(Offset(dpage_off));
        dp.links[slot] = Link::EMPTY;
        let now_empty = dp.links.iter().all(Link::is_empty);
        self.write(Offset(dpage_off), &dp)?;

        if now_empty {
            self.detach_dpage_from_dir(dir_entity_off, dpage_off)?;
        }
        Ok(())
    }

    /// Unlink `dpage_off` from `dir_entity_off`'s own `prev`/`next` chain, fixing up the
    /// neighbors and the directory's `head`/`tail`. The page keeps its place on the
    /// buffer-wide chain so `find_unused_entity` can still find it once it's genuinely
    /// vacant; it's just no longer reachable from any directory's lookup.
    fn detach_dpage_from_dir(&mut self, dir_entity_off: u32, dpage_off: u32) -> KResult<()> {
        let dp: DPage = self.read(Offset(dpage_off));
        let (prev, next) = (dp.prev, dp.next);

        if prev != NULL_OFFSET {
            let mut p: DPage = self.read(Offset(prev));
            p.next = next;
            self.write(Offset(prev), &p)?;
        }
        if next != NULL_OFFSET {
            let mut n: DPage = self.read(Offset(next));
            n.prev = prev;
            self.write(Offset(next), &n)?;
        }

        let mut dp = dp;
        dp.prev = NULL_OFFSET;
        dp.next = NULL_OFFSET;
        self.write(Offset(dpage_off), &dp)?;

        let dir: Entity = self.read(Offset(dir_entity_off));
        let new_head = if dir.head == dpage_off { next } else { dir.head };
        let new_tail = if dir.tail == dpage_off { prev } else { dir.tail };
        self.write_entity(dir_entity_off, |e| {
            e.head = new_head;
            e.tail = new_tail;
        })
    }

    /// `true` if any `DPage` in `dir_entity_off`'s own chain still holds a live link —
    /// the definition of "non-empty" a directory is held to by §4.3, independent of
    /// whatever `head`/`tail` currently say.
    fn directory_has_live_link(&self, dir_entity_off: u32) -> bool {
        let dir: Entity = self.read(Offset(dir_entity_off));
        let mut cur = dir.head;
        while cur != NULL_OFFSET {
            let dp: DPage = self.read(Offset(cur));
            if dp.links.iter().any(|l| !l.is_empty()) {
                return true;
            }
            cur = dp.next;
        }
        false
    }

    pub(crate) fn free_entity_content(&mut self, entity: &Entity) -> KResult<()> {
        let mut cur = entity.head;
        while cur != NULL_OFFSET {
            let fp: crate::buffer::FPage = self.read(Offset(cur));
            let next = fp.next;
            self.free_page(cur)?;
            cur = next;
        }
        Ok(())
    }

    fn find_link_slot(&self, dir_entity_off: u32, name: &[u8]) -> KResult<(u32, usize)> {
        let dir: Entity = self.read(Offset(dir_entity_off));
        let mut cur = dir.head;
        while cur != NULL_OFFSET {
            let dp: DPage = self.read(Offset(cur));
            for slot in 0..DPAGE_SLOTS {
                if !dp.links[slot].is_empty() && dp.links[slot].name_bytes() == name {
                    return Ok((cur, slot));
                }
            }
            cur = dp.next;
        }
        Err(Errno::Enoent)
    }

    fn lookup_child(&self, dir_entity_off: u32, name: &[u8]) -> KResult<u32> {
        let (dpage_off, slot) = self.find_link_slot(dir_entity_off, name)?;
        let dp: DPage = self.read(Offset(dpage_off));
        Ok(dp.links[slot].off)
    }

    /// Resolve a parsed path's components to the offset of the entity they name,
    /// starting from the root directory.
    pub(crate) fn find_entity(&self, components: &[&[u8]]) -> KResult<u32> {
        let mut cur = root_entity_offset();
        for comp in components {
            let dir: Entity = self.read(Offset(cur));
            if !dir.flags().contains(EntityFlags::DIR) {
                return Err(Errno::Enoent);
            }
            cur = self.lookup_child(cur, comp)?;
        }
        Ok(cur)
    }

    fn insert_dir_entry(&mut self, dir_entity_off: u32, name: &[u8], entity: Entity) -> KResult<u32> {
        let dir_entity: Entity = self.read(Offset(dir_entity_off));
        let mut cur = dir_entity.head;
        while cur != NULL_OFFSET {
            let mut dp: DPage = self.read(Offset(cur));
            if let Some(slot) = (0..DPAGE_SLOTS).find(|&i| dp.links[i].is_empty()) {
                let addr = entity_addr(cur, slot);
                dp.ents[slot] = entity;
                dp.links[slot].off = addr;
                dp.links[slot].set_name(name);
                self.write(Offset(cur), &dp)?;
                return Ok(addr);
            }
            cur = dp.next;
        }

        let tail = dir_entity.tail;
        let new_off = self.alloc_dpage_for(tail, NULL_OFFSET)?;
        let addr = entity_addr(new_off, 0);
        let mut dp: DPage = self.read(Offset(new_off));
        dp.ents[0] = entity;
        dp.links[0].off = addr;
        dp.links[0].set_name(name);
        self.write(Offset(new_off), &dp)?;

        if tail != NULL_OFFSET {
            let mut tail_dp: DPage = self.read(Offset(tail));
            tail_dp.next = new_off;
            self.write(Offset(tail), &tail_dp)?;
        }
        let new_head = if dir_entity.head == NULL_OFFSET { new_off } else { dir_entity.head };
        self.write_entity(dir_entity_off, |e| {
            e.head = new_head;
            e.tail = new_off;
        })?;
        Ok(addr)
    }

    fn insert_existing_dir_entry(&mut self, dir_entity_off: u32, name: &[u8], entity_off: u32) -> KResult<()> {
        let dir_entity: Entity = self.read(Offset(dir_entity_off));
        let mut cur = dir_entity.head;
        while cur != NULL_OFFSET {
            let mut dp: DPage = self.read(Offset(cur));
            if let Some(slot) = (0..DPAGE_SLOTS).find(|&i| dp.links[i].is_empty()) {
                dp.links[slot].off = entity_off;
                dp.links[slot].set_name(name);
                self.write(Offset(cur), &dp)?;
                return Ok(());
            }
            cur = dp.next;
        }

        let tail = dir_entity.tail;
        let new_off = self.alloc_dpage_for(tail, NULL_OFFSET)?;
        let mut dp: DPage = self.read(Offset(new_off));
        dp.links[0].off = entity_off;
        dp.links[0].set_name(name);
        self.write(Offset(new_off), &dp)?;

        if tail != NULL_OFFSET {
            let mut tail_dp: DPage = self.read(Offset(tail));
            tail_dp.next = new_off;
            self.write(Offset(tail), &tail_dp)?;
        }
        let new_head = if dir_entity.head == NULL_OFFSET { new_off } else { dir_entity.head };
        self.write_entity(dir_entity_off, |e| {
            e.head = new_head;
            e.tail = new_off;
        })
    }

    /// Create a brand-new entity named `name` inside the directory at `dir_entity_off`.
    /// Shared by `mkdir` and `open`'s create path.
    pub(crate) fn create_entity(
        &mut self,
        dir_entity_off: u32,
        name: &[u8],
        flags: EntityFlags,
        owner: u32,
    ) -> KResult<u32> {
        if name.is_empty() || name.len() > MAX_NAME {
            return Err(Errno::Einval);
        }
        if self.lookup_child(dir_entity_off, name).is_ok() {
            return Err(Errno::Eexist);
        }
        let entity = Entity {
            refs: 1,
            flags: flags.bits(),
            head: NULL_OFFSET,
            tail: NULL_OFFSET,
            owner,
            head_start: 0,
            tail_end: 0,
        };
        self.insert_dir_entry(dir_entity_off, name, entity)
    }

    /// Remove the named entry from `dir_entity_off`, dropping the entity's `refs` by
    /// one and freeing its content chain once it reaches zero. Fails with `EPERM` if
    /// the entry is a directory — use `rmdir` for those.
    pub(crate) fn unlink_named(&mut self, dir_entity_off: u32, name: &[u8]) -> KResult<()> {
        let (dpage_off, slot) = self.find_link_slot(dir_entity_off, name)?;
        let dp: DPage = self.read(Offset(dpage_off));
        let entity_off = dp.links[slot].off;
        let mut entity: Entity = self.read(Offset(entity_off));
        if entity.flags().contains(EntityFlags::DIR) {
            return Err(Errno::Eperm);
        }

        self.clear_link_slot(dir_entity_off, dpage_off, slot)?;

        entity.refs = entity.refs.saturating_sub(1);
        if entity.refs == 0 {
            self.free_entity_content(&entity)?;
            self.clear_entity_slot(entity_off)?;
        } else {
            self.write(Offset(entity_off), &entity)?;
        }
        Ok(())
    }

    /// Create a directory at `path`. Fails with `ENOENT` if the parent doesn't exist or
    /// isn't itself a directory, `EEXIST` if the name is already taken.
    pub fn mkdir(&mut self, path: &[u8], owner: u32) -> KResult<()> {
        self.enter_critical()?;
        let result = self.mkdir_locked(path, owner);
        self.leave_critical()?;
        result
    }

    fn mkdir_locked(&mut self, path: &[u8], owner: u32) -> KResult<()> {
        let parsed = crate::path::parse(path)?;
        let (parent_comps, name) = parsed.split_last().ok_or(Errno::Eexist)?;
        let parent_off = self.find_entity(parent_comps)?;
        let parent: Entity = self.read(Offset(parent_off));
        if !parent.flags().contains(EntityFlags::DIR) {
            return Err(Errno::Enoent);
        }
        self.create_entity(parent_off, name, EntityFlags::DIR, owner)?;
        Ok(())
    }

    /// Remove the directory at `path`. Fails with `EPERM` if it's not empty or is the
    /// root, `ENOENT` if it isn't a directory.
    pub fn rmdir(&mut self, path: &[u8]) -> KResult<()> {
        self.enter_critical()?;
        let result = self.rmdir_locked(path);
        self.leave_critical()?;
        result
    }

    fn rmdir_locked(&mut self, path: &[u8]) -> KResult<()> {
        let parsed = crate::path::parse(path)?;
        let (parent_comps, name) = parsed.split_last().ok_or(Errno::Eperm)?;
        let parent_off = self.find_entity(parent_comps)?;
        let (dpage_off, slot) = self.find_link_slot(parent_off, name)?;
        let dp: DPage = self.read(Offset(dpage_off));
        let entity_off = dp.links[slot].off;
        let entity: Entity = self.read(Offset(entity_off));
        if !entity.flags().contains(EntityFlags::DIR) {
            return Err(Errno::Enoent);
        }
        if self.directory_has_live_link(entity_off) {
            return Err(Errno::Eperm);
        }

        self.clear_link_slot(parent_off, dpage_off, slot)?;
        self.clear_entity_slot(entity_off)?;
        Ok(())
    }

    /// Create an additional name for an existing, non-directory entity.
    pub fn link(&mut self, existing_path: &[u8], new_path: &[u8]) -> KResult<()> {
        self.enter_critical()?;
        let result = self.link_locked(existing_path, new_path);
        self.leave_critical()?;
        result
    }

    fn link_locked(&mut self, existing_path: &[u8], new_path: &[u8]) -> KResult<()> {
        let existing_parsed = crate::path::parse(existing_path)?;
        let entity_off = self.find_entity(existing_parsed.components())?;
        let mut entity: Entity = self.read(Offset(entity_off));
        if entity.flags().contains(EntityFlags::DIR) {
            return Err(Errno::Eperm);
        }

        let new_parsed = crate::path::parse(new_path)?;
        let (parent_comps, name) = new_parsed.split_last().ok_or(Errno::Eexist)?;
        let parent_off = self.find_entity(parent_comps)?;
        if self.lookup_child(parent_off, name).is_ok() {
            return Err(Errno::Eexist);
        }

        self.insert_existing_dir_entry(parent_off, name, entity_off)?;
        entity.refs += 1;
        self.write(Offset(entity_off), &entity)?;
        Ok(())
    }

    /// Remove the name `path` from its parent directory.
    pub fn unlink(&mut self, path: &[u8]) -> KResult<()> {
        self.enter_critical()?;
        let result = self.unlink_locked(path);
        self.leave_critical()?;
        result
    }

    fn unlink_locked(&mut self, path: &[u8]) -> KResult<()> {
        let parsed = crate::path::parse(path)?;
        let (parent_comps, name) = parsed.split_last().ok_or(Errno::Eperm)?;
        let parent_off = self.find_entity(parent_comps)?;
        self.unlink_named(parent_off, name)
    }
}
