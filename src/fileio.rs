//! Content read/write over a file entity's [`FPage`] chain (§4.4).
//!
//! A file behaves like a byte queue more than a random-access file: `write` always
//! appends to the tail, growing the chain as needed, while `read` can either peek at an
//! arbitrary cursor or, with [`ReadFlags::CONSUME`], destructively drain from the head —
//! trimming `head_start` forward and freeing pages once they're entirely behind it,
//! without ever shifting the bytes that remain.

use eonix_errno::KResult;

use crate::api::CozyFs;
use crate::buffer::{Entity, FPage};
use crate::layout::{Offset, ReadFlags, FPAGE_DATA, NULL_OFFSET};
use crate::sysif::SystemInterface;

impl<S: SystemInterface> CozyFs<'_, S> {
    pub(crate) fn entity_len(&self, entity: &Entity) -> usize {
        if entity.head == NULL_OFFSET {
            return 0;
        }
        if entity.head == entity.tail {
            return (entity.tail_end - entity.head_start) as usize;
        }
        let mut len = FPAGE_DATA - entity.head_start as usize;
        let mut cur = entity.head;
        loop {
            let fp: FPage = self.read(Offset(cur));
            if fp.next == entity.tail {
                break;
            }
            len += FPAGE_DATA;
            cur = fp.next;
        }
        len + entity.tail_end as usize
    }

    /// Append `data` to the end of `entity_off`'s content chain, allocating new pages
    /// as the current tail fills up.
    pub(crate) fn write_content(&mut self, entity_off: u32, data: &[u8]) -> KResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut entity: Entity = self.read(Offset(entity_off));

        if entity.tail == NULL_OFFSET {
            let page = self.allocate_page()?;
            self.write(Offset(page), &FPage::new_empty(NULL_OFFSET, NULL_OFFSET))?;
            entity.head = page;
            entity.tail = page;
            entity.head_start = 0;
            entity.tail_end = 0;
        }

        let mut written = 0usize;
        while written < data.len() {
            if entity.tail_end as usize == FPAGE_DATA {
                let new_page = self.allocate_page()?;
                self.write(Offset(new_page), &FPage::new_empty(entity.tail, NULL_OFFSET))?;
                let mut old_tail: FPage = self.read(Offset(entity.tail));
                old_tail.next = new_page;
                self.write(Offset(entity.tail), &old_tail)?;
                entity.tail = new_page;
                entity.tail_end = 0;
            }

            let space = FPAGE_DATA - entity.tail_end as usize;
            let take = space.min(data.len() - written);
            let mut tail_fp: FPage = self.read(Offset(entity.tail));
            let start = entity.tail_end as usize;
            tail_fp.data[start..start + take].copy_from_slice(&data[written..written + take]);
            self.write(Offset(entity.tail), &tail_fp)?;
            entity.tail_end += take as u16;
            written += take;
        }

        self.write(Offset(entity_off), &entity)?;
        Ok(written)
    }

    /// Copy up to `out.len()` bytes starting at `cursor` bytes into the content chain.
    /// With [`ReadFlags::CONSUME`], `cursor` must be 0 and the bytes copied are removed
    /// from the front of the chain.
    pub(crate) fn read_content(
        &mut self,
        entity_off: u32,
        cursor: u32,
        out: &mut [u8],
        flags: ReadFlags,
    ) -> KResult<usize> {
        if flags.contains(ReadFlags::CONSUME) && cursor != 0 {
            return Err(eonix_errno::Errno::Einval);
        }

        let entity: Entity = self.read(Offset(entity_off));
        let content_len = self.entity_len(&entity);
        let start = cursor as usize;
        if start >= content_len || out.is_empty() {
            return Ok(0);
        }
        let to_copy = out.len().min(content_len - start);

        let mut remaining_skip = start;
        let mut copied = 0usize;
        let mut cur = entity.head;
        while cur != NULL_OFFSET && copied < to_copy {
            let fp: FPage = self.read(Offset(cur));
            let live_start = if cur == entity.head {
                entity.head_start as usize
            } else {
                0
            };
            let live_end = if cur == entity.tail {
                entity.tail_end as usize
            } else {
                FPAGE_DATA
            };
            let live_len = live_end - live_start;

            if remaining_skip >= live_len {
                remaining_skip -= live_len;
            } else {
                let local_start = live_start + remaining_skip;
                let avail = live_len - remaining_skip;
                let take = avail.min(to_copy - copied);
                out[copied..copied + take].copy_from_slice(&fp.data[local_start..local_start + take]);
                copied += take;
                remaining_skip = 0;
            }
            cur = fp.next;
        }

        if flags.contains(ReadFlags::CONSUME) {
            self.consume_front(entity_off, copied)?;
        }

        Ok(copied)
    }

    fn consume_front(&mut self, entity_off: u32, n: usize) -> KResult<()> {
        if n == 0 {
            return Ok(());
        }
        let mut entity: Entity = self.read(Offset(entity_off));
        let mut remaining = n;

        while remaining > 0 {
            let head = entity.head;
            let fp: FPage = self.read(Offset(head));
            let is_tail = head == entity.tail;
            let live_end = if is_tail {
                entity.tail_end as usize
            } else {
                FPAGE_DATA
            };
            let live_len = live_end - entity.head_start as usize;

            if remaining < live_len {
                entity.head_start += remaining as u16;
                remaining = 0;
            } else if is_tail {
                self.free_page(head)?;
                entity.head = NULL_OFFSET;
                entity.tail = NULL_OFFSET;
                entity.head_start = 0;
                entity.tail_end = 0;
                remaining = 0;
            } else {
                self.free_page(head)?;
                entity.head = fp.next;
                entity.head_start = 0;
                remaining -= live_len;
            }
        }

        self.write(Offset(entity_off), &entity)
    }
}
