//! Copy-on-write page patching and offset-to-bytes addressing.
//!
//! Every read goes through [`page_bytes`]; every write goes through [`page_bytes_mut`].
//! Outside of a transaction the latter hands back a view straight into the attached
//! buffer. Inside one, the first write to a given page allocates a scratch copy (via
//! [`SystemInterface::malloc`]) and every further read or write of that page is
//! redirected to the copy, so the buffer itself stays untouched until `commit`.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use eonix_errno::{Errno, KResult};

use crate::layout::{Offset, MAX_PATCHES, PAGE_SIZE};
use crate::prelude::{Box, Vec};
use crate::sysif::SystemInterface;

struct Patch {
    page_off: u32,
    /// Byte-for-byte copy of the page as it stood the moment it was first patched, kept
    /// around only to detect commit-time conflicts (§4.9 Open Question (a)): if another
    /// process managed to mutate this page in the shared buffer after we cloned it, this
    /// no longer matches the live bytes and the commit must fail rather than silently
    /// overwrite that write.
    preimage: Box<[u8]>,
    data: Box<[u8]>,
}

/// The set of pages an in-flight transaction has copied for modification.
///
/// Bounded at [`MAX_PATCHES`] entries; a transaction that touches more distinct pages
/// than that fails its next write with [`Errno::Enomem`], mirroring the original's
/// fixed-capacity patch table rather than growing it unboundedly.
#[derive(Default)]
pub struct PatchTable {
    patches: Vec<Patch>,
}

impl PatchTable {
    pub fn new() -> Self {
        Self { patches: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    fn find(&self, page_off: u32) -> Option<usize> {
        self.patches.iter().position(|p| p.page_off == page_off)
    }

    pub fn get(&self, page_off: u32) -> Option<&[u8]> {
        self.find(page_off).map(|i| &*self.patches[i].data)
    }

    pub fn get_mut(&mut self, page_off: u32) -> Option<&mut [u8]> {
        self.find(page_off).map(move |i| &mut *self.patches[i].data)
    }

    fn insert(&mut self, page_off: u32, preimage: Box<[u8]>, data: Box<[u8]>) -> KResult<()> {
        if self.patches.len() >= MAX_PATCHES {
            return Err(Errno::Enomem);
        }
        self.patches.push(Patch { page_off, preimage, data });
        Ok(())
    }

    /// Compare every patch's captured pre-image against the page's current bytes in
    /// `buf`. A mismatch means some other process committed a write to that page after
    /// we cloned it — the "simple scheme" §4.9 calls for, a cheap per-page memcmp rather
    /// than a page generation counter.
    pub fn has_conflict(&self, buf: &[u8]) -> bool {
        self.patches.iter().any(|p| {
            let start = p.page_off as usize;
            &buf[start..start + PAGE_SIZE] != &*p.preimage
        })
    }

    /// Drain every patch, applying each one to `buf` in turn. Used by a transaction
    /// commit; the patches are consumed in the order they were created.
    pub fn drain_into(&mut self, buf: &mut [u8], sysif: &mut impl SystemInterface) {
        for patch in self.patches.drain(..) {
            let start = patch.page_off as usize;
            buf[start..start + PAGE_SIZE].copy_from_slice(&patch.data);
            sysif.free(patch.preimage);
            sysif.free(patch.data);
        }
    }

    /// Drop every patch without applying it. Used by rollback and by a failed commit.
    pub fn discard(&mut self, sysif: &mut impl SystemInterface) {
        for patch in self.patches.drain(..) {
            sysif.free(patch.preimage);
            sysif.free(patch.data);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.patches.iter().map(|p| (p.page_off, &*p.data))
    }
}

const fn page_off(off: Offset) -> u32 {
    off.0 & !(PAGE_SIZE as u32 - 1)
}

const fn byte_off(off: Offset) -> usize {
    (off.0 & (PAGE_SIZE as u32 - 1)) as usize
}

/// Current bytes of the page containing `off`, honoring any open patch.
pub fn page_bytes<'a>(buf: &'a [u8], patches: &'a PatchTable, off: Offset) -> &'a [u8] {
    let page = page_off(off);
    if let Some(patched) = patches.get(page) {
        patched
    } else {
        let start = page as usize;
        &buf[start..start + PAGE_SIZE]
    }
}

/// Mutable bytes of the page containing `off`. Outside a transaction this is the
/// buffer itself; inside one, the page is copy-on-write patched on first access.
pub fn page_bytes_mut<'a>(
    buf: &'a mut [u8],
    patches: &'a mut PatchTable,
    transaction_on: bool,
    sysif: &mut impl SystemInterface,
    off: Offset,
) -> KResult<&'a mut [u8]> {
    let page = page_off(off);

    if !transaction_on {
        let start = page as usize;
        return Ok(&mut buf[start..start + PAGE_SIZE]);
    }

    if patches.get(page).is_none() {
        let start = page as usize;
        let mut preimage = sysif.malloc(PAGE_SIZE).ok_or(Errno::Enomem)?;
        preimage.copy_from_slice(&buf[start..start + PAGE_SIZE]);
        let mut copy = sysif.malloc(PAGE_SIZE).ok_or(Errno::Enomem)?;
        copy.copy_from_slice(&preimage);
        patches.insert(page, preimage, copy)?;
    }

    Ok(patches.get_mut(page).expect("patch was just inserted"))
}

/// Read a value of type `T` out of the buffer at `off`, honoring patches.
///
/// `T` must fit entirely within a single page at `off`; every on-buffer struct in this
/// crate is built to that constraint (no field ever straddles a page boundary).
pub fn read<T>(buf: &[u8], patches: &PatchTable, off: Offset) -> T
where
    T: FromBytes + Immutable + KnownLayout,
{
    let page = page_bytes(buf, patches, off);
    let start = byte_off(off);
    T::read_from_bytes(&page[start..start + core::mem::size_of::<T>()])
        .expect("fixed-size struct read from a page-bounded slice")
}

/// Write a value of type `T` into the buffer at `off`, copy-on-write patching the
/// containing page first if a transaction is open.
pub fn write<T>(
    buf: &mut [u8],
    patches: &mut PatchTable,
    transaction_on: bool,
    sysif: &mut impl SystemInterface,
    off: Offset,
    value: &T,
) -> KResult<()>
where
    T: IntoBytes + Immutable + KnownLayout,
{
    let start = byte_off(off);
    let page = page_bytes_mut(buf, patches, transaction_on, sysif, off)?;
    value
        .write_to(&mut page[start..start + core::mem::size_of::<T>()])
        .expect("fixed-size struct write into a page-bounded slice");
    Ok(())
}
