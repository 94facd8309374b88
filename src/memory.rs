//! Guest physical memory slots with dirty-page tracking.
//!
//! A slot is a contiguous run of guest frames backed by host pages the slot
//! owns. Reconfiguration is optimistic: page and bitmap allocation happen
//! outside the table lock, and the whole operation retries from the top if
//! the configuration version moved underneath it. The lock is only ever held
//! for metadata updates and short copies.

use crate::{
    x86::{Gpa, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE},
    Result, VmxError, MAX_MEMORY_SLOTS,
};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

bitflags::bitflags! {
    pub struct SlotFlags: u32 {
        /// Record guest writes in the slot's dirty bitmap.
        const LOG_DIRTY_PAGES = 1 << 0;
    }
}

/// One host page of guest memory.
#[repr(C, align(4096))]
pub struct PageData(pub [u8; PAGE_SIZE as usize]);

impl PageData {
    const fn zeroed() -> Self {
        Self([0; PAGE_SIZE as usize])
    }
}

#[derive(Default)]
struct MemorySlot {
    base_gfn: u64,
    npages: u64,
    flags: u32,
    pages: Vec<PageData>,
    /// One bit per frame; empty when dirty tracking is off.
    dirty: Vec<u64>,
}

impl MemorySlot {
    fn contains(&self, gfn: u64) -> bool {
        self.npages != 0 && gfn >= self.base_gfn && gfn < self.base_gfn + self.npages
    }

    fn overlaps(&self, base_gfn: u64, npages: u64) -> bool {
        self.npages != 0 && base_gfn < self.base_gfn + self.npages && base_gfn + npages > self.base_gfn
    }
}

struct SlotTable {
    version: u64,
    slots: [MemorySlot; MAX_MEMORY_SLOTS],
}

/// The guest address space of one virtual machine.
pub struct GuestMemory {
    table: Mutex<SlotTable>,
    /// Advisory count of in-flight dirty-log reads; reconfiguration fails
    /// with `Busy` while nonzero instead of blocking.
    busy: AtomicU32,
}

/// A fetched dirty bitmap. Holds the busy reference until dropped so the
/// slots cannot be reconfigured while the caller flushes translations.
pub struct DirtyLog<'a> {
    mem: &'a GuestMemory,
    bitmap: Vec<u64>,
    any_set: bool,
}

impl core::fmt::Debug for DirtyLog<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirtyLog")
            .field("bitmap", &self.bitmap)
            .field("any_set", &self.any_set)
            .finish_non_exhaustive()
    }
}

impl DirtyLog<'_> {
    pub fn any_set(&self) -> bool {
        self.any_set
    }

    pub fn bitmap(&self) -> &[u64] {
        &self.bitmap
    }

    pub fn into_bitmap(mut self) -> Vec<u64> {
        core::mem::take(&mut self.bitmap)
    }
}

impl Drop for DirtyLog<'_> {
    fn drop(&mut self) {
        self.mem.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

impl GuestMemory {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(SlotTable {
                version: 0,
                slots: Default::default(),
            }),
            busy: AtomicU32::new(0),
        }
    }

    /// Current configuration version, bumped by every successful
    /// reconfiguration.
    pub fn version(&self) -> u64 {
        self.table.lock().version
    }

    /// Create, replace or remove (npages = 0) a memory slot.
    pub fn reconfigure(&self, slot: usize, base: Gpa, bytes: u64, flags: SlotFlags) -> Result<()> {
        if slot >= MAX_MEMORY_SLOTS
            || base.page_offset() != 0
            || bytes & PAGE_MASK != 0
            || base.into_u64().checked_add(bytes).is_none()
        {
            return Err(VmxError::InvalidArgument);
        }
        let base_gfn = base.gfn();
        let npages = bytes >> PAGE_SHIFT;

        loop {
            let (version, need_pages, need_bitmap) = {
                let table = self.table.lock();
                if self.busy.load(Ordering::Acquire) != 0 {
                    return Err(VmxError::Busy);
                }
                let s = &table.slots[slot];
                // A populated slot keeps its size; remove it first to resize.
                if npages != 0 && s.npages != 0 && s.npages != npages {
                    return Err(VmxError::InvalidArgument);
                }
                for (i, other) in table.slots.iter().enumerate() {
                    if i != slot && npages != 0 && other.overlaps(base_gfn, npages) {
                        return Err(VmxError::Overlap);
                    }
                }
                let need_pages = npages != 0 && s.pages.is_empty();
                let need_bitmap = npages != 0
                    && flags.contains(SlotFlags::LOG_DIRTY_PAGES)
                    && s.dirty.is_empty();
                (table.version, need_pages, need_bitmap)
            };

            // Allocate with the lock dropped; retried if the version moves.
            let mut pages = Vec::new();
            if need_pages {
                pages
                    .try_reserve_exact(npages as usize)
                    .map_err(|_| VmxError::OutOfMemory)?;
                for _ in 0..npages {
                    pages.push(PageData::zeroed());
                }
            }
            let mut bitmap = Vec::new();
            if need_bitmap {
                let words = (npages as usize + 63) / 64;
                bitmap
                    .try_reserve_exact(words)
                    .map_err(|_| VmxError::OutOfMemory)?;
                bitmap.resize(words, 0u64);
            }

            let mut table = self.table.lock();
            if table.version != version {
                continue;
            }
            table.version += 1;
            let s = &mut table.slots[slot];
            s.base_gfn = base_gfn;
            s.npages = npages;
            s.flags = flags.bits();
            let mut freed_pages = Vec::new();
            let mut freed_bitmap = Vec::new();
            if npages == 0 {
                freed_pages = core::mem::take(&mut s.pages);
                freed_bitmap = core::mem::take(&mut s.dirty);
            } else {
                if need_pages {
                    s.pages = pages;
                }
                if flags.contains(SlotFlags::LOG_DIRTY_PAGES) {
                    if need_bitmap {
                        s.dirty = bitmap;
                    }
                } else {
                    freed_bitmap = core::mem::take(&mut s.dirty);
                }
            }
            drop(table);
            // Page teardown happens outside the critical section.
            drop(freed_pages);
            drop(freed_bitmap);
            return Ok(());
        }
    }

    /// Run `f` against the page backing `gfn`, if any slot resolves it.
    pub fn with_page<R>(&self, gfn: u64, f: impl FnOnce(&PageData) -> R) -> Option<R> {
        let table = self.table.lock();
        let slot = table.slots.iter().find(|s| s.contains(gfn))?;
        let idx = (gfn - slot.base_gfn) as usize;
        slot.pages.get(idx).map(f)
    }

    /// True when some slot resolves `gfn`.
    pub fn resolves(&self, gfn: u64) -> bool {
        self.with_page(gfn, |_| ()).is_some()
    }

    /// Record a guest write to `gfn`. A frame outside any tracked slot is a
    /// no-op.
    pub fn mark_dirty(&self, gfn: u64) {
        let mut table = self.table.lock();
        for slot in table.slots.iter_mut() {
            if slot.contains(gfn) {
                if !slot.dirty.is_empty() {
                    let rel = (gfn - slot.base_gfn) as usize;
                    let (word, bit) = (rel / 64, rel % 64);
                    // Skip the store when the bit is already set.
                    if slot.dirty[word] & (1 << bit) == 0 {
                        slot.dirty[word] |= 1 << bit;
                    }
                }
                return;
            }
        }
    }

    /// Copy out and clear a slot's dirty bitmap. The returned handle pins
    /// the busy count; reconfiguration fails until it is dropped.
    pub fn fetch_dirty_log(&self, slot: usize) -> Result<DirtyLog<'_>> {
        if slot >= MAX_MEMORY_SLOTS {
            return Err(VmxError::InvalidArgument);
        }
        let words = {
            let table = self.table.lock();
            let s = &table.slots[slot];
            if s.dirty.is_empty() {
                return Err(VmxError::NoDirtyLog);
            }
            self.busy.fetch_add(1, Ordering::AcqRel);
            s.dirty.len()
        };
        let mut bitmap = Vec::new();
        if bitmap.try_reserve_exact(words).is_err() {
            self.busy.fetch_sub(1, Ordering::AcqRel);
            return Err(VmxError::OutOfMemory);
        }
        bitmap.resize(words, 0u64);
        let mut any_set = false;
        {
            let mut table = self.table.lock();
            let s = &mut table.slots[slot];
            for (out, word) in bitmap.iter_mut().zip(s.dirty.iter_mut()) {
                *out = *word;
                any_set |= *word != 0;
                *word = 0;
            }
        }
        Ok(DirtyLog {
            mem: self,
            bitmap,
            any_set,
        })
    }

    /// Copy guest memory into `buf`, crossing slot and page boundaries.
    /// Returns the number of bytes actually resolved.
    pub fn read(&self, gpa: Gpa, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let cur = gpa + done as u64;
            let off = cur.page_offset() as usize;
            let chunk = core::cmp::min(buf.len() - done, PAGE_SIZE as usize - off);
            let copied = self.with_page(cur.gfn(), |page| {
                buf[done..done + chunk].copy_from_slice(&page.0[off..off + chunk]);
            });
            if copied.is_none() {
                break;
            }
            done += chunk;
        }
        done
    }

    /// Copy `buf` into guest memory, marking touched frames dirty. Returns
    /// the number of bytes actually resolved.
    pub fn write(&self, gpa: Gpa, buf: &[u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let cur = gpa + done as u64;
            let gfn = cur.gfn();
            let off = cur.page_offset() as usize;
            let chunk = core::cmp::min(buf.len() - done, PAGE_SIZE as usize - off);
            let copied = {
                let mut table = self.table.lock();
                match table.slots.iter_mut().find(|s| s.contains(gfn)) {
                    Some(slot) => {
                        let idx = (gfn - slot.base_gfn) as usize;
                        match slot.pages.get_mut(idx) {
                            Some(page) => {
                                page.0[off..off + chunk].copy_from_slice(&buf[done..done + chunk]);
                                true
                            }
                            None => false,
                        }
                    }
                    None => false,
                }
            };
            if !copied {
                break;
            }
            self.mark_dirty(gfn);
            done += chunk;
        }
        done
    }

    /// Base frame and length of slot 0, used for the real-mode task-state
    /// region reserved at its top.
    pub fn slot0_range(&self) -> Option<(u64, u64)> {
        let table = self.table.lock();
        let s = &table.slots[0];
        if s.npages == 0 {
            None
        } else {
            Some((s.base_gfn, s.npages))
        }
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_with_slot(slot: usize, base: u64, bytes: u64, flags: SlotFlags) -> GuestMemory {
        let mem = GuestMemory::new();
        mem.reconfigure(slot, Gpa::new(base), bytes, flags).unwrap();
        mem
    }

    #[test]
    fn create_then_remove_leaves_no_resolvable_frames() {
        let mem = mem_with_slot(0, 0x10000, 0x4000, SlotFlags::empty());
        assert!(mem.resolves(0x10));
        assert!(mem.resolves(0x13));
        mem.reconfigure(0, Gpa::new(0x10000), 0, SlotFlags::empty())
            .unwrap();
        for gfn in 0x10..0x14 {
            assert!(!mem.resolves(gfn));
        }
    }

    #[test]
    fn overlapping_slots_are_rejected_unchanged() {
        let mem = mem_with_slot(0, 0, 0x4000, SlotFlags::empty());
        let v = mem.version();
        let err = mem
            .reconfigure(1, Gpa::new(0x2000), 0x4000, SlotFlags::empty())
            .unwrap_err();
        assert_eq!(err, VmxError::Overlap);
        assert_eq!(mem.version(), v);
        assert!(mem.resolves(0));
        assert!(!mem.resolves(4));
    }

    #[test]
    fn populated_slot_cannot_resize_in_place() {
        let mem = mem_with_slot(0, 0, 0x2000, SlotFlags::empty());
        assert_eq!(
            mem.reconfigure(0, Gpa::new(0), 0x4000, SlotFlags::empty()),
            Err(VmxError::InvalidArgument)
        );
    }

    #[test]
    fn out_of_range_slot_index_keeps_version() {
        let mem = GuestMemory::new();
        let v = mem.version();
        assert_eq!(
            mem.reconfigure(MAX_MEMORY_SLOTS, Gpa::new(0), 0x1000, SlotFlags::empty()),
            Err(VmxError::InvalidArgument)
        );
        assert_eq!(mem.version(), v);
    }

    #[test]
    fn dirty_tracking_fetch_and_clear() {
        let mem = mem_with_slot(0, 0, 0x4000, SlotFlags::LOG_DIRTY_PAGES);
        mem.mark_dirty(2);
        {
            let log = mem.fetch_dirty_log(0).unwrap();
            assert!(log.any_set());
            assert_eq!(log.bitmap()[0], 1 << 2);
        }
        let log = mem.fetch_dirty_log(0).unwrap();
        assert!(!log.any_set());
        assert_eq!(log.bitmap()[0], 0);
    }

    #[test]
    fn marking_untracked_frame_is_noop() {
        let mem = mem_with_slot(0, 0, 0x4000, SlotFlags::empty());
        mem.mark_dirty(2);
        mem.mark_dirty(0x999);
        assert_eq!(mem.fetch_dirty_log(0).unwrap_err(), VmxError::NoDirtyLog);
    }

    #[test]
    fn reconfigure_fails_while_dirty_fetch_in_flight() {
        let mem = mem_with_slot(0, 0, 0x4000, SlotFlags::LOG_DIRTY_PAGES);
        let log = mem.fetch_dirty_log(0).unwrap();
        assert_eq!(
            mem.reconfigure(1, Gpa::new(0x100000), 0x1000, SlotFlags::empty()),
            Err(VmxError::Busy)
        );
        drop(log);
        mem.reconfigure(1, Gpa::new(0x100000), 0x1000, SlotFlags::empty())
            .unwrap();
    }

    #[test]
    fn guest_read_write_round_trip_across_pages() {
        let mem = mem_with_slot(0, 0, 0x3000, SlotFlags::LOG_DIRTY_PAGES);
        let data = [0xabu8; 64];
        assert_eq!(mem.write(Gpa::new(0xfe0), &data), 64);
        let mut out = [0u8; 64];
        assert_eq!(mem.read(Gpa::new(0xfe0), &mut out), 64);
        assert_eq!(out, data);
        // The write crossed the frame boundary; both frames are dirty.
        let log = mem.fetch_dirty_log(0).unwrap();
        assert_eq!(log.bitmap()[0] & 0b11, 0b11);
    }

    #[test]
    fn short_read_stops_at_unmapped_frame() {
        let mem = mem_with_slot(0, 0, 0x1000, SlotFlags::empty());
        let mut buf = [0u8; 32];
        assert_eq!(mem.read(Gpa::new(0xff0), &mut buf), 16);
    }
}
