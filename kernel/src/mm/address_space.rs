//! Address space (C3): a task's region set and page table hierarchy.
//!
//! Regions are kept in an address-ordered `Vec` and are never allowed to
//! overlap (§4.3). Page faults are resolved by finding the containing
//! region and asking its [`Backing`] for a frame; the page table is only
//! ever touched while the address space's own lock is held.

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::{boxed::Box, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU16, AtomicU32, Ordering},
};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::{
    backing::Backing,
    frame_allocator::{self, FrameNumber},
    page_table::PageTableHierarchy,
    PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE,
};

static NEXT_ASID: AtomicU16 = AtomicU16::new(1);

#[cfg(feature = "alloc")]
static FREE_ASIDS: Mutex<Vec<Asid>> = Mutex::new(Vec::new());

/// Address-space identifier, tagging TLB entries so that switching
/// address spaces need not flush the whole TLB on backends that support
/// tagged entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asid(pub u16);

/// The kernel address space's ASID. Reserved at ID 0 and never handed out
/// by [`asid_get`] (invariant 6, §8).
pub const KERNEL_ASID: Asid = Asid(0);

/// Allocate an ASID, recycling one freed by [`asid_put`] when available.
#[cfg(feature = "alloc")]
pub fn asid_get() -> Asid {
    if let Some(reused) = FREE_ASIDS.lock().pop() {
        return reused;
    }
    let raw = NEXT_ASID.fetch_add(1, Ordering::Relaxed);
    debug_assert_ne!(raw, KERNEL_ASID.0, "ASID space wrapped into the reserved kernel ASID");
    Asid(raw)
}

/// Release `asid` back to the free pool. Flushes every TLB entry tagged
/// with it first, so a reused ASID never observes a stale translation
/// (the `asid_get(); asid_put(a); asid_get()` round-trip law, §8).
#[cfg(feature = "alloc")]
pub fn asid_put(asid: Asid) {
    debug_assert_ne!(asid, KERNEL_ASID, "kernel ASID must never be released to the user pool");
    super::mmu::tlb_invalidate_asid(asid);
    FREE_ASIDS.lock().push(asid);
}

/// A single mapped region, ordered by `start` within its owning address
/// space's region set.
#[derive(Clone)]
pub struct Region {
    pub start: VirtualAddress,
    pub len: usize,
    pub flags: PageFlags,
    pub backing: Backing,
}

impl Region {
    pub fn end(&self) -> VirtualAddress {
        self.start.add(self.len)
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.start.as_u64() < other.end().as_u64() && other.start.as_u64() < self.end().as_u64()
    }
}

struct Inner {
    #[cfg(feature = "alloc")]
    regions: Vec<Region>,
    page_table: PageTableHierarchy,
}

/// A task's address space (§4.3).
pub struct AddressSpace {
    pub asid: Asid,
    inner: Mutex<Inner>,
    refcount: AtomicU32,
}

// SAFETY: all mutable state lives behind `inner`'s spinlock; the refcount
// and asid are managed through atomics.
unsafe impl Send for AddressSpace {}
// SAFETY: see above.
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    #[cfg(feature = "alloc")]
    pub fn new() -> KernelResult<AddressSpacePtr> {
        let page_table = PageTableHierarchy::new()?;
        let boxed = Box::new(Self {
            asid: asid_get(),
            inner: Mutex::new(Inner {
                regions: Vec::new(),
                page_table,
            }),
            refcount: AtomicU32::new(1),
        });
        Ok(AddressSpacePtr(NonNull::from(Box::leak(boxed))))
    }

    /// Insert `region`, rejecting it if it overlaps an existing one
    /// (invariant, §4.3).
    #[cfg(feature = "alloc")]
    pub fn map_region(&self, region: Region) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if inner.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(KernelError::LegacyError {
                message: "region overlaps an existing mapping",
            });
        }
        let pos = inner
            .regions
            .partition_point(|r| r.start.as_u64() < region.start.as_u64());
        inner.regions.insert(pos, region);
        Ok(())
    }

    /// Resolve a fault at `addr` against this address space's region set
    /// (§4.3): find the containing region, check permissions, obtain a
    /// frame from the region's backing, and install the mapping.
    #[cfg(feature = "alloc")]
    pub fn resolve_fault(&self, addr: VirtualAddress, is_write: bool) -> KernelResult<()> {
        let region = {
            let inner = self.inner.lock();
            inner.regions.iter().find(|r| r.contains(addr)).cloned()
        }
        .ok_or(KernelError::NotFound {
            what: "address-space region",
        })?;

        if is_write && !region.flags.contains(PageFlags::WRITABLE) {
            return Err(KernelError::Permission {
                operation: "write to read-only region",
            });
        }

        let page = addr.align_down(PAGE_SIZE as u64);
        let offset_in_region = page.as_u64() - region.start.as_u64();
        let frame = match &region.backing {
            Backing::Anonymous => frame_allocator::alloc_frame()?,
            Backing::ElfImage {
                image_base,
                file_offset,
            } => FrameNumber::new((image_base.as_u64() + *file_offset as u64 + offset_in_region) >> 12),
            Backing::PhysMap { phys_base } => {
                FrameNumber::new((phys_base.as_u64() + offset_in_region) >> 12)
            }
        };

        let mut inner = self.inner.lock();
        inner.page_table.map(page, frame, region.flags)
    }

    /// Map a single frame directly, bypassing the region set. Used only by
    /// the legacy I/O window fault path (§4.3), which grants access via a
    /// task's I/O bitmap rather than through a normal region.
    #[cfg(feature = "alloc")]
    fn map_identity(&self, page: VirtualAddress, frame: FrameNumber) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        inner
            .page_table
            .map(page, frame, PageFlags::PRESENT | PageFlags::WRITABLE)
    }

    pub fn root(&self) -> PhysicalAddress {
        self.inner.lock().page_table.root()
    }

    pub fn hold(ptr: NonNull<AddressSpace>) -> AddressSpacePtr {
        // SAFETY: caller guarantees `ptr` is a live address space.
        unsafe { ptr.as_ref() }.refcount.fetch_add(1, Ordering::Relaxed);
        AddressSpacePtr(ptr)
    }

    /// Drop a reference; frees the address space once the count reaches
    /// zero.
    ///
    /// # Safety
    /// `ptr` must have been produced by `Box::into_raw` (directly or via
    /// `hold`).
    #[cfg(feature = "alloc")]
    pub unsafe fn release(ptr: AddressSpacePtr) {
        // SAFETY: caller guarantees `ptr` is a live, refcounted address
        // space.
        let prev = unsafe { ptr.0.as_ref() }
            .refcount
            .fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            // SAFETY: last reference; reconstruct the `Box` leaked at
            // creation.
            let boxed = unsafe { Box::from_raw(ptr.0.as_ptr()) };
            asid_put(boxed.asid);
            drop(boxed);
        }
    }

    /// `pt_find`: look up the PTE mapping `va` without allocating any
    /// missing intermediate table (§4.2).
    pub fn pt_find(&self, va: VirtualAddress) -> Option<super::page_table::PageTableEntry> {
        self.inner.lock().page_table.find(va)
    }

    /// `pt_update`: overwrite the PTE mapping `va` in place (§4.2).
    pub fn pt_update(&self, va: VirtualAddress, entry: super::page_table::PageTableEntry) -> KernelResult<()> {
        self.inner.lock().page_table.update(va, entry)
    }

    /// `as_area_create`: insert a new region, rejecting overlap. Identical
    /// to [`AddressSpace::map_region`], exposed under the name used by the
    /// address-space area operations (§4.3).
    #[cfg(feature = "alloc")]
    pub fn as_area_create(&self, region: Region) -> KernelResult<()> {
        self.map_region(region)
    }

    /// `as_area_resize`: grow or shrink the region starting at `start` to
    /// `new_len`, rejecting a resize that would overlap the next region
    /// (§4.3). The region's backing and flags are unchanged.
    #[cfg(feature = "alloc")]
    pub fn as_area_resize(&self, start: VirtualAddress, new_len: usize) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .regions
            .iter()
            .position(|r| r.start == start)
            .ok_or(KernelError::NotFound {
                what: "address-space region",
            })?;

        let candidate = Region {
            start,
            len: new_len,
            flags: inner.regions[pos].flags,
            backing: inner.regions[pos].backing.clone(),
        };
        if inner
            .regions
            .iter()
            .enumerate()
            .any(|(i, r)| i != pos && r.overlaps(&candidate))
        {
            return Err(KernelError::LegacyError {
                message: "resize would overlap an existing mapping",
            });
        }

        inner.regions[pos].len = new_len;
        Ok(())
    }

    /// `as_area_destroy`: remove the region starting at `start`, unmapping
    /// every page table entry it owns (§4.3).
    #[cfg(feature = "alloc")]
    pub fn as_area_destroy(&self, start: VirtualAddress) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .regions
            .iter()
            .position(|r| r.start == start)
            .ok_or(KernelError::NotFound {
                what: "address-space region",
            })?;
        let region = inner.regions.remove(pos);

        let mut page = region.start;
        while page.as_u64() < region.end().as_u64() {
            let _ = inner.page_table.unmap(page);
            page = page.add(PAGE_SIZE);
        }
        Ok(())
    }
}

/// A `NonNull<AddressSpace>` wrapper that is `Send + Sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpacePtr(NonNull<AddressSpace>);

impl AddressSpacePtr {
    pub fn new(ptr: NonNull<AddressSpace>) -> Self {
        Self(ptr)
    }

    /// # Safety
    /// The pointee must be valid and not concurrently mutably aliased.
    pub unsafe fn as_ref(&self) -> &AddressSpace {
        // SAFETY: forwarded to caller.
        unsafe { self.0.as_ref() }
    }

    pub fn as_non_null(&self) -> NonNull<AddressSpace> {
        self.0
    }
}

// SAFETY: see the module-level note on `AddressSpace`.
unsafe impl Send for AddressSpacePtr {}
// SAFETY: see above.
unsafe impl Sync for AddressSpacePtr {}

impl From<NonNull<AddressSpace>> for AddressSpacePtr {
    fn from(ptr: NonNull<AddressSpace>) -> Self {
        Self::new(ptr)
    }
}

/// Install `asp` as the active address space on the calling CPU (§4.5).
/// Called by the scheduler on every task switch, including into the same
/// task it is already running (a cheap no-op on backends without tagged
/// TLB entries).
pub fn install(asp: AddressSpacePtr) {
    // SAFETY: the caller (the scheduler) holds a reference to `asp` via
    // the task being switched to for the duration of this call.
    unsafe { asp.as_ref() }.inner.lock().page_table.activate();
}

/// Map a single identity frame directly into `asp`, bypassing the region
/// set. See [`AddressSpace::map_identity`].
#[cfg(feature = "alloc")]
pub fn install_identity(asp: AddressSpacePtr, page: VirtualAddress, frame: FrameNumber) -> KernelResult<()> {
    // SAFETY: `asp` belongs to the currently installed task.
    unsafe { asp.as_ref() }.map_identity(page, frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_overlap_detection() {
        let a = Region {
            start: VirtualAddress::new(0x1000),
            len: 0x1000,
            flags: PageFlags::PRESENT,
            backing: Backing::Anonymous,
        };
        let b = Region {
            start: VirtualAddress::new(0x1800),
            len: 0x1000,
            flags: PageFlags::PRESENT,
            backing: Backing::Anonymous,
        };
        assert!(a.overlaps(&b));
    }

    #[test]
    fn region_contains_boundary() {
        let r = Region {
            start: VirtualAddress::new(0x1000),
            len: 0x1000,
            flags: PageFlags::PRESENT,
            backing: Backing::Anonymous,
        };
        assert!(r.contains(VirtualAddress::new(0x1000)));
        assert!(!r.contains(VirtualAddress::new(0x2000)));
    }

    #[test]
    fn asid_allocation_is_unique() {
        let a = asid_get();
        let b = asid_get();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn released_asid_is_only_reused_after_a_flush() {
        let a = asid_get();
        asid_put(a);
        let b = asid_get();
        assert_eq!(a, b);
    }

    #[test]
    fn kernel_asid_is_never_handed_out() {
        for _ in 0..8 {
            assert_ne!(asid_get(), KERNEL_ASID);
        }
    }
}
