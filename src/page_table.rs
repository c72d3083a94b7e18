// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page table with lazy allocation of intermediate tables.

extern crate alloc;

use alloc::sync::Arc;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::frame::{self, Frame, FrameAllocator};
use crate::VmError;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;
/// Number of entries per table level.
pub const PT_ENTRIES: usize = 512;
/// Linear span covered by one directory: directory -> table -> frame.
pub const LINEAR_SPAN: usize = PT_ENTRIES * PT_ENTRIES * PAGE_SIZE;

const_assert_eq!(PT_ENTRIES * core::mem::size_of::<u64>(), PAGE_SIZE);

bitflags! {
    /// Flags stored in the low bits of a page-table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Copy-on-write marker, kept in an OS-available bit. A COW entry
        /// is never writable until the fault handler resolves it.
        const COW = 1 << 9;
    }
}

/// One page-table entry: a `u64` holding the frame number above
/// [`PAGE_SHIFT`] and [`PteFlags`] below it. Non-present entries carry no
/// frame number and are stored as zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub const EMPTY: Self = Self(0);

    /// Builds a present entry for `frame` with `flags`.
    pub fn new(frame: Frame, flags: PteFlags) -> Self {
        debug_assert!(
            !flags.contains(PteFlags::COW) || !flags.contains(PteFlags::WRITABLE),
            "a COW entry must be read-only"
        );
        Self(((frame.number() as u64) << PAGE_SHIFT) | (flags | PteFlags::PRESENT).bits())
    }

    const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub const fn writable(self) -> bool {
        self.0 & PteFlags::WRITABLE.bits() != 0
    }

    pub const fn cow(self) -> bool {
        self.0 & PteFlags::COW.bits() != 0
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns the referenced frame. Meaningless on non-present entries.
    pub const fn frame(self) -> Frame {
        Frame::from_number((self.0 >> PAGE_SHIFT) as usize)
    }

    fn with_flags(self, flags: PteFlags) -> Self {
        Self((self.0 & !((1u64 << PAGE_SHIFT) - 1)) | flags.bits())
    }
}

/// Local translation-cache invalidation, provided by the platform.
///
/// Cross-core shootdown is the embedder's responsibility; the memory
/// manager only requires the invalidate-this-core primitive.
pub trait TlbSink: Send + Sync {
    fn invalidate(&self, addr: usize);

    fn invalidate_range(&self, addr: usize, pages: usize) {
        for i in 0..pages {
            self.invalidate(addr + i * PAGE_SIZE);
        }
    }
}

/// No-op sink for environments without a translation cache.
pub struct NullTlb;

impl TlbSink for NullTlb {
    fn invalidate(&self, _addr: usize) {}
}

pub(crate) const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub(crate) fn check_aligned(addr: usize) -> Result<(), VmError> {
    if addr % PAGE_SIZE != 0 {
        return Err(VmError::Unaligned);
    }
    Ok(())
}

/// Reads entry `index` of the table stored in `table_frame`.
///
/// # Safety
///
/// `table_frame` must be a live frame holding a table of this hierarchy.
unsafe fn read_entry(table_frame: Frame, index: usize) -> u64 {
    debug_assert!(index < PT_ENTRIES);
    // SAFETY: caller guarantees the frame holds PT_ENTRIES entries.
    unsafe { (frame::frame_ptr(table_frame) as *const u64).add(index).read() }
}

/// Writes entry `index` of the table stored in `table_frame`.
///
/// # Safety
///
/// Same contract as [`read_entry`], plus exclusive access to the table.
unsafe fn write_entry(table_frame: Frame, index: usize, value: u64) {
    debug_assert!(index < PT_ENTRIES);
    // SAFETY: caller guarantees the frame holds PT_ENTRIES entries.
    unsafe { (frame::frame_ptr(table_frame) as *mut u64).add(index).write(value) }
}

/// Two-level radix translation tree.
///
/// The directory and every second-level table occupy one frame each,
/// allocated from the external allocator so that table allocation failure
/// surfaces as [`VmError::OutOfMemory`]. Leaf frames are owned by the
/// reference-counting layer, not by the table.
pub struct PageTable {
    root: Frame,
    frames: Arc<dyn FrameAllocator>,
    tlb: Arc<dyn TlbSink>,
}

impl PageTable {
    /// Allocates an empty hierarchy (one zeroed directory frame).
    pub fn new(frames: Arc<dyn FrameAllocator>, tlb: Arc<dyn TlbSink>) -> Result<Self, VmError> {
        let root = frames.alloc_frame()?;
        // SAFETY: freshly allocated by `frames`.
        unsafe { frame::zero_frame(root) };
        Ok(Self { root, frames, tlb })
    }

    /// Returns the directory frame, e.g. for loading into a hardware root
    /// register by the embedder.
    pub fn root_frame(&self) -> Frame {
        self.root
    }

    fn dir_index(addr: usize) -> usize {
        addr >> (PAGE_SHIFT + 9)
    }

    fn table_index(addr: usize) -> usize {
        (addr >> PAGE_SHIFT) & (PT_ENTRIES - 1)
    }

    fn check_range(addr: usize) -> Result<(), VmError> {
        if addr >= LINEAR_SPAN {
            return Err(VmError::OutOfRange);
        }
        Ok(())
    }

    /// Returns the table frame for `addr`, allocating and linking it on
    /// first use. The directory slot is only written once the new table
    /// frame is fully zeroed, so an allocation failure leaves the
    /// hierarchy exactly as it was.
    fn ensure_table(&mut self, addr: usize) -> Result<Frame, VmError> {
        let index = Self::dir_index(addr);
        // SAFETY: the root frame lives as long as `self`.
        let slot = Pte::from_bits(unsafe { read_entry(self.root, index) });
        if slot.present() {
            return Ok(slot.frame());
        }
        let table = self.frames.alloc_frame()?;
        // SAFETY: freshly allocated by `self.frames`.
        unsafe { frame::zero_frame(table) };
        // SAFETY: the root frame lives as long as `self`.
        unsafe { write_entry(self.root, index, Pte::new(table, PteFlags::empty()).bits()) };
        Ok(table)
    }

    fn leaf_table(&self, addr: usize) -> Option<Frame> {
        // SAFETY: the root frame lives as long as `self`.
        let slot = Pte::from_bits(unsafe { read_entry(self.root, Self::dir_index(addr)) });
        slot.present().then(|| slot.frame())
    }

    /// Installs or updates the translation for `addr`. Updating a present
    /// entry invalidates the stale cached translation.
    pub fn map(&mut self, addr: usize, frame: Frame, flags: PteFlags) -> Result<(), VmError> {
        check_aligned(addr)?;
        Self::check_range(addr)?;
        let table = self.ensure_table(addr)?;
        let index = Self::table_index(addr);
        // SAFETY: `table` was linked by this hierarchy and stays live.
        let old = Pte::from_bits(unsafe { read_entry(table, index) });
        // SAFETY: as above.
        unsafe { write_entry(table, index, Pte::new(frame, flags).bits()) };
        if old.present() {
            self.tlb.invalidate(addr);
        }
        Ok(())
    }

    /// Clears the translation for `addr` and invalidates it locally.
    /// Returns the previous entry if one was present.
    pub fn unmap(&mut self, addr: usize) -> Result<Option<Pte>, VmError> {
        check_aligned(addr)?;
        Self::check_range(addr)?;
        let Some(table) = self.leaf_table(addr) else {
            return Ok(None);
        };
        let index = Self::table_index(addr);
        // SAFETY: `table` was linked by this hierarchy and stays live.
        let old = Pte::from_bits(unsafe { read_entry(table, index) });
        if !old.present() {
            return Ok(None);
        }
        // SAFETY: as above.
        unsafe { write_entry(table, index, Pte::EMPTY.bits()) };
        self.tlb.invalidate(addr);
        Ok(Some(old))
    }

    /// Looks up the present entry covering `addr` (any offset within the
    /// page), or `None`.
    pub fn translate(&self, addr: usize) -> Option<Pte> {
        if addr >= LINEAR_SPAN {
            return None;
        }
        let addr = align_down(addr);
        let table = self.leaf_table(addr)?;
        // SAFETY: `table` was linked by this hierarchy and stays live.
        let entry = Pte::from_bits(unsafe { read_entry(table, Self::table_index(addr)) });
        entry.present().then_some(entry)
    }

    /// Rewrites the write permission of a present entry in place. The COW
    /// marker wins: a COW entry stays read-only regardless of `writable`.
    /// Returns whether an entry was present. Downgrades invalidate the
    /// cached translation.
    pub fn protect(&mut self, addr: usize, writable: bool) -> Result<bool, VmError> {
        check_aligned(addr)?;
        Self::check_range(addr)?;
        let Some(table) = self.leaf_table(addr) else {
            return Ok(false);
        };
        let index = Self::table_index(addr);
        // SAFETY: `table` was linked by this hierarchy and stays live.
        let old = Pte::from_bits(unsafe { read_entry(table, index) });
        if !old.present() {
            return Ok(false);
        }
        let mut flags = old.flags() - PteFlags::WRITABLE;
        if writable && !old.cow() {
            flags |= PteFlags::WRITABLE;
        }
        // SAFETY: as above.
        unsafe { write_entry(table, index, old.with_flags(flags).bits()) };
        if old.writable() && !flags.contains(PteFlags::WRITABLE) {
            self.tlb.invalidate(addr);
        }
        Ok(true)
    }

    /// Downgrades a present entry to read-only COW and invalidates the
    /// cached translation. Returns whether an entry was present.
    pub fn mark_cow(&mut self, addr: usize) -> Result<bool, VmError> {
        check_aligned(addr)?;
        Self::check_range(addr)?;
        let Some(table) = self.leaf_table(addr) else {
            return Ok(false);
        };
        let index = Self::table_index(addr);
        // SAFETY: `table` was linked by this hierarchy and stays live.
        let old = Pte::from_bits(unsafe { read_entry(table, index) });
        if !old.present() {
            return Ok(false);
        }
        let flags = (old.flags() - PteFlags::WRITABLE) | PteFlags::COW;
        // SAFETY: as above.
        unsafe { write_entry(table, index, old.with_flags(flags).bits()) };
        self.tlb.invalidate(addr);
        Ok(true)
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for index in 0..PT_ENTRIES {
            // SAFETY: the root frame is still live here.
            let slot = Pte::from_bits(unsafe { read_entry(self.root, index) });
            if slot.present() {
                self.frames.free_frame(slot.frame());
            }
        }
        self.frames.free_frame(self.root);
    }
}
