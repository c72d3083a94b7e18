// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address spaces: one page-table hierarchy plus an ordered set of VMAs,
//! with the map/unmap/protect API and duplication for process creation.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::{max, min};

use crate::fault::FaultStats;
use crate::frame::{self, Frame, FrameAllocator, FrameRefCounter};
use crate::page_table::{check_aligned, PageTable, PteFlags, TlbSink, LINEAR_SPAN, PAGE_SHIFT, PAGE_SIZE};
use crate::vma::{Backing, Protection, Vma};
use crate::{log_debug, VmError};

/// Lowest mappable address. Page zero stays unmapped as a null guard.
pub const USER_BASE: usize = PAGE_SIZE;
/// End of the mappable range (exclusive).
pub const USER_END: usize = LINEAR_SPAN;

/// A process's view of memory.
///
/// The address space exclusively owns its page-table hierarchy and VMAs;
/// callers serialize operations on one address space (all mutators take
/// `&mut self`). The only state shared with relatives is the frame
/// reference counter, which is atomic.
pub struct AddressSpace {
    pub(crate) vmas: BTreeMap<usize, Vma>,
    pub(crate) table: PageTable,
    pub(crate) frames: Arc<dyn FrameAllocator>,
    pub(crate) refs: Arc<FrameRefCounter>,
    pub(crate) tlb: Arc<dyn TlbSink>,
    pub(crate) resident_pages: usize,
    pub(crate) total_pages: usize,
    pub(crate) stats: FaultStats,
}

fn check_len(length: usize) -> Result<(), VmError> {
    if length == 0 || length % PAGE_SIZE != 0 {
        return Err(VmError::Unaligned);
    }
    Ok(())
}

impl AddressSpace {
    /// Creates an empty address space drawing frames from `frames`.
    pub fn new(frames: Arc<dyn FrameAllocator>, tlb: Arc<dyn TlbSink>) -> Result<Self, VmError> {
        Ok(Self {
            table: PageTable::new(frames.clone(), tlb.clone())?,
            vmas: BTreeMap::new(),
            frames,
            refs: Arc::new(FrameRefCounter::new()),
            tlb,
            resident_pages: 0,
            total_pages: 0,
            stats: FaultStats::default(),
        })
    }

    /// Returns the VMA containing `addr`, if any.
    pub fn find_vma(&self, addr: usize) -> Option<&Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.end > addr)
    }

    /// Number of pages with a resident translation.
    pub fn resident_pages(&self) -> usize {
        self.resident_pages
    }

    /// Number of pages covered by VMAs.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Snapshot of the fault statistics.
    pub fn stats(&self) -> FaultStats {
        self.stats
    }

    /// Iterates over the VMAs in ascending start order.
    pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.values()
    }

    /// Looks up the resident frame backing `addr`, if any.
    pub fn translate(&self, addr: usize) -> Option<Frame> {
        self.table.translate(addr).map(|pte| pte.frame())
    }

    fn range_free(&self, base: usize, length: usize) -> bool {
        let Some(end) = base.checked_add(length) else {
            return false;
        };
        if base < USER_BASE || end > USER_END {
            return false;
        }
        self.vmas
            .range(..end)
            .next_back()
            .map_or(true, |(_, vma)| vma.end <= base)
    }

    /// First-fit scan over the gaps between existing VMAs.
    fn first_fit(&self, length: usize) -> Option<usize> {
        let mut cursor = USER_BASE;
        for vma in self.vmas.values() {
            if vma.start > cursor && vma.start - cursor >= length {
                return Some(cursor);
            }
            cursor = max(cursor, vma.end);
        }
        (USER_END - cursor >= length).then_some(cursor)
    }

    /// Creates one VMA of `length` bytes and returns its base address.
    ///
    /// A free `hint` range is honored; otherwise placement falls back to
    /// the first-fit scan. No page-table entries are populated here; all
    /// population is deferred to the first fault.
    pub fn map(
        &mut self,
        hint: Option<usize>,
        length: usize,
        prot: Protection,
        backing: Backing,
    ) -> Result<usize, VmError> {
        check_len(length)?;
        if let Some(addr) = hint {
            check_aligned(addr)?;
        }
        if let Backing::File { offset, .. } = backing {
            if offset % PAGE_SIZE as u64 != 0 {
                return Err(VmError::Unaligned);
            }
        }
        let base = match hint {
            Some(addr) if self.range_free(addr, length) => addr,
            _ => self
                .first_fit(length)
                .ok_or(VmError::AddressSpaceExhausted)?,
        };
        self.vmas.insert(
            base,
            Vma {
                start: base,
                end: base + length,
                prot,
                backing,
                cow: false,
            },
        );
        self.total_pages += length >> PAGE_SHIFT;
        Ok(base)
    }

    /// Drops the translation for one page, releasing its frame reference.
    fn release_page(&mut self, page: usize) {
        let Ok(Some(pte)) = self.table.unmap(page) else {
            return;
        };
        let frame = pte.frame();
        if self.refs.decrement(frame) {
            self.frames.free_frame(frame);
        }
        self.resident_pages -= 1;
    }

    /// Removes every mapping overlapping `[addr, addr + length)`.
    ///
    /// A VMA only partially covered is split; unmapped holes inside the
    /// range are ignored. Every resident page in the range is unmapped,
    /// invalidated and its frame reference dropped.
    pub fn unmap(&mut self, addr: usize, length: usize) -> Result<(), VmError> {
        check_aligned(addr)?;
        check_len(length)?;
        let end = addr.checked_add(length).ok_or(VmError::OutOfRange)?;
        if end > USER_END {
            return Err(VmError::OutOfRange);
        }
        let starts: Vec<usize> = self
            .vmas
            .range(..end)
            .filter(|(_, vma)| vma.end > addr)
            .map(|(start, _)| *start)
            .collect();
        for start in starts {
            let Some(vma) = self.vmas.remove(&start) else {
                continue;
            };
            let cut_start = max(vma.start, addr);
            let cut_end = min(vma.end, end);
            let mut page = cut_start;
            while page < cut_end {
                self.release_page(page);
                page += PAGE_SIZE;
            }
            self.total_pages -= (cut_end - cut_start) >> PAGE_SHIFT;
            let (left, right) = vma.carve(cut_start, cut_end);
            if let Some(left) = left {
                self.vmas.insert(left.start, left);
            }
            if let Some(right) = right {
                self.vmas.insert(right.start, right);
            }
        }
        Ok(())
    }

    /// Changes the protection of `[addr, addr + length)`.
    ///
    /// Partially covered VMAs are split at the range edges first, so the
    /// change applies exactly to the requested range. Already-present
    /// entries are rewritten in place; no fault is needed to observe the
    /// new permission. The COW marker on individual entries is preserved.
    pub fn protect(
        &mut self,
        addr: usize,
        length: usize,
        prot: Protection,
    ) -> Result<(), VmError> {
        check_aligned(addr)?;
        check_len(length)?;
        let end = addr.checked_add(length).ok_or(VmError::OutOfRange)?;
        if end > USER_END {
            return Err(VmError::OutOfRange);
        }
        let starts: Vec<usize> = self
            .vmas
            .range(..end)
            .filter(|(_, vma)| vma.end > addr)
            .map(|(start, _)| *start)
            .collect();
        for start in starts {
            let Some(vma) = self.vmas.remove(&start) else {
                continue;
            };
            let cut_start = max(vma.start, addr);
            let cut_end = min(vma.end, end);
            let (left, right) = vma.carve(cut_start, cut_end);
            if let Some(left) = left {
                self.vmas.insert(left.start, left);
            }
            if let Some(right) = right {
                self.vmas.insert(right.start, right);
            }
            if let Some(mut mid) = vma.slice(cut_start, cut_end) {
                mid.prot = prot;
                // Reinsert before touching entries so an error below can
                // never lose the range from the map.
                self.vmas.insert(mid.start, mid);
                let mut page = cut_start;
                while page < cut_end {
                    self.table
                        .protect(page, prot.contains(Protection::WRITE))?;
                    page += PAGE_SIZE;
                }
            }
        }
        Ok(())
    }

    /// Clones this address space for process creation.
    ///
    /// Every VMA is recreated in the child. Every resident page is shared
    /// with the child: writable entries are downgraded to read-only COW
    /// on both sides (and the parent's cached translations invalidated),
    /// read-only entries are copied as they are. Each shared page takes
    /// one reference-count increment for the new sharer.
    ///
    /// On allocation failure the child is discarded; dropping it releases
    /// exactly the references it took, and the parent stays consistent.
    pub fn duplicate(&mut self) -> Result<AddressSpace, VmError> {
        for vma in self.vmas.values_mut() {
            if vma.prot.contains(Protection::WRITE) {
                vma.cow = true;
            }
        }
        let mut child = AddressSpace {
            table: PageTable::new(self.frames.clone(), self.tlb.clone())?,
            vmas: self.vmas.clone(),
            frames: self.frames.clone(),
            refs: self.refs.clone(),
            tlb: self.tlb.clone(),
            resident_pages: 0,
            total_pages: self.total_pages,
            stats: FaultStats::default(),
        };
        let ranges: Vec<(usize, usize)> = self
            .vmas
            .values()
            .map(|vma| (vma.start, vma.end))
            .collect();
        for (start, end) in ranges {
            let mut page = start;
            while page < end {
                if let Some(pte) = self.table.translate(page) {
                    let frame = pte.frame();
                    let flags = if pte.writable() {
                        self.table.mark_cow(page)?;
                        (pte.flags() - PteFlags::WRITABLE) | PteFlags::COW
                    } else {
                        pte.flags()
                    };
                    child.table.map(page, frame, flags)?;
                    self.refs.increment(frame);
                    child.resident_pages += 1;
                }
                page += PAGE_SIZE;
            }
        }
        log_debug!(target: "vmm", "duplicated space, {} pages shared", child.resident_pages);
        Ok(child)
    }

    /// Copies `data` into the address space at `addr` through resident,
    /// writable translations. Never faults pages in: a missing or
    /// read-only translation yields [`VmError::NotResident`].
    pub fn copy_to(&mut self, addr: usize, data: &[u8]) -> Result<(), VmError> {
        let mut cur = addr;
        let mut src = data;
        while !src.is_empty() {
            let pte = self.table.translate(cur).ok_or(VmError::NotResident)?;
            if !pte.writable() {
                return Err(VmError::NotResident);
            }
            let offset = cur & (PAGE_SIZE - 1);
            let chunk = min(PAGE_SIZE - offset, src.len());
            // SAFETY: the frame stays allocated while its PTE holds a
            // reference; the chunk stays within the page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    frame::frame_ptr(pte.frame()).add(offset),
                    chunk,
                );
            }
            cur += chunk;
            src = &src[chunk..];
        }
        Ok(())
    }

    /// Copies bytes out of the address space at `addr` through resident
    /// translations into `data`. Never faults pages in.
    pub fn copy_from(&self, addr: usize, data: &mut [u8]) -> Result<(), VmError> {
        let mut cur = addr;
        let mut dst = &mut data[..];
        while !dst.is_empty() {
            let pte = self.table.translate(cur).ok_or(VmError::NotResident)?;
            let offset = cur & (PAGE_SIZE - 1);
            let chunk = min(PAGE_SIZE - offset, dst.len());
            // SAFETY: as in copy_to; reads only.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    frame::frame_ptr(pte.frame()).add(offset),
                    dst.as_mut_ptr(),
                    chunk,
                );
            }
            cur += chunk;
            dst = &mut dst[chunk..];
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let ranges: Vec<(usize, usize)> = self
            .vmas
            .values()
            .map(|vma| (vma.start, vma.end))
            .collect();
        for (start, end) in ranges {
            let mut page = start;
            while page < end {
                self.release_page(page);
                page += PAGE_SIZE;
            }
        }
        // The page-table drop returns the table frames themselves.
    }
}
