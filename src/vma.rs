// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory areas: the per-range descriptors an address space is
//! made of.

use bitflags::bitflags;

use crate::fault::AccessKind;
use crate::page_table::{PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    /// Protection of a mapped range.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl Protection {
    /// Whether the protection permits `access`.
    pub fn allows(self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.contains(Self::READ),
            AccessKind::Write => self.contains(Self::WRITE),
            AccessKind::Execute => self.contains(Self::EXEC),
        }
    }
}

/// Opaque handle of an open file, owned by the file layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(pub u64);

/// What provides the contents of a range on first touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Demand-zero memory.
    Anonymous,
    /// One page read from `handle` at `offset + (page - vma.start)`.
    File { handle: FileHandle, offset: u64 },
}

/// One mapped range of an address space. `end` is exclusive; both bounds
/// are page aligned. Ranges within one address space never overlap.
#[derive(Clone, Debug)]
pub struct Vma {
    pub start: usize,
    pub end: usize,
    pub prot: Protection,
    pub backing: Backing,
    /// Set on both sides of a duplication for writable private ranges:
    /// resident pages of this range may be COW-shared with a relative.
    /// Fault classification only treats a write to a COW entry as a COW
    /// break when the covering range carries this marker.
    pub cow: bool,
}

impl Vma {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn pages(&self) -> usize {
        self.len() >> PAGE_SHIFT
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Returns the sub-range `[start, end)` of this area as its own VMA,
    /// with the file offset advanced accordingly, or `None` if empty.
    pub fn slice(&self, start: usize, end: usize) -> Option<Vma> {
        debug_assert!(start >= self.start && end <= self.end);
        if start >= end {
            return None;
        }
        let backing = match self.backing {
            Backing::Anonymous => Backing::Anonymous,
            Backing::File { handle, offset } => Backing::File {
                handle,
                offset: offset + (start - self.start) as u64,
            },
        };
        Some(Vma {
            start,
            end,
            prot: self.prot,
            backing,
            cow: self.cow,
        })
    }

    /// Removes `[cut_start, cut_end)` from this area, returning the left
    /// and right remainders (either may be absent).
    pub fn carve(&self, cut_start: usize, cut_end: usize) -> (Option<Vma>, Option<Vma>) {
        (self.slice(self.start, cut_start), self.slice(cut_end, self.end))
    }

    /// Iterates over the page base addresses of the range.
    pub fn page_addrs(&self) -> impl Iterator<Item = usize> {
        (self.start..self.end).step_by(PAGE_SIZE)
    }
}
