// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault dispatch: classification of a faulting access against the
//! VMA list and page table, and the handlers that resolve it.

use crate::frame;
use crate::page_table::{align_down, PteFlags, PAGE_SIZE};
use crate::space::AddressSpace;
use crate::vma::{Backing, FileHandle, Protection};
use crate::{log_debug, log_warn, VmError};

/// The kind of access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// What a fault turned out to be. Protection is judged before residency,
/// so a write into a range narrowed by a protection change is a violation
/// even when the page is resident.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    /// No VMA covers the address.
    Unmapped,
    /// The covering VMA's protection forbids the access.
    AccessViolation,
    /// Write to a resident copy-on-write page.
    CowBreak,
    /// First touch of an anonymous page.
    DemandZero,
    /// First touch of a file-backed page.
    DemandFile,
    /// Resident and permitted; the entry's permission bits are simply
    /// behind the VMA and get rewritten.
    Spurious,
}

/// Why a faulting process has to die.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateReason {
    /// Unmapped address or forbidden access.
    Segfault,
    /// The file backing a mapping could not be read.
    BusError,
    /// No frame was available to resolve the fault.
    OutOfMemory,
}

/// Result of servicing one fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The translation is in place; the faulting access is retried.
    Resolved,
    /// The fault cannot be resolved; the process must be terminated.
    Fatal(TerminateReason),
}

/// Per-address-space fault counters.
///
/// The categories are disjoint per fault except `fatal`, which counts
/// every termination (protection faults, bus errors, out-of-memory).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub total: usize,
    pub demand_zero: usize,
    pub demand_file: usize,
    pub cow_breaks: usize,
    /// Unmapped addresses and accesses the VMA protection forbids.
    pub protection: usize,
    pub spurious: usize,
    pub fatal: usize,
}

impl FaultStats {
    /// Demand faults of both backings, as one number.
    pub fn demand_faults(&self) -> usize {
        self.demand_zero + self.demand_file
    }
}

/// Errors surfaced by the file layer when populating a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileError {
    /// The handle does not refer to an open file.
    BadHandle,
    /// The read failed below the memory manager.
    Io,
}

/// Source of file contents for file-backed mappings, provided by the
/// embedding environment.
pub trait FileReader: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset` into `buf` and returns
    /// the number of bytes read. Reading at or past end-of-file returns
    /// `Ok(0)`.
    fn read_at(&self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, FileError>;
}

/// File layer for environments without files: every read fails. Mapping
/// files against this reader turns the first touch into a bus error.
pub struct NoFiles;

impl FileReader for NoFiles {
    fn read_at(&self, _: FileHandle, _: u64, _: &mut [u8]) -> Result<usize, FileError> {
        Err(FileError::BadHandle)
    }
}

/// Process side effects the fault path needs, provided by the embedder.
pub trait ProcessControl {
    /// Terminates the faulting process.
    fn terminate(&self, reason: TerminateReason);
}

/// Classifies an access at `addr` without changing any state.
pub fn classify(space: &AddressSpace, addr: usize, access: AccessKind) -> FaultClass {
    let Some(vma) = space.find_vma(addr) else {
        return FaultClass::Unmapped;
    };
    if !vma.prot.allows(access) {
        return FaultClass::AccessViolation;
    }
    match space.table.translate(addr) {
        Some(pte) => {
            // A COW break needs both the entry's COW bit and the VMA's
            // shared-COW marker; duplication sets them together.
            if access == AccessKind::Write && pte.cow() && vma.cow {
                FaultClass::CowBreak
            } else {
                FaultClass::Spurious
            }
        }
        None => match vma.backing {
            Backing::Anonymous => FaultClass::DemandZero,
            Backing::File { .. } => FaultClass::DemandFile,
        },
    }
}

fn leaf_flags(prot: Protection) -> PteFlags {
    let mut flags = PteFlags::USER;
    if prot.contains(Protection::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    flags
}

fn fatal(space: &mut AddressSpace, addr: usize, err: VmError) -> FaultOutcome {
    space.stats.fatal += 1;
    let reason = match err {
        VmError::OutOfMemory | VmError::AddressSpaceExhausted => TerminateReason::OutOfMemory,
        _ => TerminateReason::Segfault,
    };
    log_warn!(target: "fault", "fault at {:#x} unresolvable: {:?}", addr, err);
    FaultOutcome::Fatal(reason)
}

/// Breaks copy-on-write sharing for the resident page at `page`.
///
/// A sole owner keeps its frame and gets write permission back; a shared
/// frame is copied into a fresh one, the entry is repointed, and the old
/// frame loses one reference (freed if this was the last).
fn resolve_cow(space: &mut AddressSpace, page: usize) -> Result<(), VmError> {
    let pte = space.table.translate(page).ok_or(VmError::NotResident)?;
    let old = pte.frame();
    let flags = (pte.flags() - PteFlags::COW) | PteFlags::WRITABLE;
    if space.refs.count(old) == 1 {
        log_debug!(target: "fault", "cow {:#x}: sole owner, restoring write", page);
        return space.table.map(page, old, flags);
    }
    let fresh = space.frames.alloc_frame()?;
    // SAFETY: `old` is referenced by a present entry and `fresh` was just
    // allocated, so both are live and distinct.
    unsafe { frame::copy_frame(old, fresh) };
    space.refs.track(fresh);
    if let Err(err) = space.table.map(page, fresh, flags) {
        if space.refs.decrement(fresh) {
            space.frames.free_frame(fresh);
        }
        return Err(err);
    }
    if space.refs.decrement(old) {
        space.frames.free_frame(old);
    }
    Ok(())
}

/// Populates `page` with a zeroed frame.
fn demand_zero(space: &mut AddressSpace, page: usize, prot: Protection) -> Result<(), VmError> {
    let frame = space.frames.alloc_frame()?;
    // SAFETY: just allocated by the space's allocator.
    unsafe { frame::zero_frame(frame) };
    if let Err(err) = space.table.map(page, frame, leaf_flags(prot)) {
        space.frames.free_frame(frame);
        return Err(err);
    }
    space.refs.track(frame);
    space.resident_pages += 1;
    Ok(())
}

/// Populates `page` from its backing file. A short read leaves the tail
/// of the page zeroed; a failed read frees the frame and reports the
/// error to the caller.
fn demand_file(
    space: &mut AddressSpace,
    page: usize,
    prot: Protection,
    handle: FileHandle,
    offset: u64,
    files: &dyn FileReader,
) -> Result<(), FaultError> {
    let frame = space.frames.alloc_frame().map_err(FaultError::Vm)?;
    // SAFETY: just allocated, PAGE_SIZE valid bytes, exclusively ours
    // until mapped.
    let buf = unsafe { core::slice::from_raw_parts_mut(frame::frame_ptr(frame), PAGE_SIZE) };
    match files.read_at(handle, offset, buf) {
        Ok(read) => {
            debug_assert!(read <= PAGE_SIZE);
            buf[read..].fill(0);
        }
        Err(err) => {
            space.frames.free_frame(frame);
            return Err(FaultError::File(err));
        }
    }
    if let Err(err) = space.table.map(page, frame, leaf_flags(prot)) {
        space.frames.free_frame(frame);
        return Err(FaultError::Vm(err));
    }
    space.refs.track(frame);
    space.resident_pages += 1;
    Ok(())
}

enum FaultError {
    Vm(VmError),
    File(FileError),
}

/// Resolves one fault against `space`, updating the statistics. The
/// caller retries the access on [`FaultOutcome::Resolved`] and tears the
/// process down on [`FaultOutcome::Fatal`].
pub fn handle_fault(
    space: &mut AddressSpace,
    addr: usize,
    access: AccessKind,
    files: &dyn FileReader,
) -> FaultOutcome {
    space.stats.total += 1;
    let class = classify(space, addr, access);
    let page = align_down(addr);
    match class {
        FaultClass::Unmapped | FaultClass::AccessViolation => {
            space.stats.protection += 1;
            space.stats.fatal += 1;
            log_debug!(target: "fault", "{:?} at {:#x}: {:?}", access, addr, class);
            FaultOutcome::Fatal(TerminateReason::Segfault)
        }
        FaultClass::Spurious => {
            // The entry lags the VMA's protection; rewrite it in place.
            let writable = space
                .find_vma(page)
                .map_or(false, |vma| vma.prot.contains(Protection::WRITE));
            match space.table.protect(page, writable) {
                Ok(_) => {
                    space.stats.spurious += 1;
                    FaultOutcome::Resolved
                }
                Err(err) => fatal(space, addr, err),
            }
        }
        FaultClass::CowBreak => match resolve_cow(space, page) {
            Ok(()) => {
                space.stats.cow_breaks += 1;
                FaultOutcome::Resolved
            }
            Err(err) => fatal(space, addr, err),
        },
        FaultClass::DemandZero => {
            let Some(prot) = space.find_vma(page).map(|vma| vma.prot) else {
                return fatal(space, addr, VmError::NotResident);
            };
            match demand_zero(space, page, prot) {
                Ok(()) => {
                    space.stats.demand_zero += 1;
                    FaultOutcome::Resolved
                }
                Err(err) => fatal(space, addr, err),
            }
        }
        FaultClass::DemandFile => {
            let Some((prot, handle, offset)) = space.find_vma(page).and_then(|vma| {
                let Backing::File { handle, offset } = vma.backing else {
                    return None;
                };
                Some((vma.prot, handle, offset + (page - vma.start) as u64))
            }) else {
                return fatal(space, addr, VmError::NotResident);
            };
            match demand_file(space, page, prot, handle, offset, files) {
                Ok(()) => {
                    space.stats.demand_file += 1;
                    FaultOutcome::Resolved
                }
                Err(FaultError::Vm(err)) => fatal(space, addr, err),
                Err(FaultError::File(err)) => {
                    space.stats.fatal += 1;
                    log_warn!(target: "fault", "file read for {:#x} failed: {:?}", page, err);
                    FaultOutcome::Fatal(TerminateReason::BusError)
                }
            }
        }
    }
}

/// [`handle_fault`] plus the fatal side effect: a fatal outcome also
/// terminates the process through `control`.
pub fn service_fault(
    space: &mut AddressSpace,
    addr: usize,
    access: AccessKind,
    files: &dyn FileReader,
    control: &dyn ProcessControl,
) -> FaultOutcome {
    let outcome = handle_fault(space, addr, access, files);
    if let FaultOutcome::Fatal(reason) = outcome {
        control.terminate(reason);
    }
    outcome
}
