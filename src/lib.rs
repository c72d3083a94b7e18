// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process virtual memory management.
//!
//! The crate maps a process's linear address space onto physical frames
//! handed out by an external allocator, resolves page faults (demand
//! paging and copy-on-write), and tracks frame sharing across address
//! space duplication. Hardware concerns stay outside: trap entry calls
//! [`handle_fault`] as a plain function, and translation-cache
//! maintenance goes through the [`TlbSink`] collaborator.

#![no_std]
#![forbid(clippy::unwrap_used)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod log;

pub mod fault;
pub mod frame;
pub mod page_table;
pub mod space;
pub mod vma;

#[cfg(test)]
mod tests_prop;

pub use fault::{
    classify, handle_fault, service_fault, AccessKind, FaultClass, FaultOutcome, FaultStats,
    FileError, FileReader, NoFiles, ProcessControl, TerminateReason,
};
pub use frame::{Frame, FrameAllocator, FrameRefCounter, HeapFrames};
pub use page_table::{NullTlb, PageTable, Pte, PteFlags, TlbSink, LINEAR_SPAN, PAGE_SHIFT, PAGE_SIZE};
pub use space::{AddressSpace, USER_BASE, USER_END};
pub use vma::{Backing, FileHandle, Protection, Vma};

/// Errors returned by the non-fatal memory-management API.
///
/// Fatal fault outcomes are not errors in this sense; they are reported as
/// [`TerminateReason`] through [`ProcessControl`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Address, length or file offset was not page aligned (or was zero).
    /// Sub-page requests are rejected, never rounded.
    Unaligned,
    /// Range extends beyond the translatable linear span.
    OutOfRange,
    /// Frame or intermediate-table allocation failed. The request fails
    /// atomically; no partial state is left behind.
    OutOfMemory,
    /// No free range large enough for a hint-free mapping.
    AddressSpaceExhausted,
    /// A checked copy touched a page with no resident translation (or a
    /// read-only translation on the write side).
    NotResident,
}
