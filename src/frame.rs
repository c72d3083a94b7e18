// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame handling: the external allocator contract, shared
//! reference counts for COW frames, and raw frame memory helpers.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "failpoints")]
use core::sync::atomic::AtomicBool;

use spin::{Mutex, RwLock};
use static_assertions::const_assert_eq;

use crate::page_table::{PAGE_SHIFT, PAGE_SIZE};
use crate::{log_warn, VmError};

/// A physical frame number. The frame's memory lives at
/// `number << PAGE_SHIFT` for as long as the frame is allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    /// Creates a frame handle from a raw frame number.
    pub const fn from_number(number: usize) -> Self {
        Self(number)
    }

    /// Returns the raw frame number.
    pub const fn number(self) -> usize {
        self.0
    }

    /// Returns the base address of the frame's memory.
    pub const fn base(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

/// Source of physical frames, provided by the embedding environment.
///
/// # Safety
///
/// Implementations must hand out frames whose memory is `PAGE_SIZE`
/// bytes, `PAGE_SIZE`-aligned, addressable at [`Frame::base`], and valid
/// for reads and writes until `free_frame` is called for that frame. A
/// frame must not be handed out twice without an intervening free.
/// Frame contents are unspecified at allocation; callers zero or
/// overwrite them before exposing the memory.
pub unsafe trait FrameAllocator: Send + Sync {
    /// Allocates one frame, or reports [`VmError::OutOfMemory`].
    fn alloc_frame(&self) -> Result<Frame, VmError>;

    /// Returns a frame to the allocator.
    fn free_frame(&self, frame: Frame);
}

/// Returns a raw pointer to the frame's backing memory.
pub(crate) fn frame_ptr(frame: Frame) -> *mut u8 {
    frame.base() as *mut u8
}

/// Fills a frame with zeroes.
///
/// # Safety
///
/// `frame` must be currently allocated by the [`FrameAllocator`] backing
/// this address space family.
pub(crate) unsafe fn zero_frame(frame: Frame) {
    // SAFETY: the allocator contract guarantees PAGE_SIZE valid bytes.
    unsafe { core::ptr::write_bytes(frame_ptr(frame), 0, PAGE_SIZE) };
}

/// Copies the full contents of `src` into `dst`.
///
/// # Safety
///
/// Both frames must be currently allocated and distinct.
pub(crate) unsafe fn copy_frame(src: Frame, dst: Frame) {
    debug_assert_ne!(src, dst);
    // SAFETY: distinct allocated frames cannot overlap.
    unsafe { core::ptr::copy_nonoverlapping(frame_ptr(src), frame_ptr(dst), PAGE_SIZE) };
}

/// Shared reference counts for mapped frames.
///
/// Every frame installed as a leaf translation is tracked here; the count
/// is the number of page-table entries referencing the frame across all
/// address spaces of one family. Counts on existing entries are adjusted
/// with atomics under a read lock, so sibling COW faults on the same
/// frame never serialize against each other; only insertion and removal
/// take the write lock.
pub struct FrameRefCounter {
    counts: RwLock<BTreeMap<Frame, AtomicUsize>>,
}

impl FrameRefCounter {
    pub const fn new() -> Self {
        Self {
            counts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Starts tracking a freshly mapped frame with a count of one.
    pub fn track(&self, frame: Frame) {
        let prev = self.counts.write().insert(frame, AtomicUsize::new(1));
        debug_assert!(prev.is_none(), "frame {:#x} tracked twice", frame.base());
    }

    /// Records one more sharer of `frame`.
    pub fn increment(&self, frame: Frame) {
        let counts = self.counts.read();
        match counts.get(&frame) {
            Some(count) => {
                count.fetch_add(1, Ordering::SeqCst);
            }
            None => log_warn!(target: "vmm", "increment of untracked frame {:#x}", frame.base()),
        }
    }

    /// Drops one sharer of `frame`. Returns `true` when the count reached
    /// zero and the caller must return the frame to the allocator.
    pub fn decrement(&self, frame: Frame) -> bool {
        let counts = self.counts.read();
        let Some(count) = counts.get(&frame) else {
            log_warn!(target: "vmm", "decrement of untracked frame {:#x}", frame.base());
            return false;
        };
        if count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return false;
        }
        drop(counts);
        self.counts.write().remove(&frame);
        true
    }

    /// Returns the current count, zero if untracked.
    pub fn count(&self, frame: Frame) -> usize {
        self.counts
            .read()
            .get(&frame)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl Default for FrameRefCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(align(4096))]
struct FramePayload([u8; PAGE_SIZE]);

const_assert_eq!(core::mem::size_of::<FramePayload>(), PAGE_SIZE);
const_assert_eq!(core::mem::align_of::<FramePayload>(), PAGE_SIZE);

/// Fill pattern for freshly allocated [`HeapFrames`] frames. Deliberately
/// non-zero so a missing zero-fill shows up in tests.
const POISON: u8 = 0xa5;

/// Heap-backed [`FrameAllocator`] for hosted use and tests.
///
/// Frames are individual page-aligned heap allocations; the frame number
/// is the allocation address shifted by [`PAGE_SHIFT`], which makes frame
/// memory directly addressable at [`Frame::base`].
pub struct HeapFrames {
    live: Mutex<BTreeSet<Frame>>,
    capacity: usize,
    #[cfg(feature = "failpoints")]
    deny_next: AtomicBool,
}

impl HeapFrames {
    /// Creates an allocator without a frame limit.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Creates an allocator that refuses to exceed `capacity` live frames.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            live: Mutex::new(BTreeSet::new()),
            capacity,
            #[cfg(feature = "failpoints")]
            deny_next: AtomicBool::new(false),
        }
    }

    /// Returns the number of currently allocated frames.
    pub fn allocated(&self) -> usize {
        self.live.lock().len()
    }

    /// Forces the next `alloc_frame` call to report out-of-memory.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_alloc(&self) {
        self.deny_next.store(true, Ordering::SeqCst);
    }
}

impl Default for HeapFrames {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: frames are leaked Box<FramePayload> allocations, PAGE_SIZE
// sized and aligned, valid until free_frame reconstructs the Box.
unsafe impl FrameAllocator for HeapFrames {
    fn alloc_frame(&self) -> Result<Frame, VmError> {
        #[cfg(feature = "failpoints")]
        if self.deny_next.swap(false, Ordering::SeqCst) {
            return Err(VmError::OutOfMemory);
        }
        let mut live = self.live.lock();
        if live.len() >= self.capacity {
            return Err(VmError::OutOfMemory);
        }
        let payload = Box::new(FramePayload([POISON; PAGE_SIZE]));
        let addr = Box::into_raw(payload) as usize;
        debug_assert_eq!(addr & (PAGE_SIZE - 1), 0);
        let frame = Frame(addr >> PAGE_SHIFT);
        live.insert(frame);
        Ok(frame)
    }

    fn free_frame(&self, frame: Frame) {
        if !self.live.lock().remove(&frame) {
            log_warn!(target: "vmm", "free of unallocated frame {:#x}", frame.base());
            return;
        }
        // SAFETY: the frame was produced by alloc_frame above and was
        // still recorded live, so the pointer is a unique Box allocation.
        unsafe { drop(Box::from_raw(frame.base() as *mut FramePayload)) };
    }
}

impl Drop for HeapFrames {
    fn drop(&mut self) {
        let live = core::mem::take(&mut *self.live.lock());
        for frame in live {
            // SAFETY: same provenance as in free_frame.
            unsafe { drop(Box::from_raw(frame.base() as *mut FramePayload)) };
        }
    }
}
