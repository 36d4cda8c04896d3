/*
 * Copyright 2024 vmcore contributors
 *
 * This file is part of vmcore.
 *
 * vmcore is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * vmcore is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * vmcore. If not, see <https://www.gnu.org/licenses/>.
 */

//! Page-table entry: the reference-counted owning handle for one frame.
//!
//! A [`Pte`] is cheap to clone — cloning is exactly how a page-table slot
//! records an additional sharer, and `ref_count` is nothing more than
//! [`alloc::sync::Arc::strong_count`]. Dropping the last clone runs
//! [`PteInner`]'s destructor, which zero-fills and frees the frame; this
//! makes the "if ref_count > 1, decrement; else destroy" rule automatic
//! instead of something every call site has to get right by hand.

use alloc::sync::Arc;
use spin::Mutex;

use crate::collab::{FrameAllocator, PhysFrame};
use crate::error::{VmError, VmResult};

bitflags::bitflags! {
    /// Hardware-meaningful control bits, kept separate from the frame number
    /// until they are marshaled into one word at the TLB boundary.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        /// Entry is installed and may be loaded into the TLB.
        const VALID    = 0b0000_0001;
        /// Writes through this entry are permitted.
        const WRITABLE = 0b0000_0010;
        /// Set by software once a write has gone through (mirrors `TLBLO_DIRTY`).
        const DIRTY    = 0b0000_0100;
    }
}

struct PteInner {
    frame: PhysFrame,
    flags: PteFlags,
    shared: bool,
    alloc: Arc<dyn FrameAllocator + Send + Sync>,
}

impl Drop for PteInner {
    fn drop(&mut self) {
        self.alloc.zero(self.frame);
        self.alloc.free(self.frame);
    }
}

/// An owning, reference-counted handle to one mapped physical frame.
///
/// Clone to record another sharer (`inc_ref`); drop to release one
/// (`dec_ref`). [`Pte::ref_count`] reports the live sharer count.
pub struct Pte(Arc<Mutex<PteInner>>);

impl Clone for Pte {
    fn clone(&self) -> Self {
        Pte(self.0.clone())
    }
}

impl Pte {
    /// Allocates one zeroed frame and wraps it in a fresh PTE with
    /// `ref_count == 1`.
    pub fn new(
        alloc: Arc<dyn FrameAllocator + Send + Sync>,
        shared: bool,
        writable: bool,
    ) -> VmResult<Self> {
        let frame = alloc.alloc_zeroed().ok_or(VmError::OutOfMemory)?;
        let mut flags = PteFlags::VALID;
        if writable {
            flags.insert(PteFlags::WRITABLE);
        }
        Ok(Pte(Arc::new(Mutex::new(PteInner {
            frame,
            flags,
            shared,
            alloc,
        }))))
    }

    /// Number of page-table slots (across all address spaces) that share
    /// this handle. Backed by [`Arc::strong_count`].
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether `self` and `other` are clones of the same underlying handle,
    /// as opposed to two distinct PTEs that merely hold equal frames.
    #[must_use]
    pub fn is_same_handle(&self, other: &Pte) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this entry is eligible for COW sharing across fork.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.0.lock().shared
    }

    /// The physical frame this entry owns.
    #[must_use]
    pub fn frame(&self) -> PhysFrame {
        self.0.lock().frame
    }

    /// Current hardware control bits.
    #[must_use]
    pub fn flags(&self) -> PteFlags {
        self.0.lock().flags
    }

    /// Whether the writable bit is currently set.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    /// Whether a write has gone through this entry since it was last synced.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PteFlags::DIRTY)
    }

    /// Marks the page dirty, recording that its frame diverges from whatever
    /// backs it (a file, for `FILE` regions) and needs writeback before reuse.
    pub fn mark_dirty(&self) {
        self.0.lock().flags.insert(PteFlags::DIRTY);
    }

    /// Clears the dirty bit, for use once a writeback has completed.
    pub fn clear_dirty(&self) {
        self.0.lock().flags.remove(PteFlags::DIRTY);
    }

    /// Records an additional sharer: clears the writable bit (the page
    /// becomes read-only in every sharer from this point on) and returns a
    /// clone of the handle to install in the new slot.
    ///
    /// Precondition: `ref_count >= 1` (always true for a live handle).
    #[must_use]
    pub fn inc_ref(&self) -> Pte {
        self.0.lock().flags.remove(PteFlags::WRITABLE);
        self.clone()
    }

    /// Releases one sharer's reference.
    ///
    /// If this was not the last live handle, this is exactly a decrement
    /// (`Arc`'s own drop glue). If it *was* the last handle, dropping it runs
    /// [`PteInner`]'s destructor: zero-fill, free the frame. There is no
    /// separate "destroy" entry point — unlike the source kernel, Rust's
    /// ownership model makes "decrement, or destroy on last" a single
    /// operation that cannot accidentally do both.
    pub fn dec_ref(self) {
        drop(self);
    }

    /// Deep-copies this entry: allocates a new frame, copies page contents
    /// and control bits, and returns the new handle with `ref_count == 1`.
    pub fn deep_copy(&self) -> VmResult<Pte> {
        let (alloc, src_frame, flags, shared) = {
            let inner = self.0.lock();
            (
                inner.alloc.clone(),
                inner.frame,
                inner.flags,
                inner.shared,
            )
        };
        let new_frame = alloc.alloc_zeroed().ok_or(VmError::OutOfMemory)?;
        alloc.copy_contents(src_frame, new_frame);
        Ok(Pte(Arc::new(Mutex::new(PteInner {
            frame: new_frame,
            flags,
            shared,
            alloc,
        }))))
    }

    /// Resolves a READONLY (write-to-shared-page) fault.
    ///
    /// Fast path: if this handle is the sole sharer, flip the writable bit in
    /// place and return the same handle — no allocation. Slow path: allocate
    /// a new frame, copy contents, mark it writable, and return the new
    /// handle. The caller is expected to replace the faulting slot's pointer
    /// with the returned handle (a no-op in the fast-path case); dropping the
    /// old slot value is what decrements the source's `ref_count`.
    pub fn cow_copy(&self) -> VmResult<Pte> {
        let mut inner = self.0.lock();
        if self.ref_count() == 1 {
            inner.flags.insert(PteFlags::WRITABLE);
            drop(inner);
            return Ok(self.clone());
        }
        let alloc = inner.alloc.clone();
        let src_frame = inner.frame;
        let shared = inner.shared;
        drop(inner);
        let new_frame = alloc.alloc_zeroed().ok_or(VmError::OutOfMemory)?;
        alloc.copy_contents(src_frame, new_frame);
        Ok(Pte(Arc::new(Mutex::new(PteInner {
            frame: new_frame,
            flags: PteFlags::VALID | PteFlags::WRITABLE,
            shared,
            alloc,
        }))))
    }
}
