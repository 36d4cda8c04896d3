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

//! Two-level, software-managed page table.
//!
//! The L1 table is a dense array of optional pointers to L2 tables, which are
//! themselves dense arrays of optional [`Pte`] handles. Both tiers plus their
//! live-counts sit behind one [`spin::Mutex`], matching the single
//! table-level lock the design calls for: lookups, insertions and removals
//! all serialize on it, while contention on an individual entry's contents is
//! handled by the PTE's own lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::addr::{VirtAddr, L1_ENTRIES, L2_ENTRIES};
use crate::error::VmResult;
use crate::pte::Pte;

struct L2Table {
    slots: Vec<Option<Pte>>,
    live: usize,
}

impl L2Table {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(L2_ENTRIES);
        slots.resize_with(L2_ENTRIES, || None);
        Self { slots, live: 0 }
    }
}

struct PageTableInner {
    l1: Vec<Option<Box<L2Table>>>,
}

impl PageTableInner {
    fn new() -> Self {
        let mut l1 = Vec::with_capacity(L1_ENTRIES);
        l1.resize_with(L1_ENTRIES, || None);
        Self { l1 }
    }
}

/// A per-process, two-level hierarchical page table.
pub struct PageTable {
    inner: Mutex<PageTableInner>,
}

impl PageTable {
    /// Creates an empty page table (no L1 slot populated).
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PageTableInner::new()),
        }
    }

    /// Looks up the PTE mapping `vaddr`'s page, if any. Returns a clone of
    /// the handle (cheap: an `Arc` bump), not a reference, so the table lock
    /// need not be held by the caller afterward.
    #[must_use]
    pub fn lookup(&self, vaddr: VirtAddr) -> Option<Pte> {
        let inner = self.inner.lock();
        let l2 = inner.l1[vaddr.l1_index()].as_ref()?;
        l2.slots[vaddr.l2_index()].clone()
    }

    /// Installs `pte` at `vaddr`'s slot, allocating the L2 table if this is
    /// the first mapping in its L1 range.
    ///
    /// If the slot was already occupied, the old handle is simply dropped by
    /// the assignment below, which is exactly the reference-count decrement
    /// the caller relies on when swapping a shared PTE for a COW split — no
    /// separate "decrement the old one" step is needed.
    pub fn add_entry(&self, vaddr: VirtAddr, pte: Pte) {
        let mut inner = self.inner.lock();
        let l1_idx = vaddr.l1_index();
        let l2 = inner.l1[l1_idx].get_or_insert_with(|| Box::new(L2Table::new()));
        let slot = &mut l2.slots[vaddr.l2_index()];
        if slot.is_none() {
            l2.live += 1;
        }
        *slot = Some(pte);
    }

    /// Removes and returns the PTE mapping `vaddr`, if any. Frees the L2
    /// table once it becomes empty. The caller decides whether to drop the
    /// returned handle (releasing one reference) or reinstall it elsewhere.
    pub fn remove_entry(&self, vaddr: VirtAddr) -> Option<Pte> {
        let mut inner = self.inner.lock();
        let l1_idx = vaddr.l1_index();
        let l2 = inner.l1[l1_idx].as_mut()?;
        let removed = l2.slots[vaddr.l2_index()].take()?;
        l2.live -= 1;
        if l2.live == 0 {
            inner.l1[l1_idx] = None;
        }
        Some(removed)
    }

    /// Builds a new page table from `self` for use by a forked child.
    ///
    /// Holds `self`'s lock for the whole operation, so no concurrent fault in
    /// the source can split a shared PTE mid-copy and leave the child with a
    /// half-updated view. For each populated slot: COW-shareable entries are
    /// `inc_ref`'d (both tables end up pointing at the same handle, now
    /// read-only); non-shareable entries (stack) are deep-copied.
    ///
    /// On an allocation failure partway through, the partially built new
    /// table is returned as `Err`'s payload is simply dropped — which runs
    /// every installed handle's destructor and correctly unwinds the
    /// reference counts this function had bumped, with no special-case
    /// rollback code required.
    pub fn copy(&self) -> VmResult<PageTable> {
        let inner = self.inner.lock();
        let new_table = PageTable::new();
        for (l1_idx, l2_slot) in inner.l1.iter().enumerate() {
            let Some(l2) = l2_slot else { continue };
            for (l2_idx, pte_slot) in l2.slots.iter().enumerate() {
                let Some(pte) = pte_slot else { continue };
                let copied = if pte.is_shared() {
                    pte.inc_ref()
                } else {
                    pte.deep_copy()?
                };
                let vaddr = VirtAddr::from_indices(l1_idx, l2_idx);
                new_table.add_entry(vaddr, copied);
            }
        }
        Ok(new_table)
    }

    /// Releases every live PTE (dropping each handle, which decrements its
    /// `ref_count` or destroys it if this table held the last reference) and
    /// frees every L2 table.
    pub fn destroy(self) {
        drop(self);
    }

    /// Number of live (non-empty) L1 slots, for tests and diagnostics.
    #[must_use]
    pub fn l1_live_count(&self) -> usize {
        self.inner.lock().l1.iter().filter(|s| s.is_some()).count()
    }

    /// Reads the `ref_count` of the entry at `vaddr` without cloning the
    /// handle (and therefore without perturbing the very count being read),
    /// unlike `lookup(vaddr).map(|pte| pte.ref_count())`.
    #[must_use]
    pub fn entry_ref_count(&self, vaddr: VirtAddr) -> Option<usize> {
        let inner = self.inner.lock();
        let l2 = inner.l1[vaddr.l1_index()].as_ref()?;
        l2.slots[vaddr.l2_index()].as_ref().map(Pte::ref_count)
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
