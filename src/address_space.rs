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

//! A process's virtual-memory context: a region list bound to a page table.
//!
//! There is no ambient "current address space" anywhere in this crate. Every
//! operation that needs one receives it as an explicit argument — usually
//! `&mut AddressSpace` or, in the fault path, a [`crate::fault::FaultContext`]
//! that bundles it with the collaborators a fault might need.

use crate::addr::{VirtAddr, PAGE_SIZE, STACK_PAGES, USERSTACK};
use crate::collab::Tlb;
use crate::error::VmResult;
use crate::page_table::PageTable;
use crate::region::{Region, RegionList, RegionType};

/// Binds a [`RegionList`] to a [`PageTable`]; the unit of copy, teardown, and
/// context-switch in this model.
pub struct AddressSpace {
    regions: RegionList,
    page_table: PageTable,
    /// Asserted during ELF load so writes to read-only segments succeed
    /// without faulting.
    force_readwrite: bool,
    heap_start: Option<VirtAddr>,
    stack_start: Option<VirtAddr>,
}

impl AddressSpace {
    /// Creates an empty address space: no regions, an empty page table,
    /// `force_readwrite` clear, no cached heap/stack bounds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: RegionList::new(),
            page_table: PageTable::new(),
            force_readwrite: false,
            heap_start: None,
            stack_start: None,
        }
    }

    /// Read-only access to the region list.
    #[must_use]
    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// Mutable access to the region list (used by `sbrk`/`mmap`/`munmap`).
    pub fn regions_mut(&mut self) -> &mut RegionList {
        &mut self.regions
    }

    /// The process's page table.
    #[must_use]
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Whether ELF-load write overrides are currently in effect.
    #[must_use]
    pub fn force_readwrite(&self) -> bool {
        self.force_readwrite
    }

    /// Cached base of the heap region, once [`Self::define_stack`] has run.
    #[must_use]
    pub fn heap_start(&self) -> Option<VirtAddr> {
        self.heap_start
    }

    /// Cached base of the stack region, once [`Self::define_stack`] has run.
    #[must_use]
    pub fn stack_start(&self) -> Option<VirtAddr> {
        self.stack_start
    }

    /// Forks this address space for a child process: deep-copies the region
    /// list and COW-copies the page table (shareable entries get an extra
    /// reference and lose their writable bit; non-shareable ones, i.e.
    /// stack, are deep-copied).
    pub fn fork(&self) -> VmResult<AddressSpace> {
        log::debug!(
            "forking address space: {} regions, {} live L1 slots",
            self.regions.len(),
            self.page_table.l1_live_count()
        );
        Ok(AddressSpace {
            regions: self.regions.clone(),
            page_table: self.page_table.copy()?,
            force_readwrite: self.force_readwrite,
            heap_start: self.heap_start,
            stack_start: self.stack_start,
        })
    }

    /// Tears down the address space: drops the region list, then the page
    /// table (order matters only in spirit here — frames are owned solely by
    /// PTEs, so dropping the page table is what actually releases them).
    pub fn destroy(self) {
        drop(self);
    }

    /// Flushes the hardware TLB. This model has no ASIDs, so every
    /// context switch invalidates every entry, making repeated calls
    /// idempotent (the TLB is always empty afterward).
    pub fn activate(&self, tlb: &dyn Tlb) {
        tlb.flush();
    }

    /// Also flushes the TLB; kept as a distinct call site for symmetry with
    /// `activate` at context-switch boundaries.
    pub fn deactivate(&self, tlb: &dyn Tlb) {
        tlb.flush();
    }

    /// Defines a plain (`UNNAMED`) region spanning at least `[vaddr, vaddr +
    /// size)`, rounding the base down and the top up to page granularity.
    /// Used while laying out ELF segments.
    pub fn define_region(
        &mut self,
        vaddr: VirtAddr,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Region {
        let base = vaddr.align_down();
        let top = (vaddr + size).align_up();
        let region = Region::new(base, top, readable, writable, executable, RegionType::Unnamed);
        self.regions.insert(region.clone());
        region
    }

    /// Sets `force_readwrite`, overriding region permission checks for the
    /// duration of ELF loading.
    pub fn prepare_load(&mut self) {
        self.force_readwrite = true;
    }

    /// Clears `force_readwrite` once loading is complete.
    pub fn complete_load(&mut self) {
        self.force_readwrite = false;
    }

    /// Lays out the heap and stack once ELF segments are in place: a
    /// one-page `HEAP` region immediately above the topmost existing region,
    /// and an [`STACK_PAGES`]-page `STACK` region ending at [`USERSTACK`].
    /// Sorts the region list and asserts the no-overlap invariant. Returns
    /// `USERSTACK`, the value the caller writes into the new process's stack
    /// pointer register.
    pub fn define_stack(&mut self) -> VirtAddr {
        let heap_base = self
            .regions
            .iter()
            .map(Region::vtop)
            .max()
            .unwrap_or(VirtAddr::new(0));
        let heap_top = heap_base + PAGE_SIZE;
        self.regions.insert(Region::new(
            heap_base,
            heap_top,
            true,
            true,
            false,
            RegionType::Heap,
        ));

        let stack_top = USERSTACK;
        let stack_base = stack_top - STACK_PAGES * PAGE_SIZE;
        self.regions.insert(Region::new(
            stack_base,
            stack_top,
            true,
            true,
            false,
            RegionType::Stack,
        ));

        self.regions.sort_and_check();
        self.heap_start = Some(heap_base);
        self.stack_start = Some(stack_base);
        stack_top
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
