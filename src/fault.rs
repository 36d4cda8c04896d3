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

//! The fault handler (C5): turns a hardware trap into an allocation, a COW
//! split, or a TLB load.

use alloc::sync::Arc;

use crate::addr::{VirtAddr, PAGE_SIZE};
use crate::address_space::AddressSpace;
use crate::collab::{FrameAllocator, Tlb, Vfs};
use crate::error::{VmError, VmResult};
use crate::region::RegionType;
use crate::{pte, tlb};

/// The kind of trap delivered to [`handle_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// A read through a page with no translation yet, or with no read
    /// permission.
    Read,
    /// A write through a page with no translation yet, or with no write
    /// permission.
    Write,
    /// A write through an existing, write-protected translation — the COW
    /// trigger.
    ReadOnly,
}

/// Bundles the current address space with the collaborators a fault might
/// need, replacing the ambient "current process" state the source kernel
/// relies on.
pub struct FaultContext<'a> {
    /// The faulting thread's address space.
    pub address_space: &'a mut AddressSpace,
    /// Frame allocator used for lazy allocation and COW splits.
    pub frame_alloc: Arc<dyn FrameAllocator + Send + Sync>,
    /// VFS used to populate FILE-backed pages.
    pub vfs: Arc<dyn Vfs + Send + Sync>,
    /// Hardware TLB.
    pub tlb: &'a dyn Tlb,
}

/// Resolves a single fault. Returns `Ok(())` on success or the error code the
/// caller should surface to the faulting thread.
pub fn handle_fault(ctx: &mut FaultContext<'_>, fault_type: FaultType, fault_vaddr: VirtAddr) -> VmResult<()> {
    // Step 1 (validate fault_type) and step 2 (current address space
    // present) are enforced by the type system here: `FaultType` is a closed
    // enum and `FaultContext` always carries a live `&mut AddressSpace`, so
    // neither failure mode the source checks for can arise in this API.
    let page_base = fault_vaddr.page_base();

    let region = ctx
        .address_space
        .regions()
        .find(fault_vaddr)
        .ok_or(VmError::BadAddress)?
        .clone();

    let force_rw = ctx.address_space.force_readwrite();
    match fault_type {
        FaultType::Read if !region.readable() => {
            log::warn!("read fault at {fault_vaddr} denied: region not readable");
            return Err(VmError::BadAddress);
        }
        FaultType::Write if !region.writable() && !force_rw => {
            log::warn!("write fault at {fault_vaddr} denied: region not writable");
            return Err(VmError::BadAddress);
        }
        FaultType::ReadOnly if !region.writable() && !force_rw => {
            log::warn!("readonly fault at {fault_vaddr} denied: region not writable");
            return Err(VmError::BadAddress);
        }
        _ => {}
    }

    let is_file = matches!(region.kind(), RegionType::File { .. });

    if fault_type == FaultType::ReadOnly {
        if let Some(slot_pte) = ctx.address_space.page_table().remove_entry(page_base) {
            // Taking the slot's own handle via `remove_entry`, rather than
            // the extra clone `lookup` would hand back, means `cow_copy`'s
            // sole-owner check sees the real sharer count instead of one
            // this call itself inflated by holding a second reference.
            let split = match slot_pte.cow_copy() {
                Ok(split) => split,
                Err(err) => {
                    // Nothing changed; put the entry back as found.
                    ctx.address_space.page_table().add_entry(page_base, slot_pte);
                    return Err(err);
                }
            };
            if split.is_same_handle(&slot_pte) {
                log::trace!("COW fast path at {page_base}: sole owner, marking writable");
            } else {
                log::trace!("COW split at {page_base}: allocating private copy");
            }
            if is_file {
                split.mark_dirty();
            }
            ctx.address_space
                .page_table()
                .add_entry(page_base, split.clone());
            tlb::load(ctx.tlb, page_base, split.frame(), split.is_writable(), force_rw);
            return Ok(());
        }
    } else if let Some(existing_pte) = ctx.address_space.page_table().lookup(page_base) {
        log::trace!("TLB reload at {page_base}: existing translation");
        if is_file && fault_type == FaultType::Write {
            existing_pte.mark_dirty();
        }
        tlb::load(
            ctx.tlb,
            page_base,
            existing_pte.frame(),
            existing_pte.is_writable(),
            force_rw,
        );
        return Ok(());
    }

    // No translation yet: lazily allocate.
    let shared = region.kind().is_shareable();
    let new_pte = pte::Pte::new(ctx.frame_alloc.clone(), shared, region.writable())?;

    if let RegionType::File { handle, offset } = region.kind() {
        let page_index = (page_base - region.vbase()) / PAGE_SIZE;
        let file_offset = offset + (page_index * PAGE_SIZE) as u64;
        log::trace!("populating file-backed page at {page_base} from offset {file_offset}");
        // Backed by a file read regardless of fault direction: a write fault
        // on a page with no translation yet still needs the existing file
        // contents merged in, not a zero page. Writeback, if any, happens
        // later through an explicit sync, never here (see design notes).
        ctx.vfs.read_page(handle, file_offset, new_pte.frame())?;
        if fault_type == FaultType::Write {
            new_pte.mark_dirty();
        }
    } else {
        log::trace!("lazily allocating zero-filled page at {page_base}");
    }

    ctx.address_space
        .page_table()
        .add_entry(page_base, new_pte.clone());
    tlb::load(ctx.tlb, page_base, new_pte.frame(), new_pte.is_writable(), force_rw);
    Ok(())
}
