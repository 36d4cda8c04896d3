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

//! Heap growth and file-backed mapping (C7): `sbrk`, `mmap`, `munmap`.

use crate::addr::{VirtAddr, PAGE_SIZE};
use crate::address_space::AddressSpace;
use crate::collab::{FileHandle, Vfs};
use crate::error::{VmError, VmResult};
use crate::region::{Region, RegionType};

/// Grows or shrinks the heap region by `amount` bytes (may be negative).
///
/// `amount == 0` just reports the current break. Returns the **previous**
/// heap top on success.
pub fn sbrk(asp: &mut AddressSpace, amount: isize) -> VmResult<VirtAddr> {
    let heap_base = asp.heap_start().ok_or(VmError::InvalidArgument)?;
    let current_top = asp
        .regions()
        .find_by_vbase(heap_base)
        .ok_or(VmError::InvalidArgument)?
        .vtop();
    if amount == 0 {
        return Ok(current_top);
    }

    let upper_bound = asp.regions().next_above(heap_base).map(Region::vbase);
    let new_top = if amount > 0 {
        (current_top + amount as usize).align_up()
    } else {
        (current_top - (-amount) as usize).align_down()
    };

    if new_top < heap_base {
        return Err(VmError::OutOfMemory);
    }
    if let Some(bound) = upper_bound {
        if new_top >= bound {
            return Err(VmError::OutOfMemory);
        }
    }

    asp.regions_mut()
        .find_by_vbase_mut(heap_base)
        .expect("heap region present, checked above")
        .set_vtop(new_top);
    log::debug!("sbrk: heap top {current_top} -> {new_top}");
    Ok(current_top)
}

/// Reserves `npages` pages in the gap between the heap top and the region
/// immediately above it (the stack, or a previously placed file region),
/// flush against that neighbour's base — the highest legal placement.
fn alloc_file_region(
    asp: &mut AddressSpace,
    npages: usize,
    readable: bool,
    writable: bool,
    handle: FileHandle,
    offset: u64,
) -> VmResult<VirtAddr> {
    let heap_base = asp.heap_start().ok_or(VmError::InvalidArgument)?;
    let gap_start = asp
        .regions()
        .find_by_vbase(heap_base)
        .ok_or(VmError::InvalidArgument)?
        .vtop();
    let stack_base = asp.stack_start().ok_or(VmError::InvalidArgument)?;
    let neighbour_base = asp
        .regions()
        .next_above(gap_start)
        .map(Region::vbase)
        .unwrap_or(stack_base);

    let size = npages * PAGE_SIZE;
    if neighbour_base < gap_start || neighbour_base - gap_start < size {
        return Err(VmError::OutOfMemory);
    }
    let vtop = neighbour_base;
    let vbase = vtop - size;

    let region = Region::new(vbase, vtop, readable, writable, false, RegionType::File { handle, offset });
    asp.regions_mut().insert(region);
    log::debug!("alloc_file_region: placed [{vbase}, {vtop}) for fd {}", handle.0);
    Ok(vbase)
}

/// `mmap(length, prot, fd, offset)`: creates a FILE region backed by `fd` at
/// `offset`, sized to cover `length` bytes. `fd` is `None` when the caller's
/// descriptor table has no open file for the requested fd — validating that
/// table itself is the syscall layer's job, not this crate's.
pub fn mmap(
    asp: &mut AddressSpace,
    length: usize,
    readable: bool,
    writable: bool,
    fd: Option<FileHandle>,
    offset: u64,
) -> VmResult<VirtAddr> {
    if length == 0 || offset as usize % PAGE_SIZE != 0 {
        return Err(VmError::InvalidArgument);
    }
    let handle = fd.ok_or(VmError::BadDescriptor)?;
    let npages = length.div_ceil(PAGE_SIZE);
    alloc_file_region(asp, npages, readable, writable, handle, offset)
}

/// Writes every dirty page of the FILE region based at `vbase` back to its
/// file through `vfs`, clearing each page's dirty bit as it is flushed.
///
/// This is the explicit writeback path the fault handler itself never takes
/// (see the design note on file-backed write semantics): a write fault only
/// marks a page dirty, and nothing forces it back to disk until `msync` (or
/// `munmap`, which calls this first) runs.
pub fn msync(asp: &AddressSpace, vbase: VirtAddr, vfs: &dyn Vfs) -> VmResult<()> {
    let region = asp
        .regions()
        .find_by_vbase(vbase)
        .ok_or(VmError::InvalidArgument)?;
    let RegionType::File { handle, offset } = region.kind() else {
        return Err(VmError::InvalidArgument);
    };
    let vtop = region.vtop();

    let mut page = vbase;
    while page < vtop {
        if let Some(pte) = asp.page_table().lookup(page) {
            if pte.is_dirty() {
                let page_index = (page - vbase) / PAGE_SIZE;
                let file_offset = offset + (page_index * PAGE_SIZE) as u64;
                vfs.write_page(handle, file_offset, pte.frame())?;
                pte.clear_dirty();
                log::trace!("msync: flushed dirty page at {page} to offset {file_offset}");
            }
        }
        page = page + PAGE_SIZE;
    }
    Ok(())
}

/// `munmap(addr)`: flushes any dirty pages of the FILE region based at `addr`
/// back to its file, then removes the region and eagerly releases every PTE
/// in its range, rather than deferring to address-space teardown.
pub fn munmap(asp: &mut AddressSpace, vbase: VirtAddr, vfs: &dyn Vfs) -> VmResult<()> {
    let region = asp
        .regions()
        .find_by_vbase(vbase)
        .ok_or(VmError::InvalidArgument)?;
    if !matches!(region.kind(), RegionType::File { .. }) {
        return Err(VmError::InvalidArgument);
    }
    let vtop = region.vtop();

    msync(asp, vbase, vfs)?;

    let mut page = vbase;
    while page < vtop {
        if let Some(pte) = asp.page_table().remove_entry(page) {
            pte.dec_ref();
        }
        page = page + PAGE_SIZE;
    }

    asp.regions_mut().remove(vbase);
    log::debug!("munmap: released [{vbase}, {vtop})");
    Ok(())
}
