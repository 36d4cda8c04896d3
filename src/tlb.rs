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

//! TLB load policy (C6).
//!
//! This model has no ASID and no LRU: a fault either overwrites the existing
//! entry for its page or lands in a randomly chosen slot, which is enough for
//! per-fault forward progress. Raising and restoring interrupt priority
//! around the hardware write is the caller's responsibility (it is trap
//! dispatch, an external collaborator this crate does not model); by the
//! time [`load`] runs, the caller is assumed to already be at the elevated
//! priority the hardware write requires.

use crate::addr::VirtAddr;
use crate::collab::{PhysFrame, Tlb};

/// Installs a translation for `vaddr` into the TLB.
///
/// If `force_readwrite` is set (ELF loading in progress), the writable bit is
/// forced on regardless of the PTE's own bit, matching the permission
/// override applied elsewhere during a load. The slot is whatever
/// `tlb.probe` finds for this page, or a random one if this is the page's
/// first load.
pub fn load(tlb: &dyn Tlb, vaddr: VirtAddr, frame: PhysFrame, writable: bool, force_readwrite: bool) {
    let effective_writable = writable || force_readwrite;
    let index = tlb.probe(vaddr);
    tlb.write(vaddr, frame, effective_writable, index);
}
