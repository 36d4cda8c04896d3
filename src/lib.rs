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

//! Virtual-memory core for an educational kernel.
//!
//! This crate implements the address-space layer shared by every process: a
//! hierarchical, software-managed page table ([`page_table`]), an ordered list
//! of virtual memory regions ([`region`]), and a fault handler ([`fault`]) that
//! ties the two together with lazy allocation and copy-on-write fork.
//!
//! Everything outside that boundary — the frame allocator, the VFS, the
//! hardware TLB, ELF loading, and scheduling — is a collaborator the
//! embedding kernel supplies through the traits in [`collab`]. Nothing in this
//! crate reaches for global state: every operation takes the address space (or
//! a [`fault::FaultContext`] bundling it with collaborators) as an explicit
//! argument.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod collab;
pub mod error;
pub mod fault;
pub mod heap_mmap;
pub mod page_table;
pub mod pte;
pub mod region;
pub mod address_space;
pub mod tlb;


#[cfg(test)]
mod proptests;

pub use addr::{VirtAddr, L1_BITS, L2_BITS, OFFSET_BITS, PAGE_SIZE};
pub use address_space::AddressSpace;
pub use collab::{FrameAllocator, PhysFrame, Vfs};
pub use error::VmError;
pub use fault::{FaultContext, FaultType};
pub use region::{Region, RegionType};
