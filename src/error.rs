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

//! Error taxonomy surfaced by this crate to its caller.

use core::fmt;

/// A collaborator-supplied I/O failure, carried opaquely through [`VmError::Io`].
///
/// The core never inspects the cause beyond propagating it; the embedding
/// kernel's [`Vfs`](crate::collab::Vfs) implementation decides what goes here.
pub trait IoCause: fmt::Debug + fmt::Display {}

impl<T: fmt::Debug + fmt::Display> IoCause for T {}

/// Errors produced by the virtual-memory core.
///
/// Every variant here corresponds to one of the error codes a fault or a
/// `sbrk`/`mmap`/`munmap` call may surface. Internal invariant violations
/// (lock ownership, `ref_count >= 1`, page alignment) are programming errors
/// and are asserted, not returned, as `VmError`.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The frame allocator returned no frame, or no gap was large enough for a
    /// file-backed region.
    #[error("out of memory")]
    OutOfMemory,
    /// A fault address lies outside any region, or violates the region's
    /// permission bits without `force_readwrite` set.
    #[error("bad address")]
    BadAddress,
    /// A bad fault type, or malformed `mmap`/`munmap` arguments.
    #[error("invalid argument")]
    InvalidArgument,
    /// `mmap` referenced a file descriptor that is not open.
    #[error("bad descriptor")]
    BadDescriptor,
    /// A region type the fault handler does not know how to populate.
    #[error("not implemented")]
    NotImplemented,
    /// The collaborator-supplied VFS failed to read or write a page.
    #[error("i/o error: {0}")]
    Io(alloc::boxed::Box<dyn IoCause + Send + Sync>),
}

impl VmError {
    /// Wraps an arbitrary collaborator error as [`VmError::Io`].
    pub fn io<E: IoCause + Send + Sync + 'static>(cause: E) -> Self {
        Self::Io(alloc::boxed::Box::new(cause))
    }
}

/// Convenience alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;
