//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! [`system::VirtualMemory`] ties together the frame table, the swap store and
//! one page table per address space. The kernel reaches it from the page
//! fault handler and from system calls that take user pointers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod threading;

#[cfg(test)]
mod test_util;

pub use mem::config::VmConfig;
pub use mem::{Result, VmError};
pub use system::VirtualMemory;
