use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};
use log::warn;

/// Address space id. One per process.
pub type Asid = u16;
pub type AtomicAsid = AtomicU16;

/// Exit status reported for a process killed by an invalid memory access.
pub const EXIT_STATUS_INVALID_ACCESS: i32 = -1;

pub struct AsidAllocator {
    next_asid: AtomicAsid,
}

impl AsidAllocator {
    pub const fn new() -> Self {
        Self {
            next_asid: AtomicAsid::new(1),
        }
    }

    pub fn allocate(&self) -> Asid {
        let asid = self.next_asid.fetch_add(1, Ordering::SeqCst);
        if asid == 0 {
            panic!("ASID overflow");
        }
        asid
    }
}

impl Default for AsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// What the kernel knows about the thread on whose behalf memory is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    pub asid: Asid,
    /// User stack pointer saved when the thread entered the kernel.
    pub stack_pointer: usize,
}

impl FaultContext {
    pub fn new(asid: Asid, stack_pointer: usize) -> Self {
        Self {
            asid,
            stack_pointer,
        }
    }
}

/// Outcome of validating a user access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Every page involved is resident and mapped with the needed permissions.
    Proceed,
    /// The process was terminated with this exit status.
    Terminate(i32),
}

/// Returned by the copying helpers when the process was terminated instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated {
    pub asid: Asid,
    pub status: i32,
}

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process {} terminated with status {}", self.asid, self.status)
    }
}

impl core::error::Error for Terminated {}

/// The process layer's side of an invalid access. Called with no locks held.
pub trait TerminationHook: Send + Sync {
    fn terminate(&self, asid: Asid, status: i32);
}

impl<F: Fn(Asid, i32) + Send + Sync> TerminationHook for F {
    fn terminate(&self, asid: Asid, status: i32) {
        self(asid, status);
    }
}

/// Only records the termination in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTermination;

impl TerminationHook for LogTermination {
    fn terminate(&self, asid: Asid, status: i32) {
        warn!("process {asid} exited with status {status}");
    }
}
