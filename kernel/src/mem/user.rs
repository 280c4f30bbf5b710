//! Checking and copying memory named by user programs.
//!
//! An address handed to the kernel is only trusted once every page it touches
//! is reserved, resident and permits the access. Anything else kills the
//! process with status -1.

use crate::block::block_core::BlockOp;
use crate::mem::page_table::{PageInit, PageTable};
use crate::mem::{PhysicalMemory, VmError};
use crate::system::VirtualMemory;
use crate::threading::process::{Access, FaultContext, Terminated, EXIT_STATUS_INVALID_ACCESS};
use alloc::{vec, vec::Vec};
use core::{fmt, hint::spin_loop, ops::Range};
use kidneyos_shared::mem::{
    is_kernel_address, page_offset, PhysicalPage, VirtPageNum, PAGE_FRAME_SIZE,
};

/// Why an access was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Denial {
    KernelAddress,
    ReadOnly,
    Unmapped,
    Failed(VmError),
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelAddress => write!(f, "address is not in user space"),
            Self::ReadOnly => write!(f, "write to read-only page"),
            Self::Unmapped => write!(f, "no page reserved and not stack growth"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Plan {
    /// The page exists; make sure it is resident.
    Load,
    /// Extend the stack with a fresh page.
    Grow,
}

impl<M: PhysicalMemory, B: BlockOp> VirtualMemory<M, B> {
    /// Checks that the `len` bytes at `addr` may be accessed by the process in
    /// `ctx`, and makes every page involved resident. A zero length checks the
    /// page containing `addr`.
    pub fn validate_and_prepare(
        &self,
        ctx: &FaultContext,
        addr: usize,
        len: usize,
        write: bool,
    ) -> Access {
        match self.prepare(ctx, addr, len, write) {
            Ok(()) => Access::Proceed,
            Err((at, denial)) => self.terminate(ctx.asid, at, &denial),
        }
    }

    /// Handles a page fault raised by the hardware at `addr`.
    pub fn resolve_hardware_fault(&self, ctx: &FaultContext, addr: usize, write: bool) -> Access {
        self.validate_and_prepare(ctx, addr, 1, write)
    }

    fn prepare(
        &self,
        ctx: &FaultContext,
        addr: usize,
        len: usize,
        write: bool,
    ) -> Result<(), (usize, Denial)> {
        let last = addr
            .checked_add(len.saturating_sub(1))
            .ok_or((addr, Denial::KernelAddress))?;
        if is_kernel_address(last) || last >= self.config().user_top {
            return Err((last, Denial::KernelAddress));
        }

        let space = self
            .address_space(ctx.asid)
            .map_err(|err| (addr, Denial::Failed(err)))?;
        loop {
            let prepared = self.prepare_locked(&mut space.table().lock(), ctx, addr, last, write);
            match prepared {
                // Let the holders of the victims' tables finish, then
                // classify again from scratch.
                Err((_, Denial::Failed(VmError::VictimsBusy))) => spin_loop(),
                prepared => return prepared,
            }
        }
    }

    fn prepare_locked(
        &self,
        table: &mut PageTable,
        ctx: &FaultContext,
        addr: usize,
        last: usize,
        write: bool,
    ) -> Result<(), (usize, Denial)> {
        // Classify everything first so a bad page leaves the rest untouched.
        let first = VirtPageNum::containing(addr);
        let last = VirtPageNum::containing(last);
        let mut plans = Vec::new();
        let mut vpn = first;
        loop {
            let at = if vpn == first { addr } else { vpn.start_address() };
            let plan = self.classify(table, ctx, at, write).map_err(|denial| (at, denial))?;
            plans.push((vpn, plan));
            if vpn == last {
                break;
            }
            vpn = vpn.next();
        }

        for (vpn, plan) in plans {
            let result = match plan {
                Plan::Load => table
                    .resolve_fault(self.frames(), self.swap(), vpn)
                    .map(drop),
                Plan::Grow => {
                    table.reserve(self.frames(), self.swap(), vpn, true, PageInit::Resident)
                }
            };
            result.map_err(|err| (vpn.start_address(), Denial::Failed(err)))?;
        }
        Ok(())
    }

    fn classify(
        &self,
        table: &PageTable,
        ctx: &FaultContext,
        at: usize,
        write: bool,
    ) -> Result<Plan, Denial> {
        match table.lookup(at) {
            Some(page) if write && !page.writable => Err(Denial::ReadOnly),
            Some(_) => Ok(Plan::Load),
            None if self.config().allows_stack_growth(at, ctx.stack_pointer) => Ok(Plan::Grow),
            None => Err(Denial::Unmapped),
        }
    }

    fn kill(&self, ctx: &FaultContext, addr: usize, reason: &dyn fmt::Display) -> Terminated {
        self.terminate(ctx.asid, addr, reason);
        Terminated {
            asid: ctx.asid,
            status: EXIT_STATUS_INVALID_ACCESS,
        }
    }

    /// Validates the range, then calls `f` for each page-sized piece of it
    /// with the frame, the offset into the frame and the matching range of
    /// the user buffer. Each page is made resident again under its page
    /// table lock in case it was evicted after validation.
    fn for_each_user_page(
        &self,
        ctx: &FaultContext,
        addr: usize,
        len: usize,
        write: bool,
        mut f: impl FnMut(&M, PhysicalPage, usize, Range<usize>),
    ) -> Result<(), Terminated> {
        if let Access::Terminate(status) = self.validate_and_prepare(ctx, addr, len, write) {
            return Err(Terminated {
                asid: ctx.asid,
                status,
            });
        }
        let space = self
            .address_space(ctx.asid)
            .map_err(|err| self.kill(ctx, addr, &err))?;

        let mut done = 0;
        while done < len {
            let at = addr + done;
            let offset = page_offset(at);
            let chunk = (PAGE_FRAME_SIZE - offset).min(len - done);
            let vpn = VirtPageNum::containing(at);
            let resolved = self.with_table(&space, |table| {
                table
                    .resolve_fault(self.frames(), self.swap(), vpn)
                    .map(|frame| f(self.frames().memory(), frame, offset, done..done + chunk))
            });
            if let Err(err) = resolved {
                return Err(self.kill(ctx, at, &err));
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies `len` bytes out of user memory.
    pub fn copy_from_user(
        &self,
        ctx: &FaultContext,
        addr: usize,
        len: usize,
    ) -> Result<Vec<u8>, Terminated> {
        let mut bytes = vec![0; len];
        self.for_each_user_page(ctx, addr, len, false, |memory, frame, offset, range| {
            memory.read(frame, offset, &mut bytes[range]);
        })?;
        Ok(bytes)
    }

    pub fn copy_to_user(
        &self,
        ctx: &FaultContext,
        addr: usize,
        bytes: &[u8],
    ) -> Result<(), Terminated> {
        self.for_each_user_page(ctx, addr, bytes.len(), true, |memory, frame, offset, range| {
            memory.write(frame, offset, &bytes[range]);
        })
    }

    /// Reads the NUL-terminated string at `addr`, one page at a time, and
    /// returns it without the terminator.
    pub fn validate_str(&self, ctx: &FaultContext, addr: usize) -> Result<Vec<u8>, Terminated> {
        let mut bytes = Vec::new();
        let mut at = addr;
        loop {
            let chunk = self.copy_from_user(ctx, at, PAGE_FRAME_SIZE - page_offset(at))?;
            if let Some(end) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return Ok(bytes);
            }
            bytes.extend_from_slice(&chunk);
            at = at
                .checked_add(chunk.len())
                .ok_or_else(|| self.kill(ctx, at, &Denial::KernelAddress))?;
        }
    }
}
