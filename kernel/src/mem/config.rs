use crate::mem::frame_table::EVICTION_RETRIES;
use kidneyos_shared::mem::{OFFSET, USER_STACK_LIMIT};

/// Tunables for the virtual memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// How far below the stack pointer a faulting access may land and still
    /// count as stack growth. 32 bytes covers `pusha`.
    pub stack_growth_margin: usize,
    /// The stack may not grow further than this below `user_top`.
    pub max_stack_size: usize,
    /// First address that belongs to the kernel.
    pub user_top: usize,
    /// Rounds of victim selection before eviction gives up.
    pub eviction_retries: usize,
}

impl VmConfig {
    pub const DEFAULT: Self = Self {
        stack_growth_margin: 32,
        max_stack_size: USER_STACK_LIMIT,
        user_top: OFFSET,
        eviction_retries: EVICTION_RETRIES,
    };

    pub const fn with_stack_growth_margin(self, stack_growth_margin: usize) -> Self {
        Self {
            stack_growth_margin,
            ..self
        }
    }

    pub const fn with_max_stack_size(self, max_stack_size: usize) -> Self {
        Self {
            max_stack_size,
            ..self
        }
    }

    pub const fn with_user_top(self, user_top: usize) -> Self {
        Self { user_top, ..self }
    }

    pub const fn with_eviction_retries(self, eviction_retries: usize) -> Self {
        Self {
            eviction_retries,
            ..self
        }
    }

    /// Lowest address the stack is allowed to reach.
    pub const fn stack_floor(&self) -> usize {
        self.user_top.saturating_sub(self.max_stack_size)
    }

    /// Whether an access at `addr` with no page behind it may be satisfied by
    /// growing the stack of a thread whose stack pointer is `stack_pointer`.
    pub fn allows_stack_growth(&self, addr: usize, stack_pointer: usize) -> bool {
        addr < self.user_top
            && addr >= self.stack_floor()
            && addr >= stack_pointer.saturating_sub(self.stack_growth_margin)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_growth_window() {
        let config = VmConfig::DEFAULT;
        let sp = OFFSET - 0x1000;
        assert!(config.allows_stack_growth(sp - 32, sp));
        assert!(!config.allows_stack_growth(sp - 33, sp));
        // Accesses above the stack pointer are fine as long as they stay in user space.
        assert!(config.allows_stack_growth(sp + 8, sp));
        assert!(!config.allows_stack_growth(OFFSET, sp));
    }

    #[test]
    fn test_stack_growth_is_bounded() {
        let config = VmConfig::DEFAULT.with_max_stack_size(0x2000);
        let floor = config.stack_floor();
        assert!(config.allows_stack_growth(floor, floor));
        assert!(!config.allows_stack_growth(floor - 1, floor));
    }
}
