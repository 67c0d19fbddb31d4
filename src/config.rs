//! Runtime options.

use crate::stack::{DEFAULT_CALL_STACK_SIZE, DEFAULT_VALUE_STACK_SIZE};

/// Stack capacities of a [`crate::Thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadOptions {
    /// Value stack capacity in slots.
    pub value_stack_size: usize,
    /// Call stack capacity in frames.
    pub call_stack_size: usize,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        ThreadOptions {
            value_stack_size: DEFAULT_VALUE_STACK_SIZE,
            call_stack_size: DEFAULT_CALL_STACK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub thread: ThreadOptions,
    /// Instructions run per call into the thread before control returns to
    /// the executor loop.
    pub quantum: u32,
    /// Log every executed instruction at `trace` level.
    pub trace: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            thread: ThreadOptions::default(),
            quantum: 1000,
            trace: false,
        }
    }
}
