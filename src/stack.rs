//! The two stacks owned by a VM thread.
//!
//! Both have a fixed capacity chosen when the thread is created; exceeding it
//! traps. Slot types are never checked here: the bytecode was validated when
//! it was translated, so every pop knows statically what it is reading.

use crate::trap::{Result, Trap};
use crate::types::Value;

/// Default value stack: 512 KiB of 8-byte slots.
pub const DEFAULT_VALUE_STACK_SIZE: usize = 512 * 1024 / std::mem::size_of::<Value>();
/// Default call stack depth.
pub const DEFAULT_CALL_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct ValueStack {
    data: Vec<Value>,
    limit: usize,
}

impl ValueStack {
    pub fn new(limit: usize) -> Self {
        ValueStack {
            data: Vec::with_capacity(limit.min(4096)),
            limit,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.data.len() >= self.limit {
            return Err(Trap::ValueStackExhausted);
        }
        self.data.push(value);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.data.pop().unwrap_or_default()
    }

    #[inline]
    pub fn top(&self) -> Value {
        self.data.last().copied().unwrap_or_default()
    }

    /// Slot `depth` counted from the top, where depth 1 is the top slot.
    #[inline]
    pub fn pick(&self, depth: u32) -> Value {
        let index = self.data.len().wrapping_sub(depth as usize);
        self.data.get(index).copied().unwrap_or_default()
    }

    #[inline]
    pub fn set(&mut self, depth: u32, value: Value) {
        let index = self.data.len().wrapping_sub(depth as usize);
        if let Some(slot) = self.data.get_mut(index) {
            *slot = value;
        }
    }

    /// Pushes `count` zeroed slots.
    pub fn alloca(&mut self, count: u32) -> Result<()> {
        let new_len = self.data.len() + count as usize;
        if new_len > self.limit {
            return Err(Trap::ValueStackExhausted);
        }
        self.data.resize(new_len, Value::default());
        Ok(())
    }

    /// Removes `drop` slots beneath the top `keep` slots.
    #[inline]
    pub fn drop_keep(&mut self, drop: u32, keep: u32) {
        let (drop, keep) = (drop as usize, keep as usize);
        let len = self.data.len();
        if drop == 0 || drop + keep > len {
            return;
        }
        if keep > 0 {
            self.data.copy_within(len - keep..len, len - keep - drop);
        }
        self.data.truncate(len - drop);
    }

    /// The top `count` slots, bottom first.
    pub fn top_slice(&self, count: usize) -> &[Value] {
        &self.data[self.data.len().saturating_sub(count)..]
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

/// Return addresses into the istream.
#[derive(Debug)]
pub struct CallStack {
    data: Vec<u32>,
    limit: usize,
}

impl CallStack {
    pub fn new(limit: usize) -> Self {
        CallStack {
            data: Vec::with_capacity(limit.min(1024)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    #[inline]
    pub fn push(&mut self, return_pc: u32) -> Result<()> {
        if self.data.len() >= self.limit {
            return Err(Trap::CallStackExhausted);
        }
        self.data.push(return_pc);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Option<u32> {
        self.data.pop()
    }
}
