use crate::trap::{Result, Trap};
use crate::types::Limits;

/// Wasm page size.
pub const PAGE_SIZE: u64 = 65_536;
/// Implicit page maximum when the limits declare none.
pub const MAX_PAGES: u64 = 65_536;

/// Linear memory.
///
/// Backed by a Vec<u8>; growth reallocates and zero-fills, keeping the
/// existing contents.
#[derive(Debug, Clone)]
pub struct Memory {
    data: Vec<u8>,
    limits: Limits,
}

impl Memory {
    pub fn new(limits: Limits) -> Self {
        Memory {
            data: vec![0u8; (limits.initial * PAGE_SIZE) as usize],
            limits,
        }
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Current size in pages.
    pub fn pages(&self) -> u32 {
        (self.data.len() as u64 / PAGE_SIZE) as u32
    }

    /// Declared limits; `initial` tracks the current page count.
    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Grow by `delta` pages. Returns the old page count, or `None` without
    /// touching the memory when the maximum or the 32-bit address space
    /// would be exceeded.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old_pages = self.pages();
        let new_pages = old_pages as u64 + delta as u64;
        let max_pages = self.limits.max.unwrap_or(MAX_PAGES);
        if new_pages > max_pages || new_pages * PAGE_SIZE > u32::MAX as u64 {
            return None;
        }
        self.data.resize((new_pages * PAGE_SIZE) as usize, 0);
        self.limits.initial = new_pages;
        Some(old_pages)
    }

    fn check(&self, addr: u64, len: u64) -> Result<usize> {
        match addr.checked_add(len) {
            Some(end) if end <= self.data.len() as u64 => Ok(addr as usize),
            _ => Err(Trap::MemoryAccessOutOfBounds),
        }
    }

    // ── Access ───────────────────────────────────────────────────────────────

    /// Reads `N` bytes at the effective address `addr` (base + offset,
    /// computed in 64 bits by the caller).
    #[inline]
    pub fn load<const N: usize>(&self, addr: u64) -> Result<[u8; N]> {
        let start = self.check(addr, N as u64)?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.data[start..start + N]);
        Ok(bytes)
    }

    #[inline]
    pub fn store<const N: usize>(&mut self, addr: u64, bytes: [u8; N]) -> Result<()> {
        let start = self.check(addr, N as u64)?;
        self.data[start..start + N].copy_from_slice(&bytes);
        Ok(())
    }

    /// Like [`Memory::load`] but the address must also be a multiple of `N`.
    #[inline]
    pub fn atomic_load<const N: usize>(&self, addr: u64) -> Result<[u8; N]> {
        let bytes = self.load::<N>(addr)?;
        if addr % N as u64 != 0 {
            return Err(Trap::AtomicMemoryAccessUnaligned);
        }
        Ok(bytes)
    }

    #[inline]
    pub fn atomic_store<const N: usize>(&mut self, addr: u64, bytes: [u8; N]) -> Result<()> {
        self.check(addr, N as u64)?;
        if addr % N as u64 != 0 {
            return Err(Trap::AtomicMemoryAccessUnaligned);
        }
        self.store(addr, bytes)
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let start = self.check(addr, bytes.len() as u64)?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
