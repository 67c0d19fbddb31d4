//! Istream emission and branch fixups.
//!
//! Forward branches are emitted with [`INVALID_OFFSET`] as their target and
//! the operand position is remembered; the position is patched once the
//! target offset becomes known (at the label's `end`, or at a function's
//! body start for calls).

use crate::ir::Opcode;

/// Placeholder for a not-yet-known istream offset.
pub const INVALID_OFFSET: u32 = u32::MAX;

/// Size of one `br_table` entry: target offset, drop count, keep count.
pub const BR_TABLE_ENTRY_SIZE: u32 = 12;

/// Byte size of a `br_table` entry block with `num_targets` targets plus the
/// default, or `None` if it does not fit an operand.
pub fn br_table_data_size(num_targets: u32) -> Option<u32> {
    num_targets.checked_add(1)?.checked_mul(BR_TABLE_ENTRY_SIZE)
}

/// Istream offset of the `br_table` entry selected by `key`.
pub fn br_table_entry_offset(table: u32, key: u32) -> Option<usize> {
    (key as usize)
        .checked_mul(BR_TABLE_ENTRY_SIZE as usize)?
        .checked_add(table as usize)
}

/// The byte buffer holding every translated function body.
#[derive(Debug, Default, Clone)]
pub struct Istream {
    data: Vec<u8>,
}

impl Istream {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current write position.
    pub fn offset(&self) -> u32 {
        self.data.len() as u32
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub(crate) fn emit_opcode(&mut self, op: Opcode) {
        op.encode(&mut self.data);
    }

    pub(crate) fn emit_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn emit_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrites a previously emitted u32 operand.
    pub(crate) fn emit_u32_at(&mut self, offset: u32, value: u32) {
        let at = offset as usize;
        if let Some(slot) = self.data.get_mut(at..at + 4) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Codegen view of a structured-control label.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodeLabel {
    /// Branch target, known up front only for loops.
    pub offset: u32,
    /// Operand of the pending `br_unless`/`br` emitted by `if`/`else`.
    pub fixup_offset: u32,
}

/// Label stack and pending fixups for the function being translated.
#[derive(Debug, Default)]
pub(crate) struct CodeGen {
    labels: Vec<CodeLabel>,
    /// Indexed by absolute label depth (0 = function label).
    depth_fixups: Vec<Vec<u32>>,
    /// Indexed by module-local defined function index.
    func_fixups: Vec<Vec<u32>>,
}

impl CodeGen {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Labels ───────────────────────────────────────────────────────────────

    pub fn push_label(&mut self, offset: u32, fixup_offset: u32) {
        self.labels.push(CodeLabel { offset, fixup_offset });
    }

    pub fn pop_label(&mut self) {
        self.labels.pop();
        self.depth_fixups.truncate(self.labels.len());
    }

    pub fn reset_labels(&mut self) {
        self.labels.clear();
        self.depth_fixups.clear();
    }

    pub fn top_label(&self) -> Option<CodeLabel> {
        self.labels.last().copied()
    }

    pub fn set_top_fixup_offset(&mut self, fixup_offset: u32) {
        if let Some(label) = self.labels.last_mut() {
            label.fixup_offset = fixup_offset;
        }
    }

    fn absolute_depth(&self, depth: u32) -> Option<usize> {
        self.labels.len().checked_sub(depth as usize + 1)
    }

    /// Patches every pending branch to the innermost label with the current
    /// offset.
    pub fn fixup_top_label(&mut self, istream: &mut Istream) {
        let Some(top) = self.labels.len().checked_sub(1) else {
            return;
        };
        let target = istream.offset();
        if let Some(fixups) = self.depth_fixups.get_mut(top) {
            for at in fixups.drain(..) {
                istream.emit_u32_at(at, target);
            }
        }
    }

    // ── Branches ─────────────────────────────────────────────────────────────

    /// Emits the target operand of a branch to label `depth`.
    pub fn emit_br_offset(&mut self, istream: &mut Istream, depth: u32) {
        let Some(absolute) = self.absolute_depth(depth) else {
            istream.emit_u32(INVALID_OFFSET);
            return;
        };
        let offset = self.labels[absolute].offset;
        if offset == INVALID_OFFSET {
            if self.depth_fixups.len() <= absolute {
                self.depth_fixups.resize_with(absolute + 1, Vec::new);
            }
            self.depth_fixups[absolute].push(istream.offset());
        }
        istream.emit_u32(offset);
    }

    pub fn emit_drop_keep(&self, istream: &mut Istream, drop: u32, keep: u32) {
        if drop == 1 && keep == 0 {
            istream.emit_opcode(Opcode::Drop);
        } else if drop > 0 {
            istream.emit_opcode(Opcode::DropKeep);
            istream.emit_u32(drop);
            istream.emit_u32(keep);
        }
    }

    pub fn emit_br(&mut self, istream: &mut Istream, depth: u32, drop: u32, keep: u32) {
        self.emit_drop_keep(istream, drop, keep);
        istream.emit_opcode(Opcode::Br);
        self.emit_br_offset(istream, depth);
    }

    pub fn emit_br_table_entry(&mut self, istream: &mut Istream, depth: u32, drop: u32, keep: u32) {
        self.emit_br_offset(istream, depth);
        istream.emit_u32(drop);
        istream.emit_u32(keep);
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    pub fn add_func(&mut self) {
        self.func_fixups.push(Vec::new());
    }

    /// Emits a call target for a function of this module whose body has not
    /// been translated yet.
    pub fn emit_func_fixup(&mut self, istream: &mut Istream, defined_index: usize) {
        if let Some(fixups) = self.func_fixups.get_mut(defined_index) {
            fixups.push(istream.offset());
        }
        istream.emit_u32(INVALID_OFFSET);
    }

    pub fn resolve_func_fixups(&mut self, istream: &mut Istream, defined_index: usize, offset: u32) {
        if let Some(fixups) = self.func_fixups.get_mut(defined_index) {
            for at in fixups.drain(..) {
                istream.emit_u32_at(at, offset);
            }
        }
    }
}
