//! Operand-stack type checker for structured control flow.
//!
//! Runs in lock-step with translation: each instruction event pops its
//! operand types and pushes its result types against a symbolic stack that is
//! partitioned by the label stack. After an unconditional transfer the top
//! label becomes unreachable and pops below its limit yield [`StackType::Any`].

use std::fmt;

use crate::ir::Opcode;
use crate::trap::TranslateError;
use crate::types::{FuncSignature, ValType};

pub type Result<T> = std::result::Result<T, TranslateError>;

/// A slot of the symbolic operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackType {
    Val(ValType),
    /// Unconstrained slot produced by popping through unreachable code.
    Any,
}

impl From<ValType> for StackType {
    fn from(ty: ValType) -> Self {
        StackType::Val(ty)
    }
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackType::Val(ty) => f.write_str(ty.name()),
            StackType::Any => f.write_str("any"),
        }
    }
}

fn matches(actual: StackType, expected: StackType) -> bool {
    actual == expected || actual == StackType::Any || expected == StackType::Any
}

fn type_list<T: fmt::Display>(types: &[T]) -> String {
    let items: Vec<String> = types.iter().map(|t| t.to_string()).collect();
    format!("[{}]", items.join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Func,
    Block,
    Loop,
    If,
    Else,
}

impl LabelKind {
    fn name(self) -> &'static str {
        match self {
            LabelKind::Func => "function",
            LabelKind::Block => "block",
            LabelKind::Loop => "loop",
            LabelKind::If => "if",
            LabelKind::Else => "if false branch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Label {
    pub kind: LabelKind,
    pub sig: Vec<ValType>,
    pub type_stack_limit: usize,
    pub unreachable: bool,
}

impl Label {
    /// Values a branch to this label carries. A loop is re-entered at its
    /// head, which takes no values.
    pub fn branch_sig(&self) -> &[ValType] {
        if self.kind == LabelKind::Loop {
            &[]
        } else {
            &self.sig
        }
    }
}

#[derive(Debug, Default)]
pub struct TypeChecker {
    type_stack: Vec<StackType>,
    label_stack: Vec<Label>,
    br_table_sig: Option<Vec<ValType>>,
}

impl TypeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn type_stack_len(&self) -> usize {
        self.type_stack.len()
    }

    pub fn type_stack(&self) -> &[StackType] {
        &self.type_stack
    }

    pub fn label_count(&self) -> usize {
        self.label_stack.len()
    }

    /// Whether the innermost label is in dead code.
    pub fn is_unreachable(&self) -> bool {
        self.label_stack.last().is_some_and(|l| l.unreachable)
    }

    /// Label `depth` levels out from the innermost one.
    pub fn label(&self, depth: u32) -> Result<&Label> {
        let len = self.label_stack.len();
        let depth = depth as usize;
        if depth >= len {
            return Err(TranslateError::new(format!(
                "invalid depth: {depth} (max {})",
                len as i64 - 1
            )));
        }
        Ok(&self.label_stack[len - depth - 1])
    }

    fn top_label(&self) -> Result<&Label> {
        self.label(0)
    }

    fn top_label_mut(&mut self) -> Result<&mut Label> {
        self.label_stack
            .last_mut()
            .ok_or_else(|| TranslateError::new("invalid depth: 0 (max -1)"))
    }

    // ── Stack primitives ─────────────────────────────────────────────────────

    fn limit(&self) -> usize {
        self.label_stack.last().map_or(0, |l| l.type_stack_limit)
    }

    fn peek(&self, depth: usize) -> Option<StackType> {
        let limit = self.limit();
        if limit + depth >= self.type_stack.len() {
            if self.is_unreachable() {
                Some(StackType::Any)
            } else {
                None
            }
        } else {
            Some(self.type_stack[self.type_stack.len() - depth - 1])
        }
    }

    fn peek_matches(&self, depth: usize, expected: StackType) -> bool {
        self.peek(depth).is_some_and(|actual| matches(actual, expected))
    }

    fn mismatch(&self, desc: &str, expected: &[StackType]) -> TranslateError {
        let max_depth = self.type_stack.len() - self.limit().min(self.type_stack.len());
        let depth = if expected.is_empty() {
            max_depth.min(4)
        } else {
            expected.len().min(max_depth)
        };
        let actual = &self.type_stack[self.type_stack.len() - depth..];
        let ellipsis = if depth < max_depth { "... " } else { "" };
        TranslateError::new(format!(
            "type mismatch in {desc}, expected {} but got {ellipsis}{}.",
            type_list(expected),
            type_list(actual)
        ))
    }

    fn drop_types(&mut self, count: usize) {
        let limit = self.limit();
        let keep = self.type_stack.len().saturating_sub(count).max(limit);
        self.type_stack.truncate(keep);
    }

    fn push(&mut self, ty: ValType) {
        self.type_stack.push(StackType::Val(ty));
    }

    fn push_types(&mut self, types: &[ValType]) {
        self.type_stack.extend(types.iter().map(|&t| StackType::Val(t)));
    }

    fn check_top(&self, expected: &[ValType], desc: &str) -> Result<()> {
        let ok = expected
            .iter()
            .rev()
            .enumerate()
            .all(|(depth, &ty)| self.peek_matches(depth, ty.into()));
        if ok {
            Ok(())
        } else {
            let expected: Vec<StackType> = expected.iter().map(|&t| t.into()).collect();
            Err(self.mismatch(desc, &expected))
        }
    }

    fn pop_and_check(&mut self, expected: &[ValType], desc: &str) -> Result<()> {
        self.check_top(expected, desc)?;
        self.drop_types(expected.len());
        Ok(())
    }

    /// The values above the label's limit must be exactly `sig`.
    fn check_exact(&self, sig: &[ValType], desc: &str) -> Result<()> {
        let height = self.type_stack.len() - self.limit();
        let height_ok = if self.is_unreachable() {
            height <= sig.len()
        } else {
            height == sig.len()
        };
        if height_ok {
            self.check_top(sig, desc)
        } else {
            let expected: Vec<StackType> = sig.iter().map(|&t| t.into()).collect();
            Err(self.mismatch(desc, &expected))
        }
    }

    fn push_label(&mut self, kind: LabelKind, sig: &[ValType]) {
        self.label_stack.push(Label {
            kind,
            sig: sig.to_vec(),
            type_stack_limit: self.type_stack.len(),
            unreachable: false,
        });
    }

    fn set_unreachable(&mut self) -> Result<()> {
        let label = self.top_label_mut()?;
        label.unreachable = true;
        let limit = label.type_stack_limit;
        self.type_stack.truncate(limit);
        Ok(())
    }

    // ── Structure ────────────────────────────────────────────────────────────

    pub fn begin_function(&mut self, results: &[ValType]) {
        self.type_stack.clear();
        self.label_stack.clear();
        self.br_table_sig = None;
        self.push_label(LabelKind::Func, results);
    }

    pub fn end_function(&mut self) -> Result<()> {
        let label = self.top_label()?;
        if label.kind != LabelKind::Func || self.label_stack.len() != 1 {
            return Err(TranslateError::new(format!(
                "unexpected end of function, {} is still open",
                label.kind.name()
            )));
        }
        let sig = label.sig.clone();
        self.check_exact(&sig, "implicit return")?;
        self.label_stack.clear();
        self.type_stack.clear();
        Ok(())
    }

    pub fn on_block(&mut self, sig: &[ValType]) {
        self.push_label(LabelKind::Block, sig);
    }

    pub fn on_loop(&mut self, sig: &[ValType]) {
        self.push_label(LabelKind::Loop, sig);
    }

    pub fn on_if(&mut self, sig: &[ValType]) -> Result<()> {
        self.pop_and_check(&[ValType::I32], "if")?;
        self.push_label(LabelKind::If, sig);
        Ok(())
    }

    pub fn on_else(&mut self) -> Result<()> {
        let label = self.top_label()?;
        if label.kind != LabelKind::If {
            return Err(TranslateError::new(format!(
                "unexpected else, expected if but got {}",
                label.kind.name()
            )));
        }
        let sig = label.sig.clone();
        self.check_exact(&sig, "if true branch")?;
        let label = self.top_label_mut()?;
        label.kind = LabelKind::Else;
        label.unreachable = false;
        let limit = label.type_stack_limit;
        self.type_stack.truncate(limit);
        Ok(())
    }

    pub fn on_end(&mut self) -> Result<()> {
        let label = self.top_label()?;
        if label.kind == LabelKind::Func {
            return Err(TranslateError::new("end of function must use end_function"));
        }
        if label.kind == LabelKind::If && !label.sig.is_empty() {
            return Err(TranslateError::new("if without else cannot have type signature."));
        }
        let (sig, limit, desc) = (label.sig.clone(), label.type_stack_limit, label.kind.name());
        self.check_exact(&sig, desc)?;
        self.type_stack.truncate(limit);
        self.label_stack.pop();
        self.push_types(&sig);
        Ok(())
    }

    // ── Branches ─────────────────────────────────────────────────────────────

    pub fn on_br(&mut self, depth: u32) -> Result<()> {
        let sig = self.label(depth)?.branch_sig().to_vec();
        self.pop_and_check(&sig, "br")?;
        self.set_unreachable()
    }

    pub fn on_br_if(&mut self, depth: u32) -> Result<()> {
        self.pop_and_check(&[ValType::I32], "br_if")?;
        let sig = self.label(depth)?.branch_sig().to_vec();
        self.pop_and_check(&sig, "br_if")?;
        self.push_types(&sig);
        Ok(())
    }

    pub fn begin_br_table(&mut self) -> Result<()> {
        self.br_table_sig = None;
        self.pop_and_check(&[ValType::I32], "br_table")
    }

    pub fn on_br_table_target(&mut self, depth: u32) -> Result<()> {
        let sig = self.label(depth)?.branch_sig().to_vec();
        if let Some(expected) = &self.br_table_sig {
            if *expected != sig {
                return Err(TranslateError::new(format!(
                    "br_table labels have inconsistent types: expected {}, got {}",
                    type_list(expected),
                    type_list(&sig)
                )));
            }
        }
        self.check_top(&sig, "br_table")?;
        self.br_table_sig = Some(sig);
        Ok(())
    }

    pub fn end_br_table(&mut self) -> Result<()> {
        self.br_table_sig = None;
        self.set_unreachable()
    }

    pub fn on_return(&mut self) -> Result<()> {
        let sig = self
            .label_stack
            .first()
            .map(|l| l.sig.clone())
            .ok_or_else(|| TranslateError::new("return outside of a function"))?;
        self.pop_and_check(&sig, "return")?;
        self.set_unreachable()
    }

    pub fn on_unreachable(&mut self) -> Result<()> {
        self.set_unreachable()
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    pub fn on_call(&mut self, sig: &FuncSignature) -> Result<()> {
        self.pop_and_check(&sig.params, "call")?;
        self.push_types(&sig.results);
        Ok(())
    }

    pub fn on_call_indirect(&mut self, sig: &FuncSignature) -> Result<()> {
        self.pop_and_check(&[ValType::I32], "call_indirect")?;
        self.pop_and_check(&sig.params, "call_indirect")?;
        self.push_types(&sig.results);
        Ok(())
    }

    // ── Parametric ───────────────────────────────────────────────────────────

    pub fn on_drop(&mut self) -> Result<()> {
        if self.peek(0).is_none() {
            return Err(self.mismatch("drop", &[StackType::Any]));
        }
        self.drop_types(1);
        Ok(())
    }

    pub fn on_select(&mut self) -> Result<()> {
        let first = self.peek(1).unwrap_or(StackType::Any);
        let second = self.peek(2).unwrap_or(StackType::Any);
        let ty = if first == StackType::Any { second } else { first };
        let ok = self.peek_matches(0, ValType::I32.into())
            && self.peek_matches(1, ty)
            && self.peek_matches(2, ty);
        if !ok {
            return Err(self.mismatch("select", &[ty, ty, StackType::Val(ValType::I32)]));
        }
        self.drop_types(3);
        self.type_stack.push(ty);
        Ok(())
    }

    // ── Variables and constants ──────────────────────────────────────────────

    pub fn on_const(&mut self, ty: ValType) {
        self.push(ty);
    }

    pub fn on_local_get(&mut self, ty: ValType) {
        self.push(ty);
    }

    pub fn on_local_set(&mut self, ty: ValType) -> Result<()> {
        self.pop_and_check(&[ty], "local.set")
    }

    pub fn on_local_tee(&mut self, ty: ValType) -> Result<()> {
        self.pop_and_check(&[ty], "local.tee")?;
        self.push(ty);
        Ok(())
    }

    pub fn on_global_get(&mut self, ty: ValType) {
        self.push(ty);
    }

    pub fn on_global_set(&mut self, ty: ValType) -> Result<()> {
        self.pop_and_check(&[ty], "global.set")
    }

    /// Any instruction whose stack effect is fully described by its opcode
    /// row: numeric ops, loads, stores, atomics, `memory.size`/`memory.grow`.
    pub fn on_opcode(&mut self, op: Opcode) -> Result<()> {
        self.pop_and_check(op.param_types(), op.name())?;
        if let Some(ty) = op.result_type() {
            self.push(ty);
        }
        Ok(())
    }
}
