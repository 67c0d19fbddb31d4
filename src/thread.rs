//! Bytecode interpreter.
//!
//! A [`Thread`] owns a value stack, a call stack and a program counter into
//! the environment's istream. [`Thread::run`] executes up to `quantum`
//! instructions and reports whether the outermost function returned.
//!
//! Stack slots are untagged; every instruction knows statically which
//! representation it reads because the stream was type-checked when it was
//! emitted.

use tracing::warn;

use crate::compiler::codegen::br_table_entry_offset;
use crate::config::ThreadOptions;
use crate::env::{Environment, Func};
use crate::ir::Opcode;
use crate::numeric::{self, f32_bits, f64_bits};
use crate::stack::{CallStack, ValueStack};
use crate::trap::{Result, Trap};
use crate::types::{FuncSignature, Val, Value};

/// Outcome of a [`Thread::run`] slice that did not trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The quantum ran out with work remaining.
    Running,
    /// A `return` executed with an empty call stack.
    Returned,
}

#[inline]
fn read_u32(code: &[u8], pc: &mut usize) -> u32 {
    let mut bytes = [0u8; 4];
    if let Some(src) = code.get(*pc..*pc + 4) {
        bytes.copy_from_slice(src);
    }
    *pc += 4;
    u32::from_le_bytes(bytes)
}

#[inline]
fn read_u64(code: &[u8], pc: &mut usize) -> u64 {
    let mut bytes = [0u8; 8];
    if let Some(src) = code.get(*pc..*pc + 8) {
        bytes.copy_from_slice(src);
    }
    *pc += 8;
    u64::from_le_bytes(bytes)
}

/// Invokes host function `func_index` with arguments taken from the top of
/// `stack`, replacing them with its results.
pub(crate) fn call_host(stack: &mut ValueStack, funcs: &[Func], sigs: &[FuncSignature], func_index: u32) -> Result<()> {
    let Some(Func::Host(host)) = funcs.get(func_index as usize) else {
        return Err(Trap::Unreachable);
    };
    let sig = &sigs[host.sig_index as usize];
    let arg_count = sig.params.len();
    let args: Vec<Val> = sig
        .params
        .iter()
        .zip(stack.top_slice(arg_count))
        .map(|(&ty, &value)| Val::from_value(ty, value))
        .collect();
    stack.truncate(stack.len() - args.len());

    let results = (host.callback)(&args).map_err(|err| {
        warn!(
            module = %host.module_name,
            field = %host.field_name,
            error = %err,
            "host function trapped"
        );
        Trap::HostTrapped
    })?;
    let types_match = results.len() == sig.results.len()
        && results.iter().zip(&sig.results).all(|(r, &ty)| r.ty() == ty);
    if !types_match {
        return Err(Trap::HostResultTypeMismatch);
    }
    for result in results {
        stack.push(result.to_value())?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct Thread {
    value_stack: ValueStack,
    call_stack: CallStack,
    pc: u32,
}

impl Default for Thread {
    fn default() -> Self {
        Thread::new(ThreadOptions::default())
    }
}

impl Thread {
    pub fn new(options: ThreadOptions) -> Self {
        Thread {
            value_stack: ValueStack::new(options.value_stack_size),
            call_stack: CallStack::new(options.call_stack_size),
            pc: 0,
        }
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn value_stack(&self) -> &ValueStack {
        &self.value_stack
    }

    pub(crate) fn value_stack_mut(&mut self) -> &mut ValueStack {
        &mut self.value_stack
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        self.value_stack.push(value)
    }

    pub fn pop(&mut self) -> Value {
        self.value_stack.pop()
    }

    /// Empties both stacks.
    pub fn reset(&mut self) {
        self.value_stack.clear();
        self.call_stack.clear();
        self.pc = 0;
    }

    /// Opcode at the current pc, if any.
    pub fn current_opcode(&self, env: &Environment) -> Option<Opcode> {
        let mut pc = self.pc as usize;
        Opcode::decode(env.istream(), &mut pc)
    }

    /// Executes at most `quantum` instructions starting at the current pc.
    pub fn run(&mut self, env: &mut Environment, quantum: u32) -> Result<RunState> {
        let mut pc = self.pc as usize;
        let outcome = self.execute(env, &mut pc, quantum);
        self.pc = pc as u32;
        outcome
    }

    fn execute(&mut self, env: &mut Environment, pc: &mut usize, quantum: u32) -> Result<RunState> {
        let Environment {
            istream,
            memories,
            tables,
            globals,
            funcs,
            sigs,
            ..
        } = env;
        let code = istream.data();
        let (tables, funcs, sigs) = (&*tables, &*funcs, &*sigs);
        let vs = &mut self.value_stack;
        let cs = &mut self.call_stack;

        // ── Stack helpers ────────────────────────────────────────────────────
        macro_rules! push {
            ($ctor:ident, $v:expr) => {
                vs.push(Value::$ctor($v))?
            };
        }
        macro_rules! unop {
            ($pop:ident, $ctor:ident, |$a:ident| $e:expr) => {{
                let $a = vs.pop().$pop();
                push!($ctor, $e);
            }};
        }
        macro_rules! binop {
            ($pop:ident, $ctor:ident, |$a:ident, $b:ident| $e:expr) => {{
                let $b = vs.pop().$pop();
                let $a = vs.pop().$pop();
                push!($ctor, $e);
            }};
        }
        macro_rules! cmp {
            ($pop:ident, |$a:ident, $b:ident| $e:expr) => {
                binop!($pop, from_u32, |$a, $b| ($e) as u32)
            };
        }

        // ── Memory helpers ───────────────────────────────────────────────────
        macro_rules! effective_addr {
            () => {{
                let memory_index = read_u32(code, pc) as usize;
                let offset = read_u32(code, pc) as u64;
                (memory_index, offset)
            }};
        }
        macro_rules! load {
            ($load:ident, $n:literal, $ctor:ident, |$b:ident| $e:expr) => {{
                let (memory_index, offset) = effective_addr!();
                let addr = vs.pop().u32() as u64 + offset;
                let $b: [u8; $n] = memories[memory_index].$load(addr)?;
                push!($ctor, $e);
            }};
        }
        macro_rules! store {
            ($store:ident, $pop:ident, |$v:ident| $e:expr) => {{
                let (memory_index, offset) = effective_addr!();
                let $v = vs.pop().$pop();
                let addr = vs.pop().u32() as u64 + offset;
                memories[memory_index].$store(addr, $e)?;
            }};
        }
        macro_rules! rmw {
            ($int:ty, $pop:ident, $ctor:ident, |$old:ident, $v:ident| $e:expr) => {{
                let (memory_index, offset) = effective_addr!();
                let $v = vs.pop().$pop();
                let addr = vs.pop().u32() as u64 + offset;
                let memory = &mut memories[memory_index];
                let $old = <$int>::from_le_bytes(memory.atomic_load(addr)?);
                memory.atomic_store(addr, ($e).to_le_bytes())?;
                push!($ctor, $old);
            }};
        }
        macro_rules! cmpxchg {
            ($int:ty, $pop:ident, $ctor:ident) => {{
                let (memory_index, offset) = effective_addr!();
                let replacement = vs.pop().$pop();
                let expected = vs.pop().$pop();
                let addr = vs.pop().u32() as u64 + offset;
                let memory = &mut memories[memory_index];
                let old = <$int>::from_le_bytes(memory.atomic_load(addr)?);
                if old == expected {
                    memory.atomic_store(addr, replacement.to_le_bytes())?;
                }
                push!($ctor, old);
            }};
        }

        for _ in 0..quantum {
            let Some(op) = Opcode::decode(code, pc) else {
                return Err(Trap::Unreachable);
            };
            match op {
                // ── Control ──────────────────────────────────────────────────
                Opcode::Unreachable => return Err(Trap::Unreachable),
                Opcode::Nop => {}
                Opcode::Br => *pc = read_u32(code, pc) as usize,
                Opcode::BrUnless => {
                    let target = read_u32(code, pc);
                    if vs.pop().u32() == 0 {
                        *pc = target as usize;
                    }
                }
                Opcode::BrTable => {
                    let num_targets = read_u32(code, pc);
                    let table = read_u32(code, pc);
                    let key = vs.pop().u32().min(num_targets);
                    let mut entry = br_table_entry_offset(table, key).ok_or(Trap::Unreachable)?;
                    let target = read_u32(code, &mut entry);
                    let drop = read_u32(code, &mut entry);
                    let keep = read_u32(code, &mut entry);
                    vs.drop_keep(drop, keep);
                    *pc = target as usize;
                }
                Opcode::Data => {
                    let size = read_u32(code, pc) as usize;
                    *pc += size;
                }
                Opcode::Return => match cs.pop() {
                    Some(return_pc) => *pc = return_pc as usize,
                    None => return Ok(RunState::Returned),
                },
                Opcode::Call => {
                    let target = read_u32(code, pc);
                    cs.push(*pc as u32)?;
                    *pc = target as usize;
                }
                Opcode::CallHost => {
                    let func_index = read_u32(code, pc);
                    call_host(vs, funcs, sigs, func_index)?;
                }
                Opcode::CallIndirect => {
                    let table_index = read_u32(code, pc) as usize;
                    let sig_index = read_u32(code, pc) as usize;
                    let entry = vs.pop().u32() as usize;
                    let table = &tables[table_index];
                    let func_index = table
                        .elements
                        .get(entry)
                        .ok_or(Trap::UndefinedTableIndex)?
                        .ok_or(Trap::UninitializedTableElement)?;
                    let func = &funcs[func_index as usize];
                    let func_sig = func.sig_index() as usize;
                    if func_sig != sig_index && sigs[func_sig] != sigs[sig_index] {
                        return Err(Trap::IndirectCallSignatureMismatch);
                    }
                    match func {
                        Func::Defined(defined) => {
                            cs.push(*pc as u32)?;
                            *pc = defined.offset.ok_or(Trap::Unreachable)? as usize;
                        }
                        Func::Host(_) => call_host(vs, funcs, sigs, func_index)?,
                    }
                }
                Opcode::Alloca => {
                    let count = read_u32(code, pc);
                    vs.alloca(count)?;
                }
                Opcode::Drop => {
                    vs.pop();
                }
                Opcode::DropKeep => {
                    let drop = read_u32(code, pc);
                    let keep = read_u32(code, pc);
                    vs.drop_keep(drop, keep);
                }
                Opcode::Select => {
                    let cond = vs.pop().u32();
                    let b = vs.pop();
                    let a = vs.pop();
                    vs.push(if cond != 0 { a } else { b })?;
                }

                // ── Variables ────────────────────────────────────────────────
                Opcode::LocalGet => {
                    let depth = read_u32(code, pc);
                    let value = vs.pick(depth);
                    vs.push(value)?;
                }
                Opcode::LocalSet => {
                    let depth = read_u32(code, pc);
                    let value = vs.pop();
                    vs.set(depth, value);
                }
                Opcode::LocalTee => {
                    let depth = read_u32(code, pc);
                    let value = vs.top();
                    vs.set(depth, value);
                }
                Opcode::GlobalGet => {
                    let index = read_u32(code, pc) as usize;
                    vs.push(globals[index].value.to_value())?;
                }
                Opcode::GlobalSet => {
                    let index = read_u32(code, pc) as usize;
                    let global = &mut globals[index];
                    global.value = Val::from_value(global.value.ty(), vs.pop());
                }

                // ── Memory ───────────────────────────────────────────────────
                Opcode::I32Load => load!(load, 4, from_u32, |b| u32::from_le_bytes(b)),
                Opcode::I64Load => load!(load, 8, from_u64, |b| u64::from_le_bytes(b)),
                Opcode::F32Load => load!(load, 4, from_u32, |b| u32::from_le_bytes(b)),
                Opcode::F64Load => load!(load, 8, from_u64, |b| u64::from_le_bytes(b)),
                Opcode::I32Load8S => load!(load, 1, from_i32, |b| b[0] as i8 as i32),
                Opcode::I32Load8U => load!(load, 1, from_u32, |b| b[0] as u32),
                Opcode::I32Load16S => load!(load, 2, from_i32, |b| i16::from_le_bytes(b) as i32),
                Opcode::I32Load16U => load!(load, 2, from_u32, |b| u16::from_le_bytes(b) as u32),
                Opcode::I64Load8S => load!(load, 1, from_i64, |b| b[0] as i8 as i64),
                Opcode::I64Load8U => load!(load, 1, from_u64, |b| b[0] as u64),
                Opcode::I64Load16S => load!(load, 2, from_i64, |b| i16::from_le_bytes(b) as i64),
                Opcode::I64Load16U => load!(load, 2, from_u64, |b| u16::from_le_bytes(b) as u64),
                Opcode::I64Load32S => load!(load, 4, from_i64, |b| i32::from_le_bytes(b) as i64),
                Opcode::I64Load32U => load!(load, 4, from_u64, |b| u32::from_le_bytes(b) as u64),
                Opcode::I32Store | Opcode::F32Store => store!(store, u32, |v| v.to_le_bytes()),
                Opcode::I64Store | Opcode::F64Store => store!(store, u64, |v| v.to_le_bytes()),
                Opcode::I32Store8 => store!(store, u32, |v| [v as u8]),
                Opcode::I32Store16 => store!(store, u32, |v| (v as u16).to_le_bytes()),
                Opcode::I64Store8 => store!(store, u64, |v| [v as u8]),
                Opcode::I64Store16 => store!(store, u64, |v| (v as u16).to_le_bytes()),
                Opcode::I64Store32 => store!(store, u64, |v| (v as u32).to_le_bytes()),
                Opcode::MemorySize => {
                    let memory_index = read_u32(code, pc) as usize;
                    push!(from_u32, memories[memory_index].pages());
                }
                Opcode::MemoryGrow => {
                    let memory_index = read_u32(code, pc) as usize;
                    let delta = vs.pop().u32();
                    let old_pages = memories[memory_index].grow(delta).unwrap_or(u32::MAX);
                    push!(from_u32, old_pages);
                }

                // ── Constants ────────────────────────────────────────────────
                Opcode::I32Const | Opcode::F32Const => push!(from_u32, read_u32(code, pc)),
                Opcode::I64Const | Opcode::F64Const => push!(from_u64, read_u64(code, pc)),

                // ── i32 ──────────────────────────────────────────────────────
                Opcode::I32Eqz => unop!(u32, from_u32, |a| (a == 0) as u32),
                Opcode::I32Eq => cmp!(u32, |a, b| a == b),
                Opcode::I32Ne => cmp!(u32, |a, b| a != b),
                Opcode::I32LtS => cmp!(i32, |a, b| a < b),
                Opcode::I32LtU => cmp!(u32, |a, b| a < b),
                Opcode::I32GtS => cmp!(i32, |a, b| a > b),
                Opcode::I32GtU => cmp!(u32, |a, b| a > b),
                Opcode::I32LeS => cmp!(i32, |a, b| a <= b),
                Opcode::I32LeU => cmp!(u32, |a, b| a <= b),
                Opcode::I32GeS => cmp!(i32, |a, b| a >= b),
                Opcode::I32GeU => cmp!(u32, |a, b| a >= b),
                Opcode::I32Clz => unop!(u32, from_u32, |a| a.leading_zeros()),
                Opcode::I32Ctz => unop!(u32, from_u32, |a| a.trailing_zeros()),
                Opcode::I32Popcnt => unop!(u32, from_u32, |a| a.count_ones()),
                Opcode::I32Add => binop!(u32, from_u32, |a, b| a.wrapping_add(b)),
                Opcode::I32Sub => binop!(u32, from_u32, |a, b| a.wrapping_sub(b)),
                Opcode::I32Mul => binop!(u32, from_u32, |a, b| a.wrapping_mul(b)),
                Opcode::I32DivS => binop!(i32, from_i32, |a, b| numeric::i32_div_s(a, b)?),
                Opcode::I32DivU => binop!(u32, from_u32, |a, b| numeric::i32_div_u(a, b)?),
                Opcode::I32RemS => binop!(i32, from_i32, |a, b| numeric::i32_rem_s(a, b)?),
                Opcode::I32RemU => binop!(u32, from_u32, |a, b| numeric::i32_rem_u(a, b)?),
                Opcode::I32And => binop!(u32, from_u32, |a, b| a & b),
                Opcode::I32Or => binop!(u32, from_u32, |a, b| a | b),
                Opcode::I32Xor => binop!(u32, from_u32, |a, b| a ^ b),
                Opcode::I32Shl => binop!(u32, from_u32, |a, b| a.wrapping_shl(b)),
                Opcode::I32ShrS => binop!(u32, from_i32, |a, b| (a as i32).wrapping_shr(b)),
                Opcode::I32ShrU => binop!(u32, from_u32, |a, b| a.wrapping_shr(b)),
                Opcode::I32Rotl => binop!(u32, from_u32, |a, b| a.rotate_left(b & 31)),
                Opcode::I32Rotr => binop!(u32, from_u32, |a, b| a.rotate_right(b & 31)),

                // ── i64 ──────────────────────────────────────────────────────
                Opcode::I64Eqz => unop!(u64, from_u32, |a| (a == 0) as u32),
                Opcode::I64Eq => cmp!(u64, |a, b| a == b),
                Opcode::I64Ne => cmp!(u64, |a, b| a != b),
                Opcode::I64LtS => cmp!(i64, |a, b| a < b),
                Opcode::I64LtU => cmp!(u64, |a, b| a < b),
                Opcode::I64GtS => cmp!(i64, |a, b| a > b),
                Opcode::I64GtU => cmp!(u64, |a, b| a > b),
                Opcode::I64LeS => cmp!(i64, |a, b| a <= b),
                Opcode::I64LeU => cmp!(u64, |a, b| a <= b),
                Opcode::I64GeS => cmp!(i64, |a, b| a >= b),
                Opcode::I64GeU => cmp!(u64, |a, b| a >= b),
                Opcode::I64Clz => unop!(u64, from_u64, |a| a.leading_zeros() as u64),
                Opcode::I64Ctz => unop!(u64, from_u64, |a| a.trailing_zeros() as u64),
                Opcode::I64Popcnt => unop!(u64, from_u64, |a| a.count_ones() as u64),
                Opcode::I64Add => binop!(u64, from_u64, |a, b| a.wrapping_add(b)),
                Opcode::I64Sub => binop!(u64, from_u64, |a, b| a.wrapping_sub(b)),
                Opcode::I64Mul => binop!(u64, from_u64, |a, b| a.wrapping_mul(b)),
                Opcode::I64DivS => binop!(i64, from_i64, |a, b| numeric::i64_div_s(a, b)?),
                Opcode::I64DivU => binop!(u64, from_u64, |a, b| numeric::i64_div_u(a, b)?),
                Opcode::I64RemS => binop!(i64, from_i64, |a, b| numeric::i64_rem_s(a, b)?),
                Opcode::I64RemU => binop!(u64, from_u64, |a, b| numeric::i64_rem_u(a, b)?),
                Opcode::I64And => binop!(u64, from_u64, |a, b| a & b),
                Opcode::I64Or => binop!(u64, from_u64, |a, b| a | b),
                Opcode::I64Xor => binop!(u64, from_u64, |a, b| a ^ b),
                Opcode::I64Shl => binop!(u64, from_u64, |a, b| a.wrapping_shl(b as u32)),
                Opcode::I64ShrS => binop!(u64, from_i64, |a, b| (a as i64).wrapping_shr(b as u32)),
                Opcode::I64ShrU => binop!(u64, from_u64, |a, b| a.wrapping_shr(b as u32)),
                Opcode::I64Rotl => binop!(u64, from_u64, |a, b| a.rotate_left((b & 63) as u32)),
                Opcode::I64Rotr => binop!(u64, from_u64, |a, b| a.rotate_right((b & 63) as u32)),

                // ── f32 ──────────────────────────────────────────────────────
                Opcode::F32Eq => cmp!(u32, |a, b| f32_bits::compare(a, b, |x, y| x == y)),
                Opcode::F32Ne => cmp!(u32, |a, b| f32_bits::compare(a, b, |x, y| x != y)),
                Opcode::F32Lt => cmp!(u32, |a, b| f32_bits::compare(a, b, |x, y| x < y)),
                Opcode::F32Gt => cmp!(u32, |a, b| f32_bits::compare(a, b, |x, y| x > y)),
                Opcode::F32Le => cmp!(u32, |a, b| f32_bits::compare(a, b, |x, y| x <= y)),
                Opcode::F32Ge => cmp!(u32, |a, b| f32_bits::compare(a, b, |x, y| x >= y)),
                Opcode::F32Abs => unop!(u32, from_u32, |a| f32_bits::abs(a)),
                Opcode::F32Neg => unop!(u32, from_u32, |a| f32_bits::neg(a)),
                Opcode::F32Ceil => unop!(u32, from_u32, |a| f32_bits::unary(a, f32::ceil)),
                Opcode::F32Floor => unop!(u32, from_u32, |a| f32_bits::unary(a, f32::floor)),
                Opcode::F32Trunc => unop!(u32, from_u32, |a| f32_bits::unary(a, f32::trunc)),
                Opcode::F32Nearest => unop!(u32, from_u32, |a| f32_bits::unary(a, f32_bits::nearest)),
                Opcode::F32Sqrt => unop!(u32, from_u32, |a| f32_bits::unary(a, f32::sqrt)),
                Opcode::F32Add => binop!(u32, from_u32, |a, b| f32_bits::binary(a, b, |x, y| x + y)),
                Opcode::F32Sub => binop!(u32, from_u32, |a, b| f32_bits::binary(a, b, |x, y| x - y)),
                Opcode::F32Mul => binop!(u32, from_u32, |a, b| f32_bits::binary(a, b, |x, y| x * y)),
                Opcode::F32Div => binop!(u32, from_u32, |a, b| f32_bits::binary(a, b, |x, y| x / y)),
                Opcode::F32Min => binop!(u32, from_u32, |a, b| f32_bits::min(a, b)),
                Opcode::F32Max => binop!(u32, from_u32, |a, b| f32_bits::max(a, b)),
                Opcode::F32Copysign => binop!(u32, from_u32, |a, b| f32_bits::copysign(a, b)),

                // ── f64 ──────────────────────────────────────────────────────
                Opcode::F64Eq => cmp!(u64, |a, b| f64_bits::compare(a, b, |x, y| x == y)),
                Opcode::F64Ne => cmp!(u64, |a, b| f64_bits::compare(a, b, |x, y| x != y)),
                Opcode::F64Lt => cmp!(u64, |a, b| f64_bits::compare(a, b, |x, y| x < y)),
                Opcode::F64Gt => cmp!(u64, |a, b| f64_bits::compare(a, b, |x, y| x > y)),
                Opcode::F64Le => cmp!(u64, |a, b| f64_bits::compare(a, b, |x, y| x <= y)),
                Opcode::F64Ge => cmp!(u64, |a, b| f64_bits::compare(a, b, |x, y| x >= y)),
                Opcode::F64Abs => unop!(u64, from_u64, |a| f64_bits::abs(a)),
                Opcode::F64Neg => unop!(u64, from_u64, |a| f64_bits::neg(a)),
                Opcode::F64Ceil => unop!(u64, from_u64, |a| f64_bits::unary(a, f64::ceil)),
                Opcode::F64Floor => unop!(u64, from_u64, |a| f64_bits::unary(a, f64::floor)),
                Opcode::F64Trunc => unop!(u64, from_u64, |a| f64_bits::unary(a, f64::trunc)),
                Opcode::F64Nearest => unop!(u64, from_u64, |a| f64_bits::unary(a, f64_bits::nearest)),
                Opcode::F64Sqrt => unop!(u64, from_u64, |a| f64_bits::unary(a, f64::sqrt)),
                Opcode::F64Add => binop!(u64, from_u64, |a, b| f64_bits::binary(a, b, |x, y| x + y)),
                Opcode::F64Sub => binop!(u64, from_u64, |a, b| f64_bits::binary(a, b, |x, y| x - y)),
                Opcode::F64Mul => binop!(u64, from_u64, |a, b| f64_bits::binary(a, b, |x, y| x * y)),
                Opcode::F64Div => binop!(u64, from_u64, |a, b| f64_bits::binary(a, b, |x, y| x / y)),
                Opcode::F64Min => binop!(u64, from_u64, |a, b| f64_bits::min(a, b)),
                Opcode::F64Max => binop!(u64, from_u64, |a, b| f64_bits::max(a, b)),
                Opcode::F64Copysign => binop!(u64, from_u64, |a, b| f64_bits::copysign(a, b)),

                // ── Conversions ──────────────────────────────────────────────
                Opcode::I32WrapI64 => unop!(u64, from_u32, |a| a as u32),
                Opcode::I32TruncF32S => unop!(u32, from_i32, |a| numeric::i32_trunc_f32_s(a)?),
                Opcode::I32TruncF32U => unop!(u32, from_u32, |a| numeric::i32_trunc_f32_u(a)?),
                Opcode::I32TruncF64S => unop!(u64, from_i32, |a| numeric::i32_trunc_f64_s(a)?),
                Opcode::I32TruncF64U => unop!(u64, from_u32, |a| numeric::i32_trunc_f64_u(a)?),
                Opcode::I64ExtendI32S => unop!(i32, from_i64, |a| a as i64),
                Opcode::I64ExtendI32U => unop!(u32, from_u64, |a| a as u64),
                Opcode::I64TruncF32S => unop!(u32, from_i64, |a| numeric::i64_trunc_f32_s(a)?),
                Opcode::I64TruncF32U => unop!(u32, from_u64, |a| numeric::i64_trunc_f32_u(a)?),
                Opcode::I64TruncF64S => unop!(u64, from_i64, |a| numeric::i64_trunc_f64_s(a)?),
                Opcode::I64TruncF64U => unop!(u64, from_u64, |a| numeric::i64_trunc_f64_u(a)?),
                Opcode::F32ConvertI32S => unop!(i32, from_u32, |a| (a as f32).to_bits()),
                Opcode::F32ConvertI32U => unop!(u32, from_u32, |a| (a as f32).to_bits()),
                Opcode::F32ConvertI64S => unop!(i64, from_u32, |a| (a as f32).to_bits()),
                Opcode::F32ConvertI64U => unop!(u64, from_u32, |a| (a as f32).to_bits()),
                Opcode::F32DemoteF64 => unop!(u64, from_u32, |a| numeric::f32_demote_f64(a)),
                Opcode::F64ConvertI32S => unop!(i32, from_u64, |a| (a as f64).to_bits()),
                Opcode::F64ConvertI32U => unop!(u32, from_u64, |a| (a as f64).to_bits()),
                Opcode::F64ConvertI64S => unop!(i64, from_u64, |a| (a as f64).to_bits()),
                Opcode::F64ConvertI64U => unop!(u64, from_u64, |a| (a as f64).to_bits()),
                Opcode::F64PromoteF32 => unop!(u32, from_u64, |a| numeric::f64_promote_f32(a)),
                // Slots are untagged, so reinterpreting is free.
                Opcode::I32ReinterpretF32
                | Opcode::I64ReinterpretF64
                | Opcode::F32ReinterpretI32
                | Opcode::F64ReinterpretI64 => {}
                Opcode::I32Extend8S => unop!(u32, from_i32, |a| a as i8 as i32),
                Opcode::I32Extend16S => unop!(u32, from_i32, |a| a as i16 as i32),
                Opcode::I64Extend8S => unop!(u64, from_i64, |a| a as i8 as i64),
                Opcode::I64Extend16S => unop!(u64, from_i64, |a| a as i16 as i64),
                Opcode::I64Extend32S => unop!(u64, from_i64, |a| a as i32 as i64),

                // `as` float-to-int casts saturate and map NaN to 0.
                Opcode::I32TruncSatF32S => unop!(u32, from_i32, |a| f32::from_bits(a) as i32),
                Opcode::I32TruncSatF32U => unop!(u32, from_u32, |a| f32::from_bits(a) as u32),
                Opcode::I32TruncSatF64S => unop!(u64, from_i32, |a| f64::from_bits(a) as i32),
                Opcode::I32TruncSatF64U => unop!(u64, from_u32, |a| f64::from_bits(a) as u32),
                Opcode::I64TruncSatF32S => unop!(u32, from_i64, |a| f32::from_bits(a) as i64),
                Opcode::I64TruncSatF32U => unop!(u32, from_u64, |a| f32::from_bits(a) as u64),
                Opcode::I64TruncSatF64S => unop!(u64, from_i64, |a| f64::from_bits(a) as i64),
                Opcode::I64TruncSatF64U => unop!(u64, from_u64, |a| f64::from_bits(a) as u64),

                // ── Atomics ──────────────────────────────────────────────────
                Opcode::I32AtomicLoad => load!(atomic_load, 4, from_u32, |b| u32::from_le_bytes(b)),
                Opcode::I64AtomicLoad => load!(atomic_load, 8, from_u64, |b| u64::from_le_bytes(b)),
                Opcode::I32AtomicLoad8U => load!(atomic_load, 1, from_u32, |b| b[0] as u32),
                Opcode::I32AtomicLoad16U => load!(atomic_load, 2, from_u32, |b| u16::from_le_bytes(b) as u32),
                Opcode::I64AtomicLoad8U => load!(atomic_load, 1, from_u64, |b| b[0] as u64),
                Opcode::I64AtomicLoad16U => load!(atomic_load, 2, from_u64, |b| u16::from_le_bytes(b) as u64),
                Opcode::I64AtomicLoad32U => load!(atomic_load, 4, from_u64, |b| u32::from_le_bytes(b) as u64),
                Opcode::I32AtomicStore => store!(atomic_store, u32, |v| v.to_le_bytes()),
                Opcode::I64AtomicStore => store!(atomic_store, u64, |v| v.to_le_bytes()),
                Opcode::I32AtomicStore8 => store!(atomic_store, u32, |v| [v as u8]),
                Opcode::I32AtomicStore16 => store!(atomic_store, u32, |v| (v as u16).to_le_bytes()),
                Opcode::I64AtomicStore8 => store!(atomic_store, u64, |v| [v as u8]),
                Opcode::I64AtomicStore16 => store!(atomic_store, u64, |v| (v as u16).to_le_bytes()),
                Opcode::I64AtomicStore32 => store!(atomic_store, u64, |v| (v as u32).to_le_bytes()),
                Opcode::I32AtomicRmwAdd => rmw!(u32, u32, from_u32, |old, v| old.wrapping_add(v)),
                Opcode::I64AtomicRmwAdd => rmw!(u64, u64, from_u64, |old, v| old.wrapping_add(v)),
                Opcode::I32AtomicRmwSub => rmw!(u32, u32, from_u32, |old, v| old.wrapping_sub(v)),
                Opcode::I64AtomicRmwSub => rmw!(u64, u64, from_u64, |old, v| old.wrapping_sub(v)),
                Opcode::I32AtomicRmwAnd => rmw!(u32, u32, from_u32, |old, v| old & v),
                Opcode::I64AtomicRmwAnd => rmw!(u64, u64, from_u64, |old, v| old & v),
                Opcode::I32AtomicRmwOr => rmw!(u32, u32, from_u32, |old, v| old | v),
                Opcode::I64AtomicRmwOr => rmw!(u64, u64, from_u64, |old, v| old | v),
                Opcode::I32AtomicRmwXor => rmw!(u32, u32, from_u32, |old, v| old ^ v),
                Opcode::I64AtomicRmwXor => rmw!(u64, u64, from_u64, |old, v| old ^ v),
                Opcode::I32AtomicRmwXchg => rmw!(u32, u32, from_u32, |_old, v| v),
                Opcode::I64AtomicRmwXchg => rmw!(u64, u64, from_u64, |_old, v| v),
                Opcode::I32AtomicRmwCmpxchg => cmpxchg!(u32, u32, from_u32),
                Opcode::I64AtomicRmwCmpxchg => cmpxchg!(u64, u64, from_u64),

                // Structured control is lowered away by the translator.
                Opcode::Block
                | Opcode::Loop
                | Opcode::If
                | Opcode::Else
                | Opcode::End
                | Opcode::BrIf => {
                    debug_assert!(false, "{op} in translated bytecode");
                    return Err(Trap::Unreachable);
                }
            }
        }
        Ok(RunState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::Istream;
    use crate::types::ValType;

    fn env_with_code(emit: impl FnOnce(&mut Istream)) -> Environment {
        let mut env = Environment::new();
        emit(&mut env.istream);
        env
    }

    #[test]
    fn runs_until_return() {
        let mut env = env_with_code(|s| {
            s.emit_opcode(Opcode::I32Const);
            s.emit_u32(7);
            s.emit_opcode(Opcode::I32Const);
            s.emit_u32(5);
            s.emit_opcode(Opcode::I32Sub);
            s.emit_opcode(Opcode::Return);
        });
        let mut thread = Thread::default();
        assert_eq!(thread.run(&mut env, 100), Ok(RunState::Returned));
        assert_eq!(thread.pop().u32(), 2);
    }

    #[test]
    fn quantum_bounds_each_slice() {
        let mut env = env_with_code(|s| {
            s.emit_opcode(Opcode::I32Const);
            s.emit_u32(1);
            s.emit_opcode(Opcode::Drop);
            s.emit_opcode(Opcode::Return);
        });
        let mut thread = Thread::default();
        assert_eq!(thread.run(&mut env, 1), Ok(RunState::Running));
        assert_eq!(thread.value_stack().len(), 1);
        assert_eq!(thread.run(&mut env, 1), Ok(RunState::Running));
        assert_eq!(thread.run(&mut env, 1), Ok(RunState::Returned));
    }

    #[test]
    fn br_table_clamps_to_default() {
        // entries: [target 100, drop 0, keep 0], [default: target 200, drop 1, keep 1]
        let mut env = env_with_code(|s| {
            s.emit_opcode(Opcode::BrTable);
            s.emit_u32(1);
            s.emit_u32(9);
            for v in [100, 0, 0, 200, 1, 1] {
                s.emit_u32(v);
            }
        });
        let mut thread = Thread::default();
        thread.push(Value::from_u32(11)).unwrap();
        thread.push(Value::from_u32(22)).unwrap();
        thread.push(Value::from_u32(5)).unwrap();
        assert_eq!(thread.run(&mut env, 1), Ok(RunState::Running));
        assert_eq!(thread.pc(), 200);
        assert_eq!(thread.value_stack().len(), 1);
        assert_eq!(thread.pop().u32(), 22);
    }

    #[test]
    fn host_results_are_checked() {
        let mut env = Environment::new();
        let host = env.append_host_module("host", None);
        let f = env
            .append_host_func_export(
                host,
                "bad",
                FuncSignature::new(&[], &[ValType::I32]),
                Box::new(|_| Ok(vec![Val::I64(1)])),
            )
            .unwrap();
        let mut stack = ValueStack::new(8);
        assert_eq!(
            call_host(&mut stack, &env.funcs, &env.sigs, f),
            Err(Trap::HostResultTypeMismatch)
        );
    }

    #[test]
    fn host_error_traps() {
        let mut env = Environment::new();
        let host = env.append_host_module("host", None);
        let f = env
            .append_host_func_export(
                host,
                "fail",
                FuncSignature::new(&[ValType::I32], &[]),
                Box::new(|_| Err(crate::trap::HostError::new("boom"))),
            )
            .unwrap();
        let mut stack = ValueStack::new(8);
        stack.push(Value::from_u32(3)).unwrap();
        assert_eq!(call_host(&mut stack, &env.funcs, &env.sigs, f), Err(Trap::HostTrapped));
        assert!(stack.is_empty());
    }
}
