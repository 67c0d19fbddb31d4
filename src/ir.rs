//! The instruction set: every Wasm opcode the translator accepts plus the
//! interpreter-only opcodes it emits into the istream.
//!
//! Each row gives the prefix byte (0 for none), the opcode byte, the text
//! name, the result type (`___` for none), the operand types popped by the
//! type checker, and the memory access width in bytes.

use crate::types::ValType;

/// Prefix for saturating truncation.
pub const PREFIX_MISC: u8 = 0xfc;
/// Prefix for atomic memory operations.
pub const PREFIX_ATOMIC: u8 = 0xfe;

macro_rules! ty {
    (___) => {
        None
    };
    ($t:ident) => {
        Some(ValType::$t)
    };
}

macro_rules! opcodes {
    ($( $variant:ident = $prefix:literal, $code:literal, $name:literal, $result:tt, [$($param:ident),*], $mem:literal; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $variant, )*
        }

        impl Opcode {
            pub fn name(self) -> &'static str {
                match self { $( Opcode::$variant => $name, )* }
            }

            pub fn prefix(self) -> u8 {
                match self { $( Opcode::$variant => $prefix, )* }
            }

            pub fn code(self) -> u8 {
                match self { $( Opcode::$variant => $code, )* }
            }

            /// Type pushed by the instruction, if any.
            pub fn result_type(self) -> Option<ValType> {
                match self { $( Opcode::$variant => ty!($result), )* }
            }

            /// Operand types, bottom of stack first.
            pub fn param_types(self) -> &'static [ValType] {
                match self { $( Opcode::$variant => &[$( ValType::$param ),*], )* }
            }

            /// Bytes touched by a memory access, 0 for everything else.
            pub fn memory_size(self) -> u32 {
                match self { $( Opcode::$variant => $mem, )* }
            }

            pub fn from_bytes(prefix: u8, code: u8) -> Option<Opcode> {
                match (prefix, code) {
                    $( ($prefix, $code) => Some(Opcode::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    // ── Control ──────────────────────────────────────────────────────────────
    Unreachable       = 0x00, 0x00, "unreachable", ___, [], 0;
    Nop               = 0x00, 0x01, "nop", ___, [], 0;
    Block             = 0x00, 0x02, "block", ___, [], 0;
    Loop              = 0x00, 0x03, "loop", ___, [], 0;
    If                = 0x00, 0x04, "if", ___, [], 0;
    Else              = 0x00, 0x05, "else", ___, [], 0;
    End               = 0x00, 0x0b, "end", ___, [], 0;
    Br                = 0x00, 0x0c, "br", ___, [], 0;
    BrIf              = 0x00, 0x0d, "br_if", ___, [], 0;
    BrTable           = 0x00, 0x0e, "br_table", ___, [], 0;
    Return            = 0x00, 0x0f, "return", ___, [], 0;
    Call              = 0x00, 0x10, "call", ___, [], 0;
    CallIndirect      = 0x00, 0x11, "call_indirect", ___, [], 0;
    Drop              = 0x00, 0x1a, "drop", ___, [], 0;
    Select            = 0x00, 0x1b, "select", ___, [], 0;

    // ── Variables ────────────────────────────────────────────────────────────
    LocalGet          = 0x00, 0x20, "local.get", ___, [], 0;
    LocalSet          = 0x00, 0x21, "local.set", ___, [], 0;
    LocalTee          = 0x00, 0x22, "local.tee", ___, [], 0;
    GlobalGet         = 0x00, 0x23, "global.get", ___, [], 0;
    GlobalSet         = 0x00, 0x24, "global.set", ___, [], 0;

    // ── Memory ───────────────────────────────────────────────────────────────
    I32Load           = 0x00, 0x28, "i32.load", I32, [I32], 4;
    I64Load           = 0x00, 0x29, "i64.load", I64, [I32], 8;
    F32Load           = 0x00, 0x2a, "f32.load", F32, [I32], 4;
    F64Load           = 0x00, 0x2b, "f64.load", F64, [I32], 8;
    I32Load8S         = 0x00, 0x2c, "i32.load8_s", I32, [I32], 1;
    I32Load8U         = 0x00, 0x2d, "i32.load8_u", I32, [I32], 1;
    I32Load16S        = 0x00, 0x2e, "i32.load16_s", I32, [I32], 2;
    I32Load16U        = 0x00, 0x2f, "i32.load16_u", I32, [I32], 2;
    I64Load8S         = 0x00, 0x30, "i64.load8_s", I64, [I32], 1;
    I64Load8U         = 0x00, 0x31, "i64.load8_u", I64, [I32], 1;
    I64Load16S        = 0x00, 0x32, "i64.load16_s", I64, [I32], 2;
    I64Load16U        = 0x00, 0x33, "i64.load16_u", I64, [I32], 2;
    I64Load32S        = 0x00, 0x34, "i64.load32_s", I64, [I32], 4;
    I64Load32U        = 0x00, 0x35, "i64.load32_u", I64, [I32], 4;
    I32Store          = 0x00, 0x36, "i32.store", ___, [I32, I32], 4;
    I64Store          = 0x00, 0x37, "i64.store", ___, [I32, I64], 8;
    F32Store          = 0x00, 0x38, "f32.store", ___, [I32, F32], 4;
    F64Store          = 0x00, 0x39, "f64.store", ___, [I32, F64], 8;
    I32Store8         = 0x00, 0x3a, "i32.store8", ___, [I32, I32], 1;
    I32Store16        = 0x00, 0x3b, "i32.store16", ___, [I32, I32], 2;
    I64Store8         = 0x00, 0x3c, "i64.store8", ___, [I32, I64], 1;
    I64Store16        = 0x00, 0x3d, "i64.store16", ___, [I32, I64], 2;
    I64Store32        = 0x00, 0x3e, "i64.store32", ___, [I32, I64], 4;
    MemorySize        = 0x00, 0x3f, "memory.size", I32, [], 0;
    MemoryGrow        = 0x00, 0x40, "memory.grow", I32, [I32], 0;

    // ── Constants ────────────────────────────────────────────────────────────
    I32Const          = 0x00, 0x41, "i32.const", I32, [], 0;
    I64Const          = 0x00, 0x42, "i64.const", I64, [], 0;
    F32Const          = 0x00, 0x43, "f32.const", F32, [], 0;
    F64Const          = 0x00, 0x44, "f64.const", F64, [], 0;

    // ── Comparisons ──────────────────────────────────────────────────────────
    I32Eqz            = 0x00, 0x45, "i32.eqz", I32, [I32], 0;
    I32Eq             = 0x00, 0x46, "i32.eq", I32, [I32, I32], 0;
    I32Ne             = 0x00, 0x47, "i32.ne", I32, [I32, I32], 0;
    I32LtS            = 0x00, 0x48, "i32.lt_s", I32, [I32, I32], 0;
    I32LtU            = 0x00, 0x49, "i32.lt_u", I32, [I32, I32], 0;
    I32GtS            = 0x00, 0x4a, "i32.gt_s", I32, [I32, I32], 0;
    I32GtU            = 0x00, 0x4b, "i32.gt_u", I32, [I32, I32], 0;
    I32LeS            = 0x00, 0x4c, "i32.le_s", I32, [I32, I32], 0;
    I32LeU            = 0x00, 0x4d, "i32.le_u", I32, [I32, I32], 0;
    I32GeS            = 0x00, 0x4e, "i32.ge_s", I32, [I32, I32], 0;
    I32GeU            = 0x00, 0x4f, "i32.ge_u", I32, [I32, I32], 0;
    I64Eqz            = 0x00, 0x50, "i64.eqz", I32, [I64], 0;
    I64Eq             = 0x00, 0x51, "i64.eq", I32, [I64, I64], 0;
    I64Ne             = 0x00, 0x52, "i64.ne", I32, [I64, I64], 0;
    I64LtS            = 0x00, 0x53, "i64.lt_s", I32, [I64, I64], 0;
    I64LtU            = 0x00, 0x54, "i64.lt_u", I32, [I64, I64], 0;
    I64GtS            = 0x00, 0x55, "i64.gt_s", I32, [I64, I64], 0;
    I64GtU            = 0x00, 0x56, "i64.gt_u", I32, [I64, I64], 0;
    I64LeS            = 0x00, 0x57, "i64.le_s", I32, [I64, I64], 0;
    I64LeU            = 0x00, 0x58, "i64.le_u", I32, [I64, I64], 0;
    I64GeS            = 0x00, 0x59, "i64.ge_s", I32, [I64, I64], 0;
    I64GeU            = 0x00, 0x5a, "i64.ge_u", I32, [I64, I64], 0;
    F32Eq             = 0x00, 0x5b, "f32.eq", I32, [F32, F32], 0;
    F32Ne             = 0x00, 0x5c, "f32.ne", I32, [F32, F32], 0;
    F32Lt             = 0x00, 0x5d, "f32.lt", I32, [F32, F32], 0;
    F32Gt             = 0x00, 0x5e, "f32.gt", I32, [F32, F32], 0;
    F32Le             = 0x00, 0x5f, "f32.le", I32, [F32, F32], 0;
    F32Ge             = 0x00, 0x60, "f32.ge", I32, [F32, F32], 0;
    F64Eq             = 0x00, 0x61, "f64.eq", I32, [F64, F64], 0;
    F64Ne             = 0x00, 0x62, "f64.ne", I32, [F64, F64], 0;
    F64Lt             = 0x00, 0x63, "f64.lt", I32, [F64, F64], 0;
    F64Gt             = 0x00, 0x64, "f64.gt", I32, [F64, F64], 0;
    F64Le             = 0x00, 0x65, "f64.le", I32, [F64, F64], 0;
    F64Ge             = 0x00, 0x66, "f64.ge", I32, [F64, F64], 0;

    // ── i32 arithmetic ───────────────────────────────────────────────────────
    I32Clz            = 0x00, 0x67, "i32.clz", I32, [I32], 0;
    I32Ctz            = 0x00, 0x68, "i32.ctz", I32, [I32], 0;
    I32Popcnt         = 0x00, 0x69, "i32.popcnt", I32, [I32], 0;
    I32Add            = 0x00, 0x6a, "i32.add", I32, [I32, I32], 0;
    I32Sub            = 0x00, 0x6b, "i32.sub", I32, [I32, I32], 0;
    I32Mul            = 0x00, 0x6c, "i32.mul", I32, [I32, I32], 0;
    I32DivS           = 0x00, 0x6d, "i32.div_s", I32, [I32, I32], 0;
    I32DivU           = 0x00, 0x6e, "i32.div_u", I32, [I32, I32], 0;
    I32RemS           = 0x00, 0x6f, "i32.rem_s", I32, [I32, I32], 0;
    I32RemU           = 0x00, 0x70, "i32.rem_u", I32, [I32, I32], 0;
    I32And            = 0x00, 0x71, "i32.and", I32, [I32, I32], 0;
    I32Or             = 0x00, 0x72, "i32.or", I32, [I32, I32], 0;
    I32Xor            = 0x00, 0x73, "i32.xor", I32, [I32, I32], 0;
    I32Shl            = 0x00, 0x74, "i32.shl", I32, [I32, I32], 0;
    I32ShrS           = 0x00, 0x75, "i32.shr_s", I32, [I32, I32], 0;
    I32ShrU           = 0x00, 0x76, "i32.shr_u", I32, [I32, I32], 0;
    I32Rotl           = 0x00, 0x77, "i32.rotl", I32, [I32, I32], 0;
    I32Rotr           = 0x00, 0x78, "i32.rotr", I32, [I32, I32], 0;

    // ── i64 arithmetic ───────────────────────────────────────────────────────
    I64Clz            = 0x00, 0x79, "i64.clz", I64, [I64], 0;
    I64Ctz            = 0x00, 0x7a, "i64.ctz", I64, [I64], 0;
    I64Popcnt         = 0x00, 0x7b, "i64.popcnt", I64, [I64], 0;
    I64Add            = 0x00, 0x7c, "i64.add", I64, [I64, I64], 0;
    I64Sub            = 0x00, 0x7d, "i64.sub", I64, [I64, I64], 0;
    I64Mul            = 0x00, 0x7e, "i64.mul", I64, [I64, I64], 0;
    I64DivS           = 0x00, 0x7f, "i64.div_s", I64, [I64, I64], 0;
    I64DivU           = 0x00, 0x80, "i64.div_u", I64, [I64, I64], 0;
    I64RemS           = 0x00, 0x81, "i64.rem_s", I64, [I64, I64], 0;
    I64RemU           = 0x00, 0x82, "i64.rem_u", I64, [I64, I64], 0;
    I64And            = 0x00, 0x83, "i64.and", I64, [I64, I64], 0;
    I64Or             = 0x00, 0x84, "i64.or", I64, [I64, I64], 0;
    I64Xor            = 0x00, 0x85, "i64.xor", I64, [I64, I64], 0;
    I64Shl            = 0x00, 0x86, "i64.shl", I64, [I64, I64], 0;
    I64ShrS           = 0x00, 0x87, "i64.shr_s", I64, [I64, I64], 0;
    I64ShrU           = 0x00, 0x88, "i64.shr_u", I64, [I64, I64], 0;
    I64Rotl           = 0x00, 0x89, "i64.rotl", I64, [I64, I64], 0;
    I64Rotr           = 0x00, 0x8a, "i64.rotr", I64, [I64, I64], 0;

    // ── f32 arithmetic ───────────────────────────────────────────────────────
    F32Abs            = 0x00, 0x8b, "f32.abs", F32, [F32], 0;
    F32Neg            = 0x00, 0x8c, "f32.neg", F32, [F32], 0;
    F32Ceil           = 0x00, 0x8d, "f32.ceil", F32, [F32], 0;
    F32Floor          = 0x00, 0x8e, "f32.floor", F32, [F32], 0;
    F32Trunc          = 0x00, 0x8f, "f32.trunc", F32, [F32], 0;
    F32Nearest        = 0x00, 0x90, "f32.nearest", F32, [F32], 0;
    F32Sqrt           = 0x00, 0x91, "f32.sqrt", F32, [F32], 0;
    F32Add            = 0x00, 0x92, "f32.add", F32, [F32, F32], 0;
    F32Sub            = 0x00, 0x93, "f32.sub", F32, [F32, F32], 0;
    F32Mul            = 0x00, 0x94, "f32.mul", F32, [F32, F32], 0;
    F32Div            = 0x00, 0x95, "f32.div", F32, [F32, F32], 0;
    F32Min            = 0x00, 0x96, "f32.min", F32, [F32, F32], 0;
    F32Max            = 0x00, 0x97, "f32.max", F32, [F32, F32], 0;
    F32Copysign       = 0x00, 0x98, "f32.copysign", F32, [F32, F32], 0;

    // ── f64 arithmetic ───────────────────────────────────────────────────────
    F64Abs            = 0x00, 0x99, "f64.abs", F64, [F64], 0;
    F64Neg            = 0x00, 0x9a, "f64.neg", F64, [F64], 0;
    F64Ceil           = 0x00, 0x9b, "f64.ceil", F64, [F64], 0;
    F64Floor          = 0x00, 0x9c, "f64.floor", F64, [F64], 0;
    F64Trunc          = 0x00, 0x9d, "f64.trunc", F64, [F64], 0;
    F64Nearest        = 0x00, 0x9e, "f64.nearest", F64, [F64], 0;
    F64Sqrt           = 0x00, 0x9f, "f64.sqrt", F64, [F64], 0;
    F64Add            = 0x00, 0xa0, "f64.add", F64, [F64, F64], 0;
    F64Sub            = 0x00, 0xa1, "f64.sub", F64, [F64, F64], 0;
    F64Mul            = 0x00, 0xa2, "f64.mul", F64, [F64, F64], 0;
    F64Div            = 0x00, 0xa3, "f64.div", F64, [F64, F64], 0;
    F64Min            = 0x00, 0xa4, "f64.min", F64, [F64, F64], 0;
    F64Max            = 0x00, 0xa5, "f64.max", F64, [F64, F64], 0;
    F64Copysign       = 0x00, 0xa6, "f64.copysign", F64, [F64, F64], 0;

    // ── Conversions ──────────────────────────────────────────────────────────
    I32WrapI64        = 0x00, 0xa7, "i32.wrap_i64", I32, [I64], 0;
    I32TruncF32S      = 0x00, 0xa8, "i32.trunc_f32_s", I32, [F32], 0;
    I32TruncF32U      = 0x00, 0xa9, "i32.trunc_f32_u", I32, [F32], 0;
    I32TruncF64S      = 0x00, 0xaa, "i32.trunc_f64_s", I32, [F64], 0;
    I32TruncF64U      = 0x00, 0xab, "i32.trunc_f64_u", I32, [F64], 0;
    I64ExtendI32S     = 0x00, 0xac, "i64.extend_i32_s", I64, [I32], 0;
    I64ExtendI32U     = 0x00, 0xad, "i64.extend_i32_u", I64, [I32], 0;
    I64TruncF32S      = 0x00, 0xae, "i64.trunc_f32_s", I64, [F32], 0;
    I64TruncF32U      = 0x00, 0xaf, "i64.trunc_f32_u", I64, [F32], 0;
    I64TruncF64S      = 0x00, 0xb0, "i64.trunc_f64_s", I64, [F64], 0;
    I64TruncF64U      = 0x00, 0xb1, "i64.trunc_f64_u", I64, [F64], 0;
    F32ConvertI32S    = 0x00, 0xb2, "f32.convert_i32_s", F32, [I32], 0;
    F32ConvertI32U    = 0x00, 0xb3, "f32.convert_i32_u", F32, [I32], 0;
    F32ConvertI64S    = 0x00, 0xb4, "f32.convert_i64_s", F32, [I64], 0;
    F32ConvertI64U    = 0x00, 0xb5, "f32.convert_i64_u", F32, [I64], 0;
    F32DemoteF64      = 0x00, 0xb6, "f32.demote_f64", F32, [F64], 0;
    F64ConvertI32S    = 0x00, 0xb7, "f64.convert_i32_s", F64, [I32], 0;
    F64ConvertI32U    = 0x00, 0xb8, "f64.convert_i32_u", F64, [I32], 0;
    F64ConvertI64S    = 0x00, 0xb9, "f64.convert_i64_s", F64, [I64], 0;
    F64ConvertI64U    = 0x00, 0xba, "f64.convert_i64_u", F64, [I64], 0;
    F64PromoteF32     = 0x00, 0xbb, "f64.promote_f32", F64, [F32], 0;
    I32ReinterpretF32 = 0x00, 0xbc, "i32.reinterpret_f32", I32, [F32], 0;
    I64ReinterpretF64 = 0x00, 0xbd, "i64.reinterpret_f64", I64, [F64], 0;
    F32ReinterpretI32 = 0x00, 0xbe, "f32.reinterpret_i32", F32, [I32], 0;
    F64ReinterpretI64 = 0x00, 0xbf, "f64.reinterpret_i64", F64, [I64], 0;
    I32Extend8S       = 0x00, 0xc0, "i32.extend8_s", I32, [I32], 0;
    I32Extend16S      = 0x00, 0xc1, "i32.extend16_s", I32, [I32], 0;
    I64Extend8S       = 0x00, 0xc2, "i64.extend8_s", I64, [I64], 0;
    I64Extend16S      = 0x00, 0xc3, "i64.extend16_s", I64, [I64], 0;
    I64Extend32S      = 0x00, 0xc4, "i64.extend32_s", I64, [I64], 0;

    // ── Interpreter-only ─────────────────────────────────────────────────────
    Alloca            = 0x00, 0xe0, "alloca", ___, [], 0;
    BrUnless          = 0x00, 0xe1, "br_unless", ___, [], 0;
    CallHost          = 0x00, 0xe2, "call_host", ___, [], 0;
    Data              = 0x00, 0xe3, "data", ___, [], 0;
    DropKeep          = 0x00, 0xe4, "drop_keep", ___, [], 0;

    // ── Saturating truncation ────────────────────────────────────────────────
    I32TruncSatF32S   = 0xfc, 0x00, "i32.trunc_sat_f32_s", I32, [F32], 0;
    I32TruncSatF32U   = 0xfc, 0x01, "i32.trunc_sat_f32_u", I32, [F32], 0;
    I32TruncSatF64S   = 0xfc, 0x02, "i32.trunc_sat_f64_s", I32, [F64], 0;
    I32TruncSatF64U   = 0xfc, 0x03, "i32.trunc_sat_f64_u", I32, [F64], 0;
    I64TruncSatF32S   = 0xfc, 0x04, "i64.trunc_sat_f32_s", I64, [F32], 0;
    I64TruncSatF32U   = 0xfc, 0x05, "i64.trunc_sat_f32_u", I64, [F32], 0;
    I64TruncSatF64S   = 0xfc, 0x06, "i64.trunc_sat_f64_s", I64, [F64], 0;
    I64TruncSatF64U   = 0xfc, 0x07, "i64.trunc_sat_f64_u", I64, [F64], 0;

    // ── Atomics ──────────────────────────────────────────────────────────────
    I32AtomicLoad     = 0xfe, 0x10, "i32.atomic.load", I32, [I32], 4;
    I64AtomicLoad     = 0xfe, 0x11, "i64.atomic.load", I64, [I32], 8;
    I32AtomicLoad8U   = 0xfe, 0x12, "i32.atomic.load8_u", I32, [I32], 1;
    I32AtomicLoad16U  = 0xfe, 0x13, "i32.atomic.load16_u", I32, [I32], 2;
    I64AtomicLoad8U   = 0xfe, 0x14, "i64.atomic.load8_u", I64, [I32], 1;
    I64AtomicLoad16U  = 0xfe, 0x15, "i64.atomic.load16_u", I64, [I32], 2;
    I64AtomicLoad32U  = 0xfe, 0x16, "i64.atomic.load32_u", I64, [I32], 4;
    I32AtomicStore    = 0xfe, 0x17, "i32.atomic.store", ___, [I32, I32], 4;
    I64AtomicStore    = 0xfe, 0x18, "i64.atomic.store", ___, [I32, I64], 8;
    I32AtomicStore8   = 0xfe, 0x19, "i32.atomic.store8", ___, [I32, I32], 1;
    I32AtomicStore16  = 0xfe, 0x1a, "i32.atomic.store16", ___, [I32, I32], 2;
    I64AtomicStore8   = 0xfe, 0x1b, "i64.atomic.store8", ___, [I32, I64], 1;
    I64AtomicStore16  = 0xfe, 0x1c, "i64.atomic.store16", ___, [I32, I64], 2;
    I64AtomicStore32  = 0xfe, 0x1d, "i64.atomic.store32", ___, [I32, I64], 4;
    I32AtomicRmwAdd   = 0xfe, 0x1e, "i32.atomic.rmw.add", I32, [I32, I32], 4;
    I64AtomicRmwAdd   = 0xfe, 0x1f, "i64.atomic.rmw.add", I64, [I32, I64], 8;
    I32AtomicRmwSub   = 0xfe, 0x25, "i32.atomic.rmw.sub", I32, [I32, I32], 4;
    I64AtomicRmwSub   = 0xfe, 0x26, "i64.atomic.rmw.sub", I64, [I32, I64], 8;
    I32AtomicRmwAnd   = 0xfe, 0x2c, "i32.atomic.rmw.and", I32, [I32, I32], 4;
    I64AtomicRmwAnd   = 0xfe, 0x2d, "i64.atomic.rmw.and", I64, [I32, I64], 8;
    I32AtomicRmwOr    = 0xfe, 0x33, "i32.atomic.rmw.or", I32, [I32, I32], 4;
    I64AtomicRmwOr    = 0xfe, 0x34, "i64.atomic.rmw.or", I64, [I32, I64], 8;
    I32AtomicRmwXor   = 0xfe, 0x3a, "i32.atomic.rmw.xor", I32, [I32, I32], 4;
    I64AtomicRmwXor   = 0xfe, 0x3b, "i64.atomic.rmw.xor", I64, [I32, I64], 8;
    I32AtomicRmwXchg  = 0xfe, 0x41, "i32.atomic.rmw.xchg", I32, [I32, I32], 4;
    I64AtomicRmwXchg  = 0xfe, 0x42, "i64.atomic.rmw.xchg", I64, [I32, I64], 8;
    I32AtomicRmwCmpxchg = 0xfe, 0x48, "i32.atomic.rmw.cmpxchg", I32, [I32, I32, I32], 4;
    I64AtomicRmwCmpxchg = 0xfe, 0x49, "i64.atomic.rmw.cmpxchg", I64, [I32, I64, I64], 8;
}

impl Opcode {
    pub fn is_atomic(self) -> bool {
        self.prefix() == PREFIX_ATOMIC
    }

    /// Appends the opcode's stream encoding.
    pub fn encode(self, out: &mut Vec<u8>) {
        if self.prefix() != 0 {
            out.push(self.prefix());
        }
        out.push(self.code());
    }

    /// Decodes the opcode at `*pc`, advancing past it.
    #[inline]
    pub fn decode(code: &[u8], pc: &mut usize) -> Option<Opcode> {
        let first = *code.get(*pc)?;
        *pc += 1;
        if first == PREFIX_MISC || first == PREFIX_ATOMIC {
            let second = *code.get(*pc)?;
            *pc += 1;
            Opcode::from_bytes(first, second)
        } else {
            Opcode::from_bytes(0, first)
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_prefixed() {
        let mut out = Vec::new();
        Opcode::I32Add.encode(&mut out);
        Opcode::I64TruncSatF64U.encode(&mut out);
        Opcode::I32AtomicRmwCmpxchg.encode(&mut out);
        assert_eq!(out, [0x6a, 0xfc, 0x07, 0xfe, 0x48]);
        let mut pc = 0;
        assert_eq!(Opcode::decode(&out, &mut pc), Some(Opcode::I32Add));
        assert_eq!(Opcode::decode(&out, &mut pc), Some(Opcode::I64TruncSatF64U));
        assert_eq!(Opcode::decode(&out, &mut pc), Some(Opcode::I32AtomicRmwCmpxchg));
        assert_eq!(pc, 5);
        assert_eq!(Opcode::decode(&out, &mut pc), None);
    }

    #[test]
    fn signatures() {
        assert_eq!(Opcode::I64Eqz.param_types(), &[ValType::I64]);
        assert_eq!(Opcode::I64Eqz.result_type(), Some(ValType::I32));
        assert_eq!(Opcode::F64Store.param_types(), &[ValType::I32, ValType::F64]);
        assert_eq!(Opcode::F64Store.result_type(), None);
        assert_eq!(Opcode::I64Load32S.memory_size(), 4);
        assert!(Opcode::I64AtomicStore8.is_atomic());
    }
}
