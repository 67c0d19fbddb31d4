//! Value types, signatures and the two value representations.
//!
//! [`Val`] is the typed value used at the embedding boundary (arguments,
//! results, globals). [`Value`] is the untagged 64-bit slot the VM keeps on
//! its value stack; its type is implied by the validated bytecode.

use std::fmt;

/// Primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValType {
    I32 = 0x7F,
    I64 = 0x7E,
    F32 = 0x7D,
    F64 = 0x7C,
}

impl ValType {
    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Function signature. Equality is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FuncSignature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncSignature {
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        FuncSignature {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

/// Size bounds of a table (elements) or memory (pages).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub initial: u64,
    pub max: Option<u64>,
}

impl Limits {
    pub fn new(initial: u64, max: Option<u64>) -> Self {
        Limits { initial, max }
    }
}

/// What an import or export refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalKind {
    Func,
    Table,
    Memory,
    Global,
}

impl ExternalKind {
    pub fn name(self) -> &'static str {
        match self {
            ExternalKind::Func => "func",
            ExternalKind::Table => "table",
            ExternalKind::Memory => "memory",
            ExternalKind::Global => "global",
        }
    }
}

impl fmt::Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed runtime value. Floats are held as raw IEEE-754 bits so NaN
/// payloads survive every copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Val {
    I32(u32),
    I64(u64),
    F32(u32),
    F64(u64),
}

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    pub fn i32(v: i32) -> Val {
        Val::I32(v as u32)
    }

    pub fn i64(v: i64) -> Val {
        Val::I64(v as u64)
    }

    pub fn f32(v: f32) -> Val {
        Val::F32(v.to_bits())
    }

    pub fn f64(v: f64) -> Val {
        Val::F64(v.to_bits())
    }

    pub fn as_i32(self) -> Option<i32> {
        if let Val::I32(v) = self {
            Some(v as i32)
        } else {
            None
        }
    }
    pub fn as_i64(self) -> Option<i64> {
        if let Val::I64(v) = self {
            Some(v as i64)
        } else {
            None
        }
    }
    pub fn as_f32(self) -> Option<f32> {
        if let Val::F32(v) = self {
            Some(f32::from_bits(v))
        } else {
            None
        }
    }
    pub fn as_f64(self) -> Option<f64> {
        if let Val::F64(v) = self {
            Some(f64::from_bits(v))
        } else {
            None
        }
    }

    pub fn default_for(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
        }
    }

    /// Strips the tag.
    pub fn to_value(self) -> Value {
        match self {
            Val::I32(v) | Val::F32(v) => Value::from_u32(v),
            Val::I64(v) | Val::F64(v) => Value::from_u64(v),
        }
    }

    /// Re-attaches a statically known type to an untagged slot.
    pub fn from_value(ty: ValType, value: Value) -> Val {
        match ty {
            ValType::I32 => Val::I32(value.u32()),
            ValType::I64 => Val::I64(value.u64()),
            ValType::F32 => Val::F32(value.u32()),
            ValType::F64 => Val::F64(value.u64()),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Val::I32(v) => write!(f, "i32:{v}"),
            Val::I64(v) => write!(f, "i64:{v}"),
            Val::F32(v) => write!(f, "f32:{}", f32::from_bits(v)),
            Val::F64(v) => write!(f, "f64:{}", f64::from_bits(v)),
        }
    }
}

/// One untagged value-stack slot. 32-bit values live in the low half.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Value(u64);

impl Value {
    #[inline]
    pub fn from_u32(v: u32) -> Value {
        Value(v as u64)
    }
    #[inline]
    pub fn from_u64(v: u64) -> Value {
        Value(v)
    }
    #[inline]
    pub fn from_i32(v: i32) -> Value {
        Value(v as u32 as u64)
    }
    #[inline]
    pub fn from_i64(v: i64) -> Value {
        Value(v as u64)
    }
    #[inline]
    pub fn u32(self) -> u32 {
        self.0 as u32
    }
    #[inline]
    pub fn u64(self) -> u64 {
        self.0
    }
    #[inline]
    pub fn i32(self) -> i32 {
        self.0 as u32 as i32
    }
    #[inline]
    pub fn i64(self) -> i64 {
        self.0 as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn val_round_trips_through_untagged_slot() {
        let nan = Val::F32(0x7fa0_0001);
        assert_eq!(Val::from_value(ValType::F32, nan.to_value()), nan);
        let neg = Val::i32(-5);
        assert_eq!(Val::from_value(ValType::I32, neg.to_value()).as_i32(), Some(-5));
        assert_eq!(neg.to_value().u64(), 0xffff_fffb);
    }

    #[test]
    fn typed_accessors_check_the_variant() {
        assert_eq!(Val::i64(-2).as_i64(), Some(-2));
        assert_eq!(Val::f32(1.5).as_f32(), Some(1.5));
        assert_eq!(Val::f64(0.25).as_f64(), Some(0.25));
        assert_eq!(Val::i32(1).as_i64(), None);
        assert_eq!(Val::f64(1.5).as_f32(), None);
    }

    #[test]
    fn signatures_compare_structurally() {
        let a = FuncSignature::new(&[ValType::I32], &[ValType::I64]);
        let b = FuncSignature { params: vec![ValType::I32], results: vec![ValType::I64] };
        assert_eq!(a, b);
        assert_ne!(a, FuncSignature::new(&[ValType::I32], &[]));
    }
}
