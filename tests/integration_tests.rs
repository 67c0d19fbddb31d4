//! Integration tests for flatwasm.
//!
//! Each test drives the translator with the decode events a binary reader
//! would produce, then runs the result through the executor. This exercises
//! the full pipeline: decode events → type check → bytecode → Thread::run.

use std::sync::{Arc, Mutex};

use flatwasm::{
    env::Table,
    literal::{self, LiteralType},
    memory::Memory,
    Environment, ExecError, Executor, ExecutorOptions, ExternalKind, FuncSignature, HostCallback, HostError, ImportDelegate,
    Limits, ModuleTranslator, Opcode, ThreadOptions, TranslateError, Trap, Val, ValType,
};
use ValType::*;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn load(env: &mut Environment, build: impl FnOnce(&mut ModuleTranslator<'_>) -> Result<(), TranslateError>) -> u32 {
    env.load_module(None, build).expect("module should translate")
}

fn load_err(env: &mut Environment, build: impl FnOnce(&mut ModuleTranslator<'_>) -> Result<(), TranslateError>) -> String {
    env.load_module(None, build)
        .expect_err("module should be rejected")
        .message
}

/// Translates one function body with no locals.
fn body(
    m: &mut ModuleTranslator<'_>,
    func_index: u32,
    code: impl FnOnce(&mut ModuleTranslator<'_>) -> Result<(), TranslateError>,
) -> Result<(), TranslateError> {
    body_with_locals(m, func_index, &[], code)
}

fn body_with_locals(
    m: &mut ModuleTranslator<'_>,
    func_index: u32,
    locals: &[(u32, ValType)],
    code: impl FnOnce(&mut ModuleTranslator<'_>) -> Result<(), TranslateError>,
) -> Result<(), TranslateError> {
    m.begin_function_body(func_index)?;
    m.on_local_decl_count(locals.len() as u32)?;
    for &(count, ty) in locals {
        m.on_local_decl(count, ty)?;
    }
    code(m)?;
    m.end_function_body()
}

/// Module exporting a single function `name` with signature `params -> results`.
fn single_func(
    env: &mut Environment,
    name: &str,
    params: &[ValType],
    results: &[ValType],
    code: impl FnOnce(&mut ModuleTranslator<'_>) -> Result<(), TranslateError>,
) -> u32 {
    load(env, |m| {
        m.on_signature(params, results)?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, name)?;
        body(m, 0, code)
    })
}

fn call(env: &mut Environment, module: u32, name: &str, args: &[Val]) -> Result<Vec<Val>, ExecError> {
    Executor::default().run_export_by_name(env, module, name, args)
}

fn call_i32(env: &mut Environment, module: u32, name: &str, args: &[Val]) -> i32 {
    let results = call(env, module, name, args).expect("call should succeed");
    results[0].as_i32().expect("i32 result")
}

fn trap_of(result: Result<Vec<Val>, ExecError>) -> Trap {
    match result {
        Err(ExecError::Trap(trap)) => trap,
        other => panic!("expected a trap, got {other:?}"),
    }
}

// ── Basic arithmetic ──────────────────────────────────────────────────────────

#[test]
fn test_i32_add() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "add", &[I32, I32], &[I32], |m| {
        m.on_local_get(0)?;
        m.on_local_get(1)?;
        m.on_binary(Opcode::I32Add)
    });
    assert_eq!(call_i32(&mut env, m, "add", &[Val::i32(3), Val::i32(4)]), 7);
    assert_eq!(call_i32(&mut env, m, "add", &[Val::i32(i32::MAX), Val::i32(1)]), i32::MIN);
}

#[test]
fn test_i32_division_traps() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[I32, I32], &[I32])?;
        m.on_function(0)?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "div_s")?;
        m.on_export(ExternalKind::Func, 1, "rem_s")?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_local_get(1)?;
            m.on_binary(Opcode::I32DivS)
        })?;
        body(m, 1, |m| {
            m.on_local_get(0)?;
            m.on_local_get(1)?;
            m.on_binary(Opcode::I32RemS)
        })
    });
    assert_eq!(call_i32(&mut env, m, "div_s", &[Val::i32(-7), Val::i32(2)]), -3);
    assert_eq!(
        trap_of(call(&mut env, m, "div_s", &[Val::i32(1), Val::i32(0)])),
        Trap::IntegerDivideByZero
    );
    assert_eq!(
        trap_of(call(&mut env, m, "div_s", &[Val::i32(i32::MIN), Val::i32(-1)])),
        Trap::IntegerOverflow
    );
    assert_eq!(call_i32(&mut env, m, "rem_s", &[Val::i32(i32::MIN), Val::i32(-1)]), 0);
    assert_eq!(
        trap_of(call(&mut env, m, "rem_s", &[Val::i32(5), Val::i32(0)])),
        Trap::IntegerDivideByZero
    );
}

#[test]
fn test_i64_shift_and_rotate() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "f", &[I64, I64], &[I64], |m| {
        m.on_local_get(0)?;
        m.on_local_get(1)?;
        m.on_binary(Opcode::I64Rotl)
    });
    let results = call(&mut env, m, "f", &[Val::i64(1), Val::i64(65)]).unwrap();
    assert_eq!(results, [Val::i64(2)]);
}

#[test]
fn test_float_semantics() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[F32, F32], &[F32])?;
        m.on_signature(&[F64], &[F64])?;
        m.on_signature(&[F32], &[I32])?;
        m.on_function(0)?;
        m.on_function(1)?;
        m.on_function(2)?;
        m.on_export(ExternalKind::Func, 0, "min")?;
        m.on_export(ExternalKind::Func, 1, "nearest")?;
        m.on_export(ExternalKind::Func, 2, "trunc")?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_local_get(1)?;
            m.on_binary(Opcode::F32Min)
        })?;
        body(m, 1, |m| {
            m.on_local_get(0)?;
            m.on_unary(Opcode::F64Nearest)
        })?;
        body(m, 2, |m| {
            m.on_local_get(0)?;
            m.on_convert(Opcode::I32TruncF32S)
        })
    });
    let min = call(&mut env, m, "min", &[Val::f32(0.0), Val::f32(-0.0)]).unwrap();
    assert_eq!(min, [Val::F32(0x8000_0000)]);
    let nearest = call(&mut env, m, "nearest", &[Val::f64(2.5)]).unwrap();
    assert_eq!(nearest, [Val::f64(2.0)]);
    assert_eq!(call_i32(&mut env, m, "trunc", &[Val::f32(-3.9)]), -3);
    assert_eq!(
        trap_of(call(&mut env, m, "trunc", &[Val::F32(0x7fc0_0000)])),
        Trap::InvalidConversionToInteger
    );
    assert_eq!(
        trap_of(call(&mut env, m, "trunc", &[Val::f32(3e9)])),
        Trap::IntegerOverflow
    );
}

#[test]
fn test_parsed_literal_constant() {
    let bits = literal::parse_float(LiteralType::Hexfloat, "0x1.8p1").unwrap();
    let mut env = Environment::new();
    let m = single_func(&mut env, "c", &[], &[F32], |m| m.on_f32_const(bits));
    assert_eq!(call(&mut env, m, "c", &[]).unwrap(), [Val::f32(3.0)]);
}

// ── Control flow ──────────────────────────────────────────────────────────────

fn load_fib(env: &mut Environment) -> u32 {
    single_func(env, "fib", &[I32], &[I32], |m| {
        m.on_local_get(0)?;
        m.on_i32_const(2)?;
        m.on_compare(Opcode::I32LtS)?;
        m.on_if(&[I32])?;
        m.on_local_get(0)?;
        m.on_else()?;
        m.on_local_get(0)?;
        m.on_i32_const(1)?;
        m.on_binary(Opcode::I32Sub)?;
        m.on_call(0)?;
        m.on_local_get(0)?;
        m.on_i32_const(2)?;
        m.on_binary(Opcode::I32Sub)?;
        m.on_call(0)?;
        m.on_binary(Opcode::I32Add)?;
        m.on_end()
    })
}

#[test]
fn test_recursive_fib() {
    let mut env = Environment::new();
    let m = load_fib(&mut env);
    assert_eq!(call_i32(&mut env, m, "fib", &[Val::i32(0)]), 0);
    assert_eq!(call_i32(&mut env, m, "fib", &[Val::i32(1)]), 1);
    assert_eq!(call_i32(&mut env, m, "fib", &[Val::i32(10)]), 55);
    assert_eq!(call_i32(&mut env, m, "fib", &[Val::i32(20)]), 6765);
}

#[test]
fn test_trace_mode_matches_normal_run() {
    let mut env = Environment::new();
    let m = load_fib(&mut env);
    let mut exec = Executor::new(ExecutorOptions {
        trace: true,
        ..ExecutorOptions::default()
    });
    let results = exec.run_export_by_name(&mut env, m, "fib", &[Val::i32(7)]).unwrap();
    assert_eq!(results, [Val::i32(13)]);
}

#[test]
fn test_loop_with_locals() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "sum")?;
        body_with_locals(m, 0, &[(1, I32)], |m| {
            m.on_block(&[])?;
            m.on_loop(&[])?;
            m.on_local_get(0)?;
            m.on_unary(Opcode::I32Eqz)?;
            m.on_br_if(1)?;
            m.on_local_get(1)?;
            m.on_local_get(0)?;
            m.on_binary(Opcode::I32Add)?;
            m.on_local_set(1)?;
            m.on_local_get(0)?;
            m.on_i32_const(1)?;
            m.on_binary(Opcode::I32Sub)?;
            m.on_local_set(0)?;
            m.on_br(0)?;
            m.on_end()?;
            m.on_end()?;
            m.on_local_get(1)
        })
    });
    assert_eq!(call_i32(&mut env, m, "sum", &[Val::i32(100)]), 5050);
    assert_eq!(call_i32(&mut env, m, "sum", &[Val::i32(0)]), 0);
}

#[test]
fn test_br_table() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "switch", &[I32], &[I32], |m| {
        m.on_block(&[])?;
        m.on_block(&[])?;
        m.on_block(&[])?;
        m.on_local_get(0)?;
        m.on_br_table(&[0, 1], 2)?;
        m.on_end()?;
        m.on_i32_const(100)?;
        m.on_return()?;
        m.on_end()?;
        m.on_i32_const(200)?;
        m.on_return()?;
        m.on_end()?;
        m.on_i32_const(300)
    });
    let switch = |env: &mut Environment, key: i32| call_i32(env, m, "switch", &[Val::i32(key)]);
    assert_eq!(switch(&mut env, 0), 100);
    assert_eq!(switch(&mut env, 1), 200);
    assert_eq!(switch(&mut env, 2), 300);
    assert_eq!(switch(&mut env, -1), 300);
}

#[test]
fn test_branch_carries_value_and_drops_rest() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "f", &[], &[I32], |m| {
        m.on_block(&[I32])?;
        m.on_i32_const(1)?;
        m.on_i32_const(2)?;
        m.on_br(0)?;
        m.on_end()
    });
    assert_eq!(call_i32(&mut env, m, "f", &[]), 2);
}

#[test]
fn test_early_return_from_nested_block() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "f")?;
        body_with_locals(m, 0, &[(2, I64)], |m| {
            m.on_i32_const(9)?;
            m.on_block(&[])?;
            m.on_local_get(0)?;
            m.on_if(&[])?;
            m.on_i32_const(42)?;
            m.on_return()?;
            m.on_end()?;
            m.on_end()?;
            m.on_drop()?;
            m.on_i32_const(7)
        })
    });
    assert_eq!(call_i32(&mut env, m, "f", &[Val::i32(1)]), 42);
    assert_eq!(call_i32(&mut env, m, "f", &[Val::i32(0)]), 7);
}

#[test]
fn test_select() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "pick", &[I32], &[I64], |m| {
        m.on_i64_const(10)?;
        m.on_i64_const(20)?;
        m.on_local_get(0)?;
        m.on_select()
    });
    assert_eq!(call(&mut env, m, "pick", &[Val::i32(1)]).unwrap(), [Val::i64(10)]);
    assert_eq!(call(&mut env, m, "pick", &[Val::i32(0)]).unwrap(), [Val::i64(20)]);
}

#[test]
fn test_unreachable_traps() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "boom", &[], &[I32], |m| m.on_unreachable());
    assert_eq!(trap_of(call(&mut env, m, "boom", &[])), Trap::Unreachable);
}

#[test]
fn test_forward_call_is_fixed_up() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[], &[I32])?;
        m.on_function(0)?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "outer")?;
        body(m, 0, |m| {
            m.on_call(1)?;
            m.on_i32_const(1)?;
            m.on_binary(Opcode::I32Add)
        })?;
        body(m, 1, |m| m.on_i32_const(41))
    });
    assert_eq!(call_i32(&mut env, m, "outer", &[]), 42);
}

#[test]
fn test_br_if_carries_value() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "f", &[I32], &[I32], |m| {
        m.on_block(&[I32])?;
        m.on_i32_const(11)?;
        m.on_i32_const(78)?;
        m.on_local_get(0)?;
        m.on_br_if(0)?;
        m.on_drop()?;
        m.on_drop()?;
        m.on_i32_const(5)?;
        m.on_end()
    });
    assert_eq!(call_i32(&mut env, m, "f", &[Val::i32(1)]), 78);
    assert_eq!(call_i32(&mut env, m, "f", &[Val::i32(0)]), 5);
}

#[test]
fn test_br_table_carries_value() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "f", &[I32], &[I32], |m| {
        m.on_block(&[I32])?;
        m.on_block(&[I32])?;
        m.on_i32_const(99)?;
        m.on_i32_const(7)?;
        m.on_local_get(0)?;
        m.on_br_table(&[0], 1)?;
        m.on_end()?;
        m.on_i32_const(100)?;
        m.on_binary(Opcode::I32Add)?;
        m.on_end()
    });
    assert_eq!(call_i32(&mut env, m, "f", &[Val::i32(0)]), 107);
    assert_eq!(call_i32(&mut env, m, "f", &[Val::i32(1)]), 7);
    assert_eq!(call_i32(&mut env, m, "f", &[Val::i32(5)]), 7);
}

#[test]
fn test_extra_local_declaration_rejected() {
    let mut env = Environment::new();
    let err = load_err(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_function(0)?;
        m.begin_function_body(0)?;
        m.on_local_decl_count(1)?;
        m.on_local_decl(2, I32)?;
        m.on_local_decl(1, I64)
    });
    assert_eq!(err, "local declaration 1 exceeds declared count");
}

// ── Stack limits ──────────────────────────────────────────────────────────────

#[test]
fn test_call_stack_exhausted() {
    let mut env = Environment::new();
    let m = single_func(&mut env, "recurse", &[], &[], |m| m.on_call(0));
    let mut exec = Executor::new(ExecutorOptions {
        thread: ThreadOptions {
            call_stack_size: 64,
            ..ThreadOptions::default()
        },
        ..ExecutorOptions::default()
    });
    let result = exec.run_export_by_name(&mut env, m, "recurse", &[]);
    assert_eq!(trap_of(result), Trap::CallStackExhausted);
    assert!(exec.thread().value_stack().is_empty());
}

#[test]
fn test_value_stack_exhausted() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "big")?;
        body_with_locals(m, 0, &[(200, I64)], |_| Ok(()))
    });
    let mut exec = Executor::new(ExecutorOptions {
        thread: ThreadOptions {
            value_stack_size: 100,
            ..ThreadOptions::default()
        },
        ..ExecutorOptions::default()
    });
    let result = exec.run_export_by_name(&mut env, m, "big", &[]);
    assert_eq!(trap_of(result), Trap::ValueStackExhausted);
}

// ── Memory ────────────────────────────────────────────────────────────────────

fn load_memory_module(env: &mut Environment) -> u32 {
    load(env, |m| {
        m.on_signature(&[I32, I32], &[])?;
        m.on_signature(&[I32], &[I32])?;
        m.on_signature(&[], &[I32])?;
        m.on_memory(Limits::new(1, Some(2)))?;
        for sig in [0, 1, 1, 2, 1] {
            m.on_function(sig)?;
        }
        for (i, name) in ["store", "load", "grow", "size", "atomic_load"].iter().enumerate() {
            m.on_export(ExternalKind::Func, i as u32, name)?;
        }
        m.on_export(ExternalKind::Memory, 0, "mem")?;
        m.begin_data_segment(0)?;
        m.on_init_expr_i32_const(8)?;
        m.end_data_segment_init_expr()?;
        m.on_data_segment_data(b"hi")?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_local_get(1)?;
            m.on_store(Opcode::I32Store, 2, 0)
        })?;
        body(m, 1, |m| {
            m.on_local_get(0)?;
            m.on_load(Opcode::I32Load8U, 0, 0)
        })?;
        body(m, 2, |m| {
            m.on_local_get(0)?;
            m.on_memory_grow()
        })?;
        body(m, 3, |m| m.on_memory_size())?;
        body(m, 4, |m| {
            m.on_local_get(0)?;
            m.on_atomic_load(Opcode::I32AtomicLoad, 2, 0)
        })
    })
}

#[test]
fn test_memory_load_store() {
    let mut env = Environment::new();
    let m = load_memory_module(&mut env);
    assert_eq!(call_i32(&mut env, m, "load", &[Val::i32(8)]), b'h' as i32);
    assert_eq!(call_i32(&mut env, m, "load", &[Val::i32(9)]), b'i' as i32);
    call(&mut env, m, "store", &[Val::i32(100), Val::i32(0x1234_5678)]).unwrap();
    assert_eq!(call_i32(&mut env, m, "load", &[Val::i32(100)]), 0x78);
    assert_eq!(
        trap_of(call(&mut env, m, "load", &[Val::i32(65536)])),
        Trap::MemoryAccessOutOfBounds
    );
    assert_eq!(
        trap_of(call(&mut env, m, "store", &[Val::i32(65534), Val::i32(0)])),
        Trap::MemoryAccessOutOfBounds
    );
}

#[test]
fn test_memory_grow_respects_max() {
    let mut env = Environment::new();
    let m = load_memory_module(&mut env);
    assert_eq!(call_i32(&mut env, m, "size", &[]), 1);
    assert_eq!(call_i32(&mut env, m, "grow", &[Val::i32(1)]), 1);
    assert_eq!(call_i32(&mut env, m, "grow", &[Val::i32(1)]), -1);
    assert_eq!(call_i32(&mut env, m, "size", &[]), 2);
    assert_eq!(call_i32(&mut env, m, "load", &[Val::i32(65536)]), 0);
}

#[test]
fn test_atomic_alignment_trap() {
    let mut env = Environment::new();
    let m = load_memory_module(&mut env);
    assert_eq!(call_i32(&mut env, m, "atomic_load", &[Val::i32(8)]), 0x6968);
    assert_eq!(
        trap_of(call(&mut env, m, "atomic_load", &[Val::i32(2)])),
        Trap::AtomicMemoryAccessUnaligned
    );
}

#[test]
fn test_memory_validation_errors() {
    let mut env = Environment::new();
    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_function(0)?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_load(Opcode::I32Load, 2, 0)
        })
    });
    assert_eq!(err, "i32.load requires an imported or defined memory.");

    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_memory(Limits::new(1, None))?;
        m.on_function(0)?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_load(Opcode::I32Load, 3, 0)
        })
    });
    assert_eq!(err, "alignment must not be larger than natural alignment (4)");

    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_memory(Limits::new(1, None))?;
        m.on_function(0)?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_atomic_load(Opcode::I32AtomicLoad, 1, 0)
        })
    });
    assert_eq!(err, "alignment must be equal to natural alignment (4)");

    let err = load_err(&mut env, |m| {
        m.on_memory(Limits::new(1, None))?;
        m.on_memory(Limits::new(1, None))
    });
    assert_eq!(err, "only one memory allowed");
}

#[test]
fn test_out_of_bounds_data_segment_rolls_back() {
    let mut env = Environment::new();
    let host = env.append_host_module("env", None);
    env.append_host_memory_export(host, "mem", Memory::new(Limits::new(1, None)))
        .unwrap();
    let before = (env.module_count(), env.func_count(), env.sig_count(), env.istream().len());

    let err = env
        .load_module(Some("bad"), |m| {
            m.on_signature(&[], &[])?;
            m.on_import_memory("env", "mem", Limits::new(1, None))?;
            m.on_function(0)?;
            m.begin_data_segment(0)?;
            m.on_init_expr_i32_const(65535)?;
            m.end_data_segment_init_expr()?;
            m.on_data_segment_data(&[1, 2])?;
            body(m, 0, |_| Ok(()))
        })
        .unwrap_err();
    assert_eq!(err.message, "data segment is out of bounds: [65535, 65537) >= max value 65536");
    assert_eq!(
        (env.module_count(), env.func_count(), env.sig_count(), env.istream().len()),
        before
    );
    assert_eq!(env.find_module_by_name("bad"), None);
    assert_eq!(env.memory(0).unwrap().data()[65535], 0);
}

// ── Tables and indirect calls ─────────────────────────────────────────────────

#[test]
fn test_call_indirect() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_signature(&[], &[I32])?;
        m.on_signature(&[I32, I32], &[I32])?;
        m.on_function(0)?;
        m.on_function(1)?;
        m.on_function(2)?;
        m.on_table(Limits::new(3, None))?;
        m.on_export(ExternalKind::Func, 2, "dispatch")?;
        m.begin_elem_segment(0)?;
        m.on_init_expr_i32_const(0)?;
        m.end_elem_segment_init_expr()?;
        m.on_elem_segment_function_index(0)?;
        m.on_elem_segment_function_index(1)?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_i32_const(1)?;
            m.on_binary(Opcode::I32Add)
        })?;
        body(m, 1, |m| m.on_i32_const(7))?;
        body(m, 2, |m| {
            m.on_local_get(1)?;
            m.on_local_get(0)?;
            m.on_call_indirect(0)
        })
    });
    let dispatch = |env: &mut Environment, index: i32| {
        call(env, m, "dispatch", &[Val::i32(index), Val::i32(41)])
    };
    assert_eq!(dispatch(&mut env, 0).unwrap(), [Val::i32(42)]);
    assert_eq!(trap_of(dispatch(&mut env, 1)), Trap::IndirectCallSignatureMismatch);
    assert_eq!(trap_of(dispatch(&mut env, 2)), Trap::UninitializedTableElement);
    assert_eq!(trap_of(dispatch(&mut env, 3)), Trap::UndefinedTableIndex);
}

/// Table holding `add` (typed with a duplicate of the call-site signature)
/// and `negate` (a different signature), plus a `dispatch(a, b, slot)` export.
fn load_dispatch_module(env: &mut Environment) -> u32 {
    load(env, |m| {
        m.on_signature(&[I32, I32], &[I32])?;
        m.on_signature(&[I32, I32], &[I32])?;
        m.on_signature(&[I32], &[I32])?;
        m.on_signature(&[I32, I32, I32], &[I32])?;
        m.on_function(1)?;
        m.on_function(2)?;
        m.on_function(3)?;
        m.on_table(Limits::new(2, None))?;
        m.on_export(ExternalKind::Func, 2, "dispatch")?;
        m.begin_elem_segment(0)?;
        m.on_init_expr_i32_const(0)?;
        m.end_elem_segment_init_expr()?;
        m.on_elem_segment_function_index(0)?;
        m.on_elem_segment_function_index(1)?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_local_get(1)?;
            m.on_binary(Opcode::I32Add)
        })?;
        body(m, 1, |m| {
            m.on_i32_const(0)?;
            m.on_local_get(0)?;
            m.on_binary(Opcode::I32Sub)
        })?;
        body(m, 2, |m| {
            m.on_local_get(0)?;
            m.on_local_get(1)?;
            m.on_local_get(2)?;
            m.on_call_indirect(0)
        })
    })
}

#[test]
fn test_call_indirect_matches_signatures_structurally() {
    let mut env = Environment::new();
    let m = load_dispatch_module(&mut env);
    let results = call(&mut env, m, "dispatch", &[Val::i32(7), Val::i32(8), Val::i32(0)]).unwrap();
    assert_eq!(results, [Val::i32(15)]);
}

#[test]
fn test_call_indirect_rejects_different_signature() {
    let mut env = Environment::new();
    let m = load_dispatch_module(&mut env);
    assert_eq!(
        trap_of(call(&mut env, m, "dispatch", &[Val::i32(7), Val::i32(8), Val::i32(1)])),
        Trap::IndirectCallSignatureMismatch
    );
}

#[test]
fn test_elem_segment_rollback() {
    let mut env = Environment::new();
    let host = env.append_host_module("env", None);
    env.append_host_table_export(host, "table", Table::new(Limits::new(2, None)))
        .unwrap();

    load(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_import_table("env", "table", Limits::new(2, None))?;
        m.on_function(0)?;
        m.begin_elem_segment(0)?;
        m.on_init_expr_i32_const(1)?;
        m.end_elem_segment_init_expr()?;
        m.on_elem_segment_function_index(0)?;
        body(m, 0, |_| Ok(()))
    });
    let installed = env.table(0).unwrap().elements.clone();
    assert_eq!(installed, [None, Some(0)]);
    let funcs_before = env.func_count();

    let err = load_err(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_import_table("env", "table", Limits::new(2, None))?;
        m.on_function(0)?;
        m.begin_elem_segment(0)?;
        m.on_init_expr_i32_const(0)?;
        m.end_elem_segment_init_expr()?;
        m.on_elem_segment_function_index(0)?;
        m.on_elem_segment_function_index(0)?;
        m.on_start_function(5)
    });
    assert_eq!(err, "invalid func_index: 5 (max 1)");
    assert_eq!(env.table(0).unwrap().elements, installed);
    assert_eq!(env.func_count(), funcs_before);
}

#[test]
fn test_table_validation_errors() {
    let mut env = Environment::new();
    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[])?;
        m.on_function(0)?;
        body(m, 0, |m| {
            m.on_local_get(0)?;
            m.on_call_indirect(0)
        })
    });
    assert_eq!(err, "found call_indirect operator, but no table");

    let err = load_err(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_function(0)?;
        m.on_table(Limits::new(1, None))?;
        m.begin_elem_segment(0)?;
        m.on_init_expr_i32_const(1)?;
        m.end_elem_segment_init_expr()?;
        m.on_elem_segment_function_index(0)
    });
    assert_eq!(err, "elem segment offset is out of bounds: 1 >= max value 1");

    let err = load_err(&mut env, |m| {
        m.on_table(Limits::new(1, None))?;
        m.begin_elem_segment(0)?;
        m.on_init_expr_i64_const(0)?;
        m.end_elem_segment_init_expr()
    });
    assert_eq!(err, "type mismatch in elem segment, expected i32 but got i64");
}

#[test]
fn test_host_table_import() {
    let mut env = Environment::new();
    let host = env.append_host_module("env", None);
    env.append_host_table_export(host, "table", Table::new(Limits::new(4, Some(8))))
        .unwrap();
    let err = load_err(&mut env, |m| m.on_import_table("env", "table", Limits::new(2, Some(4))));
    assert_eq!(err, "max size (8) larger than declared (4)");
    load(&mut env, |m| m.on_import_table("env", "table", Limits::new(2, Some(8))));
}

// ── Host functions and imports ────────────────────────────────────────────────

fn host_with_double(env: &mut Environment) -> u32 {
    let host = env.append_host_module("env", None);
    env.append_host_func_export(
        host,
        "double",
        FuncSignature::new(&[I32], &[I32]),
        Box::new(|args| Ok(vec![Val::i32(args[0].as_i32().unwrap_or(0).wrapping_mul(2))])),
    )
    .unwrap();
    host
}

#[test]
fn test_host_import_call() {
    let mut env = Environment::new();
    host_with_double(&mut env);
    let m = load(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_import_func("env", "double", 0)?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 1, "quad")?;
        body(m, 1, |m| {
            m.on_local_get(0)?;
            m.on_call(0)?;
            m.on_call(0)
        })
    });
    assert_eq!(call_i32(&mut env, m, "quad", &[Val::i32(5)]), 20);
}

#[test]
fn test_import_resolution_errors() {
    let mut env = Environment::new();
    host_with_double(&mut env);

    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_import_func("nope", "double", 0)
    });
    assert_eq!(err, "unknown import module \"nope\"");

    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_import_func("env", "triple", 0)
    });
    assert_eq!(err, "unknown module field \"triple\"");

    let err = load_err(&mut env, |m| m.on_import_memory("env", "double", Limits::new(1, None)));
    assert_eq!(err, "expected import \"env.double\" to have kind memory, not func");

    let err = load_err(&mut env, |m| {
        m.on_signature(&[I64], &[I32])?;
        m.on_import_func("env", "double", 0)
    });
    assert_eq!(err, "import signature mismatch");
}

#[test]
fn test_host_updates_memory_and_globals() {
    let mut env = Environment::new();
    let host = env.append_host_module("env", None);
    let mem = env
        .append_host_memory_export(host, "mem", Memory::new(Limits::new(1, None)))
        .unwrap();
    let bias = env.append_host_global_export(host, "bias", Val::i32(0), true).unwrap();
    let m = load(&mut env, |m| {
        m.on_signature(&[], &[I32])?;
        m.on_import_memory("env", "mem", Limits::new(1, None))?;
        m.on_import_global("env", "bias", I32, true)?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "read")?;
        body(m, 0, |m| {
            m.on_i32_const(0)?;
            m.on_load(Opcode::I32Load, 2, 0)?;
            m.on_global_get(0)?;
            m.on_binary(Opcode::I32Add)
        })
    });
    assert_eq!(call_i32(&mut env, m, "read", &[]), 0);

    env.memory_mut(mem)
        .unwrap()
        .store(0, 40u32.to_le_bytes())
        .unwrap();
    env.global_mut(bias).unwrap().value = Val::i32(2);
    assert_eq!(call_i32(&mut env, m, "read", &[]), 42);
}

#[test]
fn test_host_trap_propagates() {
    let mut env = Environment::new();
    let host = env.append_host_module("env", None);
    env.append_host_func_export(
        host,
        "fail",
        FuncSignature::new(&[], &[]),
        Box::new(|_| Err(HostError::new("refused"))),
    )
    .unwrap();
    let m = load(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_import_func("env", "fail", 0)?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 1, "run")?;
        body(m, 1, |m| m.on_call(0))
    });
    assert_eq!(trap_of(call(&mut env, m, "run", &[])), Trap::HostTrapped);
}

struct Recorder {
    log: Arc<Mutex<Vec<i32>>>,
}

impl ImportDelegate for Recorder {
    fn import_func(&self, _module: &str, field: &str, _sig: &FuncSignature) -> Result<HostCallback, HostError> {
        if field != "log" {
            return Err(HostError::new(format!("no host function {field}")));
        }
        let log = Arc::clone(&self.log);
        Ok(Box::new(move |args| {
            log.lock().unwrap().push(args[0].as_i32().unwrap());
            Ok(vec![])
        }))
    }

    fn import_global(&self, _module: &str, _field: &str, ty: ValType, _mutable: bool) -> Result<Val, HostError> {
        Ok(match ty {
            I32 => Val::i32(64),
            other => Val::default_for(other),
        })
    }
}

#[test]
fn test_import_delegate() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut env = Environment::new();
    let host = env.append_host_module("host", Some(Box::new(Recorder { log: Arc::clone(&log) })));

    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[])?;
        m.on_import_func("host", "print", 0)
    });
    assert_eq!(err, "no host function print");

    let m = load(&mut env, |m| {
        m.on_signature(&[I32], &[])?;
        m.on_signature(&[], &[I32])?;
        m.on_import_func("host", "log", 0)?;
        m.on_import_global("host", "width", I32, false)?;
        m.on_function(1)?;
        m.on_export(ExternalKind::Func, 1, "run")?;
        body(m, 1, |m| {
            m.on_i32_const(1)?;
            m.on_call(0)?;
            m.on_i32_const(2)?;
            m.on_call(0)?;
            m.on_global_get(0)
        })
    });
    assert_eq!(call_i32(&mut env, m, "run", &[]), 64);
    assert_eq!(*log.lock().unwrap(), [1, 2]);
    let host_module = env.module(host).unwrap();
    assert_eq!(host_module.export("log").map(|e| e.kind), Some(ExternalKind::Func));
    assert_eq!(host_module.export("width").map(|e| e.kind), Some(ExternalKind::Global));
}

#[test]
fn test_failed_load_removes_delegated_exports() {
    let mut env = Environment::new();
    let host = env.append_host_module("host", Some(Box::new(Recorder { log: Arc::default() })));
    let funcs_before = env.func_count();
    let err = load_err(&mut env, |m| {
        m.on_signature(&[I32], &[])?;
        m.on_import_func("host", "log", 0)?;
        m.on_start_function(0)
    });
    assert_eq!(err, "start function must be nullary");
    assert!(env.module(host).unwrap().export("log").is_none());
    assert_eq!(env.func_count(), funcs_before);
}

// ── Globals ───────────────────────────────────────────────────────────────────

#[test]
fn test_globals() {
    let mut env = Environment::new();
    let host = env.append_host_module("env", None);
    env.append_host_global_export(host, "base", Val::i32(10), false)
        .unwrap();
    let m = load(&mut env, |m| {
        m.on_signature(&[], &[I32])?;
        m.on_import_global("env", "base", I32, false)?;
        m.begin_global(I32, true)?;
        m.on_init_expr_global_get(0)?;
        m.end_global_init_expr()?;
        m.begin_global(I64, false)?;
        m.on_init_expr_i64_const(5)?;
        m.end_global_init_expr()?;
        m.on_export(ExternalKind::Global, 2, "five")?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "bump")?;
        body(m, 0, |m| {
            m.on_global_get(1)?;
            m.on_i32_const(1)?;
            m.on_binary(Opcode::I32Add)?;
            m.on_global_set(1)?;
            m.on_global_get(1)
        })
    });
    assert_eq!(call_i32(&mut env, m, "bump", &[]), 11);
    assert_eq!(call_i32(&mut env, m, "bump", &[]), 12);
    assert_eq!(Executor::get_global_export_by_name(&env, m, "five"), Ok(Val::i64(5)));
}

#[test]
fn test_global_validation_errors() {
    let mut env = Environment::new();
    let err = load_err(&mut env, |m| {
        m.begin_global(I32, true)?;
        m.on_init_expr_i32_const(0)?;
        m.end_global_init_expr()?;
        m.on_export(ExternalKind::Global, 0, "g")
    });
    assert_eq!(err, "mutable globals cannot be exported");

    let err = load_err(&mut env, |m| {
        m.begin_global(I32, false)?;
        m.on_init_expr_i32_const(0)?;
        m.end_global_init_expr()?;
        m.begin_global(I32, false)?;
        m.on_init_expr_global_get(0)
    });
    assert_eq!(err, "initializer expression can only reference an imported global");

    let err = load_err(&mut env, |m| {
        m.begin_global(I64, false)?;
        m.on_init_expr_i32_const(0)?;
        m.end_global_init_expr()
    });
    assert_eq!(err, "type mismatch in global, expected i64 but got i32.");

    let err = load_err(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.begin_global(I32, false)?;
        m.on_init_expr_i32_const(0)?;
        m.end_global_init_expr()?;
        m.on_function(0)?;
        body(m, 0, |m| {
            m.on_i32_const(1)?;
            m.on_global_set(0)
        })
    });
    assert_eq!(err, "can't global.set on immutable global at index 0.");
}

// ── Module-level validation ───────────────────────────────────────────────────

#[test]
fn test_start_function_runs() {
    let mut env = Environment::new();
    let m = load(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_signature(&[], &[I32])?;
        m.on_memory(Limits::new(1, None))?;
        m.on_function(0)?;
        m.on_function(1)?;
        m.on_export(ExternalKind::Func, 1, "peek")?;
        m.on_start_function(0)?;
        body(m, 0, |m| {
            m.on_i32_const(0)?;
            m.on_i32_const(42)?;
            m.on_store(Opcode::I32Store, 2, 16)
        })?;
        body(m, 1, |m| {
            m.on_i32_const(16)?;
            m.on_load(Opcode::I32Load, 2, 0)
        })
    });
    assert_eq!(call_i32(&mut env, m, "peek", &[]), 0);
    Executor::default().run_start_function(&mut env, m).unwrap();
    assert_eq!(call_i32(&mut env, m, "peek", &[]), 42);
}

#[test]
fn test_duplicate_export_rejected() {
    let mut env = Environment::new();
    let err = load_err(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 0, "f")?;
        m.on_export(ExternalKind::Func, 0, "f")
    });
    assert_eq!(err, "duplicate export \"f\"");
}

#[test]
fn test_type_mismatch_reported() {
    let mut env = Environment::new();
    let err = load_err(&mut env, |m| {
        m.on_signature(&[], &[I32])?;
        m.on_function(0)?;
        body(m, 0, |m| {
            m.on_i64_const(1)?;
            m.on_i32_const(2)?;
            m.on_binary(Opcode::I32Add)
        })
    });
    assert_eq!(err, "type mismatch in i32.add, expected [i32, i32] but got [i64, i32].");
}

#[test]
fn test_error_carries_reader_offset() {
    let mut env = Environment::new();
    let err = env
        .load_module(None, |m| {
            m.set_reader_offset(0x2a);
            m.on_function(3)
        })
        .unwrap_err();
    assert_eq!(err.offset, Some(0x2a));
    assert_eq!(err.to_string(), "@0x0000002a: invalid signature index: 3 (max 0)");
}

#[test]
fn test_missing_body_rejected() {
    let mut env = Environment::new();
    let err = load_err(&mut env, |m| {
        m.on_signature(&[], &[])?;
        m.on_function(0)
    });
    assert_eq!(err, "function 0 has no body");
}

#[test]
fn test_modules_link_through_registry() {
    let mut env = Environment::new();
    let lib = load_fib(&mut env);
    env.register_module("lib", lib);
    let app = load(&mut env, |m| {
        m.on_signature(&[I32], &[I32])?;
        m.on_import_func("lib", "fib", 0)?;
        m.on_function(0)?;
        m.on_export(ExternalKind::Func, 1, "fib_plus_one")?;
        body(m, 1, |m| {
            m.on_local_get(0)?;
            m.on_call(0)?;
            m.on_i32_const(1)?;
            m.on_binary(Opcode::I32Add)
        })
    });
    assert_eq!(call_i32(&mut env, app, "fib_plus_one", &[Val::i32(10)]), 56);
}
