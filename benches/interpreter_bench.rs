//! Interpreter benchmarks using Criterion.
//!
//! Run with: `cargo bench --bench interpreter_bench`
//!
//! The middle number of the three in each result is your actual measurement:
//!   fibonacci/fib(10)    time: [4.8 µs  >>4.9 µs<<  5.1 µs]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flatwasm::{
    memory::Memory, Environment, Executor, ExternalKind, FuncSignature, Limits, ModuleTranslator, Opcode,
    TranslateError, Val, ValType,
};

type Result<T> = std::result::Result<T, TranslateError>;

// ── Module builders ───────────────────────────────────────────────────────────

fn fib_events(m: &mut ModuleTranslator<'_>) -> Result<()> {
    m.on_signature(&[ValType::I32], &[ValType::I32])?;
    m.on_function(0)?;
    m.on_export(ExternalKind::Func, 0, "fib")?;
    m.begin_function_body(0)?;
    m.on_local_decl_count(0)?;
    m.on_local_get(0)?;
    m.on_i32_const(2)?;
    m.on_compare(Opcode::I32LtS)?;
    m.on_if(&[ValType::I32])?;
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
    m.on_end()?;
    m.end_function_body()
}

fn sum_events(m: &mut ModuleTranslator<'_>) -> Result<()> {
    m.on_signature(&[ValType::I32], &[ValType::I32])?;
    m.on_function(0)?;
    m.on_export(ExternalKind::Func, 0, "sum")?;
    m.begin_function_body(0)?;
    m.on_local_decl_count(1)?;
    m.on_local_decl(1, ValType::I32)?;
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
    m.on_local_get(1)?;
    m.end_function_body()
}

fn host_call_env() -> (Environment, u32) {
    let mut env = Environment::new();
    let host = env.append_host_module("env", None);
    env.append_host_func_export(
        host,
        "noop",
        FuncSignature::new(&[ValType::I32], &[ValType::I32]),
        Box::new(|args| Ok(args.to_vec())),
    )
    .unwrap();
    let module = env
        .load_module(None, |m| {
            m.on_signature(&[ValType::I32], &[ValType::I32])?;
            m.on_import_func("env", "noop", 0)?;
            m.on_function(0)?;
            m.on_export(ExternalKind::Func, 1, "call_host")?;
            m.begin_function_body(1)?;
            m.on_local_decl_count(0)?;
            m.on_local_get(0)?;
            m.on_call(0)?;
            m.end_function_body()
        })
        .unwrap();
    (env, module)
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_fibonacci(c: &mut Criterion) {
    let mut env = Environment::new();
    let module = env.load_module(None, fib_events).unwrap();
    let mut exec = Executor::default();
    let mut group = c.benchmark_group("fibonacci");
    for n in [10i32, 20, 25] {
        group.bench_with_input(BenchmarkId::new("fib", n), &n, |b, &n| {
            b.iter(|| {
                black_box(
                    exec.run_export_by_name(&mut env, module, "fib", &[Val::i32(black_box(n))])
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

fn bench_loop(c: &mut Criterion) {
    let mut env = Environment::new();
    let module = env.load_module(None, sum_events).unwrap();
    let mut exec = Executor::default();
    c.bench_function("loop/sum(1000)", |b| {
        b.iter(|| {
            black_box(
                exec.run_export_by_name(&mut env, module, "sum", &[Val::i32(black_box(1000))])
                    .unwrap(),
            )
        })
    });
}

fn bench_host_call(c: &mut Criterion) {
    let (mut env, module) = host_call_env();
    let mut exec = Executor::default();
    c.bench_function("host_call/round_trip", |b| {
        b.iter(|| {
            black_box(
                exec.run_export_by_name(&mut env, module, "call_host", &[Val::i32(black_box(42))])
                    .unwrap(),
            )
        })
    });
}

fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate");

    group.bench_function("fib_module", |b| {
        b.iter(|| {
            let mut env = Environment::new();
            black_box(env.load_module(None, fib_events).unwrap())
        })
    });

    // Failed loads roll the environment back; measure the round trip.
    group.bench_function("rejected_module", |b| {
        let mut env = Environment::new();
        b.iter(|| {
            black_box(
                env.load_module(None, |m| {
                    fib_events(m)?;
                    m.on_function(7)
                })
                .unwrap_err(),
            )
        })
    });

    group.finish();
}

fn bench_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory");
    let span = 65536 - 4;

    group.bench_function("store_u32", |b| {
        let mut mem = Memory::new(Limits::new(1, None));
        let mut offset = 0u64;
        b.iter(|| {
            mem.store(black_box(offset % span), black_box(0xDEAD_BEEFu32.to_le_bytes()))
                .unwrap();
            offset = offset.wrapping_add(4);
        })
    });

    group.bench_function("load_u32", |b| {
        let mem = Memory::new(Limits::new(1, None));
        let mut offset = 0u64;
        b.iter(|| {
            black_box(mem.load::<4>(black_box(offset % span)).unwrap());
            offset = offset.wrapping_add(4);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fibonacci,
    bench_loop,
    bench_host_call,
    bench_translate,
    bench_memory,
);
criterion_main!(benches);
