//! flatwasm: a WebAssembly translator and flat-bytecode interpreter.
//!
//! Modules are fed to an [`Environment`] as a stream of decode events. Each
//! function body is validated and lowered into a compact bytecode where all
//! branch targets are absolute offsets, then executed by a stack-based
//! [`Thread`].
//!
//! # Quick start
//!
//! ```rust
//! use flatwasm::{Environment, Executor, ExternalKind, Opcode, Val, ValType};
//!
//! let mut env = Environment::new();
//! let module = env
//!     .load_module(Some("demo"), |m| {
//!         m.on_signature(&[ValType::I32, ValType::I32], &[ValType::I32])?;
//!         m.on_function(0)?;
//!         m.on_export(ExternalKind::Func, 0, "add")?;
//!         m.begin_function_body(0)?;
//!         m.on_local_decl_count(0)?;
//!         m.on_local_get(0)?;
//!         m.on_local_get(1)?;
//!         m.on_binary(Opcode::I32Add)?;
//!         m.end_function_body()
//!     })
//!     .unwrap();
//!
//! let mut exec = Executor::default();
//! let results = exec
//!     .run_export_by_name(&mut env, module, "add", &[Val::i32(3), Val::i32(4)])
//!     .unwrap();
//! assert_eq!(results, [Val::i32(7)]);
//! ```

pub mod compiler;
pub mod config;
pub mod env;
pub mod executor;
pub mod ir;
pub mod literal;
pub mod memory;
pub mod numeric;
pub mod stack;
pub mod thread;
pub mod trap;
pub mod typeck;
pub mod types;

pub use compiler::ModuleTranslator;
pub use config::{ExecutorOptions, ThreadOptions};
pub use env::{Environment, HostCallback, ImportDelegate};
pub use executor::Executor;
pub use ir::Opcode;
pub use thread::{RunState, Thread};
pub use trap::{ExecError, HostError, ParseError, TranslateError, Trap};
pub use types::{ExternalKind, FuncSignature, Limits, Val, ValType};
