//! Top-level calls into an [`Environment`].
//!
//! The executor checks arguments, pushes them, drives its [`Thread`] in
//! quanta until the outermost function returns, and collects typed results.
//! Whatever the outcome, the thread's stacks are empty afterwards.

use tracing::{debug, trace};

use crate::config::ExecutorOptions;
use crate::env::{Environment, Export, Func};
use crate::thread::{call_host, RunState, Thread};
use crate::trap::{ExecError, Trap};
use crate::types::{ExternalKind, Val};

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug)]
pub struct Executor {
    thread: Thread,
    options: ExecutorOptions,
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new(ExecutorOptions::default())
    }
}

impl Executor {
    pub fn new(options: ExecutorOptions) -> Self {
        Executor {
            thread: Thread::new(options.thread),
            options,
        }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Calls environment function `func_index` with `args`.
    pub fn run_function(&mut self, env: &mut Environment, func_index: u32, args: &[Val]) -> Result<Vec<Val>> {
        let func = env
            .func(func_index)
            .ok_or_else(|| ExecError::UnknownExport(format!("func {func_index}")))?;
        let sig = env.sigs[func.sig_index() as usize].clone();
        let args_match = args.len() == sig.params.len()
            && args.iter().zip(&sig.params).all(|(arg, &ty)| arg.ty() == ty);
        if !args_match {
            return Err(ExecError::ArgumentTypeMismatch);
        }
        let entry = match func {
            Func::Defined(defined) => defined.offset,
            Func::Host(_) => None,
        };

        self.thread.reset();
        let outcome = self.invoke(env, func_index, entry, args);
        let results = outcome.map(|()| {
            let values = self.thread.value_stack().top_slice(sig.results.len());
            sig.results
                .iter()
                .zip(values)
                .map(|(&ty, &value)| Val::from_value(ty, value))
                .collect()
        });
        self.thread.reset();
        results.map_err(|trap| {
            debug!(func_index, %trap, "call trapped");
            ExecError::Trap(trap)
        })
    }

    fn invoke(&mut self, env: &mut Environment, func_index: u32, entry: Option<u32>, args: &[Val]) -> std::result::Result<(), Trap> {
        for arg in args {
            self.thread.push(arg.to_value())?;
        }
        match entry {
            Some(offset) => {
                self.thread.set_pc(offset);
                self.run_to_return(env)
            }
            None => call_host(self.thread.value_stack_mut(), &env.funcs, &env.sigs, func_index),
        }
    }

    fn run_to_return(&mut self, env: &mut Environment) -> std::result::Result<(), Trap> {
        let quantum = if self.options.trace { 1 } else { self.options.quantum.max(1) };
        loop {
            if self.options.trace {
                if let Some(op) = self.thread.current_opcode(env) {
                    trace!(
                        pc = self.thread.pc(),
                        opcode = op.name(),
                        stack_depth = self.thread.value_stack().len(),
                        call_depth = self.thread.call_depth(),
                        "step"
                    );
                }
            }
            if self.thread.run(env, quantum)? == RunState::Returned {
                return Ok(());
            }
        }
    }

    /// Runs the module's start function, if it has one.
    pub fn run_start_function(&mut self, env: &mut Environment, module_index: u32) -> Result<()> {
        let start = env.module(module_index).and_then(|m| m.start_func_index);
        if let Some(func_index) = start {
            self.run_function(env, func_index, &[])?;
        }
        Ok(())
    }

    pub fn run_export(&mut self, env: &mut Environment, export: &Export, args: &[Val]) -> Result<Vec<Val>> {
        if export.kind != ExternalKind::Func {
            return Err(ExecError::ExportKindMismatch {
                name: export.name.clone(),
                expected: ExternalKind::Func,
                actual: export.kind,
            });
        }
        self.run_function(env, export.index, args)
    }

    pub fn run_export_by_name(
        &mut self,
        env: &mut Environment,
        module_index: u32,
        name: &str,
        args: &[Val],
    ) -> Result<Vec<Val>> {
        let export = find_export(env, module_index, name)?;
        self.run_export(env, &export, args)
    }

    /// Current value of an exported global.
    pub fn get_global_export_by_name(env: &Environment, module_index: u32, name: &str) -> Result<Val> {
        let export = find_export(env, module_index, name)?;
        if export.kind != ExternalKind::Global {
            return Err(ExecError::ExportKindMismatch {
                name: export.name,
                expected: ExternalKind::Global,
                actual: export.kind,
            });
        }
        env.global(export.index)
            .map(|g| g.value)
            .ok_or(ExecError::UnknownExport(export.name))
    }
}

fn find_export(env: &Environment, module_index: u32, name: &str) -> Result<Export> {
    env.module(module_index)
        .and_then(|m| m.export(name))
        .cloned()
        .ok_or_else(|| ExecError::UnknownExport(name.to_string()))
}
