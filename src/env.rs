//! The shared environment: one arena of signatures, functions, tables,
//! memories, globals and bytecode for every module loaded into it.
//!
//! Modules hold indices into the arena, never references. Loading a module
//! only appends, so rolling back a failed load is a matter of truncating each
//! collection to the lengths recorded by [`Environment::mark`].

use std::collections::HashMap;

use tracing::debug;

use crate::compiler::codegen::Istream;
use crate::memory::Memory;
use crate::trap::{HostError, TranslateError};
use crate::types::{ExternalKind, FuncSignature, Limits, Val, ValType};

/// Callback behind a host function. Receives the typed arguments and returns
/// the typed results; an `Err` traps the calling thread.
pub type HostCallback = Box<dyn Fn(&[Val]) -> Result<Vec<Val>, HostError> + Send + Sync>;

// ── Functions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DefinedFunc {
    pub sig_index: u32,
    /// Entry point in the istream; `None` until the body is translated.
    pub offset: Option<u32>,
    pub local_decl_count: u32,
    pub local_count: u32,
    pub param_and_local_types: Vec<ValType>,
}

pub struct HostFunc {
    pub sig_index: u32,
    pub module_name: String,
    pub field_name: String,
    pub(crate) callback: HostCallback,
}

impl std::fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunc")
            .field("sig_index", &self.sig_index)
            .field("module_name", &self.module_name)
            .field("field_name", &self.field_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Func {
    Defined(DefinedFunc),
    Host(HostFunc),
}

impl Func {
    pub fn sig_index(&self) -> u32 {
        match self {
            Func::Defined(f) => f.sig_index,
            Func::Host(f) => f.sig_index,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Func::Host(_))
    }
}

// ── Tables and globals ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Table {
    pub limits: Limits,
    /// Environment function indices; `None` is an uninitialized slot.
    pub elements: Vec<Option<u32>>,
}

impl Table {
    pub fn new(limits: Limits) -> Self {
        Table {
            limits,
            elements: vec![None; limits.initial as usize],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub value: Val,
    pub mutable: bool,
    /// Index into the owning module's import list, for imported globals.
    pub import_index: Option<u32>,
}

// ── Modules ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExternalKind,
    /// Environment index of the exported item.
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module_name: String,
    pub field_name: String,
    pub kind: ExternalKind,
    /// Environment index the import resolved to.
    pub index: u32,
}

/// Materializes imports from a host module that has no matching export.
///
/// Every method may refuse with a message; the default refuses.
pub trait ImportDelegate: Send + Sync {
    fn import_func(&self, module: &str, field: &str, sig: &FuncSignature) -> Result<HostCallback, HostError> {
        let _ = sig;
        Err(HostError::new(format!("unknown host function import \"{module}.{field}\"")))
    }

    fn import_table(&self, module: &str, field: &str, limits: &Limits) -> Result<Table, HostError> {
        let _ = limits;
        Err(HostError::new(format!("unknown host table import \"{module}.{field}\"")))
    }

    fn import_memory(&self, module: &str, field: &str, limits: &Limits) -> Result<Memory, HostError> {
        let _ = limits;
        Err(HostError::new(format!("unknown host memory import \"{module}.{field}\"")))
    }

    fn import_global(&self, module: &str, field: &str, ty: ValType, mutable: bool) -> Result<Val, HostError> {
        let _ = (ty, mutable);
        Err(HostError::new(format!("unknown host global import \"{module}.{field}\"")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefinedModule {
    pub imports: Vec<Import>,
    pub istream_start: u32,
    pub istream_end: u32,
}

#[derive(Default)]
pub struct HostModule {
    pub(crate) delegate: Option<Box<dyn ImportDelegate>>,
}

pub enum ModuleKind {
    Defined(DefinedModule),
    Host(HostModule),
}

pub struct Module {
    pub name: String,
    exports: Vec<Export>,
    export_bindings: HashMap<String, usize>,
    pub memory_index: Option<u32>,
    pub table_index: Option<u32>,
    pub start_func_index: Option<u32>,
    pub kind: ModuleKind,
}

impl Module {
    pub(crate) fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Module {
            name: name.into(),
            exports: Vec::new(),
            export_bindings: HashMap::new(),
            memory_index: None,
            table_index: None,
            start_func_index: None,
            kind,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.kind, ModuleKind::Host(_))
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.export_bindings.get(name).map(|&i| &self.exports[i])
    }

    pub(crate) fn append_export(&mut self, kind: ExternalKind, index: u32, name: &str) -> Result<(), TranslateError> {
        if self.export_bindings.contains_key(name) {
            return Err(TranslateError::new(format!("duplicate export \"{name}\"")));
        }
        self.export_bindings.insert(name.to_string(), self.exports.len());
        self.exports.push(Export {
            name: name.to_string(),
            kind,
            index,
        });
        Ok(())
    }

    fn truncate_exports(&mut self, len: usize) {
        for export in self.exports.drain(len.min(self.exports.len())..) {
            self.export_bindings.remove(&export.name);
        }
    }

    pub(crate) fn delegate(&self) -> Option<&dyn ImportDelegate> {
        match &self.kind {
            ModuleKind::Host(host) => host.delegate.as_deref(),
            ModuleKind::Defined(_) => None,
        }
    }
}

// ── Environment ───────────────────────────────────────────────────────────────

/// Collection lengths captured before a module load.
#[derive(Debug, Clone)]
pub struct MarkPoint {
    modules: usize,
    sigs: usize,
    funcs: usize,
    memories: usize,
    tables: usize,
    globals: usize,
    istream: usize,
    export_counts: Vec<usize>,
}

#[derive(Default)]
pub struct Environment {
    pub(crate) modules: Vec<Module>,
    pub(crate) sigs: Vec<FuncSignature>,
    pub(crate) funcs: Vec<Func>,
    pub(crate) memories: Vec<Memory>,
    pub(crate) tables: Vec<Table>,
    pub(crate) globals: Vec<Global>,
    pub(crate) istream: Istream,
    module_bindings: HashMap<String, u32>,
    registered_module_bindings: HashMap<String, u32>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
    pub fn sig_count(&self) -> usize {
        self.sigs.len()
    }
    pub fn func_count(&self) -> usize {
        self.funcs.len()
    }
    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    pub fn module(&self, index: u32) -> Option<&Module> {
        self.modules.get(index as usize)
    }
    pub fn sig(&self, index: u32) -> Option<&FuncSignature> {
        self.sigs.get(index as usize)
    }
    pub fn func(&self, index: u32) -> Option<&Func> {
        self.funcs.get(index as usize)
    }
    pub fn memory(&self, index: u32) -> Option<&Memory> {
        self.memories.get(index as usize)
    }
    pub fn memory_mut(&mut self, index: u32) -> Option<&mut Memory> {
        self.memories.get_mut(index as usize)
    }
    pub fn table(&self, index: u32) -> Option<&Table> {
        self.tables.get(index as usize)
    }
    pub fn global(&self, index: u32) -> Option<&Global> {
        self.globals.get(index as usize)
    }
    pub fn global_mut(&mut self, index: u32) -> Option<&mut Global> {
        self.globals.get_mut(index as usize)
    }

    /// The shared bytecode of every loaded module.
    pub fn istream(&self) -> &[u8] {
        self.istream.data()
    }

    // ── Name bindings ────────────────────────────────────────────────────────

    pub fn find_module_by_name(&self, name: &str) -> Option<u32> {
        self.module_bindings.get(name).copied()
    }

    /// Module that imports named `name` resolve against.
    pub fn find_registered_module(&self, name: &str) -> Option<u32> {
        self.registered_module_bindings.get(name).copied()
    }

    /// Makes `module_index` importable under `name`.
    pub fn register_module(&mut self, name: impl Into<String>, module_index: u32) {
        self.registered_module_bindings.insert(name.into(), module_index);
    }

    pub(crate) fn bind_module_name(&mut self, name: impl Into<String>, module_index: u32) {
        self.module_bindings.insert(name.into(), module_index);
    }

    // ── Host modules ─────────────────────────────────────────────────────────

    /// Adds a host module, named and registered under `name`.
    pub fn append_host_module(&mut self, name: &str, delegate: Option<Box<dyn ImportDelegate>>) -> u32 {
        let index = self.modules.len() as u32;
        self.modules
            .push(Module::new(name, ModuleKind::Host(HostModule { delegate })));
        self.module_bindings.insert(name.to_string(), index);
        self.registered_module_bindings.insert(name.to_string(), index);
        debug!(module = name, index, "host module appended");
        index
    }

    fn host_module_mut(&mut self, module_index: u32) -> Result<&mut Module, TranslateError> {
        match self.modules.get_mut(module_index as usize) {
            Some(module) if module.is_host() => Ok(module),
            _ => Err(TranslateError::new(format!("module {module_index} is not a host module"))),
        }
    }

    /// Adds a host function export. Returns its environment function index.
    pub fn append_host_func_export(
        &mut self,
        module_index: u32,
        name: &str,
        sig: FuncSignature,
        callback: HostCallback,
    ) -> Result<u32, TranslateError> {
        let func_index = self.funcs.len() as u32;
        let module = self.host_module_mut(module_index)?;
        let module_name = module.name.clone();
        module.append_export(ExternalKind::Func, func_index, name)?;
        let sig_index = self.sigs.len() as u32;
        self.sigs.push(sig);
        self.funcs.push(Func::Host(HostFunc {
            sig_index,
            module_name,
            field_name: name.to_string(),
            callback,
        }));
        Ok(func_index)
    }

    pub fn append_host_global_export(
        &mut self,
        module_index: u32,
        name: &str,
        value: Val,
        mutable: bool,
    ) -> Result<u32, TranslateError> {
        let global_index = self.globals.len() as u32;
        self.host_module_mut(module_index)?
            .append_export(ExternalKind::Global, global_index, name)?;
        self.globals.push(Global {
            value,
            mutable,
            import_index: None,
        });
        Ok(global_index)
    }

    pub fn append_host_memory_export(
        &mut self,
        module_index: u32,
        name: &str,
        memory: Memory,
    ) -> Result<u32, TranslateError> {
        let memory_index = self.memories.len() as u32;
        let module = self.host_module_mut(module_index)?;
        module.append_export(ExternalKind::Memory, memory_index, name)?;
        module.memory_index = Some(memory_index);
        self.memories.push(memory);
        Ok(memory_index)
    }

    pub fn append_host_table_export(&mut self, module_index: u32, name: &str, table: Table) -> Result<u32, TranslateError> {
        let table_index = self.tables.len() as u32;
        let module = self.host_module_mut(module_index)?;
        module.append_export(ExternalKind::Table, table_index, name)?;
        module.table_index = Some(table_index);
        self.tables.push(table);
        Ok(table_index)
    }

    // ── Mark / reset ─────────────────────────────────────────────────────────

    pub fn mark(&self) -> MarkPoint {
        MarkPoint {
            modules: self.modules.len(),
            sigs: self.sigs.len(),
            funcs: self.funcs.len(),
            memories: self.memories.len(),
            tables: self.tables.len(),
            globals: self.globals.len(),
            istream: self.istream.len(),
            export_counts: self.modules.iter().map(|m| m.exports.len()).collect(),
        }
    }

    /// Drops everything appended since `mark`.
    pub fn reset_to_mark(&mut self, mark: &MarkPoint) {
        let limit = mark.modules as u32;
        self.module_bindings.retain(|_, &mut index| index < limit);
        self.registered_module_bindings.retain(|_, &mut index| index < limit);
        self.modules.truncate(mark.modules);
        let (memory_limit, table_limit) = (mark.memories as u32, mark.tables as u32);
        for (module, &count) in self.modules.iter_mut().zip(&mark.export_counts) {
            module.truncate_exports(count);
            module.memory_index = module.memory_index.filter(|&i| i < memory_limit);
            module.table_index = module.table_index.filter(|&i| i < table_limit);
        }
        self.sigs.truncate(mark.sigs);
        self.funcs.truncate(mark.funcs);
        self.memories.truncate(mark.memories);
        self.tables.truncate(mark.tables);
        self.globals.truncate(mark.globals);
        self.istream.truncate(mark.istream);
    }
}
