//! Binary-to-bytecode translation.
//!
//! A decoder walks a module's binary encoding and reports what it sees as
//! events on a [`ModuleTranslator`]. The translator resolves imports against
//! the [`Environment`], validates each function body with the
//! [`TypeChecker`], and emits interpreter bytecode into the environment's
//! istream. Branch targets are resolved during emission, so the VM never
//! sees `block`/`loop`/`if`/`end`.
//!
//! Module indices (function, global, signature) are remapped to environment
//! indices as items are declared; imports come first in each index space.

pub mod codegen;

use std::collections::HashSet;

use tracing::debug;

use crate::env::{
    DefinedFunc, DefinedModule, Environment, Export, Func, Global, HostFunc, Import, Module, ModuleKind,
    Table,
};
use crate::ir::Opcode;
use crate::memory::{Memory, MAX_PAGES};
use crate::trap::TranslateError;
use crate::typeck::{LabelKind, TypeChecker};
use crate::types::{ExternalKind, FuncSignature, Limits, Val, ValType};

use codegen::{br_table_data_size, CodeGen, Istream, INVALID_OFFSET};

pub type Result<T> = std::result::Result<T, TranslateError>;

/// Most locals a single function may declare.
pub const MAX_LOCALS: u32 = 50_000;

struct ElemSegmentEntry {
    table_index: u32,
    dst: u32,
    func_index: u32,
}

struct DataSegment {
    memory_index: u32,
    dst: u32,
    data: Vec<u8>,
}

/// Where an import's item comes from.
enum ImportSource {
    Export(u32),
    Delegate,
}

impl Environment {
    /// Translates one module.
    ///
    /// `decode` drives the translator with the module's decode events. On
    /// success the module is appended and its environment index returned;
    /// on failure every append made since the call began is rolled back.
    pub fn load_module<F>(&mut self, name: Option<&str>, decode: F) -> Result<u32>
    where
        F: FnOnce(&mut ModuleTranslator<'_>) -> Result<()>,
    {
        let mark = self.mark();
        let istream_start = self.istream.len();
        debug!(module = name.unwrap_or(""), istream_start, "translating module");
        let result = {
            let mut translator = ModuleTranslator::new(self, name);
            decode(&mut translator).and_then(|()| translator.finish())
        };
        match result {
            Ok(index) => {
                debug!(
                    module = name.unwrap_or(""),
                    index,
                    istream_start,
                    istream_end = self.istream.len(),
                    "module loaded"
                );
                Ok(index)
            }
            Err(err) => {
                debug!(module = name.unwrap_or(""), error = %err, "module rejected, rolling back");
                self.reset_to_mark(&mark);
                Err(err)
            }
        }
    }
}

/// Receives decode events for one module and translates them.
pub struct ModuleTranslator<'env> {
    env: &'env mut Environment,
    name: Option<String>,
    typeck: TypeChecker,
    codegen: CodeGen,
    reader_offset: Option<usize>,

    sig_index_mapping: Vec<u32>,
    func_index_mapping: Vec<u32>,
    global_index_mapping: Vec<u32>,
    num_func_imports: u32,
    num_global_imports: u32,

    imports: Vec<Import>,
    exports: Vec<Export>,
    export_names: HashSet<String>,
    memory_index: Option<u32>,
    table_index: Option<u32>,
    start_func_index: Option<u32>,
    istream_start: u32,

    current_func: Option<u32>,
    local_decls_seen: u32,
    current_global: Option<u32>,
    init_expr_value: Option<Val>,
    segment_offset: u64,
    elem_segment_entries: Vec<ElemSegmentEntry>,
    data_segments: Vec<DataSegment>,
}

impl<'env> ModuleTranslator<'env> {
    fn new(env: &'env mut Environment, name: Option<&str>) -> Self {
        let istream_start = env.istream.offset();
        ModuleTranslator {
            env,
            name: name.map(str::to_string),
            typeck: TypeChecker::new(),
            codegen: CodeGen::new(),
            reader_offset: None,
            sig_index_mapping: Vec::new(),
            func_index_mapping: Vec::new(),
            global_index_mapping: Vec::new(),
            num_func_imports: 0,
            num_global_imports: 0,
            imports: Vec::new(),
            exports: Vec::new(),
            export_names: HashSet::new(),
            memory_index: None,
            table_index: None,
            start_func_index: None,
            istream_start,
            current_func: None,
            local_decls_seen: 0,
            current_global: None,
            init_expr_value: None,
            segment_offset: 0,
            elem_segment_entries: Vec::new(),
            data_segments: Vec::new(),
        }
    }

    /// Byte offset in the module binary, attached to subsequent errors.
    pub fn set_reader_offset(&mut self, offset: usize) {
        self.reader_offset = Some(offset);
    }

    fn error(&self, message: impl Into<String>) -> TranslateError {
        TranslateError {
            offset: self.reader_offset,
            message: message.into(),
        }
    }

    fn locate(&self, mut err: TranslateError) -> TranslateError {
        if err.offset.is_none() {
            err.offset = self.reader_offset;
        }
        err
    }

    fn istream(&mut self) -> &mut Istream {
        &mut self.env.istream
    }

    // ── Index mapping ────────────────────────────────────────────────────────

    fn sig_env_index(&self, sig_index: u32) -> Result<u32> {
        self.sig_index_mapping
            .get(sig_index as usize)
            .copied()
            .ok_or_else(|| {
                self.error(format!(
                    "invalid signature index: {sig_index} (max {})",
                    self.sig_index_mapping.len()
                ))
            })
    }

    fn func_env_index(&self, func_index: u32) -> Result<u32> {
        self.func_index_mapping
            .get(func_index as usize)
            .copied()
            .ok_or_else(|| {
                self.error(format!(
                    "invalid func_index: {func_index} (max {})",
                    self.func_index_mapping.len()
                ))
            })
    }

    fn global_env_index(&self, global_index: u32) -> Result<u32> {
        self.global_index_mapping
            .get(global_index as usize)
            .copied()
            .ok_or_else(|| {
                self.error(format!(
                    "invalid global_index: {global_index} (max {})",
                    self.global_index_mapping.len()
                ))
            })
    }

    fn env_sig(&self, env_sig_index: u32) -> FuncSignature {
        self.env.sigs[env_sig_index as usize].clone()
    }

    fn func_sig(&self, env_func_index: u32) -> FuncSignature {
        self.env_sig(self.env.funcs[env_func_index as usize].sig_index())
    }

    fn require_memory(&self, op: Opcode) -> Result<u32> {
        self.memory_index
            .ok_or_else(|| self.error(format!("{op} requires an imported or defined memory.")))
    }

    // ── Types ────────────────────────────────────────────────────────────────

    pub fn on_signature(&mut self, params: &[ValType], results: &[ValType]) -> Result<()> {
        self.sig_index_mapping.push(self.env.sigs.len() as u32);
        self.env.sigs.push(FuncSignature::new(params, results));
        Ok(())
    }

    // ── Imports ──────────────────────────────────────────────────────────────

    fn resolve_import(&self, module_name: &str, field_name: &str, kind: ExternalKind) -> Result<(usize, ImportSource)> {
        let module_index = self
            .env
            .find_registered_module(module_name)
            .ok_or_else(|| self.error(format!("unknown import module \"{module_name}\"")))?
            as usize;
        let module = &self.env.modules[module_index];
        match module.export(field_name) {
            Some(export) if export.kind != kind => Err(self.error(format!(
                "expected import \"{module_name}.{field_name}\" to have kind {kind}, not {}",
                export.kind
            ))),
            Some(export) => Ok((module_index, ImportSource::Export(export.index))),
            None if module.delegate().is_some() => Ok((module_index, ImportSource::Delegate)),
            None => Err(self.error(format!("unknown module field \"{field_name}\""))),
        }
    }

    fn record_import(&mut self, module_name: &str, field_name: &str, kind: ExternalKind, index: u32) {
        self.imports.push(Import {
            module_name: module_name.to_string(),
            field_name: field_name.to_string(),
            kind,
            index,
        });
    }

    fn host_export(&mut self, module_index: usize, kind: ExternalKind, index: u32, field_name: &str) -> Result<()> {
        self.env.modules[module_index]
            .append_export(kind, index, field_name)
            .map_err(|e| self.locate(e))
    }

    fn check_import_limits(&self, declared: &Limits, actual: &Limits) -> Result<()> {
        if actual.initial < declared.initial {
            return Err(self.error(format!(
                "actual size ({}) smaller than declared ({})",
                actual.initial, declared.initial
            )));
        }
        if let Some(declared_max) = declared.max {
            match actual.max {
                None => {
                    return Err(self.error(format!(
                        "max size (unspecified) larger than declared ({declared_max})"
                    )))
                }
                Some(actual_max) if actual_max > declared_max => {
                    return Err(self.error(format!(
                        "max size ({actual_max}) larger than declared ({declared_max})"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn on_import_func(&mut self, module_name: &str, field_name: &str, sig_index: u32) -> Result<()> {
        let sig_env_index = self.sig_env_index(sig_index)?;
        let (module_index, source) = self.resolve_import(module_name, field_name, ExternalKind::Func)?;
        let func_index = match source {
            ImportSource::Export(func_index) => {
                if self.func_sig(func_index) != self.env.sigs[sig_env_index as usize] {
                    return Err(self.error("import signature mismatch"));
                }
                func_index
            }
            ImportSource::Delegate => {
                let sig = self.env_sig(sig_env_index);
                let callback = self.env.modules[module_index]
                    .delegate()
                    .map(|d| d.import_func(module_name, field_name, &sig))
                    .transpose()
                    .map_err(|e| self.error(e.0))?
                    .ok_or_else(|| self.error(format!("unknown module field \"{field_name}\"")))?;
                let func_index = self.env.funcs.len() as u32;
                self.env.funcs.push(Func::Host(HostFunc {
                    sig_index: sig_env_index,
                    module_name: module_name.to_string(),
                    field_name: field_name.to_string(),
                    callback,
                }));
                self.host_export(module_index, ExternalKind::Func, func_index, field_name)?;
                func_index
            }
        };
        self.func_index_mapping.push(func_index);
        self.num_func_imports += 1;
        self.record_import(module_name, field_name, ExternalKind::Func, func_index);
        Ok(())
    }

    pub fn on_import_table(&mut self, module_name: &str, field_name: &str, limits: Limits) -> Result<()> {
        if self.table_index.is_some() {
            return Err(self.error("only one table allowed"));
        }
        let (module_index, source) = self.resolve_import(module_name, field_name, ExternalKind::Table)?;
        let table_index = match source {
            ImportSource::Export(table_index) => {
                self.check_import_limits(&limits, &self.env.tables[table_index as usize].limits)?;
                table_index
            }
            ImportSource::Delegate => {
                let table = self.env.modules[module_index]
                    .delegate()
                    .map(|d| d.import_table(module_name, field_name, &limits))
                    .transpose()
                    .map_err(|e| self.error(e.0))?
                    .ok_or_else(|| self.error(format!("unknown module field \"{field_name}\"")))?;
                self.check_import_limits(&limits, &table.limits)?;
                let table_index = self.env.tables.len() as u32;
                self.env.tables.push(table);
                self.host_export(module_index, ExternalKind::Table, table_index, field_name)?;
                table_index
            }
        };
        self.table_index = Some(table_index);
        self.record_import(module_name, field_name, ExternalKind::Table, table_index);
        Ok(())
    }

    pub fn on_import_memory(&mut self, module_name: &str, field_name: &str, limits: Limits) -> Result<()> {
        if self.memory_index.is_some() {
            return Err(self.error("only one memory allowed"));
        }
        let (module_index, source) = self.resolve_import(module_name, field_name, ExternalKind::Memory)?;
        let memory_index = match source {
            ImportSource::Export(memory_index) => {
                self.check_import_limits(&limits, &self.env.memories[memory_index as usize].limits())?;
                memory_index
            }
            ImportSource::Delegate => {
                let memory = self.env.modules[module_index]
                    .delegate()
                    .map(|d| d.import_memory(module_name, field_name, &limits))
                    .transpose()
                    .map_err(|e| self.error(e.0))?
                    .ok_or_else(|| self.error(format!("unknown module field \"{field_name}\"")))?;
                self.check_import_limits(&limits, &memory.limits())?;
                let memory_index = self.env.memories.len() as u32;
                self.env.memories.push(memory);
                self.host_export(module_index, ExternalKind::Memory, memory_index, field_name)?;
                memory_index
            }
        };
        self.memory_index = Some(memory_index);
        self.record_import(module_name, field_name, ExternalKind::Memory, memory_index);
        Ok(())
    }

    pub fn on_import_global(&mut self, module_name: &str, field_name: &str, ty: ValType, mutable: bool) -> Result<()> {
        let (module_index, source) = self.resolve_import(module_name, field_name, ExternalKind::Global)?;
        let import_index = self.imports.len() as u32;
        let global_index = match source {
            ImportSource::Export(global_index) => {
                let global = &self.env.globals[global_index as usize];
                if global.value.ty() != ty {
                    return Err(self.error(format!(
                        "type mismatch in imported global, expected {ty} but got {}.",
                        global.value.ty()
                    )));
                }
                if global.mutable != mutable {
                    return Err(self.error("mutability mismatch in imported global"));
                }
                global_index
            }
            ImportSource::Delegate => {
                let value = self.env.modules[module_index]
                    .delegate()
                    .map(|d| d.import_global(module_name, field_name, ty, mutable))
                    .transpose()
                    .map_err(|e| self.error(e.0))?
                    .ok_or_else(|| self.error(format!("unknown module field \"{field_name}\"")))?;
                if value.ty() != ty {
                    return Err(self.error(format!(
                        "type mismatch in imported global, expected {ty} but got {}.",
                        value.ty()
                    )));
                }
                let global_index = self.env.globals.len() as u32;
                self.env.globals.push(Global {
                    value,
                    mutable,
                    import_index: Some(import_index),
                });
                self.host_export(module_index, ExternalKind::Global, global_index, field_name)?;
                global_index
            }
        };
        self.global_index_mapping.push(global_index);
        self.num_global_imports += 1;
        self.record_import(module_name, field_name, ExternalKind::Global, global_index);
        Ok(())
    }

    // ── Definitions ──────────────────────────────────────────────────────────

    /// Declares a function defined by this module; its body arrives later.
    pub fn on_function(&mut self, sig_index: u32) -> Result<()> {
        let sig_env_index = self.sig_env_index(sig_index)?;
        let params = self.env.sigs[sig_env_index as usize].params.clone();
        self.func_index_mapping.push(self.env.funcs.len() as u32);
        self.env.funcs.push(Func::Defined(DefinedFunc {
            sig_index: sig_env_index,
            offset: None,
            local_decl_count: 0,
            local_count: 0,
            param_and_local_types: params,
        }));
        self.codegen.add_func();
        Ok(())
    }

    pub fn on_table(&mut self, limits: Limits) -> Result<()> {
        if self.table_index.is_some() {
            return Err(self.error("only one table allowed"));
        }
        if limits.max.is_some_and(|max| max < limits.initial) {
            return Err(self.error("table max must be at least initial size"));
        }
        self.table_index = Some(self.env.tables.len() as u32);
        self.env.tables.push(Table::new(limits));
        Ok(())
    }

    pub fn on_memory(&mut self, limits: Limits) -> Result<()> {
        if self.memory_index.is_some() {
            return Err(self.error("only one memory allowed"));
        }
        if limits.initial > MAX_PAGES || limits.max.is_some_and(|max| max > MAX_PAGES) {
            return Err(self.error(format!("memory size must be at most {MAX_PAGES} pages (4GiB)")));
        }
        if limits.max.is_some_and(|max| max < limits.initial) {
            return Err(self.error("memory max must be at least initial size"));
        }
        self.memory_index = Some(self.env.memories.len() as u32);
        self.env.memories.push(Memory::new(limits));
        Ok(())
    }

    pub fn begin_global(&mut self, ty: ValType, mutable: bool) -> Result<()> {
        let global_index = self.env.globals.len() as u32;
        self.env.globals.push(Global {
            value: Val::default_for(ty),
            mutable,
            import_index: None,
        });
        self.global_index_mapping.push(global_index);
        self.current_global = Some(global_index);
        self.init_expr_value = None;
        Ok(())
    }

    pub fn end_global_init_expr(&mut self) -> Result<()> {
        let global_index = self
            .current_global
            .take()
            .ok_or_else(|| self.error("initializer expression outside of a global"))?;
        let value = self.take_init_expr_value()?;
        let expected = self.env.globals[global_index as usize].value.ty();
        if value.ty() != expected {
            return Err(self.error(format!(
                "type mismatch in global, expected {expected} but got {}.",
                value.ty()
            )));
        }
        self.env.globals[global_index as usize].value = value;
        Ok(())
    }

    // ── Initializer expressions ──────────────────────────────────────────────

    fn take_init_expr_value(&mut self) -> Result<Val> {
        self.init_expr_value
            .take()
            .ok_or_else(|| self.error("initializer expression is empty"))
    }

    pub fn on_init_expr_i32_const(&mut self, value: u32) -> Result<()> {
        self.init_expr_value = Some(Val::I32(value));
        Ok(())
    }

    pub fn on_init_expr_i64_const(&mut self, value: u64) -> Result<()> {
        self.init_expr_value = Some(Val::I64(value));
        Ok(())
    }

    pub fn on_init_expr_f32_const(&mut self, bits: u32) -> Result<()> {
        self.init_expr_value = Some(Val::F32(bits));
        Ok(())
    }

    pub fn on_init_expr_f64_const(&mut self, bits: u64) -> Result<()> {
        self.init_expr_value = Some(Val::F64(bits));
        Ok(())
    }

    pub fn on_init_expr_global_get(&mut self, global_index: u32) -> Result<()> {
        if global_index >= self.num_global_imports {
            return Err(self.error("initializer expression can only reference an imported global"));
        }
        let global = &self.env.globals[self.global_env_index(global_index)? as usize];
        if global.mutable {
            return Err(self.error("initializer expression cannot reference a mutable global"));
        }
        let value = global.value;
        self.init_expr_value = Some(value);
        Ok(())
    }

    // ── Exports and start ────────────────────────────────────────────────────

    pub fn on_export(&mut self, kind: ExternalKind, item_index: u32, name: &str) -> Result<()> {
        let index = match kind {
            ExternalKind::Func => self.func_env_index(item_index)?,
            ExternalKind::Table => self
                .table_index
                .filter(|_| item_index == 0)
                .ok_or_else(|| self.error(format!("invalid table index: {item_index}")))?,
            ExternalKind::Memory => self
                .memory_index
                .filter(|_| item_index == 0)
                .ok_or_else(|| self.error(format!("invalid memory index: {item_index}")))?,
            ExternalKind::Global => {
                let global_index = self.global_env_index(item_index)?;
                if self.env.globals[global_index as usize].mutable {
                    return Err(self.error("mutable globals cannot be exported"));
                }
                global_index
            }
        };
        if !self.export_names.insert(name.to_string()) {
            return Err(self.error(format!("duplicate export \"{name}\"")));
        }
        self.exports.push(Export {
            name: name.to_string(),
            kind,
            index,
        });
        Ok(())
    }

    pub fn on_start_function(&mut self, func_index: u32) -> Result<()> {
        let env_index = self.func_env_index(func_index)?;
        let sig = self.func_sig(env_index);
        if !sig.params.is_empty() {
            return Err(self.error("start function must be nullary"));
        }
        if !sig.results.is_empty() {
            return Err(self.error("start function must not return anything"));
        }
        self.start_func_index = Some(env_index);
        Ok(())
    }

    // ── Segments ─────────────────────────────────────────────────────────────

    pub fn begin_elem_segment(&mut self, table_index: u32) -> Result<()> {
        if table_index != 0 || self.table_index.is_none() {
            return Err(self.error(format!("invalid table index: {table_index}")));
        }
        self.init_expr_value = None;
        Ok(())
    }

    pub fn end_elem_segment_init_expr(&mut self) -> Result<()> {
        match self.take_init_expr_value()? {
            Val::I32(offset) => {
                self.segment_offset = offset as u64;
                Ok(())
            }
            other => Err(self.error(format!(
                "type mismatch in elem segment, expected i32 but got {}",
                other.ty()
            ))),
        }
    }

    pub fn on_elem_segment_function_index(&mut self, func_index: u32) -> Result<()> {
        let table_index = self
            .table_index
            .ok_or_else(|| self.error("elem segment requires a table"))?;
        let max = self.env.tables[table_index as usize].elements.len() as u64;
        let dst = self.segment_offset;
        if dst >= max {
            return Err(self.error(format!("elem segment offset is out of bounds: {dst} >= max value {max}")));
        }
        let env_func_index = self.func_env_index(func_index)?;
        self.elem_segment_entries.push(ElemSegmentEntry {
            table_index,
            dst: dst as u32,
            func_index: env_func_index,
        });
        self.segment_offset += 1;
        Ok(())
    }

    pub fn begin_data_segment(&mut self, memory_index: u32) -> Result<()> {
        if memory_index != 0 || self.memory_index.is_none() {
            return Err(self.error(format!("invalid memory index: {memory_index}")));
        }
        self.init_expr_value = None;
        Ok(())
    }

    pub fn end_data_segment_init_expr(&mut self) -> Result<()> {
        match self.take_init_expr_value()? {
            Val::I32(offset) => {
                self.segment_offset = offset as u64;
                Ok(())
            }
            other => Err(self.error(format!(
                "type mismatch in data segment, expected i32 but got {}",
                other.ty()
            ))),
        }
    }

    pub fn on_data_segment_data(&mut self, data: &[u8]) -> Result<()> {
        let memory_index = self
            .memory_index
            .ok_or_else(|| self.error("data segment requires a memory"))?;
        let max = self.env.memories[memory_index as usize].size() as u64;
        let start = self.segment_offset;
        let end = start + data.len() as u64;
        if end > max {
            return Err(self.error(format!(
                "data segment is out of bounds: [{start}, {end}) >= max value {max}"
            )));
        }
        self.data_segments.push(DataSegment {
            memory_index,
            dst: start as u32,
            data: data.to_vec(),
        });
        Ok(())
    }

    // ── Function bodies ──────────────────────────────────────────────────────

    fn current_func(&self) -> Result<&DefinedFunc> {
        match self.current_func.map(|i| &self.env.funcs[i as usize]) {
            Some(Func::Defined(func)) => Ok(func),
            _ => Err(self.error("no function body is open")),
        }
    }

    fn current_func_mut(&mut self) -> Result<&mut DefinedFunc> {
        let err = self.error("no function body is open");
        match self.current_func.map(|i| &mut self.env.funcs[i as usize]) {
            Some(Func::Defined(func)) => Ok(func),
            _ => Err(err),
        }
    }

    /// Opens the body of module function `func_index`.
    pub fn begin_function_body(&mut self, func_index: u32) -> Result<()> {
        let env_index = self.func_env_index(func_index)?;
        let defined_index = func_index
            .checked_sub(self.num_func_imports)
            .ok_or_else(|| self.error(format!("function {func_index} is imported and has no body")))?
            as usize;
        let offset = self.env.istream.offset();
        let sig_index = match &self.env.funcs[env_index as usize] {
            Func::Defined(func) if func.offset.is_none() => func.sig_index,
            _ => return Err(self.error(format!("duplicate body for function {func_index}"))),
        };
        if let Func::Defined(func) = &mut self.env.funcs[env_index as usize] {
            func.offset = Some(offset);
        }
        self.codegen
            .resolve_func_fixups(&mut self.env.istream, defined_index, offset);

        let results = self.env.sigs[sig_index as usize].results.clone();
        self.typeck.begin_function(&results);
        self.codegen.reset_labels();
        self.codegen.push_label(INVALID_OFFSET, INVALID_OFFSET);
        self.current_func = Some(env_index);
        self.local_decls_seen = 0;
        Ok(())
    }

    pub fn on_local_decl_count(&mut self, count: u32) -> Result<()> {
        self.current_func_mut()?.local_decl_count = count;
        Ok(())
    }

    /// One run of `count` locals of type `ty`. The last declaration emits the
    /// `alloca` that reserves every local at function entry.
    pub fn on_local_decl(&mut self, count: u32, ty: ValType) -> Result<()> {
        let too_many = self.error("too many locals");
        let extra_decl = self.error(format!(
            "local declaration {} exceeds declared count",
            self.local_decls_seen
        ));
        let decls_seen = self.local_decls_seen;
        let func = self.current_func_mut()?;
        if decls_seen >= func.local_decl_count {
            return Err(extra_decl);
        }
        let local_count = func
            .local_count
            .checked_add(count)
            .filter(|&n| n <= MAX_LOCALS)
            .ok_or(too_many)?;
        func.local_count = local_count;
        func.param_and_local_types
            .extend(std::iter::repeat(ty).take(count as usize));
        let decl_count = func.local_decl_count;
        self.local_decls_seen += 1;
        if self.local_decls_seen == decl_count && local_count > 0 {
            let istream = self.istream();
            istream.emit_opcode(Opcode::Alloca);
            istream.emit_u32(local_count);
        }
        Ok(())
    }

    pub fn end_function_body(&mut self) -> Result<()> {
        self.codegen.fixup_top_label(&mut self.env.istream);
        let (drop, keep) = self.return_drop_keep()?;
        self.typeck.end_function().map_err(|e| self.locate(e))?;
        self.codegen.emit_drop_keep(&mut self.env.istream, drop, keep);
        self.istream().emit_opcode(Opcode::Return);
        self.codegen.pop_label();
        self.current_func = None;
        Ok(())
    }

    // ── Branch bookkeeping ───────────────────────────────────────────────────

    /// Values discarded and carried by a branch to label `depth`.
    fn br_drop_keep(&self, depth: u32) -> Result<(u32, u32)> {
        let label = self.typeck.label(depth).map_err(|e| self.locate(e))?;
        let keep = label.branch_sig().len();
        let drop = if self.typeck.is_unreachable() {
            0
        } else {
            self.typeck
                .type_stack_len()
                .saturating_sub(label.type_stack_limit + keep)
        };
        Ok((drop as u32, keep as u32))
    }

    /// Like a branch to the function label, but also discards the params
    /// and locals.
    fn return_drop_keep(&self) -> Result<(u32, u32)> {
        let depth = self.typeck.label_count().saturating_sub(1) as u32;
        let (drop, keep) = self.br_drop_keep(depth)?;
        let locals = self.current_func()?.param_and_local_types.len() as u32;
        Ok((drop + locals, keep))
    }

    /// Distance from the top of the value stack to local `local_index`.
    fn translate_local_index(&self, local_index: u32) -> Result<u32> {
        let count = self.current_func()?.param_and_local_types.len();
        Ok((self.typeck.type_stack_len() + count) as u32 - local_index)
    }

    fn local_type(&self, local_index: u32) -> Result<ValType> {
        let types = &self.current_func()?.param_and_local_types;
        types.get(local_index as usize).copied().ok_or_else(|| {
            self.error(format!(
                "invalid local_index: {local_index} (max {})",
                types.len()
            ))
        })
    }

    // ── Control ──────────────────────────────────────────────────────────────

    pub fn on_unreachable(&mut self) -> Result<()> {
        self.typeck.on_unreachable().map_err(|e| self.locate(e))?;
        self.istream().emit_opcode(Opcode::Unreachable);
        Ok(())
    }

    pub fn on_nop(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn on_block(&mut self, sig: &[ValType]) -> Result<()> {
        self.typeck.on_block(sig);
        self.codegen.push_label(INVALID_OFFSET, INVALID_OFFSET);
        Ok(())
    }

    pub fn on_loop(&mut self, sig: &[ValType]) -> Result<()> {
        self.typeck.on_loop(sig);
        let head = self.env.istream.offset();
        self.codegen.push_label(head, INVALID_OFFSET);
        Ok(())
    }

    pub fn on_if(&mut self, sig: &[ValType]) -> Result<()> {
        self.typeck.on_if(sig).map_err(|e| self.locate(e))?;
        let istream = self.istream();
        istream.emit_opcode(Opcode::BrUnless);
        let fixup = istream.offset();
        istream.emit_u32(INVALID_OFFSET);
        self.codegen.push_label(INVALID_OFFSET, fixup);
        Ok(())
    }

    pub fn on_else(&mut self) -> Result<()> {
        self.typeck.on_else().map_err(|e| self.locate(e))?;
        let cond_fixup = self
            .codegen
            .top_label()
            .map(|l| l.fixup_offset)
            .unwrap_or(INVALID_OFFSET);
        let istream = &mut self.env.istream;
        istream.emit_opcode(Opcode::Br);
        let else_fixup = istream.offset();
        istream.emit_u32(INVALID_OFFSET);
        let else_start = istream.offset();
        istream.emit_u32_at(cond_fixup, else_start);
        self.codegen.set_top_fixup_offset(else_fixup);
        Ok(())
    }

    pub fn on_end(&mut self) -> Result<()> {
        let kind = self.typeck.label(0).map_err(|e| self.locate(e))?.kind;
        self.typeck.on_end().map_err(|e| self.locate(e))?;
        if matches!(kind, LabelKind::If | LabelKind::Else) {
            if let Some(label) = self.codegen.top_label() {
                let end = self.env.istream.offset();
                self.env.istream.emit_u32_at(label.fixup_offset, end);
            }
        }
        self.codegen.fixup_top_label(&mut self.env.istream);
        self.codegen.pop_label();
        Ok(())
    }

    pub fn on_br(&mut self, depth: u32) -> Result<()> {
        let (drop, keep) = self.br_drop_keep(depth)?;
        self.typeck.on_br(depth).map_err(|e| self.locate(e))?;
        self.codegen.emit_br(&mut self.env.istream, depth, drop, keep);
        Ok(())
    }

    /// Lowered with the condition inverted, so the taken path can adjust the
    /// stack before branching.
    pub fn on_br_if(&mut self, depth: u32) -> Result<()> {
        self.typeck.on_br_if(depth).map_err(|e| self.locate(e))?;
        let (drop, keep) = self.br_drop_keep(depth)?;
        let istream = &mut self.env.istream;
        istream.emit_opcode(Opcode::BrUnless);
        let skip_fixup = istream.offset();
        istream.emit_u32(INVALID_OFFSET);
        self.codegen.emit_br(istream, depth, drop, keep);
        let skip = istream.offset();
        istream.emit_u32_at(skip_fixup, skip);
        Ok(())
    }

    pub fn on_br_table(&mut self, targets: &[u32], default_target: u32) -> Result<()> {
        self.typeck.begin_br_table().map_err(|e| self.locate(e))?;
        let (num_targets, data_size) = u32::try_from(targets.len())
            .ok()
            .and_then(|n| Some((n, br_table_data_size(n)?)))
            .ok_or_else(|| self.error("br_table has too many targets"))?;
        let istream = &mut self.env.istream;
        istream.emit_opcode(Opcode::BrTable);
        istream.emit_u32(num_targets);
        let table_fixup = istream.offset();
        istream.emit_u32(INVALID_OFFSET);
        istream.emit_opcode(Opcode::Data);
        istream.emit_u32(data_size);
        let table = istream.offset();
        istream.emit_u32_at(table_fixup, table);

        for &depth in targets.iter().chain(std::iter::once(&default_target)) {
            self.typeck
                .on_br_table_target(depth)
                .map_err(|e| self.locate(e))?;
            let (drop, keep) = self.br_drop_keep(depth)?;
            self.codegen
                .emit_br_table_entry(&mut self.env.istream, depth, drop, keep);
        }
        self.typeck.end_br_table().map_err(|e| self.locate(e))
    }

    pub fn on_return(&mut self) -> Result<()> {
        let (drop, keep) = self.return_drop_keep()?;
        self.typeck.on_return().map_err(|e| self.locate(e))?;
        self.codegen.emit_drop_keep(&mut self.env.istream, drop, keep);
        self.istream().emit_opcode(Opcode::Return);
        Ok(())
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    pub fn on_call(&mut self, func_index: u32) -> Result<()> {
        let env_index = self.func_env_index(func_index)?;
        let sig = self.func_sig(env_index);
        self.typeck.on_call(&sig).map_err(|e| self.locate(e))?;
        let target = match &self.env.funcs[env_index as usize] {
            Func::Host(_) => None,
            Func::Defined(func) => Some(func.offset),
        };
        let istream = &mut self.env.istream;
        match target {
            None => {
                istream.emit_opcode(Opcode::CallHost);
                istream.emit_u32(env_index);
            }
            Some(Some(offset)) => {
                istream.emit_opcode(Opcode::Call);
                istream.emit_u32(offset);
            }
            Some(None) => {
                istream.emit_opcode(Opcode::Call);
                let defined_index = (func_index - self.num_func_imports) as usize;
                self.codegen.emit_func_fixup(istream, defined_index);
            }
        }
        Ok(())
    }

    pub fn on_call_indirect(&mut self, sig_index: u32) -> Result<()> {
        let table_index = self
            .table_index
            .ok_or_else(|| self.error("found call_indirect operator, but no table"))?;
        let sig_env_index = self.sig_env_index(sig_index)?;
        let sig = self.env_sig(sig_env_index);
        self.typeck.on_call_indirect(&sig).map_err(|e| self.locate(e))?;
        let istream = self.istream();
        istream.emit_opcode(Opcode::CallIndirect);
        istream.emit_u32(table_index);
        istream.emit_u32(sig_env_index);
        Ok(())
    }

    // ── Parametric ───────────────────────────────────────────────────────────

    pub fn on_drop(&mut self) -> Result<()> {
        self.typeck.on_drop().map_err(|e| self.locate(e))?;
        self.istream().emit_opcode(Opcode::Drop);
        Ok(())
    }

    pub fn on_select(&mut self) -> Result<()> {
        self.typeck.on_select().map_err(|e| self.locate(e))?;
        self.istream().emit_opcode(Opcode::Select);
        Ok(())
    }

    // ── Variables ────────────────────────────────────────────────────────────

    pub fn on_local_get(&mut self, local_index: u32) -> Result<()> {
        let ty = self.local_type(local_index)?;
        // Relative to the stack before the value is pushed.
        let depth = self.translate_local_index(local_index)?;
        self.typeck.on_local_get(ty);
        let istream = self.istream();
        istream.emit_opcode(Opcode::LocalGet);
        istream.emit_u32(depth);
        Ok(())
    }

    pub fn on_local_set(&mut self, local_index: u32) -> Result<()> {
        let ty = self.local_type(local_index)?;
        self.typeck.on_local_set(ty).map_err(|e| self.locate(e))?;
        let depth = self.translate_local_index(local_index)?;
        let istream = self.istream();
        istream.emit_opcode(Opcode::LocalSet);
        istream.emit_u32(depth);
        Ok(())
    }

    pub fn on_local_tee(&mut self, local_index: u32) -> Result<()> {
        let ty = self.local_type(local_index)?;
        self.typeck.on_local_tee(ty).map_err(|e| self.locate(e))?;
        let depth = self.translate_local_index(local_index)?;
        let istream = self.istream();
        istream.emit_opcode(Opcode::LocalTee);
        istream.emit_u32(depth);
        Ok(())
    }

    pub fn on_global_get(&mut self, global_index: u32) -> Result<()> {
        let env_index = self.global_env_index(global_index)?;
        let ty = self.env.globals[env_index as usize].value.ty();
        self.typeck.on_global_get(ty);
        let istream = self.istream();
        istream.emit_opcode(Opcode::GlobalGet);
        istream.emit_u32(env_index);
        Ok(())
    }

    pub fn on_global_set(&mut self, global_index: u32) -> Result<()> {
        let env_index = self.global_env_index(global_index)?;
        let global = &self.env.globals[env_index as usize];
        if !global.mutable {
            return Err(self.error(format!(
                "can't global.set on immutable global at index {global_index}."
            )));
        }
        let ty = global.value.ty();
        self.typeck.on_global_set(ty).map_err(|e| self.locate(e))?;
        let istream = self.istream();
        istream.emit_opcode(Opcode::GlobalSet);
        istream.emit_u32(env_index);
        Ok(())
    }

    // ── Memory ───────────────────────────────────────────────────────────────

    fn memory_access(&mut self, op: Opcode, align_log2: u32, offset: u32, atomic: bool) -> Result<()> {
        if op.memory_size() == 0 || op.is_atomic() != atomic {
            return Err(self.error(format!("unexpected opcode {op}")));
        }
        let memory_index = self.require_memory(op)?;
        let natural = op.memory_size();
        let align = 1u64.checked_shl(align_log2).unwrap_or(u64::MAX);
        if atomic && align != natural as u64 {
            return Err(self.error(format!("alignment must be equal to natural alignment ({natural})")));
        }
        if align > natural as u64 {
            return Err(self.error(format!(
                "alignment must not be larger than natural alignment ({natural})"
            )));
        }
        self.typeck.on_opcode(op).map_err(|e| self.locate(e))?;
        let istream = self.istream();
        istream.emit_opcode(op);
        istream.emit_u32(memory_index);
        istream.emit_u32(offset);
        Ok(())
    }

    pub fn on_load(&mut self, op: Opcode, align_log2: u32, offset: u32) -> Result<()> {
        if op.result_type().is_none() {
            return Err(self.error(format!("unexpected opcode {op}")));
        }
        self.memory_access(op, align_log2, offset, false)
    }

    pub fn on_store(&mut self, op: Opcode, align_log2: u32, offset: u32) -> Result<()> {
        if op.result_type().is_some() {
            return Err(self.error(format!("unexpected opcode {op}")));
        }
        self.memory_access(op, align_log2, offset, false)
    }

    pub fn on_atomic_load(&mut self, op: Opcode, align_log2: u32, offset: u32) -> Result<()> {
        self.memory_access(op, align_log2, offset, true)
    }

    pub fn on_atomic_store(&mut self, op: Opcode, align_log2: u32, offset: u32) -> Result<()> {
        self.memory_access(op, align_log2, offset, true)
    }

    pub fn on_atomic_rmw(&mut self, op: Opcode, align_log2: u32, offset: u32) -> Result<()> {
        self.memory_access(op, align_log2, offset, true)
    }

    pub fn on_atomic_rmw_cmpxchg(&mut self, op: Opcode, align_log2: u32, offset: u32) -> Result<()> {
        self.memory_access(op, align_log2, offset, true)
    }

    pub fn on_memory_size(&mut self) -> Result<()> {
        self.memory_instr(Opcode::MemorySize)
    }

    pub fn on_memory_grow(&mut self) -> Result<()> {
        self.memory_instr(Opcode::MemoryGrow)
    }

    fn memory_instr(&mut self, op: Opcode) -> Result<()> {
        let memory_index = self.require_memory(op)?;
        self.typeck.on_opcode(op).map_err(|e| self.locate(e))?;
        let istream = self.istream();
        istream.emit_opcode(op);
        istream.emit_u32(memory_index);
        Ok(())
    }

    // ── Constants ────────────────────────────────────────────────────────────

    pub fn on_i32_const(&mut self, value: u32) -> Result<()> {
        self.typeck.on_const(ValType::I32);
        let istream = self.istream();
        istream.emit_opcode(Opcode::I32Const);
        istream.emit_u32(value);
        Ok(())
    }

    pub fn on_i64_const(&mut self, value: u64) -> Result<()> {
        self.typeck.on_const(ValType::I64);
        let istream = self.istream();
        istream.emit_opcode(Opcode::I64Const);
        istream.emit_u64(value);
        Ok(())
    }

    pub fn on_f32_const(&mut self, bits: u32) -> Result<()> {
        self.typeck.on_const(ValType::F32);
        let istream = self.istream();
        istream.emit_opcode(Opcode::F32Const);
        istream.emit_u32(bits);
        Ok(())
    }

    pub fn on_f64_const(&mut self, bits: u64) -> Result<()> {
        self.typeck.on_const(ValType::F64);
        let istream = self.istream();
        istream.emit_opcode(Opcode::F64Const);
        istream.emit_u64(bits);
        Ok(())
    }

    // ── Numeric ──────────────────────────────────────────────────────────────

    fn numeric(&mut self, op: Opcode) -> Result<()> {
        let is_numeric = op.memory_size() == 0 && !op.param_types().is_empty() && op != Opcode::MemoryGrow;
        if !is_numeric {
            return Err(self.error(format!("unexpected opcode {op}")));
        }
        self.typeck.on_opcode(op).map_err(|e| self.locate(e))?;
        self.istream().emit_opcode(op);
        Ok(())
    }

    pub fn on_unary(&mut self, op: Opcode) -> Result<()> {
        self.numeric(op)
    }

    pub fn on_binary(&mut self, op: Opcode) -> Result<()> {
        self.numeric(op)
    }

    pub fn on_compare(&mut self, op: Opcode) -> Result<()> {
        self.numeric(op)
    }

    pub fn on_convert(&mut self, op: Opcode) -> Result<()> {
        self.numeric(op)
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Applies the staged segments and appends the finished module.
    fn finish(self) -> Result<u32> {
        if self.current_func.is_some() {
            return Err(self.error("function body was not closed"));
        }
        for (i, &env_index) in self
            .func_index_mapping
            .iter()
            .enumerate()
            .skip(self.num_func_imports as usize)
        {
            if let Func::Defined(DefinedFunc { offset: None, .. }) = self.env.funcs[env_index as usize] {
                return Err(self.error(format!("function {i} has no body")));
            }
        }

        for entry in &self.elem_segment_entries {
            self.env.tables[entry.table_index as usize].elements[entry.dst as usize] = Some(entry.func_index);
        }
        for segment in &self.data_segments {
            self.env.memories[segment.memory_index as usize]
                .write_bytes(segment.dst as u64, &segment.data)
                .map_err(|trap| TranslateError::new(trap.to_string()))?;
        }

        let mut module = Module::new(
            self.name.clone().unwrap_or_default(),
            ModuleKind::Defined(DefinedModule {
                imports: self.imports,
                istream_start: self.istream_start,
                istream_end: self.env.istream.offset(),
            }),
        );
        for export in &self.exports {
            module.append_export(export.kind, export.index, &export.name)?;
        }
        module.memory_index = self.memory_index;
        module.table_index = self.table_index;
        module.start_func_index = self.start_func_index;

        let index = self.env.modules.len() as u32;
        self.env.modules.push(module);
        if let Some(name) = self.name {
            self.env.bind_module_name(name, index);
        }
        Ok(index)
    }
}
