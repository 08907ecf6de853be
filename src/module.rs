//! Module defining the compilation unit, the driver boundary and the
//! compiled-module output.
//!
//! A [`CompileUnit`] owns every intermediate structure of one
//! compilation: scope and variable arenas, the resolver's lookup table,
//! the constant pool, and the growing code buffers. The source buffer is
//! borrowed and must outlive the unit, because tokens carry byte ranges
//! into it.

use crate::ast::AstNode;
use crate::constants::{ConstPool, Constant};
use crate::error::{Error, Result, Warning};
use crate::parse::{Parser, DEFAULT_MAX_AST_DEPTH};
use crate::scope::{ScopeId, ScopeMap, VarId, VarKind, VarMap, VarActivation};
use crate::token::{Position, Token, TokenKind};
use crate::Identifier;
use ahash::AHashMap;
use indexmap::IndexMap;
use std::borrow::Cow;

/// One more than the highest valid module index.
pub const MAX_MODULES: u32 = 0x1_0000;

/// Number of argument registers; surplus parameters are packed into a
/// rest array by the caller.
pub const MAX_ARGS_IN_REGS: u32 = 8;

/// Compilation switches.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Run the optimizer to a fixed point; off still runs one counting
    /// pass, which later stages rely on.
    pub optimize: bool,
    /// Bound on statement/expression nesting depth.
    pub max_ast_depth: u32,
    /// Interactive mode forces top-level declarations into globals so
    /// the next unit in a session can see them.
    pub interactive: bool,
    /// Prepend an implicit `import base.*`.
    pub import_base: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            max_ast_depth: DEFAULT_MAX_AST_DEPTH,
            interactive: false,
            import_base: false,
        }
    }
}

/// Supplies module indexes and the globals of other modules during
/// variable resolution.
///
/// `import_module` may recurse into compiling the imported module; the
/// implementation must keep its own load chain to reject circular
/// imports.
pub trait ModuleDriver {
    /// Map a module name to its index, loading the module first if
    /// necessary.
    fn import_module(&mut self, name: &str) -> std::result::Result<u32, Cow<'static, str>>;

    /// Look up one exported global of a loaded module.
    fn resolve_global(&mut self, module_idx: u32, name: &str) -> Option<u32>;

    /// Invoke the callback for every exported global of a loaded module.
    fn walk_globals(&mut self, module_idx: u32, callback: &mut dyn FnMut(&str, u32));
}

/// A driver for self-contained programs: every import fails.
#[derive(Debug, Default)]
pub struct NullDriver;

impl ModuleDriver for NullDriver {
    fn import_module(&mut self, name: &str) -> std::result::Result<u32, Cow<'static, str>> {
        Err(format!("module \"{}\" not found", name).into())
    }

    fn resolve_global(&mut self, _module_idx: u32, _name: &str) -> Option<u32> {
        None
    }

    fn walk_globals(&mut self, _module_idx: u32, _callback: &mut dyn FnMut(&str, u32)) {}
}

/// A global or module pre-declared by the driver before compilation.
#[derive(Debug, Clone)]
pub(crate) struct PreGlobal {
    pub token: Token,
    pub kind: VarKind,
    pub idx: u32,
    pub is_const: bool,
}

/// An entry of the sorted address-to-line map.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LineAddr {
    pub offs: u32,
    pub line: u32,
}

/// The loadable output of one successful compilation.
#[derive(Debug)]
pub struct CompiledModule {
    pub name: String,
    /// Pooled constants, in index order.
    pub constants: Vec<Constant>,
    /// Exported global names mapped to slots in the globals vector.
    pub global_names: IndexMap<Identifier, u32>,
    pub num_globals: u32,
    /// Imported module names mapped to module indexes.
    pub module_names: IndexMap<Identifier, u32>,
    pub bytecode: Vec<u8>,
    /// Sorted address-to-line map for the whole code blob.
    pub addr2line: Vec<LineAddr>,
    /// Index of the constant holding the top-level function.
    pub main_fn_idx: u32,
    pub warnings: Vec<Warning>,
}

impl CompiledModule {
    /// The source line for a bytecode offset: the entry with the largest
    /// offset not exceeding it.
    #[must_use]
    pub fn line_for_offset(&self, offs: u32) -> u32 {
        match self.addr2line.binary_search_by_key(&offs, |e| e.offs) {
            Ok(i) => self.addr2line[i].line,
            Err(0) => 0,
            Err(i) => self.addr2line[i - 1].line,
        }
    }

    /// Disassemble the module's whole code blob.
    #[must_use]
    pub fn disassemble(&self) -> String {
        crate::bytecode::disassemble(&self.bytecode)
    }
}

/// State of one compilation.
pub struct CompileUnit<'s> {
    source: &'s str,
    file_name: String,
    file_id: u16,
    options: CompileOptions,

    pub(crate) scopes: ScopeMap,
    pub(crate) vars: VarMap,
    pub(crate) scope_stack: Vec<ScopeId>,
    pub(crate) cur_frame: Option<ScopeId>,

    /// Innermost visible binding per name; shadowed bindings chain
    /// through [`VarData::shadowed`](crate::scope::VarData).
    pub(crate) lookup: AHashMap<Identifier, VarId>,

    pub(crate) globals: Vec<VarId>,
    pub(crate) num_globals: u32,
    pub(crate) modules: Vec<VarId>,
    pub(crate) pre_globals: Vec<PreGlobal>,
    pub(crate) module_names: IndexMap<Identifier, u32>,

    pub(crate) constants: ConstPool,
    pub(crate) warnings: Vec<Warning>,
    pub(crate) num_optimizations: u32,
}

impl<'s> CompileUnit<'s> {
    #[must_use]
    pub fn new(file_name: impl Into<String>, file_id: u16, source: &'s str) -> Self {
        Self::with_options(file_name, file_id, source, CompileOptions::default())
    }

    #[must_use]
    pub fn with_options(
        file_name: impl Into<String>,
        file_id: u16,
        source: &'s str,
        options: CompileOptions,
    ) -> Self {
        Self {
            source,
            file_name: file_name.into(),
            file_id,
            options,
            scopes: ScopeMap::default(),
            vars: VarMap::default(),
            scope_stack: Vec::new(),
            cur_frame: None,
            lookup: AHashMap::new(),
            globals: Vec::new(),
            num_globals: 0,
            modules: Vec::new(),
            pre_globals: Vec::new(),
            module_names: IndexMap::new(),
            constants: ConstPool::new(),
            warnings: Vec::new(),
            num_optimizations: 0,
        }
    }

    #[must_use]
    pub fn source(&self) -> &'s str {
        self.source
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[must_use]
    pub const fn file_id(&self) -> u16 {
        self.file_id
    }

    #[must_use]
    pub const fn options(&self) -> &CompileOptions {
        &self.options
    }

    #[must_use]
    pub const fn is_interactive(&self) -> bool {
        self.options.interactive
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Pre-declare a built-in global before compiling source.
    pub fn predefine_global(&mut self, name: &str, idx: u32) {
        let is_const = !self.options.interactive;
        self.pre_globals.push(PreGlobal {
            token: Token::synthetic(TokenKind::Identifier, name, Position::NONE),
            kind: VarKind::Global,
            idx,
            is_const,
        });
        self.num_globals = self.num_globals.max(idx + 1);
    }

    /// Pre-declare an already-imported module before compiling source.
    pub fn predefine_module(&mut self, name: &str, idx: u32) {
        self.pre_globals.push(PreGlobal {
            token: Token::synthetic(TokenKind::Identifier, name, Position::NONE),
            kind: VarKind::Module,
            idx,
            is_const: true,
        });
    }

    pub(crate) fn register_import(&mut self, name: &str, idx: u32) {
        self.module_names.insert(Identifier::from(name), idx);
    }

    /// Parse the unit's source into an AST.
    pub fn parse(&self) -> Result<AstNode> {
        let mut parser = Parser::with_max_depth(self.source, self.options.max_ast_depth);
        let mut ast = parser.parse()?;
        if self.options.import_base {
            parser.import_base(&mut ast);
        }
        Ok(ast)
    }

    /// Run optimizer, register allocation and code generation over a
    /// resolved AST. Returns the number of optimizer passes and the
    /// compiled module.
    ///
    /// [`process_vars`](crate::resolve::process_vars) must have run on
    /// the AST first.
    pub fn compile(&mut self, ast: &mut AstNode) -> Result<(u32, CompiledModule)> {
        let passes = crate::optimize::optimize(self, ast)?;
        crate::optimize::allocate_args(self, ast)?;

        let output = crate::codegen::generate(self, ast)?;

        let mut global_names = IndexMap::new();
        for &var in &self.globals {
            let data = &self.vars[var];
            global_names.insert(data.name.clone(), data.array_idx);
        }

        tracing::debug!(
            module = %self.file_name,
            passes,
            bytecode_bytes = output.bytecode.len(),
            constants = self.constants.len(),
            "module compiled"
        );

        let module = CompiledModule {
            name: std::mem::take(&mut self.file_name),
            constants: std::mem::take(&mut self.constants).into_items(),
            global_names,
            num_globals: self.num_globals,
            module_names: std::mem::take(&mut self.module_names),
            bytecode: output.bytecode,
            addr2line: output.addr2line,
            main_fn_idx: output.main_fn_idx,
            warnings: std::mem::take(&mut self.warnings),
        };

        Ok((passes, module))
    }

    /// Render an error against this unit's file name and source.
    #[must_use]
    pub fn render_error(&self, error: &Error) -> String {
        error.render(&self.file_name, self.source)
    }

    // ------------------------------------------------------------------
    // Activation helpers shared by the later passes
    // ------------------------------------------------------------------

    pub(crate) fn activate_var(&mut self, node: &AstNode) {
        if node.kind == crate::ast::NodeKind::Placeholder {
            return;
        }
        if let Some(var_ref) = node.annot.var_ref() {
            let data = &mut self.vars[var_ref.var];
            if data.activation == VarActivation::Inactive {
                data.activation = VarActivation::Active;
            }
        }
    }

    /// Activate the variables introduced by a `var`/`const` declaration
    /// node.
    pub(crate) fn activate_new_vars(&mut self, decl: &AstNode) {
        if matches!(
            decl.kind,
            crate::ast::NodeKind::Var | crate::ast::NodeKind::Const
        ) {
            for child in &decl.children {
                self.activate_var(child);
            }
        }
    }
}

/// Compile a self-contained script with default options; the simplest
/// entry point.
pub fn compile(file_name: &str, source: &str) -> Result<CompiledModule> {
    compile_with_options(file_name, source, CompileOptions::default())
}

/// Compile a self-contained script.
pub fn compile_with_options(
    file_name: &str,
    source: &str,
    options: CompileOptions,
) -> Result<CompiledModule> {
    let mut driver = NullDriver;
    compile_with_driver(file_name, source, options, &mut driver)
}

/// Compile a script that may import modules through the given driver.
pub fn compile_with_driver(
    file_name: &str,
    source: &str,
    options: CompileOptions,
    driver: &mut dyn ModuleDriver,
) -> Result<CompiledModule> {
    let mut unit = CompileUnit::with_options(file_name, 0, source, options);
    let mut ast = unit.parse()?;
    crate::resolve::process_vars(&mut unit, driver, &mut ast)?;
    let (_, module) = unit.compile(&mut ast)?;
    Ok(module)
}

/// An in-memory module loader: modules are registered as source strings
/// and compiled on first import. Keeps a load chain to detect circular
/// dependencies, the way the runtime's filesystem loader does.
#[derive(Default)]
pub struct MemoryLoader {
    options: CompileOptions,
    sources: AHashMap<Identifier, String>,
    modules: Vec<Option<CompiledModule>>,
    index_by_name: IndexMap<Identifier, u32>,
    load_chain: Vec<Identifier>,
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_options(options: CompileOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Register a module's source text under its import name.
    pub fn add_source(&mut self, name: &str, source: impl Into<String>) {
        self.sources.insert(Identifier::from(name), source.into());
    }

    #[must_use]
    pub fn module(&self, idx: u32) -> Option<&CompiledModule> {
        self.modules.get(idx as usize).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn module_by_name(&self, name: &str) -> Option<&CompiledModule> {
        let idx = *self.index_by_name.get(name)?;
        self.module(idx)
    }

    /// Load a module by name, compiling it and its imports as needed.
    pub fn load(&mut self, name: &str) -> Result<u32> {
        if let Some(&idx) = self.index_by_name.get(name) {
            return Ok(idx);
        }

        // The load chain rejects circular dependencies before any
        // partial module can be registered.
        if self.load_chain.iter().any(|n| n == name) {
            return Err(Error::compile(
                format!("circular dependencies detected for module \"{}\"", name),
                Position::NONE,
            ));
        }

        let source = match self.sources.get(name) {
            Some(source) => source.clone(),
            None => {
                return Err(Error::compile(
                    format!("module \"{}\" not found", name),
                    Position::NONE,
                ))
            }
        };

        self.load_chain.push(Identifier::from(name));

        let idx = self.modules.len() as u32;
        self.modules.push(None);

        let result = (|| {
            let mut unit =
                CompileUnit::with_options(name, idx as u16, &source, self.options.clone());
            let mut ast = unit.parse()?;
            crate::resolve::process_vars(&mut unit, self, &mut ast)?;
            let (_, module) = unit.compile(&mut ast)?;
            Ok(module)
        })();

        self.load_chain.pop();

        match result {
            Ok(module) => {
                tracing::debug!(module = name, idx, "module loaded");
                self.modules[idx as usize] = Some(module);
                self.index_by_name.insert(Identifier::from(name), idx);
                Ok(idx)
            }
            Err(err) => {
                // The reserved slot stays empty; the module is never
                // registered by name, so no partial output is visible.
                Err(err)
            }
        }
    }
}

impl ModuleDriver for MemoryLoader {
    fn import_module(&mut self, name: &str) -> std::result::Result<u32, Cow<'static, str>> {
        self.load(name).map_err(|err| err.message)
    }

    fn resolve_global(&mut self, module_idx: u32, name: &str) -> Option<u32> {
        self.module(module_idx)?.global_names.get(name).copied()
    }

    fn walk_globals(&mut self, module_idx: u32, callback: &mut dyn FnMut(&str, u32)) {
        if let Some(module) = self.module(module_idx) {
            for (name, &idx) in &module.global_names {
                callback(name, idx);
            }
        }
    }
}
