//! Scope, frame and variable records, stored in slot maps owned by the
//! compilation unit.
//!
//! A scope, frame or variable is identified by its arena key and every
//! "pointer" field holds a key, so the cyclic scope ↔ frame ↔ variable
//! graph needs no ownership juggling.

use crate::ast::AstNode;
use crate::token::Token;
use crate::Identifier;
use smallvec::SmallVec;
use std::collections::BTreeMap;

slotmap::new_key_type! {
    /// Key of a [`ScopeData`] in the compilation unit's scope arena.
    pub struct ScopeId;
    /// Key of a [`VarData`] in the compilation unit's variable arena.
    pub struct VarId;
}

pub type ScopeMap = slotmap::SlotMap<ScopeId, ScopeData>;
pub type VarMap = slotmap::SlotMap<VarId, VarData>;

/// Classification of a variable.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum VarKind {
    Local,
    Argument,
    /// Local captured by an inner function; boxed at runtime.
    IndependentLocal,
    /// Argument captured by an inner function; boxed at runtime.
    IndependentArgument,
    /// Argument stored directly in a register.
    ArgumentInReg,
    /// Captured argument that still fits in a register.
    IndependentArgInReg,
    /// Module-scope variable backed by a global slot.
    Global,
    /// The imported module itself.
    Module,
    /// A global of another module.
    Imported,
}

impl VarKind {
    /// Captured by an inner function and therefore heap-boxed.
    #[must_use]
    pub const fn is_independent(self) -> bool {
        matches!(
            self,
            Self::IndependentLocal | Self::IndependentArgument | Self::IndependentArgInReg
        )
    }

    #[must_use]
    pub const fn is_argument(self) -> bool {
        matches!(
            self,
            Self::Argument | Self::IndependentArgument | Self::ArgumentInReg | Self::IndependentArgInReg
        )
    }

    /// Accessed through a global/module slot rather than a frame register.
    #[must_use]
    pub const fn is_global_like(self) -> bool {
        matches!(self, Self::Global | Self::Module | Self::Imported)
    }
}

/// Activation state: a variable only becomes visible once its declaration
/// statement has executed in scope order, so `var x = x` refers to the
/// outer `x`. Arguments, globals and imports are active from the start
/// and survive the optimizer's per-pass resets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VarActivation {
    Inactive,
    Active,
    AlwaysActive,
}

/// One declared variable.
#[derive(Debug, Clone)]
pub struct VarData {
    pub name: Identifier,
    /// Scope where this variable was declared.
    pub scope: ScopeId,
    /// The declaring token.
    pub token: Token,
    pub kind: VarKind,
    pub activation: VarActivation,
    pub is_const: bool,
    pub has_defaults: bool,

    /// Number of reads, including through closures; -1 before the first
    /// optimization pass has counted anything.
    pub num_reads: i32,
    /// `num_reads` from the previous optimizer pass.
    pub num_reads_prev: i32,
    /// Number of writes, including through closures.
    pub num_assignments: i32,
    /// Reads from the owning frame only.
    pub local_reads: i32,
    /// Writes from the owning frame only.
    pub local_assignments: i32,

    /// Module index when `kind` is [`VarKind::Module`] or
    /// [`VarKind::Imported`].
    pub module_idx: u32,
    /// Global slot, argument position, or imported-global index.
    pub array_idx: u32,

    /// The initializer expression when it is a foldable constant; used by
    /// constant propagation.
    pub value: Option<Box<AstNode>>,

    /// Register currently bound to the variable during code generation.
    pub reg: Option<u8>,

    /// Previous binding of the same name in the resolver's lookup table.
    pub shadowed: Option<VarId>,
}

impl VarData {
    #[must_use]
    pub fn new(name: Identifier, scope: ScopeId, token: Token, kind: VarKind) -> Self {
        Self {
            name,
            scope,
            token,
            kind,
            activation: VarActivation::Inactive,
            is_const: false,
            has_defaults: false,
            num_reads: -1,
            num_reads_prev: 0,
            num_assignments: 0,
            local_reads: 0,
            local_assignments: 0,
            module_idx: 0,
            array_idx: 0,
            value: None,
            reg: None,
            shadowed: None,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.activation, VarActivation::Active)
    }
}

/// Catch-offset bookkeeping threaded between scopes by the code generator.
///
/// A scope entering a try region appends itself to its innermost
/// catch-holding ancestor's `child_scopes`; when that ancestor emits its
/// handler it back-patches every recorded `catch_entries` offset.
#[derive(Debug, Clone, Default)]
pub struct CatchRef {
    pub child_scopes: SmallVec<[ScopeId; 4]>,
    /// Exception register used in this scope, if it has a catch.
    pub catch_reg: Option<u8>,
    /// For return statements inside try/defer.
    pub finally_active: bool,
    /// Catch instruction offsets in this scope which need the parent
    /// scope's handler offset patched in.
    pub catch_entries: SmallVec<[u32; 4]>,
}

/// A record describing the capture of one outer frame by a closure,
/// looked up by the captured frame's scope key.
#[derive(Debug, Clone)]
pub struct ScopeRef {
    /// The outer frame scope being captured.
    pub closure: ScopeId,
    /// Register holding the outer frame's boxed locals during codegen.
    pub vars_reg: Option<u8>,
    /// Register holding the outer frame's boxed arguments during codegen.
    pub args_reg: Option<u8>,
    pub vars_reg_idx: u32,
    pub args_reg_idx: u32,
    pub exported_locals: u32,
    pub exported_args: u32,
}

impl ScopeRef {
    #[must_use]
    pub fn new(closure: ScopeId) -> Self {
        Self {
            closure,
            vars_reg: None,
            args_reg: None,
            vars_reg_idx: 0,
            args_reg_idx: 0,
            exported_locals: 0,
            exported_args: 0,
        }
    }
}

/// Extra state carried by a scope that owns a function activation.
#[derive(Debug, Clone, Default)]
pub struct FrameData {
    /// Innermost enclosing frame scope, if any.
    pub parent_frame: Option<ScopeId>,
    /// Captures of outer frames, keyed by the captured frame's scope.
    pub scope_refs: BTreeMap<ScopeId, ScopeRef>,
    /// The token of the function's name, for diagnostics and the
    /// constant-pool name string.
    pub fun_token: Option<Token>,
    /// First `yield` in the function body; its presence makes the
    /// function compile as a generator.
    pub yield_token: Option<Token>,

    /// Number of used default args, for optimization.
    pub num_def_used: u32,
    /// Number of closure accesses, for optimization.
    pub num_binds: u32,
    /// Number of closure accesses in the previous optimization cycle.
    pub num_binds_prev: u32,
    /// Number of the function's self-references.
    pub num_self_refs: u32,

    /// Constant-pool index of the function descriptor being built.
    pub constant: Option<u32>,

    pub num_regs: u32,
    pub num_instr: u32,

    pub uses_base_ctor: bool,
    pub uses_base_proto: bool,
    /// Set while the frame is being processed.
    pub is_open: bool,

    /// Register pinned to `this` during codegen.
    pub this_reg: Option<u8>,
    /// Register holding the packed argument array, if any.
    pub args_reg: Option<u8>,
    pub base_ctor_reg: Option<u8>,
    pub base_proto_reg: Option<u8>,
    /// First register receiving a bound outer-frame slice at call time;
    /// one register per [`ScopeRef`], in key order.
    pub bind_reg: Option<u8>,
    /// First register of this frame's closure region, where independent
    /// variables live so inner functions can capture them as a slice.
    pub closure_reg: Option<u8>,
    /// Number of registers in the closure region.
    pub closure_size: u8,
}

/// One lexical block. A scope whose `frame` is populated corresponds to a
/// function body or the module's top level.
#[derive(Debug, Clone)]
pub struct ScopeData {
    pub parent: Option<ScopeId>,
    /// The innermost enclosing frame scope; equal to the scope's own key
    /// for frame scopes.
    pub owning_frame: ScopeId,
    /// Variables declared in this scope, in declaration order.
    pub vars: Vec<VarId>,
    /// The `...rest` parameter, if this is a function scope with one.
    pub ellipsis: Option<VarId>,

    pub num_vars: u32,
    pub num_indep_vars: u32,
    pub num_args: u32,
    pub num_indep_args: u32,

    pub is_function: bool,
    pub uses_this: bool,
    /// More arguments than fit in registers.
    pub have_rest: bool,
    /// Scope generated for the try section of a `defer` statement; in
    /// source it is the same scope as its parent, which matters for
    /// redeclaration checks.
    pub from_defer: bool,

    pub catch_ref: CatchRef,

    pub frame: Option<FrameData>,
}

impl ScopeData {
    #[must_use]
    pub fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            owning_frame: ScopeId::default(),
            vars: Vec::new(),
            ellipsis: None,
            num_vars: 0,
            num_indep_vars: 0,
            num_args: 0,
            num_indep_args: 0,
            is_function: false,
            uses_this: false,
            have_rest: false,
            from_defer: false,
            catch_ref: CatchRef::default(),
            frame: None,
        }
    }

    #[must_use]
    pub const fn has_frame(&self) -> bool {
        self.frame.is_some()
    }
}
