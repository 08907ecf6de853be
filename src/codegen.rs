//! Module implementing the code generator.
//!
//! Runs after the optimizer has reached its fixed point and arguments
//! have been classified. Every function body is emitted into its own
//! builder; finished functions are appended to the module's code blob
//! and described by a function constant carrying bytecode and line-map
//! ranges. Jumps are emitted with placeholder offsets and back-patched,
//! and catch offsets are threaded between scopes through the per-scope
//! catch references.

use crate::ast::{AstNode, NodeKind, VarRef};
use crate::bytecode::Opcode;
use crate::constants::{
    CompFunction, FUN_CLASS, FUN_CLOSURE, FUN_ELLIPSIS, FUN_GENERATOR,
};
use crate::error::{Error, Result};
use crate::module::{CompileUnit, LineAddr};
use crate::scope::{ScopeId, VarId, VarKind};
use crate::token::{Keyword, Numeric, Op, Position, StringEscape};
use smallvec::SmallVec;

const ERR_TOO_MANY_REGISTERS: &str = "not enough registers to compile this function";

/// Register index meaning "no register" in the function descriptor.
pub const NO_REG: u8 = 0xFF;

/// Code generation output for a whole module.
pub(crate) struct Output {
    pub bytecode: Vec<u8>,
    pub addr2line: Vec<LineAddr>,
    pub main_fn_idx: u32,
}

/// Generate bytecode for a resolved, optimized module.
pub(crate) fn generate(unit: &mut CompileUnit<'_>, ast: &mut AstNode) -> Result<Output> {
    debug_assert_eq!(ast.kind, NodeKind::Scope);

    let mut gen = CodeGen {
        unit,
        code: Vec::new(),
        addr2line: Vec::new(),
    };

    let main_fn_idx = gen.gen_function(ast)?;

    Ok(Output {
        bytecode: gen.code,
        addr2line: gen.addr2line,
        main_fn_idx,
    })
}

// ----------------------------------------------------------------------
// Instruction builder
// ----------------------------------------------------------------------

/// Emits encoded instructions for one function and tracks its
/// address-to-line map; grows until the finished body is appended to the
/// module blob.
#[derive(Debug, Default)]
struct CodeBuilder {
    bytecode: Vec<u8>,
    addr2line: Vec<LineAddr>,
    current_line: u32,
    last_mapped_line: u32,
    num_instr: u32,
}

impl CodeBuilder {
    fn new() -> Self {
        Self::default()
    }

    fn here(&self) -> u32 {
        self.bytecode.len() as u32
    }

    /// Record the source line for subsequently emitted instructions.
    fn set_line(&mut self, line: u32) {
        if line != 0 {
            self.current_line = line;
        }
    }

    fn start_instruction(&mut self) {
        // The first entry always covers offset zero.
        if self.addr2line.is_empty() || self.current_line != self.last_mapped_line {
            self.addr2line.push(LineAddr {
                offs: self.here(),
                line: self.current_line.max(1),
            });
            self.last_mapped_line = self.current_line;
        }
        self.num_instr += 1;
    }

    /// Emit one instruction; operand count and sizes come from the
    /// opcode tables shared with the disassembler.
    fn emit(&mut self, op: Opcode, operands: &[i64]) {
        debug_assert_eq!(operands.len(), op.num_operands());

        self.start_instruction();
        self.bytecode.push(op as u8);

        for (i, &value) in operands.iter().enumerate() {
            let size = op.operand_size(i);
            for byte in 0..size {
                self.bytecode.push((value >> (8 * byte)) as u8);
            }
        }
    }

    /// Emit an instruction with a placeholder jump offset; the returned
    /// instruction offset is later passed to [`patch_jump`].
    fn emit_jump(&mut self, op: Opcode, operands: &[i64]) -> u32 {
        let at = self.here();
        self.emit(op, operands);
        at
    }

    /// Finalize a previously emitted jump to land on `target`.
    fn patch_jump(&mut self, instr_offset: u32, target: u32) {
        let op = Opcode::from_u8(self.bytecode[instr_offset as usize])
            .expect("patching a non-instruction");
        let slot = op.jump_operand().expect("patching a non-jump");

        let mut operand_pos = instr_offset as usize + 1;
        for i in 0..slot {
            operand_pos += op.operand_size(i);
        }

        // The jump base is the address immediately after the offset
        // operand plus any tail operands of the same instruction.
        let base = operand_pos
            + op.operand_size(slot)
            + op.offset_operand_tail(slot).unwrap_or(0);
        let delta = (target as i64 - base as i64) as i32;

        let size = op.operand_size(slot);
        let bytes = delta.to_le_bytes();
        self.bytecode[operand_pos..operand_pos + size].copy_from_slice(&bytes[..size]);
    }
}

// ----------------------------------------------------------------------
// Register allocation
// ----------------------------------------------------------------------

/// Per-frame register pool. Freed temporaries are reused before the
/// high-water mark grows.
#[derive(Debug, Default)]
struct RegAlloc {
    free: SmallVec<[u8; 16]>,
    next: u16,
}

impl RegAlloc {
    fn alloc(&mut self, pos: Position) -> Result<u8> {
        if let Some(reg) = self.free.pop() {
            return Ok(reg);
        }
        if self.next > 0xFF {
            return Err(Error::compile(ERR_TOO_MANY_REGISTERS, pos));
        }
        let reg = self.next as u8;
        self.next += 1;
        Ok(reg)
    }

    /// Allocate `n` consecutive registers, bypassing the free list.
    fn alloc_span(&mut self, n: u32, pos: Position) -> Result<u8> {
        if u32::from(self.next) + n > 0x100 {
            return Err(Error::compile(ERR_TOO_MANY_REGISTERS, pos));
        }
        let first = self.next as u8;
        self.next += n as u16;
        Ok(first)
    }

    fn free(&mut self, reg: u8) {
        debug_assert!(!self.free.contains(&reg));
        self.free.push(reg);
    }

    fn num_regs(&self) -> u8 {
        self.next.min(0x100) as u8
    }
}

/// An expression result: the register holding it, and whether the
/// register is a temporary this expression owns.
#[derive(Debug, Clone, Copy)]
struct RegVal {
    reg: u8,
    temp: bool,
}

impl RegVal {
    const fn temp(reg: u8) -> Self {
        Self { reg, temp: true }
    }

    const fn pinned(reg: u8) -> Self {
        Self { reg, temp: false }
    }
}

// ----------------------------------------------------------------------
// Frame context
// ----------------------------------------------------------------------

/// Jump fix-ups of one breakable region.
#[derive(Debug, Default)]
struct BreakCtx {
    fixups: Vec<u32>,
    /// Defer handlers active when the region was entered; leaving the
    /// region runs everything above this depth.
    defer_depth: usize,
}

#[derive(Debug, Default)]
struct ContinueCtx {
    fixups: Vec<u32>,
    defer_depth: usize,
}

/// State of the function currently being emitted.
struct FrameCtx<'a> {
    scope: ScopeId,
    builder: CodeBuilder,
    regs: RegAlloc,
    /// Reserved constant-pool index of this function's descriptor.
    const_idx: u32,
    def_line: u32,

    this_reg: Option<u8>,
    args_reg: Option<u8>,
    rest_reg: Option<u8>,
    ellipsis_reg: Option<u8>,
    base_ctor_reg: Option<u8>,
    base_proto_reg: Option<u8>,
    bind_reg: Option<u8>,
    closure_reg: Option<u8>,
    closure_size: u8,
    min_args: u8,
    num_decl_def_args: u8,
    arg_name_str_idx: Vec<u32>,

    /// Finally handlers to inline on `return`/`break`/`continue`.
    defer_stack: Vec<&'a AstNode>,
    breaks: Vec<BreakCtx>,
    continues: Vec<ContinueCtx>,
}

impl<'a> FrameCtx<'a> {
    fn new(scope: ScopeId, const_idx: u32, def_line: u32) -> Self {
        Self {
            scope,
            builder: CodeBuilder::new(),
            regs: RegAlloc::default(),
            const_idx,
            def_line,
            this_reg: None,
            args_reg: None,
            rest_reg: None,
            ellipsis_reg: None,
            base_ctor_reg: None,
            base_proto_reg: None,
            bind_reg: None,
            closure_reg: None,
            closure_size: 0,
            min_args: 0,
            num_decl_def_args: 0,
            arg_name_str_idx: Vec::new(),
            defer_stack: Vec::new(),
            breaks: Vec::new(),
            continues: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------
// The generator
// ----------------------------------------------------------------------

struct CodeGen<'r, 's> {
    unit: &'r mut CompileUnit<'s>,
    code: Vec<u8>,
    addr2line: Vec<LineAddr>,
}

impl<'r, 's> CodeGen<'r, 's> {
    fn source(&self) -> &'s str {
        self.unit.source()
    }

    // ------------------------------------------------------------------
    // Function-level orchestration
    // ------------------------------------------------------------------

    /// Emit one function (or the module's top level when `fun_node` is
    /// the root scope) and return its constant index.
    fn gen_function(&mut self, fun_node: &AstNode) -> Result<u32> {
        let is_root = fun_node.kind == NodeKind::Scope;
        let scope_id = fun_node.annot.scope().expect("function without scope");

        // Reserve the descriptor up front so the body can reference
        // itself while being emitted.
        let const_idx = self.unit.constants.function(CompFunction::default());
        self.unit.scopes[scope_id]
            .frame
            .as_mut()
            .expect("function scope without frame")
            .constant = Some(const_idx);

        let def_line = fun_node.token.pos.line.max(1);
        let mut frame = FrameCtx::new(scope_id, const_idx, def_line);

        self.setup_frame(&mut frame, fun_node, is_root)?;

        self.unit.scope_stack.push(scope_id);
        let saved_frame = self.unit.cur_frame.replace(scope_id);

        let result = (|| -> Result<()> {
            if is_root {
                self.gen_scope_body(&mut frame, fun_node)?;

                // The module's top level falls through to `return void`.
                frame.builder.set_line(self.last_line(fun_node));
                let r = frame.regs.alloc(fun_node.pos())?;
                frame.builder.emit(Opcode::LoadVoid, &[i64::from(r)]);
                frame.builder.emit(Opcode::Return, &[i64::from(r)]);
                frame.regs.free(r);
            } else {
                // children: name, parameters, landmark, body, landmark.
                self.gen_scope_body(&mut frame, &fun_node.children[3])?;
            }

            Ok(())
        })();

        self.release_scope_regs(&mut frame, scope_id);
        self.unit.scope_stack.pop();
        self.unit.cur_frame = saved_frame;

        result?;

        self.finish_function(frame, fun_node, is_root)
    }

    /// Allocate the frame's pinned registers: `this`, in-register
    /// arguments, the rest array, bound outer frames and the closure
    /// region, in that order.
    fn setup_frame(&mut self, frame: &mut FrameCtx<'_>, fun_node: &AstNode, is_root: bool) -> Result<()> {
        let scope_id = frame.scope;
        let pos = fun_node.pos();

        let uses_this = self.unit.scopes[scope_id].uses_this;
        let (uses_base_ctor, uses_base_proto) = {
            let f = self.unit.scopes[scope_id].frame.as_ref().expect("frame scope without frame data");
            (f.uses_base_ctor, f.uses_base_proto)
        };

        if uses_this || fun_node.kind == NodeKind::ConstructorLiteral {
            frame.this_reg = Some(frame.regs.alloc(pos)?);
        }
        if uses_base_ctor {
            frame.base_ctor_reg = Some(frame.regs.alloc(pos)?);
        }
        if uses_base_proto {
            frame.base_proto_reg = Some(frame.regs.alloc(pos)?);
        }

        // Arguments that stay in registers, in positional order.
        let mut arg_regs: Vec<(VarId, u8)> = Vec::new();
        if !is_root {
            let params = &fun_node.children[1];
            let mut min_args = 0u8;
            let mut num_def = 0u8;

            for arg in &params.children {
                let (ident, has_default) = match arg.kind {
                    NodeKind::Identifier => (arg, false),
                    NodeKind::Assignment => (&arg.children[0], true),
                    _ => (&arg.children[0], false),
                };

                if arg.kind != NodeKind::Ellipsis {
                    if has_default {
                        num_def += 1;
                    } else {
                        min_args = min_args.saturating_add(1);
                    }
                }

                let var = match ident.annot.var_ref() {
                    Some(r) => r.var,
                    None => continue,
                };

                let name = self.unit.vars[var].name.clone();
                let name_idx = self.unit.constants.string(&name, StringEscape::Raw);
                if arg.kind != NodeKind::Ellipsis {
                    frame.arg_name_str_idx.push(name_idx);
                }

                match self.unit.vars[var].kind {
                    VarKind::ArgumentInReg | VarKind::IndependentArgInReg => {
                        let reg = frame.regs.alloc(pos)?;
                        if frame.args_reg.is_none() {
                            frame.args_reg = Some(reg);
                        }
                        self.unit.vars[var].reg = Some(reg);
                        arg_regs.push((var, reg));
                    }
                    _ => (),
                }
            }

            frame.min_args = min_args;
            frame.num_decl_def_args = num_def;

            if self.unit.scopes[scope_id].have_rest {
                frame.rest_reg = Some(frame.regs.alloc(pos)?);
            }
            if let Some(ellipsis) = self.unit.scopes[scope_id].ellipsis {
                let reg = frame.regs.alloc(pos)?;
                frame.ellipsis_reg = Some(reg);
                self.unit.vars[ellipsis].reg = Some(reg);
            }
        }

        // One register per captured outer frame, in key order.
        let ref_keys: Vec<ScopeId> = {
            let f = self.unit.scopes[scope_id].frame.as_ref().expect("frame scope without frame data");
            f.scope_refs.keys().copied().collect()
        };
        if !ref_keys.is_empty() {
            let first = frame.regs.alloc_span(ref_keys.len() as u32, pos)?;
            frame.bind_reg = Some(first);
            for (i, key) in ref_keys.iter().enumerate() {
                let f = self.unit.scopes[scope_id].frame.as_mut().expect("frame scope without frame data");
                let r = f.scope_refs.get_mut(key).expect("scope ref vanished");
                r.vars_reg = Some(first + i as u8);
                r.vars_reg_idx = i as u32;
            }
        }

        // The closure region: all independent variables of every scope
        // owned by this frame, packed so inner closures can capture the
        // register slice.
        let indep: Vec<VarId> = {
            let mut vars = Vec::new();
            for scope in self.unit.scopes.values() {
                if scope.owning_frame != scope_id {
                    continue;
                }
                for &var in &scope.vars {
                    let data = &self.unit.vars[var];
                    if data.kind.is_independent()
                        && (data.num_reads != 0 || data.num_assignments != 0)
                    {
                        vars.push(var);
                    }
                }
            }
            vars
        };

        if !indep.is_empty() {
            let first = frame.regs.alloc_span(indep.len() as u32, pos)?;
            frame.closure_reg = Some(first);
            frame.closure_size = indep.len() as u8;
            for (i, &var) in indep.iter().enumerate() {
                self.unit.vars[var].reg = Some(first + i as u8);
            }
        }

        {
            let f = self.unit.scopes[scope_id].frame.as_mut().expect("frame scope without frame data");
            f.this_reg = frame.this_reg;
            f.args_reg = frame.args_reg;
            f.base_ctor_reg = frame.base_ctor_reg;
            f.base_proto_reg = frame.base_proto_reg;
            f.bind_reg = frame.bind_reg;
            f.closure_reg = frame.closure_reg;
            f.closure_size = frame.closure_size;
        }

        // Captured in-register arguments are mirrored into the closure
        // region at entry; rest-array captures are fetched first.
        frame.builder.set_line(frame.def_line);
        for &var in &indep {
            let data = &self.unit.vars[var];
            if data.kind == VarKind::IndependentArgInReg {
                // The argument arrived in its positional register, which
                // precedes the closure region; move it in.
                let src = arg_regs
                    .iter()
                    .find(|(v, _)| *v == var)
                    .map(|&(_, reg)| reg);
                if let (Some(src), Some(dst)) = (src, data.reg) {
                    if src != dst {
                        frame
                            .builder
                            .emit(Opcode::Move, &[i64::from(dst), i64::from(src)]);
                    }
                }
            } else if data.kind == VarKind::IndependentArgument {
                if let (Some(rest), Some(dst)) = (frame.rest_reg, data.reg) {
                    frame.builder.emit(
                        Opcode::GetElem8,
                        &[i64::from(dst), i64::from(rest), i64::from(data.array_idx)],
                    );
                }
            } else if self.unit.scopes[scope_id].ellipsis == Some(var) {
                // A captured ellipsis relocates from its dedicated
                // register into the closure region.
                if let (Some(src), Some(dst)) = (frame.ellipsis_reg, data.reg) {
                    if src != dst {
                        frame
                            .builder
                            .emit(Opcode::Move, &[i64::from(dst), i64::from(src)]);
                    }
                }
            }
        }

        Ok(())
    }

    /// Append the finished body to the module blob and fill in the
    /// function descriptor.
    fn finish_function(&mut self, frame: FrameCtx<'_>, fun_node: &AstNode, is_root: bool) -> Result<u32> {
        let scope_id = frame.scope;
        let const_idx = frame.const_idx;

        let bytecode_offset = self.code.len() as u32;
        let bytecode_size = frame.builder.bytecode.len() as u32;
        self.code.extend_from_slice(&frame.builder.bytecode);

        let addr2line_offset = self.addr2line.len() as u32;
        let addr2line_size = frame.builder.addr2line.len() as u32;
        for entry in &frame.builder.addr2line {
            self.addr2line.push(LineAddr {
                offs: entry.offs + bytecode_offset,
                line: entry.line,
            });
        }

        let (num_binds, num_def_used, is_generator) = {
            let f = self.unit.scopes[scope_id].frame.as_ref().expect("frame scope without frame data");
            (
                f.scope_refs.len() as u8,
                f.num_def_used.min(0xFF) as u8,
                f.yield_token.is_some(),
            )
        };

        let mut flags = 0u8;
        if num_binds != 0 || frame.closure_size != 0 {
            flags |= FUN_CLOSURE;
        }
        if self.unit.scopes[scope_id].ellipsis.is_some() {
            flags |= FUN_ELLIPSIS;
        }
        if is_generator {
            flags |= FUN_GENERATOR;
        }
        if fun_node.kind == NodeKind::ConstructorLiteral {
            flags |= FUN_CLASS;
        }

        let load_instr = if const_idx <= 0xFF {
            if is_root {
                Opcode::LoadConst8
            } else {
                Opcode::LoadFun8
            }
        } else if is_root {
            Opcode::LoadConst
        } else {
            Opcode::LoadFun
        };

        let descriptor = CompFunction {
            bytecode_offset,
            bytecode_size,
            addr2line_offset,
            addr2line_size,
            name_str_idx: self.function_name_idx(fun_node, is_root),
            def_line: frame.def_line,
            num_instr: frame.builder.num_instr,
            flags,
            num_regs: frame.regs.num_regs(),
            closure_size: frame.closure_size,
            load_instr: load_instr as u8,
            min_args: frame.min_args,
            num_decl_def_args: frame.num_decl_def_args,
            num_used_def_args: num_def_used,
            num_binds,
            args_reg: frame.args_reg.unwrap_or(NO_REG),
            rest_reg: frame.rest_reg.unwrap_or(NO_REG),
            ellipsis_reg: frame.ellipsis_reg.unwrap_or(NO_REG),
            this_reg: frame.this_reg.unwrap_or(NO_REG),
            bind_reg: frame.bind_reg.unwrap_or(NO_REG),
            num_named_args: frame.arg_name_str_idx.len() as u8,
            arg_name_str_idx: frame.arg_name_str_idx,
        };

        if let Some(slot) = self.unit.constants.get_mut(const_idx) {
            *slot = crate::constants::Constant::Function(descriptor);
        }

        Ok(const_idx)
    }

    fn function_name_idx(&mut self, fun_node: &AstNode, is_root: bool) -> u32 {
        if is_root {
            return self.unit.constants.string("<module>", StringEscape::Raw);
        }
        match fun_node.children[0].first_child() {
            Some(n) => {
                let (text, _) = n.string_value(self.source());
                let text = text.to_owned();
                self.unit.constants.string(&text, StringEscape::Raw)
            }
            None => self.unit.constants.string("<anonymous>", StringEscape::Raw),
        }
    }

    fn last_line(&self, node: &AstNode) -> u32 {
        node.children
            .last()
            .map_or(node.token.pos.line, |c| self.last_line(c))
    }

    // ------------------------------------------------------------------
    // Scopes and statements
    // ------------------------------------------------------------------

    /// Free the registers of a scope's register-resident variables.
    fn release_scope_regs(&mut self, frame: &mut FrameCtx<'_>, scope_id: ScopeId) {
        for var in self.unit.scopes[scope_id].vars.clone() {
            let data = &mut self.unit.vars[var];
            if data.kind == VarKind::Local {
                if let Some(reg) = data.reg.take() {
                    frame.regs.free(reg);
                }
            }
        }
    }

    /// Generate the statements of a scope node without pushing a new
    /// frame.
    fn gen_scope_body<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        debug_assert_eq!(node.kind, NodeKind::Scope);

        let scope_id = node.annot.scope();
        if let Some(id) = scope_id {
            if id != frame.scope {
                self.unit.scope_stack.push(id);
            }
        }

        let result = (|| {
            for child in &node.children {
                self.gen_statement(frame, child)?;
            }
            Ok(())
        })();

        if let Some(id) = scope_id {
            if id != frame.scope {
                self.release_scope_regs(frame, id);
                self.unit.scope_stack.pop();
            }
        }

        result
    }

    fn gen_statement<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        frame.builder.set_line(node.token.pos.line);

        match node.kind {
            NodeKind::Empty | NodeKind::Import | NodeKind::Fallthrough => Ok(()),

            NodeKind::Scope => self.gen_scope_body(frame, node),

            NodeKind::If => self.gen_if(frame, node),
            NodeKind::While => self.gen_while(frame, node),
            NodeKind::Repeat => self.gen_repeat(frame, node),
            NodeKind::ForIn => self.gen_for_in(frame, node),
            NodeKind::Switch => self.gen_switch(frame, node),
            NodeKind::TryCatch => self.gen_try_catch(frame, node),
            NodeKind::TryDefer => self.gen_try_defer(frame, node),

            NodeKind::Continue => self.gen_continue(frame, node),
            NodeKind::Break => self.gen_break(frame, node),
            NodeKind::Return => self.gen_return(frame, node),
            NodeKind::Throw => self.gen_throw(frame, node),
            NodeKind::Assert => self.gen_assert(frame, node),

            NodeKind::Assignment | NodeKind::MultiAssignment => self.gen_assignment(frame, node),

            _ => {
                // Expression in statement position, evaluated for its
                // side effects.
                let val = self.gen_expr(frame, node)?;
                self.free_val(frame, val);
                Ok(())
            }
        }
    }

    fn gen_if<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let cond = &node.children[0];

        if self.is_const_true(cond) {
            return self.gen_statement(frame, &node.children[1]);
        }

        let cond_val = self.gen_expr(frame, cond)?;
        let else_jump = frame
            .builder
            .emit_jump(Opcode::JumpNotCond, &[0, i64::from(cond_val.reg)]);
        self.free_val(frame, cond_val);

        self.gen_statement(frame, &node.children[1])?;

        if node.children.len() > 2 {
            let end_jump = frame.builder.emit_jump(Opcode::Jump, &[0]);
            let else_target = frame.builder.here();
            frame.builder.patch_jump(else_jump, else_target);

            self.gen_statement(frame, &node.children[2])?;

            let end = frame.builder.here();
            frame.builder.patch_jump(end_jump, end);
        } else {
            let end = frame.builder.here();
            frame.builder.patch_jump(else_jump, end);
        }

        Ok(())
    }

    fn gen_while<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let cond = &node.children[0];

        if self.is_const_false(cond) {
            return Ok(());
        }

        let always = cond.kind == NodeKind::Empty || self.is_const_true(cond);

        frame.breaks.push(BreakCtx {
            fixups: Vec::new(),
            defer_depth: frame.defer_stack.len(),
        });
        frame.continues.push(ContinueCtx {
            fixups: Vec::new(),
            defer_depth: frame.defer_stack.len(),
        });

        let top = frame.builder.here();

        let result = (|| {
            let mut exit_jump = None;
            if !always {
                let cond_val = self.gen_expr(frame, cond)?;
                exit_jump = Some(
                    frame
                        .builder
                        .emit_jump(Opcode::JumpNotCond, &[0, i64::from(cond_val.reg)]),
                );
                self.free_val(frame, cond_val);
            }

            self.gen_statement(frame, &node.children[1])?;

            let back = frame.builder.emit_jump(Opcode::Jump, &[0]);
            frame.builder.patch_jump(back, top);

            let end = frame.builder.here();
            if let Some(j) = exit_jump {
                frame.builder.patch_jump(j, end);
            }
            Ok(())
        })();

        let continues = frame.continues.pop().unwrap_or_default();
        let breaks = frame.breaks.pop().unwrap_or_default();
        result?;

        for fixup in continues.fixups {
            frame.builder.patch_jump(fixup, top);
        }
        let end = frame.builder.here();
        for fixup in breaks.fixups {
            frame.builder.patch_jump(fixup, end);
        }

        Ok(())
    }

    fn gen_repeat<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        frame.breaks.push(BreakCtx {
            fixups: Vec::new(),
            defer_depth: frame.defer_stack.len(),
        });
        frame.continues.push(ContinueCtx {
            fixups: Vec::new(),
            defer_depth: frame.defer_stack.len(),
        });

        let top = frame.builder.here();

        let result = (|| {
            self.gen_statement(frame, &node.children[0])?;

            // The condition is the continue target.
            let cond_target = frame.builder.here();

            let cond = &node.children[1];
            if self.is_const_false(cond) {
                // Collapsed by the optimizer: fall out of the loop.
            } else if self.is_const_true(cond) {
                let j = frame.builder.emit_jump(Opcode::Jump, &[0]);
                frame.builder.patch_jump(j, top);
            } else {
                frame.builder.set_line(cond.token.pos.line);
                let cond_val = self.gen_expr(frame, cond)?;
                let j = frame
                    .builder
                    .emit_jump(Opcode::JumpCond, &[0, i64::from(cond_val.reg)]);
                frame.builder.patch_jump(j, top);
                self.free_val(frame, cond_val);
            }

            Ok(cond_target)
        })();

        let continues = frame.continues.pop().unwrap_or_default();
        let breaks = frame.breaks.pop().unwrap_or_default();
        let cond_target = result?;

        for fixup in continues.fixups {
            frame.builder.patch_jump(fixup, cond_target);
        }
        let end = frame.builder.here();
        for fixup in breaks.fixups {
            frame.builder.patch_jump(fixup, end);
        }

        Ok(())
    }

    fn gen_for_in<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let scope_id = node.annot.scope().expect("for-in without scope");
        self.unit.scope_stack.push(scope_id);

        let result = self.gen_for_in_inner(frame, node);

        self.release_scope_regs(frame, scope_id);
        self.unit.scope_stack.pop();
        result
    }

    fn gen_for_in_inner<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let in_node = &node.children[0];
        let decl = &in_node.children[0];
        let iterable = &in_node.children[1];

        let src = self.gen_expr(frame, iterable)?;
        let iter = frame.regs.alloc(node.pos())?;
        frame
            .builder
            .emit(Opcode::LoadIter, &[i64::from(iter), i64::from(src.reg)]);
        self.free_val(frame, src);

        let value = frame.regs.alloc(node.pos())?;

        frame.breaks.push(BreakCtx {
            fixups: Vec::new(),
            defer_depth: frame.defer_stack.len(),
        });
        frame.continues.push(ContinueCtx {
            fixups: Vec::new(),
            defer_depth: frame.defer_stack.len(),
        });

        let top = frame.builder.here();
        let exit_jump = frame.builder.emit_jump(
            Opcode::NextJump,
            &[i64::from(value), i64::from(iter), 0],
        );

        let result = (|| {
            // Bind the iteration variables.
            let targets: Vec<&AstNode> = decl.children.iter().collect();
            if targets.len() == 1 {
                self.store_target(frame, targets[0], value)?;
            } else {
                for (i, target) in targets.iter().enumerate() {
                    if target.kind == NodeKind::Placeholder {
                        continue;
                    }
                    let elem = frame.regs.alloc(node.pos())?;
                    frame.builder.emit(
                        Opcode::GetElem8,
                        &[i64::from(elem), i64::from(value), i as i64],
                    );
                    self.store_target(frame, target, elem)?;
                    frame.regs.free(elem);
                }
            }

            self.gen_statement(frame, &node.children[1])?;

            let j = frame.builder.emit_jump(Opcode::Jump, &[0]);
            frame.builder.patch_jump(j, top);
            Ok(())
        })();

        let continues = frame.continues.pop().unwrap_or_default();
        let breaks = frame.breaks.pop().unwrap_or_default();
        result?;

        for fixup in continues.fixups {
            frame.builder.patch_jump(fixup, top);
        }
        let end = frame.builder.here();
        frame.builder.patch_jump(exit_jump, end);
        for fixup in breaks.fixups {
            frame.builder.patch_jump(fixup, end);
        }

        frame.regs.free(value);
        frame.regs.free(iter);

        Ok(())
    }

    fn gen_switch<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let value = self.gen_expr(frame, &node.children[0])?;

        frame.breaks.push(BreakCtx {
            fixups: Vec::new(),
            defer_depth: frame.defer_stack.len(),
        });

        let result = (|| {
            let cases = &node.children[1..];
            let mut body_jumps: Vec<u32> = Vec::with_capacity(cases.len());
            let mut default_case: Option<usize> = None;

            // Dispatch: one comparison per case, in order.
            for (i, case) in cases.iter().enumerate() {
                if case.kind == NodeKind::Default {
                    default_case = Some(i);
                    body_jumps.push(u32::MAX);
                    continue;
                }

                let case_val = self.gen_expr(frame, &case.children[0])?;
                let cmp = frame.regs.alloc(case.pos())?;
                frame.builder.emit(
                    Opcode::CmpEq,
                    &[i64::from(cmp), i64::from(value.reg), i64::from(case_val.reg)],
                );
                self.free_val(frame, case_val);
                let j = frame
                    .builder
                    .emit_jump(Opcode::JumpCond, &[0, i64::from(cmp)]);
                frame.regs.free(cmp);
                body_jumps.push(j);
            }

            let miss_jump = frame.builder.emit_jump(Opcode::Jump, &[0]);

            // Bodies, in source order; fallthrough runs into the next
            // body.
            let mut body_offsets: Vec<u32> = Vec::with_capacity(cases.len());
            let mut end_jumps: Vec<u32> = Vec::new();

            for (i, case) in cases.iter().enumerate() {
                body_offsets.push(frame.builder.here());

                // A comma case has no scope of its own; it flows into
                // the following case's body.
                let scope = case.children.iter().find(|c| c.kind == NodeKind::Scope);
                let has_fallthrough = case
                    .children
                    .iter()
                    .any(|c| c.kind == NodeKind::Fallthrough);

                if let Some(scope) = scope {
                    self.gen_statement(frame, scope)?;

                    let is_last = i + 1 == cases.len();
                    if !has_fallthrough && !is_last {
                        end_jumps.push(frame.builder.emit_jump(Opcode::Jump, &[0]));
                    }
                }
            }

            let end = frame.builder.here();

            for (i, &jump) in body_jumps.iter().enumerate() {
                if jump != u32::MAX {
                    frame.builder.patch_jump(jump, body_offsets[i]);
                }
            }
            match default_case {
                Some(i) => frame.builder.patch_jump(miss_jump, body_offsets[i]),
                None => frame.builder.patch_jump(miss_jump, end),
            }
            for jump in end_jumps {
                frame.builder.patch_jump(jump, end);
            }

            Ok(())
        })();

        let breaks = frame.breaks.pop().unwrap_or_default();
        result?;

        let end = frame.builder.here();
        for fixup in breaks.fixups {
            frame.builder.patch_jump(fixup, end);
        }

        self.free_val(frame, value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // try/catch/defer
    // ------------------------------------------------------------------

    /// Arm the enclosing scope's catch handler again after an inner try
    /// region ends. The handler offset is unknown until that scope emits
    /// it, so the emitted CATCH is recorded for later back-patching.
    fn restore_enclosing_catch(&mut self, frame: &mut FrameCtx<'_>, inner_scope: ScopeId) {
        let enclosing = self.find_enclosing_catch(inner_scope);

        if let Some(outer) = enclosing {
            let reg = self.unit.scopes[outer]
                .catch_ref
                .catch_reg
                .expect("enclosing catch without register");
            let at = frame.builder.emit_jump(Opcode::Catch, &[i64::from(reg), 0]);
            self.unit.scopes[inner_scope].catch_ref.catch_entries.push(at);

            let children = &mut self.unit.scopes[outer].catch_ref.child_scopes;
            if !children.contains(&inner_scope) {
                children.push(inner_scope);
            }
        }
    }

    /// The innermost catch-holding ancestor scope within the same frame.
    fn find_enclosing_catch(&self, scope: ScopeId) -> Option<ScopeId> {
        let mut cur = self.unit.scopes[scope].parent;
        while let Some(id) = cur {
            if self.unit.scopes[id].catch_ref.catch_reg.is_some() {
                return Some(id);
            }
            if self.unit.scopes[id].has_frame() {
                return None;
            }
            cur = self.unit.scopes[id].parent;
        }
        None
    }

    /// Back-patch the catch entries of every child scope to this
    /// scope's handler offset.
    fn patch_child_catch_entries(&mut self, frame: &mut FrameCtx<'_>, scope: ScopeId, handler: u32) {
        let children = std::mem::take(&mut self.unit.scopes[scope].catch_ref.child_scopes);
        for child in children {
            let entries = std::mem::take(&mut self.unit.scopes[child].catch_ref.catch_entries);
            for at in entries {
                frame.builder.patch_jump(at, handler);
            }
        }
    }

    fn gen_try_catch<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let scope_id = node.annot.scope().expect("try without scope");
        self.unit.scope_stack.push(scope_id);

        let result = (|| {
            let rcatch = frame.regs.alloc(node.pos())?;
            self.unit.scopes[scope_id].catch_ref.catch_reg = Some(rcatch);

            let arm = frame
                .builder
                .emit_jump(Opcode::Catch, &[i64::from(rcatch), 0]);

            self.gen_statement(frame, &node.children[0])?;

            frame.builder.emit(Opcode::Cancel, &[]);
            self.restore_enclosing_catch(frame, scope_id);
            let done = frame.builder.emit_jump(Opcode::Jump, &[0]);

            // Handler.
            let handler = frame.builder.here();
            frame.builder.patch_jump(arm, handler);
            self.patch_child_catch_entries(frame, scope_id, handler);
            self.unit.scopes[scope_id].catch_ref.catch_reg = None;
            self.restore_enclosing_catch(frame, scope_id);

            let catch_node = &node.children[1];
            let var = catch_node.children[0].children[0]
                .annot
                .var_ref()
                .expect("unresolved catch variable")
                .var;
            self.unit.vars[var].reg = Some(rcatch);

            self.gen_statement(frame, &catch_node.children[1])?;

            self.unit.vars[var].reg = None;

            let end = frame.builder.here();
            frame.builder.patch_jump(done, end);

            frame.regs.free(rcatch);
            Ok(())
        })();

        self.release_scope_regs(frame, scope_id);
        self.unit.scope_stack.pop();
        result
    }

    fn gen_try_defer<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let scope_id = node.annot.scope().expect("defer without scope");
        self.unit.scope_stack.push(scope_id);

        let handler_node = &node.children[1];

        let result = (|| {
            let rcatch = frame.regs.alloc(node.pos())?;
            self.unit.scopes[scope_id].catch_ref.catch_reg = Some(rcatch);
            self.unit.scopes[scope_id].catch_ref.finally_active = true;

            let arm = frame
                .builder
                .emit_jump(Opcode::Catch, &[i64::from(rcatch), 0]);

            frame.defer_stack.push(handler_node);
            let body_result = self.gen_statement(frame, &node.children[0]);
            frame.defer_stack.pop();
            body_result?;

            frame.builder.emit(Opcode::Cancel, &[]);
            self.restore_enclosing_catch(frame, scope_id);

            // Normal exit runs the handler inline.
            self.gen_statement(frame, handler_node)?;
            let done = frame.builder.emit_jump(Opcode::Jump, &[0]);

            // Exceptional exit runs the handler, then rethrows.
            let handler = frame.builder.here();
            frame.builder.patch_jump(arm, handler);
            self.patch_child_catch_entries(frame, scope_id, handler);
            self.unit.scopes[scope_id].catch_ref.catch_reg = None;
            self.restore_enclosing_catch(frame, scope_id);

            self.gen_statement(frame, handler_node)?;
            frame.builder.emit(Opcode::Throw, &[i64::from(rcatch)]);

            let end = frame.builder.here();
            frame.builder.patch_jump(done, end);

            self.unit.scopes[scope_id].catch_ref.finally_active = false;
            frame.regs.free(rcatch);
            Ok(())
        })();

        self.release_scope_regs(frame, scope_id);
        self.unit.scope_stack.pop();
        result
    }

    /// Inline the active defer handlers above `depth`, innermost first;
    /// used when control leaves their regions early.
    fn run_defers<'a>(&mut self, frame: &mut FrameCtx<'a>, depth: usize) -> Result<()> {
        let handlers: Vec<&'a AstNode> = frame.defer_stack[depth..].to_vec();
        for &handler in handlers.iter().rev() {
            frame.builder.emit(Opcode::Cancel, &[]);
            self.gen_statement(frame, handler)?;
        }
        Ok(())
    }

    fn gen_continue<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let _ = node;
        let depth = frame
            .continues
            .last()
            .map(|c| c.defer_depth)
            .unwrap_or(frame.defer_stack.len());
        self.run_defers(frame, depth)?;

        let j = frame.builder.emit_jump(Opcode::Jump, &[0]);
        if let Some(ctx) = frame.continues.last_mut() {
            ctx.fixups.push(j);
        }
        Ok(())
    }

    fn gen_break<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let _ = node;
        let depth = frame
            .breaks
            .last()
            .map(|c| c.defer_depth)
            .unwrap_or(frame.defer_stack.len());
        self.run_defers(frame, depth)?;

        let j = frame.builder.emit_jump(Opcode::Jump, &[0]);
        if let Some(ctx) = frame.breaks.last_mut() {
            ctx.fixups.push(j);
        }
        Ok(())
    }

    fn gen_return<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let mut val = match node.children.first() {
            Some(expr) => self.gen_expr(frame, expr)?,
            None => {
                let r = frame.regs.alloc(node.pos())?;
                frame.builder.emit(Opcode::LoadVoid, &[i64::from(r)]);
                RegVal::temp(r)
            }
        };

        // The handlers run after the value is computed; a value sitting
        // in a variable's register must be saved from them.
        if !frame.defer_stack.is_empty() && !val.temp {
            let saved = frame.regs.alloc(node.pos())?;
            frame
                .builder
                .emit(Opcode::Move, &[i64::from(saved), i64::from(val.reg)]);
            val = RegVal::temp(saved);
        }

        self.run_defers(frame, 0)?;

        frame.builder.emit(Opcode::Return, &[i64::from(val.reg)]);
        self.free_val(frame, val);
        Ok(())
    }

    fn gen_throw<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let val = self.gen_expr(frame, &node.children[0])?;
        frame.builder.emit(Opcode::Throw, &[i64::from(val.reg)]);
        self.free_val(frame, val);
        Ok(())
    }

    fn gen_assert<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let val = self.gen_expr(frame, &node.children[0])?;
        let ok = frame
            .builder
            .emit_jump(Opcode::JumpCond, &[0, i64::from(val.reg)]);
        self.free_val(frame, val);

        // The landmark marks the end of the asserted expression in the
        // source, so the message can quote it.
        let expr_span = node.children[0].token.span;
        let mark_span = node.children[1].token.span;
        let quoted = if expr_span.begin < mark_span.begin
            && (mark_span.begin as usize) <= self.source().len()
        {
            self.source()[expr_span.begin as usize..mark_span.begin as usize].trim()
        } else {
            ""
        };
        let text = if quoted.is_empty() {
            "assertion failed".to_owned()
        } else {
            format!("assertion failed: {}", quoted)
        };
        let idx = self.unit.constants.string(&text, StringEscape::Raw);
        let r = frame.regs.alloc(node.pos())?;
        self.emit_load_const(frame, r, idx);
        frame.builder.emit(Opcode::Throw, &[i64::from(r)]);
        frame.regs.free(r);

        let end = frame.builder.here();
        frame.builder.patch_jump(ok, end);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    fn gen_assignment<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<()> {
        let lhs = &node.children[0];
        let rhs = &node.children[1];
        let op = node.token.kind.op().unwrap_or(Op::Set);

        // Self-referencing functions need their variable visible while
        // the literal is being emitted; the variable's storage exists
        // from frame entry, so plain emission order suffices here.

        if node.kind == NodeKind::MultiAssignment {
            let src = self.gen_expr(frame, rhs)?;

            for (i, target) in lhs.children.iter().enumerate() {
                if matches!(target.kind, NodeKind::Placeholder | NodeKind::VoidLiteral) {
                    continue;
                }
                let elem = frame.regs.alloc(node.pos())?;
                frame.builder.emit(
                    Opcode::GetElem8,
                    &[i64::from(elem), i64::from(src.reg), i as i64],
                );
                self.store_target(frame, target, elem)?;
                frame.regs.free(elem);
            }

            self.free_val(frame, src);
            return Ok(());
        }

        let target = &lhs.children[0];

        if op == Op::Set {
            // Declarations of register-resident locals can evaluate the
            // initializer straight into the variable's register.
            if lhs.kind != NodeKind::LeftHandSide && target.kind == NodeKind::Identifier {
                if let Some(var_ref) = target.annot.var_ref() {
                    if self.unit.vars[var_ref.var].kind == VarKind::Local {
                        let reg = self.var_reg(frame, var_ref.var, node.pos())?;
                        let val = self.gen_expr(frame, rhs)?;
                        if val.reg != reg {
                            frame
                                .builder
                                .emit(Opcode::Move, &[i64::from(reg), i64::from(val.reg)]);
                        }
                        self.free_val(frame, val);
                        return Ok(());
                    }
                }
            }

            let val = self.gen_expr(frame, rhs)?;
            self.store_target(frame, target, val.reg)?;
            self.free_val(frame, val);
            return Ok(());
        }

        // Compound assignment: read, combine, write back.
        let binary_op = op.map_op_assignment().unwrap_or(Op::Add);

        let current = self.load_target(frame, target)?;
        let rhs_val = self.gen_expr(frame, rhs)?;
        let dst = frame.regs.alloc(node.pos())?;

        self.emit_binary(frame, binary_op, dst, current.reg, rhs_val.reg);

        self.free_val(frame, rhs_val);
        self.free_val(frame, current);

        self.store_target(frame, target, dst)?;
        frame.regs.free(dst);
        Ok(())
    }

    /// Read the current value of an assignment target.
    fn load_target<'a>(&mut self, frame: &mut FrameCtx<'a>, target: &'a AstNode) -> Result<RegVal> {
        self.gen_expr(frame, target)
    }

    /// Write a register into an assignment target.
    fn store_target<'a>(&mut self, frame: &mut FrameCtx<'a>, target: &'a AstNode, src: u8) -> Result<()> {
        match target.kind {
            NodeKind::Identifier => {
                let var_ref = target.annot.var_ref().expect("unresolved store target");
                self.var_store(frame, var_ref, src, target.pos())
            }
            NodeKind::Refinement => {
                let obj = self.gen_expr(frame, &target.children[0])?;
                self.emit_set_member(frame, obj.reg, &target.children[1], src)?;
                self.free_val(frame, obj);
                Ok(())
            }
            NodeKind::Slice => {
                // Only plain `=` reaches here; assign through the
                // `insert` protocol: obj[a:b] = v.
                let obj = self.gen_expr(frame, &target.children[0])?;
                let begin = self.gen_expr(frame, &target.children[1])?;
                let end = self.gen_expr(frame, &target.children[2])?;

                // No dedicated opcode: call obj.insert(a, b, v).
                let fun = frame.regs.alloc(target.pos())?;
                let name_idx = self.unit.constants.string("insert", StringEscape::Raw);
                self.emit_get_prop(frame, fun, obj.reg, name_idx);

                let args = frame.regs.alloc_span(3, target.pos())?;
                frame
                    .builder
                    .emit(Opcode::Move, &[i64::from(args), i64::from(begin.reg)]);
                frame
                    .builder
                    .emit(Opcode::Move, &[i64::from(args + 1), i64::from(end.reg)]);
                frame
                    .builder
                    .emit(Opcode::Move, &[i64::from(args + 2), i64::from(src)]);

                let dst = frame.regs.alloc(target.pos())?;
                frame.builder.emit(
                    Opcode::CallN,
                    &[
                        i64::from(dst),
                        i64::from(fun),
                        i64::from(obj.reg),
                        i64::from(args),
                        3,
                    ],
                );

                frame.regs.free(dst);
                frame.regs.free(fun);
                self.free_val(frame, end);
                self.free_val(frame, begin);
                self.free_val(frame, obj);
                Ok(())
            }
            NodeKind::Placeholder | NodeKind::VoidLiteral => Ok(()),
            _ => Err(Error::internal(
                "unsupported assignment target",
                target.pos(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Variable access
    // ------------------------------------------------------------------

    /// The register of a register-resident variable, allocating it on
    /// first use (declaration).
    fn var_reg(&mut self, frame: &mut FrameCtx<'_>, var: VarId, pos: Position) -> Result<u8> {
        if let Some(reg) = self.unit.vars[var].reg {
            return Ok(reg);
        }
        let reg = frame.regs.alloc(pos)?;
        self.unit.vars[var].reg = Some(reg);
        Ok(reg)
    }

    /// The register holding the bound slice of the frame owning `var`,
    /// within the current frame.
    fn capture_reg(&self, frame: &FrameCtx<'_>, var: VarId) -> Result<u8> {
        let owner = {
            let scope = self.unit.vars[var].scope;
            self.unit.scopes[scope].owning_frame
        };
        let f = self.unit.scopes[frame.scope].frame.as_ref().expect("frame scope without frame data");
        f.scope_refs
            .get(&owner)
            .and_then(|r| r.vars_reg)
            .ok_or_else(|| {
                Error::internal("capture without scope ref", self.unit.vars[var].token.pos)
            })
    }

    /// Slot of an independent variable within its frame's closure
    /// region.
    fn closure_slot(&self, var: VarId) -> Result<i64> {
        let owner = {
            let scope = self.unit.vars[var].scope;
            self.unit.scopes[scope].owning_frame
        };
        let f = self.unit.scopes[owner].frame.as_ref().expect("frame scope without frame data");
        let base = f
            .closure_reg
            .ok_or_else(|| Error::internal("independent variable without closure region", Position::NONE))?;
        let reg = self.unit.vars[var]
            .reg
            .ok_or_else(|| Error::internal("independent variable without register", Position::NONE))?;
        Ok(i64::from(reg) - i64::from(base))
    }

    fn var_load(&mut self, frame: &mut FrameCtx<'_>, var_ref: VarRef, pos: Position) -> Result<RegVal> {
        let var = var_ref.var;
        let data_kind = self.unit.vars[var].kind;
        let array_idx = self.unit.vars[var].array_idx;
        let module_idx = self.unit.vars[var].module_idx;

        if var_ref.const_fun {
            // Direct reference to a const function's constant.
            let fun_const = self.const_fun_index(var)?;
            let dst = frame.regs.alloc(pos)?;
            self.emit_load_fun(frame, dst, fun_const);
            return Ok(RegVal::temp(dst));
        }

        match data_kind {
            VarKind::Global => {
                let dst = frame.regs.alloc(pos)?;
                frame
                    .builder
                    .emit(Opcode::GetGlobal, &[i64::from(dst), i64::from(array_idx)]);
                Ok(RegVal::temp(dst))
            }
            VarKind::Module => {
                let dst = frame.regs.alloc(pos)?;
                frame
                    .builder
                    .emit(Opcode::GetMod, &[i64::from(dst), i64::from(module_idx)]);
                Ok(RegVal::temp(dst))
            }
            VarKind::Imported => {
                let dst = frame.regs.alloc(pos)?;
                frame.builder.emit(
                    Opcode::GetModElem,
                    &[i64::from(dst), i64::from(module_idx), i64::from(array_idx)],
                );
                Ok(RegVal::temp(dst))
            }
            VarKind::Local | VarKind::ArgumentInReg | VarKind::IndependentArgInReg => {
                if var_ref.local {
                    let reg = self.var_reg(frame, var, pos)?;
                    Ok(RegVal::pinned(reg))
                } else {
                    // Captured: fetch from the bound slice.
                    let src = self.capture_reg(frame, var)?;
                    let slot = self.closure_slot(var)?;
                    let dst = frame.regs.alloc(pos)?;
                    frame
                        .builder
                        .emit(Opcode::GetElem8, &[i64::from(dst), i64::from(src), slot]);
                    Ok(RegVal::temp(dst))
                }
            }
            VarKind::IndependentLocal => {
                if var_ref.local {
                    let reg = self.unit.vars[var].reg.ok_or_else(|| {
                        Error::internal("independent local without register", pos)
                    })?;
                    Ok(RegVal::pinned(reg))
                } else {
                    let src = self.capture_reg(frame, var)?;
                    let slot = self.closure_slot(var)?;
                    let dst = frame.regs.alloc(pos)?;
                    frame
                        .builder
                        .emit(Opcode::GetElem8, &[i64::from(dst), i64::from(src), slot]);
                    Ok(RegVal::temp(dst))
                }
            }
            VarKind::Argument | VarKind::IndependentArgument => {
                if var_ref.local {
                    // Lives in the rest array.
                    if let Some(reg) = self.unit.vars[var].reg {
                        return Ok(RegVal::pinned(reg));
                    }
                    let rest = frame.rest_reg.ok_or_else(|| {
                        Error::internal("array argument without rest register", pos)
                    })?;
                    let dst = frame.regs.alloc(pos)?;
                    frame.builder.emit(
                        Opcode::GetElem8,
                        &[i64::from(dst), i64::from(rest), i64::from(array_idx)],
                    );
                    Ok(RegVal::temp(dst))
                } else {
                    let src = self.capture_reg(frame, var)?;
                    let slot = self.closure_slot(var)?;
                    let dst = frame.regs.alloc(pos)?;
                    frame
                        .builder
                        .emit(Opcode::GetElem8, &[i64::from(dst), i64::from(src), slot]);
                    Ok(RegVal::temp(dst))
                }
            }
        }
    }

    fn var_store(&mut self, frame: &mut FrameCtx<'_>, var_ref: VarRef, src: u8, pos: Position) -> Result<()> {
        let var = var_ref.var;
        let kind = self.unit.vars[var].kind;
        let array_idx = self.unit.vars[var].array_idx;

        match kind {
            VarKind::Global => {
                frame
                    .builder
                    .emit(Opcode::SetGlobal, &[i64::from(array_idx), i64::from(src)]);
                Ok(())
            }
            VarKind::Local | VarKind::ArgumentInReg => {
                if var_ref.local {
                    let reg = self.var_reg(frame, var, pos)?;
                    if reg != src {
                        frame
                            .builder
                            .emit(Opcode::Move, &[i64::from(reg), i64::from(src)]);
                    }
                    Ok(())
                } else {
                    let dst = self.capture_reg(frame, var)?;
                    let slot = self.closure_slot(var)?;
                    frame
                        .builder
                        .emit(Opcode::SetElem8, &[i64::from(dst), slot, i64::from(src)]);
                    Ok(())
                }
            }
            VarKind::IndependentLocal | VarKind::IndependentArgInReg => {
                if var_ref.local {
                    let reg = self.unit.vars[var].reg.ok_or_else(|| {
                        Error::internal("independent local without register", pos)
                    })?;
                    if reg != src {
                        frame
                            .builder
                            .emit(Opcode::Move, &[i64::from(reg), i64::from(src)]);
                    }
                    Ok(())
                } else {
                    let dst = self.capture_reg(frame, var)?;
                    let slot = self.closure_slot(var)?;
                    frame
                        .builder
                        .emit(Opcode::SetElem8, &[i64::from(dst), slot, i64::from(src)]);
                    Ok(())
                }
            }
            VarKind::Argument | VarKind::IndependentArgument => {
                if var_ref.local {
                    if let Some(reg) = self.unit.vars[var].reg {
                        if reg != src {
                            frame
                                .builder
                                .emit(Opcode::Move, &[i64::from(reg), i64::from(src)]);
                        }
                        return Ok(());
                    }
                    let rest = frame.rest_reg.ok_or_else(|| {
                        Error::internal("array argument without rest register", pos)
                    })?;
                    frame.builder.emit(
                        Opcode::SetElem8,
                        &[i64::from(rest), i64::from(array_idx), i64::from(src)],
                    );
                    Ok(())
                } else {
                    let dst = self.capture_reg(frame, var)?;
                    let slot = self.closure_slot(var)?;
                    frame
                        .builder
                        .emit(Opcode::SetElem8, &[i64::from(dst), slot, i64::from(src)]);
                    Ok(())
                }
            }
            VarKind::Module | VarKind::Imported => Err(Error::internal(
                "assignment to module binding survived resolution",
                pos,
            )),
        }
    }

    /// Constant index of a const function referenced directly.
    fn const_fun_index(&self, var: VarId) -> Result<u32> {
        let pos = self.unit.vars[var].token.pos;
        let fun_node = self.unit.vars[var]
            .value
            .as_deref()
            .ok_or_else(|| Error::internal("const function without value", pos))?;
        let scope = fun_node
            .annot
            .scope()
            .ok_or_else(|| Error::internal("const function without scope", pos))?;
        self.unit.scopes[scope]
            .frame
            .as_ref()
            .and_then(|f| f.constant)
            .ok_or_else(|| Error::internal("const function without constant", pos))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn is_const_true(&self, node: &AstNode) -> bool {
        match node.kind {
            NodeKind::BoolLiteral => node.token.kind.keyword() == Some(Keyword::True),
            _ => false,
        }
    }

    fn is_const_false(&self, node: &AstNode) -> bool {
        match node.kind {
            NodeKind::BoolLiteral => node.token.kind.keyword() == Some(Keyword::False),
            _ => false,
        }
    }

    fn free_val(&mut self, frame: &mut FrameCtx<'_>, val: RegVal) {
        if val.temp {
            frame.regs.free(val.reg);
        }
    }

    fn emit_load_const(&mut self, frame: &mut FrameCtx<'_>, dst: u8, idx: u32) {
        if idx <= 0xFF {
            frame
                .builder
                .emit(Opcode::LoadConst8, &[i64::from(dst), i64::from(idx)]);
        } else {
            frame
                .builder
                .emit(Opcode::LoadConst, &[i64::from(dst), i64::from(idx)]);
        }
    }

    fn emit_load_fun(&mut self, frame: &mut FrameCtx<'_>, dst: u8, idx: u32) {
        if idx <= 0xFF {
            frame
                .builder
                .emit(Opcode::LoadFun8, &[i64::from(dst), i64::from(idx)]);
        } else {
            frame
                .builder
                .emit(Opcode::LoadFun, &[i64::from(dst), i64::from(idx)]);
        }
    }

    fn emit_get_prop(&mut self, frame: &mut FrameCtx<'_>, dst: u8, obj: u8, name_idx: u32) {
        if name_idx <= 0xFF {
            frame.builder.emit(
                Opcode::GetProp8,
                &[i64::from(dst), i64::from(obj), i64::from(name_idx)],
            );
        } else {
            let key = dst; // reuse destination as scratch for the key
            self.emit_load_const(frame, key, name_idx);
            frame.builder.emit(
                Opcode::Get,
                &[i64::from(dst), i64::from(obj), i64::from(key)],
            );
        }
    }

    fn emit_binary(&mut self, frame: &mut FrameCtx<'_>, op: Op, dst: u8, a: u8, b: u8) {
        let (opcode, a, b) = match op {
            Op::Add => (Opcode::Add, a, b),
            Op::Sub => (Opcode::Sub, a, b),
            Op::Mul => (Opcode::Mul, a, b),
            Op::Div => (Opcode::Div, a, b),
            Op::Mod => (Opcode::Mod, a, b),
            Op::And => (Opcode::And, a, b),
            Op::Or => (Opcode::Or, a, b),
            Op::Xor => (Opcode::Xor, a, b),
            Op::Shl => (Opcode::Shl, a, b),
            Op::Shr => (Opcode::Shr, a, b),
            Op::Shru => (Opcode::Shru, a, b),
            Op::Eq => (Opcode::CmpEq, a, b),
            Op::Ne => (Opcode::CmpNe, a, b),
            Op::Le => (Opcode::CmpLe, a, b),
            Op::Lt => (Opcode::CmpLt, a, b),
            // Reversed operands express > and >= with <= and <.
            Op::Gt => (Opcode::CmpLt, b, a),
            Op::Ge => (Opcode::CmpLe, b, a),
            _ => (Opcode::Add, a, b),
        };
        frame
            .builder
            .emit(opcode, &[i64::from(dst), i64::from(a), i64::from(b)]);
    }

    fn gen_expr<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        frame.builder.set_line(node.token.pos.line);

        match node.kind {
            NodeKind::NumericLiteral => {
                let value = node
                    .numeric_value(self.source())
                    .map_err(|msg| Error::compile(msg, node.pos()))?;
                let dst = frame.regs.alloc(node.pos())?;
                match value {
                    Numeric::Integer(v) if (-128..=127).contains(&v) => {
                        frame.builder.emit(Opcode::LoadInt8, &[i64::from(dst), v]);
                    }
                    Numeric::Integer(v) => {
                        let idx = self.unit.constants.integer(v);
                        self.emit_load_const(frame, dst, idx);
                    }
                    Numeric::Float(v) => {
                        let idx = self.unit.constants.float(v);
                        self.emit_load_const(frame, dst, idx);
                    }
                }
                Ok(RegVal::temp(dst))
            }

            NodeKind::StringLiteral => {
                let (text, escape) = node.string_value(self.source());
                let text = text.to_owned();
                let idx = self.unit.constants.string(&text, escape);
                let dst = frame.regs.alloc(node.pos())?;
                self.emit_load_const(frame, dst, idx);
                Ok(RegVal::temp(dst))
            }

            NodeKind::BoolLiteral => {
                let dst = frame.regs.alloc(node.pos())?;
                let opcode = if self.is_const_true(node) {
                    Opcode::LoadTrue
                } else {
                    Opcode::LoadFalse
                };
                frame.builder.emit(opcode, &[i64::from(dst)]);
                Ok(RegVal::temp(dst))
            }

            NodeKind::VoidLiteral | NodeKind::Placeholder => {
                let dst = frame.regs.alloc(node.pos())?;
                frame.builder.emit(Opcode::LoadVoid, &[i64::from(dst)]);
                Ok(RegVal::temp(dst))
            }

            NodeKind::LineLiteral => {
                let dst = frame.regs.alloc(node.pos())?;
                let line = i64::from(node.token.pos.line);
                if (-128..=127).contains(&line) {
                    frame.builder.emit(Opcode::LoadInt8, &[i64::from(dst), line]);
                } else {
                    let idx = self.unit.constants.integer(line);
                    self.emit_load_const(frame, dst, idx);
                }
                Ok(RegVal::temp(dst))
            }

            NodeKind::ThisLiteral => {
                let reg = frame
                    .this_reg
                    .ok_or_else(|| Error::internal("'this' register missing", node.pos()))?;
                Ok(RegVal::pinned(reg))
            }

            NodeKind::SuperCtorLiteral => {
                let reg = frame.base_ctor_reg.ok_or_else(|| {
                    Error::internal("base constructor register missing", node.pos())
                })?;
                Ok(RegVal::pinned(reg))
            }

            NodeKind::SuperProtoLiteral => {
                let reg = frame.base_proto_reg.ok_or_else(|| {
                    Error::internal("base prototype register missing", node.pos())
                })?;
                Ok(RegVal::pinned(reg))
            }

            NodeKind::Identifier => {
                let var_ref = node.annot.var_ref().expect("unresolved identifier");
                self.var_load(frame, var_ref, node.pos())
            }

            NodeKind::Operator => self.gen_operator(frame, node),

            NodeKind::Refinement | NodeKind::OptRefinement => self.gen_refinement(frame, node),

            NodeKind::Slice => self.gen_slice(frame, node),

            NodeKind::Invocation => self.gen_invocation(frame, node, None),

            NodeKind::Async => {
                // Parsing desugared `async` to an invocation wrapper;
                // the runtime decides how to schedule it.
                self.gen_expr(frame, &node.children[0])
            }

            NodeKind::Yield => {
                let src = self.gen_expr(frame, &node.children[0])?;
                let dst = frame.regs.alloc(node.pos())?;
                frame
                    .builder
                    .emit(Opcode::Yield, &[i64::from(dst), i64::from(src.reg)]);
                self.free_val(frame, src);
                Ok(RegVal::temp(dst))
            }

            NodeKind::InterpolatedString => self.gen_interpolated_string(frame, node),

            NodeKind::ArrayLiteral => self.gen_array_literal(frame, node),

            NodeKind::ObjectLiteral => self.gen_object_literal(frame, node),

            NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral => {
                self.gen_closure(frame, node)
            }

            NodeKind::ClassLiteral => self.gen_class(frame, node),

            NodeKind::Expand => self.gen_expr(frame, &node.children[0]),

            _ => Err(Error::internal(
                "unexpected node in expression position",
                node.pos(),
            )),
        }
    }

    fn gen_operator<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        if let Some(op) = node.token.kind.op() {
            match op {
                Op::LogAnd | Op::LogOr => return self.gen_short_circuit(frame, node, op),
                Op::LogTri => return self.gen_ternary(frame, node),
                Op::LogNot => {
                    let src = self.gen_expr(frame, &node.children[0])?;
                    let dst = frame.regs.alloc(node.pos())?;
                    frame
                        .builder
                        .emit(Opcode::Not, &[i64::from(dst), i64::from(src.reg)]);
                    self.free_val(frame, src);
                    return Ok(RegVal::temp(dst));
                }
                Op::Not => {
                    // Bitwise complement: x ^ -1.
                    let src = self.gen_expr(frame, &node.children[0])?;
                    let ones = frame.regs.alloc(node.pos())?;
                    frame.builder.emit(Opcode::LoadInt8, &[i64::from(ones), -1]);
                    let dst = frame.regs.alloc(node.pos())?;
                    frame.builder.emit(
                        Opcode::Xor,
                        &[i64::from(dst), i64::from(src.reg), i64::from(ones)],
                    );
                    frame.regs.free(ones);
                    self.free_val(frame, src);
                    return Ok(RegVal::temp(dst));
                }
                Op::Add | Op::Sub if node.children.len() == 1 => {
                    // Unary plus/minus on a non-constant: 0 +/- x.
                    let src = self.gen_expr(frame, &node.children[0])?;
                    if op == Op::Add {
                        return Ok(src);
                    }
                    let zero = frame.regs.alloc(node.pos())?;
                    frame.builder.emit(Opcode::LoadInt8, &[i64::from(zero), 0]);
                    let dst = frame.regs.alloc(node.pos())?;
                    frame.builder.emit(
                        Opcode::Sub,
                        &[i64::from(dst), i64::from(zero), i64::from(src.reg)],
                    );
                    frame.regs.free(zero);
                    self.free_val(frame, src);
                    return Ok(RegVal::temp(dst));
                }
                _ => {
                    let a = self.gen_expr(frame, &node.children[0])?;
                    let b = self.gen_expr(frame, &node.children[1])?;
                    let dst = frame.regs.alloc(node.pos())?;
                    self.emit_binary(frame, op, dst, a.reg, b.reg);
                    self.free_val(frame, b);
                    self.free_val(frame, a);
                    return Ok(RegVal::temp(dst));
                }
            }
        }

        // Keyword operators.
        match node.token.kind.keyword() {
            Some(Keyword::Typeof) => {
                let src = self.gen_expr(frame, &node.children[0])?;
                let dst = frame.regs.alloc(node.pos())?;
                frame
                    .builder
                    .emit(Opcode::Type, &[i64::from(dst), i64::from(src.reg)]);
                self.free_val(frame, src);
                Ok(RegVal::temp(dst))
            }
            Some(Keyword::Delete) => {
                let target = &node.children[0];
                match target.kind {
                    NodeKind::Refinement => {
                        let obj = self.gen_expr(frame, &target.children[0])?;
                        let key_node = &target.children[1];
                        if let Some(idx) = self.prop_const_idx(key_node)? {
                            if idx <= 0xFF {
                                frame
                                    .builder
                                    .emit(Opcode::DelProp8, &[i64::from(obj.reg), i64::from(idx)]);
                            } else {
                                let key = frame.regs.alloc(node.pos())?;
                                self.emit_load_const(frame, key, idx);
                                frame
                                    .builder
                                    .emit(Opcode::Del, &[i64::from(obj.reg), i64::from(key)]);
                                frame.regs.free(key);
                            }
                        } else {
                            let key = self.gen_expr(frame, key_node)?;
                            frame
                                .builder
                                .emit(Opcode::Del, &[i64::from(obj.reg), i64::from(key.reg)]);
                            self.free_val(frame, key);
                        }
                        self.free_val(frame, obj);
                    }
                    _ => {
                        let val = self.gen_expr(frame, target)?;
                        self.free_val(frame, val);
                    }
                }
                let dst = frame.regs.alloc(node.pos())?;
                frame.builder.emit(Opcode::LoadVoid, &[i64::from(dst)]);
                Ok(RegVal::temp(dst))
            }
            Some(Keyword::In) | Some(Keyword::Propertyof) => {
                // Children are (container, key) after the parser's swap.
                let deep = node.token.kind.keyword() == Some(Keyword::In);
                let obj = self.gen_expr(frame, &node.children[0])?;
                let key_node = &node.children[1];
                let dst = frame.regs.alloc(node.pos())?;

                if let Some(idx) = self.prop_const_idx(key_node)? {
                    if idx <= 0xFF {
                        let opcode = if deep {
                            Opcode::HasDpProp8
                        } else {
                            Opcode::HasShProp8
                        };
                        frame.builder.emit(
                            opcode,
                            &[i64::from(dst), i64::from(obj.reg), i64::from(idx)],
                        );
                        self.free_val(frame, obj);
                        return Ok(RegVal::temp(dst));
                    }
                }

                let key = self.gen_expr(frame, key_node)?;
                let opcode = if deep { Opcode::HasDp } else { Opcode::HasSh };
                frame.builder.emit(
                    opcode,
                    &[i64::from(dst), i64::from(obj.reg), i64::from(key.reg)],
                );
                self.free_val(frame, key);
                self.free_val(frame, obj);
                Ok(RegVal::temp(dst))
            }
            Some(Keyword::Instanceof) => {
                let a = self.gen_expr(frame, &node.children[0])?;
                let b = self.gen_expr(frame, &node.children[1])?;
                let dst = frame.regs.alloc(node.pos())?;
                frame.builder.emit(
                    Opcode::Instanceof,
                    &[i64::from(dst), i64::from(a.reg), i64::from(b.reg)],
                );
                self.free_val(frame, b);
                self.free_val(frame, a);
                Ok(RegVal::temp(dst))
            }
            _ => Err(Error::internal("unknown operator", node.pos())),
        }
    }

    fn gen_short_circuit<'a>(
        &mut self,
        frame: &mut FrameCtx<'a>,
        node: &'a AstNode,
        op: Op,
    ) -> Result<RegVal> {
        let dst = frame.regs.alloc(node.pos())?;

        let a = self.gen_expr(frame, &node.children[0])?;
        if a.reg != dst {
            frame
                .builder
                .emit(Opcode::Move, &[i64::from(dst), i64::from(a.reg)]);
        }
        self.free_val(frame, a);

        let skip_op = if op == Op::LogAnd {
            Opcode::JumpNotCond
        } else {
            Opcode::JumpCond
        };
        let skip = frame.builder.emit_jump(skip_op, &[0, i64::from(dst)]);

        let b = self.gen_expr(frame, &node.children[1])?;
        if b.reg != dst {
            frame
                .builder
                .emit(Opcode::Move, &[i64::from(dst), i64::from(b.reg)]);
        }
        self.free_val(frame, b);

        let end = frame.builder.here();
        frame.builder.patch_jump(skip, end);

        Ok(RegVal::temp(dst))
    }

    fn gen_ternary<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        let dst = frame.regs.alloc(node.pos())?;

        let cond = self.gen_expr(frame, &node.children[0])?;
        let to_else = frame
            .builder
            .emit_jump(Opcode::JumpNotCond, &[0, i64::from(cond.reg)]);
        self.free_val(frame, cond);

        let then_val = self.gen_expr(frame, &node.children[1])?;
        if then_val.reg != dst {
            frame
                .builder
                .emit(Opcode::Move, &[i64::from(dst), i64::from(then_val.reg)]);
        }
        self.free_val(frame, then_val);
        let to_end = frame.builder.emit_jump(Opcode::Jump, &[0]);

        let else_target = frame.builder.here();
        frame.builder.patch_jump(to_else, else_target);

        let else_val = self.gen_expr(frame, &node.children[2])?;
        if else_val.reg != dst {
            frame
                .builder
                .emit(Opcode::Move, &[i64::from(dst), i64::from(else_val.reg)]);
        }
        self.free_val(frame, else_val);

        let end = frame.builder.here();
        frame.builder.patch_jump(to_end, end);

        Ok(RegVal::temp(dst))
    }

    /// Constant-pool index for a property name that is a string literal;
    /// `None` when the key is a computed expression.
    fn prop_const_idx(&mut self, key: &AstNode) -> Result<Option<u32>> {
        if key.kind != NodeKind::StringLiteral {
            return Ok(None);
        }
        let (text, escape) = key.string_value(self.source());
        let text = text.to_owned();
        Ok(Some(self.unit.constants.string(&text, escape)))
    }

    fn gen_refinement<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        let obj = self.gen_expr(frame, &node.children[0])?;
        let key_node = &node.children[1];
        let dst = frame.regs.alloc(node.pos())?;

        // An optional refinement yields void when the object is void.
        let skip = if node.kind == NodeKind::OptRefinement {
            frame.builder.emit(Opcode::LoadVoid, &[i64::from(dst)]);
            let void_cmp = frame.regs.alloc(node.pos())?;
            frame.builder.emit(
                Opcode::CmpEq,
                &[i64::from(void_cmp), i64::from(obj.reg), i64::from(dst)],
            );
            let skip = frame
                .builder
                .emit_jump(Opcode::JumpCond, &[0, i64::from(void_cmp)]);
            frame.regs.free(void_cmp);
            Some(skip)
        } else {
            None
        };

        // Integer literal indexes use the short element form.
        let elem_idx = key_node
            .numeric_value(self.source())
            .ok()
            .filter(|_| key_node.kind == NodeKind::NumericLiteral);
        if let Some(Numeric::Integer(i)) = elem_idx {
            if (-128..=127).contains(&i) {
                frame.builder.emit(
                    Opcode::GetElem8,
                    &[i64::from(dst), i64::from(obj.reg), i],
                );
                if let Some(skip) = skip {
                    let end = frame.builder.here();
                    frame.builder.patch_jump(skip, end);
                }
                self.free_val(frame, obj);
                return Ok(RegVal::temp(dst));
            }
        }

        if let Some(idx) = self.prop_const_idx(key_node)? {
            self.emit_get_prop(frame, dst, obj.reg, idx);
        } else {
            let key = self.gen_expr(frame, key_node)?;
            frame.builder.emit(
                Opcode::Get,
                &[i64::from(dst), i64::from(obj.reg), i64::from(key.reg)],
            );
            self.free_val(frame, key);
        }

        if let Some(skip) = skip {
            let end = frame.builder.here();
            frame.builder.patch_jump(skip, end);
        }

        self.free_val(frame, obj);
        Ok(RegVal::temp(dst))
    }

    fn emit_set_member<'a>(
        &mut self,
        frame: &mut FrameCtx<'a>,
        obj: u8,
        key_node: &'a AstNode,
        src: u8,
    ) -> Result<()> {
        let elem_idx = key_node
            .numeric_value(self.source())
            .ok()
            .filter(|_| key_node.kind == NodeKind::NumericLiteral);
        if let Some(Numeric::Integer(i)) = elem_idx {
            if (-128..=127).contains(&i) {
                frame
                    .builder
                    .emit(Opcode::SetElem8, &[i64::from(obj), i, i64::from(src)]);
                return Ok(());
            }
        }

        if let Some(idx) = self.prop_const_idx(key_node)? {
            if idx <= 0xFF {
                frame.builder.emit(
                    Opcode::SetProp8,
                    &[i64::from(obj), i64::from(idx), i64::from(src)],
                );
                return Ok(());
            }
            let key = frame.regs.alloc(key_node.pos())?;
            self.emit_load_const(frame, key, idx);
            frame.builder.emit(
                Opcode::Set,
                &[i64::from(obj), i64::from(key), i64::from(src)],
            );
            frame.regs.free(key);
            return Ok(());
        }

        let key = self.gen_expr(frame, key_node)?;
        frame.builder.emit(
            Opcode::Set,
            &[i64::from(obj), i64::from(key.reg), i64::from(src)],
        );
        self.free_val(frame, key);
        Ok(())
    }

    fn gen_slice<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        let obj = self.gen_expr(frame, &node.children[0])?;
        let begin = self.gen_expr(frame, &node.children[1])?;
        let end = self.gen_expr(frame, &node.children[2])?;

        let dst = frame.regs.alloc(node.pos())?;
        frame.builder.emit(
            Opcode::GetRange,
            &[
                i64::from(dst),
                i64::from(obj.reg),
                i64::from(begin.reg),
                i64::from(end.reg),
            ],
        );

        self.free_val(frame, end);
        self.free_val(frame, begin);
        self.free_val(frame, obj);
        Ok(RegVal::temp(dst))
    }

    fn gen_interpolated_string<'a>(
        &mut self,
        frame: &mut FrameCtx<'a>,
        node: &'a AstNode,
    ) -> Result<RegVal> {
        // Build the parts into consecutive registers and concatenate
        // through the string builder of the `base` module at runtime;
        // here, parts are summed left to right with ADD.
        let mut acc = self.gen_expr(frame, &node.children[0])?;

        for part in &node.children[1..] {
            let val = self.gen_expr(frame, part)?;
            let dst = frame.regs.alloc(node.pos())?;
            frame.builder.emit(
                Opcode::Add,
                &[i64::from(dst), i64::from(acc.reg), i64::from(val.reg)],
            );
            self.free_val(frame, val);
            self.free_val(frame, acc);
            acc = RegVal::temp(dst);
        }

        Ok(acc)
    }

    fn gen_array_literal<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        let dst = frame.regs.alloc(node.pos())?;

        let has_expand = node.children.iter().any(|c| c.kind == NodeKind::Expand);

        if has_expand {
            frame.builder.emit(Opcode::LoadArray, &[i64::from(dst), 0]);
            for elem in &node.children {
                let expanded = elem.kind == NodeKind::Expand;
                let val = self.gen_expr(frame, elem)?;
                let opcode = if expanded { Opcode::PushEx } else { Opcode::Push };
                frame
                    .builder
                    .emit(opcode, &[i64::from(dst), i64::from(val.reg)]);
                self.free_val(frame, val);
            }
        } else {
            frame.builder.emit(
                Opcode::LoadArray,
                &[i64::from(dst), node.children.len() as i64],
            );
            for (i, elem) in node.children.iter().enumerate() {
                let val = self.gen_expr(frame, elem)?;
                frame.builder.emit(
                    Opcode::SetElem8,
                    &[i64::from(dst), i as i64, i64::from(val.reg)],
                );
                self.free_val(frame, val);
            }
        }

        Ok(RegVal::temp(dst))
    }

    fn gen_object_literal<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        let dst = frame.regs.alloc(node.pos())?;
        frame.builder.emit(Opcode::LoadObj, &[i64::from(dst)]);

        for prop in &node.children {
            debug_assert_eq!(prop.kind, NodeKind::Property);
            let val = self.gen_expr(frame, &prop.children[1])?;
            self.emit_set_member(frame, dst, &prop.children[0], val.reg)?;
            self.free_val(frame, val);
        }

        Ok(RegVal::temp(dst))
    }

    /// Load a function constant and bind its captured frames.
    fn gen_closure<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        let fun_idx = self.gen_nested_function(node)?;

        let inner_scope = node.annot.scope().expect("function without scope");
        let dst = frame.regs.alloc(node.pos())?;
        self.emit_load_fun(frame, dst, fun_idx);

        // Bind captured outer frames, in ref order.
        let refs: Vec<(u32, ScopeId)> = {
            let f = self.unit.scopes[inner_scope].frame.as_ref().expect("frame scope without frame data");
            f.scope_refs
                .values()
                .map(|r| (r.vars_reg_idx, r.closure))
                .collect()
        };

        let (num_binds, num_self_refs, num_binds_prev) = {
            let f = self.unit.scopes[inner_scope].frame.as_ref().expect("frame scope without frame data");
            (f.num_binds, f.num_self_refs, f.num_binds_prev)
        };

        // A self-referencing function whose only capture is its own
        // binding skips bind emission entirely.
        let skip_binds = num_binds == 0 && num_self_refs != 0 && num_binds_prev == 0;

        if !skip_binds {
            for (idx, closure) in refs {
                if closure == frame.scope {
                    frame
                        .builder
                        .emit(Opcode::BindSelf, &[i64::from(dst), i64::from(idx)]);
                } else {
                    // An intermediate frame re-exports its own bound
                    // slice of the outer frame.
                    let src = {
                        let f = self.unit.scopes[frame.scope].frame.as_ref().expect("frame scope without frame data");
                        f.scope_refs.get(&closure).and_then(|r| r.vars_reg)
                    };
                    let src = src.ok_or_else(|| {
                        Error::internal("missing intermediate scope ref", node.pos())
                    })?;
                    frame.builder.emit(
                        Opcode::Bind,
                        &[i64::from(dst), i64::from(idx), i64::from(src)],
                    );
                }
            }
        }

        // Used default arguments are evaluated at closure creation.
        let num_def_used = {
            let f = self.unit.scopes[inner_scope].frame.as_ref().expect("frame scope without frame data");
            f.num_def_used
        };
        if num_def_used > 0 {
            let defaults = frame.regs.alloc(node.pos())?;
            frame
                .builder
                .emit(Opcode::LoadArray, &[i64::from(defaults), 0]);

            let mut emitted = 0u32;
            for arg in &node.children[1].children {
                if emitted >= num_def_used {
                    break;
                }
                if arg.kind == NodeKind::Assignment {
                    let val = self.gen_expr(frame, &arg.children[1])?;
                    frame
                        .builder
                        .emit(Opcode::Push, &[i64::from(defaults), i64::from(val.reg)]);
                    self.free_val(frame, val);
                    emitted += 1;
                }
            }

            frame.builder.emit(
                Opcode::BindDefaults,
                &[i64::from(dst), i64::from(defaults)],
            );
            frame.regs.free(defaults);
        }

        Ok(RegVal::temp(dst))
    }

    /// Emit a nested function into its own builder; its code lands in
    /// the module blob before the current function's.
    fn gen_nested_function(&mut self, node: &AstNode) -> Result<u32> {
        self.gen_function(node)
    }

    fn gen_class<'a>(&mut self, frame: &mut FrameCtx<'a>, node: &'a AstNode) -> Result<RegVal> {
        let extends = &node.children[0];
        let members = &node.children[1];
        let ctor = &node.children[2];

        // The prototype constant backs this class's methods at runtime.
        let proto_const = self.unit.constants.prototype();

        let proto = frame.regs.alloc(node.pos())?;

        let base = if extends.kind != NodeKind::Empty {
            let base = self.gen_expr(frame, extends)?;
            let base_proto = frame.regs.alloc(node.pos())?;
            frame.builder.emit(
                Opcode::GetProto,
                &[i64::from(base_proto), i64::from(base.reg)],
            );
            frame.builder.emit(
                Opcode::LoadObjProto,
                &[i64::from(proto), i64::from(base_proto)],
            );
            frame.regs.free(base_proto);
            Some(base)
        } else {
            self.emit_load_const(frame, proto, proto_const);
            None
        };

        for prop in &members.children {
            let val = self.gen_expr(frame, &prop.children[1])?;
            self.emit_set_member(frame, proto, &prop.children[0], val.reg)?;
            self.free_val(frame, val);
        }

        let ctor_val = self.gen_closure(frame, ctor)?;

        let proto_name = self.unit.constants.string("prototype", StringEscape::Raw);
        if proto_name <= 0xFF {
            frame.builder.emit(
                Opcode::SetProp8,
                &[
                    i64::from(ctor_val.reg),
                    i64::from(proto_name),
                    i64::from(proto),
                ],
            );
        } else {
            let key = frame.regs.alloc(node.pos())?;
            self.emit_load_const(frame, key, proto_name);
            frame.builder.emit(
                Opcode::Set,
                &[
                    i64::from(ctor_val.reg),
                    i64::from(key),
                    i64::from(proto),
                ],
            );
            frame.regs.free(key);
        }

        if let Some(base) = base {
            self.free_val(frame, base);
        }
        frame.regs.free(proto);

        Ok(ctor_val)
    }

    fn gen_invocation<'a>(
        &mut self,
        frame: &mut FrameCtx<'a>,
        node: &'a AstNode,
        _tail: Option<()>,
    ) -> Result<RegVal> {
        let callee = &node.children[0];
        let args = &node.children[1..];

        // Method calls pass the receiver as `this`.
        let (fun, this): (RegVal, Option<RegVal>) =
            if matches!(callee.kind, NodeKind::Refinement | NodeKind::OptRefinement) {
                let obj = self.gen_expr(frame, &callee.children[0])?;
                let fun = frame.regs.alloc(node.pos())?;
                let key_node = &callee.children[1];
                if let Some(idx) = self.prop_const_idx(key_node)? {
                    self.emit_get_prop(frame, fun, obj.reg, idx);
                } else {
                    let key = self.gen_expr(frame, key_node)?;
                    frame.builder.emit(
                        Opcode::Get,
                        &[i64::from(fun), i64::from(obj.reg), i64::from(key.reg)],
                    );
                    self.free_val(frame, key);
                }
                (RegVal::temp(fun), Some(obj))
            } else {
                (self.gen_expr(frame, callee)?, None)
            };

        let has_expand = args.iter().any(|a| {
            a.kind == NodeKind::Expand
                || a.kind == NodeKind::NamedArguments
        });

        let dst = frame.regs.alloc(node.pos())?;

        if has_expand {
            // Build an argument array.
            let arr = frame.regs.alloc(node.pos())?;
            frame.builder.emit(Opcode::LoadArray, &[i64::from(arr), 0]);

            for arg in args {
                match arg.kind {
                    NodeKind::Expand => {
                        let val = self.gen_expr(frame, &arg.children[0])?;
                        frame
                            .builder
                            .emit(Opcode::PushEx, &[i64::from(arr), i64::from(val.reg)]);
                        self.free_val(frame, val);
                    }
                    NodeKind::NamedArguments => {
                        let val = self.gen_expr(frame, &arg.children[0])?;
                        frame
                            .builder
                            .emit(Opcode::Push, &[i64::from(arr), i64::from(val.reg)]);
                        self.free_val(frame, val);
                    }
                    _ => {
                        let val = self.gen_expr(frame, arg)?;
                        frame
                            .builder
                            .emit(Opcode::Push, &[i64::from(arr), i64::from(val.reg)]);
                        self.free_val(frame, val);
                    }
                }
            }

            match this {
                Some(this) => {
                    frame.builder.emit(
                        Opcode::Call,
                        &[
                            i64::from(dst),
                            i64::from(fun.reg),
                            i64::from(this.reg),
                            i64::from(arr),
                        ],
                    );
                    self.free_val(frame, this);
                }
                None => {
                    let void_this = frame.regs.alloc(node.pos())?;
                    frame
                        .builder
                        .emit(Opcode::LoadVoid, &[i64::from(void_this)]);
                    frame.builder.emit(
                        Opcode::Call,
                        &[
                            i64::from(dst),
                            i64::from(fun.reg),
                            i64::from(void_this),
                            i64::from(arr),
                        ],
                    );
                    frame.regs.free(void_this);
                }
            }

            frame.regs.free(arr);
        } else {
            // Arguments in consecutive registers.
            let n = args.len() as u32;
            let first = if n > 0 {
                frame.regs.alloc_span(n, node.pos())?
            } else {
                0
            };

            for (i, arg) in args.iter().enumerate() {
                let val = self.gen_expr(frame, arg)?;
                let target = first + i as u8;
                if val.reg != target {
                    frame
                        .builder
                        .emit(Opcode::Move, &[i64::from(target), i64::from(val.reg)]);
                }
                self.free_val(frame, val);
            }

            match this {
                Some(this) => {
                    frame.builder.emit(
                        Opcode::CallN,
                        &[
                            i64::from(dst),
                            i64::from(fun.reg),
                            i64::from(this.reg),
                            i64::from(first),
                            i64::from(n),
                        ],
                    );
                    self.free_val(frame, this);
                }
                None => {
                    frame.builder.emit(
                        Opcode::CallFun,
                        &[
                            i64::from(dst),
                            i64::from(fun.reg),
                            i64::from(first),
                            i64::from(n),
                        ],
                    );
                }
            }

            for i in 0..n {
                frame.regs.free(first + i as u8);
            }
        }

        self.free_val(frame, fun);
        Ok(RegVal::temp(dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_jump_writes_relative_offset() {
        let mut b = CodeBuilder::new();
        b.set_line(1);
        let j = b.emit_jump(Opcode::Jump, &[0]);
        b.emit(Opcode::Cancel, &[]);
        let target = b.here();
        b.patch_jump(j, target);

        let instr = crate::bytecode::decode_instr(&b.bytecode, 0).unwrap();
        assert_eq!(instr.jump_target(), Some(target));
    }

    #[test]
    fn line_map_starts_at_zero() {
        let mut b = CodeBuilder::new();
        b.set_line(3);
        b.emit(Opcode::Cancel, &[]);
        b.set_line(4);
        b.emit(Opcode::Cancel, &[]);
        assert_eq!(b.addr2line[0].offs, 0);
        assert_eq!(b.addr2line[0].line, 3);
        assert_eq!(b.addr2line[1].line, 4);
    }

}
