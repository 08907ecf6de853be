//! Module implementing the variable resolver.
//!
//! Walks the AST, builds the scope/frame tree, binds every identifier to
//! a variable, classifies variables, and records closure-capture edges as
//! [`ScopeRef`](crate::scope::ScopeRef) records on the capturing frames.

use crate::ast::{Annot, AstNode, NodeKind, VarRef};
use crate::error::{Error, Result, Warning};
use crate::module::{CompileUnit, ModuleDriver, MAX_MODULES};
use crate::scope::{FrameData, ScopeData, ScopeId, ScopeRef, VarActivation, VarData, VarId, VarKind};
use crate::token::{Keyword, Op, Token, TokenKind};
use crate::Identifier;

const ERR_CONST_ASSIGNMENT: &str = "const variable is not assignable";
const ERR_MODULE_GLOBAL_CONFLICT: &str =
    "unable to import module, a global variable with this name already exists";
const ERR_NO_SUCH_MODULE_VARIABLE: &str = "no such global in module";
const ERR_REDEFINED_VAR: &str = "redefined variable";
const ERR_TOO_MANY_MODULES: &str = "too many modules imported";
const ERR_UNDEFINED_VAR: &str = "undeclared identifier";
const ERR_UNEXPECTED_GLOBAL_THIS: &str = "'this' not allowed in global scope";
const ERR_UNEXPECTED_YIELD: &str = "'yield' not allowed in global scope";

const WARN_MAIN_NOT_PUBLIC: &str = "main function is not declared as public";

/// Resolve all variables in a parsed module.
///
/// Must run before [`CompileUnit::compile`](crate::module::CompileUnit);
/// the driver supplies module indexes and the globals of imported
/// modules.
pub fn process_vars(
    unit: &mut CompileUnit<'_>,
    driver: &mut dyn ModuleDriver,
    ast: &mut AstNode,
) -> Result<()> {
    debug_assert_eq!(ast.kind, NodeKind::Scope);

    let mut resolver = Resolver { unit, driver };
    resolver.visit_node(ast)
}

struct Resolver<'r, 's> {
    unit: &'r mut CompileUnit<'s>,
    driver: &'r mut dyn ModuleDriver,
}

impl<'r, 's> Resolver<'r, 's> {
    fn source(&self) -> &'s str {
        self.unit.source()
    }

    fn cur_scope(&self) -> ScopeId {
        *self.unit.scope_stack.last().expect("scope stack is empty")
    }

    fn cur_frame(&self) -> ScopeId {
        self.unit.cur_frame.expect("no current frame")
    }

    // ------------------------------------------------------------------
    // Variable table
    // ------------------------------------------------------------------

    fn alloc_var(&mut self, kind: VarKind, is_const: bool, token: &Token) -> VarId {
        let scope_id = self.cur_scope();
        let name: Identifier = token.text(self.source()).into();

        let mut data = VarData::new(name, scope_id, token.clone(), kind);
        data.is_const = is_const;

        let var = self.unit.vars.insert(data);
        self.unit.scopes[scope_id].vars.push(var);
        var
    }

    /// Make the variable visible, shadowing any previous binding of the
    /// same name.
    fn enable_var(&mut self, var: VarId) {
        let name = self.unit.vars[var].name.clone();
        let shadowed = self.unit.lookup.insert(name, var);
        self.unit.vars[var].shadowed = shadowed;
    }

    /// Remove the variable from the lookup table, restoring the binding
    /// it shadowed.
    fn disable_var(&mut self, var: VarId) {
        let name = self.unit.vars[var].name.clone();
        if self.unit.lookup.get(&name) != Some(&var) {
            return;
        }
        match self.unit.vars[var].shadowed.take() {
            Some(shadowed) => {
                self.unit.lookup.insert(name, shadowed);
            }
            None => {
                self.unit.lookup.remove(&name);
            }
        }
    }

    fn activate_var(&mut self, node: &AstNode) {
        // Placeholders are a result of optimization.
        if node.kind == NodeKind::Placeholder {
            return;
        }
        debug_assert_eq!(node.kind, NodeKind::Identifier);
        let var = node.annot.var_ref().expect("unresolved declaration").var;
        self.enable_var(var);
    }

    /// Activate variables declared by an assignment's first child once
    /// the declaring statement has been fully visited.
    fn activate_new_vars(&mut self, node: &AstNode) {
        if matches!(node.kind, NodeKind::Var | NodeKind::Const) {
            for child in &node.children {
                self.activate_var(child);
            }
        } else {
            debug_assert_eq!(node.kind, NodeKind::LeftHandSide);
        }
    }

    // ------------------------------------------------------------------
    // Scope stack
    // ------------------------------------------------------------------

    /// Register pre-declared globals and modules in the root scope.
    fn init_global_scope(&mut self) {
        for pre in std::mem::take(&mut self.unit.pre_globals) {
            let var = self.alloc_var(pre.kind, pre.is_const, &pre.token);
            self.unit.vars[var].array_idx = pre.idx;
            self.unit.vars[var].activation = VarActivation::AlwaysActive;

            if pre.kind == VarKind::Module {
                self.unit.vars[var].module_idx = pre.idx;
                self.unit.modules.push(var);
            } else {
                self.unit.globals.push(var);
                self.unit.num_globals = self.unit.num_globals.max(pre.idx + 1);
            }

            self.enable_var(var);
        }
    }

    fn push_scope(&mut self, alloc_frame: bool, node: &mut AstNode) {
        let parent = self.unit.scope_stack.last().copied();
        debug_assert!(parent.is_some() || alloc_frame);

        let mut scope = ScopeData::new(parent);

        scope.from_defer = node.kind == NodeKind::Scope
            && node.token.kind.keyword() == Some(Keyword::Defer);

        if alloc_frame {
            let mut frame = FrameData {
                parent_frame: self.unit.cur_frame,
                ..FrameData::default()
            };
            // Updated during optimization.
            frame.num_binds_prev = 1;
            frame.num_def_used = 1;
            scope.frame = Some(frame);
        }

        let id = self.unit.scopes.insert(scope);

        let owning_frame = if alloc_frame {
            self.unit.cur_frame = Some(id);
            id
        } else {
            self.cur_frame()
        };
        self.unit.scopes[id].owning_frame = owning_frame;

        node.annot = Annot::Scope(id);
        self.unit.scope_stack.push(id);

        if parent.is_none() {
            self.init_global_scope();
        }
    }

    fn pop_scope(&mut self) {
        let id = self.unit.scope_stack.pop().expect("scope stack is empty");

        for var in self.unit.scopes[id].vars.clone() {
            self.disable_var(var);
        }

        if self.unit.scopes[id].has_frame() {
            self.unit.cur_frame = self.unit.scopes[id]
                .frame
                .as_ref()
                .and_then(|f| f.parent_frame);
        }
    }

    fn push_function(&mut self, node: &mut AstNode) {
        self.push_scope(true, node);
        let id = self.cur_scope();
        self.unit.scopes[id].is_function = true;
    }

    /// Record that `inner_scope`'s frame captures variables of
    /// `outer_closure`'s frame.
    fn add_scope_ref(&mut self, inner_scope: ScopeId, outer_closure: ScopeId) {
        let frame = self.unit.scopes[inner_scope]
            .frame
            .as_mut()
            .expect("capture recorded on a frame-less scope");

        frame
            .scope_refs
            .entry(outer_closure)
            .or_insert_with(|| ScopeRef::new(outer_closure));
    }

    /// Resolve one identifier: attach the variable, classify the access,
    /// and thread capture records through intermediate functions.
    fn lookup_and_mark_var(&mut self, node: &mut AstNode) -> Result<VarId> {
        let name = node.token.text(self.source());

        let var = match self.unit.lookup.get(name) {
            Some(&var) => var,
            None => return Err(Error::compile(ERR_UNDEFINED_VAR, node.pos())),
        };

        let local_fun_scope = self.cur_frame();
        let var_scope = self.unit.vars[var].scope;
        let owning_fun_scope = self.unit.scopes[var_scope].owning_frame;

        let kind = self.unit.vars[var].kind;
        let mut local = false;

        if owning_fun_scope == local_fun_scope {
            // Local variable or local function argument.
            local = true;
        } else if kind.is_global_like() {
            // No closure box is needed for globals, modules and imports.
            local = true;
        } else {
            // The variable is captured by this function.
            self.unit.vars[var].kind = match kind {
                VarKind::Local | VarKind::IndependentLocal => VarKind::IndependentLocal,
                _ => VarKind::IndependentArgument,
            };

            // Reference the outer frame in every function between here
            // and the owning frame.
            for i in (0..self.unit.scope_stack.len()).rev() {
                let inner = self.unit.scope_stack[i];
                if inner == owning_fun_scope {
                    break;
                }
                if self.unit.scopes[inner].is_function {
                    self.add_scope_ref(inner, owning_fun_scope);
                }
            }
        }

        node.annot = Annot::Var(VarRef {
            var,
            local,
            const_fun: false,
        });

        Ok(var)
    }

    /// Is the name already declared in the current scope? A generated
    /// defer section checks its lexical parent too, because in source it
    /// is the same scope.
    fn find_existing_local_var(&self, name: &str) -> bool {
        let var = match self.unit.lookup.get(name) {
            Some(&var) => var,
            None => return false,
        };

        let var_scope = self.unit.vars[var].scope;
        let mut scope = self.cur_scope();

        loop {
            if scope == var_scope {
                return true;
            }

            if !self.unit.scopes[scope].from_defer {
                return false;
            }

            match self.unit.scopes[scope].parent {
                Some(parent) if !self.unit.scopes[parent].is_function => scope = parent,
                _ => return false,
            }
        }
    }

    fn define_var(&mut self, is_const: bool, node: &mut AstNode) -> Result<VarId> {
        debug_assert_eq!(node.kind, NodeKind::Identifier);

        let exported = node
            .first_child()
            .map_or(false, |c| c.kind == NodeKind::Export);
        let top_level = self.unit.scope_stack.len() == 1;
        let global = exported || (self.unit.is_interactive() && top_level);

        debug_assert!(!exported || top_level);

        let name = node.token.text(self.source());
        if self.find_existing_local_var(name) {
            return Err(Error::compile(ERR_REDEFINED_VAR, node.pos()));
        }

        let kind = if global { VarKind::Global } else { VarKind::Local };
        let var = self.alloc_var(kind, is_const, &node.token);

        node.annot = Annot::Var(VarRef {
            var,
            local: true,
            const_fun: false,
        });

        if global {
            self.unit.vars[var].array_idx = self.unit.num_globals;
            self.unit.num_globals += 1;
            self.unit.vars[var].activation = VarActivation::AlwaysActive;
            self.unit.globals.push(var);
        } else if top_level && self.unit.vars[var].name == "main" {
            self.unit
                .warnings
                .push(Warning::new(WARN_MAIN_NOT_PUBLIC, node.pos()));
        }

        Ok(var)
    }

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    /// Define one imported global as a constant in the module scope.
    fn import_global(
        &mut self,
        node: &mut AstNode,
        module_idx: u32,
        global_idx: u32,
    ) -> Result<()> {
        let var = self.define_var(true, node)?;

        if self.unit.vars[var].kind != VarKind::Global {
            self.unit.vars[var].kind = VarKind::Imported;
            self.unit.vars[var].module_idx = module_idx;
            self.unit.vars[var].array_idx = global_idx;
        }
        self.unit.vars[var].activation = VarActivation::AlwaysActive;

        self.enable_var(var);
        Ok(())
    }

    fn import(&mut self, node: &mut AstNode) -> Result<()> {
        debug_assert!(self.unit.scope_stack.len() == 1);
        debug_assert!(!node.children.is_empty());

        let mod_name: Identifier = node.children[0].token.text(self.source()).into();
        let mod_pos = node.children[0].pos();

        let module_idx = self
            .driver
            .import_module(&mod_name)
            .map_err(|msg| Error::compile(msg, mod_pos))?;

        if module_idx >= MAX_MODULES {
            return Err(Error::compile(ERR_TOO_MANY_MODULES, mod_pos));
        }

        self.unit.register_import(&mod_name, module_idx);

        if node.children.len() == 1 {
            // `import name` binds the module itself.
            let var = match self.unit.lookup.get(mod_name.as_str()) {
                Some(&existing) => {
                    // Importing the same module multiple times is allowed.
                    if self.unit.vars[existing].kind != VarKind::Module {
                        return Err(Error::compile(ERR_MODULE_GLOBAL_CONFLICT, mod_pos));
                    }
                    existing
                }
                None => {
                    let var = self.alloc_var(VarKind::Module, true, &node.children[0].token);
                    self.unit.vars[var].module_idx = module_idx;
                    self.unit.vars[var].array_idx = module_idx;
                    self.unit.vars[var].activation = VarActivation::AlwaysActive;
                    self.unit.modules.push(var);
                    self.enable_var(var);
                    var
                }
            };

            node.children[0].annot = Annot::Var(VarRef {
                var,
                local: true,
                const_fun: false,
            });

            return Ok(());
        }

        if node.children[1].token.kind.op() == Some(Op::Mul) {
            // `import name.*` pulls in every global of the module. The
            // synthesized identifier nodes are chained under the `*` node
            // so they take part in later passes.
            let mut found = Vec::new();
            self.driver.walk_globals(module_idx, &mut |name, global_idx| {
                found.push((Identifier::from(name), global_idx));
            });

            let star_pos = node.children[1].pos();
            let mut imported = Vec::with_capacity(found.len());

            for (name, global_idx) in found {
                let mut g_node = AstNode::new(
                    NodeKind::Identifier,
                    Token::synthetic(TokenKind::Identifier, name.as_str(), star_pos),
                );
                self.import_global(&mut g_node, module_idx, global_idx)?;
                imported.push(g_node);
            }

            node.children[1].children = imported;
            return Ok(());
        }

        for child in &mut node.children[1..] {
            let sym_name = child.token.text(self.unit.source());

            let global_idx = match self.driver.resolve_global(module_idx, sym_name) {
                Some(idx) => idx,
                None => return Err(Error::compile(ERR_NO_SUCH_MODULE_VARIABLE, child.pos())),
            };

            self.import_global(child, module_idx, global_idx)?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Node handlers
    // ------------------------------------------------------------------

    fn visit_child_nodes(&mut self, node: &mut AstNode) -> Result<()> {
        for child in &mut node.children {
            self.visit_node(child)?;
        }
        Ok(())
    }

    fn process_scope(&mut self, node: &mut AstNode) -> Result<()> {
        let alloc_frame = self.unit.scope_stack.is_empty();
        self.push_scope(alloc_frame, node);

        let result = self.visit_child_nodes(node);

        self.pop_scope();
        result
    }

    fn yield_expr(&mut self, node: &mut AstNode) -> Result<()> {
        let frame_scope = self.cur_frame();

        if !self.unit.scopes[frame_scope].is_function {
            return Err(Error::compile(ERR_UNEXPECTED_YIELD, node.pos()));
        }

        let frame = self.unit.scopes[frame_scope]
            .frame
            .as_mut()
            .expect("current frame is missing frame data");
        if frame.yield_token.is_none() {
            frame.yield_token = Some(node.token.clone());
        }

        self.visit_child_nodes(node)
    }

    fn var_node(&mut self, node: &mut AstNode) -> Result<()> {
        let is_const = node.kind == NodeKind::Const;

        for child in &mut node.children {
            if child.kind != NodeKind::Placeholder {
                self.define_var(is_const, child)?;
            }
        }

        Ok(())
    }

    fn left_hand_side(&mut self, node: &mut AstNode) -> Result<()> {
        for child in &mut node.children {
            if child.kind == NodeKind::Identifier {
                let var = self.lookup_and_mark_var(child)?;

                if self.unit.vars[var].is_const {
                    return Err(Error::compile(ERR_CONST_ASSIGNMENT, child.pos()));
                }
            } else {
                self.visit_node(child)?;
            }
        }

        Ok(())
    }

    fn this_literal(&mut self, node: &AstNode) -> Result<()> {
        let frame_scope = self.cur_frame();

        if !self.unit.scopes[frame_scope].is_function {
            return Err(Error::compile(ERR_UNEXPECTED_GLOBAL_THIS, node.pos()));
        }

        self.unit.scopes[frame_scope].uses_this = true;
        Ok(())
    }

    fn super_ctor_literal(&mut self) {
        let frame_scope = self.cur_frame();
        debug_assert!(self.unit.scopes[frame_scope].is_function);
        if let Some(frame) = self.unit.scopes[frame_scope].frame.as_mut() {
            frame.uses_base_ctor = true;
        }
    }

    fn super_proto_literal(&mut self) {
        let frame_scope = self.cur_frame();
        debug_assert!(self.unit.scopes[frame_scope].is_function);
        if let Some(frame) = self.unit.scopes[frame_scope].frame.as_mut() {
            frame.uses_base_proto = true;
        }
    }

    /// Default-value expressions are resolved outside the function scope
    /// so they cannot reference parameters.
    fn parameter_defaults(&mut self, params: &mut AstNode) -> Result<()> {
        debug_assert_eq!(params.kind, NodeKind::Parameters);

        for arg in &mut params.children {
            if arg.kind == NodeKind::Ellipsis {
                break;
            }
            if arg.kind == NodeKind::Assignment {
                debug_assert_eq!(arg.children.len(), 2);
                self.visit_node(&mut arg.children[1])?;
            }
        }

        Ok(())
    }

    fn function_literal(&mut self, node: &mut AstNode, fun_var: Option<VarId>) -> Result<()> {
        self.push_function(node);

        let result = self.function_literal_inner(node, fun_var);

        self.pop_scope();

        if result.is_ok() {
            // Index 1 holds the parameters.
            self.parameter_defaults(&mut node.children[1])?;
        }

        result
    }

    fn function_literal_inner(&mut self, node: &mut AstNode, fun_var: Option<VarId>) -> Result<()> {
        let scope_id = self.cur_scope();

        {
            let frame = self.unit.scopes[scope_id]
                .frame
                .as_mut()
                .expect("function scope without frame");
            let name_node = &node.children[0];
            frame.fun_token = name_node.first_child().map(|n| n.token.clone());
        }

        // Parameters: positional args get sequential indexes, the
        // ellipsis collects the rest.
        let (_, rest) = node.children.split_at_mut(1);
        self.define_parameters(&mut rest[0], scope_id)?;

        if let Some(fun_var) = fun_var {
            self.enable_var(fun_var);
        }

        // Index 3 holds the body scope.
        let body_result = self.visit_node(&mut node.children[3]);

        if let Some(fun_var) = fun_var {
            self.disable_var(fun_var);
        }

        body_result
    }

    fn define_parameters(&mut self, params: &mut AstNode, scope_id: ScopeId) -> Result<()> {
        debug_assert_eq!(params.kind, NodeKind::Parameters);

        for (i, arg) in params.children.iter_mut().enumerate() {
            let (ident, is_ellipsis, has_default) = match arg.kind {
                NodeKind::Assignment => (&mut arg.children[0], false, true),
                NodeKind::Ellipsis => (&mut arg.children[0], true, false),
                _ => (&mut *arg, false, false),
            };

            if ident.kind == NodeKind::Placeholder {
                continue;
            }
            debug_assert_eq!(ident.kind, NodeKind::Identifier);

            let var = self.define_var(false, ident)?;

            self.unit.vars[var].activation = VarActivation::AlwaysActive;
            self.enable_var(var);

            if is_ellipsis {
                self.unit.scopes[scope_id].ellipsis = Some(var);
            } else {
                self.unit.vars[var].kind = VarKind::Argument;
                self.unit.vars[var].array_idx = i as u32;
                if has_default {
                    self.unit.vars[var].has_defaults = true;
                }
            }
        }

        Ok(())
    }

    fn class_literal(&mut self, node: &mut AstNode, fun_var: Option<VarId>) -> Result<()> {
        debug_assert_eq!(node.kind, NodeKind::ClassLiteral);
        debug_assert_eq!(node.children.len(), 3);

        // extends clause
        self.visit_node(&mut node.children[0])?;

        // prototype members
        let (members, rest) = {
            let (_, tail) = node.children.split_at_mut(1);
            tail.split_at_mut(1)
        };
        let members = &mut members[0];
        for prop in &mut members.children {
            debug_assert_eq!(prop.kind, NodeKind::Property);

            self.visit_node(&mut prop.children[0])?;

            let value = &mut prop.children[1];
            if value.kind == NodeKind::FunctionLiteral {
                self.function_literal(value, fun_var)?;
            } else {
                self.visit_node(value)?;
            }
        }

        // constructor
        let ctor = &mut rest[0];
        debug_assert_eq!(ctor.kind, NodeKind::ConstructorLiteral);
        self.function_literal(ctor, fun_var)
    }

    fn catch_clause(&mut self, node: &mut AstNode) -> Result<()> {
        debug_assert!(matches!(
            node.children[0].kind,
            NodeKind::Const | NodeKind::Var
        ));

        self.var_node(&mut node.children[0])?;
        let var = node.children[0].children[0].annot.var_ref().map(|r| r.var);

        // The catch variable is active for the catch body only; the
        // enclosing scope disables it on exit.
        if let Some(var) = var {
            self.enable_var(var);
        }

        for child in &mut node.children[1..] {
            self.visit_node(child)?;
        }

        Ok(())
    }

    fn assert_stmt(&mut self, node: &mut AstNode) -> Result<()> {
        debug_assert_eq!(node.children.len(), 2);
        debug_assert_eq!(node.children[1].kind, NodeKind::Landmark);
        self.visit_node(&mut node.children[0])
    }

    fn assignment(&mut self, node: &mut AstNode) -> Result<()> {
        debug_assert_eq!(node.kind, NodeKind::Assignment);
        debug_assert_eq!(node.children.len(), 2);

        if is_self_ref_func(node) {
            self.visit_node(&mut node.children[0])?;
            let fun_var = node.children[0].children[0].annot.var_ref().map(|r| r.var);

            let value = &mut node.children[1];
            if value.kind == NodeKind::FunctionLiteral {
                self.function_literal(value, fun_var)?;
            } else {
                debug_assert_eq!(value.kind, NodeKind::ClassLiteral);
                self.class_literal(value, fun_var)?;
            }
        } else {
            self.visit_child_nodes(node)?;
        }

        self.activate_new_vars_of(node);
        Ok(())
    }

    fn activate_new_vars_of(&mut self, node: &AstNode) {
        self.activate_new_vars(&node.children[0]);
    }

    fn visit_node(&mut self, node: &mut AstNode) -> Result<()> {
        match node.kind {
            NodeKind::Import => self.import(node),
            NodeKind::Yield => self.yield_expr(node),
            NodeKind::LeftHandSide => self.left_hand_side(node),
            NodeKind::Identifier => self.lookup_and_mark_var(node).map(|_| ()),
            NodeKind::ThisLiteral => self.this_literal(node),
            NodeKind::SuperCtorLiteral => {
                self.super_ctor_literal();
                Ok(())
            }
            NodeKind::SuperProtoLiteral => {
                self.super_proto_literal();
                Ok(())
            }
            NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral => {
                self.function_literal(node, None)
            }
            NodeKind::ClassLiteral => self.class_literal(node, None),
            NodeKind::Assignment => self.assignment(node),
            NodeKind::Catch => self.catch_clause(node),
            NodeKind::Assert => self.assert_stmt(node),

            NodeKind::Var | NodeKind::Const => self.var_node(node),

            NodeKind::MultiAssignment | NodeKind::In => {
                self.visit_child_nodes(node)?;
                self.activate_new_vars_of(node);
                Ok(())
            }

            // Break, continue and fallthrough get a scope purely for
            // catch-offset threading.
            NodeKind::TryCatch
            | NodeKind::TryDefer
            | NodeKind::ForIn
            | NodeKind::Scope
            | NodeKind::Continue
            | NodeKind::Break
            | NodeKind::Fallthrough => self.process_scope(node),

            NodeKind::Empty
            | NodeKind::NumericLiteral
            | NodeKind::StringLiteral
            | NodeKind::BoolLiteral
            | NodeKind::VoidLiteral
            | NodeKind::Placeholder
            | NodeKind::LineLiteral => Ok(()),

            _ => self.visit_child_nodes(node),
        }
    }
}

/// A `const name = fun ...` where the single declared name may be used
/// for self-reference inside the function.
#[must_use]
pub fn is_self_ref_func(node: &AstNode) -> bool {
    debug_assert_eq!(node.kind, NodeKind::Assignment);

    let decl = &node.children[0];
    if decl.kind != NodeKind::Const {
        return false;
    }

    if !matches!(
        node.children[1].kind,
        NodeKind::FunctionLiteral | NodeKind::ClassLiteral
    ) {
        return false;
    }

    // Multi-assignment cannot self-refer.
    decl.children.len() == 1
}
