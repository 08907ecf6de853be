//! Module implementing the AST optimizer and the argument allocator.
//!
//! The optimizer runs as an outer fixed-point loop: each pass walks the
//! tree, performs constant folding, dead-code and dead-variable
//! elimination in place, and bumps a counter for every transformation
//! that may enable further ones. The loop stops when a full pass changes
//! nothing. Per-variable read/write counters are reset at scope entry,
//! so after the final pass they describe exactly the surviving code;
//! the register allocator and code generator depend on that.

use crate::ast::{Annot, AstNode, NodeKind, VarRef};
use crate::error::{Error, Result};
use crate::module::{CompileUnit, MAX_ARGS_IN_REGS};
use crate::resolve::is_self_ref_func;
use crate::scope::{ScopeId, VarActivation, VarId, VarKind};
use crate::token::{Keyword, Numeric, Op, StringEscape, Token, TokenKind};
use num_traits::ToPrimitive;

const ERR_DIV_BY_ZERO: &str = "division by zero";
const ERR_NUMBER_OUT_OF_RANGE: &str = "number out of range";
const ERR_SUM_OF_STRINGS_TOO_LONG: &str = "sum of two strings exceeds 65535 characters";

/// Maximum number of fixed-point iterations before giving up; a correct
/// optimizer converges in a handful of passes, so hitting this means a
/// transformation is not idempotent.
const MAX_OPTIMIZER_PASSES: u32 = 1000;

// Terminator classification, a bit set.
pub const TERM_NONE: u8 = 0;
pub const TERM_RETURN: u8 = 1;
pub const TERM_THROW: u8 = 2;
pub const TERM_BREAK: u8 = 4;

/// Run optimization passes until a fixed point is reached. Returns the
/// number of passes that ran.
pub fn optimize(unit: &mut CompileUnit<'_>, ast: &mut AstNode) -> Result<u32> {
    debug_assert_eq!(ast.kind, NodeKind::Scope);

    let mut passes = 0u32;

    loop {
        unit.num_optimizations = 0;

        let mut pass = Optimizer { unit };
        let mut terminal = TERM_NONE;
        pass.visit_node(ast, &mut terminal)?;

        passes += 1;
        tracing::debug!(
            pass = passes,
            optimizations = unit.num_optimizations,
            "optimizer pass"
        );

        if unit.num_optimizations == 0 {
            break;
        }

        if passes >= MAX_OPTIMIZER_PASSES {
            return Err(Error::internal(
                "optimizer failed to reach a fixed point",
                ast.pos(),
            ));
        }
    }

    Ok(passes)
}

struct Optimizer<'r, 's> {
    unit: &'r mut CompileUnit<'s>,
}

impl<'r, 's> Optimizer<'r, 's> {
    fn source(&self) -> &'s str {
        self.unit.source()
    }

    fn optimize_enabled(&self) -> bool {
        self.unit.options().optimize
    }

    // ------------------------------------------------------------------
    // Collapse helpers
    // ------------------------------------------------------------------

    fn mark(&mut self) {
        self.unit.num_optimizations += 1;
    }

    fn collapse_numeric(&mut self, node: &mut AstNode, value: Numeric) {
        node.kind = NodeKind::NumericLiteral;
        node.children.clear();
        node.annot = Annot::None;
        node.token = Token::synthetic(TokenKind::Numeric, value.to_string(), node.token.pos);
        node.value = Some(value);
        self.mark();
    }

    fn collapse_bool(&mut self, node: &mut AstNode, value: bool) {
        let (kw, text) = if value {
            (Keyword::True, "true")
        } else {
            (Keyword::False, "false")
        };
        node.kind = NodeKind::BoolLiteral;
        node.children.clear();
        node.annot = Annot::None;
        node.token = Token::synthetic(TokenKind::Keyword(kw), text, node.token.pos);
        node.value = None;
        self.mark();
    }

    fn collapse_void(&mut self, node: &mut AstNode) {
        node.kind = NodeKind::VoidLiteral;
        node.children.clear();
        node.annot = Annot::None;
        node.token = Token::synthetic(TokenKind::Keyword(Keyword::Void), "void", node.token.pos);
        node.value = None;
        self.mark();
    }

    fn collapse_empty(&mut self, node: &mut AstNode) {
        node.make_empty();
        self.mark();
    }

    fn collapse_string(&mut self, node: &mut AstNode, text: String, escape: StringEscape) {
        node.kind = NodeKind::StringLiteral;
        node.children.clear();
        node.annot = Annot::None;
        node.token = Token::synthetic(TokenKind::String(escape), text, node.token.pos);
        node.value = None;
        self.mark();
    }

    /// Replace a node with one of its children.
    fn promote(&mut self, node: &mut AstNode, child_idx: usize) {
        let child = std::mem::replace(
            &mut node.children[child_idx],
            AstNode::new(NodeKind::Empty, node.token.clone()),
        );
        *node = child;
    }

    // ------------------------------------------------------------------
    // Constant queries
    // ------------------------------------------------------------------

    /// Resolve a node to its compile-time constant: literals resolve to
    /// themselves, identifiers to the value of the `const` they denote.
    /// Returns a detached shallow copy to keep the tree free for
    /// mutation.
    fn get_const(&self, node: &AstNode) -> Option<AstNode> {
        if node.kind != NodeKind::Identifier {
            return Some(shallow_clone(node));
        }

        let var_ref = node.annot.var_ref()?;
        let var = &self.unit.vars[var_ref.var];

        debug_assert!(var.activation != VarActivation::Inactive);

        if var.is_const {
            var.value.as_deref().map(shallow_clone)
        } else {
            None
        }
    }

    fn numeric_of(&self, node: &AstNode) -> Option<Numeric> {
        if node.kind != NodeKind::NumericLiteral {
            return None;
        }
        node.numeric_value(self.source()).ok()
    }

    fn is_truthy(&self, node: &AstNode) -> bool {
        let node = match self.get_const(node) {
            Some(n) => n,
            None => return false,
        };

        match node.kind {
            NodeKind::BoolLiteral => node.token.kind.keyword() == Some(Keyword::True),
            NodeKind::StringLiteral
            | NodeKind::FunctionLiteral
            | NodeKind::ClassLiteral
            | NodeKind::ArrayLiteral
            | NodeKind::ObjectLiteral
            | NodeKind::InterpolatedString => true,
            NodeKind::NumericLiteral => match self.numeric_of(&node) {
                Some(Numeric::Integer(v)) => v != 0,
                Some(Numeric::Float(v)) => v != 0.0,
                None => false,
            },
            _ => false,
        }
    }

    fn is_falsy(&self, node: &AstNode) -> bool {
        let node = match self.get_const(node) {
            Some(n) => n,
            None => return false,
        };

        match node.kind {
            NodeKind::BoolLiteral => node.token.kind.keyword() == Some(Keyword::False),
            NodeKind::VoidLiteral => true,
            NodeKind::NumericLiteral => match self.numeric_of(&node) {
                Some(Numeric::Integer(v)) => v == 0,
                Some(Numeric::Float(v)) => v == 0.0,
                None => false,
            },
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Scope handling
    // ------------------------------------------------------------------

    /// Enter a scope: reset per-pass variable counters so that after
    /// this pass they reflect only the references that survive.
    fn push_scope(&mut self, node: &AstNode) -> ScopeId {
        let id = node.annot.scope().expect("scope node lost its scope");

        debug_assert_eq!(
            self.unit.scopes[id].parent,
            self.unit.scope_stack.last().copied()
        );

        for var in self.unit.scopes[id].vars.clone() {
            let data = &mut self.unit.vars[var];
            if data.activation == VarActivation::Active {
                data.activation = VarActivation::Inactive;
            }
            data.num_reads_prev = data.num_reads;
            data.num_reads = 0;
            data.num_assignments = 0;
            data.local_reads = 0;
            data.local_assignments = 0;
        }

        let scope = &mut self.unit.scopes[id];
        scope.num_vars = 0;
        scope.num_indep_vars = 0;

        if scope.has_frame() {
            let frame = scope.frame.as_mut().expect("frame scope without frame");
            frame.num_binds = 0;
            frame.uses_base_proto = false;
            frame.is_open = true;
            self.unit.cur_frame = Some(id);
        }

        self.unit.scope_stack.push(id);
        id
    }

    /// Leave a scope: classify variables, count the live ones, and
    /// trigger another pass when something became optimizable.
    fn pop_scope(&mut self) {
        let id = self.unit.scope_stack.pop().expect("scope stack is empty");

        let ellipsis = self.unit.scopes[id].ellipsis;
        let mut num_vars = 0u32;
        let mut num_indep_vars = 0u32;
        let mut triggers = 0u32;

        for var in self.unit.scopes[id].vars.clone() {
            let data = &mut self.unit.vars[var];

            // A variable that is never modified becomes a constant.
            if matches!(
                data.kind,
                VarKind::Local
                    | VarKind::Argument
                    | VarKind::IndependentLocal
                    | VarKind::IndependentArgument
            ) && !data.is_const
                && data.num_assignments == 0
            {
                data.is_const = true;
                triggers += 1;
            }

            // Demote independent vars never accessed through closures.
            if matches!(
                data.kind,
                VarKind::IndependentLocal | VarKind::IndependentArgument
            ) && data.num_reads == data.local_reads
                && data.num_assignments == data.local_assignments
            {
                data.kind = if data.kind == VarKind::IndependentArgument {
                    VarKind::Argument
                } else {
                    VarKind::Local
                };
            }

            // Count only used local variables. The ellipsis is counted
            // only when it is independent, in which case it relocates to
            // the independent-variable range.
            if matches!(data.kind, VarKind::Local | VarKind::IndependentLocal)
                && data.num_reads != 0
                && (ellipsis != Some(var) || data.kind == VarKind::IndependentLocal)
            {
                num_vars += 1;
                if data.kind == VarKind::IndependentLocal {
                    num_indep_vars += 1;
                }
            }

            // Another pass can eliminate a variable that lost its reads.
            if (data.num_assignments != 0 || data.num_reads_prev != data.num_reads)
                && data.num_reads == 0
                && data.kind != VarKind::Global
            {
                triggers += 1;
            }
        }

        self.unit.num_optimizations += triggers;

        let scope = &mut self.unit.scopes[id];
        scope.num_vars = num_vars;
        scope.num_indep_vars = num_indep_vars;

        let is_function = scope.is_function;
        let parent = scope.parent;
        let has_frame = scope.has_frame();

        if !is_function {
            if let Some(parent) = parent {
                self.unit.scopes[parent].num_vars += num_vars;
                self.unit.scopes[parent].num_indep_vars += num_indep_vars;
            }
        }

        if has_frame {
            let frame = self.unit.scopes[id]
                .frame
                .as_mut()
                .expect("frame scope without frame");

            // A self-referencing function whose binds all went away can
            // drop its bind emission next pass.
            if frame.num_self_refs != 0 && frame.num_binds == 0 && frame.num_binds_prev != 0 {
                self.unit.num_optimizations += 1;
            }

            frame.is_open = false;
            frame.num_binds_prev = frame.num_binds;

            if frame.num_binds != 0 {
                frame.num_binds += frame.num_self_refs;
            }

            let parent_frame = frame.parent_frame;
            self.unit.cur_frame = parent_frame;
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn process_scope(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        let global = self.unit.scope_stack.is_empty();

        self.push_scope(node);

        *is_terminal = TERM_NONE;

        let result = (|| {
            let mut i = 0usize;
            while i < node.children.len() {
                // Remove unneeded references to constants or variables,
                // keeping the final expression of the module.
                let is_last = i + 1 == node.children.len();
                if is_dummy_load(&node.children[i]) && (!is_last || !global) {
                    node.children.remove(i);
                    continue;
                }

                self.visit_node(&mut node.children[i], is_terminal)?;

                if *is_terminal != TERM_NONE && self.optimize_enabled() && !is_last {
                    node.children.truncate(i + 1);
                    self.mark();
                }

                i += 1;
            }
            Ok(())
        })();

        self.pop_scope();
        result
    }

    fn if_stmt(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        let mut t1 = TERM_NONE;
        self.visit_node(&mut node.children[0], &mut t1)?;

        let mut is_truthy = false;
        let mut is_falsy = false;
        if self.optimize_enabled() {
            is_truthy = self.is_truthy(&node.children[0]);
            is_falsy = !is_truthy && self.is_falsy(&node.children[0]);
        }

        if is_truthy {
            if node.children.len() > 2 {
                node.children.truncate(2);
                self.mark();
            }
        } else if is_falsy {
            self.collapse_bool(&mut node.children[0], true);
            if node.children.len() > 2 {
                node.children.remove(1);
            } else {
                node.children[1].make_empty();
            }
            is_truthy = true;
        }

        *is_terminal = TERM_NONE;

        let mut then_term = TERM_NONE;
        self.visit_node(&mut node.children[1], &mut then_term)?;

        if node.children.len() > 2 {
            let mut else_term = TERM_NONE;
            self.visit_node(&mut node.children[2], &mut else_term)?;

            if then_term != TERM_NONE && else_term != TERM_NONE {
                *is_terminal = then_term | else_term;
            }
        } else if is_truthy {
            *is_terminal = then_term;
        }

        Ok(())
    }

    fn repeat_stmt(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        self.visit_node(&mut node.children[0], is_terminal)?;

        if *is_terminal != TERM_NONE && self.optimize_enabled() {
            // The body never reaches the condition.
            if node.children[1].token.kind.keyword() != Some(Keyword::False) {
                self.collapse_bool(&mut node.children[1], false);
            }
        } else {
            let mut t = TERM_NONE;
            self.visit_node(&mut node.children[1], &mut t)?;
        }

        if *is_terminal & TERM_BREAK != 0 {
            *is_terminal = TERM_NONE;
        }

        Ok(())
    }

    fn while_stmt(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        let mut t = TERM_NONE;

        let cond_empty = node.children[0].kind == NodeKind::Empty;
        if !cond_empty {
            self.visit_node(&mut node.children[0], &mut t)?;
        }

        let mut is_truthy = false;
        let mut is_falsy = false;
        if self.optimize_enabled() {
            is_truthy = cond_empty || self.is_truthy(&node.children[0]);
            is_falsy = !is_truthy && self.is_falsy(&node.children[0]);
        }

        // A loop that never runs loses its body.
        if is_falsy && node.children[1].kind != NodeKind::Empty {
            self.collapse_empty(&mut node.children[1]);
        }

        let mut body_term = TERM_NONE;
        self.visit_node(&mut node.children[1], &mut body_term)?;

        *is_terminal = if is_truthy && body_term != TERM_NONE && body_term & TERM_BREAK == 0 {
            body_term
        } else {
            TERM_NONE
        };

        // A body that always leaves the function turns the loop into a
        // single run of the body, or a plain if when the condition is
        // dynamic.
        if self.optimize_enabled()
            && body_term != TERM_NONE
            && body_term & TERM_BREAK == 0
            && node.kind == NodeKind::While
        {
            if is_truthy {
                self.promote(node, 1);
                self.mark();
            } else if !is_falsy {
                node.kind = NodeKind::If;
                self.mark();
            }
        }

        Ok(())
    }

    fn try_stmt(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        let node_kind = node.kind;

        self.push_scope(node);

        let result = (|| {
            let mut t1 = TERM_NONE;
            let mut t2 = TERM_NONE;
            let mut t3 = TERM_NONE;

            self.visit_node(&mut node.children[0], &mut t1)?;

            let mut finally_empty = true;

            if node_kind == NodeKind::TryCatch {
                let catch_node = &mut node.children[1];
                debug_assert_eq!(catch_node.kind, NodeKind::Catch);

                let var = catch_node.children[0].children[0]
                    .annot
                    .var_ref()
                    .expect("unresolved catch variable")
                    .var;

                debug_assert!(self.unit.vars[var].activation == VarActivation::Inactive);
                self.unit.vars[var].activation = VarActivation::Active;

                let body_result = self.visit_node(&mut catch_node.children[1], &mut t2);

                self.unit.vars[var].activation = VarActivation::Inactive;

                body_result?;
            } else {
                let finally_node = &mut node.children[1];
                finally_empty = finally_node.kind == NodeKind::Empty;
                self.visit_node(finally_node, &mut t3)?;
            }

            *is_terminal = TERM_NONE;

            if node_kind == NodeKind::TryCatch || finally_empty || t3 == TERM_NONE {
                if t1 != TERM_NONE && t2 != TERM_NONE {
                    *is_terminal = (t1 & !TERM_THROW) | t2;
                }
            } else {
                *is_terminal = t3;
            }

            Ok(())
        })();

        self.pop_scope();
        result
    }

    fn switch_stmt(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        let mut t = TERM_NONE;
        self.visit_node(&mut node.children[0], &mut t)?;

        let mut all = TERM_NONE;
        let mut num_cases = 0u32;
        let mut num_terminated = 0u32;
        let mut has_default = false;

        for case in &mut node.children[1..] {
            if case.kind == NodeKind::Default {
                has_default = true;
            }

            let mut case_term = TERM_NONE;
            self.visit_node(case, &mut case_term)?;

            if case_term & TERM_BREAK != 0 {
                case_term = TERM_NONE;
            }

            num_cases += 1;
            if case_term != TERM_NONE {
                num_terminated += 1;
                all |= case_term;
            }
        }

        *is_terminal = if num_cases == num_terminated && has_default {
            all
        } else {
            TERM_NONE
        };

        Ok(())
    }

    fn case_stmt(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        let mut t = TERM_NONE;
        self.visit_node(&mut node.children[0], &mut t)?;

        // A comma case holds only a value and a fallthrough marker.
        if node.children.len() < 2 {
            *is_terminal = TERM_NONE;
            return Ok(());
        }

        self.visit_node(&mut node.children[1], is_terminal)?;

        if *is_terminal != TERM_NONE && node.children.len() > 2 {
            // Dead fallthrough after terminating statements.
            node.children[2].make_empty();
        }

        Ok(())
    }

    fn for_in_stmt(&mut self, node: &mut AstNode) -> Result<()> {
        self.push_scope(node);

        self.unit.activate_new_vars(&node.children[0].children[0]);

        let result = (|| {
            for child in &mut node.children {
                let mut t = TERM_NONE;
                self.visit_node(child, &mut t)?;
            }
            Ok(())
        })();

        self.pop_scope();
        result
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn parameter_defaults(&mut self, params: &mut AstNode) -> Result<u32> {
        debug_assert_eq!(params.kind, NodeKind::Parameters);

        let mut num_def = 0u32;
        let mut num_def_used = 0u32;

        for arg in &mut params.children {
            match arg.kind {
                NodeKind::Assignment => {
                    let mut t = TERM_NONE;
                    self.visit_node(&mut arg.children[1], &mut t)?;

                    num_def += 1;
                    if let Some(var_ref) = arg.children[0].annot.var_ref() {
                        if self.unit.vars[var_ref.var].num_reads != 0 {
                            num_def_used = num_def;
                        }
                    }
                }
                NodeKind::Ellipsis => {
                    if let Some(var_ref) = arg.children[0].annot.var_ref() {
                        if self.unit.vars[var_ref.var].num_reads != 0 {
                            num_def_used = num_def;
                        }
                    }
                    break;
                }
                _ => (),
            }
        }

        Ok(num_def_used)
    }

    /// Each function body runs its own inner fixed point, so a stable
    /// function does not force whole-program re-iteration.
    fn function_literal(&mut self, fun_node: &mut AstNode, fun_var: Option<VarId>) -> Result<()> {
        let mut accumulated = self.unit.num_optimizations;
        let frame_scope = fun_node.annot.scope().expect("function without frame");

        loop {
            self.unit.num_optimizations = 0;

            self.push_scope(fun_node);

            if let Some(fun_var) = fun_var {
                let data = &mut self.unit.vars[fun_var];
                if data.activation == VarActivation::Inactive {
                    data.activation = VarActivation::Active;
                }
            }

            let mut t = TERM_NONE;
            let body_result = self.visit_node(&mut fun_node.children[3], &mut t);

            if let Some(fun_var) = fun_var {
                let data = &mut self.unit.vars[fun_var];
                if data.activation == VarActivation::Active {
                    data.activation = VarActivation::Inactive;
                }
            }

            self.pop_scope();
            body_result?;

            let num_def_used = self.parameter_defaults(&mut fun_node.children[1])?;

            accumulated += self.unit.num_optimizations;

            let frame = self.unit.scopes[frame_scope]
                .frame
                .as_mut()
                .expect("function without frame data");

            if num_def_used < frame.num_def_used {
                accumulated += 1;
            }
            frame.num_def_used = num_def_used;

            if self.unit.num_optimizations == 0 {
                break;
            }
        }

        self.unit.num_optimizations = accumulated;
        Ok(())
    }

    fn class_literal(&mut self, node: &mut AstNode, fun_var: Option<VarId>) -> Result<()> {
        debug_assert_eq!(node.kind, NodeKind::ClassLiteral);

        let mut t = TERM_NONE;
        self.visit_node(&mut node.children[0], &mut t)?;

        let (members, rest) = {
            let (_, tail) = node.children.split_at_mut(1);
            tail.split_at_mut(1)
        };

        for prop in &mut members[0].children {
            debug_assert_eq!(prop.kind, NodeKind::Property);

            let value = &mut prop.children[1];
            if value.kind == NodeKind::FunctionLiteral {
                self.function_literal(value, fun_var)?;
            } else {
                let mut t = TERM_NONE;
                self.visit_node(value, &mut t)?;
            }
        }

        let ctor = &mut rest[0];
        debug_assert_eq!(ctor.kind, NodeKind::ConstructorLiteral);
        self.function_literal(ctor, fun_var)
    }

    // ------------------------------------------------------------------
    // Identifiers, closures, assignments
    // ------------------------------------------------------------------

    /// A `const` function with no captures, no pending binds and no used
    /// default arguments can be called directly.
    fn is_const_fun(&self, var: VarId) -> bool {
        let data = &self.unit.vars[var];
        debug_assert!(data.is_const);

        let fun_node = match data.value.as_deref() {
            Some(n) => n,
            None => return false,
        };

        if fun_node.kind == NodeKind::ConstructorLiteral {
            return false;
        }

        let frame_scope = match fun_node.annot.scope() {
            Some(s) => s,
            None => return false,
        };
        let frame = match self.unit.scopes[frame_scope].frame.as_ref() {
            Some(f) => f,
            None => return false,
        };

        // Binding defaults or captured variables force a closure.
        if frame.num_def_used != 0 || frame.num_binds != 0 {
            return false;
        }

        // For self-referencing functions there must be no independent
        // variable references after the function reference.
        if frame.is_open && frame.num_binds_prev != 0 {
            return false;
        }

        true
    }

    fn check_self_ref_fun(&self, var: VarId) -> bool {
        let data = &self.unit.vars[var];

        if !data.is_const {
            return false;
        }

        let fun_node = match data.value.as_deref() {
            Some(n) => n,
            None => return false,
        };

        if !matches!(
            fun_node.kind,
            NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral
        ) {
            return false;
        }

        fun_node
            .annot
            .scope()
            .and_then(|s| self.unit.scopes[s].frame.as_ref())
            .map_or(false, |f| f.is_open)
    }

    /// Count a closure access in every frame between the current one and
    /// the frame owning the variable.
    fn mark_binds(&mut self, var: VarId) {
        if !self.unit.vars[var].kind.is_independent() {
            return;
        }

        let target_frame = {
            let scope = self.unit.vars[var].scope;
            self.unit.scopes[scope].owning_frame
        };
        let is_self_ref = self.check_self_ref_fun(var);

        let mut frame_scope = self.unit.cur_frame.expect("no current frame");
        debug_assert_ne!(frame_scope, target_frame);

        loop {
            let frame = self.unit.scopes[frame_scope]
                .frame
                .as_mut()
                .expect("bind walk hit a frame-less scope");

            if is_self_ref {
                frame.num_self_refs += 1;
            } else {
                frame.num_binds += 1;
            }

            frame_scope = frame.parent_frame.expect("bind walk escaped the tree");
            if frame_scope == target_frame {
                break;
            }
        }
    }

    fn identifier(&mut self, node: &mut AstNode) {
        let var_ref = node.annot.var_ref().expect("unresolved identifier");
        let var = var_ref.var;
        let mut is_local = var_ref.local;

        debug_assert!(self.unit.vars[var].activation != VarActivation::Inactive);

        if !is_local && self.unit.vars[var].is_const {
            let value = self.unit.vars[var].value.as_deref().map(shallow_clone);

            match value {
                Some(value)
                    if matches!(
                        value.kind,
                        NodeKind::NumericLiteral
                            | NodeKind::StringLiteral
                            | NodeKind::BoolLiteral
                            | NodeKind::VoidLiteral
                    ) =>
                {
                    // Propagate the constant in place of the closure
                    // access.
                    let pos = node.token.pos;
                    *node = value;
                    node.token.pos = pos;
                    self.mark();
                    return;
                }
                Some(value)
                    if matches!(
                        value.kind,
                        NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral
                    ) =>
                {
                    if self.is_const_fun(var) {
                        if !var_ref.const_fun {
                            node.annot = Annot::Var(VarRef {
                                const_fun: true,
                                ..var_ref
                            });
                            self.mark();
                        }
                        is_local = true;
                    }
                }
                _ => (),
            }
        }

        self.unit.vars[var].num_reads += 1;

        if is_local {
            self.unit.vars[var].local_reads += 1;
        } else {
            self.mark_binds(var);
        }
    }

    fn assignment(&mut self, node: &mut AstNode) -> Result<()> {
        let assg_kind = node.kind;
        let assg_op = node.token.kind.op();
        let is_lhs = node.children[0].kind == NodeKind::LeftHandSide;

        debug_assert!(matches!(
            node.children[0].kind,
            NodeKind::LeftHandSide | NodeKind::Var | NodeKind::Const
        ));

        if assg_kind == NodeKind::Assignment && is_self_ref_func(node) {
            let fun_var = node.children[0].children[0]
                .annot
                .var_ref()
                .map(|r| r.var);

            let value = &mut node.children[1];
            if value.kind == NodeKind::FunctionLiteral {
                self.function_literal(value, fun_var)?;
            } else {
                debug_assert_eq!(value.kind, NodeKind::ClassLiteral);
                self.class_literal(value, fun_var)?;
            }
        } else {
            let mut t = TERM_NONE;
            self.visit_node(&mut node.children[1], &mut t)?;
        }

        let rhs_value = match node.children[1].kind {
            NodeKind::NumericLiteral
            | NodeKind::StringLiteral
            | NodeKind::BoolLiteral
            | NodeKind::VoidLiteral
            | NodeKind::InterpolatedString
            | NodeKind::ArrayLiteral
            | NodeKind::ObjectLiteral
            | NodeKind::FunctionLiteral
            | NodeKind::ConstructorLiteral
            | NodeKind::ClassLiteral => Some(Box::new(shallow_clone(&node.children[1]))),
            _ => None,
        };

        let mut num_used = 0u32;

        let num_targets = node.children[0].children.len();
        for i in 0..num_targets {
            let target_kind = node.children[0].children[i].kind;

            if target_kind == NodeKind::Identifier {
                let var_ref = node.children[0].children[i]
                    .annot
                    .var_ref()
                    .expect("unresolved assignment target");
                let var = var_ref.var;

                if !is_lhs {
                    // Declaration: the variable becomes visible here.
                    if self.unit.vars[var].activation == VarActivation::Inactive {
                        self.unit.vars[var].activation = VarActivation::Active;
                    }

                    if assg_kind == NodeKind::Assignment {
                        self.unit.vars[var].value = rhs_value.clone();
                    }
                }

                // Dead store: the previous pass saw no reads.
                if self.unit.vars[var].num_reads_prev == 0
                    && self.unit.vars[var].kind != VarKind::Global
                {
                    self.collapse_void(&mut node.children[0].children[i]);
                } else {
                    num_used += 1;

                    if is_lhs {
                        debug_assert!(!self.unit.vars[var].is_const);
                        self.unit.vars[var].num_assignments += 1;
                        if assg_op != Some(Op::Set) {
                            self.unit.vars[var].num_reads += 1;
                        }

                        if var_ref.local {
                            self.unit.vars[var].local_assignments += 1;
                            if assg_op != Some(Op::Set) {
                                self.unit.vars[var].local_reads += 1;
                            }
                        } else {
                            self.mark_binds(var);
                        }
                    }
                }
            } else if target_kind != NodeKind::VoidLiteral {
                num_used += 1;
                let mut t = TERM_NONE;
                self.visit_node(&mut node.children[0].children[i], &mut t)?;
            }
        }

        // No target needs the value: evaluate the right side for its
        // effects only.
        if num_used == 0 {
            self.promote(node, 1);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn numeric_pair(&self, a: &AstNode, b: &AstNode) -> Option<(Numeric, Numeric)> {
        Some((self.numeric_of(a)?, self.numeric_of(b)?))
    }

    /// Truncate a float to integer for a bitwise operand, mimicking the
    /// virtual machine.
    fn to_integer(&self, node: &AstNode, value: Numeric) -> Result<i64> {
        match value {
            Numeric::Integer(v) => Ok(v),
            Numeric::Float(v) => match v.floor().to_i64() {
                Some(v) => Ok(v),
                None => Err(Error::compile(ERR_NUMBER_OUT_OF_RANGE, node.pos())),
            },
        }
    }

    fn fold_binary_op(
        &mut self,
        node: &mut AstNode,
        op: Op,
        ca: &AstNode,
        cb: &AstNode,
    ) -> Result<()> {
        let (a, b) = match self.numeric_pair(ca, cb) {
            Some(pair) => pair,
            None => return Ok(()),
        };

        let result = if matches!(op, Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod) {
            // Arithmetic converts both operands to float if either is
            // one, mimicking the VM.
            match (a, b) {
                (Numeric::Integer(ia), Numeric::Integer(ib)) => {
                    let v = match op {
                        Op::Add => ia.wrapping_add(ib),
                        Op::Sub => ia.wrapping_sub(ib),
                        Op::Mul => ia.wrapping_mul(ib),
                        Op::Div | Op::Mod => {
                            if ib == 0 {
                                return Err(Error::compile(ERR_DIV_BY_ZERO, node.pos()));
                            }
                            if op == Op::Div {
                                ia.wrapping_div(ib)
                            } else {
                                ia.wrapping_rem(ib)
                            }
                        }
                        _ => unreachable!(),
                    };
                    Numeric::Integer(v)
                }
                (a, b) => {
                    let fa = match a {
                        Numeric::Integer(v) => v as f64,
                        Numeric::Float(v) => v,
                    };
                    let fb = match b {
                        Numeric::Integer(v) => v as f64,
                        Numeric::Float(v) => v,
                    };
                    let v = match op {
                        Op::Add => fa + fb,
                        Op::Sub => fa - fb,
                        Op::Mul => fa * fb,
                        Op::Div | Op::Mod => {
                            if fb == 0.0 {
                                return Err(Error::compile(ERR_DIV_BY_ZERO, node.pos()));
                            }
                            if op == Op::Div {
                                fa / fb
                            } else {
                                fa % fb
                            }
                        }
                        _ => unreachable!(),
                    };
                    Numeric::Float(v)
                }
            }
        } else {
            // Bitwise and shifts truncate floats to integers first.
            let ia = self.to_integer(ca, a)?;
            let ib = self.to_integer(cb, b)?;

            let v = match op {
                Op::And => ia & ib,
                Op::Or => ia | ib,
                Op::Xor => ia ^ ib,
                Op::Shl => {
                    if !(-62..=63).contains(&ib) {
                        if ia < 0 && ib < 0 {
                            -1
                        } else {
                            0
                        }
                    } else if ib < 0 {
                        ia >> -ib
                    } else {
                        ((ia as u64) << ib) as i64
                    }
                }
                Op::Shr => {
                    if !(-63..=62).contains(&ib) {
                        if ia < 0 && ib > 0 {
                            -1
                        } else {
                            0
                        }
                    } else if ib < 0 {
                        ((ia as u64) << -ib) as i64
                    } else {
                        ia >> ib
                    }
                }
                Op::Shru => {
                    if !(-63..=63).contains(&ib) {
                        0
                    } else if ib < 0 {
                        ((ia as u64) << -ib) as i64
                    } else {
                        ((ia as u64) >> ib) as i64
                    }
                }
                _ => unreachable!(),
            };
            Numeric::Integer(v)
        };

        self.collapse_numeric(node, result);
        Ok(())
    }

    fn fold_unary_op(&mut self, node: &mut AstNode, op: Op, ca: &AstNode) -> Result<()> {
        let a = match self.numeric_of(ca) {
            Some(v) => v,
            None => return Ok(()),
        };

        let result = match op {
            Op::Add => a,
            Op::Sub => match a {
                Numeric::Integer(v) => Numeric::Integer(v.wrapping_neg()),
                Numeric::Float(v) => Numeric::Float(-v),
            },
            Op::Not => Numeric::Integer(!self.to_integer(ca, a)?),
            _ => return Ok(()),
        };

        self.collapse_numeric(node, result);
        Ok(())
    }

    /// Concatenate two string literals with matching raw/cooked flags.
    fn fold_add_strings(&mut self, node: &mut AstNode, ca: &AstNode, cb: &AstNode) -> Result<()> {
        let (a_text, a_escape) = ca.string_value(self.source());
        let (b_text, b_escape) = cb.string_value(self.source());
        debug_assert_eq!(a_escape, b_escape);

        if a_text.len() + b_text.len() > 0xFFFF {
            return Err(Error::compile(ERR_SUM_OF_STRINGS_TOO_LONG, node.pos()));
        }

        let mut text = String::with_capacity(a_text.len() + b_text.len());
        text.push_str(a_text);
        text.push_str(b_text);

        let pos = ca.token.pos;
        self.collapse_string(node, text, a_escape);
        node.token.pos = pos;

        Ok(())
    }

    fn fold_typeof(&mut self, node: &mut AstNode, ca: &AstNode) {
        let type_name = match ca.kind {
            NodeKind::NumericLiteral => match ca.numeric_value(self.source()) {
                Ok(v) => v.type_name(),
                Err(_) => return,
            },
            NodeKind::StringLiteral | NodeKind::InterpolatedString => "string",
            NodeKind::BoolLiteral => "boolean",
            NodeKind::VoidLiteral => "void",
            _ => return,
        };

        self.collapse_string(node, type_name.into(), StringEscape::Cooked);
    }

    fn operator_token(&mut self, node: &mut AstNode) -> Result<()> {
        for child in &mut node.children {
            let mut t = TERM_NONE;
            self.visit_node(child, &mut t)?;
        }

        if !self.optimize_enabled() {
            return Ok(());
        }

        let ca = node.children.first().and_then(|a| self.get_const(a));
        let cb = node.children.get(1).and_then(|b| self.get_const(b));

        let a_str = ca.as_ref().map_or(false, |n| n.kind == NodeKind::StringLiteral);
        let b_str = cb.as_ref().map_or(false, |n| n.kind == NodeKind::StringLiteral);
        let a_num = ca.as_ref().map_or(false, |n| n.kind == NodeKind::NumericLiteral);
        let b_num = cb.as_ref().map_or(false, |n| n.kind == NodeKind::NumericLiteral);

        match node.token.kind.op() {
            Some(op @ (Op::Add | Op::Sub)) => {
                if node.children.len() > 1 {
                    if a_num && b_num {
                        let (ca, cb) = (ca.unwrap(), cb.unwrap());
                        self.fold_binary_op(node, op, &ca, &cb)?;
                    } else if op == Op::Add && a_str && b_str {
                        let (ca, cb) = (ca.unwrap(), cb.unwrap());
                        let (_, a_escape) = ca.string_value(self.source());
                        let (_, b_escape) = cb.string_value(self.source());
                        if a_escape == b_escape {
                            self.fold_add_strings(node, &ca, &cb)?;
                        }
                    }
                } else if a_num {
                    let ca = ca.unwrap();
                    self.fold_unary_op(node, op, &ca)?;
                }
            }

            Some(
                op @ (Op::Mul
                | Op::Div
                | Op::Mod
                | Op::And
                | Op::Or
                | Op::Xor
                | Op::Shl
                | Op::Shr
                | Op::Shru),
            ) => {
                if a_num && b_num {
                    let (ca, cb) = (ca.unwrap(), cb.unwrap());
                    self.fold_binary_op(node, op, &ca, &cb)?;
                }
            }

            Some(Op::Not) => {
                if a_num {
                    let ca = ca.unwrap();
                    self.fold_unary_op(node, Op::Not, &ca)?;
                }
            }

            Some(Op::LogNot) => {
                if let Some(ca) = ca {
                    if self.is_truthy(&ca)
                        && node.children[0].token.kind.keyword() != Some(Keyword::False)
                    {
                        self.collapse_bool(node, false);
                    } else if self.is_falsy(&ca)
                        && node.children[0].token.kind.keyword() != Some(Keyword::True)
                    {
                        self.collapse_bool(node, true);
                    }
                }
            }

            Some(Op::LogAnd) => {
                if let Some(ca) = ca {
                    if self.is_truthy(&ca) && node.children.len() > 1 {
                        self.promote(node, 1);
                        self.mark();
                    } else if self.is_falsy(&ca) {
                        self.promote(node, 0);
                        self.mark();
                    }
                }
            }

            Some(Op::LogOr) => {
                if let Some(ca) = ca {
                    if self.is_truthy(&ca) {
                        self.promote(node, 0);
                        self.mark();
                    } else if self.is_falsy(&ca) && node.children.len() > 1 {
                        self.promote(node, 1);
                        self.mark();
                    }
                }
            }

            Some(Op::LogTri) => {
                if let Some(ca) = ca {
                    if self.is_truthy(&ca) {
                        self.promote(node, 1);
                        self.mark();
                    } else if self.is_falsy(&ca) && node.children.len() > 2 {
                        self.promote(node, 2);
                        self.mark();
                    }
                }
            }

            None => {
                if node.token.kind.keyword() == Some(Keyword::Typeof) {
                    if let Some(ca) = ca {
                        self.fold_typeof(node, &ca);
                    }
                }
            }

            _ => (),
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Interpolated strings
    // ------------------------------------------------------------------

    fn interpolated_string(&mut self, node: &mut AstNode) -> Result<()> {
        let mut t = TERM_NONE;
        self.visit_node(&mut node.children[0], &mut t)?;

        // Concatenate adjacent constant string parts with matching
        // flags; folded numeric parts are left for the runtime to
        // stringify.
        let mut i = 0usize;
        while i + 1 < node.children.len() {
            self.visit_node(&mut node.children[i + 1], &mut t)?;

            let ca = self.get_const(&node.children[i]);
            let cb = self.get_const(&node.children[i + 1]);

            let both_strings = matches!(
                (&ca, &cb),
                (Some(a), Some(b))
                    if a.kind == NodeKind::StringLiteral && b.kind == NodeKind::StringLiteral
            );

            if both_strings {
                let (ca, cb) = (ca.unwrap(), cb.unwrap());
                let (_, a_escape) = ca.string_value(self.source());
                let (_, b_escape) = cb.string_value(self.source());

                if a_escape == b_escape {
                    self.fold_add_strings(&mut node.children[i], &ca, &cb)?;
                    node.children.remove(i + 1);
                    continue;
                }
            }

            i += 1;
        }

        // Drop empty string parts, keeping at least one child.
        let source = self.source();
        let pos = node.token.pos;
        let mut parts = Vec::with_capacity(node.children.len());
        for child in node.children.drain(..) {
            let empty = child.kind == NodeKind::StringLiteral
                && child.string_value(source).0.is_empty();
            if !empty {
                parts.push(child);
            }
        }
        if parts.is_empty() {
            parts.push(AstNode::new(
                NodeKind::StringLiteral,
                Token::synthetic(TokenKind::String(StringEscape::Cooked), "", pos),
            ));
        }
        node.children = parts;

        if node.children.len() == 1 && node.children[0].kind == NodeKind::StringLiteral {
            self.promote(node, 0);
        }

        Ok(())
    }

    fn line_literal(&mut self, node: &mut AstNode) {
        let line = i64::from(node.token.pos.line);
        self.collapse_numeric(node, Numeric::Integer(line));
    }

    fn super_proto_literal(&mut self) {
        let frame_scope = self.unit.cur_frame.expect("no current frame");
        if let Some(frame) = self.unit.scopes[frame_scope].frame.as_mut() {
            frame.uses_base_proto = true;
            frame.num_binds += 1;
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn visit_child_nodes(&mut self, node: &mut AstNode) -> Result<()> {
        for child in &mut node.children {
            let mut t = TERM_NONE;
            self.visit_node(child, &mut t)?;
        }
        Ok(())
    }

    fn visit_node(&mut self, node: &mut AstNode, is_terminal: &mut u8) -> Result<()> {
        *is_terminal = TERM_NONE;

        match node.kind {
            NodeKind::Return => {
                self.visit_child_nodes(node)?;
                *is_terminal = TERM_RETURN;
                Ok(())
            }
            NodeKind::Throw => {
                self.visit_child_nodes(node)?;
                *is_terminal = TERM_THROW;
                Ok(())
            }
            NodeKind::Break | NodeKind::Continue => {
                *is_terminal = TERM_BREAK;
                Ok(())
            }

            NodeKind::Scope => self.process_scope(node, is_terminal),
            NodeKind::If => self.if_stmt(node, is_terminal),
            NodeKind::Repeat => self.repeat_stmt(node, is_terminal),
            NodeKind::While => self.while_stmt(node, is_terminal),
            NodeKind::ForIn => self.for_in_stmt(node),
            NodeKind::TryCatch | NodeKind::TryDefer => self.try_stmt(node, is_terminal),
            NodeKind::Switch => self.switch_stmt(node, is_terminal),
            NodeKind::Case | NodeKind::Default => self.case_stmt(node, is_terminal),

            NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral => {
                self.function_literal(node, None)
            }
            NodeKind::ClassLiteral => self.class_literal(node, None),

            NodeKind::Identifier => {
                self.identifier(node);
                Ok(())
            }

            NodeKind::Assignment | NodeKind::MultiAssignment => self.assignment(node),

            NodeKind::Operator => self.operator_token(node),

            NodeKind::InterpolatedString => self.interpolated_string(node),

            NodeKind::LineLiteral => {
                self.line_literal(node);
                Ok(())
            }

            NodeKind::SuperProtoLiteral => {
                self.super_proto_literal();
                Ok(())
            }

            NodeKind::Empty
            | NodeKind::Fallthrough
            | NodeKind::Landmark
            | NodeKind::NumericLiteral
            | NodeKind::StringLiteral
            | NodeKind::ThisLiteral
            | NodeKind::SuperCtorLiteral
            | NodeKind::BoolLiteral
            | NodeKind::VoidLiteral
            | NodeKind::Placeholder
            | NodeKind::Parameters
            | NodeKind::Import
            | NodeKind::Name
            | NodeKind::NameConst => Ok(()),

            _ => self.visit_child_nodes(node),
        }
    }
}

/// A reference to a constant or a variable whose value is unused at
/// statement position.
fn is_dummy_load(node: &AstNode) -> bool {
    matches!(
        node.kind,
        NodeKind::Identifier
            | NodeKind::NumericLiteral
            | NodeKind::StringLiteral
            | NodeKind::ThisLiteral
            | NodeKind::SuperCtorLiteral
            | NodeKind::SuperProtoLiteral
            | NodeKind::LineLiteral
            | NodeKind::BoolLiteral
            | NodeKind::VoidLiteral
            | NodeKind::FunctionLiteral
            | NodeKind::ConstructorLiteral
            | NodeKind::ClassLiteral
    )
}

/// A copy of a node without its children; enough for constant queries.
fn shallow_clone(node: &AstNode) -> AstNode {
    AstNode {
        kind: node.kind,
        token: node.token.clone(),
        children: Vec::new(),
        annot: node.annot,
        value: node.value,
    }
}

// ----------------------------------------------------------------------
// Argument allocation
// ----------------------------------------------------------------------

/// Classify function parameters into register and array slots, and count
/// the variables each closure exports. Runs once after the optimizer
/// reaches its fixed point.
pub fn allocate_args(unit: &mut CompileUnit<'_>, ast: &mut AstNode) -> Result<()> {
    debug_assert_eq!(ast.kind, NodeKind::Scope);

    let mut pass = ArgAllocator { unit };
    pass.visit_node(ast)
}

struct ArgAllocator<'r, 's> {
    unit: &'r mut CompileUnit<'s>,
}

impl ArgAllocator<'_, '_> {
    fn push_scope(&mut self, node: &AstNode) -> ScopeId {
        let id = node.annot.scope().expect("scope node lost its scope");
        self.unit.scope_stack.push(id);
        if self.unit.scopes[id].has_frame() {
            self.unit.cur_frame = Some(id);
        }
        id
    }

    fn pop_scope(&mut self) {
        let id = self.unit.scope_stack.pop().expect("scope stack is empty");
        if self.unit.scopes[id].has_frame() {
            self.unit.cur_frame = self.unit.scopes[id]
                .frame
                .as_ref()
                .and_then(|f| f.parent_frame);
        }
    }

    /// Count an exported variable on the scope-ref record of every frame
    /// between the current one and the frame owning the variable.
    fn update_scope_ref(&mut self, var: VarId) {
        let kind = self.unit.vars[var].kind;
        let closure = {
            let scope = self.unit.vars[var].scope;
            self.unit.scopes[scope].owning_frame
        };

        for i in (0..self.unit.scope_stack.len()).rev() {
            let scope = self.unit.scope_stack[i];
            if scope == closure {
                break;
            }
            if !self.unit.scopes[scope].is_function {
                continue;
            }

            let frame = self.unit.scopes[scope]
                .frame
                .as_mut()
                .expect("function scope without frame");
            let scope_ref = frame
                .scope_refs
                .get_mut(&closure)
                .expect("capture without scope ref");

            if kind == VarKind::IndependentArgument {
                scope_ref.exported_args += 1;
            } else {
                debug_assert!(matches!(
                    kind,
                    VarKind::IndependentLocal | VarKind::IndependentArgInReg
                ));
                scope_ref.exported_locals += 1;
            }
        }
    }

    fn identifier(&mut self, node: &AstNode) {
        let var_ref = node.annot.var_ref().expect("unresolved identifier");
        if !var_ref.local && !var_ref.const_fun {
            self.update_scope_ref(var_ref.var);
        }
    }

    /// Decide which parameters live in registers and which move to the
    /// packed rest array.
    fn update_arguments(&mut self, params: &AstNode) {
        debug_assert_eq!(params.kind, NodeKind::Parameters);

        let scope_id = *self.unit.scope_stack.last().expect("no function scope");

        let mut num_non_def = 0u32;
        let mut num_def = 0u32;
        let mut have_ellipsis = false;
        let mut max_used: i64 = -1;

        for (i, arg) in params.children.iter().enumerate() {
            let ident = match arg.kind {
                NodeKind::Identifier | NodeKind::Placeholder => {
                    num_non_def += 1;
                    arg
                }
                NodeKind::Assignment => {
                    num_def += 1;
                    &arg.children[0]
                }
                _ => {
                    debug_assert_eq!(arg.kind, NodeKind::Ellipsis);
                    &arg.children[0]
                }
            };

            let var = match ident.annot.var_ref() {
                Some(r) => r.var,
                None => continue,
            };
            let data = &self.unit.vars[var];

            if data.num_reads != 0 || data.num_assignments != 0 {
                if arg.kind == NodeKind::Ellipsis {
                    have_ellipsis = true;
                } else {
                    max_used = i as i64;
                }
            }
        }

        let num_args = if have_ellipsis {
            num_non_def + num_def
        } else {
            (max_used + 1) as u32
        };
        let have_rest = num_args > MAX_ARGS_IN_REGS;
        let mut max_indep_arg: i64 = -1;

        for (i, arg) in params.children.iter().enumerate() {
            if arg.kind == NodeKind::Ellipsis {
                break;
            }

            let ident = match arg.kind {
                NodeKind::Identifier | NodeKind::Placeholder => arg,
                _ => &arg.children[0],
            };
            let var = match ident.annot.var_ref() {
                Some(r) => r.var,
                None => continue,
            };

            if !have_rest || (i as u32) < MAX_ARGS_IN_REGS - 1 {
                let data = &mut self.unit.vars[var];
                if data.kind == VarKind::IndependentArgument {
                    data.kind = VarKind::IndependentArgInReg;
                    max_indep_arg = i as i64;
                } else if data.kind == VarKind::Argument {
                    data.kind = VarKind::ArgumentInReg;
                }
            } else {
                // Surplus arguments live in the rest array.
                self.unit.vars[var].array_idx -= MAX_ARGS_IN_REGS - 1;
            }
        }

        let scope = &mut self.unit.scopes[scope_id];
        scope.num_args = num_args;
        scope.num_indep_args = (max_indep_arg + 1) as u32;
        scope.have_rest = have_rest;
        if !have_ellipsis {
            scope.ellipsis = None;
        }
    }

    fn function_literal(&mut self, node: &mut AstNode, fun_var: Option<VarId>) -> Result<()> {
        self.push_scope(node);

        let result = (|| {
            self.update_arguments(&node.children[1]);

            if let Some(fun_var) = fun_var {
                let data = &mut self.unit.vars[fun_var];
                if data.activation == VarActivation::Inactive {
                    data.activation = VarActivation::Active;
                }
            }

            let body_result = self.visit_node(&mut node.children[3]);

            if let Some(fun_var) = fun_var {
                let data = &mut self.unit.vars[fun_var];
                if data.activation == VarActivation::Active {
                    data.activation = VarActivation::Inactive;
                }
            }

            body_result?;

            // Defaults resolve outside the function scope.
            for arg in &mut node.children[1].children {
                if arg.kind == NodeKind::Assignment {
                    self.visit_node(&mut arg.children[1])?;
                }
            }

            Ok(())
        })();

        self.pop_scope();
        result
    }

    fn class_literal(&mut self, node: &mut AstNode, fun_var: Option<VarId>) -> Result<()> {
        self.visit_node(&mut node.children[0])?;

        let (members, rest) = {
            let (_, tail) = node.children.split_at_mut(1);
            tail.split_at_mut(1)
        };

        for prop in &mut members[0].children {
            let value = &mut prop.children[1];
            if value.kind == NodeKind::FunctionLiteral {
                self.function_literal(value, fun_var)?;
            } else {
                self.visit_node(value)?;
            }
        }

        self.function_literal(&mut rest[0], fun_var)
    }

    fn assignment(&mut self, node: &mut AstNode) -> Result<()> {
        let is_lhs = node.children[0].kind == NodeKind::LeftHandSide;

        if node.kind == NodeKind::Assignment && is_self_ref_func(node) {
            let fun_var = node.children[0].children[0]
                .annot
                .var_ref()
                .map(|r| r.var);

            let value = &mut node.children[1];
            if value.kind == NodeKind::FunctionLiteral {
                self.function_literal(value, fun_var)?;
            } else {
                self.class_literal(value, fun_var)?;
            }
        } else {
            self.visit_node(&mut node.children[1])?;
        }

        let num_targets = node.children[0].children.len();
        for i in 0..num_targets {
            let target = &node.children[0].children[i];

            if target.kind == NodeKind::Identifier {
                let var_ref = target.annot.var_ref().expect("unresolved target");

                if !var_ref.local && !var_ref.const_fun {
                    self.update_scope_ref(var_ref.var);
                }

                if !is_lhs {
                    let data = &mut self.unit.vars[var_ref.var];
                    if data.activation == VarActivation::Inactive {
                        data.activation = VarActivation::Active;
                    }
                }
            } else {
                self.visit_node(&mut node.children[0].children[i])?;
            }
        }

        Ok(())
    }

    fn try_stmt(&mut self, node: &mut AstNode) -> Result<()> {
        let node_kind = node.kind;

        self.push_scope(node);

        let result = (|| {
            self.visit_node(&mut node.children[0])?;

            if node_kind == NodeKind::TryCatch {
                let catch_node = &mut node.children[1];

                let var = catch_node.children[0].children[0]
                    .annot
                    .var_ref()
                    .expect("unresolved catch variable")
                    .var;

                self.unit.vars[var].activation = VarActivation::Active;
                let body_result = self.visit_node(&mut catch_node.children[1]);
                self.unit.vars[var].activation = VarActivation::Inactive;
                body_result
            } else {
                self.visit_node(&mut node.children[1])
            }
        })();

        self.pop_scope();
        result
    }

    fn for_in_stmt(&mut self, node: &mut AstNode) -> Result<()> {
        self.push_scope(node);

        self.unit.activate_new_vars(&node.children[0].children[0]);

        let result = (|| {
            for child in &mut node.children {
                self.visit_node(child)?;
            }
            Ok(())
        })();

        self.pop_scope();
        result
    }

    fn visit_child_nodes(&mut self, node: &mut AstNode) -> Result<()> {
        for child in &mut node.children {
            self.visit_node(child)?;
        }
        Ok(())
    }

    fn visit_node(&mut self, node: &mut AstNode) -> Result<()> {
        match node.kind {
            NodeKind::Scope => {
                self.push_scope(node);
                let result = self.visit_child_nodes(node);
                self.pop_scope();
                result
            }

            NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral => {
                self.function_literal(node, None)
            }
            NodeKind::ClassLiteral => self.class_literal(node, None),

            NodeKind::Identifier => {
                self.identifier(node);
                Ok(())
            }

            NodeKind::Assignment | NodeKind::MultiAssignment => self.assignment(node),

            NodeKind::TryCatch | NodeKind::TryDefer => self.try_stmt(node),

            NodeKind::ForIn => self.for_in_stmt(node),

            NodeKind::Empty
            | NodeKind::Fallthrough
            | NodeKind::Landmark
            | NodeKind::NumericLiteral
            | NodeKind::StringLiteral
            | NodeKind::ThisLiteral
            | NodeKind::SuperCtorLiteral
            | NodeKind::SuperProtoLiteral
            | NodeKind::LineLiteral
            | NodeKind::BoolLiteral
            | NodeKind::VoidLiteral
            | NodeKind::Placeholder
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::Parameters
            | NodeKind::Ellipsis
            | NodeKind::Import
            | NodeKind::Name
            | NodeKind::NameConst => Ok(()),

            _ => self.visit_child_nodes(node),
        }
    }
}
