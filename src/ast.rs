//! Module defining the AST produced by the parser and annotated in place
//! by the resolver and the optimizer.

use crate::scope::{ScopeId, VarId};
use crate::token::{Numeric, Position, StringEscape, Token};

/// Node classification.
///
/// Structural markers such as [`Parameters`][NodeKind::Parameters],
/// [`Name`][NodeKind::Name] and [`Landmark`][NodeKind::Landmark] carry no
/// semantics of their own; they exist to hold child lists or source
/// positions for diagnostics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum NodeKind {
    Empty,
    Import,
    /// Compound statement.
    Scope,
    If,
    TryCatch,
    TryDefer,
    Switch,
    Repeat,
    While,
    ForIn,
    Continue,
    Break,
    Return,
    Throw,
    Assert,

    Refinement,
    /// Optional refinement `a?.b`.
    OptRefinement,
    Slice,
    Invocation,
    Async,
    Var,
    Const,
    Export,
    Operator,
    Yield,
    /// Single variable assignment.
    Assignment,
    /// Multiple variable assignment.
    MultiAssignment,
    InterpolatedString,

    /// First child of an assignment: the list of targets.
    LeftHandSide,
    /// Function name, not referred to inside the function.
    Name,
    /// Function name, usable inside the function.
    NameConst,
    /// Declaration of a function's argument list.
    Parameters,
    /// Last, unbounded function argument.
    Ellipsis,
    /// Expanded argument, array element or invocation argument.
    Expand,
    /// Property definition in an object literal or named argument.
    Property,
    /// Named arguments in an invocation.
    NamedArguments,
    /// The `in` part of a for-in loop.
    In,
    /// Catch clause in a try statement.
    Catch,
    /// Default section in a switch statement.
    Default,
    /// A specific case section in a switch statement.
    Case,
    /// Fallthrough statement at the end of a case section.
    Fallthrough,
    /// Auxiliary node to save the location of other tokens, e.g. `{`.
    Landmark,

    Placeholder,
    Identifier,
    NumericLiteral,
    StringLiteral,
    ThisLiteral,
    SuperCtorLiteral,
    SuperProtoLiteral,
    LineLiteral,
    BoolLiteral,
    VoidLiteral,
    FunctionLiteral,
    ConstructorLiteral,
    ClassLiteral,
    ArrayLiteral,
    ObjectLiteral,
}

impl NodeKind {
    /// Nodes that introduce a lexical scope during variable resolution.
    /// `Continue`, `Break` and `Fallthrough` get an empty scope purely to
    /// participate in catch-offset threading.
    #[must_use]
    pub const fn introduces_scope(self) -> bool {
        matches!(
            self,
            Self::Scope
                | Self::TryCatch
                | Self::TryDefer
                | Self::ForIn
                | Self::Continue
                | Self::Break
                | Self::Fallthrough
        )
    }

    /// Nodes whose scope owns a function frame.
    #[must_use]
    pub const fn introduces_frame(self) -> bool {
        matches!(self, Self::FunctionLiteral | Self::ConstructorLiteral)
    }
}

/// Reference from an `Identifier` node to the variable it was bound to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VarRef {
    pub var: VarId,
    /// The variable needs no closure box when accessed from this node:
    /// it lives in the current frame or behind a global/module slot.
    pub local: bool,
    /// The variable is a `const` function usable for direct calls.
    pub const_fun: bool,
}

/// Annotation overlay attached to a node by the later passes.
///
/// Exactly one interpretation is valid at a time.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Annot {
    #[default]
    None,
    /// Set on identifiers after resolution.
    Var(VarRef),
    /// Set on scope-introducing nodes after resolution.
    Scope(ScopeId),
}

impl Annot {
    #[must_use]
    pub const fn var_ref(&self) -> Option<VarRef> {
        match self {
            Self::Var(r) => Some(*r),
            _ => None,
        }
    }

    #[must_use]
    pub const fn scope(&self) -> Option<ScopeId> {
        match self {
            Self::Scope(s) => Some(*s),
            _ => None,
        }
    }
}

/// A single AST node.
///
/// All nodes have the same shape; `kind` selects the interpretation of
/// `children`. Nodes live until the end of compilation and are mutated in
/// place by the resolver and the optimizer.
///
/// `value` holds a numeric value computed by the constant folder,
/// overriding the token text of a `NumericLiteral` node.
#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    pub kind: NodeKind,
    pub token: Token,
    pub children: Vec<AstNode>,
    pub annot: Annot,
    pub value: Option<Numeric>,
}

impl AstNode {
    #[must_use]
    pub fn new(kind: NodeKind, token: Token) -> Self {
        Self {
            kind,
            token,
            children: Vec::new(),
            annot: Annot::None,
            value: None,
        }
    }

    #[must_use]
    pub const fn pos(&self) -> Position {
        self.token.pos
    }

    pub fn push(&mut self, child: AstNode) {
        self.children.push(child);
    }

    /// The node's first child, if any.
    #[must_use]
    pub fn first_child(&self) -> Option<&AstNode> {
        self.children.first()
    }

    /// Is this node a literal whose value is known at compile time?
    #[must_use]
    pub const fn is_constant(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::NumericLiteral
                | NodeKind::StringLiteral
                | NodeKind::BoolLiteral
                | NodeKind::VoidLiteral
        )
    }

    /// Replace this node with another, keeping nothing of the original.
    pub fn replace(&mut self, with: AstNode) {
        *self = with;
    }

    /// Turn this node into an empty statement in place.
    pub fn make_empty(&mut self) {
        self.kind = NodeKind::Empty;
        self.children.clear();
        self.annot = Annot::None;
        self.value = None;
    }

    /// The numeric value of a `NumericLiteral` node: the folded value if
    /// the optimizer stored one, otherwise parsed from the token text.
    pub fn numeric_value(&self, source: &str) -> std::result::Result<Numeric, &'static str> {
        if let Some(value) = self.value {
            return Ok(value);
        }
        crate::token::parse_numeric(self.token.text(source))
    }

    /// The content of a string-literal node, without delimiters, plus its
    /// escape flag. Escape sequences are not processed here; the constant
    /// pool stores the raw bytes together with the flag.
    ///
    /// The node's token is either a real string token (delimiters are
    /// stripped), an identifier/keyword used as a property or import name
    /// (taken verbatim), or a synthesized token (taken verbatim).
    #[must_use]
    pub fn string_value<'a>(&'a self, source: &'a str) -> (&'a str, StringEscape) {
        let tok = &self.token;
        if tok.text_override().is_some() {
            let escape = match tok.kind {
                crate::token::TokenKind::String(esc) => esc,
                _ => StringEscape::Raw,
            };
            return (tok.text(source), escape);
        }
        match tok.kind {
            crate::token::TokenKind::String(StringEscape::Raw) => {
                let text = tok.text(source);
                // r"..."
                (&text[2..text.len() - 1], StringEscape::Raw)
            }
            crate::token::TokenKind::String(StringEscape::Cooked)
            | crate::token::TokenKind::StringOpen => {
                let text = tok.text(source);
                // Leading '"' or the ')' continuing an interpolation;
                // trailing '"' or the '\(' opening one.
                let tail = if text.ends_with("\\(") { 2 } else { 1 };
                (&text[1..text.len() - tail], StringEscape::Cooked)
            }
            _ => (tok.text(source), StringEscape::Raw),
        }
    }
}
