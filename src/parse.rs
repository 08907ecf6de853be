//! Module implementing the recursive-descent parser.
//!
//! The parser owns the lexer, keeps one token of pushback, and tracks the
//! expression nesting depth against a fixed bound. A handful of
//! constructs are desugared while parsing: `with` becomes
//! acquire/try/defer/release, a class without a constructor gains an
//! empty one, named `fun`/`class` statements become `const` assignments,
//! and `a -> b` becomes the invocation `b(a)`.

use crate::ast::{AstNode, NodeKind};
use crate::error::{Error, Result};
use crate::token::{
    Keyword, Lexer, NextTokenMode, Op, Position, Sep, Token, TokenKind,
};

const ERR_CANNOT_EXPAND_NAMED_ARG: &str = "named arguments cannot be expanded";
const ERR_DUPLICATE_DEFAULT: &str = "multiple 'default' labels in one switch";
const ERR_EOL_BEFORE_PAR: &str =
    "ambiguous syntax: end of line before '(' - consider adding a ';'";
const ERR_EOL_BEFORE_SQ: &str =
    "ambiguous syntax: end of line before '[' - consider adding a ';'";
const ERR_EOL_BEFORE_OP: &str =
    "ambiguous syntax: end of line before operator - consider adding a ';'";
const ERR_EXCEEDED_AST_DEPTH: &str = "expression depth exceeded";
const ERR_EXPECTED_ASSIGNABLE: &str =
    "expected identifier, refinement, slice or 'void' for multi-assignment";
const ERR_EXPECTED_CASE: &str = "expected 'case'";
const ERR_EXPECTED_CASE_OR_DEFAULT: &str = "expected 'case' or 'default'";
const ERR_EXPECTED_CASE_STATEMENTS: &str = "expected statements after 'case'";
const ERR_EXPECTED_CATCH: &str = "expected 'catch'";
const ERR_EXPECTED_COLON: &str = "expected ':'";
const ERR_EXPECTED_COMMA: &str = "expected ','";
const ERR_EXPECTED_CONST_OR_EXPR: &str = "expected 'const' or expression";
const ERR_EXPECTED_CURLY_CLOSE: &str = "expected '}'";
const ERR_EXPECTED_CURLY_OPEN: &str = "expected '{'";
const ERR_EXPECTED_EXPRESSION: &str = "expected expression";
const ERR_EXPECTED_FOR_IN: &str = "expected 'in' expression";
const ERR_EXPECTED_IDENT_OR_STR: &str = "expected identifier or string literal";
const ERR_EXPECTED_IDENTIFIER: &str = "expected identifier";
const ERR_EXPECTED_INVOCATION: &str = "expected invocation";
const ERR_EXPECTED_LAMBDA_OP: &str = "expected '=>'";
const ERR_EXPECTED_MEMBER_EXPR: &str = "expected literal, identifier or '('";
const ERR_EXPECTED_MULTI_ASSIGNMENT: &str =
    "expected '=' after comma-separated variables or members";
const ERR_EXPECTED_NAMED_ARG: &str = "expected named argument";
const ERR_EXPECTED_NAMED_ASSIGNMENT: &str = "expected '=' after named argument";
const ERR_EXPECTED_PARAM_DEFAULT: &str = "expected default value for parameter";
const ERR_EXPECTED_PAREN_CLOSE: &str = "expected ')'";
const ERR_EXPECTED_PAREN_OPEN: &str = "expected '('";
const ERR_EXPECTED_SEMICOLON: &str = "expected ';'";
const ERR_EXPECTED_SQUARE_CLOSE: &str = "expected ']'";
const ERR_EXPECTED_STRING: &str = "unexpected interpolated string";
const ERR_EXPECTED_THIS: &str = "expected 'this' inside a constructor function";
const ERR_EXPECTED_VAR_OR_CONST: &str = "expected 'var' or 'const'";
const ERR_EXPECTED_VAR_ASSIGNMENT: &str = "expected '=' in variable declaration";
const ERR_EXPECTED_WHILE: &str = "expected 'while'";
const ERR_FALLTHROUGH_IN_LAST_CASE: &str =
    "unexpected 'fallthrough' statement in last switch case";
const ERR_INVALID_PUBLIC: &str =
    "incorrect 'public' declaration, must be a constant, variable, function or class";
const ERR_MIXED_OPERATORS: &str = "mixed operators, consider using parentheses";
const ERR_TOO_MANY_NON_DEFAULT: &str =
    "too many non-default arguments (more than 255) preceding an argument with default value";
const ERR_UNEXPECTED_BREAK: &str =
    "unexpected 'break' statement; can only be used inside a loop or switch";
const ERR_UNEXPECTED_CONTINUE: &str =
    "unexpected 'continue' statement; can only be used inside a loop";
const ERR_UNEXPECTED_CTOR: &str = "constructor already defined for this class";
const ERR_UNEXPECTED_IMPORT: &str = "unexpected 'import' statement";
const ERR_UNEXPECTED_FALLTHROUGH: &str =
    "unexpected 'fallthrough' statement; can only be used inside a switch";
const ERR_UNEXPECTED_PUBLIC: &str = "'public' declaration can only occur in global scope";
const ERR_UNEXPECTED_SUPER: &str =
    "unexpected 'super' literal; can only be used inside a derived class member function";
const ERR_UNEXPECTED_SUPER_CTOR: &str =
    "'super()' constructor can only be invoked from another constructor";
const ERR_UNSUPPORTED_SLICE_ASSIGN: &str = "unsupported assignment to slice, expected '='";
const ERR_YIELD_IN_CONSTRUCTOR: &str = "'yield' not allowed in constructors";

/// Default bound on statement/expression nesting depth.
pub const DEFAULT_MAX_AST_DEPTH: u32 = 128;

/// Context flags and counters threaded through statement parsing; saved
/// and reset on entry to every function body.
#[derive(Debug, Clone, Default)]
struct ParserState {
    /// Position of the last `fallthrough` statement in the current switch.
    last_fallthrough: Option<Token>,
    /// Nonzero inside parenthesized/bracketed context; newline ambiguity
    /// checks only fire at depth zero.
    unary_depth: i32,
    allow_continue: u32,
    allow_break: u32,
    allow_fallthrough: u32,
    in_constructor: bool,
    in_derived_class: bool,
    in_class_member: bool,
}

/// The parser.
pub struct Parser<'s> {
    lexer: Lexer<'s>,
    token: Token,
    unget: bool,
    had_eol: bool,
    ast_depth: u32,
    max_ast_depth: u32,
    state: ParserState,
}

impl<'s> Parser<'s> {
    #[must_use]
    pub fn new(source: &'s str) -> Self {
        Self::with_max_depth(source, DEFAULT_MAX_AST_DEPTH)
    }

    #[must_use]
    pub fn with_max_depth(source: &'s str, max_ast_depth: u32) -> Self {
        let lexer = Lexer::new(source);
        Self {
            token: Token::synthetic(TokenKind::Eof, "", Position::new(1, 1)),
            lexer,
            unget: false,
            had_eol: false,
            ast_depth: 0,
            max_ast_depth,
            state: ParserState::default(),
        }
    }

    #[must_use]
    pub const fn source(&self) -> &'s str {
        self.lexer.source()
    }

    /// Parse a whole module: leading imports followed by statements.
    pub fn parse(&mut self) -> Result<AstNode> {
        let mut root = self.new_node(NodeKind::Scope);
        root.token.pos = Position::new(1, 1);

        self.handle_imports(&mut root)?;

        while let Some(stmt) = self.next_statement()? {
            root.push(stmt);
        }

        Ok(root)
    }

    /// Prepend an implicit `import base.*` to a parsed module.
    pub fn import_base(&self, ast: &mut AstNode) {
        debug_assert_eq!(ast.kind, NodeKind::Scope);

        let pos = Position::new(1, 1);
        let mut import_node = AstNode::new(
            NodeKind::Import,
            Token::synthetic(TokenKind::Keyword(Keyword::Import), "import", pos),
        );
        import_node.push(AstNode::new(
            NodeKind::Identifier,
            Token::synthetic(TokenKind::Identifier, "base", pos),
        ));
        import_node.push(AstNode::new(
            NodeKind::Identifier,
            Token::synthetic(TokenKind::Operator(Op::Mul), "*", pos),
        ));

        ast.children.insert(0, import_node);
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    /// Advance to the next significant token, skipping whitespace and
    /// comments. A newline, or a comment spanning one, sets `had_eol`.
    fn next_token(&mut self) -> Result<()> {
        if !self.unget {
            let mut had_eol = false;

            loop {
                let token = self.lexer.next_token(NextTokenMode::Any)?;

                match token.kind {
                    TokenKind::Comment => {
                        if token.pos.line < self.lexer.pos().line {
                            had_eol = true;
                        }
                    }
                    TokenKind::Eol => had_eol = true,
                    TokenKind::Whitespace => (),
                    _ => {
                        self.token = token;
                        break;
                    }
                }
            }

            self.had_eol = had_eol;
        }

        self.unget = false;
        Ok(())
    }

    fn unget(&mut self) {
        self.unget = true;
    }

    /// Rewind the lexer to an arbitrary previously-fetched token.
    fn rewind_to(&mut self, token: &Token) {
        self.lexer.unget_token(token);
        self.unget = false;
    }

    fn parse_error(&self, message: &'static str) -> Error {
        Error::parse(message, self.token.pos)
    }

    fn is_implicit_semicolon(&self) -> bool {
        self.token.kind.sep() != Some(Sep::Semicolon)
            && (self.had_eol
                || self.token.kind.sep() == Some(Sep::CurlyClose)
                || self.token.is_eof())
    }

    fn assume_separator(&mut self, sep: Sep) -> Result<()> {
        self.next_token()?;

        if self.token.kind.sep() == Some(sep) {
            return Ok(());
        }

        match sep {
            Sep::Colon => Err(self.parse_error(ERR_EXPECTED_COLON)),
            Sep::Semicolon => {
                if self.is_implicit_semicolon() {
                    self.unget();
                    Ok(())
                } else {
                    Err(self.parse_error(ERR_EXPECTED_SEMICOLON))
                }
            }
            Sep::CurlyOpen => Err(self.parse_error(ERR_EXPECTED_CURLY_OPEN)),
            Sep::CurlyClose => Err(self.parse_error(ERR_EXPECTED_CURLY_CLOSE)),
            Sep::ParenOpen => Err(self.parse_error(ERR_EXPECTED_PAREN_OPEN)),
            Sep::ParenClose => Err(self.parse_error(ERR_EXPECTED_PAREN_CLOSE)),
            _ => Err(self.parse_error(ERR_EXPECTED_SQUARE_CLOSE)),
        }
    }

    fn increase_ast_depth(&mut self) -> Result<()> {
        self.ast_depth += 1;
        if self.ast_depth > self.max_ast_depth {
            return Err(self.parse_error(ERR_EXCEEDED_AST_DEPTH));
        }
        Ok(())
    }

    /// A node built from the current token.
    fn new_node(&self, kind: NodeKind) -> AstNode {
        AstNode::new(kind, self.token.clone())
    }

    fn fetch_optional_paren(&mut self) -> Result<bool> {
        self.next_token()?;
        let was_paren = self.token.kind.sep() == Some(Sep::ParenOpen);
        if !was_paren {
            self.unget();
        }
        Ok(was_paren)
    }

    // ------------------------------------------------------------------
    // Function literals
    // ------------------------------------------------------------------

    /// Attach a name to a function, constructor or class literal. With
    /// `can_self_refer` the name becomes visible inside the function body.
    fn set_function_name(&self, node: &mut AstNode, name_token: Token, can_self_refer: bool) {
        let target = if node.kind == NodeKind::ClassLiteral {
            // The constructor is the third child of a class literal.
            &mut node.children[2]
        } else {
            node
        };
        debug_assert!(matches!(
            target.kind,
            NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral
        ));

        let name_node = &mut target.children[0];
        debug_assert!(matches!(name_node.kind, NodeKind::Name | NodeKind::NameConst));

        if can_self_refer {
            name_node.kind = NodeKind::NameConst;
        }

        let kind = if matches!(name_token.kind, TokenKind::String(_)) {
            NodeKind::StringLiteral
        } else {
            NodeKind::Identifier
        };
        name_node.push(AstNode::new(kind, name_token));
    }

    /// Parse a `(a, b = 1, c...)` parameter list; the opening `(` has been
    /// consumed.
    fn parameters(&mut self) -> Result<AstNode> {
        let mut params = self.new_node(NodeKind::Parameters);
        let mut num_non_def = 0u32;
        let mut has_defaults = false;

        self.next_token()?;

        while self.token.kind == TokenKind::Identifier
            || self.token.kind.keyword() == Some(Keyword::Underscore)
        {
            let ident = self.new_node(if self.token.kind == TokenKind::Identifier {
                NodeKind::Identifier
            } else {
                NodeKind::Placeholder
            });
            let mut is_ellipsis = false;

            self.next_token()?;

            if self.token.kind.op().map_or(false, Op::is_assignment) {
                has_defaults = true;

                if num_non_def > 255 {
                    return Err(self.parse_error(ERR_TOO_MANY_NON_DEFAULT));
                }

                let mut assign = self.new_node(NodeKind::Assignment);
                assign.push(ident);
                assign.push(self.right_hand_side_expr()?);
                params.push(assign);

                self.next_token()?;
            } else if self.token.kind.op() == Some(Op::More) {
                let mut ellipsis = self.new_node(NodeKind::Ellipsis);
                ellipsis.push(ident);
                params.push(ellipsis);
                is_ellipsis = true;

                self.next_token()?;
            } else {
                num_non_def += 1;

                if has_defaults {
                    return Err(self.parse_error(ERR_EXPECTED_PARAM_DEFAULT));
                }

                params.push(ident);
            }

            if is_ellipsis {
                break;
            }

            if self.token.kind.sep() == Some(Sep::Comma) {
                self.next_token()?;
            } else if self.token.kind.sep() != Some(Sep::ParenClose) {
                return Err(self.parse_error(ERR_EXPECTED_PAREN_CLOSE));
            }
        }

        self.unget();
        self.assume_separator(Sep::ParenClose)?;

        Ok(params)
    }

    fn save_function_state(&mut self) -> ParserState {
        std::mem::take(&mut self.state)
    }

    fn restore_function_state(&mut self, state: ParserState) {
        self.state = state;
    }

    /// Parse the body of `fun`/`constructor` after the keyword. Children:
    /// name, parameters, landmark, body scope, landmark.
    fn function_literal(&mut self, keyword: Keyword) -> Result<AstNode> {
        let constructor = keyword == Keyword::Constructor;
        let class_member = self.state.in_derived_class;

        let saved = self.save_function_state();
        self.state.in_constructor = constructor;

        let result = self.function_literal_inner(constructor, class_member);

        self.restore_function_state(saved);
        result
    }

    fn function_literal_inner(&mut self, constructor: bool, class_member: bool) -> Result<AstNode> {
        let mut fun = self.new_node(if constructor {
            NodeKind::ConstructorLiteral
        } else {
            NodeKind::FunctionLiteral
        });

        fun.push(self.new_node(NodeKind::Name));

        self.next_token()?;

        let params = if self.token.kind.sep() == Some(Sep::ParenOpen) {
            let params = self.parameters()?;
            self.next_token()?;
            params
        } else {
            self.new_node(NodeKind::Parameters)
        };
        fun.push(params);

        self.unget();

        fun.push(self.new_node(NodeKind::Landmark));

        self.state.in_class_member = class_member;

        let mut body = self.compound_stmt()?;

        debug_assert_eq!(self.token.kind.sep(), Some(Sep::CurlyClose));

        // Every function body falls through to an implicit return.
        let mut ret = self.new_node(NodeKind::Return);
        ret.push(self.new_node(if constructor {
            NodeKind::ThisLiteral
        } else {
            NodeKind::VoidLiteral
        }));
        body.push(ret);

        fun.push(body);
        fun.push(self.new_node(NodeKind::Landmark));

        Ok(fun)
    }

    /// Look ahead after `(` to tell a lambda literal from a parenthesized
    /// expression, then rewind.
    fn is_lambda_literal(&mut self) -> Result<bool> {
        debug_assert_eq!(self.token.kind.sep(), Some(Sep::ParenOpen));

        let saved_token = self.token.clone();
        let mut is_lambda = false;

        self.next_token()?;

        if self.token.kind.sep() == Some(Sep::ParenClose) {
            self.next_token()?;
            is_lambda = self.token.kind.op() == Some(Op::Lambda);
        } else if self.token.kind == TokenKind::Identifier {
            self.next_token()?;

            if self.token.kind.op().map_or(false, Op::is_assignment)
                || self.token.kind.op() == Some(Op::More)
                || self.token.kind.sep() == Some(Sep::Comma)
            {
                is_lambda = true;
            } else if self.token.kind.sep() == Some(Sep::ParenClose) {
                self.next_token()?;
                is_lambda = self.token.kind.op() == Some(Op::Lambda);
            }
        }

        self.rewind_to(&saved_token);
        self.next_token()?;

        Ok(is_lambda)
    }

    /// Parse `=> expr` with `args` already collected; the `=>` is the
    /// current token.
    fn lambda_literal_body(&mut self, args: AstNode) -> Result<AstNode> {
        debug_assert_eq!(self.token.kind.op(), Some(Op::Lambda));
        debug_assert_eq!(args.kind, NodeKind::Parameters);

        let saved = self.save_function_state();
        self.state.unary_depth = 1;

        let result = (|| {
            let mut fun = self.new_node(NodeKind::FunctionLiteral);
            fun.push(self.new_node(NodeKind::Name));
            fun.push(args);
            fun.push(self.new_node(NodeKind::Landmark));

            let mut body = self.new_node(NodeKind::Scope);
            let mut ret = self.new_node(NodeKind::Return);
            ret.push(self.right_hand_side_expr()?);
            body.push(ret);

            fun.push(body);
            fun.push(self.new_node(NodeKind::Landmark));

            Ok(fun)
        })();

        self.restore_function_state(saved);
        result
    }

    fn lambda_literal(&mut self) -> Result<AstNode> {
        let args = self.parameters()?;

        self.next_token()?;

        if self.token.kind.op() != Some(Op::Lambda) {
            return Err(self.parse_error(ERR_EXPECTED_LAMBDA_OP));
        }

        self.lambda_literal_body(args)
    }

    /// A synthesized `constructor { return this; }`.
    fn gen_empty_constructor(&self) -> AstNode {
        let mut ctor = self.new_node(NodeKind::ConstructorLiteral);
        ctor.push(self.new_node(NodeKind::Name));
        ctor.push(self.new_node(NodeKind::Parameters));
        ctor.push(self.new_node(NodeKind::Landmark));

        let mut body = self.new_node(NodeKind::Scope);
        let mut ret = self.new_node(NodeKind::Return);
        ret.push(self.new_node(NodeKind::ThisLiteral));
        body.push(ret);
        ctor.push(body);

        ctor.push(self.new_node(NodeKind::Landmark));
        ctor
    }

    /// Parse a class literal after the `class` keyword. Children:
    /// extends-expression (or empty), member object, constructor.
    fn class_literal(&mut self) -> Result<AstNode> {
        debug_assert!(!self.state.in_derived_class);

        let result = self.class_literal_inner();
        self.state.in_derived_class = false;
        result
    }

    fn class_literal_inner(&mut self) -> Result<AstNode> {
        let mut class = self.new_node(NodeKind::ClassLiteral);
        let empty_ctor = self.gen_empty_constructor();

        self.next_token()?;

        if self.token.kind.keyword() == Some(Keyword::Extends) {
            class.push(self.member_expr()?);
            self.state.in_derived_class = true;
        } else {
            class.push(self.new_node(NodeKind::Empty));
            self.unget();
        }

        self.assume_separator(Sep::CurlyOpen)?;

        let mut members = self.new_node(NodeKind::ObjectLiteral);
        let mut ctor: Option<AstNode> = None;

        loop {
            self.next_token()?;

            if self.token.kind.keyword() == Some(Keyword::Constructor) {
                if ctor.is_some() {
                    return Err(self.parse_error(ERR_UNEXPECTED_CTOR));
                }
                ctor = Some(self.function_literal(Keyword::Constructor)?);
            } else if self.token.kind == TokenKind::Identifier
                || matches!(self.token.kind, TokenKind::Keyword(_))
            {
                let fun_name_token = self.token.clone();

                let mut prop = self.new_node(NodeKind::Property);
                prop.push(self.new_node(NodeKind::StringLiteral));

                let mut fun = self.function_literal(Keyword::Fun)?;
                self.set_function_name(&mut fun, fun_name_token, false);
                prop.push(fun);

                members.push(prop);
            } else {
                self.unget();
                break;
            }
        }

        class.push(members);
        class.push(ctor.unwrap_or(empty_ctor));

        self.assume_separator(Sep::CurlyClose)?;

        Ok(class)
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    /// Parse the rest of an interpolated string after its opening
    /// `"...\(` token. Children alternate string parts and expressions.
    fn interpolated_string(&mut self) -> Result<AstNode> {
        let mut interp = self.new_node(NodeKind::InterpolatedString);
        interp.push(self.new_node(NodeKind::StringLiteral));

        loop {
            interp.push(self.right_hand_side_expr()?);

            // The expression must stop at the `)` closing the escape; hand
            // the continuation back to the lexer.
            let closing = self.token.clone();
            self.rewind_to(&closing);
            self.token = self.lexer.next_token(NextTokenMode::ContinueString)?;
            self.unget = false;

            debug_assert!(matches!(
                self.token.kind,
                TokenKind::String(_) | TokenKind::StringOpen
            ));

            interp.push(self.new_node(NodeKind::StringLiteral));

            if matches!(self.token.kind, TokenKind::String(_)) {
                break;
            }
        }

        Ok(interp)
    }

    fn array_literal(&mut self) -> Result<AstNode> {
        let mut array = self.new_node(NodeKind::ArrayLiteral);

        self.next_token()?;

        while self.token.kind.sep() != Some(Sep::SquareClose) {
            self.unget();

            let mut elem = self.right_hand_side_expr()?;

            self.next_token()?;

            if self.token.kind.op() == Some(Op::More) {
                let mut expand = self.new_node(NodeKind::Expand);
                expand.push(elem);
                elem = expand;

                self.next_token()?;
            }

            array.push(elem);

            if self.token.kind.sep() == Some(Sep::Comma) {
                self.next_token()?;
            } else if self.token.kind.sep() != Some(Sep::SquareClose) {
                return Err(self.parse_error(ERR_EXPECTED_SQUARE_CLOSE));
            }
        }

        Ok(array)
    }

    fn object_literal(&mut self) -> Result<AstNode> {
        let mut object = self.new_node(NodeKind::ObjectLiteral);
        let mut comma = true;

        loop {
            self.next_token()?;

            if self.token.kind.sep() == Some(Sep::Comma) {
                if comma {
                    return Err(self.parse_error(ERR_EXPECTED_IDENT_OR_STR));
                }
                comma = true;
                continue;
            } else if self.token.kind.sep() == Some(Sep::CurlyClose) {
                break;
            }

            if !comma {
                return Err(self.parse_error(ERR_EXPECTED_COMMA));
            }

            let mut prop = self.new_node(NodeKind::Property);
            let name_token = self.token.clone();

            match self.token.kind {
                TokenKind::String(_) | TokenKind::Identifier | TokenKind::Keyword(_) => {
                    prop.push(self.new_node(NodeKind::StringLiteral));
                }
                TokenKind::StringOpen => {
                    return Err(self.parse_error(ERR_EXPECTED_STRING));
                }
                _ => return Err(self.parse_error(ERR_EXPECTED_IDENT_OR_STR)),
            }

            self.assume_separator(Sep::Colon)?;

            let mut value = self.right_hand_side_expr()?;

            if matches!(
                value.kind,
                NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral | NodeKind::ClassLiteral
            ) {
                self.set_function_name(&mut value, name_token, false);
            }

            prop.push(value);
            object.push(prop);

            comma = false;
        }

        Ok(object)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn primary_expr(&mut self) -> Result<AstNode> {
        self.next_token()?;

        let saved_unary_depth = self.state.unary_depth;
        self.state.unary_depth += 1;

        let result = self.primary_expr_inner();

        self.state.unary_depth = saved_unary_depth;
        result
    }

    fn primary_expr_inner(&mut self) -> Result<AstNode> {
        match self.token.kind {
            TokenKind::Numeric => Ok(self.new_node(NodeKind::NumericLiteral)),
            TokenKind::String(_) => Ok(self.new_node(NodeKind::StringLiteral)),
            TokenKind::StringOpen => self.interpolated_string(),
            TokenKind::Identifier => {
                let ident = self.new_node(NodeKind::Identifier);
                self.next_token()?;
                if self.token.kind.op() == Some(Op::Lambda) {
                    let mut args = self.new_node(NodeKind::Parameters);
                    args.push(ident);
                    self.lambda_literal_body(args)
                } else {
                    self.unget();
                    Ok(ident)
                }
            }
            TokenKind::Keyword(kw) => match kw {
                Keyword::Fun => self.function_literal(Keyword::Fun),
                Keyword::Class => self.class_literal(),
                Keyword::This => Ok(self.new_node(NodeKind::ThisLiteral)),
                Keyword::Super => {
                    if self.state.in_class_member {
                        Ok(self.new_node(NodeKind::SuperProtoLiteral))
                    } else {
                        Err(self.parse_error(ERR_UNEXPECTED_SUPER))
                    }
                }
                Keyword::Line => Ok(self.new_node(NodeKind::LineLiteral)),
                Keyword::True | Keyword::False => Ok(self.new_node(NodeKind::BoolLiteral)),
                Keyword::Void => Ok(self.new_node(NodeKind::VoidLiteral)),
                Keyword::Underscore => Ok(self.new_node(NodeKind::Placeholder)),
                _ => Err(self.parse_error(ERR_EXPECTED_MEMBER_EXPR)),
            },
            TokenKind::Separator(Sep::SquareOpen) => self.array_literal(),
            TokenKind::Separator(Sep::CurlyOpen) => self.object_literal(),
            TokenKind::Separator(Sep::ParenOpen) => {
                if self.is_lambda_literal()? {
                    self.lambda_literal()
                } else {
                    let expr = self.right_hand_side_expr()?;
                    self.assume_separator(Sep::ParenClose)?;
                    Ok(expr)
                }
            }
            _ => Err(self.parse_error(ERR_EXPECTED_MEMBER_EXPR)),
        }
    }

    fn unary_expr(&mut self) -> Result<AstNode> {
        self.next_token()?;

        let is_unary = self.token.kind.op().map_or(false, Op::is_unary)
            || matches!(
                self.token.kind.keyword(),
                Some(Keyword::Typeof) | Some(Keyword::Delete)
            );

        if is_unary {
            self.increase_ast_depth()?;

            let saved_unary_depth = self.state.unary_depth;
            self.state.unary_depth += 1;

            let mut op_node = self.new_node(NodeKind::Operator);
            let operand = self.unary_expr();

            self.state.unary_depth = saved_unary_depth;
            self.ast_depth -= 1;

            op_node.push(operand?);
            Ok(op_node)
        } else {
            self.unget();
            self.member_expr()
        }
    }

    /// `+ - * / %` with precedence, `& | ^` same-operator chains, and
    /// single shifts; silently mixing the groups is a parse error.
    fn arithm_bitwise_expr(&mut self) -> Result<AstNode> {
        let mut node = self.unary_expr()?;

        self.next_token()?;

        let op = self.token.kind.op();

        if op.map_or(false, |op| op.is_arithmetic() || op.is_multiplicative()) {
            let mut last_op = op.unwrap_or(Op::Add);

            if last_op.is_arithmetic() && self.had_eol && self.state.unary_depth == 0 {
                return Err(self.parse_error(ERR_EOL_BEFORE_OP));
            }

            let mut top = self.new_node(NodeKind::Operator);
            top.push(node);

            node = self.unary_expr()?;

            self.next_token()?;

            let mut depth = 0u32;
            loop {
                self.increase_ast_depth()?;
                depth += 1;

                let cur = self.token.kind.op();

                if cur.map_or(false, Op::is_arithmetic) {
                    if self.had_eol && self.state.unary_depth == 0 {
                        return Err(self.parse_error(ERR_EOL_BEFORE_OP));
                    }

                    top.push(node);
                    last_op = cur.unwrap_or(Op::Add);

                    let mut next = self.new_node(NodeKind::Operator);
                    next.push(top);
                    top = next;

                    node = self.unary_expr()?;
                    self.next_token()?;
                } else if cur.map_or(false, Op::is_multiplicative) {
                    let mut mul_depth = 0u32;

                    loop {
                        self.increase_ast_depth()?;
                        mul_depth += 1;

                        if last_op.is_multiplicative() {
                            // Left-associative chain at the top.
                            top.push(node);
                            last_op = self.token.kind.op().unwrap_or(Op::Mul);

                            let mut next = self.new_node(NodeKind::Operator);
                            next.push(top);
                            top = next;

                            node = self.unary_expr()?;
                        } else {
                            // Binds tighter than the pending + or -.
                            let mut aux = self.new_node(NodeKind::Operator);
                            aux.push(node);
                            aux.push(self.unary_expr()?);
                            node = aux;
                        }

                        self.next_token()?;

                        if !self.token.kind.op().map_or(false, Op::is_multiplicative) {
                            break;
                        }
                    }

                    self.ast_depth -= mul_depth;
                } else {
                    break;
                }
            }

            top.push(node);
            self.ast_depth -= depth;

            if self.token.kind.op().map_or(false, |op| {
                matches!(op, Op::And | Op::Or | Op::Xor)
            }) {
                return Err(self.parse_error(ERR_MIXED_OPERATORS));
            }

            self.unget();
            Ok(top)
        } else if op.map_or(false, |op| matches!(op, Op::And | Op::Or | Op::Xor)) {
            let chain_op = op.unwrap_or(Op::And);
            let mut top = node;
            let mut depth = 0u32;

            loop {
                self.increase_ast_depth()?;
                depth += 1;

                let mut next = self.new_node(NodeKind::Operator);
                next.push(top);
                next.push(self.unary_expr()?);
                top = next;

                self.next_token()?;
                if self.token.kind.op() != Some(chain_op) {
                    break;
                }
            }

            self.ast_depth -= depth;

            if self.token.kind.op().map_or(false, |next_op| {
                matches!(next_op, Op::And | Op::Or | Op::Xor)
                    || next_op.is_arithmetic()
                    || next_op.is_multiplicative()
                    || matches!(next_op, Op::Shl | Op::Shr | Op::Shru)
            }) {
                return Err(self.parse_error(ERR_MIXED_OPERATORS));
            }

            self.unget();
            Ok(top)
        } else if op.map_or(false, |op| matches!(op, Op::Shl | Op::Shr | Op::Shru)) {
            // Shifts do not associate; a second shift must be
            // parenthesized.
            let mut top = self.new_node(NodeKind::Operator);
            top.push(node);
            top.push(self.unary_expr()?);
            Ok(top)
        } else {
            self.unget();
            Ok(node)
        }
    }

    fn comparison_expr(&mut self) -> Result<AstNode> {
        let node = self.arithm_bitwise_expr()?;

        self.next_token()?;

        let is_comparison = self.token.kind.op().map_or(false, Op::is_comparison)
            || matches!(
                self.token.kind.keyword(),
                Some(Keyword::In) | Some(Keyword::Instanceof) | Some(Keyword::Propertyof)
            );

        if is_comparison {
            // 'in' and 'propertyof' take the container first.
            let swap = matches!(
                self.token.kind.keyword(),
                Some(Keyword::In) | Some(Keyword::Propertyof)
            );

            let mut top = self.new_node(NodeKind::Operator);
            let rhs = self.arithm_bitwise_expr()?;

            if swap {
                top.push(rhs);
                top.push(node);
            } else {
                top.push(node);
                top.push(rhs);
            }

            Ok(top)
        } else {
            self.unget();
            Ok(node)
        }
    }

    fn logical_expr(&mut self) -> Result<AstNode> {
        let mut node = self.comparison_expr()?;

        self.next_token()?;

        let op = self.token.kind.op();

        if matches!(op, Some(Op::LogAnd) | Some(Op::LogOr)) {
            let chain_op = op.unwrap_or(Op::LogAnd);
            let mut depth = 0u32;

            // Right-leaning chain: a && b && c => (a && (b && c)).
            let mut top = self.new_node(NodeKind::Operator);
            top.push(node);

            let mut tail_tokens = Vec::new();

            loop {
                self.next_token()?;
                self.increase_ast_depth()?;
                depth += 1;
                self.unget();

                let operand = self.comparison_expr()?;

                self.next_token()?;

                if self.token.kind.op() == Some(chain_op) {
                    tail_tokens.push((operand, self.token.clone()));
                } else {
                    // Assemble from the innermost pair outwards.
                    let mut inner = operand;
                    while let Some((lhs, token)) = tail_tokens.pop() {
                        let mut next = AstNode::new(NodeKind::Operator, token);
                        next.push(lhs);
                        next.push(inner);
                        inner = next;
                    }
                    top.push(inner);
                    break;
                }
            }

            self.ast_depth -= depth;

            if matches!(self.token.kind.op(), Some(Op::LogAnd) | Some(Op::LogOr)) {
                return Err(self.parse_error(ERR_MIXED_OPERATORS));
            }

            node = top;
        }

        self.unget();
        Ok(node)
    }

    fn conditional_expr(&mut self) -> Result<AstNode> {
        let node = self.logical_expr()?;

        self.next_token()?;

        if self.token.kind.op() == Some(Op::LogTri) {
            self.increase_ast_depth()?;

            let mut top = self.new_node(NodeKind::Operator);
            top.push(node);

            let saved_unary_depth = self.state.unary_depth;
            self.state.unary_depth += 1;
            let then_expr = self.conditional_expr();
            self.state.unary_depth = saved_unary_depth;
            top.push(then_expr?);

            self.assume_separator(Sep::Colon)?;

            top.push(self.conditional_expr()?);

            self.ast_depth -= 1;
            Ok(top)
        } else {
            self.unget();
            Ok(node)
        }
    }

    /// `a -> b -> c` desugars to `c(b(a))`.
    fn stream_expr(&mut self) -> Result<AstNode> {
        self.next_token()?;
        self.increase_ast_depth()?;
        let mut depth = 1u32;
        self.unget();

        let mut node = self.conditional_expr()?;

        self.next_token()?;

        while self.token.kind.op() == Some(Op::Arrow) {
            self.increase_ast_depth()?;
            depth += 1;

            let mut invocation = self.new_node(NodeKind::Invocation);
            let mut fun_node = self.conditional_expr()?;

            if fun_node.kind == NodeKind::SuperProtoLiteral {
                if !self.state.in_constructor {
                    return Err(Error::parse(ERR_UNEXPECTED_SUPER_CTOR, fun_node.pos()));
                }
                debug_assert!(self.state.in_class_member);
                fun_node.kind = NodeKind::SuperCtorLiteral;
            }

            invocation.push(fun_node);
            invocation.push(node);
            node = invocation;

            self.next_token()?;
        }

        self.unget();
        self.ast_depth -= depth;

        Ok(node)
    }

    /// `async f(x)` or `async do { ... }`.
    fn async_expr(&mut self) -> Result<AstNode> {
        let mut async_node = self.new_node(NodeKind::Async);
        let name_token = self.token.clone();

        self.next_token()?;

        let invocation = if self.token.kind.keyword() == Some(Keyword::Do) {
            // async do { BODY } wraps the body in a zero-argument
            // function literal which the async node invokes.
            let saved = self.save_function_state();
            let result = (|| {
                let mut invocation = self.new_node(NodeKind::Invocation);
                let mut fun = self.new_node(NodeKind::FunctionLiteral);

                let mut name = self.new_node(NodeKind::Name);
                name.token = name_token.clone();
                let mut name_ident = self.new_node(NodeKind::Identifier);
                name_ident.token = name_token.clone();
                name.push(name_ident);
                fun.push(name);

                fun.push(self.new_node(NodeKind::Parameters));
                fun.push(self.new_node(NodeKind::Landmark));

                self.state.unary_depth = 0;
                let mut body = self.do_stmt()?;
                debug_assert_eq!(body.kind, NodeKind::Scope);
                body.push(self.new_node(NodeKind::Return));
                fun.push(body);

                fun.push(self.new_node(NodeKind::Landmark));

                invocation.push(fun);
                Ok(invocation)
            })();
            self.restore_function_state(saved);
            result?
        } else {
            let saved_token = self.token.clone();
            self.unget();

            let node = self.stream_expr()?;

            if node.kind != NodeKind::Invocation {
                return Err(Error::parse(ERR_EXPECTED_INVOCATION, saved_token.pos));
            }
            node
        };

        async_node.push(invocation);
        Ok(async_node)
    }

    fn right_hand_side_expr(&mut self) -> Result<AstNode> {
        self.next_token()?;

        match self.token.kind.keyword() {
            Some(Keyword::Yield) => {
                if self.state.in_constructor {
                    return Err(self.parse_error(ERR_YIELD_IN_CONSTRUCTOR));
                }

                let mut yield_node = self.new_node(NodeKind::Yield);

                self.next_token()?;

                let value = if self.token.kind.keyword() == Some(Keyword::Async) {
                    self.async_expr()?
                } else {
                    self.unget();
                    self.stream_expr()?
                };

                yield_node.push(value);
                Ok(yield_node)
            }
            Some(Keyword::Async) => self.async_expr(),
            _ => {
                self.unget();
                self.stream_expr()
            }
        }
    }

    /// `expr.name` — the name becomes a string literal child.
    fn refinement_identifier(&mut self, object: AstNode) -> Result<AstNode> {
        let mut refinement = self.new_node(NodeKind::Refinement);
        refinement.push(object);

        self.next_token()?;

        if self.token.kind == TokenKind::StringOpen {
            return Err(self.parse_error(ERR_EXPECTED_STRING));
        }

        if !matches!(
            self.token.kind,
            TokenKind::Identifier | TokenKind::Keyword(_) | TokenKind::String(_)
        ) {
            return Err(self.parse_error(ERR_EXPECTED_IDENT_OR_STR));
        }

        refinement.push(self.new_node(NodeKind::StringLiteral));

        Ok(refinement)
    }

    /// `expr[index]` or `expr[begin:end]`.
    fn refinement_expr(&mut self, object: AstNode) -> Result<AstNode> {
        let mut refinement = self.new_node(NodeKind::Refinement);
        refinement.push(object);

        self.next_token()?;

        if self.token.kind.sep() == Some(Sep::SquareClose) {
            return Err(self.parse_error(ERR_EXPECTED_EXPRESSION));
        }

        if self.token.kind.sep() == Some(Sep::Colon) {
            refinement.kind = NodeKind::Slice;

            self.next_token()?;

            if self.token.kind.sep() == Some(Sep::SquareClose) {
                refinement.push(self.new_node(NodeKind::VoidLiteral));
                refinement.push(self.new_node(NodeKind::VoidLiteral));
                self.unget();
            } else {
                refinement.push(self.new_node(NodeKind::VoidLiteral));
                self.unget();
                refinement.push(self.right_hand_side_expr()?);
            }
        } else {
            self.unget();
            refinement.push(self.right_hand_side_expr()?);

            self.next_token()?;

            if self.token.kind.sep() == Some(Sep::Colon) {
                refinement.kind = NodeKind::Slice;

                self.next_token()?;
                self.unget();

                if self.token.kind.sep() == Some(Sep::SquareClose) {
                    refinement.push(self.new_node(NodeKind::VoidLiteral));
                } else {
                    refinement.push(self.right_hand_side_expr()?);
                }
            } else {
                self.unget();
            }
        }

        self.assume_separator(Sep::SquareClose)?;

        Ok(refinement)
    }

    fn named_argument(&mut self) -> Result<AstNode> {
        self.next_token()?;

        if self.token.kind != TokenKind::Identifier {
            return Err(self.parse_error(ERR_EXPECTED_NAMED_ARG));
        }

        let mut prop = self.new_node(NodeKind::Property);
        prop.push(self.new_node(NodeKind::StringLiteral));

        self.next_token()?;

        if self.token.kind.op() != Some(Op::Set) {
            return Err(self.parse_error(ERR_EXPECTED_NAMED_ASSIGNMENT));
        }

        prop.push(self.right_hand_side_expr()?);

        Ok(prop)
    }

    /// `f(...)`; the opening `(` has been consumed.
    fn invocation(&mut self, mut fun: AstNode) -> Result<AstNode> {
        let mut invocation = self.new_node(NodeKind::Invocation);

        if fun.kind == NodeKind::SuperProtoLiteral {
            if !self.state.in_constructor {
                return Err(Error::parse(ERR_UNEXPECTED_SUPER_CTOR, fun.pos()));
            }
            debug_assert!(self.state.in_class_member);
            fun.kind = NodeKind::SuperCtorLiteral;
        }

        invocation.push(fun);

        self.next_token()?;

        if self.token.kind.sep() == Some(Sep::ParenClose) {
            return Ok(invocation);
        }

        // Peek for `name =` to detect named arguments.
        let mut named_args = false;
        if self.token.kind == TokenKind::Identifier {
            let saved_token = self.token.clone();
            self.next_token()?;
            named_args = self.token.kind.op() == Some(Op::Set);
            self.rewind_to(&saved_token);
        } else {
            self.unget();
        }

        let mut named_object = if named_args {
            Some(self.new_node(NodeKind::ObjectLiteral))
        } else {
            None
        };

        loop {
            let mut arg = if named_args {
                self.named_argument()?
            } else {
                self.right_hand_side_expr()?
            };

            self.next_token()?;

            if self.token.kind.op() == Some(Op::More) {
                if named_args {
                    return Err(self.parse_error(ERR_CANNOT_EXPAND_NAMED_ARG));
                }

                let mut expand = self.new_node(NodeKind::Expand);
                expand.push(arg);
                arg = expand;

                self.next_token()?;
            }

            match named_object.as_mut() {
                Some(object) => object.push(arg),
                None => invocation.push(arg),
            }

            if self.token.kind.sep() == Some(Sep::ParenClose) {
                break;
            }
            if self.token.kind.sep() != Some(Sep::Comma) {
                return Err(self.parse_error(ERR_EXPECTED_COMMA));
            }
        }

        if let Some(object) = named_object {
            let mut named = AstNode::new(NodeKind::NamedArguments, object.token.clone());
            named.push(object);
            invocation.push(named);
        }

        Ok(invocation)
    }

    fn member_expr(&mut self) -> Result<AstNode> {
        let mut node = self.primary_expr()?;

        let saved_unary_depth = self.state.unary_depth;
        self.state.unary_depth += 1;

        let result = loop {
            if let Err(e) = self.next_token() {
                break Err(e);
            }

            let r = if self.token.kind.op() == Some(Op::Dot) {
                self.refinement_identifier(node)
            } else if self.token.kind.op() == Some(Op::OptDot) {
                self.refinement_identifier(node).map(|mut n| {
                    n.kind = NodeKind::OptRefinement;
                    n
                })
            } else if self.token.kind.sep() == Some(Sep::SquareOpen) {
                if self.had_eol && self.state.unary_depth == 1 {
                    Err(self.parse_error(ERR_EOL_BEFORE_SQ))
                } else {
                    self.refinement_expr(node)
                }
            } else if self.token.kind.sep() == Some(Sep::ParenOpen) {
                if self.had_eol && self.state.unary_depth == 1 {
                    Err(self.parse_error(ERR_EOL_BEFORE_PAR))
                } else {
                    self.invocation(node)
                }
            } else {
                self.unget();
                break Ok(node);
            };

            match r {
                Ok(n) => node = n,
                Err(e) => break Err(e),
            }
        };

        self.state.unary_depth = saved_unary_depth;
        result
    }

    /// `var`/`const` declaration, possibly multi-assignment or the head
    /// of a for-in.
    fn expr_var_const(
        &mut self,
        allow_in: bool,
        allow_multi_assignment: bool,
        is_public: bool,
    ) -> Result<AstNode> {
        let var_node_kind = if self.token.kind.keyword() == Some(Keyword::Const) {
            NodeKind::Const
        } else {
            NodeKind::Var
        };
        let mut decl = self.new_node(var_node_kind);
        let mut node_kind = NodeKind::Assignment;

        self.next_token()?;

        let is_placeholder = self.token.kind.keyword() == Some(Keyword::Underscore);
        if self.token.kind != TokenKind::Identifier && !is_placeholder {
            return Err(self.parse_error(ERR_EXPECTED_IDENTIFIER));
        }

        let mut ident = self.new_node(if is_placeholder {
            NodeKind::Placeholder
        } else {
            NodeKind::Identifier
        });
        let ident_token = self.token.clone();
        if is_public {
            ident.push(self.new_node(NodeKind::Export));
        }
        decl.push(ident);

        self.next_token()?;

        if self.token.kind.sep() == Some(Sep::Comma) {
            if !allow_multi_assignment {
                return Err(self.parse_error(ERR_EXPECTED_VAR_ASSIGNMENT));
            }
            node_kind = NodeKind::MultiAssignment;
        }

        while self.token.kind.sep() == Some(Sep::Comma) {
            self.next_token()?;

            if self.token.kind == TokenKind::Identifier {
                decl.push(self.new_node(NodeKind::Identifier));
            } else if self.token.kind.keyword() == Some(Keyword::Underscore) {
                decl.push(self.new_node(NodeKind::Placeholder));
            } else {
                return Err(self.parse_error(ERR_EXPECTED_IDENTIFIER));
            }

            self.next_token()?;
        }

        let is_in = self.token.kind.keyword() == Some(Keyword::In);

        if (!is_in || !allow_in) && self.token.kind.op() != Some(Op::Set) {
            return Err(self.parse_error(ERR_EXPECTED_VAR_ASSIGNMENT));
        }

        if is_in {
            node_kind = NodeKind::In;
        }

        let mut assignment = self.new_node(node_kind);
        assignment.push(decl);

        let mut value = self.right_hand_side_expr()?;

        if matches!(
            value.kind,
            NodeKind::FunctionLiteral | NodeKind::ConstructorLiteral | NodeKind::ClassLiteral
        ) && node_kind != NodeKind::In
        {
            self.set_function_name(&mut value, ident_token, var_node_kind == NodeKind::Const);
        }

        assignment.push(value);

        Ok(assignment)
    }

    fn check_multi_assgn_lhs(&self, node: &AstNode) -> Result<()> {
        if matches!(
            node.kind,
            NodeKind::Refinement
                | NodeKind::Identifier
                | NodeKind::VoidLiteral
                | NodeKind::Slice
                | NodeKind::Placeholder
        ) {
            Ok(())
        } else {
            Err(Error::parse(ERR_EXPECTED_ASSIGNABLE, node.pos()))
        }
    }

    fn expr_no_var(&mut self) -> Result<AstNode> {
        let node = self.right_hand_side_expr()?;
        let node_kind = node.kind;

        self.next_token()?;

        let end_here = self.token.kind.sep() == Some(Sep::Semicolon)
            || self.token.kind.sep() == Some(Sep::ParenClose)
            || !matches!(
                node_kind,
                NodeKind::Identifier
                    | NodeKind::Refinement
                    | NodeKind::Slice
                    | NodeKind::VoidLiteral
            )
            || (self.token.kind.sep() != Some(Sep::Comma)
                && !self.token.kind.op().map_or(false, Op::is_assignment)
                && self.had_eol)
            || self.token.is_eof();

        if end_here {
            self.unget();
            return Ok(node);
        }

        let mut lhs = self.new_node(NodeKind::LeftHandSide);
        let mut num_assignees = 1u32;

        if self.token.kind.sep() == Some(Sep::Comma) {
            self.check_multi_assgn_lhs(&node)?;
        } else if node_kind == NodeKind::VoidLiteral {
            return Err(self.parse_error(ERR_EXPECTED_SEMICOLON));
        }

        lhs.push(node);

        while self.token.kind.sep() == Some(Sep::Comma) {
            num_assignees += 1;

            let target = self.member_expr()?;
            self.check_multi_assgn_lhs(&target)?;
            lhs.push(target);

            self.next_token()?;
        }

        let assign_op = self.token.kind.op().filter(|op| op.is_assignment());

        let assign_op = match assign_op {
            Some(op) => op,
            None => {
                return Err(self.parse_error(if num_assignees > 1 {
                    ERR_EXPECTED_MULTI_ASSIGNMENT
                } else {
                    ERR_EXPECTED_SEMICOLON
                }))
            }
        };

        if assign_op != Op::Set && num_assignees > 1 {
            return Err(self.parse_error(ERR_EXPECTED_MULTI_ASSIGNMENT));
        }

        if assign_op != Op::Set && node_kind == NodeKind::Slice {
            return Err(self.parse_error(ERR_UNSUPPORTED_SLICE_ASSIGN));
        }

        let mut assignment = self.new_node(if num_assignees > 1 {
            NodeKind::MultiAssignment
        } else {
            NodeKind::Assignment
        });
        assignment.push(lhs);
        assignment.push(self.right_hand_side_expr()?);

        Ok(assignment)
    }

    fn expr(&mut self, allow_in: bool, allow_var: bool) -> Result<AstNode> {
        if allow_var {
            self.next_token()?;

            if matches!(
                self.token.kind.keyword(),
                Some(Keyword::Var) | Some(Keyword::Const)
            ) {
                self.expr_var_const(allow_in, true, false)
            } else {
                self.unget();
                self.expr_no_var()
            }
        } else {
            self.expr_no_var()
        }
    }

    fn expr_stmt(&mut self) -> Result<AstNode> {
        let node = self.expr(false, true)?;
        self.assume_separator(Sep::Semicolon)?;
        Ok(node)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn compound_stmt(&mut self) -> Result<AstNode> {
        self.assume_separator(Sep::CurlyOpen)?;

        let mut scope = self.new_node(NodeKind::Scope);

        self.next_token()?;

        while self.token.kind.sep() != Some(Sep::CurlyClose) {
            if self.token.is_eof() {
                return Err(self.parse_error(ERR_EXPECTED_CURLY_CLOSE));
            }

            self.unget();

            match self.next_statement()? {
                Some(stmt) => scope.push(stmt),
                None => return Err(self.parse_error(ERR_EXPECTED_CURLY_CLOSE)),
            }

            self.next_token()?;
        }

        Ok(scope)
    }

    fn do_stmt(&mut self) -> Result<AstNode> {
        self.compound_stmt()
    }

    /// A named `fun`/`class` statement becomes `const name = literal`.
    fn function_stmt(&mut self, is_public: bool) -> Result<AstNode> {
        let fun_kw_token = self.token.clone();
        let fun_keyword = self.token.kind.keyword().unwrap_or(Keyword::Fun);

        self.next_token()?;

        if self.token.kind == TokenKind::Identifier {
            let fun_name_token = self.token.clone();

            // The assignment borrows the keyword's position, with `=`
            // semantics for operator selection downstream.
            let assign_token = Token::synthetic(
                TokenKind::Operator(Op::Set),
                fun_kw_token.kind.keyword().map_or("fun", |kw| match kw {
                    Keyword::Class => "class",
                    _ => "fun",
                }),
                fun_kw_token.pos,
            );

            let mut assignment = AstNode::new(NodeKind::Assignment, assign_token.clone());

            let mut const_node = AstNode::new(NodeKind::Const, assign_token);
            let mut ident = AstNode::new(NodeKind::Identifier, fun_name_token.clone());
            if is_public {
                ident.push(AstNode::new(NodeKind::Export, fun_name_token.clone()));
            }
            const_node.push(ident);
            assignment.push(const_node);

            let mut fun = if fun_keyword == Keyword::Class {
                self.class_literal()?
            } else {
                self.function_literal(fun_keyword)?
            };

            self.set_function_name(&mut fun, fun_name_token, true);

            assignment.push(fun);

            Ok(assignment)
        } else if is_public {
            Err(self.parse_error(ERR_EXPECTED_IDENTIFIER))
        } else {
            // Anonymous literal in statement position.
            self.rewind_to(&fun_kw_token);
            self.expr_stmt()
        }
    }

    fn if_stmt(&mut self) -> Result<AstNode> {
        let mut if_node = self.new_node(NodeKind::If);

        if_node.push(self.right_hand_side_expr()?);
        if_node.push(self.compound_stmt()?);

        self.next_token()?;

        if self.token.kind.keyword() == Some(Keyword::Else) {
            self.next_token()?;

            if self.token.kind.keyword() == Some(Keyword::If) {
                if_node.push(self.if_stmt()?);
            } else {
                self.unget();
                if_node.push(self.compound_stmt()?);
            }
        } else {
            self.unget();
        }

        Ok(if_node)
    }

    fn try_stmt(&mut self) -> Result<AstNode> {
        let mut try_node = self.new_node(NodeKind::TryCatch);

        try_node.push(self.compound_stmt()?);

        self.next_token()?;

        if self.token.kind.keyword() != Some(Keyword::Catch) {
            return Err(self.parse_error(ERR_EXPECTED_CATCH));
        }

        let mut catch_node = self.new_node(NodeKind::Catch);

        let has_paren = self.fetch_optional_paren()?;

        self.next_token()?;

        let var_kind = match self.token.kind.keyword() {
            Some(Keyword::Var) => NodeKind::Var,
            Some(Keyword::Const) => NodeKind::Const,
            _ => return Err(self.parse_error(ERR_EXPECTED_VAR_OR_CONST)),
        };

        let mut var_node = self.new_node(var_kind);

        self.next_token()?;

        if self.token.kind != TokenKind::Identifier {
            return Err(self.parse_error(ERR_EXPECTED_IDENTIFIER));
        }

        var_node.push(self.new_node(NodeKind::Identifier));
        catch_node.push(var_node);

        if has_paren {
            self.assume_separator(Sep::ParenClose)?;
        }

        catch_node.push(self.compound_stmt()?);
        try_node.push(catch_node);

        Ok(try_node)
    }

    /// `defer { HANDLER }` — the remainder of the enclosing block becomes
    /// the try body, the handler runs on any exit from it.
    fn defer_stmt(&mut self) -> Result<AstNode> {
        let mut defer_node = self.new_node(NodeKind::TryDefer);
        let mut try_scope = self.new_node(NodeKind::Scope);

        let handler = self.compound_stmt()?;

        self.next_token()?;

        let block_ends = self.token.is_eof()
            || self.token.kind.sep() == Some(Sep::CurlyClose)
            || matches!(
                self.token.kind.keyword(),
                Some(Keyword::Case) | Some(Keyword::Default)
            );

        if block_ends {
            // A defer at the end of a block runs its body inline.
            self.unget();
            return Ok(handler);
        }

        loop {
            self.unget();

            match self.next_statement()? {
                Some(stmt) => try_scope.push(stmt),
                None => break,
            }

            self.next_token()?;

            if self.token.is_eof()
                || self.token.kind.sep() == Some(Sep::CurlyClose)
                || matches!(
                    self.token.kind.keyword(),
                    Some(Keyword::Case) | Some(Keyword::Default)
                )
            {
                break;
            }
        }

        self.unget();

        defer_node.push(try_scope);
        defer_node.push(handler);

        Ok(defer_node)
    }

    /// A `const` with a name derived from the current source position;
    /// used by the `with` statement desugaring.
    fn gen_fake_const(&self) -> AstNode {
        let pos = self.token.pos;
        let mut const_node = self.new_node(NodeKind::Const);
        const_node.push(AstNode::new(
            NodeKind::Identifier,
            Token::synthetic(
                TokenKind::Identifier,
                format!("{}:{}", pos.line, pos.column),
                pos,
            ),
        ));
        const_node
    }

    /// `if "acquire" propertyof OBJ { OBJ.acquire(); }`
    fn gen_acquire(&self, const_node: &AstNode) -> AstNode {
        let ident_token = const_node.children[0].token.clone();
        let pos = ident_token.pos;

        let acquire_token =
            Token::synthetic(TokenKind::String(crate::token::StringEscape::Raw), "acquire", pos);

        let mut if_node = AstNode::new(NodeKind::If, ident_token.clone());

        let mut cond = AstNode::new(
            NodeKind::Operator,
            Token::synthetic(TokenKind::Keyword(Keyword::Propertyof), "propertyof", pos),
        );
        cond.push(AstNode::new(NodeKind::Identifier, ident_token.clone()));
        cond.push(AstNode::new(NodeKind::StringLiteral, acquire_token.clone()));
        if_node.push(cond);

        let mut scope = AstNode::new(NodeKind::Scope, ident_token.clone());
        let mut invocation = AstNode::new(NodeKind::Invocation, ident_token.clone());
        let mut refinement = AstNode::new(NodeKind::Refinement, ident_token.clone());
        refinement.push(AstNode::new(NodeKind::Identifier, ident_token));
        refinement.push(AstNode::new(NodeKind::StringLiteral, acquire_token));
        invocation.push(refinement);
        scope.push(invocation);
        if_node.push(scope);

        if_node
    }

    /// `OBJ.release();`
    fn gen_release(&self, const_node: &AstNode) -> AstNode {
        let ident_token = const_node.children[0].token.clone();
        let pos = ident_token.pos;

        let release_token =
            Token::synthetic(TokenKind::String(crate::token::StringEscape::Raw), "release", pos);

        let mut scope = AstNode::new(NodeKind::Scope, ident_token.clone());
        let mut invocation = AstNode::new(NodeKind::Invocation, ident_token.clone());
        let mut refinement = AstNode::new(NodeKind::Refinement, ident_token.clone());
        refinement.push(AstNode::new(NodeKind::Identifier, ident_token));
        refinement.push(AstNode::new(NodeKind::StringLiteral, release_token));
        invocation.push(refinement);
        scope.push(invocation);

        scope
    }

    fn with_stmt_continued(&mut self, has_paren: bool, parent: &mut AstNode) -> Result<()> {
        let assignment = if self.token.kind.keyword() == Some(Keyword::Const) {
            self.expr_var_const(false, false, false)?
        } else {
            let mut assignment = AstNode::new(
                NodeKind::Assignment,
                Token::synthetic(TokenKind::Operator(Op::Set), "=", self.token.pos),
            );
            assignment.push(self.gen_fake_const());

            self.unget();
            assignment.push(self.right_hand_side_expr()?);
            assignment
        };

        let const_node = assignment.children[0].clone();
        parent.push(assignment);
        parent.push(self.gen_acquire(&const_node));

        self.next_token()?;

        let mut try_node = self.new_node(NodeKind::TryDefer);

        if self.token.kind.sep() == Some(Sep::Comma) {
            self.increase_ast_depth()?;

            self.next_token()?;

            if self.token.kind.keyword() == Some(Keyword::Var)
                || self.token.kind.sep() == Some(Sep::Comma)
                || self.token.kind.sep() == Some(Sep::CurlyOpen)
                || self.token.kind.sep() == Some(Sep::ParenClose)
            {
                return Err(self.parse_error(ERR_EXPECTED_CONST_OR_EXPR));
            }

            let mut scope = self.new_node(NodeKind::Scope);
            self.with_stmt_continued(has_paren, &mut scope)?;
            try_node.push(scope);

            self.ast_depth -= 1;
        } else {
            self.unget();

            if has_paren {
                self.assume_separator(Sep::ParenClose)?;
            }

            try_node.push(self.compound_stmt()?);
        }

        try_node.push(self.gen_release(&const_node));
        parent.push(try_node);

        Ok(())
    }

    /// `with EXPR { BODY }` desugars to a scope with a temporary, an
    /// acquire call, and the body inside a try/defer releasing it.
    fn with_stmt(&mut self) -> Result<AstNode> {
        let mut scope = self.new_node(NodeKind::Scope);

        let has_paren = self.fetch_optional_paren()?;

        self.next_token()?;

        if self.token.kind.keyword() == Some(Keyword::Var)
            || (has_paren && self.token.kind.sep() == Some(Sep::ParenClose))
        {
            return Err(self.parse_error(ERR_EXPECTED_CONST_OR_EXPR));
        }

        self.with_stmt_continued(has_paren, &mut scope)?;

        Ok(scope)
    }

    fn switch_stmt(&mut self) -> Result<AstNode> {
        let saved_fallthrough = self.state.last_fallthrough.take();

        let result = self.switch_stmt_inner();

        self.state.last_fallthrough = saved_fallthrough;
        result
    }

    fn switch_stmt_inner(&mut self) -> Result<AstNode> {
        let mut switch_node = self.new_node(NodeKind::Switch);
        let mut has_default = false;

        switch_node.push(self.right_hand_side_expr()?);

        self.assume_separator(Sep::CurlyOpen)?;

        self.state.allow_break += 1;
        self.state.allow_fallthrough += 1;

        let result = (|| {
            self.next_token()?;

            while self.token.kind.sep() != Some(Sep::CurlyClose) {
                if self.token.is_eof() {
                    return Err(self.parse_error(ERR_EXPECTED_CURLY_CLOSE));
                }

                let mut case_node;

                if self.token.kind.keyword() == Some(Keyword::Default) {
                    if has_default {
                        return Err(self.parse_error(ERR_DUPLICATE_DEFAULT));
                    }
                    has_default = true;

                    case_node = self.new_node(NodeKind::Default);
                    self.assume_separator(Sep::Colon)?;
                    case_node.push(self.new_node(NodeKind::Empty));
                } else {
                    if self.token.kind.keyword() != Some(Keyword::Case) {
                        return Err(self.parse_error(if has_default {
                            ERR_EXPECTED_CASE
                        } else {
                            ERR_EXPECTED_CASE_OR_DEFAULT
                        }));
                    }

                    case_node = self.new_node(NodeKind::Case);

                    // `case a, b:` becomes two cases chained with an
                    // implicit fallthrough.
                    loop {
                        case_node.push(self.right_hand_side_expr()?);

                        self.next_token()?;

                        if self.token.kind.sep() != Some(Sep::Comma) {
                            self.unget();
                            break;
                        }

                        case_node.push(self.new_node(NodeKind::Fallthrough));
                        switch_node.push(case_node);
                        case_node = self.new_node(NodeKind::Case);
                    }

                    self.assume_separator(Sep::Colon)?;
                }

                self.state.last_fallthrough = None;

                let mut scope_node = self.new_node(NodeKind::Scope);
                let mut num_stmts = 0u32;
                let mut trailing_fallthrough: Option<AstNode> = None;

                self.next_token()?;

                while !matches!(
                    self.token.kind.keyword(),
                    Some(Keyword::Case) | Some(Keyword::Default)
                ) && self.token.kind.sep() != Some(Sep::CurlyClose)
                    && !self.token.is_eof()
                {
                    self.unget();

                    let stmt = match self.next_statement()? {
                        Some(stmt) => stmt,
                        None => return Err(self.parse_error(ERR_EXPECTED_CURLY_CLOSE)),
                    };
                    let stmt_kind = stmt.kind;

                    // A lone break produces an empty scope.
                    if stmt_kind != NodeKind::Break || num_stmts > 0 {
                        if stmt_kind == NodeKind::Fallthrough {
                            trailing_fallthrough = Some(stmt);
                        } else {
                            scope_node.push(stmt);
                        }
                    }

                    num_stmts += 1;

                    self.next_token()?;

                    if matches!(stmt_kind, NodeKind::Break | NodeKind::Fallthrough) {
                        break;
                    }
                }

                if num_stmts == 0 {
                    return Err(self.parse_error(ERR_EXPECTED_CASE_STATEMENTS));
                }

                case_node.push(scope_node);
                if let Some(ft) = trailing_fallthrough {
                    case_node.push(ft);
                }
                switch_node.push(case_node);
            }

            Ok(())
        })();

        self.state.allow_break -= 1;
        self.state.allow_fallthrough -= 1;

        result?;

        if let Some(token) = self.state.last_fallthrough.take() {
            return Err(Error::parse(ERR_FALLTHROUGH_IN_LAST_CASE, token.pos));
        }

        Ok(switch_node)
    }

    /// `loop { }` is `while true`-shaped with an empty condition.
    fn loop_stmt(&mut self) -> Result<AstNode> {
        let mut while_node = self.new_node(NodeKind::While);
        while_node.push(self.new_node(NodeKind::Empty));

        self.state.allow_continue += 1;
        self.state.allow_break += 1;

        let body = self.compound_stmt();

        self.state.allow_continue -= 1;
        self.state.allow_break -= 1;

        while_node.push(body?);

        Ok(while_node)
    }

    fn repeat_stmt(&mut self) -> Result<AstNode> {
        let mut repeat_node = self.new_node(NodeKind::Repeat);

        self.state.allow_continue += 1;
        self.state.allow_break += 1;

        let body = self.compound_stmt();

        self.state.allow_continue -= 1;
        self.state.allow_break -= 1;

        repeat_node.push(body?);

        self.next_token()?;

        if self.token.kind.keyword() != Some(Keyword::While) {
            return Err(self.parse_error(ERR_EXPECTED_WHILE));
        }

        debug_assert_eq!(self.state.unary_depth, 0);

        repeat_node.push(self.right_hand_side_expr()?);

        self.assume_separator(Sep::Semicolon)?;

        Ok(repeat_node)
    }

    fn while_stmt(&mut self) -> Result<AstNode> {
        let mut while_node = self.new_node(NodeKind::While);

        while_node.push(self.right_hand_side_expr()?);

        self.state.allow_continue += 1;
        self.state.allow_break += 1;

        let body = self.compound_stmt();

        self.state.allow_continue -= 1;
        self.state.allow_break -= 1;

        while_node.push(body?);

        Ok(while_node)
    }

    fn for_stmt(&mut self) -> Result<AstNode> {
        let mut for_node = self.new_node(NodeKind::ForIn);

        let has_paren = self.fetch_optional_paren()?;

        let in_node = self.expr(true, true)?;

        if in_node.kind != NodeKind::In {
            return Err(Error::parse(ERR_EXPECTED_FOR_IN, in_node.pos()));
        }

        for_node.push(in_node);

        if has_paren {
            self.assume_separator(Sep::ParenClose)?;
        }

        self.state.allow_continue += 1;
        self.state.allow_break += 1;

        let body = self.compound_stmt();

        self.state.allow_continue -= 1;
        self.state.allow_break -= 1;

        for_node.push(body?);

        Ok(for_node)
    }

    fn continue_stmt(&mut self) -> Result<AstNode> {
        if self.state.allow_continue == 0 {
            return Err(self.parse_error(ERR_UNEXPECTED_CONTINUE));
        }

        let node = self.new_node(NodeKind::Continue);
        self.assume_separator(Sep::Semicolon)?;
        Ok(node)
    }

    fn break_stmt(&mut self) -> Result<AstNode> {
        if self.state.allow_break == 0 {
            return Err(self.parse_error(ERR_UNEXPECTED_BREAK));
        }

        let node = self.new_node(NodeKind::Break);
        self.assume_separator(Sep::Semicolon)?;
        Ok(node)
    }

    fn fallthrough_stmt(&mut self) -> Result<AstNode> {
        if self.state.allow_fallthrough == 0 {
            return Err(self.parse_error(ERR_UNEXPECTED_FALLTHROUGH));
        }

        let node = self.new_node(NodeKind::Fallthrough);
        self.state.last_fallthrough = Some(node.token.clone());
        self.assume_separator(Sep::Semicolon)?;
        Ok(node)
    }

    /// `import name;`, `import name.symbol;`, `import name.*;` or
    /// `import name: a, b;`.
    fn import_stmt(&mut self) -> Result<AstNode> {
        let mut import_node = self.new_node(NodeKind::Import);

        self.next_token()?;

        if self.token.kind != TokenKind::Identifier {
            return Err(self.parse_error(ERR_EXPECTED_IDENTIFIER));
        }

        import_node.push(self.new_node(NodeKind::Identifier));

        self.next_token()?;

        if self.token.kind.op() == Some(Op::Dot) {
            self.next_token()?;

            if self.token.kind.op() == Some(Op::Mul)
                || self.token.kind == TokenKind::Identifier
                || matches!(self.token.kind, TokenKind::Keyword(_))
            {
                import_node.push(self.new_node(NodeKind::Identifier));
            } else {
                return Err(self.parse_error(ERR_EXPECTED_IDENTIFIER));
            }
        } else if self.token.kind.sep() == Some(Sep::Colon) {
            loop {
                self.next_token()?;

                if self.token.kind != TokenKind::Identifier
                    && !matches!(self.token.kind, TokenKind::Keyword(_))
                {
                    return Err(self.parse_error(ERR_EXPECTED_IDENTIFIER));
                }

                import_node.push(self.new_node(NodeKind::Identifier));

                self.next_token()?;

                if self.token.kind.sep() != Some(Sep::Comma) {
                    break;
                }
            }

            self.unget();
        } else {
            self.unget();
        }

        self.assume_separator(Sep::Semicolon)?;

        Ok(import_node)
    }

    fn end_of_return(&self) -> bool {
        self.token.kind.sep() == Some(Sep::Semicolon)
            || self.token.kind.sep() == Some(Sep::CurlyClose)
            || self.token.is_eof()
    }

    fn return_throw_assert_stmt(&mut self, kind: NodeKind) -> Result<AstNode> {
        let mut node = self.new_node(kind);

        self.next_token()?;

        if kind == NodeKind::Return && self.end_of_return() {
            if self.state.in_constructor {
                let mut this_node = self.new_node(NodeKind::ThisLiteral);
                this_node.token = node.token.clone();
                node.push(this_node);
            }

            if self.token.kind.sep() != Some(Sep::Semicolon) {
                self.unget();
            }

            return Ok(node);
        }

        if self.state.in_constructor
            && kind == NodeKind::Return
            && self.token.kind.keyword() != Some(Keyword::This)
        {
            return Err(self.parse_error(ERR_EXPECTED_THIS));
        }

        self.unget();

        node.push(self.right_hand_side_expr()?);

        if kind == NodeKind::Assert {
            self.next_token()?;
            node.push(self.new_node(NodeKind::Landmark));
            self.unget();
        }

        self.assume_separator(Sep::Semicolon)?;

        Ok(node)
    }

    fn public_stmt(&mut self) -> Result<AstNode> {
        self.next_token()?;

        match self.token.kind.keyword() {
            Some(Keyword::Var) | Some(Keyword::Const) => self.expr_var_const(false, false, true),
            Some(Keyword::Fun) | Some(Keyword::Class) => self.function_stmt(true),
            _ => Err(self.parse_error(ERR_INVALID_PUBLIC)),
        }
    }

    /// Parse one statement; `None` at end of input.
    fn next_statement(&mut self) -> Result<Option<AstNode>> {
        self.next_token()?;
        self.increase_ast_depth()?;

        debug_assert_eq!(self.state.unary_depth, 0);

        let result = match self.token.kind.keyword() {
            Some(Keyword::Fun) | Some(Keyword::Class) => self.function_stmt(false).map(Some),
            Some(Keyword::Do) => self.do_stmt().map(Some),
            Some(Keyword::If) => self.if_stmt().map(Some),
            Some(Keyword::Try) => self.try_stmt().map(Some),
            Some(Keyword::Defer) => self.defer_stmt().map(Some),
            Some(Keyword::With) => self.with_stmt().map(Some),
            Some(Keyword::Switch) => self.switch_stmt().map(Some),
            Some(Keyword::Loop) => self.loop_stmt().map(Some),
            Some(Keyword::Repeat) => self.repeat_stmt().map(Some),
            Some(Keyword::While) => self.while_stmt().map(Some),
            Some(Keyword::For) => self.for_stmt().map(Some),
            Some(Keyword::Continue) => self.continue_stmt().map(Some),
            Some(Keyword::Break) => self.break_stmt().map(Some),
            Some(Keyword::Fallthrough) => self.fallthrough_stmt().map(Some),
            Some(Keyword::Return) => self.return_throw_assert_stmt(NodeKind::Return).map(Some),
            Some(Keyword::Throw) => self.return_throw_assert_stmt(NodeKind::Throw).map(Some),
            Some(Keyword::Assert) => self.return_throw_assert_stmt(NodeKind::Assert).map(Some),
            Some(Keyword::Import) => Err(self.parse_error(ERR_UNEXPECTED_IMPORT)),
            Some(Keyword::Public) => {
                if self.ast_depth == 1 {
                    self.public_stmt().map(Some)
                } else {
                    Err(self.parse_error(ERR_UNEXPECTED_PUBLIC))
                }
            }
            _ => {
                if self.token.kind.sep() == Some(Sep::Semicolon) {
                    Ok(Some(self.new_node(NodeKind::Empty)))
                } else if self.token.is_eof() {
                    Ok(None)
                } else {
                    self.unget();
                    self.expr_stmt().map(Some)
                }
            }
        };

        if result.is_ok() {
            self.ast_depth -= 1;
        }

        result
    }

    /// Consume all leading `import` statements into the module root; any
    /// later `import` is an error.
    fn handle_imports(&mut self, root: &mut AstNode) -> Result<()> {
        self.next_token()?;

        loop {
            if self.token.kind.keyword() == Some(Keyword::Import) {
                let node = self.import_stmt()?;
                root.push(node);
            } else if self.token.is_eof() {
                break;
            } else if self.token.kind.sep() != Some(Sep::Semicolon) {
                self.unget();
                break;
            }

            self.next_token()?;
        }

        Ok(())
    }
}
