use kos::{AstNode, ErrorKind, NodeKind, Parser};

fn parse(source: &str) -> AstNode {
    Parser::new(source).parse().expect("parse error")
}

fn parse_error(source: &str) -> kos::Error {
    Parser::new(source).parse().expect_err("expected parse error")
}

/// Compare two trees by structure, ignoring positions.
fn same_shape(a: &AstNode, b: &AstNode) -> bool {
    a.kind == b.kind
        && a.children.len() == b.children.len()
        && a.children
            .iter()
            .zip(&b.children)
            .all(|(a, b)| same_shape(a, b))
}

#[test]
fn test_syntax_implicit_semicolon() {
    // A newline, a closing brace or EOF all close a statement.
    let explicit = parse("var a = 1;");
    let implicit = parse("var a = 1\n");
    let eof = parse("var a = 1");
    assert!(same_shape(&explicit, &implicit));
    assert!(same_shape(&explicit, &eof));

    let explicit = parse("do { var a = 1; }");
    let implicit = parse("do { var a = 1 }");
    assert!(same_shape(&explicit, &implicit));
}

#[test]
fn test_syntax_statement_shapes() {
    let ast = parse("var a = 1;");
    assert_eq!(ast.kind, NodeKind::Scope);
    let stmt = &ast.children[0];
    assert_eq!(stmt.kind, NodeKind::Assignment);
    assert_eq!(stmt.children[0].kind, NodeKind::Var);
    assert_eq!(stmt.children[0].children[0].kind, NodeKind::Identifier);
    assert_eq!(stmt.children[1].kind, NodeKind::NumericLiteral);
}

#[test]
fn test_syntax_precedence_tree() {
    // 1 + 2 * 3 parses as 1 + (2 * 3).
    let ast = parse("var a = 1 + 2 * 3;");
    let add = &ast.children[0].children[1];
    assert_eq!(add.kind, NodeKind::Operator);
    assert_eq!(add.children[0].kind, NodeKind::NumericLiteral);
    let mul = &add.children[1];
    assert_eq!(mul.kind, NodeKind::Operator);
    assert_eq!(mul.children.len(), 2);
}

#[test]
fn test_syntax_mixed_operators_rejected() {
    let err = parse_error("var a = 1 + 2 & 3;");
    assert_eq!(err.kind, ErrorKind::ParseFailed);
    assert_eq!(err.message, "mixed operators, consider using parentheses");

    assert_eq!(
        parse_error("var a = 1 & 2 | 3;").message,
        "mixed operators, consider using parentheses"
    );
    assert_eq!(
        parse_error("var a = b && c || d;").message,
        "mixed operators, consider using parentheses"
    );

    // Parenthesized forms are fine.
    parse("var a = (1 + 2) & 3;");
    parse("var a = (1 & 2) | 3;");
    parse("var a = (b && c) || d;");
}

#[test]
fn test_syntax_newline_ambiguity() {
    assert_eq!(
        parse_error("var a = b\n+ 1;").message,
        "ambiguous syntax: end of line before operator - consider adding a ';'"
    );
    assert_eq!(
        parse_error("f()\n(1);").message,
        "ambiguous syntax: end of line before '(' - consider adding a ';'"
    );
    assert_eq!(
        parse_error("f()\n[1];").message,
        "ambiguous syntax: end of line before '[' - consider adding a ';'"
    );

    // Inside parentheses the continuation is unambiguous.
    parse("var a = (b\n+ 1);");
}

#[test]
fn test_syntax_depth_limit() {
    let shallow = format!("var a = {}1{};", "(".repeat(4), ")".repeat(4));
    Parser::with_max_depth(&shallow, 16)
        .parse()
        .expect("shallow nesting must parse");

    let deep = format!("var a = {}1{};", "(".repeat(64), ")".repeat(64));
    let err = Parser::with_max_depth(&deep, 16)
        .parse()
        .expect_err("deep nesting must fail");
    assert_eq!(err.message, "expression depth exceeded");
}

#[test]
fn test_syntax_loop_keywords_need_context() {
    assert_eq!(
        parse_error("break;").message,
        "unexpected 'break' statement; can only be used inside a loop or switch"
    );
    assert_eq!(
        parse_error("continue;").message,
        "unexpected 'continue' statement; can only be used inside a loop"
    );
    assert_eq!(
        parse_error("fallthrough;").message,
        "unexpected 'fallthrough' statement; can only be used inside a switch"
    );

    parse("loop { break; }");
    parse("while true { continue; }");
}

#[test]
fn test_syntax_import_only_at_top() {
    let err = parse_error("var a = 1; import base;");
    assert_eq!(err.message, "unexpected 'import' statement");

    let ast = parse("import base; import fs: open, close; import net.all; var a = 1;");
    assert_eq!(ast.children[0].kind, NodeKind::Import);
    assert_eq!(ast.children[1].kind, NodeKind::Import);
    assert_eq!(ast.children[1].children.len(), 3);
    assert_eq!(ast.children[2].kind, NodeKind::Import);
}

#[test]
fn test_syntax_public_only_at_top() {
    assert_eq!(
        parse_error("do { public var a = 1; }").message,
        "'public' declaration can only occur in global scope"
    );
    assert_eq!(
        parse_error("public while;").message,
        "incorrect 'public' declaration, must be a constant, variable, function or class"
    );
}

#[test]
fn test_syntax_function_statement_desugars_to_const() {
    let ast = parse("fun add(a, b) { return a + b; }");
    let stmt = &ast.children[0];
    assert_eq!(stmt.kind, NodeKind::Assignment);
    assert_eq!(stmt.children[0].kind, NodeKind::Const);
    let fun = &stmt.children[1];
    assert_eq!(fun.kind, NodeKind::FunctionLiteral);
    // name, parameters, landmark, body, landmark
    assert_eq!(fun.children.len(), 5);
    assert_eq!(fun.children[0].kind, NodeKind::NameConst);
    assert_eq!(fun.children[1].kind, NodeKind::Parameters);
    assert_eq!(fun.children[3].kind, NodeKind::Scope);
}

#[test]
fn test_syntax_lambdas() {
    let ast = parse("var f = (a, b) => a + b;");
    let fun = &ast.children[0].children[1];
    assert_eq!(fun.kind, NodeKind::FunctionLiteral);
    assert_eq!(fun.children[1].children.len(), 2);

    let ast = parse("var g = x => x;");
    let fun = &ast.children[0].children[1];
    assert_eq!(fun.kind, NodeKind::FunctionLiteral);

    let ast = parse("var h = () => 1;");
    let fun = &ast.children[0].children[1];
    assert_eq!(fun.kind, NodeKind::FunctionLiteral);

    // A parenthesized expression is not a lambda.
    let ast = parse("var i = (x);");
    assert_eq!(ast.children[0].children[1].kind, NodeKind::Identifier);
}

#[test]
fn test_syntax_class_literal() {
    let ast = parse("class Point { constructor(x) { this.x = x; } len { return 0; } }");
    let class = &ast.children[0].children[1];
    assert_eq!(class.kind, NodeKind::ClassLiteral);
    // extends (empty), members, constructor
    assert_eq!(class.children.len(), 3);
    assert_eq!(class.children[0].kind, NodeKind::Empty);
    assert_eq!(class.children[1].kind, NodeKind::ObjectLiteral);
    assert_eq!(class.children[2].kind, NodeKind::ConstructorLiteral);

    // A class without a constructor gets an empty one.
    let ast = parse("class Empty { }");
    let class = &ast.children[0].children[1];
    assert_eq!(class.children[2].kind, NodeKind::ConstructorLiteral);

    assert_eq!(
        parse_error("class A { constructor { } constructor { } }").message,
        "constructor already defined for this class"
    );
}

#[test]
fn test_syntax_constructor_restrictions() {
    assert_eq!(
        parse_error("class A { constructor { yield 1; } }").message,
        "'yield' not allowed in constructors"
    );
    assert_eq!(
        parse_error("class A { constructor { return 1; } }").message,
        "expected 'this' inside a constructor function"
    );
    parse("class A { constructor { return this; } }");
}

#[test]
fn test_syntax_super_outside_class() {
    assert_eq!(
        parse_error("var a = super.x;").message,
        "unexpected 'super' literal; can only be used inside a derived class member function"
    );
}

#[test]
fn test_syntax_with_desugaring() {
    // with EXPR { } becomes: scope { const tmp = EXPR; acquire-if;
    // try { } defer { release } }
    let ast = parse("with f() { var a = 1; }");
    let scope = &ast.children[0];
    assert_eq!(scope.kind, NodeKind::Scope);
    assert_eq!(scope.children.len(), 3);
    assert_eq!(scope.children[0].kind, NodeKind::Assignment);
    assert_eq!(scope.children[1].kind, NodeKind::If);
    assert_eq!(scope.children[2].kind, NodeKind::TryDefer);
}

#[test]
fn test_syntax_defer_collects_rest_of_block() {
    let ast = parse("var a = 1; defer { a = 2; } a = 3; a = 4;");
    // Children: the declaration and the try/defer holding the rest.
    assert_eq!(ast.children.len(), 2);
    let defer = &ast.children[1];
    assert_eq!(defer.kind, NodeKind::TryDefer);
    assert_eq!(defer.children[0].kind, NodeKind::Scope);
    assert_eq!(defer.children[0].children.len(), 2);
    assert_eq!(defer.children[1].kind, NodeKind::Scope);

    // A defer at the end of a block is just its body.
    let ast = parse("var a = 1; defer { a = 2; }");
    assert_eq!(ast.children[1].kind, NodeKind::Scope);
}

#[test]
fn test_syntax_switch() {
    let ast = parse(
        "switch 3 {
             case 1: var a = 1; break;
             case 2, 3: var b = 2;
             default: var c = 3;
         }",
    );
    let switch = &ast.children[0];
    assert_eq!(switch.kind, NodeKind::Switch);
    // value, case 1, case 2, case 3 (comma split), default
    assert_eq!(switch.children.len(), 5);
    assert_eq!(switch.children[2].children[1].kind, NodeKind::Fallthrough);

    assert_eq!(
        parse_error("switch 1 { default: var a = 1; default: var b = 2; }").message,
        "multiple 'default' labels in one switch"
    );
    assert_eq!(
        parse_error("switch 1 { case 1: fallthrough; }").message,
        "unexpected 'fallthrough' statement in last switch case"
    );
    assert_eq!(
        parse_error("switch 1 { case 1: }").message,
        "expected statements after 'case'"
    );
}

#[test]
fn test_syntax_try_catch() {
    let ast = parse("try { var a = 1; } catch const e { var b = 2; }");
    let try_node = &ast.children[0];
    assert_eq!(try_node.kind, NodeKind::TryCatch);
    let catch = &try_node.children[1];
    assert_eq!(catch.kind, NodeKind::Catch);
    assert_eq!(catch.children[0].kind, NodeKind::Const);

    assert_eq!(parse_error("try { }").message, "expected 'catch'");
    assert_eq!(
        parse_error("try { } catch e { }").message,
        "expected 'var' or 'const'"
    );
}

#[test]
fn test_syntax_stream_operator() {
    // a -> f -> g becomes g(f(a)).
    let ast = parse("var r = 1 -> f -> g;");
    let outer = &ast.children[0].children[1];
    assert_eq!(outer.kind, NodeKind::Invocation);
    assert_eq!(outer.children[0].kind, NodeKind::Identifier);
    let inner = &outer.children[1];
    assert_eq!(inner.kind, NodeKind::Invocation);
}

#[test]
fn test_syntax_refinements_and_slices() {
    let ast = parse("var a = b.c;");
    assert_eq!(ast.children[0].children[1].kind, NodeKind::Refinement);

    let ast = parse("var a = b?.c;");
    assert_eq!(ast.children[0].children[1].kind, NodeKind::OptRefinement);

    let ast = parse("var a = b[1];");
    assert_eq!(ast.children[0].children[1].kind, NodeKind::Refinement);

    let ast = parse("var a = b[1:2];");
    let slice = &ast.children[0].children[1];
    assert_eq!(slice.kind, NodeKind::Slice);
    assert_eq!(slice.children.len(), 3);

    let ast = parse("var a = b[:];");
    let slice = &ast.children[0].children[1];
    assert_eq!(slice.kind, NodeKind::Slice);
    assert_eq!(slice.children[1].kind, NodeKind::VoidLiteral);
    assert_eq!(slice.children[2].kind, NodeKind::VoidLiteral);

    assert_eq!(
        parse_error("b[1:2] += 3;").message,
        "unsupported assignment to slice, expected '='"
    );
}

#[test]
fn test_syntax_multi_assignment() {
    let ast = parse("a, b.c, _ = f();");
    let stmt = &ast.children[0];
    assert_eq!(stmt.kind, NodeKind::MultiAssignment);
    assert_eq!(stmt.children[0].kind, NodeKind::LeftHandSide);
    assert_eq!(stmt.children[0].children.len(), 3);

    assert_eq!(
        parse_error("a, 1 = f();").message,
        "expected identifier, refinement, slice or 'void' for multi-assignment"
    );
}

#[test]
fn test_syntax_invocation_forms() {
    parse("f();");
    parse("f(1, 2, 3);");
    parse("f(a...);");
    parse("o.m(1);");

    // Named arguments build a property object.
    let ast = parse("f(x = 1, y = 2);");
    let invocation = &ast.children[0];
    assert_eq!(invocation.kind, NodeKind::Invocation);
    let named = &invocation.children[1];
    assert_eq!(named.kind, NodeKind::NamedArguments);
    assert_eq!(named.children[0].children.len(), 2);

    assert_eq!(
        parse_error("f(x = 1...);").message,
        "named arguments cannot be expanded"
    );
}

#[test]
fn test_syntax_interpolated_string() {
    let ast = parse("var s = \"a\\(1)b\\(2)c\";");
    let interp = &ast.children[0].children[1];
    assert_eq!(interp.kind, NodeKind::InterpolatedString);
    // parts: "a", 1, "b", 2, "c"
    assert_eq!(interp.children.len(), 5);
    assert_eq!(interp.children[0].kind, NodeKind::StringLiteral);
    assert_eq!(interp.children[1].kind, NodeKind::NumericLiteral);
}

#[test]
fn test_syntax_async() {
    let ast = parse("var t = async f(1);");
    let async_node = &ast.children[0].children[1];
    assert_eq!(async_node.kind, NodeKind::Async);
    assert_eq!(async_node.children[0].kind, NodeKind::Invocation);

    let ast = parse("var t = async do { var a = 1; };");
    let async_node = &ast.children[0].children[1];
    assert_eq!(async_node.kind, NodeKind::Async);

    assert_eq!(
        parse_error("var t = async 1;").message,
        "expected invocation"
    );
}

#[test]
fn test_syntax_repeat_and_for_in() {
    let ast = parse("repeat { var a = 1; } while false;");
    assert_eq!(ast.children[0].kind, NodeKind::Repeat);

    assert_eq!(parse_error("repeat { }").message, "expected 'while'");

    let ast = parse("for var x in f() { }");
    let for_node = &ast.children[0];
    assert_eq!(for_node.kind, NodeKind::ForIn);
    assert_eq!(for_node.children[0].kind, NodeKind::In);

    assert_eq!(parse_error("for var x = 1 { }").message, "expected 'in' expression");
}
