use kos::{
    allocate_args, compile, optimize, process_vars, AstNode, CompileUnit, ErrorKind, NodeKind,
    NullDriver, Numeric,
};

/// Parse, resolve and optimize a module, returning the unit's AST for
/// inspection.
fn optimized(source: &str) -> AstNode {
    let mut unit = CompileUnit::new("test.kos", 0, source);
    let mut ast = unit.parse().expect("parse error");
    let mut driver = NullDriver;
    process_vars(&mut unit, &mut driver, &mut ast).expect("resolve error");
    optimize(&mut unit, &mut ast).expect("optimize error");
    ast
}

fn compile_err(source: &str) -> kos::Error {
    compile("test.kos", source).expect_err("expected a compile error")
}

#[test]
fn test_optimizer_folds_arithmetic() {
    // const x = 1 + 2 * 3  =>  const x = 7, no arithmetic emitted.
    let src = "public const x = 1 + 2 * 3;";
    let ast = optimized(src);

    let init = &ast.children[0].children[1];
    assert_eq!(init.kind, NodeKind::NumericLiteral);
    assert_eq!(init.numeric_value(src), Ok(Numeric::Integer(7)));

    let module = compile("test.kos", src).unwrap();
    let disasm = module.disassemble();
    assert!(!disasm.contains("ADD"), "folded code still adds:\n{}", disasm);
    assert!(!disasm.contains("MUL"), "folded code still multiplies:\n{}", disasm);
}

#[test]
fn test_optimizer_folds_floats_and_bitwise() {
    let src = "public const f = 1.5 + 1; public const b = 12 & 10 | 1; public const s = 1 << 4;";
    let ast = optimized(src);

    let f = &ast.children[0].children[1];
    assert_eq!(f.numeric_value(src), Ok(Numeric::Float(2.5)));

    let b = &ast.children[1].children[1];
    assert_eq!(b.numeric_value(src), Ok(Numeric::Integer(9)));

    let s = &ast.children[2].children[1];
    assert_eq!(s.numeric_value(src), Ok(Numeric::Integer(16)));
}

#[test]
fn test_optimizer_shift_semantics() {
    let src = "public const a = 1 << 64; public const b = -1 >> 100; public const c = -8 >>> 1;";
    let ast = optimized(src);

    // Out-of-range shift amounts collapse to 0 or -1.
    let a = &ast.children[0].children[1];
    assert_eq!(a.numeric_value(src), Ok(Numeric::Integer(0)));

    let b = &ast.children[1].children[1];
    assert_eq!(b.numeric_value(src), Ok(Numeric::Integer(-1)));

    let c = &ast.children[2].children[1];
    assert_eq!(c.numeric_value(src), Ok(Numeric::Integer((-8i64 as u64 >> 1) as i64)));
}

#[test]
fn test_optimizer_division_by_zero() {
    let err = compile_err("const z = 5 / 0;");
    assert_eq!(err.kind, ErrorKind::CompileFailed);
    assert_eq!(err.message, "division by zero");
    assert_eq!((err.pos.line, err.pos.column), (1, 13));

    let err = compile_err("const z = 5 % 0;");
    assert_eq!(err.message, "division by zero");

    let err = compile_err("const z = 1.0 / 0.0;");
    assert_eq!(err.message, "division by zero");
}

#[test]
fn test_optimizer_integer_range() {
    compile("test.kos", "public const max = 9223372036854775807;").unwrap();

    let err = compile_err("public const over = 9223372036854775808;");
    assert_eq!(err.message, "number out of range");

    // Bitwise operands outside the integer range are rejected.
    let err = compile_err("public const o = 1e300 & 1;");
    assert_eq!(err.message, "number out of range");
}

#[test]
fn test_optimizer_string_concatenation() {
    let src = "public const s = \"ab\" + \"cd\";";
    let ast = optimized(src);
    let s = &ast.children[0].children[1];
    assert_eq!(s.kind, NodeKind::StringLiteral);
    assert_eq!(s.string_value(src).0, "abcd");

    // Mixing raw and cooked strings is not folded.
    let src = "public const s = r\"a\" + \"b\";";
    let ast = optimized(src);
    assert_eq!(ast.children[0].children[1].kind, NodeKind::Operator);
}

#[test]
fn test_optimizer_string_concat_length_limit() {
    let a = "a".repeat(0x8000);
    let b = "b".repeat(0x7FFF);
    let ok = format!("public const s = r\"{}\" + r\"{}\";", a, b);
    compile("test.kos", &ok).unwrap();

    let b = "b".repeat(0x8000);
    let too_long = format!("public const s = r\"{}\" + r\"{}\";", a, b);
    let err = compile_err(&too_long);
    assert_eq!(err.message, "sum of two strings exceeds 65535 characters");
}

#[test]
fn test_optimizer_interpolated_string() {
    // "x=\(1+1) done" keeps the folded number as its own part.
    let src = "public const s = \"x=\\(1+1) done\";";
    let ast = optimized(src);

    let interp = &ast.children[0].children[1];
    assert_eq!(interp.kind, NodeKind::InterpolatedString);
    assert_eq!(interp.children.len(), 3);
    assert_eq!(interp.children[0].string_value(src).0, "x=");
    assert_eq!(
        interp.children[1].numeric_value(src),
        Ok(Numeric::Integer(2))
    );
    assert_eq!(interp.children[2].string_value(src).0, " done");
}

#[test]
fn test_optimizer_interpolation_collapses_to_string() {
    // All parts constant strings: the node becomes a single literal.
    let src = "public const s = \"a\\(\"b\")c\";";
    let ast = optimized(src);
    let s = &ast.children[0].children[1];
    assert_eq!(s.kind, NodeKind::StringLiteral);
    assert_eq!(s.string_value(src).0, "abc");
}

#[test]
fn test_optimizer_typeof_folding() {
    let src = "public const a = typeof 1;
               public const b = typeof 1.5;
               public const c = typeof \"s\";
               public const d = typeof true;
               public const e = typeof void;";
    let ast = optimized(src);

    let values: Vec<&str> = ast
        .children
        .iter()
        .map(|stmt| stmt.children[1].string_value(src).0)
        .collect();
    assert_eq!(values, vec!["integer", "float", "string", "boolean", "void"]);
}

#[test]
fn test_optimizer_short_circuit() {
    let src = "public const a = true && 5;
               public const b = false && 5;
               public const c = true || 5;
               public const d = false || \"x\";
               public const e = true ? 1 : 2;
               public const f = false ? 1 : 2;";
    let ast = optimized(src);

    assert_eq!(
        ast.children[0].children[1].numeric_value(src),
        Ok(Numeric::Integer(5))
    );
    assert_eq!(ast.children[1].children[1].kind, NodeKind::BoolLiteral);
    assert_eq!(ast.children[2].children[1].kind, NodeKind::BoolLiteral);
    assert_eq!(ast.children[3].children[1].kind, NodeKind::StringLiteral);
    assert_eq!(
        ast.children[4].children[1].numeric_value(src),
        Ok(Numeric::Integer(1))
    );
    assert_eq!(
        ast.children[5].children[1].numeric_value(src),
        Ok(Numeric::Integer(2))
    );
}

#[test]
fn test_optimizer_logical_not() {
    let src = "public const a = !0; public const b = !\"text\";";
    let ast = optimized(src);
    let a = &ast.children[0].children[1];
    assert_eq!(a.kind, NodeKind::BoolLiteral);
    let b = &ast.children[1].children[1];
    assert_eq!(b.kind, NodeKind::BoolLiteral);
}

#[test]
fn test_optimizer_dead_branch() {
    let src = "public var r = 0;
               if false { r = 1; } else { r = 2; }";
    let ast = optimized(src);

    let if_node = &ast.children[1];
    assert_eq!(if_node.kind, NodeKind::If);
    // The condition became `true` and only the else branch remains.
    assert_eq!(if_node.children.len(), 2);
    assert_eq!(if_node.children[0].kind, NodeKind::BoolLiteral);
}

#[test]
fn test_optimizer_terminator_propagation() {
    let src = "public const f = fun {
                   return 1;
                   var unreachable = 2;
               };";
    let ast = optimized(src);

    let fun = &ast.children[0].children[1];
    assert_eq!(fun.kind, NodeKind::FunctionLiteral);
    let body = &fun.children[3];
    // Everything after the return is gone, including the implicit
    // trailing return the parser added.
    assert_eq!(body.children.len(), 1);
    assert_eq!(body.children[0].kind, NodeKind::Return);
}

#[test]
fn test_optimizer_line_literal() {
    let src = "public const l = \n__line__;";
    let ast = optimized(src);
    assert_eq!(
        ast.children[0].children[1].numeric_value(src),
        Ok(Numeric::Integer(2))
    );
}

#[test]
fn test_optimizer_constant_propagation() {
    // b's initializer folds through a.
    let src = "public const a = 6; public const b = a * 7;";
    let ast = optimized(src);
    assert_eq!(
        ast.children[1].children[1].numeric_value(src),
        Ok(Numeric::Integer(42))
    );
}

#[test]
fn test_optimizer_is_idempotent() {
    let sources = [
        "public const x = 1 + 2 * 3;",
        "public var r = 0; if false { r = 1; } else { r = 2; }",
        "var s = 0; for var i in [1, 2, 3] { s = s + i; } public var out = s;",
        "public const f = fun(n) { if n > 0 { return n; } return 0 - n; };",
    ];

    for src in sources {
        let mut unit = CompileUnit::new("test.kos", 0, src);
        let mut ast = unit.parse().unwrap();
        let mut driver = NullDriver;
        process_vars(&mut unit, &mut driver, &mut ast).unwrap();

        optimize(&mut unit, &mut ast).unwrap();
        let passes = optimize(&mut unit, &mut ast).unwrap();
        assert_eq!(passes, 1, "optimizer not idempotent for {:?}", src);

        allocate_args(&mut unit, &mut ast).unwrap();
    }
}
