use kos::{compile, compile_with_options, CompileOptions, ErrorKind};

fn compile_err(source: &str) -> kos::Error {
    compile("test.kos", source).expect_err("expected a compile error")
}

#[test]
fn test_vars_undeclared_identifier() {
    let err = compile_err("y = 1;");
    assert_eq!(err.kind, ErrorKind::CompileFailed);
    assert_eq!(err.message, "undeclared identifier");
    assert_eq!((err.pos.line, err.pos.column), (1, 1));
}

#[test]
fn test_vars_undeclared_in_expression() {
    let err = compile_err("var a = missing + 1;");
    assert_eq!(err.message, "undeclared identifier");
    assert_eq!((err.pos.line, err.pos.column), (1, 9));
}

#[test]
fn test_vars_const_not_assignable() {
    let err = compile_err("const a = 1; a = 2;");
    assert_eq!(err.message, "const variable is not assignable");

    let err = compile_err("const a = 1; a += 2;");
    assert_eq!(err.message, "const variable is not assignable");
}

#[test]
fn test_vars_redefined() {
    let err = compile_err("var a = 1; var a = 2;");
    assert_eq!(err.message, "redefined variable");

    // Shadowing in a nested block is fine.
    compile("test.kos", "var a = 1; do { var a = 2; a = a + 1; } a = 2;").unwrap();
}

#[test]
fn test_vars_defer_section_is_same_scope() {
    // The generated try section of a defer belongs to the enclosing
    // scope in source, so redeclaring after the defer is an error.
    let err = compile_err("var a = 1; defer { a = 2; } var a = 3;");
    assert_eq!(err.message, "redefined variable");
}

#[test]
fn test_vars_declaration_sees_outer_binding() {
    // `var x = x` refers to the outer x, which must exist.
    compile("test.kos", "var x = 5; do { var x = x; x = x + 1; }").unwrap();

    let err = compile_err("var x = x;");
    assert_eq!(err.message, "undeclared identifier");
}

#[test]
fn test_vars_this_and_yield_need_a_function() {
    let err = compile_err("var a = this;");
    assert_eq!(err.message, "'this' not allowed in global scope");

    let err = compile_err("var a = yield 1;");
    assert_eq!(err.message, "'yield' not allowed in global scope");

    compile("test.kos", "public const f = fun { return this; };").unwrap();
    compile("test.kos", "public const g = fun { yield 1; };").unwrap();
}

#[test]
fn test_vars_main_should_be_public() {
    let module = compile("test.kos", "fun main { return void; } main();").unwrap();
    assert!(module
        .warnings
        .iter()
        .any(|w| w.message == "main function is not declared as public"));

    let module = compile("test.kos", "public fun main { return void; }").unwrap();
    assert!(module.warnings.is_empty());
    assert!(module.global_names.contains_key("main"));
}

#[test]
fn test_vars_globals_get_slots() {
    let module = compile(
        "test.kos",
        "public var a = 1; public const b = 2; public fun c { return void; }",
    )
    .unwrap();

    assert_eq!(module.global_names.get("a"), Some(&0));
    assert_eq!(module.global_names.get("b"), Some(&1));
    assert_eq!(module.global_names.get("c"), Some(&2));
    assert_eq!(module.num_globals, 3);
}

#[test]
fn test_vars_interactive_promotes_top_level() {
    let options = CompileOptions {
        interactive: true,
        ..CompileOptions::default()
    };
    let module = compile_with_options("repl.kos", "var t = 1; t = t + 1;", options).unwrap();
    assert!(module.global_names.contains_key("t"));
}

#[test]
fn test_vars_closure_capture_compiles() {
    compile(
        "test.kos",
        "var counter = 0;
         const inc = fun { counter = counter + 1; return counter; };
         inc();
         public var result = counter;",
    )
    .unwrap();
}

#[test]
fn test_vars_capture_through_two_levels() {
    compile(
        "test.kos",
        "const make = fun(start) {
             var value = start;
             return fun {
                 return fun {
                     value = value + 1;
                     return value;
                 };
             };
         };
         public var out = make(10)()();",
    )
    .unwrap();
}

#[test]
fn test_vars_defaults_cannot_see_parameters() {
    let err = compile_err("public const f = fun(a, b = a) { return b; };");
    assert_eq!(err.message, "undeclared identifier");
}

#[test]
fn test_vars_catch_variable_scope() {
    // The catch variable is visible in the catch body only.
    compile(
        "test.kos",
        "var r = 0; try { r = 1; } catch const e { r = 2; }",
    )
    .unwrap();

    let err = compile_err("try { var a = 1; } catch const e { } var b = e;");
    assert_eq!(err.message, "undeclared identifier");
}
