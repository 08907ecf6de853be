use kos::{compile, instructions, CompiledModule, Constant, FUN_GENERATOR};
use std::collections::BTreeSet;

fn compile_ok(source: &str) -> CompiledModule {
    match compile("test.kos", source) {
        Ok(module) => module,
        Err(err) => panic!("compile error: {}\n{}", err, err.render("test.kos", source)),
    }
}

/// Check the structural bytecode invariants: every jump lands on an
/// instruction boundary, and the line map is sorted over boundaries
/// starting at offset zero.
fn check_invariants(module: &CompiledModule) {
    let mut boundaries = BTreeSet::new();
    let mut decoded = 0usize;

    for instr in instructions(&module.bytecode) {
        boundaries.insert(instr.offset);
        decoded += instr.size;
    }
    assert_eq!(
        decoded,
        module.bytecode.len(),
        "bytecode ends inside an instruction"
    );

    for instr in instructions(&module.bytecode) {
        if let Some(target) = instr.jump_target() {
            assert!(
                boundaries.contains(&target),
                "jump at {:05x} lands inside an instruction at {:05x}",
                instr.offset,
                target
            );
        }
    }

    assert!(!module.addr2line.is_empty());
    assert_eq!(module.addr2line[0].offs, 0);
    for pair in module.addr2line.windows(2) {
        assert!(pair[0].offs <= pair[1].offs, "line map not sorted");
    }
    for entry in &module.addr2line {
        assert!(
            boundaries.contains(&entry.offs),
            "line map entry {:05x} not on an instruction boundary",
            entry.offs
        );
    }

    // Every function descriptor points inside the blob and keeps its
    // named-argument count in step with the name-index list.
    for constant in &module.constants {
        if let Constant::Function(f) = constant {
            assert!(
                (f.bytecode_offset + f.bytecode_size) as usize <= module.bytecode.len()
            );
            assert!(boundaries.contains(&f.bytecode_offset));
            assert_eq!(f.num_named_args as usize, f.arg_name_str_idx.len());
        }
    }
}

#[test]
fn test_codegen_minimal_module() {
    let module = compile_ok("public var x = 1;");
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("SET.GLOBAL"));
    assert!(disasm.contains("RETURN"));
}

#[test]
fn test_codegen_branches() {
    let module = compile_ok(
        "public var r = 0;
         var x = 10;
         if x > 5 { r = 1; } else { r = 2; }
         r = x > 3 ? r : 0 - r;",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("JUMP.NOT.COND"));
}

#[test]
fn test_codegen_loops() {
    let module = compile_ok(
        "var i = 0;
         var total = 0;
         while i < 10 {
             i = i + 1;
             if i == 3 { continue; }
             if i == 8 { break; }
             total = total + i;
         }
         repeat { i = i - 1; } while i > 0;
         loop { break; }
         public var out = total;",
    );
    check_invariants(&module);
}

#[test]
fn test_codegen_for_in() {
    let module = compile_ok(
        "fun pairs { return []; }
         var sum = 0;
         for var x in [1, 2, 3] { sum = sum + x; }
         for var k, v in pairs() { sum = sum + v; }
         public var out = sum;",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("LOAD.ITER"));
    assert!(disasm.contains("NEXT.JUMP"));
}

#[test]
fn test_codegen_functions_and_calls() {
    let module = compile_ok(
        "fun add(a, b) { return a + b; }
         fun apply(f, x) { return f(x, x); }
         public var r = apply(add, 21);",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("LOAD.FUN8"));
    assert!(disasm.contains("CALL"));

    // Three functions: two declared plus the module's top level.
    let functions = module
        .constants
        .iter()
        .filter(|c| matches!(c, Constant::Function(_)))
        .count();
    assert_eq!(functions, 3);
}

#[test]
fn test_codegen_default_args() {
    let module = compile_ok(
        "fun greet(name, greeting = \"hello\") { return greeting + name; }
         public var r = greet(\"world\");",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("BIND.DEFAULTS"));
}

#[test]
fn test_codegen_ellipsis() {
    let module = compile_ok(
        "fun tail(first, rest...) { return rest; }
         public var r = tail(1, 2, 3);",
    );
    check_invariants(&module);
}

#[test]
fn test_codegen_closures_bind() {
    let module = compile_ok(
        "var counter = 0;
         const inc = fun { counter = counter + 1; return counter; };
         inc();
         public var c = counter;",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("BIND.SELF"));
}

#[test]
fn test_codegen_try_catch_defer() {
    let module = compile_ok(
        "public var r = 0;
         try {
             throw \"boom\";
         } catch const e {
             r = 1;
         }
         defer { r = 2; }
         try { r = 3; } catch var e2 { r = 4; }",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("CATCH"));
    assert!(disasm.contains("CANCEL"));
    assert!(disasm.contains("THROW"));
}

#[test]
fn test_codegen_return_runs_defer() {
    let module = compile_ok(
        "public const f = fun {
             var done = 0;
             defer { done = 1; }
             return done;
         };",
    );
    check_invariants(&module);
}

#[test]
fn test_codegen_switch() {
    let module = compile_ok(
        "var x = 2;
         public var r = 0;
         switch x {
             case 1: r = 1; break;
             case 2, 3: r = 2;
             default: r = 9;
         }",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("CMP.EQ"));
    assert!(disasm.contains("JUMP.COND"));
}

#[test]
fn test_codegen_objects_and_arrays() {
    let module = compile_ok(
        "var point = { x: 1, y: 2 };
         var items = [1, 2, point.x];
         var tail = items[1:3];
         point.x = items[0];
         public var out = point.y + tail[0];",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("LOAD.OBJ"));
    assert!(disasm.contains("LOAD.ARRAY"));
    assert!(disasm.contains("GET.RANGE"));
}

#[test]
fn test_codegen_classes() {
    let module = compile_ok(
        "class Point {
             constructor(x, y) {
                 this.x = x;
                 this.y = y;
             }
             manhattan {
                 return this.x + this.y;
             }
         }
         public const P = Point;",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("GET.PROTO") || disasm.contains("LOAD.CONST"));

    // The class contributes a prototype constant.
    assert!(module
        .constants
        .iter()
        .any(|c| matches!(c, Constant::Prototype)));
}

#[test]
fn test_codegen_generator_flag() {
    let module = compile_ok(
        "public const gen = fun(n) {
             var i = 0;
             while i < n {
                 yield i;
                 i = i + 1;
             }
         };",
    );
    check_invariants(&module);

    let generator = module.constants.iter().any(|c| match c {
        Constant::Function(f) => f.flags & FUN_GENERATOR != 0,
        _ => false,
    });
    assert!(generator, "yield must mark the function as a generator");

    let disasm = module.disassemble();
    assert!(disasm.contains("YIELD"));
}

#[test]
fn test_codegen_line_map_tracks_lines() {
    let module = compile_ok("public var a = f();\npublic var b = f();\nfun f { return 1; }");
    check_invariants(&module);

    // Lines 1 and 2 both appear in the map.
    let lines: BTreeSet<u32> = module.addr2line.iter().map(|e| e.line).collect();
    assert!(lines.contains(&1));
    assert!(lines.contains(&2));

    let last = module.addr2line.last().unwrap();
    assert_eq!(module.line_for_offset(last.offs), last.line);
    assert_eq!(module.line_for_offset(u32::MAX), last.line);
}

#[test]
fn test_codegen_expanded_arguments() {
    let module = compile_ok(
        "fun sum(values...) { return values; }
         var args = [1, 2, 3];
         public var r = sum(args..., 4);",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("PUSH.EX"));
}

#[test]
fn test_codegen_interpolated_string_concatenates() {
    let module = compile_ok(
        "fun name { return \"kos\"; }
         public var msg = \"hello \\(name())!\";",
    );
    check_invariants(&module);

    let disasm = module.disassemble();
    assert!(disasm.contains("ADD"));
}
