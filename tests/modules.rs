use kos::{
    process_vars, CompileOptions, CompileUnit, ErrorKind, MemoryLoader, ModuleDriver,
};

fn loader_with_util() -> MemoryLoader {
    let mut loader = MemoryLoader::new();
    loader.add_source(
        "util",
        "public var version = 1;
         public fun double(x) { return x + x; }",
    );
    loader
}

#[test]
fn test_modules_import_module_binding() {
    let mut loader = loader_with_util();
    loader.add_source(
        "main",
        "import util;
         public var v = util.version;",
    );

    let idx = loader.load("main").unwrap();
    let module = loader.module(idx).unwrap();
    assert_eq!(module.module_names.get("util").copied(), Some(0));

    let disasm = module.disassemble();
    assert!(disasm.contains("GET.MOD"));
}

#[test]
fn test_modules_import_symbols() {
    let mut loader = loader_with_util();
    loader.add_source(
        "main",
        "import util: version, double;
         public var v = double(version);",
    );

    let idx = loader.load("main").unwrap();
    let module = loader.module(idx).unwrap();

    let disasm = module.disassemble();
    assert!(disasm.contains("GET.MOD.ELEM"));
}

#[test]
fn test_modules_import_star() {
    let mut loader = loader_with_util();
    loader.add_source(
        "main",
        "import util.*;
         public var v = double(version);",
    );

    loader.load("main").unwrap();
}

#[test]
fn test_modules_import_single_symbol() {
    let mut loader = loader_with_util();
    loader.add_source(
        "main",
        "import util.version;
         public var v = version;",
    );

    loader.load("main").unwrap();
}

#[test]
fn test_modules_no_such_global() {
    let mut loader = loader_with_util();
    loader.add_source("main", "import util.missing;");

    let err = loader.load("main").unwrap_err();
    assert_eq!(err.kind, ErrorKind::CompileFailed);
    assert_eq!(err.message, "no such global in module");
}

#[test]
fn test_modules_unknown_module() {
    let mut loader = MemoryLoader::new();
    loader.add_source("main", "import nothing;");

    let err = loader.load("main").unwrap_err();
    assert_eq!(err.message, "module \"nothing\" not found");
}

#[test]
fn test_modules_circular_dependencies() {
    let mut loader = MemoryLoader::new();
    loader.add_source("a", "import b; public var x = 1;");
    loader.add_source("b", "import a; public var y = 2;");

    let err = loader.load("a").unwrap_err();
    assert_eq!(
        err.message,
        "circular dependencies detected for module \"a\""
    );

    // No partial module may be registered.
    assert!(loader.module_by_name("a").is_none());
    assert!(loader.module_by_name("b").is_none());
}

#[test]
fn test_modules_diamond_is_allowed() {
    let mut loader = MemoryLoader::new();
    loader.add_source("shared", "public var n = 1;");
    loader.add_source("left", "import shared; public var l = shared.n;");
    loader.add_source("right", "import shared; public var r = shared.n;");
    loader.add_source(
        "main",
        "import left;
         import right;
         public var sum = left.l + right.r;",
    );

    loader.load("main").unwrap();
    assert!(loader.module_by_name("shared").is_some());
}

#[test]
fn test_modules_duplicate_import_is_coalesced() {
    let mut loader = loader_with_util();
    loader.add_source(
        "main",
        "import util;
         import util;
         public var v = util.version;",
    );

    let idx = loader.load("main").unwrap();
    let module = loader.module(idx).unwrap();
    assert_eq!(module.module_names.len(), 1);
}

#[test]
fn test_modules_global_conflict() {
    let mut loader = loader_with_util();

    let source = "import util;";
    let mut unit = CompileUnit::new("main", 1, source);
    unit.predefine_global("util", 0);

    let mut ast = unit.parse().unwrap();
    let err = process_vars(&mut unit, &mut loader, &mut ast).unwrap_err();
    assert_eq!(
        err.message,
        "unable to import module, a global variable with this name already exists"
    );
}

#[test]
fn test_modules_predefined_globals_resolve() {
    let source = "print(1); public var used_print = print;";
    let mut unit = CompileUnit::new("main", 0, source);
    unit.predefine_global("print", 0);

    let mut ast = unit.parse().unwrap();
    let mut driver = kos::NullDriver;
    process_vars(&mut unit, &mut driver, &mut ast).unwrap();
    let (_, module) = unit.compile(&mut ast).unwrap();

    let disasm = module.disassemble();
    assert!(disasm.contains("GET.GLOBAL"));
}

#[test]
fn test_modules_predefined_module_resolves() {
    let mut loader = loader_with_util();
    let util_idx = loader.load("util").unwrap();

    let source = "public var v = util.version;";
    let mut unit = CompileUnit::new("main", 2, source);
    unit.predefine_module("util", util_idx);

    let mut ast = unit.parse().unwrap();
    process_vars(&mut unit, &mut loader, &mut ast).unwrap();
    unit.compile(&mut ast).unwrap();
}

#[test]
fn test_modules_driver_trait_object() {
    // The loader is usable through the trait object boundary the
    // resolver sees.
    let mut loader = loader_with_util();
    let idx = loader.load("util").unwrap();

    let driver: &mut dyn ModuleDriver = &mut loader;
    assert_eq!(driver.resolve_global(idx, "version"), Some(0));
    assert_eq!(driver.resolve_global(idx, "missing"), None);

    let mut names = Vec::new();
    driver.walk_globals(idx, &mut |name, _| names.push(name.to_owned()));
    assert_eq!(names, vec!["version".to_owned(), "double".to_owned()]);
}

#[test]
fn test_modules_interactive_options_propagate() {
    let mut loader = MemoryLoader::with_options(CompileOptions {
        interactive: true,
        ..CompileOptions::default()
    });
    loader.add_source("session", "var x = 42;");

    let idx = loader.load("session").unwrap();
    let module = loader.module(idx).unwrap();
    assert!(module.global_names.contains_key("x"));
}
