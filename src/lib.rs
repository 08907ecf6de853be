//! # Kos front-end compiler
//!
//! Kos is a dynamically-typed scripting language with lexical scoping,
//! first-class functions, closures, generators, classes with single
//! inheritance, exceptions with `try`/`catch`/`defer`, and a module
//! system. This crate implements its front end: source text goes in,
//! and a loadable module object comes out, carrying bytecode, a
//! constant pool, a global-name table and debug line information.
//!
//! The pipeline has four stages sharing one compilation unit:
//!
//! 1. the lexer turns bytes into tokens,
//! 2. the parser builds an AST by recursive descent,
//! 3. the resolver binds every identifier and records closure captures,
//! 4. the optimizer folds constants to a fixed point, after which
//!    registers are allocated and bytecode is emitted.
//!
//! # A quick example
//!
//! ```
//! let module = kos::compile("example.kos", "public fun main { return 0; }")?;
//!
//! assert!(!module.bytecode.is_empty());
//! assert!(module.global_names.contains_key("main"));
//! # Ok::<(), kos::Error>(())
//! ```
//!
//! Scripts that import other modules compile through a
//! [`ModuleDriver`]; [`MemoryLoader`] is an in-memory implementation
//! that recursively compiles registered sources and rejects circular
//! imports.

mod ast;
mod bytecode;
mod codegen;
mod constants;
mod error;
mod module;
mod optimize;
mod parse;
mod resolve;
mod scope;
mod token;

/// Identifier text; most identifiers are short and ASCII, so a small
/// string avoids heap traffic.
pub type Identifier = smartstring::SmartString<smartstring::LazyCompact>;

pub use ast::{Annot, AstNode, NodeKind, VarRef};
pub use bytecode::{
    decode_instr, disassemble, format_instr, instructions, DecodedInstr, Opcode,
};
pub use constants::{
    CompFunction, ConstPool, Constant, FUN_CLASS, FUN_CLOSURE, FUN_ELLIPSIS, FUN_GENERATOR,
};
pub use error::{Error, ErrorKind, Result, Warning};
pub use module::{
    compile, compile_with_driver, compile_with_options, CompileOptions, CompileUnit,
    CompiledModule, LineAddr, MemoryLoader, ModuleDriver, NullDriver, MAX_ARGS_IN_REGS,
    MAX_MODULES,
};
pub use optimize::{allocate_args, optimize};
pub use parse::{Parser, DEFAULT_MAX_AST_DEPTH};
pub use resolve::process_vars;
pub use scope::{
    CatchRef, FrameData, ScopeData, ScopeId, ScopeRef, VarActivation, VarData, VarId, VarKind,
};
pub use token::{
    parse_numeric, Keyword, Lexer, NextTokenMode, Numeric, Op, Position, Sep, Span,
    StringEscape, Token, TokenKind, MAX_TOKEN_LEN,
};
