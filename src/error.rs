//! Module containing error definitions for the compilation pipeline.

use crate::token::Position;
use std::borrow::Cow;
use std::fmt;

/// Classification of a compilation error.
///
/// Every pass produces at most one error; the first failure aborts the
/// remainder of the compilation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The lexer could not form a token.
    ScanningFailed,
    /// The parser could not derive a statement or expression.
    ParseFailed,
    /// The resolver, optimizer or code generator rejected the program.
    CompileFailed,
    /// An internal invariant was violated.
    Internal,
    /// An allocation or buffer growth failed.
    OutOfMemory,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ScanningFailed => "scanning failed",
            Self::ParseFailed => "parse failed",
            Self::CompileFailed => "compile failed",
            Self::Internal => "internal error",
            Self::OutOfMemory => "out of memory",
        })
    }
}

/// An error produced while compiling one module.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{pos}: error: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Cow<'static, str>,
    pub pos: Position,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>, pos: Position) -> Self {
        Self {
            kind,
            message: message.into(),
            pos,
        }
    }

    /// Lexer error at a position.
    #[must_use]
    pub fn scanning(message: impl Into<Cow<'static, str>>, pos: Position) -> Self {
        Self::new(ErrorKind::ScanningFailed, message, pos)
    }

    /// Parser error at a position.
    #[must_use]
    pub fn parse(message: impl Into<Cow<'static, str>>, pos: Position) -> Self {
        Self::new(ErrorKind::ParseFailed, message, pos)
    }

    /// Resolver/optimizer/codegen error at a position.
    #[must_use]
    pub fn compile(message: impl Into<Cow<'static, str>>, pos: Position) -> Self {
        Self::new(ErrorKind::CompileFailed, message, pos)
    }

    /// Invariant violation.
    #[must_use]
    pub fn internal(message: impl Into<Cow<'static, str>>, pos: Position) -> Self {
        Self::new(ErrorKind::Internal, message, pos)
    }

    /// Render the error the way the command-line driver prints it:
    /// `<filename>:<line>:<column>: error: <message>`, followed by the
    /// offending source line and a caret column marker.
    #[must_use]
    pub fn render(&self, filename: &str, source: &str) -> String {
        render_diagnostic(filename, source, self.pos, "error", &self.message)
    }
}

/// A non-fatal diagnostic, e.g. a `main` declaration that is not `public`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub message: Cow<'static, str>,
    pub pos: Position,
}

impl Warning {
    #[must_use]
    pub fn new(message: impl Into<Cow<'static, str>>, pos: Position) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }

    /// Render like [`Error::render`], with `warning:` in place of `error:`.
    #[must_use]
    pub fn render(&self, filename: &str, source: &str) -> String {
        render_diagnostic(filename, source, self.pos, "warning", &self.message)
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: warning: {}", self.pos, self.message)
    }
}

fn render_diagnostic(
    filename: &str,
    source: &str,
    pos: Position,
    severity: &str,
    message: &str,
) -> String {
    use fmt::Write;

    let mut out = String::new();
    let _ = write!(
        out,
        "{}:{}:{}: {}: {}",
        filename, pos.line, pos.column, severity, message
    );

    if pos.line > 0 {
        if let Some(line) = source.lines().nth(pos.line as usize - 1) {
            let _ = write!(out, "\n{}\n", line);
            for _ in 1..pos.column {
                out.push(' ');
            }
            out.push('^');
        }
    }

    out
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_points_at_column() {
        let err = Error::compile("undeclared identifier", Position::new(1, 5));
        let text = err.render("test.kos", "a = b;\n");
        assert_eq!(
            text,
            "test.kos:1:5: error: undeclared identifier\na = b;\n    ^"
        );
    }
}
