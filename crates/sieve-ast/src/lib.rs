//! AST types for the Sieve filtering language (RFC 5228).
//!
//! The tree produced by the parser is deliberately ignorant of command
//! semantics: every command and test is a [`CommandNode`] with a name, a
//! flat argument list, optional subtests, and an optional block. The
//! validator resolves names against registered command descriptors and
//! type-checks the arguments.

mod ast;

pub use ast::*;
