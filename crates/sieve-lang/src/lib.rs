//! Lexer and parser for the Sieve filtering language (RFC 5228).
//!
//! The grammar here is purely syntactic: any identifier parses as a
//! command or test, and argument lists are collected without knowledge
//! of which command accepts what. Semantic checks happen in the
//! validator, which consumes the [`sieve_ast::Script`] produced here.

pub mod lexer;
mod parse;

pub use parse::{parse_script, ParseError, ParseErrorKind};
