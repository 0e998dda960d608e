use core::fmt::{self, Display};

/// A complete script: a sequence of commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Script {
    /// The top-level commands, in source order.
    pub commands: Vec<CommandNode>,
}

/// One command or test occurrence.
///
/// Commands and tests share a shape: `identifier argument* (test |
/// test-list)? (';' | block)`. Whether tests or a block are permitted is
/// a semantic question answered by the validator, not the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandNode {
    /// The command identifier, lowercased (Sieve identifiers are
    /// case-insensitive).
    pub identifier: String,
    /// Literal and tagged arguments, in source order.
    pub arguments: Vec<Argument>,
    /// Subtests, from either a bare test or a parenthesized test list.
    pub tests: Vec<CommandNode>,
    /// The `{ ... }` block, when present.
    pub block: Option<Vec<CommandNode>>,
    /// Source line of the command identifier.
    pub line: u32,
}

impl CommandNode {
    /// Creates a command node with no arguments, subtests, or block.
    pub fn new(identifier: impl Into<String>, line: u32) -> Self {
        Self {
            identifier: identifier.into(),
            arguments: Vec::new(),
            tests: Vec::new(),
            block: None,
            line,
        }
    }
}

/// One argument with its source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub value: ArgValue,
    pub line: u32,
}

impl Argument {
    pub fn new(value: ArgValue, line: u32) -> Self {
        Self { value, line }
    }
}

/// An argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// A quoted or multi-line string literal.
    String(String),
    /// A number literal, with any `K`/`M`/`G` multiplier applied.
    Number(u64),
    /// A bracketed string list.
    StringList(Vec<String>),
    /// A `:tag`, stored without the leading colon, lowercased.
    Tag(String),
}

impl ArgValue {
    /// A short name for the argument's type, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::StringList(_) => "string list",
            Self::Tag(_) => "tag",
        }
    }
}

impl Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Number(n) => write!(f, "{n}"),
            Self::StringList(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "\"{item}\"")?;
                }
                f.write_str("]")
            }
            Self::Tag(t) => write!(f, ":{t}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_value_display() {
        assert_eq!(ArgValue::String("x".into()).to_string(), "\"x\"");
        assert_eq!(ArgValue::Number(7).to_string(), "7");
        assert_eq!(ArgValue::Tag("contains".into()).to_string(), ":contains");
        assert_eq!(
            ArgValue::StringList(vec!["a".into(), "b".into()]).to_string(),
            "[\"a\", \"b\"]"
        );
    }
}
