use sieve_ast::{ArgValue, Argument, CommandNode, Script};

use crate::lexer::{self, LexicalError, SpannedToken, Token};

/// What went wrong while parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error(transparent)]
    Lexical(LexicalError),
    #[error("expected {expected}, found {found}")]
    Unexpected {
        expected: &'static str,
        found: String,
    },
    #[error("unexpected end of script, expected {expected}")]
    UnexpectedEnd { expected: &'static str },
}

/// A syntax error with the source line it occurred on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} (line {line})")]
pub struct ParseError {
    #[source]
    pub kind: ParseErrorKind,
    pub line: u32,
}

/// Parses a complete Sieve script into its AST.
pub fn parse_script(input: &str) -> Result<Script, ParseError> {
    let tokens = lexer::tokenize(input).map_err(|e| ParseError {
        kind: ParseErrorKind::Lexical(e.error),
        line: e.line,
    })?;
    let mut parser = Parser { tokens, pos: 0 };
    let commands = parser.commands(false)?;
    Ok(Script { commands })
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn err(&self, expected: &'static str) -> ParseError {
        match self.peek() {
            Some(t) => ParseError {
                kind: ParseErrorKind::Unexpected {
                    expected,
                    found: describe(&t.token),
                },
                line: t.line,
            },
            None => ParseError {
                kind: ParseErrorKind::UnexpectedEnd { expected },
                line: self.tokens.last().map_or(1, |t| t.line),
            },
        }
    }

    /// Parses commands until end of input, or until the closing brace
    /// of a block when `in_block` is set.
    fn commands(&mut self, in_block: bool) -> Result<Vec<CommandNode>, ParseError> {
        let mut commands = Vec::new();
        loop {
            match self.peek() {
                None if in_block => return Err(self.err("`}`")),
                None => return Ok(commands),
                Some(t) if in_block && t.token == Token::CloseBrace => {
                    self.bump();
                    return Ok(commands);
                }
                Some(_) => commands.push(self.command()?),
            }
        }
    }

    fn command(&mut self) -> Result<CommandNode, ParseError> {
        let mut node = self.command_head("command")?;
        match self.peek().map(|t| &t.token) {
            Some(Token::OpenBrace) => {
                self.bump();
                node.block = Some(self.commands(true)?);
            }
            Some(Token::Semicolon) => self.bump(),
            _ => return Err(self.err("`;` or `{`")),
        }
        Ok(node)
    }

    /// Parses `identifier argument* (test | test-list)?`, the part a
    /// command and a test have in common.
    fn command_head(&mut self, what: &'static str) -> Result<CommandNode, ParseError> {
        let (identifier, line) = match self.peek() {
            Some(SpannedToken {
                token: Token::Identifier(id),
                line,
            }) => (id.clone(), *line),
            _ => return Err(self.err(what)),
        };
        self.bump();
        let mut node = CommandNode::new(identifier, line);

        loop {
            match self.peek().map(|t| (t.token.clone(), t.line)) {
                Some((Token::String(s) | Token::MultiLine(s), line)) => {
                    self.bump();
                    node.arguments.push(Argument::new(ArgValue::String(s), line));
                }
                Some((Token::Number(n), line)) => {
                    self.bump();
                    node.arguments.push(Argument::new(ArgValue::Number(n), line));
                }
                Some((Token::Tag(t), line)) => {
                    self.bump();
                    node.arguments.push(Argument::new(ArgValue::Tag(t), line));
                }
                Some((Token::OpenBracket, line)) => {
                    self.bump();
                    let list = self.string_list()?;
                    node.arguments.push(Argument::new(ArgValue::StringList(list), line));
                }
                Some((Token::Identifier(_), _)) => {
                    node.tests.push(self.command_head("test")?);
                    break;
                }
                Some((Token::OpenParen, _)) => {
                    self.bump();
                    loop {
                        node.tests.push(self.command_head("test")?);
                        match self.peek().map(|t| &t.token) {
                            Some(Token::Comma) => self.bump(),
                            Some(Token::CloseParen) => {
                                self.bump();
                                break;
                            }
                            _ => return Err(self.err("`,` or `)`")),
                        }
                    }
                    break;
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn string_list(&mut self) -> Result<Vec<String>, ParseError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(SpannedToken {
                    token: Token::String(s) | Token::MultiLine(s),
                    ..
                }) => {
                    items.push(s.clone());
                    self.bump();
                }
                _ => return Err(self.err("string")),
            }
            match self.peek().map(|t| &t.token) {
                Some(Token::Comma) => self.bump(),
                Some(Token::CloseBracket) => {
                    self.bump();
                    return Ok(items);
                }
                _ => return Err(self.err("`,` or `]`")),
            }
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Identifier(s) => format!("`{s}`"),
        Token::Tag(t) => format!("`:{t}`"),
        Token::Number(n) => format!("`{n}`"),
        Token::String(_) | Token::MultiLine(_) => "string".into(),
        Token::Semicolon => "`;`".into(),
        Token::Comma => "`,`".into(),
        Token::OpenParen => "`(`".into(),
        Token::CloseParen => "`)`".into(),
        Token::OpenBracket => "`[`".into(),
        Token::CloseBracket => "`]`".into(),
        Token::OpenBrace => "`{`".into(),
        Token::CloseBrace => "`}`".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_action() -> anyhow::Result<()> {
        let script = parse_script("keep;")?;
        assert_eq!(script.commands.len(), 1);
        assert_eq!(script.commands[0].identifier, "keep");
        Ok(())
    }

    #[test]
    fn require_with_list() -> anyhow::Result<()> {
        let script = parse_script(r#"require ["fileinto", "vacation"];"#)?;
        assert_eq!(
            script.commands[0].arguments,
            vec![Argument::new(
                ArgValue::StringList(vec!["fileinto".into(), "vacation".into()]),
                1
            )]
        );
        Ok(())
    }

    #[test]
    fn if_with_test_and_block() -> anyhow::Result<()> {
        let script = parse_script(
            r#"if header :is "Subject" "Hi" { fileinto "INBOX.Greetings"; }"#,
        )?;
        let cmd = &script.commands[0];
        assert_eq!(cmd.identifier, "if");
        assert_eq!(cmd.tests.len(), 1);
        let test = &cmd.tests[0];
        assert_eq!(test.identifier, "header");
        assert_eq!(test.arguments.len(), 3);
        assert_eq!(test.arguments[0].value, ArgValue::Tag("is".into()));
        let block = cmd.block.as_ref().unwrap();
        assert_eq!(block[0].identifier, "fileinto");
        Ok(())
    }

    #[test]
    fn nested_test_list() -> anyhow::Result<()> {
        let script = parse_script(
            r#"if anyof (header :contains "X-Spam" "YES", size :over 100K) { discard; stop; }"#,
        )?;
        let cmd = &script.commands[0];
        let anyof = &cmd.tests[0];
        assert_eq!(anyof.identifier, "anyof");
        assert_eq!(anyof.tests.len(), 2);
        assert_eq!(anyof.tests[1].identifier, "size");
        assert_eq!(anyof.tests[1].arguments[1].value, ArgValue::Number(100 << 10));
        Ok(())
    }

    #[test]
    fn not_takes_a_bare_test() -> anyhow::Result<()> {
        let script = parse_script(r#"if not exists "X-Caffeine" { keep; }"#)?;
        let not = &script.commands[0].tests[0];
        assert_eq!(not.identifier, "not");
        assert_eq!(not.tests[0].identifier, "exists");
        Ok(())
    }

    #[test]
    fn elsif_chain_parses_as_siblings() -> anyhow::Result<()> {
        let script = parse_script(
            r#"if true { keep; } elsif false { discard; } else { stop; }"#,
        )?;
        let names: Vec<_> = script.commands.iter().map(|c| c.identifier.as_str()).collect();
        assert_eq!(names, ["if", "elsif", "else"]);
        Ok(())
    }

    #[test]
    fn missing_semicolon() {
        let err = parse_script("keep").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedEnd { .. }));
    }

    #[test]
    fn empty_string_list_rejected() {
        let err = parse_script("require [];").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::Unexpected { .. }));
    }

    #[test]
    fn unclosed_block() {
        let err = parse_script("if true { keep;").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedEnd { .. }));
    }
}
