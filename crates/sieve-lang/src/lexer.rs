use logos::{Lexer, Logos};

/// Sieve script tokens (RFC 5228 §8.1).
///
/// Identifiers and tags are case-insensitive and are lowercased here so
/// later stages can compare them exactly. Comments and whitespace are
/// consumed by the lexer.
#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"#[^\n]*", skip r"/\*[^*]*\*+([^*/][^*]*\*+)*/")]
#[logos(error(LexicalError, LexicalError::from_lexer))]
pub enum Token {
    /// A multi-line string literal. This must precede `Identifier` so
    /// `text:` is not lexed as the identifier `text`.
    #[regex(r"[tT][eE][xX][tT]:", lex_multiline)]
    MultiLine(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_ascii_lowercase())]
    Identifier(String),

    /// A `:tag`, stored without the leading colon.
    #[regex(r":[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice()[1..].to_ascii_lowercase())]
    Tag(String),

    /// A number with an optional `K`/`M`/`G` binary multiplier.
    #[regex(r"[0-9]+[KkMmGg]?", lex_number)]
    Number(u64),

    /// A quoted string with `\` escapes removed.
    #[regex(r#""(?s:[^"\\]|\\.)*""#, lex_quoted)]
    String(String),

    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,
    #[token("[")]
    OpenBracket,
    #[token("]")]
    CloseBracket,
    #[token("{")]
    OpenBrace,
    #[token("}")]
    CloseBrace,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LexicalError {
    #[error("number `{0}` is out of range")]
    NumberOverflow(String),
    #[error("unterminated multi-line string")]
    UnterminatedText,
    #[error("unexpected characters after `text:`")]
    MalformedText,
    #[error("invalid token `{0}`")]
    InvalidToken(char),
    #[default]
    #[error("invalid token")]
    Other,
}

impl LexicalError {
    fn from_lexer(lex: &mut Lexer<'_, Token>) -> Self {
        match lex.slice().chars().next() {
            Some(ch) => LexicalError::InvalidToken(ch),
            None => LexicalError::Other,
        }
    }
}

fn lex_number(lex: &mut Lexer<'_, Token>) -> Result<u64, LexicalError> {
    let slice = lex.slice();
    let overflow = || LexicalError::NumberOverflow(slice.to_owned());
    let (digits, multiplier) = match slice.as_bytes().last() {
        Some(b'K' | b'k') => (&slice[..slice.len() - 1], 1u64 << 10),
        Some(b'M' | b'm') => (&slice[..slice.len() - 1], 1 << 20),
        Some(b'G' | b'g') => (&slice[..slice.len() - 1], 1 << 30),
        _ => (slice, 1),
    };
    let n: u64 = digits.parse().map_err(|_| overflow())?;
    n.checked_mul(multiplier).ok_or_else(overflow)
}

fn lex_quoted(lex: &mut Lexer<'_, Token>) -> String {
    let slice = lex.slice();
    // Strip the surrounding quotes, then resolve `\X` to `X`.
    let mut out = String::with_capacity(slice.len());
    let mut chars = slice[1..slice.len() - 1].chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Consumes a `text:` literal: the rest of the `text:` line, then body
/// lines up to a lone `.` line. Leading dots are unstuffed and line
/// endings normalized to `\n`.
fn lex_multiline(lex: &mut Lexer<'_, Token>) -> Result<String, LexicalError> {
    let rem = lex.remainder();
    let first_nl = rem.find('\n').ok_or(LexicalError::UnterminatedText)?;
    let after_marker = rem[..first_nl].trim_end_matches('\r');
    let trimmed = after_marker.trim_start();
    if !trimmed.is_empty() && !trimmed.starts_with('#') {
        return Err(LexicalError::MalformedText);
    }

    let mut body = String::new();
    let mut pos = first_nl + 1;
    loop {
        let rest = &rem[pos..];
        if rest.is_empty() {
            return Err(LexicalError::UnterminatedText);
        }
        let (line, consumed, terminated) = match rest.find('\n') {
            Some(i) => (&rest[..i], i + 1, true),
            None => (rest, rest.len(), false),
        };
        pos += consumed;
        let line = line.trim_end_matches('\r');
        if line == "." {
            lex.bump(pos);
            return Ok(body);
        }
        if !terminated {
            return Err(LexicalError::UnterminatedText);
        }
        body.push_str(line.strip_prefix('.').unwrap_or(line));
        body.push('\n');
    }
}

/// A token plus the source line it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpannedToken {
    pub token: Token,
    pub line: u32,
}

/// A lexical error located on a source line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error} (line {line})")]
pub struct LexError {
    #[source]
    pub error: LexicalError,
    pub line: u32,
}

/// Tokenizes a complete script, annotating each token with its line.
pub fn tokenize(input: &str) -> Result<Vec<SpannedToken>, LexError> {
    let mut tokens = Vec::new();
    let mut line: u32 = 1;
    let mut scanned = 0usize;
    let mut lexer = Token::lexer(input);
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        // Advance the line counter over everything up to this token.
        line = line.saturating_add(
            u32::try_from(input[scanned..span.start].matches('\n').count()).unwrap_or(u32::MAX),
        );
        scanned = span.start;
        match result {
            Ok(token) => tokens.push(SpannedToken { token, line }),
            Err(error) => return Err(LexError { error, line }),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn basic_tokens() {
        assert_eq!(
            kinds("require \"fileinto\";"),
            vec![
                Token::Identifier("require".into()),
                Token::String("fileinto".into()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn tags_are_lowercased() {
        assert_eq!(
            kinds("header :CONTAINS \"x\""),
            vec![
                Token::Identifier("header".into()),
                Token::Tag("contains".into()),
                Token::String("x".into()),
            ]
        );
    }

    #[test]
    fn numbers_with_multipliers() {
        assert_eq!(kinds("10"), vec![Token::Number(10)]);
        assert_eq!(kinds("100K"), vec![Token::Number(100 << 10)]);
        assert_eq!(kinds("2M"), vec![Token::Number(2 << 20)]);
        assert_eq!(kinds("1G"), vec![Token::Number(1 << 30)]);
    }

    #[test]
    fn number_overflow_is_an_error() {
        let err = tokenize("99999999999999999999").unwrap_err();
        assert!(matches!(err.error, LexicalError::NumberOverflow(_)));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(kinds(r#""a\"b\\c""#), vec![Token::String("a\"b\\c".into())]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("# a comment\nkeep /* inline */ ;"),
            vec![Token::Identifier("keep".into()), Token::Semicolon]
        );
    }

    #[test]
    fn multiline_string() {
        let input = "text:\r\nline one\r\n..stuffed\r\n.\r\nkeep;";
        assert_eq!(
            kinds(input),
            vec![
                Token::MultiLine("line one\n.stuffed\n".into()),
                Token::Identifier("keep".into()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn unterminated_multiline() {
        let err = tokenize("text:\nno terminator").unwrap_err();
        assert_eq!(err.error, LexicalError::UnterminatedText);
    }

    #[test]
    fn line_numbers() {
        let toks = tokenize("keep;\nstop;\n").unwrap();
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[2].line, 2);
    }
}
