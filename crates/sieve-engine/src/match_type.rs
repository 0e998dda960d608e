//! Match types and the per-test match context.

use std::any::Any;

use crate::{comparator::Comparator, named::Named};

/// Object code of `:is`.
pub const MT_IS: u32 = 0;
/// Object code of `:contains`.
pub const MT_CONTAINS: u32 = 1;
/// Object code of `:matches`.
pub const MT_MATCHES: u32 = 2;

/// A match type decides how values are matched against a key list.
///
/// Accumulating match types (a relational `:count`, say) carry state in
/// the opaque `state` value created by [`MatchType::init`] and deliver
/// their verdict from [`MatchType::finalize`]; the built-in types are
/// stateless and verdict per value.
pub trait MatchType: Send + Sync {
    /// The tag name without the colon, e.g. `contains`.
    fn name(&self) -> &'static str;

    /// Object code within the match-type class.
    fn code(&self) -> u32;

    /// Name of the owning extension; `None` for core match types.
    fn owner(&self) -> Option<&'static str> {
        None
    }

    /// Creates the per-test accumulator state.
    fn init(&self) -> Box<dyn Any + Send> {
        Box::new(())
    }

    /// Matches one value; `true` short-circuits the surrounding test.
    fn matches(
        &self,
        cmp: &dyn Comparator,
        keys: &[String],
        state: &mut dyn Any,
        value: &str,
    ) -> bool;

    /// Final verdict after all values were seen.
    fn finalize(&self, cmp: &dyn Comparator, keys: &[String], state: &mut dyn Any) -> bool {
        let _ = (cmp, keys, state);
        false
    }
}

impl Named for dyn MatchType {
    fn name(&self) -> &str {
        MatchType::name(self)
    }
}

/// Streaming state for one test: the selected comparator and match
/// type, the key list, and the match type's accumulator.
pub struct MatchContext<'a> {
    comparator: &'a dyn Comparator,
    match_type: &'a dyn MatchType,
    keys: &'a [String],
    state: Box<dyn Any + Send>,
}

impl<'a> MatchContext<'a> {
    /// Begins matching the given key list.
    pub fn begin(
        match_type: &'a dyn MatchType,
        comparator: &'a dyn Comparator,
        keys: &'a [String],
    ) -> Self {
        Self {
            comparator,
            match_type,
            keys,
            state: match_type.init(),
        }
    }

    /// Feeds one value.
    pub fn value(&mut self, value: &str) -> bool {
        self.match_type
            .matches(self.comparator, self.keys, self.state.as_mut(), value)
    }

    /// Delivers the final verdict for accumulating match types.
    pub fn finish(mut self) -> bool {
        self.match_type
            .finalize(self.comparator, self.keys, self.state.as_mut())
    }
}

/// `:is`: exact match against any key.
#[derive(Debug)]
pub struct IsMatch;

impl MatchType for IsMatch {
    fn name(&self) -> &'static str {
        "is"
    }

    fn code(&self) -> u32 {
        MT_IS
    }

    fn matches(
        &self,
        cmp: &dyn Comparator,
        keys: &[String],
        _state: &mut dyn Any,
        value: &str,
    ) -> bool {
        keys.iter().any(|k| cmp.equals(value, k))
    }
}

/// `:contains`: any key occurs as a substring of the value.
#[derive(Debug)]
pub struct ContainsMatch;

impl MatchType for ContainsMatch {
    fn name(&self) -> &'static str {
        "contains"
    }

    fn code(&self) -> u32 {
        MT_CONTAINS
    }

    fn matches(
        &self,
        cmp: &dyn Comparator,
        keys: &[String],
        _state: &mut dyn Any,
        value: &str,
    ) -> bool {
        keys.iter().any(|k| cmp.contains(value, k))
    }
}

/// `:matches`: any key, read as a glob pattern, matches the value.
#[derive(Debug)]
pub struct MatchesMatch;

impl MatchType for MatchesMatch {
    fn name(&self) -> &'static str {
        "matches"
    }

    fn code(&self) -> u32 {
        MT_MATCHES
    }

    fn matches(
        &self,
        cmp: &dyn Comparator,
        keys: &[String],
        _state: &mut dyn Any,
        value: &str,
    ) -> bool {
        keys.iter().any(|k| glob_match(cmp, k, value))
    }
}

/// Matches `value` against a Sieve glob: `*` any sequence, `?` exactly
/// one character, `\` escapes the next character.
pub fn glob_match(cmp: &dyn Comparator, pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    let mut pi = 0;
    let mut vi = 0;
    // Position after the most recent `*` and the value index it was
    // tried at, for backtracking.
    let mut star: Option<(usize, usize)> = None;

    while vi < v.len() {
        match p.get(pi) {
            Some(&'*') => {
                star = Some((pi + 1, vi));
                pi += 1;
            }
            Some(&'?') => {
                pi += 1;
                vi += 1;
            }
            other => {
                let lit = match other {
                    Some(&'\\') => match p.get(pi + 1) {
                        Some(&esc) => Some((esc, 2)),
                        None => Some(('\\', 1)),
                    },
                    Some(&c) => Some((c, 1)),
                    None => None,
                };
                match lit {
                    Some((c, width)) if cmp.char_eq(c, v[vi]) => {
                        pi += width;
                        vi += 1;
                    }
                    _ => match star {
                        Some((sp, sv)) => {
                            pi = sp;
                            vi = sv + 1;
                            star = Some((sp, sv + 1));
                        }
                        None => return false,
                    },
                }
            }
        }
    }
    while p.get(pi) == Some(&'*') {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{AsciiCasemapComparator, OctetComparator};

    fn glob(pattern: &str, value: &str) -> bool {
        glob_match(&OctetComparator, pattern, value)
    }

    #[test]
    fn glob_literals() {
        assert!(glob("abc", "abc"));
        assert!(!glob("abc", "abd"));
        assert!(!glob("abc", "abcd"));
    }

    #[test]
    fn glob_star() {
        assert!(glob("Re: *", "Re: hello"));
        assert!(glob("Re: *", "Re: "));
        assert!(glob("*@*", "user@example.com"));
        assert!(glob("a*b*c", "axxbyyc"));
        assert!(!glob("a*b*c", "axxbyy"));
        assert!(glob("*", ""));
    }

    #[test]
    fn glob_question() {
        assert!(glob("h?llo", "hello"));
        assert!(!glob("h?llo", "hllo"));
    }

    #[test]
    fn glob_escapes() {
        assert!(glob(r"100\% done", "100% done"));
        assert!(glob(r"\*literal\*", "*literal*"));
        assert!(!glob(r"\*", "x"));
        // A trailing backslash matches itself.
        assert!(glob("x\\", "x\\"));
    }

    #[test]
    fn glob_backtracking() {
        assert!(glob("*aab", "aaab"));
        assert!(glob("*ab*ab", "ababab"));
        assert!(!glob("*x", "aaay"));
    }

    #[test]
    fn glob_uses_comparator() {
        assert!(glob_match(&AsciiCasemapComparator, "re: *", "RE: hi"));
        assert!(!glob_match(&OctetComparator, "re: *", "RE: hi"));
    }

    #[test]
    fn match_context_is() {
        let keys = vec!["Hi".to_owned()];
        let mut ctx = MatchContext::begin(&IsMatch, &AsciiCasemapComparator, &keys);
        assert!(!ctx.value("Hello"));
        assert!(ctx.value("hi"));
        assert!(!ctx.finish());
    }

    #[test]
    fn match_context_contains() {
        let keys = vec!["spam".to_owned()];
        let mut ctx = MatchContext::begin(&ContainsMatch, &AsciiCasemapComparator, &keys);
        assert!(ctx.value("X-SPAM-Status"));
    }
}
