//! A small RFC 5322 address-list parser.
//!
//! This covers what the `address` test and the vacation guards need:
//! display names, angle-addr forms, quoted local parts, comments, and
//! groups (flattened to their members). Anything unparsable is skipped
//! rather than failing the test.

/// One parsed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// The local part, unquoted.
    pub local: String,
    /// The domain, when present.
    pub domain: Option<String>,
}

impl Address {
    /// The full `local@domain` form, or just the local part for
    /// addresses without a domain.
    pub fn full(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{}", self.local, domain),
            None => self.local.clone(),
        }
    }
}

/// Parses a header value as an address list.
pub fn parse_addresses(header: &str) -> Vec<Address> {
    let stripped = strip_comments(header);
    split_list(&stripped)
        .into_iter()
        .filter_map(|mailbox| parse_mailbox(&mailbox))
        .collect()
}

/// True when `header`, parsed as an address list, contains `needle`
/// (compared as full `local@domain`, ASCII case-insensitive in the
/// domain, exact in the local part).
pub fn list_contains(header: &str, needle: &str) -> bool {
    let needle = needle.trim();
    parse_addresses(header).iter().any(|a| {
        let full = a.full();
        match (full.rsplit_once('@'), needle.rsplit_once('@')) {
            (Some((al, ad)), Some((nl, nd))) => al == nl && ad.eq_ignore_ascii_case(nd),
            _ => full == needle,
        }
    })
}

/// Removes `(comments)`, which may nest, outside quoted strings.
fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    let mut quoted = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if depth == 0 {
                    out.push(c);
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
            }
            '"' if depth == 0 => {
                quoted = !quoted;
                out.push(c);
            }
            '(' if !quoted => depth += 1,
            ')' if !quoted && depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Splits an address list on top-level `,`, flattening `group: ... ;`
/// syntax to its members.
fn split_list(s: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_angle = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            '<' if !quoted => {
                in_angle = true;
                current.push(c);
            }
            '>' if !quoted => {
                in_angle = false;
                current.push(c);
            }
            ',' | ';' if !quoted && !in_angle => {
                items.push(std::mem::take(&mut current));
            }
            // A group display name ends at a top-level colon; drop it.
            ':' if !quoted && !in_angle => current.clear(),
            _ => current.push(c),
        }
    }
    items.push(current);
    items.retain(|i| !i.trim().is_empty());
    items
}

/// Parses one mailbox: `display <addr-spec>` or a bare `addr-spec`.
fn parse_mailbox(mailbox: &str) -> Option<Address> {
    let mailbox = mailbox.trim();
    let spec = match (mailbox.rfind('<'), mailbox.rfind('>')) {
        (Some(open), Some(close)) if open < close => &mailbox[open + 1..close],
        _ => mailbox,
    };
    parse_addr_spec(spec)
}

fn parse_addr_spec(spec: &str) -> Option<Address> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    let at = find_top_level_at(spec);
    let (local_raw, domain) = match at {
        Some(i) => (&spec[..i], Some(spec[i + 1..].trim().to_owned())),
        None => (spec, None),
    };
    if let Some(d) = &domain {
        if d.is_empty() {
            return None;
        }
    }
    let local = unquote_local(local_raw.trim());
    if local.is_empty() {
        return None;
    }
    Some(Address { local, domain })
}

/// The position of the `@` separating local part from domain, ignoring
/// any `@` inside a quoted local part.
fn find_top_level_at(s: &str) -> Option<usize> {
    let mut quoted = false;
    let mut skip = false;
    for (i, c) in s.char_indices() {
        if skip {
            skip = false;
            continue;
        }
        match c {
            '\\' if quoted => skip = true,
            '"' => quoted = !quoted,
            '@' if !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

fn unquote_local(local: &str) -> String {
    let Some(inner) = local.strip_prefix('"').and_then(|s| s.strip_suffix('"')) else {
        return local.to_owned();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
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

#[cfg(test)]
mod tests {
    use super::*;

    fn one(s: &str) -> Address {
        let mut addrs = parse_addresses(s);
        assert_eq!(addrs.len(), 1, "expected one address in {s:?}");
        addrs.remove(0)
    }

    #[test]
    fn bare_addr_spec() {
        let a = one("user@example.com");
        assert_eq!(a.local, "user");
        assert_eq!(a.domain.as_deref(), Some("example.com"));
        assert_eq!(a.full(), "user@example.com");
    }

    #[test]
    fn display_name_and_angles() {
        let a = one("Root <root@host>");
        assert_eq!(a.local, "root");
        assert_eq!(a.domain.as_deref(), Some("host"));
    }

    #[test]
    fn list_of_addresses() {
        let addrs = parse_addresses("a@x.test, B <b@y.test>");
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].full(), "b@y.test");
    }

    #[test]
    fn display_name_with_comma() {
        let a = one(r#""Last, First" <lf@example.com>"#);
        assert_eq!(a.full(), "lf@example.com");
    }

    #[test]
    fn quoted_local_part() {
        let a = one(r#""odd local"@example.com"#);
        assert_eq!(a.local, "odd local");
    }

    #[test]
    fn comments_are_ignored() {
        let a = one("user(away)@example.com (work)");
        assert_eq!(a.full(), "user@example.com");
    }

    #[test]
    fn groups_are_flattened() {
        let addrs = parse_addresses("friends: a@x.test, b@y.test;, c@z.test");
        let fulls: Vec<_> = addrs.iter().map(Address::full).collect();
        assert_eq!(fulls, ["a@x.test", "b@y.test", "c@z.test"]);
    }

    #[test]
    fn empty_group() {
        assert!(parse_addresses("undisclosed-recipients:;").is_empty());
    }

    #[test]
    fn address_without_domain() {
        let a = one("MAILER-DAEMON");
        assert_eq!(a.local, "MAILER-DAEMON");
        assert_eq!(a.domain, None);
    }

    #[test]
    fn list_contains_is_domain_case_insensitive() {
        assert!(list_contains("Root <root@HOST.test>", "root@host.test"));
        assert!(!list_contains("Root <root@host.test>", "ROOT@host.test"));
    }
}
