//! Address parts: which piece of an address a test matches against.

use crate::{address::Address, named::Named};

/// Object code of `:all`.
pub const AP_ALL: u32 = 0;
/// Object code of `:localpart`.
pub const AP_LOCALPART: u32 = 1;
/// Object code of `:domain`.
pub const AP_DOMAIN: u32 = 2;

/// Projects an address onto the part a test matches. Returning `None`
/// skips the address (e.g. `:domain` on a domainless address).
pub trait AddressPart: Send + Sync {
    /// The tag name without the colon, e.g. `localpart`.
    fn name(&self) -> &'static str;

    /// Object code within the address-part class.
    fn code(&self) -> u32;

    /// Name of the owning extension; `None` for core address parts.
    fn owner(&self) -> Option<&'static str> {
        None
    }

    /// The part of `addr` to match, or `None` to skip it.
    fn extract(&self, addr: &Address) -> Option<String>;
}

impl Named for dyn AddressPart {
    fn name(&self) -> &str {
        AddressPart::name(self)
    }
}

/// `:all`: the whole `local@domain`.
#[derive(Debug)]
pub struct AllPart;

impl AddressPart for AllPart {
    fn name(&self) -> &'static str {
        "all"
    }

    fn code(&self) -> u32 {
        AP_ALL
    }

    fn extract(&self, addr: &Address) -> Option<String> {
        Some(addr.full())
    }
}

/// `:localpart`: the part before the `@`.
#[derive(Debug)]
pub struct LocalPart;

impl AddressPart for LocalPart {
    fn name(&self) -> &'static str {
        "localpart"
    }

    fn code(&self) -> u32 {
        AP_LOCALPART
    }

    fn extract(&self, addr: &Address) -> Option<String> {
        Some(addr.local.clone())
    }
}

/// `:domain`: the part after the `@`.
#[derive(Debug)]
pub struct DomainPart;

impl AddressPart for DomainPart {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn code(&self) -> u32 {
        AP_DOMAIN
    }

    fn extract(&self, addr: &Address) -> Option<String> {
        addr.domain.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        Address {
            local: "root".into(),
            domain: Some("host".into()),
        }
    }

    #[test]
    fn parts() {
        assert_eq!(AllPart.extract(&addr()).as_deref(), Some("root@host"));
        assert_eq!(LocalPart.extract(&addr()).as_deref(), Some("root"));
        assert_eq!(DomainPart.extract(&addr()).as_deref(), Some("host"));
    }

    #[test]
    fn domain_of_domainless_is_skipped() {
        let a = Address {
            local: "MAILER-DAEMON".into(),
            domain: None,
        };
        assert_eq!(DomainPart.extract(&a), None);
        assert_eq!(AllPart.extract(&a).as_deref(), Some("MAILER-DAEMON"));
    }
}
