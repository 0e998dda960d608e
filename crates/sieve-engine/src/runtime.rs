//! Host-facing runtime interfaces: the message under delivery and the
//! capabilities the host lends to the engine for one script run.

use std::{
    any::Any,
    collections::HashMap,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// A failure from the mail storage abstraction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mail access failed: {0}")]
pub struct MailError(pub String);

/// Read access to the message being filtered.
///
/// Headers are keyed case-insensitively by the implementation. The
/// `_utf8` variant returns MIME-decoded header values; hosts without a
/// decoder may return the raw values.
pub trait Mail {
    /// All values of the named header, in message order.
    fn get_headers(&self, name: &str) -> Result<Vec<String>, MailError>;

    /// All values of the named header, MIME-decoded to UTF-8.
    fn get_headers_utf8(&self, name: &str) -> Result<Vec<String>, MailError>;

    /// The first value of the named header.
    fn get_first_header(&self, name: &str) -> Result<Option<String>, MailError> {
        Ok(self.get_headers(name)?.into_iter().next())
    }

    /// The message size in bytes (`RFC822.SIZE`).
    fn get_size(&self) -> u64;

    /// Streams the raw message, for forwarding.
    fn write_to(&self, out: &mut dyn Write) -> Result<(), MailError>;
}

/// The message under delivery. Immutable during a run.
pub struct MessageData<'a> {
    /// The message itself.
    pub mail: &'a dyn Mail,
    /// Envelope sender (return path). `None` or empty means the null
    /// sender `<>`.
    pub return_path: Option<String>,
    /// Envelope recipient being delivered to.
    pub to_address: Option<String>,
    /// The authenticated user submitting the message, if any.
    pub auth_user: Option<String>,
    /// The `Message-ID` value.
    pub id: Option<String>,
}

/// Failure delivering to a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery to `{mailbox}` failed: {reason}")]
pub struct StoreError {
    pub mailbox: String,
    pub reason: String,
    /// Whether retrying later may succeed.
    pub temporary: bool,
}

/// Mail storage, consumed by keep and fileinto.
pub trait MailStore {
    /// Delivers the current message into `mailbox` with the given IMAP
    /// flags.
    fn store(&self, mailbox: &str, flags: &[String]) -> Result<(), StoreError>;
}

/// Failure opening or closing an SMTP session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("smtp failed: {0}")]
pub struct SmtpError(pub String);

/// One outgoing SMTP message. The engine writes the RFC 5322 payload
/// through [`Write`], then closes the session to submit it.
pub trait SmtpSession: Write {
    /// Submits the message.
    fn close(self: Box<Self>) -> Result<(), SmtpError>;
}

/// Outgoing mail transport, consumed by redirect and vacation.
pub trait SmtpTransport {
    /// Opens a session to `destination` with the given envelope sender
    /// (`None` = null sender).
    fn open(
        &self,
        destination: &str,
        return_path: Option<&str>,
    ) -> Result<Box<dyn SmtpSession + '_>, SmtpError>;
}

/// Persistent duplicate-tracking store, consumed by vacation and the
/// duplicate test.
pub trait DuplicateStore {
    /// True when `hash` was marked for `user` and has not expired.
    fn check(&self, hash: &[u8], user: &str) -> bool;

    /// Marks `hash` for `user` until `expires` (unix seconds).
    fn mark(&self, hash: &[u8], user: &str, expires: u64);
}

/// Host capabilities for one script run.
///
/// Every capability is optional; a missing one downgrades the actions
/// that need it to warnings rather than failing the run.
#[derive(Default)]
pub struct ScriptEnv<'a> {
    /// Name of the default mailbox. Empty means `INBOX`.
    pub inbox: String,
    /// User the script runs on behalf of.
    pub username: Option<String>,
    /// Local hostname, used in generated message ids.
    pub hostname: Option<String>,
    /// Postmaster address for generated bounces/replies.
    pub postmaster_address: Option<String>,
    /// Mail storage.
    pub store: Option<&'a dyn MailStore>,
    /// Outgoing SMTP.
    pub smtp: Option<&'a dyn SmtpTransport>,
    /// Duplicate tracking.
    pub duplicates: Option<&'a dyn DuplicateStore>,
    /// Cooperative cancellation flag, polled between opcodes.
    pub abort: Option<Arc<AtomicBool>>,
}

impl ScriptEnv<'_> {
    /// The default mailbox name.
    pub fn inbox(&self) -> &str {
        if self.inbox.is_empty() {
            "INBOX"
        } else {
            &self.inbox
        }
    }

    /// The user name for duplicate tracking, defaulting to empty.
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or("")
    }

    /// True when the host has requested cancellation.
    pub fn aborted(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Seconds since the unix epoch, for duplicate-mark expiry times.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-message state, shared by every script run on one message.
///
/// Extensions keep message-scoped state here under their own name; the
/// slot value is private to the extension that owns it.
#[derive(Default)]
pub struct MessageContext {
    slots: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The named extension's slot, created with `init` on first use.
    ///
    /// Returns `None` if the slot exists but holds a different type,
    /// which would mean two extensions share a name.
    pub fn entry<T: Any + Send>(&mut self, owner: &'static str, init: impl FnOnce() -> T) -> Option<&mut T> {
        self.slots
            .entry(owner)
            .or_insert_with(|| Box::new(init()))
            .downcast_mut()
    }

    /// The named extension's slot, if present.
    pub fn get<T: Any + Send>(&self, owner: &str) -> Option<&T> {
        self.slots.get(owner)?.downcast_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_context_slots() {
        let mut ctx = MessageContext::new();
        *ctx.entry("x", || 1u32).unwrap() = 5;
        assert_eq!(ctx.get::<u32>("x"), Some(&5));
        // Same slot requested with a different type.
        assert_eq!(ctx.entry("x", || "oops"), None);
    }

    #[test]
    fn env_defaults() {
        let env = ScriptEnv::default();
        assert_eq!(env.inbox(), "INBOX");
        assert!(!env.aborted());
    }
}
