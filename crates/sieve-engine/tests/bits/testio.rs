//! Mock host IO for engine tests.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::Write,
};

use sieve_engine::{
    Binary, CollectingHandler, DuplicateStore, ExtensionRegistry, Mail, MailError, MailStore,
    MessageData, SmtpError, SmtpSession, SmtpTransport, StoreError,
};

/// An in-memory message.
#[derive(Default)]
pub struct TestMail {
    headers: Vec<(String, String)>,
    size: u64,
    /// Header names the engine asked for, for short-circuit tests.
    pub requested: RefCell<Vec<String>>,
}

impl TestMail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

impl Mail for TestMail {
    fn get_headers(&self, name: &str) -> Result<Vec<String>, MailError> {
        self.requested.borrow_mut().push(name.to_ascii_lowercase());
        Ok(self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn get_headers_utf8(&self, name: &str) -> Result<Vec<String>, MailError> {
        self.get_headers(name)
    }

    fn get_size(&self) -> u64 {
        self.size
    }

    fn write_to(&self, out: &mut dyn Write) -> Result<(), MailError> {
        for (name, value) in &self.headers {
            write!(out, "{name}: {value}\r\n").map_err(|e| MailError(e.to_string()))?;
        }
        out.write_all(b"\r\n(body)\r\n")
            .map_err(|e| MailError(e.to_string()))?;
        Ok(())
    }
}

/// Records deliveries.
#[derive(Default)]
pub struct TestStore {
    pub stored: RefCell<Vec<(String, Vec<String>)>>,
}

impl MailStore for TestStore {
    fn store(&self, mailbox: &str, flags: &[String]) -> Result<(), StoreError> {
        self.stored
            .borrow_mut()
            .push((mailbox.to_owned(), flags.to_vec()));
        Ok(())
    }
}

/// A store that always fails, for failure-path tests.
pub struct FailingStore {
    pub temporary: bool,
}

impl MailStore for FailingStore {
    fn store(&self, mailbox: &str, _flags: &[String]) -> Result<(), StoreError> {
        Err(StoreError {
            mailbox: mailbox.to_owned(),
            reason: "disk full".into(),
            temporary: self.temporary,
        })
    }
}

/// Records outgoing SMTP messages.
#[derive(Default)]
pub struct TestSmtp {
    pub sent: RefCell<Vec<(String, Vec<u8>)>>,
}

impl SmtpTransport for TestSmtp {
    fn open(
        &self,
        destination: &str,
        _return_path: Option<&str>,
    ) -> Result<Box<dyn SmtpSession + '_>, SmtpError> {
        Ok(Box::new(TestSession {
            transport: self,
            destination: destination.to_owned(),
            buf: Vec::new(),
        }))
    }
}

struct TestSession<'a> {
    transport: &'a TestSmtp,
    destination: String,
    buf: Vec<u8>,
}

impl Write for TestSession<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SmtpSession for TestSession<'_> {
    fn close(self: Box<Self>) -> Result<(), SmtpError> {
        self.transport
            .sent
            .borrow_mut()
            .push((self.destination, self.buf));
        Ok(())
    }
}

/// An in-memory duplicate store.
#[derive(Default)]
pub struct TestDuplicates {
    marks: RefCell<HashMap<Vec<u8>, u64>>,
}

impl TestDuplicates {
    pub fn len(&self) -> usize {
        self.marks.borrow().len()
    }
}

impl DuplicateStore for TestDuplicates {
    fn check(&self, hash: &[u8], _user: &str) -> bool {
        self.marks.borrow().contains_key(hash)
    }

    fn mark(&self, hash: &[u8], _user: &str, expires: u64) {
        self.marks.borrow_mut().insert(hash.to_vec(), expires);
    }
}

/// Message data over a test mail, with the usual envelope.
pub fn msgdata<'a>(mail: &'a TestMail) -> MessageData<'a> {
    MessageData {
        mail,
        return_path: Some("sender@remote.test".into()),
        to_address: Some("me@example.net".into()),
        auth_user: None,
        id: Some("<mid-1@remote.test>".into()),
    }
}

/// Compiles a script against the bundled registry, asserting no errors.
pub fn compile_ok(registry: &ExtensionRegistry, script: &str) -> Binary {
    let mut handler = CollectingHandler::new();
    match sieve_engine::compile(script, registry, &mut handler) {
        Ok(binary) => binary,
        Err(err) => panic!("compile failed: {err}; diagnostics: {:?}", handler.diagnostics),
    }
}
