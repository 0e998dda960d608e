use core::fmt;

/// Sink for user-facing diagnostics from validation and execution.
///
/// Errors are counted so the validator can decide success and enforce
/// its error limit; warnings are informational only.
pub trait ErrorHandler {
    /// Reports an error, optionally located on a source line.
    fn error(&mut self, line: Option<u32>, message: fmt::Arguments<'_>);

    /// Reports a warning.
    fn warning(&mut self, line: Option<u32>, message: fmt::Arguments<'_>);

    /// Reports an internal failure not tied to the script.
    fn critical(&mut self, message: fmt::Arguments<'_>);

    /// Number of errors reported so far.
    fn error_count(&self) -> usize;
}

/// Reports diagnostics as `tracing` events.
#[derive(Debug, Default)]
pub struct TracingHandler {
    errors: usize,
}

impl TracingHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ErrorHandler for TracingHandler {
    fn error(&mut self, line: Option<u32>, message: fmt::Arguments<'_>) {
        self.errors += 1;
        match line {
            Some(line) => tracing::error!(line, "{message}"),
            None => tracing::error!("{message}"),
        }
    }

    fn warning(&mut self, line: Option<u32>, message: fmt::Arguments<'_>) {
        match line {
            Some(line) => tracing::warn!(line, "{message}"),
            None => tracing::warn!("{message}"),
        }
    }

    fn critical(&mut self, message: fmt::Arguments<'_>) {
        self.errors += 1;
        tracing::error!("critical: {message}");
    }

    fn error_count(&self) -> usize {
        self.errors
    }
}

/// Severity of one collected diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// A collected diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub line: Option<u32>,
    pub message: String,
}

/// Collects diagnostics in memory. Used by tests and by hosts that
/// present script problems to the script's owner.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    pub diagnostics: Vec<Diagnostic>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of all collected errors, in order.
    pub fn error_messages(&self) -> Vec<&str> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity != Severity::Warning)
            .map(|d| d.message.as_str())
            .collect()
    }

    /// Messages of all collected warnings, in order.
    pub fn warning_messages(&self) -> Vec<&str> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .map(|d| d.message.as_str())
            .collect()
    }

    fn push(&mut self, severity: Severity, line: Option<u32>, message: fmt::Arguments<'_>) {
        self.diagnostics.push(Diagnostic {
            severity,
            line,
            message: message.to_string(),
        });
    }
}

impl ErrorHandler for CollectingHandler {
    fn error(&mut self, line: Option<u32>, message: fmt::Arguments<'_>) {
        self.push(Severity::Error, line, message);
    }

    fn warning(&mut self, line: Option<u32>, message: fmt::Arguments<'_>) {
        self.push(Severity::Warning, line, message);
    }

    fn critical(&mut self, message: fmt::Arguments<'_>) {
        self.push(Severity::Critical, None, message);
    }

    fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity != Severity::Warning)
            .count()
    }
}
