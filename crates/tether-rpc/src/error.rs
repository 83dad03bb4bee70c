//! The in-band RPC error value.
//!
//! Every error that travels back to a caller is a `(message, debug)` pair.
//! The debug field accumulates context line by line; rendering indents it
//! under a `Debug:` heading.

use std::fmt;

/// An RPC error carried in a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    message: String,
    debug: String,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        RpcError {
            message: message.into(),
            debug: String::new(),
        }
    }

    pub fn with_debug(message: impl Into<String>, debug: impl Into<String>) -> Self {
        RpcError {
            message: message.into(),
            debug: debug.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn debug(&self) -> &str {
        &self.debug
    }

    /// Append a debug line, newline-separated from what is already there.
    pub fn add_debug(&mut self, debug: &str) {
        if !self.debug.is_empty() {
            self.debug.push('\n');
        }
        self.debug.push_str(debug);
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            writeln!(f, "{}", self.message)?;
        }
        if !self.debug.is_empty() {
            writeln!(f, "Debug:\n{}", indent_lines(&self.debug))?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

/// Prefix every line of `origin` with a tab.
pub(crate) fn indent_lines(origin: &str) -> String {
    origin
        .lines()
        .map(|line| format!("\t{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A rendered call stack for debug fields.
pub(crate) fn capture_stack() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}
