//! Inline request framing
//!
//! A request is one line of space-separated words terminated by `\n`.
//! Arguments that could split or confuse the line are double-quoted with
//! their special characters escaped. The inline grammar can not carry an
//! empty quoted argument, so an empty value travels as a single space.

use std::fmt;

/// Stand-in for an empty quoted argument
pub const EMPTY_PLACEHOLDER: &str = " ";

/// Escape backslash, both quote kinds, CR and LF for a quoted argument
pub fn sanitize(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\r' => escaped.push_str("\\r"),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Whether `text` can travel as a bare word
fn is_bare(text: &str) -> bool {
    !text.is_empty()
        && !text
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'))
}

/// One inline request line under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    line: String,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            line: name.to_string(),
        }
    }

    /// Append an argument, quoting it only when it needs quoting
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        let arg = arg.as_ref();
        if is_bare(arg) {
            self.line.push(' ');
            self.line.push_str(arg);
            self
        } else {
            self.quoted(arg)
        }
    }

    /// Append an argument, always quoted
    pub fn quoted(mut self, arg: impl AsRef<str>) -> Self {
        let arg = arg.as_ref();
        let body = if arg.is_empty() {
            EMPTY_PLACEHOLDER.to_string()
        } else {
            sanitize(arg)
        };
        self.line.push_str(" \"");
        self.line.push_str(&body);
        self.line.push('"');
        self
    }

    /// Append several arguments with [`Command::arg`]
    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        args.into_iter().fold(self, Command::arg)
    }

    /// Command word, used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request line without the terminator
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Request line with its terminator, ready to send
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.line.len() + 1);
        bytes.extend_from_slice(self.line.as_bytes());
        bytes.push(b'\n');
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}
