//! ADC client-client dialect.
//!
//! ADC commands are a four-letter tag (message type plus three-letter
//! name) followed by space-separated, escaped parameters. The connection
//! manager only speaks the client-client handshake subset: `CSUP`, `CINF`
//! and `CSTA`.

use std::fmt;

use thiserror::Error;

/// ADC handshake feature tokens.
pub const FEATURE_BASE: &str = "BASE";
pub const FEATURE_BAS0: &str = "BAS0";
pub const FEATURE_TIGR: &str = "TIGR";
pub const FEATURE_BZIP: &str = "BZIP";
pub const FEATURE_ZLIB_GET: &str = "ZLIB-GET";

/// Severity class of a `STA` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success = 0,
    Recoverable = 1,
    Fatal = 2,
}

/// The `STA` error codes this crate produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic = 0,
    ProtocolGeneric = 10,
    InfMissing = 13,
}

/// Errors raised while parsing an ADC line.
#[derive(Debug, Error)]
pub enum AdcError {
    #[error("empty command")]
    Empty,

    #[error("invalid command: {0}")]
    Invalid(String),
}

/// A parsed or under-construction ADC command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcCommand {
    /// Message type character; always `C` for the client-client commands
    /// this crate builds.
    pub ty: u8,
    /// Three-letter command name.
    pub name: [u8; 3],
    /// Positional parameters, unescaped.
    params: Vec<String>,
}

impl AdcCommand {
    pub const SUP: [u8; 3] = *b"SUP";
    pub const INF: [u8; 3] = *b"INF";
    pub const STA: [u8; 3] = *b"STA";

    pub fn new(name: [u8; 3]) -> Self {
        Self {
            ty: b'C',
            name,
            params: Vec::new(),
        }
    }

    /// Builds a `STA` status with the given severity, code and message.
    pub fn sta(severity: Severity, code: ErrorCode, message: &str) -> Self {
        Self::new(Self::STA)
            .add(format!("{}{:02}", severity as u8, code as u8))
            .add(message)
    }

    /// Appends a positional parameter.
    pub fn add(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Appends a named parameter (`<name><value>`).
    pub fn add_named(self, name: &str, value: impl AsRef<str>) -> Self {
        self.add(format!("{}{}", name, value.as_ref()))
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Looks up a named parameter by its two-letter name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find_map(|p| p.strip_prefix(name))
    }

    /// Parses one line (terminator already stripped).
    pub fn parse(line: &str) -> Result<Self, AdcError> {
        let mut tokens = line.split(' ');
        let tag = tokens.next().ok_or(AdcError::Empty)?;
        if tag.len() != 4 || !tag.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            return Err(AdcError::Invalid(tag.to_string()));
        }
        let bytes = tag.as_bytes();
        let mut name = [0u8; 3];
        name.copy_from_slice(&bytes[1..4]);

        Ok(Self {
            ty: bytes[0],
            name,
            params: tokens.map(unescape).collect(),
        })
    }

    /// Encodes the command with its `\n` terminator.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(32);
        out.push(self.ty as char);
        for b in self.name {
            out.push(b as char);
        }
        for p in &self.params {
            out.push(' ');
            out.push_str(&escape(p));
        }
        out.push('\n');
        out
    }
}

impl fmt::Display for AdcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode();
        f.write_str(encoded.trim_end())
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
