//! Out-of-band command framing used by game server query traffic
//!
//! Every datagram starts with four `0xFF` bytes followed by ASCII text of the
//! form `<command><separator><data>`. The separator is whatever whitespace
//! character directly follows the command name; game servers use a space for
//! requests and a newline for most responses.

use thiserror::Error;

/// Marker prefixed to every connectionless datagram
pub const OOB_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Separator used for outgoing probe commands
pub const DEFAULT_SEPARATOR: char = ' ';

/// Errors raised while framing or parsing game server query traffic
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram is missing the out-of-band marker")]
    MissingMarker,
    #[error("command name is empty or contains whitespace")]
    InvalidCommand,
    #[error("separator {0:?} is not a whitespace character")]
    InvalidSeparator(char),
    #[error("command `{0}` is not followed by a separator")]
    MissingSeparator(String),
    #[error("info response rejected: {0}")]
    InvalidInfo(&'static str),
}

/// One probe or response payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandMessage {
    command: String,
    data: String,
    separator: char,
}

impl CommandMessage {
    /// Builds a message, rejecting names and separators that could not be
    /// decoded back into the same triple.
    pub fn new(
        command: impl Into<String>,
        data: impl Into<String>,
        separator: char,
    ) -> Result<Self, ProtocolError> {
        let command = command.into();
        if command.is_empty() || command.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidCommand);
        }
        if !separator.is_whitespace() {
            return Err(ProtocolError::InvalidSeparator(separator));
        }

        Ok(Self {
            command,
            data: data.into(),
            separator,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    /// Lower-cased command name used for handler lookup and correlation
    pub fn command_key(&self) -> String {
        self.command.to_ascii_lowercase()
    }

    /// Wire form: marker, command, separator, data
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            OOB_MARKER.len() + self.command.len() + self.separator.len_utf8() + self.data.len(),
        );
        buf.extend_from_slice(&OOB_MARKER);
        buf.extend_from_slice(self.command.as_bytes());
        let mut sep = [0u8; 4];
        buf.extend_from_slice(self.separator.encode_utf8(&mut sep).as_bytes());
        buf.extend_from_slice(self.data.as_bytes());
        buf
    }

    /// Parses a raw datagram. The command ends at the first whitespace
    /// character, which becomes the separator; everything after it is data.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let payload = datagram
            .strip_prefix(&OOB_MARKER[..])
            .ok_or(ProtocolError::MissingMarker)?;
        let text = String::from_utf8_lossy(payload);

        let split = text
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .ok_or_else(|| ProtocolError::MissingSeparator(text.to_string()))?;
        let (idx, separator) = split;

        let command = &text[..idx];
        if command.is_empty() {
            return Err(ProtocolError::InvalidCommand);
        }

        Ok(Self {
            command: command.to_string(),
            data: text[idx + separator.len_utf8()..].to_string(),
            separator,
        })
    }
}

/// The two probes a game server answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Info,
    Status,
}

impl ProbeKind {
    pub fn request_command(self) -> &'static str {
        match self {
            ProbeKind::Info => "getinfo",
            ProbeKind::Status => "getstatus",
        }
    }

    /// Lower-cased name of the command a server answers with
    pub fn response_command(self) -> &'static str {
        match self {
            ProbeKind::Info => "inforesponse",
            ProbeKind::Status => "statusresponse",
        }
    }

    pub fn request(self) -> CommandMessage {
        CommandMessage {
            command: self.request_command().to_string(),
            data: String::new(),
            separator: DEFAULT_SEPARATOR,
        }
    }
}

/// Removes `^N` colour escapes from names shown to players
pub fn strip_color_codes(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '^' {
            if let Some(next) = chars.peek() {
                if next.is_ascii_alphanumeric() {
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}
