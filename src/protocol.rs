//! Line protocol parser and reply types.
//!
//! Each request is a single text line: a command token, optionally followed
//! by one space and a payload.
//!
//! ```text
//! LOGIN alice
//! PUBLISH hello world
//! FOLLOW bob
//! TIMELINE
//! FOLLOW_COUNT
//! RDV
//! ```
//!
//! Tokens are case-insensitive and may also be given as their numeric id
//! (`0` for LOGIN through `5` for RDV). A leading `S` marks the command as
//! silent: it is executed but no reply is sent back.

use crate::connection::Connection;
use std::fmt;
use std::str;
use thiserror::Error;

/// Maximum length of a client name, in bytes.
pub const ID_SIZE: usize = 16;

/// Maximum length of a published message, in bytes.
pub const MESSAGE_SIZE: usize = 64;

/// Maximum length of a request line, in bytes.
pub const LINE_SIZE: usize = 256;

/// Separator between a command token and its payload.
pub const DELIMITER: char = ' ';

/// Kind of a client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Login,
    Publish,
    Follow,
    Timeline,
    FollowCount,
    Rdv,
    /// Synthesized by the server when a session ends; never parsed.
    Unregister,
}

impl CommandKind {
    /// Map a wire token to its kind, ignoring the silent prefix.
    fn from_token(token: &str) -> Option<Self> {
        let kind = match token.to_ascii_uppercase().as_str() {
            "LOGIN" | "0" => CommandKind::Login,
            "PUBLISH" | "1" => CommandKind::Publish,
            "FOLLOW" | "2" => CommandKind::Follow,
            "TIMELINE" | "3" => CommandKind::Timeline,
            "FOLLOW_COUNT" | "4" => CommandKind::FollowCount,
            "RDV" | "5" => CommandKind::Rdv,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Login => "LOGIN",
            CommandKind::Publish => "PUBLISH",
            CommandKind::Follow => "FOLLOW",
            CommandKind::Timeline => "TIMELINE",
            CommandKind::FollowCount => "FOLLOW_COUNT",
            CommandKind::Rdv => "RDV",
            CommandKind::Unregister => "UNREGISTER",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed client command, owned by exactly one thread at a time.
#[derive(Debug)]
pub struct Command {
    pub kind: CommandKind,
    /// Key of the issuing client, 0 until login completes.
    pub origin_key: u64,
    /// Socket of a connection that is not registered yet. Only set on LOGIN.
    pub connection: Option<Connection>,
    pub payload: String,
    pub reply_expected: bool,
}

impl Command {
    /// Build the command a session submits when its client goes away.
    pub fn unregister(origin_key: u64) -> Self {
        Command {
            kind: CommandKind::Unregister,
            origin_key,
            connection: None,
            payload: String::new(),
            reply_expected: false,
        }
    }
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0} requires an argument")]
    MissingPayload(CommandKind),
    #[error("{kind} argument too long ({len} > {max} bytes)")]
    PayloadTooLong {
        kind: CommandKind,
        len: usize,
        max: usize,
    },
    #[error("{0} argument must be a single name")]
    InvalidName(CommandKind),
    #[error("{0} takes no argument")]
    UnexpectedPayload(CommandKind),
}

/// Parse one raw request line issued by the client identified by `origin_key`.
pub fn parse(raw: &[u8], origin_key: u64) -> Result<Command, ParseError> {
    let line = str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8)?;
    let line = line.trim_end_matches(|c: char| c.is_control() || c == DELIMITER);
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let (token, rest) = match line.split_once(DELIMITER) {
        Some((token, rest)) => (token, Some(rest)),
        None => (line, None),
    };

    let (kind, reply_expected) = match CommandKind::from_token(token) {
        Some(kind) => (kind, true),
        None => match token.strip_prefix(['S', 's']).and_then(CommandKind::from_token) {
            Some(kind) => (kind, false),
            None => return Err(ParseError::UnknownCommand(token.to_string())),
        },
    };

    let payload = match kind {
        CommandKind::Login | CommandKind::Follow => {
            let name = rest.unwrap_or_default();
            if name.is_empty() {
                return Err(ParseError::MissingPayload(kind));
            }
            if name.contains(DELIMITER) {
                return Err(ParseError::InvalidName(kind));
            }
            check_len(kind, name, ID_SIZE)?;
            name.to_string()
        }
        CommandKind::Publish => {
            let message = rest.unwrap_or_default();
            if message.is_empty() {
                return Err(ParseError::MissingPayload(kind));
            }
            check_len(kind, message, MESSAGE_SIZE)?;
            message.to_string()
        }
        CommandKind::Timeline | CommandKind::FollowCount | CommandKind::Rdv => {
            if rest.is_some() {
                return Err(ParseError::UnexpectedPayload(kind));
            }
            String::new()
        }
        CommandKind::Unregister => unreachable!("UNREGISTER has no wire token"),
    };

    Ok(Command {
        kind,
        origin_key,
        connection: None,
        payload,
        reply_expected,
    })
}

fn check_len(kind: CommandKind, payload: &str, max: usize) -> Result<(), ParseError> {
    if payload.len() > max {
        return Err(ParseError::PayloadTooLong {
            kind,
            len: payload.len(),
            max,
        });
    }
    Ok(())
}

/// Derive the stable key of a client from its login name.
///
/// The first eight bytes of the BLAKE3 digest, little endian. Zero means
/// "not logged in", so a name hashing to zero is mapped to one.
pub fn client_key(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    match u64::from_le_bytes(bytes) {
        0 => 1,
        key => key,
    }
}

/// Answer produced by a handler, addressed to a client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub key: u64,
    pub body: String,
}

impl Reply {
    pub fn new(key: u64, body: impl Into<String>) -> Self {
        Self {
            key,
            body: body.into(),
        }
    }

    /// Reply sent directly by a session when a line fails to parse.
    pub fn parse_error(key: u64, error: &ParseError) -> Self {
        Self::new(key, format!("error: {error}"))
    }

    /// Encode for the wire: the body followed by a newline.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 1);
        out.extend_from_slice(self.body.as_bytes());
        out.push(b'\n');
        out
    }
}
