//! Wire codec and stream framing.
//!
//! A message is the operation name followed by its positional arguments, one
//! per line, terminated by the sentinel:
//!
//! ```text
//! <operation>\n<arg1>\n<arg2>...\n<EOF>
//! ```
//!
//! An acknowledgment is `finish:<operation>\n<EOF>`. There is no length
//! prefix, so a reader accumulates bytes until the sentinel shows up and keeps
//! whatever follows it for the next message.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ProtocolConfig;
use crate::error::{IpcError, Result};

/// Declared type of one operation parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Text,
    Bool,
    Int,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Text => write!(f, "text"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::Int => write!(f, "int"),
        }
    }
}

/// One positional scalar argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Text(String),
    Bool(bool),
    Int(i32),
}

impl Arg {
    pub fn param_type(&self) -> ParamType {
        match self {
            Arg::Text(_) => ParamType::Text,
            Arg::Bool(_) => ParamType::Bool,
            Arg::Int(_) => ParamType::Int,
        }
    }
}

/// Canonical wire text.
impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Text(s) => f.write_str(s),
            Arg::Bool(true) => f.write_str(ProtocolConfig::TRUE_TOKEN),
            Arg::Bool(false) => f.write_str(ProtocolConfig::FALSE_TOKEN),
            Arg::Int(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Text(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Text(s)
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg::Bool(b)
    }
}

impl From<i32> for Arg {
    fn from(n: i32) -> Self {
        Arg::Int(n)
    }
}

/// A decoded message: operation name plus raw argument fields.
///
/// Fields are kept as text; they only acquire types once matched against an
/// operation's declared parameters (see [`coerce`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub operation: String,
    pub fields: Vec<String>,
}

impl Message {
    pub fn new(operation: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            operation: operation.into(),
            fields,
        }
    }

    /// Operation an acknowledgment refers to, if this is one.
    pub fn acknowledged_operation(&self) -> Option<&str> {
        self.operation.strip_prefix(ProtocolConfig::ACK_PREFIX)
    }
}

fn check_field(operation: &str, what: &str, field: &str) -> Result<()> {
    let reason = if field.contains(ProtocolConfig::LINE_SEPARATOR) {
        "contains a line break"
    } else if field.contains(ProtocolConfig::SENTINEL) {
        "contains the message terminator"
    } else {
        return Ok(());
    };
    Err(IpcError::InvalidArgument {
        operation: operation.to_string(),
        reason: format!("{} {}", what, reason),
    })
}

/// Encode a call.
///
/// Empty fields vanish on the wire, so an empty text argument is only
/// accepted in last position, where the receiver fills it back in. Text that
/// would split into extra fields or end the message early is rejected.
pub fn encode(operation: &str, args: &[Arg]) -> Result<Vec<u8>> {
    if operation.is_empty() {
        return Err(IpcError::InvalidArgument {
            operation: String::new(),
            reason: "operation name is empty".into(),
        });
    }
    check_field(operation, "operation name", operation)?;

    let mut text = String::from(operation);
    for (i, arg) in args.iter().enumerate() {
        if let Arg::Text(value) = arg {
            check_field(operation, &format!("argument {}", i), value)?;
            if value.is_empty() && i + 1 < args.len() {
                return Err(IpcError::InvalidArgument {
                    operation: operation.to_string(),
                    reason: format!("argument {} is empty text followed by more arguments", i),
                });
            }
        }
        text.push(ProtocolConfig::LINE_SEPARATOR);
        text.push_str(&arg.to_string());
    }
    text.push(ProtocolConfig::LINE_SEPARATOR);
    text.push_str(ProtocolConfig::SENTINEL);
    Ok(text.into_bytes())
}

/// Encode the acknowledgment for a dispatched operation.
pub fn encode_ack(operation: &str) -> Vec<u8> {
    format!(
        "{}{}{}{}",
        ProtocolConfig::ACK_PREFIX,
        operation,
        ProtocolConfig::LINE_SEPARATOR,
        ProtocolConfig::SENTINEL
    )
    .into_bytes()
}

fn find_sentinel(buffer: &[u8]) -> Option<usize> {
    let sentinel = ProtocolConfig::SENTINEL.as_bytes();
    buffer
        .windows(sentinel.len())
        .position(|window| window == sentinel)
}

/// Split the first complete message off `buffer`.
///
/// Returns `(None, buffer)` when no sentinel has arrived yet. Otherwise returns
/// the message up to and including the first sentinel, and the remainder the
/// caller must prepend to the next read.
pub fn try_decode(buffer: &[u8]) -> Result<(Option<Message>, &[u8])> {
    let Some(pos) = find_sentinel(buffer) else {
        return Ok((None, buffer));
    };
    let end = pos + ProtocolConfig::SENTINEL.len();
    let (frame, remainder) = buffer.split_at(end);
    Ok((Some(parse_frame(frame)?), remainder))
}

/// Parse one frame ending in the sentinel.
fn parse_frame(frame: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| IpcError::decode(format!("Invalid UTF-8 in message: {}", e)))?;

    let mut parts = text
        .split(ProtocolConfig::LINE_SEPARATOR)
        .filter(|part| !part.is_empty());
    let operation = parts
        .next()
        .ok_or_else(|| IpcError::decode("Message has no operation name"))?;
    if operation == ProtocolConfig::SENTINEL {
        return Err(IpcError::decode("Message has no operation name"));
    }
    let fields = parts
        .filter(|part| *part != ProtocolConfig::SENTINEL)
        .map(str::to_string)
        .collect();

    Ok(Message::new(operation, fields))
}

/// Map message fields onto declared parameter types, in order.
///
/// A missing text field becomes the empty string (empty arguments vanish on
/// the wire). A missing or malformed boolean or integer is a decode failure.
pub fn coerce(message: &Message, params: &[ParamType]) -> Result<Vec<Arg>> {
    params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let field = message.fields.get(i).map(String::as_str);
            match (param, field) {
                (ParamType::Text, field) => Ok(Arg::Text(field.unwrap_or_default().to_string())),
                (ParamType::Bool, Some(field)) => parse_bool(field).map(Arg::Bool).ok_or_else(|| {
                    IpcError::decode(format!(
                        "{}: argument {} is not a boolean: {:?}",
                        message.operation, i, field
                    ))
                }),
                (ParamType::Int, Some(field)) => field.parse::<i32>().map(Arg::Int).map_err(|e| {
                    IpcError::decode(format!(
                        "{}: argument {} is not an integer: {:?} ({})",
                        message.operation, i, field, e
                    ))
                }),
                (param, None) => Err(IpcError::decode(format!(
                    "{}: missing {} argument {}",
                    message.operation, param, i
                ))),
            }
        })
        .collect()
}

fn parse_bool(field: &str) -> Option<bool> {
    if field.eq_ignore_ascii_case(ProtocolConfig::TRUE_TOKEN) {
        Some(true)
    } else if field.eq_ignore_ascii_case(ProtocolConfig::FALSE_TOKEN) {
        Some(false)
    } else {
        None
    }
}

/// Accumulates stream bytes and yields complete messages.
///
/// A single read may carry several messages or only part of one; the buffer
/// is always drained of complete messages before the stream is read again.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a sentinel.
    scanned: usize,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            scanned: 0,
            chunk: vec![0u8; ProtocolConfig::READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Bytes received but not yet consumed by a message.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Read the next complete message.
    ///
    /// Returns `None` on clean end-of-stream (peer closed between messages).
    /// End-of-stream in the middle of a message is a decode failure.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        let sentinel_len = ProtocolConfig::SENTINEL.len();
        loop {
            let start = self.scanned.min(self.buffer.len());
            if let Some(pos) = find_sentinel(&self.buffer[start..]) {
                let end = start + pos + sentinel_len;
                let frame: Vec<u8> = self.buffer.drain(..end).collect();
                self.scanned = 0;
                return parse_frame(&frame).map(Some);
            }
            // A sentinel may straddle the next read.
            self.scanned = self.buffer.len().saturating_sub(sentinel_len - 1);

            if self.buffer.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
                return Err(IpcError::decode(format!(
                    "{} bytes buffered without a message terminator (maximum {})",
                    self.buffer.len(),
                    ProtocolConfig::MAX_MESSAGE_SIZE
                )));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(IpcError::decode(format!(
                    "Stream ended with {} bytes of an unterminated message",
                    self.buffer.len()
                )));
            }
            self.buffer.extend_from_slice(&self.chunk[..n]);
        }
    }
}

/// Write one encoded message and flush it.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
