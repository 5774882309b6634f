//! Message framing shared by the stream and alert endpoints.
//!
//! Each message is `kind (1 byte) | length (u32, big-endian) | payload`.
//! Close payloads carry a big-endian `u16` code followed by a UTF-8 reason.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

pub const MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

pub const KIND_BINARY: u8 = 0x01;
pub const KIND_TEXT: u8 = 0x02;
pub const KIND_CLOSE: u8 = 0x08;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Binary(Vec<u8>),
    Text(String),
    Close { code: u16, reason: String },
}

impl Message {
    pub fn close(code: u16, reason: &str) -> Self {
        Message::Close {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Message::Text(serde_json::to_string(value)?))
    }
}

/// Read one message. `Ok(None)` means the peer closed the stream cleanly
/// between messages.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let mut header = [0u8; 5];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(anyhow!("connection closed mid-header")),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD_BYTES {
        return Err(anyhow!(
            "message of {} bytes exceeds {} byte limit",
            len,
            MAX_PAYLOAD_BYTES
        ));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| anyhow!("connection closed mid-message: {}", e))?;

    match kind {
        KIND_BINARY => Ok(Some(Message::Binary(payload))),
        KIND_TEXT => Ok(Some(Message::Text(
            String::from_utf8(payload).map_err(|_| anyhow!("text message is not UTF-8"))?,
        ))),
        KIND_CLOSE => {
            if payload.len() < 2 {
                return Ok(Some(Message::close(CLOSE_NORMAL, "")));
            }
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
            Ok(Some(Message::Close { code, reason }))
        }
        other => Err(anyhow!("unknown message kind 0x{:02x}", other)),
    }
}

pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let (kind, body): (u8, std::borrow::Cow<'_, [u8]>) = match message {
        Message::Binary(data) => (KIND_BINARY, data.as_slice().into()),
        Message::Text(text) => (KIND_TEXT, text.as_bytes().into()),
        Message::Close { code, reason } => {
            let mut body = Vec::with_capacity(2 + reason.len());
            body.extend_from_slice(&code.to_be_bytes());
            body.extend_from_slice(reason.as_bytes());
            (KIND_CLOSE, body.into())
        }
    };
    if body.len() > MAX_PAYLOAD_BYTES {
        return Err(anyhow!("outbound message exceeds {} bytes", MAX_PAYLOAD_BYTES));
    }
    let mut header = [0u8; 5];
    header[0] = kind;
    header[1..].copy_from_slice(&(body.len() as u32).to_be_bytes());
    writer.write_all(&header)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}
