//! Message codec for async streams

use crate::{frame::padding_for, message::FIXED_HEADER_LEN, Message, ProtocolError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (128MB)
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Message codec for encoding/decoding D-Bus messages over async streams
pub struct MessageCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum message size allowed
    max_message_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a new codec with a custom size limit
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_message_size,
        }
    }

    /// Encode a message to wire bytes
    pub fn encode_message(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let bytes = message.encode()?;
        if bytes.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        Ok(bytes)
    }

    /// Write a message to an async writer
    pub async fn write_message<W>(&self, writer: &mut W, message: &Message) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_message(message)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a message from an async reader
    pub async fn read_message<R>(&mut self, reader: &mut R) -> Result<Option<Message>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(message) = self.try_decode_message()? {
                return Ok(Some(message));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::invalid("stream ended inside a message"));
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode a message from the internal buffer
    pub fn try_decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(total) = self.pending_length()? else {
            return Ok(None);
        };

        if total > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }

        if self.read_buf.len() < total {
            return Ok(None);
        }

        let data = self.read_buf.split_to(total);
        Message::decode(&data).map(Some)
    }

    /// Total length of the message at the head of the buffer, once the fixed header is in
    fn pending_length(&self) -> Result<Option<usize>, ProtocolError> {
        if self.read_buf.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }

        let word = |at: usize| -> [u8; 4] {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&self.read_buf[at..at + 4]);
            bytes
        };
        let (body_len, fields_len) = match self.read_buf[0] {
            b'l' => (u32::from_le_bytes(word(4)), u32::from_le_bytes(word(12))),
            b'B' => (u32::from_be_bytes(word(4)), u32::from_be_bytes(word(12))),
            other => {
                return Err(ProtocolError::invalid(format!("unknown endianness {other:#x}")));
            }
        };

        let header_len = FIXED_HEADER_LEN + fields_len as usize;
        let header_len = header_len + padding_for(header_len, 8);
        Ok(Some(header_len + body_len as usize))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
