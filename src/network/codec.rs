//! Message codec
//!
//! `[1 byte: type] [4 bytes: length, big-endian] [bincode record]` for
//! commands, a bare type byte for stream headers.

use super::{Decoder, Encoder, Message, MessageKind, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Default upper bound for a command record
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest record the 4-byte length prefix can describe
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Length-prefixed bincode codec
#[derive(Debug, Clone, Copy)]
pub struct BinaryCodec {
    max_message_size: usize,
}

impl BinaryCodec {
    /// Limits above [`MAX_FRAME_LEN`] are clamped to it.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(MAX_FRAME_LEN),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Encoder for BinaryCodec {
    fn encode(&self, writer: &mut dyn Write, msg: &Message) -> NetworkResult<()> {
        if msg.is_stream {
            writer.write_all(&[MessageKind::Stream as u8])?;
            writer.flush()?;
            return Ok(());
        }

        let record =
            bincode::serialize(msg).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        let too_large = || NetworkError::MessageTooLarge {
            size: record.len(),
            max: self.max_message_size,
        };
        if record.len() > self.max_message_size {
            return Err(too_large());
        }
        let length = u32::try_from(record.len()).map_err(|_| too_large())?;

        // one buffer so a command leaves in a single write
        let mut frame = Vec::with_capacity(1 + 4 + record.len());
        frame.push(MessageKind::Command as u8);
        frame.write_u32::<BigEndian>(length)?;
        frame.extend_from_slice(&record);

        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }
}

impl Decoder for BinaryCodec {
    fn decode(&self, reader: &mut dyn Read) -> NetworkResult<Message> {
        let kind = MessageKind::try_from(reader.read_u8()?)?;

        match kind {
            MessageKind::Stream => Ok(Message::stream()),
            MessageKind::Command => {
                let length = reader.read_u32::<BigEndian>()? as usize;
                if length > self.max_message_size {
                    return Err(NetworkError::MessageTooLarge {
                        size: length,
                        max: self.max_message_size,
                    });
                }

                let mut record = vec![0u8; length];
                reader.read_exact(&mut record)?;

                let mut msg: Message = bincode::deserialize(&record)
                    .map_err(|e| NetworkError::Serialization(e.to_string()))?;
                msg.is_stream = false;
                Ok(msg)
            }
        }
    }
}
