//! Length-prefixed message framing.
//!
//! Every message on a stream is `[flag:1][length:4 big-endian][payload]`,
//! where the flag is 1 when the payload is compressed and 0 otherwise.
//! Transport data chunks carry no message boundaries, so [`FrameDecoder`]
//! reassembles frames from arbitrary splits.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::compress::Compressor;
use crate::error::{Result, RpcError};

/// Size of the per-message header.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default limit on a single message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const FLAG_UNCOMPRESSED: u8 = 0;
const FLAG_COMPRESSED: u8 = 1;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    /// Whether the payload is compressed.
    pub compressed: bool,
    /// Payload bytes, possibly compressed.
    pub payload: Bytes,
}

impl MessageFrame {
    /// Creates a frame.
    pub fn new(payload: Bytes, compressed: bool) -> Self {
        Self { compressed, payload }
    }

    /// Header plus payload length.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Writes the frame into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(if self.compressed { FLAG_COMPRESSED } else { FLAG_UNCOMPRESSED });
        dst.put_u32(self.payload.len() as u32);
        dst.extend_from_slice(&self.payload);
    }

    /// Encodes the frame into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Frames an encoded message, compressing it when a compressor is given.
pub fn encode_message(
    message: Bytes,
    compressor: Option<&dyn Compressor>,
    max_message_size: usize,
) -> Result<Bytes> {
    if message.len() > max_message_size {
        return Err(RpcError::MessageTooLarge {
            size: message.len(),
            max: max_message_size,
        });
    }
    let frame = match compressor {
        Some(c) => MessageFrame::new(c.compress(&message)?, true),
        None => MessageFrame::new(message, false),
    };
    if frame.payload.len() > u32::MAX as usize {
        return Err(RpcError::MessageTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }
    Ok(frame.to_bytes())
}

/// Turns a decoded frame back into message bytes.
pub fn decode_message(
    frame: MessageFrame,
    decompressor: Option<&dyn Compressor>,
    max_message_size: usize,
) -> Result<Bytes> {
    if !frame.compressed {
        return Ok(frame.payload);
    }
    match decompressor {
        Some(c) => c.decompress(&frame.payload, max_message_size),
        None => Err(RpcError::Compression {
            reason: "compressed frame received without a negotiated encoding".to_string(),
        }),
    }
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder enforcing the given message limit.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Appends raw bytes received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extracts the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<MessageFrame>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let flag = self.buf[0];
        let compressed = match flag {
            FLAG_UNCOMPRESSED => false,
            FLAG_COMPRESSED => true,
            other => {
                return Err(RpcError::InvalidFrame {
                    reason: format!("unknown compression flag {other}"),
                })
            }
        };
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_message_size {
            return Err(RpcError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(MessageFrame { compressed, payload }))
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Checks that the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(RpcError::InvalidFrame {
                reason: format!("stream ended inside a frame ({} bytes left over)", self.buf.len()),
            })
        }
    }
}
