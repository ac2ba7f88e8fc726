//! Wire framing: the fixed 8-byte header and its byte-order discipline.
//!
//! Every message on the wire is a header followed by the body:
//!
//! ```text
//! +--------------------+--------------------+----------------+
//! | tag (4 bytes)      | size (4 bytes)     |  body          |
//! | u32 native-endian  | u32 big-endian     |  (size bytes)  |
//! +--------------------+--------------------+----------------+
//! ```
//!
//! The `size` field is the body length and travels big-endian. The `tag`
//! field is **not** endian-normalized: both peers are assumed to share byte
//! order for it, and the tests below pin that layout. Bodies are opaque.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, MessageId};

/// Size of the wire header in bytes: 4-byte tag plus 4-byte length.
pub const HEADER_LEN: usize = 8;

/// Maximum body length of a datagram message. The stream transport enforces
/// the same cap to bound allocations driven by a misbehaving peer.
pub const MAX_MESSAGE_SIZE: u32 = 64_000;

/// Size of the datagram scratch buffers: a full header plus the largest
/// legal body.
pub const MAX_DATAGRAM_LEN: usize = HEADER_LEN + MAX_MESSAGE_SIZE as usize;

/// Errors produced while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The message size exceeds the allowed maximum.
    #[error("message body of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Body size declared by the header.
        size: u32,
        /// The enforced maximum.
        max: u32,
    },

    /// The peer closed the connection before a complete frame arrived.
    #[error("connection closed")]
    Closed,

    /// An I/O error surfaced from the OS.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a wire header: tag in native order, body length big-endian.
pub fn encode_header(kind_raw: u32, body_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&kind_raw.to_ne_bytes());
    header[4..].copy_from_slice(&body_len.to_be_bytes());
    header
}

/// Decode a wire header into `(tag, body_len)`, both in host order.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> (u32, u32) {
    let kind_raw = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
    let body_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    (kind_raw, body_len)
}

/// Serialize a message into a single buffer, header first.
///
/// Used by the datagram transport, where one message is one packet.
pub fn encode_datagram<T: MessageId>(msg: &Message<T>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + msg.body_len());
    out.extend_from_slice(&encode_header(msg.kind().to_raw(), msg.body_len() as u32));
    out.extend_from_slice(msg.body());
    out
}

/// Parse a complete datagram into a message.
///
/// Returns `None` for packets that are shorter than a header or whose length
/// does not match the header's size field; such packets are ignored rather
/// than treated as fatal.
pub fn decode_datagram<T: MessageId>(datagram: &[u8]) -> Option<Message<T>> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&datagram[..HEADER_LEN]);
    let (kind_raw, body_len) = decode_header(&header);

    if datagram.len() - HEADER_LEN != body_len as usize {
        return None;
    }
    Some(Message::from_parts(
        T::from_raw(kind_raw),
        datagram[HEADER_LEN..].to_vec(),
    ))
}

/// Read one complete message off a stream.
///
/// Reads exactly [`HEADER_LEN`] bytes, then exactly the body the header
/// declares. Returns [`FrameError::Closed`] if the peer hangs up mid-frame
/// and [`FrameError::TooLarge`] when the declared body exceeds `max_body`.
pub async fn read_message<T, R>(reader: &mut R, max_body: u32) -> Result<Message<T>, FrameError>
where
    T: MessageId,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;

    let (kind_raw, body_len) = decode_header(&header);
    if body_len > max_body {
        return Err(FrameError::TooLarge {
            size: body_len,
            max: max_body,
        });
    }

    let mut body = vec![0u8; body_len as usize];
    if body_len > 0 {
        read_exact_or_closed(reader, &mut body).await?;
    }

    Ok(Message::from_parts(T::from_raw(kind_raw), body))
}

/// Write one complete message to a stream, header first.
pub async fn write_message<T, W>(writer: &mut W, msg: &Message<T>) -> Result<(), FrameError>
where
    T: MessageId,
    W: AsyncWrite + Unpin,
{
    let header = encode_header(msg.kind().to_raw(), msg.body_len() as u32);
    writer.write_all(&header).await?;
    if !msg.is_empty() {
        writer.write_all(msg.body()).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Closed),
        Err(e) => Err(FrameError::Io(e)),
    }
}
