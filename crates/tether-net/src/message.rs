//! Message and user-identity types shared by both transports.
//!
//! A [`Message`] is a wire tag plus an opaque byte body. The body doubles as a
//! small stack: [`Message::push`] appends any [`bytemuck::Pod`] value to the
//! end, [`Message::pop`] takes it back off in reverse order. Payload bytes are
//! **not** endian-normalized; only the length field of the wire header is (see
//! [`crate::framing`]). Peers on architectures with different byte order must
//! serialize multi-byte payload values themselves.

use std::fmt;
use std::mem;

use bytemuck::Pod;

/// Identity of a peer. The server is [`SERVER_USER_ID`]; clients are assigned
/// ids by the server starting at [`FIRST_CLIENT_ID`].
pub type UserId = i32;

/// An unassigned user id.
pub const INVALID_USER_ID: UserId = -1;

/// User id of the unique server.
pub const SERVER_USER_ID: UserId = 0;

/// First id handed out to a connecting client. Ids increment from here and
/// are never reused within a server's lifetime.
pub const FIRST_CLIENT_ID: UserId = 100_000;

/// Wire tag for messages, implemented by the application's message enum.
///
/// The tag travels as a `u32`. `from_raw` must be total: the framework does
/// not validate tags, so unknown values should map to a catch-all variant.
pub trait MessageId: Copy + Eq + Send + Sync + fmt::Debug + 'static {
    /// The `u32` written into the wire header for this tag.
    fn to_raw(self) -> u32;

    /// Recover a tag from a wire header. Must accept any `u32`.
    fn from_raw(raw: u32) -> Self;
}

/// A typed message: a tag and an owned byte body.
///
/// The body length is the single source of truth for the header's size field;
/// there is no separately tracked size that could fall out of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T: MessageId> {
    kind: T,
    body: Vec<u8>,
}

impl<T: MessageId> Message<T> {
    /// Create an empty message with the given tag.
    pub fn new(kind: T) -> Self {
        Self {
            kind,
            body: Vec::new(),
        }
    }

    /// Assemble a message from a tag and an already-built body.
    pub fn from_parts(kind: T, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    /// The message tag.
    pub fn kind(&self) -> T {
        self.kind
    }

    /// The message body as raw bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Length of the body in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Total size on the wire: header plus body.
    pub fn encoded_len(&self) -> usize {
        crate::framing::HEADER_LEN + self.body.len()
    }

    /// Consume the message, returning the body.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Append a plain-old-data value to the end of the body.
    ///
    /// Values are copied byte-for-byte in host representation. Calls chain:
    /// `msg.push(1i32).push(2.0f32);`
    pub fn push<U: Pod>(&mut self, value: U) -> &mut Self {
        self.body.extend_from_slice(bytemuck::bytes_of(&value));
        self
    }

    /// Take a plain-old-data value back off the end of the body.
    ///
    /// Inverse of [`push`](Self::push): the last value pushed is the first
    /// popped.
    ///
    /// # Panics
    ///
    /// Panics if the body holds fewer than `size_of::<U>()` bytes.
    pub fn pop<U: Pod>(&mut self) -> U {
        let size = mem::size_of::<U>();
        assert!(
            self.body.len() >= size,
            "cannot pop {} bytes from a {}-byte message body",
            size,
            self.body.len()
        );
        let split = self.body.len() - size;
        let value = bytemuck::pod_read_unaligned(&self.body[split..]);
        self.body.truncate(split);
        value
    }

    /// Append raw bytes to the end of the body.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.body.extend_from_slice(bytes);
        self
    }

    /// Take `len` raw bytes back off the end of the body.
    ///
    /// # Panics
    ///
    /// Panics if the body holds fewer than `len` bytes.
    pub fn pop_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(
            self.body.len() >= len,
            "cannot pop {} bytes from a {}-byte message body",
            len,
            self.body.len()
        );
        self.body.split_off(self.body.len() - len)
    }
}

impl<T: MessageId> fmt::Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type: {:?} size: {}", self.kind, self.body.len())
    }
}

/// A message paired with the id of the peer it came from.
///
/// The server deposits messages from every client into one shared queue, so
/// each entry carries its sender. On a client, `remote` is always
/// [`SERVER_USER_ID`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage<T: MessageId> {
    /// Id of the peer that sent this message.
    pub remote: UserId,
    /// The message itself.
    pub msg: Message<T>,
}

impl<T: MessageId> fmt::Display for TaggedMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote: {} message: {}", self.remote, self.msg)
    }
}
