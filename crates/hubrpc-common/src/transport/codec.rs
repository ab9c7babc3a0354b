use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Message, MessageType};

/// Readable-buffer ceiling (10 MiB). A peer that exceeds it is torn down.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Bytes taken by `total_len`, `type` and `id_len`.
pub const HEADER_LEN: usize = 12;

/// Length-value frame codec.
///
/// # Wire Format
///
/// All integers are 32-bit network byte order:
///
/// ```text
/// [total_len:4][type:4][id_len:4][id:id_len][body:total_len-8-id_len]
/// ```
///
/// `total_len` counts everything after itself. The body is the JSON
/// document produced by [`Message::to_body`].
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use hubrpc_common::protocol::{Message, RpcRequest};
/// use hubrpc_common::transport::FrameCodec;
/// use serde_json::json;
///
/// let message: Message = RpcRequest::new("add", json!({"num1": 2, "num2": 3})).into();
/// let mut buf = BytesMut::from(&FrameCodec::encode(&message).unwrap()[..]);
///
/// assert!(FrameCodec::can_decode(&buf));
/// let decoded = FrameCodec::decode(&mut buf).unwrap();
/// assert_eq!(decoded, message);
/// assert!(buf.is_empty());
/// ```
pub struct FrameCodec;

impl FrameCodec {
    /// Total frame length declared by the header at the front of `buf`,
    /// including the `total_len` field itself.
    ///
    /// Returns `None` until four bytes are available.
    pub fn declared_frame_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < 4 {
            return None;
        }
        let total_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        Some(total_len + 4)
    }

    /// True iff `buf` holds the full header and the whole declared frame.
    pub fn can_decode(buf: &[u8]) -> bool {
        if buf.len() < HEADER_LEN {
            return false;
        }
        match Self::declared_frame_len(buf) {
            Some(frame_len) => buf.len() >= frame_len,
            None => false,
        }
    }

    /// Consumes exactly one frame from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `buf` does not hold a complete frame (check [`can_decode`](Self::can_decode) first)
    /// - the declared lengths are inconsistent or exceed [`MAX_FRAME_SIZE`]
    /// - the type tag is unknown
    /// - the id is not UTF-8, the body is empty, or the body is not valid JSON
    ///   for the tagged variant
    ///
    /// Every error is a protocol violation; the caller must close the
    /// connection.
    pub fn decode(buf: &mut BytesMut) -> Result<Message> {
        if !Self::can_decode(buf) {
            return Err(RpcError::Protocol("incomplete frame".to_string()));
        }

        let total_len = buf.get_u32() as usize;
        if total_len + 4 > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge {
                len: total_len + 4,
                max: MAX_FRAME_SIZE,
            });
        }
        if total_len < 8 {
            return Err(RpcError::Protocol(format!("frame length {} below header size", total_len)));
        }
        let message_type = MessageType::try_from(buf.get_i32())?;
        let id_len = buf.get_u32() as usize;
        if id_len > total_len - 8 {
            return Err(RpcError::Protocol(format!(
                "id length {} exceeds frame length {}",
                id_len, total_len
            )));
        }
        let body_len = total_len - 8 - id_len;

        let id_bytes = buf.split_to(id_len);
        let body = buf.split_to(body_len);

        let id = String::from_utf8(id_bytes.to_vec())
            .map_err(|e| RpcError::Protocol(format!("correlation id is not utf-8: {}", e)))?;
        if body.is_empty() {
            return Err(RpcError::Protocol("empty message body".to_string()));
        }

        Message::from_body(message_type, id, &body)
    }

    /// Encodes a message as a single frame.
    pub fn encode(message: &Message) -> Result<Bytes> {
        let body = message.to_body()?;
        if body.is_empty() {
            return Err(RpcError::Protocol("empty message body".to_string()));
        }
        let id = message.id().as_bytes();
        let total_len = 8 + id.len() + body.len();
        if total_len + 4 > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge {
                len: total_len + 4,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(total_len + 4);
        buf.put_u32(total_len as u32);
        buf.put_i32(i32::from(message.message_type()));
        buf.put_u32(id.len() as u32);
        buf.put_slice(id);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}
