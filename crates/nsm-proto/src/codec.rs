//! Codec for encoding/decoding protocol messages

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed bincode codec for one message family
///
/// Format: [length: u32 big endian][payload: bincode serialized message]
pub struct MessageCodec<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> MessageCodec<M> {
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for MessageCodec<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageCodec")
    }
}

impl<M> Default for MessageCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Serialize> MessageCodec<M> {
    /// Append one framed message to `dst`
    pub fn encode_into(msg: &M, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

impl<M: DeserializeOwned> MessageCodec<M> {
    /// Decode a message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode_from(buf: &mut BytesMut) -> Result<Option<M>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > crate::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let msg_bytes = buf.split_to(length);

        Ok(Some(bincode::deserialize(&msg_bytes)?))
    }
}

impl<M: DeserializeOwned> Decoder for MessageCodec<M> {
    type Item = M;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>, CodecError> {
        Self::decode_from(src)
    }
}

impl<'a, M: Serialize> Encoder<&'a M> for MessageCodec<M> {
    type Error = CodecError;

    fn encode(&mut self, item: &'a M, dst: &mut BytesMut) -> Result<(), CodecError> {
        Self::encode_into(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RegistrarMessage;

    type RegistrarCodec = MessageCodec<RegistrarMessage>;

    fn encode(msg: &RegistrarMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        RegistrarCodec::encode_into(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode() {
        let msg = RegistrarMessage::DataplaneUnRegistration {
            dataplane_name: "dp1".to_string(),
        };

        let mut buf = encode(&msg);
        let decoded = RegistrarCodec::decode_from(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = RegistrarMessage::Liveness;
        let encoded = encode(&msg);

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(RegistrarCodec::decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(RegistrarCodec::decode_from(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = RegistrarMessage::RequestLiveness;
        let msg2 = RegistrarMessage::Liveness;

        let mut buf = encode(&msg1);
        buf.extend_from_slice(&encode(&msg2));

        let mut codec = RegistrarCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg1));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg2));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_reject_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32((crate::MAX_FRAME_SIZE + 1) as u32);
        let result = RegistrarCodec::decode_from(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }
}
