//! Framed codec for master/shard communication.
//!
//! Uses LengthDelimitedCodec with an 8-byte big-endian length field for framing and
//! serde_json for serialization. [`FrameCodec`] is the streaming form used with
//! `FramedRead`/`FramedWrite`; [`encode_frame`] and [`decode_frame`] handle one frame
//! at a time for the identification handshake, where nothing past the first frame may
//! be consumed.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Width of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 8;

/// Frame size cap used unless [`FrameCodec::with_max_frame_length`] sets another.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to encode payload: {0}")]
    Encoding(#[source] serde_json::Error),

    /// Stream ended before a full prefix or a full payload arrived.
    #[error("truncated frame")]
    TruncatedFrame,

    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("frame exceeds limit of {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

fn length_delimited(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_BYTES)
        .max_frame_length(max_frame_length)
        .big_endian()
        .new_codec()
}

/// Codec that frames messages with an 8-byte length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec. Decodes `D`, encodes `E`.
pub struct FrameCodec<D, E = D> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    /// Part of a frame has been buffered or consumed.
    mid_frame: bool,
    _phantom: PhantomData<fn(E) -> D>,
}

impl<D, E> Default for FrameCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> FrameCodec<D, E> {
    pub fn new() -> Self {
        Self {
            inner: length_delimited(DEFAULT_MAX_FRAME_LENGTH),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            mid_frame: false,
            _phantom: PhantomData,
        }
    }

    pub fn with_max_frame_length(mut self, limit: usize) -> Self {
        self.inner = length_delimited(limit);
        self.max_frame_length = limit;
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn frame_error(&self, e: io::Error) -> FrameError {
        let too_large = e
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_large {
            FrameError::FrameTooLarge {
                limit: self.max_frame_length,
            }
        } else {
            FrameError::Io(e)
        }
    }
}

impl<D: DeserializeOwned, E> Decoder for FrameCodec<D, E> {
    type Item = D;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let buffered = !src.is_empty();
        match self.inner.decode(src).map_err(|e| self.frame_error(e))? {
            Some(bytes) => {
                self.mid_frame = false;
                serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(FrameError::MalformedPayload)
            }
            None => {
                self.mid_frame |= buffered;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if self.mid_frame => Err(FrameError::TruncatedFrame),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for FrameCodec<D, E> {
    type Error = FrameError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(FrameError::Encoding)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        if json_len > self.max_frame_length {
            return Err(FrameError::FrameTooLarge {
                limit: self.max_frame_length,
            });
        }
        self.inner.encode(Bytes::from(json), dst).map_err(FrameError::Io)
    }
}

/// Serialize one payload into a complete frame.
pub fn encode_frame<T: Serialize>(payload: &T) -> Result<Vec<u8>, FrameError> {
    let mut frame = BytesMut::new();
    FrameCodec::<(), &T>::new().encode(payload, &mut frame)?;
    Ok(frame.to_vec())
}

/// Read exactly one frame from `reader`, consuming nothing beyond it.
pub async fn decode_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_frame(reader, DEFAULT_MAX_FRAME_LENGTH).await
}

/// Like [`decode_frame`], rejecting frames longer than `limit` before reading them.
pub async fn decode_frame_capped<R, T>(reader: &mut R, limit: usize) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_frame(reader, limit).await
}

async fn read_frame<R, T>(reader: &mut R, limit: usize) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut codec = FrameCodec::<T, ()>::new().with_max_frame_length(limit);
    let mut buf = BytesMut::from(&[0u8; LENGTH_PREFIX_BYTES][..]);
    reader.read_exact(&mut buf).await.map_err(truncated_on_eof)?;
    let length = (&buf[..]).get_u64();

    // The codec checks the prefix against the limit and consumes it.
    if let Some(item) = codec.decode(&mut buf)? {
        return Ok(item);
    }

    // Grow with the data actually received rather than trusting the prefix.
    let mut payload = Vec::new();
    (&mut *reader).take(length).read_to_end(&mut payload).await?;
    buf.extend_from_slice(&payload);
    codec.decode_eof(&mut buf)?.ok_or(FrameError::TruncatedFrame)
}

fn truncated_on_eof(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::TruncatedFrame
    } else {
        FrameError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Envelope, Identify};
    use futures::StreamExt;
    use serde_json::{Value, json};
    use tokio_util::bytes::BufMut;
    use tokio_util::codec::FramedRead;

    fn sample_call() -> Envelope {
        Envelope::call(
            "setup",
            json!({"heartbeatInterval": 30}).as_object().unwrap().clone(),
            0,
        )
    }

    #[test]
    fn codec_roundtrip_call() {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        codec.encode(sample_call(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, sample_call());
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_roundtrip_result() {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let result = Envelope::result(json!({"uptime": 12.5, "name": "bot", "shards": [0, 1]}), 9);
        codec.encode(result.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(result));
    }

    #[test]
    fn prefix_is_big_endian_payload_length() {
        let value = json!({"result": true, "id": 1});
        let frame = encode_frame(&value).unwrap();
        let payload = serde_json::to_vec(&value).unwrap();

        assert_eq!(frame[..8], (payload.len() as u64).to_be_bytes());
        assert_eq!(frame[8..], payload[..]);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::<Envelope>::new();
        let frame = encode_frame(&sample_call()).unwrap();

        let mut buf = BytesMut::from(&frame[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[5..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample_call()));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        codec.encode(sample_call(), &mut buf).unwrap();
        codec.encode(Envelope::result(json!(1), 0), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample_call()));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Envelope::result(json!(1), 0))
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn eof_inside_frame_is_truncated() {
        let frame = encode_frame(&sample_call()).unwrap();

        let mut short_prefix = BytesMut::from(&frame[..3]);
        assert!(matches!(
            FrameCodec::<Envelope>::new().decode_eof(&mut short_prefix),
            Err(FrameError::TruncatedFrame)
        ));

        let mut short_payload = BytesMut::from(&frame[..frame.len() - 2]);
        assert!(matches!(
            FrameCodec::<Envelope>::new().decode_eof(&mut short_payload),
            Err(FrameError::TruncatedFrame)
        ));

        let mut empty = BytesMut::new();
        assert!(
            FrameCodec::<Envelope>::new()
                .decode_eof(&mut empty)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn prefix_alone_then_eof_is_truncated() {
        let mut codec = FrameCodec::<Envelope>::new();
        let frame = encode_frame(&sample_call()).unwrap();

        let mut buf = BytesMut::from(&frame[..LENGTH_PREFIX_BYTES]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::TruncatedFrame)
        ));
    }

    #[test]
    fn malformed_payload() {
        let mut codec = FrameCodec::<Value>::new();
        let mut buf = BytesMut::new();
        buf.put_u64(4);
        buf.extend_from_slice(b"{no}");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MalformedPayload(_))
        ));
    }

    #[test]
    fn envelope_shape_violation_is_malformed() {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::from(
            &encode_frame(&json!({"method": "ping", "params": {}, "result": 1, "id": 0})).unwrap()[..],
        );

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MalformedPayload(_))
        ));
    }

    #[test]
    fn frame_limit_is_enforced_before_buffering() {
        let mut codec = FrameCodec::<Value>::new().with_max_frame_length(16);
        let mut buf = BytesMut::new();
        buf.put_u64(1 << 40);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge { limit: 16 })
        ));
    }

    #[tokio::test]
    async fn framed_read_reports_truncation_at_eof() {
        let mut bytes = encode_frame(&sample_call()).unwrap();
        let second = encode_frame(&sample_call()).unwrap();
        bytes.extend_from_slice(&second[..second.len() / 2]);

        let mut reader = FramedRead::new(&bytes[..], FrameCodec::<Envelope>::new());
        assert_eq!(reader.next().await.unwrap().unwrap(), sample_call());
        assert!(matches!(
            reader.next().await,
            Some(Err(FrameError::TruncatedFrame))
        ));
    }

    #[tokio::test]
    async fn decode_frame_roundtrip_leaves_rest_unread() {
        let identify = Identify {
            shard_index: 1,
            password_hash: "hash".to_string(),
        };
        let mut bytes = encode_frame(&identify).unwrap();
        bytes.extend_from_slice(b"trailing");

        let mut reader = &bytes[..];
        let decoded: Identify = decode_frame(&mut reader).await.unwrap();

        assert_eq!(decoded, identify);
        assert_eq!(reader, b"trailing");
    }

    #[tokio::test]
    async fn decode_frame_truncated_inputs() {
        let frame = encode_frame(&sample_call()).unwrap();

        for cut in [0, 1, 7, 8, 9, frame.len() - 1] {
            let mut reader = &frame[..cut];
            let result: Result<Envelope, _> = decode_frame(&mut reader).await;
            assert!(
                matches!(result, Err(FrameError::TruncatedFrame)),
                "cut at {cut} should be truncated"
            );
        }
    }

    #[tokio::test]
    async fn decode_frame_capped_rejects_oversized_prefix() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(1u64 << 33).to_be_bytes());
        let mut reader = &bytes[..];

        let result: Result<Value, _> = decode_frame_capped(&mut reader, 1024).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge { limit: 1024 })));
    }

    #[test]
    fn oversized_payload_is_not_encoded() {
        let mut codec = FrameCodec::<Value>::new().with_max_frame_length(8);
        let mut buf = BytesMut::new();

        assert!(matches!(
            codec.encode(json!({"name": "far too long"}), &mut buf),
            Err(FrameError::FrameTooLarge { limit: 8 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_at_the_limit_decodes() {
        let payload = serde_json::to_vec(&json!([1, 2])).unwrap();
        let mut codec = FrameCodec::<Value>::new().with_max_frame_length(payload.len());
        let mut buf = BytesMut::from(&encode_frame(&json!([1, 2])).unwrap()[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!([1, 2])));
    }
}
