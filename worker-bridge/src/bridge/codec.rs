//! Framed codec for the worker channel.
//!
//! LengthDelimitedCodec for framing + serde_json for the payload.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec that frames messages with a 4-byte length prefix and serializes with JSON.
///
/// Undecodable payloads surface as `InvalidData`, which the channel treats as fatal.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Command, RawWorkerMessage, RequestId, WorkerMessage};

    #[test]
    fn command_survives_framing() {
        let mut codec = JsonCodec::<Command>::new();
        let mut buf = BytesMut::new();

        let cmd = Command::CallHandler {
            path: "/h.ts".to_string(),
            api_version: "v1".to_string(),
            id: RequestId::new(42),
        };
        codec.encode(cmd.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, cmd);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<RawWorkerMessage>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                RawWorkerMessage::from(WorkerMessage::chunk(RequestId::new(1), &b"ab"[..])),
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let raw = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(
            WorkerMessage::try_from(raw).unwrap(),
            WorkerMessage::chunk(RequestId::new(1), &b"ab"[..])
        );
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut codec = JsonCodec::<RawWorkerMessage>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"{{{{");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<Command>::with_max_frame_length(8);
        let mut buf = BytesMut::new();

        let err = codec
            .encode(
                Command::ImportEndpoint {
                    path: "/a/very/long/path.ts".to_string(),
                    api_version: "v1".to_string(),
                    version: 1,
                },
                &mut buf,
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
