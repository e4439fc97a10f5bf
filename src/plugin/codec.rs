use super::proto::Frame;
use super::RpcError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Upper bound on a single frame. Plugins never need more than a few KiB; this
/// only guards against a corrupted length prefix making us allocate gigabytes.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

/// 4-byte big-endian length, then the payload.
fn codec() -> LengthDelimitedCodec {
  LengthDelimitedCodec::builder()
    .length_field_length(4)
    .big_endian()
    .max_frame_length(MAX_FRAME_LEN)
    .new_codec()
}

pub fn reader<R: AsyncRead>(inner: R) -> FrameReader<R> {
  FramedRead::new(inner, codec())
}

pub fn writer<W: AsyncWrite>(inner: W) -> FrameWriter<W> {
  FramedWrite::new(inner, codec())
}

pub fn encode(frame: &Frame) -> Result<Bytes, RpcError> {
  Ok(Bytes::from(serde_json::to_vec(frame)?))
}

pub fn decode(payload: &[u8]) -> Result<Frame, RpcError> {
  serde_json::from_slice(payload).map_err(|error| RpcError::Protocol(error.to_string()))
}
