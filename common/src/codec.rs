//! Length-prefixed JSON framing.
//!
//! Wire format: `[u32 BE length][JSON payload]`, built on
//! `tokio_util::codec::LengthDelimitedCodec`. The length counts the payload
//! only.

use crate::error::{CommonError, Result};
use crate::net::Connection;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Maximum frame size: 64 MiB.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Reading half of a framed connection.
pub type FrameReader = FramedRead<ReadHalf<Connection>, LengthDelimitedCodec>;

/// Writing half of a framed connection.
pub type FrameWriter = FramedWrite<WriteHalf<Connection>, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Split a connection into independently owned framed halves.
pub fn split(connection: Connection) -> (FrameReader, FrameWriter) {
    let (reader, writer) = tokio::io::split(connection);
    (
        FramedRead::new(reader, codec()),
        FramedWrite::new(writer, codec()),
    )
}

/// Frame a reader that is not a [`Connection`] (pipes, test duplexes).
pub fn framed_read<R: AsyncRead>(reader: R) -> FramedRead<R, LengthDelimitedCodec> {
    FramedRead::new(reader, codec())
}

/// Frame a writer that is not a [`Connection`].
pub fn framed_write<W: AsyncWrite>(writer: W) -> FramedWrite<W, LengthDelimitedCodec> {
    FramedWrite::new(writer, codec())
}

/// Serialize `msg` into one frame payload.
///
/// Fails with a serialization error, never a network error, when the value
/// does not serialize or the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T) -> Result<Bytes> {
    let data = serde_json::to_vec(msg)
        .map_err(|e| CommonError::serialization_error_with_source("failed to encode frame", e))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(CommonError::serialization_error(format!(
            "frame of {} bytes exceeds the {} byte limit",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(Bytes::from(data))
}

/// Serialize `msg` and write it as one frame, flushing the sink.
///
/// An oversized or unserializable message is rejected before anything is
/// written, so the connection stays usable.
pub async fn write_message<W, T>(
    writer: &mut FramedWrite<W, LengthDelimitedCodec>,
    msg: &T,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let frame = encode_frame(msg)?;
    writer
        .send(frame)
        .await
        .map_err(|e| CommonError::network_error_with_source("failed to write frame", e))
}

/// Read the next frame and deserialize it.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly.
pub async fn read_message<R, T>(reader: &mut FramedRead<R, LengthDelimitedCodec>) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match reader.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(CommonError::network_error_with_source(
            "failed to read frame",
            e,
        )),
        Some(Ok(frame)) => serde_json::from_slice(&frame).map(Some).map_err(|e| {
            CommonError::deserialization_error_with_source("failed to decode frame", e)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::AsyncWriteExt;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Frame {
        Hello { name: String },
        Credit { slots: u32 },
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = framed_write(client);
        let mut reader = framed_read(server);

        write_message(&mut writer, &Frame::Hello { name: "w1".into() })
            .await
            .unwrap();
        write_message(&mut writer, &Frame::Credit { slots: 3 })
            .await
            .unwrap();
        drop(writer);

        let first: Option<Frame> = read_message(&mut reader).await.unwrap();
        assert_eq!(first, Some(Frame::Hello { name: "w1".into() }));
        let second: Option<Frame> = read_message(&mut reader).await.unwrap();
        assert_eq!(second, Some(Frame::Credit { slots: 3 }));
        let closed: Option<Frame> = read_message(&mut reader).await.unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_writing() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = framed_write(client);
        let mut reader = framed_read(server);

        let huge = "x".repeat(MAX_FRAME_SIZE);
        let err = write_message(&mut writer, &huge).await.unwrap_err();
        assert!(err.is_encoding());
        assert!(err.to_string().contains("exceeds"));

        // Nothing reached the wire and the writer still works.
        write_message(&mut writer, &Frame::Credit { slots: 1 })
            .await
            .unwrap();
        let next: Option<Frame> = read_message(&mut reader).await.unwrap();
        assert_eq!(next, Some(Frame::Credit { slots: 1 }));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_deserialization_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = framed_read(server);

        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{{{").await.unwrap();

        let err = read_message::<_, Frame>(&mut reader).await.unwrap_err();
        assert!(matches!(err, CommonError::DeserializationError { .. }));
    }

    #[tokio::test]
    async fn test_oversized_incoming_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = framed_read(server);

        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_message::<_, Frame>(&mut reader).await.unwrap_err();
        assert!(matches!(err, CommonError::NetworkError { .. }));
    }
}
