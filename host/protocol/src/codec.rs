//! Length-prefixed JSON framing. Each frame is a big-endian `u32` byte count followed by that
//! many bytes of JSON.

use anyhow::Context;
use futures_util::SinkExt;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{
    bytes::{Buf, BufMut, Bytes, BytesMut},
    codec::{Decoder, Encoder, FramedRead, FramedWrite},
};

/// Bodies are JSON, so float buffers holding NaN or an infinity cannot be framed at all; encoding
/// them fails before anything is written.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

// === Wrappers === //

pub type FrameDecoder<T> = FramedRead<T, DecodeCodec>;
pub type FrameEncoder<T> = FramedWrite<T, EncodeCodec>;

pub fn wrap_stream_tx<T: AsyncWrite>(tx: T) -> FrameEncoder<T> {
    FramedWrite::new(tx, EncodeCodec)
}

pub fn wrap_stream_rx<T: AsyncRead>(rx: T, max_frame_size: u32) -> FrameDecoder<T> {
    FramedRead::new(rx, DecodeCodec { max_frame_size })
}

/// Receives the next raw frame, or `None` once the stream has ended.
pub async fn recv_frame(
    decoder: &mut FrameDecoder<impl AsyncRead + Unpin>,
) -> anyhow::Result<Option<Bytes>> {
    match tokio_stream::StreamExt::next(decoder).await {
        Some(frame) => frame.map(Some),
        None => Ok(None),
    }
}

pub fn decode_frame<M: DeserializeOwned>(frame: &[u8]) -> anyhow::Result<M> {
    serde_json::from_slice(frame).context("failed to decode message frame")
}

pub async fn recv_message<M: DeserializeOwned>(
    decoder: &mut FrameDecoder<impl AsyncRead + Unpin>,
) -> anyhow::Result<Option<M>> {
    let Some(frame) = recv_frame(decoder).await? else {
        return Ok(None);
    };

    decode_frame(&frame).map(Some)
}

pub async fn feed_message<M: Serialize>(
    encoder: &mut FrameEncoder<impl AsyncWrite + Unpin>,
    message: M,
) -> anyhow::Result<()> {
    SinkExt::feed(encoder, message).await
}

pub async fn send_message<M: Serialize>(
    encoder: &mut FrameEncoder<impl AsyncWrite + Unpin>,
    message: M,
) -> anyhow::Result<()> {
    SinkExt::send(encoder, message).await
}

pub async fn flush_messages(
    encoder: &mut FrameEncoder<impl AsyncWrite + Unpin>,
) -> anyhow::Result<()> {
    SinkExt::<()>::flush(encoder).await
}

// === Codecs === //

#[derive(Debug, Copy, Clone)]
pub struct DecodeCodec {
    pub max_frame_size: u32,
}

impl Decoder for DecodeCodec {
    type Item = Bytes;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> anyhow::Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = {
            let mut tmp = [0u8; 4];
            tmp.copy_from_slice(&src[..4]);
            u32::from_be_bytes(tmp)
        };

        if len > self.max_frame_size {
            anyhow::bail!(
                "frame too large (got size {len}, which is greater than {})",
                self.max_frame_size
            );
        }

        let len = len as usize;

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        tracing::trace!("decoded frame with size {len}");

        let mut frame = src.split_to(4 + len);
        frame.advance(4);

        Ok(Some(frame.freeze()))
    }
}

#[derive(Debug, Copy, Clone)]
pub struct EncodeCodec;

impl<I: Serialize> Encoder<I> for EncodeCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: I, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0);

        if let Err(err) = serde_json::to_writer((&mut *dst).writer(), &item) {
            dst.truncate(start);
            return Err(anyhow::Error::new(err).context("failed to encode message"));
        }

        let len = u32::try_from(dst.len() - start - 4).context("frame too large")?;
        dst[start..start + 4].copy_from_slice(&len.to_be_bytes());

        tracing::trace!("encoded frame with size {len}");

        Ok(())
    }
}

// === Tests === //
