// Copyright (C) 2025 The Lodestar Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for component connections.
//!
//! Every message on a component's TCP connection is one frame:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! Framing is payload-agnostic. By convention the payload is an encoded
//! [`Envelope`](crate::envelope::Envelope).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size (4 bytes length)
pub const HEADER_SIZE: usize = 4;

/// Largest payload the length header can describe (~4 GiB)
pub const MAX_FRAME_SIZE: usize = u32::MAX as usize;

/// Default ceiling on accepted payloads (1 GiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1 << 30;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Build the length header for a payload of `len` bytes.
pub fn frame_header(len: usize) -> Result<[u8; HEADER_SIZE], FrameError> {
    let len = u32::try_from(len).map_err(|_| FrameError::FrameTooLarge(len))?;
    Ok(len.to_be_bytes())
}

/// Encode a payload into a frame for wire transmission
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let header = frame_header(payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode one frame from the front of an in-memory buffer.
///
/// Returns the payload and whatever follows it in `bytes`.
pub fn decode_frame(mut bytes: Bytes, max_payload: usize) -> Result<(Bytes, Bytes), FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::MalformedFrame("incomplete frame header"));
    }

    let length = bytes.get_u32() as usize;
    if length > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: length,
            max: max_payload,
        });
    }

    if bytes.len() < length {
        return Err(FrameError::MalformedFrame("incomplete frame payload"));
    }

    let payload = bytes.split_to(length);
    Ok((payload, bytes))
}

/// Write one frame to an async writer.
///
/// Header and payload go out in a single buffer so a concurrent reader never
/// observes a header without its payload following it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let encoded = encode_frame(payload)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from an async reader.
///
/// Suspends until a full header and payload have arrived. A header claiming more
/// than `max_payload` bytes is rejected before any payload is read or buffered.
/// A zero-length frame yields an empty payload.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Bytes, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact_or_closed(reader, &mut header).await?;

    let length = u32::from_be_bytes(header) as usize;
    if length > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: length,
            max: max_payload,
        });
    }

    if length == 0 {
        return Ok(Bytes::new());
    }

    let mut payload = vec![0u8; length];
    read_exact_or_closed(reader, &mut payload).await?;

    Ok(Bytes::from(payload))
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
            ) =>
        {
            Err(FrameError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// Framed codec for reading/writing frames on a stream
pub struct FramedStream<S> {
    stream: S,
    max_payload: usize,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_payload(stream, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(stream: S, max_payload: usize) -> Self {
        Self {
            stream,
            max_payload,
        }
    }

    /// Payload ceiling applied to incoming frames
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Bytes, FrameError> {
        read_frame(&mut self.stream, self.max_payload).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.stream, payload).await
    }
}
