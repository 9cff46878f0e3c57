//! Wire protocol codec for pivot envelopes.
//!
//! Format: 1-byte tag + 4-byte little-endian payload length + bincode payload.
//!
//! The codec ensures:
//! - Exactly one envelope is consumed per decode
//! - Maximum payload size is enforced before buffering
//! - Partial reads return Ok(None) to support streaming

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_ENVELOPE_SIZE;
use crate::error::{Error, Result};
use crate::protocol::{tag, Envelope};

/// Length of the frame header (tag byte + u32 little-endian length).
pub const FRAME_HEADER_LEN: usize = 5;

/// Codec for tag-dispatched, length-prefixed bincode encoding of envelopes.
pub struct Codec;

impl Codec {
    /// Encode an envelope to bytes, including the 5-byte header.
    pub fn encode(envelope: &Envelope) -> Result<Bytes> {
        let payload = encode_payload(envelope)?;

        if payload.len() > MAX_ENVELOPE_SIZE {
            return Err(Error::Codec {
                message: format!(
                    "payload too large: {} bytes (max {})",
                    payload.len(),
                    MAX_ENVELOPE_SIZE
                ),
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u8(envelope.tag());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one envelope from a buffer.
    ///
    /// Returns:
    /// - Ok(Some(envelope)) if a complete envelope was decoded (buffer advanced)
    /// - Ok(None) if more data is needed (buffer unchanged)
    /// - Err on an unknown tag, oversized length, or malformed payload
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let tag_byte = buf[0];
        let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        // Reject an oversized length before waiting for more data.
        if len > MAX_ENVELOPE_SIZE {
            return Err(Error::Codec {
                message: format!("payload length {len} exceeds maximum {MAX_ENVELOPE_SIZE}"),
            });
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(len);

        decode_payload(tag_byte, &payload).map(Some)
    }

    /// Decode from a slice (convenience for testing).
    pub fn decode_slice(data: &[u8]) -> Result<Option<Envelope>> {
        let mut buf = BytesMut::from(data);
        Self::decode(&mut buf)
    }
}

/// Read exactly one envelope from an async stream. Blocks on partial input.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(map_eof)?;

    let tag_byte = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if len > MAX_ENVELOPE_SIZE {
        return Err(Error::Codec {
            message: format!("payload length {len} exceeds maximum {MAX_ENVELOPE_SIZE}"),
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_eof)?;

    decode_payload(tag_byte, &payload)
}

/// Write one envelope to an async stream and flush it.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let data = Codec::encode(envelope)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

fn encode_payload(envelope: &Envelope) -> Result<Vec<u8>> {
    fn serialize<T: serde::Serialize>(payload: &T) -> Result<Vec<u8>> {
        bincode::serialize(payload).map_err(|e| Error::Codec {
            message: format!("serialization failed: {e}"),
        })
    }

    match envelope {
        Envelope::ConnectRequest(p) => serialize(p),
        Envelope::ConnectResponse(p) => serialize(p),
        Envelope::HostPingRequest(p) => serialize(p),
        Envelope::HostPingResponse(p) => serialize(p),
        Envelope::InfoRequest => Ok(Vec::new()),
        Envelope::InfoReply(p) => serialize(p),
        Envelope::ListenerRequest(p) => serialize(p),
        Envelope::ListenerResponse(p) => serialize(p),
        Envelope::ListenerBindResponse(p) => serialize(p),
        Envelope::ListenerSockRequest(p) => serialize(p),
        Envelope::ListenerSockResponse(p) => serialize(p),
        Envelope::ListenerCloseRequest(p) => serialize(p),
        Envelope::ListenerCloseResponse(p) => serialize(p),
        Envelope::Close => Ok(Vec::new()),
    }
}

fn decode_payload(tag_byte: u8, payload: &[u8]) -> Result<Envelope> {
    fn deserialize<'a, T: serde::Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
        bincode::deserialize(payload).map_err(|e| Error::Codec {
            message: format!("deserialization failed: {e}"),
        })
    }

    let envelope = match tag_byte {
        tag::CONNECT_REQUEST => Envelope::ConnectRequest(deserialize(payload)?),
        tag::CONNECT_RESPONSE => Envelope::ConnectResponse(deserialize(payload)?),
        tag::HOST_PING_REQUEST => Envelope::HostPingRequest(deserialize(payload)?),
        tag::HOST_PING_RESPONSE => Envelope::HostPingResponse(deserialize(payload)?),
        tag::INFO_REQUEST => Envelope::InfoRequest,
        tag::INFO_REPLY => Envelope::InfoReply(deserialize(payload)?),
        tag::LISTENER_REQUEST => Envelope::ListenerRequest(deserialize(payload)?),
        tag::LISTENER_RESPONSE => Envelope::ListenerResponse(deserialize(payload)?),
        tag::LISTENER_BIND_RESPONSE => Envelope::ListenerBindResponse(deserialize(payload)?),
        tag::LISTENER_SOCK_REQUEST => Envelope::ListenerSockRequest(deserialize(payload)?),
        tag::LISTENER_SOCK_RESPONSE => Envelope::ListenerSockResponse(deserialize(payload)?),
        tag::LISTENER_CLOSE_REQUEST => Envelope::ListenerCloseRequest(deserialize(payload)?),
        tag::LISTENER_CLOSE_RESPONSE => Envelope::ListenerCloseResponse(deserialize(payload)?),
        tag::CLOSE => Envelope::Close,
        other => {
            return Err(Error::Protocol {
                message: format!("unknown envelope tag 0x{other:02X}"),
            });
        }
    };

    Ok(envelope)
}

// =============================================================================
// Tests
// =============================================================================
