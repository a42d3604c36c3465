//! Request/response wire format for frame fetches.
//!
//! One fetch = one bidirectional stream. The client sends a fixed header
//! with optional quality/width/height overrides; the server answers with a
//! length-prefixed JPEG payload. A zero-length payload means the server
//! could not produce a frame ("no data") and must be treated as a failed
//! fetch by the caller.
//!
//! Fields are raw little-endian, no serde on the wire.

use anyhow::Result;
use bytes::Bytes;
use iroh::endpoint::{RecvStream, SendStream};

/// First byte of every request.
pub const REQUEST_MAGIC: u8 = 0x66;

const FLAG_QUALITY: u8 = 0x01;
const FLAG_WIDTH: u8 = 0x02;
const FLAG_HEIGHT: u8 = 0x04;
const KNOWN_FLAGS: u8 = FLAG_QUALITY | FLAG_WIDTH | FLAG_HEIGHT;

/// Upper bound on response payloads. A JPEG bigger than this is a bug.
pub const MAX_RESPONSE_SIZE: u32 = 64 * 1024 * 1024;

/// A single "fetch the current frame" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameRequest {
    /// JPEG quality override (0-100).
    pub quality: Option<u8>,
    /// Output width override in pixels.
    pub width: Option<u32>,
    /// Output height override in pixels.
    pub height: Option<u32>,
}

impl FrameRequest {
    /// Serialize to wire bytes: magic, flags, then present fields LE.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.quality.is_some() {
            flags |= FLAG_QUALITY;
        }
        if self.width.is_some() {
            flags |= FLAG_WIDTH;
        }
        if self.height.is_some() {
            flags |= FLAG_HEIGHT;
        }

        let mut buf = Vec::with_capacity(11);
        buf.push(REQUEST_MAGIC);
        buf.push(flags);
        if let Some(q) = self.quality {
            buf.push(q);
        }
        if let Some(w) = self.width {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        if let Some(h) = self.height {
            buf.extend_from_slice(&h.to_le_bytes());
        }
        buf
    }

    /// Number of body bytes implied by a flags byte.
    fn body_len(flags: u8) -> usize {
        let mut len = 0;
        if flags & FLAG_QUALITY != 0 {
            len += 1;
        }
        if flags & FLAG_WIDTH != 0 {
            len += 4;
        }
        if flags & FLAG_HEIGHT != 0 {
            len += 4;
        }
        len
    }

    /// Parse wire bytes back into a request.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            anyhow::bail!("Request truncated ({} bytes)", buf.len());
        }
        if buf[0] != REQUEST_MAGIC {
            anyhow::bail!("Bad request magic 0x{:02x}", buf[0]);
        }
        let flags = buf[1];
        if flags & !KNOWN_FLAGS != 0 {
            anyhow::bail!("Unknown request flags 0x{:02x}", flags);
        }
        let body = &buf[2..];
        if body.len() != Self::body_len(flags) {
            anyhow::bail!(
                "Request body length {} does not match flags 0x{:02x}",
                body.len(),
                flags
            );
        }

        let mut req = FrameRequest::default();
        let mut off = 0;
        if flags & FLAG_QUALITY != 0 {
            req.quality = Some(body[off]);
            off += 1;
        }
        if flags & FLAG_WIDTH != 0 {
            req.width = Some(u32::from_le_bytes(body[off..off + 4].try_into()?));
            off += 4;
        }
        if flags & FLAG_HEIGHT != 0 {
            req.height = Some(u32::from_le_bytes(body[off..off + 4].try_into()?));
        }
        Ok(req)
    }

    /// Write the request to a stream.
    pub async fn write_to(&self, send: &mut SendStream) -> Result<()> {
        send.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Read one request from a stream.
    pub async fn read_from(recv: &mut RecvStream) -> Result<Self> {
        let mut head = [0u8; 2];
        recv.read_exact(&mut head).await?;
        if head[0] != REQUEST_MAGIC {
            anyhow::bail!("Bad request magic 0x{:02x}", head[0]);
        }
        if head[1] & !KNOWN_FLAGS != 0 {
            anyhow::bail!("Unknown request flags 0x{:02x}", head[1]);
        }

        let mut body = vec![0u8; Self::body_len(head[1])];
        recv.read_exact(&mut body).await?;

        let mut buf = Vec::with_capacity(2 + body.len());
        buf.extend_from_slice(&head);
        buf.extend_from_slice(&body);
        Self::decode(&buf)
    }
}

/// Write a response payload. An empty payload signals "no data".
pub async fn write_response(send: &mut SendStream, payload: &[u8]) -> Result<()> {
    send.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    if !payload.is_empty() {
        send.write_all(payload).await?;
    }
    Ok(())
}

/// Read a response payload. `Ok(None)` is the server's "no data" answer.
pub async fn read_response(recv: &mut RecvStream) -> Result<Option<Bytes>> {
    let mut head = [0u8; 4];
    recv.read_exact(&mut head).await?;
    let len = u32::from_le_bytes(head);

    if len == 0 {
        return Ok(None);
    }
    if len > MAX_RESPONSE_SIZE {
        anyhow::bail!("Response length {} exceeds limit", len);
    }

    let mut payload = vec![0u8; len as usize];
    recv.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_full_request() {
        let req = FrameRequest {
            quality: Some(50),
            width: Some(640),
            height: Some(480),
        };
        let decoded = FrameRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_encode_decode_empty_request() {
        let req = FrameRequest::default();
        let bytes = req.encode();
        assert_eq!(bytes, vec![REQUEST_MAGIC, 0]);
        assert_eq!(FrameRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_encode_decode_partial_request() {
        let req = FrameRequest {
            quality: None,
            width: Some(1920),
            height: None,
        };
        let decoded = FrameRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.width, Some(1920));
        assert_eq!(decoded.quality, None);
        assert_eq!(decoded.height, None);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        assert!(FrameRequest::decode(&[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        assert!(FrameRequest::decode(&[REQUEST_MAGIC, 0x80]).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        // Flags claim quality+width but only quality is present.
        let buf = [REQUEST_MAGIC, FLAG_QUALITY | FLAG_WIDTH, 50];
        assert!(FrameRequest::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(FrameRequest::decode(&[REQUEST_MAGIC]).is_err());
        assert!(FrameRequest::decode(&[]).is_err());
    }
}
