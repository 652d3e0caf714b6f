//! The native frame carried between routers.
//!
//! Header is 17 bytes little-endian: `len u64 | seqno u64 | cmd u8`,
//! followed by `len` body bytes.

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::PeerError;
use crate::error::Result;

/// A full message travelling to the peer.
pub const CMD_MESSAGE: u8 = 0x01;
/// Status response to a request: `code u16 | detail`.
pub const CMD_RESPONSE: u8 = 0x02;
/// One result of a streaming request.
pub const CMD_RESULT: u8 = 0x03;
/// End of a streaming request.
pub const CMD_END: u8 = 0x04;

/// Status code meaning success.
pub const STATUS_OKAY: u16 = 0;

/// Ceiling on a peer frame body.
pub const MAX_FRAME_BODY: u64 = 32 * 1024 * 1024;

/// One peer-link frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seqno: u64,
    pub cmd: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(seqno: u64, cmd: u8, body: Vec<u8>) -> Frame {
        Frame { seqno, cmd, body }
    }

    /// Read one frame; EOF mid-frame or at a boundary is a transport
    /// error (the link never closes cleanly from the remote side).
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
        let mut hdr = [0u8; 17];
        r.read_exact(&mut hdr).await?;
        let len = u64::from_le_bytes(hdr[0..8].try_into().expect("header slice"));
        let seqno = u64::from_le_bytes(hdr[8..16].try_into().expect("header slice"));
        let cmd = hdr[16];
        if len > MAX_FRAME_BODY {
            return Err(PeerError::BadFrame {
                reason: format!("body of {len} bytes exceeds ceiling"),
            });
        }
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body).await?;
        Ok(Frame { seqno, cmd, body })
    }

    /// Write the frame, header and body.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut hdr = [0u8; 17];
        hdr[0..8].copy_from_slice(&(self.body.len() as u64).to_le_bytes());
        hdr[8..16].copy_from_slice(&self.seqno.to_le_bytes());
        hdr[16] = self.cmd;
        w.write_all(&hdr).await?;
        w.write_all(&self.body).await?;
        w.flush().await?;
        Ok(())
    }

    /// Interpret a `CMD_RESPONSE` body as `(code, message)`.
    pub fn parse_status(&self) -> Result<(u16, String)> {
        if self.body.len() < 2 {
            return Err(PeerError::BadFrame {
                reason: "short status frame".to_string(),
            });
        }
        let code = u16::from_le_bytes(self.body[0..2].try_into().expect("status slice"));
        let message = String::from_utf8_lossy(&self.body[2..]).into_owned();
        Ok((code, message))
    }

    /// Build a status body.
    pub fn status_body(code: u16, message: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + message.len());
        body.extend_from_slice(&code.to_le_bytes());
        body.extend_from_slice(message.as_bytes());
        body
    }
}
