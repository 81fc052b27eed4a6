//! Newline-delimited JSON framing over the QUIC control stream.
//!
//! One UTF-8 JSON record per line, 64 KB cap. An oversize line is
//! discarded up to its terminating newline; the stream itself survives.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ControlMsg;

pub const MAX_LINE: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

pub struct LineReader {
    recv: quinn::RecvStream,
    buf: BytesMut,
    discarding: bool,
}

impl LineReader {
    pub fn new(recv: quinn::RecvStream) -> Self {
        Self {
            recv,
            buf: BytesMut::with_capacity(READ_CHUNK),
            discarding: false,
        }
    }

    /// Next line without its newline, or `None` at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if self.discarding {
                    self.discarding = false;
                    debug!("discarded tail of oversize control line");
                    continue;
                }
                return Ok(Some(line.freeze()));
            }

            if self.buf.len() > MAX_LINE {
                warn!(len = self.buf.len(), "control line over 64 KB, dropping");
                self.buf.clear();
                self.discarding = true;
            }

            match self.recv.read_chunk(READ_CHUNK, true).await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk.bytes),
                None => return Ok(None),
            }
        }
    }
}

/// Serialise a message into one wire line, newline included. A broadcast
/// marshals once and hands the same bytes to every recipient.
pub fn encode_line(msg: &ControlMsg) -> Result<Bytes> {
    let mut out = serde_json::to_vec(msg)?;
    out.push(b'\n');
    Ok(Bytes::from(out))
}

/// Single writer per connection: everything destined for this client's
/// control stream funnels through one mpsc so no lock is ever held
/// across stream I/O.
pub async fn run_writer(mut send: quinn::SendStream, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = send.write_all(&line).await {
            debug!("control writer closed: {e}");
            break;
        }
    }
    let _ = send.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_line_terminates_with_newline() {
        let line = encode_line(&ControlMsg::Pong { ts: 1 }).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        let parsed: ControlMsg = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert!(matches!(parsed, ControlMsg::Pong { ts: 1 }));
    }
}
