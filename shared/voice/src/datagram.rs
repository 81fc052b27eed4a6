//! Voice datagram wire format.
//!
//! Layout (big-endian):
//!   0..2  sender id (u16) — client-supplied, overwritten by the server
//!   2..4  sequence  (u16) — per sender, wraps naturally
//!   4..   Opus payload
//!
//! Decoding is a slice view; nothing here allocates.

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest Opus frame we accept (RFC 6716 hard limit).
pub const MAX_PAYLOAD: usize = 1275;

/// Largest valid datagram on the wire.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_PAYLOAD;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoiceHeader {
    pub sender: u16,
    pub seq: u16,
}

/// Parse a datagram into its header and payload view.
///
/// Returns `None` when the datagram is shorter than the header or longer
/// than `MAX_DATAGRAM`; such packets are dropped by the caller.
pub fn parse(buf: &[u8]) -> Option<(VoiceHeader, &[u8])> {
    if buf.len() < HEADER_LEN || buf.len() > MAX_DATAGRAM {
        return None;
    }
    let header = VoiceHeader {
        sender: u16::from_be_bytes([buf[0], buf[1]]),
        seq: u16::from_be_bytes([buf[2], buf[3]]),
    };
    Some((header, &buf[HEADER_LEN..]))
}

/// Overwrite the sender field in place with the server-assigned id.
///
/// The buffer must already have passed `parse`.
pub fn stamp_sender(buf: &mut [u8], sender: u16) {
    let be = sender.to_be_bytes();
    buf[0] = be[0];
    buf[1] = be[1];
}

/// Build a datagram. Used by clients and tests; the relay never encodes.
pub fn encode(sender: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&sender.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let dg = encode(513, 7, b"test-opus-data");
        let (hdr, payload) = parse(&dg).unwrap();
        assert_eq!(hdr.sender, 513);
        assert_eq!(hdr.seq, 7);
        assert_eq!(payload, b"test-opus-data");
    }

    #[test]
    fn length_gates() {
        assert!(parse(&[0u8; 3]).is_none());
        assert!(parse(&[0u8; 4]).is_some());
        assert!(parse(&vec![0u8; MAX_DATAGRAM]).is_some());
        assert!(parse(&vec![0u8; MAX_DATAGRAM + 1]).is_none());
    }

    #[test]
    fn header_only_datagram_has_empty_payload() {
        let (hdr, payload) = parse(&[0, 2, 0, 1]).unwrap();
        assert_eq!(hdr.sender, 2);
        assert_eq!(hdr.seq, 1);
        assert!(payload.is_empty());
    }

    #[test]
    fn stamp_overwrites_spoofed_sender() {
        let mut dg = encode(0xFFFF, 1, b"x");
        stamp_sender(&mut dg, 3);
        let (hdr, _) = parse(&dg).unwrap();
        assert_eq!(hdr.sender, 3);
        assert_eq!(hdr.seq, 1);
    }
}
