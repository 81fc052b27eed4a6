//! Minimal OGG container writer for Opus, per RFC 7845.
//!
//! Each Opus packet becomes one page; granule position advances 960
//! samples (20 ms at 48 kHz) per packet. The page CRC uses the
//! non-reflected polynomial 0x04C11DB7 — the reflected CRC-32 everyone
//! reaches for first produces files no demuxer will accept.

use std::io::{self, Write};

const OGG_MAGIC: &[u8; 4] = b"OggS";

const HEADER_TYPE_BOS: u8 = 0x02;
const HEADER_TYPE_EOS: u8 = 0x04;

/// Samples per packet at 48 kHz with 20 ms frames.
const GRANULE_PER_PACKET: u64 = lc_voice::SAMPLES_PER_FRAME;

/// Opus pre-skip in 48 kHz samples (typical encoder lookahead).
const PRE_SKIP: u16 = 312;

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04C1_1DB7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

pub fn page_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &b in data {
        crc = (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ b) as usize];
    }
    crc
}

/// Streaming OGG/Opus writer. Pages go out in order: OpusHead (BOS),
/// OpusTags, one audio page per packet, then an empty EOS page.
pub struct OggStream<W: Write> {
    w: W,
    serial: u32,
    page_seq: u32,
    granule: u64,
}

impl<W: Write> OggStream<W> {
    pub fn new(w: W, serial: u32) -> Self {
        Self {
            w,
            serial,
            page_seq: 0,
            granule: 0,
        }
    }

    /// Write the mandatory OpusHead and OpusTags pages.
    pub fn write_headers(&mut self) -> io::Result<()> {
        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(1); // channel count
        head.extend_from_slice(&PRE_SKIP.to_le_bytes());
        head.extend_from_slice(&48_000u32.to_le_bytes()); // input sample rate
        head.extend_from_slice(&0i16.to_le_bytes()); // output gain
        head.push(0); // mapping family
        self.write_page(&head, HEADER_TYPE_BOS, 0)?;

        let vendor = b"lc-media";
        let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4);
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        tags.extend_from_slice(vendor);
        tags.extend_from_slice(&0u32.to_le_bytes()); // no user comments
        self.write_page(&tags, 0, 0)
    }

    /// Write one Opus packet as one audio page.
    pub fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.granule += GRANULE_PER_PACKET;
        self.write_page(packet, 0, self.granule)
    }

    /// Write the end-of-stream page and flush.
    pub fn finish(&mut self) -> io::Result<()> {
        self.write_page(&[], HEADER_TYPE_EOS, self.granule)?;
        self.w.flush()
    }

    pub fn granule(&self) -> u64 {
        self.granule
    }

    fn write_page(&mut self, packet: &[u8], header_type: u8, granule: u64) -> io::Result<()> {
        // Lacing: full 255-byte segments plus a terminator under 255.
        // Opus packets cap at 1275 bytes, so a page never overflows the
        // 255-segment table.
        let mut lacing = Vec::with_capacity(packet.len() / 255 + 1);
        if !packet.is_empty() {
            let mut rem = packet.len();
            while rem >= 255 {
                lacing.push(255u8);
                rem -= 255;
            }
            lacing.push(rem as u8);
        }

        let mut page = Vec::with_capacity(27 + lacing.len() + packet.len());
        page.extend_from_slice(OGG_MAGIC);
        page.push(0); // stream structure version
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.page_seq.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes()); // CRC placeholder
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(packet);

        let crc = page_crc(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());

        self.page_seq += 1;
        self.w.write_all(&page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_is_the_ogg_polynomial() {
        // Known value for the non-reflected 0x04C11DB7 polynomial with
        // zero init and no final xor, as used by OGG.
        assert_eq!(page_crc(&[0u8]), 0);
        assert_eq!(page_crc(b"\x01"), 0x04C1_1DB7);
        // Reflected CRC-32 of "123456789" would be 0xCBF43926; OGG's is not.
        assert_ne!(page_crc(b"123456789"), 0xCBF4_3926);
    }

    fn pages(buf: &[u8]) -> Vec<&[u8]> {
        // Split on "OggS" boundaries for structural assertions.
        let mut out = Vec::new();
        let mut starts: Vec<usize> = Vec::new();
        for i in 0..buf.len().saturating_sub(3) {
            if &buf[i..i + 4] == OGG_MAGIC {
                starts.push(i);
            }
        }
        for (n, &s) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(buf.len());
            out.push(&buf[s..end]);
        }
        out
    }

    #[test]
    fn stream_layout_and_granule() {
        let mut buf = Vec::new();
        {
            let mut ogg = OggStream::new(&mut buf, 0xABCD);
            ogg.write_headers().unwrap();
            ogg.write_packet(&[0x42; 100]).unwrap();
            ogg.write_packet(&[0x43; 300]).unwrap();
            assert_eq!(ogg.granule(), 1920);
            ogg.finish().unwrap();
        }

        let pages = pages(&buf);
        assert_eq!(pages.len(), 5);

        // BOS flag on the first page, EOS on the last.
        assert_eq!(pages[0][5], HEADER_TYPE_BOS);
        assert_eq!(pages[4][5], HEADER_TYPE_EOS);

        // OpusHead and OpusTags payloads in order.
        assert!(pages[0].windows(8).any(|w| w == b"OpusHead"));
        assert!(pages[1].windows(8).any(|w| w == b"OpusTags"));

        // Second audio page carries granule 1920.
        let granule = u64::from_le_bytes(pages[3][6..14].try_into().unwrap());
        assert_eq!(granule, 1920);

        // Page sequence numbers are consecutive.
        for (i, p) in pages.iter().enumerate() {
            let seq = u32::from_le_bytes(p[18..22].try_into().unwrap());
            assert_eq!(seq, i as u32);
        }
    }

    #[test]
    fn each_page_crc_verifies() {
        let mut buf = Vec::new();
        {
            let mut ogg = OggStream::new(&mut buf, 7);
            ogg.write_headers().unwrap();
            ogg.write_packet(b"opus-frame").unwrap();
            ogg.finish().unwrap();
        }
        for page in pages(&buf) {
            let stored = u32::from_le_bytes(page[22..26].try_into().unwrap());
            let mut zeroed = page.to_vec();
            zeroed[22..26].copy_from_slice(&[0; 4]);
            assert_eq!(page_crc(&zeroed), stored);
        }
    }

    #[test]
    fn long_packet_lacing_terminates() {
        let mut buf = Vec::new();
        {
            let mut ogg = OggStream::new(&mut buf, 7);
            // 510 bytes: two full segments plus a zero terminator.
            ogg.write_packet(&[0; 510]).unwrap();
        }
        let page = &pages(&buf)[0];
        let nsegs = page[26] as usize;
        assert_eq!(nsegs, 3);
        assert_eq!(&page[27..30], &[255, 255, 0]);
    }
}
