//! Packet framing.
//!
//! Plain packets carry a 4-byte header: 3-byte little-endian payload length
//! and a 1-byte sequence id. Payloads of `MAX_PAYLOAD` bytes or more are split
//! into several packets; a packet shorter than `MAX_PAYLOAD` ends the payload.
//!
//! With `CLIENT_COMPRESS` the plain packet stream is wrapped again in
//! compressed frames with a 7-byte header: 3-byte compressed length, 1-byte
//! compression sequence id, 3-byte uncompressed length (0 = stored).

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{Error, Result};

use super::codec::{write_u24, write_u8};

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// Size of a plain packet header.
pub const HEADER_LEN: usize = 4;

/// Size of a compressed frame header.
pub const COMPRESSED_HEADER_LEN: usize = 7;

/// Payloads shorter than this are sent stored rather than deflated.
pub const MIN_COMPRESS_LEN: usize = 50;

/// Parse a plain packet header into `(payload_len, sequence_id)`.
#[inline]
pub fn parse_header(header: [u8; HEADER_LEN]) -> (usize, u8) {
    let len = usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16);
    (len, header[3])
}

/// Parse a compressed frame header into `(compressed_len, sequence_id, uncompressed_len)`.
#[inline]
pub fn parse_compressed_header(header: [u8; COMPRESSED_HEADER_LEN]) -> (usize, u8, usize) {
    let compressed =
        usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16);
    let uncompressed =
        usize::from(header[4]) | (usize::from(header[5]) << 8) | (usize::from(header[6]) << 16);
    (compressed, header[3], uncompressed)
}

/// Frame a payload into one or more plain packets.
///
/// `seq` is advanced once per emitted packet.
pub fn write_packets(out: &mut Vec<u8>, payload: &[u8], seq: &mut u8) {
    let mut chunks = payload.chunks(MAX_PAYLOAD);
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        write_u24(out, chunk.len() as u32);
        write_u8(out, *seq);
        *seq = seq.wrapping_add(1);
        out.extend_from_slice(chunk);
        if chunk.len() < MAX_PAYLOAD {
            break;
        }
    }
}

/// Wrap already-framed plain packets into compressed frames.
pub fn write_compressed(out: &mut Vec<u8>, data: &[u8], seq: &mut u8) -> Result<()> {
    for chunk in data.chunks(MAX_PAYLOAD) {
        if chunk.len() < MIN_COMPRESS_LEN {
            write_u24(out, chunk.len() as u32);
            write_u8(out, *seq);
            write_u24(out, 0);
            out.extend_from_slice(chunk);
        } else {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(chunk)?;
            let deflated = encoder.finish()?;
            write_u24(out, deflated.len() as u32);
            write_u8(out, *seq);
            write_u24(out, chunk.len() as u32);
            out.extend_from_slice(&deflated);
        }
        *seq = seq.wrapping_add(1);
    }
    Ok(())
}

/// Inflate the body of a compressed frame.
///
/// `uncompressed_len == 0` means the body was stored as-is.
pub fn decompress(body: &[u8], uncompressed_len: usize, out: &mut Vec<u8>) -> Result<()> {
    if uncompressed_len == 0 {
        out.extend_from_slice(body);
        return Ok(());
    }
    let start = out.len();
    out.reserve(uncompressed_len);
    // One byte past the announced length is enough to detect an overrun
    ZlibDecoder::new(body)
        .take(uncompressed_len as u64 + 1)
        .read_to_end(out)?;
    let inflated = out.len() - start;
    if inflated != uncompressed_len {
        return Err(Error::Protocol(format!(
            "compressed frame inflated to {inflated} bytes, header said {uncompressed_len}"
        )));
    }
    Ok(())
}
