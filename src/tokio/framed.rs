//! Packet-level I/O over a [`Stream`]: sequence ids, multi-packet payloads
//! and the optional compressed envelope.

use crate::error::{Error, Result};
use crate::protocol::packet::{
    COMPRESSED_HEADER_LEN, HEADER_LEN, MAX_PAYLOAD, decompress, parse_compressed_header,
    parse_header, write_compressed, write_packets,
};

use super::stream::Stream;

#[derive(Debug)]
pub struct PacketIo {
    stream: Stream,
    seq: u8,
    compressed: bool,
    compressed_seq: u8,
    inflated: Vec<u8>,
    inflated_pos: usize,
    frame_buf: Vec<u8>,
    compress_buf: Vec<u8>,
}

impl PacketIo {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            seq: 0,
            compressed: false,
            compressed_seq: 0,
            inflated: Vec::new(),
            inflated_pos: 0,
            frame_buf: Vec::new(),
            compress_buf: Vec::new(),
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Switch to the compressed protocol (after a handshake that negotiated it).
    pub fn enable_compression(&mut self) {
        self.compressed = true;
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Start a new command: sequence ids restart at zero.
    pub fn reset_seq(&mut self) {
        self.seq = 0;
        self.compressed_seq = 0;
    }

    /// Read one logical payload, reassembling continuation packets.
    pub async fn read_packet(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        loop {
            let mut header = [0u8; HEADER_LEN];
            self.read_raw(&mut header).await?;
            let (len, seq) = parse_header(header);
            // Inner sequence ids are not reliable under compression
            if !self.compressed && seq != self.seq {
                return Err(Error::Protocol(format!(
                    "packet out of order: expected sequence {}, got {seq}",
                    self.seq
                )));
            }
            self.seq = seq.wrapping_add(1);
            let start = out.len();
            out.resize(start + len, 0);
            self.read_raw(&mut out[start..]).await?;
            if len < MAX_PAYLOAD {
                return Ok(());
            }
        }
    }

    /// Frame, optionally compress, write and flush one payload.
    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.frame_buf.clear();
        write_packets(&mut self.frame_buf, payload, &mut self.seq);
        if self.compressed {
            self.compress_buf.clear();
            write_compressed(&mut self.compress_buf, &self.frame_buf, &mut self.compressed_seq)?;
            self.stream.write_all(&self.compress_buf).await?;
        } else {
            self.stream.write_all(&self.frame_buf).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.compressed {
            self.stream.read_exact(buf).await?;
            return Ok(());
        }
        let mut filled = 0;
        while filled < buf.len() {
            if self.inflated_pos == self.inflated.len() {
                self.read_compressed_frame().await?;
                continue;
            }
            let n = (buf.len() - filled).min(self.inflated.len() - self.inflated_pos);
            buf[filled..filled + n]
                .copy_from_slice(&self.inflated[self.inflated_pos..self.inflated_pos + n]);
            filled += n;
            self.inflated_pos += n;
        }
        Ok(())
    }

    async fn read_compressed_frame(&mut self) -> Result<()> {
        let mut header = [0u8; COMPRESSED_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let (compressed_len, seq, uncompressed_len) = parse_compressed_header(header);
        if seq != self.compressed_seq {
            return Err(Error::Protocol(format!(
                "compressed frame out of order: expected sequence {}, got {seq}",
                self.compressed_seq
            )));
        }
        self.compressed_seq = seq.wrapping_add(1);
        let mut body = std::mem::take(&mut self.compress_buf);
        body.clear();
        body.resize(compressed_len, 0);
        self.stream.read_exact(&mut body).await?;
        self.inflated.clear();
        self.inflated_pos = 0;
        let result = decompress(&body, uncompressed_len, &mut self.inflated);
        self.compress_buf = body;
        result
    }
}
