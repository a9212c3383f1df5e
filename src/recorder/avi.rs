//! Minimal AVI (RIFF) writer for Motion JPEG clips.
//!
//! Frames are appended to the `movi` list as they arrive. The header is written as a
//! placeholder and filled in once the frame count and rate are known.

use std::{
    io::{self, Cursor, SeekFrom},
    path::Path,
    time::Duration,
};

use image::{codecs::jpeg::JpegDecoder, ImageDecoder};
use tokio::{
    fs,
    io::{AsyncSeekExt, AsyncWriteExt},
};

const HEADER_LEN: usize = 224;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const DEFAULT_FRAME_MICROS: u32 = 50_000;

pub struct AviWriter {
    file: fs::File,
    /// (offset from the `movi` fourcc, payload size) per frame
    index: Vec<(u32, u32)>,
    movi_len: u32,
    largest: u32,
    dimensions: Option<(u32, u32)>,
}

impl AviWriter {
    pub async fn create(path: &Path) -> io::Result<AviWriter> {
        let mut file = fs::File::create(path).await?;
        file.write_all(&[0u8; HEADER_LEN]).await?;
        Ok(AviWriter {
            file,
            index: Vec::new(),
            movi_len: 0,
            largest: 0,
            dimensions: None,
        })
    }

    pub async fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()> {
        if self.dimensions.is_none() {
            self.dimensions = jpeg_dimensions(jpeg);
        }
        let size = jpeg.len() as u32;
        let mut chunk = Vec::with_capacity(jpeg.len() + 9);
        chunk.extend_from_slice(b"00dc");
        chunk.extend_from_slice(&size.to_le_bytes());
        chunk.extend_from_slice(jpeg);
        if jpeg.len() % 2 == 1 {
            chunk.push(0);
        }
        self.file.write_all(&chunk).await?;
        self.index.push((4 + self.movi_len, size));
        self.movi_len += chunk.len() as u32;
        self.largest = self.largest.max(size);
        Ok(())
    }

    /// Writes the index and the final header. `duration` sets the playback rate.
    pub async fn finish(mut self, duration: Duration) -> io::Result<()> {
        let mut idx = Vec::with_capacity(8 + 16 * self.index.len());
        idx.extend_from_slice(b"idx1");
        put_u32(&mut idx, 16 * self.index.len() as u32);
        for (offset, size) in &self.index {
            idx.extend_from_slice(b"00dc");
            put_u32(&mut idx, AVIIF_KEYFRAME);
            put_u32(&mut idx, *offset);
            put_u32(&mut idx, *size);
        }
        self.file.write_all(&idx).await?;

        let frames = self.index.len() as u32;
        let header = ClipLayout {
            dimensions: self.dimensions.unwrap_or((0, 0)),
            frames,
            frame_micros: frame_micros(duration, frames),
            largest: self.largest,
            movi_len: self.movi_len,
        }
        .header();
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_all(&header).await?;
        self.file.flush().await
    }
}

fn frame_micros(duration: Duration, frames: u32) -> u32 {
    if frames == 0 || duration.is_zero() {
        return DEFAULT_FRAME_MICROS;
    }
    (duration.as_micros() / frames as u128).clamp(1, u32::MAX as u128) as u32
}

fn jpeg_dimensions(jpeg: &[u8]) -> Option<(u32, u32)> {
    JpegDecoder::new(Cursor::new(jpeg)).ok().map(|d| d.dimensions())
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct ClipLayout {
    dimensions: (u32, u32),
    frames: u32,
    frame_micros: u32,
    largest: u32,
    movi_len: u32,
}

impl ClipLayout {
    fn header(&self) -> Vec<u8> {
        let (width, height) = self.dimensions;
        let index_len = 8 + 16 * self.frames;
        let mut b = Vec::with_capacity(HEADER_LEN);

        b.extend_from_slice(b"RIFF");
        put_u32(&mut b, (HEADER_LEN as u32 - 8) + self.movi_len + index_len);
        b.extend_from_slice(b"AVI ");

        b.extend_from_slice(b"LIST");
        put_u32(&mut b, 192);
        b.extend_from_slice(b"hdrl");

        b.extend_from_slice(b"avih");
        put_u32(&mut b, 56);
        put_u32(&mut b, self.frame_micros);
        let per_sec = self.largest as u64 * 1_000_000 / self.frame_micros.max(1) as u64;
        put_u32(&mut b, per_sec.min(u32::MAX as u64) as u32);
        put_u32(&mut b, 0);
        put_u32(&mut b, AVIF_HASINDEX);
        put_u32(&mut b, self.frames);
        put_u32(&mut b, 0);
        put_u32(&mut b, 1);
        put_u32(&mut b, self.largest);
        put_u32(&mut b, width);
        put_u32(&mut b, height);
        b.extend_from_slice(&[0u8; 16]);

        b.extend_from_slice(b"LIST");
        put_u32(&mut b, 116);
        b.extend_from_slice(b"strl");

        b.extend_from_slice(b"strh");
        put_u32(&mut b, 56);
        b.extend_from_slice(b"vids");
        b.extend_from_slice(b"MJPG");
        put_u32(&mut b, 0);
        put_u16(&mut b, 0);
        put_u16(&mut b, 0);
        put_u32(&mut b, 0);
        // Rate / scale is frames per second
        put_u32(&mut b, self.frame_micros);
        put_u32(&mut b, 1_000_000);
        put_u32(&mut b, 0);
        put_u32(&mut b, self.frames);
        put_u32(&mut b, self.largest);
        put_u32(&mut b, u32::MAX);
        put_u32(&mut b, 0);
        put_u16(&mut b, 0);
        put_u16(&mut b, 0);
        put_u16(&mut b, width.min(u16::MAX as u32) as u16);
        put_u16(&mut b, height.min(u16::MAX as u32) as u16);

        b.extend_from_slice(b"strf");
        put_u32(&mut b, 40);
        put_u32(&mut b, 40);
        put_u32(&mut b, width);
        put_u32(&mut b, height);
        put_u16(&mut b, 1);
        put_u16(&mut b, 24);
        b.extend_from_slice(b"MJPG");
        put_u32(&mut b, width.saturating_mul(height).saturating_mul(3));
        b.extend_from_slice(&[0u8; 16]);

        b.extend_from_slice(b"LIST");
        put_u32(&mut b, 4 + self.movi_len);
        b.extend_from_slice(b"movi");
        b
    }
}
