use std::io::Cursor;

use chrono::{DateTime, Utc};
use image::{codecs::jpeg::JpegEncoder, imageops, ImageFormat, Rgb, RgbImage};

use crate::detect::BoundingBox;

/// A decoded camera frame together with the JPEG it came from
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Vec<u8>,
    pub image: RgbImage,
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn from_jpeg(jpeg: Vec<u8>, seq: u64) -> Result<Frame, FrameError> {
        let image = decode_jpeg(&jpeg)?;
        Ok(Frame {
            jpeg,
            image,
            seq,
            captured_at: Utc::now(),
        })
    }
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage, FrameError> {
    if bytes.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8())
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    image.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

/// Shrinks the image so its longest side is at most `max_side`. Smaller images are returned as is.
pub fn downscale_to(image: &RgbImage, max_side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if max_side == 0 || longest <= max_side {
        return image.clone();
    }
    let scale = max_side as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    imageops::resize(image, nw, nh, imageops::FilterType::Triangle)
}

/// Cuts the bounding box out of the image. The box is clamped to the image first.
pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let b = bbox.clamp_to(image.width(), image.height());
    let (x, y) = (b.x1 as u32, b.y1 as u32);
    let (w, h) = (b.width() as u32, b.height() as u32);
    imageops::crop_imm(image, x, y, w, h).to_image()
}

/// Draws a rectangle outline in place
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: [u8; 3], thickness: u32) {
    let (iw, ih) = image.dimensions();
    if iw == 0 || ih == 0 {
        return;
    }
    let b = bbox.clamp_to(iw, ih);
    let x1 = b.x1 as u32;
    let y1 = b.y1 as u32;
    let x2 = (b.x2 as u32).min(iw - 1);
    let y2 = (b.y2 as u32).min(ih - 1);
    if x2 < x1 || y2 < y1 {
        return;
    }
    let pixel = Rgb(color);
    for t in 0..thickness {
        let top = y1.saturating_add(t).min(y2);
        let bottom = y2.saturating_sub(t).max(y1);
        let left = x1.saturating_add(t).min(x2);
        let right = x2.saturating_sub(t).max(x1);
        for x in x1..=x2 {
            image.put_pixel(x, top, pixel);
            image.put_pixel(x, bottom, pixel);
        }
        for y in y1..=y2 {
            image.put_pixel(left, y, pixel);
            image.put_pixel(right, y, pixel);
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum FrameError {
        Empty {
            display("Frame contained no data")
        }
        Image(error: image::ImageError) {
            display("Unable to process image: {}", error)
            source(error)
            from()
        }
    }
}
