mod candidate;
mod color;
mod yolo;

use image::RgbImage;
use serde::{Deserialize, Serialize};

pub use candidate::{screen_detections, Candidate, Screening};
pub use color::{validate_fire_color, ColorRules, ColorStats};
pub use yolo::YoloDetector;

/// Axis aligned box in frame pixel coordinates
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
    /// Restricts the box to `0..width` x `0..height`, rounding to whole pixels
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        BoundingBox {
            x1: self.x1.floor().clamp(0.0, w),
            y1: self.y1.floor().clamp(0.0, h),
            x2: self.x2.ceil().clamp(0.0, w),
            y2: self.y2.ceil().clamp(0.0, h),
        }
    }
    /// Integer corners as published in alerts, `[x1, y1, x2, y2]`
    pub fn as_pixels(&self) -> [i32; 4] {
        [
            self.x1.round() as i32,
            self.y1.round() as i32,
            self.x2.round() as i32,
            self.y2.round() as i32,
        ]
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct Detection {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Something that finds fire in a frame.
///
/// Implementations must be callable from a blocking worker thread while shared between sessions.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectError>;
}

quick_error! {
    #[derive(Debug)]
    pub enum DetectError {
        ModelLoad(error: String) {
            display("Unable to load detection model: {}", error)
        }
        Inference(error: String) {
            display("Inference failed: {}", error)
        }
        OutputShape(error: String) {
            display("Unexpected model output: {}", error)
        }
    }
}
