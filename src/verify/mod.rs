mod gemini;
mod queue;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::{
    config::ConfigVerification,
    detect::BoundingBox,
    frame::{self, FrameError},
};

pub use gemini::{GeminiVerifier, Availability};
pub use queue::{VerificationQueue, VerifyResult};

/// Outcome of a second opinion on a detection
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub enum Verdict {
    Verified { score: f32, reason: String },
    Rejected { score: f32, reason: String },
    QuotaExceeded,
    Failed { reason: String },
}

impl Verdict {
    pub fn score(&self) -> Option<f32> {
        match self {
            Verdict::Verified { score, .. } | Verdict::Rejected { score, .. } => Some(*score),
            _ => None,
        }
    }
    pub fn reason(&self) -> String {
        match self {
            Verdict::Verified { reason, .. } | Verdict::Rejected { reason, .. } => reason.clone(),
            Verdict::QuotaExceeded => "API quota exceeded".into(),
            Verdict::Failed { reason } => reason.clone(),
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;
    async fn verify(&self, jpeg: &[u8], detector_confidence: f32) -> Verdict;
}

/// Encodes the image sent for verification: optionally cropped to the detection, downscaled
pub fn prepare_image(
    image: &RgbImage,
    bbox: &BoundingBox,
    cfg: &ConfigVerification,
) -> Result<Vec<u8>, FrameError> {
    let source = if cfg.crop_to_detection {
        frame::crop(image, &expand(bbox, 0.25))
    } else {
        image.clone()
    };
    let small = frame::downscale_to(&source, cfg.max_image_side);
    frame::encode_jpeg(&small, cfg.jpeg_quality)
}

/// Grows a box by `fraction` of its size on each side, for context around the flames
fn expand(bbox: &BoundingBox, fraction: f32) -> BoundingBox {
    let dx = bbox.width() * fraction;
    let dy = bbox.height() * fraction;
    BoundingBox::new(bbox.x1 - dx, bbox.y1 - dy, bbox.x2 + dx, bbox.y2 + dy)
}

quick_error! {
    #[derive(Debug)]
    pub enum VerifyError {
        Client(error: reqwest::Error) {
            display("Unable to build verification client: {}", error)
            source(error)
        }
    }
}

#[cfg(test)]
mod test {
    use image::RgbImage;

    use super::{expand, prepare_image, Verdict};
    use crate::{config::ConfigVerification, detect::BoundingBox, frame};

    #[test]
    fn test_prepare_image_downscales() {
        let img = RgbImage::new(800, 600);
        let jpeg = prepare_image(&img, &BoundingBox::new(0.0, 0.0, 10.0, 10.0), &ConfigVerification::default()).unwrap();
        assert_eq!(frame::decode_jpeg(&jpeg).unwrap().dimensions(), (400, 300));

        let cfg = ConfigVerification {
            crop_to_detection: true,
            ..Default::default()
        };
        let jpeg = prepare_image(&img, &BoundingBox::new(100.0, 100.0, 200.0, 180.0), &cfg).unwrap();
        assert_eq!(frame::decode_jpeg(&jpeg).unwrap().dimensions(), (150, 120));
    }

    #[test]
    fn test_expand() {
        assert_eq!(
            expand(&BoundingBox::new(100.0, 100.0, 200.0, 140.0), 0.25),
            BoundingBox::new(75.0, 90.0, 225.0, 150.0)
        );
    }

    #[test]
    fn test_verdict_accessors() {
        let v = Verdict::Verified {
            score: 0.9,
            reason: "flames".into(),
        };
        assert_eq!(v.score(), Some(0.9));
        assert_eq!(Verdict::QuotaExceeded.score(), None);
        assert_eq!(Verdict::QuotaExceeded.reason(), "API quota exceeded");
    }
}
