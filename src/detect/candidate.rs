use image::RgbImage;
use tracing::debug;

use super::{validate_fire_color, ColorRules, ColorStats, Detection};
use crate::{config::ConfigDetection, frame};

/// A detection that survived the size and colour checks
#[derive(Debug, PartialEq, Clone)]
pub struct Candidate {
    pub detection: Detection,
    pub area: f32,
    /// Absent when colour validation is disabled
    pub color: Option<ColorStats>,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct Screening {
    /// Sorted by confidence, highest first
    pub candidates: Vec<Candidate>,
    pub too_small: usize,
    pub color_rejected: usize,
}

impl Screening {
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

/// Filters raw detections down to the ones worth verifying
pub fn screen_detections(
    image: &RgbImage,
    detections: Vec<Detection>,
    cfg: &ConfigDetection,
) -> Screening {
    let rules = ColorRules::from(&cfg.color);
    let mut screening = Screening::default();
    for detection in detections {
        let area = detection.bbox.area();
        if area < cfg.min_area as f32 {
            screening.too_small += 1;
            continue;
        }
        let color = if cfg.color.enabled {
            let roi = frame::crop(image, &detection.bbox);
            let verdict = validate_fire_color(&roi, &rules);
            if !verdict.passed {
                debug!(
                    reason=%verdict.reason,
                    fire=verdict.stats.fire_ratio,
                    white=verdict.stats.white_ratio,
                    saturation=verdict.stats.avg_saturation,
                    confidence=detection.confidence,
                    "Detection rejected by colour check"
                );
                screening.color_rejected += 1;
                continue;
            }
            Some(verdict.stats)
        } else {
            None
        };
        screening.candidates.push(Candidate {
            detection,
            area,
            color,
        });
    }
    screening.candidates.sort_by(|a, b| {
        b.detection
            .confidence
            .partial_cmp(&a.detection.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    screening
}
