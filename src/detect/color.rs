//! Colour check applied to detector hits.
//!
//! Flames are saturated red, orange or yellow. Reflections, lamps and sky patches that the
//! detector mistakes for fire tend to be washed out or close to white, so a region is only
//! kept if enough of it falls in the flame hue band and it is not dominated by bright pixels.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::ConfigColor;

/// Hue limits on the 0..180 scale. Red wraps around so it is split in two.
const HUE_WARM_MAX: u8 = 35;
const HUE_RED_WRAP_MIN: u8 = 170;
const FIRE_MIN_SATURATION: u8 = 100;
const FIRE_MIN_VALUE: u8 = 100;
const WHITE_MIN_LUMA: u8 = 200;

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ColorRules {
    pub min_fire_ratio: f32,
    pub max_white_ratio: f32,
    pub min_saturation: f32,
}

impl From<&ConfigColor> for ColorRules {
    fn from(c: &ConfigColor) -> Self {
        Self {
            min_fire_ratio: c.min_fire_ratio,
            max_white_ratio: c.max_white_ratio,
            min_saturation: c.min_saturation,
        }
    }
}

/// Percentages are rounded to one decimal place
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy, Default)]
pub struct ColorStats {
    pub fire_ratio: f32,
    pub white_ratio: f32,
    pub avg_saturation: f32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ColorVerdict {
    pub passed: bool,
    pub reason: String,
    pub stats: ColorStats,
}

impl ColorVerdict {
    fn reject(reason: &str, stats: ColorStats) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            stats,
        }
    }
}

/// Converts to the 8-bit HSV convention used by most vision tooling: H in 0..180, S and V in 0..255
pub(crate) fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let s = if max > 0.0 { delta * 255.0 / max } else { 0.0 };
    let h = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let h = ((h / 2.0).round() as u16 % 180) as u8;
    (h, s.round() as u8, max as u8)
}

/// 8-bit grey level, BT.601 weights in 14-bit fixed point with rounding
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + (1 << 13)) >> 14) as u8
}

fn is_fire_pixel(h: u8, s: u8, v: u8) -> bool {
    s >= FIRE_MIN_SATURATION && v >= FIRE_MIN_VALUE && (h <= HUE_WARM_MAX || h >= HUE_RED_WRAP_MIN)
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

/// Checks whether a region of interest looks like real flames.
///
/// Checks run in order: empty region, too white, not enough fire hues, too little saturation.
/// The first failing check decides the reason.
pub fn validate_fire_color(roi: &RgbImage, rules: &ColorRules) -> ColorVerdict {
    let total = roi.width() as u64 * roi.height() as u64;
    if total == 0 {
        return ColorVerdict::reject("Empty ROI", ColorStats::default());
    }

    let mut fire = 0u64;
    let mut white = 0u64;
    let mut saturation_sum = 0u64;
    for p in roi.pixels() {
        let [r, g, b] = p.0;
        let (h, s, v) = rgb_to_hsv(r, g, b);
        if is_fire_pixel(h, s, v) {
            fire += 1;
        }
        if luma(r, g, b) > WHITE_MIN_LUMA {
            white += 1;
        }
        saturation_sum += s as u64;
    }

    let fire_ratio = fire as f32 / total as f32;
    let white_ratio = white as f32 / total as f32;
    let avg_saturation = saturation_sum as f32 / total as f32;
    let stats = ColorStats {
        fire_ratio: round1(fire_ratio * 100.0),
        white_ratio: round1(white_ratio * 100.0),
        avg_saturation: round1(avg_saturation),
    };

    if white_ratio > rules.max_white_ratio {
        return ColorVerdict::reject("Too white", stats);
    }
    if fire_ratio < rules.min_fire_ratio {
        return ColorVerdict::reject("Not enough fire colors", stats);
    }
    if avg_saturation < rules.min_saturation {
        return ColorVerdict::reject("Low saturation", stats);
    }
    ColorVerdict {
        passed: true,
        reason: "Valid fire colors".into(),
        stats,
    }
}

#[cfg(test)]
mod test {
    use image::{Rgb, RgbImage};

    use super::{luma, rgb_to_hsv, validate_fire_color, ColorRules};
    use crate::config::ConfigColor;

    fn rules() -> ColorRules {
        (&ConfigColor::default()).into()
    }

    #[test]
    fn test_hsv_conversion() {
        assert_eq!(rgb_to_hsv(255, 0, 0), (0, 255, 255));
        assert_eq!(rgb_to_hsv(255, 128, 0), (15, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 255), (120, 255, 255));
        assert_eq!(rgb_to_hsv(128, 128, 128), (0, 0, 128));
        assert_eq!(rgb_to_hsv(255, 0, 30), (176, 255, 255));
    }

    #[test]
    fn test_orange_accepted() {
        let roi = RgbImage::from_pixel(20, 20, Rgb([255, 128, 0]));
        let verdict = validate_fire_color(&roi, &rules());
        assert!(verdict.passed, "{:?}", verdict);
        assert_eq!(verdict.stats.fire_ratio, 100.0);
        assert_eq!(verdict.stats.white_ratio, 0.0);
        assert_eq!(verdict.stats.avg_saturation, 255.0);
    }

    #[test]
    fn test_white_rejected_first() {
        let roi = RgbImage::from_pixel(10, 10, Rgb([250, 250, 250]));
        let verdict = validate_fire_color(&roi, &rules());
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, "Too white");
        assert_eq!(verdict.stats.white_ratio, 100.0);
    }

    #[test]
    fn test_white_threshold_on_grey_level() {
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(201, 200, 199), 200);
        assert_eq!(luma(202, 201, 200), 201);

        // Weighted sum is just above 200 but the grey level is 200, so not white
        let roi = RgbImage::from_pixel(10, 10, Rgb([201, 200, 199]));
        let verdict = validate_fire_color(&roi, &rules());
        assert_eq!(verdict.stats.white_ratio, 0.0);
        assert_ne!(verdict.reason, "Too white");

        let roi = RgbImage::from_pixel(10, 10, Rgb([202, 201, 200]));
        assert_eq!(validate_fire_color(&roi, &rules()).stats.white_ratio, 100.0);
    }

    #[test]
    fn test_blue_rejected() {
        let roi = RgbImage::from_pixel(10, 10, Rgb([0, 0, 255]));
        let verdict = validate_fire_color(&roi, &rules());
        assert_eq!(verdict.reason, "Not enough fire colors");
        assert_eq!(verdict.stats.fire_ratio, 0.0);
    }

    #[test]
    fn test_low_saturation_rejected() {
        // 16 orange pixels in a grey 10x10 patch: enough hue, too little colour overall
        let mut roi = RgbImage::from_pixel(10, 10, Rgb([128, 128, 128]));
        for i in 0..16 {
            roi.put_pixel(i % 10, i / 10, Rgb([255, 128, 0]));
        }
        let verdict = validate_fire_color(&roi, &rules());
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, "Low saturation");
        assert_eq!(verdict.stats.fire_ratio, 16.0);
        assert_eq!(verdict.stats.avg_saturation, 40.8);
    }

    #[test]
    fn test_empty_roi() {
        let verdict = validate_fire_color(&RgbImage::new(0, 0), &rules());
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, "Empty ROI");
    }
}
