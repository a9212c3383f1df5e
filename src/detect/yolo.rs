use std::path::Path;

use image::{imageops, Rgb, RgbImage};
use tract_onnx::prelude::*;
use tracing::{debug, info};

use super::{BoundingBox, DetectError, Detection, Detector};
use crate::config::ConfigDetection;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const LETTERBOX_FILL: u8 = 114;

/// YOLOv8 style ONNX detector run through tract
pub struct YoloDetector {
    model: Plan,
    input_size: u32,
    class_names: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
    name: String,
}

impl YoloDetector {
    pub fn load(cfg: &ConfigDetection) -> Result<YoloDetector, DetectError> {
        let path: &Path = cfg.model_path.as_ref();
        let size = cfg.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| DetectError::ModelLoad(format!("{}: {}", path.display(), e)))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .map_err(|e| DetectError::ModelLoad(e.to_string()))?
            .into_optimized()
            .map_err(|e| DetectError::ModelLoad(e.to_string()))?
            .into_runnable()
            .map_err(|e| DetectError::ModelLoad(e.to_string()))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "yolo".into());
        info!(model=%name, input_size=size, classes=?cfg.class_names, "Detection model loaded");
        Ok(YoloDetector {
            model,
            input_size: cfg.input_size,
            class_names: cfg.class_names.clone(),
            confidence_threshold: cfg.confidence_threshold,
            iou_threshold: cfg.iou_threshold,
            name,
        })
    }

    fn build_input(&self, letterboxed: &RgbImage) -> Tensor {
        let size = self.input_size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            letterboxed.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }
}

impl Detector for YoloDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
        let (letterboxed, lb) = letterbox(image, self.input_size);
        let input = self.build_input(&letterboxed);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectError::OutputShape("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectError::OutputShape(e.to_string()))?;
        let shape = view.shape().to_vec();
        let data: Vec<f32> = view.iter().copied().collect();

        let raw = decode_yolov8(&data, &shape, &self.class_names, self.confidence_threshold)?;
        let kept = non_max_suppression(raw, self.iou_threshold);
        let (w, h) = image.dimensions();
        let detections: Vec<Detection> = kept
            .into_iter()
            .map(|mut d| {
                d.bbox = lb.to_frame(&d.bbox).clamp_to(w, h);
                d
            })
            .filter(|d| d.bbox.area() > 0.0)
            .collect();
        debug!(count = detections.len(), "Detections after NMS");
        Ok(detections)
    }
}

/// Scale and padding used to fit a frame into the square model input
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn new(width: u32, height: u32, size: u32) -> Letterbox {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let nw = (width as f32 * scale).round();
        let nh = (height as f32 * scale).round();
        Letterbox {
            scale,
            pad_x: ((size as f32 - nw) / 2.0).floor(),
            pad_y: ((size as f32 - nh) / 2.0).floor(),
        }
    }
    /// Maps a box from model input space back to frame pixels
    pub fn to_frame(&self, b: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x1: (b.x1 - self.pad_x) / self.scale,
            y1: (b.y1 - self.pad_y) / self.scale,
            x2: (b.x2 - self.pad_x) / self.scale,
            y2: (b.y2 - self.pad_y) / self.scale,
        }
    }
}

fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let (w, h) = image.dimensions();
    let lb = Letterbox::new(w, h, size);
    let nw = ((w as f32 * lb.scale).round() as u32).clamp(1, size);
    let nh = ((h as f32 * lb.scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, nw, nh, imageops::FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    imageops::overlay(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);
    (canvas, lb)
}

/// Decodes a raw YOLOv8 head.
///
/// The output holds `4 + classes` rows of `N` anchors (`[1, 4+nc, N]`), or the transpose
/// (`[1, N, 4+nc]`). The first four rows are centre x, centre y, width and height in input
/// pixels, the remaining rows are per-class scores. Boxes stay in input space.
pub fn decode_yolov8(
    output: &[f32],
    shape: &[usize],
    class_names: &[String],
    confidence_threshold: f32,
) -> Result<Vec<Detection>, DetectError> {
    let nc = class_names.len();
    let features = 4 + nc;
    let dims: Vec<usize> = shape.iter().copied().filter(|d| *d != 1).collect();
    let (anchors, channels_first) = match dims.as_slice() {
        [a, b] if *a == features => (*b, true),
        [a, b] if *b == features => (*a, false),
        [a] if *a == features => (1, true),
        _ => {
            return Err(DetectError::OutputShape(format!(
                "expected {} features per anchor, got shape {:?}",
                features, shape
            )))
        }
    };
    if output.len() != anchors * features {
        return Err(DetectError::OutputShape(format!(
            "shape {:?} does not match {} values",
            shape,
            output.len()
        )));
    }

    let at = |anchor: usize, feature: usize| -> f32 {
        if channels_first {
            output[feature * anchors + anchor]
        } else {
            output[anchor * features + feature]
        }
    };

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let (class_id, confidence) = (0..nc)
            .map(|c| (c, at(anchor, 4 + c)))
            .fold((0, f32::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            });
        if confidence < confidence_threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
        detections.push(Detection {
            class_id,
            class_name: class_names[class_id].clone(),
            confidence,
            bbox: BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
        });
    }
    Ok(detections)
}

/// Greedy per-class suppression. Output is sorted by confidence, highest first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod test {
    use super::{decode_yolov8, letterbox, non_max_suppression, Letterbox};
    use crate::detect::{BoundingBox, Detection};

    fn classes() -> Vec<String> {
        vec!["fire".into(), "smoke".into()]
    }

    // Three anchors, channels first: rows cx, cy, w, h, fire, smoke
    fn sample_output() -> Vec<f32> {
        vec![
            100.0, 300.0, 50.0, // cx
            100.0, 300.0, 50.0, // cy
            40.0, 20.0, 10.0, // w
            20.0, 20.0, 10.0, // h
            0.9, 0.1, 0.2, // fire
            0.05, 0.6, 0.1, // smoke
        ]
    }

    #[test]
    fn test_decode_channels_first() {
        let dets = decode_yolov8(&sample_output(), &[1, 6, 3], &classes(), 0.35).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_name, "fire");
        assert_eq!(dets[0].confidence, 0.9);
        assert_eq!(dets[0].bbox, BoundingBox::new(80.0, 90.0, 120.0, 110.0));
        assert_eq!(dets[1].class_id, 1);
        assert_eq!(dets[1].bbox, BoundingBox::new(290.0, 290.0, 310.0, 310.0));
    }

    #[test]
    fn test_decode_transposed_matches() {
        let cf = sample_output();
        let mut transposed = vec![0.0; cf.len()];
        for f in 0..6 {
            for a in 0..3 {
                transposed[a * 6 + f] = cf[f * 3 + a];
            }
        }
        let a = decode_yolov8(&cf, &[1, 6, 3], &classes(), 0.35).unwrap();
        let b = decode_yolov8(&transposed, &[1, 3, 6], &classes(), 0.35).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_bad_shape() {
        assert!(decode_yolov8(&sample_output(), &[1, 9, 2], &classes(), 0.35).is_err());
        assert!(decode_yolov8(&[0.0; 5], &[1, 6, 3], &classes(), 0.35).is_err());
    }

    fn det(class_id: usize, confidence: f32, bbox: BoundingBox) -> Detection {
        Detection {
            class_id,
            class_name: String::new(),
            confidence,
            bbox,
        }
    }

    #[test]
    fn test_nms_per_class() {
        let dets = vec![
            det(0, 0.6, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            det(0, 0.9, BoundingBox::new(1.0, 1.0, 11.0, 11.0)),
            det(1, 0.5, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            det(0, 0.4, BoundingBox::new(50.0, 50.0, 60.0, 60.0)),
        ];
        let kept = non_max_suppression(dets, 0.45);
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.5, 0.4]);
    }

    #[test]
    fn test_letterbox_mapping() {
        let lb = Letterbox::new(1280, 720, 640);
        assert_eq!(lb.scale, 0.5);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
        let frame_box = lb.to_frame(&BoundingBox::new(100.0, 240.0, 200.0, 340.0));
        assert_eq!(frame_box, BoundingBox::new(200.0, 200.0, 400.0, 400.0));
    }

    #[test]
    fn test_letterbox_canvas() {
        let img = image::RgbImage::from_pixel(320, 160, image::Rgb([255, 0, 0]));
        let (canvas, lb) = letterbox(&img, 64);
        assert_eq!(canvas.dimensions(), (64, 64));
        assert_eq!(lb.pad_y, 16.0);
        assert_eq!(canvas.get_pixel(32, 2).0, [114, 114, 114]);
        assert_eq!(canvas.get_pixel(32, 32).0, [255, 0, 0]);
    }
}
