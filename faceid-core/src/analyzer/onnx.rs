//! ONNX Runtime face analyzer.
//!
//! Runs an SCRFD detector to find faces and five facial keypoints, aligns each
//! face to the canonical 112x112 ArcFace template with a similarity transform,
//! then runs the ArcFace recognizer to obtain a 512-element embedding.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::DynValue;
use tracing::{debug, info, instrument, warn};

use super::{ComputeBackend, DetectedFace, FaceAnalyzer, OnnxAnalyzerConfig};
use crate::error::{FaceIdError, Result};
use crate::fingerprint::BoundingBox;

/// Feature map strides of the SCRFD heads.
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const RECOGNIZER_MEAN: f32 = 127.5;
const RECOGNIZER_STD: f32 = 127.5;

const ALIGNED_SIZE: u32 = 112;

/// Canonical keypoint positions for a 112x112 aligned face
/// (left eye, right eye, nose, left mouth corner, right mouth corner).
const ARCFACE_TEMPLATE: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

type Keypoints = [[f32; 2]; 5];

#[derive(Debug, Clone)]
struct RawDetection {
    bbox: BoundingBox,
    keypoints: Keypoints,
    score: f32,
}

/// SCRFD + ArcFace analyzer bound to one compute backend.
pub struct OnnxFaceAnalyzer {
    detector: Session,
    recognizer: Session,
    backend: ComputeBackend,
    config: OnnxAnalyzerConfig,
}

impl OnnxFaceAnalyzer {
    /// Load both models, binding the first backend in `config.backends` that
    /// initializes.
    #[instrument(skip_all, fields(model = %config.model_name))]
    pub fn new(config: OnnxAnalyzerConfig) -> Result<Self> {
        let (detector_path, recognizer_path) = locate_models(&config.pack_dir())?;
        info!(
            detector = %detector_path.display(),
            recognizer = %recognizer_path.display(),
            "Loading face models"
        );

        let mut failures = Vec::new();
        for &backend in &config.backends {
            match load_pair(&detector_path, &recognizer_path, backend) {
                Ok((detector, recognizer)) => {
                    info!(backend = %backend, "Face analyzer bound to compute backend");
                    return Ok(Self {
                        detector,
                        recognizer,
                        backend,
                        config,
                    });
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Compute backend unavailable, trying next");
                    failures.push(format!("{backend}: {e}"));
                }
            }
        }

        Err(FaceIdError::BackendUnavailable(failures.join("; ")))
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let (det_w, det_h) = self.config.det_size;
        let (img_w, img_h) = image.dimensions();
        if img_w == 0 || img_h == 0 {
            return Ok(Vec::new());
        }

        // Letterbox into the detector canvas, anchored top-left.
        let im_ratio = img_h as f32 / img_w as f32;
        let model_ratio = det_h as f32 / det_w as f32;
        let (new_w, new_h) = if im_ratio > model_ratio {
            let h = det_h;
            (((h as f32 / im_ratio) as u32).max(1), h)
        } else {
            let w = det_w;
            (w, ((w as f32 * im_ratio) as u32).max(1))
        };
        let det_scale = new_h as f32 / img_h as f32;
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Padding carries the normalized value of a black pixel.
        let pad = (0.0 - DETECTOR_MEAN) / DETECTOR_STD;
        let mut input = Array4::<f32>::from_elem((1, 3, det_h as usize, det_w as usize), pad);
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
            }
        }

        let input_name = self.detector.inputs[0].name.clone();
        let output_names: Vec<String> = self
            .detector
            .outputs
            .iter()
            .map(|o| o.name.clone())
            .collect();
        if output_names.len() != STRIDES.len() * 3 {
            return Err(FaceIdError::ModelError(format!(
                "detector must expose {} outputs (scores, boxes, keypoints per stride), found {}",
                STRIDES.len() * 3,
                output_names.len()
            )));
        }

        let outputs = self
            .detector
            .run(ort::inputs![input_name.as_str() => input.view()]?)?;

        let mut detections = Vec::new();
        for (idx, &stride) in STRIDES.iter().enumerate() {
            let scores = flatten(&outputs[output_names[idx].as_str()])?;
            let boxes = flatten(&outputs[output_names[idx + STRIDES.len()].as_str()])?;
            let kps = flatten(&outputs[output_names[idx + STRIDES.len() * 2].as_str()])?;

            let rows = det_h as usize / stride;
            let cols = det_w as usize / stride;
            let anchors = rows * cols * ANCHORS_PER_CELL;
            if scores.len() < anchors || boxes.len() < anchors * 4 || kps.len() < anchors * 10 {
                return Err(FaceIdError::ModelError(format!(
                    "detector output for stride {stride} is smaller than its anchor grid"
                )));
            }

            let s = stride as f32;
            for anchor in 0..anchors {
                let score = scores[anchor];
                if score < self.config.det_threshold {
                    continue;
                }
                let cell = anchor / ANCHORS_PER_CELL;
                let cx = (cell % cols) as f32 * s;
                let cy = (cell / cols) as f32 * s;

                let d = &boxes[anchor * 4..anchor * 4 + 4];
                let bbox = BoundingBox([
                    (cx - d[0] * s) / det_scale,
                    (cy - d[1] * s) / det_scale,
                    (cx + d[2] * s) / det_scale,
                    (cy + d[3] * s) / det_scale,
                ]);

                let k = &kps[anchor * 10..anchor * 10 + 10];
                let mut keypoints = [[0.0f32; 2]; 5];
                for (i, point) in keypoints.iter_mut().enumerate() {
                    point[0] = (cx + k[i * 2] * s) / det_scale;
                    point[1] = (cy + k[i * 2 + 1] * s) / det_scale;
                }

                detections.push(RawDetection {
                    bbox,
                    keypoints,
                    score,
                });
            }
        }

        Ok(non_max_suppression(detections, self.config.nms_threshold))
    }

    fn embed(&self, image: &RgbImage, keypoints: &Keypoints) -> Result<Vec<f32>> {
        let aligned = align_face(image, keypoints);

        let size = ALIGNED_SIZE as usize;
        let mut input = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - RECOGNIZER_MEAN) / RECOGNIZER_STD;
            }
        }

        let input_name = self.recognizer.inputs[0].name.clone();
        let output_name = self
            .recognizer
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| FaceIdError::ModelError("recognizer has no outputs".into()))?;

        let outputs = self
            .recognizer
            .run(ort::inputs![input_name.as_str() => input.view()]?)?;
        flatten(&outputs[output_name.as_str()])
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>> {
        let detections = self.detect(image)?;
        debug!(faces = detections.len(), "Detector finished");

        detections
            .into_iter()
            .map(|det| {
                let embedding = self.embed(image, &det.keypoints)?;
                Ok(DetectedFace {
                    bounding_box: det.bbox,
                    embedding,
                    score: det.score,
                })
            })
            .collect()
    }

    fn warmup(&self) -> Result<()> {
        let (w, h) = self.config.det_size;
        let blank = RgbImage::new(w, h);
        self.detect(&blank)?;
        self.embed(&blank, &ARCFACE_TEMPLATE)?;
        Ok(())
    }

    fn name(&self) -> String {
        format!("onnx:{}@{}", self.config.model_name, self.backend)
    }
}

fn execution_provider(backend: ComputeBackend) -> ExecutionProviderDispatch {
    match backend {
        ComputeBackend::Cuda => CUDAExecutionProvider::default().build(),
        ComputeBackend::TensorRt => TensorRTExecutionProvider::default().build(),
        ComputeBackend::CoreMl => CoreMLExecutionProvider::default().build(),
        ComputeBackend::DirectMl => DirectMLExecutionProvider::default().build(),
        ComputeBackend::Cpu => CPUExecutionProvider::default().build(),
    }
}

fn load_session(path: &Path, backend: ComputeBackend) -> Result<Session> {
    Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_execution_providers([execution_provider(backend).error_on_failure()]))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| FaceIdError::ModelError(format!("{}: {e}", path.display())))
}

fn load_pair(detector: &Path, recognizer: &Path, backend: ComputeBackend) -> Result<(Session, Session)> {
    Ok((load_session(detector, backend)?, load_session(recognizer, backend)?))
}

/// Find the detector (`det_*.onnx`) and recognizer (any other `.onnx`) in a
/// model pack directory.
fn locate_models(pack_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let entries = std::fs::read_dir(pack_dir).map_err(|e| {
        FaceIdError::ModelError(format!("cannot read model pack {}: {e}", pack_dir.display()))
    })?;

    let mut models: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "onnx"))
        .collect();
    models.sort();

    let file_name = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    };

    let detector = models
        .iter()
        .find(|p| file_name(p).starts_with("det"))
        .cloned();
    let recognizer = models
        .iter()
        .find(|p| {
            let name = file_name(p);
            ["w600k", "glint", "arcface", "r50", "r100"]
                .iter()
                .any(|marker| name.contains(marker))
        })
        .cloned();

    match (detector, recognizer) {
        (Some(d), Some(r)) => Ok((d, r)),
        _ => Err(FaceIdError::ModelError(format!(
            "model pack {} must contain a det_*.onnx detector and an ArcFace recognizer",
            pack_dir.display()
        ))),
    }
}

fn flatten(value: &DynValue) -> Result<Vec<f32>> {
    let view = value.try_extract_tensor::<f32>()?;
    Ok(view.iter().copied().collect())
}

fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

/// Least-squares 2D similarity transform (rotation, uniform scale,
/// translation) mapping `src` onto `dst`.
///
/// Returns `(a, b, tx, ty)` such that
/// `x' = a*x - b*y + tx` and `y' = b*x + a*y + ty`.
fn similarity_transform(src: &Keypoints, dst: &Keypoints) -> (f32, f32, f32, f32) {
    let n = src.len() as f32;
    let mean = |pts: &Keypoints| {
        let (sx, sy) = pts
            .iter()
            .fold((0.0, 0.0), |(ax, ay), p| (ax + p[0], ay + p[1]));
        (sx / n, sy / n)
    };
    let (msx, msy) = mean(src);
    let (mdx, mdy) = mean(dst);

    let mut num_a = 0.0;
    let mut num_b = 0.0;
    let mut denom = 0.0;
    for (s, d) in src.iter().zip(dst.iter()) {
        let (xs, ys) = (s[0] - msx, s[1] - msy);
        let (xd, yd) = (d[0] - mdx, d[1] - mdy);
        num_a += xs * xd + ys * yd;
        num_b += xs * yd - ys * xd;
        denom += xs * xs + ys * ys;
    }

    if denom <= f32::EPSILON {
        return (1.0, 0.0, mdx - msx, mdy - msy);
    }

    let a = num_a / denom;
    let b = num_b / denom;
    let tx = mdx - (a * msx - b * msy);
    let ty = mdy - (b * msx + a * msy);
    (a, b, tx, ty)
}

/// Warp the face described by `keypoints` onto the 112x112 ArcFace template.
fn align_face(image: &RgbImage, keypoints: &Keypoints) -> RgbImage {
    let (a, b, tx, ty) = similarity_transform(keypoints, &ARCFACE_TEMPLATE);
    let det = a * a + b * b;
    let mut out = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    if det <= f32::EPSILON {
        return out;
    }

    for (u, v, pixel) in out.enumerate_pixels_mut() {
        // Inverse similarity: source = R^-1 * (dest - t)
        let du = u as f32 - tx;
        let dv = v as f32 - ty;
        let sx = (a * du + b * dv) / det;
        let sy = (-b * du + a * dv) / det;
        pixel.0 = bilinear(image, sx, sy);
    }
    out
}

fn bilinear(image: &RgbImage, x: f32, y: f32) -> [u8; 3] {
    let (w, h) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return [0, 0, 0];
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;

    let mut result = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        result[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    result
}
