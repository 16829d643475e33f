//! ONNX Runtime descriptor backend.
//!
//! Two models run back to back: an UltraFace-style detector (RFB-320) that
//! yields normalized face boxes, and the dlib ResNet face recognition network
//! applied to the square crop around the most confident box.
//!
//! The embedding network is the one face-api.js ships as `faceRecognitionNet`.
//! Its 128-d descriptors are compared raw (not L2-normalized), which is the
//! space the default Euclidean match threshold of 0.6 is calibrated for.

use crate::extractor::{DescriptorExtractor, ExtractError, ModelLoader};
use crate::types::{Descriptor, Frame};
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "version-RFB-320.onnx";
pub const EMBEDDING_MODEL_FILE: &str = "dlib_face_recognition_resnet_model_v1.onnx";

// --- Detector (UltraFace) ---
const DETECTOR_INPUT_WIDTH: usize = 320;
const DETECTOR_INPUT_HEIGHT: usize = 240;
const DETECTOR_MEAN: [f32; 3] = [127.0, 127.0, 127.0];
const DETECTOR_SCALE: f32 = 128.0;
const DETECTOR_CONFIDENCE_THRESHOLD: f32 = 0.7;
/// Extra context around the detected box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.25;

// --- Embedding (dlib ResNet) ---
const EMBEDDING_INPUT_SIZE: usize = 150;
/// Per-channel RGB mean subtracted before scaling, as in dlib's `input_rgb_image_sized`.
const EMBEDDING_MEAN: [f32; 3] = [122.782, 117.001, 104.298];
const EMBEDDING_SCALE: f32 = 256.0;
pub const EMBEDDING_DIM: usize = 128;
const EMBEDDING_MODEL_VERSION: &str = "dlib_resnet_v1";

#[derive(Error, Debug)]
enum OnnxError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face box in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FaceBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

/// Loads both models from a directory.
pub struct OnnxModelLoader {
    detector_path: PathBuf,
    embedding_path: PathBuf,
}

impl OnnxModelLoader {
    pub fn new(model_dir: &Path) -> Self {
        Self {
            detector_path: model_dir.join(DETECTOR_MODEL_FILE),
            embedding_path: model_dir.join(EMBEDDING_MODEL_FILE),
        }
    }
}

#[async_trait]
impl ModelLoader for OnnxModelLoader {
    async fn load(&self) -> Result<Arc<dyn DescriptorExtractor>, ExtractError> {
        let detector_path = self.detector_path.clone();
        let embedding_path = self.embedding_path.clone();
        let models = tokio::task::spawn_blocking(move || {
            Models::load(&detector_path, &embedding_path)
        })
        .await
        .map_err(|e| ExtractError::LoadFailed(format!("model loader task: {e}")))?
        .map_err(|e| match e {
            OnnxError::ModelNotFound(path) => ExtractError::ModelNotFound(path),
            other => ExtractError::LoadFailed(other.to_string()),
        })?;

        Ok(Arc::new(OnnxExtractor {
            models: Arc::new(Mutex::new(models)),
        }))
    }
}

/// Extractor backed by loaded ONNX sessions.
///
/// Inference runs on the blocking pool; sessions are used one call at a time.
pub struct OnnxExtractor {
    models: Arc<Mutex<Models>>,
}

#[async_trait]
impl DescriptorExtractor for OnnxExtractor {
    async fn extract(&self, frame: &Frame) -> Result<Option<Descriptor>, ExtractError> {
        let models = self.models.clone();
        let frame = frame.clone();
        tokio::task::spawn_blocking(move || {
            let mut models = models
                .lock()
                .map_err(|_| ExtractError::InferenceFailed("model lock poisoned".into()))?;
            models
                .extract(&frame)
                .map_err(|e| ExtractError::InferenceFailed(e.to_string()))
        })
        .await
        .map_err(|e| ExtractError::InferenceFailed(format!("inference task: {e}")))?
    }
}

struct Models {
    detector: Session,
    embedding: Session,
}

impl Models {
    fn load(detector_path: &Path, embedding_path: &Path) -> Result<Self, OnnxError> {
        let detector = load_session(detector_path)?;
        tracing::info!(path = %detector_path.display(), "face detector loaded");
        let embedding = load_session(embedding_path)?;
        tracing::info!(path = %embedding_path.display(), "face embedding model loaded");
        Ok(Self {
            detector,
            embedding,
        })
    }

    fn extract(&mut self, frame: &Frame) -> Result<Option<Descriptor>, OnnxError> {
        let image = GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| {
                OnnxError::InferenceFailed(format!(
                    "frame buffer does not match {}x{}",
                    frame.width, frame.height
                ))
            })?;

        let Some(face) = self.detect(&image)? else {
            return Ok(None);
        };
        tracing::debug!(confidence = face.confidence, "face detected");

        let crop = crop_face(&image, &face);
        self.embed(&crop).map(Some)
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Option<FaceBox>, OnnxError> {
        let resized = imageops::resize(
            image,
            DETECTOR_INPUT_WIDTH as u32,
            DETECTOR_INPUT_HEIGHT as u32,
            FilterType::Triangle,
        );
        let input = to_nchw(&resized, DETECTOR_MEAN, DETECTOR_SCALE);

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("detector scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("detector boxes: {e}")))?;

        Ok(best_face(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            DETECTOR_CONFIDENCE_THRESHOLD,
        ))
    }

    fn embed(&mut self, crop: &GrayImage) -> Result<Descriptor, OnnxError> {
        let input = to_nchw(crop, EMBEDDING_MEAN, EMBEDDING_SCALE);
        let outputs = self
            .embedding
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("embedding extraction: {e}")))?;

        descriptor_from_output(raw)
    }
}

fn load_session(path: &Path) -> Result<Session, OnnxError> {
    if !path.exists() {
        return Err(OnnxError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Grayscale image → 1x3xHxW tensor, the gray value replicated into RGB and
/// normalized per channel as `(v - mean[c]) / scale`.
fn to_nchw(image: &GrayImage, mean: [f32; 3], scale: f32) -> Array4<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, height, width));
    for (x, y, pixel) in image.enumerate_pixels() {
        let value = pixel.0[0] as f32;
        let (x, y) = (x as usize, y as usize);
        for (c, m) in mean.iter().enumerate() {
            tensor[[0, c, y, x]] = (value - m) / scale;
        }
    }
    tensor
}

/// Wrap the raw network output as a descriptor.
///
/// Values are kept as produced: the match threshold is a Euclidean distance
/// between unnormalized 128-d descriptors.
fn descriptor_from_output(raw: &[f32]) -> Result<Descriptor, OnnxError> {
    if raw.len() != EMBEDDING_DIM {
        return Err(OnnxError::InferenceFailed(format!(
            "expected {EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    Ok(Descriptor {
        values: raw.to_vec(),
        model_version: Some(EMBEDDING_MODEL_VERSION.to_string()),
    })
}

/// Pick the most confident face from UltraFace outputs.
///
/// `scores` is `[N, 2]` (background, face) and `boxes` is `[N, 4]` with
/// corners normalized to `[0, 1]`.
fn best_face(
    scores: &[f32],
    boxes: &[f32],
    width: f32,
    height: f32,
    threshold: f32,
) -> Option<FaceBox> {
    let count = (scores.len() / 2).min(boxes.len() / 4);
    let mut best: Option<FaceBox> = None;

    for i in 0..count {
        let confidence = scores[i * 2 + 1];
        if confidence < threshold {
            continue;
        }
        if best.is_some_and(|b| b.confidence >= confidence) {
            continue;
        }
        let b = &boxes[i * 4..i * 4 + 4];
        best = Some(FaceBox {
            x1: b[0].clamp(0.0, 1.0) * width,
            y1: b[1].clamp(0.0, 1.0) * height,
            x2: b[2].clamp(0.0, 1.0) * width,
            y2: b[3].clamp(0.0, 1.0) * height,
            confidence,
        });
    }

    best.filter(|b| b.x2 > b.x1 && b.y2 > b.y1)
}

/// Square crop around `face` with margin, clamped to the image, resized to
/// the embedding input size.
fn crop_face(image: &GrayImage, face: &FaceBox) -> GrayImage {
    let (img_w, img_h) = (image.width() as f32, image.height() as f32);
    let side = (face.x2 - face.x1).max(face.y2 - face.y1) * (1.0 + 2.0 * CROP_MARGIN);
    let side = side.min(img_w).min(img_h).max(1.0);
    let cx = (face.x1 + face.x2) / 2.0;
    let cy = (face.y1 + face.y2) / 2.0;

    let x = (cx - side / 2.0).clamp(0.0, img_w - side) as u32;
    let y = (cy - side / 2.0).clamp(0.0, img_h - side) as u32;
    let side = side as u32;

    let crop = imageops::crop_imm(image, x, y, side, side).to_image();
    imageops::resize(
        &crop,
        EMBEDDING_INPUT_SIZE as u32,
        EMBEDDING_INPUT_SIZE as u32,
        FilterType::Triangle,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_nchw_shape_and_normalization() {
        let image = GrayImage::from_pixel(4, 3, image::Luma([128u8]));
        let tensor = to_nchw(&image, EMBEDDING_MEAN, EMBEDDING_SCALE);
        assert_eq!(tensor.shape(), &[1, 3, 3, 4]);
        for c in 0..3 {
            let expected = (128.0 - EMBEDDING_MEAN[c]) / EMBEDDING_SCALE;
            assert!((tensor[[0, c, 2, 3]] - expected).abs() < 1e-6);
        }

        let detector = to_nchw(&image, DETECTOR_MEAN, DETECTOR_SCALE);
        assert_eq!(detector[[0, 0, 1, 1]], detector[[0, 2, 1, 1]]);
        assert!((detector[[0, 1, 0, 0]] - 1.0 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_best_face_picks_highest_confidence() {
        let scores = [0.9, 0.1, 0.2, 0.8, 0.05, 0.95];
        let boxes = [
            0.0, 0.0, 0.1, 0.1, //
            0.1, 0.1, 0.5, 0.5, //
            0.25, 0.25, 0.75, 0.75,
        ];
        let face = best_face(&scores, &boxes, 320.0, 240.0, 0.7).unwrap();
        assert!((face.confidence - 0.95).abs() < 1e-6);
        assert!((face.x1 - 80.0).abs() < 1e-4);
        assert!((face.y2 - 180.0).abs() < 1e-4);
    }

    #[test]
    fn test_best_face_below_threshold() {
        let scores = [0.6, 0.4];
        let boxes = [0.1, 0.1, 0.5, 0.5];
        assert_eq!(best_face(&scores, &boxes, 320.0, 240.0, 0.7), None);
    }

    #[test]
    fn test_best_face_rejects_degenerate_box() {
        let scores = [0.0, 0.99];
        let boxes = [0.5, 0.5, 0.5, 0.9];
        assert_eq!(best_face(&scores, &boxes, 320.0, 240.0, 0.7), None);
    }

    #[test]
    fn test_crop_face_is_embedding_sized_and_clamped() {
        let image = GrayImage::from_pixel(64, 48, image::Luma([50u8]));
        let face = FaceBox {
            x1: 50.0,
            y1: 30.0,
            x2: 70.0,
            y2: 60.0,
            confidence: 0.9,
        };
        let crop = crop_face(&image, &face);
        assert_eq!(crop.dimensions(), (150, 150));
    }

    #[test]
    fn test_descriptor_is_raw_128d() {
        // The 0.6 threshold is a distance between unnormalized 128-d descriptors.
        assert_eq!(EMBEDDING_DIM, 128);
        assert_eq!(crate::matcher::DEFAULT_MATCH_THRESHOLD, 0.6);

        let raw = vec![0.5f32; EMBEDDING_DIM];
        let descriptor = descriptor_from_output(&raw).unwrap();
        assert_eq!(descriptor.values, raw);
        let norm = descriptor.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 0.5 * (EMBEDDING_DIM as f32).sqrt()).abs() < 1e-4);
        assert_eq!(descriptor.model_version.as_deref(), Some("dlib_resnet_v1"));
    }

    #[test]
    fn test_descriptor_rejects_other_dimensions() {
        assert!(descriptor_from_output(&[0.1; 512]).is_err());
        assert!(descriptor_from_output(&[]).is_err());
    }

    #[tokio::test]
    async fn test_missing_model_is_reported() {
        let loader = OnnxModelLoader::new(Path::new("/nonexistent/models"));
        let err = loader.load().await.err().unwrap();
        assert!(matches!(err, ExtractError::ModelNotFound(_)), "got {err:?}");
    }
}
