//! ArcFace face embedder via ONNX Runtime.
//!
//! Turns a face crop, already resized to 112x112, into a 512-dimensional
//! L2-normalized embedding using the w600k_r50 ArcFace model.

use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download it from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face crop is {width}x{height}, expected {expected}x{expected}")]
    InvalidInput {
        width: u32,
        height: u32,
        expected: u32,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a face crop to a fixed-length descriptor.
pub trait FaceEmbedder: Send + Sync {
    /// Side length of the square crop `embed` expects.
    fn input_size(&self) -> u32;

    fn embed(&self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based face embedder.
pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn input_size(&self) -> u32 {
        ARCFACE_INPUT_SIZE
    }

    fn embed(&self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = preprocess(face)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| RecognizerError::InferenceFailed("ArcFace session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw_data.to_vec()),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Convert a 112x112 RGB crop into a NCHW float tensor.
fn preprocess(face: &RgbImage) -> Result<Array4<f32>, RecognizerError> {
    if face.width() != ARCFACE_INPUT_SIZE || face.height() != ARCFACE_INPUT_SIZE {
        return Err(RecognizerError::InvalidInput {
            width: face.width(),
            height: face.height(),
            expected: ARCFACE_INPUT_SIZE,
        });
    }

    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    Ok(tensor)
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
