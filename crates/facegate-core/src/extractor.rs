//! Embedding extraction: image → best face → descriptor.
//!
//! Every failure after a successful decode (no candidate above the floor,
//! degenerate crop, model error) collapses to "no embedding". Only bytes that
//! cannot be decoded at all surface as [`ExtractError::InvalidImage`].

use crate::detector::FaceDetector;
use crate::recognizer::FaceEmbedder;
use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Minimum detector confidence for a candidate to count as a face (exclusive).
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.6;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
}

/// Pixel rectangle `[x1, x2) × [y1, y2)` inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CropRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

pub struct EmbeddingExtractor {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    confidence_floor: f32,
}

impl EmbeddingExtractor {
    pub fn new(detector: Arc<dyn FaceDetector>, embedder: Arc<dyn FaceEmbedder>) -> Self {
        Self {
            detector,
            embedder,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
        }
    }

    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// Extract the descriptor of the most confident face, if any.
    pub fn extract(&self, image: &RgbImage) -> Option<Embedding> {
        let candidates = match self.detector.detect(image) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                return None;
            }
        };

        let face = select_face(&candidates, self.confidence_floor)?;
        let rect = crop_rect(face, image.width(), image.height())?;
        tracing::debug!(
            confidence = face.confidence,
            candidates = candidates.len(),
            ?rect,
            "face selected"
        );

        let crop = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
        let size = self.embedder.input_size();
        let input = imageops::resize(&crop, size, size, FilterType::Triangle);

        match self.embedder.embed(&input) {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(error = %e, "embedding extraction failed");
                None
            }
        }
    }

    /// Decode raw bytes (format sniffed from content) and extract.
    ///
    /// `Err` means the bytes are not an image; `Ok(None)` means no usable face.
    pub fn extract_bytes(&self, bytes: &[u8]) -> Result<Option<Embedding>, ExtractError> {
        let image = image::load_from_memory(bytes)?.to_rgb8();
        Ok(self.extract(&image))
    }

    /// Decode a file and extract. Unreadable or undecodable files yield `None`.
    pub fn extract_file(&self, path: &Path) -> Option<Embedding> {
        match decode_file(path) {
            Ok(image) => self.extract(&image),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot decode image");
                None
            }
        }
    }
}

/// Decode by content rather than by extension: reference images are always
/// stored as `.jpg` whatever the uploaded format was.
fn decode_file(path: &Path) -> Result<RgbImage, image::ImageError> {
    Ok(ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgb8())
}

/// Highest-confidence candidate strictly above `floor`. Ties keep the first.
fn select_face(candidates: &[BoundingBox], floor: f32) -> Option<&BoundingBox> {
    let mut best: Option<&BoundingBox> = None;
    for candidate in candidates {
        if candidate.confidence > floor
            && best.map_or(true, |b| candidate.confidence > b.confidence)
        {
            best = Some(candidate);
        }
    }
    best
}

/// Round a box to whole pixels and clamp it to the image. `None` when nothing
/// of the box lies inside the image.
fn crop_rect(face: &BoundingBox, width: u32, height: u32) -> Option<CropRect> {
    if !(face.x.is_finite()
        && face.y.is_finite()
        && face.width.is_finite()
        && face.height.is_finite())
    {
        return None;
    }

    let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
    let x1 = clamp(face.x, width);
    let y1 = clamp(face.y, height);
    let x2 = clamp(face.x + face.width, width);
    let y2 = clamp(face.y + face.height, height);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(CropRect {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}
