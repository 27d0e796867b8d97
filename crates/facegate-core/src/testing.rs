//! Deterministic stand-ins for the ONNX models, for tests.
//!
//! A "face" is any non-dark region of the image; its embedding is the
//! L2-normalized mean color of the crop. Images of differently colored
//! squares therefore behave like different people.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceEmbedder, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Pixels whose brightest channel is at or below this count as background.
const DARK_LEVEL: u8 = 16;

/// Reports the bounding box of all non-dark pixels as a single face.
pub struct BrightRegionDetector {
    pub confidence: f32,
}

impl Default for BrightRegionDetector {
    fn default() -> Self {
        Self { confidence: 0.9 }
    }
}

impl FaceDetector for BrightRegionDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, pixel) in image.enumerate_pixels() {
            if pixel.0.iter().all(|&c| c <= DARK_LEVEL) {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
            });
        }

        Ok(bounds
            .map(|(x1, y1, x2, y2)| BoundingBox {
                x: x1 as f32,
                y: y1 as f32,
                width: (x2 - x1 + 1) as f32,
                height: (y2 - y1 + 1) as f32,
                confidence: self.confidence,
                landmarks: None,
            })
            .into_iter()
            .collect())
    }
}

/// Embeds a crop as its L2-normalized mean RGB color.
pub struct MeanColorEmbedder;

impl FaceEmbedder for MeanColorEmbedder {
    fn input_size(&self) -> u32 {
        8
    }

    fn embed(&self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let pixels = (face.width() * face.height()) as f32;
        if pixels == 0.0 {
            return Err(RecognizerError::InferenceFailed("empty crop".into()));
        }

        let mut sum = [0.0f32; 3];
        for pixel in face.pixels() {
            for c in 0..3 {
                sum[c] += pixel[c] as f32;
            }
        }
        let mean: Vec<f32> = sum.iter().map(|s| s / pixels).collect();
        let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            mean.iter().map(|v| v / norm).collect()
        } else {
            mean
        };

        Ok(Embedding {
            values,
            model_version: Some("mean-color".into()),
        })
    }
}

/// 64x64 black image with a 32x32 square of `color` in the middle.
pub fn face_image(color: [u8; 3]) -> RgbImage {
    RgbImage::from_fn(64, 64, |x, y| {
        if (16..48).contains(&x) && (16..48).contains(&y) {
            Rgb(color)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// 64x64 image with no detectable face.
pub fn blank_image() -> RgbImage {
    RgbImage::new(64, 64)
}

pub fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .expect("in-memory PNG encoding");
    buf.into_inner()
}
