//! Text-box detection with a fixed mock fallback.
//!
//! [`DetectionService::detect`] never fails: a missing model, an undecodable
//! image or an inference error all degrade to [`mock_text_boxes`].

use std::{fmt, path::Path};

use anyhow::Context;
use comic_text_detector::{ComicTextDetector, Detection, DetectorOptions, TextBlock};
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};

pub const DETECTOR_BACKEND: &str = "comic-text-detector";
pub const MOCK_BACKEND: &str = "mock";

const DEFAULT_CONFIDENCE: f32 = 0.8;
const MIN_LINE_POINTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    /// Always empty for model output: the detector finds regions, it does not read them.
    pub text: String,
    pub confidence: f32,
    pub lines: Vec<Vec<[i32; 2]>>,
}

impl TextBox {
    fn from_block(id: u32, block: &TextBlock) -> Self {
        let [x1, y1, x2, y2] = block.xyxy;
        let lines = block
            .lines
            .iter()
            .flatten()
            .filter(|line| line.len() >= MIN_LINE_POINTS)
            .cloned()
            .collect();

        Self {
            id,
            x: x1 as i32,
            y: y1 as i32,
            width: (x2 - x1) as i32,
            height: (y2 - y1) as i32,
            text: String::new(),
            confidence: block.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            lines,
        }
    }
}

pub fn mock_text_boxes() -> Vec<TextBox> {
    vec![
        TextBox {
            id: 1,
            x: 100,
            y: 50,
            width: 200,
            height: 40,
            text: "Sample text detected".to_string(),
            confidence: 0.85,
            lines: vec![],
        },
        TextBox {
            id: 2,
            x: 150,
            y: 200,
            width: 180,
            height: 35,
            text: "Another text region".to_string(),
            confidence: 0.78,
            lines: vec![],
        },
    ]
}

/// The model seam: anything that turns an image into text blocks.
pub trait TextDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Detection>;
}

impl TextDetector for ComicTextDetector {
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Detection> {
        ComicTextDetector::detect(self, image)
    }
}

pub struct DetectionService {
    detector: Option<Box<dyn TextDetector>>,
}

impl fmt::Debug for DetectionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionService")
            .field("backend", &self.backend())
            .finish()
    }
}

impl DetectionService {
    pub fn new(detector: Option<Box<dyn TextDetector>>) -> Self {
        Self { detector }
    }

    pub fn mock() -> Self {
        Self::new(None)
    }

    /// Loads the detector, leaving the service in mock mode if that fails.
    pub fn load(model_path: &Path, options: DetectorOptions) -> Self {
        match ComicTextDetector::load(model_path, options) {
            Ok(detector) => Self::new(Some(Box::new(detector))),
            Err(e) => {
                tracing::warn!("Failed to load comic text detector, serving mock results: {e:#}");
                Self::mock()
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.detector.is_some()
    }

    pub fn backend(&self) -> &'static str {
        if self.is_loaded() {
            DETECTOR_BACKEND
        } else {
            MOCK_BACKEND
        }
    }

    pub fn detect(&self, image_path: &Path) -> Vec<TextBox> {
        let Some(detector) = self.detector.as_deref() else {
            return mock_text_boxes();
        };

        match Self::run(detector, image_path) {
            Ok(text_boxes) => {
                tracing::info!(
                    "detected {} text regions in {}",
                    text_boxes.len(),
                    image_path.display()
                );
                text_boxes
            }
            Err(e) => {
                tracing::warn!("Detection error, falling back to mock results: {e:#}");
                mock_text_boxes()
            }
        }
    }

    fn run(detector: &dyn TextDetector, image_path: &Path) -> anyhow::Result<Vec<TextBox>> {
        // staged uploads always carry a .jpg suffix, so sniff the real format
        let image = ImageReader::open(image_path)
            .and_then(|reader| reader.with_guessed_format())
            .with_context(|| format!("Could not open image: {}", image_path.display()))?
            .decode()
            .with_context(|| format!("Could not load image: {}", image_path.display()))?;

        let detection = detector.detect(&image)?;

        Ok(detection
            .blocks
            .iter()
            .zip(1..)
            .map(|(block, id)| TextBox::from_block(id, block))
            .collect())
    }
}
