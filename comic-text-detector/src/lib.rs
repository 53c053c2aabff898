mod postprocess;

use std::{path::Path, sync::Mutex, thread};

use anyhow::Context;
use image::{DynamicImage, GenericImageView, GrayImage, imageops::FilterType};
use ndarray::Array4;
use ort::{
    execution_providers::CUDAExecutionProvider,
    inputs,
    session::{Session, builder::GraphOptimizationLevel},
    value::Tensor,
};
use serde::Serialize;

pub use postprocess::{Letterbox, iou, non_max_suppression};

/// Execution device for the ONNX session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

#[derive(Debug, Clone)]
pub struct DetectorOptions {
    /// Side of the square network input.
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Probability above which a mask pixel counts as text in the refined mask.
    pub mask_threshold: f32,
    pub device: Device,
    pub intra_threads: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            input_size: 1024,
            confidence_threshold: 0.4,
            nms_threshold: 0.35,
            mask_threshold: 0.3,
            device: Device::Cpu,
            intra_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl DetectorOptions {
    /// Smallest network input the model's stride allows.
    pub const MIN_INPUT_SIZE: u32 = 32;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input_size < Self::MIN_INPUT_SIZE {
            anyhow::bail!(
                "input size must be at least {}, got {}",
                Self::MIN_INPUT_SIZE,
                self.input_size
            );
        }
        Ok(())
    }
}

/// A detected text block in original image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextBlock {
    /// x1, y1, x2, y2
    pub xyxy: [f32; 4],
    pub confidence: Option<f32>,
    /// Text line polygons, one point list per line.
    ///
    /// The ONNX model's line map is not decoded, so blocks from
    /// [`ComicTextDetector::detect`] always carry `None` here.
    pub lines: Option<Vec<Vec<[i32; 2]>>>,
}

impl TextBlock {
    pub fn width(&self) -> f32 {
        self.xyxy[2] - self.xyxy[0]
    }

    pub fn height(&self) -> f32 {
        self.xyxy[3] - self.xyxy[1]
    }
}

/// Output of a single detector pass.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Text probability mask, scaled to 0..=255 at the original resolution.
    pub mask: GrayImage,
    pub refined_mask: GrayImage,
    pub blocks: Vec<TextBlock>,
}

#[derive(Debug)]
pub struct ComicTextDetector {
    model: Mutex<Session>,
    options: DetectorOptions,
}

impl ComicTextDetector {
    pub fn load(model_path: impl AsRef<Path>, options: DetectorOptions) -> anyhow::Result<Self> {
        let model_path = model_path.as_ref();
        options.validate()?;
        if !model_path.is_file() {
            anyhow::bail!("comic text detector model not found: {}", model_path.display());
        }

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(options.intra_threads)?;

        if options.device == Device::Cuda {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        }

        let model = builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load model from {}", model_path.display()))?;

        tracing::info!(
            "loaded comic text detector from {} ({:?})",
            model_path.display(),
            options.device
        );

        Ok(ComicTextDetector {
            model: Mutex::new(model),
            options,
        })
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }

    pub fn detect(&self, image: &DynamicImage) -> anyhow::Result<Detection> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            anyhow::bail!("cannot run detection on an empty image");
        }
        self.options.validate()?;

        let letterbox = Letterbox::new(width, height, self.options.input_size);
        let tensor = self.preprocess(image, &letterbox);

        let (blk, seg) = {
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow::anyhow!("detector session lock poisoned"))?;
            let outputs = model
                .run(inputs!["images" => Tensor::from_array(tensor)?])
                .context("Failed to run comic text detector")?;

            let blk = outputs["blk"].try_extract_array::<f32>()?.to_owned();
            let seg = outputs["seg"].try_extract_array::<f32>()?.to_owned();
            (blk, seg)
        };

        let blocks = postprocess::decode_blocks(
            blk.view(),
            &letterbox,
            self.options.confidence_threshold,
            self.options.nms_threshold,
        )?;
        let mask = postprocess::decode_mask(seg.view(), &letterbox)?;
        let refined_mask = postprocess::binarize(&mask, self.options.mask_threshold);

        tracing::debug!("detected {} text blocks", blocks.len());

        Ok(Detection {
            mask,
            refined_mask,
            blocks,
        })
    }

    fn preprocess(&self, image: &DynamicImage, letterbox: &Letterbox) -> Array4<f32> {
        let size = self.options.input_size as usize;
        let resized = image
            .resize_exact(
                letterbox.resized_width,
                letterbox.resized_height,
                FilterType::Triangle,
            )
            .to_rgb8();

        // padding stays black, image sits at the top-left corner
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let x = x as usize;
            let y = y as usize;

            tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }

        tensor
    }
}
