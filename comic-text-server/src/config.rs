use std::path::PathBuf;

use clap::Parser;
use comic_text_detector::{DetectorOptions, Device};

/// URL prefix under which the main app serves uploaded pages.
pub const UPLOADS_PREFIX: &str = "/uploads/";

#[derive(Debug, Clone, Parser)]
#[command(name = "comic-text-server", version, about = "Comic text region detection over HTTP")]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 5001)]
    pub port: u16,

    #[arg(long, env = "MODEL_PATH", default_value = "models/comictextdetector.pt.onnx")]
    pub model_path: PathBuf,

    /// Directory backing `/uploads/...` URLs.
    #[arg(long, env = "UPLOADS_DIR", default_value = "../uploads")]
    pub uploads_dir: PathBuf,

    /// Where uploads are staged while being processed. Defaults to the system temp dir.
    #[arg(long, env = "TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Inference device. Picks CUDA when an NVIDIA device is present.
    #[arg(long, env = "DEVICE", value_enum)]
    pub device: Option<Device>,

    #[arg(
        long,
        default_value_t = 1024,
        value_parser = clap::value_parser!(u32).range(DetectorOptions::MIN_INPUT_SIZE as i64..)
    )]
    pub input_size: u32,

    #[arg(long, default_value_t = 0.4)]
    pub confidence_threshold: f32,

    #[arg(long, default_value_t = 0.35)]
    pub nms_threshold: f32,

    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 32 * 1024 * 1024)]
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn detector_options(&self, cuda_available: bool) -> DetectorOptions {
        let device = self.device.unwrap_or(if cuda_available {
            Device::Cuda
        } else {
            Device::Cpu
        });

        DetectorOptions {
            input_size: self.input_size,
            confidence_threshold: self.confidence_threshold,
            nms_threshold: self.nms_threshold,
            device,
            ..Default::default()
        }
    }
}
