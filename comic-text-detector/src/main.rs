use std::path::PathBuf;

use clap::Parser;
use comic_text_detector::{ComicTextDetector, DetectorOptions, Device};
use image::Rgba;
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    image: PathBuf,

    #[arg(long, default_value = "models/comictextdetector.pt.onnx")]
    model: PathBuf,

    #[arg(long, default_value_t = 0.4)]
    confidence: f32,

    #[arg(long, default_value_t = 0.35)]
    nms: f32,

    #[arg(long, value_enum, default_value_t = Device::Cpu)]
    device: Device,

    /// Save a copy of the image with every detected block outlined.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let options = DetectorOptions {
        confidence_threshold: args.confidence,
        nms_threshold: args.nms,
        device: args.device,
        ..Default::default()
    };
    let detector = ComicTextDetector::load(&args.model, options)?;

    let image =
        image::open(&args.image).map_err(|e| anyhow::anyhow!("Failed to open image: {e}"))?;
    let detection = detector.detect(&image)?;

    println!("{}", serde_json::to_string_pretty(&detection.blocks)?);

    if let Some(output) = args.output {
        let mut annotated = image.to_rgba8();
        for block in &detection.blocks {
            let rect = Rect::at(block.xyxy[0] as i32, block.xyxy[1] as i32)
                .of_size(block.width().max(1.0) as u32, block.height().max(1.0) as u32);
            draw_hollow_rect_mut(&mut annotated, rect, Rgba([255, 0, 0, 255]));
        }
        annotated
            .save(&output)
            .map_err(|e| anyhow::anyhow!("Failed to save annotated image: {e}"))?;
        tracing::info!("saved annotated image to {}", output.display());
    }

    Ok(())
}
