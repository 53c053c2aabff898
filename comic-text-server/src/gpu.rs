/// Name of the first NVIDIA GPU reported by NVML, if any.
#[cfg(feature = "cuda")]
fn primary_cuda_device() -> Option<String> {
    let nvml = nvml_wrapper::Nvml::init().ok()?;
    nvml.device_by_index(0).and_then(|device| device.name()).ok()
}

// NVML is only linked with the `cuda` feature.
#[cfg(not(feature = "cuda"))]
fn primary_cuda_device() -> Option<String> {
    None
}

pub fn cuda_available() -> bool {
    let device = primary_cuda_device();
    if let Some(name) = &device {
        tracing::info!("CUDA device: {}", name);
    }
    device.is_some()
}
