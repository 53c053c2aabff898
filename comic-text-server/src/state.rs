use std::sync::Arc;

use crate::{config::Config, detection::DetectionService};

#[derive(Debug, Clone)]
pub struct AppState {
    pub service: Arc<DetectionService>,
    pub config: Arc<Config>,
    pub cuda_available: bool,
}

impl AppState {
    pub fn new(service: DetectionService, config: Config, cuda_available: bool) -> Self {
        Self {
            service: Arc::new(service),
            config: Arc::new(config),
            cuda_available,
        }
    }
}
