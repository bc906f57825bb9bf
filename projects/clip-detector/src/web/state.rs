use crate::cli::ServeArgs;
use crate::pipeline::detection::Detector;
use crate::pipeline::registry::JobRegistry;
use crate::video::VideoBackend;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Settings the handlers need, resolved from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub upload_root: PathBuf,
    pub output_root: PathBuf,
    pub output_fps: f64,
    pub max_upload_bytes: usize,
    pub max_processing: Option<Duration>,
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            upload_root: args.upload_root.clone(),
            output_root: args.output_root.clone(),
            output_fps: args.output_fps,
            max_upload_bytes: args.max_upload_mb * 1024 * 1024,
            max_processing: (args.max_processing_secs > 0)
                .then(|| Duration::from_secs(args.max_processing_secs)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<JobRegistry>,
    pub backend: Arc<dyn VideoBackend>,
    pub detector: Arc<dyn Detector>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        registry: Arc<JobRegistry>,
        backend: Arc<dyn VideoBackend>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            backend,
            detector,
        }
    }
}
