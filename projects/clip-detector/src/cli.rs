use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload and detection web server
    Serve(ServeArgs),
    /// Annotate a single video file and exit
    Process(ProcessArgs),
}

/// Detection model settings shared by both subcommands
#[derive(clap::Args, Debug, Clone)]
pub struct ModelArgs {
    /// Path to the ONNX detection model
    #[arg(long, env = "CLIP_DETECTOR_MODEL")]
    pub model: String,

    /// Detections below this confidence are not drawn
    #[arg(long, env = "CLIP_DETECTOR_MIN_CONFIDENCE", default_value_t = 0.25)]
    pub min_confidence: f32,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to; the next free port is used if taken
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Directory uploaded videos are saved to
    #[arg(long, env = "CLIP_DETECTOR_UPLOAD_ROOT", default_value = "uploads")]
    pub upload_root: PathBuf,

    /// Directory processed videos are written to
    #[arg(long, env = "CLIP_DETECTOR_OUTPUT_ROOT", default_value = "output")]
    pub output_root: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Frame rate of processed videos
    #[arg(long, default_value_t = 30.0)]
    pub output_fps: f64,

    /// Maximum upload size in MiB
    #[arg(long, default_value_t = 16)]
    pub max_upload_mb: usize,

    /// Abort a job after this many seconds (0 disables the limit)
    #[arg(long, default_value_t = 3600)]
    pub max_processing_secs: u64,

    /// How long finished jobs stay queryable
    #[arg(long, default_value_t = 3600)]
    pub job_ttl_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub eviction_interval_secs: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Video to annotate
    pub input: PathBuf,

    /// Directory the timestamped output is written to
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
