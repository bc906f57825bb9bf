pub mod opencv_reader;
pub mod opencv_writer;
pub mod processor;

use anyhow::{Context, Result};
use opencv::core::{Mat, Size};
use opencv_reader::OpencvReader;
use opencv_writer::OpencvWriter;
use std::path::Path;

/// Sequential frame source over a video file.
pub trait VideoReader: Send {
    /// Frame count reported by the container. May be 0 when unknown.
    fn frame_count(&self) -> Result<usize>;
    /// Frame rate reported by the container. May be 0 when unknown.
    fn source_fps(&self) -> Result<f64>;
    fn frame_size(&self) -> Result<Size>;
    /// Returns `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}

/// Ordered frame sink bound to a codec, frame rate and resolution.
pub trait VideoWriter: Send {
    fn write_frame(&mut self, frame: &Mat) -> Result<()>;
    /// Flush and close the container. Safe to call more than once.
    fn finish(&mut self) -> Result<()>;
}

/// Opens readers and writers for paths on disk.
pub trait VideoBackend: Send + Sync {
    fn open_reader(&self, path: &Path) -> Result<Box<dyn VideoReader>>;
    fn open_writer(&self, path: &Path, size: Size, fps: f64) -> Result<Box<dyn VideoWriter>>;
}

pub struct OpencvBackend;

impl VideoBackend for OpencvBackend {
    fn open_reader(&self, path: &Path) -> Result<Box<dyn VideoReader>> {
        let path_str = path
            .to_str()
            .with_context(|| format!("Non UTF-8 video path: {:?}", path))?;
        let reader = OpencvReader::new(path_str)
            .with_context(|| format!("Failed to open video at: '{}'", path_str))?;
        Ok(Box::new(reader))
    }

    fn open_writer(&self, path: &Path, size: Size, fps: f64) -> Result<Box<dyn VideoWriter>> {
        let path_str = path
            .to_str()
            .with_context(|| format!("Non UTF-8 output path: {:?}", path))?;
        let writer = OpencvWriter::new(path_str, size, fps)
            .with_context(|| format!("Failed to create output video at: '{}'", path_str))?;
        Ok(Box::new(writer))
    }
}
