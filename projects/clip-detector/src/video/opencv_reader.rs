use super::VideoReader;
use anyhow::{anyhow, Result};
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH,
    },
};

pub struct OpencvReader {
    capture: VideoCapture,
    source_fps: f64,
    total_frames: usize,
    size: Size,
}

impl OpencvReader {
    pub fn new(path: &str) -> Result<Self> {
        let capture = VideoCapture::from_file(path, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path));
        }

        let fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 {
            tracing::warn!("OpencvReader: no FPS in metadata for {}", path);
        }

        // Some containers report 0 or a negative count when unknown
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?;
        let total_frames = if raw_count > 0.0 { raw_count as usize } else { 0 };

        let size = Size::new(
            capture.get(CAP_PROP_FRAME_WIDTH)? as i32,
            capture.get(CAP_PROP_FRAME_HEIGHT)? as i32,
        );
        if size.width <= 0 || size.height <= 0 {
            return Err(anyhow!("Video has no usable resolution: {}", path));
        }

        tracing::info!(
            "OpencvReader: opened {}, fps={:.2}, stream_frames={}, resolution={}x{}",
            path,
            fps,
            total_frames,
            size.width,
            size.height
        );

        Ok(Self {
            capture,
            source_fps: fps,
            total_frames,
            size,
        })
    }
}

impl VideoReader for OpencvReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.total_frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.source_fps)
    }

    fn frame_size(&self) -> Result<Size> {
        Ok(self.size)
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Ok(None);
        }

        Ok(Some(frame))
    }
}

impl Drop for OpencvReader {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("OpencvReader: failed to release capture: {}", e);
        }
    }
}
