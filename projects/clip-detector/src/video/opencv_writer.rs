use super::VideoWriter;
use anyhow::{anyhow, Result};
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio,
};

/// Writes BGR frames into an MP4 container using the `mp4v` codec.
pub struct OpencvWriter {
    writer: videoio::VideoWriter,
    size: Size,
    released: bool,
}

impl OpencvWriter {
    pub fn new(path: &str, size: Size, fps: f64) -> Result<Self> {
        if fps <= 0.0 {
            return Err(anyhow!("Invalid output frame rate: {}", fps));
        }

        let fourcc = videoio::VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let writer = videoio::VideoWriter::new(path, fourcc, fps, size, true)?;
        if !writer.is_opened()? {
            return Err(anyhow!("Failed to open video writer: {}", path));
        }

        tracing::debug!(
            "OpencvWriter: writing {} at {}x{} @ {:.2} fps",
            path,
            size.width,
            size.height,
            fps
        );

        Ok(Self {
            writer,
            size,
            released: false,
        })
    }
}

impl VideoWriter for OpencvWriter {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        if self.released {
            return Err(anyhow!("Video writer already finished"));
        }

        // VideoWriter silently drops frames of the wrong size
        let size = frame.size()?;
        if size != self.size {
            return Err(anyhow!(
                "Frame size {}x{} does not match output size {}x{}",
                size.width,
                size.height,
                self.size.width,
                self.size.height
            ));
        }

        self.writer.write(frame)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.writer.release()?;
        }
        Ok(())
    }
}

impl Drop for OpencvWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!("OpencvWriter: failed to release writer: {}", e);
        }
    }
}
