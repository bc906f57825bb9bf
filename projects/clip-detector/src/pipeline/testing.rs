// Test doubles for the video backend and the detector

use crate::pipeline::detection::Detector;
use crate::video::{VideoBackend, VideoReader, VideoWriter};
use anyhow::{anyhow, Result};
use opencv::core::{Mat, Scalar, Size, Vec3b, CV_8UC3};
use opencv::prelude::*;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A frame filled with `value`, which doubles as its sequence marker.
pub fn solid_frame(value: u8, size: Size) -> Mat {
    Mat::new_rows_cols_with_default(size.height, size.width, CV_8UC3, Scalar::all(value as f64))
        .unwrap()
}

pub fn frame_marker(frame: &Mat) -> u8 {
    frame.at_2d::<Vec3b>(0, 0).unwrap()[0]
}

pub struct FakeReader {
    frames: VecDeque<Mat>,
    reported: usize,
    fps: f64,
    size: Size,
}

impl FakeReader {
    /// `count` frames marked 1..=count.
    pub fn new(count: usize, size: Size) -> Self {
        Self {
            frames: (1..=count).map(|i| solid_frame(i as u8, size)).collect(),
            reported: count,
            fps: 25.0,
            size,
        }
    }

    pub fn reporting(mut self, reported: usize) -> Self {
        self.reported = reported;
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }
}

impl VideoReader for FakeReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.reported)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.fps)
    }

    fn frame_size(&self) -> Result<Size> {
        Ok(self.size)
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        Ok(self.frames.pop_front())
    }
}

/// Shared view of everything the writers of a backend did.
#[derive(Clone, Default)]
pub struct WriterLog {
    pub opened: Arc<Mutex<Vec<(PathBuf, Size, f64)>>>,
    pub frames: Arc<Mutex<Vec<u8>>>,
    pub finished: Arc<AtomicBool>,
    pub dropped: Arc<AtomicBool>,
}

impl WriterLog {
    pub fn markers(&self) -> Vec<u8> {
        self.frames.lock().unwrap().clone()
    }
}

/// Records frame markers; on `finish` writes `frames=N` to its path if any.
/// Dropped unfinished, it appends `trailer` to that path like a container
/// being closed.
pub struct RecordingWriter {
    log: WriterLog,
    path: Option<PathBuf>,
    written: usize,
    finished: bool,
}

impl RecordingWriter {
    pub fn new(log: WriterLog) -> Self {
        Self {
            log,
            path: None,
            written: 0,
            finished: false,
        }
    }
}

impl VideoWriter for RecordingWriter {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        self.log.frames.lock().unwrap().push(frame_marker(frame));
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            std::fs::write(path, format!("frames={}", self.written))?;
        }
        self.finished = true;
        self.log.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for RecordingWriter {
    fn drop(&mut self) {
        if let (false, Some(path)) = (self.finished, &self.path) {
            if let Ok(mut file) = OpenOptions::new().append(true).open(path) {
                let _ = file.write_all(b"trailer");
            }
        }
        self.log.dropped.store(true, Ordering::SeqCst);
    }
}

pub struct FakeBackend {
    pub frames: usize,
    pub reported: Option<usize>,
    pub fps: f64,
    pub size: Size,
    pub fail_open: bool,
    pub log: WriterLog,
}

impl FakeBackend {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            reported: None,
            fps: 25.0,
            size: Size::new(10, 10),
            fail_open: false,
            log: WriterLog::default(),
        }
    }
}

impl VideoBackend for FakeBackend {
    fn open_reader(&self, path: &Path) -> Result<Box<dyn VideoReader>> {
        if self.fail_open {
            return Err(anyhow!("Failed to open video file: {:?}", path));
        }
        let reader = FakeReader::new(self.frames, self.size)
            .reporting(self.reported.unwrap_or(self.frames))
            .with_fps(self.fps);
        Ok(Box::new(reader))
    }

    fn open_writer(&self, path: &Path, size: Size, fps: f64) -> Result<Box<dyn VideoWriter>> {
        self.log
            .opened
            .lock()
            .unwrap()
            .push((path.to_path_buf(), size, fps));
        // A real writer creates the container up front
        std::fs::write(path, b"")?;
        let mut writer = RecordingWriter::new(self.log.clone());
        writer.path = Some(path.to_path_buf());
        Ok(Box::new(writer))
    }
}

/// Returns frames unchanged and counts calls. Optionally fails on call N.
#[derive(Default)]
pub struct StampDetector {
    pub calls: AtomicUsize,
    pub fail_on_call: Option<usize>,
    pub panic_on_call: Option<usize>,
}

impl StampDetector {
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    pub fn panicking_on(call: usize) -> Self {
        Self {
            panic_on_call: Some(call),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for StampDetector {
    fn annotate(&self, frame: &Mat) -> Result<Mat> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(anyhow!("inference failed on call {}", call));
        }
        if self.panic_on_call == Some(call) {
            panic!("detector panicked on call {}", call);
        }
        Ok(frame.clone())
    }
}
