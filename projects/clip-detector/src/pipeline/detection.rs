use crate::pipeline::annotate::draw_detections;
use crate::pipeline::types::{BBox, Detection};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use std::sync::Mutex;
use usls::models::RTDETR;
use usls::{Config, Image};

/// Turns a frame into an annotated copy of itself.
///
/// Implementations are shared between every processing job and live stream,
/// so they must tolerate concurrent calls from different threads.
pub trait Detector: Send + Sync {
    fn annotate(&self, frame: &Mat) -> Result<Mat>;
}

/// A wrapper around the USLS RT-DETR model that handles BGR-to-RGB conversion
/// and corrects for aspect-ratio padding bugs in the underlying model library.
pub struct ObjectDetector {
    model: RTDETR,
}

impl ObjectDetector {
    /// Create a new detector with the given model path.
    pub fn new(model_path: &str) -> Result<Self> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        Ok(Self { model })
    }

    /// Run detection on an OpenCV Mat.
    pub fn detect(&mut self, image: &Mat) -> Result<Vec<usls::Hbb>> {
        let dynamic_image = mat_to_dynamic_image(image)?;

        // Correction calculations (USLS RT-DETR bug workaround)
        let size = image.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;

        let (x_correction, y_correction) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let results = self.model.forward(&[Image::from(dynamic_image)])?;
        let Some(y) = results.into_iter().next() else {
            return Ok(Vec::new());
        };

        let corrected = y
            .hbbs
            .into_iter()
            .map(|hbb| {
                let x = hbb.xmin() * x_correction;
                let w = hbb.width() * x_correction;
                let y_coord = hbb.ymin() * y_correction;
                let h = hbb.height() * y_correction;

                let mut new_hbb = usls::Hbb::default().with_xyxy(x, y_coord, x + w, y_coord + h);

                if let Some(conf) = hbb.confidence() {
                    new_hbb = new_hbb.with_confidence(conf);
                }
                if let Some(id) = hbb.id() {
                    new_hbb = new_hbb.with_id(id);
                }
                if let Some(name) = hbb.name() {
                    new_hbb = new_hbb.with_name(name);
                }

                new_hbb
            })
            .collect();

        Ok(corrected)
    }
}

/// The model behind a mutex plus the overlay renderer.
///
/// The forward pass needs `&mut` access, so concurrent jobs and streams take
/// turns on inference. Drawing happens after the lock is released.
pub struct ModelDetector {
    model: Mutex<ObjectDetector>,
    min_conf: f32,
}

impl ModelDetector {
    pub fn new(model_path: &str, min_conf: f32) -> Result<Self> {
        let model = ObjectDetector::new(model_path)
            .map_err(|e| anyhow!("Failed to load model '{}': {}", model_path, e))?;
        tracing::info!("Loaded detection model {} (min_conf={})", model_path, min_conf);
        Ok(Self {
            model: Mutex::new(model),
            min_conf,
        })
    }
}

impl Detector for ModelDetector {
    fn annotate(&self, frame: &Mat) -> Result<Mat> {
        let hbbs = {
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow!("Detector mutex poisoned"))?;
            model.detect(frame)?
        };

        let detections = filter_detections(hbbs, self.min_conf);
        tracing::trace!("Detected {} objects", detections.len());
        draw_detections(frame, &detections)
    }
}

/// Drop detections below `min_conf` and convert the rest to pixel boxes.
pub fn filter_detections(hbbs: Vec<usls::Hbb>, min_conf: f32) -> Vec<Detection> {
    hbbs.into_iter()
        .filter(|d| d.confidence().unwrap_or(0.0) >= min_conf)
        .map(|d| Detection {
            bbox: BBox {
                x: d.xmin(),
                y: d.ymin(),
                w: d.width(),
                h: d.height(),
            },
            confidence: d.confidence().unwrap_or(0.0),
            class_id: d.id().unwrap_or(0),
            class_name: d.name().map(|s| s.to_string()),
        })
        .collect()
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let width = size.width as u32;
    let height = size.height as u32;

    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let data_bytes = rgb_mat.data_bytes()?;
    let buffer = data_bytes.to_vec();

    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_vec(width, height, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}
