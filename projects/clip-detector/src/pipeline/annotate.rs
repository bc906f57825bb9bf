// Detection overlay: boxes, class labels and confidence drawn onto a frame copy

use crate::pipeline::types::Detection;
use anyhow::Result;
use opencv::core::{Mat, Point, Rect, Scalar, Size};
use opencv::imgproc::{self, FONT_HERSHEY_SIMPLEX, LINE_AA, LINE_8};
use opencv::prelude::*;

const BOX_THICKNESS: i32 = 2;
const FONT_SCALE: f64 = 0.5;
const FONT_THICKNESS: i32 = 1;
const LABEL_PADDING: i32 = 3;

/// BGR palette, indexed by class id modulo its length.
const PALETTE: [(f64, f64, f64); 12] = [
    (56.0, 56.0, 255.0),
    (151.0, 157.0, 255.0),
    (31.0, 112.0, 255.0),
    (29.0, 178.0, 255.0),
    (49.0, 210.0, 207.0),
    (10.0, 249.0, 72.0),
    (23.0, 204.0, 146.0),
    (134.0, 219.0, 61.0),
    (187.0, 212.0, 0.0),
    (168.0, 153.0, 44.0),
    (255.0, 194.0, 0.0),
    (147.0, 69.0, 52.0),
];

pub fn class_color(class_id: usize) -> Scalar {
    let (b, g, r) = PALETTE[class_id % PALETTE.len()];
    Scalar::new(b, g, r, 0.0)
}

/// Returns a copy of `frame` with every detection drawn on it. The input is
/// left untouched and the output keeps its dimensions.
pub fn draw_detections(frame: &Mat, detections: &[Detection]) -> Result<Mat> {
    let mut canvas = frame.clone();
    let size = canvas.size()?;

    for d in detections {
        let Some(rect) = clamp_rect(d, size) else {
            continue;
        };
        let color = class_color(d.class_id);
        imgproc::rectangle(&mut canvas, rect, color, BOX_THICKNESS, LINE_8, 0)?;
        draw_label(&mut canvas, &d.label(), rect, color)?;
    }

    Ok(canvas)
}

fn draw_label(canvas: &mut Mat, text: &str, rect: Rect, color: Scalar) -> Result<()> {
    let mut baseline = 0;
    let text_size =
        imgproc::get_text_size(text, FONT_HERSHEY_SIMPLEX, FONT_SCALE, FONT_THICKNESS, &mut baseline)?;
    let label_h = text_size.height + baseline + LABEL_PADDING * 2;

    // Above the box when there is room, otherwise just inside its top edge
    let top = if rect.y >= label_h { rect.y - label_h } else { rect.y };
    let background = Rect::new(rect.x, top, text_size.width + LABEL_PADDING * 2, label_h);
    imgproc::rectangle(canvas, background, color, imgproc::FILLED, LINE_8, 0)?;

    let origin = Point::new(
        rect.x + LABEL_PADDING,
        top + LABEL_PADDING + text_size.height,
    );
    imgproc::put_text(
        canvas,
        text,
        origin,
        FONT_HERSHEY_SIMPLEX,
        FONT_SCALE,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        FONT_THICKNESS,
        LINE_AA,
        false,
    )?;

    Ok(())
}

/// Clip a detection box to the frame; `None` when nothing is left to draw.
fn clamp_rect(d: &Detection, size: Size) -> Option<Rect> {
    let x1 = (d.bbox.x.max(0.0) as i32).min(size.width - 1);
    let y1 = (d.bbox.y.max(0.0) as i32).min(size.height - 1);
    let x2 = ((d.bbox.x + d.bbox.w) as i32).min(size.width - 1);
    let y2 = ((d.bbox.y + d.bbox.h) as i32).min(size.height - 1);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
}
