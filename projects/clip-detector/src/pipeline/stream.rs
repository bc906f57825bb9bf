// Live stream worker: decode → detect → JPEG, framed as multipart parts
//
// Runs on its own thread and hands parts to the HTTP body through a small
// bounded channel. Nothing is persisted and the job registry is not touched.

use crate::pipeline::detection::Detector;
use crate::video::{VideoBackend, VideoReader};
use anyhow::{anyhow, Result};
use axum::body::Bytes;
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Parts buffered ahead of a slow client.
const STREAM_BUFFER: usize = 2;

pub fn encode_jpeg(frame: &Mat) -> Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let ok = imgcodecs::imencode(".jpg", frame, &mut buf, &Vector::new())?;
    if !ok {
        return Err(anyhow!("JPEG encoding failed"));
    }
    Ok(buf.to_vec())
}

/// Wrap one JPEG image as a `multipart/x-mixed-replace` part.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 4);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n\r\n");
    Bytes::from(part)
}

/// Push one part per source frame until the source is exhausted or the
/// receiver goes away. Returns the number of parts delivered.
pub fn stream_worker(
    mut reader: Box<dyn VideoReader>,
    detector: &dyn Detector,
    tx: mpsc::Sender<Bytes>,
) -> Result<usize> {
    let mut sent = 0;

    while let Some(frame) = reader.next_frame()? {
        let annotated = detector.annotate(&frame)?;
        let jpeg = encode_jpeg(&annotated)?;

        if tx.blocking_send(multipart_part(&jpeg)).is_err() {
            tracing::debug!("Stream client disconnected after {} frames", sent);
            break;
        }
        sent += 1;
    }

    Ok(sent)
}

/// Start streaming `path` on a dedicated thread. The receiver yields parts in
/// source order and closes when the stream ends.
pub fn spawn_stream(
    path: PathBuf,
    backend: Arc<dyn VideoBackend>,
    detector: Arc<dyn Detector>,
) -> Result<mpsc::Receiver<Bytes>> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    thread::Builder::new()
        .name(format!("stream-{}", name))
        .spawn(move || {
            // Each stream gets its own reader instance, opened inside the thread
            let result = backend
                .open_reader(&path)
                .and_then(|reader| stream_worker(reader, detector.as_ref(), tx));

            match result {
                Ok(sent) => tracing::info!("Stream of {:?} finished after {} frames", path, sent),
                Err(e) => tracing::warn!("Stream of {:?} stopped: {:#}", path, e),
            }
        })
        .map_err(|e| anyhow!("Failed to spawn stream thread: {}", e))?;

    Ok(rx)
}
