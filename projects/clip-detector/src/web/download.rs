// Download of processed videos
//
// The output file is claimed from the registry, streamed to the client and
// deleted when the response body is dropped, whether it was fully sent or
// the connection broke halfway.

use crate::web::error::{ApiError, ApiResult};
use crate::web::state::AppState;
use crate::web::upload::secure_filename;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;
const NOT_READY: &str = "File not found or processing not completed yet.";

/// Deletes a file exactly once, when dropped.
pub struct RemoveOnDrop {
    path: PathBuf,
}

impl RemoveOnDrop {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("Processed file {:?} deleted after download", self.path),
            Err(e) => tracing::warn!("Failed to delete {:?} after download: {}", self.path, e),
        }
    }
}

pub async fn download_video(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let filename = secure_filename(&filename);
    if filename.is_empty() {
        return Err(ApiError::not_found(NOT_READY));
    }

    // Move the output aside while the registry still guards it, so a newer
    // job for the same name can publish without racing this download.
    let output_root = state.config.output_root.clone();
    let claimed = state.registry.claim_output(&filename, |output, generation| {
        let served = output_root.join(format!(".{}-download-{}", generation, output));
        std::fs::rename(output_root.join(output), &served)?;
        Ok((output.to_string(), served))
    });
    let (output_name, path) = match claimed {
        Some(Ok(claimed)) => claimed,
        Some(Err(e)) => {
            tracing::warn!("Output for job {} is gone: {}", filename, e);
            return Err(ApiError::not_found(NOT_READY));
        }
        None => return Err(ApiError::not_found(NOT_READY)),
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("Output {:?} for job {} is gone: {}", path, filename, e);
            return Err(ApiError::not_found(NOT_READY));
        }
    };
    let guard = RemoveOnDrop::new(path.clone());
    let length = file
        .metadata()
        .await
        .map_err(|e| ApiError::internal(format!("stat {:?}: {}", path, e)))?
        .len();

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut file = file;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok::<Bytes, std::io::Error>(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    tracing::warn!("Read error while serving {:?}: {}", path, e);
                    yield Err(e);
                    break;
                }
            }
        }
    };

    let mime = mime_guess::from_path(&output_name).first_or_octet_stream();
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", output_name),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
