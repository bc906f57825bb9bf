use crate::pipeline::stream::{spawn_stream, STREAM_CONTENT_TYPE};
use crate::pipeline::types::JobSnapshot;
use crate::pipeline::worker::{spawn_job, JobSpec};
use crate::web::assets::render_page;
use crate::web::error::{ApiError, ApiResult};
use crate::web::state::AppState;
use crate::web::upload::{accept_upload_name, secure_filename};
use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Json,
};
use futures::StreamExt;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;

pub async fn upload_form(State(state): State<AppState>) -> Result<Html<String>, StatusCode> {
    let max_mb = state.config.max_upload_bytes / (1024 * 1024);
    render_page("upload.html", &[("max_upload_mb", max_mb.to_string())])
}

/// Accept a multipart upload, store it and start processing it.
///
/// Anything unusable (no `video` field, empty name or body, disallowed
/// extension) sends the browser back to the form without creating a job.
pub async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("video") {
            continue;
        }
        let raw_name = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await?;
        upload = Some((raw_name, data));
        break;
    }

    let Some((raw_name, data)) = upload else {
        tracing::warn!("Upload without a video field");
        return Ok(Redirect::to("/").into_response());
    };
    let Some(filename) = accept_upload_name(&raw_name) else {
        tracing::warn!("Rejected upload {:?}", raw_name);
        return Ok(Redirect::to("/").into_response());
    };
    if data.is_empty() {
        tracing::warn!("Rejected empty upload {}", filename);
        return Ok(Redirect::to("/").into_response());
    }

    // Creating the job first cancels any worker still reading the previous
    // upload of this name; the new bytes then replace it by rename so an open
    // reader keeps its own copy.
    let ticket = state.registry.create(&filename);
    let input_path = state.config.upload_root.join(&filename);
    let staging_path = state
        .config
        .upload_root
        .join(format!(".{}-{}", ticket.generation(), filename));
    if let Err(e) = save_upload(&staging_path, &input_path, &data).await {
        state.registry.fail(&ticket, "failed to save upload");
        let _ = tokio::fs::remove_file(&staging_path).await;
        return Err(ApiError::internal(format!("saving {:?}: {}", input_path, e)));
    }
    tracing::info!("Saved upload {:?} ({} bytes)", input_path, data.len());

    let spec = JobSpec {
        ticket: ticket.clone(),
        input_path,
        output_dir: state.config.output_root.clone(),
        output_fps: state.config.output_fps,
        max_duration: state.config.max_processing,
    };

    if let Err(e) = spawn_job(
        spec,
        state.backend.clone(),
        state.detector.clone(),
        state.registry.clone(),
    ) {
        state.registry.fail(&ticket, "failed to start worker");
        return Err(ApiError::internal(format!("job {}: {:#}", filename, e)));
    }

    Ok(Redirect::to(&format!("/processing/{}", filename)).into_response())
}

async fn save_upload(staging: &std::path::Path, dest: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(staging, data).await?;
    tokio::fs::rename(staging, dest).await
}

pub async fn processing_page(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Html<String>, StatusCode> {
    let filename = secure_filename(&filename);
    let snapshot = state.registry.get(&filename);

    render_page(
        "processing.html",
        &[
            ("filename", filename),
            ("status", snapshot.status.to_string()),
            ("progress", format!("{:.1}", snapshot.progress)),
            ("error", snapshot.error.unwrap_or_default()),
        ],
    )
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Json<JobSnapshot> {
    Json(state.registry.get(&secure_filename(&filename)))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<StatusCode> {
    let filename = secure_filename(&filename);
    if state.registry.cancel(&filename) {
        tracing::info!("Cancellation requested for job {}", filename);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("No running job for {}", filename)))
    }
}

/// Live `multipart/x-mixed-replace` feed of the upload with detections drawn.
pub async fn video_feed(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let filename = secure_filename(&filename);
    let path = state.config.upload_root.join(&filename);
    if filename.is_empty() || !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(ApiError::not_found("File not found"));
    }

    let rx = spawn_stream(path, state.backend.clone(), state.detector.clone())
        .map_err(|e| ApiError::internal(format!("stream {}: {:#}", filename, e)))?;
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

    Ok((
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}
