use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::ingest::JobProgress;

use super::error::{ApiError, ApiResult};
use super::AppState;

#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    job: String,
}

/// Streamed multipart upload: the body is written to a staging file in
/// bounded chunks, then the ingest pipeline runs in the background under
/// the returned job id.
pub async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadAccepted>)> {
    let incoming = state.config.storage.scratch_dir.join("incoming");
    tokio::fs::create_dir_all(&incoming)
        .await
        .map_err(|err| ApiError::internal(format!("cannot stage upload: {err}")))?;

    // drain fields until the first one carrying a file, and stream it to
    // disk right there; fields cannot outlive the multipart reader
    let mut staged = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let tracker = state.jobs.create();
        let staging = incoming.join(format!("{}.upload", tracker.job_id()));
        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|err| ApiError::internal(format!("cannot stage upload: {err}")))?;
        let mut received: u64 = 0;
        loop {
            let chunk = field
                .chunk()
                .await
                .map_err(|err| ApiError::bad_request(format!("upload interrupted: {err}")))?;
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::internal(format!("cannot write staged upload: {err}")))?;
            received += chunk.len() as u64;
            tracker.set_current_bytes(received);
        }
        file.flush()
            .await
            .map_err(|err| ApiError::internal(format!("cannot write staged upload: {err}")))?;
        staged = Some((filename, staging, received, tracker));
        break;
    }
    let (filename, staging, received, tracker) =
        staged.ok_or_else(|| ApiError::bad_request("no file field in upload"))?;
    info!(
        target: "server",
        job = tracker.job_id(),
        %filename,
        bytes = received,
        "upload received, starting ingest"
    );

    let job = tracker.job_id().to_string();
    let ingest = state.ingest.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        if let Err(err) = ingest
            .ingest_file(&staging, &filename, &tracker, cancel)
            .await
        {
            // job state and the video row already carry the reason
            error!(target: "server", job = tracker.job_id(), "ingest failed: {err}");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(UploadAccepted { job })))
}

pub async fn upload_progress(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> ApiResult<Json<JobProgress>> {
    state
        .jobs
        .get(&job)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {job} not found")))
}
