//! Upload-surface handlers: `;upload[/<job>[/<position>]]` (§6, C5).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::context::ClientContext;
use crate::errors::ErrorKind;
use crate::model::Metadata;
use crate::upload;
use crate::AppState;

/// Body of `POST /p/<name>;upload` (§6 table).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CreateUploadRequest {
    pub chunk_length: u64,
    pub content_length: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_md5: Option<String>,
    #[serde(default)]
    pub content_sha256: Option<String>,
    #[serde(default)]
    pub content_disposition: Option<String>,
}

fn metadata_from(req: &CreateUploadRequest) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(v) = &req.content_type {
        metadata.insert("content-type".to_string(), v.clone());
    }
    if let Some(v) = &req.content_disposition {
        metadata.insert("content-disposition".to_string(), v.clone());
    }
    if let Some(v) = &req.content_md5 {
        metadata.insert("content-md5".to_string(), v.clone());
    }
    if let Some(v) = &req.content_sha256 {
        metadata.insert("content-sha256".to_string(), v.clone());
    }
    metadata
}

/// `POST /p/<name>;upload`: create a resumable upload job.
pub async fn create_job(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    body: Body,
) -> Result<Response, ErrorKind> {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ErrorKind::BadRequest(format!("failed to read request body: {e}")))?;
    let req: CreateUploadRequest = serde_json::from_slice(&bytes)
        .map_err(|e| ErrorKind::BadRequest(format!("invalid JSON body: {e}")))?;

    let metadata = metadata_from(&req);
    let job = upload::create_upload(
        state.directory.as_ref(),
        state.storage.as_ref(),
        &path,
        req.chunk_length,
        req.content_length,
        metadata,
        &ctx,
    )
    .await?;

    let location = format!("{path};upload/{}", job.job_token);
    let mut resp = (
        StatusCode::CREATED,
        axum::Json(json!({ "job": job.job_token, "chunk-length": job.chunksize, "content-length": job.nbytes })),
    )
        .into_response();
    resp.headers_mut().insert("location", location.parse().unwrap());
    Ok(resp)
}

/// `PUT /p/<name>;upload/<job>/<position>`: upload one chunk.
pub async fn upload_chunk(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    job: String,
    position: u64,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ErrorKind> {
    let nbytes: u64 = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ErrorKind::LengthRequired)?;

    let stream = body.into_data_stream().map_err(Into::<anyhow::Error>::into).boxed();
    upload::upload_chunk(
        state.directory.as_ref(),
        state.storage.as_ref(),
        &path,
        &job,
        position,
        stream,
        nbytes,
        Metadata::new(),
        &ctx,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST /p/<name>;upload/<job>`: finalize the job into a new version.
pub async fn finalize_job(state: Arc<AppState>, ctx: ClientContext, path: String, job: String) -> Result<Response, ErrorKind> {
    let version = upload::finalize(state.directory.as_ref(), state.storage.as_ref(), &path, &job, &ctx).await?;
    let tag = version.version_tag.expect("finalized version always has a tag");
    let mut resp = StatusCode::CREATED.into_response();
    resp.headers_mut()
        .insert("location", format!("{path}:{tag}").parse().unwrap());
    Ok(resp)
}

/// `DELETE /p/<name>;upload/<job>`: cancel an in-progress job.
pub async fn cancel_job(state: Arc<AppState>, ctx: ClientContext, path: String, job: String) -> Result<Response, ErrorKind> {
    upload::cancel(state.directory.as_ref(), state.storage.as_ref(), &path, &job, &ctx).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- axum wiring ---------------------------------------------------------

pub async fn handle_upload(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ClientContext>,
    method: Method,
    axum::extract::Path(tail): axum::extract::Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ErrorKind> {
    use crate::handlers::{parse_resource, ParsedResource};

    let ParsedResource::Upload { path, job, position } = parse_resource(&tail)? else {
        return Err(ErrorKind::BadRequest("not an upload resource".into()));
    };

    match (method, job, position) {
        (Method::POST, None, None) => create_job(state, ctx, path, body).await,
        (Method::PUT, Some(job), Some(position)) => upload_chunk(state, ctx, path, job, position, headers, body).await,
        (Method::POST, Some(job), None) => finalize_job(state, ctx, path, job).await,
        (Method::DELETE, Some(job), None) => cancel_job(state, ctx, path, job).await,
        _ => Err(ErrorKind::BadRequest("unsupported upload request shape".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_upload_request_parses_kebab_case_json() {
        let json = r#"{"chunk-length": 4, "content-length": 10, "content-type": "text/plain"}"#;
        let req: CreateUploadRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.chunk_length, 4);
        assert_eq!(req.content_length, 10);
        assert_eq!(req.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn metadata_from_request_only_includes_present_fields() {
        let req = CreateUploadRequest {
            chunk_length: 1,
            content_length: 1,
            content_type: None,
            content_md5: Some("abc".into()),
            content_sha256: None,
            content_disposition: None,
        };
        let metadata = metadata_from(&req);
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("content-md5").unwrap(), "abc");
    }
}
