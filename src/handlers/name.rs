//! Name-surface handlers: GET/HEAD/PUT/DELETE on namespace and object
//! paths, and the `;versions` listing (§6 HTTP surface table).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::context::ClientContext;
use crate::errors::ErrorKind;
use crate::fingerprint::hash_list;
use crate::handlers::not_found;
use crate::lifecycle;
use crate::model::{Metadata, ObjectVersion, Subtype};
use crate::storage::backend::{ByteSlice, ContentRange, RangeBody};
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct PutNameQuery {
    #[serde(default)]
    pub parents: bool,
}

fn etag_for(tag: &str) -> String {
    format!("\"{tag}\"")
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// RFC 7232 precondition evaluation against a version's ETag (its
/// version tag). Returns `Err(PreconditionFailed)` or
/// `Err(NotModified)` when the request should stop short of the body.
fn evaluate_preconditions(headers: &HeaderMap, etag: &str, is_read: bool) -> Result<(), ErrorKind> {
    let inner = strip_quotes(etag);

    if let Some(if_match) = headers.get("if-match").and_then(|v| v.to_str().ok()) {
        let candidate = strip_quotes(if_match);
        if candidate != "*" && candidate != inner {
            return Err(ErrorKind::PreconditionFailed);
        }
    }

    if let Some(if_none_match) = headers.get("if-none-match").and_then(|v| v.to_str().ok()) {
        let candidate = strip_quotes(if_none_match);
        if candidate == "*" || candidate == inner {
            return if is_read {
                Err(ErrorKind::NotModified)
            } else {
                Err(ErrorKind::PreconditionFailed)
            };
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    StartEnd(u64, u64),
    StartOpen(u64),
    Suffix(u64),
}

fn parse_range_header(value: &str) -> Option<ByteRange> {
    let value = value.trim();
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None; // single range only
    }
    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        (n > 0).then_some(ByteRange::Suffix(n))
    } else if let Some(start) = spec.strip_suffix('-') {
        Some(ByteRange::StartOpen(start.parse().ok()?))
    } else {
        let (start_s, end_s) = spec.split_once('-')?;
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = end_s.parse().ok()?;
        (start <= end).then_some(ByteRange::StartEnd(start, end))
    }
}

fn resolve_range(range: ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match range {
        ByteRange::StartEnd(start, end) => (start < total).then(|| (start, end.min(total - 1))),
        ByteRange::StartOpen(start) => (start < total).then(|| (start, total - 1)),
        ByteRange::Suffix(n) => Some(if n >= total { (0, total - 1) } else { (total - n, total - 1) }),
    }
}

/// `GET`/`HEAD /p/<name>` and `/p/<name>:<tag>` (§6): list a namespace's
/// children, or read the current/specific version of an object, honoring
/// `Range` and the standard preconditions.
pub async fn get_or_head(
    state: Arc<AppState>,
    ctx: ClientContext,
    method: Method,
    path: String,
    tag: Option<String>,
    headers: HeaderMap,
) -> Result<Response, ErrorKind> {
    let name = state.directory.resolve(&path).await?.ok_or_else(|| not_found(&path))?;

    if name.subtype == Subtype::Namespace {
        if tag.is_some() {
            return Err(ErrorKind::BadRequest("a namespace has no versions".into()));
        }
        let children = state.directory.enumerate_children(&path, false, &ctx).await?;
        let names: Vec<&str> = children.iter().map(|c| c.path.as_str()).collect();
        let etag = hash_list(names.iter().copied());
        let body = json!({
            "path": name.path,
            "children": names,
        });
        let mut resp = (StatusCode::OK, axum::Json(body)).into_response();
        resp.headers_mut().insert("etag", etag_for(&etag).parse().unwrap());
        return Ok(resp);
    }

    let version: ObjectVersion = match &tag {
        Some(tag) => state
            .directory
            .get_version(&path, tag, &ctx)
            .await?
            .ok_or_else(|| not_found(&format!("{path}:{tag}")))?,
        None => state
            .directory
            .current_version(&path, &ctx)
            .await?
            .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' has no current version")))?,
    };
    let version_tag = version.version_tag.clone().expect("visible version always has a tag");
    let etag = etag_for(&version_tag);

    evaluate_preconditions(&headers, &etag, true)?;

    let slice = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header)
        .and_then(|r| resolve_range(r, version.nbytes))
        .map(|(start, stop)| ByteSlice { start, stop: stop + 1 });
    let partial = slice.is_some();
    if headers.contains_key("range") && slice.is_none() {
        return Err(ErrorKind::BadRange);
    }

    let ContentRange { nbytes, metadata, body } = state
        .storage
        .get_content_range(&path, &version_tag, &version.metadata, slice, None)
        .await
        .map_err(ErrorKind::Internal)?;

    match body {
        RangeBody::Redirect(url) => {
            let mut resp = StatusCode::SEE_OTHER.into_response();
            resp.headers_mut().insert("location", url.parse().unwrap());
            resp.headers_mut().insert("etag", etag.parse().unwrap());
            Ok(resp)
        }
        RangeBody::Bytes(stream) => {
            let status = if partial { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
            let axum_body = if method == Method::HEAD {
                Body::empty()
            } else {
                Body::from_stream(stream)
            };
            let mut resp = Response::builder()
                .status(status)
                .header("content-length", nbytes.to_string())
                .header("etag", etag)
                .body(axum_body)
                .unwrap();
            if let Some(ct) = metadata.get("content-type") {
                resp.headers_mut().insert("content-type", ct.parse().unwrap());
            }
            if partial {
                let (start, stop) = slice.map(|s| (s.start, s.stop)).unwrap_or((0, nbytes));
                resp.headers_mut().insert(
                    "content-range",
                    format!("bytes {}-{}/{}", start, stop.saturating_sub(1), version.nbytes)
                        .parse()
                        .unwrap(),
                );
            }
            Ok(resp)
        }
    }
}

fn metadata_from_headers(headers: &HeaderMap) -> Result<Metadata, ErrorKind> {
    let mut metadata = Metadata::new();
    if let Some(v) = headers.get("content-type").and_then(|v| v.to_str().ok()) {
        metadata.insert("content-type".to_string(), v.to_string());
    }
    if let Some(v) = headers.get("content-disposition").and_then(|v| v.to_str().ok()) {
        metadata.insert("content-disposition".to_string(), v.to_string());
    }
    if let Some(v) = headers.get("content-md5").and_then(|v| v.to_str().ok()) {
        metadata.insert("content-md5".to_string(), v.to_string());
    }
    if let Some(v) = headers.get("content-sha256").and_then(|v| v.to_str().ok()) {
        metadata.insert("content-sha256".to_string(), v.to_string());
    }
    Ok(metadata)
}

/// `PUT /p/<name>` (§6): creates a namespace when `Content-Type:
/// application/x-hatrac-namespace`, otherwise writes a new object
/// version. `?parents=true` auto-creates missing ancestor namespaces.
pub async fn put_name(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    query: PutNameQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ErrorKind> {
    if state.config.read_only {
        return Err(ErrorKind::Forbidden("this service is in read-only mode".into()));
    }
    crate::acl::enforce_firewall(&state.config.firewall_acls.create, &ctx)?;

    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok());
    if content_type == Some("application/x-hatrac-namespace") {
        let name = state
            .directory
            .create_name(&path, Subtype::Namespace, query.parents, &ctx)
            .await?;
        let mut resp = StatusCode::CREATED.into_response();
        resp.headers_mut().insert("location", name.path.parse().unwrap());
        return Ok(resp);
    }

    let nbytes: u64 = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ErrorKind::LengthRequired)?;
    if nbytes > state.config.max_request_payload_size {
        return Err(ErrorKind::PayloadTooLarge);
    }

    let metadata = metadata_from_headers(&headers)?;

    let existing = state.directory.resolve(&path).await?;
    let create_if_missing = if existing.is_none() && query.parents {
        state.directory.create_name(&path, Subtype::Object, true, &ctx).await?;
        false
    } else {
        existing.is_none()
    };

    let stream = body.into_data_stream().map_err(Into::<anyhow::Error>::into).boxed();
    let version = lifecycle::put_version(
        state.directory.as_ref(),
        state.storage.as_ref(),
        &path,
        create_if_missing,
        stream,
        nbytes,
        metadata,
        &ctx,
    )
    .await?;
    let tag = version.version_tag.expect("freshly completed version always has a tag");

    let mut resp = StatusCode::CREATED.into_response();
    resp.headers_mut()
        .insert("location", format!("{path}:{tag}").parse().unwrap());
    resp.headers_mut().insert("etag", etag_for(&tag).parse().unwrap());
    Ok(resp)
}

use futures::StreamExt;

/// `DELETE /p/<name>` or `/p/<name>:<tag>` (§6): soft-delete an object
/// (and its whole subtree, if a namespace) or a single version, then
/// best-effort purge the backend bytes (§4.1 "post-commit cleanup").
pub async fn delete_name(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    tag: Option<String>,
) -> Result<Response, ErrorKind> {
    if state.config.read_only {
        return Err(ErrorKind::Forbidden("this service is in read-only mode".into()));
    }
    crate::acl::enforce_firewall(&state.config.firewall_acls.delete, &ctx)?;

    if let Some(tag) = tag {
        lifecycle::delete_version(
            state.directory.as_ref(),
            state.storage.as_ref(),
            &path,
            Some(tag.as_str()),
            &ctx,
        )
        .await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let cleanup = state.directory.delete_name(&path, &ctx).await?;

    for (object_path, version_tag) in cleanup.versions_to_purge {
        if let Err(e) = state.storage.delete(&object_path, &version_tag, None).await {
            tracing::warn!(path = %object_path, tag = %version_tag, error = %e, "failed to purge backend bytes for deleted name's version");
        }
    }
    for (object_path, job_token) in cleanup.uploads_to_cancel {
        if let Err(e) = state.storage.cancel_upload(&object_path, &job_token).await {
            tracing::warn!(path = %object_path, job = %job_token, error = %e, "failed to cancel backend upload for deleted name");
        }
    }
    for namespace_path in cleanup.namespaces_to_purge {
        if let Err(e) = state.storage.delete_namespace(&namespace_path).await {
            tracing::warn!(path = %namespace_path, error = %e, "failed to purge backend namespace entity");
        }
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /p/<name>;versions` (§6): list an object's versions, newest
/// serial id first.
pub async fn list_versions(state: Arc<AppState>, ctx: ClientContext, path: String) -> Result<Response, ErrorKind> {
    let versions = state.directory.enumerate_versions(&path, &ctx).await?;
    let tags: Vec<String> = versions.into_iter().filter_map(|v| v.version_tag).collect();
    Ok((StatusCode::OK, axum::Json(json!({ "path": path, "versions": tags }))).into_response())
}

// -- axum wiring ---------------------------------------------------------

pub async fn handle_name(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ClientContext>,
    method: Method,
    axum::extract::Path(tail): axum::extract::Path<String>,
    Query(query): Query<PutNameQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ErrorKind> {
    use crate::handlers::{parse_resource, ParsedResource};

    match parse_resource(&tail)? {
        ParsedResource::Name { path } => match method {
            Method::GET | Method::HEAD => get_or_head(state, ctx, method, path, None, headers).await,
            Method::PUT => put_name(state, ctx, path, query, headers, body).await,
            Method::DELETE => delete_name(state, ctx, path, None).await,
            _ => Err(ErrorKind::BadRequest("unsupported method".into())),
        },
        ParsedResource::Version { path, tag } => match method {
            Method::GET | Method::HEAD => get_or_head(state, ctx, method, path, Some(tag), headers).await,
            Method::DELETE => delete_name(state, ctx, path, Some(tag)).await,
            _ => Err(ErrorKind::BadRequest("a version is immutable".into())),
        },
        ParsedResource::Versions { path } => match method {
            Method::GET => list_versions(state, ctx, path).await,
            _ => Err(ErrorKind::BadRequest("unsupported method".into())),
        },
        other => Err(ErrorKind::BadRequest(format!("'{other:?}' is not handled by this route"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_variants() {
        assert_eq!(parse_range_header("bytes=0-4"), Some(ByteRange::StartEnd(0, 4)));
        assert_eq!(parse_range_header("bytes=5-"), Some(ByteRange::StartOpen(5)));
        assert_eq!(parse_range_header("bytes=-3"), Some(ByteRange::Suffix(3)));
        assert_eq!(parse_range_header("nonsense"), None);
        assert_eq!(parse_range_header("bytes=0-1,2-3"), None);
    }

    #[test]
    fn resolve_range_clamps_to_total() {
        assert_eq!(resolve_range(ByteRange::StartEnd(0, 100), 10), Some((0, 9)));
        assert_eq!(resolve_range(ByteRange::Suffix(100), 10), Some((0, 9)));
        assert_eq!(resolve_range(ByteRange::StartOpen(20), 10), None);
    }

    #[test]
    fn precondition_if_match_wildcard_always_passes() {
        let mut headers = HeaderMap::new();
        headers.insert("if-match", "*".parse().unwrap());
        assert!(evaluate_preconditions(&headers, "\"abc\"", true).is_ok());
    }

    #[test]
    fn precondition_if_none_match_on_read_yields_not_modified() {
        let mut headers = HeaderMap::new();
        headers.insert("if-none-match", "\"abc\"".parse().unwrap());
        assert!(matches!(
            evaluate_preconditions(&headers, "\"abc\"", true),
            Err(ErrorKind::NotModified)
        ));
    }
}
