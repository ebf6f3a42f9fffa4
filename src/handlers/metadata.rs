//! Metadata-surface handlers: `;metadata[/<field>]` (§6, §4.3).
//!
//! `content-md5`/`content-sha256` are write-once: a field already set to
//! a different value is `Conflict`; re-setting the identical value is a
//! no-op success (Open Question (c)).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use serde_json::json;

use crate::context::ClientContext;
use crate::directory::ResourceRef;
use crate::errors::ErrorKind;
use crate::handlers::not_found;
use crate::model::{is_recognized_metadata_key, Subtype};
use crate::AppState;

const WRITE_ONCE_FIELDS: &[&str] = &["content-md5", "content-sha256"];

fn resource_ref<'a>(path: &'a str, tag: &'a Option<String>) -> ResourceRef<'a> {
    match tag {
        Some(tag) => ResourceRef::Version(path, tag),
        None => ResourceRef::Object(path),
    }
}

/// `GET /p/<name>[:<tag>];metadata[/<field>]`: the whole map, or a
/// single field as `text/plain`.
pub async fn get_metadata(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    tag: Option<String>,
    field: Option<String>,
) -> Result<Response, ErrorKind> {
    let metadata = match &tag {
        Some(tag) => {
            let version = state
                .directory
                .get_version(&path, tag, &ctx)
                .await?
                .ok_or_else(|| not_found(&format!("{path}:{tag}")))?;
            version.metadata
        }
        None => {
            let name = state.directory.resolve(&path).await?.ok_or_else(|| not_found(&path))?;
            if name.subtype == Subtype::Namespace {
                return Err(ErrorKind::BadRequest("a namespace has no metadata".into()));
            }
            // `resolve` performs no ACL enforcement; piggyback on
            // `current_version`'s read-access check before trusting the
            // object-level metadata `resolve` already returned.
            state.directory.current_version(&path, &ctx).await?;
            name.metadata
        }
    };

    match field {
        None => Ok((StatusCode::OK, axum::Json(json!(metadata))).into_response()),
        Some(field) => {
            if !is_recognized_metadata_key(&field) {
                return Err(ErrorKind::BadRequest(format!("'{field}' is not a recognized metadata field")));
            }
            match metadata.get(&field) {
                Some(value) => Ok((StatusCode::OK, value.clone()).into_response()),
                None => Err(ErrorKind::NotFound(format!("metadata field '{field}' is not set"))),
            }
        }
    }
}

/// `PUT /p/<name>[:<tag>];metadata/<field>`: set a single field's value.
pub async fn put_metadata(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    tag: Option<String>,
    field: Option<String>,
    body: Body,
) -> Result<Response, ErrorKind> {
    crate::acl::enforce_firewall(&state.config.firewall_acls.manage_metadata, &ctx)?;
    let field = field.ok_or_else(|| ErrorKind::BadRequest("a metadata field name is required to PUT".into()))?;
    if !is_recognized_metadata_key(&field) {
        return Err(ErrorKind::BadRequest(format!("'{field}' is not a recognized metadata field")));
    }

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ErrorKind::BadRequest(format!("failed to read request body: {e}")))?;
    let value = String::from_utf8(bytes.to_vec()).map_err(|_| ErrorKind::BadRequest("metadata value must be valid UTF-8".into()))?;

    if WRITE_ONCE_FIELDS.contains(&field.as_str()) {
        let existing = current_field_value(&state, &ctx, &path, &tag, &field).await?;
        if let Some(existing) = existing {
            if existing == value {
                return Ok(StatusCode::NO_CONTENT.into_response());
            }
            return Err(ErrorKind::Conflict(format!("'{field}' is write-once and already set")));
        }
    }

    let resource = resource_ref(&path, &tag);
    state.directory.update_metadata_field(resource, &field, Some(&value), &ctx).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn current_field_value(
    state: &AppState,
    ctx: &ClientContext,
    path: &str,
    tag: &Option<String>,
    field: &str,
) -> Result<Option<String>, ErrorKind> {
    let metadata = match tag {
        Some(tag) => {
            state
                .directory
                .get_version(path, tag, ctx)
                .await?
                .ok_or_else(|| not_found(&format!("{path}:{tag}")))?
                .metadata
        }
        None => {
            let name = state.directory.resolve(path).await?.ok_or_else(|| not_found(path))?;
            state.directory.current_version(path, ctx).await?;
            name.metadata
        }
    };
    Ok(metadata.get(field).cloned())
}

/// `DELETE /p/<name>[:<tag>];metadata/<field>`: clear a single field.
pub async fn delete_metadata(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    tag: Option<String>,
    field: Option<String>,
) -> Result<Response, ErrorKind> {
    crate::acl::enforce_firewall(&state.config.firewall_acls.manage_metadata, &ctx)?;
    let field = field.ok_or_else(|| ErrorKind::BadRequest("a metadata field name is required to DELETE".into()))?;
    if !is_recognized_metadata_key(&field) {
        return Err(ErrorKind::BadRequest(format!("'{field}' is not a recognized metadata field")));
    }
    let resource = resource_ref(&path, &tag);
    state.directory.update_metadata_field(resource, &field, None, &ctx).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- axum wiring ---------------------------------------------------------

pub async fn handle_metadata(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ClientContext>,
    method: Method,
    axum::extract::Path(tail): axum::extract::Path<String>,
    body: Body,
) -> Result<Response, ErrorKind> {
    use crate::handlers::{parse_resource, ParsedResource};

    let ParsedResource::Metadata { path, tag, field } = parse_resource(&tail)? else {
        return Err(ErrorKind::BadRequest("not a metadata resource".into()));
    };

    match method {
        Method::GET => get_metadata(state, ctx, path, tag, field).await,
        Method::PUT => put_metadata(state, ctx, path, tag, field, body).await,
        Method::DELETE => delete_metadata(state, ctx, path, tag, field).await,
        _ => Err(ErrorKind::BadRequest("unsupported method".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_once_fields_are_exactly_md5_and_sha256() {
        assert_eq!(WRITE_ONCE_FIELDS, &["content-md5", "content-sha256"]);
    }

    #[test]
    fn resource_ref_picks_version_when_tag_present() {
        let path = "/a/obj".to_string();
        match resource_ref(&path, &Some("V1".to_string())) {
            ResourceRef::Version(p, t) => {
                assert_eq!(p, "/a/obj");
                assert_eq!(t, "V1");
            }
            _ => panic!("expected Version"),
        }
    }
}
