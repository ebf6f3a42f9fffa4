//! ACL-surface handlers: `;acl[/<access>[/<role>]]` (§6, C2).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use serde_json::json;

use crate::acl::{recognized_direct_accesses, ResourceKind};
use crate::context::ClientContext;
use crate::directory::ResourceRef;
use crate::errors::ErrorKind;
use crate::handlers::not_found;
use crate::model::{Access, RoleSet, Subtype};
use crate::AppState;

fn resource_kind_and_ref<'a>(
    path: &'a str,
    tag: &'a Option<String>,
    subtype: Subtype,
) -> (ResourceKind, ResourceRef<'a>) {
    match tag {
        Some(tag) => (ResourceKind::Version, ResourceRef::Version(path, tag)),
        None => match subtype {
            Subtype::Namespace => (ResourceKind::Namespace, ResourceRef::Namespace(path)),
            Subtype::Object => (ResourceKind::Object, ResourceRef::Object(path)),
        },
    }
}

fn parse_access(kind: ResourceKind, access: &str) -> Result<Access, ErrorKind> {
    let parsed = Access::parse(access)
        .ok_or_else(|| ErrorKind::BadRequest(format!("unrecognized ACL access name '{access}'")))?;
    if !recognized_direct_accesses(kind).contains(&parsed) {
        return Err(ErrorKind::BadRequest(format!(
            "access '{access}' is not valid on a {kind:?}"
        )));
    }
    Ok(parsed)
}

/// `GET /p/<name>[:<tag>];acl[/<access>[/<role>]]`: read the whole ACL,
/// one access's role set, or a single role's membership.
pub async fn get_acl(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    tag: Option<String>,
    access: Option<String>,
    role: Option<String>,
) -> Result<Response, ErrorKind> {
    let name = state.directory.resolve(&path).await?.ok_or_else(|| not_found(&path))?;
    let (kind, resource) = resource_kind_and_ref(&path, &tag, name.subtype);
    let full_acl = state.directory.get_acl(resource, &ctx).await?;

    match (access, role) {
        (None, None) => {
            let as_json: serde_json::Map<String, serde_json::Value> = full_acl
                .iter()
                .map(|(access, roles)| {
                    let mut roles: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
                    roles.sort_unstable();
                    (access.as_str().to_string(), json!(roles))
                })
                .collect();
            Ok((StatusCode::OK, axum::Json(serde_json::Value::Object(as_json))).into_response())
        }
        (Some(access), None) => {
            let parsed = parse_access(kind, &access)?;
            let mut roles: Vec<&str> = full_acl.get(&parsed).map(|s| s.iter().map(|r| r.as_str()).collect()).unwrap_or_default();
            roles.sort_unstable();
            Ok((StatusCode::OK, axum::Json(json!(roles))).into_response())
        }
        (Some(access), Some(role)) => {
            let parsed = parse_access(kind, &access)?;
            let present = full_acl.get(&parsed).is_some_and(|s| s.contains(&role));
            if present {
                Ok((StatusCode::OK, role).into_response())
            } else {
                Err(ErrorKind::NotFound(format!("role '{role}' not present in access '{access}'")))
            }
        }
        (None, Some(_)) => Err(ErrorKind::BadRequest("a role requires an access name".into())),
    }
}

/// `PUT /p/<name>[:<tag>];acl[/<access>[/<role>]]`: replace the whole
/// ACL (JSON body), replace one access's role set (JSON array body), or
/// add a single role.
pub async fn put_acl(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    tag: Option<String>,
    access: Option<String>,
    role: Option<String>,
    body: Body,
) -> Result<Response, ErrorKind> {
    crate::acl::enforce_firewall(&state.config.firewall_acls.manage_acl, &ctx)?;
    let name = state.directory.resolve(&path).await?.ok_or_else(|| not_found(&path))?;
    let (kind, resource) = resource_kind_and_ref(&path, &tag, name.subtype);

    match (access, role) {
        (None, None) => {
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| ErrorKind::BadRequest(format!("failed to read request body: {e}")))?;
            let whole: std::collections::BTreeMap<String, Vec<String>> = serde_json::from_slice(&bytes)
                .map_err(|e| ErrorKind::BadRequest(format!("invalid JSON body: {e}")))?;
            for (access_name, roles) in whole {
                let parsed = parse_access(kind, &access_name)?;
                let roles: RoleSet = roles.into_iter().collect();
                state.directory.set_acl(resource, parsed, roles, &ctx).await?;
            }
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (Some(access), None) => {
            let parsed = parse_access(kind, &access)?;
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| ErrorKind::BadRequest(format!("failed to read request body: {e}")))?;
            let roles: Vec<String> = serde_json::from_slice(&bytes)
                .map_err(|e| ErrorKind::BadRequest(format!("invalid JSON body: {e}")))?;
            state.directory.set_acl(resource, parsed, roles.into_iter().collect(), &ctx).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (Some(access), Some(role)) => {
            let parsed = parse_access(kind, &access)?;
            state.directory.set_acl_role(resource, parsed, &role, &ctx).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (None, Some(_)) => Err(ErrorKind::BadRequest("a role requires an access name".into())),
    }
}

/// `DELETE /p/<name>[:<tag>];acl/<access>/<role>`: remove a single role.
/// `DELETE .../acl/<access>` clears the whole role set for that access.
pub async fn delete_acl(
    state: Arc<AppState>,
    ctx: ClientContext,
    path: String,
    tag: Option<String>,
    access: Option<String>,
    role: Option<String>,
) -> Result<Response, ErrorKind> {
    crate::acl::enforce_firewall(&state.config.firewall_acls.manage_acl, &ctx)?;
    let name = state.directory.resolve(&path).await?.ok_or_else(|| not_found(&path))?;
    let (kind, resource) = resource_kind_and_ref(&path, &tag, name.subtype);

    let access = access.ok_or_else(|| ErrorKind::BadRequest("an access name is required to delete an ACL entry".into()))?;
    let parsed = parse_access(kind, &access)?;

    match role {
        Some(role) => state.directory.drop_acl_role(resource, parsed, &role, &ctx).await?,
        None => state.directory.set_acl(resource, parsed, RoleSet::new(), &ctx).await?,
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- axum wiring ---------------------------------------------------------

pub async fn handle_acl(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ClientContext>,
    method: Method,
    axum::extract::Path(tail): axum::extract::Path<String>,
    body: Body,
) -> Result<Response, ErrorKind> {
    use crate::handlers::{parse_resource, ParsedResource};

    let ParsedResource::Acl { path, tag, access, role } = parse_resource(&tail)? else {
        return Err(ErrorKind::BadRequest("not an ACL resource".into()));
    };

    match method {
        Method::GET => get_acl(state, ctx, path, tag, access, role).await,
        Method::PUT => put_acl(state, ctx, path, tag, access, role, body).await,
        Method::DELETE => delete_acl(state, ctx, path, tag, access, role).await,
        _ => Err(ErrorKind::BadRequest("unsupported method".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_access_rejects_access_not_valid_for_kind() {
        let err = parse_access(ResourceKind::Version, "create").unwrap_err();
        assert!(matches!(err, ErrorKind::BadRequest(_)));
    }

    #[test]
    fn parse_access_accepts_valid_combination() {
        assert_eq!(parse_access(ResourceKind::Namespace, "subtree-read").unwrap(), Access::SubtreeRead);
    }

    #[test]
    fn parse_access_rejects_unknown_name() {
        assert!(parse_access(ResourceKind::Object, "bogus").is_err());
    }
}
