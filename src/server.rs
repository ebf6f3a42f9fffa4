//! Axum router construction and HTTP-to-core dispatch (§6 "External
//! interfaces").
//!
//! Every resource lives under the literal `/p` prefix (`/p/<name>`,
//! `/p/<name>:<tag>`, `/p/<name>;acl`, ...); [`crate::handlers::parse_resource`]
//! decomposes the wildcard tail into the resource grammar once per
//! request, and this module dispatches the parsed shape to the matching
//! handler function. Authentication runs as middleware ahead of the
//! dispatcher so every handler can assume `Extension<ClientContext>` is
//! already populated (§1 "the core consumes a `ClientContext`").

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthResult, AuthType};
use crate::context::ClientContext;
use crate::errors::ErrorKind;
use crate::handlers::name::PutNameQuery;
use crate::handlers::{acl as acl_handlers, metadata as metadata_handlers, name as name_handlers, upload as upload_handlers};
use crate::handlers::{parse_resource, ParsedResource};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] serving the Hatrac HTTP surface.
///
/// The returned router is ready to be passed to `axum::serve`.
/// `/metrics`, `/healthz`, `/readyz` are registered as literal routes
/// ahead of the `/p` wildcard, so they always win axum's route matching
/// regardless of what object paths a caller has created.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/health", any(health_check));

    if state.config.observability.health_check {
        router = router
            .route("/healthz", any(healthz_handler))
            .route("/readyz", any(readyz_handler));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", any(metrics_handler));
    }

    router
        .route("/p", any(dispatch_root))
        .route("/p/*tail", any(dispatch_tail))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // Hatrac objects can legitimately exceed axum's default 2 MiB cap;
        // §6 `max_request_payload_size` is enforced explicitly in `put_name`.
        .layer(DefaultBodyLimit::disable())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, axum::Json(json!({ "status": "ok" })))
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.directory.resolve("/").await {
        Ok(Some(_)) => (StatusCode::OK, axum::Json(json!({ "status": "ok" }))).into_response(),
        Ok(None) => {
            (StatusCode::SERVICE_UNAVAILABLE, axum::Json(json!({ "status": "root namespace missing" }))).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({ "status": "directory unreachable", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn readyz_handler(state: State<Arc<AppState>>) -> impl IntoResponse {
    healthz_handler(state).await
}

// -- Authentication middleware -------------------------------------------

/// Verify the request (AWS SigV4 header or presigned query, or
/// anonymous) and attach the resulting [`ClientContext`] as a request
/// extension. Credential lookup goes through the directory's
/// `get_credential`, keeping this the only place the HTTP edge's auth
/// machinery touches the core.
async fn auth_middleware(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Result<Response, ErrorKind> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query_string = req.uri().query().unwrap_or("").to_string();
    let headers = req.headers().clone();

    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let auth_type = auth::detect_auth_type(authorization, &query_string).map_err(ErrorKind::BadRequest)?;

    let access_key_id = match &auth_type {
        AuthType::Header(parsed) => Some(parsed.access_key_id.clone()),
        AuthType::Presigned(parsed) => Some(parsed.access_key_id.clone()),
        AuthType::None => None,
    };

    let record = match &access_key_id {
        Some(id) => state.directory.get_credential(id).await?,
        None => None,
    };

    let payload_hash = headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("UNSIGNED-PAYLOAD")
        .to_string();

    let ctx = match auth::authenticate_request(&method, &path, &query_string, &headers, &payload_hash, |_| record.clone()) {
        AuthResult::Ok(ctx) => ctx,
        AuthResult::InvalidAccessKeyId | AuthResult::SignatureDoesNotMatch => return Err(ErrorKind::Unauthenticated),
        AuthResult::Expired => return Err(ErrorKind::Unauthenticated),
        AuthResult::MalformedAuth(msg) => return Err(ErrorKind::BadRequest(msg)),
    };

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

// -- Resource dispatch -----------------------------------------------------

async fn dispatch_root(
    state: State<Arc<AppState>>,
    ctx: Extension<ClientContext>,
    method: Method,
    query: Query<PutNameQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ErrorKind> {
    dispatch(state, ctx, method, String::new(), query, headers, body).await
}

async fn dispatch_tail(
    state: State<Arc<AppState>>,
    ctx: Extension<ClientContext>,
    method: Method,
    Path(tail): Path<String>,
    query: Query<PutNameQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ErrorKind> {
    dispatch(state, ctx, method, tail, query, headers, body).await
}

/// Shared dispatcher: parse the resource grammar once, then route to
/// the handler module that owns that resource kind (§6 HTTP surface
/// table).
async fn dispatch(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<ClientContext>,
    method: Method,
    tail: String,
    Query(query): Query<PutNameQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ErrorKind> {
    match parse_resource(&tail)? {
        ParsedResource::Name { path } => match method {
            Method::GET | Method::HEAD => name_handlers::get_or_head(state, ctx, method, path, None, headers).await,
            Method::PUT => name_handlers::put_name(state, ctx, path, query, headers, body).await,
            Method::DELETE => name_handlers::delete_name(state, ctx, path, None).await,
            _ => Err(ErrorKind::BadRequest("unsupported method for a name resource".into())),
        },
        ParsedResource::Version { path, tag } => match method {
            Method::GET | Method::HEAD => name_handlers::get_or_head(state, ctx, method, path, Some(tag), headers).await,
            Method::DELETE => name_handlers::delete_name(state, ctx, path, Some(tag)).await,
            _ => Err(ErrorKind::BadRequest("a version is immutable".into())),
        },
        ParsedResource::Versions { path } => match method {
            Method::GET => name_handlers::list_versions(state, ctx, path).await,
            _ => Err(ErrorKind::BadRequest("unsupported method for a ;versions resource".into())),
        },
        ParsedResource::Acl { path, tag, access, role } => match method {
            Method::GET => acl_handlers::get_acl(state, ctx, path, tag, access, role).await,
            Method::PUT => acl_handlers::put_acl(state, ctx, path, tag, access, role, body).await,
            Method::DELETE => acl_handlers::delete_acl(state, ctx, path, tag, access, role).await,
            _ => Err(ErrorKind::BadRequest("unsupported method for an ;acl resource".into())),
        },
        ParsedResource::Metadata { path, tag, field } => match method {
            Method::GET => metadata_handlers::get_metadata(state, ctx, path, tag, field).await,
            Method::PUT => metadata_handlers::put_metadata(state, ctx, path, tag, field, body).await,
            Method::DELETE => metadata_handlers::delete_metadata(state, ctx, path, tag, field).await,
            _ => Err(ErrorKind::BadRequest("unsupported method for a ;metadata resource".into())),
        },
        ParsedResource::Upload { path, job, position } => match (method, job, position) {
            (Method::POST, None, None) => upload_handlers::create_job(state, ctx, path, body).await,
            (Method::PUT, Some(job), Some(position)) => {
                upload_handlers::upload_chunk(state, ctx, path, job, position, headers, body).await
            }
            (Method::POST, Some(job), None) => upload_handlers::finalize_job(state, ctx, path, job).await,
            (Method::DELETE, Some(job), None) => upload_handlers::cancel_job(state, ctx, path, job).await,
            _ => Err(ErrorKind::BadRequest("unsupported ;upload request shape".into())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::directory::memory::MemoryDirectory;
    use crate::storage::memory::MemoryBackend;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            config: serde_yaml::from_str::<Config>("{}").unwrap(),
            directory: Arc::new(MemoryDirectory::new(&["*"])),
            storage: Arc::new(MemoryBackend::new()),
        })
    }

    #[tokio::test]
    async fn health_endpoint_is_reachable_without_auth() {
        let app = app(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn anonymous_put_then_get_round_trips_bytes() {
        let app = app(test_state());

        let put = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/p/a/obj")
                    .header("content-length", "12")
                    .header("content-type", "text/plain")
                    .body(Body::from("test data 1\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::CREATED);
        let location = put.headers().get("location").unwrap().to_str().unwrap().to_string();
        assert!(location.starts_with("/a/obj:"));

        let get = app
            .oneshot(Request::builder().uri("/p/a/obj").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(get.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"test data 1\n");
    }

    #[tokio::test]
    async fn put_without_content_length_is_length_required() {
        let app = app(test_state());
        let resp = app
            .oneshot(Request::builder().method("PUT").uri("/p/a/obj").body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let app = app(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/p/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
