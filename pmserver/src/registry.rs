use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use base64::Engine as _;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use log::{debug, error};
use oci_spec::image::Digest;
use regex::Regex;
use serde::Serialize;
use tokio_util::io::ReaderStream;

use pmoci::distribution::{self, DistributionPath, ManifestRef};
use pmoci::is_manifest_media_type;
use pmoci::ocidist::{
    Client, DOCKER_CONTENT_DIGEST_HEADER, MIRRORED_HEADER, MIRRORED_HEADER_VALUE, OCTET_STREAM,
};
use pmoci::store::ContentStore;
use pmrouter::router::Router;

use crate::filtered;
use crate::metrics;
use crate::mirror::{self, BufferPool, COPY_BUFFER_SIZE, MirrorConfig};
use crate::range;

pub struct Config {
    pub basic_auth: Option<(String, String)>,
    pub filters: Vec<Regex>,
    pub resolve_retries: usize,
    pub resolve_timeout: Duration,
    pub scheme: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            basic_auth: None,
            filters: Vec::new(),
            resolve_retries: 3,
            resolve_timeout: Duration::from_millis(20),
            scheme: "http".to_string(),
        }
    }
}

pub struct Ctx {
    pub store: Arc<dyn ContentStore>,
    pub router: Arc<Router>,
    pub client: Client,
    pub buffers: Arc<BufferPool>,
    pub config: Config,
}

pub fn app(ctx: Arc<Ctx>) -> axum::Router {
    axum::Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .route("/v2", get(v2_ping))
        .route("/v2/", get(v2_ping))
        .route("/v2/{*rest}", get(serve_distribution))
        .with_state(ctx)
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(ctx): State<Arc<Ctx>>) -> StatusCode {
    if ctx.router.ready() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn metrics_text() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(metrics::render()))
        .unwrap()
}

async fn v2_ping(State(ctx): State<Arc<Ctx>>, headers: HeaderMap) -> Response {
    if let Some(response) = check_auth(&ctx, &headers) {
        return response;
    }
    empty_response(StatusCode::OK)
}

async fn serve_distribution(
    State(ctx): State<Arc<Ctx>>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(response) = check_auth(&ctx, &headers) {
        return response;
    }

    let ns = params.get("ns").map(|s| s.as_str());
    let path = match DistributionPath::parse(uri.path(), ns) {
        Ok(path) => path,
        Err(distribution::Error::NotRecognized) => return empty_response(StatusCode::NOT_FOUND),
        Err(e) => {
            debug!("bad distribution path {}: {e}", uri.path());
            return empty_response(StatusCode::BAD_REQUEST);
        }
    };

    // filtered content does not exist here, full stop. empty body on purpose
    if filtered(&ctx.config.filters, &path.identifier()) {
        debug!("filtered {}", path.identifier());
        return empty_response(StatusCode::NOT_FOUND);
    }

    let mirrored = headers
        .get(MIRRORED_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(MIRRORED_HEADER_VALUE));

    let local = match local_digest(&ctx, &path).await {
        Ok(local) => local,
        Err(e) => {
            error!("store probe failed {e:?}");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match (local, &path) {
        (Some(digest), DistributionPath::Manifest { .. }) => {
            serve_local_manifest(&ctx, &method, &digest).await
        }
        (Some(digest), DistributionPath::Blob { .. }) => {
            serve_local_blob(&ctx, &method, &digest, &headers).await
        }
        // a request that is already a mirror hop never fans out again
        (None, _) if mirrored => {
            let code = if path.is_blob() {
                "BLOB_UNKNOWN"
            } else {
                "MANIFEST_UNKNOWN"
            };
            distribution_error(StatusCode::NOT_FOUND, code, "not present locally", Some(0))
        }
        (None, _) => {
            let client_range = if method == Method::GET && path.is_blob() {
                headers
                    .get(header::RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(range::parse_explicit)
            } else {
                None
            };
            let config = MirrorConfig {
                resolve_retries: ctx.config.resolve_retries,
                resolve_timeout: ctx.config.resolve_timeout,
                scheme: ctx.config.scheme.clone(),
                basic_auth: ctx.config.basic_auth.clone(),
            };
            let accept = headers
                .get(header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            mirror::handle(
                &ctx.router,
                &ctx.client,
                &ctx.buffers,
                &config,
                &method,
                &path,
                client_range,
                accept,
            )
            .await
        }
    }
}

// presence means: a digest the store has a descriptor for, or a tag that resolves
async fn local_digest(
    ctx: &Ctx,
    path: &DistributionPath,
) -> Result<Option<Digest>, pmoci::store::Error> {
    match path {
        DistributionPath::Manifest {
            registry,
            name,
            reference: ManifestRef::Tag(tag),
        } => ctx.store.resolve_tag(&format!("{registry}/{name}:{tag}")).await,
        DistributionPath::Manifest {
            reference: ManifestRef::Digest(digest),
            ..
        } => Ok(ctx.store.descriptor(digest).await?.map(|_| digest.clone())),
        DistributionPath::Blob { digest, .. } => {
            Ok(ctx.store.descriptor(digest).await?.map(|_| digest.clone()))
        }
    }
}

async fn serve_local_manifest(ctx: &Ctx, method: &Method, digest: &Digest) -> Response {
    let descriptor = match ctx.store.descriptor(digest).await {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            return distribution_error(
                StatusCode::NOT_FOUND,
                "MANIFEST_UNKNOWN",
                "manifest unknown",
                None,
            );
        }
        Err(e) => {
            error!("descriptor read failed {e:?}");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    // blobs do not come out of the manifest endpoint
    if !is_manifest_media_type(descriptor.media_type()) {
        return distribution_error(
            StatusCode::NOT_FOUND,
            "MANIFEST_UNKNOWN",
            "manifest unknown",
            None,
        );
    }

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, descriptor.media_type().to_string())
        .header(header::CONTENT_LENGTH, descriptor.size())
        .header(DOCKER_CONTENT_DIGEST_HEADER, digest.to_string());
    if *method == Method::HEAD {
        return builder.body(Body::empty()).unwrap();
    }
    match ctx.store.read_bytes(digest).await {
        Ok(Some(bytes)) => builder.body(Body::from(bytes)).unwrap(),
        Ok(None) => distribution_error(
            StatusCode::NOT_FOUND,
            "MANIFEST_UNKNOWN",
            "manifest unknown",
            None,
        ),
        Err(e) => {
            error!("manifest read failed {e:?}");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn serve_local_blob(
    ctx: &Ctx,
    method: &Method,
    digest: &Digest,
    headers: &HeaderMap,
) -> Response {
    let descriptor = match ctx.store.descriptor(digest).await {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            return distribution_error(
                StatusCode::NOT_FOUND,
                "BLOB_UNKNOWN",
                "blob unknown",
                None,
            );
        }
        Err(e) => {
            error!("descriptor read failed {e:?}");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    // and manifests do not come out of the blob endpoint
    if is_manifest_media_type(descriptor.media_type()) {
        return distribution_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown", None);
    }

    let size = descriptor.size();
    let parsed_range = match headers.get(header::RANGE).map(|v| v.to_str()) {
        None => None,
        Some(Ok(value)) => match range::parse(value, size) {
            Ok(range) => Some(range),
            Err(e) => {
                debug!("bad range {value:?}: {e}");
                return empty_response(StatusCode::BAD_REQUEST);
            }
        },
        Some(Err(_)) => return empty_response(StatusCode::BAD_REQUEST),
    };

    let (builder, read_range) = match parsed_range {
        None => (
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, OCTET_STREAM)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, size)
                .header(DOCKER_CONTENT_DIGEST_HEADER, digest.to_string()),
            None,
        ),
        Some(range) => (
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, OCTET_STREAM)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_RANGE, range.content_range(size))
                .header(header::CONTENT_LENGTH, range.size())
                .header(DOCKER_CONTENT_DIGEST_HEADER, digest.to_string()),
            Some((range.start, range.end)),
        ),
    };

    if *method == Method::HEAD {
        return builder.body(Body::empty()).unwrap();
    }
    match ctx.store.read(digest, read_range).await {
        Ok(Some(reader)) => builder
            .body(Body::from_stream(ReaderStream::with_capacity(
                reader,
                COPY_BUFFER_SIZE,
            )))
            .unwrap(),
        Ok(None) => distribution_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown", None),
        Err(e) => {
            error!("blob read failed {e:?}");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn check_auth(ctx: &Ctx, headers: &HeaderMap) -> Option<Response> {
    let Some((user, pass)) = &ctx.config.basic_auth else {
        return None;
    };
    let ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|creds| {
            creds
                .split_once(':')
                .map(|(u, p)| u == user.as_str() && p == pass.as_str())
        })
        .unwrap_or(false);
    if ok {
        return None;
    }
    let mut response = distribution_error(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        "authentication required",
        None,
    );
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"registry\""),
    );
    Some(response)
}

#[derive(Serialize)]
struct ErrorDetail {
    attempts: usize,
}

#[derive(Serialize)]
struct ErrorEntry {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<ErrorDetail>,
}

#[derive(Serialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

pub fn distribution_error(
    status: StatusCode,
    code: &str,
    message: &str,
    attempts: Option<usize>,
) -> Response {
    let body = serde_json::to_vec(&ErrorBody {
        errors: vec![ErrorEntry {
            code: code.to_string(),
            message: message.to_string(),
            detail: attempts.map(|attempts| ErrorDetail { attempts }),
        }],
    })
    .unwrap();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

pub fn empty_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap()
}
