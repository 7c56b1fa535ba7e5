//! Worker-facing endpoints, the surface the edge agents poll.
//!
//! All three require the instance's bearer token. Auth consults the info
//! cache slice first and falls back to the store, refilling the slice on
//! success. Responses are cached per instance and rebuilt on miss.

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;
use warp::http::header::CONTENT_TYPE;
use warp::http::Response;
use warp::{Filter, Rejection, Reply};

use crate::cache;
use crate::error::{Error, Result, StoreError};
use crate::manifest::{
    build_heartbeat_manifest, build_instance_file_map, CertFileKind, InstanceFileDescriptor,
    InstanceFileKind,
};
use crate::render::render_instance_config;
use crate::state::AppState;
use crate::store::Instance;

pub const MIME_CADDYFILE: &str = "text/caddyfile";

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let heartbeat = warp::path!("api" / "worker" / i64 / "heartbeat")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(warp::header::optional::<String>("authorization"))
        .and_then(heartbeat);

    let config = warp::path!("api" / "worker" / i64 / "config")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(warp::header::optional::<String>("authorization"))
        .and_then(get_config);

    let file = warp::path!("api" / "worker" / i64 / "file")
        .and(warp::get())
        .and(with_state(state))
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::header::optional::<String>("x-file-path"))
        .and_then(get_file);

    heartbeat.or(config).or(file)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Resolve the caller to its instance by (id, bearer token).
///
/// Info-cache hit with a token mismatch is a not-found, the same answer a
/// rotated-away token gets from the store; a corrupt cache entry is
/// dropped and treated as a miss.
async fn authenticate_instance(
    state: &AppState,
    id: i64,
    auth_header: Option<String>,
) -> Result<Instance> {
    let header = auth_header.ok_or_else(|| Error::Unauthorized("missing auth token".into()))?;
    let token = crate::auth::bearer_token(&header)?;
    let token = Uuid::parse_str(token)
        .map_err(|_| Error::Unauthorized(format!("invalid uuid token: {token}")))?;

    let info_key = cache::instance_info_key(id);
    if let Some(bytes) = state.cache.get(&info_key) {
        match serde_json::from_slice::<Instance>(&bytes) {
            Ok(instance) => {
                if instance.token == token {
                    return Ok(instance);
                }
                return Err(Error::NotFound("no such instance".into()));
            }
            Err(e) => {
                error!(id, error = %e, "corrupt instance info cache entry, dropping");
                state.cache.del(&info_key);
            }
        }
    }

    let instance = state
        .store
        .get_instance_by_id_and_token(id, token)
        .await
        .map_err(|e| match e {
            Error::Store(StoreError::RecordNotFound) => Error::NotFound("no such instance".into()),
            other => other,
        })?;

    match serde_json::to_vec(&instance) {
        Ok(bytes) => state
            .cache
            .set(&info_key, bytes, Some(cache::TTL_INSTANCE_INFO)),
        Err(e) => error!(id, error = %e, "failed to marshal instance info"),
    }

    Ok(instance)
}

/// `GET /api/worker/{id}/heartbeat`
async fn heartbeat(
    id: i64,
    state: Arc<AppState>,
    auth_header: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    let instance = authenticate_instance(&state, id, auth_header)
        .await
        .map_err(warp::reject::custom)?;

    // record the poll before anything can fail
    state.cache.set(
        &cache::instance_lastseen_key(instance.id),
        Utc::now().timestamp().to_string().into_bytes(),
        Some(cache::TTL_INSTANCE_LASTSEEN),
    );

    let heartbeat_key = cache::instance_heartbeat_key(instance.id);
    let body = match state.cache.get(&heartbeat_key) {
        Some(bytes) => bytes,
        None => {
            let manifest = build_heartbeat_manifest(&state.store, &instance)
                .await
                .map_err(|e| {
                    error!(id, error = %e, "heartbeat manifest build failed");
                    warp::reject::custom(e)
                })?;
            let bytes = serde_json::to_vec(&manifest)
                .map_err(|e| warp::reject::custom(Error::from(e)))?;
            state
                .cache
                .set(&heartbeat_key, bytes.clone(), Some(cache::TTL_INSTANCE_HEARTBEAT));
            bytes
        }
    };

    Ok(Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .map_err(|e| warp::reject::custom(Error::Internal(e.to_string())))?)
}

/// `GET /api/worker/{id}/config`
async fn get_config(
    id: i64,
    state: Arc<AppState>,
    auth_header: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    let instance = authenticate_instance(&state, id, auth_header)
        .await
        .map_err(warp::reject::custom)?;

    let config_key = cache::instance_config_key(instance.id);
    let body = match state.cache.get(&config_key) {
        Some(bytes) => bytes,
        None => {
            let rendered = build_instance_config(&state, &instance).await.map_err(|e| {
                error!(id, error = %e, "config render failed");
                warp::reject::custom(e)
            })?;
            let bytes = rendered.into_bytes();
            state
                .cache
                .set(&config_key, bytes.clone(), Some(cache::TTL_INSTANCE_CONFIG));
            bytes
        }
    };

    Ok(Response::builder()
        .header(CONTENT_TYPE, MIME_CADDYFILE)
        .body(body)
        .map_err(|e| warp::reject::custom(Error::Internal(e.to_string())))?)
}

async fn build_instance_config(state: &AppState, instance: &Instance) -> Result<String> {
    let mut sites = Vec::with_capacity(instance.site_ids.len());
    for &site_id in &instance.site_ids {
        sites.push(state.store.get_site_with_relations(site_id).await?);
    }

    render_instance_config(instance, &sites)
}

/// `GET /api/worker/{id}/file`, path conveyed in `X-File-Path`.
async fn get_file(
    id: i64,
    state: Arc<AppState>,
    auth_header: Option<String>,
    file_path: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    let instance = authenticate_instance(&state, id, auth_header)
        .await
        .map_err(warp::reject::custom)?;

    let file_path =
        file_path.ok_or_else(|| warp::reject::custom(Error::BadRequest("missing X-File-Path".into())))?;

    // The files slice has no TTL; rebuild it only when a mutation dropped it.
    let files_key = cache::instance_files_key(instance.id);
    if !state.cache.hash_exists(&files_key) {
        cache_instance_file_map(&state, &instance).await.map_err(|e| {
            error!(id, error = %e, "files slice rebuild failed");
            warp::reject::custom(e)
        })?;
    }

    let descriptor_bytes = state
        .cache
        .hget(&files_key, &file_path)
        .ok_or_else(|| warp::reject::custom(Error::NotFound(format!("no file at {file_path}"))))?;

    let descriptor: InstanceFileDescriptor =
        serde_json::from_slice(&descriptor_bytes).map_err(|e| {
            error!(id, %file_path, error = %e, "corrupt file descriptor");
            warp::reject::custom(Error::Internal("corrupt file descriptor".into()))
        })?;

    let body = resolve_file(&state, &descriptor).await.map_err(|e| {
        error!(id, %file_path, error = %e, "file resolution failed");
        warp::reject::custom(e)
    })?;

    Ok(Response::builder()
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(Bytes::from(body))
        .map_err(|e| warp::reject::custom(Error::Internal(e.to_string())))?)
}

async fn cache_instance_file_map(state: &AppState, instance: &Instance) -> Result<()> {
    let files = build_instance_file_map(&state.store, instance).await?;

    let mut fields = HashMap::with_capacity(files.len());
    for (path, descriptor) in files {
        fields.insert(path, serde_json::to_vec(&descriptor)?);
    }

    state
        .cache
        .hset_all(&cache::instance_files_key(instance.id), fields);
    Ok(())
}

/// Map a descriptor back to the bytes the agent should receive.
async fn resolve_file(state: &AppState, descriptor: &InstanceFileDescriptor) -> Result<Vec<u8>> {
    match descriptor.kind {
        InstanceFileKind::AdditionalFile => {
            let file = state.store.get_additional_file(descriptor.id).await?;
            Ok(file.content)
        }
        InstanceFileKind::Cert => {
            let cert = state.store.get_cert(descriptor.id).await?;
            match descriptor.subtype {
                Some(CertFileKind::Certificate) => Ok(cert.certificate.into_bytes()),
                Some(CertFileKind::PrivateKey) => {
                    // sealed at rest; failures stay a 5xx without detail
                    Ok(state.crypto.open(&cert.private_key)?)
                }
                Some(CertFileKind::Intermediate) => {
                    if cert.intermediate_certificate.is_empty() {
                        return Err(Error::NotFound("intermediate certificate is empty".into()));
                    }
                    Ok(cert.intermediate_certificate.into_bytes())
                }
                None => Err(Error::Internal("cert descriptor missing subtype".into())),
            }
        }
    }
}
