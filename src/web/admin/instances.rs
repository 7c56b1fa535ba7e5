use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::{
    auth_header, json_created, page_max, parse_pagination, with_state, ListResponse, PageQuery,
};
use crate::cache;
use crate::state::AppState;
use crate::store::{Instance, RefTable};

#[derive(Debug, Deserialize)]
struct InstanceInput {
    name: Option<String>,
    pre_config: Option<String>,
    is_manual_mode: Option<bool>,
    additional_file_ids: Option<Vec<i64>>,
    site_ids: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
struct InstanceInfo {
    id: i64,
    name: String,
    pre_config: String,
    is_manual_mode: bool,
    additional_file_ids: Vec<i64>,
    site_ids: Vec<i64>,
    /// Unix seconds of the most recent heartbeat; absent for manual-mode
    /// instances and for nodes that have never polled.
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen: Option<i64>,
}

#[derive(Debug, Serialize)]
struct InstanceInfoWithToken {
    #[serde(flatten)]
    info: InstanceInfo,
    token: String,
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "admin" / "instances")
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(list_instances);

    let create = warp::path!("api" / "admin" / "instance")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(create_instance);

    let get = warp::path!("api" / "admin" / "instance" / i64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(get_instance);

    let update = warp::path!("api" / "admin" / "instance" / i64)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(update_instance);

    let rotate = warp::path!("api" / "admin" / "instance" / i64 / "rotate")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(rotate_instance_token);

    let delete = warp::path!("api" / "admin" / "instance" / i64)
        .and(warp::delete())
        .and(with_state(state))
        .and(auth_header())
        .and_then(delete_instance);

    list.or(create).or(get).or(update).or(rotate).or(delete)
}

/// Join the lastseen slice into an instance view; manual-mode instances
/// report nothing.
fn instance_info(state: &AppState, instance: &Instance) -> InstanceInfo {
    let last_seen = if instance.is_manual_mode {
        None
    } else {
        state
            .cache
            .get(&cache::instance_lastseen_key(instance.id))
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.parse::<i64>().ok())
    };

    InstanceInfo {
        id: instance.id,
        name: instance.name.clone(),
        pre_config: instance.pre_config.clone(),
        is_manual_mode: instance.is_manual_mode,
        additional_file_ids: instance.additional_file_ids.clone(),
        site_ids: instance.site_ids.clone(),
        last_seen,
    }
}

async fn validate_instance(state: &AppState, instance: &Instance) -> crate::error::Result<()> {
    state
        .store
        .validate_ids(RefTable::AdditionalFiles, &instance.additional_file_ids)
        .await?;
    state
        .store
        .validate_ids(RefTable::Sites, &instance.site_ids)
        .await?;
    Ok(())
}

async fn list_instances(
    query: PageQuery,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let (page, limit) = parse_pagination(&query);
    let (instances, total) = state
        .store
        .list_instances(page, limit)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&ListResponse {
        limit,
        page_max: page_max(total, limit),
        list: instances
            .iter()
            .map(|instance| instance_info(&state, instance))
            .collect(),
    }))
}

async fn create_instance(
    req: InstanceInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let instance = Instance {
        id: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        name: req.name.unwrap_or_default(),
        token: Uuid::new_v4(),
        pre_config: req.pre_config.unwrap_or_default(),
        is_manual_mode: req.is_manual_mode.unwrap_or(false),
        additional_file_ids: req.additional_file_ids.unwrap_or_default(),
        site_ids: req.site_ids.unwrap_or_default(),
    };

    validate_instance(&state, &instance)
        .await
        .map_err(warp::reject::custom)?;

    let instance = state
        .store
        .create_instance(&instance)
        .await
        .map_err(warp::reject::custom)?;

    // the token is shown once, at creation and rotation
    Ok(json_created(&InstanceInfoWithToken {
        info: instance_info(&state, &instance),
        token: instance.token.to_string(),
    }))
}

async fn get_instance(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let instance = state
        .store
        .get_instance(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&instance_info(&state, &instance)))
}

async fn update_instance(
    id: i64,
    req: InstanceInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let mut instance = state
        .store
        .get_instance(id)
        .await
        .map_err(warp::reject::custom)?;

    if let Some(name) = req.name {
        instance.name = name;
    }
    if let Some(pre_config) = req.pre_config {
        instance.pre_config = pre_config;
    }
    if let Some(is_manual_mode) = req.is_manual_mode {
        instance.is_manual_mode = is_manual_mode;
    }
    if let Some(additional_file_ids) = req.additional_file_ids {
        instance.additional_file_ids = additional_file_ids;
    }
    if let Some(site_ids) = req.site_ids {
        instance.site_ids = site_ids;
    }

    validate_instance(&state, &instance)
        .await
        .map_err(warp::reject::custom)?;

    let instance = state
        .store
        .update_instance(&instance)
        .await
        .map_err(warp::reject::custom)?;

    state.invalidator().instance_updated(id);

    Ok(json_created(&instance_info(&state, &instance)))
}

async fn rotate_instance_token(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let token = state
        .store
        .rotate_instance_token(id)
        .await
        .map_err(warp::reject::custom)?;

    let invalidator = state.invalidator();
    invalidator.instance_token_rotated(id);
    // the rotation bumped the instance stamp too
    invalidator.instance_updated(id);

    let instance = state
        .store
        .get_instance(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&InstanceInfoWithToken {
        info: instance_info(&state, &instance),
        token: token.to_string(),
    }))
}

async fn delete_instance(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    state
        .store
        .delete_instance(id)
        .await
        .map_err(warp::reject::custom)?;

    state.invalidator().instance_deleted(id);

    Ok(warp::reply::with_status(
        warp::reply(),
        warp::http::StatusCode::NO_CONTENT,
    ))
}
