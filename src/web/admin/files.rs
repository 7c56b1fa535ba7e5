use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use super::{
    auth_header, json_created, page_max, parse_pagination, with_state, ListResponse, PageQuery,
};
use crate::state::AppState;
use crate::store::AdditionalFile;

#[derive(Debug, Deserialize)]
struct AdditionalFileInput {
    name: Option<String>,
    filename: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct AdditionalFileInfo {
    id: i64,
    name: String,
    filename: String,
}

impl From<&AdditionalFile> for AdditionalFileInfo {
    fn from(file: &AdditionalFile) -> Self {
        Self {
            id: file.id,
            name: file.name.clone(),
            filename: file.filename.clone(),
        }
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "admin" / "additional_files")
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(list_files);

    let create = warp::path!("api" / "admin" / "additional_file")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(create_file);

    let get = warp::path!("api" / "admin" / "additional_file" / i64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(get_file);

    let update = warp::path!("api" / "admin" / "additional_file" / i64)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(update_file);

    let delete = warp::path!("api" / "admin" / "additional_file" / i64)
        .and(warp::delete())
        .and(with_state(state))
        .and(auth_header())
        .and_then(delete_file);

    list.or(create).or(get).or(update).or(delete)
}

async fn list_files(
    query: PageQuery,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let (page, limit) = parse_pagination(&query);
    let (files, total) = state
        .store
        .list_additional_files(page, limit)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&ListResponse {
        limit,
        page_max: page_max(total, limit),
        list: files.iter().map(AdditionalFileInfo::from).collect(),
    }))
}

async fn create_file(
    req: AdditionalFileInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let file = state
        .store
        .create_additional_file(&AdditionalFile {
            id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: req.name.unwrap_or_default(),
            filename: req.filename.unwrap_or_default(),
            content: req.content.unwrap_or_default().into_bytes(),
        })
        .await
        .map_err(warp::reject::custom)?;

    Ok(json_created(&AdditionalFileInfo::from(&file)))
}

async fn get_file(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let file = state
        .store
        .get_additional_file(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&AdditionalFileInfo::from(&file)))
}

async fn update_file(
    id: i64,
    req: AdditionalFileInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let mut file = state
        .store
        .get_additional_file(id)
        .await
        .map_err(warp::reject::custom)?;

    let old_filename = file.filename.clone();
    let mut content_changed = false;

    if let Some(name) = req.name {
        file.name = name;
    }
    if let Some(filename) = req.filename {
        file.filename = filename;
    }
    if let Some(content) = req.content {
        let content = content.into_bytes();
        if content != file.content {
            content_changed = true;
        }
        file.content = content;
    }

    let file = state
        .store
        .update_additional_file(&file)
        .await
        .map_err(warp::reject::custom)?;

    let invalidator = state.invalidator();
    if file.filename != old_filename {
        invalidator
            .additional_file_renamed(id, &old_filename, &file.filename)
            .await
            .map_err(warp::reject::custom)?;
    } else if content_changed {
        invalidator
            .additional_file_content_changed(id)
            .await
            .map_err(warp::reject::custom)?;
    }

    Ok(json_created(&AdditionalFileInfo::from(&file)))
}

async fn delete_file(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    state
        .store
        .delete_additional_file(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::with_status(
        warp::reply(),
        warp::http::StatusCode::NO_CONTENT,
    ))
}
