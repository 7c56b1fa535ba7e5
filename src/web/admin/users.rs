use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use warp::{Filter, Rejection, Reply};

use super::{
    auth_header, json_created, page_max, parse_pagination, with_state, ListResponse, PageQuery,
};
use crate::auth;
use crate::cache;
use crate::error::Error;
use crate::state::AppState;
use crate::store::User;

#[derive(Debug, Deserialize)]
struct UserInput {
    username: Option<String>,
    name: Option<String>,
    is_admin: Option<bool>,
    password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserInfo {
    id: i64,
    username: String,
    name: String,
    is_admin: bool,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            name: user.name.clone(),
            is_admin: user.is_admin,
        }
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "admin" / "users")
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(list_users);

    let create = warp::path!("api" / "admin" / "user")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(create_user);

    let get = warp::path!("api" / "admin" / "user" / i64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(get_user);

    let update = warp::path!("api" / "admin" / "user" / i64)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(update_user);

    let delete = warp::path!("api" / "admin" / "user" / i64)
        .and(warp::delete())
        .and(with_state(state))
        .and(auth_header())
        .and_then(delete_user);

    list.or(create).or(get).or(update).or(delete)
}

async fn list_users(
    query: PageQuery,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let (page, limit) = parse_pagination(&query);
    let (users, total) = state
        .store
        .list_users(page, limit)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&ListResponse {
        limit,
        page_max: page_max(total, limit),
        list: users.iter().map(UserInfo::from).collect(),
    }))
}

async fn create_user(
    req: UserInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let (Some(username), Some(password)) = (req.username.as_deref(), req.password.as_deref())
    else {
        return Err(warp::reject::custom(Error::BadRequest(
            "username and password are required".into(),
        )));
    };

    let digest = auth::hash_password(password).map_err(warp::reject::custom)?;
    let user = state
        .store
        .create_user(
            username,
            req.name.as_deref().unwrap_or_default(),
            req.is_admin.unwrap_or(false),
            &digest,
        )
        .await
        .map_err(warp::reject::custom)?;

    Ok(json_created(&UserInfo::from(&user)))
}

async fn get_user(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    // non-admins may read their own account only
    super::require_auth(&state, auth, false, Some(id)).map_err(warp::reject::custom)?;

    let info_key = cache::user_info_key(id);
    if let Some(bytes) = state.cache.get(&info_key) {
        match serde_json::from_slice::<UserInfo>(&bytes) {
            Ok(info) => return Ok(warp::reply::json(&info)),
            Err(e) => {
                error!(id, error = %e, "corrupt user info cache entry, dropping");
                state.cache.del(&info_key);
            }
        }
    }

    let user = state.store.get_user(id).await.map_err(warp::reject::custom)?;
    let info = UserInfo::from(&user);

    match serde_json::to_vec(&info) {
        Ok(bytes) => state.cache.set(&info_key, bytes, Some(cache::TTL_USER_INFO)),
        Err(e) => error!(id, error = %e, "failed to marshal user info"),
    }

    Ok(warp::reply::json(&info))
}

async fn update_user(
    id: i64,
    req: UserInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    let claims =
        super::require_auth(&state, auth, false, Some(id)).map_err(warp::reject::custom)?;

    // a non-admin must not grant themselves the admin role
    if !claims.adm && req.is_admin == Some(true) {
        return Err(warp::reject::custom(Error::Forbidden(
            "requires admin role".into(),
        )));
    }

    let mut user = state.store.get_user(id).await.map_err(warp::reject::custom)?;

    if let Some(username) = req.username {
        user.username = username;
    }
    if let Some(name) = req.name {
        user.name = name;
    }
    if let Some(is_admin) = req.is_admin {
        user.is_admin = is_admin;
    }
    if let Some(password) = req.password.as_deref() {
        user.password = auth::hash_password(password).map_err(warp::reject::custom)?;
    }

    let user = state
        .store
        .update_user(&user)
        .await
        .map_err(warp::reject::custom)?;

    state.cache.del(&cache::user_info_key(id));

    Ok(json_created(&UserInfo::from(&user)))
}

async fn delete_user(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    state
        .store
        .delete_user(id)
        .await
        .map_err(warp::reject::custom)?;

    state.cache.del(&cache::user_info_key(id));

    Ok(warp::reply::with_status(
        warp::reply(),
        warp::http::StatusCode::NO_CONTENT,
    ))
}
