use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use warp::{Filter, Rejection, Reply};

use super::with_state;
use crate::auth::{self, AdminClaims};
use crate::error::{Error, StoreError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "admin" / "auth" / "login")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(login)
}

async fn login(
    req: LoginRequest,
    state: Arc<AppState>,
) -> std::result::Result<impl Reply, Rejection> {
    let user = state
        .store
        .get_user_by_username(&req.username)
        .await
        .map_err(|e| match e {
            Error::Store(StoreError::RecordNotFound) => {
                warp::reject::custom(Error::Unauthorized("unknown user".into()))
            }
            other => {
                error!(username = %req.username, error = %other, "login user lookup failed");
                warp::reject::custom(other)
            }
        })?;

    if !auth::verify_password(&req.password, &user.password) {
        return Err(warp::reject::custom(Error::Unauthorized(
            "password mismatch".into(),
        )));
    }

    let expires = chrono::Utc::now() + auth::AUTH_TOKEN_DURATION;
    let token = state
        .jwt
        .sign(&AdminClaims {
            id: user.id,
            adm: user.is_admin,
            exp: expires.timestamp(),
        })
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&LoginResponse { token }))
}
