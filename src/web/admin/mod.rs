//! Admin-facing endpoints: login plus CRUD for every entity.
//!
//! Reads are open to any authenticated user; writes require the admin
//! role. Every mutating handler finishes by running the invalidation walk
//! for its entity class, so worker-facing caches never outlive the
//! authoritative row by more than a rebuild.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use crate::auth::AdminClaims;
use crate::error::{Error, Result};
use crate::state::AppState;

mod certs;
mod files;
mod instances;
mod login;
mod sites;
mod templates;
mod users;

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    login::routes(state.clone())
        .or(users::routes(state.clone()))
        .or(templates::routes(state.clone()))
        .or(certs::routes(state.clone()))
        .or(sites::routes(state.clone()))
        .or(files::routes(state.clone()))
        .or(instances::routes(state))
}

pub(crate) fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub(crate) fn auth_header() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
}

/// Validate the admin token and enforce role requirements.
///
/// `match_id` lets a non-admin act on their own user row only.
pub(crate) fn require_auth(
    state: &AppState,
    auth_header: Option<String>,
    require_admin_role: bool,
    match_id: Option<i64>,
) -> Result<AdminClaims> {
    let header = auth_header.ok_or_else(|| Error::Unauthorized("missing auth token".into()))?;
    let token = crate::auth::bearer_token(&header)?;
    let claims = state.jwt.parse(token)?;

    if require_admin_role && !claims.adm {
        return Err(Error::Forbidden("requires admin role".into()));
    }

    if let Some(id) = match_id {
        if claims.id != id && !claims.adm {
            return Err(Error::Forbidden("user id does not match".into()));
        }
    }

    Ok(claims)
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

/// One-based page in, zero-based offset page out; limit defaults to 100.
pub(crate) fn parse_pagination(query: &PageQuery) -> (u64, u64) {
    let page = query.page.unwrap_or(1).saturating_sub(1);
    let limit = match query.limit {
        Some(limit) if limit > 0 => limit,
        _ => 100,
    };
    (page, limit)
}

pub(crate) fn page_max(total: u64, limit: u64) -> u64 {
    total.div_ceil(limit)
}

#[derive(Debug, Serialize)]
pub(crate) struct ListResponse<T: Serialize> {
    pub limit: u64,
    pub page_max: u64,
    pub list: Vec<T>,
}

pub(crate) fn json_created<T: Serialize>(body: &T) -> impl Reply {
    warp::reply::with_status(warp::reply::json(body), warp::http::StatusCode::CREATED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let (page, limit) = parse_pagination(&PageQuery {
            page: None,
            limit: None,
        });
        assert_eq!((page, limit), (0, 100));

        let (page, limit) = parse_pagination(&PageQuery {
            page: Some(3),
            limit: Some(20),
        });
        assert_eq!((page, limit), (2, 20));

        // limit 0 falls back to the default
        let (_, limit) = parse_pagination(&PageQuery {
            page: Some(1),
            limit: Some(0),
        });
        assert_eq!(limit, 100);
    }

    #[test]
    fn test_page_max_rounds_up() {
        assert_eq!(page_max(0, 100), 0);
        assert_eq!(page_max(100, 100), 1);
        assert_eq!(page_max(101, 100), 2);
    }
}
