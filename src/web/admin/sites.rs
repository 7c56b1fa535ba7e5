use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use super::{
    auth_header, json_created, page_max, parse_pagination, with_state, ListResponse, PageQuery,
};
use crate::error::Error;
use crate::state::AppState;
use crate::store::{RefTable, Site};

#[derive(Debug, Deserialize)]
struct SiteInput {
    name: Option<String>,
    origin: Option<String>,
    template_id: Option<i64>,
    template_values: Option<Vec<String>>,
    /// `Some(None)` detaches the cert.
    #[serde(default, with = "double_option")]
    cert_id: Option<Option<i64>>,
}

#[derive(Debug, Serialize)]
struct SiteInfo {
    id: i64,
    name: String,
    origin: String,
    template_id: i64,
    template_values: Vec<String>,
    cert_id: Option<i64>,
}

impl From<&Site> for SiteInfo {
    fn from(site: &Site) -> Self {
        Self {
            id: site.id,
            name: site.name.clone(),
            origin: site.origin.clone(),
            template_id: site.template_id,
            template_values: site.template_values.clone(),
            cert_id: site.cert_id,
        }
    }
}

// Distinguishes an absent cert_id field from an explicit null.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Option<i64>>, D::Error> {
        Option::<i64>::deserialize(de).map(Some)
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "admin" / "sites")
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(list_sites);

    let create = warp::path!("api" / "admin" / "site")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(create_site);

    let get = warp::path!("api" / "admin" / "site" / i64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(get_site);

    let update = warp::path!("api" / "admin" / "site" / i64)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(update_site);

    let delete = warp::path!("api" / "admin" / "site" / i64)
        .and(warp::delete())
        .and(with_state(state))
        .and(auth_header())
        .and_then(delete_site);

    list.or(create).or(get).or(update).or(delete)
}

/// Referential checks revalidated on every site write: the template and
/// cert must resolve, and the value list must line up with the template's
/// variables.
async fn validate_site(state: &AppState, site: &Site) -> crate::error::Result<()> {
    state
        .store
        .validate_ids(RefTable::Templates, &[site.template_id])
        .await?;

    if let Some(cert_id) = site.cert_id {
        state.store.validate_ids(RefTable::Certs, &[cert_id]).await?;
    }

    let template = state.store.get_template(site.template_id).await?;
    if template.variables.len() != site.template_values.len() {
        return Err(Error::BadRequest(format!(
            "template wants {} value(s), site has {}",
            template.variables.len(),
            site.template_values.len()
        )));
    }

    Ok(())
}

async fn list_sites(
    query: PageQuery,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let (page, limit) = parse_pagination(&query);
    let (sites, total) = state
        .store
        .list_sites(page, limit)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&ListResponse {
        limit,
        page_max: page_max(total, limit),
        list: sites.iter().map(SiteInfo::from).collect(),
    }))
}

async fn create_site(
    req: SiteInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let Some(template_id) = req.template_id else {
        return Err(warp::reject::custom(Error::BadRequest(
            "template_id is required".into(),
        )));
    };

    let site = Site {
        id: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        name: req.name.unwrap_or_default(),
        origin: req.origin.unwrap_or_default(),
        template_id,
        template_values: req.template_values.unwrap_or_default(),
        cert_id: req.cert_id.flatten(),
    };

    validate_site(&state, &site).await.map_err(warp::reject::custom)?;

    let site = state
        .store
        .create_site(&site)
        .await
        .map_err(warp::reject::custom)?;

    Ok(json_created(&SiteInfo::from(&site)))
}

async fn get_site(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let site = state.store.get_site(id).await.map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&SiteInfo::from(&site)))
}

async fn update_site(
    id: i64,
    req: SiteInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let mut site = state.store.get_site(id).await.map_err(warp::reject::custom)?;

    if let Some(name) = req.name {
        site.name = name;
    }
    if let Some(origin) = req.origin {
        site.origin = origin;
    }
    if let Some(template_id) = req.template_id {
        site.template_id = template_id;
    }
    if let Some(template_values) = req.template_values {
        site.template_values = template_values;
    }
    if let Some(cert_id) = req.cert_id {
        site.cert_id = cert_id;
    }

    validate_site(&state, &site).await.map_err(warp::reject::custom)?;

    let site = state
        .store
        .update_site(&site)
        .await
        .map_err(warp::reject::custom)?;

    state
        .invalidator()
        .site_updated(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(json_created(&SiteInfo::from(&site)))
}

async fn delete_site(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    state
        .store
        .delete_site(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::with_status(
        warp::reply(),
        warp::http::StatusCode::NO_CONTENT,
    ))
}
