use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use super::{
    auth_header, json_created, page_max, parse_pagination, with_state, ListResponse, PageQuery,
};
use crate::error::Error;
use crate::render::validate_template_variables;
use crate::state::AppState;
use crate::store::Template;

#[derive(Debug, Deserialize)]
struct TemplateInput {
    name: Option<String>,
    description: Option<String>,
    content: Option<String>,
    variables: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct TemplateInfo {
    id: i64,
    name: String,
    description: String,
    content: String,
    variables: Vec<String>,
}

impl From<&Template> for TemplateInfo {
    fn from(template: &Template) -> Self {
        Self {
            id: template.id,
            name: template.name.clone(),
            description: template.description.clone(),
            content: template.content.clone(),
            variables: template.variables.clone(),
        }
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "admin" / "templates")
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(list_templates);

    let create = warp::path!("api" / "admin" / "template")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(create_template);

    let get = warp::path!("api" / "admin" / "template" / i64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(get_template);

    let update = warp::path!("api" / "admin" / "template" / i64)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(update_template);

    let delete = warp::path!("api" / "admin" / "template" / i64)
        .and(warp::delete())
        .and(with_state(state))
        .and(auth_header())
        .and_then(delete_template);

    list.or(create).or(get).or(update).or(delete)
}

async fn list_templates(
    query: PageQuery,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let (page, limit) = parse_pagination(&query);
    let (templates, total) = state
        .store
        .list_templates(page, limit)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&ListResponse {
        limit,
        page_max: page_max(total, limit),
        list: templates.iter().map(TemplateInfo::from).collect(),
    }))
}

async fn create_template(
    req: TemplateInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let variables = req.variables.unwrap_or_default();
    validate_template_variables(&variables)
        .map_err(|e| warp::reject::custom(Error::BadRequest(e.to_string())))?;

    let template = state
        .store
        .create_template(&Template {
            id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: req.name.unwrap_or_default(),
            description: req.description.unwrap_or_default(),
            content: req.content.unwrap_or_default(),
            variables,
        })
        .await
        .map_err(warp::reject::custom)?;

    Ok(json_created(&TemplateInfo::from(&template)))
}

async fn get_template(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let template = state
        .store
        .get_template(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&TemplateInfo::from(&template)))
}

async fn update_template(
    id: i64,
    req: TemplateInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let mut template = state
        .store
        .get_template(id)
        .await
        .map_err(warp::reject::custom)?;

    if let Some(name) = req.name {
        template.name = name;
    }
    if let Some(description) = req.description {
        template.description = description;
    }
    if let Some(content) = req.content {
        template.content = content;
    }
    if let Some(variables) = req.variables {
        validate_template_variables(&variables)
            .map_err(|e| warp::reject::custom(Error::BadRequest(e.to_string())))?;
        template.variables = variables;
    }

    let template = state
        .store
        .update_template(&template)
        .await
        .map_err(warp::reject::custom)?;

    state
        .invalidator()
        .template_updated(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(json_created(&TemplateInfo::from(&template)))
}

async fn delete_template(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    state
        .store
        .delete_template(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::with_status(
        warp::reply(),
        warp::http::StatusCode::NO_CONTENT,
    ))
}
