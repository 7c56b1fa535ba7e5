use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::{ConfigError, Error, Result};
use crate::state::AppState;

pub mod admin;
pub mod worker;

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr: std::net::SocketAddr = state.config.listen.parse().map_err(|e| {
        Error::Config(ConfigError::Parse(format!(
            "invalid listen address {}: {e}",
            state.config.listen
        )))
    })?;

    tracing::info!("Starting coordinator API on {}", addr);

    let routes = routes(state.clone());

    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, {
        let state = state.clone();
        async move {
            let _ = state.shutdown_tx.subscribe().recv().await;
        }
    });

    server.await;

    tracing::info!("Coordinator API stopped");
    Ok(())
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let healthcheck = warp::path!("api" / "healthcheck")
        .and(warp::get())
        .map(|| "OK");

    worker::routes(state.clone())
        .or(admin::routes(state))
        .or(healthcheck)
        .with(warp::log("cdn_control::web"))
        .recover(handle_rejection)
}

#[derive(Serialize)]
struct ErrorMessage {
    message: String,
}

/// Map rejections to their canonical status with a `{message}` body. The
/// reason phrase is all a caller gets; details stay in the logs.
async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let status = if let Some(e) = err.find::<Error>() {
        let status = e.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %e, "request failed");
        }
        status
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
        || err.find::<warp::reject::InvalidQuery>().is_some()
    {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        tracing::error!(?err, "unhandled rejection");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let message = status.canonical_reason().unwrap_or("Unknown").to_string();

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorMessage { message }),
        status,
    ))
}
