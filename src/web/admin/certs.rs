use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use warp::{Filter, Rejection, Reply};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use super::{
    auth_header, json_created, page_max, parse_pagination, with_state, ListResponse, PageQuery,
};
use crate::state::AppState;
use crate::store::Cert;

#[derive(Debug, Deserialize)]
struct CertInput {
    name: Option<String>,
    domains: Option<Vec<String>>,
    provider: Option<serde_json::Value>,
    certificate: Option<String>,
    private_key: Option<String>,
    intermediate_certificate: Option<String>,
    csr: Option<String>,
}

#[derive(Debug, Serialize)]
struct CertInfo {
    id: i64,
    name: String,
    domains: Vec<String>,
    expires_at: Option<i64>,
    // key material is never exposed back out
}

impl From<&Cert> for CertInfo {
    fn from(cert: &Cert) -> Self {
        Self {
            id: cert.id,
            name: cert.name.clone(),
            domains: cert.domains.clone(),
            expires_at: cert.expires_at.map(|t| t.timestamp()),
        }
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "admin" / "certs")
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(list_certs);

    let create = warp::path!("api" / "admin" / "cert")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(create_cert);

    let get = warp::path!("api" / "admin" / "cert" / i64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(get_cert);

    let update = warp::path!("api" / "admin" / "cert" / i64)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and(auth_header())
        .and_then(update_cert);

    let delete = warp::path!("api" / "admin" / "cert" / i64)
        .and(warp::delete())
        .and(with_state(state))
        .and(auth_header())
        .and_then(delete_cert);

    list.or(create).or(get).or(update).or(delete)
}

/// Pull NotAfter and the SAN list out of a leaf PEM. A malformed
/// certificate is logged and ignored rather than failing the write.
fn parse_certificate_meta(pem: &str) -> Option<(DateTime<Utc>, Vec<String>)> {
    let (_, parsed_pem) = match parse_x509_pem(pem.as_bytes()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "failed to parse certificate PEM");
            return None;
        }
    };

    let x509 = match parsed_pem.parse_x509() {
        Ok(x509) => x509,
        Err(e) => {
            warn!(error = %e, "failed to parse certificate");
            return None;
        }
    };

    let expires_at = DateTime::from_timestamp(x509.validity().not_after.timestamp(), 0)?;

    let mut domains = Vec::new();
    if let Ok(Some(san)) = x509.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                domains.push(dns.to_string());
            }
        }
    }

    Some((expires_at, domains))
}

/// Apply the input onto a cert row. Returns (material_changed,
/// intermediate_toggled) for the invalidation walk.
fn map_fields(req: CertInput, cert: &mut Cert, state: &AppState) -> crate::error::Result<(bool, bool)> {
    let mut material_changed = false;
    let mut intermediate_toggled = false;

    if let Some(name) = req.name {
        cert.name = name;
    }
    if let Some(domains) = req.domains {
        cert.domains = domains;
    }
    if let Some(provider) = req.provider {
        cert.provider = if provider.is_null() {
            None
        } else {
            Some(provider)
        };
    }

    if let Some(certificate) = req.certificate {
        if let Some((expires_at, san_domains)) = parse_certificate_meta(&certificate) {
            cert.expires_at = Some(expires_at);
            if !san_domains.is_empty() {
                cert.domains = san_domains;
            }
        } else {
            cert.expires_at = None;
        }
        cert.certificate = certificate;
        material_changed = true;
    }

    if let Some(private_key) = req.private_key {
        cert.private_key = state.crypto.seal(private_key.as_bytes())?;
        material_changed = true;
    }

    if let Some(intermediate) = req.intermediate_certificate {
        if cert.intermediate_certificate.is_empty() != intermediate.is_empty() {
            intermediate_toggled = true;
        }
        cert.intermediate_certificate = intermediate;
        material_changed = true;
    }

    if let Some(csr) = req.csr {
        cert.csr = csr;
    }

    Ok((material_changed, intermediate_toggled))
}

async fn list_certs(
    query: PageQuery,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let (page, limit) = parse_pagination(&query);
    let (certs, total) = state
        .store
        .list_certs(page, limit)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&ListResponse {
        limit,
        page_max: page_max(total, limit),
        list: certs.iter().map(CertInfo::from).collect(),
    }))
}

async fn create_cert(
    req: CertInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let mut cert = Cert {
        id: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        name: String::new(),
        domains: Vec::new(),
        provider: None,
        expires_at: None,
        certificate: String::new(),
        private_key: Vec::new(),
        intermediate_certificate: String::new(),
        csr: String::new(),
    };
    map_fields(req, &mut cert, &state).map_err(warp::reject::custom)?;

    let cert = state
        .store
        .create_cert(&cert)
        .await
        .map_err(warp::reject::custom)?;

    Ok(json_created(&CertInfo::from(&cert)))
}

async fn get_cert(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, false, None).map_err(warp::reject::custom)?;

    let cert = state.store.get_cert(id).await.map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&CertInfo::from(&cert)))
}

async fn update_cert(
    id: i64,
    req: CertInput,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    let mut cert = state.store.get_cert(id).await.map_err(warp::reject::custom)?;
    let (material_changed, intermediate_toggled) =
        map_fields(req, &mut cert, &state).map_err(warp::reject::custom)?;

    let cert = state
        .store
        .update_cert(&cert)
        .await
        .map_err(warp::reject::custom)?;

    if material_changed {
        state
            .invalidator()
            .cert_updated(id, intermediate_toggled)
            .await
            .map_err(warp::reject::custom)?;
    }

    Ok(json_created(&CertInfo::from(&cert)))
}

async fn delete_cert(
    id: i64,
    state: Arc<AppState>,
    auth: Option<String>,
) -> std::result::Result<impl Reply, Rejection> {
    super::require_auth(&state, auth, true, None).map_err(warp::reject::custom)?;

    state
        .store
        .delete_cert(id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::with_status(
        warp::reply(),
        warp::http::StatusCode::NO_CONTENT,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GARBAGE_PEM: &str =
        "-----BEGIN CERTIFICATE-----\nnot a certificate\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_malformed_pem_yields_no_meta() {
        assert!(parse_certificate_meta(GARBAGE_PEM).is_none());
        assert!(parse_certificate_meta("").is_none());
    }
}
