use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Administrative account. Admins can write; everyone else reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub username: String,
    pub name: String,
    pub is_admin: bool,
    /// argon2id digest, never exposed over the API.
    #[serde(skip_serializing)]
    pub password: String,
}

/// Parameterised text fragment used to render a site's configuration
/// section. `variables` lists the free identifiers in `content` beyond the
/// reserved `Origin`/`Cert` pair, in substitution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub description: String,
    pub content: String,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cert {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub domains: Vec<String>,
    /// Issuance provider blob; `None` means manual management.
    pub provider: Option<serde_json::Value>,
    /// NotAfter of the parsed leaf certificate.
    pub expires_at: Option<DateTime<Utc>>,
    /// Leaf certificate, PEM.
    pub certificate: String,
    /// Private key, AES-256-GCM sealed with the process-wide key.
    pub private_key: Vec<u8>,
    /// Intermediate certificate, PEM; empty means none.
    pub intermediate_certificate: String,
    pub csr: String,
}

/// Binds one origin authority to one template and optionally one cert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub origin: String,
    pub template_id: i64,
    /// One value per template variable, same order.
    pub template_values: Vec<String>,
    /// `None` lets the edge proxy manage its own certificate.
    pub cert_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalFile {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    /// Relative path component under the additional-files directory.
    pub filename: String,
    pub content: Vec<u8>,
}

/// A single edge node registered with the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    /// Bearer credential for the worker endpoints.
    pub token: Uuid,
    /// Free-form prefix placed ahead of every rendered site section.
    pub pre_config: String,
    /// Manual-mode instances are not converged and report no last-seen.
    pub is_manual_mode: bool,
    pub additional_file_ids: Vec<i64>,
    pub site_ids: Vec<i64>,
}

/// Site with its template and cert preloaded, for rendering and manifests.
#[derive(Debug, Clone)]
pub struct SiteWithRelations {
    pub site: Site,
    pub template: Template,
    pub cert: Option<Cert>,
}
