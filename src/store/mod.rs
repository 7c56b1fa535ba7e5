//! Entity store over SQLite.
//!
//! Persists the normalised graph (Users, Templates, Certs, Sites,
//! AdditionalFiles, Instances) with soft delete and referential checks.
//! Ordered id sequences are stored as JSON arrays; reverse walks run as
//! `json_each` queries at invalidation time, no back-pointers are stored.
//!
//! The connection uses WAL mode and lives behind a mutex; every derived
//! artifact (cache slices, manifests, rendered configs) is regenerable
//! from this store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result, StoreError};

pub mod entities;

pub use entities::{AdditionalFile, Cert, Instance, Site, SiteWithRelations, Template, User};

/// Tables that can appear in an ordered id sequence.
#[derive(Debug, Clone, Copy)]
pub enum RefTable {
    Templates,
    Certs,
    Sites,
    AdditionalFiles,
}

impl RefTable {
    fn name(self) -> &'static str {
        match self {
            RefTable::Templates => "templates",
            RefTable::Certs => "certs",
            RefTable::Sites => "sites",
            RefTable::AdditionalFiles => "additional_files",
        }
    }
}

pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database, run the idempotent schema setup and
    /// seed first-boot data.
    pub async fn open(conn_string: &str) -> Result<Self> {
        let conn = Connection::open(conn_string).map_err(StoreError::from)?;
        initialize_schema(&conn)?;
        seed(&conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // ========== Users ==========

    pub async fn create_user(
        &self,
        username: &str,
        name: &str,
        is_admin: bool,
        password_digest: &str,
    ) -> Result<User> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "INSERT INTO users (created_at, updated_at, username, name, is_admin, password)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5)",
            params![ts(&now), username, name, is_admin, password_digest],
        )
        .map_err(StoreError::from)?;

        let id = db.last_insert_rowid();
        drop(db);
        self.get_user(id).await
    }

    pub async fn get_user(&self, id: i64) -> Result<User> {
        let db = self.db.lock().await;
        let user = db
            .query_row(
                "SELECT id, created_at, updated_at, username, name, is_admin, password
                 FROM users WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                row_to_user,
            )
            .map_err(StoreError::from)?;
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User> {
        let db = self.db.lock().await;
        let user = db
            .query_row(
                "SELECT id, created_at, updated_at, username, name, is_admin, password
                 FROM users WHERE username = ?1 AND deleted_at IS NULL",
                params![username],
                row_to_user,
            )
            .map_err(StoreError::from)?;
        Ok(user)
    }

    pub async fn list_users(&self, page: u64, limit: u64) -> Result<(Vec<User>, u64)> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, created_at, updated_at, username, name, is_admin, password
                 FROM users WHERE deleted_at IS NULL ORDER BY id LIMIT ?1 OFFSET ?2",
            )
            .map_err(StoreError::from)?;
        let users = stmt
            .query_map(params![limit, page * limit], row_to_user)
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)?;

        let total = count_rows(&db, "users")?;
        Ok((users, total))
    }

    pub async fn update_user(&self, user: &User) -> Result<User> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db
            .execute(
                "UPDATE users SET updated_at = ?1, username = ?2, name = ?3, is_admin = ?4,
                 password = ?5 WHERE id = ?6 AND deleted_at IS NULL",
                params![
                    ts(&now),
                    user.username,
                    user.name,
                    user.is_admin,
                    user.password,
                    user.id
                ],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound.into());
        }
        drop(db);
        self.get_user(user.id).await
    }

    pub async fn delete_user(&self, id: i64) -> Result<()> {
        let db = self.db.lock().await;
        soft_delete(&db, "users", id)
    }

    pub async fn count_users(&self) -> Result<u64> {
        let db = self.db.lock().await;
        count_rows(&db, "users")
    }

    // ========== Templates ==========

    pub async fn create_template(&self, template: &Template) -> Result<Template> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "INSERT INTO templates (created_at, updated_at, name, description, content, variables)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5)",
            params![
                ts(&now),
                template.name,
                template.description,
                template.content,
                to_json(&template.variables)?
            ],
        )
        .map_err(StoreError::from)?;

        let id = db.last_insert_rowid();
        drop(db);
        self.get_template(id).await
    }

    pub async fn get_template(&self, id: i64) -> Result<Template> {
        let db = self.db.lock().await;
        let template = db
            .query_row(
                "SELECT id, created_at, updated_at, name, description, content, variables
                 FROM templates WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                row_to_template,
            )
            .map_err(StoreError::from)?;
        Ok(template)
    }

    pub async fn list_templates(&self, page: u64, limit: u64) -> Result<(Vec<Template>, u64)> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, created_at, updated_at, name, description, content, variables
                 FROM templates WHERE deleted_at IS NULL ORDER BY id LIMIT ?1 OFFSET ?2",
            )
            .map_err(StoreError::from)?;
        let templates = stmt
            .query_map(params![limit, page * limit], row_to_template)
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)?;

        let total = count_rows(&db, "templates")?;
        Ok((templates, total))
    }

    pub async fn update_template(&self, template: &Template) -> Result<Template> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db
            .execute(
                "UPDATE templates SET updated_at = ?1, name = ?2, description = ?3,
                 content = ?4, variables = ?5 WHERE id = ?6 AND deleted_at IS NULL",
                params![
                    ts(&now),
                    template.name,
                    template.description,
                    template.content,
                    to_json(&template.variables)?,
                    template.id
                ],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound.into());
        }
        drop(db);
        self.get_template(template.id).await
    }

    /// Refused while any site still references the template.
    pub async fn delete_template(&self, id: i64) -> Result<()> {
        let referrers = self.site_ids_referencing_template(id).await?;
        if !referrers.is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "template {id} is referenced by {} site(s)",
                referrers.len()
            )));
        }

        let db = self.db.lock().await;
        soft_delete(&db, "templates", id)
    }

    pub async fn site_ids_referencing_template(&self, template_id: i64) -> Result<Vec<i64>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id FROM sites WHERE deleted_at IS NULL AND template_id = ?1 ORDER BY id",
            )
            .map_err(StoreError::from)?;
        let ids = stmt
            .query_map(params![template_id], |row| row.get(0))
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(StoreError::from)?;
        Ok(ids)
    }

    // ========== Certs ==========

    pub async fn create_cert(&self, cert: &Cert) -> Result<Cert> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "INSERT INTO certs (created_at, updated_at, name, domains, provider, expires_at,
             certificate, private_key, intermediate_certificate, csr)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ts(&now),
                cert.name,
                to_json(&cert.domains)?,
                cert.provider.as_ref().map(to_json).transpose()?,
                cert.expires_at.as_ref().map(ts),
                cert.certificate,
                cert.private_key,
                cert.intermediate_certificate,
                cert.csr
            ],
        )
        .map_err(StoreError::from)?;

        let id = db.last_insert_rowid();
        drop(db);
        self.get_cert(id).await
    }

    pub async fn get_cert(&self, id: i64) -> Result<Cert> {
        let db = self.db.lock().await;
        let cert = db
            .query_row(
                "SELECT id, created_at, updated_at, name, domains, provider, expires_at,
                 certificate, private_key, intermediate_certificate, csr
                 FROM certs WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                row_to_cert,
            )
            .map_err(StoreError::from)?;
        Ok(cert)
    }

    pub async fn list_certs(&self, page: u64, limit: u64) -> Result<(Vec<Cert>, u64)> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, created_at, updated_at, name, domains, provider, expires_at,
                 certificate, private_key, intermediate_certificate, csr
                 FROM certs WHERE deleted_at IS NULL ORDER BY id LIMIT ?1 OFFSET ?2",
            )
            .map_err(StoreError::from)?;
        let certs = stmt
            .query_map(params![limit, page * limit], row_to_cert)
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)?;

        let total = count_rows(&db, "certs")?;
        Ok((certs, total))
    }

    pub async fn update_cert(&self, cert: &Cert) -> Result<Cert> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db
            .execute(
                "UPDATE certs SET updated_at = ?1, name = ?2, domains = ?3, provider = ?4,
                 expires_at = ?5, certificate = ?6, private_key = ?7,
                 intermediate_certificate = ?8, csr = ?9
                 WHERE id = ?10 AND deleted_at IS NULL",
                params![
                    ts(&now),
                    cert.name,
                    to_json(&cert.domains)?,
                    cert.provider.as_ref().map(to_json).transpose()?,
                    cert.expires_at.as_ref().map(ts),
                    cert.certificate,
                    cert.private_key,
                    cert.intermediate_certificate,
                    cert.csr,
                    cert.id
                ],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound.into());
        }
        drop(db);
        self.get_cert(cert.id).await
    }

    /// Refused while any site still references the cert.
    pub async fn delete_cert(&self, id: i64) -> Result<()> {
        let referrers = self.site_ids_referencing_cert(id).await?;
        if !referrers.is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "cert {id} is referenced by {} site(s)",
                referrers.len()
            )));
        }

        let db = self.db.lock().await;
        soft_delete(&db, "certs", id)
    }

    pub async fn site_ids_referencing_cert(&self, cert_id: i64) -> Result<Vec<i64>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare("SELECT id FROM sites WHERE deleted_at IS NULL AND cert_id = ?1 ORDER BY id")
            .map_err(StoreError::from)?;
        let ids = stmt
            .query_map(params![cert_id], |row| row.get(0))
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(StoreError::from)?;
        Ok(ids)
    }

    // ========== Sites ==========

    pub async fn create_site(&self, site: &Site) -> Result<Site> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "INSERT INTO sites (created_at, updated_at, name, origin, template_id,
             template_values, cert_id) VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ts(&now),
                site.name,
                site.origin,
                site.template_id,
                to_json(&site.template_values)?,
                site.cert_id
            ],
        )
        .map_err(StoreError::from)?;

        let id = db.last_insert_rowid();
        drop(db);
        self.get_site(id).await
    }

    pub async fn get_site(&self, id: i64) -> Result<Site> {
        let db = self.db.lock().await;
        let site = db
            .query_row(
                "SELECT id, created_at, updated_at, name, origin, template_id, template_values,
                 cert_id FROM sites WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                row_to_site,
            )
            .map_err(StoreError::from)?;
        Ok(site)
    }

    /// Site together with its template and optional cert, the closure both
    /// the renderer and the manifest builder work from.
    pub async fn get_site_with_relations(&self, id: i64) -> Result<SiteWithRelations> {
        let site = self.get_site(id).await?;
        let template = self.get_template(site.template_id).await?;
        let cert = match site.cert_id {
            Some(cert_id) => Some(self.get_cert(cert_id).await?),
            None => None,
        };

        Ok(SiteWithRelations {
            site,
            template,
            cert,
        })
    }

    pub async fn list_sites(&self, page: u64, limit: u64) -> Result<(Vec<Site>, u64)> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, created_at, updated_at, name, origin, template_id, template_values,
                 cert_id FROM sites WHERE deleted_at IS NULL ORDER BY id LIMIT ?1 OFFSET ?2",
            )
            .map_err(StoreError::from)?;
        let sites = stmt
            .query_map(params![limit, page * limit], row_to_site)
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)?;

        let total = count_rows(&db, "sites")?;
        Ok((sites, total))
    }

    pub async fn update_site(&self, site: &Site) -> Result<Site> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db
            .execute(
                "UPDATE sites SET updated_at = ?1, name = ?2, origin = ?3, template_id = ?4,
                 template_values = ?5, cert_id = ?6 WHERE id = ?7 AND deleted_at IS NULL",
                params![
                    ts(&now),
                    site.name,
                    site.origin,
                    site.template_id,
                    to_json(&site.template_values)?,
                    site.cert_id,
                    site.id
                ],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound.into());
        }
        drop(db);
        self.get_site(site.id).await
    }

    /// Refused while any instance still references the site.
    pub async fn delete_site(&self, id: i64) -> Result<()> {
        let referrers = self.instance_ids_referencing_site(id).await?;
        if !referrers.is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "site {id} is referenced by {} instance(s)",
                referrers.len()
            )));
        }

        let db = self.db.lock().await;
        soft_delete(&db, "sites", id)
    }

    pub async fn instance_ids_referencing_site(&self, site_id: i64) -> Result<Vec<i64>> {
        self.instance_ids_with_member("site_ids", site_id).await
    }

    // ========== Additional files ==========

    pub async fn create_additional_file(&self, file: &AdditionalFile) -> Result<AdditionalFile> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "INSERT INTO additional_files (created_at, updated_at, name, filename, content)
             VALUES (?1, ?1, ?2, ?3, ?4)",
            params![ts(&now), file.name, file.filename, file.content],
        )
        .map_err(StoreError::from)?;

        let id = db.last_insert_rowid();
        drop(db);
        self.get_additional_file(id).await
    }

    pub async fn get_additional_file(&self, id: i64) -> Result<AdditionalFile> {
        let db = self.db.lock().await;
        let file = db
            .query_row(
                "SELECT id, created_at, updated_at, name, filename, content
                 FROM additional_files WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                row_to_additional_file,
            )
            .map_err(StoreError::from)?;
        Ok(file)
    }

    pub async fn list_additional_files(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<AdditionalFile>, u64)> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, created_at, updated_at, name, filename, content
                 FROM additional_files WHERE deleted_at IS NULL ORDER BY id LIMIT ?1 OFFSET ?2",
            )
            .map_err(StoreError::from)?;
        let files = stmt
            .query_map(params![limit, page * limit], row_to_additional_file)
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)?;

        let total = count_rows(&db, "additional_files")?;
        Ok((files, total))
    }

    pub async fn update_additional_file(&self, file: &AdditionalFile) -> Result<AdditionalFile> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db
            .execute(
                "UPDATE additional_files SET updated_at = ?1, name = ?2, filename = ?3,
                 content = ?4 WHERE id = ?5 AND deleted_at IS NULL",
                params![ts(&now), file.name, file.filename, file.content, file.id],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound.into());
        }
        drop(db);
        self.get_additional_file(file.id).await
    }

    /// Refused while any instance still references the file.
    pub async fn delete_additional_file(&self, id: i64) -> Result<()> {
        let referrers = self.instance_ids_referencing_file(id).await?;
        if !referrers.is_empty() {
            return Err(Error::PreconditionFailed(format!(
                "additional file {id} is referenced by {} instance(s)",
                referrers.len()
            )));
        }

        let db = self.db.lock().await;
        soft_delete(&db, "additional_files", id)
    }

    pub async fn instance_ids_referencing_file(&self, file_id: i64) -> Result<Vec<i64>> {
        self.instance_ids_with_member("additional_file_ids", file_id)
            .await
    }

    // ========== Instances ==========

    pub async fn create_instance(&self, instance: &Instance) -> Result<Instance> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "INSERT INTO instances (created_at, updated_at, name, token, pre_config,
             is_manual_mode, additional_file_ids, site_ids)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ts(&now),
                instance.name,
                instance.token.to_string(),
                instance.pre_config,
                instance.is_manual_mode,
                to_json(&instance.additional_file_ids)?,
                to_json(&instance.site_ids)?
            ],
        )
        .map_err(StoreError::from)?;

        let id = db.last_insert_rowid();
        drop(db);
        self.get_instance(id).await
    }

    pub async fn get_instance(&self, id: i64) -> Result<Instance> {
        let db = self.db.lock().await;
        let instance = db
            .query_row(
                "SELECT id, created_at, updated_at, name, token, pre_config, is_manual_mode,
                 additional_file_ids, site_ids
                 FROM instances WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                row_to_instance,
            )
            .map_err(StoreError::from)?;
        Ok(instance)
    }

    /// Bearer-auth lookup: both the id and the token must match.
    pub async fn get_instance_by_id_and_token(&self, id: i64, token: Uuid) -> Result<Instance> {
        let db = self.db.lock().await;
        let instance = db
            .query_row(
                "SELECT id, created_at, updated_at, name, token, pre_config, is_manual_mode,
                 additional_file_ids, site_ids
                 FROM instances WHERE id = ?1 AND token = ?2 AND deleted_at IS NULL",
                params![id, token.to_string()],
                row_to_instance,
            )
            .map_err(StoreError::from)?;
        Ok(instance)
    }

    pub async fn list_instances(&self, page: u64, limit: u64) -> Result<(Vec<Instance>, u64)> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT id, created_at, updated_at, name, token, pre_config, is_manual_mode,
                 additional_file_ids, site_ids
                 FROM instances WHERE deleted_at IS NULL ORDER BY id LIMIT ?1 OFFSET ?2",
            )
            .map_err(StoreError::from)?;
        let instances = stmt
            .query_map(params![limit, page * limit], row_to_instance)
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)?;

        let total = count_rows(&db, "instances")?;
        Ok((instances, total))
    }

    pub async fn update_instance(&self, instance: &Instance) -> Result<Instance> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db
            .execute(
                "UPDATE instances SET updated_at = ?1, name = ?2, pre_config = ?3,
                 is_manual_mode = ?4, additional_file_ids = ?5, site_ids = ?6
                 WHERE id = ?7 AND deleted_at IS NULL",
                params![
                    ts(&now),
                    instance.name,
                    instance.pre_config,
                    instance.is_manual_mode,
                    to_json(&instance.additional_file_ids)?,
                    to_json(&instance.site_ids)?,
                    instance.id
                ],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound.into());
        }
        drop(db);
        self.get_instance(instance.id).await
    }

    /// Replace the bearer token with a fresh one and return it.
    pub async fn rotate_instance_token(&self, id: i64) -> Result<Uuid> {
        let token = Uuid::new_v4();
        let db = self.db.lock().await;
        let now = Utc::now();
        let changed = db
            .execute(
                "UPDATE instances SET updated_at = ?1, token = ?2
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![ts(&now), token.to_string(), id],
            )
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::RecordNotFound.into());
        }
        Ok(token)
    }

    pub async fn delete_instance(&self, id: i64) -> Result<()> {
        let db = self.db.lock().await;
        soft_delete(&db, "instances", id)
    }

    // ========== Referential validation ==========

    /// Every id must resolve to a live row in the given table.
    pub async fn validate_ids(&self, table: RefTable, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let db = self.db.lock().await;
        let sql = format!(
            "SELECT COUNT(DISTINCT id) FROM {} WHERE deleted_at IS NULL AND id IN (SELECT value FROM json_each(?1))",
            table.name()
        );
        let count: i64 = db
            .query_row(&sql, params![to_json(&ids)?], |row| row.get(0))
            .map_err(StoreError::from)?;

        let mut distinct = ids.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if count as usize != distinct.len() {
            return Err(Error::BadRequest(format!(
                "unknown {} id in reference list",
                table.name()
            )));
        }

        Ok(())
    }

    async fn instance_ids_with_member(&self, column: &'static str, member: i64) -> Result<Vec<i64>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT id FROM instances WHERE deleted_at IS NULL AND EXISTS \
             (SELECT 1 FROM json_each(instances.{column}) WHERE json_each.value = ?1) \
             ORDER BY id"
        );
        let mut stmt = db.prepare(&sql).map_err(StoreError::from)?;
        let ids = stmt
            .query_map(params![member], |row| row.get(0))
            .map_err(StoreError::from)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(StoreError::from)?;
        Ok(ids)
    }
}

// ========== Schema ==========

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(StoreError::from)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(StoreError::from)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(StoreError::from)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            username TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL DEFAULT '',
            is_admin INTEGER NOT NULL DEFAULT 0,
            password TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS templates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            name TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            variables TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS certs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            name TEXT NOT NULL DEFAULT '',
            domains TEXT NOT NULL DEFAULT '[]',
            provider TEXT,
            expires_at TEXT,
            certificate TEXT NOT NULL DEFAULT '',
            private_key BLOB NOT NULL DEFAULT x'',
            intermediate_certificate TEXT NOT NULL DEFAULT '',
            csr TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_certs_expires_at ON certs(expires_at);

        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            name TEXT NOT NULL DEFAULT '',
            origin TEXT NOT NULL DEFAULT '',
            template_id INTEGER NOT NULL,
            template_values TEXT NOT NULL DEFAULT '[]',
            cert_id INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_sites_template_id ON sites(template_id);
        CREATE INDEX IF NOT EXISTS idx_sites_cert_id ON sites(cert_id);

        CREATE TABLE IF NOT EXISTS additional_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            name TEXT NOT NULL DEFAULT '',
            filename TEXT NOT NULL DEFAULT '',
            content BLOB NOT NULL DEFAULT x''
        );

        CREATE TABLE IF NOT EXISTS instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            name TEXT NOT NULL DEFAULT '',
            token TEXT NOT NULL,
            pre_config TEXT NOT NULL DEFAULT '',
            is_manual_mode INTEGER NOT NULL DEFAULT 0,
            additional_file_ids TEXT NOT NULL DEFAULT '[]',
            site_ids TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_instances_token ON instances(token);",
    )
    .map_err(StoreError::from)?;

    Ok(())
}

// ========== First-boot seeding ==========

fn seed(conn: &Connection) -> Result<()> {
    let now = Utc::now();

    let user_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM users WHERE deleted_at IS NULL", [], |row| row.get(0))
        .map_err(StoreError::from)?;
    if user_count == 0 {
        let digest = crate::auth::hash_password("password")?;
        conn.execute(
            "INSERT INTO users (created_at, updated_at, username, name, is_admin, password)
             VALUES (?1, ?1, 'admin', 'CDN Admin', 1, ?2)",
            params![ts(&now), digest],
        )
        .map_err(StoreError::from)?;
        warn!("seeded default admin account 'admin' with placeholder password; rotate it now");
    }

    let template_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM templates WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )
        .map_err(StoreError::from)?;
    if template_count == 0 {
        let starters: [(&str, &str, &str, &[&str]); 4] = [
            (
                "Blank",
                "No built-in directives, everything is custom",
                "{{.Origin}} {\n    {{.Cert}}\n{{.Content}}\n}",
                &["Content"],
            ),
            (
                "Simple reverse proxy",
                "Plain reverse proxy with managed certificates",
                "{{.Origin}} {\n    {{.Cert}}\n    reverse_proxy {{.Source}}\n}",
                &["Source"],
            ),
            (
                "SNI override proxy",
                "Proxy an HTTPS upstream under an SNI it does not know",
                "{{.Origin}} {\n    {{.Cert}}\n    reverse_proxy https://{{.Source}} {\n        header_up Host {{.Source}}\n        transport http {\n            tls\n            tls_server_name {{.Source}}\n        }\n    }\n}",
                &["Source"],
            ),
            (
                "Custom 502 page",
                "Reverse proxy that rewrites bad-gateway errors to a custom page",
                "{{.Origin}} {\n    {{.Cert}}\n    reverse_proxy {{.Source}}\n    handle_errors {\n        @badgateway expression `{err.status_code} == 502`\n        handle @badgateway {\n            rewrite * /custom_502.html\n            file_server {\n                status 500\n            }\n        }\n    }\n}",
                &["Source"],
            ),
        ];

        for (name, description, content, variables) in starters {
            conn.execute(
                "INSERT INTO templates (created_at, updated_at, name, description, content, variables)
                 VALUES (?1, ?1, ?2, ?3, ?4, ?5)",
                params![ts(&now), name, description, content, to_json(&variables)?],
            )
            .map_err(StoreError::from)?;
        }
    }

    Ok(())
}

// ========== Row mapping ==========

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(value: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: DeserializeOwned>(value: String, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn to_json<T: Serialize>(value: &T) -> std::result::Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE deleted_at IS NULL");
    let count: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .map_err(StoreError::from)?;
    Ok(count as u64)
}

fn soft_delete(conn: &Connection, table: &str, id: i64) -> Result<()> {
    let sql = format!("UPDATE {table} SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL");
    let changed = conn
        .execute(&sql, params![ts(&Utc::now()), id])
        .map_err(StoreError::from)?;
    if changed == 0 {
        return Err(StoreError::RecordNotFound.into());
    }
    Ok(())
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        created_at: parse_ts(row.get(1)?, 1)?,
        updated_at: parse_ts(row.get(2)?, 2)?,
        username: row.get(3)?,
        name: row.get(4)?,
        is_admin: row.get(5)?,
        password: row.get(6)?,
    })
}

fn row_to_template(row: &Row) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        created_at: parse_ts(row.get(1)?, 1)?,
        updated_at: parse_ts(row.get(2)?, 2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        content: row.get(5)?,
        variables: parse_json(row.get(6)?, 6)?,
    })
}

fn row_to_cert(row: &Row) -> rusqlite::Result<Cert> {
    let provider: Option<String> = row.get(5)?;
    let expires_at: Option<String> = row.get(6)?;

    Ok(Cert {
        id: row.get(0)?,
        created_at: parse_ts(row.get(1)?, 1)?,
        updated_at: parse_ts(row.get(2)?, 2)?,
        name: row.get(3)?,
        domains: parse_json(row.get(4)?, 4)?,
        provider: provider.map(|p| parse_json(p, 5)).transpose()?,
        expires_at: expires_at.map(|t| parse_ts(t, 6)).transpose()?,
        certificate: row.get(7)?,
        private_key: row.get(8)?,
        intermediate_certificate: row.get(9)?,
        csr: row.get(10)?,
    })
}

fn row_to_site(row: &Row) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        created_at: parse_ts(row.get(1)?, 1)?,
        updated_at: parse_ts(row.get(2)?, 2)?,
        name: row.get(3)?,
        origin: row.get(4)?,
        template_id: row.get(5)?,
        template_values: parse_json(row.get(6)?, 6)?,
        cert_id: row.get(7)?,
    })
}

fn row_to_additional_file(row: &Row) -> rusqlite::Result<AdditionalFile> {
    Ok(AdditionalFile {
        id: row.get(0)?,
        created_at: parse_ts(row.get(1)?, 1)?,
        updated_at: parse_ts(row.get(2)?, 2)?,
        name: row.get(3)?,
        filename: row.get(4)?,
        content: row.get(5)?,
    })
}

fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
    let token: String = row.get(4)?;
    let token = Uuid::parse_str(&token).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Instance {
        id: row.get(0)?,
        created_at: parse_ts(row.get(1)?, 1)?,
        updated_at: parse_ts(row.get(2)?, 2)?,
        name: row.get(3)?,
        token,
        pre_config: row.get(5)?,
        is_manual_mode: row.get(6)?,
        additional_file_ids: parse_json(row.get(7)?, 7)?,
        site_ids: parse_json(row.get(8)?, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> Store {
        Store::open(":memory:").await.unwrap()
    }

    fn blank_template() -> Template {
        Template {
            id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: "proxy".into(),
            description: String::new(),
            content: "{{.Origin}} {\n    reverse_proxy {{.Source}}\n}".into(),
            variables: vec!["Source".into()],
        }
    }

    #[tokio::test]
    async fn test_seeds_default_admin_and_templates() {
        let store = open_store().await;
        let admin = store.get_user_by_username("admin").await.unwrap();
        assert!(admin.is_admin);

        let (templates, total) = store.list_templates(0, 100).await.unwrap();
        assert_eq!(total, 4);
        assert!(templates.iter().any(|t| t.name == "Simple reverse proxy"));
    }

    #[tokio::test]
    async fn test_template_crud_and_soft_delete() {
        let store = open_store().await;
        let created = store.create_template(&blank_template()).await.unwrap();
        assert!(created.id > 0);

        let mut updated = created.clone();
        updated.name = "renamed".into();
        let updated = store.update_template(&updated).await.unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(updated.updated_at >= created.updated_at);

        store.delete_template(created.id).await.unwrap();
        assert!(matches!(
            store.get_template(created.id).await,
            Err(Error::Store(StoreError::RecordNotFound))
        ));
    }

    #[tokio::test]
    async fn test_delete_refused_while_referenced() {
        let store = open_store().await;
        let template = store.create_template(&blank_template()).await.unwrap();
        let site = store
            .create_site(&Site {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "a".into(),
                origin: "a.test".into(),
                template_id: template.id,
                template_values: vec!["b.upstream".into()],
                cert_id: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            store.delete_template(template.id).await,
            Err(Error::PreconditionFailed(_))
        ));

        store.delete_site(site.id).await.unwrap();
        store.delete_template(template.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reverse_walk_over_id_arrays() {
        let store = open_store().await;
        let file = store
            .create_additional_file(&AdditionalFile {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "robots".into(),
                filename: "robots.txt".into(),
                content: b"User-agent: *".to_vec(),
            })
            .await
            .unwrap();

        let instance = store
            .create_instance(&Instance {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "edge-1".into(),
                token: Uuid::new_v4(),
                pre_config: String::new(),
                is_manual_mode: false,
                additional_file_ids: vec![file.id],
                site_ids: vec![],
            })
            .await
            .unwrap();

        let referrers = store.instance_ids_referencing_file(file.id).await.unwrap();
        assert_eq!(referrers, vec![instance.id]);

        let none = store
            .instance_ids_referencing_file(file.id + 100)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_token_rotation_changes_lookup() {
        let store = open_store().await;
        let instance = store
            .create_instance(&Instance {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "edge-1".into(),
                token: Uuid::new_v4(),
                pre_config: String::new(),
                is_manual_mode: false,
                additional_file_ids: vec![],
                site_ids: vec![],
            })
            .await
            .unwrap();

        let old_token = instance.token;
        let new_token = store.rotate_instance_token(instance.id).await.unwrap();
        assert_ne!(old_token, new_token);

        assert!(store
            .get_instance_by_id_and_token(instance.id, old_token)
            .await
            .is_err());
        assert!(store
            .get_instance_by_id_and_token(instance.id, new_token)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_validate_ids_rejects_unknown() {
        let store = open_store().await;
        let template = store.create_template(&blank_template()).await.unwrap();

        store
            .validate_ids(RefTable::Templates, &[template.id])
            .await
            .unwrap();
        assert!(matches!(
            store
                .validate_ids(RefTable::Templates, &[template.id, 999])
                .await,
            Err(Error::BadRequest(_))
        ));
    }
}
