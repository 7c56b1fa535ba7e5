//! Fine-grained cache invalidation.
//!
//! Every mutation class walks the reverse edges of the entity graph to the
//! set of affected instances and drops exactly the slices the mutation can
//! have stained. Reverse walks are store queries executed at invalidation
//! time; an empty referrer set is a valid result. Over-invalidation is
//! always safe, so the filename-rename path falls back to dropping the
//! whole files slice when the targeted move cannot be carried out.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{self, CacheStore};
use crate::error::Result;
use crate::paths;
use crate::store::Store;

pub struct Invalidator {
    store: Arc<Store>,
    cache: Arc<CacheStore>,
}

impl Invalidator {
    pub fn new(store: Arc<Store>, cache: Arc<CacheStore>) -> Self {
        Self { store, cache }
    }

    /// Content changed, filename untouched: the files slice stays valid,
    /// only the stamps in the heartbeat move.
    pub async fn additional_file_content_changed(&self, file_id: i64) -> Result<()> {
        for instance_id in self.store.instance_ids_referencing_file(file_id).await? {
            self.cache.del(&cache::instance_heartbeat_key(instance_id));
        }
        Ok(())
    }

    /// Filename changed: move the files-slice entry to the new path, or
    /// drop the whole slice if the move fails.
    pub async fn additional_file_renamed(
        &self,
        file_id: i64,
        old_filename: &str,
        new_filename: &str,
    ) -> Result<()> {
        let old_path = paths::additional_file_path(old_filename);
        let new_path = paths::additional_file_path(new_filename);

        for instance_id in self.store.instance_ids_referencing_file(file_id).await? {
            self.cache.del(&cache::instance_heartbeat_key(instance_id));

            let files_key = cache::instance_files_key(instance_id);
            if let Err(e) = self.cache.hrename(&files_key, &old_path, &new_path) {
                warn!(instance_id, error = %e, "files slice rename failed, dropping slice");
                self.cache.del(&files_key);
            }
        }
        Ok(())
    }

    /// Certificate or key material changed. The rendered config references
    /// cert files by path, so only heartbeats move. The exception is an
    /// intermediate presence toggle, which adds or removes a path and
    /// stains the files slice too.
    pub async fn cert_updated(&self, cert_id: i64, intermediate_toggled: bool) -> Result<()> {
        for instance_id in self.instances_behind_cert(cert_id).await? {
            self.cache.del(&cache::instance_heartbeat_key(instance_id));
            if intermediate_toggled {
                self.cache.del(&cache::instance_files_key(instance_id));
            }
        }
        Ok(())
    }

    /// A site change can swap certs or move stamps, so everything derived
    /// from the site list goes.
    pub async fn site_updated(&self, site_id: i64) -> Result<()> {
        for instance_id in self.store.instance_ids_referencing_site(site_id).await? {
            self.cache.del(&cache::instance_config_key(instance_id));
            self.cache.del(&cache::instance_heartbeat_key(instance_id));
            self.cache.del(&cache::instance_files_key(instance_id));
        }
        Ok(())
    }

    pub async fn template_updated(&self, template_id: i64) -> Result<()> {
        for instance_id in self.instances_behind_template(template_id).await? {
            self.cache.del(&cache::instance_config_key(instance_id));
            self.cache.del(&cache::instance_heartbeat_key(instance_id));
        }
        Ok(())
    }

    pub fn instance_updated(&self, instance_id: i64) {
        self.cache.del(&cache::instance_config_key(instance_id));
        self.cache.del(&cache::instance_heartbeat_key(instance_id));
        self.cache.del(&cache::instance_files_key(instance_id));
    }

    pub fn instance_token_rotated(&self, instance_id: i64) {
        self.cache.del(&cache::instance_info_key(instance_id));
    }

    pub fn instance_deleted(&self, instance_id: i64) {
        self.cache.del(&cache::instance_info_key(instance_id));
        self.cache.del(&cache::instance_config_key(instance_id));
        self.cache.del(&cache::instance_heartbeat_key(instance_id));
        self.cache.del(&cache::instance_files_key(instance_id));
        self.cache.del(&cache::instance_lastseen_key(instance_id));
    }

    async fn instances_behind_cert(&self, cert_id: i64) -> Result<BTreeSet<i64>> {
        let mut instance_ids = BTreeSet::new();
        for site_id in self.store.site_ids_referencing_cert(cert_id).await? {
            instance_ids.extend(self.store.instance_ids_referencing_site(site_id).await?);
        }
        Ok(instance_ids)
    }

    async fn instances_behind_template(&self, template_id: i64) -> Result<BTreeSet<i64>> {
        let mut instance_ids = BTreeSet::new();
        for site_id in self.store.site_ids_referencing_template(template_id).await? {
            instance_ids.extend(self.store.instance_ids_referencing_site(site_id).await?);
        }
        Ok(instance_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AdditionalFile, Cert, Instance, Site, Template};
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<Store>,
        cache: Arc<CacheStore>,
        template_id: i64,
        cert_id: i64,
        site_id: i64,
        file_id: i64,
        instance_id: i64,
    }

    impl Fixture {
        fn invalidator(&self) -> Invalidator {
            Invalidator::new(self.store.clone(), self.cache.clone())
        }

        /// Fill every slice for the instance so drops are observable.
        fn fill_cache(&self) {
            let id = self.instance_id;
            self.cache.set(&cache::instance_info_key(id), b"info".to_vec(), None);
            self.cache.set(&cache::instance_config_key(id), b"config".to_vec(), None);
            self.cache.set(&cache::instance_heartbeat_key(id), b"hb".to_vec(), None);
            self.cache.set(&cache::instance_lastseen_key(id), b"0".to_vec(), None);

            let mut fields = std::collections::HashMap::new();
            fields.insert(
                paths::additional_file_path("x.txt"),
                b"meta".to_vec(),
            );
            self.cache.hset_all(&cache::instance_files_key(id), fields);
        }

        fn slice_present(&self, key: &str) -> bool {
            self.cache.get(key).is_some() || self.cache.hash_exists(key)
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::open(":memory:").await.unwrap());

        let template = store
            .create_template(&Template {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "proxy".into(),
                description: String::new(),
                content: "{{.Origin}}".into(),
                variables: vec![],
            })
            .await
            .unwrap();

        let cert = store
            .create_cert(&Cert {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "cert".into(),
                domains: vec![],
                provider: None,
                expires_at: None,
                certificate: String::new(),
                private_key: vec![],
                intermediate_certificate: String::new(),
                csr: String::new(),
            })
            .await
            .unwrap();

        let site = store
            .create_site(&Site {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "a".into(),
                origin: "a.test".into(),
                template_id: template.id,
                template_values: vec![],
                cert_id: Some(cert.id),
            })
            .await
            .unwrap();

        let file = store
            .create_additional_file(&AdditionalFile {
                id: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                name: "robots".into(),
                filename: "x.txt".into(),
                content: b"v1".to_vec(),
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
                site_ids: vec![site.id],
            })
            .await
            .unwrap();

        Fixture {
            store,
            cache: Arc::new(CacheStore::new()),
            template_id: template.id,
            cert_id: cert.id,
            site_id: site.id,
            file_id: file.id,
            instance_id: instance.id,
        }
    }

    #[tokio::test]
    async fn test_file_content_change_drops_heartbeat_only() {
        let f = fixture().await;
        f.fill_cache();

        f.invalidator()
            .additional_file_content_changed(f.file_id)
            .await
            .unwrap();

        assert!(!f.slice_present(&cache::instance_heartbeat_key(f.instance_id)));
        assert!(f.slice_present(&cache::instance_config_key(f.instance_id)));
        assert!(f.slice_present(&cache::instance_files_key(f.instance_id)));
    }

    #[tokio::test]
    async fn test_file_rename_moves_files_entry() {
        let f = fixture().await;
        f.fill_cache();

        f.invalidator()
            .additional_file_renamed(f.file_id, "x.txt", "y.txt")
            .await
            .unwrap();

        let files_key = cache::instance_files_key(f.instance_id);
        assert!(!f.slice_present(&cache::instance_heartbeat_key(f.instance_id)));
        assert!(f.cache.hget(&files_key, &paths::additional_file_path("x.txt")).is_none());
        assert!(f.cache.hget(&files_key, &paths::additional_file_path("y.txt")).is_some());
    }

    #[tokio::test]
    async fn test_cert_update_drops_heartbeat_and_maybe_files() {
        let f = fixture().await;
        f.fill_cache();

        f.invalidator().cert_updated(f.cert_id, false).await.unwrap();
        assert!(!f.slice_present(&cache::instance_heartbeat_key(f.instance_id)));
        assert!(f.slice_present(&cache::instance_files_key(f.instance_id)));
        assert!(f.slice_present(&cache::instance_config_key(f.instance_id)));

        f.fill_cache();
        f.invalidator().cert_updated(f.cert_id, true).await.unwrap();
        assert!(!f.slice_present(&cache::instance_files_key(f.instance_id)));
    }

    #[tokio::test]
    async fn test_site_and_template_walks() {
        let f = fixture().await;
        f.fill_cache();

        f.invalidator().site_updated(f.site_id).await.unwrap();
        assert!(!f.slice_present(&cache::instance_config_key(f.instance_id)));
        assert!(!f.slice_present(&cache::instance_heartbeat_key(f.instance_id)));
        assert!(!f.slice_present(&cache::instance_files_key(f.instance_id)));
        // info and lastseen survive site changes
        assert!(f.slice_present(&cache::instance_info_key(f.instance_id)));
        assert!(f.slice_present(&cache::instance_lastseen_key(f.instance_id)));

        f.fill_cache();
        f.invalidator().template_updated(f.template_id).await.unwrap();
        assert!(!f.slice_present(&cache::instance_config_key(f.instance_id)));
        assert!(!f.slice_present(&cache::instance_heartbeat_key(f.instance_id)));
        assert!(f.slice_present(&cache::instance_files_key(f.instance_id)));
    }

    #[tokio::test]
    async fn test_instance_classes() {
        let f = fixture().await;
        f.fill_cache();

        let invalidator = f.invalidator();
        invalidator.instance_updated(f.instance_id);
        assert!(!f.slice_present(&cache::instance_config_key(f.instance_id)));
        assert!(f.slice_present(&cache::instance_info_key(f.instance_id)));

        invalidator.instance_token_rotated(f.instance_id);
        assert!(!f.slice_present(&cache::instance_info_key(f.instance_id)));

        f.fill_cache();
        invalidator.instance_deleted(f.instance_id);
        for key in [
            cache::instance_info_key(f.instance_id),
            cache::instance_config_key(f.instance_id),
            cache::instance_heartbeat_key(f.instance_id),
            cache::instance_files_key(f.instance_id),
            cache::instance_lastseen_key(f.instance_id),
        ] {
            assert!(!f.slice_present(&key));
        }
    }

    #[tokio::test]
    async fn test_unreferenced_mutation_touches_nothing() {
        let f = fixture().await;
        f.fill_cache();

        // an id no instance references walks to an empty set
        f.invalidator()
            .additional_file_content_changed(f.file_id + 100)
            .await
            .unwrap();
        assert!(f.slice_present(&cache::instance_heartbeat_key(f.instance_id)));
    }
}
