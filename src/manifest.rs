//! Heartbeat manifests and the files reverse index.
//!
//! The manifest is the server-authored list of paths an instance must host
//! with per-file freshness stamps, plus the overall config stamp. The files
//! map is the inverse: given a path an agent requests, it resolves back to
//! the source entity. Cert changes move file stamps only; the rendered
//! configuration references cert material by path, so the config stamp
//! tracks instance, site and template updates alone.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::paths;
use crate::store::{Instance, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdateRecord {
    pub path: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatManifest {
    pub config_updated_at: i64,
    #[serde(default)]
    pub files_updated_at: Vec<FileUpdateRecord>,
}

/// Source entity class of a served file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum InstanceFileKind {
    AdditionalFile = 0,
    Cert = 1,
}

/// Which piece of a cert a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CertFileKind {
    Certificate = 0,
    PrivateKey = 1,
    Intermediate = 2,
}

/// Tagged descriptor stored in the files cache slice, keyed by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFileDescriptor {
    #[serde(rename = "type")]
    pub kind: InstanceFileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<CertFileKind>,
    pub id: i64,
}

impl InstanceFileDescriptor {
    pub fn additional_file(id: i64) -> Self {
        Self {
            kind: InstanceFileKind::AdditionalFile,
            subtype: None,
            id,
        }
    }

    pub fn cert(id: i64, subtype: CertFileKind) -> Self {
        Self {
            kind: InstanceFileKind::Cert,
            subtype: Some(subtype),
            id,
        }
    }
}

impl From<InstanceFileKind> for u8 {
    fn from(kind: InstanceFileKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for InstanceFileKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(InstanceFileKind::AdditionalFile),
            1 => Ok(InstanceFileKind::Cert),
            other => Err(format!("unsupported file type {other}")),
        }
    }
}

impl From<CertFileKind> for u8 {
    fn from(kind: CertFileKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for CertFileKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(CertFileKind::Certificate),
            1 => Ok(CertFileKind::PrivateKey),
            2 => Ok(CertFileKind::Intermediate),
            other => Err(format!("unsupported file subtype {other}")),
        }
    }
}

/// Build the heartbeat manifest for an instance from the entity graph.
///
/// A vanished referenced entity aborts the whole build; stale partial
/// results are never produced.
pub async fn build_heartbeat_manifest(
    store: &Store,
    instance: &Instance,
) -> Result<HeartbeatManifest> {
    let mut manifest = HeartbeatManifest {
        // starts at the instance stamp, pushed forward by site and
        // template updates below
        config_updated_at: instance.updated_at.timestamp(),
        files_updated_at: Vec::new(),
    };

    for &file_id in &instance.additional_file_ids {
        let file = store.get_additional_file(file_id).await?;
        manifest.files_updated_at.push(FileUpdateRecord {
            path: paths::additional_file_path(&file.filename),
            updated_at: file.updated_at.timestamp(),
        });
    }

    for &site_id in &instance.site_ids {
        let swr = store.get_site_with_relations(site_id).await?;

        if let Some(cert) = &swr.cert {
            let stamp = cert.updated_at.timestamp();
            manifest.files_updated_at.push(FileUpdateRecord {
                path: paths::cert_leaf_path(cert.id),
                updated_at: stamp,
            });
            manifest.files_updated_at.push(FileUpdateRecord {
                path: paths::cert_key_path(cert.id),
                updated_at: stamp,
            });
            if !cert.intermediate_certificate.is_empty() {
                manifest.files_updated_at.push(FileUpdateRecord {
                    path: paths::cert_intermediate_path(cert.id),
                    updated_at: stamp,
                });
            }
        }

        manifest.config_updated_at = manifest
            .config_updated_at
            .max(swr.site.updated_at.timestamp())
            .max(swr.template.updated_at.timestamp());
    }

    Ok(manifest)
}

/// Build the path → descriptor reverse index for an instance.
pub async fn build_instance_file_map(
    store: &Store,
    instance: &Instance,
) -> Result<HashMap<String, InstanceFileDescriptor>> {
    let mut files = HashMap::new();

    for &file_id in &instance.additional_file_ids {
        let file = store.get_additional_file(file_id).await?;
        files.insert(
            paths::additional_file_path(&file.filename),
            InstanceFileDescriptor::additional_file(file.id),
        );
    }

    for &site_id in &instance.site_ids {
        let swr = store.get_site_with_relations(site_id).await?;
        let Some(cert) = &swr.cert else {
            continue;
        };

        files.insert(
            paths::cert_leaf_path(cert.id),
            InstanceFileDescriptor::cert(cert.id, CertFileKind::Certificate),
        );
        files.insert(
            paths::cert_key_path(cert.id),
            InstanceFileDescriptor::cert(cert.id, CertFileKind::PrivateKey),
        );
        if !cert.intermediate_certificate.is_empty() {
            files.insert(
                paths::cert_intermediate_path(cert.id),
                InstanceFileDescriptor::cert(cert.id, CertFileKind::Intermediate),
            );
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AdditionalFile, Cert, Site, Template};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_descriptor_integer_tags() {
        let descriptor = InstanceFileDescriptor::cert(7, CertFileKind::PrivateKey);
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value, json!({"type": 1, "subtype": 1, "id": 7}));

        let descriptor = InstanceFileDescriptor::additional_file(3);
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value, json!({"type": 0, "id": 3}));
    }

    #[test]
    fn test_descriptor_decode() {
        let descriptor: InstanceFileDescriptor =
            serde_json::from_value(json!({"type": 1, "subtype": 2, "id": 9})).unwrap();
        assert_eq!(descriptor.kind, InstanceFileKind::Cert);
        assert_eq!(descriptor.subtype, Some(CertFileKind::Intermediate));

        assert!(serde_json::from_value::<InstanceFileDescriptor>(json!({"type": 5, "id": 9})).is_err());
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = HeartbeatManifest {
            config_updated_at: 1700000000,
            files_updated_at: vec![FileUpdateRecord {
                path: "/data/cdn/afiles/robots.txt".into(),
                updated_at: 1700000001,
            }],
        };

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            value,
            json!({
                "config_updated_at": 1700000000,
                "files_updated_at": [
                    {"path": "/data/cdn/afiles/robots.txt", "updated_at": 1700000001}
                ]
            })
        );

        // a manifest without the files field still decodes
        let decoded: HeartbeatManifest =
            serde_json::from_value(json!({"config_updated_at": 5})).unwrap();
        assert!(decoded.files_updated_at.is_empty());
    }

    async fn seeded_store() -> (Store, Instance, i64) {
        let store = Store::open(":memory:").await.unwrap();

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
                name: "shared".into(),
                domains: vec!["a.test".into(), "b.test".into()],
                provider: None,
                expires_at: None,
                certificate: "LEAF".into(),
                private_key: vec![1, 2, 3],
                intermediate_certificate: String::new(),
                csr: String::new(),
            })
            .await
            .unwrap();

        // two sites sharing one cert
        let mut site_ids = Vec::new();
        for origin in ["a.test", "b.test"] {
            let site = store
                .create_site(&Site {
                    id: 0,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                    name: origin.into(),
                    origin: origin.into(),
                    template_id: template.id,
                    template_values: vec![],
                    cert_id: Some(cert.id),
                })
                .await
                .unwrap();
            site_ids.push(site.id);
        }

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
                site_ids,
            })
            .await
            .unwrap();

        (store, instance, cert.id)
    }

    #[test]
    fn test_manifest_build_with_shared_cert() {
        tokio_test::block_on(async {
            let (store, instance, cert_id) = seeded_store().await;
            let manifest = build_heartbeat_manifest(&store, &instance).await.unwrap();

            // one afile entry plus leaf and key once per referencing site;
            // duplicate paths are allowed and carry identical stamps here
            assert_eq!(manifest.files_updated_at.len(), 5);
            let leaf = paths::cert_leaf_path(cert_id);
            assert_eq!(
                manifest
                    .files_updated_at
                    .iter()
                    .filter(|f| f.path == leaf)
                    .count(),
                2
            );
            assert!(manifest
                .files_updated_at
                .iter()
                .any(|f| f.path == "/data/cdn/afiles/robots.txt"));
        });
    }

    #[test]
    fn test_file_map_resolves_every_declared_path() {
        tokio_test::block_on(async {
            let (store, instance, cert_id) = seeded_store().await;
            let files = build_instance_file_map(&store, &instance).await.unwrap();

            // the reverse index dedups shared paths
            assert_eq!(files.len(), 3);
            assert_eq!(
                files["/data/cdn/afiles/robots.txt"],
                InstanceFileDescriptor::additional_file(instance.additional_file_ids[0])
            );
            assert_eq!(
                files[&paths::cert_key_path(cert_id)],
                InstanceFileDescriptor::cert(cert_id, CertFileKind::PrivateKey)
            );
            assert!(!files.contains_key(&paths::cert_intermediate_path(cert_id)));
        });
    }

    #[test]
    fn test_vanished_reference_aborts_build() {
        tokio_test::block_on(async {
            let (store, mut instance, _) = seeded_store().await;
            instance.additional_file_ids.push(999);

            assert!(build_heartbeat_manifest(&store, &instance).await.is_err());
            assert!(build_instance_file_map(&store, &instance).await.is_err());
        });
    }
}
