//! The edge agent's convergence loop.
//!
//! Every tick polls the coordinator's heartbeat, diffs the manifest against
//! on-disk mtimes, fetches and replaces stale files, and pushes the
//! rendered configuration to the local proxy admin socket once the config
//! stamp advances past the last successful apply. A tick that fails
//! part-way leaves the rest of the work to the next tick; one file failing
//! never aborts the others.
//!
//! The applied-stamp is the local clock at apply time, not the server
//! stamp: the agent has no proof the proxy accepted the config until the
//! apply returns 2xx, and echoing the server stamp would skip the retry
//! after a rejection.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use url::Url;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::manifest::{FileUpdateRecord, HeartbeatManifest};
use crate::web::worker::MIME_CADDYFILE;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Agent {
    config: AgentConfig,
    client: reqwest::Client,
    server: Url,
    caddy: Url,
    /// Local unix time of the last apply the proxy acknowledged.
    last_config_update: AtomicI64,
    /// Guards a whole tick; an overlapping tick is dropped, not queued.
    tick_lock: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;

        let server = parse_base_url(&config.server_endpoint)?;
        let caddy = parse_base_url(&config.caddy_endpoint)?;

        Ok(Self {
            config,
            client,
            server,
            caddy,
            last_config_update: AtomicI64::new(0),
            tick_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Run the ticker until the stop signal; an in-flight tick completes.
    pub async fn run(&self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        info!(
            "Starting convergence loop (heartbeat every {}s)",
            self.config.heartbeat_interval
        );

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("heartbeat tick");
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Stopping convergence loop");
                    break;
                }
            }
        }
    }

    /// One poll-diff-apply cycle. Returns false when a prior tick still
    /// holds the guard and this one was skipped.
    pub async fn tick(&self) -> bool {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("previous tick still running, skipping");
            return false;
        };

        let manifest = match self.fetch_heartbeat().await {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(error = %e, "heartbeat request failed");
                return true;
            }
        };

        for record in &manifest.files_updated_at {
            if let Err(e) = self.sync_file(record).await {
                error!(path = %record.path, error = %e, "failed to sync file");
            }
        }

        self.maybe_apply_config(&manifest).await;
        true
    }

    pub fn last_applied_config_stamp(&self) -> i64 {
        self.last_config_update.load(Ordering::SeqCst)
    }

    async fn fetch_heartbeat(&self) -> Result<HeartbeatManifest> {
        let url = self.worker_url("heartbeat")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.instance_token)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;

        response
            .json::<HeartbeatManifest>()
            .await
            .map_err(|e| Error::Internal(format!("failed to decode heartbeat response: {e}")))
    }

    /// Bring one manifest entry up to date. Missing files get their parent
    /// directory chain first; files at least as fresh as the stamp are
    /// left alone.
    async fn sync_file(&self, record: &FileUpdateRecord) -> Result<()> {
        match tokio::fs::metadata(&record.path).await {
            Ok(meta) => {
                let mtime = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if record.updated_at <= mtime {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = Path::new(&record.path).parent() {
                    let mut builder = tokio::fs::DirBuilder::new();
                    builder.recursive(true);
                    #[cfg(unix)]
                    builder.mode(0o755);
                    builder.create(parent).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.fetch_file(record).await
    }

    async fn fetch_file(&self, record: &FileUpdateRecord) -> Result<()> {
        let url = self.worker_url("file")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.instance_token)
            .header("X-File-Path", &record.path)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;

        let body = response.bytes().await.map_err(transport_error)?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o644);
        let mut file = options.open(&record.path).await?;
        file.write_all(&body).await?;

        debug!(path = %record.path, bytes = body.len(), "file updated");
        Ok(())
    }

    /// Apply gate: `apply iff manifest stamp > last applied`. A failed
    /// apply leaves the stamp untouched so the next tick retries.
    async fn maybe_apply_config(&self, manifest: &HeartbeatManifest) {
        if manifest.config_updated_at <= self.last_applied_config_stamp() {
            return;
        }

        match self.apply_config().await {
            Ok(()) => {
                let now = chrono::Utc::now().timestamp();
                self.last_config_update.store(now, Ordering::SeqCst);
                info!("proxy configuration applied");
            }
            Err(e) => {
                error!(error = %e, "failed to apply proxy configuration");
            }
        }
    }

    async fn apply_config(&self) -> Result<()> {
        let url = self.worker_url("config")?;
        let config_body = self
            .client
            .get(url)
            .bearer_auth(&self.config.instance_token)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .bytes()
            .await
            .map_err(transport_error)?;

        let load_url = self
            .caddy
            .join("load")
            .map_err(|e| Error::Internal(format!("invalid caddy load url: {e}")))?;

        self.client
            .post(load_url)
            .header(reqwest::header::CONTENT_TYPE, MIME_CADDYFILE)
            .body(config_body)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;

        Ok(())
    }

    fn worker_url(&self, leaf: &str) -> Result<Url> {
        self.server
            .join(&format!("api/worker/{}/{leaf}", self.config.instance_id))
            .map_err(|e| Error::Internal(format!("invalid worker url: {e}")))
    }
}

/// Parse an endpoint, normalising the path to end with a slash so joins
/// append rather than replace.
fn parse_base_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::Internal(format!("invalid endpoint {endpoint}: {e}")))?;

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::Internal(format!("http request failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalisation() {
        let url = parse_base_url("http://coordinator:1323").unwrap();
        assert_eq!(url.join("api/worker/1/heartbeat").unwrap().path(), "/api/worker/1/heartbeat");

        let url = parse_base_url("http://coordinator:1323/prefix").unwrap();
        assert_eq!(
            url.join("api/worker/1/heartbeat").unwrap().path(),
            "/prefix/api/worker/1/heartbeat"
        );
    }
}
