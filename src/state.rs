use std::sync::Arc;

use crate::auth::Jwt;
use crate::cache::CacheStore;
use crate::config::ServerConfig;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::invalidate::Invalidator;
use crate::store::Store;

/// Shared coordinator state handed to every request handler.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub cache: Arc<CacheStore>,
    pub crypto: Crypto,
    pub jwt: Jwt,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Store,
    ) -> Result<(Arc<Self>, tokio::sync::broadcast::Receiver<()>)> {
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(16);

        let crypto = Crypto::new(config.encrypt_secret_key.as_bytes())?;
        let jwt = Jwt::new(&config.signature_secret_key)?;

        let state = Arc::new(Self {
            config,
            store: Arc::new(store),
            cache: Arc::new(CacheStore::new()),
            crypto,
            jwt,
            shutdown_tx,
        });

        Ok((state, shutdown_rx))
    }

    pub fn invalidator(&self) -> Invalidator {
        Invalidator::new(self.store.clone(), self.cache.clone())
    }

    pub async fn shutdown(&self) {
        tracing::info!("Initiating coordinator shutdown");
        let _ = self.shutdown_tx.send(());
    }
}
