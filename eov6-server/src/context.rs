//! Application context
//!
//! Every external collaborator (store, blobs, translation, metering, identity)
//! is built once at startup and handed to handlers through axum state.

use std::sync::Arc;

use eov6_core::{
    BlobStore, Eov6Config, Eov6Error, FirebaseIdentityClient, FsBlobStore, GoogleTranslateClient,
    IdentityVerifier, MemoryBlobStore, MemoryStore, MeterBackend, SessionStore, StripeMeterClient,
    Translator, UnavailableIdentity, UnavailableMeter, UnavailableTranslator,
};

#[derive(Clone)]
pub struct AppContext {
    pub config: Eov6Config,
    pub store: Arc<dyn SessionStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub translator: Arc<dyn Translator>,
    pub meter: Arc<dyn MeterBackend>,
    pub identity: Arc<dyn IdentityVerifier>,
}

impl AppContext {
    /// Connect the configured backends. Missing API keys degrade the matching
    /// client to an always-failing stand-in instead of aborting startup.
    pub async fn from_config(config: Eov6Config) -> Result<Self, Eov6Error> {
        let store = eov6_core::store::connect(&config.database).await?;

        let blob_root = config.storage.expanded_root();
        tracing::info!(root = %blob_root, "Blob storage rooted on local filesystem");
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(blob_root));

        let translator: Arc<dyn Translator> = match GoogleTranslateClient::new(config.translate.clone()) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!(error = %e, "Translation disabled");
                Arc::new(UnavailableTranslator::new(e.to_string()))
            }
        };

        let meter: Arc<dyn MeterBackend> = match StripeMeterClient::new(config.billing.clone()) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!(error = %e, "Usage metering disabled; events will be queued for backfill");
                Arc::new(UnavailableMeter::new(e.to_string()))
            }
        };

        let identity: Arc<dyn IdentityVerifier> = match FirebaseIdentityClient::new(&config.auth) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!(error = %e, "ID-token verification disabled; bearer-token routes will refuse requests");
                Arc::new(UnavailableIdentity::new(e.to_string()))
            }
        };

        if config.auth.cron_secret.is_empty() {
            tracing::warn!("CRON_SECRET is not set; job endpoints accept staff tokens only");
        }

        Ok(Self {
            config,
            store,
            blobs,
            translator,
            meter,
            identity,
        })
    }

    /// In-memory store and blobs with the given external clients.
    pub fn in_memory(
        config: Eov6Config,
        translator: Arc<dyn Translator>,
        meter: Arc<dyn MeterBackend>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            translator,
            meter,
            identity,
        }
    }
}
