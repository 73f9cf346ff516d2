use std::sync::Arc;

pub mod api;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod generation;
pub mod optimistic;
pub mod query;
pub mod realtime;
pub mod refresh;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod vote;

use crate::api::FeedApi;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::credentials::{
    CredentialPersistence, CredentialStore, FileCredentialPersistence, MemoryCredentialPersistence,
};
use crate::error::ApiError;
use crate::realtime::{RealtimeChannel, RealtimeSettings};
use crate::session::SessionSignal;
use crate::transport::{HttpBackend, ReqwestBackend, TransportClient, TransportSettings};

/// Every client-side service, wired once per process.
pub struct FeedClient {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub session: Arc<SessionSignal>,
    pub transport: TransportClient,
    pub cache: CacheStore,
    pub api: FeedApi,
}

impl FeedClient {
    pub fn initialize(config: Config) -> anyhow::Result<Self> {
        let persistence: Arc<dyn CredentialPersistence> = match &config.credential_path {
            Some(path) => Arc::new(FileCredentialPersistence::new(path)),
            None => Arc::new(MemoryCredentialPersistence::default()),
        };
        let backend = Arc::new(ReqwestBackend::new(&config)?);
        Ok(Self::with_parts(config, persistence, backend))
    }

    /// Wires the services over caller-supplied persistence and HTTP backend.
    pub fn with_parts(
        config: Config,
        persistence: Arc<dyn CredentialPersistence>,
        backend: Arc<dyn HttpBackend>,
    ) -> Self {
        let credentials = Arc::new(CredentialStore::new(persistence));
        // A persisted credential resumes the session it belonged to.
        let session = Arc::new(SessionSignal::new(credentials.is_authenticated()));
        let transport = TransportClient::new(
            backend,
            credentials.clone(),
            session.clone(),
            TransportSettings::from_config(&config),
        );
        let cache = CacheStore::new(config.query_stale_after());
        let api = FeedApi::new(transport.clone(), cache.clone());

        Self {
            config,
            credentials,
            session,
            transport,
            cache,
            api,
        }
    }

    /// Opens the realtime channel for the current credential.
    pub fn realtime(&self) -> Result<RealtimeChannel, ApiError> {
        RealtimeChannel::connect(RealtimeSettings::from_config(&self.config), &self.credentials)
    }
}
