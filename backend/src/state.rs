use crate::auth::AuthManager;
use crate::cluster::ClusterRegistry;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::security::RateLimiter;
use crate::store::FleetDataStore;
use std::sync::{Arc, RwLock};

/// Shared, cloneable application state injected into every handler via
/// axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<FleetDataStore>,
    pub credentials: Arc<CredentialStore>,
    pub auth: Arc<AuthManager>,
    pub cluster: Arc<ClusterRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub encryption_key: Arc<EncryptionKeyCell>,
    pub use_ssl: bool,
}

/// The envelope key currently in effect, separate from `config` so it can
/// change at runtime (generate/regenerate/rotate) without requiring a
/// restart. `Config` itself stays the on-disk/startup snapshot.
#[derive(Default)]
pub struct EncryptionKeyCell(RwLock<Option<String>>);

impl EncryptionKeyCell {
    pub fn new(initial: Option<String>) -> Self {
        Self(RwLock::new(initial))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap().clone()
    }

    pub fn set(&self, key: Option<String>) {
        *self.0.write().unwrap() = key;
    }
}
