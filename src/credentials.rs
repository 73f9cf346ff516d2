use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Opaque bearer token. Its expiry is only discovered through a 401.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(Arc::from(token.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }

    /// The `sub` claim when the token is a JWT. Never validated locally.
    pub fn subject(&self) -> Option<String> {
        decode_subject(&self.0).ok()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed token: {0}")]
    Malformed(String),
}

fn decode_subject(token: &str) -> Result<String, CredentialError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(CredentialError::Malformed("not a JWT".into()));
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| CredentialError::Malformed(format!("base64 decode error: {e}")))?;

    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| CredentialError::Malformed(format!("invalid JSON payload: {e}")))?;

    payload["sub"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| CredentialError::Malformed("missing 'sub' claim".into()))
}

/// Durable copy of the credential so a restart observes the same session.
pub trait CredentialPersistence: Send + Sync {
    fn load(&self) -> Result<Option<Credential>, CredentialError>;
    fn save(&self, credential: &Credential) -> Result<(), CredentialError>;
    fn clear(&self) -> Result<(), CredentialError>;
}

pub struct FileCredentialPersistence {
    path: PathBuf,
}

impl FileCredentialPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialPersistence for FileCredentialPersistence {
    fn load(&self) -> Result<Option<Credential>, CredentialError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let token = raw.trim();
                Ok((!token.is_empty()).then(|| Credential::new(token)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, credential.as_str())?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryCredentialPersistence {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialPersistence {
    pub fn stored(&self) -> Option<Credential> {
        self.slot.lock().clone()
    }
}

impl CredentialPersistence for MemoryCredentialPersistence {
    fn load(&self) -> Result<Option<Credential>, CredentialError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        *self.slot.lock() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// The single source of truth for "am I authenticated".
///
/// Reads and writes are synchronous and visible to every holder at once.
/// Writes go through to the persistence backend; a failing backend is logged
/// and never blocks the in-memory update.
pub struct CredentialStore {
    current: watch::Sender<Option<Credential>>,
    persistence: Arc<dyn CredentialPersistence>,
}

impl CredentialStore {
    pub fn new(persistence: Arc<dyn CredentialPersistence>) -> Self {
        let initial = match persistence.load() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "failed to load persisted credential");
                None
            }
        };
        let (current, _) = watch::channel(initial);

        Self {
            current,
            persistence,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialPersistence::default()))
    }

    pub fn get(&self) -> Option<Credential> {
        self.current.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.borrow().is_some()
    }

    pub fn set(&self, credential: Credential) {
        if let Err(e) = self.persistence.save(&credential) {
            warn!(error = %e, "failed to persist credential");
        }
        debug!(subject = ?credential.subject(), "credential replaced");
        self.current.send_replace(Some(credential));
    }

    pub fn clear(&self) {
        if let Err(e) = self.persistence.clear() {
            warn!(error = %e, "failed to clear persisted credential");
        }
        debug!("credential cleared");
        self.current.send_replace(None);
    }

    /// Change feed of the current credential, for components that hold a
    /// session bound to it.
    pub fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_write_through() {
        let persistence = Arc::new(MemoryCredentialPersistence::default());
        let store = CredentialStore::new(persistence.clone());
        assert!(store.get().is_none());

        store.set(Credential::new("abc"));
        assert_eq!(store.get(), Some(Credential::new("abc")));
        assert_eq!(persistence.stored(), Some(Credential::new("abc")));

        store.clear();
        assert!(store.get().is_none());
        assert!(persistence.stored().is_none());
    }

    #[test]
    fn file_persistence_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session").join("token");

        let store = CredentialStore::new(Arc::new(FileCredentialPersistence::new(&path)));
        store.set(Credential::new("persisted-token"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "persisted-token");

        let reloaded = CredentialStore::new(Arc::new(FileCredentialPersistence::new(&path)));
        assert_eq!(reloaded.get(), Some(Credential::new("persisted-token")));

        reloaded.clear();
        assert!(!path.exists());
        let empty = CredentialStore::new(Arc::new(FileCredentialPersistence::new(&path)));
        assert!(empty.get().is_none());
    }

    #[test]
    fn watchers_see_replacements() {
        let store = CredentialStore::in_memory();
        let mut rx = store.watch();
        store.set(Credential::new("one"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Some(Credential::new("one")));
    }

    #[test]
    fn subject_is_decoded_from_jwt_payload() {
        // {"sub":"user-42"}
        let token = "eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJ1c2VyLTQyIn0.sig";
        assert_eq!(Credential::new(token).subject().as_deref(), Some("user-42"));
        assert_eq!(Credential::new("opaque").subject(), None);
    }

    #[test]
    fn debug_output_is_redacted() {
        assert_eq!(format!("{:?}", Credential::new("secret")), "Credential(***)");
    }
}
