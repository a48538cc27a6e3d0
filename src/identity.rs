use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const USER_ID_KEY: &str = "hotlabel_user_id";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is not a json object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage unavailable")]
    Unavailable,
}

/// Persistent string store that outlives a page view (the native
/// counterpart of `localStorage`).
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RefCell<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Keeps all keys in one JSON object file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<Map<String, Value>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .load()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.load()?;
        values.insert(key.to_string(), Value::String(value.to_string()));
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&values)?)?;
        Ok(())
    }
}

/// Random id in the `xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx` shape. Not meant
/// to be unguessable, only unlikely to collide.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn generate_session_id() -> String {
    generate_id()
}

pub struct IdentityStore {
    storage: Rc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(storage: Rc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    /// Returns the persisted user id, creating it on first use. Storage
    /// failures degrade to an id that only lives for this page view.
    pub fn get_or_create_user_id(&self) -> String {
        self.resolve_user_id().0
    }

    /// Like [`Self::get_or_create_user_id`], also handing back the storage
    /// failure that forced an ephemeral id.
    pub fn resolve_user_id(&self) -> (String, Option<StorageError>) {
        match self.storage.get(USER_ID_KEY) {
            Ok(Some(existing)) if !existing.is_empty() => return (existing, None),
            Ok(_) => {}
            Err(err) => {
                warn!(?err, "user id storage unreadable; using ephemeral id");
                return (generate_id(), Some(err));
            }
        }
        let user_id = generate_id();
        match self.storage.set(USER_ID_KEY, &user_id) {
            Ok(()) => {
                debug!(%user_id, "created user id");
                (user_id, None)
            }
            Err(err) => {
                warn!(?err, "failed to persist user id; using ephemeral id");
                (user_id, Some(err))
            }
        }
    }
}
