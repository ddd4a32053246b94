use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use cloak_client_core::auth::{UserRecord, UserRecordStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const STORE_SCHEMA_VERSION: u32 = 1;
const STORE_FILE_NAME: &str = "cloak-desktop-store.v1.json";

pub const USER_KEY: &str = "cloakvpn_user";
pub const LINKED_ACCOUNT_KEY: &str = "cloakvpn_telegram_id";
pub const PENDING_AUTH_KEY: &str = "cloakvpn_app_auth";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store_mkdir_failed:{message}")]
    CreateDir { message: String },
    #[error("store_encode_failed:{message}")]
    Encode { message: String },
    #[error("store_write_failed:{message}")]
    Write { message: String },
    #[error("store_entry_corrupt:{key}:{message}")]
    Corrupt { key: &'static str, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    entries: BTreeMap<String, Value>,
}

/// Key/value JSON file backing the signed-in user, the linked account id and
/// a link that was still waiting when the app last exited. Clones share the
/// same document.
#[derive(Debug, Clone)]
pub struct DesktopStore {
    path: Arc<PathBuf>,
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl DesktopStore {
    pub fn load_default() -> Self {
        Self::load(default_store_path())
    }

    /// Opens `path`. A missing, unreadable or foreign-version file yields an
    /// empty store.
    pub fn load(path: PathBuf) -> Self {
        let entries = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<StoreDocument>(&raw).ok())
            .filter(|document| document.version == STORE_SCHEMA_VERSION)
            .map(|document| document.entries)
            .unwrap_or_default();
        Self {
            path: Arc::new(path),
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn linked_account_id(&self) -> Option<i64> {
        self.entries().get(LINKED_ACCOUNT_KEY).and_then(Value::as_i64)
    }

    pub fn persist_pending_auth(&self, raw_data: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.insert(
                PENDING_AUTH_KEY.to_string(),
                Value::String(raw_data.to_string()),
            );
        })
    }

    /// Returns and removes the link persisted at the previous shutdown.
    pub fn take_pending_auth(&self) -> Result<Option<String>, StoreError> {
        if !self.entries().contains_key(PENDING_AUTH_KEY) {
            return Ok(None);
        }
        let value = self.update(|entries| entries.remove(PENDING_AUTH_KEY))?;
        Ok(value.as_ref().and_then(Value::as_str).map(str::to_string))
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `edit` to a copy of the entries and keeps it only once the
    /// copy is on disk. A failed write leaves memory and disk unchanged.
    fn update<T>(
        &self,
        edit: impl FnOnce(&mut BTreeMap<String, Value>) -> T,
    ) -> Result<T, StoreError> {
        let mut entries = self.entries();
        let mut next = entries.clone();
        let outcome = edit(&mut next);
        self.flush(&next)?;
        *entries = next;
        Ok(outcome)
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|error| StoreError::CreateDir {
                message: error.to_string(),
            })?;
        }
        let encoded = serde_json::to_string_pretty(&StoreDocument {
            version: STORE_SCHEMA_VERSION,
            updated_at: Some(Utc::now().to_rfc3339()),
            entries: entries.clone(),
        })
        .map_err(|error| StoreError::Encode {
            message: error.to_string(),
        })?;
        fs::write(self.path.as_path(), encoded).map_err(|error| StoreError::Write {
            message: error.to_string(),
        })
    }
}

impl UserRecordStore for DesktopStore {
    type Error = StoreError;

    fn load_user(&self) -> Result<Option<UserRecord>, StoreError> {
        let entries = self.entries();
        let Some(value) = entries.get(USER_KEY) else {
            return Ok(None);
        };
        serde_json::from_value::<UserRecord>(value.clone())
            .map(Some)
            .map_err(|error| StoreError::Corrupt {
                key: USER_KEY,
                message: error.to_string(),
            })
    }

    fn persist_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let encoded = serde_json::to_value(user).map_err(|error| StoreError::Encode {
            message: error.to_string(),
        })?;
        self.update(|entries| {
            entries.insert(USER_KEY.to_string(), encoded);
            match user.linked_account_id {
                Some(linked_account_id) => {
                    entries.insert(LINKED_ACCOUNT_KEY.to_string(), Value::from(linked_account_id));
                }
                None => {
                    entries.remove(LINKED_ACCOUNT_KEY);
                }
            }
        })
    }

    fn clear_user(&self) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.remove(USER_KEY);
            entries.remove(LINKED_ACCOUNT_KEY);
        })
    }
}

fn default_store_path() -> PathBuf {
    app_data_dir().join(STORE_FILE_NAME)
}

/// Per-user directory holding the store and the instance key.
pub fn app_data_dir() -> PathBuf {
    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push("cloak-vpn");
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".cloak-vpn");
        return home_dir;
    }

    PathBuf::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_client_core::auth::{Subscription, SubscriptionPlan};

    fn user(id: &str, linked_account_id: Option<i64>) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
            subscription: Subscription {
                plan: SubscriptionPlan::Premium,
                expires_at: None,
                is_active: true,
            },
            created_at: "2024-01-01T00:00:00Z".to_string(),
            linked_account_id,
            linked_username: None,
        }
    }

    #[test]
    fn user_record_persists_across_reload() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(STORE_FILE_NAME);
        let store = DesktopStore::load(path.clone());
        store.persist_user(&user("user-1", Some(42))).expect("persist");

        let reloaded = DesktopStore::load(path);
        assert_eq!(
            reloaded.load_user().expect("load"),
            Some(user("user-1", Some(42)))
        );
        assert_eq!(reloaded.linked_account_id(), Some(42));
    }

    #[test]
    fn repeated_persist_keeps_a_single_record() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(STORE_FILE_NAME);
        let store = DesktopStore::load(path.clone());
        store.persist_user(&user("user-1", Some(42))).expect("first");
        store.persist_user(&user("user-2", None)).expect("second");

        let raw = std::fs::read_to_string(&path).expect("read store");
        let document: Value = serde_json::from_str(&raw).expect("store json");
        let entries = document["entries"].as_object().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[USER_KEY]["id"], "user-2");
        assert_eq!(store.linked_account_id(), None);
    }

    #[test]
    fn clear_removes_user_and_linked_account() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = DesktopStore::load(temp.path().join(STORE_FILE_NAME));
        store.persist_user(&user("user-1", Some(42))).expect("persist");
        store.clear_user().expect("clear");
        assert_eq!(store.load_user().expect("load"), None);
        assert_eq!(store.linked_account_id(), None);
    }

    #[test]
    fn failed_write_keeps_user_out_of_memory_and_later_writes() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(STORE_FILE_NAME);
        std::fs::create_dir(&path).expect("block store path");
        let store = DesktopStore::load(path.clone());

        assert!(matches!(
            store.persist_user(&user("ghost", Some(9))),
            Err(StoreError::Write { .. })
        ));
        assert_eq!(store.load_user().expect("load"), None);
        assert_eq!(store.linked_account_id(), None);

        std::fs::remove_dir(&path).expect("unblock store path");
        store.persist_pending_auth("%7B%7D").expect("persist pending");
        let reloaded = DesktopStore::load(path);
        assert_eq!(reloaded.load_user().expect("load"), None);
        assert_eq!(reloaded.linked_account_id(), None);
    }

    #[test]
    fn failed_clear_keeps_saved_user() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(STORE_FILE_NAME);
        let store = DesktopStore::load(path.clone());
        store.persist_user(&user("user-1", Some(42))).expect("persist");

        std::fs::remove_file(&path).expect("remove store file");
        std::fs::create_dir(&path).expect("block store path");
        assert!(store.clear_user().is_err());
        assert_eq!(
            store.load_user().expect("load").map(|user| user.id),
            Some("user-1".to_string())
        );
    }

    #[test]
    fn corrupt_file_recovers_as_empty() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(STORE_FILE_NAME);
        std::fs::write(&path, "not json").expect("write corrupt file");
        let store = DesktopStore::load(path);
        assert_eq!(store.load_user().expect("load"), None);
    }

    #[test]
    fn malformed_user_entry_is_reported() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join(STORE_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"version":1,"entries":{"cloakvpn_user":{"id":7}}}"#,
        )
        .expect("write store");
        let store = DesktopStore::load(path);
        assert!(matches!(
            store.load_user(),
            Err(StoreError::Corrupt { key: USER_KEY, .. })
        ));
    }

    #[test]
    fn pending_auth_is_taken_once() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("nested").join(STORE_FILE_NAME);
        let store = DesktopStore::load(path.clone());
        store.persist_pending_auth("%7B%7D").expect("persist pending");

        let reloaded = DesktopStore::load(path.clone());
        assert_eq!(
            reloaded.take_pending_auth().expect("take"),
            Some("%7B%7D".to_string())
        );
        assert_eq!(reloaded.take_pending_auth().expect("take again"), None);
        assert_eq!(
            DesktopStore::load(path).take_pending_auth().expect("after reload"),
            None
        );
    }
}
