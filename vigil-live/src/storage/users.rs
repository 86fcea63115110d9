//! User profile records served by the HTTP API.
//!
//! Media fields hold blob references written before the record is committed.
//! Replacing or deleting a profile never unlinks files; the reconciliation
//! sweep collects what is no longer referenced.

use rocksdb::{IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::rocks::{decode_record, encode_record, Database, RepositoryError, CF_USERS};

const USER_SEQUENCE: &str = "user_seq";

/// A stored profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: u64,
    pub name: String,
    pub is_present: bool,
    pub role: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Blob reference of the face photo
    pub photo: Option<String>,
    /// Blob reference of the voice sample
    pub voice: Option<String>,
}

/// Profile contents without an id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewUser {
    pub name: String,
    pub is_present: bool,
    pub role: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub photo: Option<String>,
    pub voice: Option<String>,
}

impl NewUser {
    fn with_id(self, id: u64) -> UserProfile {
        UserProfile {
            id,
            name: self.name,
            is_present: self.is_present,
            role: self.role,
            phone: self.phone,
            email: self.email,
            photo: self.photo,
            voice: self.voice,
        }
    }
}

pub struct UserStore {
    db: Arc<Database>,
    next_id: Mutex<u64>,
}

impl UserStore {
    pub fn new(db: Arc<Database>) -> Result<Self, RepositoryError> {
        let next_id = db.load_sequence(USER_SEQUENCE)?;
        Ok(Self {
            db,
            next_id: Mutex::new(next_id),
        })
    }

    /// All profiles in id order.
    pub fn list(&self) -> Result<Vec<UserProfile>, RepositoryError> {
        let cf = self.db.cf(CF_USERS)?;
        let mut users = Vec::new();
        for item in self.db.db().iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            users.push(decode_record(&value)?);
        }
        Ok(users)
    }

    pub fn get(&self, id: u64) -> Result<UserProfile, RepositoryError> {
        let cf = self.db.cf(CF_USERS)?;
        match self.db.db().get_cf(cf, id.to_be_bytes())? {
            Some(value) => decode_record(&value),
            None => Err(RepositoryError::NotFound(id)),
        }
    }

    pub fn create(&self, user: NewUser) -> Result<UserProfile, RepositoryError> {
        let cf = self.db.cf(CF_USERS)?;
        let mut next_id = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let profile = user.with_id(*next_id);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, profile.id.to_be_bytes(), encode_record(&profile)?);
        self.db.put_sequence(&mut batch, USER_SEQUENCE, profile.id + 1)?;
        self.db.write(batch)?;

        *next_id += 1;
        log::info!("Created user {} ({})", profile.id, profile.name);
        Ok(profile)
    }

    /// Replace every field of an existing profile.
    pub fn update(&self, id: u64, user: NewUser) -> Result<UserProfile, RepositoryError> {
        let cf = self.db.cf(CF_USERS)?;
        let _writer = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        if self.db.db().get_cf(cf, id.to_be_bytes())?.is_none() {
            return Err(RepositoryError::NotFound(id));
        }

        let profile = user.with_id(id);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, id.to_be_bytes(), encode_record(&profile)?);
        self.db.write(batch)?;
        Ok(profile)
    }

    /// Remove a profile, returning what was stored.
    pub fn delete(&self, id: u64) -> Result<UserProfile, RepositoryError> {
        let cf = self.db.cf(CF_USERS)?;
        let _writer = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let existing = self.get(id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, id.to_be_bytes());
        self.db.write(batch)?;
        log::info!("Deleted user {id}");
        Ok(existing)
    }

    pub fn delete_all(&self) -> Result<usize, RepositoryError> {
        let cf = self.db.cf(CF_USERS)?;
        let _writer = self.next_id.lock().unwrap_or_else(|e| e.into_inner());

        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for item in self.db.db().iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, &key);
            removed += 1;
        }
        if removed > 0 {
            self.db.write(batch)?;
        }
        Ok(removed)
    }

    /// Every blob reference held by a profile.
    pub fn media_refs(&self) -> Result<HashSet<String>, RepositoryError> {
        Ok(self
            .list()?
            .into_iter()
            .flat_map(|u| [u.photo, u.voice])
            .flatten()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;

    fn open(dir: &tempfile::TempDir) -> UserStore {
        let db = Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        UserStore::new(Arc::new(db)).unwrap()
    }

    fn user(name: &str) -> NewUser {
        NewUser {
            name: name.to_string(),
            is_present: true,
            ..NewUser::default()
        }
    }

    #[test]
    fn test_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let alice = store.create(user("Alice")).unwrap();
        let bob = store.create(user("Bob")).unwrap();
        assert_eq!((alice.id, bob.id), (1, 2));

        let names: Vec<String> = store.list().unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_update_replaces_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let alice = store.create(user("Alice")).unwrap();

        let updated = store
            .update(
                alice.id,
                NewUser {
                    role: Some("admin".into()),
                    is_present: false,
                    ..user("Alice B")
                },
            )
            .unwrap();
        assert_eq!(updated.id, alice.id);
        assert_eq!(store.get(alice.id).unwrap(), updated);
        assert!(!updated.is_present);

        assert_eq!(store.update(77, user("ghost")), Err(RepositoryError::NotFound(77)));
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let alice = store.create(user("Alice")).unwrap();

        assert_eq!(store.delete(alice.id).unwrap().name, "Alice");
        assert_eq!(store.get(alice.id), Err(RepositoryError::NotFound(alice.id)));
        assert!(store.delete(alice.id).is_err());
    }

    #[test]
    fn test_delete_all_and_media_refs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store
            .create(NewUser {
                photo: Some("/uploads/profiles/a.jpg".into()),
                voice: Some("/uploads/profiles/a.wav".into()),
                ..user("Alice")
            })
            .unwrap();
        store.create(user("Bob")).unwrap();

        let refs = store.media_refs().unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains("/uploads/profiles/a.wav"));

        assert_eq!(store.delete_all().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_profile_json_is_camel_case() {
        let profile = user("Alice").with_id(1);
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["isPresent"], true);
        assert!(json.get("is_present").is_none());
    }
}
