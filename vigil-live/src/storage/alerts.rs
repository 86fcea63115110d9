//! Append-only alert history.
//!
//! Key format in `alerts`: `<timestamp:8 bytes, sign-flipped BE><id:8 bytes BE>`.
//! Big-endian with the sign bit flipped sorts like the signed timestamp, so
//! iterating from the end yields newest timestamp first and, within one
//! timestamp, the highest id first.

use rocksdb::{IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::rocks::{
    decode_record, encode_record, Database, RepositoryError, CF_ALERTS, CF_ALERT_IDS,
};
use crate::protocol::{render_objects, AlertKind};

const ALERT_SEQUENCE: &str = "alert_seq";

/// A persisted alert. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    /// Producer-supplied, seconds since epoch
    pub timestamp: i64,
    pub kind: AlertKind,
    pub objects: Vec<String>,
    pub message: Option<String>,
    /// Public blob reference (`/uploads/alerts/...`)
    #[serde(rename = "image")]
    pub image_ref: Option<String>,
}

impl Alert {
    /// Rendered detection list ("Unknown Object" when empty).
    pub fn label(&self) -> String {
        render_objects(&self.objects)
    }
}

/// An alert before an id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub timestamp: i64,
    pub kind: AlertKind,
    pub objects: Vec<String>,
    pub message: Option<String>,
    pub image_ref: Option<String>,
}

/// Durable, reverse-chronological alert store.
///
/// Appends are serialized through one lock (there is a single ingestion
/// writer); reads go straight to RocksDB and never block on it.
pub struct AlertRepository {
    db: Arc<Database>,
    next_id: Mutex<u64>,
}

impl AlertRepository {
    /// Open the repository, recovering the id sequence.
    pub fn new(db: Arc<Database>) -> Result<Self, RepositoryError> {
        let next_id = db.load_sequence(ALERT_SEQUENCE)?;
        log::debug!("Alert repository ready, next id {next_id}");
        Ok(Self {
            db,
            next_id: Mutex::new(next_id),
        })
    }

    fn key(timestamp: i64, id: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&((timestamp as u64) ^ (1 << 63)).to_be_bytes());
        key[8..].copy_from_slice(&id.to_be_bytes());
        key
    }

    /// Persist an alert and return it with its assigned id.
    pub fn append(&self, alert: NewAlert) -> Result<Alert, RepositoryError> {
        let cf_alerts = self.db.cf(CF_ALERTS)?;
        let cf_ids = self.db.cf(CF_ALERT_IDS)?;

        let mut next_id = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let record = Alert {
            id: *next_id,
            timestamp: alert.timestamp,
            kind: alert.kind,
            objects: alert.objects,
            message: alert.message,
            image_ref: alert.image_ref,
        };

        let key = Self::key(record.timestamp, record.id);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_alerts, key, encode_record(&record)?);
        batch.put_cf(cf_ids, record.id.to_be_bytes(), key);
        self.db.put_sequence(&mut batch, ALERT_SEQUENCE, record.id + 1)?;
        self.db.write(batch)?;

        // Only consumed once the record is durable
        *next_id += 1;
        Ok(record)
    }

    /// Alerts newest first (timestamp, then id). `None` returns all of them.
    pub fn list_recent(&self, limit: Option<usize>) -> Result<Vec<Alert>, RepositoryError> {
        let cf = self.db.cf(CF_ALERTS)?;
        let limit = limit.unwrap_or(usize::MAX);
        let mut alerts = Vec::new();

        for item in self.db.db().iterator_cf(cf, IteratorMode::End) {
            if alerts.len() >= limit {
                break;
            }
            let (_, value) = item?;
            alerts.push(decode_record(&value)?);
        }
        Ok(alerts)
    }

    /// Fetch one alert by id.
    pub fn get(&self, id: u64) -> Result<Alert, RepositoryError> {
        let cf_ids = self.db.cf(CF_ALERT_IDS)?;
        let cf_alerts = self.db.cf(CF_ALERTS)?;
        let key = self
            .db
            .db()
            .get_cf(cf_ids, id.to_be_bytes())?
            .ok_or(RepositoryError::NotFound(id))?;
        match self.db.db().get_cf(cf_alerts, &key)? {
            Some(value) => decode_record(&value),
            None => Err(RepositoryError::NotFound(id)),
        }
    }

    /// Number of stored alerts.
    pub fn count(&self) -> Result<usize, RepositoryError> {
        let cf = self.db.cf(CF_ALERT_IDS)?;
        let mut count = 0;
        for item in self.db.db().iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Every blob reference held by an alert.
    pub fn image_refs(&self) -> Result<HashSet<String>, RepositoryError> {
        let cf = self.db.cf(CF_ALERTS)?;
        let mut refs = HashSet::new();
        for item in self.db.db().iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let alert: Alert = decode_record(&value)?;
            if let Some(image) = alert.image_ref {
                refs.insert(image);
            }
        }
        Ok(refs)
    }

    /// Administrative bulk delete. Ids keep counting from where they were.
    pub fn purge(&self) -> Result<usize, RepositoryError> {
        let cf_alerts = self.db.cf(CF_ALERTS)?;
        let cf_ids = self.db.cf(CF_ALERT_IDS)?;
        let _writer = self.next_id.lock().unwrap_or_else(|e| e.into_inner());

        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for item in self.db.db().iterator_cf(cf_ids, IteratorMode::Start) {
            let (id, key) = item?;
            batch.delete_cf(cf_ids, &id);
            batch.delete_cf(cf_alerts, &key);
            removed += 1;
        }
        if removed > 0 {
            self.db.write(batch)?;
            log::info!("Purged {removed} alerts");
        }
        Ok(removed)
    }
}
