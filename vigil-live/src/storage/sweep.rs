//! Orphan blob reconciliation.
//!
//! Blobs are written before the record that references them, so a crash or
//! a failed append can leave a file nobody points at. Profile edits leave the
//! replaced media behind too. The sweep removes unreferenced files once they
//! are older than the grace period; younger ones may still be waiting for
//! their record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

use super::alerts::AlertRepository;
use super::blob::{BlobStore, StorageError};
use super::rocks::RepositoryError;
use super::users::UserStore;

/// Sweep failures. Each run is independent; the loop keeps going.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    /// Unreferenced but inside the grace period
    pub kept_recent: usize,
}

pub struct Reconciler {
    alerts: Arc<AlertRepository>,
    users: Arc<UserStore>,
    stores: Vec<BlobStore>,
    grace: Duration,
}

impl Reconciler {
    pub fn new(
        alerts: Arc<AlertRepository>,
        users: Arc<UserStore>,
        stores: Vec<BlobStore>,
        grace: Duration,
    ) -> Self {
        Self {
            alerts,
            users,
            stores,
            grace,
        }
    }

    /// One pass over every blob area.
    pub async fn run_once(&self) -> Result<SweepReport, SweepError> {
        // Snapshot references before listing files, so a blob that gets
        // referenced mid-pass is at worst judged by its age.
        let mut referenced: HashSet<String> = self.alerts.image_refs()?;
        referenced.extend(self.users.media_refs()?);

        let now = SystemTime::now();
        let mut report = SweepReport::default();

        for store in &self.stores {
            for entry in store.list().await? {
                report.scanned += 1;
                if !entry.temporary && referenced.contains(&entry.reference) {
                    continue;
                }
                let age = now.duration_since(entry.modified).unwrap_or_default();
                if age < self.grace {
                    report.kept_recent += 1;
                    continue;
                }
                match tokio::fs::remove_file(&entry.path).await {
                    Ok(()) => report.removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        log::warn!("Failed to remove orphan {}: {}", entry.path.display(), e)
                    }
                }
            }
        }

        if report.removed > 0 {
            log::info!(
                "Sweep removed {} orphaned blobs ({} scanned, {} recent kept)",
                report.removed,
                report.scanned,
                report.kept_recent
            );
        } else {
            log::debug!("Sweep found nothing to remove ({} scanned)", report.scanned);
        }
        Ok(report)
    }

    /// Repeat `run_once` every `every` until shutdown.
    pub async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        log::error!("Blob sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("Blob sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AlertKind;
    use crate::storage::{BlobArea, Database, NewAlert, NewUser, StoreConfig};

    struct Fixture {
        _dir: tempfile::TempDir,
        alerts: Arc<AlertRepository>,
        users: Arc<UserStore>,
        alert_blobs: BlobStore,
        profile_blobs: BlobStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let uploads = dir.path().join("uploads");
        Fixture {
            alerts: Arc::new(AlertRepository::new(db.clone()).unwrap()),
            users: Arc::new(UserStore::new(db).unwrap()),
            alert_blobs: BlobStore::new(&uploads, "/uploads", BlobArea::Alerts),
            profile_blobs: BlobStore::new(&uploads, "/uploads", BlobArea::Profiles),
            _dir: dir,
        }
    }

    impl Fixture {
        fn reconciler(&self, grace: Duration) -> Reconciler {
            Reconciler::new(
                self.alerts.clone(),
                self.users.clone(),
                vec![self.alert_blobs.clone(), self.profile_blobs.clone()],
                grace,
            )
        }
    }

    #[tokio::test]
    async fn test_removes_only_unreferenced() {
        let f = fixture();
        let kept = f.alert_blobs.save(b"kept", "jpg").await.unwrap();
        let orphan = f.alert_blobs.save(b"orphan", "jpg").await.unwrap();
        let photo = f.profile_blobs.save(b"face", "jpg").await.unwrap();

        f.alerts
            .append(NewAlert {
                timestamp: 1,
                kind: AlertKind::Face,
                objects: vec![],
                message: None,
                image_ref: Some(kept.clone()),
            })
            .unwrap();
        f.users
            .create(NewUser {
                name: "Alice".into(),
                photo: Some(photo.clone()),
                ..NewUser::default()
            })
            .unwrap();

        let report = f.reconciler(Duration::ZERO).run_once().await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.removed, 1);
        assert!(f.alert_blobs.exists(&kept).await);
        assert!(f.profile_blobs.exists(&photo).await);
        assert!(!f.alert_blobs.exists(&orphan).await);
    }

    #[tokio::test]
    async fn test_grace_period_keeps_fresh_orphans() {
        let f = fixture();
        let orphan = f.alert_blobs.save(b"pending", "jpg").await.unwrap();

        let report = f.reconciler(Duration::from_secs(3600)).run_once().await.unwrap();
        assert_eq!(report.kept_recent, 1);
        assert_eq!(report.removed, 0);
        assert!(f.alert_blobs.exists(&orphan).await);
    }

    #[tokio::test]
    async fn test_stale_temp_files_removed() {
        let f = fixture();
        std::fs::create_dir_all(f.alert_blobs.dir()).unwrap();
        std::fs::write(f.alert_blobs.dir().join("1-deadbeef.jpg.tmp"), b"partial").unwrap();

        let report = f.reconciler(Duration::ZERO).run_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(f.alert_blobs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(f.reconciler(Duration::ZERO).run(Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("sweep did not stop")
            .unwrap();
    }
}
