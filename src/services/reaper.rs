//! Background reclamation of expired sessions.
//!
//! Each pass deletes the backend object (or unfinished multipart upload) of
//! every expired session and then drops its records. A session whose cleanup
//! fails keeps its records and is retried on a later pass, behind sessions
//! that have not failed yet.

use crate::providers::ProviderRegistry;
use crate::services::session_repository::{RepositoryResult, SessionRepository};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sessions examined per pass.
const REAP_BATCH: u32 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub examined: usize,
    pub reclaimed: usize,
    pub deferred: usize,
}

#[derive(Clone)]
pub struct ExpiryReaper {
    repo: Arc<dyn SessionRepository>,
    providers: ProviderRegistry,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        providers: ProviderRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            repo,
            providers,
            interval,
        }
    }

    /// One reclamation pass over sessions expired at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RepositoryResult<ReapStats> {
        let expired = self.repo.list_expired(now, REAP_BATCH).await?;
        let mut stats = ReapStats {
            examined: expired.len(),
            ..ReapStats::default()
        };

        for session in expired {
            let session_id = session.session_id;
            let deleted = match self.providers.get(session.provider) {
                Ok(adapter) => adapter.delete_object(&session.provider_key).await,
                Err(err) => Err(err),
            };
            if let Err(err) = deleted {
                warn!(
                    %session_id,
                    provider = %session.provider,
                    error = %err,
                    "backend cleanup failed, retrying next pass"
                );
                self.defer(session_id, &mut stats).await;
                continue;
            }

            if let Err(err) = self.repo.delete_session(session_id).await {
                warn!(%session_id, error = %err, "record cleanup failed, retrying next pass");
                self.defer(session_id, &mut stats).await;
                continue;
            }
            debug!(%session_id, status = %session.status, "reclaimed expired session");
            stats.reclaimed += 1;
        }

        if stats.examined > 0 {
            info!(
                examined = stats.examined,
                reclaimed = stats.reclaimed,
                deferred = stats.deferred,
                "expiry pass finished"
            );
        }
        Ok(stats)
    }

    async fn defer(&self, session_id: Uuid, stats: &mut ReapStats) {
        stats.deferred += 1;
        if let Err(err) = self.repo.defer_reap(session_id).await {
            warn!(%session_id, error = %err, "could not record failed reclaim");
        }
    }

    /// Run passes on a fixed interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            "starting expiry reaper"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.run_once(Utc::now()).await {
                        error!(error = %err, "expiry pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("expiry reaper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::ProviderKind;
    use crate::providers::fake::FakeProvider;
    use crate::services::selector::MigrationPolicy;
    use crate::services::session_repository::testing::memory_repository;
    use crate::services::upload_service::{CreateSessionRequest, SessionSettings, UploadService};

    fn settings(session_ttl: chrono::Duration) -> SessionSettings {
        SessionSettings {
            chunk_size: 4,
            large_file_threshold: 100,
            session_ttl,
            abort_grace: chrono::Duration::hours(1),
            migration: MigrationPolicy::new(10),
        }
    }

    async fn create(service: &UploadService) -> Uuid {
        create_sized(service, 10).await
    }

    async fn create_sized(service: &UploadService, size: i64) -> Uuid {
        service
            .create_session(
                CreateSessionRequest {
                    name: Some("a.bin".into()),
                    mime_type: Some("application/octet-stream".into()),
                    size: Some(size),
                    recipients: Vec::new(),
                },
                "alice",
            )
            .await
            .unwrap()
            .session_id
    }

    #[tokio::test]
    async fn reclaims_aborted_sessions_after_grace() {
        let repo = memory_repository().await;
        let b2 = Arc::new(FakeProvider::new(ProviderKind::B2));
        let providers = ProviderRegistry::new().with(b2.clone());
        let service = UploadService::new(
            Arc::new(repo.clone()),
            providers.clone(),
            settings(chrono::Duration::days(3)),
        );
        let reaper = ExpiryReaper::new(Arc::new(repo.clone()), providers, Duration::from_secs(60));

        let aborted = create(&service).await;
        let live = create(&service).await;
        service.abort_upload(aborted, "alice").await.unwrap();

        let stats = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(stats, ReapStats::default());

        let later = Utc::now() + chrono::Duration::hours(2);
        let stats = reaper.run_once(later).await.unwrap();
        assert_eq!(
            stats,
            ReapStats {
                examined: 1,
                reclaimed: 1,
                deferred: 0
            }
        );
        assert_eq!(b2.deleted().len(), 1);
        assert!(repo.find_session(aborted).await.unwrap().is_none());
        assert!(repo.find_session(live).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn keeps_records_when_backend_is_missing() {
        let repo = memory_repository().await;
        let b2 = Arc::new(FakeProvider::new(ProviderKind::B2));
        let service = UploadService::new(
            Arc::new(repo.clone()),
            ProviderRegistry::new().with(b2),
            settings(chrono::Duration::days(3)),
        );
        let id = create(&service).await;

        let reaper = ExpiryReaper::new(
            Arc::new(repo.clone()),
            ProviderRegistry::new(),
            Duration::from_secs(60),
        );
        let stats = reaper
            .run_once(Utc::now() + chrono::Duration::days(4))
            .await
            .unwrap();
        assert_eq!(stats.deferred, 1);
        assert!(repo.find_session(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_sessions_do_not_starve_newer_ones() {
        let repo = memory_repository().await;
        let b2 = Arc::new(FakeProvider::new(ProviderKind::B2));
        let r2 = Arc::new(FakeProvider::new(ProviderKind::R2));
        let providers = ProviderRegistry::new().with(b2.clone()).with(r2);
        let short = UploadService::new(
            Arc::new(repo.clone()),
            providers.clone(),
            settings(chrono::Duration::days(3)),
        );
        let long = UploadService::new(
            Arc::new(repo.clone()),
            providers,
            settings(chrono::Duration::days(5)),
        );

        for _ in 0..REAP_BATCH {
            create_sized(&short, 200).await;
        }
        let healthy = create(&long).await;

        // R2 is unreachable from the reaper, so every R2 session keeps failing.
        let reaper = ExpiryReaper::new(
            Arc::new(repo.clone()),
            ProviderRegistry::new().with(b2.clone()),
            Duration::from_secs(60),
        );
        let later = Utc::now() + chrono::Duration::days(6);

        let first = reaper.run_once(later).await.unwrap();
        assert_eq!(first.examined, REAP_BATCH as usize);
        assert_eq!(first.deferred, REAP_BATCH as usize);
        assert!(repo.find_session(healthy).await.unwrap().is_some());

        let second = reaper.run_once(later).await.unwrap();
        assert_eq!(second.reclaimed, 1);
        assert!(repo.find_session(healthy).await.unwrap().is_none());
        assert_eq!(b2.deleted().len(), 1);
    }

    #[tokio::test]
    async fn record_delete_failure_defers_without_ending_the_pass() {
        let repo = memory_repository().await;
        let b2 = Arc::new(FakeProvider::new(ProviderKind::B2));
        let providers = ProviderRegistry::new().with(b2.clone());
        let service = UploadService::new(
            Arc::new(repo.clone()),
            providers.clone(),
            settings(chrono::Duration::days(3)),
        );
        let first = create(&service).await;
        let second = create(&service).await;

        sqlx::query(
            "CREATE TRIGGER block_session_delete BEFORE DELETE ON upload_sessions
             BEGIN SELECT RAISE(ABORT, 'locked'); END",
        )
        .execute(&*repo.db)
        .await
        .unwrap();

        let reaper = ExpiryReaper::new(Arc::new(repo.clone()), providers, Duration::from_secs(60));
        let later = Utc::now() + chrono::Duration::days(4);
        let stats = reaper.run_once(later).await.unwrap();
        assert_eq!(
            stats,
            ReapStats {
                examined: 2,
                reclaimed: 0,
                deferred: 2
            }
        );
        assert!(repo.find_session(first).await.unwrap().is_some());

        sqlx::query("DROP TRIGGER block_session_delete")
            .execute(&*repo.db)
            .await
            .unwrap();
        let stats = reaper.run_once(later).await.unwrap();
        assert_eq!(stats.reclaimed, 2);
        assert!(repo.find_session(first).await.unwrap().is_none());
        assert!(repo.find_session(second).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let repo = memory_repository().await;
        let reaper = ExpiryReaper::new(
            Arc::new(repo),
            ProviderRegistry::new(),
            Duration::from_millis(10),
        );
        let (tx, rx) = watch::channel(());
        let handle = tokio::spawn(reaper.run(rx));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
