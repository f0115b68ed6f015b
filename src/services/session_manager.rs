use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::IntakeConfig;
use crate::error::{IntakeError, QuotaKind};
use crate::models::{
    LimitOverrides, SessionCreated, SessionId, SessionLimits, SessionState, UploadSession,
};
use crate::services::authorizer::CollectionAuthorizer;
use crate::services::storage::BlobStore;

/// Owns every upload session and is the only place their state changes.
pub struct SessionManager {
    sessions: DashMap<SessionId, UploadSession>,
    tokens: DashMap<SessionId, CancellationToken>,
    authorizer: Arc<dyn CollectionAuthorizer>,
    blobs: Arc<dyn BlobStore>,
    config: IntakeConfig,
}

impl SessionManager {
    pub fn new(
        config: IntakeConfig,
        authorizer: Arc<dyn CollectionAuthorizer>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            authorizer,
            blobs,
            config,
        }
    }

    fn resolve_limits(&self, overrides: LimitOverrides) -> SessionLimits {
        SessionLimits {
            max_bytes: overrides
                .max_bytes
                .unwrap_or(self.config.max_session_bytes)
                .min(self.config.max_session_bytes),
            max_files: overrides
                .max_files
                .unwrap_or(self.config.max_session_files)
                .min(self.config.max_session_files),
            idle_ttl_secs: overrides
                .idle_ttl_secs
                .unwrap_or(self.config.session_idle_ttl_secs)
                .clamp(1, self.config.session_idle_ttl_secs.max(1)),
        }
    }

    pub async fn create_session(
        &self,
        owner_id: &str,
        collection_ref: &str,
        overrides: LimitOverrides,
    ) -> Result<SessionCreated, IntakeError> {
        let owner_id = owner_id.trim();
        let collection_ref = collection_ref.trim();
        if owner_id.is_empty() || collection_ref.is_empty() {
            return Err(IntakeError::InvalidRequest(
                "owner_id and collection_ref are required".to_string(),
            ));
        }

        if !self.authorizer.can_write(owner_id, collection_ref).await? {
            tracing::warn!(
                "Owner {} denied write access to collection {}",
                owner_id,
                collection_ref
            );
            return Err(IntakeError::Unauthorized {
                owner_id: owner_id.to_string(),
                collection_ref: collection_ref.to_string(),
            });
        }

        // Fail fast instead of after the client has pushed gigabytes
        if let Err(e) = self.blobs.health_check().await {
            tracing::error!("❌ Blob store health check failed: {:?}", e);
            return Err(IntakeError::StorageUnavailable(e.to_string()));
        }

        let now = Utc::now();
        let limits = self.resolve_limits(overrides);
        let mut session = UploadSession {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            collection_ref: collection_ref.to_string(),
            state: SessionState::Created,
            limits,
            created_at: now,
            last_activity_at: now,
            expires_at: now,
            accepted_bytes: 0,
            admitted_files: 0,
            file_ids: Vec::new(),
            finalized_at: None,
            purged: false,
        };
        session.touch(now);

        let created = SessionCreated {
            session_id: session.id,
            recommended_chunk_size: self.config.chunk_size,
            expires_at: session.expires_at,
            limits,
        };
        self.tokens.insert(session.id, CancellationToken::new());
        self.sessions.insert(session.id, session);

        tracing::info!(
            "📂 Session {} created for owner {} in collection {}",
            created.session_id,
            owner_id,
            collection_ref
        );
        Ok(created)
    }

    pub fn snapshot(&self, session_id: SessionId) -> Result<UploadSession, IntakeError> {
        self.sessions
            .get(&session_id)
            .map(|s| s.value().clone())
            .ok_or(IntakeError::SessionNotFound(session_id))
    }

    pub fn cancellation_token(&self, session_id: SessionId) -> Option<CancellationToken> {
        self.tokens.get(&session_id).map(|t| t.value().clone())
    }

    fn expire(&self, session: &mut UploadSession, now: DateTime<Utc>) {
        session.state = SessionState::Expired;
        session.finalized_at = Some(now);
        if let Some(token) = self.tokens.get(&session.id) {
            token.cancel();
        }
        tracing::info!("⌛ Session {} expired", session.id);
    }

    fn check_accepting(
        &self,
        session: &mut UploadSession,
        now: DateTime<Utc>,
    ) -> Result<(), IntakeError> {
        if session.is_idle_expired(now) {
            self.expire(session, now);
        }
        match session.state {
            SessionState::Created | SessionState::Active => Ok(()),
            SessionState::Expired => Err(IntakeError::SessionExpired(session.id)),
            state => Err(IntakeError::SessionClosed {
                session_id: session.id,
                state,
            }),
        }
    }

    /// Errors unless the session can still take chunks. Expires it lazily.
    pub fn ensure_accepting(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<(), IntakeError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        self.check_accepting(&mut session, now)
    }

    /// Expires the session if it has been idle too long. Returns true if it did.
    pub fn expire_if_idle(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<bool, IntakeError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        if session.is_idle_expired(now) {
            self.expire(&mut session, now);
            return Ok(true);
        }
        Ok(false)
    }

    /// Errors only when the session is gone for good (expired or cancelled).
    pub fn ensure_not_abandoned(&self, session_id: SessionId) -> Result<(), IntakeError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        match session.state {
            SessionState::Expired => Err(IntakeError::SessionExpired(session_id)),
            SessionState::Cancelled => Err(IntakeError::SessionClosed {
                session_id,
                state: SessionState::Cancelled,
            }),
            _ => Ok(()),
        }
    }

    /// Counts a new file against the file quota and reserves `reserve_bytes`
    /// against the byte quota in one step. A refused file is still recorded
    /// in the session's file list but consumes nothing.
    pub fn admit_file(
        &self,
        session_id: SessionId,
        file_id: &str,
        reserve_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IntakeError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        self.check_accepting(&mut session, now)?;

        if !session.file_ids.iter().any(|f| f == file_id) {
            session.file_ids.push(file_id.to_string());
        }

        if session.admitted_files >= session.limits.max_files {
            tracing::warn!(
                "🚫 Session {} file quota reached, refusing {}",
                session_id,
                file_id
            );
            return Err(IntakeError::QuotaExceeded {
                file_id: file_id.to_string(),
                kind: QuotaKind::Files,
                limit: session.limits.max_files as u64,
                requested: session.admitted_files as u64 + 1,
            });
        }

        let requested = session.accepted_bytes.saturating_add(reserve_bytes);
        if requested > session.limits.max_bytes {
            tracing::warn!(
                "🚫 Session {} byte quota exceeded by {}",
                session_id,
                file_id
            );
            return Err(IntakeError::QuotaExceeded {
                file_id: file_id.to_string(),
                kind: QuotaKind::Bytes,
                limit: session.limits.max_bytes,
                requested,
            });
        }

        session.admitted_files += 1;
        session.accepted_bytes = requested;
        if session.state == SessionState::Created {
            session.state = SessionState::Active;
        }
        session.touch(now);
        Ok(())
    }

    /// Adds `bytes` to the session's accepted total if the quota allows it.
    pub fn charge_bytes(
        &self,
        session_id: SessionId,
        file_id: &str,
        bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IntakeError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        self.check_accepting(&mut session, now)?;

        let requested = session.accepted_bytes.saturating_add(bytes);
        if requested > session.limits.max_bytes {
            tracing::warn!(
                "🚫 Session {} byte quota exceeded by {}",
                session_id,
                file_id
            );
            return Err(IntakeError::QuotaExceeded {
                file_id: file_id.to_string(),
                kind: QuotaKind::Bytes,
                limit: session.limits.max_bytes,
                requested,
            });
        }
        session.accepted_bytes = requested;
        session.touch(now);
        Ok(())
    }

    pub fn touch(&self, session_id: SessionId, now: DateTime<Utc>) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if session.state.accepts_chunks() {
                session.touch(now);
            }
        }
    }

    /// Moves the session to `Finalizing` and returns its file ids. A session
    /// already finalizing is handed back as is, so an interrupted or retried
    /// finalize can pick the work up again.
    pub fn begin_finalize(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, IntakeError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        if session.state == SessionState::Finalizing {
            return Ok(session.file_ids.clone());
        }
        self.check_accepting(&mut session, now)?;
        session.state = SessionState::Finalizing;
        session.last_activity_at = now;
        Ok(session.file_ids.clone())
    }

    /// Records the outcome of finalize. A session cancelled meanwhile stays cancelled.
    pub fn complete_finalize(
        &self,
        session_id: SessionId,
        all_ok: bool,
        now: DateTime<Utc>,
    ) -> Result<SessionState, IntakeError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        if session.state == SessionState::Finalizing {
            session.state = if all_ok {
                SessionState::Completed
            } else {
                SessionState::PartiallyFailed
            };
            session.finalized_at = Some(now);
        }
        Ok(session.state)
    }

    /// Cancels the session and signals in-flight work. Cancelling twice is a no-op.
    pub fn cancel(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionState, IntakeError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(IntakeError::SessionNotFound(session_id))?;
        match session.state {
            SessionState::Created | SessionState::Active | SessionState::Finalizing => {
                session.state = SessionState::Cancelled;
                session.finalized_at = Some(now);
                if let Some(token) = self.tokens.get(&session_id) {
                    token.cancel();
                }
                tracing::info!("🛑 Session {} cancelled", session_id);
                Ok(SessionState::Cancelled)
            }
            SessionState::Cancelled => Ok(SessionState::Cancelled),
            SessionState::Expired => Err(IntakeError::SessionExpired(session_id)),
            state => Err(IntakeError::SessionClosed { session_id, state }),
        }
    }

    /// Expires every open session idle past its deadline.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if entry.is_idle_expired(now) {
                self.expire(&mut entry, now);
                expired.push(entry.id);
            }
        }
        expired
    }

    /// Sessions stuck in `Finalizing` for longer than their idle TTL.
    pub fn stalled_finalizing(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|s| {
                let ttl = chrono::Duration::seconds(s.limits.idle_ttl_secs.min(i64::MAX as u64) as i64);
                s.state == SessionState::Finalizing && s.last_activity_at + ttl <= now
            })
            .map(|s| s.id)
            .collect()
    }

    /// Expired or cancelled sessions whose blobs have not been purged yet.
    pub fn sessions_pending_purge(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|s| {
                matches!(s.state, SessionState::Expired | SessionState::Cancelled) && !s.purged
            })
            .map(|s| s.id)
            .collect()
    }

    pub fn mark_purged(&self, session_id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.purged = true;
        }
    }

    /// Forgets terminal sessions older than the retention window.
    pub fn drop_retired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Vec<SessionId> {
        let retired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| {
                s.state.is_terminal()
                    && s.finalized_at.is_some_and(|at| at + retention <= now)
            })
            .map(|s| s.id)
            .collect();

        for id in &retired {
            self.sessions.remove(id);
            self.tokens.remove(id);
        }
        retired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::authorizer::AllowAllAuthorizer;
    use crate::services::storage::MemoryBlobStore;
    use async_trait::async_trait;

    struct DenyAll;

    #[async_trait]
    impl CollectionAuthorizer for DenyAll {
        async fn can_write(&self, _owner: &str, _collection: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn manager_with(config: IntakeConfig) -> (SessionManager, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let manager = SessionManager::new(config, Arc::new(AllowAllAuthorizer), blobs.clone());
        (manager, blobs)
    }

    #[tokio::test]
    async fn test_create_session_clamps_overrides() {
        let (manager, _) = manager_with(IntakeConfig::default());
        let created = manager
            .create_session(
                "owner",
                "book-1",
                LimitOverrides {
                    max_bytes: Some(u64::MAX),
                    max_files: Some(3),
                    idle_ttl_secs: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(created.limits.max_bytes, 200 * 1024 * 1024);
        assert_eq!(created.limits.max_files, 3);
        assert_eq!(created.recommended_chunk_size, 1024 * 1024);

        let session = manager.snapshot(created.session_id).unwrap();
        assert_eq!(session.state, SessionState::Created);
    }

    #[tokio::test]
    async fn test_create_session_requires_authorization() {
        let manager = SessionManager::new(
            IntakeConfig::default(),
            Arc::new(DenyAll),
            Arc::new(MemoryBlobStore::new()),
        );
        let err = manager
            .create_session("owner", "book-1", LimitOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Unauthorized { .. }));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_fails_fast_without_storage() {
        let (manager, blobs) = manager_with(IntakeConfig::default());
        blobs.set_available(false);
        let err = manager
            .create_session("owner", "book-1", LimitOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_file_quota_is_per_file() {
        let (manager, _) = manager_with(IntakeConfig::default());
        let created = manager
            .create_session(
                "owner",
                "book-1",
                LimitOverrides {
                    max_files: Some(2),
                    max_bytes: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = created.session_id;
        let now = Utc::now();

        manager.admit_file(id, "a", 40, now).unwrap();
        // Refused for bytes: does not burn a file slot
        let err = manager.admit_file(id, "big", 80, now).unwrap_err();
        assert!(matches!(err, IntakeError::QuotaExceeded { kind: QuotaKind::Bytes, .. }));
        manager.admit_file(id, "b", 40, now).unwrap();
        let err = manager.admit_file(id, "c", 0, now).unwrap_err();
        assert!(matches!(err, IntakeError::QuotaExceeded { kind: QuotaKind::Files, .. }));

        let session = manager.snapshot(id).unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.admitted_files, 2);
        assert_eq!(session.accepted_bytes, 80);
        assert_eq!(session.file_ids, vec!["a", "big", "b", "c"]);

        assert!(manager.charge_bytes(id, "a", 21, now).is_err());
        manager.charge_bytes(id, "a", 20, now).unwrap();
        assert_eq!(manager.snapshot(id).unwrap().accepted_bytes, 100);
    }

    #[tokio::test]
    async fn test_idle_session_expires_lazily() {
        let (manager, _) = manager_with(IntakeConfig::default());
        let created = manager
            .create_session("owner", "book-1", LimitOverrides::default())
            .await
            .unwrap();
        let id = created.session_id;
        let token = manager.cancellation_token(id).unwrap();

        let later = created.expires_at + chrono::Duration::seconds(1);
        let err = manager.ensure_accepting(id, later).unwrap_err();
        assert!(matches!(err, IntakeError::SessionExpired(_)));
        assert!(token.is_cancelled());
        assert_eq!(manager.sessions_pending_purge(), vec![id]);

        manager.mark_purged(id);
        assert!(manager.sessions_pending_purge().is_empty());
        assert!(manager.drop_retired(later, chrono::Duration::hours(1)).is_empty());
        assert_eq!(
            manager.drop_retired(later + chrono::Duration::hours(1), chrono::Duration::hours(1)),
            vec![id]
        );
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let (manager, _) = manager_with(IntakeConfig::default());
        let created = manager
            .create_session("owner", "book-1", LimitOverrides::default())
            .await
            .unwrap();
        assert!(manager.sweep_idle(Utc::now()).is_empty());
        let expired = manager.sweep_idle(created.expires_at);
        assert_eq!(expired, vec![created.session_id]);
        assert_eq!(
            manager.snapshot(created.session_id).unwrap().state,
            SessionState::Expired
        );
    }

    #[tokio::test]
    async fn test_finalize_and_cancel_transitions() {
        let (manager, _) = manager_with(IntakeConfig::default());
        let id = manager
            .create_session("owner", "book-1", LimitOverrides::default())
            .await
            .unwrap()
            .session_id;
        let now = Utc::now();

        manager.begin_finalize(id, now).unwrap();
        let err = manager.admit_file(id, "late", 0, now).unwrap_err();
        assert!(matches!(err, IntakeError::SessionClosed { .. }));
        // A retried finalize re-enters instead of failing
        manager.begin_finalize(id, now).unwrap();
        assert!(manager.stalled_finalizing(now).is_empty());
        let ttl = chrono::Duration::seconds(IntakeConfig::default().session_idle_ttl_secs as i64);
        assert_eq!(manager.stalled_finalizing(now + ttl), vec![id]);

        assert_eq!(manager.cancel(id, now).unwrap(), SessionState::Cancelled);
        assert_eq!(manager.cancel(id, now).unwrap(), SessionState::Cancelled);
        // Finalize finishing after the cancel must not resurrect the session
        assert_eq!(
            manager.complete_finalize(id, true, now).unwrap(),
            SessionState::Cancelled
        );
        assert!(manager.cancellation_token(id).unwrap().is_cancelled());
    }
}
