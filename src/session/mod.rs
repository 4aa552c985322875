//! Platform session and binding
//!
//! One authenticated [`Session`] per process, created on first use. Bound
//! operations run inside [`Session::bound`], which owns the single binding
//! slot: connect, run, release on every exit path. The slot's mutex makes
//! the whole sequence a critical section, so concurrent bound calls queue up
//! instead of clobbering each other's binding.

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{Authenticator, ChatApi, ClientError, Connection, EntityId};
use crate::credential::{CredentialError, CredentialSource};
use crate::metrics;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Authenticated handle shared by every tool call
pub struct Session {
    api: Box<dyn ChatApi>,
    binding: Mutex<Option<Box<dyn Connection>>>,
}

impl Session {
    fn new(api: Box<dyn ChatApi>) -> Self {
        Self {
            api,
            binding: Mutex::new(None),
        }
    }

    /// Operations that need no binding
    pub fn api(&self) -> &dyn ChatApi {
        self.api.as_ref()
    }

    /// Entity left in the binding slot once in-flight calls finish
    ///
    /// Always `None` unless a bound call was cancelled half way.
    #[cfg(test)]
    pub async fn bound_entity(&self) -> Option<EntityId> {
        self.binding
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.entity().clone())
    }

    /// Bind to `entity`, run `op`, release the binding whatever `op` returned
    ///
    /// Release failures are logged and dropped so `op`'s own result is what
    /// the caller sees.
    pub async fn bound<T, F>(&self, entity: EntityId, op: F) -> Result<T, ClientError>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, Result<T, ClientError>>,
    {
        let mut slot = self.binding.lock().await;

        // Left behind by a call that was cancelled mid-flight
        if let Some(stale) = slot.take() {
            warn!("Releasing stale binding to {}", stale.entity());
            release(stale).await;
        }

        let conn = slot.insert(self.api.connect(&entity).await?);
        debug!("Bound to {}", entity);

        let result = op(conn.as_mut()).await;

        if let Some(conn) = slot.take() {
            release(conn).await;
        }
        result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.api.account().username)
            .finish_non_exhaustive()
    }
}

async fn release(mut conn: Box<dyn Connection>) {
    match conn.close().await {
        Ok(()) => {
            debug!("Released binding to {}", conn.entity());
            metrics::record_binding_released("ok");
        }
        Err(e) => {
            warn!("Failed to release binding to {}: {}", conn.entity(), e);
            metrics::record_binding_released("error");
        }
    }
}

/// Creates the session on first use and hands out the cached one afterwards
pub struct SessionManager {
    credentials: CredentialSource,
    authenticator: Arc<dyn Authenticator>,
    current: Mutex<Option<Arc<Session>>>,
}

impl SessionManager {
    pub fn new(credentials: CredentialSource, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            credentials,
            authenticator,
            current: Mutex::new(None),
        }
    }

    /// Return the live session, authenticating first if there is none
    ///
    /// A failed attempt caches nothing; the next call starts over.
    pub async fn ensure_session(&self) -> Result<Arc<Session>, SessionError> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            return Ok(Arc::clone(session));
        }

        let token = self.credentials.resolve()?;
        let api = match self.authenticator.authenticate(&token).await {
            Ok(api) => api,
            Err(e) => {
                metrics::record_auth_failure();
                return Err(e.into());
            }
        };

        info!("Session ready for {}", api.account().username);
        metrics::record_session_created();

        let session = Arc::new(Session::new(api));
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Whether a session has been established
    pub async fn is_live(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{EventLog, MockAuthenticator};
    use super::*;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn manager_with_token(dir: &TempDir) -> (SessionManager, Arc<MockAuthenticator>) {
        let path = dir.path().join(".cai_token");
        std::fs::write(&path, "\"abc123\"").unwrap();
        manager_at(path)
    }

    fn manager_at(path: std::path::PathBuf) -> (SessionManager, Arc<MockAuthenticator>) {
        let auth = Arc::new(MockAuthenticator::default());
        let credentials = CredentialSource::new("CAI_MCP_TEST_UNSET_TOKEN_VAR", path);
        let manager = SessionManager::new(credentials, auth.clone());
        (manager, auth)
    }

    fn log_of(auth: &MockAuthenticator) -> Arc<EventLog> {
        Arc::clone(&auth.log)
    }

    #[tokio::test]
    async fn test_session_created_once() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_with_token(&dir);

        let first = assert_ok!(manager.ensure_session().await);
        let second = assert_ok!(manager.ensure_session().await);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(auth.calls(), 1);
        assert_eq!(log_of(&auth).events(), vec!["auth:abc123"]);
    }

    #[tokio::test]
    async fn test_concurrent_first_calls_authenticate_once() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_with_token(&dir);

        let (a, b) = tokio::join!(manager.ensure_session(), manager.ensure_session());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_auth_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_with_token(&dir);
        auth.reject.store(true, Ordering::SeqCst);

        let err = assert_err!(manager.ensure_session().await);
        assert!(matches!(err, SessionError::Client(ClientError::Auth(_))));
        assert!(!manager.is_live().await);

        auth.reject.store(false, Ordering::SeqCst);
        assert_ok!(manager.ensure_session().await);
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_credential_skips_network() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_at(dir.path().join("absent"));

        let err = assert_err!(manager.ensure_session().await);
        assert!(matches!(err, SessionError::Credential(CredentialError::NotFound { .. })));
        assert_eq!(auth.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_bound_call_releases_binding() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_with_token(&dir);
        let session = manager.ensure_session().await.unwrap();

        let result = session
            .bound(EntityId::Character("a".to_string()), |conn| {
                Box::pin(async move { conn.send_message("chat-a", "fail").await })
            })
            .await;
        assert!(matches!(result, Err(ClientError::Upstream(_))));
        assert!(session.bound_entity().await.is_none());

        let turn = session
            .bound(EntityId::Character("b".to_string()), |conn| {
                Box::pin(async move { conn.send_message("chat-b", "hi").await })
            })
            .await
            .unwrap();
        assert_eq!(turn.text(), "reply to hi");

        assert_eq!(
            log_of(&auth).events()[1..],
            [
                "connect:character:a",
                "send:character:a:fail",
                "close:character:a",
                "connect:character:b",
                "send:character:b:hi",
                "close:character:b",
            ]
        );
    }

    #[tokio::test]
    async fn test_release_error_does_not_mask_result() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_with_token(&dir);
        let session = manager.ensure_session().await.unwrap();

        let turn = session
            .bound(EntityId::Character("sticky".to_string()), |conn| {
                Box::pin(async move { conn.send_message("chat", "hi").await })
            })
            .await
            .unwrap();
        assert_eq!(turn.text(), "reply to hi");
        assert!(log_of(&auth).events().contains(&"close:character:sticky".to_string()));
        assert!(session.bound_entity().await.is_none());
    }

    #[tokio::test]
    async fn test_op_error_wins_over_release_error() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_with_token(&dir);
        let session = manager.ensure_session().await.unwrap();

        let result = session
            .bound(EntityId::Character("sticky".to_string()), |conn| {
                Box::pin(async move { conn.send_message("chat", "fail").await })
            })
            .await;
        match result {
            Err(ClientError::Upstream(message)) => assert_eq!(message, "blocked"),
            other => panic!(
                "expected the operation's error, got {:?}",
                other.map(|t| t.text().to_string())
            ),
        }
        assert!(session.bound_entity().await.is_none());

        let turn = session
            .bound(EntityId::Character("b".to_string()), |conn| {
                Box::pin(async move { conn.send_message("chat-b", "hi").await })
            })
            .await
            .unwrap();
        assert_eq!(turn.text(), "reply to hi");

        assert_eq!(
            log_of(&auth).events()[1..],
            [
                "connect:character:sticky",
                "send:character:sticky:fail",
                "close:character:sticky",
                "connect:character:b",
                "send:character:b:hi",
                "close:character:b",
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_slot_empty() {
        let dir = TempDir::new().unwrap();
        let (manager, _auth) = manager_with_token(&dir);
        let session = manager.ensure_session().await.unwrap();

        let result = session
            .bound(EntityId::Character("unreachable".to_string()), |conn| {
                Box::pin(async move { conn.character_info().await })
            })
            .await;
        assert!(matches!(result, Err(ClientError::WebSocket(_))));
        assert!(session.bound_entity().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_bound_calls_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let (manager, auth) = manager_with_token(&dir);
        let session = manager.ensure_session().await.unwrap();

        let call = |id: &str| {
            let session = Arc::clone(&session);
            let entity = EntityId::Character(id.to_string());
            async move {
                session
                    .bound(entity, |conn| {
                        Box::pin(async move { conn.send_message("chat", "slow").await })
                    })
                    .await
            }
        };

        let (a, b, c) = tokio::join!(call("a"), call("b"), call("c"));
        assert_ok!(a);
        assert_ok!(b);
        assert_ok!(c);

        // Every binding is connect → send → close with nothing in between
        let events = log_of(&auth).events();
        let calls: Vec<&[String]> = events[1..].chunks(3).collect();
        assert_eq!(calls.len(), 3);
        for chunk in calls {
            let entity = chunk[0].trim_start_matches("connect:");
            assert_eq!(chunk[1], format!("send:{}:slow", entity));
            assert_eq!(chunk[2], format!("close:{}", entity));
        }
    }
}
