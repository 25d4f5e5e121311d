//! Session registry.
//!
//! Maps session ids to running [`Session`]s, creating them on first use
//! and evicting them after a period of inactivity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kernel_exec::Splitter;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::kernel::KernelFactory;
use crate::session::{Session, SessionConfig};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Applied to every session the registry creates.
    pub session: SessionConfig,
    /// Sessions idle this long are shut down by the sweeper.
    pub idle_timeout: Duration,
    /// Finished execution records older than this are dropped.
    pub history_ttl: Duration,
    pub sweep_interval: Duration,
    /// Per-session grace period when shutting down.
    pub shutdown_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            idle_timeout: Duration::from_secs(60 * 60),
            history_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Snapshot of one session for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub busy: bool,
    pub idle_secs: u64,
}

pub struct SessionRegistry<F: KernelFactory> {
    factory: F,
    splitter: Arc<dyn Splitter>,
    config: RegistryConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl<F: KernelFactory> SessionRegistry<F> {
    pub fn new(factory: F, splitter: Arc<dyn Splitter>, config: RegistryConfig) -> Self {
        Self {
            factory,
            splitter,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the session for `session_id`, creating it (and its kernel)
    /// if it does not exist or has stopped.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(session_id) {
            if !session.is_closed() {
                return session.clone();
            }
            warn!("[registry] Session {} had stopped, replacing it", session_id);
        }

        info!("[registry] Creating session {}", session_id);
        let kernel = self.factory.create(session_id);
        let session = Arc::new(Session::spawn(
            session_id,
            kernel,
            self.splitter.clone(),
            self.config.session.clone(),
        ));
        sessions.insert(session_id.to_string(), session.clone());
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Remove a session and shut down its kernel.
    pub async fn delete(&self, session_id: &str) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        info!("[registry] Deleting session {}", session_id);
        session.shutdown(self.config.shutdown_timeout).await;
        Ok(())
    }

    /// All sessions, sorted by id.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|session| SessionSummary {
                session_id: session.id().to_string(),
                busy: session.is_busy(),
                idle_secs: session.idle_for().as_secs(),
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Evict idle sessions and prune execution history in the rest.
    /// Returns how many sessions were evicted.
    pub async fn sweep(&self) -> usize {
        let (expired, remaining): (Vec<_>, Vec<_>) = {
            let mut sessions = self.sessions.lock().await;
            let expired_ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| {
                    session.is_closed()
                        || (!session.is_busy() && session.idle_for() >= self.config.idle_timeout)
                })
                .map(|(id, _)| id.clone())
                .collect();
            let expired = expired_ids
                .iter()
                .filter_map(|id| sessions.remove(id))
                .collect();
            (expired, sessions.values().cloned().collect())
        };

        for session in &expired {
            info!(
                "[registry] Evicting session {} (idle {:?})",
                session.id(),
                session.idle_for()
            );
            session.shutdown(self.config.shutdown_timeout).await;
        }

        for session in &remaining {
            if let Err(e) = session.prune_history(self.config.history_ttl).await {
                debug!("[registry] Could not prune {}: {}", session.id(), e);
            }
        }

        expired.len()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.sweep_interval);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = registry.sweep().await;
                if evicted > 0 {
                    info!("[registry] Sweep evicted {} sessions", evicted);
                }
            }
        })
    }

    /// Shut down every session.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        if sessions.is_empty() {
            return;
        }
        info!("[registry] Shutting down {} sessions", sessions.len());
        let timeout = self.config.shutdown_timeout;
        futures::future::join_all(sessions.iter().map(|session| session.shutdown(timeout))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_kernel::FakeKernelFactory;
    use crate::session::{ExecuteRequest, SessionError};
    use kernel_exec::{ClientEvent, PythonSplitter};

    fn registry_with(config: RegistryConfig) -> (Arc<SessionRegistry<FakeKernelFactory>>, FakeKernelFactory) {
        let factory = FakeKernelFactory::new();
        let registry = SessionRegistry::new(factory.clone(), Arc::new(PythonSplitter), config);
        (Arc::new(registry), factory)
    }

    fn registry() -> (Arc<SessionRegistry<FakeKernelFactory>>, FakeKernelFactory) {
        registry_with(RegistryConfig::default())
    }

    async fn run_to_end(session: &Session, request: ExecuteRequest) {
        let mut rx = session.execute_script(request).await.unwrap();
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_sessions() {
        let (registry, factory) = registry();
        let a = registry.get_or_create("a").await;
        let again = registry.get_or_create("a").await;
        let b = registry.get_or_create("b").await;

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created(), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_sessions_have_separate_kernels() {
        let (registry, _factory) = registry();
        let a = registry.get_or_create("a").await;
        let b = registry.get_or_create("b").await;
        run_to_end(&a, ExecuteRequest::new("x = 1")).await;

        let mut rx = b.execute_script(ExecuteRequest::new("x")).await.unwrap();
        let mut failed = false;
        while let Some(event) = rx.recv().await {
            if let ClientEvent::UnitResult(result) = &event {
                failed = result.has_error();
            }
            if event.is_terminal() {
                break;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_delete() {
        let (registry, factory) = registry();
        registry.get_or_create("a").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry.delete("a").await.unwrap();
        assert!(registry.get("a").await.is_none());
        assert_eq!(factory.ledger("a").unwrap().lock().unwrap().shutdowns, 1);

        assert_eq!(
            registry.delete("a").await,
            Err(RegistryError::NotFound("a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_delete_during_execution_ends_it_once() {
        let (registry, factory) = registry();
        let session = registry.get_or_create("a").await;
        let mut rx = session
            .execute_script(ExecuteRequest::new("sleep(60000)"))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ClientEvent::Started { .. })));

        registry.delete("a").await.unwrap();

        let mut terminal = Vec::new();
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                terminal.push(event);
            }
        }
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], ClientEvent::Error { .. }));
        assert_eq!(factory.ledger("a").unwrap().lock().unwrap().shutdowns, 1);
        assert!(matches!(
            session.execute_script(ExecuteRequest::new("x")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let (registry, factory) = registry();
        let session = registry.get_or_create("a").await;
        session.shutdown(Duration::from_secs(1)).await;

        let replacement = registry.get_or_create("a").await;
        assert!(!Arc::ptr_eq(&session, &replacement));
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_but_not_busy() {
        let (registry, _factory) = registry_with(RegistryConfig {
            idle_timeout: Duration::ZERO,
            ..Default::default()
        });
        let busy = registry.get_or_create("busy").await;
        registry.get_or_create("idle").await;

        let mut rx = busy
            .execute_script(ExecuteRequest::new("sleep(300)"))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ClientEvent::Started { .. })));

        assert_eq!(registry.sweep().await, 1);
        let ids: Vec<String> = registry
            .list()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["busy"]);
    }

    #[tokio::test]
    async fn test_sweep_prunes_history() {
        let (registry, _factory) = registry_with(RegistryConfig {
            history_ttl: Duration::ZERO,
            ..Default::default()
        });
        let session = registry.get_or_create("a").await;
        run_to_end(&session, ExecuteRequest::new("x = 1").with_id("old")).await;
        assert!(session.get_state("old").await.unwrap().is_some());

        assert_eq!(registry.sweep().await, 0);
        assert!(session.get_state("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_reports_busy() {
        let (registry, _factory) = registry();
        let session = registry.get_or_create("b").await;
        registry.get_or_create("a").await;
        let mut rx = session
            .execute_script(ExecuteRequest::new("sleep(200)"))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ClientEvent::Started { .. })));

        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].session_id, "a");
        assert!(!list[0].busy);
        assert!(list[1].busy);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let (registry, factory) = registry();
        registry.get_or_create("a").await;
        registry.get_or_create("b").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry.shutdown_all().await;
        assert!(registry.is_empty().await);
        for id in ["a", "b"] {
            assert_eq!(factory.ledger(id).unwrap().lock().unwrap().shutdowns, 1);
        }
    }
}
