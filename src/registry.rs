use crate::branch::SessionState;
use crate::bus::{Event, EventBus, EventPayload};
use crate::collections::Tenant;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-wide session registry: a sharded map from session id to the
/// per-session lock. Branch/fold mutations take the write half — that
/// exclusivity is what makes a fold atomic; status reads share the read
/// half.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<RwLock<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Sessions are created implicitly on first use; creation publishes
    /// `session.started`.
    pub async fn get_or_create(
        &self,
        tenant: &Tenant,
        session_id: &str,
        bus: &EventBus,
    ) -> Result<Arc<RwLock<SessionState>>> {
        if session_id.trim().is_empty() {
            return Err(Error::invalid_argument("session_id must be non-empty"));
        }
        if let Some(existing) = self.sessions.get(session_id).map(|e| e.value().clone()) {
            self.check_tenancy(tenant, &existing).await?;
            return Ok(existing);
        }
        let state = Arc::new(RwLock::new(SessionState::new(
            session_id,
            &tenant.owner_id,
            &tenant.project_hash,
            &tenant.project_path,
        )));
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| state.clone())
            .value()
            .clone();
        if Arc::ptr_eq(&entry, &state) {
            bus.publish(Event::new(
                &tenant.owner_id,
                &tenant.project_hash,
                session_id,
                None,
                EventPayload::SessionStarted,
            ));
        } else {
            // Lost the insert race; validate the winner instead.
            self.check_tenancy(tenant, &entry).await?;
        }
        Ok(entry)
    }

    pub async fn get(
        &self,
        tenant: &Tenant,
        session_id: &str,
    ) -> Result<Arc<RwLock<SessionState>>> {
        let Some(existing) = self.sessions.get(session_id).map(|e| e.value().clone()) else {
            return Err(Error::not_found(format!("session {session_id}")));
        };
        self.check_tenancy(tenant, &existing).await?;
        Ok(existing)
    }

    /// A session id is only addressable by the tenancy that created it.
    async fn check_tenancy(
        &self,
        tenant: &Tenant,
        session: &Arc<RwLock<SessionState>>,
    ) -> Result<()> {
        let state = session.read().await;
        if state.owner_id != tenant.owner_id || state.project_hash != tenant.project_hash {
            tracing::warn!(
                "tenancy mismatch for session {}: request owner {} project {}",
                state.session_id,
                tenant.owner_id,
                tenant.project_hash
            );
            return Err(Error::TenancyMismatch(format!(
                "session {} belongs to a different tenancy",
                state.session_id
            )));
        }
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_implicit_creation_emits_started() {
        let registry = SessionRegistry::new();
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let tenant = Tenant::resolve("alice", "/w/a").unwrap();

        registry
            .get_or_create(&tenant, "sess-1", &bus)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(event.subject.starts_with("session.started."));

        // Second call reuses the session and emits nothing new.
        registry
            .get_or_create(&tenant, "sess-1", &bus)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_tenancy_enforced() {
        let registry = SessionRegistry::new();
        let bus = EventBus::new(16);
        let alice = Tenant::resolve("alice", "/w/a").unwrap();
        let bob = Tenant::resolve("bob", "/w/a").unwrap();
        let other_project = Tenant::resolve("alice", "/w/b").unwrap();

        registry.get_or_create(&alice, "sess-1", &bus).await.unwrap();
        assert!(matches!(
            registry.get(&bob, "sess-1").await.unwrap_err(),
            Error::TenancyMismatch(_)
        ));
        assert!(matches!(
            registry.get(&other_project, "sess-1").await.unwrap_err(),
            Error::TenancyMismatch(_)
        ));
        assert!(registry.get(&alice, "sess-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let registry = SessionRegistry::new();
        let tenant = Tenant::resolve("alice", "/w/a").unwrap();
        assert!(matches!(
            registry.get(&tenant, "ghost").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_session_id_rejected() {
        let registry = SessionRegistry::new();
        let bus = EventBus::new(16);
        let tenant = Tenant::resolve("alice", "/w/a").unwrap();
        assert!(matches!(
            registry
                .get_or_create(&tenant, "  ", &bus)
                .await
                .unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }
}
