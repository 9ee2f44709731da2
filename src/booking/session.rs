//! Session registry: one booking flow per live browser session.
//!
//! Each flow sits behind its own mutex. Directory calls are made with the
//! lock released, so a concurrent request against the same session sees the
//! fetch or submission as in flight instead of queueing behind it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::controller::{BookingFlow, FetchKind, FlowSnapshot, ListStatus};
use super::model::{ContactInfo, PatientDetails};
use crate::config::{FlowConfig, SessionConfig};
use crate::directory::BookingDirectory;
use crate::error::{Error, FlowError, Result, SessionError};

struct Session {
    flow: BookingFlow,
    last_activity: Instant,
}

impl Session {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

type SessionHandle = Arc<Mutex<Session>>;

/// In-memory registry of booking sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    directory: Arc<dyn BookingDirectory>,
    flow_config: FlowConfig,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(
        directory: Arc<dyn BookingDirectory>,
        flow_config: FlowConfig,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            directory,
            flow_config,
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Start a new booking session at the welcome step.
    pub async fn create(&self) -> Result<FlowSnapshot> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(SessionError::LimitReached {
                max: self.config.max_sessions,
            }
            .into());
        }

        let flow = BookingFlow::new(self.flow_config.clone());
        let id = flow.id();
        let snapshot = flow.snapshot();
        sessions.insert(
            id,
            Arc::new(Mutex::new(Session {
                flow,
                last_activity: Instant::now(),
            })),
        );
        info!(session_id = %id, live = sessions.len(), "Booking session created");
        Ok(snapshot)
    }

    pub async fn snapshot(&self, id: Uuid) -> Result<FlowSnapshot> {
        self.update(id, |_| Ok(())).await
    }

    pub async fn select_intent(&self, id: Uuid, is_for_self: bool) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.select_intent(is_for_self).map(|_| ()))
            .await
    }

    /// Advance, then load the new step's list if it has one that is not
    /// loaded yet. A failed load is recorded on the step; the advance
    /// itself still succeeds.
    pub async fn advance(&self, id: Uuid) -> Result<FlowSnapshot> {
        let handle = self.handle(id).await?;
        let needs_load = {
            let mut session = handle.lock().await;
            session.touch();
            let step = session.flow.advance()?;
            FetchKind::for_step(step)
                .map(|kind| session.flow.list_status(kind) != &ListStatus::Loaded)
                .unwrap_or(false)
        };

        if needs_load {
            match self.load_handle(&handle).await {
                Ok(()) | Err(Error::Flow(FlowError::FetchFailed { .. })) => {}
                Err(Error::Flow(FlowError::FetchInFlight { .. })) => {}
                Err(e) => return Err(e),
            }
        }

        let session = handle.lock().await;
        Ok(session.flow.snapshot())
    }

    pub async fn back(&self, id: Uuid) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.back().map(|_| ())).await
    }

    pub async fn set_patient(&self, id: Uuid, patient: PatientDetails) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.set_patient(patient)).await
    }

    pub async fn set_contact(&self, id: Uuid, contact: ContactInfo) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.set_contact(contact)).await
    }

    pub async fn select_payer(
        &self,
        id: Uuid,
        payer_id: String,
        member_id: Option<String>,
    ) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.select_payer(payer_id, member_id))
            .await
    }

    pub async fn select_provider(&self, id: Uuid, provider_id: String) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.select_provider(provider_id)).await
    }

    pub async fn select_slot(&self, id: Uuid, slot_id: &str) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.select_slot(slot_id)).await
    }

    pub async fn set_reason(&self, id: Uuid, reason: Option<String>) -> Result<FlowSnapshot> {
        self.update(id, |flow| flow.set_reason(reason)).await
    }

    /// Load (or reload after a failure) the current step's list.
    pub async fn load(&self, id: Uuid) -> Result<FlowSnapshot> {
        let handle = self.handle(id).await?;
        self.load_handle(&handle).await?;
        let session = handle.lock().await;
        Ok(session.flow.snapshot())
    }

    /// Submit the booking. On failure the session stays on the confirm
    /// step and can be submitted again.
    pub async fn submit(&self, id: Uuid) -> Result<FlowSnapshot> {
        let handle = self.handle(id).await?;
        let request = {
            let mut session = handle.lock().await;
            session.touch();
            session.flow.begin_submit()?
        };

        let outcome = self.directory.create_booking(&request).await;

        let mut session = handle.lock().await;
        session.touch();
        session.flow.complete_submit(outcome)?;
        Ok(session.flow.snapshot())
    }

    /// Abandon the session and drop it from the registry.
    pub async fn abandon(&self, id: Uuid) -> Result<FlowSnapshot> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(SessionError::NotFound(id))?;
        let mut session = handle.lock().await;
        session.flow.abandon();
        info!(session_id = %id, "Booking session closed");
        Ok(session.flow.snapshot())
    }

    /// Abandon and drop sessions idle longer than the configured timeout.
    /// Sessions that are locked or waiting on a directory call are skipped.
    /// Returns the number of sessions removed.
    pub async fn expire_idle(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();

        for (id, handle) in sessions.iter() {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if session.flow.has_request_in_flight() {
                continue;
            }
            if now.duration_since(session.last_activity) >= self.config.idle_timeout {
                session.flow.abandon();
                expired.push(*id);
            }
        }

        for id in &expired {
            sessions.remove(id);
            debug!(session_id = %id, "Idle booking session expired");
        }

        if !expired.is_empty() {
            info!(count = expired.len(), live = sessions.len(), "Expired idle booking sessions");
        }
        expired.len()
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn handle(&self, id: Uuid) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id).into())
    }

    /// Run a synchronous flow operation and return the resulting snapshot.
    async fn update<F>(&self, id: Uuid, op: F) -> Result<FlowSnapshot>
    where
        F: FnOnce(&mut BookingFlow) -> std::result::Result<(), FlowError>,
    {
        let handle = self.handle(id).await?;
        let mut session = handle.lock().await;
        session.touch();
        op(&mut session.flow)?;
        Ok(session.flow.snapshot())
    }

    async fn load_handle(&self, handle: &SessionHandle) -> Result<()> {
        let ticket = {
            let mut session = handle.lock().await;
            session.touch();
            session.flow.begin_fetch()?
        };

        let outcome = ticket.request.run(self.directory.as_ref()).await;

        let mut session = handle.lock().await;
        session.flow.complete_fetch(ticket, outcome)?;
        Ok(())
    }
}

/// Spawn a background task that periodically expires idle sessions.
pub fn spawn_expiry_task(registry: Arc<SessionRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(registry.config().sweep_interval);
        loop {
            interval.tick().await;
            registry.expire_idle().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::NaiveDate;

    use crate::booking::state::BookingStep;
    use crate::directory::LibSqlDirectory;

    async fn registry_with(config: SessionConfig) -> Arc<SessionRegistry> {
        let dir = LibSqlDirectory::new_memory().await.unwrap();
        dir.seed_demo_data().await.unwrap();
        SessionRegistry::new(Arc::new(dir), FlowConfig::default(), config)
    }

    async fn registry() -> Arc<SessionRegistry> {
        registry_with(SessionConfig::default()).await
    }

    fn contact() -> ContactInfo {
        ContactInfo {
            first_name: "Jonah".into(),
            last_name: "Berg".into(),
            email: "jonah@example.net".into(),
            phone: "212-555-0199".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1979, 8, 30),
        }
    }

    #[tokio::test]
    async fn create_and_snapshot() {
        let reg = registry().await;
        let snap = reg.create().await.unwrap();
        assert_eq!(snap.step, BookingStep::Welcome);
        assert_eq!(reg.len().await, 1);

        let again = reg.snapshot(snap.id).await.unwrap();
        assert_eq!(again.id, snap.id);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let reg = registry().await;
        let err = reg.snapshot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn session_limit_enforced() {
        let reg = registry_with(SessionConfig {
            max_sessions: 1,
            ..SessionConfig::default()
        })
        .await;
        reg.create().await.unwrap();
        let err = reg.create().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::LimitReached { max: 1 })
        ));
    }

    #[tokio::test]
    async fn advance_into_payer_step_loads_payers() {
        let reg = registry().await;
        let id = reg.create().await.unwrap().id;
        reg.select_intent(id, true).await.unwrap();
        reg.set_contact(id, contact()).await.unwrap();

        let snap = reg.advance(id).await.unwrap();
        assert_eq!(snap.step, BookingStep::Payer);
        assert_eq!(snap.payers.status, ListStatus::Loaded);
        assert!(!snap.payers.items.is_empty());
    }

    #[tokio::test]
    async fn full_booking_through_registry() {
        let reg = registry().await;
        let id = reg.create().await.unwrap().id;
        reg.select_intent(id, true).await.unwrap();
        reg.set_contact(id, contact()).await.unwrap();
        reg.advance(id).await.unwrap();

        reg.select_payer(id, "payer-northwind".into(), None).await.unwrap();
        let snap = reg.advance(id).await.unwrap();
        assert_eq!(snap.step, BookingStep::Provider);
        let provider_id = snap.providers.items[0].id.clone();

        reg.select_provider(id, provider_id).await.unwrap();
        let snap = reg.advance(id).await.unwrap();
        assert_eq!(snap.step, BookingStep::Slot);
        let slot_id = snap.slots.items[0].id.clone();

        reg.select_slot(id, &slot_id).await.unwrap();
        assert_eq!(reg.advance(id).await.unwrap().step, BookingStep::Confirm);

        let snap = reg.submit(id).await.unwrap();
        assert_eq!(snap.step, BookingStep::Submitted);
        assert!(snap.booking_id.is_some());
    }

    #[tokio::test]
    async fn abandon_removes_session() {
        let reg = registry().await;
        let id = reg.create().await.unwrap().id;
        reg.select_intent(id, false).await.unwrap();

        let snap = reg.abandon(id).await.unwrap();
        assert_eq!(snap.step, BookingStep::Abandoned);
        assert!(snap.draft.is_for_self.is_none());
        assert!(reg.is_empty().await);
        assert!(reg.abandon(id).await.is_err());
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let reg = registry_with(SessionConfig {
            idle_timeout: Duration::ZERO,
            ..SessionConfig::default()
        })
        .await;
        reg.create().await.unwrap();
        reg.create().await.unwrap();
        assert_eq!(reg.expire_idle().await, 2);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_skips_sessions_waiting_on_directory() {
        let reg = registry_with(SessionConfig {
            idle_timeout: Duration::ZERO,
            ..SessionConfig::default()
        })
        .await;
        let id = reg.create().await.unwrap().id;
        reg.select_intent(id, true).await.unwrap();
        reg.set_contact(id, contact()).await.unwrap();

        let handle = reg.handle(id).await.unwrap();
        {
            let mut session = handle.lock().await;
            session.flow.advance().unwrap();
            session.flow.begin_fetch().unwrap();
        }

        assert_eq!(reg.expire_idle().await, 0);
        assert_eq!(reg.len().await, 1);

        {
            let mut session = handle.lock().await;
            assert!(session.flow.has_request_in_flight());
            session.flow.abandon();
            assert!(!session.flow.has_request_in_flight());
        }
        assert_eq!(reg.expire_idle().await, 1);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn active_sessions_survive_sweep() {
        let reg = registry().await;
        reg.create().await.unwrap();
        assert_eq!(reg.expire_idle().await, 0);
        assert_eq!(reg.len().await, 1);
    }
}
