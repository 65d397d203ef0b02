//! The run journal: validated status transitions and ordered event appends
//!
//! Every status change goes through here. The journal takes the run's
//! exclusive lock, validates the transition against the state machine,
//! and hands the store one atomic status+event write; the event seq is
//! allocated inside that write. Records are then published to the message
//! bus on a best-effort basis; the journal itself is the source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use qw_domain::{
    DomainError, NewRunEvent, Run, RunEvent, RunEventType, RunId, RunStateMachine, RunStatus,
    MAX_EVENT_PAYLOAD_BYTES,
};
use qw_ports::{Clock, EventStore, MessageBus, RunPatch, RunStore, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Journal failures
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Serializes lifecycle writes per run and feeds the event bus
pub struct RunJournal<P, B> {
    store: Arc<P>,
    bus: Option<Arc<B>>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl<P, B> RunJournal<P, B>
where
    P: RunStore + EventStore,
    B: MessageBus,
{
    pub fn new(store: Arc<P>, bus: Option<Arc<B>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(run_id.clone()).or_default())
    }

    /// Propose a status transition, optionally carrying an event. The event
    /// seq is allocated atomically with the status write. The lock is not
    /// held across the bus publish.
    #[instrument(skip(self, patch, event), fields(run_id = %run_id, next = %next))]
    pub async fn transition(
        &self,
        run_id: &RunId,
        next: RunStatus,
        patch: RunPatch,
        event: Option<NewRunEvent>,
    ) -> Result<Run, JournalError> {
        let lock = self.lock_for(run_id).await;
        let published = {
            let _guard = lock.lock().await;
            let (current, _) = self.store.status_snapshot(run_id).await?;
            RunStateMachine::transition(current, next)?;
            let event = event.map(bound_payload);
            let (run, appended) = self
                .store
                .transition_run(run_id, current, next, patch, event)
                .await?;
            debug!(from = %current, "run transitioned");
            (run, appended)
        };
        if let Some(event) = &published.1 {
            self.publish(event).await;
        }
        Ok(published.0)
    }

    /// Append an event without a status change.
    pub async fn append(&self, run_id: &RunId, event: NewRunEvent) -> Result<RunEvent, JournalError> {
        let lock = self.lock_for(run_id).await;
        let appended = {
            let _guard = lock.lock().await;
            self.store.append_event(run_id, bound_payload(event)).await?
        };
        self.publish(&appended).await;
        Ok(appended)
    }

    /// Request cancellation. Idempotent: a terminal run is left untouched
    /// and its current status is returned.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel(&self, run_id: &RunId, reason: &str) -> Result<RunStatus, JournalError> {
        let lock = self.lock_for(run_id).await;
        let published = {
            let _guard = lock.lock().await;
            let (current, _) = self.store.status_snapshot(run_id).await?;
            if current.is_terminal() {
                debug!(status = %current, "cancel on terminal run is a no-op");
                return Ok(current);
            }
            let event = NewRunEvent::new(RunEventType::Cancelled).with_error(reason);
            let patch = RunPatch {
                completed_at: Some(self.clock.now()),
                error_message: Some(reason.to_string()),
                ..RunPatch::default()
            };
            let (_, appended) = self
                .store
                .transition_run(run_id, current, RunStatus::Cancelled, patch, Some(event))
                .await?;
            appended
        };
        if let Some(event) = &published {
            self.publish(event).await;
        }
        Ok(RunStatus::Cancelled)
    }

    /// Status and latest seq in one snapshot.
    pub async fn status(&self, run_id: &RunId) -> Result<(RunStatus, u64), JournalError> {
        Ok(self.store.status_snapshot(run_id).await?)
    }

    async fn publish(&self, event: &RunEvent) {
        let Some(bus) = &self.bus else {
            return;
        };
        let subject = format!("qawave.runs.{}", event.run_id);
        match serde_json::to_vec(event) {
            Ok(payload) => {
                if let Err(e) = bus.publish(&subject, &payload).await {
                    warn!(subject = %subject, error = %e, "event bus publish failed; journal remains authoritative");
                }
            }
            Err(e) => warn!(error = %e, "event serialization for bus failed"),
        }
    }
}

/// Keep journal payloads bounded: oversized ones are replaced with a stub.
fn bound_payload(mut event: NewRunEvent) -> NewRunEvent {
    let size = serde_json::to_vec(&event.payload).map(|v| v.len()).unwrap_or(0);
    if size > MAX_EVENT_PAYLOAD_BYTES {
        event.payload = serde_json::json!({
            "truncated": true,
            "originalBytes": size,
        });
    }
    event
}
