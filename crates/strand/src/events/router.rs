//! Event routing and fan-out.
//!
//! The router accepts decoded events from any source (normally the runner
//! proxy), associates each with a run, broadcasts to subscribers, and
//! persists to the session's event log. Subscriber channels are bounded;
//! a full channel drops the event for that subscriber only — reconnecting
//! clients heal through compact-on-read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::envelope::{Event, EventType, RunRecord, RunStatus};
use super::store::EventStore;

/// Capacity of each subscriber channel. Overflow drops events for that
/// subscriber only; clients recover on reconnect.
pub const SUBSCRIBER_BUFFER: usize = 100;

/// How long a terminal RunState lingers before scheduled cleanup.
const TERMINAL_LINGER: Duration = Duration::from_secs(5 * 60);

/// Age at which the background sweep removes non-running RunStates.
const STALE_AGE: Duration = Duration::from_secs(30 * 60);

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Identifier handed back on subscription, used to unsubscribe.
pub type SubscriberId = u64;

/// In-memory state for one run.
pub struct RunState {
    pub run_id: String,
    pub thread_id: String,
    pub session_id: String,
    pub project: String,
    pub parent_run_id: Option<String>,
    pub started_at: String,
    status: RwLock<RunStatus>,
    created: Instant,
    terminal_at: RwLock<Option<Instant>>,
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<Value>>>,
    /// Handle of the proxy task consuming this run's upstream stream, so
    /// eviction can cancel a stream that outlived its run.
    task: RwLock<Option<tokio::task::AbortHandle>>,
}

impl RunState {
    fn new(
        run_id: String,
        thread_id: String,
        session_id: String,
        project: String,
        parent_run_id: Option<String>,
    ) -> Self {
        Self {
            run_id,
            thread_id,
            session_id,
            project,
            parent_run_id,
            started_at: Utc::now().to_rfc3339(),
            status: RwLock::new(RunStatus::Running),
            created: Instant::now(),
            terminal_at: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            task: RwLock::new(None),
        }
    }

    /// Record the background task driving this run.
    pub fn attach_task(&self, handle: tokio::task::AbortHandle) {
        *self.task.write().expect("task lock") = Some(handle);
    }

    fn abort_task(&self) {
        if let Some(handle) = self.task.write().expect("task lock").take() {
            handle.abort();
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read().expect("run status lock")
    }

    fn set_terminal(&self, status: RunStatus) {
        *self.status.write().expect("run status lock") = status;
        *self.terminal_at.write().expect("terminal lock") = Some(Instant::now());
    }

    fn is_stale(&self, age: Duration) -> bool {
        if self.status() == RunStatus::Running {
            return false;
        }
        let reference = self
            .terminal_at
            .read()
            .expect("terminal lock")
            .unwrap_or(self.created);
        reference.elapsed() >= age
    }

    pub fn as_record(&self) -> RunRecord {
        RunRecord {
            run_id: self.run_id.clone(),
            thread_id: self.thread_id.clone(),
            parent_run_id: self.parent_run_id.clone(),
            status: self.status(),
            started_at: self.started_at.clone(),
        }
    }

    fn broadcast(&self, value: &Value) {
        let subscribers = self.subscribers.read().expect("subscriber lock");
        for (id, tx) in subscribers.iter() {
            if tx.try_send(value.clone()).is_err() {
                debug!(run = %self.run_id, subscriber = id, "dropping event for slow run subscriber");
            }
        }
    }
}

/// Routes events to subscribers and the event log.
pub struct EventRouter {
    store: EventStore,
    runs: DashMap<String, Arc<RunState>>,
    thread_subscribers: DashMap<String, HashMap<SubscriberId, mpsc::Sender<Value>>>,
    next_subscriber: AtomicU64,
}

impl EventRouter {
    pub fn new(store: EventStore) -> Arc<Self> {
        Arc::new(Self {
            store,
            runs: DashMap::new(),
            thread_subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
        })
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Start the background sweep that evicts stale RunStates.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                router.runs.retain(|_, state| {
                    let keep = !state.is_stale(STALE_AGE);
                    if !keep {
                        state.abort_task();
                    }
                    keep
                });
            }
        });
    }

    /// Register a run started by the runner proxy. Persists the initial
    /// running record.
    pub async fn register_run(
        self: &Arc<Self>,
        session_id: &str,
        project: &str,
        thread_id: &str,
        run_id: &str,
        parent_run_id: Option<String>,
    ) -> Arc<RunState> {
        let state = Arc::new(RunState::new(
            run_id.to_string(),
            thread_id.to_string(),
            session_id.to_string(),
            project.to_string(),
            parent_run_id,
        ));
        self.runs.insert(run_id.to_string(), Arc::clone(&state));
        if let Err(e) = self
            .store
            .append_run_record(session_id, &state.as_record())
            .await
        {
            warn!(session = session_id, run = run_id, error = %e, "failed to persist run record");
        }
        state
    }

    /// First RunState for the session still in `running` state.
    pub fn active_run_for_session(&self, session_id: &str) -> Option<Arc<RunState>> {
        self.runs
            .iter()
            .find(|entry| {
                entry.value().session_id == session_id
                    && entry.value().status() == RunStatus::Running
            })
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn run(&self, run_id: &str) -> Option<Arc<RunState>> {
        self.runs.get(run_id).map(|e| Arc::clone(e.value()))
    }

    /// Records for all in-memory runs of a session.
    pub fn run_records_for_session(&self, session_id: &str) -> Vec<RunRecord> {
        self.runs
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.value().as_record())
            .collect()
    }

    /// Subscribe to all events of a session (thread-level).
    pub fn subscribe_thread(&self, session_id: &str) -> (SubscriberId, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.thread_subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe_thread(&self, session_id: &str, id: SubscriberId) {
        if let Some(mut subs) = self.thread_subscribers.get_mut(session_id) {
            subs.remove(&id);
        }
        self.thread_subscribers
            .retain(|_, subs| !subs.is_empty());
    }

    /// Subscribe to one run's events.
    pub fn subscribe_run(&self, run_id: &str) -> Option<(SubscriberId, mpsc::Receiver<Value>)> {
        let state = self.run(run_id)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        state
            .subscribers
            .write()
            .expect("subscriber lock")
            .insert(id, tx);
        Some((id, rx))
    }

    pub fn unsubscribe_run(&self, run_id: &str, id: SubscriberId) {
        if let Some(state) = self.run(run_id) {
            state
                .subscribers
                .write()
                .expect("subscriber lock")
                .remove(&id);
        }
    }

    /// Accept one inbound event for a session.
    pub async fn route(self: &Arc<Self>, session_id: &str, project: &str, mut event: Event) {
        let event_type = event.event_type();

        // Associate with a run: the active one, or the exact id the event
        // carries (covers late events for already-terminal runs).
        let mut state = self
            .active_run_for_session(session_id)
            .or_else(|| event.run_id().and_then(|id| self.run(id)));

        if state.is_none() {
            if event_type.is_terminal() {
                // A late terminal for an unknown run never creates state:
                // blank the run id and persist, so a crashed runner's
                // stray RunFinished cannot mint a run after the fact.
                event.set_run_id("");
                event.fill_thread_id(session_id);
                event.fill_timestamp(&Utc::now().to_rfc3339());
                self.persist(session_id, &event).await;
                return;
            }
            if let Some(run_id) = event.run_id().map(str::to_string) {
                let created = self
                    .register_run(session_id, project, session_id, &run_id, None)
                    .await;
                state = Some(created);
            }
        }

        // Event-carried ids are authoritative; fill gaps from the run.
        if let Some(run_state) = state.as_deref() {
            event.fill_run_id(&run_state.run_id);
            event.fill_thread_id(&run_state.thread_id);
        } else {
            event.fill_thread_id(session_id);
        }
        event.fill_timestamp(&Utc::now().to_rfc3339());

        // Broadcast before persisting: live subscribers may observe an
        // event whose persist later fails, never the inverse.
        if let Some(run_state) = state.as_deref() {
            run_state.broadcast(event.as_value());
        }
        self.broadcast_thread(session_id, event.as_value());

        self.persist(session_id, &event).await;

        if let Some(run_state) = state {
            if let Some(terminal) = event_type.terminal_status() {
                self.finish_run(run_state, terminal).await;
            }
        }
    }

    fn broadcast_thread(&self, session_id: &str, value: &Value) {
        if let Some(subs) = self.thread_subscribers.get(session_id) {
            for (id, tx) in subs.iter() {
                if tx.try_send(value.clone()).is_err() {
                    debug!(session = session_id, subscriber = id, "dropping event for slow thread subscriber");
                }
            }
        }
    }

    async fn persist(&self, session_id: &str, event: &Event) {
        if let Err(e) = self.store.append_event(session_id, event).await {
            warn!(session = session_id, error = %e, "failed to persist event");
        }
    }

    /// Flip a run to its terminal status exactly once and schedule the
    /// RunState for removal.
    async fn finish_run(self: &Arc<Self>, state: Arc<RunState>, terminal: RunStatus) {
        if state.status() != RunStatus::Running {
            // Already terminal: the event was persisted above, but the
            // observable status never transitions twice.
            return;
        }
        state.set_terminal(terminal);
        if let Err(e) = self
            .store
            .append_run_record(&state.session_id, &state.as_record())
            .await
        {
            warn!(
                session = %state.session_id,
                run = %state.run_id,
                error = %e,
                "failed to persist terminal run record"
            );
        }

        let router = Arc::clone(self);
        let run_id = state.run_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TERMINAL_LINGER).await;
            if let Some((_, evicted)) = router
                .runs
                .remove_if(&run_id, |_, s| s.status() != RunStatus::Running)
            {
                evicted.abort_task();
            }
        });
    }

    /// Mark a run terminal from outside the event path (proxy EOF or
    /// connection failure). No-op when already terminal.
    pub async fn mark_run(self: &Arc<Self>, run_id: &str, status: RunStatus) {
        if let Some(state) = self.run(run_id) {
            self.finish_run(state, status).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn router() -> (TempDir, Arc<EventRouter>) {
        let dir = TempDir::new().unwrap();
        let router = EventRouter::new(EventStore::new(dir.path()));
        (dir, router)
    }

    fn event(v: Value) -> Event {
        Event::from_value(v)
    }

    #[tokio::test]
    async fn lazy_run_creation_from_event_run_id() {
        let (_dir, router) = router();
        router
            .route(
                "s1",
                "demo",
                event(json!({"type": "RunStarted", "runId": "r1"})),
            )
            .await;
        let state = router.run("r1").expect("run created lazily");
        assert_eq!(state.status(), RunStatus::Running);
        assert_eq!(state.session_id, "s1");
    }

    #[tokio::test]
    async fn terminal_without_run_does_not_create_state() {
        let (_dir, router) = router();
        router
            .route(
                "s1",
                "demo",
                event(json!({"type": "RunFinished", "runId": "ghost"})),
            )
            .await;
        assert!(router.run("ghost").is_none());
        // The event is still persisted, with its run id blanked.
        let events = router.store().read_events("s1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["runId"], "");
        assert_eq!(events[0]["threadId"], "s1");
    }

    #[tokio::test]
    async fn terminal_transition_happens_once() {
        let (_dir, router) = router();
        let state = router.register_run("s1", "demo", "s1", "r1", None).await;
        router
            .route("s1", "demo", event(json!({"type": "RunError", "runId": "r1"})))
            .await;
        assert_eq!(state.status(), RunStatus::Error);

        // A second terminal is persisted but the status stays put.
        router
            .route(
                "s1",
                "demo",
                event(json!({"type": "RunFinished", "runId": "r1"})),
            )
            .await;
        assert_eq!(state.status(), RunStatus::Error);

        let events = router.store().read_events("s1").await.unwrap();
        assert_eq!(events.len(), 2);

        // runs.jsonl: one running record, one terminal record.
        let runs = router.store().read_runs("s1").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Running);
        assert_eq!(runs[1].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn event_ids_filled_from_run_state() {
        let (_dir, router) = router();
        router.register_run("s1", "demo", "s1", "r1", None).await;
        router
            .route(
                "s1",
                "demo",
                event(json!({"type": "TextMessageStart", "messageId": "m1"})),
            )
            .await;
        let events = router.store().read_events("s1").await.unwrap();
        assert_eq!(events[0]["runId"], "r1");
        assert_eq!(events[0]["threadId"], "s1");
        assert!(events[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn event_carried_ids_are_authoritative() {
        let (_dir, router) = router();
        router.register_run("s1", "demo", "s1", "r1", None).await;
        router
            .route(
                "s1",
                "demo",
                event(json!({"type": "StepStarted", "runId": "r1", "threadId": "custom"})),
            )
            .await;
        let events = router.store().read_events("s1").await.unwrap();
        assert_eq!(events[0]["threadId"], "custom");
    }

    #[tokio::test]
    async fn thread_subscribers_receive_events() {
        let (_dir, router) = router();
        let (_id, mut rx) = router.subscribe_thread("s1");
        router
            .route(
                "s1",
                "demo",
                event(json!({"type": "RunStarted", "runId": "r1"})),
            )
            .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received["type"], "RunStarted");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking() {
        let (_dir, router) = router();
        let (_id, mut rx) = router.subscribe_thread("s1");
        // Push past the buffer without draining.
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            router
                .route(
                    "s1",
                    "demo",
                    event(json!({"type": "StepStarted", "runId": "r1", "seq": i})),
                )
                .await;
        }
        // Everything was persisted even though the subscriber overflowed.
        let events = router.store().read_events("s1").await.unwrap();
        assert_eq!(events.len(), SUBSCRIBER_BUFFER + 10);
        // The subscriber got exactly the buffered prefix.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn unsubscribe_thread_removes_channel() {
        let (_dir, router) = router();
        let (id, mut rx) = router.subscribe_thread("s1");
        router.unsubscribe_thread("s1", id);
        router
            .route("s1", "demo", event(json!({"type": "StepStarted"})))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_subscribers_receive_run_events() {
        let (_dir, router) = router();
        router.register_run("s1", "demo", "s1", "r1", None).await;
        let (_id, mut rx) = router.subscribe_run("r1").unwrap();
        router
            .route(
                "s1",
                "demo",
                event(json!({"type": "TextMessageStart", "messageId": "m1"})),
            )
            .await;
        assert_eq!(rx.recv().await.unwrap()["type"], "TextMessageStart");
    }

    #[tokio::test]
    async fn mark_run_flips_status_once() {
        let (_dir, router) = router();
        let state = router.register_run("s1", "demo", "s1", "r1", None).await;
        router.mark_run("r1", RunStatus::Completed).await;
        assert_eq!(state.status(), RunStatus::Completed);
        router.mark_run("r1", RunStatus::Error).await;
        assert_eq!(state.status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn stale_runs_are_swept() {
        let (_dir, router) = router();
        let state = router.register_run("s1", "demo", "s1", "r1", None).await;
        state.set_terminal(RunStatus::Completed);
        assert!(!state.is_stale(Duration::from_secs(3600)));
        assert!(state.is_stale(Duration::ZERO));
        router.runs.retain(|_, s| !s.is_stale(Duration::ZERO));
        assert!(router.run("r1").is_none());
    }

    #[tokio::test]
    async fn running_runs_survive_sweep() {
        let (_dir, router) = router();
        let state = router.register_run("s1", "demo", "s1", "r1", None).await;
        assert!(!state.is_stale(Duration::ZERO));
    }
}
