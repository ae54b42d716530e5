//! The draft persistence agent.
//!
//! One `DraftAgent` watches one document. It records edits, saves them on a
//! timer and on host events, retries failed saves a bounded number of times
//! with a fixed delay, defers while offline, and fires a best-effort beacon
//! when the host is torn down.
//!
//! ## Guarantees
//!
//! - At most one durable save is outstanding per agent (`is_saving`).
//! - A failed save never discards the draft; it stays pending.
//! - An edit made while a save is in flight is never cleared by that save.
//!   The finishing save compares `revision` and leaves newer data dirty.
//! - Nothing is sent while offline except via the unload beacon, which is
//!   itself skipped when offline.
//!
//! ## Tasks
//!
//! `configure` spawns a periodic timer and an event listener; failed saves
//! spawn one delayed retry each. All of them hold a `Weak` reference, so
//! dropping every handle (or calling `destroy`) ends them.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::AgentOptions;
use crate::errors::DraftError;
use crate::events::{EventSource, HostEvent};
use crate::form::{EmptyForm, FormSource};
use crate::notify::Callbacks;
use crate::state::{DraftPhase, DraftState, Payload, SaveStatus};
use crate::transport::{ClientInfo, SaveReceipt, SaveRequest, SaveTransport, SaveTrigger};

/// Collaborators injected into an agent.
pub struct AgentDeps {
    pub transport: Arc<dyn SaveTransport>,
    pub form: Arc<dyn FormSource>,
    pub events: Option<Arc<dyn EventSource>>,
    pub callbacks: Callbacks,
}

impl AgentDeps {
    /// Deps with an empty form, no host events, and logging callbacks.
    pub fn new(transport: Arc<dyn SaveTransport>) -> Self {
        Self {
            transport,
            form: Arc::new(EmptyForm),
            events: None,
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_form_source(mut self, form: Arc<dyn FormSource>) -> Self {
        self.form = form;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Result of a save request. Failures are reported here and through the
/// callbacks; they are never returned as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The endpoint confirmed the save.
    Saved(SaveReceipt),
    /// Offline; the payload is held until connectivity returns.
    Deferred,
    /// The attempt failed and retry number `attempt` is scheduled.
    RetryScheduled { attempt: u32 },
    /// Retries exhausted. The draft is still pending.
    Failed,
    /// Nothing was sent.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Disabled, destroyed, or configured without a document id
    Disabled,
    /// Another save is in flight
    InFlight,
    /// Nothing to persist
    Empty,
}

struct Inner {
    document_id: String,
    options: AgentOptions,
    transport: Arc<dyn SaveTransport>,
    form: Arc<dyn FormSource>,
    events: Option<Arc<dyn EventSource>>,
    callbacks: Callbacks,
    client: ClientInfo,
    state: Mutex<DraftState>,
    destroyed: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    retries: Mutex<JoinSet<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for slot in [&self.timer, &self.listener] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears `is_saving` if a durable save is abandoned mid-flight
/// (future dropped or task aborted). Disarmed once the outcome is recorded.
struct SavingGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.inner.state).is_saving = false;
        }
    }
}

/// Handle to a draft persistence agent. Clones share the same agent.
#[derive(Clone)]
pub struct DraftAgent {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DraftAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftAgent")
            .field("document_id", &self.inner.document_id)
            .field("state", &*lock(&self.inner.state))
            .finish_non_exhaustive()
    }
}

impl DraftAgent {
    /// Attach an agent to `document_id`.
    ///
    /// An empty id produces an inert agent: disabled, no timer, no event
    /// subscription, and every operation a no-op.
    ///
    /// Must be called from within a tokio runtime; the timer and event
    /// listener are spawned onto it.
    pub fn configure(document_id: impl Into<String>, options: AgentOptions, deps: AgentDeps) -> Self {
        let document_id = document_id.into().trim().to_string();
        let inert = document_id.is_empty();
        let online = deps.events.as_ref().is_none_or(|events| events.is_online());
        let enabled = options.enabled && !inert;

        let agent = Self {
            inner: Arc::new(Inner {
                document_id,
                options,
                transport: deps.transport,
                form: deps.form,
                events: deps.events,
                callbacks: deps.callbacks,
                client: ClientInfo::current(),
                state: Mutex::new(DraftState::new(enabled, online)),
                destroyed: AtomicBool::new(false),
                timer: Mutex::new(None),
                listener: Mutex::new(None),
                retries: Mutex::new(JoinSet::new()),
            }),
        };

        if inert {
            tracing::warn!("autosave not started: no document id");
            return agent;
        }

        agent.attach_listener();
        if enabled {
            agent.start_timer();
        }
        tracing::debug!(
            document_id = %agent.inner.document_id,
            interval_ms = agent.inner.options.save_interval_ms,
            enabled,
            online,
            "autosave agent attached"
        );
        agent
    }

    pub fn document_id(&self) -> Option<&str> {
        Some(self.inner.document_id.as_str()).filter(|id| !id.is_empty())
    }

    pub fn options(&self) -> &AgentOptions {
        &self.inner.options
    }

    fn is_detached(&self) -> bool {
        self.inner.document_id.is_empty() || self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, DraftState> {
        lock(&self.inner.state)
    }

    fn emit(&self, status: SaveStatus) {
        self.inner.callbacks.status(status);
    }

    /// Snapshot of the full draft state.
    pub fn status(&self) -> DraftState {
        self.state().clone()
    }

    /// Current state-machine position.
    pub fn phase(&self) -> DraftPhase {
        self.state().phase()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().is_dirty
    }

    /// Record that local data changed. A supplied payload replaces the
    /// pending one; without one, the form is read at save time. Never saves.
    pub fn mark_dirty(&self, payload: Option<Payload>) {
        if self.is_detached() {
            return;
        }
        self.state().record_edit(payload);
        self.emit(SaveStatus::Dirty);
    }

    /// Save now.
    ///
    /// Payload priority: `payload` argument, then the pending payload, then a
    /// fresh form snapshot. An empty payload is not an error, just nothing to do.
    pub async fn save(&self, payload: Option<Payload>) -> SaveOutcome {
        if self.is_detached() {
            return SaveOutcome::Skipped(SkipReason::Disabled);
        }

        // The revision is read with the payload so an edit landing before
        // the guard is claimed still counts as newer than this save.
        let (pending, revision) = {
            let state = self.state();
            if !state.is_enabled {
                return SaveOutcome::Skipped(SkipReason::Disabled);
            }
            if state.is_saving {
                return SaveOutcome::Skipped(SkipReason::InFlight);
            }
            let pending = if payload.is_some() {
                None
            } else {
                state.pending_payload.clone()
            };
            (pending, state.revision)
        };

        let payload = match payload.or(pending) {
            Some(payload) => payload,
            None => self.inner.form.collect(),
        };
        if payload.is_empty() {
            tracing::trace!(document_id = %self.inner.document_id, "nothing to save");
            return SaveOutcome::Skipped(SkipReason::Empty);
        }

        // Re-check under the same lock that claims the guard.
        let online = {
            let mut state = self.state();
            if !state.is_enabled {
                return SaveOutcome::Skipped(SkipReason::Disabled);
            }
            if state.is_saving {
                return SaveOutcome::Skipped(SkipReason::InFlight);
            }
            if state.is_online {
                state.is_saving = true;
            } else {
                if state.revision == revision {
                    state.pending_payload = Some(payload.clone());
                    state.is_dirty = true;
                } else {
                    state.retain(payload.clone());
                }
                state.retry_count = 0;
            }
            state.is_online
        };

        if !online {
            tracing::info!(document_id = %self.inner.document_id, "offline; draft held for later");
            self.emit(SaveStatus::Offline);
            return SaveOutcome::Deferred;
        }
        self.durable_save(payload, revision).await
    }

    /// Collect the form, mark it dirty, and save. For "save now" buttons and
    /// pre-submit flushes.
    pub async fn force_save(&self) -> SaveOutcome {
        if self.is_detached() {
            return SaveOutcome::Skipped(SkipReason::Disabled);
        }
        let snapshot = self.inner.form.collect();
        if !snapshot.is_empty() {
            self.mark_dirty(Some(snapshot));
        }
        self.save(None).await
    }

    /// Caller must have set `is_saving`.
    async fn durable_save(&self, payload: Payload, revision: u64) -> SaveOutcome {
        let mut guard = SavingGuard {
            inner: &self.inner,
            armed: true,
        };
        self.emit(SaveStatus::Saving);

        let request = SaveRequest::new(payload, &self.inner.client, SaveTrigger::Periodic);
        let result = self
            .inner
            .transport
            .save(&self.inner.document_id, &request)
            .await;

        let outcome = match result {
            Ok(receipt) => self.record_success(receipt, revision),
            Err(error) => self.record_failure(request.content, revision, error),
        };
        guard.armed = false;
        outcome
    }

    fn record_success(&self, receipt: SaveReceipt, revision: u64) -> SaveOutcome {
        let still_dirty = {
            let mut state = self.state();
            state.is_saving = false;
            if self.inner.destroyed.load(Ordering::SeqCst) {
                return SaveOutcome::Saved(receipt);
            }
            state.retry_count = 0;
            state.last_save_time = Some(Utc::now());
            state.save_count += 1;
            if receipt.version.is_some() {
                state.last_version = receipt.version;
            }
            if state.revision == revision {
                state.clear_pending();
            }
            state.is_dirty
        };
        // A retry queued by an earlier failure would resend older data.
        lock(&self.inner.retries).abort_all();

        tracing::info!(
            document_id = %self.inner.document_id,
            version = ?receipt.version,
            superseded = still_dirty,
            "draft saved"
        );
        self.emit(if still_dirty {
            SaveStatus::Dirty
        } else {
            SaveStatus::Clean
        });
        self.inner.callbacks.save_success(&receipt);
        SaveOutcome::Saved(receipt)
    }

    fn record_failure(&self, payload: Payload, revision: u64, error: DraftError) -> SaveOutcome {
        let max_retries = self.inner.options.max_retries;
        let next_attempt = {
            let mut state = self.state();
            state.is_saving = false;
            if self.inner.destroyed.load(Ordering::SeqCst) {
                return SaveOutcome::Failed;
            }
            if state.revision == revision {
                // No edit since this attempt began: the failed payload is the newest.
                state.pending_payload = Some(payload);
                state.is_dirty = true;
            } else {
                state.retain(payload);
            }
            state.retry_count += 1;
            if state.retry_count < max_retries {
                Some(state.retry_count)
            } else {
                state.retry_count = 0;
                None
            }
        };

        match next_attempt {
            Some(attempt) => {
                tracing::warn!(
                    document_id = %self.inner.document_id,
                    attempt,
                    max_retries,
                    error = %error,
                    "autosave failed; retrying"
                );
                self.schedule_retry();
                self.emit(SaveStatus::Retrying);
                SaveOutcome::RetryScheduled { attempt }
            }
            None => {
                tracing::error!(
                    document_id = %self.inner.document_id,
                    max_retries,
                    error = %error,
                    "autosave failed; retries exhausted, draft kept locally"
                );
                self.emit(SaveStatus::Error);
                self.inner.callbacks.save_error(&error);
                SaveOutcome::Failed
            }
        }
    }

    fn schedule_retry(&self) {
        let delay = self.inner.options.retry_delay();
        let weak = Arc::downgrade(&self.inner);
        let mut retries = lock(&self.inner.retries);
        while retries.try_join_next().is_some() {}
        retries.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(agent) = Self::upgrade(&weak) {
                agent.retry().await;
            }
        });
    }

    /// A failure always leaves its payload pending, so nothing pending
    /// means a later save or `destroy` already settled it.
    async fn retry(&self) -> SaveOutcome {
        let latest = self.state().pending_payload.clone();
        match latest {
            Some(payload) => self.save(Some(payload)).await,
            None => SaveOutcome::Skipped(SkipReason::Empty),
        }
    }

    /// Hand the pending draft to the transport's unload beacon.
    ///
    /// Returns whether a beacon was dispatched. Delivery is unconfirmed and
    /// the draft state is left untouched.
    pub fn emergency_flush(&self) -> bool {
        if self.is_detached() {
            return false;
        }
        let payload = {
            let state = self.state();
            if !state.is_online {
                return false;
            }
            state.pending_payload.clone()
        };
        let Some(payload) = payload else {
            return false;
        };

        let request = SaveRequest::new(payload, &self.inner.client, SaveTrigger::PageUnload);
        self.inner
            .transport
            .send_beacon(&self.inner.document_id, request);
        tracing::info!(document_id = %self.inner.document_id, "unload beacon dispatched");
        true
    }

    /// React to a host event. The subscribed listener calls this; hosts
    /// without an [`EventSource`] may call it directly.
    pub async fn handle_event(&self, event: HostEvent) {
        if self.is_detached() {
            return;
        }
        match event {
            HostEvent::Online => {
                let dirty = {
                    let mut state = self.state();
                    state.is_online = true;
                    state.is_dirty
                };
                tracing::info!(document_id = %self.inner.document_id, dirty, "connectivity restored");
                self.inner.callbacks.online();
                if dirty {
                    self.save(None).await;
                }
            }
            HostEvent::Offline => {
                self.state().is_online = false;
                tracing::warn!(document_id = %self.inner.document_id, "connectivity lost");
                self.emit(SaveStatus::Offline);
                self.inner.callbacks.offline();
            }
            HostEvent::Hidden => {
                if self.is_dirty() {
                    self.save(None).await;
                }
            }
            HostEvent::Visible => {}
            HostEvent::Unload => {
                if self.is_dirty() {
                    self.emergency_flush();
                }
            }
        }
    }

    /// Start periodic saving. State is untouched.
    pub fn enable(&self) {
        if self.is_detached() {
            return;
        }
        self.state().is_enabled = true;
        self.start_timer();
        tracing::debug!(document_id = %self.inner.document_id, "autosave enabled");
    }

    /// Stop periodic saving and cancel any scheduled retry without
    /// discarding the draft. The next cycle starts with a fresh retry budget.
    pub fn disable(&self) {
        if self.is_detached() {
            return;
        }
        {
            let mut state = self.state();
            state.is_enabled = false;
            state.retry_count = 0;
        }
        if let Some(handle) = lock(&self.inner.timer).take() {
            handle.abort();
        }
        lock(&self.inner.retries).abort_all();
        tracing::debug!(document_id = %self.inner.document_id, "autosave disabled");
    }

    /// Detach: stop the timer, retries and event listener, and discard any
    /// pending draft without saving it. Flush first if the draft matters.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in [&self.inner.timer, &self.inner.listener] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
        lock(&self.inner.retries).abort_all();

        let discarded = {
            let mut state = self.state();
            let discarded = state.pending_payload.is_some() || state.is_dirty;
            state.clear_pending();
            state.is_enabled = false;
            discarded
        };
        if discarded {
            tracing::warn!(document_id = %self.inner.document_id, "autosave detached; unsaved draft discarded");
        } else {
            tracing::debug!(document_id = %self.inner.document_id, "autosave detached");
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn start_timer(&self) {
        let mut timer = lock(&self.inner.timer);
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let period = self.inner.options.save_interval();
        let weak = Arc::downgrade(&self.inner);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(agent) = Self::upgrade(&weak) else {
                    break;
                };
                if agent.is_dirty() {
                    agent.save(None).await;
                }
            }
        }));
    }

    fn attach_listener(&self) {
        let Some(events) = &self.inner.events else {
            return;
        };
        let mut rx = events.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(agent) = Self::upgrade(&weak) else {
                            break;
                        };
                        agent.handle_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "host event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *lock(&self.inner.listener) = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HostSignals;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // ── test doubles ─────────────────────────────────────────────────

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Ok(i64),
        Fail(u16),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<SaveRequest>>,
        beacons: Mutex<Vec<SaveRequest>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedTransport {
        fn new(steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.iter().copied().collect()),
                ..Self::default()
            })
        }

        fn slow(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                latency,
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<SaveRequest> {
            self.calls.lock().unwrap().clone()
        }

        fn beacons(&self) -> Vec<SaveRequest> {
            self.beacons.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SaveTransport for ScriptedTransport {
        async fn save(
            &self,
            _document_id: &str,
            request: &SaveRequest,
        ) -> Result<SaveReceipt, DraftError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(request.clone());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Fail(status)) => Err(DraftError::Status {
                    status,
                    body: "scripted failure".to_string(),
                }),
                Some(Step::Ok(version)) => Ok(SaveReceipt {
                    version: Some(version),
                    ..SaveReceipt::default()
                }),
                None => Ok(SaveReceipt::default()),
            }
        }

        fn send_beacon(&self, _document_id: &str, request: SaveRequest) {
            self.beacons.lock().unwrap().push(request);
        }
    }

    #[derive(Default, Clone)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn callbacks(&self) -> Callbacks {
            let (a, b, c, d, e) = (
                self.log.clone(),
                self.log.clone(),
                self.log.clone(),
                self.log.clone(),
                self.log.clone(),
            );
            Callbacks::default()
                .with_on_status(move |s| a.lock().unwrap().push(format!("status:{}", s)))
                .with_on_save_success(move |_| b.lock().unwrap().push("success".into()))
                .with_on_save_error(move |_| c.lock().unwrap().push("error".into()))
                .with_on_offline(move || d.lock().unwrap().push("offline".into()))
                .with_on_online(move || e.lock().unwrap().push("online".into()))
        }

        fn count(&self, entry: &str) -> usize {
            self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
        }

        fn last_status(&self) -> Option<String> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|e| e.starts_with("status:"))
                .cloned()
        }
    }

    fn payload(text: &str) -> Payload {
        let mut map = Payload::new();
        map.insert("text".to_string(), json!(text));
        map
    }

    /// Long interval keeps the periodic timer out of tests that don't exercise it.
    fn quiet_options() -> AgentOptions {
        AgentOptions::default().with_save_interval(Duration::from_secs(3600))
    }

    fn agent(transport: &Arc<ScriptedTransport>, options: AgentOptions, recorder: &Recorder) -> DraftAgent {
        let deps = AgentDeps::new(transport.clone()).with_callbacks(recorder.callbacks());
        DraftAgent::configure("r1", options, deps)
    }

    fn agent_with_events(
        transport: &Arc<ScriptedTransport>,
        signals: &Arc<HostSignals>,
        recorder: &Recorder,
    ) -> DraftAgent {
        let deps = AgentDeps::new(transport.clone())
            .with_callbacks(recorder.callbacks())
            .with_events(signals.clone());
        DraftAgent::configure("r1", quiet_options(), deps)
    }

    // ── scenarios ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_successful_save_returns_to_clean() {
        let transport = ScriptedTransport::new(&[Step::Ok(1)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("hello")));
        assert_eq!(agent.phase(), DraftPhase::Dirty);

        let outcome = agent.save(None).await;
        assert!(matches!(outcome, SaveOutcome::Saved(_)));

        let state = agent.status();
        assert!(!state.is_dirty);
        assert!(!state.is_saving);
        assert!(state.pending_payload.is_none());
        assert!(state.last_save_time.is_some());
        assert_eq!(state.retry_count, 0);
        assert_eq!(agent.phase(), DraftPhase::Clean);
        assert_eq!(recorder.count("success"), 1);
        assert_eq!(recorder.last_status().as_deref(), Some("status:clean"));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].content, payload("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let transport = ScriptedTransport::new(&[Step::Fail(500), Step::Fail(502), Step::Ok(3)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options().with_max_retries(3), &recorder);

        agent.mark_dirty(Some(payload("draft")));
        let outcome = agent.save(None).await;
        assert_eq!(outcome, SaveOutcome::RetryScheduled { attempt: 1 });
        assert_eq!(agent.phase(), DraftPhase::Retrying(1));

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.calls().len(), 3);
        assert_eq!(recorder.count("status:retrying"), 2);
        assert_eq!(recorder.count("success"), 1);
        assert_eq!(recorder.count("error"), 0);
        let state = agent.status();
        assert_eq!(state.retry_count, 0);
        assert!(!state.is_dirty);
        assert_eq!(state.last_version, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_keeps_draft() {
        let transport = ScriptedTransport::new(&[Step::Fail(500), Step::Fail(500), Step::Fail(500)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options().with_max_retries(3), &recorder);

        agent.mark_dirty(Some(payload("keep me")));
        agent.save(None).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.calls().len(), 3, "no automatic fourth attempt");
        assert_eq!(recorder.count("error"), 1);
        assert_eq!(recorder.count("status:error"), 1);
        assert_eq!(recorder.count("success"), 0);

        let state = agent.status();
        assert_eq!(state.pending_payload, Some(payload("keep me")));
        assert!(state.is_dirty);
        assert_eq!(state.retry_count, 0);
        assert_eq!(agent.phase(), DraftPhase::Dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_defers_until_connectivity_returns() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let signals = Arc::new(HostSignals::new(false));
        let agent = agent_with_events(&transport, &signals, &recorder);

        agent.mark_dirty(Some(payload("offline edit")));
        assert_eq!(agent.save(None).await, SaveOutcome::Deferred);
        assert!(transport.calls().is_empty());
        assert_eq!(recorder.last_status().as_deref(), Some("status:offline"));
        assert_eq!(agent.phase(), DraftPhase::OfflinePending);

        // A second attempt while offline still sends nothing.
        assert_eq!(agent.save(None).await, SaveOutcome::Deferred);
        assert!(transport.calls().is_empty());

        signals.emit(HostEvent::Online);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].content, payload("offline edit"));
        assert_eq!(recorder.count("online"), 1);
        assert!(!agent.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_discards_without_saving() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("unsaved")));
        agent.destroy();

        assert!(transport.calls().is_empty());
        assert!(transport.beacons().is_empty());
        let state = agent.status();
        assert!(state.pending_payload.is_none());
        assert!(!state.is_dirty);
        assert!(!state.is_enabled);
        assert_eq!(
            agent.save(Some(payload("late"))).await,
            SaveOutcome::Skipped(SkipReason::Disabled)
        );

        let fresh = DraftAgent::configure("r1", quiet_options(), AgentDeps::new(transport.clone()));
        assert!(fresh.status().pending_payload.is_none());
        assert!(!fresh.is_dirty());
    }

    // ── single-flight and ordering ───────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_saves_are_single_flight() {
        let transport = ScriptedTransport::slow(Duration::from_secs(1));
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("x")));
        let (first, second) = tokio::join!(agent.save(None), agent.save(None));

        let outcomes = [first, second];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, SaveOutcome::Saved(_)))
                .count(),
            1
        );
        assert!(outcomes.contains(&SaveOutcome::Skipped(SkipReason::InFlight)));
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_save_is_not_lost() {
        let transport = ScriptedTransport::slow(Duration::from_secs(1));
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("first")));
        let background = agent.clone();
        let in_flight = tokio::spawn(async move { background.save(None).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.phase(), DraftPhase::Saving);
        agent.mark_dirty(Some(payload("second")));

        assert!(matches!(in_flight.await.unwrap(), SaveOutcome::Saved(_)));
        let state = agent.status();
        assert!(state.is_dirty, "newer edit must stay dirty");
        assert_eq!(state.pending_payload, Some(payload("second")));

        agent.save(None).await;
        let calls = transport.calls();
        assert_eq!(calls[0].content, payload("first"));
        assert_eq!(calls[1].content, payload("second"));
        assert!(!agent.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_explicit_payload_replaces_older_pending() {
        let transport = ScriptedTransport::new(&[Step::Fail(500), Step::Ok(1)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("older")));
        agent.save(Some(payload("explicit"))).await;
        assert_eq!(agent.status().pending_payload, Some(payload("explicit")));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.calls()[1].content, payload("explicit"));
        assert!(!agent.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_picks_up_newest_edit() {
        let transport = ScriptedTransport::new(&[Step::Fail(503), Step::Ok(2)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("v1")));
        assert_eq!(agent.save(None).await, SaveOutcome::RetryScheduled { attempt: 1 });
        agent.mark_dirty(Some(payload("v2")));

        tokio::time::sleep(Duration::from_secs(10)).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].content, payload("v2"));
        assert!(!agent.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_save_supersedes_scheduled_retry() {
        let transport = ScriptedTransport::new(&[Step::Fail(503), Step::Ok(2)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("v1")));
        assert_eq!(agent.save(None).await, SaveOutcome::RetryScheduled { attempt: 1 });
        agent.mark_dirty(Some(payload("v2")));
        assert!(matches!(agent.save(None).await, SaveOutcome::Saved(_)));

        tokio::time::sleep(Duration::from_secs(10)).await;

        let sent: Vec<Payload> = transport.calls().into_iter().map(|c| c.content).collect();
        assert_eq!(sent, vec![payload("v1"), payload("v2")], "stale draft must not be resent");
        assert!(!agent.is_dirty());
        assert_eq!(agent.status().retry_count, 0);
    }

    // ── payload resolution ───────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_clean_save_with_empty_form_sends_nothing() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        assert_eq!(agent.save(None).await, SaveOutcome::Skipped(SkipReason::Empty));
        assert!(transport.calls().is_empty());
        assert_eq!(recorder.count("status:saving"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dirty_without_payload_reads_form_at_save_time() {
        let transport = ScriptedTransport::new(&[]);
        let form = || {
            let mut map = Payload::new();
            map.insert("q1".into(), json!("walked 5k"));
            map
        };
        let deps = AgentDeps::new(transport.clone()).with_form_source(Arc::new(form));
        let agent = DraftAgent::configure("r1", quiet_options(), deps);

        agent.mark_dirty(None);
        assert!(agent.status().pending_payload.is_none());
        agent.save(None).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].content["q1"], "walked 5k");
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_payload_beats_pending() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("pending")));
        agent.save(Some(payload("explicit"))).await;

        assert_eq!(transport.calls()[0].content, payload("explicit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_save_collects_form() {
        let transport = ScriptedTransport::new(&[Step::Ok(8)]);
        let form = || {
            let mut map = Payload::new();
            map.insert("notes".into(), json!("submit me"));
            map
        };
        let deps = AgentDeps::new(transport.clone()).with_form_source(Arc::new(form));
        let agent = DraftAgent::configure("r1", quiet_options(), deps);

        let outcome = agent.force_save().await;
        match outcome {
            SaveOutcome::Saved(receipt) => assert_eq!(receipt.version, Some(8)),
            other => panic!("Expected Saved, got {:?}", other),
        }
        assert_eq!(transport.calls()[0].content["notes"], "submit me");
        assert_eq!(agent.status().save_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_metadata_marks_periodic_trigger() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.save(Some(payload("meta"))).await;

        let metadata = &transport.calls()[0].metadata;
        assert_eq!(metadata.trigger, SaveTrigger::Periodic);
        assert_eq!(metadata.client.name, "draftsave");
    }

    // ── retry bounds ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_fails_immediately() {
        let transport = ScriptedTransport::new(&[Step::Fail(500)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options().with_max_retries(0), &recorder);

        assert_eq!(agent.save(Some(payload("once"))).await, SaveOutcome::Failed);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.calls().len(), 1);
        assert_eq!(recorder.count("error"), 1);
        assert_eq!(agent.status().pending_payload, Some(payload("once")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_scheduled_retry() {
        let transport = ScriptedTransport::new(&[Step::Fail(500)]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.save(Some(payload("doomed"))).await;
        agent.destroy();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_during_failing_save_stays_discarded() {
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(VecDeque::from([Step::Fail(500)])),
            latency: Duration::from_secs(1),
            ..ScriptedTransport::default()
        });
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        agent.mark_dirty(Some(payload("gone")));
        let background = agent.clone();
        let in_flight = tokio::spawn(async move { background.save(None).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.destroy();
        assert_eq!(in_flight.await.unwrap(), SaveOutcome::Failed);

        let state = agent.status();
        assert!(!state.is_dirty);
        assert!(!state.is_saving);
        assert!(state.pending_payload.is_none());
        assert_eq!(state.retry_count, 0);
        assert_eq!(recorder.count("error"), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_retry_and_resets_budget() {
        let transport = ScriptedTransport::new(&[
            Step::Fail(500),
            Step::Fail(500),
            Step::Fail(500),
            Step::Fail(500),
        ]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options().with_max_retries(3), &recorder);

        agent.mark_dirty(Some(payload("paused")));
        assert_eq!(agent.save(None).await, SaveOutcome::RetryScheduled { attempt: 1 });
        agent.disable();
        assert_eq!(agent.phase(), DraftPhase::Dirty);
        assert_eq!(agent.status().retry_count, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.calls().len(), 1, "retry must not fire while disabled");
        assert_eq!(agent.phase(), DraftPhase::Dirty);

        agent.enable();
        assert_eq!(agent.save(None).await, SaveOutcome::RetryScheduled { attempt: 1 });
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.calls().len(), 4, "a full budget of three attempts");
        assert_eq!(recorder.count("error"), 1);
        assert_eq!(agent.status().pending_payload, Some(payload("paused")));
    }

    // ── scheduler ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_saves_only_when_dirty() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let options = AgentOptions::default().with_save_interval(Duration::from_secs(30));
        let agent = agent(&transport, options, &recorder);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(transport.calls().is_empty(), "clean draft is not saved");

        agent.mark_dirty(Some(payload("tick")));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls().len(), 1);
        assert!(!agent.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_and_enable_toggle_scheduler() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let options = AgentOptions::default().with_save_interval(Duration::from_secs(30));
        let agent = agent(&transport, options, &recorder);

        agent.disable();
        agent.mark_dirty(Some(payload("held")));
        assert_eq!(
            agent.save(None).await,
            SaveOutcome::Skipped(SkipReason::Disabled)
        );
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(transport.calls().is_empty());
        assert_eq!(agent.status().pending_payload, Some(payload("held")));

        agent.enable();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_disabled_at_configure() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options().with_enabled(false), &recorder);

        assert!(!agent.status().is_enabled);
        agent.mark_dirty(Some(payload("x")));
        assert_eq!(
            agent.save(None).await,
            SaveOutcome::Skipped(SkipReason::Disabled)
        );
    }

    // ── inert agent ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_missing_document_id_is_inert() {
        let transport = ScriptedTransport::new(&[]);
        let signals = Arc::new(HostSignals::default());
        let deps = AgentDeps::new(transport.clone()).with_events(signals.clone());
        let agent = DraftAgent::configure("  ", AgentOptions::default(), deps);

        assert_eq!(agent.document_id(), None);
        assert!(!agent.status().is_enabled);
        assert_eq!(signals.subscriber_count(), 0);

        agent.mark_dirty(Some(payload("ignored")));
        assert!(!agent.is_dirty());
        assert_eq!(
            agent.save(Some(payload("ignored"))).await,
            SaveOutcome::Skipped(SkipReason::Disabled)
        );
        assert!(!agent.emergency_flush());
        agent.enable();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(transport.calls().is_empty());
    }

    // ── host events and unload ───────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_emergency_flush_sends_beacon_without_changing_state() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let agent = agent(&transport, quiet_options(), &recorder);

        assert!(!agent.emergency_flush(), "nothing pending");

        agent.mark_dirty(Some(payload("closing")));
        assert!(agent.emergency_flush());

        let beacons = transport.beacons();
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].content, payload("closing"));
        assert_eq!(beacons[0].metadata.trigger, SaveTrigger::PageUnload);
        assert!(transport.calls().is_empty());
        assert!(agent.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_flush_skipped_offline() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let signals = Arc::new(HostSignals::new(false));
        let agent = agent_with_events(&transport, &signals, &recorder);

        agent.mark_dirty(Some(payload("stuck")));
        assert!(!agent.emergency_flush());
        assert!(transport.beacons().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_events_drive_saves_and_flush() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let signals = Arc::new(HostSignals::default());
        let agent = agent_with_events(&transport, &signals, &recorder);

        signals.emit(HostEvent::Hidden);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.calls().is_empty(), "hidden while clean does nothing");

        agent.mark_dirty(Some(payload("tab hidden")));
        signals.emit(HostEvent::Hidden);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.calls().len(), 1);

        agent.mark_dirty(Some(payload("closing tab")));
        signals.emit(HostEvent::Unload);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.beacons().len(), 1);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_events_notify() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let signals = Arc::new(HostSignals::default());
        let agent = agent_with_events(&transport, &signals, &recorder);

        signals.emit(HostEvent::Offline);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!agent.status().is_online);
        assert_eq!(recorder.count("offline"), 1);
        assert_eq!(recorder.last_status().as_deref(), Some("status:offline"));

        signals.emit(HostEvent::Online);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(agent.status().is_online);
        assert_eq!(recorder.count("online"), 1);
        assert!(transport.calls().is_empty(), "clean draft is not saved on reconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_unsubscribes_from_host_events() {
        let transport = ScriptedTransport::new(&[]);
        let recorder = Recorder::default();
        let signals = Arc::new(HostSignals::default());
        let agent = agent_with_events(&transport, &signals, &recorder);
        assert_eq!(signals.subscriber_count(), 1);

        agent.destroy();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(signals.subscriber_count(), 0);

        agent.mark_dirty(Some(payload("after destroy")));
        signals.emit(HostEvent::Hidden);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.calls().is_empty());
    }
}
