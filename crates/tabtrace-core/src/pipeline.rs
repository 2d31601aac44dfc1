//! Pipeline wiring: page producers and the tab consumer.
//!
//! A [`Producer`] runs per page context. It owns the admission gates
//! and the batch queue, stamps session identity on every event, and
//! emits [`EventBatch`]es for the host to forward. It is a synchronous
//! state machine driven by explicit timestamps; the host calls
//! [`Producer::tick`] from its timer.
//!
//! The [`Consumer`] runs once per process. It receives batches from
//! all tabs over a channel, enriches events into rows, appends them to
//! the durable buffer, queues them for upload, and answers handshakes.
//! Network observation hooks feed the correlation table through the
//! same channel, so all consumer state is touched from one task and
//! needs no locking.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::batcher::{EventBatch, EventBatcher, FlushReason};
use crate::buffer::DurableBuffer;
use crate::config::Config;
use crate::correlate::{CorrelationTable, RequestKind};
use crate::deliver::Uploader;
use crate::enrich::{self, StateDebouncer, StateFields};
use crate::error::Result;
use crate::event::{
    ActionPayload, BatchAck, HelloAck, HostMessage, PageMessage, PageReply, RawEvent,
};
use crate::export;
use crate::ratelimit::{EntityId, MenuDedup, RateLimiter, SamplingGate};
use crate::session::{IdentityManager, LoginFieldCandidate, SessionIdentity};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const FLUSH_CHANNEL_CAPACITY: usize = 8;
const FALLBACK_LOGIN_ID: &str = "unknown";

// ─── Final-value debounce ────────────────────────────────────────────

/// Holds the latest value-change event per entity until it settles.
///
/// A newer event for the same entity supersedes the pending one and
/// restarts its deadline; only the settled value ever reaches the
/// queue.
#[derive(Debug, Default)]
struct FinalValueDebouncer {
    pending: HashMap<EntityId, (i64, RawEvent)>,
}

impl FinalValueDebouncer {
    fn pend(&mut self, entity: EntityId, event: RawEvent, deadline_ms: i64) {
        self.pending.insert(entity, (deadline_ms, event));
    }

    /// Events whose deadline has passed, in deadline order.
    fn take_due(&mut self, now_ms: i64) -> Vec<RawEvent> {
        let due: Vec<EntityId> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        let mut events: Vec<(i64, RawEvent)> = due
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        events.sort_by_key(|(deadline, _)| *deadline);
        events.into_iter().map(|(_, ev)| ev).collect()
    }

    /// Commit everything immediately, deadline or not. Used on
    /// pagehide so a half-typed value is not lost.
    fn take_all(&mut self) -> Vec<RawEvent> {
        let mut events: Vec<(i64, RawEvent)> = self.pending.drain().map(|(_, v)| v).collect();
        events.sort_by_key(|(deadline, _)| *deadline);
        events.into_iter().map(|(_, ev)| ev).collect()
    }

    fn evict_entity(&mut self, entity: EntityId) {
        self.pending.remove(&entity);
    }
}

// ─── Producer ────────────────────────────────────────────────────────

/// Page-side capture front end.
pub struct Producer {
    batcher: EventBatcher,
    limiter: RateLimiter,
    sampler: SamplingGate,
    menu_dedup: MenuDedup,
    finals: FinalValueDebouncer,
    session: SessionIdentity,
    flush_interval_ms: i64,
    final_debounce_ms: i64,
    last_interval_flush_ms: i64,
    next_entity: u64,
}

impl Producer {
    #[must_use]
    pub fn new(config: &Config, install_id: Option<String>, now_ms: i64) -> Self {
        Self {
            batcher: EventBatcher::new(config.batcher.max_queue),
            limiter: RateLimiter::from_config(&config.capture),
            sampler: SamplingGate::new(config.capture.key_sampling_ms),
            menu_dedup: MenuDedup::new(config.capture.menu_dedup_ms),
            finals: FinalValueDebouncer::default(),
            session: SessionIdentity {
                install_id,
                browser_session_id: None,
                tab_id: None,
                page_session_id: Some(crate::session::new_page_session_id()),
            },
            flush_interval_ms: i64::try_from(config.batcher.flush_interval_ms)
                .unwrap_or(i64::MAX),
            final_debounce_ms: config.capture.final_debounce_ms,
            last_interval_flush_ms: now_ms,
            next_entity: 0,
        }
    }

    /// Issue a fresh handle for a DOM entity the capture layer starts
    /// tracking.
    pub fn register_entity(&mut self) -> EntityId {
        let id = EntityId(self.next_entity);
        self.next_entity += 1;
        id
    }

    /// Release all gate state for a detached entity.
    pub fn evict_entity(&mut self, entity: EntityId) {
        self.limiter.evict_entity(entity);
        self.menu_dedup.evict_entity(entity);
        self.finals.evict_entity(entity);
    }

    /// Adopt the identity returned by the consumer handshake.
    pub fn apply_hello_ack(&mut self, ack: &HelloAck) {
        self.session.browser_session_id = ack.browser_session_id.clone();
        self.session.tab_id = ack.tab_id;
    }

    #[must_use]
    pub fn session(&self) -> &SessionIdentity {
        &self.session
    }

    fn stamp(&self, mut event: RawEvent) -> RawEvent {
        event.session = self.session.clone();
        event
    }

    /// Observe a captured event. Returns batches ready to forward
    /// (zero, one, or one per action flush).
    pub fn observe(
        &mut self,
        entity: EntityId,
        event: RawEvent,
        now_ms: i64,
    ) -> Vec<EventBatch> {
        let event = self.stamp(event);
        match &event.payload {
            ActionPayload::GenericInstant { subtype, .. } => {
                let kind = subtype.clone();
                if !self.limiter.admit(entity, &kind, now_ms) {
                    return Vec::new();
                }
                if !self.sampler.admit(&kind, now_ms) {
                    return Vec::new();
                }
                self.push(event)
            }
            ActionPayload::InputChange { .. } => {
                self.finals
                    .pend(entity, event, now_ms + self.final_debounce_ms);
                Vec::new()
            }
            ActionPayload::MenuClick { .. } => {
                if !self.menu_dedup.admit(entity, now_ms) {
                    return Vec::new();
                }
                self.push_and_flush(event, "menu-click")
            }
            ActionPayload::RouteChange { .. } => self.push_and_flush(event, "route-change"),
            ActionPayload::PageView { .. } => self.push_and_flush(event, "page-view"),
            _ => self.push(event),
        }
    }

    fn push(&mut self, event: RawEvent) -> Vec<EventBatch> {
        self.batcher.push(event).into_iter().collect()
    }

    /// Navigation-grade actions do not wait for the interval; they
    /// carry the queue out under their own reason.
    fn push_and_flush(&mut self, event: RawEvent, reason: &str) -> Vec<EventBatch> {
        let mut out = self.push(event);
        if let Some(batch) = self.batcher.flush(FlushReason::Action(reason.to_string())) {
            out.push(batch);
        }
        out
    }

    /// Timer entry point: commit settled input values and run the
    /// interval flush.
    pub fn tick(&mut self, now_ms: i64) -> Vec<EventBatch> {
        let mut out = Vec::new();
        for ev in self.finals.take_due(now_ms) {
            out.extend(self.push(ev));
        }
        if now_ms - self.last_interval_flush_ms >= self.flush_interval_ms {
            self.last_interval_flush_ms = now_ms;
            if let Some(batch) = self.batcher.flush(FlushReason::Interval) {
                out.push(batch);
            }
        }
        out
    }

    /// The consumer asked for causally-preceding events (a network
    /// request is starting).
    pub fn on_flush_request(&mut self, now_ms: i64) -> Vec<EventBatch> {
        let mut out = Vec::new();
        for ev in self.finals.take_due(now_ms) {
            out.extend(self.push(ev));
        }
        if let Some(batch) = self.batcher.flush(FlushReason::Request) {
            out.push(batch);
        }
        out
    }

    /// Page visibility became hidden.
    pub fn page_hidden(&mut self) -> Vec<EventBatch> {
        self.drain_everything(FlushReason::Hidden)
    }

    /// Page is unloading; last chance to flush.
    pub fn page_unload(&mut self) -> Vec<EventBatch> {
        self.drain_everything(FlushReason::Pagehide)
    }

    fn drain_everything(&mut self, reason: FlushReason) -> Vec<EventBatch> {
        let mut out = Vec::new();
        for ev in self.finals.take_all() {
            out.extend(self.push(ev));
        }
        if let Some(batch) = self.batcher.flush(reason) {
            out.push(batch);
        }
        out
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.batcher.len()
    }
}

// ─── Consumer commands ───────────────────────────────────────────────

/// Everything the consumer task reacts to.
pub enum Command {
    /// A message from a page producer.
    Page {
        tab_id: i64,
        msg: PageMessage,
        reply: Option<oneshot::Sender<PageReply>>,
    },
    /// Network observation: request leaving the tab.
    RequestStart {
        tab_id: i64,
        kind: RequestKind,
        url: String,
        method: String,
        ts: i64,
    },
    /// Network observation: response arrived.
    RequestEnd {
        tab_id: i64,
        url: String,
        method: String,
        status: i32,
        ts: i64,
    },
    /// Network observation: transport failure.
    RequestError {
        tab_id: i64,
        url: String,
        method: String,
        ts: i64,
    },
    /// A tab came up; the consumer may push flush requests to it.
    RegisterTab {
        tab_id: i64,
        flush: mpsc::Sender<HostMessage>,
    },
    /// A tab closed; drop all its state.
    TabClosed { tab_id: i64 },
    /// Candidate login fields observed on the page.
    LoginFields { fields: Vec<LoginFieldCandidate> },
    /// Export the durable buffer to a timestamped CSV in `dir`.
    Export {
        dir: PathBuf,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    /// Drop the durable buffer contents.
    ClearBuffer,
}

/// Cloneable handle for talking to the consumer task.
#[derive(Clone)]
pub struct ConsumerHandle {
    tx: mpsc::Sender<Command>,
}

impl ConsumerHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| crate::error::Error::ChannelClosed)
    }

    /// Forward a producer batch and wait for the ack.
    pub async fn send_batch(&self, tab_id: i64, batch: EventBatch) -> Result<BatchAck> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Page {
            tab_id,
            msg: PageMessage::BatchEvents {
                reason: batch.reason.to_string(),
                events: batch.events,
            },
            reply: Some(reply_tx),
        })
        .await?;
        match reply_rx.await {
            Ok(PageReply::Batch(ack)) => Ok(ack),
            _ => Err(crate::error::Error::ChannelClosed),
        }
    }

    /// Session handshake. `None` when the consumer does not answer in
    /// time; capture proceeds without identity.
    pub async fn hello(&self, tab_id: i64, timeout: Duration) -> Option<HelloAck> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Page {
            tab_id,
            msg: PageMessage::Hello,
            reply: Some(reply_tx),
        })
        .await
        .ok()?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(PageReply::Hello(ack))) => Some(ack),
            _ => None,
        }
    }

    pub async fn export(&self, dir: PathBuf) -> Result<PathBuf> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Export {
            dir,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| crate::error::Error::ChannelClosed)?
    }
}

// ─── Consumer ────────────────────────────────────────────────────────

/// Process-wide enrichment and delivery hub.
pub struct Consumer {
    identity: IdentityManager,
    correlation: CorrelationTable,
    state_debounce: StateDebouncer,
    buffer: DurableBuffer,
    uploader: Arc<Uploader>,
    flush_channels: HashMap<i64, mpsc::Sender<HostMessage>>,
    login_id: String,
}

impl Consumer {
    #[must_use]
    pub fn new(config: &Config, identity: IdentityManager, uploader: Arc<Uploader>) -> Self {
        Self {
            identity,
            correlation: CorrelationTable::new(),
            state_debounce: StateDebouncer::new(config.correlation.state_debounce_ms),
            buffer: DurableBuffer::new(),
            uploader,
            flush_channels: HashMap::new(),
            login_id: FALLBACK_LOGIN_ID.to_string(),
        }
    }

    /// Spawn the consumer loop. The task exits when every handle is
    /// dropped.
    pub fn spawn(mut self) -> (ConsumerHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let join = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                self.handle(command);
            }
            tracing::debug!("consumer channel closed, stopping");
        });
        (ConsumerHandle { tx }, join)
    }

    /// Apply one command to consumer state.
    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Page { tab_id, msg, reply } => match msg {
                PageMessage::Hello => {
                    tracing::debug!(tab_id, "handshake");
                    if let Some(reply) = reply {
                        let _ = reply.send(PageReply::Hello(self.identity.hello_ack(Some(tab_id))));
                    }
                }
                PageMessage::BatchEvents { reason, events } => {
                    let ack = self.ingest_batch(tab_id, &reason, events);
                    if let Some(reply) = reply {
                        let _ = reply.send(PageReply::Batch(ack));
                    }
                }
            },
            Command::RequestStart {
                tab_id,
                kind,
                url,
                method,
                ts,
            } => {
                if self.correlation.on_request_start(tab_id, kind, &url, &method, ts) {
                    self.request_flush(tab_id);
                }
            }
            Command::RequestEnd {
                tab_id,
                url,
                method,
                status,
                ts,
            } => self.correlation.on_request_end(tab_id, &url, &method, status, ts),
            Command::RequestError {
                tab_id,
                url,
                method,
                ts,
            } => self.correlation.on_request_error(tab_id, &url, &method, ts),
            Command::RegisterTab { tab_id, flush } => {
                self.flush_channels.insert(tab_id, flush);
            }
            Command::TabClosed { tab_id } => {
                self.correlation.evict_tab(tab_id);
                self.state_debounce.evict_tab(tab_id);
                self.flush_channels.remove(&tab_id);
            }
            Command::LoginFields { fields } => {
                if let Some(guess) = crate::session::guess_login_id(&fields) {
                    tracing::debug!("login guess updated");
                    self.login_id = guess;
                }
            }
            Command::Export { dir, reply } => {
                let now = chrono::Utc::now().timestamp_millis();
                let _ = reply.send(export::write_export(&dir, self.buffer.rows(), now));
            }
            Command::ClearBuffer => self.buffer.clear(),
        }
    }

    /// Enrich a batch into rows, buffer and queue them, and kick an
    /// immediate drain for action-triggered flushes.
    pub fn ingest_batch(&mut self, tab_id: i64, reason: &str, events: Vec<RawEvent>) -> BatchAck {
        let mut accepted = 0;
        for event in events {
            if let ActionPayload::PostState {
                title,
                modal_text,
                alert_text,
            } = &event.payload
            {
                let fields = StateFields {
                    title: title.clone(),
                    modal_text: modal_text.clone(),
                    alert_text: alert_text.clone(),
                };
                if !self.state_debounce.accept(tab_id, &fields, event.timestamp) {
                    continue;
                }
            }

            let session = self.complete_session(tab_id, &event.session);
            let Some(row) =
                enrich::build_row(&event, self.correlation.get(tab_id), &session, &self.login_id)
            else {
                continue;
            };
            let row = Arc::new(row);
            self.buffer.append(Arc::clone(&row));
            self.uploader.enqueue(row);
            accepted += 1;
        }
        tracing::debug!(tab_id, reason, accepted, "batch ingested");

        let reason = FlushReason::from(reason.to_string());
        if accepted > 0 {
            if let FlushReason::Action(name) = reason {
                let uploader = Arc::clone(&self.uploader);
                tokio::spawn(async move {
                    let now = chrono::Utc::now().timestamp_millis();
                    let _ = uploader.drain_once(Some(&name), now).await;
                });
            }
        }
        BatchAck { ok: true, accepted }
    }

    /// Fill identity fields the producer did not have at capture time.
    fn complete_session(&self, tab_id: i64, session: &SessionIdentity) -> SessionIdentity {
        SessionIdentity {
            install_id: session
                .install_id
                .clone()
                .or_else(|| Some(self.identity.install_id().to_string())),
            browser_session_id: session
                .browser_session_id
                .clone()
                .or_else(|| Some(self.identity.browser_session_id().to_string())),
            tab_id: session.tab_id.or(Some(tab_id)),
            page_session_id: session.page_session_id.clone(),
        }
    }

    /// Best-effort flush request toward the tab's producer. A full
    /// channel or gone tab is not an error.
    fn request_flush(&mut self, tab_id: i64) {
        if let Some(tx) = self.flush_channels.get(&tab_id) {
            if tx.try_send(HostMessage::FlushRequest).is_err() {
                tracing::trace!(tab_id, "flush request dropped");
            }
        }
    }

    #[must_use]
    pub fn buffer(&self) -> &DurableBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn correlation(&self) -> &CorrelationTable {
        &self.correlation
    }
}

/// Bounded channel for consumer-to-tab flush requests.
#[must_use]
pub fn flush_channel() -> (mpsc::Sender<HostMessage>, mpsc::Receiver<HostMessage>) {
    mpsc::channel(FLUSH_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, UploaderConfig};
    use crate::deliver::{
        DeliveryResult, DrainOutcome, IngestTransport, NoopTransport, UploadBody,
    };
    use crate::event::TargetDescriptor;

    struct RefusingTransport;

    impl IngestTransport for RefusingTransport {
        fn send<'a>(
            &'a self,
            _body: &'a UploadBody<'a>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = DeliveryResult> + Send + 'a>>
        {
            Box::pin(async { DeliveryResult::err("connection refused") })
        }
    }

    fn config() -> Config {
        Config::default()
    }

    fn click(ts: i64) -> RawEvent {
        RawEvent {
            source_url: "https://a.com/orders".to_string(),
            timestamp: ts,
            target: TargetDescriptor::default(),
            payload: ActionPayload::Click { snapshot: None },
            session: SessionIdentity::default(),
            env: None,
        }
    }

    fn instant(subtype: &str, ts: i64) -> RawEvent {
        RawEvent {
            payload: ActionPayload::GenericInstant {
                subtype: subtype.to_string(),
                key: None,
                ctrl: false,
                alt: false,
                shift: false,
                length: None,
                button: None,
                x: None,
                y: None,
                sensitive: false,
            },
            ..click(ts)
        }
    }

    fn input_change(value: &str, ts: i64) -> RawEvent {
        RawEvent {
            payload: ActionPayload::InputChange {
                value: Some(value.to_string()),
                input_type: Some("text".to_string()),
                raw_len: Some(value.len()),
                selected_text: None,
                snapshot: None,
            },
            ..click(ts)
        }
    }

    fn menu_click(label: &str, ts: i64) -> RawEvent {
        RawEvent {
            payload: ActionPayload::MenuClick {
                label: Some(label.to_string()),
                href: None,
                role: None,
                trail: vec![],
                nav_root: None,
                title: None,
                referrer: None,
                snapshot: None,
            },
            ..click(ts)
        }
    }

    fn consumer() -> Consumer {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            IdentityManager::load_or_create(dir.path(), &SessionConfig::default()).unwrap();
        let uploader = Arc::new(Uploader::new(
            &UploaderConfig::default(),
            Box::new(NoopTransport),
        ));
        Consumer::new(&config(), identity, uploader)
    }

    // ── producer ──

    #[test]
    fn producer_stamps_session_identity() {
        let mut p = Producer::new(&config(), Some("inst-1".to_string()), 0);
        p.apply_hello_ack(&HelloAck {
            browser_session_id: Some("bs-1".to_string()),
            tab_id: Some(4),
        });
        let e = p.register_entity();
        p.observe(e, click(100), 100);
        let batch = p.page_unload().pop().unwrap();
        let session = &batch.events[0].session;
        assert_eq!(session.install_id.as_deref(), Some("inst-1"));
        assert_eq!(session.browser_session_id.as_deref(), Some("bs-1"));
        assert_eq!(session.tab_id, Some(4));
        assert!(session.page_session_id.is_some());
    }

    #[test]
    fn interval_flush_fires_on_tick() {
        let mut p = Producer::new(&config(), None, 0);
        let e = p.register_entity();
        p.observe(e, click(100), 100);
        assert!(p.tick(4_000).is_empty());
        let batches = p.tick(5_000);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reason, FlushReason::Interval);
        assert!(p.tick(10_001).is_empty());
    }

    #[test]
    fn max_queue_flushes_inline() {
        let mut cfg = config();
        cfg.batcher.max_queue = 3;
        let mut p = Producer::new(&cfg, None, 0);
        let e = p.register_entity();
        assert!(p.observe(e, click(1), 1).is_empty());
        assert!(p.observe(e, click(2), 2).is_empty());
        let batches = p.observe(e, click(3), 3);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reason, FlushReason::Max);
        assert_eq!(batches[0].events.len(), 3);
    }

    #[test]
    fn input_changes_settle_before_queueing() {
        let mut p = Producer::new(&config(), None, 0);
        let e = p.register_entity();
        assert!(p.observe(e, input_change("a", 1_000), 1_000).is_empty());
        assert!(p.observe(e, input_change("ab", 1_300), 1_300).is_empty());
        // First deadline (1600) passed but was superseded at 1300.
        assert!(p.tick(1_700).is_empty());
        p.tick(1_900);
        assert_eq!(p.queued(), 1);
        let batch = p.page_unload().pop().unwrap();
        match &batch.events[0].payload {
            ActionPayload::InputChange { value, .. } => {
                assert_eq!(value.as_deref(), Some("ab"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unload_commits_pending_input() {
        let mut p = Producer::new(&config(), None, 0);
        let e = p.register_entity();
        p.observe(e, input_change("half", 1_000), 1_000);
        let batches = p.page_unload();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reason, FlushReason::Pagehide);
        assert_eq!(batches[0].events.len(), 1);
    }

    #[test]
    fn menu_click_flushes_immediately_and_dedups() {
        let mut p = Producer::new(&config(), None, 0);
        let e = p.register_entity();
        p.observe(e, click(1_000), 1_000);

        let batches = p.observe(e, menu_click("Orders", 1_100), 1_100);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].reason,
            FlushReason::Action("menu-click".to_string())
        );
        // Causally preceding click rides in the same batch.
        assert_eq!(batches[0].events.len(), 2);

        // Widget double-fire within the dedup window.
        assert!(p.observe(e, menu_click("Orders", 1_200), 1_200).is_empty());
    }

    #[test]
    fn instants_are_gated() {
        let mut p = Producer::new(&config(), None, 0);
        let e = p.register_entity();
        assert_eq!(p.observe(e, instant("scroll", 1_000), 1_000).len(), 0);
        assert_eq!(p.queued(), 1);
        // Within the 120ms sampling window.
        p.observe(e, instant("scroll", 1_050), 1_050);
        assert_eq!(p.queued(), 1);
        p.observe(e, instant("scroll", 1_200), 1_200);
        assert_eq!(p.queued(), 2);
    }

    #[test]
    fn navigation_actions_flush_under_their_own_reason() {
        let mut p = Producer::new(&config(), None, 0);
        let e = p.register_entity();
        let page_view = RawEvent {
            payload: ActionPayload::PageView {
                title: Some("Orders".to_string()),
                referrer: None,
                viewport: None,
            },
            ..click(1_000)
        };
        let batches = p.observe(e, page_view, 1_000);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].reason,
            FlushReason::Action("page-view".to_string())
        );
        assert!(p.queued() == 0);
    }

    #[test]
    fn flush_request_drains_queue() {
        let mut p = Producer::new(&config(), None, 0);
        let e = p.register_entity();
        p.observe(e, click(1_000), 1_000);
        let batches = p.on_flush_request(1_001);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reason, FlushReason::Request);
        assert!(p.on_flush_request(1_002).is_empty());
    }

    // ── consumer ──

    #[tokio::test]
    async fn batch_becomes_buffered_rows() {
        let mut c = consumer();
        let ack = c.ingest_batch(7, "interval", vec![click(1_000), click(2_000)]);
        assert!(ack.ok);
        assert_eq!(ack.accepted, 2);
        assert_eq!(c.buffer().len(), 2);
        // Identity gaps are filled from the consumer side.
        let row = &c.buffer().rows()[0];
        assert_eq!(row.session_tab_id, Some(7));
        assert!(row.session_install_id.is_some());
    }

    #[tokio::test]
    async fn correlation_attaches_to_ingested_rows() {
        let mut c = consumer();
        c.handle(Command::RequestStart {
            tab_id: 7,
            kind: RequestKind::Fetch,
            url: "https://a.com/api/orders".to_string(),
            method: "POST".to_string(),
            ts: 900,
        });
        c.handle(Command::RequestEnd {
            tab_id: 7,
            url: "https://a.com/api/orders".to_string(),
            method: "POST".to_string(),
            status: 201,
            ts: 950,
        });
        c.ingest_batch(7, "request", vec![click(1_000)]);
        let row = &c.buffer().rows()[0];
        assert_eq!(row.api_status, Some(201));
        assert_eq!(row.api_latency_ms, Some(50));

        // A different tab gets nothing attached.
        c.ingest_batch(8, "interval", vec![click(1_000)]);
        assert_eq!(c.buffer().rows()[1].api_status, None);
    }

    #[tokio::test]
    async fn failed_delivery_loses_no_buffered_rows() {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            IdentityManager::load_or_create(dir.path(), &SessionConfig::default()).unwrap();
        let uploader = Arc::new(Uploader::new(
            &UploaderConfig::default(),
            Box::new(RefusingTransport),
        ));
        let mut c = Consumer::new(&config(), identity, Arc::clone(&uploader));

        c.ingest_batch(7, "interval", vec![click(1_000), click(2_000)]);
        assert_eq!(c.buffer().len(), 2);

        assert_eq!(uploader.drain_once(None, 3_000).await, DrainOutcome::Requeued(2));

        // The batch is back at the front of the queue and the durable
        // buffer is untouched.
        assert_eq!(uploader.pending(), 2);
        assert_eq!(c.buffer().len(), 2);
        let tabs: Vec<i64> = c
            .buffer()
            .rows()
            .iter()
            .filter_map(|r| r.session_tab_id)
            .collect();
        assert_eq!(tabs, vec![7, 7]);
    }

    #[tokio::test]
    async fn post_state_bursts_collapse() {
        let mut c = consumer();
        let state = |ts| RawEvent {
            payload: ActionPayload::PostState {
                title: Some("Saved".to_string()),
                modal_text: None,
                alert_text: None,
            },
            ..click(ts)
        };
        let ack = c.ingest_batch(7, "interval", vec![state(1_000), state(1_100), state(1_200)]);
        assert_eq!(ack.accepted, 1);
    }

    #[tokio::test]
    async fn request_start_pushes_flush_request() {
        let mut c = consumer();
        let (tx, mut rx) = flush_channel();
        c.handle(Command::RegisterTab { tab_id: 7, flush: tx });
        c.handle(Command::RequestStart {
            tab_id: 7,
            kind: RequestKind::Xhr,
            url: "https://a.com/api".to_string(),
            method: "GET".to_string(),
            ts: 100,
        });
        assert_eq!(rx.try_recv().unwrap(), HostMessage::FlushRequest);

        // Subresources never trigger one.
        c.handle(Command::RequestStart {
            tab_id: 7,
            kind: RequestKind::Subresource,
            url: "https://a.com/logo.png".to_string(),
            method: "GET".to_string(),
            ts: 200,
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tab_close_evicts_state() {
        let mut c = consumer();
        c.handle(Command::RequestStart {
            tab_id: 7,
            kind: RequestKind::Fetch,
            url: "https://a.com/api".to_string(),
            method: "GET".to_string(),
            ts: 100,
        });
        assert!(c.correlation().get(7).is_some());
        c.handle(Command::TabClosed { tab_id: 7 });
        assert!(c.correlation().get(7).is_none());
    }

    #[tokio::test]
    async fn login_guess_flows_into_rows() {
        let mut c = consumer();
        c.handle(Command::LoginFields {
            fields: vec![LoginFieldCandidate {
                name: Some("userid".to_string()),
                input_type: Some("text".to_string()),
                value: Some("kim".to_string()),
                ..LoginFieldCandidate::default()
            }],
        });
        c.ingest_batch(7, "interval", vec![click(1_000)]);
        assert_eq!(c.buffer().rows()[0].login_id.as_deref(), Some("kim"));
    }

    // ── end to end over the channel ──

    #[tokio::test]
    async fn handshake_and_batch_over_channel() {
        let dir = tempfile::tempdir().unwrap();
        let identity =
            IdentityManager::load_or_create(dir.path(), &SessionConfig::default()).unwrap();
        let install = identity.install_id().to_string();
        let uploader = Arc::new(Uploader::new(
            &UploaderConfig::default(),
            Box::new(NoopTransport),
        ));
        let consumer = Consumer::new(&config(), identity, uploader);
        let (handle, join) = consumer.spawn();

        let mut p = Producer::new(&config(), Some(install), 0);
        let ack = handle.hello(4, Duration::from_secs(1)).await.unwrap();
        p.apply_hello_ack(&ack);
        assert_eq!(p.session().tab_id, Some(4));

        let e = p.register_entity();
        p.observe(e, click(1_000), 1_000);
        let batch = p.page_unload().pop().unwrap();
        let ack = handle.send_batch(4, batch).await.unwrap();
        assert!(ack.ok);
        assert_eq!(ack.accepted, 1);

        let out = handle.export(dir.path().join("out")).await.unwrap();
        let text = std::fs::read_to_string(out).unwrap();
        assert_eq!(text.lines().count(), 2);

        drop(handle);
        join.await.unwrap();
    }
}
