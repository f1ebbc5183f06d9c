//! Agent Communication Fabric: routes messages between agents by direct
//! handler dispatch, message-type routing, or ownership-scoped routing,
//! with optional HMAC-authenticated, AEAD-encrypted secure envelopes and
//! pluggable external transports (hosted queue, event bus).

mod security;

pub use security::canonical_json;

use crate::constants::{DEFAULT_EVENT_SOURCE, MAX_ASYNC_QUEUE_DEPTH};
use crate::error::AwcpError;
use crate::external::{EventBus, HostedQueue};
use crate::models::AgentId;
use crate::ownership::OwnerId;
use crate::Result;
use chrono::{DateTime, Utc};
use security::SecurityState;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A registered inbound-message handler: `fn(message) -> result`. The
/// returned value, if any, becomes a delivered message's `response`.
pub type Handler = Arc<dyn Fn(&Message) -> Result<Option<serde_json::Value>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossOwnerPolicy {
    Deny,
    Allow,
    Secure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    Json,
    Base64Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: Option<AgentId>,
    pub recipient: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    pub fn new(
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        content: serde_json::Value,
        sender_id: Option<AgentId>,
    ) -> Self {
        Self {
            sender_id,
            recipient: recipient.into(),
            message_type: message_type.into(),
            content,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Pending,
    Queued,
    Sent,
    Failed,
}

/// Outcome of a `send`/`broadcast`/`route` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Delivery {
    pub fn delivered(response: Option<serde_json::Value>) -> Self {
        Self { status: DeliveryStatus::Delivered, response, error: None }
    }

    pub fn pending() -> Self {
        Self { status: DeliveryStatus::Pending, response: None, error: None }
    }

    pub fn queued() -> Self {
        Self { status: DeliveryStatus::Queued, response: None, error: None }
    }

    pub fn sent() -> Self {
        Self { status: DeliveryStatus::Sent, response: None, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: DeliveryStatus::Failed, response: None, error: Some(error.into()) }
    }
}

/// One recipient's outcome within a `broadcast` call.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastOutcome {
    pub recipient: String,
    pub delivery: Delivery,
}

/// Aggregate result of a `broadcast` call.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    pub details: Vec<BroadcastOutcome>,
}

#[derive(Default)]
struct RoutingState {
    handlers: HashMap<String, Vec<Handler>>,
    /// Recipients this fabric can deliver to directly (the spec's "direct
    /// reference" case). A recipient absent from this set is a bare
    /// agent-id string with no in-process resolution, so `send` reports it
    /// `pending` rather than guessing at name resolution.
    known_recipients: HashSet<String>,
    routes: HashMap<String, String>,
    default_route: Option<String>,
    owner_id: Option<OwnerId>,
    ownership_routes: HashMap<OwnerId, String>,
    cross_owner_policy: CrossOwnerPolicy,
}

struct AsyncWorker {
    queue: Arc<Mutex<VecDeque<(String, Message)>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

/// Cloneable handle over the fabric's shared state.
#[derive(Clone)]
pub struct Fabric {
    state: Arc<RwLock<RoutingState>>,
    security: Arc<RwLock<SecurityState>>,
    async_worker: Arc<AsyncWorker>,
    hosted_queue: Option<Arc<dyn HostedQueue>>,
    event_bus: Option<Arc<dyn EventBus>>,
    serialization: SerializationFormat,
    event_source: String,
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RoutingState {
                cross_owner_policy: CrossOwnerPolicy::Deny,
                ..Default::default()
            })),
            security: Arc::new(RwLock::new(SecurityState::default())),
            async_worker: Arc::new(AsyncWorker {
                queue: Arc::new(Mutex::new(VecDeque::new())),
                handle: Mutex::new(None),
                shutdown_tx: Mutex::new(None),
            }),
            hosted_queue: None,
            event_bus: None,
            serialization: SerializationFormat::Json,
            event_source: DEFAULT_EVENT_SOURCE.to_string(),
        }
    }

    pub fn with_hosted_queue(mut self, queue: Arc<dyn HostedQueue>) -> Self {
        self.hosted_queue = Some(queue);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Chooses the wire format `serialize`/`deserialize` use. Unlike the
    /// source system's string-typed setter, an invalid format can't be
    /// constructed at all here — `SerializationFormat` is the validation.
    pub fn with_serialization_format(mut self, format: SerializationFormat) -> Self {
        self.serialization = format;
        self
    }

    /// Sets the `source` value stamped on `event_pattern_for`'s output and
    /// (once wired to a real event bus) published events.
    pub fn with_event_source(mut self, source: impl Into<String>) -> Self {
        self.event_source = source.into();
        self
    }

    pub async fn register_handler(&self, message_type: impl Into<String>, handler: Handler) {
        self.state
            .write()
            .await
            .handlers
            .entry(message_type.into())
            .or_default()
            .push(handler);
    }

    /// Marks `recipient` as resolvable to a direct, in-process handler —
    /// the spec's "direct reference" case. A recipient never registered
    /// here is a bare agent-id string with no local resolution, so `send`
    /// reports it `pending` rather than guessing at a name-resolution layer
    /// the fabric doesn't own.
    pub async fn register_recipient(&self, recipient: impl Into<String>) {
        self.state.write().await.known_recipients.insert(recipient.into());
    }

    pub async fn add_route(&self, message_type: impl Into<String>, destination: impl Into<String>) {
        self.state
            .write()
            .await
            .routes
            .insert(message_type.into(), destination.into());
    }

    pub async fn set_default_route(&self, destination: impl Into<String>) {
        self.state.write().await.default_route = Some(destination.into());
    }

    pub async fn set_owner(&self, owner_id: OwnerId) {
        self.state.write().await.owner_id = Some(owner_id);
    }

    pub async fn add_ownership_route(&self, owner_id: OwnerId, destination: impl Into<String>) {
        self.state
            .write()
            .await
            .ownership_routes
            .insert(owner_id, destination.into());
    }

    pub async fn set_cross_owner_policy(&self, policy: CrossOwnerPolicy) {
        self.state.write().await.cross_owner_policy = policy;
    }

    /// Synchronous, direct delivery. `recipient` is consulted before any
    /// handler runs: only a recipient previously marked via
    /// `register_recipient` (a "direct reference") is eligible for
    /// dispatch, so two messages of the same type addressed to different
    /// recipients can resolve differently. An unresolved recipient — a bare
    /// agent-id string the fabric can't reach in-process — reports
    /// `pending` rather than guessing at a name-resolution layer the fabric
    /// doesn't own. Handlers run outside any held lock; a handler error
    /// becomes `failed` rather than propagating across the API boundary.
    pub async fn send(&self, message: Message) -> Result<Delivery> {
        let (resolved, handlers) = {
            let state = self.state.read().await;
            (
                state.known_recipients.contains(&message.recipient),
                state.handlers.get(&message.message_type).cloned(),
            )
        };

        if !resolved {
            return Ok(Delivery::pending());
        }

        match handlers {
            Some(handlers) if !handlers.is_empty() => {
                let mut response = None;
                for handler in &handlers {
                    match handler(&message) {
                        Ok(r) => response = r,
                        Err(e) => return Ok(Delivery::failed(e.to_string())),
                    }
                }
                Ok(Delivery::delivered(response))
            }
            _ => Ok(Delivery::failed(format!(
                "no handler registered for message type '{}'",
                message.message_type
            ))),
        }
    }

    /// Sends to every recipient independently and summarizes the outcomes.
    pub async fn broadcast(
        &self,
        recipients: &[String],
        message_type: &str,
        content: serde_json::Value,
    ) -> BroadcastReport {
        let mut report = BroadcastReport {
            total: recipients.len(),
            successful: 0,
            failed: 0,
            pending: 0,
            details: Vec::with_capacity(recipients.len()),
        };

        for recipient in recipients {
            let message = Message::new(recipient.clone(), message_type, content.clone(), None);
            let delivery = match self.send(message).await {
                Ok(d) => d,
                Err(e) => Delivery::failed(e.to_string()),
            };
            match delivery.status {
                DeliveryStatus::Delivered | DeliveryStatus::Sent | DeliveryStatus::Queued => {
                    report.successful += 1
                }
                DeliveryStatus::Pending => report.pending += 1,
                DeliveryStatus::Failed => report.failed += 1,
            }
            report.details.push(BroadcastOutcome { recipient: recipient.clone(), delivery });
        }

        report
    }

    /// Resolves a destination by message type — a specific `add_route`
    /// entry, then `default_route` — and dispatches to it exactly like
    /// `send` with `recipient` set to that destination. Fails if neither
    /// resolves.
    pub async fn route(
        &self,
        message_type: &str,
        content: serde_json::Value,
        sender_id: Option<AgentId>,
    ) -> Result<Delivery> {
        let destination = {
            let state = self.state.read().await;
            state.routes.get(message_type).or(state.default_route.as_ref()).cloned()
        };

        match destination {
            Some(destination) => {
                let message = Message::new(destination, message_type, content, sender_id);
                self.send(message).await
            }
            None => Ok(Delivery::failed(format!("no route registered for message type '{message_type}'"))),
        }
    }

    /// Routes a message according to the sender/recipient owner pair and
    /// the configured cross-owner policy: same-owner traffic always
    /// passes, `Deny` rejects cross-owner traffic outright, `Allow` passes
    /// it through unmodified, and `Secure` requires it go through
    /// `send_secure` instead.
    pub async fn route_by_ownership(
        &self,
        sender_owner: &OwnerId,
        recipient_owner: &OwnerId,
        message: Message,
        auth_key: Option<&[u8]>,
    ) -> Result<Delivery> {
        if sender_owner == recipient_owner {
            return self.send(message).await;
        }

        let policy = self.state.read().await.cross_owner_policy;
        match policy {
            CrossOwnerPolicy::Deny => Err(AwcpError::denied(format!(
                "cross-owner message from {sender_owner} to {recipient_owner} denied by policy"
            ))),
            CrossOwnerPolicy::Allow => self.send(message).await,
            CrossOwnerPolicy::Secure => {
                let key = auth_key.ok_or_else(|| {
                    AwcpError::invalid("secure cross-owner routing requires an auth key")
                })?;
                self.send_secure(message, key).await
            }
        }
    }

    pub async fn send_async(&self, destination: impl Into<String>, message: Message) -> Result<()> {
        let mut queue = self.async_worker.queue.lock().await;
        if queue.len() >= MAX_ASYNC_QUEUE_DEPTH {
            return Err(AwcpError::Unavailable("async delivery queue is full".to_string()));
        }
        queue.push_back((destination.into(), message));
        Ok(())
    }

    /// Starts the single-consumer async delivery worker. Mirrors the
    /// interval/shutdown-channel pattern used for background sampling
    /// elsewhere: a `tokio::select!` between new work and the shutdown
    /// signal, draining one message per tick without busy-waiting.
    pub async fn start_async_processing(&self) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.async_worker.shutdown_tx.lock().await = Some(tx);

        let queue = self.async_worker.queue.clone();
        let fabric = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(50));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let next = queue.lock().await.pop_front();
                        if let Some((destination, message)) = next {
                            match fabric.send(message).await {
                                Ok(delivery) if delivery.status == DeliveryStatus::Failed => {
                                    warn!(
                                        "async delivery to {} failed: {}",
                                        destination,
                                        delivery.error.unwrap_or_default()
                                    );
                                }
                                Err(e) => warn!("async delivery to {} failed: {}", destination, e),
                                Ok(_) => {}
                            }
                        }
                    }
                    _ = rx.recv() => {
                        info!("fabric async worker shutting down");
                        break;
                    }
                }
            }
        });
        *self.async_worker.handle.lock().await = Some(handle);
    }

    /// Stops the async worker, joining it within a bounded timeout so a
    /// wedged handler can't hang shutdown forever. Mirrors
    /// `ResourceMonitor::stop_monitoring`'s join pattern.
    pub async fn stop_async_processing(&self) {
        if let Some(tx) = self.async_worker.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.async_worker.handle.lock().await.take() {
            if tokio::time::timeout(std::time::Duration::from_secs(5), handle).await.is_err() {
                warn!("fabric async worker did not shut down within the timeout");
            }
        }
    }

    pub async fn enable_security(&self, encryption_key: Option<Vec<u8>>) -> Result<()> {
        let mut security = self.security.write().await;
        security.enable(encryption_key)
    }

    pub async fn disable_security(&self) {
        self.security.write().await.disable();
    }

    pub async fn register_auth_key(&self, agent_id: AgentId, auth_key: Vec<u8>) {
        self.security.write().await.register_auth_key(agent_id, auth_key);
    }

    pub async fn authorize_sender(&self, sender_id: AgentId) {
        self.security.write().await.authorize(sender_id);
    }

    pub async fn revoke_sender(&self, sender_id: &AgentId) {
        self.security.write().await.revoke(sender_id);
    }

    /// Signs the message envelope over its canonical JSON form, encrypts
    /// the content with ChaCha20-Poly1305, then sends the envelope as an
    /// ordinary message of type `"secure_message"`.
    pub async fn send_secure(&self, mut message: Message, auth_key: &[u8]) -> Result<Delivery> {
        let security = self.security.read().await;
        let envelope = security.seal(&mut message, auth_key)?;
        drop(security);
        message.content = envelope;
        message.message_type = "secure_message".to_string();
        self.send(message).await
    }

    /// Verifies authorized-sender status, resolves the verification key
    /// from the sender's registered auth key, checks the decrypted
    /// envelope's own sender against the transport message's claimed
    /// sender, and verifies the HMAC signature (constant-time), then
    /// decrypts the content. Returns `Ok(None)` on any integrity or
    /// authorization failure rather than propagating an error to the
    /// caller — failures are logged loudly and handled quietly, matching
    /// the rest of the integrity-failure contract.
    pub async fn receive_secure(&self, message: &Message) -> Result<Option<serde_json::Value>> {
        let security = self.security.read().await;
        if let Some(sender) = &message.sender_id {
            if !security.is_authorized(sender) {
                error!("secure message from unauthorized sender {}", sender);
                return Ok(None);
            }
        }
        match security.open(message) {
            Ok(content) => Ok(Some(content)),
            Err(e) => {
                error!("secure message failed integrity check: {}", e);
                Ok(None)
            }
        }
    }

    pub fn serialize(&self, message: &Message) -> Result<String> {
        let json = serde_json::to_string(message)?;
        Ok(match self.serialization {
            SerializationFormat::Json => json,
            SerializationFormat::Base64Json => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(json)
            }
        })
    }

    pub fn deserialize(&self, serialized: &str) -> Result<Message> {
        let json = match self.serialization {
            SerializationFormat::Json => serialized.to_string(),
            SerializationFormat::Base64Json => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(serialized)
                    .map_err(|e| AwcpError::invalid(format!("invalid base64 message: {e}")))?;
                String::from_utf8(bytes)
                    .map_err(|e| AwcpError::invalid(format!("invalid utf-8 message: {e}")))?
            }
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// Sends through the registered `HostedQueue`, enforcing the FIFO
    /// dedup/group-id contract at this layer so it holds regardless of
    /// which transport implementation is plugged in.
    pub async fn send_via_hosted_queue(
        &self,
        queue_url: &str,
        message: &Message,
        fifo: bool,
        dedup_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<()> {
        let queue = self
            .hosted_queue
            .as_ref()
            .ok_or_else(|| AwcpError::Unavailable("no hosted queue transport configured".to_string()))?;

        let owned_dedup_id;
        let (dedup_id, group_id) = if fifo {
            owned_dedup_id = dedup_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            (Some(owned_dedup_id.as_str()), Some(group_id.unwrap_or("default")))
        } else {
            (dedup_id, group_id)
        };

        let mut body = serde_json::to_value(message)?;
        if let (Some(obj), Some(dedup_id)) = (body.as_object_mut(), dedup_id) {
            obj.insert("MessageDeduplicationId".to_string(), serde_json::json!(dedup_id));
            if let Some(group_id) = group_id {
                obj.insert("MessageGroupId".to_string(), serde_json::json!(group_id));
            }
        }

        queue.send(queue_url, &body, dedup_id, group_id).await
    }

    pub async fn publish_event(&self, source: &str, message: &Message) -> Result<()> {
        let bus = self
            .event_bus
            .as_ref()
            .ok_or_else(|| AwcpError::Unavailable("no event bus transport configured".to_string()))?;
        let detail = serde_json::to_value(message)?;
        bus.publish(source, &message.message_type, &detail).await
    }

    /// The event pattern a rule would register to match messages of this
    /// type, mirroring `create_event_pattern_for_message_type` from the
    /// system this fabric replaces: `{source, detail-type}` with the
    /// `"Agent."` prefix applied to the message type.
    pub fn event_pattern_for(&self, message_type: &str) -> serde_json::Value {
        serde_json::json!({
            "source": [self.event_source.clone()],
            "detail-type": [format!("Agent.{message_type}")],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn send_invokes_registered_handler() {
        let fabric = Fabric::new();
        fabric.register_recipient("agent-1").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        fabric
            .register_handler(
                "greet",
                Arc::new(move |_msg: &Message| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }),
            )
            .await;

        let outcome = fabric
            .send(Message::new("agent-1", "greet", serde_json::json!("hi"), None))
            .await
            .unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Delivered);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_recipient_reports_pending() {
        let fabric = Fabric::new();
        let outcome = fabric
            .send(Message::new("agent-1", "unknown", serde_json::json!(null), None))
            .await
            .unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn send_to_known_recipient_with_no_matching_handler_fails() {
        let fabric = Fabric::new();
        fabric.register_recipient("agent-1").await;
        let outcome = fabric
            .send(Message::new("agent-1", "unknown", serde_json::json!(null), None))
            .await
            .unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn same_type_different_recipients_resolve_differently() {
        let fabric = Fabric::new();
        fabric.register_recipient("agent-1").await;
        fabric.register_handler("greet", Arc::new(|_msg: &Message| Ok(None))).await;

        let known = fabric
            .send(Message::new("agent-1", "greet", serde_json::json!("hi"), None))
            .await
            .unwrap();
        let unknown = fabric
            .send(Message::new("agent-2", "greet", serde_json::json!("hi"), None))
            .await
            .unwrap();
        assert_eq!(known.status, DeliveryStatus::Delivered);
        assert_eq!(unknown.status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn broadcast_summarizes_per_recipient_outcomes() {
        let fabric = Fabric::new();
        fabric.register_recipient("agent-1").await;
        fabric.register_handler("ping", Arc::new(|_msg: &Message| Ok(None))).await;

        let report = fabric
            .broadcast(&["agent-1".to_string(), "agent-2".to_string()], "ping", serde_json::json!(null))
            .await;
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.details.len(), 2);
    }

    #[tokio::test]
    async fn route_dispatches_via_type_route_then_default_then_fails() {
        let fabric = Fabric::new();
        fabric.register_recipient("sink").await;
        fabric.register_handler("job", Arc::new(|_msg: &Message| Ok(None))).await;
        fabric.add_route("job", "sink").await;

        let routed = fabric.route("job", serde_json::json!({"n": 1}), None).await.unwrap();
        assert_eq!(routed.status, DeliveryStatus::Delivered);

        let no_route = fabric.route("other", serde_json::json!(null), None).await.unwrap();
        assert_eq!(no_route.status, DeliveryStatus::Failed);

        fabric.set_default_route("sink").await;
        let defaulted = fabric.route("other", serde_json::json!(null), None).await.unwrap();
        assert_eq!(defaulted.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn event_pattern_for_includes_source_and_agent_prefix() {
        let fabric = Fabric::new().with_event_source("awcp.fabric");
        let pattern = fabric.event_pattern_for("task_update");
        assert_eq!(
            pattern,
            serde_json::json!({"source": ["awcp.fabric"], "detail-type": ["Agent.task_update"]})
        );
    }

    #[tokio::test]
    async fn cross_owner_deny_policy_rejects() {
        let fabric = Fabric::new();
        fabric.set_cross_owner_policy(CrossOwnerPolicy::Deny).await;
        let result = fabric
            .route_by_ownership(
                &OwnerId::Tenant("acme".into()),
                &OwnerId::Tenant("other".into()),
                Message::new("agent-1", "ping", serde_json::json!(null), None),
                None,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn secure_round_trip_recovers_original_content() {
        let fabric = Fabric::new();
        let key = b"0123456789abcdef0123456789abcdef".to_vec();
        fabric.enable_security(Some(key.clone())).await.unwrap();
        fabric.register_auth_key("agent-a".to_string(), key.clone()).await;
        fabric.authorize_sender("agent-a".to_string()).await;
        fabric.register_recipient("agent-b").await;

        let handled = Arc::new(Mutex::new(None));
        let handled_clone = handled.clone();
        fabric
            .register_handler(
                "secure_message",
                Arc::new(move |msg: &Message| {
                    let handled_clone = handled_clone.clone();
                    let msg = msg.clone();
                    tokio::spawn(async move {
                        *handled_clone.lock().await = Some(msg);
                    });
                    Ok(None)
                }),
            )
            .await;

        let message = Message::new(
            "agent-b",
            "task_update",
            serde_json::json!({"status": "done"}),
            Some("agent-a".to_string()),
        );
        fabric.send_secure(message, &key).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let captured = handled.lock().await.clone().expect("handler ran");
        let opened = fabric.receive_secure(&captured).await.unwrap();
        assert_eq!(opened, Some(serde_json::json!({"status": "done"})));
    }

    #[tokio::test]
    async fn receive_secure_rejects_unauthorized_sender() {
        let fabric = Fabric::new();
        let key = b"0123456789abcdef0123456789abcdef".to_vec();
        fabric.enable_security(Some(key.clone())).await.unwrap();

        let mut message = Message::new(
            "agent-b",
            "secure_message",
            serde_json::json!({"status": "done"}),
            Some("agent-a".to_string()),
        );
        let security = fabric.security.read().await;
        let envelope = security.seal(&mut message, &key).unwrap();
        drop(security);
        message.content = envelope;

        let opened = fabric.receive_secure(&message).await.unwrap();
        assert_eq!(opened, None);
    }

    #[tokio::test]
    async fn scenario_d_secure_cross_tenant_round_trip_and_tamper() {
        let fabric = Fabric::new();
        let key = b"0123456789abcdef0123456789abcdef".to_vec();
        fabric.enable_security(Some(key.clone())).await.unwrap();
        fabric.register_auth_key("agent-s".to_string(), key.clone()).await;
        fabric.authorize_sender("agent-s".to_string()).await;
        fabric.set_cross_owner_policy(CrossOwnerPolicy::Secure).await;
        fabric.register_recipient("agent-r").await;

        let handled = Arc::new(Mutex::new(None));
        let handled_clone = handled.clone();
        fabric
            .register_handler(
                "secure_message",
                Arc::new(move |msg: &Message| {
                    let handled_clone = handled_clone.clone();
                    let msg = msg.clone();
                    tokio::spawn(async move {
                        *handled_clone.lock().await = Some(msg);
                    });
                    Ok(None)
                }),
            )
            .await;

        let message = Message::new(
            "agent-r",
            "task_update",
            serde_json::json!({"status": "done"}),
            Some("agent-s".to_string()),
        );
        fabric
            .route_by_ownership(
                &OwnerId::Tenant("t1".into()),
                &OwnerId::Tenant("t2".into()),
                message,
                Some(&key),
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut captured = handled.lock().await.clone().expect("handler ran");
        let opened = fabric.receive_secure(&captured).await.unwrap();
        assert_eq!(opened, Some(serde_json::json!({"status": "done"})));

        captured.content = serde_json::json!({"tampered": true});
        let opened = fabric.receive_secure(&captured).await.unwrap();
        assert_eq!(opened, None, "tampering with the outer payload must fail verification");
    }

    #[tokio::test]
    async fn scenario_f_fifo_queue_send_assigns_dedup_and_default_group() {
        let queue = Arc::new(crate::external::InMemoryHostedQueue::new());
        let queue_url = queue.create_queue("q", true).await.unwrap();
        let fabric = Fabric::new().with_hosted_queue(queue.clone());

        let message = Message::new("agent-b", "m", serde_json::json!({"hello": "world"}), None);
        fabric
            .send_via_hosted_queue(&queue_url, &message, true, None, None)
            .await
            .unwrap();

        let received = queue.receive(&queue_url, 1).await.unwrap();
        assert_eq!(received.len(), 1);
        let record = received[0].as_object().unwrap();
        assert!(record.contains_key("MessageDeduplicationId"));
        assert_eq!(record.get("MessageGroupId").unwrap(), "default");
    }

    #[test]
    fn serialize_deserialize_round_trips_json() {
        let fabric = Fabric::new();
        let message = Message::new("agent-b", "m", serde_json::json!({"a": 1}), Some("agent-a".to_string()));
        let wire = fabric.serialize(&message).unwrap();
        let restored = fabric.deserialize(&wire).unwrap();
        assert_eq!(restored.recipient, message.recipient);
        assert_eq!(restored.content, message.content);
        assert_eq!(restored.sender_id, message.sender_id);
    }

    #[test]
    fn serialize_deserialize_round_trips_base64_json() {
        let fabric = Fabric::new().with_serialization_format(SerializationFormat::Base64Json);
        let message = Message::new("agent-b", "m", serde_json::json!({"a": 1}), None);
        let wire = fabric.serialize(&message).unwrap();
        assert_ne!(wire, serde_json::to_string(&message).unwrap(), "base64 wire form must not equal plain json");
        let restored = fabric.deserialize(&wire).unwrap();
        assert_eq!(restored.content, message.content);
    }
}
