//! System-wide configuration defaults shared across components.

/// Queue depth past which `submit_task` starts rejecting new work per owner.
pub const MAX_QUEUE_SIZE_PER_OWNER: usize = 1000;

/// Resource sample history retained per resource (rolling window).
pub const RESOURCE_HISTORY_RETENTION_HOURS: i64 = 24;

/// Default background sampling cadence for the resource monitor.
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 30;

/// Minimum number of samples before forecasting is attempted.
pub const MIN_SAMPLES_FOR_FORECAST: usize = 24;

/// Nonce length (bytes) for the ChaCha20-Poly1305 secure envelope.
pub const SECURE_ENVELOPE_NONCE_LEN: usize = 12;

/// Symmetric key length (bytes) generated when `enable_security` isn't given one.
pub const SECURITY_KEY_LEN: usize = 32;

/// Bound on the async delivery worker's pending-message backlog per route.
pub const MAX_ASYNC_QUEUE_DEPTH: usize = 10_000;

/// Default `source` field stamped on event bus patterns/events when no
/// fabric-specific source was configured.
pub const DEFAULT_EVENT_SOURCE: &str = "agent.fabric";
