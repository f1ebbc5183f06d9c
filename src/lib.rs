//! # Agent Workload Control Plane
//!
//! AWCP coordinates a fleet of task-executing agents across multiple
//! tenants: it assigns incoming work to capability-matched agents under
//! ownership and capacity constraints, tracks per-resource utilization
//! with threshold-driven autoscaling feedback and usage forecasting,
//! routes messages between agents with optional authenticated encryption,
//! and scores agent output against pluggable quality metrics.
//!
//! ## Architecture
//!
//! - **Task Distributor**: owner-scoped priority queues, capability/
//!   capacity matching, and quality-aware agent selection
//! - **Resource Monitor**: usage sampling, threshold bands, autoscaling
//!   feedback, and linear-regression forecasting
//! - **Communication Fabric**: handler dispatch, type- and ownership-based
//!   routing, and a secure envelope for cross-tenant messages
//! - **Quality Controller**: metric/verification scoring and feedback-
//!   weighted routing
//! - **External collaborators**: durable task mirror, workflow executor,
//!   hosted queue, event bus, metric sink, and autoscaler, each a narrow
//!   trait with an in-memory default implementation
//!
//! ## Usage
//!
//! The control plane is driven entirely through the HTTP API exposed by
//! [`api::ApiServer`]; there is no CLI surface.

/// Operator-facing HTTP API
pub mod api;
/// API key authentication middleware
pub mod auth;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Task Distributor: agent registry and assignment
pub mod distributor;
/// Error types and handling
pub mod error;
/// Pluggable external collaborators (task store, workflow executor, ...)
pub mod external;
/// Agent Communication Fabric
pub mod fabric;
/// Core data models: agents, tasks, typed KV encoding
pub mod models;
/// Multi-tenant ownership model
pub mod ownership;
/// Quality Controller: scoring, verification, feedback-weighted routing
pub mod quality;
/// Rate limiting middleware
pub mod rate_limit;
/// Resource Monitor: usage tracking, thresholds, forecasting
pub mod resource_monitor;
/// API key generation and persistence
pub mod security;

pub use error::{AwcpError, Result};
