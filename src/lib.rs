//! Inference router: the traffic-control plane in front of a fleet of model
//! servers.
//!
//! Each inbound request is admitted (per-organization and per-API-key rate
//! limits, budget pre-check), resolved to a routing policy for its
//! organization and model (falling back to the global policy), and sent to
//! a backend drawn by weight from the healthy candidates, with bounded
//! failover across distinct backends. Every request leaves exactly one
//! usage record in a durable local queue that is flushed downstream.
//!
//! # Architecture
//!
//! - [`cli`] -- Command-line argument parsing with clap derive macros.
//! - [`cmd`] -- Subcommand dispatch and execution (run, validate, health).
//! - [`policy`] -- Policy model, validation, config stores, the SQLite
//!   policy cache and the [`PolicySource`](policy::source::PolicySource)
//!   that keeps them in step.
//! - [`registry`] -- Backend id to endpoint mapping.
//! - [`routing`] -- The [`Dispatcher`](routing::Dispatcher), weighted
//!   selection, backend transport and the health monitor.
//! - [`admission`] -- Token-bucket rate limiting and budget checks.
//! - [`usage`] -- Usage records, the durable buffer and publishers.
//! - [`api`] -- Dispatch and admin HTTP handlers.
//! - [`error`] -- Unified error types using `thiserror`.
//! - [`health`] -- `GET /health` endpoint handler returning runtime diagnostics.
//! - [`logging`] -- Structured tracing setup with JSON and pretty-print output.
//! - [`server`] -- Axum server setup, shared application state, HTTP client,
//!   and graceful shutdown.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `yaml` | YAML policy seed files _(enabled by default)_ |
//! | `json` | JSON policy seed files |
//! | `redis` | Shared rate-limit store and Redis-stream usage publisher _(enabled by default)_ |
//! | `etcd` | etcd config store |
//! | `sentry-integration` | Sentry error tracking |
//! | `full` | All features |

// Binary crate: public functions are internal, not consumed by external users.
#![allow(clippy::missing_errors_doc)]

pub mod admission;
pub mod api;
pub mod cli;
pub mod cmd;
pub mod error;
pub mod health;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod routing;
pub mod server;
pub mod usage;

#[cfg(feature = "sentry-integration")]
pub mod sentry_integration;
