//! Lifeline - emergency alert dispatch and response coordination.
//!
//! # Overview
//!
//! A requester raises an alert with a location and an emergency type. Lifeline
//! finds available responders whose notification radius covers that location
//! and who can handle that type, notifies them, and tracks the alert through
//! its lifecycle:
//!
//! ```text
//! pending -> acknowledged -> in_progress -> resolved
//!    |            |               |
//!    +-> expired  +-> cancelled <-+
//!    +-> cancelled
//! ```
//!
//! The first acceptance acknowledges the alert. Every later acceptance is
//! still recorded and told the alert is already being handled. An alert
//! nobody accepts expires after a deadline.
//!
//! # Modules
//!
//! - [`model`]: Alerts, responses, availability and request types
//! - [`error`]: Error taxonomy and its HTTP mapping
//! - [`config`]: Environment configuration
//! - [`storage`]: SQLite storage layer with CAS status updates
//! - [`store`]: Lifecycle rules over storage
//! - [`geo`]: Eligible-responder matching
//! - [`notify`]: Topic-based publish/subscribe
//! - [`expiry`]: Per-alert deadline timers
//! - [`webhook`]: Optional relay to an external push gateway
//! - [`dispatch`]: Orchestration of all of the above
//! - [`api`]: HTTP API handlers

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod expiry;
pub mod geo;
pub mod model;
pub mod notify;
pub mod storage;
pub mod store;
pub mod webhook;
