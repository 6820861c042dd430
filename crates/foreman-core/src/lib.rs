//! Core types and error definitions for the foreman dispatcher.
//!
//! This crate provides the foundational types shared across all foreman crates:
//! the unified error enum and the best-effort event bus used to publish task and
//! agent lifecycle events to downstream consumers.
//!
//! # Main types
//!
//! - [`ForemanError`] — Unified error enum for all foreman subsystems.
//! - [`ForemanResult`] — Convenience alias for `Result<T, ForemanError>`.
//! - [`Event`] — A published lifecycle event (`{event_type, entity_type, entity_id, payload}`).
//! - [`EventBus`] — Fan-out of events to every registered [`EventSink`].

/// Error types for all foreman crates.
pub mod error;
/// Lifecycle events and the sinks that receive them.
pub mod events;

pub use error::{ForemanError, ForemanResult};
pub use events::{ChannelSink, Event, EventBus, EventKind, EventSink, JsonlSink, LogSink};
