//! Domain model, ports and projectors for the Wordloom projection pipeline.
//!
//! This crate has no database or HTTP dependencies. Storage adapters live in
//! `wordloom_postgres`; the worker, ops tools and health server live in the
//! root `wordloom` package.

pub mod aggregate;
pub mod error;
pub mod events;
pub mod outbox;
pub mod ports;
pub mod projector;
pub mod read_model;
pub mod retry;
pub mod source;
pub mod trace;

pub use error::{ErrorReason, FailureClass, ProjectionError, Result, WordloomError};
pub use events::{DomainEvent, EventKind, EventType};
pub use outbox::{EnqueueRequest, OutboxOp, OutboxRow, OutboxStatus, Projection};
