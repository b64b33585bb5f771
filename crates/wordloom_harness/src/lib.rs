//! Test support for Wordloom: in-memory port adapters, a manual clock, a
//! recording search sink and isolated PostgreSQL databases.

pub mod clock;
pub mod db;
pub mod memory;
pub mod sink;

pub use clock::ManualClock;
pub use db::{drop_db, isolated_db, IsolatedDb};
pub use memory::{
    InMemoryBasement, InMemoryChronicle, InMemoryOutbox, InMemoryProjectionStatus,
    InMemorySearchIndex, InMemorySentinel, InMemorySource,
};
pub use sink::RecordingSink;
