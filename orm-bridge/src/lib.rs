//! Tessera ORM bridge
//!
//! The boundary between a host ORM and the engine: a change-tracker
//! interface, the save interceptor that transparently promotes multi-shard
//! saves to a coordinator-driven two-phase commit, and the transparent
//! session that joins an application-started transaction scope with a
//! cross-shard transaction.

#![forbid(unsafe_code)]

pub mod interceptor;
pub mod session;
pub mod tracker;

pub use interceptor::{SaveInterceptor, SaveOutcome, DEFAULT_GROUP};
pub use session::{SessionRegistry, TransparentSession};
pub use tracker::{ChangeTracker, EntityState, InMemoryChangeTracker, TrackedEntry};
