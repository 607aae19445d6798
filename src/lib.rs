//! Offline mutation queue and sync engine for storefront clients.
//!
//! Writes made while connectivity is uncertain are captured as mutation
//! intents in a local SQLite store, survive restarts, and are replayed against
//! their endpoints by a single-flight [`SyncEngine`] once the client is online.
//! The same store carries a TTL-bounded read cache.

#[macro_use]
mod text_enum;

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod intent;
pub mod status;
pub mod store;
pub mod transport;

pub use connectivity::{ConnectivityMonitor, ConnectivityObserver};
pub use engine::{PassOutcome, PassReport, SyncEngine, SyncEvent, SyncSettings};
pub use error::{DeliveryError, EnqueueError, StorageError, ValidationError};
pub use intent::{Action, Category, IntentId, Method, Mutation, NewIntent, QueuedIntent, Status};
pub use status::StatusReporter;
pub use store::{QueueStats, Store};
pub use text_enum::ParseEnumError;
pub use transport::{HttpTransport, Transport};
