//! In-memory backends for entitystore
//!
//! This crate provides two test doubles with the same stream contract as the
//! networked backend:
//!
//! - [`InMemoryEventStore`] keeps typed events in process memory and exposes
//!   them for assertions;
//! - [`InMemoryLogConnection`] emulates the log server's wire contract
//!   (paging, soft deletion, live subscriptions, raw record injection) so that
//!   [`LogEventStore`](entitystore::log::LogEventStore) can be exercised
//!   without a server.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod log_connection;
mod store;

pub use log_connection::InMemoryLogConnection;
pub use store::{InMemoryEventStore, InMemoryEventStream};
