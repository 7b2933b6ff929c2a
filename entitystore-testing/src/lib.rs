//! Test support for entitystore backends and applications.
//!
//! - [`contract`]: the behavioral suite every [`EventStore`](entitystore::EventStore)
//!   backend must pass, with a macro generating one `#[tokio::test]` per scenario
//! - [`collect`]: bounded waits on catch-up subscriptions
//! - [`recording`]: a domain index remembering every event it was fed

#![forbid(unsafe_code)]
#![deny(
    bad_style,
    meta_variable_misuse,
    non_ascii_idents,
    rust_2018_idioms,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_results
)]

pub mod collect;
pub mod contract;
pub mod recording;

pub use collect::{collect_events, drain_until_complete, CollectionError};
pub use recording::RecordingIndex;
