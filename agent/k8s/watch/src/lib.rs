//! Event-driven resource controllers.
//!
//! A [`Controller`] drives one resource kind: an initial paginated list, a
//! watch that delivers deduplicated events to an [`EventHandler`], and a
//! periodic resync that re-lists the resource into a [`VersionedMap`] and
//! replays whatever the handler reports as missing from local state. The
//! missing predicate is how the engine recovers both from handler failures
//! that left shared tables out of sync and from events lost during a
//! disconnect.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod controller;
mod errors;
mod metrics;
mod store;
mod versioned;

pub use self::{
    client::{ApiClient, ListPage, ResourceClient},
    controller::{Controller, EventHandler},
    errors::ErrorSink,
    metrics::{Action, WatchMetrics},
    store::{ObjectKey, Store},
    versioned::{VersionedMap, VersionedObject},
};
