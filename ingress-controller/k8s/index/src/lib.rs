//! Ingress controller index
//!
//! Configuration objects are delivered by Kubernetes watches into an
//! [`ObjectStore`]. Every change to the store advances a change generation
//! that the [`Scheduler`] observes; after a debounce window the scheduler takes
//! a [`Snapshot`] of the store and runs the [`Builder`] over it:
//!
//! ```text
//! [ watches ] -> [ ObjectStore ] -> [ Scheduler ] -> [ Builder ] -> [ observers ]
//!                                                              \-> [ status sink ]
//! ```
//!
//! The builder is a pure function of the snapshot. It produces a
//! `RoutingGraph`, which is handed to each observer in turn, and a status
//! result for every root object it processed.
//!
//! Endpoints never pass through this crate's builder: they change far more
//! often than routing configuration and are indexed directly by the endpoint
//! cache.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod builder;
mod metrics;
mod scheduler;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    builder::{BuildOutput, Builder, Config},
    metrics::RebuildMetrics,
    scheduler::{Debounce, Scheduler},
    store::{Object, ObjectStore, SharedStore, Snapshot},
};
