//! Ingress controller status publisher
//!
//! Every rebuild of the routing graph computes a [`StatusResult`] for each
//! HTTPProxy and ExtensionService. The [`Index`] caches the last result seen
//! for every object and forwards only changed results, as [`Update`]s, to the
//! [`Controller`], which writes them back to the Kubernetes API through a
//! [`StatusWriter`].
//!
//! Deleting an object invalidates its cached result, so an object recreated
//! with the same name always has its status written. Only the leader writes;
//! a newly elected leader forgets the results it cached while following.
//!
//! [`StatusResult`]: ingress_controller_core::StatusResult

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod index;
mod writer;

#[cfg(test)]
mod tests;

pub use self::{
    controller::{Controller, ControllerMetrics},
    index::{Index, IndexMetrics, IndexSink, SharedIndex, Update},
    writer::{KubeWriter, StatusWriter, WriteError},
};
