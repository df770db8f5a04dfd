//! A log-shipping data plane: file tailers feed a bundling engine that hands
//! fixed-shape batches to a downstream handler under size, count, time, and
//! memory constraints, with ordered concurrent dispatch.

#![deny(unused_allocation)]
#![deny(unused_comparisons)]

#[macro_use]
extern crate tracing;

pub mod app;
pub mod bundler;
pub mod cli;
pub mod config;
pub mod event;
pub mod sinks;
pub mod sources;
pub mod trace;

pub use bundler::{AddError, BundleHandler, Bundler, BundlerSettings};
pub use event::{ByteSizeOf, Line};
