#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A front-end dispatch controller for a data-parallel inference service. A
//! fleet of `N` replica workers each host an identical model across some
//! tensor-parallel group of accelerators; this crate routes each tokenized
//! generation request to exactly one replica, under one of three routing
//! policies (`ROUND_ROBIN`, `SHORTEST_QUEUE`, `RESOURCES_AWARE`), while
//! broadcasting cache-flush and abort control messages to every replica or to
//! whichever one a pending request was routed to.
//!
//! The crate is split along the same lines as the dispatcher's own
//! components: [`message`] (the wire types), [`shared_load`] (the per-replica
//! load counters `RESOURCES_AWARE` consults), [`config`] (configuration
//! loading and validation), [`intake`] (the non-blocking socket
//! multiplexer), [`worker`] (the worker handle table and process spawning),
//! [`policy`] (the three routing policies), and [`dispatcher`] (the
//! composition root and dispatch loop — see [`dispatcher::run`]).

pub use config;
pub use dispatcher;
pub use intake;
pub use message;
pub use policy;
pub use shared_load;
pub use task;
pub use worker;
