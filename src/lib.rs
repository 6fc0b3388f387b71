// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A pipelined, vbucket-aware cluster client engine.
//!
//! The crate connects an application to a cluster of key/value nodes,
//! bootstraps the cluster topology, routes commands to the node owning each
//! key, and pipelines them over per-node binary-protocol connections. All of
//! it runs single-threaded and cooperatively on top of a pluggable
//! [Runtime](crate::runtime::Runtime).

#[macro_use]
extern crate log;
#[macro_use]
extern crate num_derive;

pub mod bootstrap;
pub mod client;
pub mod collections;
pub mod connection;
pub mod durability;
pub mod fail;
pub mod http;
pub mod memcached;
pub mod operations;
pub mod options;
pub mod runtime;
pub mod scheduler;
pub mod topology;

#[cfg(test)]
pub mod test_helpers;

pub use crate::{
    client::Client,
    durability::{DurabilityCommand, DurabilityResult},
    fail::{ErrorKind, Fail},
    operations::{
        ArithmeticCommand, ArithmeticKind, CounterResult, GetResult, MutationResult, StoreCommand,
        StoreKind, StoreResult,
    },
    options::{ClientOptions, ConfigTransport, SeedNode},
    runtime::{posix::PosixRuntime, Runtime, StreamHandle},
};
