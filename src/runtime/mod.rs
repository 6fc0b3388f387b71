// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The I/O provider abstraction. The engine never touches a socket or a
//! clock directly: everything goes through a [Runtime], which supplies a
//! virtual clock with timers, a dialer, a task scheduler, and randomness.
//!
//! The surface is completion-shaped: `connect`, `push`, and `pop` each
//! return a future that resolves when the whole operation finishes.
//! Completion-mode providers map onto it directly; readiness-mode providers
//! (such as [posix::PosixRuntime]) adapt by retrying the nonblocking call
//! and parking the task waker until the socket signals readiness.

pub mod posix;
pub mod timer;

use crate::{
    fail::Fail,
    scheduler::{Scheduler, SchedulerHandle},
};
use bytes::Bytes;
use std::{
    future::Future,
    time::{Duration, Instant},
};

pub use timer::{Timer, WaitFuture};

/// One established byte stream. Handles are cheap clones of the same
/// underlying socket; the engine keeps one for its writer coroutine and one
/// for its reader coroutine.
pub trait StreamHandle: Clone + 'static {
    type PushFuture: Future<Output = Result<(), Fail>> + Unpin;
    type PopFuture: Future<Output = Result<Bytes, Fail>> + Unpin;

    /// Writes the whole buffer. Resolves once every byte is handed to the
    /// transport.
    fn push(&self, buf: Bytes) -> Self::PushFuture;

    /// Reads whatever is available. An empty buffer signals an orderly
    /// remote close.
    fn pop(&self) -> Self::PopFuture;

    fn close(&self);
}

pub trait Runtime: Clone + 'static {
    type Stream: StreamHandle;
    type ConnectFuture: Future<Output = Result<Self::Stream, Fail>> + Unpin;
    type WaitFuture: Future<Output = ()> + Unpin;

    /// The provider's notion of the current time. Advances only at
    /// suspension points.
    fn now(&self) -> Instant;

    fn wait(&self, how_long: Duration) -> Self::WaitFuture;

    fn wait_until(&self, when: Instant) -> Self::WaitFuture;

    /// Begins dialing a TCP connection. At most one dial per server
    /// connection is outstanding at any time.
    fn connect(&self, host: &str, port: u16) -> Self::ConnectFuture;

    fn scheduler(&self) -> &Scheduler;

    fn spawn<F: Future<Output = ()> + 'static>(&self, future: F) -> SchedulerHandle {
        self.scheduler().insert(Box::pin(future))
    }

    /// Runs ready tasks and, when `block` is set, parks until external I/O
    /// or the next timer could make progress.
    fn poll_io(&self, block: bool);

    fn rng_gen_u32(&self) -> u32;
}
