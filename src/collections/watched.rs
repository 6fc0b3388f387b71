// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// A single-threaded watchable cell. Readers obtain the current value plus a
/// future that resolves the next time anybody stores a new one. Background
/// coroutines select on these futures to react to queue and phase changes.
pub struct WatchedValue<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

struct Inner<T> {
    value: T,
    generation: u64,
    wakers: Vec<Waker>,
}

/// Resolves with the stored value once its generation moves past the one
/// observed at creation time.
pub struct WatchFuture<T> {
    inner: Rc<RefCell<Inner<T>>>,
    observed: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<T: Copy> WatchedValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                value,
                generation: 0,
                wakers: Vec::new(),
            })),
        }
    }

    pub fn get(&self) -> T {
        self.inner.borrow().value
    }

    pub fn set(&self, value: T) {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            inner.value = value;
            inner.generation += 1;
            std::mem::replace(&mut inner.wakers, Vec::new())
        };
        for w in wakers {
            w.wake();
        }
    }

    /// Snapshot the current value and obtain a future for the next change.
    /// The snapshot is taken atomically with the registration, so a `set`
    /// racing a `watch` is never lost.
    pub fn watch(&self) -> (T, WatchFuture<T>) {
        let inner = self.inner.borrow();
        let fut = WatchFuture {
            inner: self.inner.clone(),
            observed: inner.generation,
        };
        (inner.value, fut)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<T> Clone for WatchedValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy + Unpin> Future for WatchFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<T> {
        let self_ = self.get_mut();
        let mut inner = self_.inner.borrow_mut();
        if inner.generation != self_.observed {
            return Poll::Ready(inner.value);
        }
        if !inner.wakers.iter().any(|w| w.will_wake(ctx.waker())) {
            inner.wakers.push(ctx.waker().clone());
        }
        Poll::Pending
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
