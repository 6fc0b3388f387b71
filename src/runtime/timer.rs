// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct Expiry(Instant);

impl Expiry {
    fn has_expired(&self, now: Instant) -> bool {
        now >= self.0
    }
}

impl Ord for Expiry {
    fn cmp(&self, other: &Expiry) -> Ordering {
        // `BinaryHeap` is a max-heap, so reverse the comparison to get
        // `peek()` and `pop()` to return the earliest deadline.
        match self.0.cmp(&other.0) {
            Ordering::Equal => Ordering::Equal,
            Ordering::Less => Ordering::Greater,
            Ordering::Greater => Ordering::Less,
        }
    }
}

impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Expiry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    expiry: Expiry,
    id: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        self.expiry.cmp(&other.expiry)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct WaitState {
    fired: bool,
    waker: Option<Waker>,
}

struct TimerInner {
    now: Instant,
    heap: BinaryHeap<Entry>,
    waiters: HashMap<u64, WaitState>,
    next_id: u64,
}

/// The provider clock. Waiters park here; whoever owns the event loop calls
/// `advance_clock` and due waiters wake. Dropping a [WaitFuture] cancels its
/// entry synchronously: once the drop returns the wait can never fire.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<RefCell<TimerInner>>,
}

pub struct WaitFuture {
    inner: Rc<RefCell<TimerInner>>,
    id: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Timer {
    pub fn new(now: Instant) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TimerInner {
                now,
                heap: BinaryHeap::new(),
                waiters: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    pub fn now(&self) -> Instant {
        self.inner.borrow().now
    }

    pub fn wait(&self, how_long: Duration) -> WaitFuture {
        let when = self.inner.borrow().now + how_long;
        self.wait_until(when)
    }

    pub fn wait_until(&self, when: Instant) -> WaitFuture {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let fired = Expiry(when).has_expired(inner.now);
        inner.waiters.insert(id, WaitState { fired, waker: None });
        if !fired {
            inner.heap.push(Entry {
                expiry: Expiry(when),
                id,
            });
        }
        WaitFuture {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Earliest live deadline, if any. Blocking providers use it to bound
    /// their sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.borrow_mut();
        loop {
            let (expiry, id) = match inner.heap.peek() {
                Some(entry) => (entry.expiry, entry.id),
                None => return None,
            };
            // Canceled entries linger in the heap; skim them off the top.
            if inner.waiters.contains_key(&id) {
                return Some(expiry.0);
            }
            inner.heap.pop();
        }
    }

    pub fn advance_clock(&self, now: Instant) {
        let mut wakers = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            assert!(now >= inner.now);
            inner.now = now;
            while let Some(entry) = inner.heap.peek() {
                if !entry.expiry.has_expired(now) {
                    break;
                }
                let id = entry.id;
                inner.heap.pop();
                if let Some(state) = inner.waiters.get_mut(&id) {
                    state.fired = true;
                    if let Some(w) = state.waker.take() {
                        wakers.push(w);
                    }
                }
            }
        }
        for w in wakers {
            w.wake();
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Future for WaitFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<()> {
        let self_ = self.get_mut();
        let mut inner = self_.inner.borrow_mut();
        let state = match inner.waiters.get_mut(&self_.id) {
            Some(state) => state,
            None => panic!("Polled after drop"),
        };
        if state.fired {
            Poll::Ready(())
        } else {
            state.waker = Some(ctx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for WaitFuture {
    fn drop(&mut self) {
        self.inner.borrow_mut().waiters.remove(&self.id);
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
