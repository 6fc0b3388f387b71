// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative single-threaded task scheduler. Every background coroutine in
//! the engine (connection drivers, the deadline sweeper, the bootstrap
//! provider) lives here; `poll()` drives whatever woke up since the last
//! call. Nothing in the engine blocks: suspension happens only inside the
//! I/O provider.

use futures::task::{waker, ArcWake};
use slab::Slab;
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

//==============================================================================
// Constants & Structures
//==============================================================================

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

struct Task {
    // Taken out while the task is being polled.
    future: Option<TaskFuture>,
    completed: bool,
    // Guards against slab slot reuse: a handle only acts on its own task.
    gen: u64,
}

/// Wakers are `Send + Sync` by contract even though the scheduler itself is
/// single-threaded, so the ready set sits behind a mutex.
struct ReadyQueue {
    queue: Mutex<VecDeque<usize>>,
}

struct TaskWaker {
    key: usize,
    ready: Arc<ReadyQueue>,
}

struct Inner {
    tasks: Slab<Task>,
    ready: Arc<ReadyQueue>,
    next_gen: u64,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
}

/// Owner token for a scheduled task. Dropping the handle cancels the task if
/// it has not completed yet.
pub struct SchedulerHandle {
    key: usize,
    gen: u64,
    inner: Rc<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl ReadyQueue {
    fn push(&self, key: usize) {
        self.queue.lock().unwrap().push_back(key);
    }

    fn pop(&self) -> Option<usize> {
        self.queue.lock().unwrap().pop_front()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                tasks: Slab::new(),
                ready: Arc::new(ReadyQueue {
                    queue: Mutex::new(VecDeque::new()),
                }),
                next_gen: 0,
            })),
        }
    }

    /// Inserts a task and schedules its first poll.
    pub fn insert(&self, future: TaskFuture) -> SchedulerHandle {
        let mut inner = self.inner.borrow_mut();
        let gen = inner.next_gen;
        inner.next_gen += 1;
        let key = inner.tasks.insert(Task {
            future: Some(future),
            completed: false,
            gen,
        });
        inner.ready.push(key);
        SchedulerHandle {
            key,
            gen,
            inner: self.inner.clone(),
        }
    }

    /// Polls every task woken since the last call, including tasks woken
    /// while this call runs, until the ready set drains.
    pub fn poll(&self) {
        loop {
            let key = {
                let inner = self.inner.borrow();
                inner.ready.pop()
            };
            let key = match key {
                Some(key) => key,
                None => break,
            };
            let (mut future, gen, ready) = {
                let mut inner = self.inner.borrow_mut();
                let ready = inner.ready.clone();
                match inner.tasks.get_mut(key) {
                    Some(task) if !task.completed && task.future.is_some() => {
                        (task.future.take().unwrap(), task.gen, ready)
                    }
                    // Canceled, completed, or mid-poll: stale wakeup.
                    _ => continue,
                }
            };
            let task_waker = waker(Arc::new(TaskWaker { key, ready }));
            let mut ctx = Context::from_waker(&task_waker);
            let result = future.as_mut().poll(&mut ctx);
            let mut inner = self.inner.borrow_mut();
            match inner.tasks.get_mut(key) {
                // The task may have canceled itself (or been canceled) while
                // running; only write back into our own slot.
                Some(task) if task.gen == gen => match result {
                    Poll::Ready(()) => task.completed = true,
                    Poll::Pending => task.future = Some(future),
                },
                _ => {}
            }
        }
    }

    #[cfg(test)]
    pub fn num_tasks(&self) -> usize {
        self.inner.borrow().tasks.len()
    }
}

impl SchedulerHandle {
    pub fn has_completed(&self) -> bool {
        let inner = self.inner.borrow();
        match inner.tasks.get(self.key) {
            Some(task) if task.gen == self.gen => task.completed,
            _ => true,
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.push(arc_self.key);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        let matches = match inner.tasks.get(self.key) {
            Some(task) => task.gen == self.gen,
            None => false,
        };
        if matches {
            inner.tasks.remove(self.key);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn runs_to_completion() {
        let scheduler = Scheduler::new();
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let handle = scheduler.insert(Box::pin(async move {
            hits2.set(hits2.get() + 1);
        }));
        assert!(!handle.has_completed());
        scheduler.poll();
        assert!(handle.has_completed());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn drop_cancels() {
        let scheduler = Scheduler::new();
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let handle = scheduler.insert(Box::pin(async move {
            hits2.set(hits2.get() + 1);
        }));
        drop(handle);
        scheduler.poll();
        assert_eq!(hits.get(), 0);
        assert_eq!(scheduler.num_tasks(), 0);
    }

    #[test]
    fn wake_reschedules() {
        use crate::collections::WatchedValue;
        let scheduler = Scheduler::new();
        let cell = WatchedValue::new(0u32);
        let observed = Rc::new(Cell::new(0u32));
        let (cell2, observed2) = (cell.clone(), observed.clone());
        let _handle = scheduler.insert(Box::pin(async move {
            let (_, changed) = cell2.watch();
            observed2.set(changed.await);
        }));
        scheduler.poll();
        assert_eq!(observed.get(), 0);
        cell.set(9);
        scheduler.poll();
        assert_eq!(observed.get(), 9);
    }
}
