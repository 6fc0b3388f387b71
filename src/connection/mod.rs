// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! One pipelined session per cluster node. The connection owns two queues:
//! a send queue of frames not yet on the wire, and a pending queue of
//! operations whose responses are expected in the order sent. A writer
//! coroutine flushes the send queue in batches; a reader coroutine pumps
//! the decoder and correlates responses against the pending queue head.

use crate::{
    collections::{watched::WatchFuture, WatchedValue},
    fail::Fail,
    memcached::{encode_request, Frame, FrameDecoder, Opcode, Status, MAGIC_RESPONSE},
    operations::{OpHandle, OpRecord},
    runtime::{Runtime, StreamHandle},
    scheduler::SchedulerHandle,
    topology::NodeAddress,
};
use bytes::{Bytes, BytesMut};
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Dialing,
    Authenticating,
    Ready,
    Draining,
    Dead,
}

/// How a connection reports back to its owner. The implementation holds a
/// weak reference to the client, so connections never keep it alive.
pub(crate) trait ConnEvents<RT: Runtime> {
    /// The dial (and authentication, when configured) succeeded.
    fn on_ready(&self, addr: &NodeAddress);

    /// The connection died; its operations were already failed.
    fn on_dead(&self, addr: &NodeAddress, err: &Fail);

    /// A response carried `NOT_MY_VBUCKET`. The operation has been popped
    /// from the pending queue and must be re-routed (never completed here).
    fn on_not_my_vbucket(&self, addr: &NodeAddress, op: OpHandle, frame: Frame);
}

struct Inner<RT: Runtime> {
    rt: RT,
    addr: NodeAddress,
    phase: Phase,
    stream: Option<RT::Stream>,
    /// Accepted but not yet written.
    sendq: VecDeque<OpHandle>,
    /// On the wire, FIFO. Timed-out entries stay as tombstones until their
    /// response arrives, preserving the opaque cross-check.
    pending: VecDeque<OpHandle>,
    kick: WatchedValue<u64>,
    drain_deadline: Option<Instant>,
    handles: Vec<SchedulerHandle>,
}

pub(crate) struct ServerConnection<RT: Runtime> {
    inner: Rc<RefCell<Inner<RT>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<RT: Runtime> ServerConnection<RT> {
    /// Creates the connection and spawns its driver. `delay` is the
    /// reconnect backoff to burn before dialing.
    pub(crate) fn new(
        rt: RT,
        addr: NodeAddress,
        credentials: Option<(String, String)>,
        delay: Duration,
        events: Rc<dyn ConnEvents<RT>>,
    ) -> Self {
        let conn = Self {
            inner: Rc::new(RefCell::new(Inner {
                rt: rt.clone(),
                addr,
                phase: Phase::Dialing,
                stream: None,
                sendq: VecDeque::new(),
                pending: VecDeque::new(),
                kick: WatchedValue::new(0),
                drain_deadline: None,
                handles: Vec::new(),
            })),
        };
        let handle = rt.spawn(drive(conn.clone(), credentials, delay, events));
        conn.inner.borrow_mut().handles.push(handle);
        conn
    }

    pub(crate) fn phase(&self) -> Phase {
        self.inner.borrow().phase
    }

    pub(crate) fn addr(&self) -> NodeAddress {
        self.inner.borrow().addr.clone()
    }

    fn rt(&self) -> RT {
        self.inner.borrow().rt.clone()
    }

    fn stream(&self) -> Option<RT::Stream> {
        self.inner.borrow().stream.clone()
    }

    /// Accepts an operation. Frames queued before the connection is ready
    /// sit in the send queue until the writer can flush them.
    pub(crate) fn submit(&self, op: OpHandle) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        match inner.phase {
            Phase::Draining | Phase::Dead => Err(Fail::Network {
                details: "connection is not accepting writes",
            }),
            _ => {
                inner.sendq.push_back(op);
                let gen = inner.kick.get();
                inner.kick.set(gen + 1);
                Ok(())
            }
        }
    }

    fn kick_watch(&self) -> (u64, WatchFuture<u64>) {
        self.inner.borrow().kick.watch()
    }

    fn wake_writer(&self) {
        let inner = self.inner.borrow();
        let gen = inner.kick.get();
        inner.kick.set(gen + 1);
    }

    /// Moves the send queue onto the pending queue and concatenates the
    /// frames for one write. Entries that resolved while queued (timeouts)
    /// never reach the wire.
    fn take_batch(&self) -> Option<Bytes> {
        let mut inner = self.inner.borrow_mut();
        if !matches!(inner.phase, Phase::Ready | Phase::Draining) {
            return None;
        }
        let mut buf = BytesMut::new();
        while let Some(op) = inner.sendq.pop_front() {
            if op.borrow().is_done() {
                continue;
            }
            buf.extend_from_slice(&op.borrow().frame);
            inner.pending.push_back(op);
        }
        if buf.is_empty() {
            None
        } else {
            Some(buf.freeze())
        }
    }

    fn attach_stream(&self, stream: RT::Stream) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.stream = Some(stream);
            if inner.phase != Phase::Draining {
                inner.phase = Phase::Ready;
            }
        }
        self.wake_writer();
    }

    fn enter_phase(&self, phase: Phase) {
        self.inner.borrow_mut().phase = phase;
    }

    fn push_handle(&self, handle: SchedulerHandle) {
        self.inner.borrow_mut().handles.push(handle);
    }

    /// Correlates one decoded response. The FIFO head must answer it;
    /// anything else is a framing violation that kills the connection.
    fn dispatch(&self, frame: Frame, events: &Rc<dyn ConnEvents<RT>>) -> Result<(), Fail> {
        let (op, addr) = {
            let mut inner = self.inner.borrow_mut();
            let op = inner.pending.pop_front().ok_or(Fail::Protocol {
                details: "response without a pending request",
            })?;
            (op, inner.addr.clone())
        };
        if op.borrow().opaque != frame.opaque {
            return Err(Fail::Protocol {
                details: "response does not match the pending queue head",
            });
        }
        if frame.status() == Status::NotMyVbucket as u16 {
            if op.borrow().is_done() {
                // Timed out before the redirect arrived; nothing to retry.
                return Ok(());
            }
            events.on_not_my_vbucket(&addr, op, frame);
            return Ok(());
        }
        OpRecord::complete(&op, Ok(frame));
        Ok(())
    }

    /// Starts an orderly shutdown: no new writes, the queues flush, and the
    /// connection retires once empty (or the deadline reaps it).
    pub(crate) fn start_drain(&self, deadline: Instant) {
        let retire_now = {
            let mut inner = self.inner.borrow_mut();
            if inner.phase == Phase::Dead {
                return;
            }
            inner.phase = Phase::Draining;
            inner.drain_deadline = Some(deadline);
            inner.sendq.is_empty() && inner.pending.is_empty()
        };
        if retire_now {
            self.retire();
        } else {
            self.wake_writer();
        }
    }

    fn drained(&self) -> bool {
        let inner = self.inner.borrow();
        inner.phase == Phase::Draining && inner.sendq.is_empty() && inner.pending.is_empty()
    }

    /// Orderly terminal transition; nothing outstanding, nothing to fail.
    fn retire(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.phase = Phase::Dead;
        if let Some(stream) = inner.stream.take() {
            stream.close();
        }
        inner.handles.clear();
    }

    /// Terminal failure: every queued and in-flight operation fails, the
    /// socket closes, and the owner is notified (unless it is the one
    /// tearing us down).
    pub(crate) fn fail(&self, err: Fail, events: Option<&Rc<dyn ConnEvents<RT>>>) {
        let (ops, addr) = {
            let mut inner = self.inner.borrow_mut();
            if inner.phase == Phase::Dead {
                return;
            }
            inner.phase = Phase::Dead;
            if let Some(stream) = inner.stream.take() {
                stream.close();
            }
            inner.handles.clear();
            let mut ops: Vec<OpHandle> = inner.sendq.drain(..).collect();
            ops.extend(inner.pending.drain(..));
            (ops, inner.addr.clone())
        };
        debug!("connection {} failed: {}", addr.key(), err);
        for op in &ops {
            OpRecord::complete(op, Err(err.clone()));
        }
        if let Some(events) = events {
            events.on_dead(&addr, &err);
        }
    }

    /// Fires overdue operation deadlines and reports the earliest live one.
    /// The caller treats expirations as network-class errors.
    pub(crate) fn expire(&self, now: Instant) -> (u32, Option<Instant>) {
        let mut overdue = Vec::new();
        let mut earliest: Option<Instant> = None;
        let mut drain_overdue = false;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.phase == Phase::Dead {
                return (0, None);
            }
            inner.sendq.retain(|op| !op.borrow().is_done());
            for op in inner.sendq.iter().chain(inner.pending.iter()) {
                let record = op.borrow();
                if record.is_done() {
                    continue;
                }
                if record.deadline <= now {
                    overdue.push(op.clone());
                } else {
                    earliest = Some(match earliest {
                        Some(t) => t.min(record.deadline),
                        None => record.deadline,
                    });
                }
            }
            if inner.phase == Phase::Draining {
                if let Some(deadline) = inner.drain_deadline {
                    if deadline <= now {
                        drain_overdue = true;
                    } else {
                        earliest = Some(match earliest {
                            Some(t) => t.min(deadline),
                            None => deadline,
                        });
                    }
                }
            }
        }
        for op in &overdue {
            OpRecord::complete(op, Err(Fail::Timedout {}));
        }
        if drain_overdue {
            self.fail(
                Fail::Network {
                    details: "drain deadline elapsed",
                },
                None,
            );
        }
        (overdue.len() as u32, earliest)
    }
}

//==============================================================================
// Connection Coroutines
//==============================================================================

async fn drive<RT: Runtime>(
    conn: ServerConnection<RT>,
    credentials: Option<(String, String)>,
    delay: Duration,
    events: Rc<dyn ConnEvents<RT>>,
) {
    let rt = conn.rt();
    if delay > Duration::from_micros(0) {
        rt.wait(delay).await;
    }
    if conn.phase() == Phase::Dead {
        return;
    }
    let addr = conn.addr();
    trace!("dialing {}", addr.key());
    let stream = match rt.connect(&addr.host, addr.data_port).await {
        Ok(stream) => stream,
        Err(e) => {
            conn.fail(e, Some(&events));
            return;
        }
    };
    if conn.phase() == Phase::Dead {
        stream.close();
        return;
    }
    if let Some((username, password)) = credentials {
        conn.enter_phase(Phase::Authenticating);
        if let Err(e) = authenticate(&stream, &username, &password).await {
            conn.fail(e, Some(&events));
            return;
        }
        if conn.phase() == Phase::Dead {
            stream.close();
            return;
        }
    }
    conn.attach_stream(stream.clone());
    events.on_ready(&conn.addr());
    let writer = rt.spawn(write_loop(conn.clone(), events.clone()));
    conn.push_handle(writer);
    read_loop(conn, stream, events).await
}

/// SASL PLAIN. Anything beyond a clean success is an authentication
/// failure; fatal, never retried.
pub(crate) async fn authenticate<S: StreamHandle>(
    stream: &S,
    username: &str,
    password: &str,
) -> Result<(), Fail> {
    let mut value = Vec::with_capacity(username.len() + password.len() + 2);
    value.push(0);
    value.extend_from_slice(username.as_bytes());
    value.push(0);
    value.extend_from_slice(password.as_bytes());
    let frame = encode_request(Opcode::SaslAuth, 0, 0, 0, &[], b"PLAIN", &value)?;
    stream.push(frame).await?;
    let mut decoder = FrameDecoder::new(MAGIC_RESPONSE);
    loop {
        let buf = stream.pop().await?;
        if buf.is_empty() {
            return Err(Fail::RemoteClosed {});
        }
        decoder.feed(&buf);
        if let Some(frame) = decoder.next()? {
            return if frame.status() == Status::Success as u16 {
                Ok(())
            } else {
                Err(Fail::Auth {})
            };
        }
    }
}

async fn write_loop<RT: Runtime>(conn: ServerConnection<RT>, events: Rc<dyn ConnEvents<RT>>) {
    loop {
        // Watch first: a submit landing between the check and the await
        // resolves the watch immediately instead of being lost.
        let (_, changed) = conn.kick_watch();
        match conn.take_batch() {
            Some(batch) => {
                let stream = match conn.stream() {
                    Some(stream) => stream,
                    None => return,
                };
                if let Err(e) = stream.push(batch).await {
                    conn.fail(e, Some(&events));
                    return;
                }
            }
            None => {
                changed.await;
            }
        }
    }
}

async fn read_loop<RT: Runtime>(
    conn: ServerConnection<RT>,
    stream: RT::Stream,
    events: Rc<dyn ConnEvents<RT>>,
) {
    let mut decoder = FrameDecoder::new(MAGIC_RESPONSE);
    loop {
        let buf = match stream.pop().await {
            Ok(buf) => buf,
            Err(e) => {
                conn.fail(e, Some(&events));
                return;
            }
        };
        if buf.is_empty() {
            if conn.drained() {
                conn.retire();
            } else {
                conn.fail(Fail::RemoteClosed {}, Some(&events));
            }
            return;
        }
        decoder.feed(&buf);
        loop {
            match decoder.next() {
                Ok(Some(frame)) => {
                    if let Err(e) = conn.dispatch(frame, &events) {
                        conn.fail(e, Some(&events));
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    conn.fail(e, Some(&events));
                    return;
                }
            }
        }
        if conn.drained() {
            conn.retire();
            return;
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<RT: Runtime> Clone for ServerConnection<RT> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
