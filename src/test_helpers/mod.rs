// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deterministic test harness: a [TestRuntime] with a virtual clock and a
//! hand-driven scheduler, plus scripted in-memory cluster nodes that speak
//! enough of the binary protocol and of the HTTP bootstrap feed to drive
//! every end-to-end scenario without a socket.

use crate::{
    fail::Fail,
    memcached::{
        encode_response, Frame, FrameDecoder, Opcode, Status, MAGIC_REQUEST,
    },
    runtime::{
        timer::{Timer, WaitFuture},
        Runtime, StreamHandle,
    },
    scheduler::Scheduler,
};
use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Bytes, BytesMut};
use num_traits::FromPrimitive;
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use std::{
    cell::RefCell,
    collections::HashMap,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Instant,
};

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Data,
    Http,
}

struct StoredValue {
    value: Bytes,
    flags: u32,
    cas: u64,
}

struct ConnState {
    inbox: BytesMut,
    decoder: FrameDecoder,
    outbox: VecDeque<Bytes>,
    waker: Option<Waker>,
    closed: bool,
    headers_sent: bool,
}

struct SimNodeState {
    kind: NodeKind,
    refuse_connect: bool,
    black_hole: bool,
    config: Option<Bytes>,
    password: Option<String>,
    nmv: HashMap<u16, u32>,
    nmv_payload: Option<Bytes>,
    persisted: bool,
    close_after_response: bool,
    kv: HashMap<Vec<u8>, StoredValue>,
    cas_seq: u64,
    ops_seen: u32,
    conns: Vec<ConnState>,
}

/// Scripting handle for one simulated node.
#[derive(Clone)]
pub struct SimNode {
    state: Rc<RefCell<SimNodeState>>,
}

#[derive(Clone)]
pub struct TestRuntime {
    timer: Timer,
    scheduler: Scheduler,
    rng: Rc<RefCell<SmallRng>>,
    nodes: Rc<RefCell<HashMap<(String, u16), SimNode>>>,
}

#[derive(Clone)]
pub struct SimStream {
    state: Rc<RefCell<SimNodeState>>,
    conn: usize,
}

pub struct SimPopFuture {
    state: Rc<RefCell<SimNodeState>>,
    conn: usize,
}

/// Resolves immediately, or never (a host that swallows SYNs).
pub struct SimConnectFuture {
    result: Option<Result<SimStream, Fail>>,
    never: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl SimNodeState {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            refuse_connect: false,
            black_hole: false,
            config: None,
            password: None,
            nmv: HashMap::new(),
            nmv_payload: None,
            persisted: true,
            close_after_response: false,
            kv: HashMap::new(),
            cas_seq: 0,
            ops_seen: 0,
            conns: Vec::new(),
        }
    }

    fn next_cas(&mut self) -> u64 {
        self.cas_seq += 1;
        self.cas_seq
    }

    fn open_conn(&mut self) -> usize {
        self.conns.push(ConnState {
            inbox: BytesMut::new(),
            decoder: FrameDecoder::new(MAGIC_REQUEST),
            outbox: VecDeque::new(),
            waker: None,
            closed: false,
            headers_sent: false,
        });
        self.conns.len() - 1
    }

    fn reply(&mut self, conn: usize, buf: Bytes) {
        let conn = &mut self.conns[conn];
        conn.outbox.push_back(buf);
        if let Some(w) = conn.waker.take() {
            w.wake();
        }
    }

    /// The scripted data-port server.
    fn respond(&mut self, request: Frame) -> Option<Bytes> {
        self.ops_seen += 1;
        let opaque = request.opaque;
        let opcode = match Opcode::from_u8(request.opcode) {
            Some(opcode) => opcode,
            None => {
                return encode_response(
                    request.opcode,
                    Status::UnknownCommand as u16,
                    opaque,
                    0,
                    &[],
                    &[],
                    &[],
                )
                .ok()
            }
        };
        let respond = |status: Status, cas: u64, extras: &[u8], value: &[u8]| {
            encode_response(opcode as u8, status as u16, opaque, cas, extras, &[], value).ok()
        };
        match opcode {
            Opcode::SaslAuth => {
                // Any user is accepted as long as the password matches.
                let ok = match &self.password {
                    Some(password) => {
                        let parts: Vec<&[u8]> = request.value.split(|&b| b == 0).collect();
                        parts.len() == 3 && parts[2] == password.as_bytes()
                    }
                    None => true,
                };
                if ok {
                    respond(Status::Success, 0, &[], &[])
                } else {
                    respond(Status::AuthError, 0, &[], &[])
                }
            }
            Opcode::GetClusterConfig => match self.config.clone() {
                Some(config) => respond(Status::Success, 0, &[], &config),
                None => respond(Status::UnknownCommand, 0, &[], &[]),
            },
            Opcode::Noop => respond(Status::Success, 0, &[], &[]),
            Opcode::SaslListMechs => respond(Status::Success, 0, &[], b"PLAIN"),
            Opcode::Observe => {
                if self.black_hole {
                    return None;
                }
                self.respond_observe(&request, opaque)
            }
            _ => {
                // Keyed data op: misrouted vbuckets bounce first.
                if let Some(remaining) = self.nmv.get_mut(&request.vbucket()) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        let payload = self.nmv_payload.clone().unwrap_or_else(Bytes::new);
                        return encode_response(
                            opcode as u8,
                            Status::NotMyVbucket as u16,
                            opaque,
                            0,
                            &[],
                            &[],
                            &payload,
                        )
                        .ok();
                    }
                }
                if self.black_hole {
                    return None;
                }
                self.respond_data(opcode, &request, opaque)
            }
        }
    }

    fn respond_data(&mut self, opcode: Opcode, request: &Frame, opaque: u32) -> Option<Bytes> {
        let respond = |status: Status, cas: u64, extras: &[u8], value: &[u8]| {
            encode_response(opcode as u8, status as u16, opaque, cas, extras, &[], value).ok()
        };
        let key = request.key.to_vec();
        match opcode {
            Opcode::Get | Opcode::GetReplica => match self.kv.get(&key) {
                Some(stored) => {
                    let mut extras = [0u8; 4];
                    NetworkEndian::write_u32(&mut extras, stored.flags);
                    let value = stored.value.clone();
                    let cas = stored.cas;
                    respond(Status::Success, cas, &extras, &value)
                }
                None => respond(Status::KeyNotFound, 0, &[], &[]),
            },
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                let exists = self.kv.contains_key(&key);
                if opcode == Opcode::Add && exists {
                    return respond(Status::KeyExists, 0, &[], &[]);
                }
                if opcode == Opcode::Replace && !exists {
                    return respond(Status::KeyNotFound, 0, &[], &[]);
                }
                if request.cas != 0 {
                    match self.kv.get(&key) {
                        Some(stored) if stored.cas != request.cas => {
                            return respond(Status::KeyExists, 0, &[], &[]);
                        }
                        None => return respond(Status::KeyNotFound, 0, &[], &[]),
                        _ => {}
                    }
                }
                let flags = if request.extras.len() >= 4 {
                    NetworkEndian::read_u32(&request.extras[..4])
                } else {
                    0
                };
                let cas = self.next_cas();
                self.kv.insert(
                    key,
                    StoredValue {
                        value: request.value.clone(),
                        flags,
                        cas,
                    },
                );
                respond(Status::Success, cas, &[], &[])
            }
            Opcode::Append | Opcode::Prepend => match self.kv.get_mut(&key) {
                Some(stored) => {
                    let mut merged = BytesMut::new();
                    if opcode == Opcode::Append {
                        merged.extend_from_slice(&stored.value);
                        merged.extend_from_slice(&request.value);
                    } else {
                        merged.extend_from_slice(&request.value);
                        merged.extend_from_slice(&stored.value);
                    }
                    stored.value = merged.freeze();
                    let cas = self.cas_seq + 1;
                    self.cas_seq = cas;
                    stored.cas = cas;
                    respond(Status::Success, cas, &[], &[])
                }
                None => respond(Status::NotStored, 0, &[], &[]),
            },
            Opcode::Delete => match self.kv.remove(&key) {
                Some(_) => respond(Status::Success, 0, &[], &[]),
                None => respond(Status::KeyNotFound, 0, &[], &[]),
            },
            Opcode::Increment | Opcode::Decrement => {
                if request.extras.len() != 20 {
                    return respond(Status::InvalidArguments, 0, &[], &[]);
                }
                let delta = NetworkEndian::read_u64(&request.extras[0..8]);
                let initial = NetworkEndian::read_u64(&request.extras[8..16]);
                let expiry = NetworkEndian::read_u32(&request.extras[16..20]);
                let current = match self.kv.get(&key) {
                    Some(stored) => {
                        match std::str::from_utf8(&stored.value)
                            .ok()
                            .and_then(|text| text.trim().parse::<u64>().ok())
                        {
                            Some(n) => Some(n),
                            None => return respond(Status::DeltaBadValue, 0, &[], &[]),
                        }
                    }
                    None => None,
                };
                let next = match current {
                    Some(n) => {
                        if opcode == Opcode::Increment {
                            n.wrapping_add(delta)
                        } else {
                            n.saturating_sub(delta)
                        }
                    }
                    None => {
                        if expiry == 0xffff_ffff {
                            return respond(Status::KeyNotFound, 0, &[], &[]);
                        }
                        initial
                    }
                };
                let cas = self.next_cas();
                self.kv.insert(
                    key,
                    StoredValue {
                        value: Bytes::from(next.to_string()),
                        flags: 0,
                        cas,
                    },
                );
                let mut value = [0u8; 8];
                NetworkEndian::write_u64(&mut value, next);
                respond(Status::Success, cas, &[], &value)
            }
            Opcode::Touch => match self.kv.get(&key) {
                Some(stored) => {
                    let cas = stored.cas;
                    respond(Status::Success, cas, &[], &[])
                }
                None => respond(Status::KeyNotFound, 0, &[], &[]),
            },
            _ => respond(Status::UnknownCommand, 0, &[], &[]),
        }
    }

    fn respond_observe(&mut self, request: &Frame, opaque: u32) -> Option<Bytes> {
        let body = &request.value[..];
        let mut out = BytesMut::new();
        let mut at = 0;
        while body.len() >= at + 4 {
            let vbucket = NetworkEndian::read_u16(&body[at..at + 2]);
            let key_len = NetworkEndian::read_u16(&body[at + 2..at + 4]) as usize;
            if body.len() < at + 4 + key_len {
                break;
            }
            let key = &body[at + 4..at + 4 + key_len];
            at += 4 + key_len;
            let (status, cas) = match self.kv.get(key) {
                Some(stored) => {
                    let status = if self.persisted { 0x01u8 } else { 0x00u8 };
                    (status, stored.cas)
                }
                None => (0x80u8, 0),
            };
            let mut entry = [0u8; 4];
            NetworkEndian::write_u16(&mut entry[0..2], vbucket);
            NetworkEndian::write_u16(&mut entry[2..4], key_len as u16);
            out.extend_from_slice(&entry);
            out.extend_from_slice(key);
            out.extend_from_slice(&[status]);
            let mut cas_bytes = [0u8; 8];
            NetworkEndian::write_u64(&mut cas_bytes, cas);
            out.extend_from_slice(&cas_bytes);
        }
        encode_response(
            Opcode::Observe as u8,
            Status::Success as u16,
            opaque,
            0,
            &[],
            &[],
            &out,
        )
        .ok()
    }

    /// The scripted management-port server: answers the streaming feed
    /// request with the configured document and keeps the socket open.
    fn respond_http(&mut self, conn: usize) {
        if self.conns[conn].headers_sent {
            return;
        }
        let end = {
            let inbox = &self.conns[conn].inbox;
            inbox
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
        };
        if end.is_none() {
            return;
        }
        self.conns[conn].headers_sent = true;
        match self.config.clone() {
            Some(config) => {
                let mut payload = BytesMut::new();
                payload.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
                payload.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
                payload.extend_from_slice(&config);
                payload.extend_from_slice(b"\n\n\n\n");
                self.reply(conn, payload.freeze());
            }
            None => {
                self.reply(
                    conn,
                    Bytes::from_static(
                        b"HTTP/1.1 404 Object Not Found\r\nContent-Length: 0\r\n\r\n",
                    ),
                );
            }
        }
        if self.close_after_response {
            self.conns[conn].closed = true;
        }
    }

    fn handle_input(&mut self, conn: usize, buf: &[u8]) -> Result<(), Fail> {
        if self.conns[conn].closed {
            return Err(Fail::Network {
                details: "stream closed",
            });
        }
        match self.kind {
            NodeKind::Http => {
                self.conns[conn].inbox.extend_from_slice(buf);
                self.respond_http(conn);
            }
            NodeKind::Data => {
                self.conns[conn].decoder.feed(buf);
                loop {
                    let frame = match self.conns[conn].decoder.next() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => return Err(e),
                    };
                    if let Some(response) = self.respond(frame) {
                        self.reply(conn, response);
                    }
                }
            }
        }
        Ok(())
    }
}

impl SimNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimNodeState::new(kind))),
        }
    }

    pub fn serve_config(&self, json: &str) {
        self.state.borrow_mut().config = Some(Bytes::from(json.to_string()));
    }

    /// Pushes another document to every open streaming-feed connection.
    pub fn push_config(&self, json: &str) {
        let mut state = self.state.borrow_mut();
        state.config = Some(Bytes::from(json.to_string()));
        let mut payload = BytesMut::new();
        payload.extend_from_slice(json.as_bytes());
        payload.extend_from_slice(b"\n\n\n\n");
        let payload = payload.freeze();
        for conn in 0..state.conns.len() {
            if state.conns[conn].headers_sent && !state.conns[conn].closed {
                state.reply(conn, payload.clone());
            }
        }
    }

    pub fn refuse_connections(&self) {
        self.state.borrow_mut().refuse_connect = true;
    }

    /// Accept frames but never answer data operations.
    pub fn black_hole(&self) {
        self.state.borrow_mut().black_hole = true;
    }

    pub fn require_password(&self, password: &str) {
        self.state.borrow_mut().password = Some(password.to_string());
    }

    /// Bounce the next `count` keyed requests for a vbucket with
    /// `NOT_MY_VBUCKET`, optionally piggy-backing a configuration document.
    pub fn not_my_vbucket(&self, vbucket: u16, count: u32, payload: Option<&str>) {
        let mut state = self.state.borrow_mut();
        state.nmv.insert(vbucket, count);
        state.nmv_payload = payload.map(|p| Bytes::from(p.to_string()));
    }

    pub fn set_persisted(&self, persisted: bool) {
        self.state.borrow_mut().persisted = persisted;
    }

    /// Serve one response per connection, then signal end-of-stream.
    pub fn close_after_response(&self) {
        self.state.borrow_mut().close_after_response = true;
    }

    /// Seeds a key directly into the node's store.
    pub fn seed(&self, key: &[u8], value: &[u8]) -> u64 {
        let mut state = self.state.borrow_mut();
        let cas = state.next_cas();
        state.kv.insert(
            key.to_vec(),
            StoredValue {
                value: Bytes::copy_from_slice(value),
                flags: 0,
                cas,
            },
        );
        cas
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.state.borrow().kv.contains_key(key)
    }

    pub fn value_of(&self, key: &[u8]) -> Option<Bytes> {
        self.state.borrow().kv.get(key).map(|s| s.value.clone())
    }

    pub fn ops_seen(&self) -> u32 {
        self.state.borrow().ops_seen
    }

    /// Simulates a node crash: every open connection reads EOF.
    pub fn drop_connections(&self) {
        let mut state = self.state.borrow_mut();
        for conn in state.conns.iter_mut() {
            conn.closed = true;
            conn.outbox.clear();
            if let Some(w) = conn.waker.take() {
                w.wake();
            }
        }
    }
}

impl TestRuntime {
    pub fn new(now: Instant) -> Self {
        Self {
            timer: Timer::new(now),
            scheduler: Scheduler::new(),
            rng: Rc::new(RefCell::new(SmallRng::seed_from_u64(7))),
            nodes: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn add_data_node(&self, host: &str, port: u16) -> SimNode {
        let node = SimNode::new(NodeKind::Data);
        self.nodes
            .borrow_mut()
            .insert((host.to_string(), port), node.clone());
        node
    }

    pub fn add_http_node(&self, host: &str, port: u16) -> SimNode {
        let node = SimNode::new(NodeKind::Http);
        self.nodes
            .borrow_mut()
            .insert((host.to_string(), port), node.clone());
        node
    }

    pub fn advance_clock(&self, now: Instant) {
        self.timer.advance_clock(now);
    }

    pub fn poll_scheduler(&self) {
        self.scheduler.poll();
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Runtime for TestRuntime {
    type Stream = SimStream;
    type ConnectFuture = SimConnectFuture;
    type WaitFuture = WaitFuture;

    fn now(&self) -> Instant {
        self.timer.now()
    }

    fn wait(&self, how_long: std::time::Duration) -> WaitFuture {
        self.timer.wait(how_long)
    }

    fn wait_until(&self, when: Instant) -> WaitFuture {
        self.timer.wait_until(when)
    }

    fn connect(&self, host: &str, port: u16) -> SimConnectFuture {
        let node = self
            .nodes
            .borrow()
            .get(&(host.to_string(), port))
            .cloned();
        match node {
            // An unknown address swallows the dial forever, like a host
            // dropping SYNs; a refusing node resets it immediately.
            None => SimConnectFuture {
                result: None,
                never: true,
            },
            Some(node) => {
                if node.state.borrow().refuse_connect {
                    SimConnectFuture {
                        result: Some(Err(Fail::ConnectionRefused {})),
                        never: false,
                    }
                } else {
                    let conn = node.state.borrow_mut().open_conn();
                    SimConnectFuture {
                        result: Some(Ok(SimStream {
                            state: node.state.clone(),
                            conn,
                        })),
                        never: false,
                    }
                }
            }
        }
    }

    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn poll_io(&self, _block: bool) {
        self.scheduler.poll();
    }

    fn rng_gen_u32(&self) -> u32 {
        self.rng.borrow_mut().next_u32()
    }
}

impl StreamHandle for SimStream {
    type PushFuture = futures::future::Ready<Result<(), Fail>>;
    type PopFuture = SimPopFuture;

    fn push(&self, buf: Bytes) -> Self::PushFuture {
        let result = self.state.borrow_mut().handle_input(self.conn, &buf);
        futures::future::ready(result)
    }

    fn pop(&self) -> SimPopFuture {
        SimPopFuture {
            state: self.state.clone(),
            conn: self.conn,
        }
    }

    fn close(&self) {
        let mut state = self.state.borrow_mut();
        let conn = &mut state.conns[self.conn];
        conn.closed = true;
        conn.outbox.clear();
        if let Some(w) = conn.waker.take() {
            w.wake();
        }
    }
}

impl Future for SimPopFuture {
    type Output = Result<Bytes, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        let mut state = self_.state.borrow_mut();
        let conn = &mut state.conns[self_.conn];
        if let Some(buf) = conn.outbox.pop_front() {
            return Poll::Ready(Ok(buf));
        }
        if conn.closed {
            return Poll::Ready(Ok(Bytes::new()));
        }
        conn.waker = Some(ctx.waker().clone());
        Poll::Pending
    }
}

impl Future for SimConnectFuture {
    type Output = Result<SimStream, Fail>;

    fn poll(self: Pin<&mut Self>, _ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        if self_.never {
            return Poll::Pending;
        }
        Poll::Ready(self_.result.take().expect("polled after completion"))
    }
}

//==============================================================================
// Test Utilities
//==============================================================================

/// Polls a future once against a no-op waker.
pub fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
    let mut ctx = Context::from_waker(futures::task::noop_waker_ref());
    Future::poll(Pin::new(future), &mut ctx)
}

/// Builds a vbucket-bucket configuration document.
pub fn config_json(
    bucket: &str,
    rev: u64,
    nodes: &[(&str, u16, u16)],
    matrix: &[Vec<i32>],
    replicas: usize,
) -> String {
    let server_list: Vec<String> = nodes
        .iter()
        .map(|(host, data, _)| format!("{}:{}", host, data))
        .collect();
    let node_descs: Vec<serde_json::Value> = nodes
        .iter()
        .map(|(host, data, mgmt)| {
            serde_json::json!({
                "hostname": format!("{}:{}", host, mgmt),
                "couchApiBase": format!("http://{}:{}/{}", host, mgmt + 1, bucket),
                "ports": {"direct": data}
            })
        })
        .collect();
    serde_json::json!({
        "name": bucket,
        "rev": rev,
        "nodeLocator": "vbucket",
        "nodes": node_descs,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": replicas,
            "serverList": server_list,
            "vBucketMap": matrix,
        }
    })
    .to_string()
}

/// A matrix assigning every vbucket the same (master, replicas…) row.
pub fn uniform_matrix(num_vbuckets: usize, row: &[i32]) -> Vec<Vec<i32>> {
    (0..num_vbuckets).map(|_| row.to_vec()).collect()
}
