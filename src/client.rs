// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The client handle: the root object tying the topology snapshot, the
//! per-node connections, and the background schedulers together.
//!
//! Submits route a key against the current [ClusterMap] snapshot, encode a
//! frame with a fresh opaque, and enqueue it on the owning node's
//! connection. Completions flow back through the connection reader; a
//! deadline sweeper fires operation timeouts; a refresh monitor re-fetches
//! the topology when errors accumulate or a server says `NOT_MY_VBUCKET`.

use crate::{
    bootstrap,
    collections::{watched::WatchFuture, WatchedValue},
    connection::{ConnEvents, Phase, ServerConnection},
    durability::{self, DurabilityCommand, DurabilityFuture},
    fail::Fail,
    http::{self, HttpRequest, HttpResponse},
    memcached::{encode_request, Frame, Opcode},
    operations::{
        self, ArithmeticCommand, ArithmeticKind, CounterResult, GetResult, KvFuture,
        MutationResult, ObserveState, OpHandle, OpRecord, StoreCommand, StoreKind, StoreResult,
    },
    options::{ClientOptions, ProcessEnv},
    runtime::Runtime,
    scheduler::SchedulerHandle,
    topology::{self, config::BucketConfig, ClusterMap, NodeAddress},
};
use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Bytes, BytesMut};
use futures::{channel::oneshot, FutureExt};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Reconnect backoff schedule: exponential from the base, capped, with a
/// ±1/8 jitter drawn from the runtime RNG.
const RECONNECT_BASE: Duration = Duration::from_millis(100);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

struct BackoffState {
    failures: u32,
    until: Instant,
}

pub(crate) struct ClientInner<RT: Runtime> {
    options: ClientOptions,
    // Read once at creation; kept so embedders can inspect what was seen.
    #[allow(unused)]
    env: ProcessEnv,
    map: Option<Rc<ClusterMap>>,
    map_epoch: WatchedValue<u64>,
    bootstrap_started: bool,
    bootstrap_error: Option<Fail>,
    config_cache_loaded: bool,
    conns: HashMap<String, ServerConnection<RT>>,
    draining: Vec<ServerConnection<RT>>,
    backoff: HashMap<String, BackoffState>,
    opaque_seq: u32,
    error_count: u32,
    last_refresh: Instant,
    refresh_gen: WatchedValue<u64>,
    ops_gen: WatchedValue<u64>,
    cccp_disabled: bool,
    shutdown: bool,
    bg_handles: Vec<SchedulerHandle>,
}

/// The public handle. Clones share one client; all entry points must be
/// called from the runtime's thread.
pub struct Client<RT: Runtime> {
    rt: RT,
    inner: Rc<RefCell<ClientInner<RT>>>,
    events: Rc<ClientEvents<RT>>,
}

/// Weak form carried by background coroutines, so no task keeps the client
/// alive on its own.
pub(crate) struct WeakClient<RT: Runtime> {
    rt: RT,
    inner: Weak<RefCell<ClientInner<RT>>>,
    events: Weak<ClientEvents<RT>>,
}

/// Adapter handed to connections; holds only weak references back.
struct ClientEvents<RT: Runtime> {
    weak: RefCell<Option<WeakClient<RT>>>,
}

/// Resolves once the first topology snapshot is installed, or with the
/// bootstrap error.
pub struct BootstrapFuture<RT: Runtime> {
    inner: Rc<RefCell<ClientInner<RT>>>,
    epoch: WatchedValue<u64>,
    watch: Option<WatchFuture<u64>>,
}

/// A cancellable in-flight HTTP/view request. Dropping the handle abandons
/// the request.
pub struct ViewHandle {
    rx: oneshot::Receiver<Result<HttpResponse, Fail>>,
    cancel: WatchedValue<bool>,
    _task: SchedulerHandle,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl<RT: Runtime> Client<RT> {
    pub fn new(rt: RT, options: ClientOptions) -> Result<Self, Fail> {
        if options.hosts.is_empty() {
            return Err(Fail::Invalid {
                details: "no seed hosts",
            });
        }
        if options.bucket.is_empty() {
            return Err(Fail::Invalid {
                details: "empty bucket name",
            });
        }
        let env = ProcessEnv::from_env();
        env.arm_logging();
        if let Some(plugin) = &env.io_plugin {
            debug!("event plugin override requested: {}", plugin);
        }
        let now = rt.now();
        let inner = Rc::new(RefCell::new(ClientInner {
            options,
            env,
            map: None,
            map_epoch: WatchedValue::new(0),
            bootstrap_started: false,
            bootstrap_error: None,
            config_cache_loaded: false,
            conns: HashMap::new(),
            draining: Vec::new(),
            backoff: HashMap::new(),
            opaque_seq: 1,
            error_count: 0,
            last_refresh: now,
            refresh_gen: WatchedValue::new(0),
            ops_gen: WatchedValue::new(0),
            cccp_disabled: false,
            shutdown: false,
            bg_handles: Vec::new(),
        }));
        let events = Rc::new(ClientEvents {
            weak: RefCell::new(None),
        });
        let client = Self { rt, inner, events };
        *client.events.weak.borrow_mut() = Some(client.downgrade());
        let sweeper = client.rt.spawn(sweeper_loop(client.downgrade()));
        let monitor = client.rt.spawn(monitor_loop(client.downgrade()));
        let mut inner = client.inner.borrow_mut();
        inner.bg_handles.push(sweeper);
        inner.bg_handles.push(monitor);
        drop(inner);
        Ok(client)
    }

    pub(crate) fn downgrade(&self) -> WeakClient<RT> {
        WeakClient {
            rt: self.rt.clone(),
            inner: Rc::downgrade(&self.inner),
            events: Rc::downgrade(&self.events),
        }
    }

    pub fn rt(&self) -> &RT {
        &self.rt
    }

    /// Schedules bootstrap and returns a future for its outcome. A config
    /// cache file, when present and parseable, seeds the topology and
    /// suppresses the network bootstrap entirely.
    pub fn connect(&self) -> BootstrapFuture<RT> {
        let (start, epoch) = {
            let mut inner = self.inner.borrow_mut();
            let start = !inner.bootstrap_started && !inner.shutdown;
            inner.bootstrap_started = true;
            (start, inner.map_epoch.clone())
        };
        if start {
            let cache_path = self.inner.borrow().options.config_cache.clone();
            let seeded = cache_path
                .as_ref()
                .and_then(|path| bootstrap::cache::load(path, &self.bucket()))
                .and_then(|raw| {
                    let origin = self.inner.borrow().options.hosts[0].host.clone();
                    match topology::parse_config(&raw, &origin)
                        .and_then(|cfg| self.install_config(&cfg, None))
                    {
                        Ok(()) => Some(()),
                        Err(e) => {
                            warn!("config cache rejected: {}", e);
                            None
                        }
                    }
                })
                .is_some();
            if seeded {
                self.inner.borrow_mut().config_cache_loaded = true;
                info!("topology seeded from the config cache");
            } else {
                let handle = self.rt.spawn(bootstrap::initial(self.downgrade()));
                self.inner.borrow_mut().bg_handles.push(handle);
            }
        }
        BootstrapFuture {
            inner: self.inner.clone(),
            epoch,
            watch: None,
        }
    }

    pub fn bucket(&self) -> String {
        self.inner.borrow().options.bucket.clone()
    }

    /// True when the topology was seeded from the cache file instead of the
    /// network.
    pub fn config_cache_loaded(&self) -> bool {
        self.inner.borrow().config_cache_loaded
    }

    /// The current topology snapshot.
    pub fn topology(&self) -> Option<Rc<ClusterMap>> {
        self.inner.borrow().map.clone()
    }

    pub(crate) fn options(&self) -> ClientOptions {
        self.inner.borrow().options.clone()
    }

    /// Memcached buckets have no CCCP; the flag latches when such a
    /// configuration installs.
    pub(crate) fn cccp_disabled(&self) -> bool {
        self.inner.borrow().cccp_disabled
    }

    /// Server index of a ready connection usable for an inline (CCCP)
    /// config fetch, if any.
    pub(crate) fn inline_refresh_index(&self) -> Option<usize> {
        let inner = self.inner.borrow();
        if inner.cccp_disabled {
            return None;
        }
        if !inner
            .options
            .transports
            .contains(&crate::options::ConfigTransport::Cccp)
        {
            return None;
        }
        let map = inner.map.as_ref()?;
        for (index, node) in map.nodes().iter().enumerate() {
            if let Some(conn) = inner.conns.get(&node.key()) {
                if conn.phase() == Phase::Ready {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Parents a background task to the handle so shutdown cancels it.
    pub(crate) fn adopt_task(&self, handle: SchedulerHandle) {
        let mut inner = self.inner.borrow_mut();
        if inner.shutdown {
            return;
        }
        inner.bg_handles.push(handle);
    }

    pub(crate) fn snapshot(&self) -> Result<Rc<ClusterMap>, Fail> {
        let inner = self.inner.borrow();
        if inner.shutdown {
            return Err(Fail::Shutdown {});
        }
        inner.map.clone().ok_or(Fail::NoConfiguration {})
    }

    fn op_deadline(&self) -> Instant {
        self.rt.now() + self.inner.borrow().options.op_timeout
    }

    //--------------------------------------------------------------------------
    // Submit path
    //--------------------------------------------------------------------------

    fn next_opaque(&self) -> u32 {
        let mut inner = self.inner.borrow_mut();
        let opaque = inner.opaque_seq;
        inner.opaque_seq = inner.opaque_seq.wrapping_add(1);
        opaque
    }

    /// Encodes and enqueues one frame for a specific server index. The
    /// caller has already routed; this is the shared tail of every submit.
    fn submit_to_server(
        &self,
        map: &ClusterMap,
        opcode: Opcode,
        vbucket: u16,
        server_index: usize,
        cas: u64,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        deadline: Instant,
    ) -> Result<OpHandle, Fail> {
        let addr = map
            .node(server_index)
            .ok_or(Fail::NoMatchingServer {})?
            .clone();
        let opaque = self.next_opaque();
        let frame = encode_request(opcode, vbucket, opaque, cas, extras, key, value)?;
        let op = OpRecord::new(opaque, opcode, vbucket, frame, deadline);
        self.enqueue_to(addr, op.clone())?;
        Ok(op)
    }

    fn enqueue_to(&self, addr: NodeAddress, op: OpHandle) -> Result<(), Fail> {
        let conn = self.conn_for(&addr);
        conn.submit(op)?;
        let ops_gen = self.inner.borrow().ops_gen.clone();
        ops_gen.set(ops_gen.get() + 1);
        Ok(())
    }

    /// Live connection for a node, creating one lazily. A re-dial after a
    /// failure burns the node's current backoff delay first.
    fn conn_for(&self, addr: &NodeAddress) -> ServerConnection<RT> {
        let key = addr.key();
        let mut inner = self.inner.borrow_mut();
        if let Some(conn) = inner.conns.get(&key) {
            if conn.phase() != Phase::Dead {
                return conn.clone();
            }
            inner.conns.remove(&key);
        }
        let now = self.rt.now();
        let delay = match inner.backoff.get(&key) {
            Some(state) if state.until > now => state.until - now,
            _ => Duration::from_micros(0),
        };
        let credentials = inner.options.credentials();
        let events: Rc<dyn ConnEvents<RT>> = self.events.clone();
        let conn = ServerConnection::new(self.rt.clone(), addr.clone(), credentials, delay, events);
        inner.conns.insert(key, conn.clone());
        conn
    }

    //--------------------------------------------------------------------------
    // Key/value operations
    //--------------------------------------------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<KvFuture<GetResult>, Fail> {
        require_key(key)?;
        let map = self.snapshot()?;
        let (vbucket, master) = map.route_master(key)?;
        let op = self.submit_to_server(
            &map,
            Opcode::Get,
            vbucket,
            master,
            0,
            &[],
            key,
            &[],
            self.op_deadline(),
        )?;
        Ok(KvFuture::new(op, operations::decode_get))
    }

    /// Reads the `which`-th replica copy of a key.
    pub fn get_replica(&self, key: &[u8], which: usize) -> Result<KvFuture<GetResult>, Fail> {
        require_key(key)?;
        let map = self.snapshot()?;
        let vbucket = map.vbucket_for(key);
        let replica = map.route_replica(vbucket, which)?;
        let op = self.submit_to_server(
            &map,
            Opcode::GetReplica,
            vbucket,
            replica,
            0,
            &[],
            key,
            &[],
            self.op_deadline(),
        )?;
        Ok(KvFuture::new(op, operations::decode_get))
    }

    pub fn store(&self, cmd: &StoreCommand) -> Result<KvFuture<StoreResult>, Fail> {
        require_key(cmd.key)?;
        let opcode = match cmd.kind {
            StoreKind::Set => Opcode::Set,
            StoreKind::Add => Opcode::Add,
            StoreKind::Replace => Opcode::Replace,
            StoreKind::Append => Opcode::Append,
            StoreKind::Prepend => Opcode::Prepend,
        };
        let mut extras = [0u8; 8];
        let extras: &[u8] = match cmd.kind {
            // Concatenation ops carry no extras on the wire.
            StoreKind::Append | StoreKind::Prepend => &[],
            _ => {
                NetworkEndian::write_u32(&mut extras[0..4], cmd.flags);
                NetworkEndian::write_u32(&mut extras[4..8], cmd.expiry);
                &extras
            }
        };
        let map = self.snapshot()?;
        let (vbucket, master) = map.route_master(cmd.key)?;
        let op = self.submit_to_server(
            &map,
            opcode,
            vbucket,
            master,
            cmd.cas,
            extras,
            cmd.key,
            cmd.value,
            self.op_deadline(),
        )?;
        Ok(KvFuture::new(op, operations::decode_store))
    }

    pub fn remove(&self, key: &[u8], cas: u64) -> Result<KvFuture<MutationResult>, Fail> {
        require_key(key)?;
        let map = self.snapshot()?;
        let (vbucket, master) = map.route_master(key)?;
        let op = self.submit_to_server(
            &map,
            Opcode::Delete,
            vbucket,
            master,
            cas,
            &[],
            key,
            &[],
            self.op_deadline(),
        )?;
        Ok(KvFuture::new(op, operations::decode_mutation))
    }

    pub fn touch(&self, key: &[u8], expiry: u32) -> Result<KvFuture<MutationResult>, Fail> {
        require_key(key)?;
        let mut extras = [0u8; 4];
        NetworkEndian::write_u32(&mut extras, expiry);
        let map = self.snapshot()?;
        let (vbucket, master) = map.route_master(key)?;
        let op = self.submit_to_server(
            &map,
            Opcode::Touch,
            vbucket,
            master,
            0,
            &extras,
            key,
            &[],
            self.op_deadline(),
        )?;
        Ok(KvFuture::new(op, operations::decode_mutation))
    }

    pub fn arithmetic(&self, cmd: &ArithmeticCommand) -> Result<KvFuture<CounterResult>, Fail> {
        require_key(cmd.key)?;
        let opcode = match cmd.kind {
            ArithmeticKind::Increment => Opcode::Increment,
            ArithmeticKind::Decrement => Opcode::Decrement,
        };
        let mut extras = [0u8; 20];
        NetworkEndian::write_u64(&mut extras[0..8], cmd.delta);
        NetworkEndian::write_u64(&mut extras[8..16], cmd.initial);
        let expiry = if cmd.create { cmd.expiry } else { 0xffff_ffff };
        NetworkEndian::write_u32(&mut extras[16..20], expiry);
        let map = self.snapshot()?;
        let (vbucket, master) = map.route_master(cmd.key)?;
        let op = self.submit_to_server(
            &map,
            opcode,
            vbucket,
            master,
            0,
            &extras,
            cmd.key,
            &[],
            self.op_deadline(),
        )?;
        Ok(KvFuture::new(op, operations::decode_counter))
    }

    /// Diagnostic no-op addressed to one server.
    pub fn noop(&self, server_index: usize) -> Result<KvFuture<MutationResult>, Fail> {
        let map = self.snapshot()?;
        let op = self.submit_to_server(
            &map,
            Opcode::Noop,
            0,
            server_index,
            0,
            &[],
            &[],
            &[],
            self.op_deadline(),
        )?;
        Ok(KvFuture::new(op, operations::decode_mutation))
    }

    /// Observes a key on its master.
    pub fn observe(&self, key: &[u8]) -> Result<KvFuture<ObserveState>, Fail> {
        require_key(key)?;
        let map = self.snapshot()?;
        let (vbucket, master) = map.route_master(key)?;
        self.observe_on(&map, key, vbucket, master, self.op_deadline())
    }

    /// Observes a key on a specific node; the durability poller fans this
    /// out over the master and every populated replica.
    pub(crate) fn observe_on(
        &self,
        map: &ClusterMap,
        key: &[u8],
        vbucket: u16,
        server_index: usize,
        deadline: Instant,
    ) -> Result<KvFuture<ObserveState>, Fail> {
        let mut body = BytesMut::with_capacity(4 + key.len());
        body.resize(4, 0);
        NetworkEndian::write_u16(&mut body[0..2], vbucket);
        NetworkEndian::write_u16(&mut body[2..4], key.len() as u16);
        body.extend_from_slice(key);
        let op = self.submit_to_server(
            map,
            Opcode::Observe,
            vbucket,
            server_index,
            0,
            &[],
            &[],
            &body,
            deadline,
        )?;
        Ok(KvFuture::new(op, operations::decode_observe))
    }

    /// Fetches the current configuration inline over an established data
    /// connection (the CCCP refresh path).
    pub(crate) fn fetch_config_inline(
        &self,
        server_index: usize,
    ) -> Result<KvFuture<Bytes>, Fail> {
        let map = self.snapshot()?;
        let deadline = self.rt.now() + self.inner.borrow().options.config_node_timeout;
        let op = self.submit_to_server(
            &map,
            Opcode::GetClusterConfig,
            0,
            server_index,
            0,
            &[],
            &[],
            &[],
            deadline,
        )?;
        Ok(KvFuture::new(op, operations::decode_value))
    }

    /// Polls a durability requirement until satisfied or timed out.
    pub fn endure(&self, cmd: &DurabilityCommand) -> Result<DurabilityFuture, Fail> {
        durability::endure(self, cmd)
    }

    /// Issues an arbitrary request against a node's view port. Returns a
    /// handle that is both the response future and the cancellation lever.
    pub fn view_request(&self, req: HttpRequest) -> Result<ViewHandle, Fail> {
        let map = self.snapshot()?;
        let candidates: Vec<(String, u16)> = map
            .nodes()
            .iter()
            .filter_map(|n| n.view_port.map(|p| (n.host.clone(), p)))
            .collect();
        if candidates.is_empty() {
            return Err(Fail::Unsupported {
                details: "no node exposes a view port",
            });
        }
        let (host, port) = candidates[self.rt.rng_gen_u32() as usize % candidates.len()].clone();
        let (deadline, max_redirects) = {
            let inner = self.inner.borrow();
            (
                self.rt.now() + inner.options.view_timeout,
                inner.options.max_redirects,
            )
        };
        let cancel = WatchedValue::new(false);
        let (tx, rx) = oneshot::channel();
        let task_cancel = cancel.clone();
        let rt = self.rt.clone();
        let task = self.rt.spawn(async move {
            let result =
                http::execute(rt, host, port, req, deadline, max_redirects, task_cancel).await;
            let _ = tx.send(result);
        });
        Ok(ViewHandle {
            rx,
            cancel,
            _task: task,
        })
    }

    /// Fails every pending operation with `Shutdown` synchronously and
    /// releases connections and background tasks. After this returns no
    /// operation resolves any other way. The runtime is shared property and
    /// is left untouched.
    pub fn shutdown(&self) {
        let (conns, draining, epoch) = {
            let mut inner = self.inner.borrow_mut();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            inner.bg_handles.clear();
            if inner.map.is_none() && inner.bootstrap_error.is_none() {
                inner.bootstrap_error = Some(Fail::Shutdown {});
            }
            let conns: Vec<ServerConnection<RT>> =
                inner.conns.drain().map(|(_, conn)| conn).collect();
            let draining = std::mem::replace(&mut inner.draining, Vec::new());
            (conns, draining, inner.map_epoch.clone())
        };
        for conn in conns.iter().chain(draining.iter()) {
            conn.fail(Fail::Shutdown {}, None);
        }
        epoch.set(epoch.get() + 1);
        info!("client shut down");
    }

    /// Drives the runtime until the given future resolves.
    pub fn wait<F: Future + Unpin>(&self, mut future: F) -> F::Output {
        let mut ctx = Context::from_waker(futures::task::noop_waker_ref());
        loop {
            if let Poll::Ready(output) = Future::poll(Pin::new(&mut future), &mut ctx) {
                return output;
            }
            self.rt.poll_io(true);
        }
    }

    //--------------------------------------------------------------------------
    // Topology plumbing
    //--------------------------------------------------------------------------

    /// Adopts a configuration: builds the snapshot, swaps it in, drains
    /// connections to removed nodes, and rewrites the config cache.
    /// `raw` is the exact document for the cache file; `None` skips the
    /// rewrite (used when the document just came from the cache).
    pub(crate) fn install_config(
        &self,
        cfg: &BucketConfig,
        raw: Option<&[u8]>,
    ) -> Result<(), Fail> {
        let map = Rc::new(ClusterMap::from_config(cfg)?);
        let now = self.rt.now();
        let mut to_drain = Vec::new();
        let (drain_deadline, cache_path, epoch, ops_gen) = {
            let mut inner = self.inner.borrow_mut();
            if inner.shutdown {
                return Err(Fail::Shutdown {});
            }
            if map.bucket() != inner.options.bucket {
                return Err(Fail::BadConfig {
                    details: "configuration names a different bucket",
                });
            }
            if let (Some(old), Some(new_rev)) = (&inner.map, map.rev()) {
                if let Some(old_rev) = old.rev() {
                    if new_rev < old_rev {
                        debug!("ignoring stale configuration rev {}", new_rev);
                        return Ok(());
                    }
                }
            }
            let live: HashSet<String> = map.nodes().iter().map(|n| n.key()).collect();
            let stale: Vec<String> = inner
                .conns
                .keys()
                .filter(|key| !live.contains(*key))
                .cloned()
                .collect();
            for key in stale {
                if let Some(conn) = inner.conns.remove(&key) {
                    to_drain.push(conn);
                }
            }
            inner.cccp_disabled = map.is_memcached();
            inner.map = Some(map.clone());
            inner.error_count = 0;
            inner.last_refresh = now;
            (
                now + inner.options.op_timeout,
                inner.options.config_cache.clone(),
                inner.map_epoch.clone(),
                inner.ops_gen.clone(),
            )
        };
        for conn in &to_drain {
            conn.start_drain(drain_deadline);
        }
        if !to_drain.is_empty() {
            self.inner.borrow_mut().draining.extend(to_drain);
        }
        if let (Some(path), Some(raw)) = (cache_path, raw) {
            bootstrap::cache::store(&path, &self.bucket(), raw);
        }
        info!(
            "installed configuration rev {:?}: {} nodes, {} vbuckets, {} replicas",
            map.rev(),
            map.num_servers(),
            map.num_vbuckets(),
            map.num_replicas()
        );
        epoch.set(epoch.get() + 1);
        ops_gen.set(ops_gen.get() + 1);
        Ok(())
    }

    pub(crate) fn set_bootstrap_error(&self, err: Fail) {
        let epoch = {
            let mut inner = self.inner.borrow_mut();
            if inner.bootstrap_error.is_none() {
                inner.bootstrap_error = Some(err);
            }
            inner.map_epoch.clone()
        };
        epoch.set(epoch.get() + 1);
    }

    /// Counts a network-class error against the refresh thresholds.
    pub(crate) fn record_network_error(&self) {
        let (trigger, refresh) = {
            let mut inner = self.inner.borrow_mut();
            inner.error_count += 1;
            let now = self.rt.now();
            let aged = now.duration_since(inner.last_refresh) >= inner.options.config_delay_threshold;
            let trigger =
                inner.error_count >= inner.options.config_error_threshold || aged;
            (trigger && !inner.shutdown, inner.refresh_gen.clone())
        };
        if trigger {
            refresh.set(refresh.get() + 1);
        }
    }

    fn note_config_stale(&self) {
        let refresh = self.inner.borrow().refresh_gen.clone();
        refresh.set(refresh.get() + 1);
    }

    /// `NOT_MY_VBUCKET` retry: adopt the piggy-backed configuration when
    /// present (else signal a refresh), then resend the retained frame to
    /// whoever owns the vbucket now. Retries stop only when the operation's
    /// deadline fires or routing fails outright.
    fn handle_nmv(&self, addr: &NodeAddress, op: OpHandle, frame: Frame) {
        {
            let mut record = op.borrow_mut();
            record.retries += 1;
            trace!(
                "not-my-vbucket from {} for vbucket {} (retry {})",
                addr.key(),
                record.vbucket,
                record.retries
            );
        }
        if !frame.value.is_empty() {
            let adopted = topology::parse_config(&frame.value, &addr.host)
                .and_then(|cfg| self.install_config(&cfg, Some(&frame.value)));
            if let Err(e) = adopted {
                debug!("rejecting config payload from {}: {}", addr.key(), e);
                self.note_config_stale();
            }
        } else {
            self.note_config_stale();
        }
        let rerouted = (|| {
            let map = self.snapshot()?;
            let vbucket = op.borrow().vbucket;
            let master = map.master_of(vbucket)?;
            let target = map.node(master).ok_or(Fail::NoMatchingServer {})?.clone();
            self.enqueue_to(target, op.clone())
        })();
        if let Err(e) = rerouted {
            OpRecord::complete(&op, Err(e));
        }
    }

    fn handle_conn_dead(&self, addr: &NodeAddress, err: &Fail) {
        let now = self.rt.now();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.shutdown {
                return;
            }
            let jitter = self.rt.rng_gen_u32();
            let state = inner.backoff.entry(addr.key()).or_insert(BackoffState {
                failures: 0,
                until: now,
            });
            state.failures += 1;
            let delay = reconnect_delay(state.failures, jitter);
            state.until = now + delay;
            debug!(
                "node {} unavailable ({}); backing off {:?}",
                addr.key(),
                err,
                delay
            );
            let is_dead = inner
                .conns
                .get(&addr.key())
                .map(|conn| conn.phase() == Phase::Dead)
                .unwrap_or(false);
            if is_dead {
                inner.conns.remove(&addr.key());
            }
            inner.draining.retain(|conn| conn.phase() != Phase::Dead);
        }
        if err.is_network() {
            self.record_network_error();
        }
    }

    fn handle_conn_ready(&self, addr: &NodeAddress) {
        let mut inner = self.inner.borrow_mut();
        inner.backoff.remove(&addr.key());
    }
}

fn require_key(key: &[u8]) -> Result<(), Fail> {
    if key.is_empty() {
        Err(Fail::Invalid {
            details: "empty key",
        })
    } else {
        Ok(())
    }
}

fn reconnect_delay(failures: u32, jitter: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = (RECONNECT_BASE.as_micros() as u64) << exponent;
    let capped = base.min(RECONNECT_CAP.as_micros() as u64);
    // ±1/8 spread keeps a rebooted cluster from seeing dial storms.
    let spread = capped / 4 + 1;
    let jittered = capped - capped / 8 + (u64::from(jitter) % spread);
    Duration::from_micros(jittered.min(RECONNECT_CAP.as_micros() as u64))
}

//==============================================================================
// Background Coroutines
//==============================================================================

/// The deadline sweeper: one logical timer for every operation deadline and
/// drain deadline. Sleeps until the earliest deadline or the next submit.
async fn sweeper_loop<RT: Runtime>(weak: WeakClient<RT>) {
    loop {
        let (changed, wait) = {
            let client = match weak.upgrade() {
                Some(client) => client,
                None => return,
            };
            let (_, changed) = {
                let inner = client.inner.borrow();
                if inner.shutdown {
                    return;
                }
                inner.ops_gen.watch()
            };
            let conns: Vec<ServerConnection<RT>> = {
                let inner = client.inner.borrow();
                inner
                    .conns
                    .values()
                    .cloned()
                    .chain(inner.draining.iter().cloned())
                    .collect()
            };
            let now = client.rt.now();
            let mut expired = 0u32;
            let mut earliest: Option<Instant> = None;
            for conn in &conns {
                let (count, next) = conn.expire(now);
                expired += count;
                if let Some(next) = next {
                    earliest = Some(match earliest {
                        Some(t) => t.min(next),
                        None => next,
                    });
                }
            }
            client
                .inner
                .borrow_mut()
                .draining
                .retain(|conn| conn.phase() != Phase::Dead);
            if expired > 0 {
                debug!("{} operations timed out", expired);
                for _ in 0..expired {
                    client.record_network_error();
                }
            }
            (changed, earliest.map(|t| client.rt.wait_until(t)))
        };
        match wait {
            Some(wait) => {
                let mut wait = wait.fuse();
                let mut changed = changed.fuse();
                futures::select_biased! {
                    _ = changed => {}
                    _ = wait => {}
                }
            }
            None => {
                changed.await;
            }
        }
    }
}

/// The refresh monitor: waits for a refresh request, then retries the
/// bootstrap provider with backoff until a configuration installs.
async fn monitor_loop<RT: Runtime>(weak: WeakClient<RT>) {
    let rt = weak.rt.clone();
    loop {
        let changed = {
            let client = match weak.upgrade() {
                Some(client) => client,
                None => return,
            };
            let inner = client.inner.borrow();
            if inner.shutdown {
                return;
            }
            inner.refresh_gen.watch().1
        };
        changed.await;
        let mut failures = 0u32;
        loop {
            {
                let client = match weak.upgrade() {
                    Some(client) => client,
                    None => return,
                };
                if client.inner.borrow().shutdown {
                    return;
                }
            }
            match bootstrap::refresh(&weak).await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    let delay = reconnect_delay(failures, 0);
                    warn!("configuration refresh failed ({}); retrying in {:?}", e, delay);
                    rt.wait(delay).await;
                }
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<RT: Runtime> Clone for Client<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            inner: self.inner.clone(),
            events: self.events.clone(),
        }
    }
}

impl<RT: Runtime> WeakClient<RT> {
    pub(crate) fn upgrade(&self) -> Option<Client<RT>> {
        Some(Client {
            rt: self.rt.clone(),
            inner: self.inner.upgrade()?,
            events: self.events.upgrade()?,
        })
    }

    pub(crate) fn rt(&self) -> &RT {
        &self.rt
    }
}

impl<RT: Runtime> Clone for WeakClient<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            inner: self.inner.clone(),
            events: self.events.clone(),
        }
    }
}

impl<RT: Runtime> ClientEvents<RT> {
    fn client(&self) -> Option<Client<RT>> {
        self.weak.borrow().as_ref().and_then(|weak| weak.upgrade())
    }
}

impl<RT: Runtime> ConnEvents<RT> for ClientEvents<RT> {
    fn on_ready(&self, addr: &NodeAddress) {
        if let Some(client) = self.client() {
            client.handle_conn_ready(addr);
        }
    }

    fn on_dead(&self, addr: &NodeAddress, err: &Fail) {
        if let Some(client) = self.client() {
            client.handle_conn_dead(addr, err);
        }
    }

    fn on_not_my_vbucket(&self, addr: &NodeAddress, op: OpHandle, frame: Frame) {
        match self.client() {
            Some(client) => client.handle_nmv(addr, op, frame),
            None => OpRecord::complete(&op, Err(Fail::Shutdown {})),
        }
    }
}

impl<RT: Runtime> Future for BootstrapFuture<RT> {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        loop {
            if self_.watch.is_none() {
                self_.watch = Some(self_.epoch.watch().1);
            }
            {
                let inner = self_.inner.borrow();
                if inner.map.is_some() {
                    return Poll::Ready(Ok(()));
                }
                if let Some(err) = &inner.bootstrap_error {
                    return Poll::Ready(Err(err.clone()));
                }
                if inner.shutdown {
                    return Poll::Ready(Err(Fail::Shutdown {}));
                }
            }
            let watch = self_.watch.as_mut().unwrap();
            match Future::poll(Pin::new(watch), ctx) {
                Poll::Ready(_) => {
                    self_.watch = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl ViewHandle {
    /// Cancels the request; the future resolves with `Fail::Canceled`.
    pub fn cancel(&self) {
        self.cancel.set(true);
    }
}

impl Future for ViewHandle {
    type Output = Result<HttpResponse, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        match Future::poll(Pin::new(&mut self_.rx), ctx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Fail::Canceled {})),
            Poll::Pending => Poll::Pending,
        }
    }
}
