// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Built-in readiness-mode provider over nonblocking BSD sockets. Each
//! operation future retries its syscall and, on `EWOULDBLOCK`, parks the
//! task waker with a read or write interest; `poll_io` blocks in `poll(2)`
//! until a parked socket is ready or the next timer is due, then wakes the
//! affected tasks.

use crate::{
    fail::Fail,
    runtime::{
        timer::{Timer, WaitFuture},
        Runtime, StreamHandle,
    },
    scheduler::Scheduler,
};
use bytes::Bytes;
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    mem,
    net::{SocketAddr, ToSocketAddrs},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Maximum size of a single `pop()`.
const POP_SIZE: usize = 4096;

/// Poll timeout when there is nothing to wait for, so a caller spinning in
/// `poll_io(true)` with no timers still observes new work eventually.
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Interest {
    Read,
    Write,
}

#[derive(Default)]
struct Parked {
    wakers: HashMap<i32, Vec<(Interest, Waker)>>,
}

#[derive(Clone)]
pub struct PosixRuntime {
    timer: Timer,
    scheduler: Scheduler,
    parked: Rc<RefCell<Parked>>,
    rng: Rc<RefCell<SmallRng>>,
}

struct StreamInner {
    fd: Cell<i32>,
    parked: Rc<RefCell<Parked>>,
}

/// A connected nonblocking socket. Clones share the descriptor.
#[derive(Clone)]
pub struct PosixStream {
    inner: Rc<StreamInner>,
}

enum ConnectState {
    Failed(Option<Fail>),
    Connecting { fd: i32, sin: libc::sockaddr_in },
    Done,
}

pub struct ConnectFuture {
    parked: Rc<RefCell<Parked>>,
    state: ConnectState,
}

pub struct PushFuture {
    stream: PosixStream,
    buf: Bytes,
    written: usize,
}

pub struct PopFuture {
    stream: PosixStream,
}

//==============================================================================
// Associate Functions
//==============================================================================

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn sockaddr_v4(addr: &SocketAddr) -> Option<libc::sockaddr_in> {
    match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            Some(sin)
        }
        SocketAddr::V6(..) => None,
    }
}

fn nonblocking_tcp_socket() -> Result<i32, Fail> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Fail::Network {
            details: "socket allocation failed",
        });
    }
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    Ok(fd)
}

impl Parked {
    fn park(&mut self, fd: i32, interest: Interest, waker: Waker) {
        self.wakers.entry(fd).or_default().push((interest, waker));
    }

    fn forget(&mut self, fd: i32) {
        self.wakers.remove(&fd);
    }
}

impl PosixRuntime {
    pub fn new() -> Self {
        Self {
            timer: Timer::new(Instant::now()),
            scheduler: Scheduler::new(),
            parked: Rc::new(RefCell::new(Parked::default())),
            rng: Rc::new(RefCell::new(SmallRng::from_entropy())),
        }
    }

    fn poll_sockets(&self, timeout: Option<Duration>) {
        let fds: Vec<(i32, i16)> = {
            let parked = self.parked.borrow();
            parked
                .wakers
                .iter()
                .map(|(&fd, entries)| {
                    let mut events = 0i16;
                    for (interest, _) in entries {
                        events |= match interest {
                            Interest::Read => libc::POLLIN,
                            Interest::Write => libc::POLLOUT,
                        };
                    }
                    (fd, events)
                })
                .collect()
        };
        let ms = match timeout {
            Some(t) => ((t.as_micros() + 999) / 1000).min(i32::max_value() as u128) as i32,
            None if fds.is_empty() => IDLE_POLL.as_millis() as i32,
            None => -1,
        };
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&(fd, events)| libc::pollfd {
                fd,
                events,
                revents: 0,
            })
            .collect();
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, ms) };
        if rc <= 0 {
            return;
        }
        let mut woken = Vec::new();
        {
            let mut parked = self.parked.borrow_mut();
            for pfd in &pollfds {
                if pfd.revents == 0 {
                    continue;
                }
                let readable = pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
                let writable = pfd.revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0;
                if let Some(entries) = parked.wakers.get_mut(&pfd.fd) {
                    let mut keep = Vec::new();
                    for (interest, waker) in entries.drain(..) {
                        let ready = match interest {
                            Interest::Read => readable,
                            Interest::Write => writable,
                        };
                        if ready {
                            woken.push(waker);
                        } else {
                            keep.push((interest, waker));
                        }
                    }
                    *entries = keep;
                }
            }
            parked.wakers.retain(|_, entries| !entries.is_empty());
        }
        for w in woken {
            w.wake();
        }
    }
}

impl PosixStream {
    fn new(fd: i32, parked: Rc<RefCell<Parked>>) -> Self {
        Self {
            inner: Rc::new(StreamInner {
                fd: Cell::new(fd),
                parked,
            }),
        }
    }

    fn fd(&self) -> i32 {
        self.inner.fd.get()
    }

    fn park(&self, interest: Interest, waker: Waker) {
        self.inner.parked.borrow_mut().park(self.fd(), interest, waker);
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for PosixRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for PosixRuntime {
    type Stream = PosixStream;
    type ConnectFuture = ConnectFuture;
    type WaitFuture = WaitFuture;

    fn now(&self) -> Instant {
        self.timer.now()
    }

    fn wait(&self, how_long: Duration) -> WaitFuture {
        self.timer.wait(how_long)
    }

    fn wait_until(&self, when: Instant) -> WaitFuture {
        self.timer.wait_until(when)
    }

    fn connect(&self, host: &str, port: u16) -> ConnectFuture {
        // Name resolution is synchronous here; production deployments pass
        // literal addresses in their seed lists.
        let addr = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.filter(|a| a.is_ipv4()).next(),
            Err(_) => None,
        };
        let sin = match addr.as_ref().and_then(sockaddr_v4) {
            Some(sin) => sin,
            None => {
                return ConnectFuture {
                    parked: self.parked.clone(),
                    state: ConnectState::Failed(Some(Fail::Network {
                        details: "address resolution failed",
                    })),
                }
            }
        };
        let state = match nonblocking_tcp_socket() {
            Ok(fd) => ConnectState::Connecting { fd, sin },
            Err(e) => ConnectState::Failed(Some(e)),
        };
        ConnectFuture {
            parked: self.parked.clone(),
            state,
        }
    }

    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn poll_io(&self, block: bool) {
        self.scheduler.poll();
        self.timer.advance_clock(Instant::now());
        let timeout = if block {
            self.timer
                .next_deadline()
                .map(|t| t.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::from_millis(0))
        };
        self.poll_sockets(timeout);
        self.timer.advance_clock(Instant::now());
        self.scheduler.poll();
    }

    fn rng_gen_u32(&self) -> u32 {
        self.rng.borrow_mut().next_u32()
    }
}

impl StreamHandle for PosixStream {
    type PushFuture = PushFuture;
    type PopFuture = PopFuture;

    fn push(&self, buf: Bytes) -> PushFuture {
        PushFuture {
            stream: self.clone(),
            buf,
            written: 0,
        }
    }

    fn pop(&self) -> PopFuture {
        PopFuture {
            stream: self.clone(),
        }
    }

    fn close(&self) {
        let fd = self.inner.fd.replace(-1);
        if fd >= 0 {
            self.inner.parked.borrow_mut().forget(fd);
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            self.parked.borrow_mut().forget(fd);
            unsafe { libc::close(fd) };
        }
    }
}

impl Future for ConnectFuture {
    type Output = Result<PosixStream, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        match &mut self_.state {
            ConnectState::Failed(err) => {
                let err = err.take().expect("polled after completion");
                Poll::Ready(Err(err))
            }
            ConnectState::Done => panic!("polled after completion"),
            ConnectState::Connecting { fd, sin } => {
                let fd = *fd;
                let rc = unsafe {
                    libc::connect(
                        fd,
                        sin as *const libc::sockaddr_in as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                };
                let errno = if rc == 0 { 0 } else { last_errno() };
                match errno {
                    0 | libc::EISCONN => {
                        self_.state = ConnectState::Done;
                        Poll::Ready(Ok(PosixStream::new(fd, self_.parked.clone())))
                    }
                    libc::EINPROGRESS | libc::EALREADY | libc::EWOULDBLOCK | libc::EINTR => {
                        self_
                            .parked
                            .borrow_mut()
                            .park(fd, Interest::Write, ctx.waker().clone());
                        Poll::Pending
                    }
                    libc::ECONNREFUSED => {
                        self_.state = ConnectState::Failed(None);
                        unsafe { libc::close(fd) };
                        Poll::Ready(Err(Fail::ConnectionRefused {}))
                    }
                    _ => {
                        self_.state = ConnectState::Failed(None);
                        unsafe { libc::close(fd) };
                        Poll::Ready(Err(Fail::Network {
                            details: "connect failed",
                        }))
                    }
                }
            }
        }
    }
}

impl Drop for ConnectFuture {
    fn drop(&mut self) {
        // A dial abandoned mid-flight still owns its descriptor.
        if let ConnectState::Connecting { fd, .. } = self.state {
            self.parked.borrow_mut().forget(fd);
            unsafe { libc::close(fd) };
        }
    }
}

impl Future for PushFuture {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        let fd = self_.stream.fd();
        if fd < 0 {
            return Poll::Ready(Err(Fail::Network {
                details: "stream closed",
            }));
        }
        while self_.written < self_.buf.len() {
            let remaining = &self_.buf[self_.written..];
            let rc = unsafe {
                libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len())
            };
            if rc >= 0 {
                self_.written += rc as usize;
                continue;
            }
            match last_errno() {
                libc::EWOULDBLOCK => {
                    self_.stream.park(Interest::Write, ctx.waker().clone());
                    return Poll::Pending;
                }
                libc::EINTR => continue,
                _ => {
                    return Poll::Ready(Err(Fail::Network {
                        details: "write failed",
                    }))
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Future for PopFuture {
    type Output = Result<Bytes, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        let fd = self_.stream.fd();
        if fd < 0 {
            return Poll::Ready(Err(Fail::Network {
                details: "stream closed",
            }));
        }
        let mut bytes = [0u8; POP_SIZE];
        loop {
            let rc =
                unsafe { libc::read(fd, bytes.as_mut_ptr() as *mut libc::c_void, POP_SIZE) };
            if rc > 0 {
                return Poll::Ready(Ok(Bytes::copy_from_slice(&bytes[..rc as usize])));
            }
            if rc == 0 {
                return Poll::Ready(Ok(Bytes::new()));
            }
            match last_errno() {
                libc::EWOULDBLOCK => {
                    self_.stream.park(Interest::Read, ctx.waker().clone());
                    return Poll::Pending;
                }
                libc::EINTR => continue,
                _ => {
                    return Poll::Ready(Err(Fail::Network {
                        details: "read failed",
                    }))
                }
            }
        }
    }
}
