// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The observe/durability poller. Given (key, CAS, persist_to,
//! replicate_to), it fans an OBSERVE out to the master and every populated
//! replica, tallies the per-node key states, and repolls every
//! `DURABILITY_INTERVAL` until the requirement holds or
//! `DURABILITY_TIMEOUT` elapses.


use crate::{
    client::{Client, WeakClient},
    fail::Fail,
    operations::{KvFuture, ObserveState},
    runtime::Runtime,
    scheduler::SchedulerHandle,
};
use futures::{channel::oneshot, future::join_all};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// A caller's durability requirement for one key.
#[derive(Clone, Copy, Debug)]
pub struct DurabilityCommand<'a> {
    pub key: &'a [u8],
    /// CAS of the mutation being awaited; 0 skips the divergence check.
    pub cas: u64,
    /// Nodes (master included) that must have persisted the key.
    pub persist_to: u16,
    /// Replicas that must hold the key.
    pub replicate_to: u16,
    /// Clamp the requirement to the currently reachable replica count
    /// instead of failing it.
    pub cap_max: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DurabilityResult {
    pub persisted: u16,
    pub replicated: u16,
    pub master_persisted: bool,
    /// Poll iterations it took to satisfy the requirement.
    pub polls: u32,
}

pub struct DurabilityFuture {
    rx: oneshot::Receiver<Result<DurabilityResult, Fail>>,
    _task: SchedulerHandle,
}

struct OwnedCommand {
    key: Vec<u8>,
    cas: u64,
    persist_to: u16,
    replicate_to: u16,
    cap_max: bool,
}

enum Outcome {
    Satisfied(DurabilityResult),
    CasMismatch,
    NotYet,
}

//==============================================================================
// Associate Functions
//==============================================================================

pub(crate) fn endure<RT: Runtime>(
    client: &Client<RT>,
    cmd: &DurabilityCommand,
) -> Result<DurabilityFuture, Fail> {
    if cmd.key.is_empty() {
        return Err(Fail::Invalid {
            details: "empty key",
        });
    }
    let map = client.snapshot()?;
    let replicas = map.num_replicas() as u16;
    if !cmd.cap_max && (cmd.replicate_to > replicas || cmd.persist_to > replicas + 1) {
        return Err(Fail::DurabilityTooMany {});
    }
    let owned = OwnedCommand {
        key: cmd.key.to_vec(),
        cas: cmd.cas,
        persist_to: cmd.persist_to,
        replicate_to: cmd.replicate_to,
        cap_max: cmd.cap_max,
    };
    let (tx, rx) = oneshot::channel();
    let task = client.rt().spawn(poll_loop(client.downgrade(), owned, tx));
    Ok(DurabilityFuture { rx, _task: task })
}

async fn poll_loop<RT: Runtime>(
    weak: WeakClient<RT>,
    cmd: OwnedCommand,
    tx: oneshot::Sender<Result<DurabilityResult, Fail>>,
) {
    let rt = weak.rt().clone();
    let (timeout, interval) = match weak.upgrade() {
        Some(client) => {
            let options = client.options();
            (options.durability_timeout, options.durability_interval)
        }
        None => return,
    };
    let deadline = rt.now() + timeout;
    let mut polls = 0u32;
    let result = loop {
        polls += 1;
        match poll_once(&weak, &cmd).await {
            Err(e) => break Err(e),
            Ok(Outcome::CasMismatch) => break Err(Fail::KeyExists {}),
            Ok(Outcome::Satisfied(mut result)) => {
                result.polls = polls;
                break Ok(result);
            }
            Ok(Outcome::NotYet) => {
                if rt.now() + interval > deadline {
                    break Err(Fail::Timedout {});
                }
                rt.wait(interval).await;
            }
        }
    };
    let _ = tx.send(result);
}

/// One fan-out round. An unreachable replica just shrinks the reachable
/// set; an unreachable master makes the round inconclusive.
async fn poll_once<RT: Runtime>(
    weak: &WeakClient<RT>,
    cmd: &OwnedCommand,
) -> Result<Outcome, Fail> {
    let (flags, futures): (Vec<bool>, Vec<KvFuture<ObserveState>>) = {
        let client = weak.upgrade().ok_or(Fail::Shutdown {})?;
        let map = client.snapshot()?;
        let (vbucket, master) = map.route_master(&cmd.key)?;
        let deadline = client.rt().now() + client.options().op_timeout;
        let mut flags = Vec::new();
        let mut futures = Vec::new();
        match client.observe_on(&map, &cmd.key, vbucket, master, deadline) {
            Ok(fut) => {
                flags.push(true);
                futures.push(fut);
            }
            Err(e) => return Err(e),
        }
        for which in 0..map.num_replicas() {
            let index = match map.route_replica(vbucket, which) {
                Ok(index) => index,
                Err(_) => continue,
            };
            if let Ok(fut) = client.observe_on(&map, &cmd.key, vbucket, index, deadline) {
                flags.push(false);
                futures.push(fut);
            }
        }
        (flags, futures)
    };
    let states = join_all(futures).await;

    let mut persisted = 0u16;
    let mut replicated = 0u16;
    let mut reachable_replicas = 0u16;
    let mut master_persisted = false;
    let mut master_seen = false;
    for (is_master, state) in flags.into_iter().zip(states) {
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                trace!("observe leg failed: {}", e);
                continue;
            }
        };
        if is_master {
            master_seen = true;
            if cmd.cas != 0 && state.status.exists() && state.cas != cmd.cas {
                return Ok(Outcome::CasMismatch);
            }
            if state.status.persisted() {
                persisted += 1;
                master_persisted = true;
            }
        } else {
            reachable_replicas += 1;
            if state.status.exists() {
                replicated += 1;
            }
            if state.status.persisted() {
                persisted += 1;
            }
        }
    }
    if !master_seen {
        return Ok(Outcome::NotYet);
    }
    let (need_persist, need_replicate) = if cmd.cap_max {
        (
            cmd.persist_to.min(reachable_replicas + 1),
            cmd.replicate_to.min(reachable_replicas),
        )
    } else {
        (cmd.persist_to, cmd.replicate_to)
    };
    if replicated >= need_replicate && persisted >= need_persist {
        Ok(Outcome::Satisfied(DurabilityResult {
            persisted,
            replicated,
            master_persisted,
            polls: 0,
        }))
    } else {
        Ok(Outcome::NotYet)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Future for DurabilityFuture {
    type Output = Result<DurabilityResult, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        match Future::poll(Pin::new(&mut self_.rx), ctx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Fail::Shutdown {})),
            Poll::Pending => Poll::Pending,
        }
    }
}
