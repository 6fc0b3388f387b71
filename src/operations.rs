// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-flight operation records and the futures handed back to callers.
//!
//! Every accepted submit produces exactly one [OpRecord]; the record
//! resolves exactly once (response, timeout, or terminal error) and its
//! [KvFuture] decodes the raw frame into a typed result. A rejected submit
//! produces no record at all.

use crate::{
    fail::Fail,
    memcached::{Frame, ObserveStatus, Opcode, Status},
};
use byteorder::{ByteOrder, NetworkEndian};
use bytes::Bytes;
use num_traits::FromPrimitive;
use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Instant,
};

//==============================================================================
// Constants & Structures
//==============================================================================

pub type OpHandle = Rc<RefCell<OpRecord>>;

enum OpState {
    Pending,
    Done(Option<Result<Frame, Fail>>),
}

/// One in-flight request. The serialized frame is retained so topology
/// retries can resend it verbatim; the vbucket id never changes on retry,
/// only the destination node does.
pub struct OpRecord {
    pub opaque: u32,
    pub opcode: Opcode,
    pub vbucket: u16,
    pub frame: Bytes,
    pub deadline: Instant,
    pub retries: u32,
    state: OpState,
    waker: Option<Waker>,
}

/// Typed future for one submitted command.
pub struct KvFuture<T> {
    op: OpHandle,
    decode: fn(&Frame) -> Result<T, Fail>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// A caller's storage command. Borrowed fields are copied by the submit
/// path; the caller owns them only until submit returns.
#[derive(Clone, Copy, Debug)]
pub struct StoreCommand<'a> {
    pub kind: StoreKind,
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub flags: u32,
    pub expiry: u32,
    pub cas: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithmeticKind {
    Increment,
    Decrement,
}

#[derive(Clone, Copy, Debug)]
pub struct ArithmeticCommand<'a> {
    pub kind: ArithmeticKind,
    pub key: &'a [u8],
    pub delta: u64,
    pub initial: u64,
    /// When unset, a missing key fails instead of being seeded.
    pub create: bool,
    pub expiry: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GetResult {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreResult {
    pub cas: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub cas: u64,
}

/// What one node reported about one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserveState {
    pub status: ObserveStatus,
    pub cas: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl OpRecord {
    pub fn new(
        opaque: u32,
        opcode: Opcode,
        vbucket: u16,
        frame: Bytes,
        deadline: Instant,
    ) -> OpHandle {
        Rc::new(RefCell::new(OpRecord {
            opaque,
            opcode,
            vbucket,
            frame,
            deadline,
            retries: 0,
            state: OpState::Pending,
            waker: None,
        }))
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, OpState::Done(..))
    }

    /// Resolves the record. The first resolution wins; later ones are
    /// dropped, which is how orphaned responses for timed-out operations
    /// disappear.
    pub fn complete(op: &OpHandle, result: Result<Frame, Fail>) {
        let waker = {
            let mut record = op.borrow_mut();
            if record.is_done() {
                trace!(
                    "dropping late resolution for opaque {} ({:?})",
                    record.opaque,
                    record.opcode
                );
                return;
            }
            record.frame = Bytes::new();
            record.state = OpState::Done(Some(result));
            record.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

impl<T> KvFuture<T> {
    pub(crate) fn new(op: OpHandle, decode: fn(&Frame) -> Result<T, Fail>) -> Self {
        Self { op, decode }
    }
}

fn require_success(frame: &Frame) -> Result<(), Fail> {
    let status = frame.status();
    if status == Status::Success as u16 {
        Ok(())
    } else {
        Err(Status::to_fail(status))
    }
}

pub(crate) fn decode_get(frame: &Frame) -> Result<GetResult, Fail> {
    require_success(frame)?;
    if frame.extras.len() < 4 {
        return Err(Fail::Protocol {
            details: "get response without flags extras",
        });
    }
    Ok(GetResult {
        value: frame.value.clone(),
        flags: NetworkEndian::read_u32(&frame.extras[..4]),
        cas: frame.cas,
    })
}

pub(crate) fn decode_store(frame: &Frame) -> Result<StoreResult, Fail> {
    require_success(frame)?;
    Ok(StoreResult { cas: frame.cas })
}

pub(crate) fn decode_mutation(frame: &Frame) -> Result<MutationResult, Fail> {
    require_success(frame)?;
    Ok(MutationResult { cas: frame.cas })
}

pub(crate) fn decode_counter(frame: &Frame) -> Result<CounterResult, Fail> {
    require_success(frame)?;
    if frame.value.len() != 8 {
        return Err(Fail::Protocol {
            details: "arithmetic response body is not 8 bytes",
        });
    }
    Ok(CounterResult {
        value: NetworkEndian::read_u64(&frame.value[..]),
        cas: frame.cas,
    })
}

/// The raw response value, for callers that parse it themselves (CCCP
/// configuration fetches).
pub(crate) fn decode_value(frame: &Frame) -> Result<Bytes, Fail> {
    require_success(frame)?;
    Ok(frame.value.clone())
}

/// Parses an OBSERVE response body: repeated (vbucket, key length, key,
/// key state, cas) entries. Returns the state of the single requested key.
pub(crate) fn decode_observe(frame: &Frame) -> Result<ObserveState, Fail> {
    require_success(frame)?;
    let body = &frame.value[..];
    let mut at = 0;
    let mut first = None;
    while body.len() >= at + 4 {
        let key_len = NetworkEndian::read_u16(&body[at + 2..at + 4]) as usize;
        let entry_end = at + 4 + key_len + 9;
        if entry_end > body.len() {
            return Err(Fail::Protocol {
                details: "truncated observe entry",
            });
        }
        let status_raw = body[at + 4 + key_len];
        let status = ObserveStatus::from_u8(status_raw).ok_or(Fail::Protocol {
            details: "unknown observe key state",
        })?;
        let cas = NetworkEndian::read_u64(&body[at + 4 + key_len + 1..entry_end]);
        if first.is_none() {
            first = Some(ObserveState { status, cas });
        }
        at = entry_end;
    }
    first.ok_or(Fail::Protocol {
        details: "observe response without entries",
    })
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<T: Unpin> Future for KvFuture<T> {
    type Output = Result<T, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        let mut guard = self_.op.borrow_mut();
        let record = &mut *guard;
        let result = match &mut record.state {
            OpState::Pending => {
                record.waker = Some(ctx.waker().clone());
                return Poll::Pending;
            }
            OpState::Done(result) => result.take().expect("polled after completion"),
        };
        drop(guard);
        Poll::Ready(match result {
            Ok(frame) => (self_.decode)(&frame),
            Err(e) => Err(e),
        })
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memcached::{encode_response, FrameDecoder, MAGIC_RESPONSE};
    use futures::task::noop_waker_ref;
    use std::time::Duration;

    fn response(opcode: Opcode, status: u16, extras: &[u8], value: &[u8]) -> Frame {
        let wire = encode_response(opcode as u8, status, 1, 33, extras, &[], value).unwrap();
        let mut decoder = FrameDecoder::new(MAGIC_RESPONSE);
        decoder.feed(&wire);
        decoder.next().unwrap().unwrap()
    }

    #[test]
    fn resolves_once_and_ignores_late_results() {
        let mut ctx = Context::from_waker(noop_waker_ref());
        let op = OpRecord::new(
            7,
            Opcode::Get,
            0,
            Bytes::new(),
            Instant::now() + Duration::from_secs(1),
        );
        let mut fut = KvFuture::new(op.clone(), decode_get);
        assert!(Future::poll(Pin::new(&mut fut), &mut ctx).is_pending());

        OpRecord::complete(&op, Err(Fail::Timedout {}));
        // A response arriving after the timeout must not resurrect the op.
        OpRecord::complete(&op, Ok(response(Opcode::Get, 0, &[0, 0, 0, 0], b"late")));
        match Future::poll(Pin::new(&mut fut), &mut ctx) {
            Poll::Ready(Err(Fail::Timedout {})) => {}
            other => panic!("expected timeout, got {:?}", other.map(|r| r.map(|_| ()))),
        }
    }

    #[test]
    fn get_decoding() {
        let frame = response(Opcode::Get, 0, &[0, 0, 0, 9], b"World!");
        let result = decode_get(&frame).unwrap();
        assert_eq!(&result.value[..], b"World!");
        assert_eq!(result.flags, 9);
        assert_eq!(result.cas, 33);
    }

    #[test]
    fn error_status_maps_to_fail() {
        let frame = response(Opcode::Get, Status::KeyNotFound as u16, &[], &[]);
        match decode_get(&frame) {
            Err(Fail::KeyNotFound {}) => {}
            other => panic!("expected key-not-found, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn observe_decoding() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x02]); // vbucket 2
        body.extend_from_slice(&[0x00, 0x01]); // key length 1
        body.push(b'x');
        body.push(0x01); // persisted
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 42]);
        let frame = response(Opcode::Observe, 0, &[], &body);
        let state = decode_observe(&frame).unwrap();
        assert_eq!(state.status, ObserveStatus::Persisted);
        assert_eq!(state.cas, 42);
        assert!(state.status.persisted());
        assert!(state.status.exists());
    }
}
