// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::fail::Fail;

#[repr(u8)]
#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    GetReplica = 0x83,
    Observe = 0x92,
    GetClusterConfig = 0xb5,
}

#[repr(u16)]
#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success = 0x00,
    KeyNotFound = 0x01,
    KeyExists = 0x02,
    ValueTooBig = 0x03,
    InvalidArguments = 0x04,
    NotStored = 0x05,
    DeltaBadValue = 0x06,
    NotMyVbucket = 0x07,
    AuthError = 0x20,
    AuthContinue = 0x21,
    UnknownCommand = 0x81,
    OutOfMemory = 0x82,
    NotSupported = 0x83,
    InternalError = 0x84,
    Busy = 0x85,
    TemporaryFailure = 0x86,
}

/// Per-node key state reported by an OBSERVE response.
#[repr(u8)]
#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserveStatus {
    Found = 0x00,
    Persisted = 0x01,
    NotFound = 0x80,
    LogicallyDeleted = 0x81,
}

impl Status {
    /// Maps a raw response status to the error delivered to the caller.
    /// `NotMyVbucket` never reaches callers; the router retries it.
    pub fn to_fail(raw: u16) -> Fail {
        use num_traits::FromPrimitive;
        match Status::from_u16(raw) {
            Some(Status::Success) => Fail::Invalid {
                details: "success is not an error",
            },
            Some(Status::KeyNotFound) => Fail::KeyNotFound {},
            Some(Status::KeyExists) => Fail::KeyExists {},
            Some(Status::ValueTooBig) => Fail::ValueTooBig {},
            Some(Status::InvalidArguments) => Fail::Invalid {
                details: "server rejected request arguments",
            },
            Some(Status::NotStored) => Fail::NotStored {},
            Some(Status::DeltaBadValue) => Fail::DeltaBadValue {},
            Some(Status::NotMyVbucket) => Fail::NoMatchingServer {},
            Some(Status::AuthError) | Some(Status::AuthContinue) => Fail::Auth {},
            Some(Status::UnknownCommand) | Some(Status::NotSupported) => Fail::NotSupported {},
            Some(Status::OutOfMemory) | Some(Status::Busy) | Some(Status::TemporaryFailure) => {
                Fail::TemporaryFailure {}
            }
            Some(Status::InternalError) | None => Fail::Server { status: raw },
        }
    }
}

impl ObserveStatus {
    pub fn exists(self) -> bool {
        matches!(self, ObserveStatus::Found | ObserveStatus::Persisted)
    }

    pub fn persisted(self) -> bool {
        self == ObserveStatus::Persisted
    }
}
