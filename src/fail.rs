// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use bitflags::bitflags;
use custom_error::custom_error;

custom_error! {#[derive(Clone, PartialEq, Eq)] pub Fail
    Invalid{details: &'static str}        = "invalid argument: {details}",
    Unsupported{details: &'static str}    = "unsupported: {details}",
    NoConfiguration{}                     = "no cluster configuration installed yet",
    Shutdown{}                            = "client is shutting down",
    Timedout{}                            = "operation timed out",
    Network{details: &'static str}        = "network error: {details}",
    ConnectionRefused{}                   = "connection refused",
    RemoteClosed{}                        = "connection closed by remote",
    Canceled{}                            = "request canceled",
    Protocol{details: &'static str}       = "protocol error: {details}",
    BadConfig{details: &'static str}      = "malformed cluster configuration: {details}",
    Auth{}                                = "authentication failed",
    BucketNotFound{}                      = "bucket does not exist",
    Bootstrap{}                           = "could not bootstrap a cluster configuration",
    NoMatchingServer{}                    = "no server covers the requested vbucket",
    NoReplica{}                           = "replica index is not populated",
    TooManyRedirects{}                    = "redirect limit exceeded",
    KeyNotFound{}                         = "key does not exist",
    KeyExists{}                           = "key exists with a different CAS",
    ValueTooBig{}                         = "value too large",
    NotStored{}                           = "item not stored",
    DeltaBadValue{}                       = "non-numeric value in arithmetic operation",
    TemporaryFailure{}                    = "server is temporarily out of resources",
    NotSupported{}                        = "command not supported by server",
    DurabilityTooMany{}                   = "requirement exceeds the replica count",
    Server{status: u16}                   = "server returned status {status}",
}

bitflags! {
    /// Classification bits callers use to pick a retry policy without
    /// hard-coding individual error codes.
    pub struct ErrorKind: u32 {
        const INPUT     = 1 << 0;
        const NETWORK   = 1 << 1;
        const FATAL     = 1 << 2;
        const TRANSIENT = 1 << 3;
        const DATAOP    = 1 << 4;
        const INTERNAL  = 1 << 5;
        const PLUGIN    = 1 << 6;
        const SRVGEN    = 1 << 7;
    }
}

impl Fail {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Fail::Invalid { .. } => ErrorKind::INPUT,
            Fail::Unsupported { .. } => ErrorKind::INPUT,
            Fail::NoConfiguration {} => ErrorKind::INPUT | ErrorKind::TRANSIENT,
            Fail::Shutdown {} => ErrorKind::INTERNAL | ErrorKind::FATAL,
            Fail::Timedout {} => ErrorKind::NETWORK | ErrorKind::TRANSIENT,
            Fail::Network { .. } => ErrorKind::NETWORK | ErrorKind::TRANSIENT,
            Fail::ConnectionRefused {} => ErrorKind::NETWORK | ErrorKind::TRANSIENT,
            Fail::RemoteClosed {} => ErrorKind::NETWORK | ErrorKind::TRANSIENT,
            Fail::Canceled {} => ErrorKind::INTERNAL,
            Fail::Protocol { .. } => ErrorKind::FATAL,
            Fail::BadConfig { .. } => ErrorKind::FATAL,
            Fail::Auth {} => ErrorKind::FATAL,
            Fail::BucketNotFound {} => ErrorKind::FATAL,
            Fail::Bootstrap {} => ErrorKind::NETWORK | ErrorKind::FATAL,
            Fail::NoMatchingServer {} => ErrorKind::TRANSIENT | ErrorKind::INTERNAL,
            Fail::NoReplica {} => ErrorKind::INPUT,
            Fail::TooManyRedirects {} => ErrorKind::NETWORK | ErrorKind::FATAL,
            Fail::KeyNotFound {} => ErrorKind::DATAOP | ErrorKind::SRVGEN,
            Fail::KeyExists {} => ErrorKind::DATAOP | ErrorKind::SRVGEN,
            Fail::ValueTooBig {} => ErrorKind::DATAOP | ErrorKind::SRVGEN,
            Fail::NotStored {} => ErrorKind::DATAOP | ErrorKind::SRVGEN,
            Fail::DeltaBadValue {} => ErrorKind::DATAOP | ErrorKind::SRVGEN,
            Fail::TemporaryFailure {} => {
                ErrorKind::DATAOP | ErrorKind::TRANSIENT | ErrorKind::SRVGEN
            }
            Fail::NotSupported {} => ErrorKind::SRVGEN,
            Fail::DurabilityTooMany {} => ErrorKind::INPUT,
            Fail::Server { .. } => ErrorKind::SRVGEN,
        }
    }

    /// Network-class errors feed the handle's configuration error counter.
    pub fn is_network(&self) -> bool {
        self.kind().contains(ErrorKind::NETWORK)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().contains(ErrorKind::FATAL)
    }
}
