// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The memcached binary protocol: a 24-byte header followed by extras, key,
//! and value. Requests carry the vbucket id in the slot where responses
//! carry the status code.

mod frame;
mod opcode;

pub use frame::{
    encode_request, encode_response, Frame, FrameDecoder, HEADER_LEN, MAGIC_REQUEST,
    MAGIC_RESPONSE,
};
pub use opcode::{ObserveStatus, Opcode, Status};
