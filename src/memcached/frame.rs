// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::fail::Fail;
use crate::memcached::Opcode;
use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Bytes, BytesMut};

//==============================================================================
// Constants & Structures
//==============================================================================

pub const HEADER_LEN: usize = 24;
pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

/// One complete frame, request or response. The sixteen-bit slot at offset 6
/// holds the vbucket id on requests and the status code on responses.
#[derive(Clone, Debug)]
pub struct Frame {
    pub magic: u8,
    pub opcode: u8,
    pub data_type: u8,
    vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

/// Resumable frame decoder. Bytes are fed in as they arrive; `next` yields a
/// frame once the header and body are complete, and leaves a partial frame
/// buffered for the next feed.
pub struct FrameDecoder {
    expect_magic: u8,
    buf: BytesMut,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Frame {
    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }
}

fn encode(
    magic: u8,
    opcode: u8,
    vbucket_or_status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Result<Bytes, Fail> {
    if key.len() > u16::max_value() as usize {
        return Err(Fail::Invalid {
            details: "key longer than 65535 bytes",
        });
    }
    if extras.len() > u8::max_value() as usize {
        return Err(Fail::Invalid {
            details: "extras longer than 255 bytes",
        });
    }
    let body_len = extras.len() + key.len() + value.len();
    if body_len > u32::max_value() as usize {
        return Err(Fail::Invalid {
            details: "frame body longer than 4GiB",
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    buf.resize(HEADER_LEN, 0);
    buf[0] = magic;
    buf[1] = opcode;
    NetworkEndian::write_u16(&mut buf[2..4], key.len() as u16);
    buf[4] = extras.len() as u8;
    buf[5] = 0; // raw data type
    NetworkEndian::write_u16(&mut buf[6..8], vbucket_or_status);
    NetworkEndian::write_u32(&mut buf[8..12], body_len as u32);
    NetworkEndian::write_u32(&mut buf[12..16], opaque);
    NetworkEndian::write_u64(&mut buf[16..24], cas);
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(buf.freeze())
}

/// Serializes a request frame into a single contiguous buffer.
pub fn encode_request(
    opcode: Opcode,
    vbucket: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Result<Bytes, Fail> {
    encode(
        MAGIC_REQUEST,
        opcode as u8,
        vbucket,
        opaque,
        cas,
        extras,
        key,
        value,
    )
}

/// Serializes a response frame. The engine itself never sends responses;
/// this is the mirror half of the codec, exercised by servers and tests.
pub fn encode_response(
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Result<Bytes, Fail> {
    encode(MAGIC_RESPONSE, opcode, status, opaque, cas, extras, key, value)
}

impl FrameDecoder {
    pub fn new(expect_magic: u8) -> Self {
        Self {
            expect_magic,
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes the next complete frame, or `Ok(None)` if more bytes are
    /// needed. Framing violations are unrecoverable.
    pub fn next(&mut self) -> Result<Option<Frame>, Fail> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = &self.buf[..HEADER_LEN];
        if header[0] != self.expect_magic {
            return Err(Fail::Protocol {
                details: "bad frame magic",
            });
        }
        let key_len = NetworkEndian::read_u16(&header[2..4]) as usize;
        let extras_len = header[4] as usize;
        let body_len = NetworkEndian::read_u32(&header[8..12]) as usize;
        if extras_len + key_len > body_len {
            return Err(Fail::Protocol {
                details: "frame body shorter than its extras and key",
            });
        }
        if self.buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }
        let frame = self.buf.split_to(HEADER_LEN + body_len).freeze();
        let extras_end = HEADER_LEN + extras_len;
        let key_end = extras_end + key_len;
        Ok(Some(Frame {
            magic: frame[0],
            opcode: frame[1],
            data_type: frame[5],
            vbucket_or_status: NetworkEndian::read_u16(&frame[6..8]),
            opaque: NetworkEndian::read_u32(&frame[12..16]),
            cas: NetworkEndian::read_u64(&frame[16..24]),
            extras: frame.slice(HEADER_LEN..extras_end),
            key: frame.slice(extras_end..key_end),
            value: frame.slice(key_end..HEADER_LEN + body_len),
        }))
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
