// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use futon::fail::Fail;
use futon::memcached::{
    encode_request, encode_response, FrameDecoder, Opcode, MAGIC_REQUEST, MAGIC_RESPONSE,
};

//==============================================================================
// Header Layout
//==============================================================================

/// Pins the exact 24-byte header layout: magic, opcode, key length, extras
/// length, data type, vbucket, total body length, opaque, CAS, all
/// big-endian.
#[test]
fn request_header_layout() {
    let frame = encode_request(
        Opcode::Set,
        0x0201,
        0xa1b2c3d4,
        0x1122334455667788,
        &[0xde, 0xad],
        b"key",
        b"value",
    )
    .unwrap();
    assert_eq!(frame.len(), 24 + 2 + 3 + 5);
    assert_eq!(frame[0], 0x80); // request magic
    assert_eq!(frame[1], 0x01); // SET
    assert_eq!(&frame[2..4], &[0x00, 0x03]); // key length
    assert_eq!(frame[4], 0x02); // extras length
    assert_eq!(frame[5], 0x00); // data type
    assert_eq!(&frame[6..8], &[0x02, 0x01]); // vbucket
    assert_eq!(&frame[8..12], &[0x00, 0x00, 0x00, 0x0a]); // total body
    assert_eq!(&frame[12..16], &[0xa1, 0xb2, 0xc3, 0xd4]); // opaque
    assert_eq!(
        &frame[16..24],
        &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
    );
    assert_eq!(&frame[24..26], &[0xde, 0xad]);
    assert_eq!(&frame[26..29], b"key");
    assert_eq!(&frame[29..34], b"value");
}

//==============================================================================
// Round Trips
//==============================================================================

#[test]
fn encode_then_decode_preserves_every_field() {
    let wire = encode_request(
        Opcode::Observe,
        513,
        42,
        7,
        &[1, 2, 3],
        b"some-key",
        b"some-value",
    )
    .unwrap();
    let mut decoder = FrameDecoder::new(MAGIC_REQUEST);
    decoder.feed(&wire);
    let frame = decoder.next().unwrap().unwrap();
    assert_eq!(frame.opcode, Opcode::Observe as u8);
    assert_eq!(frame.vbucket(), 513);
    assert_eq!(frame.opaque, 42);
    assert_eq!(frame.cas, 7);
    assert_eq!(&frame.extras[..], &[1, 2, 3]);
    assert_eq!(&frame.key[..], b"some-key");
    assert_eq!(&frame.value[..], b"some-value");
}

#[test]
fn decoder_survives_arbitrary_fragmentation() {
    let mut wire = Vec::new();
    for opaque in 0..4u32 {
        wire.extend_from_slice(
            &encode_response(Opcode::Get as u8, 0, opaque, 1, &[0, 0, 0, 0], &[], b"v").unwrap(),
        );
    }
    // Feed in ragged chunks that straddle every frame boundary.
    for chunk_size in &[1usize, 3, 7, 11, 23] {
        let mut decoder = FrameDecoder::new(MAGIC_RESPONSE);
        let mut seen = Vec::new();
        for chunk in wire.chunks(*chunk_size) {
            decoder.feed(chunk);
            while let Some(frame) = decoder.next().unwrap() {
                seen.push(frame.opaque);
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3], "chunk size {}", chunk_size);
    }
}

#[test]
fn response_magic_on_a_request_decoder_is_fatal() {
    let wire = encode_response(Opcode::Get as u8, 0, 1, 0, &[], &[], &[]).unwrap();
    let mut decoder = FrameDecoder::new(MAGIC_REQUEST);
    decoder.feed(&wire);
    match decoder.next() {
        Err(Fail::Protocol { .. }) => {}
        other => panic!("expected protocol error, got {:?}", other),
    }
}
