// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end smoke test over real sockets: the POSIX runtime against an
//! in-process fake server on a loopback listener.

use crossbeam_channel::{unbounded, Sender};
use futon::memcached::{
    encode_response, FrameDecoder, Opcode, Status, MAGIC_REQUEST,
};
use futon::{
    Client, ClientOptions, PosixRuntime, SeedNode, StoreCommand, StoreKind,
};
use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
};

type SharedStore = Arc<Mutex<HashMap<Vec<u8>, (Vec<u8>, u32, u64)>>>;

fn single_node_config(port: u16) -> String {
    format!(
        r#"{{
            "name": "default",
            "rev": 1,
            "nodeLocator": "vbucket",
            "nodes": [{{"hostname": "127.0.0.1:{mgmt}", "ports": {{"direct": {port}}}}}],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["127.0.0.1:{port}"],
                "vBucketMap": [[0], [0], [0], [0], [0], [0], [0], [0]]
            }}
        }}"#,
        port = port,
        mgmt = port
    )
}

fn serve_connection(mut stream: TcpStream, store: SharedStore, config: String, log: Sender<u8>) {
    let _ = stream.set_nodelay(true);
    let mut decoder = FrameDecoder::new(MAGIC_REQUEST);
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.feed(&buf[..n]);
        while let Ok(Some(request)) = decoder.next() {
            let _ = log.send(request.opcode);
            let opaque = request.opaque;
            let response = if request.opcode == Opcode::GetClusterConfig as u8 {
                encode_response(
                    request.opcode,
                    Status::Success as u16,
                    opaque,
                    0,
                    &[],
                    &[],
                    config.as_bytes(),
                )
            } else if request.opcode == Opcode::Set as u8 {
                let mut kv = store.lock().unwrap();
                let cas = kv.len() as u64 + 1;
                let flags = if request.extras.len() >= 4 {
                    u32::from_be_bytes([
                        request.extras[0],
                        request.extras[1],
                        request.extras[2],
                        request.extras[3],
                    ])
                } else {
                    0
                };
                kv.insert(request.key.to_vec(), (request.value.to_vec(), flags, cas));
                encode_response(
                    request.opcode,
                    Status::Success as u16,
                    opaque,
                    cas,
                    &[],
                    &[],
                    &[],
                )
            } else if request.opcode == Opcode::Get as u8 {
                let kv = store.lock().unwrap();
                match kv.get(&request.key[..]) {
                    Some((value, flags, cas)) => encode_response(
                        request.opcode,
                        Status::Success as u16,
                        opaque,
                        *cas,
                        &flags.to_be_bytes(),
                        &[],
                        value,
                    ),
                    None => encode_response(
                        request.opcode,
                        Status::KeyNotFound as u16,
                        opaque,
                        0,
                        &[],
                        &[],
                        &[],
                    ),
                }
            } else {
                encode_response(
                    request.opcode,
                    Status::UnknownCommand as u16,
                    opaque,
                    0,
                    &[],
                    &[],
                    &[],
                )
            };
            if let Ok(response) = response {
                if stream.write_all(&response).is_err() {
                    return;
                }
            }
        }
    }
}

#[test]
fn set_then_get_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = single_node_config(port);
    let store: SharedStore = Arc::new(Mutex::new(HashMap::new()));
    let (log_tx, log_rx) = unbounded();

    {
        let (store, config) = (store.clone(), config);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let (store, config, log) = (store.clone(), config.clone(), log_tx.clone());
                thread::spawn(move || serve_connection(stream, store, config, log));
            }
        });
    }

    let rt = PosixRuntime::new();
    let options = ClientOptions::new(
        "default",
        vec![SeedNode::with_ports("127.0.0.1", port, port)],
    );
    let client = Client::new(rt, options).unwrap();
    client.wait(client.connect()).unwrap();

    let store_future = client
        .store(&StoreCommand {
            kind: StoreKind::Set,
            key: b"Hello",
            value: b"World!",
            flags: 0xf00d,
            expiry: 0,
            cas: 0,
        })
        .unwrap();
    let stored = client.wait(store_future).unwrap();
    assert_ne!(stored.cas, 0);

    let get_future = client.get(b"Hello").unwrap();
    let fetched = client.wait(get_future).unwrap();
    assert_eq!(&fetched.value[..], b"World!");
    assert_eq!(fetched.flags, 0xf00d);
    assert_ne!(fetched.cas, 0);

    client.shutdown();

    // The server saw the bootstrap fetch and both data operations.
    let seen: Vec<u8> = log_rx.try_iter().collect();
    assert!(seen.contains(&(Opcode::GetClusterConfig as u8)));
    assert!(seen.contains(&(Opcode::Set as u8)));
    assert!(seen.contains(&(Opcode::Get as u8)));
}
