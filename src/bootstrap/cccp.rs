// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! CCCP transport: pull one configuration document over a fresh data-port
//! connection, then close it. Servers that do not speak the opcode (old
//! releases, memcached buckets) answer with an unknown-command class
//! status, which the walk treats as "try the next transport".

use crate::{
    client::WeakClient,
    connection,
    fail::Fail,
    memcached::{encode_request, FrameDecoder, Opcode, Status, MAGIC_RESPONSE},
    options::SeedNode,
    runtime::{Runtime, StreamHandle},
    topology,
};

pub(crate) async fn fetch<RT: Runtime>(
    rt: &RT,
    weak: &WeakClient<RT>,
    host: &SeedNode,
    credentials: &Option<(String, String)>,
) -> Result<(), Fail> {
    let stream = rt.connect(&host.host, host.data_port).await?;
    let result = fetch_over::<RT>(&stream, weak, &host.host, credentials).await;
    stream.close();
    result
}

async fn fetch_over<RT: Runtime>(
    stream: &RT::Stream,
    weak: &WeakClient<RT>,
    origin: &str,
    credentials: &Option<(String, String)>,
) -> Result<(), Fail> {
    if let Some((username, password)) = credentials {
        connection::authenticate(stream, username, password).await?;
    }
    let request = encode_request(Opcode::GetClusterConfig, 0, 0, 0, &[], &[], &[])?;
    stream.push(request).await?;
    let mut decoder = FrameDecoder::new(MAGIC_RESPONSE);
    let response = loop {
        let buf = stream.pop().await?;
        if buf.is_empty() {
            return Err(Fail::RemoteClosed {});
        }
        decoder.feed(&buf);
        if let Some(frame) = decoder.next()? {
            break frame;
        }
    };
    let status = response.status();
    if status == Status::Success as u16 {
        let raw = response.value;
        let cfg = topology::parse_config(&raw, origin)?;
        let client = weak.upgrade().ok_or(Fail::Shutdown {})?;
        client.install_config(&cfg, Some(&raw))?;
        debug!("bootstrapped over CCCP from {}", origin);
        Ok(())
    } else if status == Status::UnknownCommand as u16 || status == Status::NotSupported as u16 {
        Err(Fail::NotSupported {})
    } else {
        Err(Status::to_fail(status))
    }
}
