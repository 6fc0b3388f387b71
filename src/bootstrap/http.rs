// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! HTTP-streaming transport: `GET /pools/default/bs/{bucket}` on the
//! management port yields a feed of configuration documents separated by
//! four newlines. The first document completes the bootstrap attempt; the
//! socket then lingers for server-pushed updates until it has been idle for
//! `HTCONFIG_IDLE_TIMEOUT`.

use crate::{
    client::WeakClient,
    fail::Fail,
    http::{encode_request, BodyDecoder, HeadParser, HttpRequest},
    options::SeedNode,
    runtime::{Runtime, StreamHandle},
    topology,
};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::time::Duration;

//==============================================================================
// Constants & Structures
//==============================================================================

const DOC_SEPARATOR: &[u8] = b"\n\n\n\n";

/// Splits the decoded feed into configuration documents.
struct DocSplitter {
    buf: BytesMut,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl DocSplitter {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next(&mut self) -> Option<Bytes> {
        let at = self
            .buf
            .windows(DOC_SEPARATOR.len())
            .position(|w| w == DOC_SEPARATOR)?;
        let doc = self.buf.split_to(at).freeze();
        let _ = self.buf.split_to(DOC_SEPARATOR.len());
        Some(doc)
    }
}

fn install_doc<RT: Runtime>(weak: &WeakClient<RT>, origin: &str, doc: &[u8]) -> Result<(), Fail> {
    if doc.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(Fail::BadConfig {
            details: "empty configuration document",
        });
    }
    let cfg = topology::parse_config(doc, origin)?;
    let client = weak.upgrade().ok_or(Fail::Shutdown {})?;
    client.install_config(&cfg, Some(doc))
}

pub(crate) async fn fetch<RT: Runtime>(
    rt: &RT,
    weak: &WeakClient<RT>,
    host: &SeedNode,
    bucket: &str,
    idle_timeout: Duration,
) -> Result<(), Fail> {
    let stream = rt.connect(&host.host, host.mgmt_port).await?;
    let mut req = HttpRequest::get(&format!("/pools/default/bs/{}", bucket));
    req.headers
        .push(("Accept".to_string(), "application/json".to_string()));
    stream
        .push(encode_request(&req, &host.host, host.mgmt_port))
        .await?;

    let mut parser = HeadParser::new();
    let (head, leftover) = loop {
        let buf = stream.pop().await?;
        if buf.is_empty() {
            stream.close();
            return Err(Fail::RemoteClosed {});
        }
        if let Some(parsed) = parser.feed(&buf)? {
            break parsed;
        }
    };
    match head.status {
        200 => {}
        404 => {
            stream.close();
            return Err(Fail::BucketNotFound {});
        }
        401 => {
            stream.close();
            return Err(Fail::Auth {});
        }
        status => {
            debug!("bootstrap feed refused with status {}", status);
            stream.close();
            return Err(Fail::Network {
                details: "unexpected bootstrap response status",
            });
        }
    }

    let mut body = BodyDecoder::new(head.body_framing());
    let mut splitter = DocSplitter::new();
    let mut scratch = BytesMut::new();
    body.feed(&leftover, &mut scratch)?;
    splitter.feed(&scratch);
    loop {
        while let Some(doc) = splitter.next() {
            match install_doc(weak, &host.host, &doc) {
                Ok(()) => {
                    debug!("bootstrapped over HTTP from {}", host.host);
                    // Keep the socket for pushed updates.
                    let follower = follow(
                        rt.clone(),
                        stream.clone(),
                        weak.clone(),
                        host.host.clone(),
                        splitter,
                        body,
                        idle_timeout,
                    );
                    let handle = rt.spawn(follower);
                    if let Some(client) = weak.upgrade() {
                        client.adopt_task(handle);
                    }
                    return Ok(());
                }
                Err(e @ Fail::BucketNotFound {}) | Err(e @ Fail::Shutdown {}) => {
                    stream.close();
                    return Err(e);
                }
                Err(e) => {
                    debug!("skipping feed document: {}", e);
                }
            }
        }
        let buf = stream.pop().await?;
        if buf.is_empty() {
            stream.close();
            return Err(Fail::RemoteClosed {});
        }
        scratch.clear();
        body.feed(&buf, &mut scratch)?;
        splitter.feed(&scratch);
    }
}

/// Tails the feed for pushed configurations until it goes idle.
async fn follow<RT: Runtime>(
    rt: RT,
    stream: RT::Stream,
    weak: WeakClient<RT>,
    origin: String,
    mut splitter: DocSplitter,
    mut body: BodyDecoder,
    idle_timeout: Duration,
) {
    loop {
        let pop = stream.pop().fuse();
        let idle = rt.wait(idle_timeout).fuse();
        futures::pin_mut!(pop, idle);
        let buf = futures::select_biased! {
            buf = pop => buf,
            _ = idle => {
                trace!("configuration stream idle; closing");
                break;
            }
        };
        let buf = match buf {
            Ok(buf) if !buf.is_empty() => buf,
            _ => break,
        };
        let mut scratch = BytesMut::new();
        if body.feed(&buf, &mut scratch).is_err() {
            break;
        }
        splitter.feed(&scratch);
        while let Some(doc) = splitter.next() {
            if weak.upgrade().is_none() {
                stream.close();
                return;
            }
            if let Err(e) = install_doc(&weak, &origin, &doc) {
                debug!("ignoring pushed configuration: {}", e);
            }
        }
    }
    stream.close();
}

//==============================================================================
// Unit Tests
//==============================================================================
