// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The bootstrap provider: acquires the initial topology and every refresh
//! after it. Transports are walked in caller order (CCCP, then the HTTP
//! streaming feed by default); within a transport the seed hosts are walked
//! in order. Every per-host attempt is bounded by `CONFIG_NODE_TIMEOUT` and
//! the whole walk by `CONFIGURATION_TIMEOUT`.

pub mod cache;
mod cccp;
mod http;


use crate::{
    client::WeakClient,
    fail::Fail,
    options::ConfigTransport,
    runtime::Runtime,
    topology,
};
use futures::FutureExt;
use std::future::Future;
use std::time::Duration;

/// Initial bootstrap. A terminal failure here fails the connect future;
/// refresh failures later never reach this path.
pub(crate) async fn initial<RT: Runtime>(weak: WeakClient<RT>) {
    match walk(&weak, true).await {
        Ok(()) => {}
        Err(e) => {
            warn!("bootstrap failed: {}", e);
            if let Some(client) = weak.upgrade() {
                client.set_bootstrap_error(e);
            }
        }
    }
}

/// Topology refresh. Prefers a CCCP fetch inline over an established data
/// connection before opening anything new.
pub(crate) async fn refresh<RT: Runtime>(weak: &WeakClient<RT>) -> Result<(), Fail> {
    let inline = {
        let client = weak.upgrade().ok_or(Fail::Shutdown {})?;
        client.inline_refresh_index().and_then(|index| {
            let host = client
                .topology()
                .and_then(|map| map.node(index).map(|n| n.host.clone()))?;
            client.fetch_config_inline(index).ok().map(|fut| (fut, host))
        })
    };
    if let Some((fetch, host)) = inline {
        match fetch.await {
            Ok(raw) => {
                let client = weak.upgrade().ok_or(Fail::Shutdown {})?;
                let cfg = topology::parse_config(&raw, &host)?;
                client.install_config(&cfg, Some(&raw))?;
                return Ok(());
            }
            Err(e) => {
                debug!("inline config fetch failed ({}); walking transports", e);
            }
        }
    }
    walk(weak, false).await
}

async fn walk<RT: Runtime>(weak: &WeakClient<RT>, initial: bool) -> Result<(), Fail> {
    let rt = weak.rt().clone();
    let (options, credentials, cccp_disabled) = {
        let client = weak.upgrade().ok_or(Fail::Shutdown {})?;
        let options = client.options();
        let credentials = options.credentials();
        (options, credentials, client.cccp_disabled())
    };
    let deadline = rt.now() + options.configuration_timeout;
    for transport in &options.transports {
        if *transport == ConfigTransport::Cccp && cccp_disabled {
            debug!("skipping CCCP: disabled for this bucket");
            continue;
        }
        for host in &options.hosts {
            let now = rt.now();
            if now >= deadline {
                warn!("bootstrap ran out its overall deadline");
                return Err(terminal(initial));
            }
            let budget = options.config_node_timeout.min(deadline - now);
            let result = match transport {
                ConfigTransport::Cccp => {
                    bounded(
                        &rt,
                        budget,
                        cccp::fetch(&rt, weak, host, &credentials),
                    )
                    .await
                }
                ConfigTransport::Http => {
                    bounded(
                        &rt,
                        budget,
                        http::fetch(&rt, weak, host, &options.bucket, options.htconfig_idle_timeout),
                    )
                    .await
                }
            };
            match result {
                Ok(()) => return Ok(()),
                // A missing bucket will not appear on another host.
                Err(Fail::BucketNotFound {}) => return Err(Fail::BucketNotFound {}),
                Err(e) => {
                    debug!(
                        "bootstrap over {:?} via {}:{} failed: {}",
                        transport, host.host, host.data_port, e
                    );
                }
            }
        }
    }
    Err(terminal(initial))
}

fn terminal(initial: bool) -> Fail {
    if initial {
        Fail::Bootstrap {}
    } else {
        Fail::Timedout {}
    }
}

/// Bounds one per-host attempt with its node timeout.
async fn bounded<RT, F>(rt: &RT, budget: Duration, attempt: F) -> Result<(), Fail>
where
    RT: Runtime,
    F: Future<Output = Result<(), Fail>>,
{
    let attempt = attempt.fuse();
    let timeout = rt.wait(budget).fuse();
    futures::pin_mut!(attempt, timeout);
    futures::select_biased! {
        result = attempt => result,
        _ = timeout => Err(Fail::Timedout {}),
    }
}
