// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Serde model of the cluster configuration document published by the
//! server, either over the HTTP streaming feed or inline in a CCCP
//! response. Field names mirror the wire document.

use crate::fail::Fail;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(default)]
    pub rev: Option<u64>,
    #[serde(rename = "nodeLocator", default)]
    pub node_locator: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(rename = "vBucketServerMap", default)]
    pub vbucket_server_map: Option<VBucketServerMap>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// `host:mgmt_port`; single-node servers publish the literal `$HOST`.
    pub hostname: String,
    #[serde(rename = "couchApiBase", default)]
    pub couch_api_base: Option<String>,
    #[serde(default)]
    pub ports: NodePorts,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodePorts {
    #[serde(default)]
    pub direct: Option<u16>,
    #[serde(default)]
    pub proxy: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VBucketServerMap {
    #[serde(rename = "hashAlgorithm", default)]
    pub hash_algorithm: String,
    #[serde(rename = "numReplicas")]
    pub num_replicas: usize,
    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

impl BucketConfig {
    /// Memcached-type buckets carry no vbucket map; keys are placed with
    /// ketama hashing and CCCP is unavailable.
    pub fn is_memcached(&self) -> bool {
        self.vbucket_server_map.is_none()
    }
}

/// Decodes a configuration document, substituting the `$HOST` placeholder
/// with the host the document was fetched from.
pub fn parse_config(raw: &[u8], origin_host: &str) -> Result<BucketConfig, Fail> {
    let text = std::str::from_utf8(raw).map_err(|_| Fail::BadConfig {
        details: "configuration is not valid UTF-8",
    })?;
    let text = text.replace("$HOST", origin_host);
    serde_json::from_str(&text).map_err(|e| {
        debug!("config decode failed: {}", e);
        Fail::BadConfig {
            details: "configuration failed to decode",
        }
    })
}

/// Splits `host:port`, tolerating a bare host.
pub fn split_host_port(s: &str) -> (&str, Option<u16>) {
    match s.rfind(':') {
        Some(idx) => match s[idx + 1..].parse::<u16>() {
            Ok(port) => (&s[..idx], Some(port)),
            Err(_) => (s, None),
        },
        None => (s, None),
    }
}
