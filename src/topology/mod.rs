// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Topology snapshots. A [ClusterMap] is built once from a configuration
//! document and never mutated; adopting a new topology swaps the whole
//! snapshot behind an `Rc`, so a routing computation always sees one
//! consistent map.

pub mod config;

use crate::fail::Fail;
use config::{split_host_port, BucketConfig};
use crc::crc32;

pub use config::parse_config;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Points placed on the ketama continuum per node.
const KETAMA_POINTS_PER_NODE: usize = 160;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub data_port: u16,
    pub mgmt_port: u16,
    pub view_port: Option<u16>,
}

enum Locator {
    VBucket {
        num_replicas: usize,
        /// `matrix[vbucket]` is the ordered (master, replicas…) node index
        /// tuple; -1 marks an unpopulated slot.
        matrix: Vec<Vec<i32>>,
    },
    Ketama {
        continuum: Vec<(u32, usize)>,
    },
}

/// One immutable topology snapshot.
pub struct ClusterMap {
    bucket: String,
    rev: Option<u64>,
    nodes: Vec<NodeAddress>,
    locator: Locator,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl NodeAddress {
    /// Stable identity of a node across topology snapshots.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }
}

fn view_port_of(couch_api_base: &str) -> Option<u16> {
    let rest = couch_api_base.splitn(2, "://").nth(1)?;
    let authority = rest.splitn(2, '/').next()?;
    split_host_port(authority).1
}

fn ketama_continuum(nodes: &[NodeAddress]) -> Vec<(u32, usize)> {
    let mut continuum = Vec::with_capacity(nodes.len() * KETAMA_POINTS_PER_NODE);
    for (index, node) in nodes.iter().enumerate() {
        for point in 0..KETAMA_POINTS_PER_NODE {
            let spot = format!("{}:{}-{}", node.host, node.data_port, point);
            continuum.push((crc32::checksum_ieee(spot.as_bytes()), index));
        }
    }
    continuum.sort();
    continuum
}

impl ClusterMap {
    pub fn from_config(cfg: &BucketConfig) -> Result<Self, Fail> {
        match &cfg.vbucket_server_map {
            Some(map) => {
                if map.vbucket_map.is_empty() || !map.vbucket_map.len().is_power_of_two() {
                    return Err(Fail::BadConfig {
                        details: "vbucket count is not a power of two",
                    });
                }
                let mut nodes = Vec::with_capacity(map.server_list.len());
                for server in &map.server_list {
                    let (host, data_port) = split_host_port(server);
                    let data_port = data_port.ok_or(Fail::BadConfig {
                        details: "server list entry has no data port",
                    })?;
                    // Management and view ports ride on the node list.
                    let mut mgmt_port = 8091;
                    let mut view_port = None;
                    for node in &cfg.nodes {
                        let (node_host, node_mgmt) = split_host_port(&node.hostname);
                        if node_host == host {
                            mgmt_port = node_mgmt.unwrap_or(8091);
                            view_port = node
                                .couch_api_base
                                .as_deref()
                                .and_then(view_port_of);
                            break;
                        }
                    }
                    nodes.push(NodeAddress {
                        host: host.to_string(),
                        data_port,
                        mgmt_port,
                        view_port,
                    });
                }
                for row in &map.vbucket_map {
                    for &entry in row {
                        if entry >= nodes.len() as i32 {
                            return Err(Fail::BadConfig {
                                details: "vbucket map references an unknown server",
                            });
                        }
                    }
                }
                Ok(Self {
                    bucket: cfg.name.clone(),
                    rev: cfg.rev,
                    nodes,
                    locator: Locator::VBucket {
                        num_replicas: map.num_replicas,
                        matrix: map.vbucket_map.clone(),
                    },
                })
            }
            None => {
                let mut nodes = Vec::new();
                for node in &cfg.nodes {
                    let (host, mgmt_port) = split_host_port(&node.hostname);
                    let data_port = match node.ports.direct {
                        Some(port) => port,
                        None => continue,
                    };
                    nodes.push(NodeAddress {
                        host: host.to_string(),
                        data_port,
                        mgmt_port: mgmt_port.unwrap_or(8091),
                        view_port: node.couch_api_base.as_deref().and_then(view_port_of),
                    });
                }
                if nodes.is_empty() {
                    return Err(Fail::BadConfig {
                        details: "node list is empty",
                    });
                }
                let continuum = ketama_continuum(&nodes);
                Ok(Self {
                    bucket: cfg.name.clone(),
                    rev: cfg.rev,
                    nodes,
                    locator: Locator::Ketama { continuum },
                })
            }
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn rev(&self) -> Option<u64> {
        self.rev
    }

    pub fn is_memcached(&self) -> bool {
        matches!(self.locator, Locator::Ketama { .. })
    }

    pub fn num_servers(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_replicas(&self) -> usize {
        match &self.locator {
            Locator::VBucket { num_replicas, .. } => *num_replicas,
            Locator::Ketama { .. } => 0,
        }
    }

    pub fn num_vbuckets(&self) -> usize {
        match &self.locator {
            Locator::VBucket { matrix, .. } => matrix.len(),
            Locator::Ketama { .. } => 0,
        }
    }

    pub fn node(&self, index: usize) -> Option<&NodeAddress> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[NodeAddress] {
        &self.nodes
    }

    /// Hashes a key to its vbucket. Ketama buckets have no vbuckets; every
    /// key reports vbucket 0 there.
    pub fn vbucket_for(&self, key: &[u8]) -> u16 {
        match &self.locator {
            Locator::VBucket { matrix, .. } => {
                let hash = crc32::checksum_ieee(key);
                ((hash >> 16) & (matrix.len() as u32 - 1)) as u16
            }
            Locator::Ketama { .. } => 0,
        }
    }

    /// Master node index for a vbucket.
    pub fn master_of(&self, vbucket: u16) -> Result<usize, Fail> {
        match &self.locator {
            Locator::VBucket { matrix, .. } => {
                let row = matrix
                    .get(vbucket as usize)
                    .ok_or(Fail::NoMatchingServer {})?;
                match row.first() {
                    Some(&index) if index >= 0 => Ok(index as usize),
                    _ => Err(Fail::NoMatchingServer {}),
                }
            }
            Locator::Ketama { .. } => Err(Fail::NoMatchingServer {}),
        }
    }

    /// Routes a key to (vbucket, master node index). Pure in the key and
    /// the snapshot.
    pub fn route_master(&self, key: &[u8]) -> Result<(u16, usize), Fail> {
        match &self.locator {
            Locator::VBucket { .. } => {
                let vbucket = self.vbucket_for(key);
                Ok((vbucket, self.master_of(vbucket)?))
            }
            Locator::Ketama { continuum } => {
                if continuum.is_empty() {
                    return Err(Fail::NoMatchingServer {});
                }
                let hash = crc32::checksum_ieee(key);
                let index = match continuum.binary_search_by(|probe| probe.0.cmp(&hash)) {
                    Ok(i) => i,
                    Err(i) if i == continuum.len() => 0,
                    Err(i) => i,
                };
                Ok((0, continuum[index].1))
            }
        }
    }

    /// Node index holding the `which`-th replica of a vbucket.
    pub fn route_replica(&self, vbucket: u16, which: usize) -> Result<usize, Fail> {
        match &self.locator {
            Locator::VBucket {
                num_replicas,
                matrix,
            } => {
                if which >= *num_replicas {
                    return Err(Fail::NoReplica {});
                }
                let row = matrix.get(vbucket as usize).ok_or(Fail::NoReplica {})?;
                match row.get(1 + which) {
                    Some(&index) if index >= 0 => Ok(index as usize),
                    _ => Err(Fail::NoReplica {}),
                }
            }
            Locator::Ketama { .. } => Err(Fail::NoReplica {}),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
