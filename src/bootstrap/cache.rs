// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The config cache file: the last-installed configuration document,
//! a newline, the bucket name, a newline. On the next start a parseable
//! cache seeds the topology and suppresses the network bootstrap.

use std::{fs, path::Path};

pub(crate) fn load(path: &Path, bucket: &str) -> Option<Vec<u8>> {
    let data = fs::read(path).ok()?;
    let data = match data.split_last() {
        Some((b'\n', rest)) => rest,
        _ => {
            warn!("config cache {} is truncated", path.display());
            return None;
        }
    };
    let split = data.iter().rposition(|&b| b == b'\n')?;
    let (doc, name) = (&data[..split], &data[split + 1..]);
    if name != bucket.as_bytes() {
        warn!(
            "config cache {} belongs to another bucket; ignoring",
            path.display()
        );
        return None;
    }
    Some(doc.to_vec())
}

pub(crate) fn store(path: &Path, bucket: &str, raw: &[u8]) {
    let mut data = Vec::with_capacity(raw.len() + bucket.len() + 2);
    data.extend_from_slice(raw);
    data.push(b'\n');
    data.extend_from_slice(bucket.as_bytes());
    data.push(b'\n');
    if let Err(e) = fs::write(path, data) {
        warn!("could not write config cache {}: {}", path.display(), e);
    }
}
