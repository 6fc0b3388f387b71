// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{env, path::PathBuf, sync::Once, time::Duration};

//==============================================================================
// Constants & Structures
//==============================================================================

/// A node named at client-creation time, before any topology is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedNode {
    pub host: String,
    pub data_port: u16,
    pub mgmt_port: u16,
}

/// Transports the bootstrap provider may use, walked in caller order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigTransport {
    /// Configuration fetched inline over the binary protocol data port.
    Cccp,
    /// Streaming JSON feed from the management port.
    Http,
}

/// Recognised settings, with their defaults. Timeouts are microsecond
/// quantities throughout the engine; they are carried as [Duration]s here.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub bucket: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub hosts: Vec<SeedNode>,
    pub transports: Vec<ConfigTransport>,
    pub op_timeout: Duration,
    pub configuration_timeout: Duration,
    pub config_node_timeout: Duration,
    pub view_timeout: Duration,
    pub durability_timeout: Duration,
    pub durability_interval: Duration,
    pub htconfig_idle_timeout: Duration,
    /// Network-class error count that forces a configuration refresh.
    pub config_error_threshold: u32,
    /// Age after which a single network-class error forces a refresh.
    pub config_delay_threshold: Duration,
    pub max_redirects: u32,
    pub config_cache: Option<PathBuf>,
}

/// Process-wide knobs read from the environment exactly once per handle
/// creation, so nothing in the hot path touches globals.
#[derive(Clone, Debug, Default)]
pub struct ProcessEnv {
    pub log_level: Option<u8>,
    pub io_plugin: Option<String>,
    pub dlopen_debug: bool,
}

static ARM_LOGGING: Once = Once::new();

//==============================================================================
// Associate Functions
//==============================================================================

impl SeedNode {
    /// Creates a seed with the conventional data and management ports.
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            data_port: 11210,
            mgmt_port: 8091,
        }
    }

    pub fn with_ports(host: &str, data_port: u16, mgmt_port: u16) -> Self {
        Self {
            host: host.to_string(),
            data_port,
            mgmt_port,
        }
    }
}

impl ClientOptions {
    pub fn new(bucket: &str, hosts: Vec<SeedNode>) -> Self {
        Self {
            bucket: bucket.to_string(),
            username: None,
            password: None,
            hosts,
            transports: vec![ConfigTransport::Cccp, ConfigTransport::Http],
            op_timeout: Duration::from_micros(2_500_000),
            configuration_timeout: Duration::from_micros(5_000_000),
            config_node_timeout: Duration::from_micros(2_000_000),
            view_timeout: Duration::from_micros(75_000_000),
            durability_timeout: Duration::from_micros(5_000_000),
            durability_interval: Duration::from_micros(100_000),
            htconfig_idle_timeout: Duration::from_micros(4_500_000),
            config_error_threshold: 100,
            config_delay_threshold: Duration::from_micros(10_000),
            max_redirects: 5,
            config_cache: None,
        }
    }

    /// Credentials used for the SASL exchange on data connections.
    pub fn credentials(&self) -> Option<(String, String)> {
        let user = self
            .username
            .clone()
            .unwrap_or_else(|| self.bucket.clone());
        self.password.clone().map(|pass| (user, pass))
    }
}

impl ProcessEnv {
    pub fn from_env() -> Self {
        let log_level = env::var("LCB_LOGLEVEL")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .filter(|v| (1..=5).contains(v));
        let io_plugin = env::var("LIBCOUCHBASE_EVENT_PLUGIN_NAME")
            .ok()
            .filter(|v| !v.is_empty());
        let dlopen_debug = env::var("LIBCOUCHBASE_DLOPEN_DEBUG").is_ok();
        Self {
            log_level,
            io_plugin,
            dlopen_debug,
        }
    }

    /// Arms the console logger at most once per process. Level 1 is quietest.
    pub fn arm_logging(&self) {
        if let Some(level) = self.log_level {
            ARM_LOGGING.call_once(move || {
                let spec = match level {
                    1 => "error",
                    2 => "warn",
                    3 => "info",
                    4 => "debug",
                    _ => "trace",
                };
                // An error means another sink was installed first; keep it.
                let _ = flexi_logger::Logger::with_str(spec).start();
            });
        }
    }
}
