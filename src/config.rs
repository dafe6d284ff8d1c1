//! Configuration file loading and validation.
//!
//! The YAML config file is parsed into [`RawConfig`] (a direct mirror of the
//! on-disk shape) and then validated into [`Config`], the process-wide,
//! read-only-after-startup structure every other module is built from.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::flow::FlowId;

fn default_time_step() -> u64 {
    5
}
fn default_limit_step() -> i64 {
    2_000_000
}
fn default_interface_max_rate() -> i64 {
    -1
}
fn default_window_size() -> usize {
    10
}
fn default_stat_log_format() -> String {
    "csv".to_string()
}
fn default_http_timeout_secs() -> u64 {
    5
}
fn default_blocking() -> bool {
    false
}

/// One `flows` entry in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct RawFlow {
    pub ipv4_dst: Option<String>,
    pub udp_dst: Option<i64>,
    pub base_ratelimit: Option<i64>,
}

/// Direct mirror of the YAML config file's shape. Every field is optional at
/// this stage; mandatory-field enforcement happens in [`Config::load`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawConfig {
    pub flows: Option<Vec<RawFlow>>,
    pub controller_baseurl: Option<String>,
    pub ovsdb_addr: Option<String>,
    #[serde(default)]
    pub time_step: Option<u64>,
    #[serde(default)]
    pub limit_step: Option<i64>,
    #[serde(default)]
    pub interface_max_rate: Option<i64>,
    #[serde(default)]
    pub flowstat_window_size: Option<usize>,
    #[serde(default)]
    pub stat_log_format: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub blocking_default: Option<bool>,
}

/// How per-flow measurement logs are formatted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatLogFormat {
    Human,
    Csv,
}

/// Validated, defaulted, process-wide configuration. Built once at startup
/// and shared behind an `Arc`; never mutated after construction.
#[derive(Clone, Debug)]
pub struct Config {
    /// Declared flows in config-file order, each with its baseline rate
    /// limit in bits/second. Order determines `queue_id` assignment
    /// (1-indexed; queue 0 is reserved for unmatched traffic).
    pub flows: Vec<(FlowId, i64)>,
    pub controller_baseurl: String,
    pub ovsdb_addr: String,
    pub time_step: u64,
    pub limit_step: i64,
    pub interface_max_rate: i64,
    pub flowstat_window_size: usize,
    pub stat_log_format: StatLogFormat,
    pub http_timeout_secs: u64,
    pub blocking_default: bool,
}

impl Config {
    /// Load and validate the config file at `path`.
    ///
    /// Mandatory fields (`flows`, `controller_baseurl`, `ovsdb_addr`) are
    /// checked together and reported in one [`Error::MissingConfigFields`]
    /// naming every missing key, rather than failing on the first one.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let raw: RawConfig = serde_yaml::from_str(&text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let mut missing = Vec::new();
        if raw.flows.is_none() {
            missing.push("flows");
        }
        if raw.controller_baseurl.is_none() {
            missing.push("controller_baseurl");
        }
        if raw.ovsdb_addr.is_none() {
            missing.push("ovsdb_addr");
        }
        if !missing.is_empty() {
            return Err(Error::MissingConfigFields(missing));
        }

        let mut flows = Vec::new();
        for raw_flow in raw.flows.unwrap() {
            match FlowId::from_record(raw_flow.ipv4_dst.as_deref(), raw_flow.udp_dst) {
                Ok(id) => match raw_flow.base_ratelimit {
                    Some(rate) => flows.push((id, rate)),
                    None => {
                        tracing::error!(flow = %id, "invalid flow record: missing base_ratelimit");
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "invalid flow record, skipping");
                }
            }
        }
        if flows.is_empty() {
            return Err(Error::NoValidFlows);
        }

        let stat_log_format = match raw
            .stat_log_format
            .unwrap_or_else(default_stat_log_format)
            .as_str()
        {
            "human" => StatLogFormat::Human,
            "csv" => StatLogFormat::Csv,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "stat_log_format must be 'human' or 'csv', got '{}'",
                    other
                )))
            }
        };

        Ok(Config {
            flows,
            controller_baseurl: raw.controller_baseurl.unwrap(),
            ovsdb_addr: raw.ovsdb_addr.unwrap(),
            time_step: raw.time_step.unwrap_or_else(default_time_step),
            limit_step: raw.limit_step.unwrap_or_else(default_limit_step),
            interface_max_rate: raw
                .interface_max_rate
                .unwrap_or_else(default_interface_max_rate),
            flowstat_window_size: raw
                .flowstat_window_size
                .unwrap_or_else(default_window_size),
            stat_log_format,
            http_timeout_secs: raw.http_timeout_secs.unwrap_or_else(default_http_timeout_secs),
            blocking_default: raw.blocking_default.unwrap_or_else(default_blocking),
        })
    }

    /// Initial per-flow limits, keyed by `FlowId`, in declaration order.
    pub fn initial_limits(&self) -> HashMap<FlowId, i64> {
        self.flows.iter().cloned().collect()
    }
}
