//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! variant groups into the four kinds the control plane can encounter:
//! configuration errors, per-flow configuration errors, transport errors
//! talking to the REST controller, and semantic errors in the statistics
//! engine.

use std::fmt;

/// Crate-wide `Result` alias, using [`Error`] as the `Err` type.
pub type Result<T> = std::result::Result<T, Error>;

/// A single flow key, used to report lookups against untracked flows.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey(pub String, pub u16);

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Mandatory configuration fields were missing at startup. Fatal.
    #[error("config: missing mandatory field(s): {0:?}")]
    MissingConfigFields(Vec<&'static str>),

    /// A configuration value had the wrong shape (e.g. `ovsdb_addr` was not
    /// a string). Fatal.
    #[error("config: {0}")]
    InvalidConfig(String),

    /// A single flow record in the config file was malformed. Non-fatal
    /// unless it leaves zero valid flows behind.
    #[error("config: invalid flow record: {0}")]
    InvalidFlowRecord(String),

    /// No valid flow definitions remained after skipping malformed records.
    #[error("config: no valid flow definitions found")]
    NoValidFlows,

    /// A `FlowStat::put` call would have violated the monotonic-counter
    /// invariant.
    #[error("flow stat: value {new} is smaller than last recorded value {last}")]
    NonMonotonicSample {
        /// Previously recorded cumulative byte count.
        last: u64,
        /// Rejected sample.
        new: u64,
    },

    /// A `FlowStat::put` call supplied a negative value (represented here as
    /// a value that failed to parse into the unsigned counter type).
    #[error("flow stat: negative value is not a valid cumulative byte count")]
    NegativeSample,

    /// A flow lookup was attempted for a [`FlowKey`] that has never been
    /// observed by the relevant `FlowStatManager` or limit table.
    #[error("flow not found: {0}")]
    FlowNotFound(FlowKey),

    /// The REST controller returned a failing response (non-2xx status, or
    /// a 2xx status whose body contains the literal `failure` marker).
    #[error("qos: request to {url} failed: {detail}")]
    Transport {
        /// The request URL that failed.
        url: String,
        /// Human-readable detail: status code, embedded failure marker, or
        /// the underlying transport error.
        detail: String,
    },

    /// Propagated from `reqwest` for connection-level failures (refused,
    /// timed out, DNS failure, etc).
    #[error("qos: http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Propagated from `serde_yaml` while parsing the config file.
    #[error("config: yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Propagated from `serde_json` while building or parsing QoS request
    /// bodies.
    #[error("qos: json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Propagated from the filesystem while reading the config file.
    #[error("config: could not read {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
