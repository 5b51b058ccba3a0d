///! Error types for the cluster backend.
///!
///! Every failure here is recoverable; none of them should take the process down.

use std::time::Duration;
use thiserror::Error;

/// Why a line could not be turned into a spot.
///
/// Expected and frequent on a live feed (banners, prompts, announcements).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("line does not look like a spot")]
    NoMatch,

    #[error("invalid frequency: {0:?}")]
    InvalidFrequency(String),

    #[error("missing callsign")]
    MissingCallsign,
}

/// Failure talking to the callsign lookup service
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("lookup request failed: {0}")]
    Transport(String),

    #[error("lookup returned HTTP {0}")]
    Status(u16),

    #[error("malformed lookup response: {0}")]
    Decode(String),

    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for EnrichmentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            EnrichmentError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            EnrichmentError::Status(status.as_u16())
        } else {
            EnrichmentError::Transport(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("not connected to the cluster")]
    NotConnected,

    #[error("command is empty")]
    EmptyCommand,

    #[error("command contains control characters")]
    InvalidCommand,

    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("no data from cluster for {0:?}")]
    ReadTimeout(Duration),

    #[error("write to cluster timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("cluster closed the connection")]
    Closed,

    #[error("cluster I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of [`crate::service::DxClusterService`]
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid spot: {0}")]
    InvalidSpot(#[from] ParseError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
