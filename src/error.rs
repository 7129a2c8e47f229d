//! Error taxonomy for the central engine.

use thiserror::Error;

use crate::types::{Handle, PeerAddress};

/// Errors surfaced by the central engine.
///
/// Transport-level timeouts get exactly one automatic retry inside the
/// attribute I/O coordinator before `RequestTimeout` is returned. All
/// other errors surface immediately; whether to re-attempt a connect or
/// discovery is the caller's call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CentralError {
    #[error("a connection to {0} is already being established or active")]
    AlreadyConnecting(PeerAddress),

    #[error("connecting to {0} failed")]
    ConnectFailed(PeerAddress),

    #[error("not connected")]
    NotConnected,

    #[error("discovery did not complete; no attribute table was published")]
    DiscoveryIncomplete,

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Handle),

    #[error("request timed out")]
    RequestTimeout,

    #[error("a scan is already running")]
    AlreadyScanning,

    #[error("radio driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("request on {handle} failed at the driver")]
    RequestFailed { handle: Handle },

    #[error("no device matching {0} was found")]
    DeviceNotFound(String),
}
