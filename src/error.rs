use thiserror::Error;

/// Closed error taxonomy for the proxy core (spec §7). Only the HTTP layer translates
/// these into status codes; every other component treats them as local, recoverable
/// events (retry, degrade, or log-and-continue).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("channel {0} could not be resolved")]
    ChannelNotFound(String),

    #[error("timed out waiting for channel {0} to become ready")]
    InitTimeout(String),

    #[error("failed to connect to upstream for channel {0}: {1}")]
    UpstreamConnect(String, String),

    #[error("upstream for channel {0} stalled")]
    UpstreamStall(String),

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ownership of channel {0} was lost")]
    OwnershipLost(String),

    #[error("client write failed: {0}")]
    ClientWrite(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
