use std::fmt;
use std::net::SocketAddr;

/// 单个事务可能遇到的错误 / Per-transaction failures.
///
/// None of these are fatal to the process: the transaction that hit one is
/// torn down and every other transaction keeps running.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Packet failed a shape check (too short, not a query, ...).
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// A box failed to authenticate.
    #[error("cryptographic box failed to authenticate")]
    CryptoFailure,

    /// A buffer is too small to hold what we were asked to build.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The upstream never answered within the configured number of tries.
    #[error("upstream did not answer after {tries} tries")]
    UpstreamTimeout { tries: u8 },

    /// A UDP reply arrived from somewhere other than the configured upstream.
    #[error("reply came from {got}, expected {expected}")]
    UpstreamMismatch {
        expected: SocketAddr,
        got: SocketAddr,
    },

    /// The reply carries a transaction id we never sent.
    #[error("reply txid {got:#06x} does not match {expected:#06x}")]
    TxidMismatch { expected: u16, got: u16 },

    /// TCP peer announced a message we cannot accept.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A TCP leg went quiet for longer than its timeout.
    #[error("{0} leg timed out")]
    Timeout(Leg),

    /// The peer on the given leg closed the connection mid-message.
    #[error("{0} peer closed the connection")]
    Closed(Leg),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 事务的两侧：客户端（external）与上游（internal）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Towards the client.
    External,
    /// Towards the upstream name server.
    Internal,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::External => f.write_str("external"),
            Leg::Internal => f.write_str("internal"),
        }
    }
}
